//! Trains a small network to separate the quadrants of a noisy unit circle.
//!
//! Usage: `train [config.json] [trajectory.jsonl]`
//!
//! Without a config file the network is `[2, 5, 5, 2]` with tanh hidden
//! layers and a sigmoid output. When a trajectory path is given, every
//! training iteration is appended to it as one JSON line.

use evonet::activator::Activator;
use evonet::persistence::JsonLinesStore;
use evonet::trainer::{Logging, Trainer, TrainingConfig};

use rand::distributions::Uniform;
use rand::Rng;
use rand_distr::Normal;
use std::env;
use std::f64::consts::PI;
use std::process;
use tracing_subscriber::EnvFilter;

type Input = [f64; 2];
type Output = [f64; 2];

fn generate_data(num_samples: usize) -> Result<Vec<(Input, Output)>, rand_distr::NormalError> {
    let mut rng = rand::thread_rng();
    let radians = Uniform::new(0.0, 2.0 * PI);
    let noise = Normal::new(0.0, 0.1)?;

    let mut data = Vec::with_capacity(num_samples);
    for _ in 0..num_samples {
        let theta = rng.sample(radians);
        let dx = rng.sample(noise);
        let dy = rng.sample(noise);
        let point = [theta.cos() + dx, theta.sin() + dy];
        let class = if point[0] * point[1] > 0.0 {
            [1.0, 0.0]
        } else {
            [0.0, 1.0]
        };
        data.push((point, class));
    }
    Ok(data)
}

fn score(set_name: &str, trainer: &Trainer, data: &[(Input, Output)]) -> evonet::Result<()> {
    let mut num_correct = 0;
    for (input, expected) in data {
        let output = trainer.predict(input)?;
        let class = if output[0] > output[1] { 0 } else { 1 };
        if expected[class] == 1.0 {
            num_correct += 1;
        }
    }
    tracing::info!(
        set = set_name,
        correct = num_correct,
        total = data.len(),
        "evaluation finished"
    );
    Ok(())
}

fn default_config() -> TrainingConfig {
    TrainingConfig {
        layers: vec![2, 5, 5, 2],
        activations: vec![Activator::TanH, Activator::TanH, Activator::Sigmoid],
        lambda: 0.05,
        max_iterations: 200,
        logging: Logging::Iterations(10),
        ..TrainingConfig::default()
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let mut config = match args.next() {
        Some(path) => TrainingConfig::from_json_file(path)?,
        None => default_config(),
    };
    let trajectory_path = args.next();
    config.enable_persistence = trajectory_path.is_some();

    let mut trainer = Trainer::from_config(config)?;
    if let Some(path) = trajectory_path {
        trainer = trainer.with_persistence(JsonLinesStore::open(path)?);
    }

    let training_data = generate_data(2_000)?;
    let (inputs, targets): (Vec<Input>, Vec<Output>) = training_data.iter().cloned().unzip();
    let result = trainer.train(&inputs, &targets)?;
    trainer.flush_persistence();

    tracing::info!(
        convergence = ?result.convergence,
        lyapunov_stable = result.lyapunov_stable,
        "run summary"
    );
    score("training", &trainer, &training_data)?;
    score("test", &trainer, &generate_data(500)?)?;
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    if let Err(err) = run() {
        tracing::error!(error = %err, "training failed");
        process::exit(1);
    }
}
