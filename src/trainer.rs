//! Utilities for training networks with stability-damped gradient descent.
//!
//! Every sample is pushed forward, pulled back, and applied immediately
//! (stochastic updates). Each step is scaled by the damping factor of the
//! sample's gradient norm, and training stops on whichever of the Nash
//! criterion (`S_avg < nash_threshold`), the loss plateau criterion, the
//! iteration cap, cancellation, or the time limit fires first.
//!
//! Because each sample reads the weights written by the previous one, the
//! samples of an iteration cannot be processed in parallel without changing
//! the update rule.

use crate::activator::Activator;
use crate::error::{Error, Result};
use crate::feed_forward::{Network, NetworkSnapshot};
use crate::matrix::Mat;
use crate::persistence::{PersistenceAdapter, PersistenceQueue};
use crate::stability::{StabilityMonitor, StabilityReport};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Logging frequency to use during training
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logging {
    /// No logs will be emitted
    Silent,
    /// A summary will be emitted at completion
    Completion,
    /// A summary will be emitted after every `n` training iterations
    Iterations(usize),
}

impl Logging {
    /// Performs logging at the current `iteration` of training.
    fn iteration(&self, iteration: usize, loss: f64, stability: f64) {
        if let Logging::Iterations(freq) = *self {
            if freq > 0 && iteration % freq == 0 {
                tracing::info!(iteration, loss, stability, "training progress");
            }
        }
    }

    /// Performs logging at the end of training.
    fn completion(&self, result: &TrainingResult, start_time: Instant) {
        if let Logging::Silent = *self {
            return;
        }
        tracing::info!(
            iterations = result.iterations,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            final_loss = result.final_loss,
            final_stability = result.final_stability,
            convergence = ?result.convergence,
            lyapunov_stable = result.lyapunov_stable,
            "training completed"
        );
    }
}

/// Where a training run currently is, or how it ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Convergence {
    Running,
    /// The averaged stability scalar dropped below `nash_threshold`.
    ConvergedNash,
    /// The averaged loss changed by less than `convergence_epsilon`.
    ConvergedLoss,
    /// `max_iterations` ran without meeting either criterion.
    Exhausted,
    Cancelled,
    TimedOut,
}

/// Cooperative cancellation handle, checked once per iteration.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clears a previous cancellation so the trainer can run again.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Every training parameter. Missing fields take their defaults when
/// deserialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Layer widths, input and output included.
    pub layers: Vec<usize>,
    /// One activation per weight layer, or a single one for all of them.
    pub activations: Vec<Activator>,
    pub learning_rate: f64,
    /// Weight of the stability scalar in the loss.
    pub lambda: f64,
    pub nash_threshold: f64,
    pub max_iterations: usize,
    pub convergence_epsilon: f64,
    pub q_matrix_scale: f64,
    pub enable_stability_tracking: bool,
    pub enable_persistence: bool,
    /// Seed for weight initialization. `None` draws from the OS.
    pub seed: Option<u64>,
    /// Record weights every `n` iterations; `0` never records them.
    pub snapshot_interval: usize,
    pub time_limit: Option<Duration>,
    pub logging: Logging,
    /// Prefix of every persistence key.
    pub run_id: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            layers: Vec::new(),
            activations: vec![Activator::ReLU],
            learning_rate: 0.1,
            lambda: 0.01,
            nash_threshold: 1e-3,
            max_iterations: 1000,
            convergence_epsilon: 1e-8,
            q_matrix_scale: 0.01,
            enable_stability_tracking: true,
            enable_persistence: false,
            seed: None,
            snapshot_interval: 1,
            time_limit: None,
            logging: Logging::Completion,
            run_id: "run".to_owned(),
        }
    }
}

impl TrainingConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TrainingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Verifies that every parameter is usable, returning an error if
    /// something is wrong.
    pub fn validate(&self) -> Result<()> {
        if self.layers.len() < 2 {
            return Err(Error::InvalidConfig(
                "layers must list at least an input and an output width".into(),
            ));
        }
        if self.layers.contains(&0) {
            return Err(Error::InvalidConfig("layer widths must be non-zero".into()));
        }
        let depth = self.layers.len() - 1;
        if self.activations.len() != 1 && self.activations.len() != depth {
            return Err(Error::InvalidConfig(format!(
                "expected 1 or {} activations, got {}",
                depth,
                self.activations.len()
            )));
        }
        let non_negative = [
            ("learning_rate", self.learning_rate),
            ("lambda", self.lambda),
            ("nash_threshold", self.nash_threshold),
            ("convergence_epsilon", self.convergence_epsilon),
            ("q_matrix_scale", self.q_matrix_scale),
        ];
        for &(name, value) in &non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig("max_iterations must be > 0".into()));
        }
        Ok(())
    }
}

/// One immutable entry of the training trajectory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    /// 1-based iteration index.
    pub iteration: usize,
    /// `prediction_error + regularization`, averaged over the samples.
    pub loss: f64,
    pub prediction_error: f64,
    /// `lambda * stability`.
    pub regularization: f64,
    /// Averaged stability scalar `S`.
    pub stability: f64,
    /// `stability²`.
    pub lyapunov: f64,
    /// Weight matrices after the iteration, per `snapshot_interval`.
    pub weights: Option<Vec<Mat>>,
    pub timestamp_ms: u64,
}

/// Outcome of one call to `train`.
#[derive(Clone, Debug)]
pub struct TrainingResult {
    pub final_loss: f64,
    pub iterations: usize,
    /// True when the Nash criterion ended training.
    pub converged: bool,
    pub final_stability: f64,
    pub trajectories: Vec<TrajectoryRecord>,
    /// Whether `V` decreased (almost) monotonically; false when tracking is
    /// disabled.
    pub lyapunov_stable: bool,
    pub stability_report: Option<StabilityReport>,
    pub convergence: Convergence,
}

/// Averages for one pass over the training set.
#[derive(Copy, Clone, Debug, Default)]
struct IterationSummary {
    loss: f64,
    prediction_error: f64,
    stability: f64,
}

/// A builder for training new models.
#[derive(Clone, Debug)]
pub struct TrainerBuilder {
    config: TrainingConfig,
}

impl TrainerBuilder {
    /// Sets a single activation function for every layer.
    pub fn activator(mut self, activator: Activator) -> Self {
        self.config.activations = vec![activator];
        self
    }

    /// Sets one activation function per layer.
    pub fn activations(mut self, activations: &[Activator]) -> Self {
        self.config.activations = activations.to_vec();
        self
    }

    /// Sets the learning rate to use during gradient descent.
    pub fn learning_rate(mut self, rate: f64) -> Self {
        self.config.learning_rate = rate;
        self
    }

    pub fn lambda(mut self, lambda: f64) -> Self {
        self.config.lambda = lambda;
        self
    }

    pub fn nash_threshold(mut self, threshold: f64) -> Self {
        self.config.nash_threshold = threshold;
        self
    }

    pub fn max_iterations(mut self, iterations: usize) -> Self {
        self.config.max_iterations = iterations;
        self
    }

    pub fn convergence_epsilon(mut self, epsilon: f64) -> Self {
        self.config.convergence_epsilon = epsilon;
        self
    }

    pub fn q_matrix_scale(mut self, scale: f64) -> Self {
        self.config.q_matrix_scale = scale;
        self
    }

    pub fn stability_tracking(mut self, enabled: bool) -> Self {
        self.config.enable_stability_tracking = enabled;
        self
    }

    pub fn persistence(mut self, enabled: bool) -> Self {
        self.config.enable_persistence = enabled;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn snapshot_interval(mut self, interval: usize) -> Self {
        self.config.snapshot_interval = interval;
        self
    }

    /// Sets a wall-clock budget for each call to `train`.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.config.time_limit = Some(limit);
        self
    }

    /// Sets the type of logging to be emitted during training.
    pub fn logging(mut self, logging: Logging) -> Self {
        self.config.logging = logging;
        self
    }

    pub fn run_id<S: Into<String>>(mut self, run_id: S) -> Self {
        self.config.run_id = run_id.into();
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn build(self) -> Result<Trainer> {
        Trainer::from_config(self.config)
    }
}

/// Owns a network and trains it.
#[derive(Debug)]
pub struct Trainer {
    config: TrainingConfig,
    network: Network,
    monitor: StabilityMonitor,
    persistence: Option<PersistenceQueue>,
    cancel: CancelToken,
}

impl Trainer {
    /// Starts a builder for a network with the given layer widths.
    ///
    /// The builder is initialized with some default values. These defaults
    /// are:
    ///
    /// * A ReLU activation function for every layer.
    /// * A learning rate of 0.1 and a stability weight of 0.01.
    /// * A Nash threshold of 1e-3 and a loss epsilon of 1e-8.
    /// * Stops after 1000 training iterations.
    /// * Logs on training completion.
    pub fn builder(layers: &[usize]) -> TrainerBuilder {
        TrainerBuilder {
            config: TrainingConfig {
                layers: layers.to_vec(),
                ..TrainingConfig::default()
            },
        }
    }

    /// Validates `config` and initializes a fresh network from it.
    pub fn from_config(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let network = Network::new(
            &config.layers,
            &config.activations,
            config.q_matrix_scale,
            &mut rng,
        )?;
        Ok(Trainer {
            config,
            network,
            monitor: StabilityMonitor,
            persistence: None,
            cancel: CancelToken::new(),
        })
    }

    /// Attaches a sink for trajectory records. Records are forwarded only
    /// when `enable_persistence` is set.
    pub fn with_persistence<A>(mut self, adapter: A) -> Self
    where
        A: PersistenceAdapter + 'static,
    {
        if self.config.enable_persistence {
            self.persistence = Some(PersistenceQueue::spawn(adapter));
        } else {
            tracing::debug!("persistence disabled, adapter ignored");
        }
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// A handle that stops training at the next iteration boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Blocks until queued trajectory records have reached the adapter.
    pub fn flush_persistence(&self) {
        if let Some(ref queue) = self.persistence {
            queue.flush();
        }
    }

    pub fn predict(&self, input: &[f64]) -> Result<Vec<f64>> {
        self.network.predict(input)
    }

    /// Mean over the samples of the summed squared error. Weights are not
    /// touched.
    pub fn evaluate<I, O>(&self, inputs: &[I], targets: &[O]) -> Result<f64>
    where
        I: AsRef<[f64]>,
        O: AsRef<[f64]>,
    {
        self.validate_data(inputs, targets)?;
        let mut total = 0.0;
        for (input, target) in inputs.iter().zip(targets) {
            let output = self.network.predict(input.as_ref())?;
            total += squared_error(&output, target.as_ref());
        }
        Ok(total / inputs.len() as f64)
    }

    pub fn export_weights(&self) -> NetworkSnapshot {
        self.network.export_weights()
    }

    pub fn import_weights(&mut self, snapshot: &NetworkSnapshot) -> Result<()> {
        self.network.import_weights(snapshot)
    }

    /// Trains the network on `inputs` and their expected `targets`.
    pub fn train<I, O>(&mut self, inputs: &[I], targets: &[O]) -> Result<TrainingResult>
    where
        I: AsRef<[f64]>,
        O: AsRef<[f64]>,
    {
        self.train_with_progress(inputs, targets, |_, _, _| {})
    }

    /// Trains the network, calling `progress(iteration, loss, stability)`
    /// after every iteration.
    pub fn train_with_progress<I, O, F>(
        &mut self,
        inputs: &[I],
        targets: &[O],
        mut progress: F,
    ) -> Result<TrainingResult>
    where
        I: AsRef<[f64]>,
        O: AsRef<[f64]>,
        F: FnMut(usize, f64, f64),
    {
        self.validate_data(inputs, targets)?;

        let start_time = Instant::now();
        let mut trajectories = Vec::new();
        let mut previous_loss = f64::INFINITY;
        let mut iteration = 0;
        let mut summary = IterationSummary::default();
        let mut convergence = Convergence::Running;
        while convergence == Convergence::Running {
            iteration += 1;
            summary = self.run_iteration(iteration, inputs, targets)?;

            let record = self.record(iteration, &summary);
            self.persist(&record);
            trajectories.push(record);

            progress(iteration, summary.loss, summary.stability);
            self.config
                .logging
                .iteration(iteration, summary.loss, summary.stability);

            convergence = self.next_state(iteration, previous_loss, &summary, start_time);
            tracing::debug!(
                iteration,
                loss = summary.loss,
                stability = summary.stability,
                state = ?convergence,
                "iteration finished"
            );
            previous_loss = summary.loss;
        }

        let stability_report = if self.config.enable_stability_tracking {
            Some(self.monitor.check(trajectories.iter().map(|r| r.lyapunov)))
        } else {
            None
        };
        let result = TrainingResult {
            final_loss: summary.loss,
            iterations: iteration,
            converged: convergence == Convergence::ConvergedNash,
            final_stability: summary.stability,
            trajectories,
            lyapunov_stable: stability_report.map_or(false, |report| report.stable),
            stability_report,
            convergence,
        };
        self.config.logging.completion(&result, start_time);
        Ok(result)
    }

    /// One pass over every sample, updating the weights after each one.
    fn run_iteration<I, O>(
        &mut self,
        iteration: usize,
        inputs: &[I],
        targets: &[O],
    ) -> Result<IterationSummary>
    where
        I: AsRef<[f64]>,
        O: AsRef<[f64]>,
    {
        let instability = |sample, quantity| Error::NumericalInstability {
            iteration,
            sample,
            quantity,
        };
        let mut totals = IterationSummary::default();
        for (sample, (input, target)) in inputs.iter().zip(targets).enumerate() {
            let target = target.as_ref();
            let trace = self.network.forward(input.as_ref())?;
            let gradients = self.network.backward(&trace, target)?;
            let output = trace
                .output()
                .ok_or_else(|| Error::State("forward produced no output".into()))?;

            let stability = self.monitor.stability(&gradients);
            if !stability.is_finite() {
                return Err(instability(sample, "stability"));
            }
            let prediction_error = squared_error(output.as_slice(), target);
            let loss = prediction_error + self.config.lambda * stability;
            if !loss.is_finite() {
                return Err(instability(sample, "loss"));
            }

            let rate = self.config.learning_rate * self.monitor.damping(stability);
            let weights = self.network.stepped_weights(rate, &gradients)?;
            if !weights.iter().all(Mat::is_finite) {
                return Err(instability(sample, "weights"));
            }
            self.network.commit_weights(weights);

            totals.loss += loss;
            totals.prediction_error += prediction_error;
            totals.stability += stability;
        }
        let n = inputs.len() as f64;
        Ok(IterationSummary {
            loss: totals.loss / n,
            prediction_error: totals.prediction_error / n,
            stability: totals.stability / n,
        })
    }

    fn next_state(
        &self,
        iteration: usize,
        previous_loss: f64,
        summary: &IterationSummary,
        start_time: Instant,
    ) -> Convergence {
        if summary.stability < self.config.nash_threshold {
            Convergence::ConvergedNash
        } else if (previous_loss - summary.loss).abs() < self.config.convergence_epsilon {
            Convergence::ConvergedLoss
        } else if iteration >= self.config.max_iterations {
            Convergence::Exhausted
        } else if self.cancel.is_cancelled() {
            Convergence::Cancelled
        } else if self
            .config
            .time_limit
            .map_or(false, |limit| start_time.elapsed() > limit)
        {
            Convergence::TimedOut
        } else {
            Convergence::Running
        }
    }

    fn record(&self, iteration: usize, summary: &IterationSummary) -> TrajectoryRecord {
        let interval = self.config.snapshot_interval;
        let weights = if interval > 0 && iteration % interval == 0 {
            Some(self.network.weights())
        } else {
            None
        };
        TrajectoryRecord {
            iteration,
            loss: summary.loss,
            prediction_error: summary.prediction_error,
            regularization: self.config.lambda * summary.stability,
            stability: summary.stability,
            lyapunov: self.monitor.lyapunov(summary.stability),
            weights,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    /// Hands `record` to the persistence worker, if one is attached.
    fn persist(&self, record: &TrajectoryRecord) {
        let queue = match self.persistence {
            Some(ref queue) if self.config.enable_persistence => queue,
            _ => return,
        };
        let payload = match serde_json::to_value(record) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(iteration = record.iteration, error = %err, "could not serialize record");
                return;
            }
        };
        let mut metadata = Map::new();
        metadata.insert("iteration".into(), Value::from(record.iteration as u64));
        metadata.insert("loss".into(), Value::from(record.loss));
        metadata.insert("stability".into(), Value::from(record.stability));
        metadata.insert("lyapunov".into(), Value::from(record.lyapunov));
        let key = format!("{}/iteration-{:06}", self.config.run_id, record.iteration);
        queue.submit(key, payload, metadata);
    }

    /// Verifies that the training data fits the network, returning an error
    /// if something is wrong.
    fn validate_data<I, O>(&self, inputs: &[I], targets: &[O]) -> Result<()>
    where
        I: AsRef<[f64]>,
        O: AsRef<[f64]>,
    {
        if inputs.is_empty() {
            return Err(Error::InvalidData("no training samples".into()));
        }
        if inputs.len() != targets.len() {
            return Err(Error::InvalidData(format!(
                "{} inputs but {} targets",
                inputs.len(),
                targets.len()
            )));
        }
        let (input_len, output_len) = (self.network.input_len(), self.network.output_len());
        for (input, target) in inputs.iter().zip(targets) {
            if input.as_ref().len() != input_len {
                return Err(Error::dimension(
                    "training input",
                    (input_len, 1),
                    (input.as_ref().len(), 1),
                ));
            }
            if target.as_ref().len() != output_len {
                return Err(Error::dimension(
                    "training target",
                    (output_len, 1),
                    (target.as_ref().len(), 1),
                ));
            }
        }
        Ok(())
    }
}

/// Computes the summed squared error between `actual` and `expected`.
fn squared_error(actual: &[f64], expected: &[f64]) -> f64 {
    actual
        .iter()
        .zip(expected)
        .map(|(a, e)| (a - e) * (a - e))
        .sum()
}
