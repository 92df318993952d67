//! A [Feedforward neural network]
//! (https://en.wikipedia.org/wiki/Feedforward_neural_network) whose layers
//! evolve their incoming state before the affine transform.
//!
//! The network itself never stores per-sample data: `forward` hands back a
//! `NetworkTrace` that the caller threads into `backward`. Independent
//! samples can therefore be evaluated concurrently through `&Network`.
//!
//! # Example
//!
//! ```
//! # use evonet::activator::Activator;
//! # use evonet::feed_forward::Network;
//! # use rand::SeedableRng;
//! let mut rng = rand::rngs::StdRng::seed_from_u64(42);
//! let network = Network::new(&[2, 3, 1], &[Activator::TanH, Activator::Sigmoid], 0.01, &mut rng)
//!     .unwrap();
//!
//! let output = network.predict(&[0.5, -0.5]).unwrap();
//! assert_eq!(output.len(), 1);
//! assert!(output[0] > 0.0 && output[0] < 1.0);
//! ```

pub use crate::activator::Activator;
use crate::error::{Error, Result};
use crate::layer::{ForwardTrace, Layer, LayerSnapshot};
use crate::matrix::Mat;

use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A Feedforward neural network
#[derive(Debug, Clone)]
pub struct Network {
    layers: Vec<Layer>,
}

/// Per-layer forward traces for one sample, in layer order.
#[derive(Debug, Clone)]
pub struct NetworkTrace {
    layers: Vec<ForwardTrace>,
}

impl NetworkTrace {
    /// The activated output of the final layer.
    pub fn output(&self) -> Option<&Mat> {
        self.layers.last().map(ForwardTrace::post_activation)
    }

    pub fn layers(&self) -> &[ForwardTrace] {
        &self.layers
    }
}

/// Every parameter of a network, in layer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub layers: Vec<LayerSnapshot>,
}

impl NetworkSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

impl Network {
    /// Creates a new, untrained neural network.
    ///
    /// Arguments:
    ///  * `layer_sizes` - the number of neurons in each layer, input and
    ///                    output included.
    ///  * `activators` - one activation per weight layer, or a single one to
    ///                   use everywhere.
    ///  * `q_scale` - perturbation applied to each identity evolution matrix.
    pub fn new<R>(
        layer_sizes: &[usize],
        activators: &[Activator],
        q_scale: f64,
        rng: &mut R,
    ) -> Result<Self>
    where
        R: Rng + ?Sized,
    {
        if layer_sizes.len() < 2 {
            return Err(Error::InvalidConfig(format!(
                "need at least an input and an output layer, got {} sizes",
                layer_sizes.len()
            )));
        }
        if layer_sizes.contains(&0) {
            return Err(Error::InvalidConfig("layer widths must be non-zero".into()));
        }
        if !(q_scale.is_finite() && q_scale >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "q_scale must be finite and non-negative, got {}",
                q_scale
            )));
        }
        let depth = layer_sizes.len() - 1;
        if activators.len() != 1 && activators.len() != depth {
            return Err(Error::InvalidConfig(format!(
                "expected 1 or {} activations, got {}",
                depth,
                activators.len()
            )));
        }
        let mut layers = Vec::with_capacity(depth);
        for i in 0..depth {
            let activator = if activators.len() == 1 {
                activators[0]
            } else {
                activators[i]
            };
            layers.push(Layer::new(
                activator,
                layer_sizes[i],
                layer_sizes[i + 1],
                q_scale,
                rng,
            ));
        }
        Ok(Network { layers })
    }

    /// Returns the size of the input layer to the network.
    pub fn input_len(&self) -> usize {
        self.layers.first().map_or(0, Layer::input_len)
    }

    /// Returns the size of the output layer from the network.
    pub fn output_len(&self) -> usize {
        self.layers.last().map_or(0, Layer::output_len)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Feeds the provided `input` through the network, returning the traces
    /// needed to run `backward` for the same sample.
    pub fn forward(&self, input: &[f64]) -> Result<NetworkTrace> {
        if input.len() != self.input_len() {
            return Err(Error::dimension(
                "network input",
                (self.input_len(), 1),
                (input.len(), 1),
            ));
        }
        let mut traces = Vec::with_capacity(self.layers.len());
        let mut state = Mat::column(input);
        for layer in &self.layers {
            let trace = layer.forward(&state)?;
            state = trace.post_activation().clone();
            traces.push(trace);
        }
        Ok(NetworkTrace { layers: traces })
    }

    /// Feeds the provided `input` through the network, returning the output
    /// layer.
    pub fn predict(&self, input: &[f64]) -> Result<Vec<f64>> {
        let trace = self.forward(input)?;
        trace
            .layers
            .into_iter()
            .last()
            .map(|last| last.post_activation().clone().into_vec())
            .ok_or_else(|| Error::State("network has no layers".into()))
    }

    /// Feeds the squared-error derivative for `target` back through the
    /// network, returning one weight gradient per layer in layer order.
    pub fn backward(&self, trace: &NetworkTrace, target: &[f64]) -> Result<Vec<Mat>> {
        if trace.layers.len() != self.layers.len() {
            return Err(Error::State(format!(
                "backward needs {} layer traces, got {}",
                self.layers.len(),
                trace.layers.len()
            )));
        }
        if target.len() != self.output_len() {
            return Err(Error::dimension(
                "network target",
                (self.output_len(), 1),
                (target.len(), 1),
            ));
        }
        let output = trace
            .output()
            .ok_or_else(|| Error::State("backward called before forward".into()))?;
        let mut delta = output.subtract(&Mat::column(target))?.scale(2.0);
        let mut gradients = Vec::with_capacity(self.layers.len());
        for (i, (layer, layer_trace)) in
            self.layers.iter().zip(&trace.layers).enumerate().rev()
        {
            let (gradient, upstream) = layer.backward(layer_trace, &delta, i > 0)?;
            gradients.push(gradient);
            if let Some(upstream) = upstream {
                delta = upstream;
            }
        }
        gradients.reverse();
        Ok(gradients)
    }

    /// Computes the weights a gradient step of size `rate` would produce,
    /// without applying them.
    pub fn stepped_weights(&self, rate: f64, gradients: &[Mat]) -> Result<Vec<Mat>> {
        if gradients.len() != self.layers.len() {
            return Err(Error::State(format!(
                "expected {} gradients, got {}",
                self.layers.len(),
                gradients.len()
            )));
        }
        self.layers
            .iter()
            .zip(gradients)
            .map(|(layer, gradient)| layer.stepped_weights(rate, gradient))
            .collect()
    }

    /// Replaces every weight matrix. Shapes must come from `stepped_weights`.
    pub(crate) fn commit_weights(&mut self, weights: Vec<Mat>) {
        for (layer, weights) in self.layers.iter_mut().zip(weights) {
            layer.set_weights(weights);
        }
    }

    /// Copies of the current weight matrices, in layer order.
    pub fn weights(&self) -> Vec<Mat> {
        self.layers.iter().map(|layer| layer.weights().clone()).collect()
    }

    pub fn export_weights(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            layers: self.layers.iter().map(Layer::snapshot).collect(),
        }
    }

    /// Loads every parameter from `snapshot`.
    ///
    /// The whole snapshot is validated first; on error the network is left
    /// untouched.
    pub fn import_weights(&mut self, snapshot: &NetworkSnapshot) -> Result<()> {
        if snapshot.layers.len() != self.layers.len() {
            return Err(Error::Shape(format!(
                "network has {} layers, snapshot has {}",
                self.layers.len(),
                snapshot.layers.len()
            )));
        }
        for (i, (layer, incoming)) in self.layers.iter().zip(&snapshot.layers).enumerate() {
            layer
                .check_snapshot(incoming)
                .map_err(|err| Error::Shape(format!("layer {}: {}", i, err)))?;
        }
        for (layer, incoming) in self.layers.iter_mut().zip(&snapshot.layers) {
            layer.restore(incoming);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(sizes: &[usize], activators: &[Activator], seed: u64) -> Network {
        let mut rng = StdRng::seed_from_u64(seed);
        Network::new(sizes, activators, 0.05, &mut rng).unwrap()
    }

    #[test]
    fn too_few_layers() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Network::new(&[1], &[Activator::ReLU], 0.0, &mut rng).is_err());
    }

    #[test]
    fn empty_layer() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Network::new(&[1, 0, 1], &[Activator::ReLU], 0.0, &mut rng).is_err());
    }

    #[test]
    fn wrong_activation_count() {
        let mut rng = StdRng::seed_from_u64(0);
        let activators = [Activator::ReLU, Activator::TanH, Activator::Linear];
        assert!(Network::new(&[2, 2, 1], &activators, 0.0, &mut rng).is_err());
    }

    #[test]
    fn unusable_q_scale() {
        let mut rng = StdRng::seed_from_u64(0);
        for &q_scale in &[f64::INFINITY, f64::NAN, -0.1] {
            match Network::new(&[2, 2], &[Activator::ReLU], q_scale, &mut rng) {
                Err(Error::InvalidConfig(_)) => {}
                other => panic!("expected config error for {}, got {:?}", q_scale, other),
            }
        }
    }

    #[test]
    fn single_activation_is_repeated() {
        let net = network(&[3, 4, 2], &[Activator::TanH], 1);
        assert!(net.layers().iter().all(|l| l.activator() == Activator::TanH));
        assert_eq!(net.input_len(), 3);
        assert_eq!(net.output_len(), 2);
    }

    #[test]
    fn wrong_input_size() {
        let net = network(&[2, 3, 1], &[Activator::ReLU], 2);
        match net.predict(&[1.0]) {
            Err(Error::Dimension { .. }) => {}
            other => panic!("expected dimension error, got {:?}", other),
        }
    }

    #[test]
    fn wrong_target_size() {
        let net = network(&[2, 3, 1], &[Activator::ReLU], 3);
        let trace = net.forward(&[1.0, 0.0]).unwrap();
        assert!(net.backward(&trace, &[0.0, 1.0]).is_err());
    }

    #[test]
    fn trace_from_another_network_is_a_state_error() {
        let shallow = network(&[2, 1], &[Activator::Linear], 4);
        let deep = network(&[2, 2, 1], &[Activator::Linear], 5);
        let trace = shallow.forward(&[1.0, 1.0]).unwrap();
        match deep.backward(&trace, &[1.0]) {
            Err(Error::State(_)) => {}
            other => panic!("expected state error, got {:?}", other),
        }
    }

    #[test]
    fn forward_trace_chains_layers() {
        let net = network(&[2, 3, 1], &[Activator::TanH, Activator::Sigmoid], 6);
        let trace = net.forward(&[0.3, -0.7]).unwrap();
        assert_eq!(trace.layers().len(), 2);
        assert_eq!(
            trace.layers()[1].input(),
            trace.layers()[0].post_activation()
        );
        assert_eq!(
            trace.output().unwrap().as_slice(),
            &net.predict(&[0.3, -0.7]).unwrap()[..]
        );
    }

    #[test]
    fn gradients_match_layer_shapes() {
        let net = network(&[3, 4, 2], &[Activator::ReLU, Activator::Linear], 7);
        let trace = net.forward(&[0.1, 0.2, 0.3]).unwrap();
        let gradients = net.backward(&trace, &[1.0, -1.0]).unwrap();
        let shapes: Vec<_> = gradients.iter().map(Mat::shape).collect();
        assert_eq!(shapes, vec![(4, 3), (2, 4)]);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let net = network(&[2, 3, 1], &[Activator::TanH, Activator::Sigmoid], 8);
        let input = [0.4, -0.9];
        let target = [1.0];
        let loss = |n: &Network| {
            let out = n.predict(&input).unwrap();
            (out[0] - target[0]).powi(2)
        };
        let trace = net.forward(&input).unwrap();
        let gradients = net.backward(&trace, &target).unwrap();

        let h = 1e-6;
        for (layer, gradient) in gradients.iter().enumerate() {
            for r in 0..gradient.rows() {
                for c in 0..gradient.cols() {
                    let perturbed = |by: f64| {
                        let mut n = net.clone();
                        let mut weights = n.weights();
                        let (rows, cols) = weights[layer].shape();
                        let mut bump = vec![vec![0.0; cols]; rows];
                        bump[r][c] = by;
                        weights[layer] =
                            weights[layer].add(&Mat::from_rows(&bump).unwrap()).unwrap();
                        n.commit_weights(weights);
                        n
                    };
                    let plus = perturbed(h);
                    let minus = perturbed(-h);
                    let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
                    assert!(
                        (numeric - gradient.get(r, c)).abs() < 1e-5,
                        "layer {} ({}, {}): numeric {} vs analytic {}",
                        layer,
                        r,
                        c,
                        numeric,
                        gradient.get(r, c)
                    );
                }
            }
        }
    }

    #[test]
    fn export_import_round_trip() {
        let trained = network(&[2, 4, 1], &[Activator::TanH, Activator::Sigmoid], 9);
        let mut fresh = network(&[2, 4, 1], &[Activator::TanH, Activator::Sigmoid], 10);
        fresh.import_weights(&trained.export_weights()).unwrap();
        for input in &[[0.0, 0.0], [0.25, -1.5], [3.0, 7.0]] {
            assert_eq!(trained.predict(input).unwrap(), fresh.predict(input).unwrap());
        }
    }

    #[test]
    fn snapshot_survives_json() {
        let net = network(&[2, 2, 1], &[Activator::ReLU], 11);
        let snapshot = net.export_weights();
        let parsed = NetworkSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn saved_snapshot_reproduces_predictions() {
        let trained = network(&[2, 4, 1], &[Activator::TanH, Activator::Sigmoid], 15);
        let path = std::env::temp_dir().join(format!(
            "evonet-snapshot-{}-{}.json",
            std::process::id(),
            line!()
        ));
        trained.export_weights().save(&path).unwrap();
        let loaded = NetworkSnapshot::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut fresh = network(&[2, 4, 1], &[Activator::TanH, Activator::Sigmoid], 16);
        fresh.import_weights(&loaded).unwrap();
        assert_eq!(fresh.export_weights(), trained.export_weights());
        for input in &[[0.0, 0.0], [0.123, -4.56], [1e-3, 9.87]] {
            assert_eq!(trained.predict(input).unwrap(), fresh.predict(input).unwrap());
        }
    }

    #[test]
    fn truncated_matrix_in_snapshot_is_rejected() {
        let mut net = network(&[2, 1], &[Activator::Linear], 17);
        let before = net.export_weights();
        let json = r#"{"layers":[{
            "weights":{"rows":1,"cols":2,"data":[1.0]},
            "evolution":{"rows":2,"cols":2,"data":[1.0,0.0,0.0,1.0]},
            "bias":{"rows":1,"cols":1,"data":[0.0]}
        }]}"#;
        match NetworkSnapshot::from_json(json) {
            Err(Error::Json(err)) => assert!(err.to_string().contains("entries")),
            other => panic!("expected the snapshot to be rejected, got {:?}", other),
        }
        assert_eq!(net.export_weights(), before);
        assert!(net.predict(&[1.0, 1.0]).is_ok());
    }

    #[test]
    fn import_rejects_mismatched_snapshot_without_mutation() {
        let mut net = network(&[2, 3, 1], &[Activator::ReLU], 12);
        let before = net.export_weights();

        let other_depth = network(&[2, 1], &[Activator::ReLU], 13).export_weights();
        match net.import_weights(&other_depth) {
            Err(Error::Shape(_)) => {}
            other => panic!("expected shape error, got {:?}", other),
        }

        // First layer fits, second does not: nothing may be applied.
        let mut partial = network(&[2, 3, 1], &[Activator::ReLU], 14).export_weights();
        partial.layers[1].weights = Mat::zeros(2, 3);
        assert!(net.import_weights(&partial).is_err());
        assert_eq!(net.export_weights(), before);
    }
}
