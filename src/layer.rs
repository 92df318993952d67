use crate::activator::{Activation, Activator};
use crate::error::{Error, Result};
use crate::matrix::Mat;

use rand::distributions::Uniform;
use rand::Rng;
use rand_distr::StandardNormal;
use serde_derive::{Deserialize, Serialize};

/// Spread of the fixed random bias. Biases are never trained.
const BIAS_STD_DEV: f64 = 0.5;

/// A single fully connected layer with a state evolution step.
///
/// Each forward pass first evolves the incoming state through the square
/// matrix `Q`, then applies the affine map `W * h' + b` and the activation.
/// Only `W` changes during training; `Q` and `b` keep their initial values.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Tag of the activation function used for every neuron in the layer.
    activator: Activator,
    /// Function pair resolved from `activator` at construction.
    activation: Activation,
    /// The network weights, `outputs x inputs`.
    weights: Mat,
    /// The evolution matrix, `inputs x inputs`.
    evolution: Mat,
    /// Column bias, `outputs x 1`.
    bias: Mat,
}

/// Values recorded by one forward call, consumed by the matching backward
/// call for the same sample.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    input: Mat,
    evolved: Mat,
    pre_activation: Mat,
    post_activation: Mat,
}

impl ForwardTrace {
    pub fn input(&self) -> &Mat {
        &self.input
    }

    pub fn pre_activation(&self) -> &Mat {
        &self.pre_activation
    }

    pub fn post_activation(&self) -> &Mat {
        &self.post_activation
    }
}

/// Serializable copy of every parameter in a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSnapshot {
    pub weights: Mat,
    pub evolution: Mat,
    pub bias: Mat,
}

impl Layer {
    /// Initializes a new, untrained layer.
    ///
    /// Arguments:
    ///
    ///  * `activator` - the activation function to be used for this layer's
    ///                  output.
    ///  * `inputs` - the number of inputs to this layer.
    ///  * `outputs` - the number of outputs from this layer.
    ///  * `q_scale` - half-width of the uniform noise added to the identity
    ///                evolution matrix. Must be finite and non-negative;
    ///                `Network::new` checks this.
    pub(crate) fn new<R>(
        activator: Activator,
        inputs: usize,
        outputs: usize,
        q_scale: f64,
        rng: &mut R,
    ) -> Self
    where
        R: Rng + ?Sized,
    {
        let evolution = if q_scale > 0.0 {
            Mat::random(
                Uniform::new_inclusive(-q_scale, q_scale),
                inputs,
                inputs,
                rng,
            )
            .offset_diagonal(1.0)
        } else {
            Mat::identity(inputs)
        };
        Layer {
            activator,
            activation: activator.resolve(),
            weights: Mat::xavier(outputs, inputs, rng),
            evolution,
            bias: Mat::random(StandardNormal, outputs, 1, rng).scale(BIAS_STD_DEV),
        }
    }

    /// Returns the number of inputs to this layer.
    pub fn input_len(&self) -> usize {
        self.weights.cols()
    }

    /// Returns the number of outputs from this layer.
    pub fn output_len(&self) -> usize {
        self.weights.rows()
    }

    pub fn activator(&self) -> Activator {
        self.activator
    }

    pub fn weights(&self) -> &Mat {
        &self.weights
    }

    /// Feeds the column vector `input` forward through the layer.
    pub fn forward(&self, input: &Mat) -> Result<ForwardTrace> {
        if input.shape() != (self.input_len(), 1) {
            return Err(Error::dimension(
                "layer forward",
                (self.input_len(), 1),
                input.shape(),
            ));
        }
        let evolved = self.evolution.multiply(input)?;
        let pre_activation = self.weights.multiply(&evolved)?.add(&self.bias)?;
        let post_activation = self.activation.apply(&pre_activation);
        Ok(ForwardTrace {
            input: input.clone(),
            evolved,
            pre_activation,
            post_activation,
        })
    }

    /// Feeds the error `delta` (with respect to this layer's output) back
    /// through the layer.
    ///
    /// Returns the weight gradient and, when `propagate` is set, the error
    /// with respect to this layer's input.
    pub fn backward(
        &self,
        trace: &ForwardTrace,
        delta: &Mat,
        propagate: bool,
    ) -> Result<(Mat, Option<Mat>)> {
        if trace.input.rows() != self.input_len()
            || trace.pre_activation.rows() != self.output_len()
        {
            return Err(Error::State(format!(
                "trace of shape {:?} -> {:?} does not belong to a {} -> {} layer",
                trace.input.shape(),
                trace.pre_activation.shape(),
                self.input_len(),
                self.output_len()
            )));
        }
        let delta = delta.hadamard(&self.activation.derivative(&trace.pre_activation))?;
        let gradient = delta.multiply(&trace.evolved.transpose())?;
        let upstream = if propagate {
            let through_weights = self.weights.transpose().multiply(&delta)?;
            Some(self.evolution.transpose().multiply(&through_weights)?)
        } else {
            None
        };
        Ok((gradient, upstream))
    }

    /// Returns `W - rate * gradient` without touching the layer.
    pub fn stepped_weights(&self, rate: f64, gradient: &Mat) -> Result<Mat> {
        self.weights.subtract(&gradient.scale(rate))
    }

    pub(crate) fn set_weights(&mut self, weights: Mat) {
        self.weights = weights;
    }

    pub fn snapshot(&self) -> LayerSnapshot {
        LayerSnapshot {
            weights: self.weights.clone(),
            evolution: self.evolution.clone(),
            bias: self.bias.clone(),
        }
    }

    /// Checks that `snapshot` has exactly this layer's shapes.
    pub fn check_snapshot(&self, snapshot: &LayerSnapshot) -> Result<()> {
        let pairs = [
            ("weights", &self.weights, &snapshot.weights),
            ("evolution", &self.evolution, &snapshot.evolution),
            ("bias", &self.bias, &snapshot.bias),
        ];
        for &(name, current, incoming) in &pairs {
            let (rows, cols) = incoming.shape();
            if current.shape() != incoming.shape() || incoming.as_slice().len() != rows * cols {
                return Err(Error::Shape(format!(
                    "{} is {:?}, snapshot has {:?}",
                    name,
                    current.shape(),
                    incoming.shape()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn restore(&mut self, snapshot: &LayerSnapshot) {
        self.weights = snapshot.weights.clone();
        self.evolution = snapshot.evolution.clone();
        self.bias = snapshot.bias.clone();
    }
}
