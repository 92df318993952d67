//! Activation function types.

use crate::matrix::Mat;

use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// [Activation function](https://en.wikipedia.org/wiki/Activation_function)
/// types.
///
/// Serialized as the lowercase tags `relu`, `sigmoid`, `tanh` and `linear`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activator {
    /// Rectified Linear Unit
    ReLU,
    /// Sigmoid function
    Sigmoid,
    /// Hyperbolic tan function
    TanH,
    /// Identity function
    Linear,
}

impl Activator {
    /// Resolves the tag into its concrete function pair.
    pub fn resolve(self) -> Activation {
        match self {
            Activator::ReLU => Activation {
                f: relu,
                fprime: relu_prime,
            },
            Activator::Sigmoid => Activation {
                f: sigmoid,
                fprime: sigmoid_prime,
            },
            Activator::TanH => Activation {
                f: f64::tanh,
                fprime: tanh_prime,
            },
            Activator::Linear => Activation {
                f: linear,
                fprime: linear_prime,
            },
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Activator::ReLU => "relu",
            Activator::Sigmoid => "sigmoid",
            Activator::TanH => "tanh",
            Activator::Linear => "linear",
        }
    }
}

impl fmt::Display for Activator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Activator {
    type Err = String;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activator::ReLU),
            "sigmoid" => Ok(Activator::Sigmoid),
            "tanh" => Ok(Activator::TanH),
            "linear" => Ok(Activator::Linear),
            other => Err(format!("unknown activation '{}'", other)),
        }
    }
}

/// A resolved activation: the function and its derivative, both evaluated at
/// the pre-activation value `z`.
#[derive(Copy, Clone, Debug)]
pub struct Activation {
    f: fn(f64) -> f64,
    fprime: fn(f64) -> f64,
}

impl Activation {
    /// Evaluates `f(z)` for every entry of `z`.
    pub fn apply(&self, z: &Mat) -> Mat {
        z.map(self.f)
    }

    /// Evaluates `f'(z)` for every entry of `z`.
    pub fn derivative(&self, z: &Mat) -> Mat {
        z.map(self.fprime)
    }
}

fn relu(z: f64) -> f64 {
    if z > 0.0 {
        z
    } else {
        0.0
    }
}

fn relu_prime(z: f64) -> f64 {
    if z > 0.0 {
        1.0
    } else {
        0.0
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn sigmoid_prime(z: f64) -> f64 {
    let s = sigmoid(z);
    s * (1.0 - s)
}

fn tanh_prime(z: f64) -> f64 {
    let t = z.tanh();
    1.0 - t * t
}

fn linear(z: f64) -> f64 {
    z
}

fn linear_prime(_: f64) -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(values: &[f64]) -> Mat {
        Mat::column(values)
    }

    #[test]
    fn tags_round_trip_through_from_str() {
        for activator in &[
            Activator::ReLU,
            Activator::Sigmoid,
            Activator::TanH,
            Activator::Linear,
        ] {
            assert_eq!(activator.tag().parse::<Activator>(), Ok(*activator));
        }
        assert!("softmax".parse::<Activator>().is_err());
    }

    #[test]
    fn serde_uses_lowercase_tags() {
        let json = serde_json::to_string(&[Activator::ReLU, Activator::TanH]).unwrap();
        assert_eq!(json, r#"["relu","tanh"]"#);
        let parsed: Vec<Activator> =
            serde_json::from_str(r#"["sigmoid","linear"]"#).unwrap();
        assert_eq!(parsed, vec![Activator::Sigmoid, Activator::Linear]);
    }

    #[test]
    fn relu_clamps_negatives() {
        let act = Activator::ReLU.resolve();
        let z = column(&[-1.0, 0.0, 2.5]);
        assert_eq!(act.apply(&z), column(&[0.0, 0.0, 2.5]));
        assert_eq!(act.derivative(&z), column(&[0.0, 0.0, 1.0]));
    }

    #[test]
    fn sigmoid_at_zero() {
        let act = Activator::Sigmoid.resolve();
        let z = column(&[0.0]);
        assert_eq!(act.apply(&z), column(&[0.5]));
        assert_eq!(act.derivative(&z), column(&[0.25]));
    }

    #[test]
    fn tanh_derivative_matches_finite_difference() {
        let act = Activator::TanH.resolve();
        let h: f64 = 1e-6;
        for &z in &[-2.0f64, -0.3, 0.0, 0.7, 1.9] {
            let numeric = ((z + h).tanh() - (z - h).tanh()) / (2.0 * h);
            let analytic = act.derivative(&column(&[z])).get(0, 0);
            assert!((numeric - analytic).abs() < 1e-6);
        }
    }

    #[test]
    fn linear_is_identity() {
        let act = Activator::Linear.resolve();
        let z = Mat::from_rows(&[[1.0, -3.0], [0.5, 8.0]]).unwrap();
        assert_eq!(act.apply(&z), z);
        assert_eq!(act.derivative(&z), z.map(|_| 1.0));
    }
}
