//! Error types shared by every part of the crate.

use std::io;

/// Errors produced while building, running, or training a network.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two operands (or an operand and the network) disagree on shape.
    #[error("dimension mismatch in {op}: expected {expected:?}, found {found:?}")]
    Dimension {
        op: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    /// Backward was requested without a matching forward trace.
    #[error("invalid state: {0}")]
    State(String),
    /// A weight snapshot does not fit the network it is imported into.
    #[error("snapshot shape mismatch: {0}")]
    Shape(String),
    /// NaN or infinity showed up during training.
    #[error("non-finite {quantity} at iteration {iteration}, sample {sample}")]
    NumericalInstability {
        iteration: usize,
        sample: usize,
        quantity: &'static str,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid training data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn dimension(
        op: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    ) -> Self {
        Error::Dimension {
            op,
            expected,
            found,
        }
    }
}
