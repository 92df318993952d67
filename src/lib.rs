//! Feed-forward networks trained by stability-damped gradient descent.
//!
//! Each layer evolves its incoming state through a near-identity matrix
//! before the usual affine transform. Training scales every step by
//! `1 / (1 + S)`, where `S` is the summed norm of the weight gradients, and
//! stops once `S` (averaged over an iteration) falls below a threshold or
//! the loss stops moving.
//!
//! ```
//! use evonet::activator::Activator;
//! use evonet::trainer::{Logging, Trainer};
//!
//! let inputs = [[0.5], [1.0], [1.5]];
//! let targets = [[1.0], [2.0], [3.0]];
//!
//! let mut trainer = Trainer::builder(&[1, 1])
//!     .activator(Activator::Linear)
//!     .lambda(0.0)
//!     .q_matrix_scale(0.0)
//!     .max_iterations(500)
//!     .logging(Logging::Silent)
//!     .seed(7)
//!     .build()
//!     .unwrap();
//! let result = trainer.train(&inputs, &targets).unwrap();
//! assert_eq!(result.trajectories.len(), result.iterations);
//! ```

pub mod activator;
pub mod error;
pub mod feed_forward;
pub mod layer;
pub mod matrix;
pub mod persistence;
pub mod stability;
pub mod trainer;

pub use crate::error::{Error, Result};
