//! Training loss for grid-based, single-stage object detectors.
//!
//! Predictions of shape `[N, S, S, B*5 + C]` are scored against per-cell ground
//! truth with [`loss::YoloLoss`]. The loss is built on the autograd
//! [`tensor::Tensor`], so `total_loss.backward()` leaves gradients on the
//! prediction tensor.

pub mod config;
pub mod error;
pub mod geometry;
pub mod loss;
pub mod matcher;
pub mod tensor;

pub use config::YoloLossConfig;
pub use error::{LossError, Result};
pub use loss::{LossDict, LossSummary, YoloLoss};
pub use tensor::Tensor;
