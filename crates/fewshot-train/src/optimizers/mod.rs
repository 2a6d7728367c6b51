//! Optimizers and gradient utilities.

mod common;
mod sgd;

pub use common::{clip_gradient_norm, compute_gradient_norm, Optimizer, OptimizerConfig};
pub use sgd::SgdOptimizer;
