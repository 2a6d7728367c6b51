//! Common optimizer utilities and traits.

use crate::TrainResult;
use scirs2_core::ndarray::Array2;
use std::collections::HashMap;

/// Compute the global L2 norm over all parameter gradients.
pub fn compute_gradient_norm(gradients: &HashMap<String, Array2<f64>>) -> f64 {
    let mut total_norm_sq = 0.0;
    for grad in gradients.values() {
        for &g in grad.iter() {
            total_norm_sq += g * g;
        }
    }
    total_norm_sq.sqrt()
}

/// Rescale `gradients` in place so their global L2 norm does not exceed
/// `max_norm`; a no-op when already under the threshold.
///
/// Returns the pre-clip norm.
pub fn clip_gradient_norm(gradients: &mut HashMap<String, Array2<f64>>, max_norm: f64) -> f64 {
    let total_norm = compute_gradient_norm(gradients);
    if total_norm > max_norm {
        let scale = max_norm / total_norm;
        for grad in gradients.values_mut() {
            grad.mapv_inplace(|g| g * scale);
        }
    }
    total_norm
}

/// Configuration for optimizers.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate.
    pub learning_rate: f64,
    /// Momentum factor.
    pub momentum: f64,
    /// Whether to apply Nesterov momentum.
    pub nesterov: bool,
    /// L2 weight decay coefficient.
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.9,
            nesterov: true,
            weight_decay: 5e-4,
        }
    }
}

/// Trait for optimizers.
pub trait Optimizer {
    /// Update parameters with computed gradients.
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Array2<f64>>,
        gradients: &HashMap<String, Array2<f64>>,
    ) -> TrainResult<()>;

    /// Clear any per-step gradient state.
    fn zero_grad(&mut self);

    /// Get current learning rate.
    fn get_lr(&self) -> f64;

    /// Set learning rate.
    fn set_lr(&mut self, lr: f64);

    /// Get optimizer state for checkpointing.
    fn state_dict(&self) -> HashMap<String, Vec<f64>>;

    /// Load optimizer state from checkpoint.
    fn load_state_dict(&mut self, state: HashMap<String, Vec<f64>>);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grads_of(values: &[(&str, Vec<f64>)]) -> HashMap<String, Array2<f64>> {
        values
            .iter()
            .map(|(name, v)| {
                (
                    name.to_string(),
                    Array2::from_shape_vec((1, v.len()), v.clone()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_gradient_norm() {
        let grads = grads_of(&[("a", vec![3.0]), ("b", vec![4.0])]);
        assert!((compute_gradient_norm(&grads) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_clip_rescales_over_threshold() {
        let mut grads = grads_of(&[("a", vec![3.0]), ("b", vec![4.0])]);
        let pre = clip_gradient_norm(&mut grads, 2.0);
        assert!((pre - 5.0).abs() < 1e-12);
        assert!((compute_gradient_norm(&grads) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_clip_is_noop_under_threshold() {
        let mut grads = grads_of(&[("a", vec![0.3, 0.4])]);
        let pre = clip_gradient_norm(&mut grads, 2.0);
        assert!((pre - 0.5).abs() < 1e-12);
        assert_eq!(grads["a"][[0, 0]], 0.3);
        assert_eq!(grads["a"][[0, 1]], 0.4);
    }
}
