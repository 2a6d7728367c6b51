//! SGD optimizer with momentum, Nesterov acceleration and weight decay.

use super::common::{Optimizer, OptimizerConfig};
use crate::{TrainError, TrainResult};
use scirs2_core::ndarray::Array2;
use std::collections::HashMap;

/// Stochastic gradient descent with momentum.
#[derive(Debug)]
pub struct SgdOptimizer {
    config: OptimizerConfig,
    /// Momentum buffers for each parameter.
    velocity: HashMap<String, Array2<f64>>,
}

impl SgdOptimizer {
    /// Create a new SGD optimizer.
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SgdOptimizer {
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Array2<f64>>,
        gradients: &HashMap<String, Array2<f64>>,
    ) -> TrainResult<()> {
        let lr = self.config.learning_rate;
        let momentum = self.config.momentum;
        let weight_decay = self.config.weight_decay;

        for (name, param) in parameters.iter_mut() {
            let grad = gradients.get(name).ok_or_else(|| {
                TrainError::OptimizerError(format!("Missing gradient for parameter: {}", name))
            })?;
            if grad.raw_dim() != param.raw_dim() {
                return Err(TrainError::OptimizerError(format!(
                    "gradient shape {:?} does not match parameter '{}' shape {:?}",
                    grad.shape(),
                    name,
                    param.shape()
                )));
            }

            // Classic L2: fold weight decay into the effective gradient
            // before momentum.
            let effective = grad + &param.mapv(|p| p * weight_decay);

            let velocity = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| Array2::zeros(param.raw_dim()));

            // v = momentum * v + g
            velocity.mapv_inplace(|v| v * momentum);
            *velocity = &*velocity + &effective;

            let update = if self.config.nesterov {
                &effective + &velocity.mapv(|v| v * momentum)
            } else {
                velocity.clone()
            };

            *param = &*param - &update.mapv(|u| u * lr);
        }

        Ok(())
    }

    fn zero_grad(&mut self) {
        // Gradients are produced fresh by the model each step and owned by
        // the trainer, so there is no per-step state to clear.
    }

    fn get_lr(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn state_dict(&self) -> HashMap<String, Vec<f64>> {
        let mut state = HashMap::new();
        for (name, velocity) in &self.velocity {
            state.insert(
                format!("velocity_{}", name),
                velocity.iter().copied().collect(),
            );
        }
        state
    }

    fn load_state_dict(&mut self, state: HashMap<String, Vec<f64>>) {
        for (key, values) in state {
            if let Some(name) = key.strip_prefix("velocity_") {
                if let Some(velocity) = self.velocity.get(name) {
                    let shape = velocity.raw_dim();
                    if let Ok(restored) = Array2::from_shape_vec(shape, values) {
                        self.velocity.insert(name.to_string(), restored);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_config() -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: 0.1,
            momentum: 0.0,
            nesterov: false,
            weight_decay: 0.0,
        }
    }

    #[test]
    fn test_plain_sgd_step() {
        let mut optimizer = SgdOptimizer::new(plain_config());
        let mut params = HashMap::new();
        params.insert("w".to_string(), Array2::from_elem((1, 2), 1.0));
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Array2::from_elem((1, 2), 0.5));

        optimizer.step(&mut params, &grads).unwrap();
        // w = 1.0 - 0.1 * 0.5
        assert!((params["w"][[0, 0]] - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_momentum_accumulates() {
        let config = OptimizerConfig {
            learning_rate: 1.0,
            momentum: 0.5,
            nesterov: false,
            weight_decay: 0.0,
        };
        let mut optimizer = SgdOptimizer::new(config);
        let mut params = HashMap::new();
        params.insert("w".to_string(), Array2::zeros((1, 1)));
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Array2::from_elem((1, 1), 1.0));

        // step 1: v = 1, w = -1
        optimizer.step(&mut params, &grads).unwrap();
        assert!((params["w"][[0, 0]] + 1.0).abs() < 1e-12);
        // step 2: v = 0.5 + 1 = 1.5, w = -2.5
        optimizer.step(&mut params, &grads).unwrap();
        assert!((params["w"][[0, 0]] + 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_nesterov_looks_ahead() {
        let config = OptimizerConfig {
            learning_rate: 1.0,
            momentum: 0.5,
            nesterov: true,
            weight_decay: 0.0,
        };
        let mut optimizer = SgdOptimizer::new(config);
        let mut params = HashMap::new();
        params.insert("w".to_string(), Array2::zeros((1, 1)));
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Array2::from_elem((1, 1), 1.0));

        // v = 1, update = g + momentum * v = 1.5
        optimizer.step(&mut params, &grads).unwrap();
        assert!((params["w"][[0, 0]] + 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_weight_decay_pulls_toward_zero() {
        let config = OptimizerConfig {
            learning_rate: 0.1,
            momentum: 0.0,
            nesterov: false,
            weight_decay: 0.1,
        };
        let mut optimizer = SgdOptimizer::new(config);
        let mut params = HashMap::new();
        params.insert("w".to_string(), Array2::from_elem((1, 1), 1.0));
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Array2::zeros((1, 1)));

        optimizer.step(&mut params, &grads).unwrap();
        // w = 1.0 - 0.1 * (0 + 0.1 * 1.0)
        assert!((params["w"][[0, 0]] - 0.99).abs() < 1e-12);
    }

    #[test]
    fn test_missing_gradient_is_an_error() {
        let mut optimizer = SgdOptimizer::new(plain_config());
        let mut params = HashMap::new();
        params.insert("w".to_string(), Array2::zeros((1, 1)));
        let grads = HashMap::new();
        assert!(optimizer.step(&mut params, &grads).is_err());
    }

    #[test]
    fn test_state_dict_round_trip() {
        let config = OptimizerConfig {
            momentum: 0.9,
            ..plain_config()
        };
        let mut optimizer = SgdOptimizer::new(config);
        let mut params = HashMap::new();
        params.insert("w".to_string(), Array2::zeros((1, 2)));
        let mut grads = HashMap::new();
        grads.insert("w".to_string(), Array2::from_elem((1, 2), 1.0));
        optimizer.step(&mut params, &grads).unwrap();

        let state = optimizer.state_dict();
        assert!(state.contains_key("velocity_w"));

        optimizer.load_state_dict(state.clone());
        assert_eq!(optimizer.state_dict()["velocity_w"], state["velocity_w"]);
    }
}
