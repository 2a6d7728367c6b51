//! Learning rate schedules.

use crate::optimizers::Optimizer;
use crate::TrainResult;
use std::collections::HashMap;

/// Trait for learning rate schedulers.
pub trait LrScheduler {
    /// Advance one epoch and push the resulting rate into the optimizer.
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    /// Get current learning rate.
    fn get_lr(&self) -> f64;

    /// Get scheduler state as a dictionary.
    fn state_dict(&self) -> HashMap<String, f64>;

    /// Load scheduler state from a dictionary.
    fn load_state_dict(&mut self, state: &HashMap<String, f64>) -> TrainResult<()>;
}

/// Multiplies the learning rate by `gamma` when the epoch counter crosses
/// each configured milestone. The rate is monotonically non-increasing for
/// `gamma <= 1`.
#[derive(Debug, Clone)]
pub struct MultiStepLrScheduler {
    /// Initial learning rate.
    pub initial_lr: f64,
    /// Epochs at which the rate decays, sorted ascending.
    pub milestones: Vec<usize>,
    /// Multiplicative decay factor.
    pub gamma: f64,
    current_epoch: usize,
    current_lr: f64,
}

impl MultiStepLrScheduler {
    /// Create a scheduler; milestones are sorted and deduplicated.
    pub fn new(initial_lr: f64, mut milestones: Vec<usize>, gamma: f64) -> Self {
        milestones.sort_unstable();
        milestones.dedup();
        Self {
            initial_lr,
            milestones,
            gamma,
            current_epoch: 0,
            current_lr: initial_lr,
        }
    }

    fn lr_for_epoch(&self, epoch: usize) -> f64 {
        let decays = self.milestones.iter().filter(|&&m| m <= epoch).count();
        self.initial_lr * self.gamma.powi(decays as i32)
    }
}

impl LrScheduler for MultiStepLrScheduler {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.current_epoch += 1;
        let lr = self.lr_for_epoch(self.current_epoch);
        if lr != self.current_lr {
            self.current_lr = lr;
            optimizer.set_lr(lr);
        }
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }

    fn state_dict(&self) -> HashMap<String, f64> {
        let mut state = HashMap::new();
        state.insert("initial_lr".to_string(), self.initial_lr);
        state.insert("current_lr".to_string(), self.current_lr);
        state.insert("current_epoch".to_string(), self.current_epoch as f64);
        state.insert("gamma".to_string(), self.gamma);
        state
    }

    fn load_state_dict(&mut self, state: &HashMap<String, f64>) -> TrainResult<()> {
        if let Some(&current_lr) = state.get("current_lr") {
            self.current_lr = current_lr;
        }
        if let Some(&current_epoch) = state.get("current_epoch") {
            self.current_epoch = current_epoch as usize;
        }
        Ok(())
    }
}
