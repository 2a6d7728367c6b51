//! Running statistics and accuracy metrics.

use crate::{TrainError, TrainResult};
use scirs2_core::ndarray::ArrayView2;

/// z-score for a symmetric 95% confidence interval.
const CI95_Z: f64 = 1.96;

/// Accumulates scalar observations and reports their mean and a 95%
/// confidence interval.
///
/// Meters are scoped to one epoch (or one evaluation pass): reset at every
/// boundary, never merged across epochs.
#[derive(Debug, Clone, Default)]
pub struct RunningMeter {
    values: Vec<f64>,
}

impl RunningMeter {
    /// Create an empty meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observation.
    pub fn update(&mut self, value: f64) {
        self.values.push(value);
    }

    /// Number of observations since the last reset.
    pub fn count(&self) -> usize {
        self.values.len()
    }

    /// Whether the meter holds no observations.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Arithmetic mean of all observations since the last reset.
    ///
    /// Asking for the mean of an empty meter is a programming error.
    pub fn mean(&self) -> TrainResult<f64> {
        if self.values.is_empty() {
            return Err(TrainError::EmptyMeter(
                "mean requested before any observation".to_string(),
            ));
        }
        Ok(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    /// Half-width of the 95% confidence interval around the mean,
    /// `1.96 * s / sqrt(n)` with the unbiased sample standard deviation.
    ///
    /// Defined only for two or more observations; reported as `0.0`
    /// otherwise since it is used for reporting only.
    pub fn confidence_interval(&self) -> f64 {
        let n = self.values.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.values.iter().sum::<f64>() / n as f64;
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / (n - 1) as f64;
        CI95_Z * variance.sqrt() / (n as f64).sqrt()
    }

    /// Discard all observations. Idempotent.
    pub fn reset(&mut self) {
        self.values.clear();
    }
}

/// Top-1 match rate of row-wise argmax against integer targets.
pub fn top1_accuracy(logits: &ArrayView2<f64>, targets: &[usize]) -> TrainResult<f64> {
    if logits.nrows() != targets.len() {
        return Err(TrainError::InvalidParameter(format!(
            "logit rows ({}) must match target count ({})",
            logits.nrows(),
            targets.len()
        )));
    }
    if targets.is_empty() {
        return Err(TrainError::InvalidParameter(
            "accuracy over an empty batch is undefined".to_string(),
        ));
    }

    let mut correct = 0usize;
    for (row, &target) in logits.rows().into_iter().zip(targets.iter()) {
        let mut best = 0usize;
        let mut best_value = row[0];
        for (j, &value) in row.iter().enumerate().skip(1) {
            if value > best_value {
                best_value = value;
                best = j;
            }
        }
        if best == target {
            correct += 1;
        }
    }

    Ok(correct as f64 / targets.len() as f64)
}
