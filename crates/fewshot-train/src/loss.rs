//! Loss functions and the per-step composite objective.
//!
//! Cross-entropy here operates on raw logits with integer class targets and
//! exposes its analytic gradient, so the orchestrator can hand logit-space
//! gradients to the model collaborator without owning any autodiff.

use crate::metrics::top1_accuracy;
use crate::{TrainError, TrainResult};
use scirs2_core::ndarray::{Array2, ArrayView2};

/// Softmax cross-entropy over logits with integer class targets.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    /// Epsilon guarding the log against zero probabilities.
    pub epsilon: f64,
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self { epsilon: 1e-12 }
    }
}

impl CrossEntropyLoss {
    fn check_shapes(&self, logits: &ArrayView2<f64>, targets: &[usize]) -> TrainResult<()> {
        if logits.nrows() != targets.len() {
            return Err(TrainError::LossError(format!(
                "logit rows ({}) must match target count ({})",
                logits.nrows(),
                targets.len()
            )));
        }
        if logits.nrows() == 0 {
            return Err(TrainError::LossError("empty logit batch".to_string()));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= logits.ncols()) {
            return Err(TrainError::LossError(format!(
                "target class {} out of range for {} logit columns",
                bad,
                logits.ncols()
            )));
        }
        Ok(())
    }

    /// Mean negative log-likelihood of `targets` under softmax of `logits`.
    pub fn compute(&self, logits: &ArrayView2<f64>, targets: &[usize]) -> TrainResult<f64> {
        self.check_shapes(logits, targets)?;

        let mut total = 0.0;
        for (row, &target) in logits.rows().into_iter().zip(targets.iter()) {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let log_sum_exp = row.iter().map(|&v| (v - max).exp()).sum::<f64>().ln() + max;
            let log_prob = (row[target] - log_sum_exp).min(0.0);
            total -= log_prob.max(self.epsilon.ln());
        }

        Ok(total / targets.len() as f64)
    }

    /// Gradient of [`Self::compute`] with respect to the logits:
    /// `(softmax(logits) - onehot(targets)) / n`.
    pub fn gradient(
        &self,
        logits: &ArrayView2<f64>,
        targets: &[usize],
    ) -> TrainResult<Array2<f64>> {
        self.check_shapes(logits, targets)?;

        let n = targets.len() as f64;
        let mut grad = Array2::zeros(logits.raw_dim());
        for (i, (row, &target)) in logits.rows().into_iter().zip(targets.iter()).enumerate() {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let sum_exp: f64 = row.iter().map(|&v| (v - max).exp()).sum();
            for (j, &v) in row.iter().enumerate() {
                let softmax = (v - max).exp() / sum_exp;
                grad[[i, j]] = (softmax - if j == target { 1.0 } else { 0.0 }) / n;
            }
        }

        Ok(grad)
    }
}

/// Scalar loss terms and the episodic accuracy for one step.
#[derive(Debug, Clone, Copy)]
pub struct StepLosses {
    /// Episodic prototype loss (always computed, reported even when it does
    /// not feed the gradient path).
    pub prototype: f64,
    /// Episodic instance-level loss against absolute query labels.
    pub instance: f64,
    /// Auxiliary classification loss against absolute auxiliary labels.
    pub auxiliary: f64,
    /// The gradient-producing total.
    pub total: f64,
    /// Top-1 accuracy of the prototype logits against the tiled class ranks.
    pub accuracy: f64,
}

/// Gradients of the total loss with respect to each head's logits.
#[derive(Debug, Clone)]
pub struct HeadGradients {
    /// d total / d prototype logits (already scaled by the prototype weight).
    pub prototype: Array2<f64>,
    /// d total / d instance logits.
    pub instance: Array2<f64>,
    /// d total / d auxiliary logits.
    pub auxiliary: Array2<f64>,
}

/// Combines the per-step loss terms with fixed weighting.
///
/// `total = auxiliary + instance + prototype_weight * prototype`. The
/// prototype weight defaults to `0.0`: the term is computed and reported but
/// kept out of the gradient path. The "loss used for the metric" vs "loss
/// used for gradients" split is load-bearing and must not be collapsed.
#[derive(Debug, Clone)]
pub struct CompositeLoss {
    ce: CrossEntropyLoss,
    prototype_weight: f64,
}

impl Default for CompositeLoss {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl CompositeLoss {
    /// Create the composite with an explicit prototype-term weight.
    pub fn new(prototype_weight: f64) -> Self {
        Self {
            ce: CrossEntropyLoss::default(),
            prototype_weight,
        }
    }

    /// Weight applied to the prototype term in the gradient-producing total.
    pub fn prototype_weight(&self) -> f64 {
        self.prototype_weight
    }

    /// Evaluate all terms for one training step.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        prototype_logits: &ArrayView2<f64>,
        class_ranks: &[usize],
        instance_logits: &ArrayView2<f64>,
        query_labels: &[usize],
        auxiliary_logits: &ArrayView2<f64>,
        auxiliary_labels: &[usize],
    ) -> TrainResult<(StepLosses, HeadGradients)> {
        let prototype = self.ce.compute(prototype_logits, class_ranks)?;
        let instance = self.ce.compute(instance_logits, query_labels)?;
        let auxiliary = self.ce.compute(auxiliary_logits, auxiliary_labels)?;
        let accuracy = top1_accuracy(prototype_logits, class_ranks)?;

        let total = auxiliary + instance + self.prototype_weight * prototype;

        let prototype_grad = if self.prototype_weight == 0.0 {
            Array2::zeros(prototype_logits.raw_dim())
        } else {
            let mut g = self.ce.gradient(prototype_logits, class_ranks)?;
            g.mapv_inplace(|v| v * self.prototype_weight);
            g
        };

        let losses = StepLosses {
            prototype,
            instance,
            auxiliary,
            total,
            accuracy,
        };
        let gradients = HeadGradients {
            prototype: prototype_grad,
            instance: self.ce.gradient(instance_logits, query_labels)?,
            auxiliary: self.ce.gradient(auxiliary_logits, auxiliary_labels)?,
        };

        Ok((losses, gradients))
    }

    /// Episodic-only terms, for the evaluation pass: prototype loss and
    /// accuracy against the tiled class ranks. No gradients.
    pub fn evaluate_episodic(
        &self,
        prototype_logits: &ArrayView2<f64>,
        class_ranks: &[usize],
    ) -> TrainResult<(f64, f64)> {
        let loss = self.ce.compute(prototype_logits, class_ranks)?;
        let accuracy = top1_accuracy(prototype_logits, class_ranks)?;
        Ok((loss, accuracy))
    }
}
