//! Error types for training operations.

use thiserror::Error;

/// Errors that can occur during episodic training.
#[derive(Error, Debug)]
pub enum TrainError {
    /// A class does not hold enough examples for the requested episode shape.
    #[error("class {class} has {available} examples, episode shape requires {required}")]
    InsufficientExamples {
        /// Offending class identifier.
        class: usize,
        /// Examples available for that class.
        available: usize,
        /// Examples required per class (`shot + query`).
        required: usize,
    },

    /// Statistics requested from a meter with no observations.
    #[error("empty meter: {0}")]
    EmptyMeter(String),

    /// Error in loss computation.
    #[error("Loss computation error: {0}")]
    LossError(String),

    /// Error in optimizer operation.
    #[error("Optimizer error: {0}")]
    OptimizerError(String),

    /// Error in model operations.
    #[error("Model error: {0}")]
    ModelError(String),

    /// Error in dataset access or batch construction.
    #[error("Data error: {0}")]
    DataError(String),

    /// Error in checkpoint save/load.
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// Error with invalid parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Error in configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A failure inside one optimization step, tagged with its position in
    /// the run for diagnosability.
    #[error("epoch {epoch} step {step}: {source}")]
    Step {
        /// Epoch in which the step failed (1-based).
        epoch: usize,
        /// Step index within the epoch (1-based).
        step: usize,
        /// Underlying failure.
        #[source]
        source: Box<TrainError>,
    },

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl TrainError {
    /// Wrap an error with the epoch and step it occurred in.
    pub fn at_step(self, epoch: usize, step: usize) -> Self {
        TrainError::Step {
            epoch,
            step,
            source: Box::new(self),
        }
    }
}

/// Result type for training operations.
pub type TrainResult<T> = Result<T, TrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_examples_names_class_and_count() {
        let err = TrainError::InsufficientExamples {
            class: 7,
            available: 3,
            required: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("class 7"));
        assert!(msg.contains("requires 16"));
    }

    #[test]
    fn test_step_context_wraps_source() {
        let err = TrainError::LossError("shape mismatch".to_string()).at_step(4, 12);
        let msg = err.to_string();
        assert!(msg.contains("epoch 4"));
        assert!(msg.contains("step 12"));
        assert!(msg.contains("shape mismatch"));
    }
}
