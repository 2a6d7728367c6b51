//! Episodic few-shot training orchestration.
//!
//! This crate trains an image-classifier-style model under the episodic
//! meta-learning regime, jointly with an ordinary classification objective,
//! and selects the best checkpoint across epochs. It provides:
//! - Class-stratified episode sampling (N-way, K-shot, Q-query)
//! - A dual-stream coordinator pairing episodes with auxiliary batches
//! - A composite loss keeping metric-only and gradient-producing terms apart
//! - A per-step optimization sequence with norm clipping and gradient
//!   health monitoring
//! - Deterministic evaluation over a frozen episode set
//! - Strict-improvement checkpoint selection with pluggable persistence
//! - Optional telemetry backends
//!
//! The network itself stays behind the [`EpisodicModel`] trait; dataset
//! decoding, device placement and experiment tracking are external
//! collaborators.

mod checkpoint;
mod data;
mod error;
mod logging;
mod loss;
mod metrics;
mod model;
mod optimizers;
mod sampler;
mod scheduler;
mod trainer;

pub use checkpoint::{
    CheckpointPolicy, CheckpointStore, DirectoryStore, MemoryStore, ModelSnapshot,
    OptimizerSnapshot, ParamTensor, BEST_TAG, SNAPSHOT_VERSION,
};
pub use data::{AuxiliaryBatches, InMemoryDataset, LabelIndex};
pub use error::{TrainError, TrainResult};
pub use logging::{ConsoleLogger, JsonlLogger, LoggingBackend, MetricsLogger};
pub use loss::{CompositeLoss, CrossEntropyLoss, HeadGradients, StepLosses};
pub use metrics::{top1_accuracy, RunningMeter};
pub use model::{EpisodicLogits, EpisodicModel, PrototypeClassifier};
pub use optimizers::{
    clip_gradient_norm, compute_gradient_norm, Optimizer, OptimizerConfig, SgdOptimizer,
};
pub use sampler::{CategoryStratifiedSampler, Episode};
pub use scheduler::{LrScheduler, MultiStepLrScheduler};
pub use trainer::{
    EpochReport, EvaluationReport, FitReport, GradientEvent, GradientObserver, Trainer,
    TrainerConfig, TrainingState,
};
