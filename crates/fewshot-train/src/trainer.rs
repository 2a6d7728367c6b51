//! Training orchestration: the per-step optimization sequence, epoch loop,
//! evaluation pass and checkpoint selection.
//!
//! One step consumes exactly one episode paired with one auxiliary batch.
//! The two streams are independent producers pulled in lock-step; whichever
//! yields fewer items per epoch bounds the epoch. Evaluation for an epoch
//! runs strictly after all of that epoch's training steps, so the model's
//! parameters are never read and mutated concurrently.

use crate::checkpoint::{CheckpointPolicy, CheckpointStore, ModelSnapshot, OptimizerSnapshot};
use crate::data::{AuxiliaryBatches, InMemoryDataset};
use crate::logging::MetricsLogger;
use crate::loss::{CompositeLoss, StepLosses};
use crate::metrics::RunningMeter;
use crate::model::EpisodicModel;
use crate::optimizers::{clip_gradient_norm, Optimizer};
use crate::sampler::{CategoryStratifiedSampler, Episode};
use crate::scheduler::LrScheduler;
use crate::{TrainError, TrainResult};
use scirs2_core::random::{SeedableRng, StdRng};

/// Configuration for the training run.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Classes per episode.
    pub way: usize,
    /// Support examples per class.
    pub shot: usize,
    /// Query examples per class.
    pub query: usize,
    /// Auxiliary batch size.
    pub batch_size: usize,
    /// Training episodes sampled per epoch.
    pub train_episodes: usize,
    /// Evaluation episodes materialized once and replayed every epoch.
    pub val_episodes: usize,
    /// Number of epochs.
    pub max_epoch: usize,
    /// Global L2 norm ceiling for parameter gradients.
    pub grad_clip_norm: f64,
    /// Weight of the episodic prototype term in the gradient-producing
    /// total. The term is always computed and reported; at the default of
    /// `0.0` it stays out of the gradient path.
    pub prototype_loss_weight: f64,
    /// Persist a checkpoint every epoch in addition to the best one.
    pub save_all: bool,
    /// Seed for the trainer-owned random source.
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            way: 5,
            shot: 1,
            query: 15,
            batch_size: 64,
            train_episodes: 100,
            val_episodes: 200,
            max_epoch: 60,
            grad_clip_norm: 2.0,
            prototype_loss_weight: 0.0,
            save_all: false,
            seed: 1,
        }
    }
}

impl TrainerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> TrainResult<()> {
        if self.way == 0 || self.shot == 0 || self.query == 0 {
            return Err(TrainError::ConfigError(
                "way, shot and query must all be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(TrainError::ConfigError(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.train_episodes == 0 || self.val_episodes == 0 {
            return Err(TrainError::ConfigError(
                "train_episodes and val_episodes must be greater than 0".to_string(),
            ));
        }
        if self.max_epoch == 0 {
            return Err(TrainError::ConfigError(
                "max_epoch must be greater than 0".to_string(),
            ));
        }
        if self.grad_clip_norm <= 0.0 || !self.grad_clip_norm.is_finite() {
            return Err(TrainError::ConfigError(
                "grad_clip_norm must be finite and greater than 0".to_string(),
            ));
        }
        if !self.prototype_loss_weight.is_finite() {
            return Err(TrainError::ConfigError(
                "prototype_loss_weight must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mutable run state, updated once per epoch.
#[derive(Debug, Clone, Default)]
pub struct TrainingState {
    /// Current epoch (1-based; 0 before training starts).
    pub epoch: usize,
    /// Step index within the current epoch (1-based).
    pub step: usize,
    /// Mean training loss of the last completed epoch.
    pub train_loss: f64,
    /// Mean episodic training accuracy of the last completed epoch.
    pub train_accuracy: f64,
    /// Validation loss of the last completed epoch.
    pub val_loss: Option<f64>,
    /// Validation accuracy of the last completed epoch.
    pub val_accuracy: Option<f64>,
    /// Learning rate currently applied by the optimizer.
    pub learning_rate: f64,
    /// Best validation metric seen so far.
    pub best_metric: Option<f64>,
    /// Epoch that produced the best metric.
    pub best_epoch: Option<usize>,
}

/// One gradient-health observation.
#[derive(Debug, Clone)]
pub struct GradientEvent {
    /// Epoch of the step.
    pub epoch: usize,
    /// Step index within the epoch.
    pub step: usize,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    /// Whether any parameter gradient contained a non-finite value.
    pub non_finite: bool,
}

/// Injectable hook observing gradient health every step.
///
/// Detection is a side observation: the step proceeds regardless, since
/// aborting a multi-hour run on a single bad step is worse than recording
/// it.
pub trait GradientObserver {
    /// Called once per optimization step.
    fn observe(&mut self, event: &GradientEvent);
}

/// Summary of one training epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochReport {
    /// Mean total loss over the epoch's steps.
    pub loss: f64,
    /// Mean episodic accuracy over the epoch's steps.
    pub accuracy: f64,
    /// 95% confidence interval of the accuracy.
    pub confidence_interval: f64,
    /// Steps actually executed (the shorter stream bounds this).
    pub steps: usize,
}

/// Summary of one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationReport {
    /// Mean episodic loss across the fixed episodes.
    pub loss: f64,
    /// Mean episodic accuracy across the fixed episodes.
    pub accuracy: f64,
    /// 95% confidence interval of the accuracy.
    pub confidence_interval: f64,
}

/// Summary of a full training run.
#[derive(Debug, Clone, Copy)]
pub struct FitReport {
    /// Epochs executed.
    pub epochs: usize,
    /// Epoch with the best validation accuracy.
    pub best_epoch: usize,
    /// Best validation accuracy.
    pub best_metric: f64,
}

/// Drives episodic training of an [`EpisodicModel`].
pub struct Trainer<M: EpisodicModel> {
    model: M,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LrScheduler>,
    composite: CompositeLoss,
    config: TrainerConfig,
    state: TrainingState,
    policy: CheckpointPolicy,
    logger: MetricsLogger,
    observers: Vec<Box<dyn GradientObserver>>,
    rng: StdRng,
}

impl<M: EpisodicModel> Trainer<M> {
    /// Create a trainer owning the model, optimizer and schedule.
    pub fn new(
        model: M,
        optimizer: Box<dyn Optimizer>,
        scheduler: Box<dyn LrScheduler>,
        config: TrainerConfig,
    ) -> TrainResult<Self> {
        config.validate()?;
        let state = TrainingState {
            learning_rate: optimizer.get_lr(),
            ..Default::default()
        };
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            model,
            optimizer,
            scheduler,
            composite: CompositeLoss::new(config.prototype_loss_weight),
            policy: CheckpointPolicy::new(config.save_all),
            config,
            state,
            logger: MetricsLogger::new(),
            observers: Vec::new(),
            rng,
        })
    }

    /// Attach a telemetry logger.
    pub fn with_logger(mut self, logger: MetricsLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Attach a gradient-health observer.
    pub fn with_observer(mut self, observer: Box<dyn GradientObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// The model being trained.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable access to the model (e.g. to restore a snapshot).
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Current run state.
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The run configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// One optimization step over one episode and one auxiliary batch.
    ///
    /// The sequence is fixed: batch construction, encoder forward, episodic
    /// head, auxiliary head, loss composition, backward, norm clipping,
    /// gradient-health check, update, gradient clear. The update always
    /// applies the gradients of exactly this step's composed total.
    fn train_step(
        &mut self,
        dataset: &InMemoryDataset,
        episode: &Episode,
        aux_indices: &[usize],
    ) -> TrainResult<StepLosses> {
        let (support_batch, _) = dataset.gather(&episode.support)?;
        let (query_batch, query_labels) = dataset.gather(&episode.query_set)?;
        let (aux_batch, aux_labels) = dataset.gather(aux_indices)?;

        let support_emb = self.model.encode(&support_batch.view())?;
        let query_emb = self.model.encode(&query_batch.view())?;
        let aux_emb = self.model.encode(&aux_batch.view())?;

        let episodic = self.model.episodic_head(
            &support_emb.view(),
            &query_emb.view(),
            episode.way,
            episode.shot,
        )?;
        let aux_logits = self.model.auxiliary_head(&aux_emb.view())?;

        let class_ranks = episode.query_class_ranks();
        let (losses, head_gradients) = self.composite.evaluate(
            &episodic.prototypes.view(),
            &class_ranks,
            &episodic.instances.view(),
            &query_labels,
            &aux_logits.view(),
            &aux_labels,
        )?;

        let mut gradients = self.model.backward(&head_gradients)?;
        let grad_norm = clip_gradient_norm(&mut gradients, self.config.grad_clip_norm);

        let non_finite = gradients
            .values()
            .any(|grad| grad.iter().any(|v| !v.is_finite()));
        let event = GradientEvent {
            epoch: self.state.epoch,
            step: self.state.step,
            grad_norm,
            non_finite,
        };
        for observer in &mut self.observers {
            observer.observe(&event);
        }
        if non_finite {
            log::warn!(
                "non-finite gradient at epoch {} step {} (norm {:.4}); applying update anyway",
                self.state.epoch,
                self.state.step,
                grad_norm
            );
        }

        self.optimizer.step(self.model.parameters_mut(), &gradients)?;
        self.optimizer.zero_grad();

        Ok(losses)
    }

    /// Train one epoch: pull the episodic and auxiliary streams in
    /// lock-step, one paired item per step.
    pub fn train_epoch(
        &mut self,
        dataset: &InMemoryDataset,
        sampler: &CategoryStratifiedSampler,
        auxiliary: &AuxiliaryBatches,
    ) -> TrainResult<EpochReport> {
        self.model.set_training(true);

        let aux_batches = auxiliary.epoch_batches(&mut self.rng);
        let episodes: Vec<Episode> = sampler.episodes(&mut self.rng).collect();

        let mut loss_meter = RunningMeter::new();
        let mut acc_meter = RunningMeter::new();

        self.state.step = 0;
        for (episode, aux_indices) in episodes.iter().zip(aux_batches.iter()) {
            self.state.step += 1;
            let losses = self
                .train_step(dataset, episode, aux_indices)
                .map_err(|e| e.at_step(self.state.epoch, self.state.step))?;

            loss_meter.update(losses.total);
            acc_meter.update(losses.accuracy);

            log::debug!(
                "epoch {} step {}: loss={:.4} (aux={:.4} inst={:.4} proto={:.4}) acc={:.3}",
                self.state.epoch,
                self.state.step,
                losses.total,
                losses.auxiliary,
                losses.instance,
                losses.prototype,
                losses.accuracy
            );
        }

        let report = EpochReport {
            loss: loss_meter.mean()?,
            accuracy: acc_meter.mean()?,
            confidence_interval: acc_meter.confidence_interval(),
            steps: loss_meter.count(),
        };
        self.state.train_loss = report.loss;
        self.state.train_accuracy = report.accuracy;
        Ok(report)
    }

    /// Run inference over a fixed, pre-materialized episode sequence.
    ///
    /// No parameter updates; deterministic given a frozen model and the
    /// frozen episodes.
    pub fn evaluate(
        &mut self,
        dataset: &InMemoryDataset,
        episodes: &[Episode],
    ) -> TrainResult<EvaluationReport> {
        self.model.set_training(false);
        let result = self.evaluate_inner(dataset, episodes);
        self.model.set_training(true);
        result
    }

    fn evaluate_inner(
        &mut self,
        dataset: &InMemoryDataset,
        episodes: &[Episode],
    ) -> TrainResult<EvaluationReport> {
        let mut loss_meter = RunningMeter::new();
        let mut acc_meter = RunningMeter::new();

        for episode in episodes {
            let (support_batch, _) = dataset.gather(&episode.support)?;
            let (query_batch, _) = dataset.gather(&episode.query_set)?;

            let support_emb = self.model.encode(&support_batch.view())?;
            let query_emb = self.model.encode(&query_batch.view())?;
            let episodic = self.model.episodic_head(
                &support_emb.view(),
                &query_emb.view(),
                episode.way,
                episode.shot,
            )?;

            let class_ranks = episode.query_class_ranks();
            let (loss, accuracy) = self
                .composite
                .evaluate_episodic(&episodic.prototypes.view(), &class_ranks)?;

            loss_meter.update(loss);
            acc_meter.update(accuracy);
        }

        Ok(EvaluationReport {
            loss: loss_meter.mean()?,
            accuracy: acc_meter.mean()?,
            confidence_interval: acc_meter.confidence_interval(),
        })
    }

    /// Full training run: epoch loop, per-epoch evaluation over a fixed
    /// episode set, telemetry, checkpoint selection and LR scheduling.
    pub fn fit(
        &mut self,
        train_set: &InMemoryDataset,
        val_set: &InMemoryDataset,
        store: &mut dyn CheckpointStore,
    ) -> TrainResult<FitReport> {
        let sampler = CategoryStratifiedSampler::new(
            train_set.label_index(),
            self.config.train_episodes,
            self.config.way,
            self.config.shot,
            self.config.query,
        )?;
        let val_sampler = CategoryStratifiedSampler::new(
            val_set.label_index(),
            self.config.val_episodes,
            self.config.way,
            self.config.shot,
            self.config.query,
        )?;
        let auxiliary = AuxiliaryBatches::new(train_set.num_samples(), self.config.batch_size)?;

        // The evaluation protocol is frozen up front and replayed every
        // epoch, keeping validation variance attributable to the model.
        let val_episodes = val_sampler.materialize(&mut self.rng);

        for epoch in 1..=self.config.max_epoch {
            self.state.epoch = epoch;

            let train_report = self.train_epoch(train_set, &sampler, &auxiliary)?;
            // Step index 0 marks epoch-scope failures in diagnostics.
            let val_report = self
                .evaluate(val_set, &val_episodes)
                .map_err(|e| e.at_step(epoch, 0))?;
            self.state.val_loss = Some(val_report.loss);
            self.state.val_accuracy = Some(val_report.accuracy);

            self.logger.set_step(epoch);
            self.logger.log_scalar("train/loss", train_report.loss)?;
            self.logger.log_scalar("train/acc", train_report.accuracy)?;
            self.logger.log_scalar("val/loss", val_report.loss)?;
            self.logger.log_scalar("val/acc", val_report.accuracy)?;

            let model_snapshot = ModelSnapshot::capture(&self.model, epoch, val_report.accuracy);
            let optimizer_snapshot = OptimizerSnapshot::capture(self.optimizer.as_ref(), epoch);
            let improved = self
                .policy
                .offer(
                    epoch,
                    val_report.accuracy,
                    &model_snapshot,
                    &optimizer_snapshot,
                    store,
                )
                .map_err(|e| e.at_step(epoch, 0))?;
            if improved {
                self.state.best_metric = self.policy.best_metric();
                self.state.best_epoch = self.policy.best_epoch();
                log::info!(
                    "better model found at epoch {} (val acc {:.3})",
                    epoch,
                    val_report.accuracy
                );
            }
            self.policy
                .save_epoch(epoch, &model_snapshot, &optimizer_snapshot, store)
                .map_err(|e| e.at_step(epoch, 0))?;

            self.scheduler.step(self.optimizer.as_mut());
            self.state.learning_rate = self.optimizer.get_lr();

            log::info!(
                "epoch {}/{}: train loss {:.4}, train acc {:.3}, val loss {:.4}, val acc {:.3} (±{:.3}), lr {:.5}",
                epoch,
                self.config.max_epoch,
                train_report.loss,
                train_report.accuracy,
                val_report.loss,
                val_report.accuracy,
                val_report.confidence_interval,
                self.state.learning_rate
            );
        }

        self.logger.flush()?;

        Ok(FitReport {
            epochs: self.config.max_epoch,
            best_epoch: self.policy.best_epoch().unwrap_or(0),
            best_metric: self.policy.best_metric().unwrap_or(0.0),
        })
    }
}
