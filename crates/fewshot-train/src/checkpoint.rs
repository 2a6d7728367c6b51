//! Checkpoint snapshots, the persistence seam and the best-model policy.
//!
//! Snapshots are opaque, versioned JSON documents. The policy decides
//! *whether* a save happens; where and how bytes land is the store's
//! responsibility. Store failures surface to the caller and abort the epoch
//! loop rather than silently skipping a checkpoint.

use crate::model::EpisodicModel;
use crate::optimizers::Optimizer;
use crate::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Format version written into every snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A named parameter tensor with its shape preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamTensor {
    /// Rows of the parameter matrix.
    pub rows: usize,
    /// Columns of the parameter matrix.
    pub cols: usize,
    /// Row-major values.
    pub data: Vec<f64>,
}

/// Serialized model state plus the context it was captured in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Snapshot format version.
    pub version: u32,
    /// Epoch the snapshot was taken after.
    pub epoch: usize,
    /// Validation metric associated with the snapshot.
    pub metric: f64,
    /// Named parameter tensors.
    pub parameters: BTreeMap<String, ParamTensor>,
}

impl ModelSnapshot {
    /// Capture a model's current parameters.
    pub fn capture<M: EpisodicModel + ?Sized>(model: &M, epoch: usize, metric: f64) -> Self {
        let parameters = model
            .parameters()
            .iter()
            .map(|(name, param)| {
                (
                    name.clone(),
                    ParamTensor {
                        rows: param.nrows(),
                        cols: param.ncols(),
                        data: param.iter().copied().collect(),
                    },
                )
            })
            .collect();
        Self {
            version: SNAPSHOT_VERSION,
            epoch,
            metric,
            parameters,
        }
    }

    /// Restore the captured parameters into a model.
    pub fn restore<M: EpisodicModel + ?Sized>(&self, model: &mut M) -> TrainResult<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(TrainError::CheckpointError(format!(
                "unsupported snapshot version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        let state: HashMap<String, Vec<f64>> = self
            .parameters
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.data.clone()))
            .collect();
        model.load_state_dict(state)
    }
}

/// Serialized optimizer state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSnapshot {
    /// Snapshot format version.
    pub version: u32,
    /// Epoch the snapshot was taken after.
    pub epoch: usize,
    /// Flattened optimizer state.
    pub state: BTreeMap<String, Vec<f64>>,
}

impl OptimizerSnapshot {
    /// Capture an optimizer's current state.
    pub fn capture(optimizer: &dyn Optimizer, epoch: usize) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            epoch,
            state: optimizer.state_dict().into_iter().collect(),
        }
    }

    /// Restore the captured state into an optimizer.
    pub fn restore(&self, optimizer: &mut dyn Optimizer) {
        optimizer.load_state_dict(self.state.clone().into_iter().collect());
    }
}

/// Persistence seam for checkpoint blobs, addressed by tag.
pub trait CheckpointStore {
    /// Persist a model snapshot under `tag`.
    fn save_model(&mut self, tag: &str, snapshot: &ModelSnapshot) -> TrainResult<()>;

    /// Persist an optimizer snapshot under `tag`.
    fn save_optimizer(&mut self, tag: &str, snapshot: &OptimizerSnapshot) -> TrainResult<()>;
}

/// Stores snapshots as pretty-printed JSON files under one directory:
/// `<tag>.json` for models, `optimizer_<tag>.json` for optimizer state.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    /// Create a store rooted at `dir` (created on first save).
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Directory the store writes into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_json<T: Serialize>(&self, filename: &str, value: &T) -> TrainResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            TrainError::CheckpointError(format!(
                "failed to create checkpoint directory {:?}: {}",
                self.dir, e
            ))
        })?;
        let json = serde_json::to_string_pretty(value).map_err(|e| {
            TrainError::CheckpointError(format!("failed to serialize checkpoint: {}", e))
        })?;
        let path = self.dir.join(filename);
        fs::write(&path, json).map_err(|e| {
            TrainError::CheckpointError(format!("failed to write {:?}: {}", path, e))
        })
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, filename: &str) -> TrainResult<T> {
        let path = self.dir.join(filename);
        let json = fs::read_to_string(&path).map_err(|e| {
            TrainError::CheckpointError(format!("failed to read {:?}: {}", path, e))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            TrainError::CheckpointError(format!("failed to parse {:?}: {}", path, e))
        })
    }

    /// Load a model snapshot previously saved under `tag`.
    pub fn load_model(&self, tag: &str) -> TrainResult<ModelSnapshot> {
        self.read_json(&format!("{tag}.json"))
    }

    /// Load an optimizer snapshot previously saved under `tag`.
    pub fn load_optimizer(&self, tag: &str) -> TrainResult<OptimizerSnapshot> {
        self.read_json(&format!("optimizer_{tag}.json"))
    }
}

impl CheckpointStore for DirectoryStore {
    fn save_model(&mut self, tag: &str, snapshot: &ModelSnapshot) -> TrainResult<()> {
        self.write_json(&format!("{tag}.json"), snapshot)?;
        log::info!("checkpoint '{}' saved under {:?}", tag, self.dir);
        Ok(())
    }

    fn save_optimizer(&mut self, tag: &str, snapshot: &OptimizerSnapshot) -> TrainResult<()> {
        self.write_json(&format!("optimizer_{tag}.json"), snapshot)
    }
}

/// Keeps snapshots in memory. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Model snapshots by tag, latest write wins.
    pub models: BTreeMap<String, ModelSnapshot>,
    /// Optimizer snapshots by tag, latest write wins.
    pub optimizers: BTreeMap<String, OptimizerSnapshot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryStore {
    fn save_model(&mut self, tag: &str, snapshot: &ModelSnapshot) -> TrainResult<()> {
        self.models.insert(tag.to_string(), snapshot.clone());
        Ok(())
    }

    fn save_optimizer(&mut self, tag: &str, snapshot: &OptimizerSnapshot) -> TrainResult<()> {
        self.optimizers.insert(tag.to_string(), snapshot.clone());
        Ok(())
    }
}

/// Tag under which the best-so-far snapshot is persisted.
pub const BEST_TAG: &str = "max_acc";

/// Tracks the best validation metric across epochs and decides when a
/// candidate deserves persistence.
#[derive(Debug, Clone, Default)]
pub struct CheckpointPolicy {
    best: Option<(usize, f64)>,
    save_all: bool,
}

impl CheckpointPolicy {
    /// Create a policy; `save_all` additionally persists every epoch under
    /// an `epoch_{N}` tag regardless of improvement.
    pub fn new(save_all: bool) -> Self {
        Self {
            best: None,
            save_all,
        }
    }

    /// Best metric seen so far, if any epoch has been offered.
    pub fn best_metric(&self) -> Option<f64> {
        self.best.map(|(_, metric)| metric)
    }

    /// Epoch that produced the best metric so far.
    pub fn best_epoch(&self) -> Option<usize> {
        self.best.map(|(epoch, _)| epoch)
    }

    /// Whether per-epoch saving is enabled.
    pub fn save_all(&self) -> bool {
        self.save_all
    }

    /// Offer a candidate metric for `epoch`.
    ///
    /// Strict improvement (ties do not trigger) updates the best record and
    /// persists the snapshots under [`BEST_TAG`]; the first offer always
    /// improves from the unset baseline. Returns whether the candidate won.
    pub fn offer(
        &mut self,
        epoch: usize,
        metric: f64,
        model: &ModelSnapshot,
        optimizer: &OptimizerSnapshot,
        store: &mut dyn CheckpointStore,
    ) -> TrainResult<bool> {
        let improved = self.best.is_none_or(|(_, best)| metric > best);
        if improved {
            self.best = Some((epoch, metric));
            store.save_model(BEST_TAG, model)?;
            store.save_optimizer(BEST_TAG, optimizer)?;
        }
        Ok(improved)
    }

    /// Persist the per-epoch snapshots when `save_all` is enabled.
    pub fn save_epoch(
        &self,
        epoch: usize,
        model: &ModelSnapshot,
        optimizer: &OptimizerSnapshot,
        store: &mut dyn CheckpointStore,
    ) -> TrainResult<()> {
        if self.save_all {
            let tag = format!("epoch_{epoch}");
            store.save_model(&tag, model)?;
            store.save_optimizer(&tag, optimizer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EpisodicModel, PrototypeClassifier};
    use crate::optimizers::{OptimizerConfig, SgdOptimizer};

    fn snapshots(epoch: usize, metric: f64) -> (ModelSnapshot, OptimizerSnapshot) {
        let model = PrototypeClassifier::new(3, 2, 4, 5).unwrap();
        let optimizer = SgdOptimizer::new(OptimizerConfig::default());
        (
            ModelSnapshot::capture(&model, epoch, metric),
            OptimizerSnapshot::capture(&optimizer, epoch),
        )
    }

    #[test]
    fn test_offer_strict_improvement_sequence() {
        let mut policy = CheckpointPolicy::new(false);
        let mut store = MemoryStore::new();

        let (m, o) = snapshots(1, 0.50);
        assert!(policy.offer(1, 0.50, &m, &o, &mut store).unwrap());

        let (m, o) = snapshots(2, 0.50);
        assert!(!policy.offer(2, 0.50, &m, &o, &mut store).unwrap());

        let (m, o) = snapshots(3, 0.51);
        assert!(policy.offer(3, 0.51, &m, &o, &mut store).unwrap());

        assert_eq!(policy.best_epoch(), Some(3));
        assert_eq!(policy.best_metric(), Some(0.51));
        assert_eq!(store.models[BEST_TAG].epoch, 3);
    }

    #[test]
    fn test_save_all_writes_epoch_tags() {
        let policy = CheckpointPolicy::new(true);
        let mut store = MemoryStore::new();

        for epoch in 1..=3 {
            let (m, o) = snapshots(epoch, 0.1);
            policy.save_epoch(epoch, &m, &o, &mut store).unwrap();
        }

        assert!(store.models.contains_key("epoch_1"));
        assert!(store.models.contains_key("epoch_3"));
        assert!(store.optimizers.contains_key("epoch_2"));
    }

    #[test]
    fn test_save_epoch_noop_without_save_all() {
        let policy = CheckpointPolicy::new(false);
        let mut store = MemoryStore::new();
        let (m, o) = snapshots(1, 0.1);
        policy.save_epoch(1, &m, &o, &mut store).unwrap();
        assert!(store.models.is_empty());
    }

    #[test]
    fn test_directory_store_round_trip() {
        let dir = std::env::temp_dir().join(format!(
            "fewshot-train-ckpt-{}-{}",
            std::process::id(),
            line!()
        ));
        let mut store = DirectoryStore::new(&dir);

        let (m, o) = snapshots(4, 0.73);
        store.save_model("max_acc", &m).unwrap();
        store.save_optimizer("max_acc", &o).unwrap();

        let loaded = store.load_model("max_acc").unwrap();
        assert_eq!(loaded.epoch, 4);
        assert_eq!(loaded.metric, 0.73);
        assert_eq!(loaded.parameters.len(), m.parameters.len());
        let tensor = loaded.parameters.values().next().unwrap();
        assert_eq!(tensor.data.len(), tensor.rows * tensor.cols);

        let loaded_opt = store.load_optimizer("max_acc").unwrap();
        assert_eq!(loaded_opt.epoch, 4);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_snapshot_restores_parameters() {
        let mut source = PrototypeClassifier::new(3, 2, 4, 5).unwrap();
        let mut target = PrototypeClassifier::new(3, 2, 4, 99).unwrap();

        // Perturb the source so the two models differ.
        for param in source.parameters_mut().values_mut() {
            param.mapv_inplace(|v| v + 1.0);
        }

        let snapshot = ModelSnapshot::capture(&source, 1, 0.5);
        snapshot.restore(&mut target).unwrap();

        for (name, param) in target.parameters() {
            assert_eq!(param, &source.parameters()[name]);
        }
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut model = PrototypeClassifier::new(3, 2, 4, 5).unwrap();
        let mut snapshot = ModelSnapshot::capture(&model, 1, 0.5);
        snapshot.version = SNAPSHOT_VERSION + 1;
        assert!(snapshot.restore(&mut model).is_err());
    }
}
