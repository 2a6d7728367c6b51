//! Dataset access and batch construction.
//!
//! The orchestrator never decodes or augments raw examples; it works against
//! an in-memory pool of feature vectors with integer class labels. This
//! module provides:
//! - `LabelIndex`: class id -> dataset positions, built once per pool
//! - `InMemoryDataset`: feature matrix + labels with indexed gathering
//! - `AuxiliaryBatches`: the uniformly shuffled batch stream that runs
//!   alongside the episodic stream

use crate::{TrainError, TrainResult};
use scirs2_core::ndarray::Array2;
use scirs2_core::random::{Rng, StdRng};

/// Mapping from class identifier to the ordered dataset positions holding
/// examples of that class.
///
/// Built once from a label slice; read-only for the lifetime of any sampler
/// that consumes it.
#[derive(Debug, Clone)]
pub struct LabelIndex {
    positions: Vec<Vec<usize>>,
}

impl LabelIndex {
    /// Build the index from per-example labels.
    ///
    /// Class ids are assumed dense in `0..=max(labels)`; classes with no
    /// examples get an empty position list.
    pub fn from_labels(labels: &[usize]) -> Self {
        let num_classes = labels.iter().max().map(|&m| m + 1).unwrap_or(0);
        let mut positions = vec![Vec::new(); num_classes];
        for (pos, &label) in labels.iter().enumerate() {
            positions[label].push(pos);
        }
        Self { positions }
    }

    /// Number of classes in the index.
    pub fn num_classes(&self) -> usize {
        self.positions.len()
    }

    /// Dataset positions belonging to a class.
    pub fn positions(&self, class: usize) -> &[usize] {
        &self.positions[class]
    }

    /// Per-class example counts.
    pub fn class_counts(&self) -> Vec<usize> {
        self.positions.iter().map(|p| p.len()).collect()
    }
}

/// An in-memory pool of labeled feature vectors.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    features: Array2<f64>,
    labels: Vec<usize>,
    label_index: LabelIndex,
}

impl InMemoryDataset {
    /// Create a dataset from a feature matrix (`n_examples x n_features`)
    /// and per-example class labels.
    pub fn new(features: Array2<f64>, labels: Vec<usize>) -> TrainResult<Self> {
        if features.nrows() != labels.len() {
            return Err(TrainError::DataError(format!(
                "feature rows ({}) must match label count ({})",
                features.nrows(),
                labels.len()
            )));
        }
        let label_index = LabelIndex::from_labels(&labels);
        Ok(Self {
            features,
            labels,
            label_index,
        })
    }

    /// Number of examples in the pool.
    pub fn num_samples(&self) -> usize {
        self.labels.len()
    }

    /// Feature dimensionality.
    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    /// The class -> positions index for this pool.
    pub fn label_index(&self) -> &LabelIndex {
        &self.label_index
    }

    /// Label of the example at `position`.
    pub fn label(&self, position: usize) -> usize {
        self.labels[position]
    }

    /// Gather the examples at `indices` into a batch.
    ///
    /// Row order follows `indices`; labels are the absolute class ids.
    pub fn gather(&self, indices: &[usize]) -> TrainResult<(Array2<f64>, Vec<usize>)> {
        let mut batch = Array2::zeros((indices.len(), self.features.ncols()));
        let mut labels = Vec::with_capacity(indices.len());

        for (row, &idx) in indices.iter().enumerate() {
            if idx >= self.num_samples() {
                return Err(TrainError::DataError(format!(
                    "index {} out of bounds for pool of {} examples",
                    idx,
                    self.num_samples()
                )));
            }
            batch.row_mut(row).assign(&self.features.row(idx));
            labels.push(self.labels[idx]);
        }

        Ok((batch, labels))
    }
}

/// The auxiliary batch stream: one uniformly shuffled pass over the full
/// pool per epoch, chunked at `batch_size` (the final short chunk is kept).
///
/// Produced independently of episodic sampling and consumed in lock-step
/// with it; whichever stream yields fewer items per epoch bounds the epoch.
#[derive(Debug, Clone)]
pub struct AuxiliaryBatches {
    num_samples: usize,
    batch_size: usize,
}

impl AuxiliaryBatches {
    /// Create the stream description for a pool of `num_samples` examples.
    pub fn new(num_samples: usize, batch_size: usize) -> TrainResult<Self> {
        if batch_size == 0 {
            return Err(TrainError::InvalidParameter(
                "auxiliary batch_size must be greater than 0".to_string(),
            ));
        }
        if num_samples == 0 {
            return Err(TrainError::InvalidParameter(
                "auxiliary stream needs a non-empty pool".to_string(),
            ));
        }
        Ok(Self {
            num_samples,
            batch_size,
        })
    }

    /// Batches produced per epoch.
    pub fn num_batches(&self) -> usize {
        self.num_samples.div_ceil(self.batch_size)
    }

    /// One epoch worth of index batches, freshly shuffled from `rng`.
    pub fn epoch_batches(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.num_samples).collect();
        for i in (1..indices.len()).rev() {
            let j = rng.gen_range(0..=i);
            indices.swap(i, j);
        }
        indices
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}
