//! Model collaborator interface for episodic training.
//!
//! The orchestrator never inspects a network's internals. It drives a model
//! through three explicit operations — `encode`, `episodic_head`,
//! `auxiliary_head` — plus one `backward` that maps logit-space gradients to
//! named parameter gradients. Making the operations explicit (instead of a
//! single entry point gated by a mutable mode field) removes the hazard of a
//! stale mode selector between calls.

use crate::loss::HeadGradients;
use crate::{TrainError, TrainResult};
use scirs2_core::ndarray::{s, Array2, ArrayView2, Axis};
use scirs2_core::random::{Rng, SeedableRng, StdRng};
use std::collections::HashMap;

/// Logit pair produced by the episodic head.
#[derive(Debug, Clone)]
pub struct EpisodicLogits {
    /// Query-vs-prototype logits, `(way * query) x way`; columns follow the
    /// episode's class-rank order.
    pub prototypes: Array2<f64>,
    /// Instance-level logits for the query subset against the absolute
    /// class space, `(way * query) x num_classes`.
    pub instances: Array2<f64>,
}

/// Trait for models trainable by the episodic orchestrator.
///
/// A `backward` call consumes the trace of the immediately preceding
/// forward operations; the trainer never interleaves one step's forward
/// passes with another's.
pub trait EpisodicModel {
    /// Embed a raw feature batch, preserving row order.
    fn encode(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>>;

    /// Produce prototype and instance logits from support and query
    /// embeddings. `support` is class-major with `shot` rows per class.
    fn episodic_head(
        &mut self,
        support: &ArrayView2<f64>,
        query: &ArrayView2<f64>,
        way: usize,
        shot: usize,
    ) -> TrainResult<EpisodicLogits>;

    /// Produce auxiliary classification logits from embeddings.
    fn auxiliary_head(&mut self, embeddings: &ArrayView2<f64>) -> TrainResult<Array2<f64>>;

    /// Map head-logit gradients to gradients of every trainable parameter.
    fn backward(
        &mut self,
        gradients: &HeadGradients,
    ) -> TrainResult<HashMap<String, Array2<f64>>>;

    /// Get a reference to the model's parameters.
    fn parameters(&self) -> &HashMap<String, Array2<f64>>;

    /// Get a mutable reference to the model's parameters.
    fn parameters_mut(&mut self) -> &mut HashMap<String, Array2<f64>>;

    /// Switch between training and inference behavior. Default: no-op.
    fn set_training(&mut self, training: bool) {
        let _ = training;
    }

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().values().map(|p| p.len()).sum()
    }

    /// Flatten parameters for checkpointing.
    fn state_dict(&self) -> HashMap<String, Vec<f64>> {
        self.parameters()
            .iter()
            .map(|(name, param)| (name.clone(), param.iter().copied().collect()))
            .collect()
    }

    /// Restore parameters from a flattened state dictionary.
    fn load_state_dict(&mut self, state: HashMap<String, Vec<f64>>) -> TrainResult<()> {
        let parameters = self.parameters_mut();
        for (name, values) in state {
            let param = parameters.get_mut(&name).ok_or_else(|| {
                TrainError::InvalidParameter(format!("parameter '{name}' not found in model"))
            })?;
            if param.len() != values.len() {
                return Err(TrainError::InvalidParameter(format!(
                    "parameter '{}' size mismatch: expected {}, got {}",
                    name,
                    param.len(),
                    values.len()
                )));
            }
            for (p, v) in param.iter_mut().zip(values.iter()) {
                *p = *v;
            }
        }
        Ok(())
    }
}

const INSTANCE_HEAD: &str = "instance_head.weight";
const AUXILIARY_HEAD: &str = "auxiliary_head.weight";

struct ForwardTrace {
    query_embeddings: Array2<f64>,
    auxiliary_embeddings: Option<Array2<f64>>,
}

/// Reference model: a frozen random-projection encoder, a metric-based
/// prototype head (negative squared Euclidean distance to class-mean
/// prototypes) and two trainable linear heads over the absolute class space.
///
/// Small enough to train on the CPU in tests while exercising the full
/// orchestrator surface.
pub struct PrototypeClassifier {
    projection: Array2<f64>,
    parameters: HashMap<String, Array2<f64>>,
    embed_dim: usize,
    num_classes: usize,
    trace: Option<ForwardTrace>,
    training: bool,
}

impl PrototypeClassifier {
    /// Create a classifier for `input_dim`-dimensional features embedded
    /// into `embed_dim` dimensions, classifying over `num_classes` absolute
    /// classes. The projection is drawn once from `seed` and then frozen.
    pub fn new(
        input_dim: usize,
        embed_dim: usize,
        num_classes: usize,
        seed: u64,
    ) -> TrainResult<Self> {
        if input_dim == 0 || embed_dim == 0 || num_classes == 0 {
            return Err(TrainError::InvalidParameter(
                "input_dim, embed_dim and num_classes must all be greater than 0".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let scale = (1.0 / input_dim as f64).sqrt();
        let projection =
            Array2::from_shape_fn((input_dim, embed_dim), |_| rng.gen_range(-scale..scale));

        let head_scale = (1.0 / embed_dim as f64).sqrt();
        let mut parameters = HashMap::new();
        parameters.insert(
            INSTANCE_HEAD.to_string(),
            Array2::from_shape_fn((embed_dim, num_classes), |_| {
                rng.gen_range(-head_scale..head_scale)
            }),
        );
        parameters.insert(
            AUXILIARY_HEAD.to_string(),
            Array2::from_shape_fn((embed_dim, num_classes), |_| {
                rng.gen_range(-head_scale..head_scale)
            }),
        );

        Ok(Self {
            projection,
            parameters,
            embed_dim,
            num_classes,
            trace: None,
            training: true,
        })
    }

    /// Number of absolute classes the linear heads score.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Whether the model is in training mode.
    pub fn is_training(&self) -> bool {
        self.training
    }

    fn head(&self, name: &str) -> &Array2<f64> {
        &self.parameters[name]
    }
}

impl EpisodicModel for PrototypeClassifier {
    fn encode(&mut self, input: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        if input.ncols() != self.projection.nrows() {
            return Err(TrainError::ModelError(format!(
                "expected {} input features, got {}",
                self.projection.nrows(),
                input.ncols()
            )));
        }
        Ok(input.dot(&self.projection))
    }

    fn episodic_head(
        &mut self,
        support: &ArrayView2<f64>,
        query: &ArrayView2<f64>,
        way: usize,
        shot: usize,
    ) -> TrainResult<EpisodicLogits> {
        if way == 0 || shot == 0 {
            return Err(TrainError::ModelError(
                "episodic head requires way > 0 and shot > 0".to_string(),
            ));
        }
        if support.nrows() != way * shot {
            return Err(TrainError::ModelError(format!(
                "support has {} rows, expected way*shot = {}",
                support.nrows(),
                way * shot
            )));
        }
        if support.ncols() != self.embed_dim || query.ncols() != self.embed_dim {
            return Err(TrainError::ModelError(format!(
                "embeddings must have {} columns",
                self.embed_dim
            )));
        }

        // Class-mean prototypes from the class-major support layout.
        let mut prototypes = Array2::zeros((way, self.embed_dim));
        for rank in 0..way {
            let block = support.slice(s![rank * shot..(rank + 1) * shot, ..]);
            prototypes
                .row_mut(rank)
                .assign(&block.mean_axis(Axis(0)).expect("non-empty support block"));
        }

        // Logit = negative squared Euclidean distance to each prototype.
        let mut prototype_logits = Array2::zeros((query.nrows(), way));
        for (qi, q) in query.rows().into_iter().enumerate() {
            for (rank, p) in prototypes.rows().into_iter().enumerate() {
                let mut dist = 0.0;
                for (a, b) in q.iter().zip(p.iter()) {
                    dist += (a - b) * (a - b);
                }
                prototype_logits[[qi, rank]] = -dist;
            }
        }

        let instances = query.dot(self.head(INSTANCE_HEAD));

        let aux = self.trace.take().and_then(|t| t.auxiliary_embeddings);
        self.trace = Some(ForwardTrace {
            query_embeddings: query.to_owned(),
            auxiliary_embeddings: aux,
        });

        Ok(EpisodicLogits {
            prototypes: prototype_logits,
            instances,
        })
    }

    fn auxiliary_head(&mut self, embeddings: &ArrayView2<f64>) -> TrainResult<Array2<f64>> {
        if embeddings.ncols() != self.embed_dim {
            return Err(TrainError::ModelError(format!(
                "embeddings must have {} columns",
                self.embed_dim
            )));
        }
        let logits = embeddings.dot(self.head(AUXILIARY_HEAD));

        match self.trace.as_mut() {
            Some(trace) => trace.auxiliary_embeddings = Some(embeddings.to_owned()),
            None => {
                self.trace = Some(ForwardTrace {
                    query_embeddings: Array2::zeros((0, self.embed_dim)),
                    auxiliary_embeddings: Some(embeddings.to_owned()),
                })
            }
        }

        Ok(logits)
    }

    fn backward(
        &mut self,
        gradients: &HeadGradients,
    ) -> TrainResult<HashMap<String, Array2<f64>>> {
        let trace = self.trace.take().ok_or_else(|| {
            TrainError::ModelError("backward called without a preceding forward".to_string())
        })?;

        if gradients.instance.nrows() != trace.query_embeddings.nrows() {
            return Err(TrainError::ModelError(format!(
                "instance gradient has {} rows, forward saw {} query embeddings",
                gradients.instance.nrows(),
                trace.query_embeddings.nrows()
            )));
        }

        let mut parameter_grads = HashMap::new();
        parameter_grads.insert(
            INSTANCE_HEAD.to_string(),
            trace.query_embeddings.t().dot(&gradients.instance),
        );

        let aux_embeddings = trace.auxiliary_embeddings.ok_or_else(|| {
            TrainError::ModelError("backward called without an auxiliary forward".to_string())
        })?;
        if gradients.auxiliary.nrows() != aux_embeddings.nrows() {
            return Err(TrainError::ModelError(format!(
                "auxiliary gradient has {} rows, forward saw {} embeddings",
                gradients.auxiliary.nrows(),
                aux_embeddings.nrows()
            )));
        }
        parameter_grads.insert(
            AUXILIARY_HEAD.to_string(),
            aux_embeddings.t().dot(&gradients.auxiliary),
        );

        // The prototype head is metric-based and the encoder is frozen, so
        // the (weighted) prototype gradient terminates here.
        Ok(parameter_grads)
    }

    fn parameters(&self) -> &HashMap<String, Array2<f64>> {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut HashMap<String, Array2<f64>> {
        &mut self.parameters
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.trace = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> PrototypeClassifier {
        PrototypeClassifier::new(4, 3, 6, 17).unwrap()
    }

    #[test]
    fn test_encode_projects_to_embed_dim() {
        let mut m = model();
        let input = Array2::from_shape_fn((5, 4), |(i, j)| (i + j) as f64 * 0.1);
        let emb = m.encode(&input.view()).unwrap();
        assert_eq!(emb.dim(), (5, 3));
    }

    #[test]
    fn test_encode_rejects_wrong_width() {
        let mut m = model();
        let input = Array2::zeros((2, 7));
        assert!(m.encode(&input.view()).is_err());
    }

    #[test]
    fn test_episodic_head_shapes() {
        let mut m = model();
        let support = Array2::from_shape_fn((4, 3), |(i, j)| (i * 3 + j) as f64);
        let query = Array2::from_shape_fn((6, 3), |(i, j)| (i + j) as f64 * 0.5);
        let logits = m.episodic_head(&support.view(), &query.view(), 2, 2).unwrap();
        assert_eq!(logits.prototypes.dim(), (6, 2));
        assert_eq!(logits.instances.dim(), (6, 6));
    }

    #[test]
    fn test_query_on_prototype_scores_own_class_highest() {
        let mut m = model();
        // Two tight clusters; a query at a cluster center must score that
        // prototype highest.
        let support =
            Array2::from_shape_vec((2, 3), vec![1.0, 0.0, 0.0, 0.0, 1.0, 5.0]).unwrap();
        let query = support.clone();
        let logits = m.episodic_head(&support.view(), &query.view(), 2, 1).unwrap();
        assert!(logits.prototypes[[0, 0]] > logits.prototypes[[0, 1]]);
        assert!(logits.prototypes[[1, 1]] > logits.prototypes[[1, 0]]);
    }

    #[test]
    fn test_backward_requires_forward() {
        let mut m = model();
        let grads = HeadGradients {
            prototype: Array2::zeros((1, 2)),
            instance: Array2::zeros((1, 6)),
            auxiliary: Array2::zeros((1, 6)),
        };
        assert!(m.backward(&grads).is_err());
    }

    #[test]
    fn test_backward_produces_head_gradients() {
        let mut m = model();
        let support = Array2::from_shape_fn((2, 3), |(i, j)| (i + j) as f64);
        let query = Array2::from_shape_fn((4, 3), |(i, j)| (i * j) as f64 * 0.2);
        let aux = Array2::from_shape_fn((3, 3), |(i, j)| (i + 2 * j) as f64 * 0.1);

        m.episodic_head(&support.view(), &query.view(), 2, 1).unwrap();
        m.auxiliary_head(&aux.view()).unwrap();

        let grads = HeadGradients {
            prototype: Array2::zeros((4, 2)),
            instance: Array2::from_elem((4, 6), 0.01),
            auxiliary: Array2::from_elem((3, 6), 0.02),
        };
        let param_grads = m.backward(&grads).unwrap();
        assert_eq!(param_grads[INSTANCE_HEAD].dim(), (3, 6));
        assert_eq!(param_grads[AUXILIARY_HEAD].dim(), (3, 6));

        // Trace is consumed: a second backward must fail.
        assert!(m.backward(&grads).is_err());
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut a = model();
        let b = model();
        let dict = b.state_dict();
        a.load_state_dict(dict).unwrap();
        for (name, param) in a.parameters() {
            assert_eq!(param, &b.parameters()[name]);
        }
    }

    #[test]
    fn test_load_state_dict_rejects_unknown_parameter() {
        let mut m = model();
        let mut dict = HashMap::new();
        dict.insert("missing.weight".to_string(), vec![0.0]);
        assert!(m.load_state_dict(dict).is_err());
    }
}
