pub mod cnn;
pub mod hybrid;
pub mod layers;
pub mod lstm;

use candle_core::{Result, Tensor, bail};
use candle_nn::{VarBuilder, VarMap, ops};
use serde::{Deserialize, Serialize};

pub use crate::config::Architecture;
pub use cnn::CnnClassifier;
pub use hybrid::HybridClassifier;
pub use lstm::LstmClassifier;

/// Shape parameters needed to rebuild a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    pub num_features: usize,
    pub max_sequence_length: usize,
    pub embedding_dim: usize,
}

/// A binary text classifier over padded token sequences
pub trait SentimentClassifier {
    /// Logits of shape `(batch,)` for ids of shape `(batch, seq_len)`
    fn forward_t(&self, ids: &Tensor, train: bool) -> Result<Tensor>;

    fn architecture(&self) -> Architecture;

    /// One line per layer with its output shape
    fn layers(&self, dims: &ModelDims) -> Vec<String>;

    /// Positive-class probabilities of shape `(batch,)`
    fn predict_proba(&self, ids: &Tensor) -> Result<Tensor> {
        ops::sigmoid(&self.forward_t(ids, false)?)
    }
}

/// Build the network for `architecture`, registering its variables in `vb`
pub fn build(
    architecture: Architecture,
    dims: &ModelDims,
    vb: VarBuilder,
) -> Result<Box<dyn SentimentClassifier>> {
    let min = architecture.min_sequence_length();
    if dims.max_sequence_length < min {
        bail!(
            "{} needs max_sequence_length of at least {}, got {}",
            architecture,
            min,
            dims.max_sequence_length
        );
    }
    let model: Box<dyn SentimentClassifier> = match architecture {
        Architecture::Cnn => Box::new(CnnClassifier::new(dims, vb)?),
        Architecture::Lstm => Box::new(LstmClassifier::new(dims, vb)?),
        Architecture::Hybrid => Box::new(HybridClassifier::new(dims, vb)?),
    };
    Ok(model)
}

/// Total number of trainable scalars held by `varmap`
pub fn parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Log a layer table followed by the trainable parameter count
pub fn log_summary(model: &dyn SentimentClassifier, dims: &ModelDims, varmap: &VarMap) {
    log::info!("Model: {}", model.architecture());
    for line in model.layers(dims) {
        log::info!("  {}", line);
    }
    log::info!("Trainable params: {}", parameter_count(varmap));
}
