use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear, ops};

use super::layers::{ChannelsFirstEmbedding, SameConv1d, global_average_pool1d, max_pool1d};
use super::{ModelDims, SentimentClassifier};
use crate::config::Architecture;

/// Embedding -> Conv1D(64) -> MaxPool(2) -> Conv1D(128) -> GlobalAvgPool -> Dropout -> Dense(1)
pub struct CnnClassifier {
    embedding: ChannelsFirstEmbedding,
    conv1: SameConv1d,
    conv2: SameConv1d,
    dense: Linear,
    dropout: f32,
}

impl CnnClassifier {
    pub fn new(dims: &ModelDims, vb: VarBuilder) -> Result<Self> {
        log::info!("[CnnClassifier::new] Building CNN model");
        Ok(Self {
            embedding: ChannelsFirstEmbedding::new(dims.num_features, dims.embedding_dim, vb.pp("embedding"))?,
            conv1: SameConv1d::new(dims.embedding_dim, 64, vb.pp("conv1"))?,
            conv2: SameConv1d::new(64, 128, vb.pp("conv2"))?,
            dense: linear(128, 1, vb.pp("dense"))?,
            dropout: 0.2,
        })
    }
}

impl SentimentClassifier for CnnClassifier {
    fn forward_t(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.embedding.forward(ids)?;
        let xs = self.conv1.forward(&xs)?;
        let xs = max_pool1d(&xs, 2)?;
        let xs = self.conv2.forward(&xs)?;
        let mut xs = global_average_pool1d(&xs)?;
        if train {
            xs = ops::dropout(&xs, self.dropout)?;
        }
        self.dense.forward(&xs)?.squeeze(1)
    }

    fn architecture(&self) -> Architecture {
        Architecture::Cnn
    }

    fn layers(&self, dims: &ModelDims) -> Vec<String> {
        let len = dims.max_sequence_length;
        vec![
            format!("embedding        (None, {}, {})", len, dims.embedding_dim),
            format!("conv1d_relu      (None, {}, 64)", len),
            format!("max_pooling1d    (None, {}, 64)", len / 2),
            format!("conv1d_relu      (None, {}, 128)", len / 2),
            "global_avg_pool  (None, 128)".to_string(),
            "dropout(0.2)     (None, 128)".to_string(),
            "dense_sigmoid    (None, 1)".to_string(),
        ]
    }
}
