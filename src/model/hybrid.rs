use candle_core::{Result, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, lstm};
use candle_nn::{Linear, Module, VarBuilder, linear, ops};

use super::layers::{ChannelsFirstEmbedding, LSTM_UNITS, SameConv1d, max_pool1d};
use super::lstm::last_hidden;
use super::{ModelDims, SentimentClassifier};
use crate::config::Architecture;

/// Embedding -> Conv1D(64) -> MaxPool(2) -> LSTM(128) -> Dense(1)
pub struct HybridClassifier {
    embedding: ChannelsFirstEmbedding,
    conv: SameConv1d,
    lstm: LSTM,
    dense: Linear,
    recurrent_dropout: f32,
}

impl HybridClassifier {
    pub fn new(dims: &ModelDims, vb: VarBuilder) -> Result<Self> {
        log::info!("[HybridClassifier::new] Building Hybrid model");
        Ok(Self {
            embedding: ChannelsFirstEmbedding::new(dims.num_features, dims.embedding_dim, vb.pp("embedding"))?,
            conv: SameConv1d::new(dims.embedding_dim, 64, vb.pp("conv1"))?,
            lstm: lstm(64, LSTM_UNITS, LSTMConfig::default(), vb.pp("lstm"))?,
            dense: linear(LSTM_UNITS, 1, vb.pp("dense"))?,
            recurrent_dropout: 0.2,
        })
    }
}

impl SentimentClassifier for HybridClassifier {
    fn forward_t(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.embedding.forward(ids)?;
        let xs = self.conv.forward(&xs)?;
        // back to (batch, time, channels) for the recurrent layer
        let xs = max_pool1d(&xs, 2)?.transpose(1, 2)?.contiguous()?;
        let mut h = last_hidden(&self.lstm, &xs)?;
        if train {
            h = ops::dropout(&h, self.recurrent_dropout)?;
        }
        self.dense.forward(&h)?.squeeze(1)
    }

    fn architecture(&self) -> Architecture {
        Architecture::Hybrid
    }

    fn layers(&self, dims: &ModelDims) -> Vec<String> {
        let len = dims.max_sequence_length;
        vec![
            format!("embedding        (None, {}, {})", len, dims.embedding_dim),
            format!("conv1d_relu      (None, {}, 64)", len),
            format!("max_pooling1d    (None, {}, 64)", len / 2),
            format!("lstm             (None, {})", LSTM_UNITS),
            "dense_sigmoid    (None, 1)".to_string(),
        ]
    }
}
