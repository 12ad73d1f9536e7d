use candle_core::{Result, Tensor};
use candle_nn::rnn::{LSTM, LSTMConfig, RNN, lstm};
use candle_nn::{Embedding, Linear, Module, VarBuilder, embedding, linear, ops};

use super::layers::LSTM_UNITS;
use super::{ModelDims, SentimentClassifier};
use crate::config::Architecture;

/// Run an LSTM over `(batch, seq_len, features)` and return the last hidden state
pub(crate) fn last_hidden(lstm: &LSTM, xs: &Tensor) -> Result<Tensor> {
    let states = lstm.seq(xs)?;
    match states.last() {
        Some(state) => Ok(state.h().clone()),
        None => candle_core::bail!("cannot run an LSTM over an empty sequence"),
    }
}

/// Embedding -> LSTM(128) -> Dense(1)
pub struct LstmClassifier {
    embedding: Embedding,
    lstm: LSTM,
    dense: Linear,
    recurrent_dropout: f32,
}

impl LstmClassifier {
    pub fn new(dims: &ModelDims, vb: VarBuilder) -> Result<Self> {
        log::info!("[LstmClassifier::new] Building LSTM model");
        Ok(Self {
            embedding: embedding(dims.num_features, dims.embedding_dim, vb.pp("embedding"))?,
            lstm: lstm(dims.embedding_dim, LSTM_UNITS, LSTMConfig::default(), vb.pp("lstm"))?,
            dense: linear(LSTM_UNITS, 1, vb.pp("dense"))?,
            recurrent_dropout: 0.2,
        })
    }
}

impl SentimentClassifier for LstmClassifier {
    fn forward_t(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.embedding.forward(ids)?;
        let mut h = last_hidden(&self.lstm, &xs)?;
        if train {
            h = ops::dropout(&h, self.recurrent_dropout)?;
        }
        self.dense.forward(&h)?.squeeze(1)
    }

    fn architecture(&self) -> Architecture {
        Architecture::Lstm
    }

    fn layers(&self, dims: &ModelDims) -> Vec<String> {
        vec![
            format!("embedding        (None, {}, {})", dims.max_sequence_length, dims.embedding_dim),
            format!("lstm             (None, {})", LSTM_UNITS),
            "dense_sigmoid    (None, 1)".to_string(),
        ]
    }
}
