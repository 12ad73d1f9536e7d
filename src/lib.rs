pub mod config;
pub mod data;
pub mod evaluation;
pub mod inference;
pub mod io;
pub mod model;
pub mod tokenizer;
pub mod training;

pub use config::{Config, ModelParams, PredictParams, TrainParams};
pub use inference::Predictor;
pub use model::{Architecture, SentimentClassifier};
pub use tokenizer::{TokenizerDetails, WordTokenizer};
pub use training::Trainer;

/// Custom error type for the sentiment pipeline
#[derive(thiserror::Error, Debug)]
pub enum SentimentError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("{0} model is currently not supported. Please choose between CNN, LSTM and Hybrid")]
    UnsupportedModel(String),

    #[error("Unsupported {kind}: {name}")]
    Unsupported { kind: &'static str, name: String },

    #[error("Data error: {0}")]
    Data(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, SentimentError>;
