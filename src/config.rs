use candle_core::{Device, Result as CandleResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{Result, SentimentError};

/// Vocabulary cap used when fitting the tokenizer
pub const TOP_K: usize = 20_000;

/// Every sequence is padded or truncated to this many tokens
pub const MAX_SEQUENCE_LENGTH: usize = 500;

/// Suffix of the weight file written at the end of training
pub const MODEL_NAME: &str = "Amazon_Reviews_Analysis.safetensors";

/// Supported network architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Architecture {
    Cnn,
    Lstm,
    Hybrid,
}

impl Architecture {
    /// Shortest sequence the stack can train on. Each same-padded convolution
    /// needs at least 3 steps and the pooling between them halves the length.
    pub fn min_sequence_length(&self) -> usize {
        match self {
            Architecture::Cnn => 6,
            Architecture::Hybrid => 3,
            Architecture::Lstm => 1,
        }
    }
}

impl FromStr for Architecture {
    type Err = SentimentError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "CNN" | "cnn" => Ok(Architecture::Cnn),
            "LSTM" | "lstm" => Ok(Architecture::Lstm),
            "Hybrid" | "hybrid" | "HYBRID" => Ok(Architecture::Hybrid),
            other => Err(SentimentError::UnsupportedModel(other.to_string())),
        }
    }
}

impl TryFrom<String> for Architecture {
    type Error = SentimentError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Architecture> for String {
    fn from(value: Architecture) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::Cnn => write!(f, "CNN"),
            Architecture::Lstm => write!(f, "LSTM"),
            Architecture::Hybrid => write!(f, "Hybrid"),
        }
    }
}

/// Optimizer selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OptimizerKind {
    Adam,
    AdamW,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = SentimentError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(SentimentError::Unsupported {
                kind: "optimizer",
                name: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for OptimizerKind {
    type Error = SentimentError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OptimizerKind> for String {
    fn from(value: OptimizerKind) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerKind::Adam => write!(f, "adam"),
            OptimizerKind::AdamW => write!(f, "adamw"),
            OptimizerKind::Sgd => write!(f, "sgd"),
        }
    }
}

/// Loss function selection. Only binary cross-entropy fits a single sigmoid output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossKind {
    BinaryCrossentropy,
}

impl FromStr for LossKind {
    type Err = SentimentError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binary_crossentropy" | "binarycrossentropy" | "bce" => Ok(LossKind::BinaryCrossentropy),
            other => Err(SentimentError::Unsupported {
                kind: "loss",
                name: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for LossKind {
    type Error = SentimentError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LossKind> for String {
    fn from(value: LossKind) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for LossKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossKind::BinaryCrossentropy => write!(f, "binary_crossentropy"),
        }
    }
}

/// Metrics tracked on every epoch besides the loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricKind {
    Accuracy,
    Precision,
    Recall,
}

impl MetricKind {
    /// Key under which the metric appears in epoch logs
    pub fn key(&self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::Precision => "precision",
            MetricKind::Recall => "recall",
        }
    }
}

impl FromStr for MetricKind {
    type Err = SentimentError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accuracy" | "acc" | "binary_accuracy" => Ok(MetricKind::Accuracy),
            "precision" => Ok(MetricKind::Precision),
            "recall" => Ok(MetricKind::Recall),
            other => Err(SentimentError::Unsupported {
                kind: "metric",
                name: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for MetricKind {
    type Error = SentimentError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricKind> for String {
    fn from(value: MetricKind) -> Self {
        value.key().to_string()
    }
}

/// Training run settings (`train_params`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainParams {
    pub data_dir: String,
    pub output_dir: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default)]
    pub steps_per_epoch: Option<usize>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub use_multiprocessing: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Callback name -> options, in declaration order
    #[serde(default)]
    pub callbacks: serde_yaml::Mapping,
}

/// Network and optimisation settings (`model_params`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: Architecture,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerKind,
    #[serde(default = "default_loss")]
    pub loss: LossKind,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricKind>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

/// Scoring run settings (`predict_params`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictParams {
    pub data_path: String,
    pub result_path: String,
    pub model_path: String,
    pub tokenizer_path: String,
    #[serde(default = "default_predict_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

/// Top-level run configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_train_type")]
    pub train_type: String,
    #[serde(default)]
    pub train_params: Option<TrainParams>,
    #[serde(default)]
    pub model_params: Option<ModelParams>,
    #[serde(default)]
    pub predict_params: Option<PredictParams>,
}

fn default_train_type() -> String {
    "unk".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_predict_batch_size() -> usize {
    64
}
fn default_num_epochs() -> usize {
    10
}
fn default_workers() -> usize {
    1
}
fn default_seed() -> u64 {
    42
}
fn default_top_k() -> usize {
    TOP_K
}
fn default_max_sequence_length() -> usize {
    MAX_SEQUENCE_LENGTH
}
fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_embedding_dim() -> usize {
    128
}
fn default_optimizer() -> OptimizerKind {
    OptimizerKind::Adam
}
fn default_loss() -> LossKind {
    LossKind::BinaryCrossentropy
}
fn default_metrics() -> Vec<MetricKind> {
    vec![MetricKind::Accuracy]
}
fn default_learning_rate() -> f64 {
    1e-3
}

impl Config {
    /// Load a configuration file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SentimentError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(train) = &self.train_params {
            if train.batch_size == 0 {
                return Err(SentimentError::Config("train_params.batch_size must be positive".into()));
            }
            if train.top_k < 2 || train.max_sequence_length == 0 {
                return Err(SentimentError::Config(
                    "train_params.top_k must be at least 2 and max_sequence_length positive".into(),
                ));
            }
            if train.steps_per_epoch == Some(0) {
                return Err(SentimentError::Config("train_params.steps_per_epoch must be positive".into()));
            }
            for key in train.callbacks.keys() {
                if key.as_str().is_none() {
                    return Err(SentimentError::Config(format!(
                        "callback names must be strings, got {:?}",
                        key
                    )));
                }
            }
        }
        if let Some(model) = &self.model_params {
            if model.embedding_dim == 0 {
                return Err(SentimentError::Config("model_params.embedding_dim must be positive".into()));
            }
            if model.learning_rate <= 0.0 {
                return Err(SentimentError::Config("model_params.learning_rate must be positive".into()));
            }
            if let Some(train) = &self.train_params {
                let min = model.model.min_sequence_length();
                if train.max_sequence_length < min {
                    return Err(SentimentError::Config(format!(
                        "{} needs train_params.max_sequence_length of at least {}, got {}",
                        model.model, min, train.max_sequence_length
                    )));
                }
            }
        }
        if let Some(predict) = &self.predict_params {
            if predict.batch_size == 0 {
                return Err(SentimentError::Config("predict_params.batch_size must be positive".into()));
            }
        }
        Ok(())
    }

    pub fn train_params(&self) -> Result<&TrainParams> {
        self.train_params
            .as_ref()
            .ok_or_else(|| SentimentError::Config("missing `train_params` section".into()))
    }

    pub fn model_params(&self) -> Result<&ModelParams> {
        self.model_params
            .as_ref()
            .ok_or_else(|| SentimentError::Config("missing `model_params` section".into()))
    }

    pub fn predict_params(&self) -> Result<&PredictParams> {
        self.predict_params
            .as_ref()
            .ok_or_else(|| SentimentError::Config("missing `predict_params` section".into()))
    }
}

/// Pick the compute device, preferring CUDA when present
pub fn compute_device() -> CandleResult<Device> {
    Device::cuda_if_available(0)
}
