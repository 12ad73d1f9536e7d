pub mod predictor;

pub use predictor::{PredictionRun, Predictor};
