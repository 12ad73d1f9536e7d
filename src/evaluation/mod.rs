pub mod metrics;

pub use metrics::{BinaryMetrics, ConfusionMatrix, to_labels};
