pub mod callbacks;
pub mod fit;
pub mod optimizer;
pub mod trainer;

pub use callbacks::{Callback, CallbackList, EpochLogs, build_callbacks};
pub use fit::{FitOptions, FitReport, evaluate, fit};
pub use optimizer::{TrainOptimizer, binary_cross_entropy_with_logits};
pub use trainer::{TrainOutcome, Trainer, clean_up, stage_config};
