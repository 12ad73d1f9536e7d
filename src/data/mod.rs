pub mod archive;
pub mod corpus;
pub mod dataset;

pub use archive::{SplitFiles, extract_zip};
pub use corpus::LabeledCorpus;
pub use dataset::{DataLoader, SequenceDataset};
