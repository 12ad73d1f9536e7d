pub mod details;
pub mod sequence;
pub mod word_index;

pub use details::TokenizerDetails;
pub use sequence::{pad_sequence, pad_sequences};
pub use word_index::WordTokenizer;
