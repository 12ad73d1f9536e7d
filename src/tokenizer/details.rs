use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use super::word_index::WordTokenizer;
use crate::config::{MAX_SEQUENCE_LENGTH, TOP_K};

/// A fitted tokenizer together with the preprocessing limits it was trained with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerDetails {
    pub tokenizer: WordTokenizer,
    pub top_k: usize,
    pub max_sequence_length: usize,
}

impl TokenizerDetails {
    pub fn new(tokenizer: WordTokenizer, top_k: usize, max_sequence_length: usize) -> Self {
        Self {
            tokenizer,
            top_k,
            max_sequence_length,
        }
    }

    /// Embedding input size: the vocabulary plus the padding index, capped at `top_k`
    pub fn num_features(&self) -> usize {
        (self.tokenizer.vocab_len() + 1).min(self.top_k)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self).context("Failed to serialize tokenizer")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write tokenizer to {}", path.display()))?;
        log::info!("Tokenizer saved to: {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tokenizer from {}", path.display()))?;
        let details: TokenizerDetails =
            serde_json::from_str(&json).context("Failed to parse tokenizer JSON")?;
        log::info!(
            "Loaded tokenizer with {} words (top_k={}, max_sequence_length={})",
            details.tokenizer.vocab_len(),
            details.top_k,
            details.max_sequence_length
        );
        Ok(details)
    }

    /// Dump `word:index` lines for every index below `top_k`
    pub fn write_word_index<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let mut written = 0;
        for (word, index) in self.tokenizer.words() {
            if (index as usize) < self.top_k {
                writeln!(writer, "{}:{}", word, index)?;
                written += 1;
            }
        }
        writer.flush()?;
        Ok(written)
    }
}

impl Default for TokenizerDetails {
    fn default() -> Self {
        Self::new(WordTokenizer::new(Some(TOP_K)), TOP_K, MAX_SEQUENCE_LENGTH)
    }
}
