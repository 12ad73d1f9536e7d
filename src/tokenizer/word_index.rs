use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Characters stripped from text before splitting into words
pub const DEFAULT_FILTERS: &str = "!\"#$%&()*+,-./:;<=>?@[\\]^_`{|}~\t\n";

/// Frequency-ranked word tokenizer.
///
/// Indices start at 1 (0 is reserved for padding) and are assigned by
/// descending word count; words with equal counts keep the order in which
/// they were first seen. When `num_words` is set, only indices strictly
/// below it survive conversion to sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "VocabularySnapshot", into = "VocabularySnapshot")]
pub struct WordTokenizer {
    num_words: Option<usize>,
    word_counts: Vec<(String, usize)>,
    positions: HashMap<String, usize>,
    word_index: HashMap<String, u32>,
    index_word: Vec<String>,
}

/// On-disk form: counts in first-seen order, everything else is derived
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VocabularySnapshot {
    num_words: Option<usize>,
    word_counts: Vec<(String, usize)>,
}

impl From<VocabularySnapshot> for WordTokenizer {
    fn from(snapshot: VocabularySnapshot) -> Self {
        let mut tokenizer = WordTokenizer::new(snapshot.num_words);
        for (word, count) in snapshot.word_counts {
            tokenizer.add_count(word, count);
        }
        tokenizer.rebuild_index();
        tokenizer
    }
}

impl From<WordTokenizer> for VocabularySnapshot {
    fn from(tokenizer: WordTokenizer) -> Self {
        Self {
            num_words: tokenizer.num_words,
            word_counts: tokenizer.word_counts,
        }
    }
}

impl WordTokenizer {
    pub fn new(num_words: Option<usize>) -> Self {
        Self {
            num_words,
            word_counts: Vec::new(),
            positions: HashMap::new(),
            word_index: HashMap::new(),
            index_word: Vec::new(),
        }
    }

    /// Update word counts from `texts` and re-rank the vocabulary
    pub fn fit_on_texts<S: AsRef<str>>(&mut self, texts: &[S]) {
        for text in texts {
            for word in split_words(text.as_ref()) {
                self.add_count(word, 1);
            }
        }
        self.rebuild_index();
    }

    fn add_count(&mut self, word: String, count: usize) {
        match self.positions.get(&word) {
            Some(&pos) => self.word_counts[pos].1 += count,
            None => {
                self.positions.insert(word.clone(), self.word_counts.len());
                self.word_counts.push((word, count));
            }
        }
    }

    fn rebuild_index(&mut self) {
        let mut order: Vec<usize> = (0..self.word_counts.len()).collect();
        // stable: ties stay in first-seen order
        order.sort_by(|&a, &b| self.word_counts[b].1.cmp(&self.word_counts[a].1));

        self.index_word = order
            .iter()
            .map(|&pos| self.word_counts[pos].0.clone())
            .collect();
        self.word_index = self
            .index_word
            .iter()
            .enumerate()
            .map(|(i, word)| (word.clone(), (i + 1) as u32))
            .collect();
    }

    /// Convert each text to word indices, dropping unknown and out-of-cap words
    pub fn texts_to_sequences<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Vec<Vec<u32>> {
        texts
            .par_iter()
            .map(|text| self.text_to_sequence(text.as_ref()))
            .collect()
    }

    pub fn text_to_sequence(&self, text: &str) -> Vec<u32> {
        split_words(text)
            .filter_map(|word| self.word_index.get(&word).copied())
            .filter(|&idx| self.num_words.map_or(true, |cap| (idx as usize) < cap))
            .collect()
    }

    pub fn index_of(&self, word: &str) -> Option<u32> {
        self.word_index.get(word).copied()
    }

    pub fn count_of(&self, word: &str) -> Option<usize> {
        self.positions.get(word).map(|&pos| self.word_counts[pos].1)
    }

    /// Words in index order; the word at position `i` has index `i + 1`
    pub fn words(&self) -> impl Iterator<Item = (&str, u32)> {
        self.index_word
            .iter()
            .enumerate()
            .map(|(i, w)| (w.as_str(), (i + 1) as u32))
    }

    /// Number of distinct words seen while fitting
    pub fn vocab_len(&self) -> usize {
        self.index_word.len()
    }
}

/// Lowercase, replace filtered characters with spaces and split
pub fn split_words(text: &str) -> impl Iterator<Item = String> + '_ {
    let cleaned: String = text
        .chars()
        .flat_map(|c| c.to_lowercase())
        .map(|c| if DEFAULT_FILTERS.contains(c) { ' ' } else { c })
        .collect();
    cleaned
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter()
}
