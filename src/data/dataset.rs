use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Padded token sequences with their binary labels, stored row-major
pub struct SequenceDataset {
    ids: Vec<u32>,
    labels: Vec<f32>,
    seq_len: usize,
    device: Device,
}

impl SequenceDataset {
    /// Build a dataset from sequences already padded to `seq_len`
    pub fn new(sequences: &[Vec<u32>], labels: &[u8], seq_len: usize, device: &Device) -> Result<Self> {
        ensure!(
            sequences.len() == labels.len(),
            "{} sequences but {} labels",
            sequences.len(),
            labels.len()
        );
        let mut ids = Vec::with_capacity(sequences.len() * seq_len);
        for (i, seq) in sequences.iter().enumerate() {
            ensure!(seq.len() == seq_len, "sequence {} has length {}, expected {}", i, seq.len(), seq_len);
            ids.extend_from_slice(seq);
        }

        log::info!("Created dataset with {} samples", labels.len());

        Ok(Self {
            ids,
            labels: labels.iter().map(|&l| f32::from(l)).collect(),
            seq_len,
            device: device.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[f32] {
        &self.labels
    }

    /// Stack the rows at `indices` into `(batch, seq_len)` ids and `(batch,)` labels
    pub fn batch(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        let mut ids = Vec::with_capacity(indices.len() * self.seq_len);
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            ids.extend_from_slice(&self.ids[idx * self.seq_len..(idx + 1) * self.seq_len]);
            labels.push(self.labels[idx]);
        }
        let x = Tensor::from_vec(ids, (indices.len(), self.seq_len), &self.device)?;
        let y = Tensor::from_vec(labels, (indices.len(),), &self.device)?;
        Ok((x, y))
    }

    /// Create a dataloader with the specified batch size
    pub fn dataloader(&self, batch_size: usize, shuffle: bool, seed: u64) -> DataLoader<'_> {
        DataLoader::new(self, batch_size, shuffle, seed)
    }
}

/// Iterates mini-batches over a `SequenceDataset`, optionally capped to a number of steps
pub struct DataLoader<'a> {
    dataset: &'a SequenceDataset,
    batch_size: usize,
    indices: Vec<usize>,
    current_idx: usize,
    shuffle: bool,
    max_steps: Option<usize>,
    steps_taken: usize,
    rng: StdRng,
}

impl<'a> DataLoader<'a> {
    fn new(dataset: &'a SequenceDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            indices: (0..dataset.len()).collect(),
            current_idx: 0,
            shuffle,
            max_steps: None,
            steps_taken: 0,
            rng: StdRng::seed_from_u64(seed),
        };

        if shuffle {
            loader.indices.shuffle(&mut loader.rng);
        }

        loader
    }

    /// Stop each pass after `steps` batches
    pub fn with_max_steps(mut self, steps: Option<usize>) -> Self {
        self.max_steps = steps;
        self
    }

    /// Number of batches yielded per pass
    pub fn len(&self) -> usize {
        let full = self.dataset.len().div_ceil(self.batch_size);
        self.max_steps.map_or(full, |cap| cap.min(full))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewind for the next epoch, reshuffling if enabled
    pub fn reset(&mut self) {
        self.current_idx = 0;
        self.steps_taken = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }
}

impl Iterator for DataLoader<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.indices.len() {
            return None;
        }
        if self.max_steps.is_some_and(|cap| self.steps_taken >= cap) {
            return None;
        }

        let batch_end = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch = self.dataset.batch(&self.indices[self.current_idx..batch_end]);
        self.current_idx = batch_end;
        self.steps_taken += 1;
        Some(batch)
    }
}
