/// Pad or truncate one sequence to exactly `maxlen` tokens.
///
/// Long sequences keep their last `maxlen` tokens, short ones are
/// left-padded with zeros.
pub fn pad_sequence(seq: &[u32], maxlen: usize) -> Vec<u32> {
    if seq.len() >= maxlen {
        return seq[seq.len() - maxlen..].to_vec();
    }
    let mut padded = vec![0u32; maxlen - seq.len()];
    padded.extend_from_slice(seq);
    padded
}

pub fn pad_sequences(seqs: &[Vec<u32>], maxlen: usize) -> Vec<Vec<u32>> {
    seqs.iter().map(|s| pad_sequence(s, maxlen)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_sequence_is_prepadded() {
        assert_eq!(pad_sequence(&[7, 8], 5), vec![0, 0, 0, 7, 8]);
    }

    #[test]
    fn test_long_sequence_keeps_tail() {
        assert_eq!(pad_sequence(&[1, 2, 3, 4, 5], 3), vec![3, 4, 5]);
    }

    #[test]
    fn test_empty_sequence() {
        assert_eq!(pad_sequence(&[], 2), vec![0, 0]);
    }

    #[test]
    fn test_batch_lengths_are_fixed() {
        let padded = pad_sequences(&[vec![1], vec![1, 2, 3, 4], vec![]], 3);
        assert!(padded.iter().all(|s| s.len() == 3));
    }
}
