//! Packed variable-length batches.
//!
//! Several sequences of different lengths are concatenated along the time
//! axis of a batch-of-one tensor. `offsets` holds the `N + 1` cumulative
//! boundaries and `indices` enumerates every `(sequence, local chunk)` pair,
//! one entry per chunk task.

use serde::{Deserialize, Serialize};

use crate::error::{DplrError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqPacking {
    pub offsets: Vec<usize>,
    /// `[sequence, chunk within sequence]` per chunk task. Generated from
    /// `offsets` during validation when not supplied.
    pub indices: Option<Vec<[usize; 2]>>,
}

impl SeqPacking {
    #[must_use]
    pub fn new(offsets: Vec<usize>) -> Self {
        Self {
            offsets,
            indices: None,
        }
    }

    #[must_use]
    pub fn with_indices(mut self, indices: Vec<[usize; 2]>) -> Self {
        self.indices = Some(indices);
        self
    }

    /// Builds the packing for sequences of the given lengths.
    #[must_use]
    pub fn from_lengths(lengths: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        offsets.push(0);
        for len in lengths {
            offsets.push(offsets[offsets.len() - 1] + len);
        }
        Self::new(offsets)
    }

    #[must_use]
    pub fn num_seqs(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Number of chunk tasks. Zero until indices exist.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.indices.as_ref().map_or(0, Vec::len)
    }

    /// Offsets and lengths of every sequence.
    pub fn sequences(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.offsets.windows(2).map(|w| (w[0], w[1] - w[0]))
    }

    /// Checks the offsets against the packed length and fills in or checks
    /// the chunk indices for chunks of `chunk_len` steps. Supplied indices
    /// must name every chunk exactly once.
    pub fn validated(mut self, total_len: usize, chunk_len: usize) -> Result<Self> {
        if self.offsets.len() < 2 {
            return Err(DplrError::InvalidOffsets {
                reason: format!("need at least 2 boundaries, got {}", self.offsets.len()),
            });
        }
        if self.offsets[0] != 0 {
            return Err(DplrError::InvalidOffsets {
                reason: format!("first offset must be 0, got {}", self.offsets[0]),
            });
        }
        if let Some(w) = self.offsets.windows(2).find(|w| w[1] < w[0]) {
            return Err(DplrError::InvalidOffsets {
                reason: format!("offsets must be non-decreasing, found {} after {}", w[1], w[0]),
            });
        }
        let last = self.offsets[self.offsets.len() - 1];
        if last != total_len {
            return Err(DplrError::InvalidOffsets {
                reason: format!("last offset {last} does not match packed length {total_len}"),
            });
        }

        if u32::try_from(last).is_err() {
            return Err(DplrError::InvalidOffsets {
                reason: format!("packed length {last} does not fit the u32 device tables"),
            });
        }

        let expected = prepare_chunk_indices(&self.offsets, chunk_len);
        match &self.indices {
            None => self.indices = Some(expected),
            Some(indices) => check_indices(indices, &expected, self.num_seqs())?,
        }
        Ok(self)
    }

    /// Flattened `[seq, chunk, seq, chunk, ...]` table as uploaded to the device.
    /// Every entry is below the last offset, which validation bounds to `u32`.
    #[must_use]
    pub fn index_table(&self) -> Vec<u32> {
        self.indices
            .iter()
            .flatten()
            .flat_map(|&[seq, chunk]| [seq as u32, chunk as u32])
            .collect()
    }

    #[must_use]
    pub fn offset_table(&self) -> Vec<u32> {
        self.offsets.iter().map(|&o| o as u32).collect()
    }
}

/// Caller-supplied indices must list every chunk of every sequence exactly
/// once, in any order. Each listed task is the only writer of its rows.
fn check_indices(indices: &[[usize; 2]], expected: &[[usize; 2]], num_seqs: usize) -> Result<()> {
    let mut seen: Vec<bool> = vec![false; expected.len()];
    for (position, &[seq, chunk]) in indices.iter().enumerate() {
        if seq >= num_seqs {
            return Err(DplrError::InvalidIndices {
                position,
                reason: format!("sequence {seq} out of {num_seqs}"),
            });
        }
        // `expected` is sorted by (sequence, chunk)
        let Ok(slot) = expected.binary_search(&[seq, chunk]) else {
            return Err(DplrError::InvalidIndices {
                position,
                reason: format!("chunk {chunk} out of range for sequence {seq}"),
            });
        };
        if std::mem::replace(&mut seen[slot], true) {
            return Err(DplrError::InvalidIndices {
                position,
                reason: format!("chunk {chunk} of sequence {seq} listed twice"),
            });
        }
    }
    if let Some(missing) = seen.iter().position(|&s| !s) {
        let [seq, chunk] = expected[missing];
        return Err(DplrError::InvalidIndices {
            position: indices.len(),
            reason: format!("chunk {chunk} of sequence {seq} is not listed"),
        });
    }
    Ok(())
}

/// One `[sequence, chunk]` entry per chunk of every sequence, in order.
/// Empty sequences contribute no entries.
#[must_use]
pub fn prepare_chunk_indices(offsets: &[usize], chunk_len: usize) -> Vec<[usize; 2]> {
    offsets
        .windows(2)
        .enumerate()
        .flat_map(|(seq, w)| (0..(w[1] - w[0]).div_ceil(chunk_len)).map(move |c| [seq, c]))
        .collect()
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn chunk_indices_follow_offsets() {
        let indices = prepare_chunk_indices(&[0, 10, 10, 80], 32);
        assert_eq!(indices, vec![[0, 0], [2, 0], [2, 1], [2, 2]]);
    }

    #[test]
    fn generated_indices_upload_as_flat_table() {
        let packing = SeqPacking::from_lengths(&[10, 70]).validated(80, 32).unwrap();
        assert_eq!(packing.num_chunks(), 4);
        assert_eq!(packing.index_table(), vec![0, 0, 1, 0, 1, 1, 1, 2]);
        assert_eq!(packing.offset_table(), vec![0, 10, 80]);
    }

    #[test]
    fn accepts_reordered_indices() {
        let packing = SeqPacking::new(vec![0, 40, 80])
            .with_indices(vec![[1, 1], [0, 0], [1, 0], [0, 1]])
            .validated(80, 32)
            .unwrap();
        assert_eq!(packing.num_chunks(), 4);
    }

    #[test]
    fn rejects_partial_indices() {
        let err = SeqPacking::new(vec![0, 64])
            .with_indices(vec![[0, 1]])
            .validated(64, 32)
            .unwrap_err();
        assert!(matches!(err, DplrError::InvalidIndices { position: 1, .. }), "{err}");
    }

    #[test]
    fn rejects_duplicate_indices() {
        let err = SeqPacking::new(vec![0, 64])
            .with_indices(vec![[0, 0], [0, 1], [0, 0]])
            .validated(64, 32)
            .unwrap_err();
        assert!(matches!(err, DplrError::InvalidIndices { position: 2, .. }), "{err}");
    }

    #[test]
    fn rejects_lengths_past_u32() {
        let total = u32::MAX as usize + 1;
        let err = SeqPacking::new(vec![0, 16, total]).validated(total, 64).unwrap_err();
        assert!(matches!(err, DplrError::InvalidOffsets { .. }), "{err}");
    }

    #[test_case(vec![0] ; "too few boundaries")]
    #[test_case(vec![1, 80] ; "non-zero start")]
    #[test_case(vec![0, 50, 40, 80] ; "decreasing")]
    #[test_case(vec![0, 40, 79] ; "short of total")]
    fn rejects_bad_offsets(offsets: Vec<usize>) {
        let err = SeqPacking::new(offsets).validated(80, 32).unwrap_err();
        assert!(matches!(err, DplrError::InvalidOffsets { .. }), "{err}");
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let err = SeqPacking::new(vec![0, 40, 80])
            .with_indices(vec![[0, 0], [1, 2]])
            .validated(80, 32)
            .unwrap_err();
        assert!(matches!(err, DplrError::InvalidIndices { position: 1, .. }));

        let err = SeqPacking::new(vec![0, 40, 80])
            .with_indices(vec![[2, 0]])
            .validated(80, 32)
            .unwrap_err();
        assert!(matches!(err, DplrError::InvalidIndices { position: 0, .. }));
    }
}
