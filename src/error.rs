use thiserror::Error;

use crate::config::Layout;

pub type Result<T> = std::result::Result<T, DplrError>;

/// Argument errors reported by the checked entry points.
///
/// The fused kernels themselves do not validate anything; these are raised
/// before any device work is scheduled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DplrError {
    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid chunk size {chunk_size}: {reason}")]
    InvalidChunkSize { chunk_size: usize, reason: String },

    #[error("invalid key tile {key_tile}: must be 32 or 64")]
    InvalidKeyTile { key_tile: usize },

    #[error("invalid offsets: {reason}")]
    InvalidOffsets { reason: String },

    #[error("invalid chunk index {position}: {reason}")]
    InvalidIndices { position: usize, reason: String },

    #[error("packed sequences require batch size 1, got {batch} ({layout:?} layout)")]
    PackedBatch { batch: usize, layout: Layout },

    #[error("empty input: {dims:?}")]
    EmptyInput { dims: [usize; 4] },
}
