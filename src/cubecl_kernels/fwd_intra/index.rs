//! Addressing shared by the intra-chunk kernels.
//!
//! All tensors are contiguous. Rows are time steps of one head; a task only
//! ever addresses rows of its own sequence, as `bos + t` with `t` local to
//! that sequence.

use cubecl::prelude::*;

use super::types::IntraKernelConfig;

/// Sequence window owned by one chunk task.
#[derive(CubeType)]
pub struct ChunkSpan {
    /// First time step of the owning sequence.
    pub bos: usize,
    pub seq_len: usize,
    /// Chunk index within the sequence.
    pub chunk: usize,
}

/// Resolves grid task `task` of batch `i_b` to its sequence window.
///
/// Packed inputs look the task up in `indices` (`[seq, chunk]` pairs) and
/// the sequence bounds in `offsets`; otherwise every batch entry is one
/// sequence of full length.
#[cube]
pub fn chunk_span<F: Float>(
    q: &Tensor<F>,
    offsets: &Array<u32>,
    indices: &Array<u32>,
    task: usize,
    i_b: usize,
    #[comptime] config: IntraKernelConfig,
) -> ChunkSpan {
    let time_axis = comptime!(if config.head_first { 2usize } else { 1usize });
    let total_len = q.shape(time_axis) as usize;

    let mut bos = 0usize;
    let mut seq_len = total_len;
    let mut chunk = task;

    if comptime!(config.use_offsets) {
        let i_n = indices[task * 2] as usize;
        chunk = indices[task * 2 + 1] as usize;
        bos = offsets[i_n] as usize;
        seq_len = offsets[i_n + 1] as usize - bos;
    } else if comptime!(!config.head_first) {
        bos = i_b * total_len;
    }

    ChunkSpan {
        bos,
        seq_len,
        chunk,
    }
}

/// Flat offset of the first element of row `t` of head `i_bh`.
///
/// `total_len` is the time extent of the tensor and `width` its innermost
/// extent (`K` for inputs, `BT` for the matrices).
#[cube]
pub fn row_offset(
    i_bh: usize,
    bos: usize,
    t: usize,
    total_len: usize,
    #[comptime] width: usize,
    #[comptime] config: IntraKernelConfig,
) -> usize {
    let num_heads = comptime!(config.num_heads);
    let row = if comptime!(config.head_first) {
        i_bh * total_len + bos + t
    } else {
        (bos + t) * num_heads + i_bh % num_heads
    };
    row * width
}
