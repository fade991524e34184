use crate::{config::ChunkIntraConfig, tensor_bundle};

tensor_bundle! {
    /// Inputs of the intra-chunk forward pass, all `[B, H, T, K]` or `[B, T, H, K]`.
    ///
    /// `g` is the inclusive cumulative log-decay, `g_original` the per-step
    /// log-decay it was summed from.
    pub struct DplrInputs[6] { q, k, a, b, g, g_original }
}

tensor_bundle! {
    /// Outputs in the order consumed by the later chunked stages.
    ///
    /// The four matrices swap the feature axis for the chunk column, `BT`
    /// wide; `aab` and `aak` are always f32. The rescaled tensors keep the
    /// input shape and dtype.
    pub struct DplrOutputs[8] { aab, aqk, aak, aqb, qg, kg, ag, bg }
}

/// Marker type for the fused intra-chunk kernel pair.
#[derive(Debug, Clone, Copy)]
pub struct ChunkIntraKernel;

/// Comptime parameters shared by both cube kernels.
#[allow(clippy::struct_excessive_bools)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IntraKernelConfig {
    /// BT
    pub chunk_len: usize,
    /// BC
    pub sub_chunk_len: usize,
    /// NC
    pub num_sub_chunks: usize,
    /// BK, the feature tile of the off-diagonal kernel
    pub key_tile: usize,
    /// K
    pub head_dim: usize,
    /// H
    pub num_heads: usize,
    pub head_first: bool,
    pub use_offsets: bool,
}

impl IntraKernelConfig {
    #[must_use]
    pub fn new(config: &ChunkIntraConfig, num_heads: usize, head_dim: usize) -> Self {
        Self {
            chunk_len: config.sizes.chunk_len,
            sub_chunk_len: config.sizes.sub_chunk_len,
            num_sub_chunks: config.sizes.num_sub_chunks,
            key_tile: config.key_tile,
            head_dim,
            num_heads,
            head_first: config.layout == crate::config::Layout::HeadFirst,
            use_offsets: config.packing.is_some(),
        }
    }

    /// Feature tiles of `key_tile` needed to cover `head_dim`.
    #[must_use]
    pub fn key_tiles(&self) -> usize {
        self.head_dim.div_ceil(self.key_tile)
    }

    /// Strided passes of `sub_chunk_len` lanes needed to cover `width`.
    #[must_use]
    pub fn lane_passes(&self, width: usize) -> usize {
        width.div_ceil(self.sub_chunk_len)
    }
}
