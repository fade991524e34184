use burn::config::Config;

use crate::{
    error::{self, DplrError},
    varlen::SeqPacking,
};

/// Axis order of the `[_, _, _, K]` input tensors.
#[allow(clippy::expl_impl_clone_on_copy)]
#[derive(Config, Debug, PartialEq, Eq, Copy)]
pub enum Layout {
    /// `[B, H, T, K]`
    HeadFirst,
    /// `[B, T, H, K]`
    TimeFirst,
}

impl Layout {
    /// Splits a 4D input shape into `(batch, heads, seq_len, dim)`.
    #[must_use]
    pub fn split(self, dims: [usize; 4]) -> [usize; 4] {
        match self {
            Layout::HeadFirst => dims,
            Layout::TimeFirst => [dims[0], dims[2], dims[1], dims[3]],
        }
    }

    /// Inverse of [`Layout::split`], with `width` replacing the feature axis.
    #[must_use]
    pub fn join(self, batch: usize, heads: usize, seq_len: usize, width: usize) -> [usize; 4] {
        match self {
            Layout::HeadFirst => [batch, heads, seq_len, width],
            Layout::TimeFirst => [batch, seq_len, heads, width],
        }
    }
}

/// Largest sub-chunk. Four `16 x 64` f32 tiles fill the 16 KiB of shared
/// memory every backend guarantees.
pub const MAX_SUB_CHUNK: usize = 16;

/// User-facing options of the intra-chunk forward pass.
#[derive(Config, Debug)]
pub struct DplrConfig {
    /// Upper bound of the chunk length. Must be a power of two.
    #[config(default = 64)]
    pub chunk_size: usize,
    /// Upper bound of the sub-chunk length, at most [`MAX_SUB_CHUNK`].
    #[config(default = 16)]
    pub sub_chunk_size: usize,
    /// Width of the key tiles staged in shared memory by the off-diagonal kernel.
    #[config(default = 32)]
    pub key_tile: usize,
    #[config(default = "Layout::HeadFirst")]
    pub layout: Layout,
}

/// Tiling derived from the sequence length and [`DplrConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizes {
    /// BT
    pub chunk_len: usize,
    /// BC
    pub sub_chunk_len: usize,
    /// NC
    pub num_sub_chunks: usize,
    /// NT for the unpacked case
    pub num_chunks: usize,
}

impl ChunkSizes {
    /// `BT = min(chunk_size, max(16, next_pow2(T)))`, `BC = min(sub_chunk_size, BT)`.
    #[must_use]
    pub fn derive(seq_len: usize, chunk_size: usize, sub_chunk_size: usize) -> Self {
        let chunk_len = chunk_size.min(seq_len.next_power_of_two().max(16));
        let sub_chunk_len = sub_chunk_size.min(chunk_len);
        Self {
            chunk_len,
            sub_chunk_len,
            num_sub_chunks: chunk_len.div_ceil(sub_chunk_len),
            num_chunks: seq_len.div_ceil(chunk_len),
        }
    }
}

/// Fully resolved launch configuration shared by every execution path.
#[derive(Debug, Clone)]
pub struct ChunkIntraConfig {
    pub scale: f32,
    pub sizes: ChunkSizes,
    pub key_tile: usize,
    pub layout: Layout,
    pub packing: Option<SeqPacking>,
}

impl ChunkIntraConfig {
    /// Number of chunk tasks along the first grid axis.
    #[must_use]
    pub fn num_chunk_tasks(&self) -> usize {
        self.packing
            .as_ref()
            .map_or(self.sizes.num_chunks, SeqPacking::num_chunks)
    }
}

impl DplrConfig {
    /// Checks the tiling options and derives the launch configuration for
    /// inputs of the given shape.
    ///
    /// Chunk indices of `packing` are generated from its offsets when absent.
    pub fn resolve(
        &self,
        dims: [usize; 4],
        scale: f32,
        packing: Option<SeqPacking>,
    ) -> error::Result<ChunkIntraConfig> {
        if !self.chunk_size.is_power_of_two() || self.chunk_size < 2 {
            return Err(DplrError::InvalidChunkSize {
                chunk_size: self.chunk_size,
                reason: "must be a power of two of at least 2".into(),
            });
        }
        if !self.sub_chunk_size.is_power_of_two() || self.sub_chunk_size > MAX_SUB_CHUNK {
            return Err(DplrError::InvalidChunkSize {
                chunk_size: self.sub_chunk_size,
                reason: format!("sub-chunk size must be a power of two of at most {MAX_SUB_CHUNK}"),
            });
        }
        if self.key_tile != 32 && self.key_tile != 64 {
            return Err(DplrError::InvalidKeyTile {
                key_tile: self.key_tile,
            });
        }

        let [batch, _, seq_len, _] = self.layout.split(dims);
        if dims.contains(&0) {
            return Err(DplrError::EmptyInput { dims });
        }

        let sizes = ChunkSizes::derive(seq_len, self.chunk_size, self.sub_chunk_size);

        let packing = match packing {
            Some(packing) => {
                if batch != 1 {
                    return Err(DplrError::PackedBatch {
                        batch,
                        layout: self.layout,
                    });
                }
                Some(packing.validated(seq_len, sizes.chunk_len)?)
            }
            None => None,
        };

        Ok(ChunkIntraConfig {
            scale,
            sizes,
            key_tile: self.key_tile,
            layout: self.layout,
            packing,
        })
    }
}
