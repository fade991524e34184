//! Tensor-level entry points.

use burn::tensor::{Tensor, TensorPrimitive};
use tracing::debug;

use super::types::{ChunkIntraKernel, DplrInputs, DplrOutputs};
use crate::{
    config::{ChunkIntraConfig, DplrConfig},
    cubecl_kernels::{bundle::TensorBundle, kernel::FusedKernelBackend},
    error::{DplrError, Result},
    varlen::SeqPacking,
};

/// Backends that can run the intra-chunk forward pass.
pub trait DplrBackend: FusedKernelBackend<ChunkIntraKernel> {}

impl<B> DplrBackend for B where B: FusedKernelBackend<ChunkIntraKernel> {}

/// Runs the intra-chunk forward pass with an already resolved configuration.
///
/// Inputs are not validated; see [`try_chunk_dplr_fwd_intra`].
pub fn chunk_dplr_fwd_intra<B: DplrBackend>(
    inputs: DplrInputs<Tensor<B, 4>>,
    config: &ChunkIntraConfig,
) -> DplrOutputs<Tensor<B, 4>> {
    let inputs = inputs.map(|t| t.into_primitive().tensor());
    let outputs = <B as FusedKernelBackend<ChunkIntraKernel>>::forward(inputs, config.clone());
    outputs.map(|t| Tensor::from_primitive(TensorPrimitive::Float(t)))
}

/// Validates the inputs, derives the tiling and runs the forward pass.
///
/// `scale` defaults to `K^-1/2`. `packing` switches to packed
/// variable-length mode, which requires a batch size of one.
pub fn try_chunk_dplr_fwd_intra<B: DplrBackend>(
    inputs: DplrInputs<Tensor<B, 4>>,
    scale: Option<f32>,
    config: &DplrConfig,
    packing: Option<SeqPacking>,
) -> Result<DplrOutputs<Tensor<B, 4>>> {
    let dims = inputs.q.dims();
    let names = ["q", "k", "a", "b", "g", "g_original"];
    for (name, tensor) in names.into_iter().zip(inputs.clone().into_array()) {
        let got = tensor.dims();
        if got != dims {
            return Err(DplrError::ShapeMismatch {
                name,
                expected: dims.to_vec(),
                got: got.to_vec(),
            });
        }
    }

    let head_dim = dims[3];
    let scale = scale.unwrap_or_else(|| (head_dim as f32).powf(-0.5));
    let resolved = config.resolve(dims, scale, packing)?;

    debug!(
        ?dims,
        layout = ?resolved.layout,
        chunk_len = resolved.sizes.chunk_len,
        sub_chunk_len = resolved.sizes.sub_chunk_len,
        num_sub_chunks = resolved.sizes.num_sub_chunks,
        num_tasks = resolved.num_chunk_tasks(),
        packed = resolved.packing.is_some(),
        "chunk_dplr_fwd_intra"
    );

    Ok(chunk_dplr_fwd_intra(inputs, &resolved))
}
