use burn::{
    backend::NdArray,
    tensor::{Tensor, TensorPrimitive, ops::FloatTensor},
};

use crate::{
    blocked::chunk_dplr_fwd_intra_blocked,
    config::ChunkIntraConfig,
    cubecl_kernels::{
        bundle::TensorBundle,
        fwd_intra::{ChunkIntraKernel, DplrInputs, DplrOutputs},
        kernel::FusedKernelBackend,
    },
};

/// CPU fallback: the blocked tensor-op implementation stands in for the
/// fused kernels.
impl FusedKernelBackend<ChunkIntraKernel> for NdArray {
    fn forward(
        inputs: DplrInputs<FloatTensor<Self>>,
        config: ChunkIntraConfig,
    ) -> DplrOutputs<FloatTensor<Self>> {
        let inputs = inputs.map(|t| Tensor::<Self, 4>::from_primitive(TensorPrimitive::Float(t)));
        chunk_dplr_fwd_intra_blocked(inputs, &config).map(|t| t.into_primitive().tensor())
    }
}
