pub mod bundle;
pub mod fwd_intra;
pub mod impls;
pub mod kernel;

pub use bundle::TensorBundle;
pub use fwd_intra::{
    ChunkIntraKernel, DplrBackend, DplrInputs, DplrOutputs, chunk_dplr_fwd_intra,
    try_chunk_dplr_fwd_intra,
};
pub use kernel::{FusedKernel, FusedKernelBackend};
