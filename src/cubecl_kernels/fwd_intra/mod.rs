//! Intra-chunk forward pass ("A" matrices) of the chunked DPLR delta rule.

mod api;
mod diag;
mod index;
mod inter;
mod launch;
mod types;

#[cfg(test)]
mod tests;

pub use api::{DplrBackend, chunk_dplr_fwd_intra, try_chunk_dplr_fwd_intra};
pub use diag::chunk_dplr_sub_intra_kernel;
pub use inter::chunk_dplr_sub_inter_kernel;
pub use launch::forward;
pub use types::{ChunkIntraKernel, DplrInputs, DplrOutputs, IntraKernelConfig};
