//! Chunked intra-chunk attention matrices for the DPLR generalized delta rule.
//!
//! The forward "A" pass splits every chunk of a sequence into sub-chunks and
//! produces the four chunk-local interaction matrices (`Aqk`, `Aqb`, `Aab`,
//! `Aak`) together with the decay-rescaled copies of `q`, `k`, `a` and `b`
//! consumed by the later stages of the chunked algorithm.
//!
//! Two executions are provided:
//! - fused cubecl kernels for `CubeBackend` / `Fusion` backends
//!   ([`cubecl_kernels::chunk_dplr_fwd_intra`]),
//! - a blocked implementation built from burn tensor ops that runs on any
//!   backend ([`blocked::chunk_dplr_fwd_intra_blocked`]).

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(
    clippy::trivially_copy_pass_by_ref,
    reason = "erroneous false positives on #[cube] functions"
)]
#![allow(
    clippy::similar_names,
    clippy::many_single_char_names,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines,
    clippy::type_complexity,
    clippy::module_name_repetitions
)]

pub mod blocked;
pub mod config;
pub mod cubecl_kernels;
pub mod error;
pub mod reference;
pub mod varlen;

pub mod test_utils;

pub use config::{ChunkIntraConfig, ChunkSizes, DplrConfig, Layout};
pub use cubecl_kernels::{
    ChunkIntraKernel, DplrBackend, DplrInputs, DplrOutputs, chunk_dplr_fwd_intra,
    try_chunk_dplr_fwd_intra,
};
pub use error::{DplrError, Result};
pub use varlen::SeqPacking;

#[cfg(not(any(feature = "rocm", feature = "cuda", feature = "wgpu")))]
compile_error!("One of the features 'rocm', 'cuda', or 'wgpu' must be enabled");

#[cfg(all(feature = "rocm", not(feature = "bf16")))]
pub type GpuBackend = burn::backend::Rocm<f32>;
#[cfg(all(feature = "rocm", feature = "bf16"))]
pub type GpuBackend = burn::backend::Rocm<half::bf16>;

#[cfg(all(feature = "cuda", not(feature = "rocm"), not(feature = "bf16")))]
pub type GpuBackend = burn::backend::Cuda<f32>;
#[cfg(all(feature = "cuda", not(feature = "rocm"), feature = "bf16"))]
pub type GpuBackend = burn::backend::Cuda<half::bf16>;

// wgpu doesn't distinguish
#[cfg(all(feature = "wgpu", not(feature = "rocm"), not(feature = "cuda")))]
pub type GpuBackend = burn::backend::Wgpu;

#[cfg(feature = "ndarray")]
pub type CpuBackend = burn::backend::NdArray;
