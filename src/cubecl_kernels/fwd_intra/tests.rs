//! Fused kernels against the f64 oracle and the blocked implementation.
//!
//! These need a GPU adapter and only run with `--features gpu-tests`.

use test_case::test_case;

use super::{DplrOutputs, try_chunk_dplr_fwd_intra};
use crate::{
    GpuBackend,
    blocked::chunk_dplr_fwd_intra_blocked,
    cubecl_kernels::TensorBundle,
    config::{DplrConfig, Layout},
    test_utils::*,
    varlen::SeqPacking,
};

type B = GpuBackend;

// bf16 builds compare with looser bounds.
#[cfg(feature = "bf16")]
const TOL: (f32, f32) = (5e-2, 5e-2);
#[cfg(not(feature = "bf16"))]
const TOL: (f32, f32) = (RTOL, ATOL);

fn check_against_oracle(
    name: &str,
    out: DplrOutputs<burn::tensor::Tensor<B, 4>>,
    oracle: &HostOutputs,
    layout: Layout,
) {
    let (rtol, atol) = TOL;
    let pairs = [
        ("aqk", out.aqk, &oracle.aqk),
        ("aqb", out.aqb, &oracle.aqb),
        ("aab", out.aab, &oracle.aab),
        ("aak", out.aak, &oracle.aak),
        ("qg", out.qg, &oracle.qg),
        ("kg", out.kg, &oracle.kg),
        ("ag", out.ag, &oracle.ag),
        ("bg", out.bg, &oracle.bg),
    ];
    for (field, tensor, expected) in pairs {
        assert_data_close(
            &head_first_values(tensor, layout),
            &to_f32(expected),
            rtol,
            atol,
            &format!("{name}/{field}"),
        );
    }
}

#[test_case(1, 2, 64, 32, 64, Layout::HeadFirst ; "one chunk head first")]
#[test_case(2, 2, 128, 64, 64, Layout::HeadFirst ; "two chunks")]
#[test_case(2, 3, 128, 32, 32, Layout::TimeFirst ; "time first")]
#[test_case(1, 2, 50, 32, 32, Layout::HeadFirst ; "ragged tail")]
#[test_case(1, 1, 4, 8, 64, Layout::HeadFirst ; "shorter than sub chunk")]
#[test_case(1, 2, 96, 48, 64, Layout::TimeFirst ; "feature dim not a tile multiple")]
#[cfg_attr(not(feature = "gpu-tests"), ignore)]
fn fused_matches_oracle(
    batch: usize,
    heads: usize,
    seq_len: usize,
    dim: usize,
    chunk: usize,
    layout: Layout,
) {
    let device = Default::default();
    let dims = HostDims::new(batch, heads, seq_len, dim);
    let host = HostInputs::random(dims, 42);
    let config = DplrConfig::new().with_chunk_size(chunk).with_layout(layout);

    let out = try_chunk_dplr_fwd_intra::<B>(host.to_tensors(layout, &device), None, &config, None)
        .unwrap();
    let chunk_len = out.aqk.dims()[3];
    let oracle = host.oracle(dims.scale(), chunk_len, None);
    check_against_oracle("fused", out, &oracle, layout);
}

#[test_case(32 ; "narrow key tile")]
#[test_case(64 ; "wide key tile")]
#[cfg_attr(not(feature = "gpu-tests"), ignore)]
fn key_tile_does_not_change_results(key_tile: usize) {
    let device = Default::default();
    let dims = HostDims::new(1, 2, 128, 80);
    let host = HostInputs::random(dims, 5);
    let config = DplrConfig::new().with_key_tile(key_tile);

    let out = try_chunk_dplr_fwd_intra::<B>(
        host.to_tensors(Layout::HeadFirst, &device),
        Some(0.25),
        &config,
        None,
    )
    .unwrap();
    let oracle = host.oracle(0.25, 64, None);
    check_against_oracle("key tile", out, &oracle, Layout::HeadFirst);
}

#[test_case(Layout::TimeFirst ; "time first")]
#[test_case(Layout::HeadFirst ; "head first")]
#[cfg_attr(not(feature = "gpu-tests"), ignore)]
fn fused_packed_matches_oracle(layout: Layout) {
    let device = Default::default();
    let lengths = [17, 64, 5, 90];
    let total = lengths.iter().sum();
    let dims = HostDims::new(1, 2, total, 32);
    let host = HostInputs::random(dims, 9);
    let packing = SeqPacking::from_lengths(&lengths);
    let offsets = packing.offsets.clone();
    let config = DplrConfig::new().with_chunk_size(32).with_layout(layout);

    let out = try_chunk_dplr_fwd_intra::<B>(
        host.to_tensors(layout, &device),
        None,
        &config,
        Some(packing),
    )
    .unwrap();
    let oracle = host.oracle(dims.scale(), 32, Some(&offsets));
    check_against_oracle("packed", out, &oracle, layout);
}

#[test_case(Layout::TimeFirst ; "time first")]
#[test_case(Layout::HeadFirst ; "head first")]
#[cfg_attr(not(feature = "gpu-tests"), ignore)]
fn fused_packed_accepts_any_task_order(layout: Layout) {
    let device = Default::default();
    let lengths = [40, 24];
    let dims = HostDims::new(1, 3, 64, 32);
    let host = HostInputs::random(dims, 13);
    let packing =
        SeqPacking::from_lengths(&lengths).with_indices(vec![[1, 0], [0, 1], [0, 0]]);
    let offsets = packing.offsets.clone();
    let config = DplrConfig::new().with_chunk_size(32).with_layout(layout);

    let out = try_chunk_dplr_fwd_intra::<B>(
        host.to_tensors(layout, &device),
        None,
        &config,
        Some(packing),
    )
    .unwrap();
    let oracle = host.oracle(dims.scale(), 32, Some(&offsets));
    check_against_oracle("reordered", out, &oracle, layout);
}

#[test]
#[cfg_attr(not(feature = "gpu-tests"), ignore)]
fn fused_matches_blocked() {
    let device = Default::default();
    let dims = HostDims::new(2, 2, 200, 64);
    let host = HostInputs::random(dims, 1);
    let config = DplrConfig::new()
        .resolve(dims.shape(Layout::HeadFirst), dims.scale(), None)
        .unwrap();

    let fused = super::chunk_dplr_fwd_intra::<B>(host.to_tensors(Layout::HeadFirst, &device), &config);
    let blocked =
        chunk_dplr_fwd_intra_blocked::<B>(host.to_tensors(Layout::HeadFirst, &device), &config);

    let (rtol, atol) = TOL;
    let names = ["aab", "aqk", "aak", "aqb", "qg", "kg", "ag", "bg"];
    for ((name, f), b) in names
        .into_iter()
        .zip(fused.into_array())
        .zip(blocked.into_array())
    {
        assert_data_close(
            &head_first_values(f, Layout::HeadFirst),
            &head_first_values(b, Layout::HeadFirst),
            rtol,
            atol,
            name,
        );
    }
}

#[test]
#[cfg_attr(not(feature = "gpu-tests"), ignore)]
fn matrices_ignore_absolute_decay() {
    let device = Default::default();
    let dims = HostDims::new(1, 2, 128, 32);
    let host = HostInputs::random(dims, 21);
    let shifted = host.clone().with_decay_shift(-60.0);
    let config = DplrConfig::new();

    let run = |inputs: &HostInputs| {
        try_chunk_dplr_fwd_intra::<B>(inputs.to_tensors(Layout::HeadFirst, &device), None, &config, None)
            .unwrap()
    };
    let base = run(&host);
    let moved = run(&shifted);

    let (rtol, atol) = TOL;
    for (name, x, y) in [
        ("aqk", base.aqk, moved.aqk),
        ("aab", base.aab, moved.aab),
        ("kg", base.kg, moved.kg),
    ] {
        assert_data_close(
            &head_first_values(y, Layout::HeadFirst),
            &head_first_values(x, Layout::HeadFirst),
            rtol,
            atol * 10.0,
            name,
        );
    }
}
