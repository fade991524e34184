//! Blocked intra-chunk forward pass built from burn tensor ops.
//!
//! Follows the same two-stage decomposition as the fused kernels, expressed
//! as batched tensor algebra over a `[B, H, NT, NC, BC, K]` view of the
//! (padded) sequence:
//!
//! 1. off-diagonal blocks `(i > j)` with decays taken relative to the anchor
//!    row preceding sub-chunk `i`, contracted by one batched matmul;
//! 2. diagonal blocks, swept column by column with exponents relative to the
//!    column row.
//!
//! Runs on any backend and backs [`DplrBackend`](crate::DplrBackend) on
//! `NdArray`.

use burn::tensor::{FloatDType, Tensor, TensorData, backend::Backend};

use crate::{
    config::{ChunkIntraConfig, Layout},
    cubecl_kernels::{DplrInputs, DplrOutputs, TensorBundle},
};

/// Runs the intra-chunk forward pass for `inputs` in `config.layout`.
///
/// Packed inputs are processed one sequence at a time, so chunks never
/// straddle a sequence boundary. Validated chunk indices name every chunk
/// exactly once, so their order does not matter here.
pub fn chunk_dplr_fwd_intra_blocked<B: Backend>(
    inputs: DplrInputs<Tensor<B, 4>>,
    config: &ChunkIntraConfig,
) -> DplrOutputs<Tensor<B, 4>> {
    let inputs = match config.layout {
        Layout::HeadFirst => inputs,
        Layout::TimeFirst => inputs.map(|t| t.swap_dims(1, 2)),
    };

    let outputs = match &config.packing {
        None => blocked_dense(inputs, config),
        Some(packing) => {
            let parts: Vec<_> = packing
                .sequences()
                .filter(|&(_, len)| len > 0)
                .map(|(bos, len)| {
                    let seq = inputs.clone().map(|t| t.narrow(2, bos, len));
                    blocked_dense(seq, config).into_array()
                })
                .collect();
            let mut columns: [Vec<Tensor<B, 4>>; 8] = Default::default();
            for part in parts {
                for (column, tensor) in columns.iter_mut().zip(part) {
                    column.push(tensor);
                }
            }
            DplrOutputs::from_array(columns.map(|c| Tensor::cat(c, 2)))
        }
    };

    match config.layout {
        Layout::HeadFirst => outputs,
        Layout::TimeFirst => outputs.map(|t| t.swap_dims(1, 2)),
    }
}

/// One unpacked head-first batch `[B, H, T, K]`.
fn blocked_dense<B: Backend>(
    inputs: DplrInputs<Tensor<B, 4>>,
    config: &ChunkIntraConfig,
) -> DplrOutputs<Tensor<B, 4>> {
    let [batch, heads, seq_len, dim] = inputs.q.dims();
    let bt = config.sizes.chunk_len;
    let bc = config.sizes.sub_chunk_len;
    let nc = config.sizes.num_sub_chunks;
    let nt = seq_len.div_ceil(bt);
    let padded = nt * bt;
    let device = inputs.q.device();
    let scale = config.scale;

    let DplrInputs {
        q,
        k,
        a,
        b,
        g,
        g_original,
    } = pad_time(inputs, padded);

    let sub = |t: Tensor<B, 4>| t.reshape([batch, heads, nt, nc, bc, dim]);
    let (q6, k6, a6, b6, g6, go6) = (
        sub(q.clone()),
        sub(k.clone()),
        sub(a.clone()),
        sub(b.clone()),
        sub(g.clone()),
        sub(g_original.clone()),
    );

    let blocks = [batch, heads, nt, nc, nc, bc, bc];
    let (inter_qk, inter_qb, inter_ab, inter_ak) = if nc > 1 {
        inter_blocks(&q6, &k6, &a6, &b6, &g6, &go6, scale)
    } else {
        let zeros = Tensor::<B, 7>::zeros(blocks, &device);
        (zeros.clone(), zeros.clone(), zeros.clone(), zeros)
    };
    let (diag_qk, diag_qb, diag_ab, diag_ak) = diagonal_blocks(&q6, &k6, &a6, &b6, &g6, &go6, scale);

    // [NC, NC] selector of the diagonal blocks
    let eye = pair_mask::<B>(nc, &device, |i, j| i == j).reshape([1, 1, 1, nc, nc, 1, 1]);
    let assemble = |inter: Tensor<B, 7>, diag: Tensor<B, 6>| {
        let diag = diag.unsqueeze_dim::<7>(4).repeat_dim(4, nc) * eye.clone();
        (inter + diag)
            .swap_dims(4, 5)
            .reshape([batch, heads, padded, bt])
            .narrow(2, 0, seq_len)
    };

    let aqk = assemble(inter_qk, diag_qk);
    let aqb = assemble(inter_qb, diag_qb);
    let aab = assemble(inter_ab, diag_ab).cast(FloatDType::F32);
    let aak = assemble(inter_ak, diag_ak).cast(FloatDType::F32);

    // Decay at the last row of each chunk; padding repeats the final valid row.
    let chunks = |t: Tensor<B, 4>| t.reshape([batch, heads, nt, bt, dim]);
    let g5 = chunks(g);
    let g_last = g5.clone().narrow(3, bt - 1, 1);
    let to_decay = (g_last - g5.clone()).exp();
    let unchunk = |t: Tensor<B, 5>| t.reshape([batch, heads, padded, dim]).narrow(2, 0, seq_len);

    let qg = unchunk(chunks(q) * g5.clone().exp() * scale);
    let kg = unchunk(chunks(k) * to_decay.clone());
    let bg = unchunk(chunks(b) * to_decay);
    let ag = unchunk(chunks(a) * (g5 - chunks(g_original)).exp());

    DplrOutputs {
        aab,
        aqk,
        aak,
        aqb,
        qg,
        kg,
        ag,
        bg,
    }
}

/// Pads the time axis to `padded` steps. `g` repeats its last row so decays
/// of the padded tail stay finite; everything else is zero.
fn pad_time<B: Backend>(inputs: DplrInputs<Tensor<B, 4>>, padded: usize) -> DplrInputs<Tensor<B, 4>> {
    let [batch, heads, seq_len, dim] = inputs.q.dims();
    let extra = padded - seq_len;
    if extra == 0 {
        return inputs;
    }

    let device = inputs.q.device();
    let zeros = Tensor::<B, 4>::zeros([batch, heads, extra, dim], &device);
    let pad = |t: Tensor<B, 4>| Tensor::cat(vec![t, zeros.clone()], 2);
    let g_tail = inputs.g.clone().narrow(2, seq_len - 1, 1).repeat_dim(2, extra);

    DplrInputs {
        q: pad(inputs.q),
        k: pad(inputs.k),
        a: pad(inputs.a),
        b: pad(inputs.b),
        g: Tensor::cat(vec![inputs.g, g_tail], 2),
        g_original: pad(inputs.g_original),
    }
}

type Blocks<B> = (Tensor<B, 7>, Tensor<B, 7>, Tensor<B, 7>, Tensor<B, 7>);

/// Strictly-lower sub-chunk blocks, `[B, H, NT, NC_i, NC_j, BC, BC]`.
fn inter_blocks<B: Backend>(
    q6: &Tensor<B, 6>,
    k6: &Tensor<B, 6>,
    a6: &Tensor<B, 6>,
    b6: &Tensor<B, 6>,
    g6: &Tensor<B, 6>,
    go6: &Tensor<B, 6>,
    scale: f32,
) -> Blocks<B> {
    let [_, _, _, nc, bc, _] = q6.dims();
    let device = q6.device();

    // Anchor of sub-chunk i is the last row of sub-chunk i - 1. Sub-chunk 0
    // has no off-diagonal blocks; its anchor is a placeholder.
    let last_rows = g6.clone().narrow(4, bc - 1, 1).narrow(3, 0, nc - 1);
    let placeholder = g6.clone().narrow(3, 0, 1).narrow(4, 0, 1);
    let gn = Tensor::cat(vec![placeholder, last_rows], 3);

    let qg = q6.clone() * (g6.clone() - gn.clone()).exp() * scale;
    let ag = a6.clone() * (g6.clone() - go6.clone() - gn.clone()).exp();

    // [.., NC_i, NC_j, BC, K]. Exponents of blocks that are not strictly
    // lower are zeroed before exp so they cannot overflow.
    let lower = pair_mask::<B>(nc, &device, |i, j| i > j);
    let exponent = gn.unsqueeze_dim::<7>(4).repeat_dim(4, nc)
        - g6.clone().unsqueeze_dim::<7>(3).repeat_dim(3, nc);
    let decay = (exponent * lower.clone().reshape([1, 1, 1, nc, nc, 1, 1])).exp();

    let kg = (k6.clone().unsqueeze_dim::<7>(3).repeat_dim(3, nc) * decay.clone()).swap_dims(5, 6);
    let bg = (b6.clone().unsqueeze_dim::<7>(3).repeat_dim(3, nc) * decay).swap_dims(5, 6);
    let qg = qg.unsqueeze_dim::<7>(4).repeat_dim(4, nc);
    let ag = ag.unsqueeze_dim::<7>(4).repeat_dim(4, nc);

    let keep = lower.reshape([1, 1, 1, nc, nc, 1, 1]);
    (
        qg.clone().matmul(kg.clone()) * keep.clone(),
        qg.matmul(bg.clone()) * keep.clone(),
        ag.clone().matmul(bg) * keep.clone(),
        ag.matmul(kg) * keep,
    )
}

/// Diagonal sub-chunk blocks, `[B, H, NT, NC, BC, BC]`.
fn diagonal_blocks<B: Backend>(
    q6: &Tensor<B, 6>,
    k6: &Tensor<B, 6>,
    a6: &Tensor<B, 6>,
    b6: &Tensor<B, 6>,
    g6: &Tensor<B, 6>,
    go6: &Tensor<B, 6>,
    scale: f32,
) -> (Tensor<B, 6>, Tensor<B, 6>, Tensor<B, 6>, Tensor<B, 6>) {
    let [_, _, _, _, bc, _] = q6.dims();
    let device = q6.device();

    let q_scaled = q6.clone() * scale;
    let g_a = g6.clone() - go6.clone();

    let mut columns: [Vec<Tensor<B, 6>>; 4] = Default::default();
    for j in 0..bc {
        // Rows t >= j for the q side, t > j for the a side.
        let inclusive = row_mask::<B>(bc, &device, |t| t >= j);
        let strict = row_mask::<B>(bc, &device, |t| t > j);

        let k_j = k6.clone().narrow(4, j, 1);
        let b_j = b6.clone().narrow(4, j, 1);
        let g_j = g6.clone().narrow(4, j, 1);

        // Masked rows get exponent 0, then their sums are zeroed.
        let q_side = q_scaled.clone() * ((g6.clone() - g_j.clone()) * inclusive.clone()).exp();
        let a_side = a6.clone() * ((g_a.clone() - g_j) * strict.clone()).exp();

        let [qk, qb, ab, ak] = &mut columns;
        qk.push((q_side.clone() * k_j.clone()).sum_dim(5) * inclusive.clone());
        qb.push((q_side * b_j.clone()).sum_dim(5) * inclusive);
        ab.push((a_side.clone() * b_j).sum_dim(5) * strict.clone());
        ak.push((a_side * k_j).sum_dim(5) * strict);
    }

    let [qk, qb, ab, ak] = columns.map(|c| Tensor::cat(c, 5));
    (qk, qb, ab, ak)
}

/// `[n, n]` float mask with ones where `keep(i, j)`.
fn pair_mask<B: Backend>(
    n: usize,
    device: &B::Device,
    keep: impl Fn(usize, usize) -> bool,
) -> Tensor<B, 2> {
    let data: Vec<f32> = (0..n * n)
        .map(|idx| if keep(idx / n, idx % n) { 1.0 } else { 0.0 })
        .collect();
    Tensor::from_data(TensorData::new(data, [n, n]), device)
}

/// `[1, 1, 1, 1, n, 1]` float mask over the rows of a sub-chunk.
fn row_mask<B: Backend>(n: usize, device: &B::Device, keep: impl Fn(usize) -> bool) -> Tensor<B, 6> {
    let data: Vec<f32> = (0..n).map(|t| if keep(t) { 1.0 } else { 0.0 }).collect();
    Tensor::<B, 1>::from_data(TensorData::new(data, [n]), device).reshape([1, 1, 1, 1, n, 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DplrConfig, test_utils::*};

    type B = burn::backend::NdArray;

    #[test]
    fn padding_repeats_last_decay() {
        let device = Default::default();
        let host = HostInputs::random(HostDims::new(1, 1, 5, 4), 7);
        let padded = pad_time(host.to_tensors::<B>(Layout::HeadFirst, &device), 8);
        let g = padded.g.into_data().to_vec::<f32>().unwrap();
        let last = g[4 * 4..5 * 4].to_vec();
        for row in 5..8 {
            assert_eq!(g[row * 4..(row + 1) * 4], last[..]);
        }
        let q = padded.q.into_data().to_vec::<f32>().unwrap();
        assert!(q[5 * 4..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn single_sub_chunk_has_no_off_diagonal_part() {
        let device = Default::default();
        let dims = HostDims::new(1, 2, 16, 8);
        let host = HostInputs::random(dims, 3);
        let config = DplrConfig::new()
            .with_chunk_size(16)
            .resolve(dims.shape(Layout::HeadFirst), dims.scale(), None)
            .unwrap();
        assert_eq!(config.sizes.num_sub_chunks, 1);

        let out = chunk_dplr_fwd_intra_blocked(host.to_tensors::<B>(Layout::HeadFirst, &device), &config);
        let oracle = host.oracle(dims.scale(), config.sizes.chunk_len, None);
        assert_data_close(
            &head_first_values(out.aqk, Layout::HeadFirst),
            &to_f32(&oracle.aqk),
            RTOL,
            ATOL,
            "aqk",
        );
    }

    #[test]
    fn tiny_chunks_use_whole_chunk_as_sub_chunk() {
        let device = Default::default();
        let dims = HostDims::new(1, 1, 12, 4);
        let host = HostInputs::random(dims, 11);
        let config = DplrConfig::new()
            .with_chunk_size(4)
            .resolve(dims.shape(Layout::HeadFirst), 1.0, None)
            .unwrap();
        assert_eq!(config.sizes.sub_chunk_len, 4);

        let out = chunk_dplr_fwd_intra_blocked(host.to_tensors::<B>(Layout::HeadFirst, &device), &config);
        let oracle = host.oracle(1.0, 4, None);
        assert_data_close(
            &head_first_values(out.aak, Layout::HeadFirst),
            &to_f32(&oracle.aak),
            RTOL,
            ATOL,
            "aak",
        );
    }
}
