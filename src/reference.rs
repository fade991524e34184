//! Naive chunk-level reference for the four intra-chunk matrices.
//!
//! Builds each chunk row by row with exponents relative to that row, without
//! sub-chunking. Head-first layout only, and `T` must be a multiple of the
//! chunk length.

use burn::tensor::{Bool, Tensor, TensorData, backend::Backend};

use crate::cubecl_kernels::DplrInputs;

/// Returns `(aab, aqk, aak, aqb)`, each `[B, H, T, chunk_len]`.
///
/// `q` is multiplied by `scale`.
pub fn chunk_dplr_fwd_intra_reference<B: Backend>(
    inputs: DplrInputs<Tensor<B, 4>>,
    scale: f32,
    chunk_len: usize,
) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
    let [batch, heads, seq_len, dim] = inputs.q.dims();
    assert_eq!(
        seq_len % chunk_len,
        0,
        "reference requires the sequence length ({seq_len}) to be a multiple of the chunk length ({chunk_len})"
    );
    let n = seq_len / chunk_len;
    let device = inputs.q.device();

    let chunked = |t: Tensor<B, 4>| t.reshape([batch, heads, n, chunk_len, dim]);
    let q = chunked(inputs.q) * scale;
    let k = chunked(inputs.k);
    let a = chunked(inputs.a);
    let b = chunked(inputs.b);
    let gk = chunked(inputs.g);
    let g_original = chunked(inputs.g_original);

    let mut rows: [Vec<Tensor<B, 5>>; 4] = Default::default();
    for i in 0..chunk_len {
        let q_i = q.clone().narrow(3, i, 1);
        let a_i = a.clone().narrow(3, i, 1);
        let gk_i = gk.clone().narrow(3, i, 1);
        let g_i = g_original.clone().narrow(3, i, 1);

        // Columns past row i get -inf before exp.
        let inclusive = column_mask::<B>([batch, heads, n, chunk_len, dim], &device, |j| j <= i);
        let strict = column_mask::<B>([batch, heads, n, chunk_len, dim], &device, |j| j < i);

        let attn_q = (gk_i.clone() - gk.clone()).mask_fill(inclusive, f32::NEG_INFINITY).exp();
        let attn_a = (gk_i - g_i - gk.clone()).mask_fill(strict, f32::NEG_INFINITY).exp();

        let [aqk, aqb, aab, aak] = &mut rows;
        aqk.push((q_i.clone() * k.clone() * attn_q.clone()).sum_dim(4).swap_dims(3, 4));
        aqb.push((q_i * b.clone() * attn_q).sum_dim(4).swap_dims(3, 4));
        aab.push((a_i.clone() * b.clone() * attn_a.clone()).sum_dim(4).swap_dims(3, 4));
        aak.push((a_i * k.clone() * attn_a).sum_dim(4).swap_dims(3, 4));
    }

    let [aqk, aqb, aab, aak] =
        rows.map(|r| Tensor::cat(r, 3).reshape([batch, heads, seq_len, chunk_len]));
    (aab, aqk, aak, aqb)
}

/// `[B, H, N, C, K]` mask, `true` on the chunk columns that are dropped.
fn column_mask<B: Backend>(
    dims: [usize; 5],
    device: &B::Device,
    keep: impl Fn(usize) -> bool,
) -> Tensor<B, 5, Bool> {
    let [batch, heads, n, chunk_len, dim] = dims;
    let data: Vec<bool> = (0..chunk_len).map(|j| !keep(j)).collect();
    Tensor::<B, 1, Bool>::from_data(TensorData::new(data, [chunk_len]), device)
        .reshape([1, 1, 1, chunk_len, 1])
        .repeat_dim(0, batch)
        .repeat_dim(1, heads)
        .repeat_dim(2, n)
        .repeat_dim(4, dim)
}
