//! Off-diagonal sub-chunk blocks.
//!
//! For sub-chunks `i > j` of the same chunk, every entry of block `(i, j)`
//! is a feature contraction whose decay factors are taken relative to the
//! anchor row `gn`, the last row before sub-chunk `i`. Both sides of the
//! product are scaled by an exponent of bounded magnitude, which keeps the
//! f32 accumulation stable however large the cumulative decay has grown.
//!
//! ```text
//! Aqk[t, s] = sum_f  q[t]·exp(g[t] - gn)·scale      * k[s]·exp(gn - g[s])
//! Aqb[t, s] = sum_f  q[t]·exp(g[t] - gn)·scale      * b[s]·exp(gn - g[s])
//! Aab[t, s] = sum_f  a[t]·exp(g[t] - g0[t] - gn)    * b[s]·exp(gn - g[s])
//! Aak[t, s] = sum_f  a[t]·exp(g[t] - g0[t] - gn)    * k[s]·exp(gn - g[s])
//! ```

use cubecl::prelude::*;

use super::{
    index::{chunk_span, row_offset},
    types::IntraKernelConfig,
};

/// One cube per `(chunk task, block (i, j), batch·head)`.
///
/// Unit `(x, y)` owns entry `(row y of sub-chunk i, row x of sub-chunk j)`.
/// Feature tiles of `key_tile` columns are staged in shared memory, already
/// rescaled, and contracted from there. Blocks on or above the diagonal and
/// blocks starting past the end of the sequence do nothing.
///
/// Grid: `(num_chunk_tasks, NC * NC, B * H)`, cube: `(BC, BC)`.
#[cube(launch)]
pub fn chunk_dplr_sub_inter_kernel<F: Float, A: Float + CubeElement>(
    q: &Tensor<F>,
    k: &Tensor<F>,
    a: &Tensor<F>,
    b: &Tensor<F>,
    g: &Tensor<F>,
    g_original: &Tensor<F>,
    aqk: &mut Tensor<F>,
    aqb: &mut Tensor<F>,
    aab: &mut Tensor<A>,
    aak: &mut Tensor<A>,
    offsets: &Array<u32>,
    indices: &Array<u32>,
    scale: A,
    #[comptime] config: IntraKernelConfig,
) {
    let bt = comptime!(config.chunk_len);
    let bc = comptime!(config.sub_chunk_len);
    let nc = comptime!(config.num_sub_chunks);
    let bk = comptime!(config.key_tile);
    let dim = comptime!(config.head_dim);
    let num_heads = comptime!(config.num_heads);
    let key_tiles = comptime!(config.key_tiles());
    let passes = comptime!(config.lane_passes(config.key_tile));

    let i_bh = CUBE_POS_Z as usize;
    let i_b = i_bh / num_heads;
    let i_i = CUBE_POS_Y as usize / nc;
    let i_j = CUBE_POS_Y as usize % nc;

    let x = UNIT_POS_X as usize;
    let y = UNIT_POS_Y as usize;

    let time_axis = comptime!(if config.head_first { 2usize } else { 1usize });
    let total_len = q.shape(time_axis) as usize;

    let span = chunk_span::<F>(q, offsets, indices, CUBE_POS_X as usize, i_b, config);
    let bos = span.bos;
    let seq_len = span.seq_len;

    // [BC, BK] rescaled tiles. Query side rows are sub-chunk i, key side sub-chunk j.
    let mut q_tile = SharedMemory::<A>::new(bc * bk);
    let mut a_tile = SharedMemory::<A>::new(bc * bk);
    let mut k_tile = SharedMemory::<A>::new(bc * bk);
    let mut b_tile = SharedMemory::<A>::new(bc * bk);

    let t_i = span.chunk * bt + i_i * bc;
    let t_j = span.chunk * bt + i_j * bc;

    if i_i > i_j && t_i < seq_len {
        let row_t = t_i + y;
        let row_s = t_j + y;
        let anchor = row_offset(i_bh, bos, t_i - 1, total_len, dim, config);
        let q_row = row_offset(i_bh, bos, row_t, total_len, dim, config);
        let k_row = row_offset(i_bh, bos, row_s, total_len, dim, config);

        let mut acc_qk = A::new(0.0);
        let mut acc_qb = A::new(0.0);
        let mut acc_ab = A::new(0.0);
        let mut acc_ak = A::new(0.0);

        for i_k in 0..key_tiles {
            for pass in 0..passes {
                let c = pass * bc + x;
                if c < bk {
                    let f = i_k * bk + c;
                    let mut qv = A::new(0.0);
                    let mut av = A::new(0.0);
                    let mut kv = A::new(0.0);
                    let mut bv = A::new(0.0);

                    if f < dim {
                        let gn = A::cast_from(g[anchor + f]);
                        if row_t < seq_len {
                            let gq = A::cast_from(g[q_row + f]);
                            let go = A::cast_from(g_original[q_row + f]);
                            qv = A::cast_from(q[q_row + f]) * A::exp(gq - gn) * scale;
                            av = A::cast_from(a[q_row + f]) * A::exp(gq - go - gn);
                        }
                        if row_s < seq_len {
                            let decay = A::exp(gn - A::cast_from(g[k_row + f]));
                            kv = A::cast_from(k[k_row + f]) * decay;
                            bv = A::cast_from(b[k_row + f]) * decay;
                        }
                    }

                    q_tile[y * bk + c] = qv;
                    a_tile[y * bk + c] = av;
                    k_tile[y * bk + c] = kv;
                    b_tile[y * bk + c] = bv;
                }
            }

            sync_cube();

            for c in 0..bk {
                let qv = q_tile[y * bk + c];
                let av = a_tile[y * bk + c];
                let kv = k_tile[x * bk + c];
                let bv = b_tile[x * bk + c];
                acc_qk += qv * kv;
                acc_qb += qv * bv;
                acc_ab += av * bv;
                acc_ak += av * kv;
            }

            sync_cube();
        }

        if row_t < seq_len {
            let out = row_offset(i_bh, bos, row_t, total_len, bt, config) + i_j * bc + x;
            aqk[out] = F::cast_from(acc_qk);
            aqb[out] = F::cast_from(acc_qb);
            aab[out] = acc_ab;
            aak[out] = acc_ak;
        }
    }
}
