//! Diagonal sub-chunk blocks and the rescaled tensors.

use cubecl::prelude::*;

use super::{
    index::{chunk_span, row_offset},
    types::IntraKernelConfig,
};

/// One cube per `(chunk task, sub-chunk i, batch·head)`.
///
/// First every unit rescales its share of the sub-chunk rows:
///
/// ```text
/// qg = q·scale·exp(g)       kg = k·exp(g_last - g)
/// ag = a·exp(g - g0)        bg = b·exp(g_last - g)
/// ```
///
/// where `g_last` is the decay at the final valid row of the enclosing chunk.
///
/// Then the block diagonal is swept column by column. For column `j` each
/// row `y` reduces over the features with exponents relative to row `j`, so
/// only differences within one sub-chunk are ever exponentiated. Lanes split
/// the features and their partial sums meet in shared memory; lane 0 writes.
/// `Aqk`/`Aqb` keep `t >= j`, `Aab`/`Aak` keep `t > j`.
///
/// Grid: `(num_chunk_tasks, NC, B * H)`, cube: `(BC, BC)` as `(lane, row)`.
#[cube(launch)]
pub fn chunk_dplr_sub_intra_kernel<F: Float, A: Float + CubeElement>(
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
    qg: &mut Tensor<F>,
    kg: &mut Tensor<F>,
    ag: &mut Tensor<F>,
    bg: &mut Tensor<F>,
    offsets: &Array<u32>,
    indices: &Array<u32>,
    scale: A,
    #[comptime] config: IntraKernelConfig,
) {
    let bt = comptime!(config.chunk_len);
    let bc = comptime!(config.sub_chunk_len);
    let dim = comptime!(config.head_dim);
    let num_heads = comptime!(config.num_heads);
    let passes = comptime!(config.lane_passes(config.head_dim));

    let i_bh = CUBE_POS_Z as usize;
    let i_b = i_bh / num_heads;
    let i_i = CUBE_POS_Y as usize;

    let lane = UNIT_POS_X as usize;
    let y = UNIT_POS_Y as usize;

    let time_axis = comptime!(if config.head_first { 2usize } else { 1usize });
    let total_len = q.shape(time_axis) as usize;

    let span = chunk_span::<F>(q, offsets, indices, CUBE_POS_X as usize, i_b, config);
    let bos = span.bos;
    let seq_len = span.seq_len;

    let mut part_qk = SharedMemory::<A>::new(bc * bc);
    let mut part_qb = SharedMemory::<A>::new(bc * bc);
    let mut part_ab = SharedMemory::<A>::new(bc * bc);
    let mut part_ak = SharedMemory::<A>::new(bc * bc);

    let t0 = span.chunk * bt + i_i * bc;

    if t0 < seq_len {
        let t = t0 + y;
        let valid = t < seq_len;

        let mut chunk_end = span.chunk * bt + bt;
        if chunk_end > seq_len {
            chunk_end = seq_len;
        }
        let last = row_offset(i_bh, bos, chunk_end - 1, total_len, dim, config);
        let row = row_offset(i_bh, bos, t, total_len, dim, config);

        if valid {
            for pass in 0..passes {
                let f = pass * bc + lane;
                if f < dim {
                    let gv = A::cast_from(g[row + f]);
                    let g_last = A::cast_from(g[last + f]);
                    let go = A::cast_from(g_original[row + f]);
                    let decay = A::exp(g_last - gv);
                    qg[row + f] = F::cast_from(A::cast_from(q[row + f]) * scale * A::exp(gv));
                    kg[row + f] = F::cast_from(A::cast_from(k[row + f]) * decay);
                    bg[row + f] = F::cast_from(A::cast_from(b[row + f]) * decay);
                    ag[row + f] = F::cast_from(A::cast_from(a[row + f]) * A::exp(gv - go));
                }
            }
        }

        let mut width = seq_len - t0;
        if width > bc {
            width = bc;
        }
        let out = row_offset(i_bh, bos, t, total_len, bt, config) + i_i * bc;

        for j in 0..width {
            let col = row_offset(i_bh, bos, t0 + j, total_len, dim, config);

            let mut qk = A::new(0.0);
            let mut qb = A::new(0.0);
            let mut ab = A::new(0.0);
            let mut ak = A::new(0.0);

            if valid {
                for pass in 0..passes {
                    let f = pass * bc + lane;
                    if f < dim {
                        let gv = A::cast_from(g[row + f]);
                        let gj = A::cast_from(g[col + f]);
                        let go = A::cast_from(g_original[row + f]);
                        let kj = A::cast_from(k[col + f]);
                        let bj = A::cast_from(b[col + f]);

                        let qv = A::cast_from(q[row + f]) * scale * A::exp(gv - gj);
                        let av = A::cast_from(a[row + f]) * A::exp(gv - go - gj);
                        qk += qv * kj;
                        qb += qv * bj;
                        ab += av * bj;
                        ak += av * kj;
                    }
                }
            }

            part_qk[y * bc + lane] = qk;
            part_qb[y * bc + lane] = qb;
            part_ab[y * bc + lane] = ab;
            part_ak[y * bc + lane] = ak;

            sync_cube();

            if valid && lane == 0 {
                let mut sum_qk = A::new(0.0);
                let mut sum_qb = A::new(0.0);
                let mut sum_ab = A::new(0.0);
                let mut sum_ak = A::new(0.0);
                for l in 0..bc {
                    sum_qk += part_qk[y * bc + l];
                    sum_qb += part_qb[y * bc + l];
                    sum_ab += part_ab[y * bc + l];
                    sum_ak += part_ak[y * bc + l];
                }

                if y >= j {
                    aqk[out + j] = F::cast_from(sum_qk);
                    aqb[out + j] = F::cast_from(sum_qb);
                }
                if y > j {
                    aab[out + j] = sum_ab;
                    aak[out + j] = sum_ak;
                }
            }

            sync_cube();
        }
    }
}
