//! Host-side test data and an f64 oracle for the intra-chunk pass.
//!
//! All host buffers are head-first `[B, H, T, W]`, row-major.

use burn::tensor::{Tensor, TensorData, backend::Backend};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{config::Layout, cubecl_kernels::DplrInputs};

/// Relative tolerance for f32 results against the f64 oracle.
pub const RTOL: f32 = 1e-3;
/// Absolute tolerance for f32 results against the f64 oracle.
pub const ATOL: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostDims {
    pub batch: usize,
    pub heads: usize,
    pub seq_len: usize,
    pub dim: usize,
}

impl HostDims {
    #[must_use]
    pub fn new(batch: usize, heads: usize, seq_len: usize, dim: usize) -> Self {
        Self {
            batch,
            heads,
            seq_len,
            dim,
        }
    }

    #[must_use]
    pub fn shape(&self, layout: Layout) -> [usize; 4] {
        layout.join(self.batch, self.heads, self.seq_len, self.dim)
    }

    /// `K^-1/2`
    #[must_use]
    pub fn scale(&self) -> f32 {
        (self.dim as f32).powf(-0.5)
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.batch * self.heads * self.seq_len * self.dim
    }
}

fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

#[derive(Debug, Clone)]
pub struct HostInputs {
    pub dims: HostDims,
    pub q: Vec<f64>,
    pub k: Vec<f64>,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub g: Vec<f64>,
    pub g_original: Vec<f64>,
}

impl HostInputs {
    /// Random inputs with decays shaped like those of a trained model:
    /// `g_original = logsigmoid(x) / 16` and `g` its running sum over time.
    #[must_use]
    pub fn random(dims: HostDims, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = dims.numel();
        let mut uniform = |scale: f64| -> Vec<f64> {
            (0..n).map(|_| rng.random_range(-1.0..1.0) * scale).collect()
        };
        let q = uniform(1.0);
        let k = uniform(1.0);
        let a = uniform(0.5);
        let b = uniform(0.5);
        let g_original: Vec<f64> = uniform(3.0).into_iter().map(|x| log_sigmoid(x) / 16.0).collect();

        let mut g = g_original.clone();
        let (t_len, dim) = (dims.seq_len, dims.dim);
        for bh in 0..dims.batch * dims.heads {
            for t in 1..t_len {
                for f in 0..dim {
                    let idx = (bh * t_len + t) * dim + f;
                    g[idx] += g[idx - dim];
                }
            }
        }

        Self {
            dims,
            q,
            k,
            a,
            b,
            g,
            g_original,
        }
        .rounded()
    }

    /// Rounds every value to f32 so the oracle sees exactly what the device sees.
    fn rounded(mut self) -> Self {
        for data in [
            &mut self.q,
            &mut self.k,
            &mut self.a,
            &mut self.b,
            &mut self.g,
            &mut self.g_original,
        ] {
            for v in data.iter_mut() {
                *v = f64::from(*v as f32);
            }
        }
        self
    }

    /// Adds `shift` to every cumulative decay. The matrices only depend on
    /// decay differences, so they are unaffected.
    #[must_use]
    pub fn with_decay_shift(mut self, shift: f64) -> Self {
        for g in &mut self.g {
            *g += shift;
        }
        self.rounded()
    }

    /// The time steps `start..start + len` of every batch entry and head.
    #[must_use]
    pub fn slice_time(&self, start: usize, len: usize) -> Self {
        let dims = HostDims {
            seq_len: len,
            ..self.dims
        };
        let (t_len, dim) = (self.dims.seq_len, self.dims.dim);
        let slice = |data: &[f64]| -> Vec<f64> {
            (0..self.dims.batch * self.dims.heads)
                .flat_map(|bh| {
                    let from = (bh * t_len + start) * dim;
                    data[from..from + len * dim].iter().copied()
                })
                .collect()
        };
        Self {
            dims,
            q: slice(&self.q),
            k: slice(&self.k),
            a: slice(&self.a),
            b: slice(&self.b),
            g: slice(&self.g),
            g_original: slice(&self.g_original),
        }
    }

    pub fn to_tensors<B: Backend>(
        &self,
        layout: Layout,
        device: &B::Device,
    ) -> DplrInputs<Tensor<B, 4>> {
        let tensor = |data: &[f64]| host_tensor::<B>(data, self.dims, layout, device);
        DplrInputs {
            q: tensor(&self.q),
            k: tensor(&self.k),
            a: tensor(&self.a),
            b: tensor(&self.b),
            g: tensor(&self.g),
            g_original: tensor(&self.g_original),
        }
    }

    /// Computes every output directly from its definition.
    ///
    /// With `offsets` the time axis is split into packed sequences (batch
    /// must be 1); otherwise each batch entry is one sequence.
    #[must_use]
    pub fn oracle(&self, scale: f32, chunk_len: usize, offsets: Option<&[usize]>) -> HostOutputs {
        let HostDims {
            batch,
            heads,
            seq_len: t_len,
            dim,
        } = self.dims;
        let scale = f64::from(scale);
        let sequences: Vec<(usize, usize)> = match offsets {
            Some(offsets) => offsets.windows(2).map(|w| (w[0], w[1] - w[0])).collect(),
            None => vec![(0, t_len)],
        };

        let mut out = HostOutputs::zeros(self.dims, chunk_len);
        let row = |bh: usize, t: usize| (bh * t_len + t) * dim;

        for bh in 0..batch * heads {
            for &(bos, len) in &sequences {
                for t in 0..len {
                    let start = t / chunk_len * chunk_len;
                    let last = (start + chunk_len).min(len) - 1;
                    let r = row(bh, bos + t);
                    let r_last = row(bh, bos + last);

                    for f in 0..dim {
                        let g = self.g[r + f];
                        let decay = (self.g[r_last + f] - g).exp();
                        out.qg[r + f] = self.q[r + f] * scale * g.exp();
                        out.kg[r + f] = self.k[r + f] * decay;
                        out.bg[r + f] = self.b[r + f] * decay;
                        out.ag[r + f] = self.a[r + f] * (g - self.g_original[r + f]).exp();
                    }

                    let m = (bh * t_len + bos + t) * chunk_len;
                    for s in start..=t {
                        let c = row(bh, bos + s);
                        let (mut qk, mut qb, mut ab, mut ak) = (0.0, 0.0, 0.0, 0.0);
                        for f in 0..dim {
                            let dq = (self.g[r + f] - self.g[c + f]).exp();
                            let da = (self.g[r + f] - self.g_original[r + f] - self.g[c + f]).exp();
                            qk += self.q[r + f] * scale * self.k[c + f] * dq;
                            qb += self.q[r + f] * scale * self.b[c + f] * dq;
                            ab += self.a[r + f] * self.b[c + f] * da;
                            ak += self.a[r + f] * self.k[c + f] * da;
                        }
                        out.aqk[m + s - start] = qk;
                        out.aqb[m + s - start] = qb;
                        if s < t {
                            out.aab[m + s - start] = ab;
                            out.aak[m + s - start] = ak;
                        }
                    }
                }
            }
        }
        out
    }
}

/// Oracle outputs, head-first. Matrices are `[B, H, T, chunk_len]`.
#[derive(Debug, Clone)]
pub struct HostOutputs {
    pub chunk_len: usize,
    pub aqk: Vec<f64>,
    pub aqb: Vec<f64>,
    pub aab: Vec<f64>,
    pub aak: Vec<f64>,
    pub qg: Vec<f64>,
    pub kg: Vec<f64>,
    pub ag: Vec<f64>,
    pub bg: Vec<f64>,
}

impl HostOutputs {
    fn zeros(dims: HostDims, chunk_len: usize) -> Self {
        let n = dims.numel();
        let m = dims.batch * dims.heads * dims.seq_len * chunk_len;
        Self {
            chunk_len,
            aqk: vec![0.0; m],
            aqb: vec![0.0; m],
            aab: vec![0.0; m],
            aak: vec![0.0; m],
            qg: vec![0.0; n],
            kg: vec![0.0; n],
            ag: vec![0.0; n],
            bg: vec![0.0; n],
        }
    }
}

/// Uploads a head-first host buffer as a tensor in `layout`.
pub fn host_tensor<B: Backend>(
    data: &[f64],
    dims: HostDims,
    layout: Layout,
    device: &B::Device,
) -> Tensor<B, 4> {
    let values: Vec<f32> = data.iter().map(|&v| v as f32).collect();
    let shape = [dims.batch, dims.heads, dims.seq_len, data.len() / (dims.batch * dims.heads * dims.seq_len)];
    let tensor = Tensor::<B, 4>::from_data(TensorData::new(values, shape), device);
    match layout {
        Layout::HeadFirst => tensor,
        Layout::TimeFirst => tensor.swap_dims(1, 2),
    }
}

/// Downloads a tensor in `layout` as head-first f32 values.
pub fn head_first_values<B: Backend>(tensor: Tensor<B, 4>, layout: Layout) -> Vec<f32> {
    let tensor = match layout {
        Layout::HeadFirst => tensor,
        Layout::TimeFirst => tensor.swap_dims(1, 2),
    };
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .expect("float tensor data")
}

#[must_use]
pub fn to_f32(data: &[f64]) -> Vec<f32> {
    data.iter().map(|&v| v as f32).collect()
}

/// Asserts that two slices agree within `atol + rtol * |expected|` at the
/// worst element, and that `actual` holds no NaN or infinity.
pub fn assert_data_close(a: &[f32], b: &[f32], rtol: f32, atol: f32, name: &str) {
    assert_eq!(
        a.len(),
        b.len(),
        "{name}: Data sizes don't match: {} vs {}",
        a.len(),
        b.len()
    );

    if let Some(i) = a.iter().position(|v| !v.is_finite()) {
        panic!("{name}: non-finite value {} at index {i}", a[i]);
    }

    let mut max_diff = 0.0f32;
    let mut max_idx = 0;
    let mut max_av = 0.0f32;
    let mut max_bv = 0.0f32;

    for (i, (&av, &bv)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (av - bv).abs();
        if diff > max_diff {
            max_diff = diff;
            max_idx = i;
            max_av = av;
            max_bv = bv;
        }
    }

    let tolerance = atol + rtol * max_bv.abs();
    assert!(
        max_diff <= tolerance,
        "{name}: Max mismatch at index {max_idx}: {max_av} vs {max_bv} (diff: {max_diff}, tolerance: {tolerance})",
    );
}
