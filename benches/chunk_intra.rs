//! Throughput of the intra-chunk forward pass.
//!
//! Compares the fused kernels against the blocked tensor-op implementation
//! on the GPU backend, for a few sequence lengths and chunk sizes.
//!
//! Usage:
//!   cargo bench --features rocm --bench chunk_intra

use burn::tensor::Tensor;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use dplr::{
    ChunkIntraConfig, DplrBackend, DplrConfig, DplrInputs, GpuBackend, Layout,
    blocked::chunk_dplr_fwd_intra_blocked, chunk_dplr_fwd_intra,
    test_utils::{HostDims, HostInputs},
};

/// Force async operations to complete.
fn sync<B: DplrBackend, const D: usize>(tensor: Tensor<B, D>) {
    let _ = tensor.into_data();
}

#[derive(Debug, Clone, Copy)]
struct BenchParams {
    batch: usize,
    heads: usize,
    seq_len: usize,
    dim: usize,
    chunk: usize,
}

impl BenchParams {
    const fn new(batch: usize, heads: usize, seq_len: usize, dim: usize, chunk: usize) -> Self {
        Self {
            batch,
            heads,
            seq_len,
            dim,
            chunk,
        }
    }

    fn id(&self) -> String {
        format!(
            "b{}_h{}_t{}_k{}_bt{}",
            self.batch, self.heads, self.seq_len, self.dim, self.chunk
        )
    }

    fn total_tokens(&self) -> u64 {
        (self.batch * self.heads * self.seq_len) as u64
    }

    fn dims(&self) -> HostDims {
        HostDims::new(self.batch, self.heads, self.seq_len, self.dim)
    }

    fn config(&self) -> ChunkIntraConfig {
        let dims = self.dims();
        DplrConfig::new()
            .with_chunk_size(self.chunk)
            .resolve(dims.shape(Layout::HeadFirst), dims.scale(), None)
            .expect("benchmark shapes are valid")
    }
}

const PARAMS: [BenchParams; 4] = [
    BenchParams::new(1, 8, 1024, 64, 64),
    BenchParams::new(1, 8, 4096, 64, 64),
    BenchParams::new(4, 16, 2048, 128, 64),
    BenchParams::new(4, 16, 2048, 128, 32),
];

fn inputs<B: DplrBackend>(host: &HostInputs, device: &B::Device) -> DplrInputs<Tensor<B, 4>> {
    host.to_tensors(Layout::HeadFirst, device)
}

fn bench_forward<B: DplrBackend>(c: &mut Criterion, params: BenchParams, device: &B::Device) {
    let host = HostInputs::random(params.dims(), 0);
    let config = params.config();

    let mut group = c.benchmark_group("chunk_dplr_fwd_intra");
    group.throughput(Throughput::Elements(params.total_tokens()));

    // Warmup compiles the kernels.
    sync(chunk_dplr_fwd_intra(inputs::<B>(&host, device), &config).aqk);

    group.bench_function(BenchmarkId::new("fused", params.id()), |b| {
        b.iter_batched(
            || inputs::<B>(&host, device),
            |x| sync(chunk_dplr_fwd_intra(x, &config).aqk),
            criterion::BatchSize::LargeInput,
        );
    });

    group.bench_function(BenchmarkId::new("blocked", params.id()), |b| {
        b.iter_batched(
            || inputs::<B>(&host, device),
            |x| sync(chunk_dplr_fwd_intra_blocked(x, &config).aqk),
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_all(c: &mut Criterion) {
    let device = Default::default();
    for params in PARAMS {
        bench_forward::<GpuBackend>(c, params, &device);
    }
}

criterion_group!(benches, bench_all);
criterion_main!(benches);
