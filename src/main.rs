//! Command line driver for the intra-chunk forward pass.
//!
//! Usage:
//!   dplr check --seq-len 1024 --dim 128
//!   dplr check --lengths 300,724 --layout time-first
//!   dplr check --portable
//!   dplr time --batch 4 --heads 16 --seq-len 4096 --json

use std::{process::ExitCode, time::Instant};

use burn::tensor::{Tensor, backend::Backend};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dplr::{
    CpuBackend, DplrBackend, DplrConfig, DplrOutputs, GpuBackend, Layout, SeqPacking,
    blocked::chunk_dplr_fwd_intra_blocked,
    chunk_dplr_fwd_intra,
    test_utils::{ATOL, HostDims, HostInputs, HostOutputs, RTOL, head_first_values, to_f32},
    try_chunk_dplr_fwd_intra,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dplr", about = "DPLR intra-chunk forward pass")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the forward pass against the f64 oracle on random inputs
    Check(CheckArgs),
    /// Time the fused kernels and the blocked implementation
    Time(TimeArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LayoutArg {
    HeadFirst,
    TimeFirst,
}

impl From<LayoutArg> for Layout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::HeadFirst => Layout::HeadFirst,
            LayoutArg::TimeFirst => Layout::TimeFirst,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ShapeArgs {
    #[arg(long, default_value = "1")]
    batch: usize,

    #[arg(long, default_value = "2")]
    heads: usize,

    #[arg(long, default_value = "1024")]
    seq_len: usize,

    #[arg(long, default_value = "128")]
    dim: usize,

    #[arg(long, default_value = "64")]
    chunk_size: usize,

    #[arg(long, default_value = "32")]
    key_tile: usize,

    #[arg(long, value_enum, default_value = "head-first")]
    layout: LayoutArg,

    #[arg(long, default_value = "0")]
    seed: u64,
}

impl ShapeArgs {
    fn dims(&self) -> HostDims {
        HostDims::new(self.batch, self.heads, self.seq_len, self.dim)
    }

    fn config(&self) -> DplrConfig {
        DplrConfig::new()
            .with_chunk_size(self.chunk_size)
            .with_key_tile(self.key_tile)
            .with_layout(self.layout.into())
    }
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[command(flatten)]
    shape: ShapeArgs,

    /// Packed sequence lengths; overrides --seq-len and forces --batch 1
    #[arg(long, value_delimiter = ',')]
    lengths: Option<Vec<usize>>,

    /// Run on the CPU backend instead of the GPU
    #[arg(long, default_value = "false")]
    portable: bool,
}

#[derive(Args, Debug)]
struct TimeArgs {
    #[command(flatten)]
    shape: ShapeArgs,

    #[arg(long, default_value = "3")]
    warmup: usize,

    #[arg(long, default_value = "10")]
    repeats: usize,

    #[arg(long, default_value = "false")]
    json: bool,
}

#[derive(Serialize)]
struct TimeResult {
    implementation: &'static str,
    batch: usize,
    heads: usize,
    seq_len: usize,
    dim: usize,
    chunk_size: usize,
    time_ms: f64,
    throughput: f64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check(args) => {
            let passed = if args.portable {
                check::<CpuBackend>(&args, &Default::default())
            } else {
                check::<GpuBackend>(&args, &Default::default())
            };
            match passed {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Time(args) => match time::<GpuBackend>(&args, &Default::default()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn check<B: DplrBackend>(args: &CheckArgs, device: &B::Device) -> dplr::Result<bool> {
    let mut shape = args.shape.clone();
    let packing = args.lengths.as_ref().map(|lengths| {
        shape.batch = 1;
        shape.seq_len = lengths.iter().sum();
        SeqPacking::from_lengths(lengths)
    });
    let offsets = packing.as_ref().map(|p| p.offsets.clone());
    let layout: Layout = shape.layout.into();

    let dims = shape.dims();
    let host = HostInputs::random(dims, shape.seed);
    info!(?dims, ?layout, packed = packing.is_some(), "running forward pass");

    let start = Instant::now();
    let out = try_chunk_dplr_fwd_intra::<B>(
        host.to_tensors(layout, device),
        None,
        &shape.config(),
        packing,
    )?;
    let _ = B::sync(device);
    info!(elapsed_ms = start.elapsed().as_secs_f64() * 1000.0, "forward pass done");

    let chunk_len = out.aqk.dims()[3];
    let oracle = host.oracle(dims.scale(), chunk_len, offsets.as_deref());
    Ok(report(out, &oracle, layout))
}

/// Prints the worst deviation of every output and whether it is in tolerance.
fn report<B: Backend>(out: DplrOutputs<Tensor<B, 4>>, oracle: &HostOutputs, layout: Layout) -> bool {
    let pairs = [
        ("Aqk", out.aqk, &oracle.aqk),
        ("Aqb", out.aqb, &oracle.aqb),
        ("Aab", out.aab, &oracle.aab),
        ("Aak", out.aak, &oracle.aak),
        ("qg", out.qg, &oracle.qg),
        ("kg", out.kg, &oracle.kg),
        ("ag", out.ag, &oracle.ag),
        ("bg", out.bg, &oracle.bg),
    ];

    let mut passed = true;
    for (name, tensor, expected) in pairs {
        let got = head_first_values(tensor, layout);
        let expected = to_f32(expected);
        let (max_diff, tolerance, finite) = got.iter().zip(&expected).fold(
            (0.0f32, 0.0f32, true),
            |(diff, tol, finite), (&g, &e)| {
                let d = (g - e).abs();
                if d > diff {
                    (d, ATOL + RTOL * e.abs(), finite && g.is_finite())
                } else {
                    (diff, tol, finite && g.is_finite())
                }
            },
        );
        let ok = finite && max_diff <= tolerance.max(ATOL);
        if !ok {
            warn!(output = name, max_diff, tolerance, finite, "mismatch");
        }
        println!(
            "{name:>4}  max |diff| {max_diff:.3e}  {}",
            if ok { "ok" } else { "FAIL" }
        );
        passed &= ok;
    }
    passed
}

fn time<B: DplrBackend>(args: &TimeArgs, device: &B::Device) -> dplr::Result<()> {
    let shape = &args.shape;
    let dims = shape.dims();
    let host = HostInputs::random(dims, shape.seed);
    let layout: Layout = shape.layout.into();
    let config = shape
        .config()
        .resolve(dims.shape(layout), dims.scale(), None)?;

    let measure = |run: &dyn Fn() -> Tensor<B, 4>| -> f64 {
        for _ in 0..args.warmup {
            let _ = run();
            let _ = B::sync(device);
        }
        let mut total = 0.0;
        for _ in 0..args.repeats {
            let _ = B::sync(device);
            let start = Instant::now();
            let _ = run();
            let _ = B::sync(device);
            total += start.elapsed().as_secs_f64();
        }
        (total / args.repeats as f64) * 1000.0
    };

    let fused = measure(&|| chunk_dplr_fwd_intra(host.to_tensors::<B>(layout, device), &config).aqk);
    let blocked =
        measure(&|| chunk_dplr_fwd_intra_blocked(host.to_tensors::<B>(layout, device), &config).aqk);

    for (implementation, time_ms) in [("fused", fused), ("blocked", blocked)] {
        let result = TimeResult {
            implementation,
            batch: shape.batch,
            heads: shape.heads,
            seq_len: shape.seq_len,
            dim: shape.dim,
            chunk_size: config.sizes.chunk_len,
            time_ms,
            throughput: (shape.batch * shape.heads * shape.seq_len) as f64 / (time_ms / 1000.0),
        };
        if args.json {
            println!(
                "{}",
                serde_json::to_string(&result).expect("result serializes")
            );
        } else {
            println!(
                "{implementation:>8}  {time_ms:.3} ms  {:.0} tokens/s",
                result.throughput
            );
        }
    }
    Ok(())
}
