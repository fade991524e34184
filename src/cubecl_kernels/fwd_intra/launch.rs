//! Host side of the fused intra-chunk forward pass.

use burn::tensor::DType;
use burn_backend::{Element, Shape};
use burn_cubecl::{
    CubeRuntime, FloatElement, kernel::into_contiguous, ops::numeric::zeros_client,
    tensor::CubeTensor,
};
use cubecl::{prelude::*, server::Handle};

use super::{
    diag::chunk_dplr_sub_intra_kernel,
    inter::chunk_dplr_sub_inter_kernel,
    types::{ChunkIntraKernel, DplrInputs, DplrOutputs, IntraKernelConfig},
};
use crate::{
    config::ChunkIntraConfig,
    cubecl_kernels::{bundle::TensorBundle, kernel::FusedKernel},
};

impl FusedKernel for ChunkIntraKernel {
    type Inputs<T: std::fmt::Debug + Clone + Send> = DplrInputs<T>;
    type Outputs<T: std::fmt::Debug + Clone + Send> = DplrOutputs<T>;
    type Config = ChunkIntraConfig;

    fn forward_launch<R: CubeRuntime, F: FloatElement>(
        inputs: DplrInputs<CubeTensor<R>>,
        config: ChunkIntraConfig,
    ) -> DplrOutputs<CubeTensor<R>> {
        forward::<R, F>(inputs, &config)
    }
}

fn zeros_like<R: CubeRuntime>(
    template: &CubeTensor<R>,
    shape: impl Into<Shape>,
    dtype: DType,
) -> CubeTensor<R> {
    zeros_client::<R>(
        template.client.clone(),
        template.device.clone(),
        shape.into(),
        dtype,
    )
}

/// Device tables for packed sequences. Unpacked launches get a one-entry
/// placeholder the kernels never read.
struct SeqTables {
    offsets: Handle,
    offsets_len: usize,
    indices: Handle,
    indices_len: usize,
}

impl SeqTables {
    fn upload<R: CubeRuntime>(client: &ComputeClient<R>, config: &ChunkIntraConfig) -> Self {
        let (offsets, indices) = match &config.packing {
            Some(packing) => (packing.offset_table(), packing.index_table()),
            None => (vec![0], vec![0, 0]),
        };
        Self {
            offsets: client.create_from_slice(u32::as_bytes(&offsets)),
            offsets_len: offsets.len(),
            indices: client.create_from_slice(u32::as_bytes(&indices)),
            indices_len: indices.len(),
        }
    }

    fn offsets_arg<R: Runtime>(&self) -> ArrayArg<'_, R> {
        unsafe { ArrayArg::from_raw_parts::<u32>(&self.offsets, self.offsets_len, 1) }
    }

    fn indices_arg<R: Runtime>(&self) -> ArrayArg<'_, R> {
        unsafe { ArrayArg::from_raw_parts::<u32>(&self.indices, self.indices_len, 1) }
    }
}

/// Runs both kernels and returns the eight outputs.
///
/// All outputs start zero-filled, so entries no task writes (the upper
/// triangle, blocks past the end of a sequence) read as zero.
pub fn forward<R: CubeRuntime, F: FloatElement>(
    inputs: DplrInputs<CubeTensor<R>>,
    config: &ChunkIntraConfig,
) -> DplrOutputs<CubeTensor<R>> {
    let inputs = inputs.map(into_contiguous);

    let shape = inputs.q.shape.clone();
    let [batch_size, num_heads, seq_len, head_dim] = config.layout.split(shape.dims::<4>());
    let matrix_shape = config
        .layout
        .join(batch_size, num_heads, seq_len, config.sizes.chunk_len);

    let aqk = zeros_like(&inputs.q, matrix_shape, F::dtype());
    let aqb = zeros_like(&inputs.q, matrix_shape, F::dtype());
    let aab = zeros_like(&inputs.q, matrix_shape, f32::dtype());
    let aak = zeros_like(&inputs.q, matrix_shape, f32::dtype());

    let qg = zeros_like(&inputs.q, shape.clone(), F::dtype());
    let kg = zeros_like(&inputs.q, shape.clone(), F::dtype());
    let ag = zeros_like(&inputs.q, shape.clone(), F::dtype());
    let bg = zeros_like(&inputs.q, shape, F::dtype());

    let client = &inputs.q.client;
    let tables = SeqTables::upload(client, config);
    let kernel_config = IntraKernelConfig::new(config, num_heads, head_dim);

    let num_tasks = config.num_chunk_tasks() as u32;
    let batch_heads = (batch_size * num_heads) as u32;
    let num_sub_chunks = config.sizes.num_sub_chunks as u32;
    let sub_chunk_len = config.sizes.sub_chunk_len as u32;
    let cube_dim = CubeDim::new_2d(sub_chunk_len, sub_chunk_len);

    tracing::trace!(
        num_tasks,
        batch_heads,
        num_sub_chunks,
        sub_chunk_len,
        ?kernel_config,
        "launching intra-chunk kernels"
    );

    if num_tasks > 0 {
        launch_sub_inter::<R, F>(
            client,
            CubeCount::Static(num_tasks, num_sub_chunks * num_sub_chunks, batch_heads),
            cube_dim,
            &inputs,
            [&aqk, &aqb, &aab, &aak],
            &tables,
            config.scale,
            kernel_config,
        );

        launch_sub_intra::<R, F>(
            client,
            CubeCount::Static(num_tasks, num_sub_chunks, batch_heads),
            cube_dim,
            &inputs,
            [&aqk, &aqb, &aab, &aak],
            [&qg, &kg, &ag, &bg],
            &tables,
            config.scale,
            kernel_config,
        );
    }

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

/// `matrices` is `[aqk, aqb, aab, aak]`.
fn launch_sub_inter<R: CubeRuntime, F: FloatElement>(
    client: &ComputeClient<R>,
    cube_count: CubeCount,
    cube_dim: CubeDim,
    inputs: &DplrInputs<CubeTensor<R>>,
    matrices: [&CubeTensor<R>; 4],
    tables: &SeqTables,
    scale: f32,
    config: IntraKernelConfig,
) {
    let [aqk, aqb, aab, aak] = matrices.map(CubeTensor::as_handle_ref);

    chunk_dplr_sub_inter_kernel::launch::<F, f32, R>(
        client,
        cube_count,
        cube_dim,
        inputs.q.as_handle_ref().as_tensor_arg(1),
        inputs.k.as_handle_ref().as_tensor_arg(1),
        inputs.a.as_handle_ref().as_tensor_arg(1),
        inputs.b.as_handle_ref().as_tensor_arg(1),
        inputs.g.as_handle_ref().as_tensor_arg(1),
        inputs.g_original.as_handle_ref().as_tensor_arg(1),
        aqk.as_tensor_arg(1),
        aqb.as_tensor_arg(1),
        aab.as_tensor_arg(1),
        aak.as_tensor_arg(1),
        tables.offsets_arg(),
        tables.indices_arg(),
        ScalarArg::new(scale),
        config,
    )
    .expect("sub-chunk inter kernel launch failed");
}

/// `matrices` is `[aqk, aqb, aab, aak]`, `rescaled` is `[qg, kg, ag, bg]`.
fn launch_sub_intra<R: CubeRuntime, F: FloatElement>(
    client: &ComputeClient<R>,
    cube_count: CubeCount,
    cube_dim: CubeDim,
    inputs: &DplrInputs<CubeTensor<R>>,
    matrices: [&CubeTensor<R>; 4],
    rescaled: [&CubeTensor<R>; 4],
    tables: &SeqTables,
    scale: f32,
    config: IntraKernelConfig,
) {
    let [aqk, aqb, aab, aak] = matrices.map(CubeTensor::as_handle_ref);
    let [qg, kg, ag, bg] = rescaled.map(CubeTensor::as_handle_ref);

    chunk_dplr_sub_intra_kernel::launch::<F, f32, R>(
        client,
        cube_count,
        cube_dim,
        inputs.q.as_handle_ref().as_tensor_arg(1),
        inputs.k.as_handle_ref().as_tensor_arg(1),
        inputs.a.as_handle_ref().as_tensor_arg(1),
        inputs.b.as_handle_ref().as_tensor_arg(1),
        inputs.g.as_handle_ref().as_tensor_arg(1),
        inputs.g_original.as_handle_ref().as_tensor_arg(1),
        aqk.as_tensor_arg(1),
        aqb.as_tensor_arg(1),
        aab.as_tensor_arg(1),
        aak.as_tensor_arg(1),
        qg.as_tensor_arg(1),
        kg.as_tensor_arg(1),
        ag.as_tensor_arg(1),
        bg.as_tensor_arg(1),
        tables.offsets_arg(),
        tables.indices_arg(),
        ScalarArg::new(scale),
        config,
    )
    .expect("sub-chunk intra kernel launch failed");
}
