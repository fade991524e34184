use std::fmt::Debug;

use burn::tensor::{backend::Backend, ops::FloatTensor};
use burn_cubecl::{CubeRuntime, FloatElement, tensor::CubeTensor};

use super::bundle::TensorBundle;

/// A forward-only fused CubeCL kernel.
pub trait FusedKernel: 'static + Send + Debug + Clone {
    type Inputs<T: Debug + Clone + Send>: TensorBundle<T>;
    type Outputs<T: Debug + Clone + Send>: TensorBundle<T>;
    type Config: Debug + Clone + Send;

    fn forward_launch<R: CubeRuntime, F: FloatElement>(
        inputs: Self::Inputs<CubeTensor<R>>,
        config: Self::Config,
    ) -> Self::Outputs<CubeTensor<R>>;
}

/// Backend trait for a specific kernel.
/// Allows different backends to implement it.
pub trait FusedKernelBackend<K: FusedKernel>: Backend {
    fn forward(
        inputs: K::Inputs<FloatTensor<Self>>,
        config: K::Config,
    ) -> K::Outputs<FloatTensor<Self>>;
}
