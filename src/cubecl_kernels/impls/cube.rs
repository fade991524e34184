use burn::tensor::ops::FloatTensor;
use burn_cubecl::{BoolElement, CubeBackend, CubeRuntime, FloatElement, IntElement};

use crate::cubecl_kernels::kernel::{FusedKernel, FusedKernelBackend};

impl<K, R, F, I, BT> FusedKernelBackend<K> for CubeBackend<R, F, I, BT>
where
    K: FusedKernel,
    R: CubeRuntime,
    F: FloatElement,
    I: IntElement,
    BT: BoolElement,
{
    fn forward(
        inputs: K::Inputs<FloatTensor<Self>>,
        config: K::Config,
    ) -> K::Outputs<FloatTensor<Self>> {
        K::forward_launch::<R, F>(inputs, config)
    }
}
