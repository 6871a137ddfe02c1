//! Backend selection: NdArray on CPU by default, CUDA behind the `cuda` feature.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray")))]
compile_error!("At least one backend (cuda or ndarray) must be enabled!");

/// The autodiff backend used for fine-tuning
pub type TrainingBackend = Autodiff<DefaultBackend>;

pub fn default_device() -> <DefaultBackend as Backend>::Device {
    <DefaultBackend as Backend>::Device::default()
}

/// Human-readable name of the compiled backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
    {
        "NdArray (CPU)"
    }
}
