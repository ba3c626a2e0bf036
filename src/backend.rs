//! Backend abstraction and runtime context
//!
//! Supports both CUDA (GPU) and NdArray (CPU) backends, selected at compile
//! time. The runtime device is resolved once at startup and carried in a
//! [`RuntimeContext`] that is passed explicitly to the engine and predictor.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::utils::error::Result;

// --------------------------------------------------------------------------------
// BACKEND SELECTION: CUDA (preferred) or NdArray (fallback)
// --------------------------------------------------------------------------------

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray"), not(feature = "cpu")))]
compile_error!("At least one backend (cuda, ndarray, or cpu) must be enabled!");

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

/// Device handle of the compiled-in backend
pub type DefaultDevice = <DefaultBackend as Backend>::Device;

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), any(feature = "ndarray", feature = "cpu")))]
    {
        "NdArray (CPU)"
    }
}

/// Requested compute device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// Accelerator if one is usable, otherwise CPU
    #[default]
    Auto,
    Cpu,
    Gpu(usize),
}

impl std::fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceChoice::Auto => write!(f, "auto"),
            DeviceChoice::Cpu => write!(f, "CPU"),
            DeviceChoice::Gpu(id) => write!(f, "GPU:{}", id),
        }
    }
}

/// Resolve a device request against the compiled-in backend
#[cfg(feature = "cuda")]
pub fn resolve_device(choice: DeviceChoice) -> Result<DefaultDevice> {
    use crate::utils::error::WasteSorterError;

    match choice {
        DeviceChoice::Auto => {
            info!("Using CUDA device 0");
            Ok(burn_cuda::CudaDevice::new(0))
        }
        DeviceChoice::Gpu(id) => {
            info!("Using CUDA device {}", id);
            Ok(burn_cuda::CudaDevice::new(id))
        }
        DeviceChoice::Cpu => Err(WasteSorterError::Configuration(
            "CPU device requested but this build uses the CUDA backend; rebuild without --features cuda"
                .to_string(),
        )),
    }
}

/// Resolve a device request against the compiled-in backend
#[cfg(not(feature = "cuda"))]
pub fn resolve_device(choice: DeviceChoice) -> Result<DefaultDevice> {
    match choice {
        DeviceChoice::Cpu => info!("Using CPU backend"),
        DeviceChoice::Auto => {
            if is_gpu_available() {
                warn!("GPU detected but this build only has the CPU backend (enable the `cuda` feature)");
            }
            info!("Using CPU backend");
        }
        DeviceChoice::Gpu(id) => {
            warn!("GPU:{} requested but not available in this build - falling back to CPU", id);
        }
    }
    Ok(DefaultDevice::default())
}

/// Check for an NVIDIA driver on the host
pub fn is_gpu_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Immutable process-wide context: the active device and the pipeline
/// configuration. Built once at startup and handed to the engine and the
/// predictor instead of living in globals.
#[derive(Debug, Clone)]
pub struct RuntimeContext<B: Backend> {
    device: B::Device,
    config: PipelineConfig,
}

impl<B: Backend> RuntimeContext<B> {
    pub fn new(device: B::Device, config: PipelineConfig) -> Self {
        Self { device, config }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Validate the config, resolve its device and build the training context
pub fn training_context(config: PipelineConfig) -> Result<RuntimeContext<TrainingBackend>> {
    config.validate()?;
    let device = resolve_device(config.device)?;
    info!("Backend: {} ({:?})", backend_name(), device);
    Ok(RuntimeContext::new(device, config))
}
