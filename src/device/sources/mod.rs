//! Compiled-in hardware backends

use std::path::PathBuf;

use super::{start_backend, BackendRegistry, DeviceRole};
use crate::config::GeneralConfig;
use crate::error::Result;

pub mod dummy;
pub mod qat;

#[cfg(feature = "nvidia")]
pub mod nvml;

/// Register every backend built into this binary.
///
/// Filesystem-backed backends read below the roots in `general`.
pub fn register_defaults(registry: &BackendRegistry, general: &GeneralConfig) -> Result<()> {
    registry.register(dummy::DUMMY_DEVICE, DeviceRole::Dummy, || {
        start_backend(dummy::Dummy::new())
    })?;

    let sys_root: PathBuf = general.sys_root.clone();
    let debugfs_root: PathBuf = general.debugfs_root.clone();
    registry.register(qat::QAT_DEVICE, DeviceRole::Qat, move || {
        start_backend(qat::QatTelemetry::new(&sys_root, debugfs_root.clone()))
    })?;

    #[cfg(feature = "nvidia")]
    registry.register(nvml::NVML_DEVICE, DeviceRole::Gpu, || {
        start_backend(nvml::NvmlBackend::new())
    })?;

    Ok(())
}
