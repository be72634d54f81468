// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! Device capability abstraction
//!
//! Every hardware backend (NVML, QAT telemetry, the dummy stand-in, ...) implements
//! [`AcceleratorDevice`]. Backends are registered by name and role in a
//! [`BackendRegistry`] and brought up on demand with
//! [`BackendRegistry::startup_device`].
//!
//! # Examples
//!
//! ```no_run
//! use powerlens::device::{sources, BackendRegistry};
//! use powerlens::config::GeneralConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backends = BackendRegistry::new();
//! sources::register_defaults(&backends, &GeneralConfig::default())?;
//!
//! let device = backends.startup_device("dummy")?;
//! for (id, handle) in device.devices() {
//!     println!("{} -> {}", id, handle.handler);
//! }
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

pub mod pci;
pub mod registry;
pub mod sources;

pub use registry::{BackendRegistry, DeviceStartupFn, Registration};

/// Functional category a backend serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Gpu,
    Qat,
    Dummy,
}

impl DeviceRole {
    pub const ALL: [DeviceRole; 3] = [DeviceRole::Gpu, DeviceRole::Qat, DeviceRole::Dummy];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Gpu => "gpu",
            DeviceRole::Qat => "qat",
            DeviceRole::Dummy => "dummy",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gpu" => Ok(DeviceRole::Gpu),
            "qat" => Ok(DeviceRole::Qat),
            "dummy" => Ok(DeviceRole::Dummy),
            other => Err(Error::Parse(format!("unknown device role {:?}", other))),
        }
    }
}

/// Handle to one physical or logical compute unit
///
/// A whole device has `is_subdevice == false`, `parent_id == id` and a
/// normalization ratio of `1.0`. A partitioned slice (e.g. a MIG instance)
/// carries its parent's id and the fraction of the parent's compute
/// resources it represents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Backend-owned reference (NVML index/UUID, PCI address, ...)
    pub handler: String,
    /// Entity id
    pub id: u32,
    /// Set for partitioned slices
    pub is_subdevice: bool,
    /// Parent entity id (equals `id` for whole devices)
    pub parent_id: u32,
    /// Fraction of the parent's compute this slice represents (0.0 - 1.0)
    pub normalization_ratio: f64,
}

impl DeviceHandle {
    /// Create a handle for a whole device
    pub fn new(handler: impl Into<String>, id: u32) -> Self {
        Self {
            handler: handler.into(),
            id,
            is_subdevice: false,
            parent_id: id,
            normalization_ratio: 1.0,
        }
    }

    /// Create a handle for a slice of `parent_id`
    pub fn subdevice(handler: impl Into<String>, id: u32, parent_id: u32, ratio: f64) -> Self {
        Self {
            handler: handler.into(),
            id,
            is_subdevice: true,
            parent_id,
            normalization_ratio: ratio.clamp(0.0, 1.0),
        }
    }

    /// Scale a figure measured on the parent device down to this slice
    pub fn normalize(&self, value: f64) -> f64 {
        value * self.normalization_ratio
    }
}

/// Per-process utilization snapshot reported by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessUtilizationSample {
    pub pid: u32,
    /// Sample timestamp (backend clock, typically microseconds since epoch)
    pub timestamp: u64,
    /// Compute utilization (0-100%)
    pub compute_util: u32,
    /// Memory controller utilization (0-100%)
    pub mem_util: u32,
    /// Encoder utilization (0-100%)
    pub enc_util: u32,
    /// Decoder utilization (0-100%)
    pub dec_util: u32,
}

/// Device-level utilization read from QAT telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QatUtilizationSample {
    pub sample_cnt: u64,
    pub pci_trans_cnt: u64,
    /// Average accelerator latency
    pub latency: u64,
    pub bw_in: u64,
    pub bw_out: u64,
    /// Compression utilization summed over slices
    pub cpr_util: u64,
    /// Decompression utilization summed over slices
    pub dcpr_util: u64,
    /// Translator utilization summed over slices
    pub xlt_util: u64,
    /// Cipher utilization summed over slices
    pub cph_util: u64,
    /// Authentication utilization summed over slices
    pub ath_util: u64,
}

/// Common interface for all hardware backends
pub trait AcceleratorDevice: Send {
    /// Backend name, used as registry key (e.g. "nvml")
    fn name(&self) -> &str;

    /// Backend type label (e.g. "nvml", "qat")
    fn device_type(&self) -> &str;

    /// Role of the hardware this backend drives
    fn hw_type(&self) -> DeviceRole;

    /// Load any external driver library. Must be idempotent.
    fn init_lib(&mut self) -> Result<()>;

    /// Start the backend's telemetry. Sets collection support on success.
    fn init(&mut self) -> Result<()>;

    /// Release resources. Safe to call after a failed [`init`](Self::init).
    fn shutdown(&mut self) -> bool;

    /// Top-level devices keyed by id
    fn devices(&self) -> BTreeMap<u32, DeviceHandle>;

    /// Per-device sub-instances for partitionable hardware
    fn device_instances(&self) -> BTreeMap<u32, BTreeMap<u32, DeviceHandle>> {
        BTreeMap::new()
    }

    /// Cumulative energy per device in millijoules; empty when unsupported
    fn abs_energy_from_device(&self) -> Vec<u64> {
        Vec::new()
    }

    /// Utilization of processes active on `device` within the trailing `since` window.
    ///
    /// An empty map means no active processes; an error means the read failed.
    fn process_resource_utilization_per_device(
        &self,
        device: &DeviceHandle,
        since: Duration,
    ) -> Result<HashMap<u32, ProcessUtilizationSample>>;

    /// Device-level utilization keyed by device address (QAT)
    fn device_utilization(&self) -> Result<BTreeMap<String, QatUtilizationSample>> {
        Err(Error::NotSupported(format!(
            "{} does not report device utilization",
            self.name()
        )))
    }

    /// Whether the backend is healthy and collecting
    fn is_device_collection_supported(&self) -> bool;

    /// Force the collection flag. For test doubles only.
    fn set_device_collection_supported(&mut self, supported: bool);
}

/// Run `init_lib` and `init` on a freshly constructed backend.
///
/// Backend constructors registered in a [`BackendRegistry`] use this so
/// that a successfully returned device is ready to sample.
pub fn start_backend<D>(mut device: D) -> Result<Box<dyn AcceleratorDevice>>
where
    D: AcceleratorDevice + 'static,
{
    device.init_lib()?;
    device.init()?;
    Ok(Box::new(device))
}
