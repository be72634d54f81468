//! NVIDIA GPU backend via NVML
//!
//! Devices are addressed by NVML index. Energy comes from the total energy
//! counter (millijoules since driver load); per-process utilization from
//! NVML's process utilization samples.

use log::{debug, info, warn};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::device::{AcceleratorDevice, DeviceHandle, DeviceRole, ProcessUtilizationSample};
use crate::error::{Error, Result};

pub const NVML_DEVICE: &str = "nvml";

/// NVIDIA GPU collector
#[derive(Default)]
pub struct NvmlBackend {
    nvml: Option<Nvml>,
    devices: BTreeMap<u32, DeviceHandle>,
    collection_supported: bool,
}

impl NvmlBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn nvml(&self) -> Result<&Nvml> {
        self.nvml
            .as_ref()
            .ok_or_else(|| Error::NotSupported("NVML is not initialized".to_string()))
    }
}

impl AcceleratorDevice for NvmlBackend {
    fn name(&self) -> &str {
        NVML_DEVICE
    }

    fn device_type(&self) -> &str {
        NVML_DEVICE
    }

    fn hw_type(&self) -> DeviceRole {
        DeviceRole::Gpu
    }

    fn init_lib(&mut self) -> Result<()> {
        if self.nvml.is_none() {
            self.nvml = Some(Nvml::init()?);
        }
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.collection_supported = false;
        let nvml = self.nvml()?;

        let count = nvml.device_count()?;
        let mut devices = BTreeMap::new();
        for index in 0..count {
            match nvml.device_by_index(index) {
                Ok(device) => {
                    let handler = device.uuid().unwrap_or_else(|_| index.to_string());
                    devices.insert(index, DeviceHandle::new(handler, index));
                }
                Err(e) => warn!("failed to get NVIDIA GPU {}: {}", index, e),
            }
        }

        if devices.is_empty() {
            return Err(Error::NotFound("no NVIDIA GPU found".to_string()));
        }

        info!("found {} NVIDIA GPUs", devices.len());
        self.devices = devices;
        self.collection_supported = true;
        Ok(())
    }

    fn shutdown(&mut self) -> bool {
        self.collection_supported = false;
        self.devices.clear();
        match self.nvml.take() {
            Some(nvml) => match nvml.shutdown() {
                Ok(()) => true,
                Err(e) => {
                    warn!("failed to shut down NVML: {}", e);
                    false
                }
            },
            None => true,
        }
    }

    fn devices(&self) -> BTreeMap<u32, DeviceHandle> {
        self.devices.clone()
    }

    fn abs_energy_from_device(&self) -> Vec<u64> {
        let Ok(nvml) = self.nvml() else {
            return Vec::new();
        };

        let mut energies = Vec::with_capacity(self.devices.len());
        for index in self.devices.keys() {
            match nvml
                .device_by_index(*index)
                .and_then(|d| d.total_energy_consumption())
            {
                Ok(mj) => energies.push(mj),
                Err(e) => {
                    debug!("failed to read energy of GPU {}: {}", index, e);
                    energies.push(0);
                }
            }
        }
        energies
    }

    fn process_resource_utilization_per_device(
        &self,
        device: &DeviceHandle,
        since: Duration,
    ) -> Result<HashMap<u32, ProcessUtilizationSample>> {
        let nvml = self.nvml()?;
        let gpu = nvml.device_by_index(device.parent_id)?;

        // NVML timestamps are CPU microseconds since epoch
        let now_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let last_seen = now_us.saturating_sub(since.as_micros() as u64);

        let samples = match gpu.process_utilization_stats(last_seen) {
            Ok(samples) => samples,
            // No process was active within the window
            Err(NvmlError::NotFound) => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(samples
            .into_iter()
            .map(|s| {
                (
                    s.pid,
                    ProcessUtilizationSample {
                        pid: s.pid,
                        timestamp: s.timestamp,
                        compute_util: s.sm_util,
                        mem_util: s.mem_util,
                        enc_util: s.enc_util,
                        dec_util: s.dec_util,
                    },
                )
            })
            .collect())
    }

    fn is_device_collection_supported(&self) -> bool {
        self.collection_supported
    }

    fn set_device_collection_supported(&mut self, supported: bool) {
        self.collection_supported = supported;
    }
}
