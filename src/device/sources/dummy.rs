//! Dummy backend
//!
//! Stand-in that needs no hardware. Collection support stays off until
//! forced, so it never shows up as an active device on a real node.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::device::{AcceleratorDevice, DeviceHandle, DeviceRole, ProcessUtilizationSample};
use crate::error::Result;

pub const DUMMY_DEVICE: &str = "dummy";

/// Synthetic utilization reported for every field
const DUMMY_UTILIZATION: u32 = 10;

#[derive(Debug, Default)]
pub struct Dummy {
    collection_supported: bool,
}

impl Dummy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AcceleratorDevice for Dummy {
    fn name(&self) -> &str {
        DUMMY_DEVICE
    }

    fn device_type(&self) -> &str {
        DUMMY_DEVICE
    }

    fn hw_type(&self) -> DeviceRole {
        DeviceRole::Dummy
    }

    fn init_lib(&mut self) -> Result<()> {
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> bool {
        true
    }

    fn devices(&self) -> BTreeMap<u32, DeviceHandle> {
        BTreeMap::new()
    }

    fn process_resource_utilization_per_device(
        &self,
        _device: &DeviceHandle,
        _since: Duration,
    ) -> Result<HashMap<u32, ProcessUtilizationSample>> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut samples = HashMap::new();
        samples.insert(
            0,
            ProcessUtilizationSample {
                pid: 0,
                timestamp,
                compute_util: DUMMY_UTILIZATION,
                mem_util: DUMMY_UTILIZATION,
                enc_util: DUMMY_UTILIZATION,
                dec_util: DUMMY_UTILIZATION,
            },
        );
        Ok(samples)
    }

    fn is_device_collection_supported(&self) -> bool {
        self.collection_supported
    }

    fn set_device_collection_supported(&mut self, supported: bool) {
        self.collection_supported = supported;
    }
}
