//! Per-process power estimation from accelerator utilization

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::Predictor;
use crate::accelerator::Accelerator;
use crate::device::{DeviceHandle, ProcessUtilizationSample};
use crate::error::{Error, Result};

/// Usage metric columns fed to the predictor, in row order
pub const USAGE_METRICS: [&str; 4] = ["compute_util", "mem_util", "enc_util", "dec_util"];

/// Runs process utilization samples through a predictor
pub struct UtilizationEstimator {
    predictor: Box<dyn Predictor>,
    metadata_names: Vec<String>,
    metadata_values: Vec<String>,
}

impl UtilizationEstimator {
    pub fn new(predictor: Box<dyn Predictor>) -> Self {
        Self {
            predictor,
            metadata_names: Vec::new(),
            metadata_values: Vec::new(),
        }
    }

    /// Attach static system metadata. When the model declares metadata
    /// features, only those are kept.
    pub fn with_metadata<I, K, V>(mut self, metadata: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let wanted = &self.predictor.weights().metadata_features;
        for (name, value) in metadata {
            let name = name.into();
            if wanted.is_empty() || wanted.contains(&name) {
                self.metadata_names.push(name);
                self.metadata_values.push(value.into());
            }
        }
        self
    }

    pub fn predictor(&self) -> &dyn Predictor {
        self.predictor.as_ref()
    }

    /// Estimated power per pid
    pub fn estimate(&self, samples: &HashMap<u32, ProcessUtilizationSample>) -> BTreeMap<u32, f64> {
        let mut pids: Vec<u32> = samples.keys().copied().collect();
        pids.sort_unstable();

        let rows: Vec<Vec<f64>> = pids
            .iter()
            .filter_map(|pid| samples.get(pid))
            .map(|s| {
                vec![
                    f64::from(s.compute_util),
                    f64::from(s.mem_util),
                    f64::from(s.enc_util),
                    f64::from(s.dec_util),
                ]
            })
            .collect();

        let names: Vec<&str> = self.metadata_names.iter().map(String::as_str).collect();
        let values: Vec<&str> = self.metadata_values.iter().map(String::as_str).collect();
        let power = self.predictor.predict(&USAGE_METRICS, &rows, &names, &values);

        pids.into_iter().zip(power).collect()
    }

    /// Sample `device` on `acc` over the trailing `since` window and
    /// estimate per-process power, scaled to the device's share of its parent
    pub fn estimate_device(
        &self,
        acc: &Accelerator,
        device: &DeviceHandle,
        since: Duration,
    ) -> Result<BTreeMap<u32, f64>> {
        let samples = acc
            .with_device(|d| d.process_resource_utilization_per_device(device, since))
            .ok_or_else(|| Error::Lifecycle(format!("accelerator {} is not running", acc.key())))??;

        Ok(self
            .estimate(&samples)
            .into_iter()
            .map(|(pid, watts)| (pid, device.normalize(watts)))
            .collect())
    }
}
