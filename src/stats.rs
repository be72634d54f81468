//! Sampling entry point
//!
//! [`PowerLens`] owns the registries, the node energy source and the
//! optional power model, and takes one [`Snapshot`] per call. Scheduling
//! the calls is left to the caller.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::accelerator::{Accelerator, AcceleratorKey, AcceleratorRegistry, ShutdownReport};
use crate::config::Config;
use crate::device::{sources, BackendRegistry, QatUtilizationSample};
use crate::energy::{NodeComponentsEnergy, NodeEnergySource, RaplSysfs};
use crate::error::Result;
use crate::model::{predictor_by_name, ModelWeights, UtilizationEstimator};

/// Per-accelerator part of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorSnapshot {
    pub key: AcceleratorKey,
    pub running: bool,
    pub collection_supported: bool,
    /// Cumulative energy per device (mJ)
    pub energy_mj: Vec<u64>,
    /// QAT device utilization keyed by PCI address
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_utilization: BTreeMap<String, QatUtilizationSample>,
    /// Estimated power per device id, then per pid
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub process_power: BTreeMap<u32, BTreeMap<u32, f64>>,
}

/// One sampling tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    /// Name of the node energy source
    pub energy_source: String,
    /// Cumulative energy per CPU package (mJ)
    pub node: BTreeMap<u32, NodeComponentsEnergy>,
    pub accelerators: Vec<AcceleratorSnapshot>,
}

impl Snapshot {
    /// Package energy summed over packages (mJ)
    pub fn total_package_energy(&self) -> u64 {
        self.node.values().map(|c| c.pkg).sum()
    }
}

/// Owns everything needed to take a snapshot
pub struct PowerLens {
    config: Config,
    backends: BackendRegistry,
    accelerators: AcceleratorRegistry,
    energy: Box<dyn NodeEnergySource>,
    estimator: Option<UtilizationEstimator>,
}

impl PowerLens {
    /// Register the built-in backends, start the enabled accelerator roles
    /// and load the power model.
    ///
    /// Fails only on configuration errors; missing hardware just leaves
    /// that part of the snapshot empty.
    pub fn from_config(config: Config) -> Result<Self> {
        let backends = BackendRegistry::new();
        sources::register_defaults(&backends, &config.general)?;

        let energy = RaplSysfs::new(&config.general.sys_root);
        energy.discover();

        let estimator = match &config.model.weights_path {
            Some(path) => {
                let weights = ModelWeights::from_file(path)?;
                let predictor = predictor_by_name(&config.model.predictor, weights)?;
                info!("Loaded {} power model from {}", predictor.name(), path.display());
                Some(UtilizationEstimator::new(predictor))
            }
            None => None,
        };

        let lens = Self::with_parts(config, backends, Box::new(energy), estimator);
        lens.start_enabled_roles()?;
        Ok(lens)
    }

    /// Assemble from explicit parts without starting anything
    pub fn with_parts(
        config: Config,
        backends: BackendRegistry,
        energy: Box<dyn NodeEnergySource>,
        estimator: Option<UtilizationEstimator>,
    ) -> Self {
        let accelerators =
            AcceleratorRegistry::with_ready_timeout(config.accelerators.ready_timeout());
        Self {
            config,
            backends,
            accelerators,
            energy,
            estimator,
        }
    }

    /// Start one accelerator per enabled role
    pub fn start_enabled_roles(&self) -> Result<()> {
        for role in self.config.accelerators.enabled_roles() {
            match self.accelerators.init_role(
                &self.backends,
                role,
                self.config.accelerators.wait_ready,
            ) {
                Ok(acc) => info!("{} accelerator {} active", role, acc.name()),
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) => warn!("{} accelerators unavailable: {}", role, e),
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn accelerators(&self) -> &AcceleratorRegistry {
        &self.accelerators
    }

    pub fn energy_source(&self) -> &dyn NodeEnergySource {
        self.energy.as_ref()
    }

    pub fn snapshot(&self) -> Snapshot {
        let node = if self.energy.is_system_collection_supported() {
            self.energy.abs_energy_from_node_components()
        } else {
            BTreeMap::new()
        };

        let mut accelerators: Vec<AcceleratorSnapshot> = self
            .accelerators
            .accelerators()
            .into_values()
            .map(|acc| self.sample_accelerator(&acc))
            .collect();
        accelerators.sort_by(|a, b| a.key.cmp(&b.key));

        Snapshot {
            timestamp: Utc::now(),
            energy_source: self.energy.name().to_string(),
            node,
            accelerators,
        }
    }

    fn sample_accelerator(&self, acc: &Arc<Accelerator>) -> AcceleratorSnapshot {
        let since = self.config.general.sample_interval();

        let (energy_mj, device_utilization, devices) = acc
            .with_device(|d| {
                let utilization = d.device_utilization().unwrap_or_default();
                (d.abs_energy_from_device(), utilization, d.devices())
            })
            .unwrap_or_default();

        let mut process_power = BTreeMap::new();
        if let Some(estimator) = &self.estimator {
            for (id, device) in &devices {
                match estimator.estimate_device(acc, device, since) {
                    Ok(power) if !power.is_empty() => {
                        process_power.insert(*id, power);
                    }
                    Ok(_) => {}
                    Err(e) => debug!("no process power for {} device {}: {}", acc.key(), id, e),
                }
            }
        }

        AcceleratorSnapshot {
            key: acc.key(),
            running: acc.is_running(),
            collection_supported: acc.is_device_collection_supported(),
            energy_mj,
            device_utilization,
            process_power,
        }
    }

    /// Stop every accelerator
    pub fn shutdown(&self) -> ShutdownReport {
        self.energy.stop_power();
        self.accelerators.shutdown()
    }
}
