//! Node energy sources
//!
//! Cumulative CPU energy counters, split by event class (package, core,
//! uncore, dram) and by physical package. All figures are millijoules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

pub mod rapl;

pub use rapl::RaplSysfs;

/// Energy counter event classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyEvent {
    Package,
    Core,
    Uncore,
    Dram,
}

impl EnergyEvent {
    pub const ALL: [EnergyEvent; 4] = [
        EnergyEvent::Package,
        EnergyEvent::Core,
        EnergyEvent::Uncore,
        EnergyEvent::Dram,
    ];

    /// Prefix of the counter domain name for this event
    pub fn as_str(&self) -> &'static str {
        match self {
            EnergyEvent::Package => "package",
            EnergyEvent::Core => "core",
            EnergyEvent::Uncore => "uncore",
            EnergyEvent::Dram => "dram",
        }
    }
}

impl std::fmt::Display for EnergyEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-package cumulative energy breakdown (mJ)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeComponentsEnergy {
    pub core: u64,
    pub uncore: u64,
    pub dram: u64,
    pub pkg: u64,
}

/// Source of node-level energy counters
pub trait NodeEnergySource: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the counters are readable on this node
    fn is_system_collection_supported(&self) -> bool;

    /// Energy of `event` summed over packages
    fn abs_energy(&self, event: EnergyEvent) -> Result<u64>;

    /// Wraparound ceiling of `event`'s counter
    fn max_energy_range(&self, event: EnergyEvent) -> Result<u64>;

    fn abs_energy_from_dram(&self) -> Result<u64> {
        self.abs_energy(EnergyEvent::Dram)
    }

    fn abs_energy_from_core(&self) -> Result<u64> {
        self.abs_energy(EnergyEvent::Core)
    }

    fn abs_energy_from_uncore(&self) -> Result<u64> {
        self.abs_energy(EnergyEvent::Uncore)
    }

    fn abs_energy_from_package(&self) -> Result<u64> {
        self.abs_energy(EnergyEvent::Package)
    }

    fn max_energy_range_from_dram(&self) -> Result<u64> {
        self.max_energy_range(EnergyEvent::Dram)
    }

    fn max_energy_range_from_core(&self) -> Result<u64> {
        self.max_energy_range(EnergyEvent::Core)
    }

    fn max_energy_range_from_uncore(&self) -> Result<u64> {
        self.max_energy_range(EnergyEvent::Uncore)
    }

    fn max_energy_range_from_package(&self) -> Result<u64> {
        self.max_energy_range(EnergyEvent::Package)
    }

    /// Breakdown keyed by package index
    fn abs_energy_from_node_components(&self) -> BTreeMap<u32, NodeComponentsEnergy>;

    /// Release any held resources
    fn stop_power(&self) {}
}
