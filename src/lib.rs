//! # powerlens
//!
//! Hardware energy telemetry and power attribution. powerlens reads
//! cumulative energy counters (RAPL), drives accelerator backends (NVIDIA
//! GPUs via NVML, Intel QAT telemetry) behind one capability trait, and
//! turns usage metrics into power estimates with pluggable regression
//! models where no energy counter exists.
//!
//! ## Features
//!
//! - **Backend registry**: backends register by name and role; duplicate
//!   names are refused and richer backends displace bare ones
//! - **Accelerator lifecycle**: start/stop with per-accelerator locking and
//!   best-effort shutdown
//! - **RAPL energy**: package/core/uncore/dram counters per CPU package
//! - **Power models**: exponential, logarithmic, logistic, polynomial and
//!   linear predictors built from pre-trained weights
//!
//! ## Quick Start
//!
//! ### Node energy
//!
//! ```no_run
//! use powerlens::energy::{NodeEnergySource, RaplSysfs};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let rapl = RaplSysfs::new("/sys");
//! if rapl.is_system_collection_supported() {
//!     println!("package: {} mJ", rapl.abs_energy_from_package()?);
//!     for (pkg, energy) in rapl.abs_energy_from_node_components() {
//!         println!("  package {}: core {} mJ, dram {} mJ", pkg, energy.core, energy.dram);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Full snapshot
//!
//! ```no_run
//! use powerlens::{Config, PowerLens};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let lens = PowerLens::from_config(Config::load()?)?;
//! let snapshot = lens.snapshot();
//! println!("{}", serde_json::to_string_pretty(&snapshot)?);
//! lens.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `nvidia`: NVML GPU backend
//! - `cli`: the `powerlens` command-line tool

pub mod accelerator;
pub mod config; // Configuration management with TOML persistence
pub mod device; // Backend capability trait, registry and built-in sources
pub mod energy; // Node energy counters (RAPL)
pub mod error;
pub mod model; // Power estimation predictors
pub mod stats;

pub use accelerator::{Accelerator, AcceleratorKey, AcceleratorRegistry, ShutdownReport};
pub use config::{AcceleratorConfig, Config, GeneralConfig, ModelConfig};
pub use device::{
    AcceleratorDevice, BackendRegistry, DeviceHandle, DeviceRole, ProcessUtilizationSample,
    QatUtilizationSample, Registration,
};
pub use energy::{EnergyEvent, NodeComponentsEnergy, NodeEnergySource, RaplSysfs};
pub use error::{Error, Result};
pub use model::{
    new_predictor, ModelWeights, Predictor, PredictorFamily, UtilizationEstimator,
};
pub use stats::{AcceleratorSnapshot, PowerLens, Snapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
