// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! RAPL energy counters via the powercap sysfs interface
//!
//! Layout read below `<sys>/class/powercap/intel-rapl`:
//!
//! ```text
//! intel-rapl:0/name            package-0
//! intel-rapl:0/energy_uj       cumulative energy (uJ)
//! intel-rapl:0/max_energy_range_uj
//! intel-rapl:0/intel-rapl:0:0/name   core
//! intel-rapl:0/intel-rapl:0:1/name   dram
//! ```
//!
//! The domain hierarchy is scanned once per instance and cached.

use log::{debug, info};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::{EnergyEvent, NodeComponentsEnergy, NodeEnergySource};
use crate::error::{Error, Result};

const ENERGY_FILE: &str = "energy_uj";
const MAX_RANGE_FILE: &str = "max_energy_range_uj";
const DOMAIN_PREFIX: &str = "intel-rapl:";

/// (domain name, domain directory) pairs per package index. Multi-die
/// parts list several `package-N-die-M` domains under the same index.
type EventPaths = BTreeMap<u32, Vec<(String, PathBuf)>>;

#[derive(Debug, Default)]
struct Discovery {
    event_paths: EventPaths,
    supported: bool,
}

/// RAPL reader over `<sys>/class/powercap`
#[derive(Debug)]
pub struct RaplSysfs {
    rapl_root: PathBuf,
    discovery: OnceLock<Discovery>,
}

impl RaplSysfs {
    pub fn new(sys_root: impl AsRef<Path>) -> Self {
        Self {
            rapl_root: sys_root.as_ref().join("class/powercap/intel-rapl"),
            discovery: OnceLock::new(),
        }
    }

    /// Scan the counter hierarchy. Only the first call touches the
    /// filesystem; later calls return the cached table.
    pub fn discover(&self) -> usize {
        self.discovery().event_paths.len()
    }

    fn discovery(&self) -> &Discovery {
        self.discovery.get_or_init(|| {
            let event_paths = detect_event_paths(&self.rapl_root);
            let supported = event_paths
                .values()
                .flat_map(|domains| domains.iter())
                .any(|(name, dir)| {
                    name.starts_with(EnergyEvent::Package.as_str())
                        && fs::read_to_string(dir.join(ENERGY_FILE)).is_ok()
                });
            info!(
                "RAPL: found {} packages, collection supported: {}",
                event_paths.len(),
                supported
            );
            Discovery {
                event_paths,
                supported,
            }
        })
    }

    fn has_event(&self, event: EnergyEvent) -> bool {
        self.discovery()
            .event_paths
            .values()
            .any(|domains| domains.iter().any(|(name, _)| name.starts_with(event.as_str())))
    }

    /// Readable counters of `event` summed per package index
    fn read_event_energy(&self, event: EnergyEvent) -> BTreeMap<u32, u64> {
        let mut energy = BTreeMap::new();
        for (pkg, domains) in &self.discovery().event_paths {
            for (name, dir) in domains {
                if !name.starts_with(event.as_str()) {
                    continue;
                }
                match read_millijoules(&dir.join(ENERGY_FILE)) {
                    Ok(mj) => {
                        let total = energy.entry(*pkg).or_insert(0u64);
                        *total = total.saturating_add(mj);
                    }
                    Err(e) => debug!("RAPL: skipping {} of package {}: {}", name, pkg, e),
                }
            }
        }
        energy
    }
}

impl NodeEnergySource for RaplSysfs {
    fn name(&self) -> &str {
        "rapl-sysfs"
    }

    fn is_system_collection_supported(&self) -> bool {
        self.discovery().supported
    }

    fn abs_energy(&self, event: EnergyEvent) -> Result<u64> {
        if !self.has_event(event) {
            return Err(Error::EventNotFound(event.to_string()));
        }
        Ok(self.read_event_energy(event).values().sum())
    }

    fn max_energy_range(&self, event: EnergyEvent) -> Result<u64> {
        for domains in self.discovery().event_paths.values() {
            for (name, dir) in domains {
                if !name.starts_with(event.as_str()) {
                    continue;
                }
                match read_millijoules(&dir.join(MAX_RANGE_FILE)) {
                    Ok(mj) => return Ok(mj),
                    Err(e) => debug!("RAPL: no max range for {}: {}", name, e),
                }
            }
        }
        Err(Error::EventNotFound(format!("{} max energy range", event)))
    }

    fn abs_energy_from_node_components(&self) -> BTreeMap<u32, NodeComponentsEnergy> {
        let core = self.read_event_energy(EnergyEvent::Core);
        let uncore = self.read_event_energy(EnergyEvent::Uncore);
        let dram = self.read_event_energy(EnergyEvent::Dram);

        self.read_event_energy(EnergyEvent::Package)
            .into_iter()
            .map(|(pkg, pkg_energy)| {
                (
                    pkg,
                    NodeComponentsEnergy {
                        core: core.get(&pkg).copied().unwrap_or(0),
                        uncore: uncore.get(&pkg).copied().unwrap_or(0),
                        dram: dram.get(&pkg).copied().unwrap_or(0),
                        pkg: pkg_energy,
                    },
                )
            })
            .collect()
    }
}

fn read_millijoules(path: &Path) -> Result<u64> {
    let data = fs::read_to_string(path)?;
    let uj: u64 = data
        .trim()
        .parse()
        .map_err(|e| Error::Parse(format!("{}: {}", path.display(), e)))?;
    Ok(uj / 1000)
}

fn read_domain_name(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join("name"))
        .ok()
        .map(|s| s.trim().to_string())
}

fn domain_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(DOMAIN_PREFIX))
                    .unwrap_or(false)
        })
        .collect();
    dirs.sort();
    dirs
}

/// Package index from a `package-N` or `package-N-die-M` domain name,
/// else from `intel-rapl:N`
fn package_index(name: &str, dir: &Path) -> Option<u32> {
    name.strip_prefix("package-")
        .and_then(|rest| rest.split('-').next())
        .and_then(|n| n.parse().ok())
        .or_else(|| {
            dir.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(DOMAIN_PREFIX))
                .and_then(|n| n.parse().ok())
        })
}

fn detect_event_paths(rapl_root: &Path) -> EventPaths {
    let mut paths = EventPaths::new();
    for top in domain_dirs(rapl_root) {
        let Some(name) = read_domain_name(&top) else {
            continue;
        };
        if !name.starts_with(EnergyEvent::Package.as_str()) {
            debug!("RAPL: ignoring top-level domain {}", name);
            continue;
        }
        let Some(pkg) = package_index(&name, &top) else {
            debug!("RAPL: cannot derive package index for {}", top.display());
            continue;
        };

        let subs = domain_dirs(&top);
        let domains = paths.entry(pkg).or_default();
        domains.push((name, top));
        for sub in subs {
            if let Some(sub_name) = read_domain_name(&sub) {
                domains.push((sub_name, sub));
            }
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn domain(dir: &Path, name: &str, energy_uj: u64, max_uj: u64) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        fs::write(dir.join(ENERGY_FILE), format!("{}\n", energy_uj)).unwrap();
        fs::write(dir.join(MAX_RANGE_FILE), format!("{}\n", max_uj)).unwrap();
    }

    fn two_packages(sys: &Path) {
        let root = sys.join("class/powercap/intel-rapl");
        let p0 = root.join("intel-rapl:0");
        domain(&p0, "package-0", 5_000_000, 262_143_328_850);
        domain(&p0.join("intel-rapl:0:0"), "core", 2_000_000, 262_143_328_850);
        domain(&p0.join("intel-rapl:0:1"), "dram", 700_000, 65_712_999_613);

        let p1 = root.join("intel-rapl:1");
        domain(&p1, "package-1", 3_000_000, 262_143_328_850);
        domain(&p1.join("intel-rapl:1:0"), "core", 1_500_999, 262_143_328_850);
        domain(&p1.join("intel-rapl:1:1"), "uncore", 250_000, 262_143_328_850);
    }

    #[test]
    fn test_package_energy_is_summed() {
        let tmp = tempdir().unwrap();
        two_packages(tmp.path());
        let rapl = RaplSysfs::new(tmp.path());

        assert_eq!(rapl.discover(), 2);
        assert_eq!(rapl.name(), "rapl-sysfs");
        assert!(rapl.is_system_collection_supported());
        assert_eq!(rapl.abs_energy_from_package().unwrap(), 8000);
        // 2000 + 1500 (truncated)
        assert_eq!(rapl.abs_energy_from_core().unwrap(), 3500);
        assert_eq!(rapl.abs_energy_from_dram().unwrap(), 700);
        assert_eq!(rapl.abs_energy_from_uncore().unwrap(), 250);
    }

    #[test]
    fn test_node_components() {
        let tmp = tempdir().unwrap();
        two_packages(tmp.path());
        let rapl = RaplSysfs::new(tmp.path());

        let components = rapl.abs_energy_from_node_components();
        assert_eq!(components.len(), 2);
        assert_eq!(
            components[&0],
            NodeComponentsEnergy {
                core: 2000,
                uncore: 0,
                dram: 700,
                pkg: 5000,
            }
        );
        assert_eq!(components[&1].uncore, 250);
        assert_eq!(components[&1].dram, 0);
        rapl.stop_power();
    }

    #[test]
    fn test_max_energy_range() {
        let tmp = tempdir().unwrap();
        two_packages(tmp.path());
        let rapl = RaplSysfs::new(tmp.path());

        assert_eq!(rapl.max_energy_range_from_package().unwrap(), 262_143_328);
        assert_eq!(rapl.max_energy_range_from_dram().unwrap(), 65_712_999);
        assert_eq!(rapl.max_energy_range_from_core().unwrap(), 262_143_328);
        assert_eq!(rapl.max_energy_range_from_uncore().unwrap(), 262_143_328);
    }

    #[test]
    fn test_missing_event() {
        let tmp = tempdir().unwrap();
        let p0 = tmp.path().join("class/powercap/intel-rapl/intel-rapl:0");
        domain(&p0, "package-0", 1_000, 10_000);
        let rapl = RaplSysfs::new(tmp.path());

        match rapl.abs_energy_from_dram() {
            Err(Error::EventNotFound(event)) => assert_eq!(event, "dram"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(rapl.max_energy_range_from_dram().is_err());
        assert_eq!(rapl.abs_energy_from_package().unwrap(), 1);
    }

    #[test]
    fn test_unreadable_counter_is_omitted() {
        let tmp = tempdir().unwrap();
        two_packages(tmp.path());
        let rapl = RaplSysfs::new(tmp.path());
        rapl.discover();

        fs::write(
            tmp.path()
                .join("class/powercap/intel-rapl/intel-rapl:1")
                .join(ENERGY_FILE),
            "garbage",
        )
        .unwrap();
        assert_eq!(rapl.abs_energy_from_package().unwrap(), 5000);
        assert_eq!(rapl.abs_energy_from_node_components().len(), 1);
    }

    #[test]
    fn test_discovery_is_cached() {
        let tmp = tempdir().unwrap();
        let rapl = RaplSysfs::new(tmp.path());
        assert_eq!(rapl.discover(), 0);
        assert!(!rapl.is_system_collection_supported());

        // Counters appearing later are not picked up by the same instance
        two_packages(tmp.path());
        assert_eq!(rapl.discover(), 0);
        assert!(rapl.abs_energy_from_package().is_err());
        assert!(rapl.abs_energy_from_node_components().is_empty());

        assert_eq!(RaplSysfs::new(tmp.path()).discover(), 2);
    }

    #[test]
    fn test_multi_die_domains_are_all_summed() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("class/powercap/intel-rapl");
        for (i, (pkg, die)) in [(0, 0), (0, 1), (1, 0), (1, 1)].into_iter().enumerate() {
            let top = root.join(format!("intel-rapl:{}", i));
            domain(&top, &format!("package-{}-die-{}", pkg, die), 1_000_000, 10_000_000);
            domain(&top.join(format!("intel-rapl:{}:0", i)), "core", 400_000, 10_000_000);
        }
        let rapl = RaplSysfs::new(tmp.path());

        assert_eq!(rapl.discover(), 2);
        assert_eq!(rapl.abs_energy_from_package().unwrap(), 4000);
        assert_eq!(rapl.abs_energy_from_core().unwrap(), 1600);

        let components = rapl.abs_energy_from_node_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[&0].pkg, 2000);
        assert_eq!(components[&1].pkg, 2000);
        assert_eq!(components[&1].core, 800);
    }
}
