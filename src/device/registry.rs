//! Backend registry
//!
//! Table of backend constructors keyed by role and name. Duplicate names
//! within a role are refused; a small priority table lets a richer backend
//! displace a bare one that drives the same hardware.

use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::{AcceleratorDevice, DeviceRole};
use crate::error::{Error, Result};

/// Constructor that brings up a ready backend instance
pub type DeviceStartupFn = Arc<dyn Fn() -> Result<Box<dyn AcceleratorDevice>> + Send + Sync>;

/// (role, preferred, displaced): `preferred` wins over `displaced` in either registration order
const PRIORITY_OVERRIDES: &[(DeviceRole, &str, &str)] = &[(DeviceRole::Gpu, "dcgm", "nvml")];

/// Outcome of a successful [`BackendRegistry::register`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Added to the table
    Registered,
    /// Added, and a lower-priority backend was evicted
    Replaced { evicted: String },
    /// Not added because a higher-priority backend is already present
    Suppressed { by: String },
}

type Table = BTreeMap<DeviceRole, BTreeMap<String, DeviceStartupFn>>;

/// Process-wide table of backend constructors, owned by the caller
#[derive(Default)]
pub struct BackendRegistry {
    table: RwLock<Table>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend constructor under `name` and `role`.
    ///
    /// Registering the same name twice within a role is a configuration
    /// error.
    pub fn register<F>(&self, name: &str, role: DeviceRole, startup: F) -> Result<Registration>
    where
        F: Fn() -> Result<Box<dyn AcceleratorDevice>> + Send + Sync + 'static,
    {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let entries = table.entry(role).or_default();

        if entries.contains_key(name) {
            return Err(Error::DuplicateBackend {
                role,
                name: name.to_string(),
            });
        }

        let mut outcome = Registration::Registered;
        for (override_role, preferred, displaced) in PRIORITY_OVERRIDES {
            if *override_role != role {
                continue;
            }
            if name == *displaced && entries.contains_key(*preferred) {
                info!("{} already registered, not registering {}", preferred, name);
                return Ok(Registration::Suppressed {
                    by: preferred.to_string(),
                });
            }
            if name == *preferred && entries.remove(*displaced).is_some() {
                info!("{} takes priority, evicted {}", name, displaced);
                outcome = Registration::Replaced {
                    evicted: displaced.to_string(),
                };
            }
        }

        entries.insert(name.to_string(), Arc::new(startup));
        info!("Registered {} ({})", name, role);
        Ok(outcome)
    }

    /// Sorted backend names registered for `role`
    pub fn devices_for_role(&self, role: DeviceRole) -> Vec<String> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get(&role)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn gpu_devices(&self) -> Vec<String> {
        self.devices_for_role(DeviceRole::Gpu)
    }

    pub fn qat_devices(&self) -> Vec<String> {
        self.devices_for_role(DeviceRole::Qat)
    }

    pub fn dummy_devices(&self) -> Vec<String> {
        self.devices_for_role(DeviceRole::Dummy)
    }

    /// Every registered backend name, sorted
    pub fn all_devices(&self) -> Vec<String> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = table
            .values()
            .flat_map(|entries| entries.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Role a backend name is registered under
    pub fn device_role(&self, name: &str) -> Option<DeviceRole> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .iter()
            .find(|(_, entries)| entries.contains_key(name))
            .map(|(role, _)| *role)
    }

    /// Constructor registered for `name`
    pub fn constructor(&self, name: &str) -> Result<DeviceStartupFn> {
        let found = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            table
                .values()
                .find_map(|entries| entries.get(name).cloned())
        };
        found.ok_or_else(|| Error::UnsupportedType {
            name: name.to_string(),
            supported: self.all_devices(),
        })
    }

    /// Construct and initialize the backend registered as `name`.
    ///
    /// The table lock is released before the constructor runs, since
    /// backend bring-up may block on driver I/O.
    pub fn startup_device(&self, name: &str) -> Result<Box<dyn AcceleratorDevice>> {
        let startup = self.constructor(name)?;
        info!("Starting up {}", name);
        let device = startup()?;
        debug!(
            "{} started, collection supported: {}",
            name,
            device.is_device_collection_supported()
        );
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sources::dummy::Dummy;
    use crate::device::start_backend;

    fn dummy_startup() -> Result<Box<dyn AcceleratorDevice>> {
        start_backend(Dummy::new())
    }

    #[test]
    fn test_duplicate_registration_is_refused() {
        let registry = BackendRegistry::new();
        registry
            .register("dummy", DeviceRole::Dummy, dummy_startup)
            .unwrap();
        let err = registry
            .register("dummy", DeviceRole::Dummy, dummy_startup)
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(registry.dummy_devices(), vec!["dummy".to_string()]);
    }

    #[test]
    fn test_same_name_in_other_role_is_allowed() {
        let registry = BackendRegistry::new();
        registry.register("x", DeviceRole::Dummy, dummy_startup).unwrap();
        registry.register("x", DeviceRole::Qat, dummy_startup).unwrap();
        assert_eq!(registry.all_devices(), vec!["x".to_string()]);
    }

    #[test]
    fn test_preferred_backend_evicts_earlier_one() {
        let registry = BackendRegistry::new();
        registry.register("nvml", DeviceRole::Gpu, dummy_startup).unwrap();
        let outcome = registry.register("dcgm", DeviceRole::Gpu, dummy_startup).unwrap();
        assert_eq!(
            outcome,
            Registration::Replaced {
                evicted: "nvml".to_string()
            }
        );
        assert_eq!(registry.gpu_devices(), vec!["dcgm".to_string()]);
    }

    #[test]
    fn test_preferred_backend_suppresses_later_one() {
        let registry = BackendRegistry::new();
        registry.register("dcgm", DeviceRole::Gpu, dummy_startup).unwrap();
        let outcome = registry.register("nvml", DeviceRole::Gpu, dummy_startup).unwrap();
        assert_eq!(
            outcome,
            Registration::Suppressed {
                by: "dcgm".to_string()
            }
        );
        assert_eq!(registry.gpu_devices(), vec!["dcgm".to_string()]);
    }

    #[test]
    fn test_lookup() {
        let registry = BackendRegistry::new();
        registry.register("dummy", DeviceRole::Dummy, dummy_startup).unwrap();
        registry.register("nvml", DeviceRole::Gpu, dummy_startup).unwrap();

        assert_eq!(registry.device_role("nvml"), Some(DeviceRole::Gpu));
        assert_eq!(registry.device_role("dummy"), Some(DeviceRole::Dummy));
        assert_eq!(registry.device_role("habana"), None);
        assert_eq!(
            registry.all_devices(),
            vec!["dummy".to_string(), "nvml".to_string()]
        );

        match registry.startup_device("habana") {
            Err(Error::UnsupportedType { name, supported }) => {
                assert_eq!(name, "habana");
                assert_eq!(supported, vec!["dummy".to_string(), "nvml".to_string()]);
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("expected an error"),
        }

        let device = registry.startup_device("dummy").unwrap();
        assert_eq!(device.name(), "dummy");
    }
}
