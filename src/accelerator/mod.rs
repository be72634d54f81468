// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2024 NervoSys

//! Accelerator lifecycle management
//!
//! An [`Accelerator`] wraps one backend instance and tracks whether it is
//! running. The [`AcceleratorRegistry`] holds the set of active accelerators
//! and is the only place that adds or removes them.
//!
//! Locking is two-level: the registry guards its map, and each accelerator
//! guards its own state. Registry operations never call into a backend
//! while holding the map lock.
//!
//! # Examples
//!
//! ```no_run
//! use powerlens::accelerator::AcceleratorRegistry;
//! use powerlens::config::GeneralConfig;
//! use powerlens::device::{sources, BackendRegistry, DeviceRole};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backends = BackendRegistry::new();
//! sources::register_defaults(&backends, &GeneralConfig::default())?;
//!
//! let accelerators = AcceleratorRegistry::new();
//! accelerators.init_role(&backends, DeviceRole::Qat, false)?;
//!
//! for acc in accelerators.active_accelerators_by_type(DeviceRole::Qat)? {
//!     let stats = acc.with_device(|d| d.device_utilization());
//!     println!("{}: {:?}", acc.key(), stats);
//! }
//!
//! let report = accelerators.shutdown();
//! println!("stopped {} accelerators", report.attempted());
//! # Ok(())
//! # }
//! ```

mod registry;

pub use registry::{AcceleratorKey, AcceleratorRegistry, ShutdownReport, DEFAULT_READY_TIMEOUT};

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use crate::device::{AcceleratorDevice, BackendRegistry, DeviceRole};
use crate::error::{Error, Result};

struct AcceleratorState {
    device: Option<Box<dyn AcceleratorDevice>>,
    running: bool,
    installed_at: Option<DateTime<Utc>>,
}

/// Lifecycle wrapper around one backend instance
///
/// `Stopped -> start() -> Running -> stop() -> Stopped`. A failed start
/// leaves the accelerator stopped. A failed stop is reported but still
/// leaves it stopped with the backend released.
pub struct Accelerator {
    name: String,
    role: DeviceRole,
    state: Mutex<AcceleratorState>,
}

impl Accelerator {
    /// Create a stopped accelerator for the backend registered as `name`
    pub fn new(name: impl Into<String>, role: DeviceRole) -> Self {
        Self {
            name: name.into(),
            role,
            state: Mutex::new(AcceleratorState {
                device: None,
                running: false,
                installed_at: None,
            }),
        }
    }

    /// Wrap an already initialized backend; the accelerator starts out running
    pub fn from_device(device: Box<dyn AcceleratorDevice>) -> Self {
        Self {
            name: device.name().to_string(),
            role: device.hw_type(),
            state: Mutex::new(AcceleratorState {
                device: Some(device),
                running: true,
                installed_at: Some(Utc::now()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AcceleratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring up the backend through `backends`. No-op when already running.
    pub fn start(&self, backends: &BackendRegistry) -> Result<()> {
        let mut state = self.lock();
        if state.running {
            return Ok(());
        }

        let device = backends.startup_device(&self.name).map_err(|e| {
            warn!("error creating the {} accelerator: {}", self.name, e);
            e
        })?;

        state.device = Some(device);
        state.running = true;
        state.installed_at = Some(Utc::now());
        info!("Accelerator started with type {}", self.name);
        Ok(())
    }

    /// Shut the backend down. The accelerator ends up stopped either way.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        let shut_down = match state.device.take() {
            Some(mut device) => device.shutdown(),
            None => true,
        };
        state.running = false;

        if !shut_down {
            return Err(Error::Lifecycle(format!(
                "error shutting down the {} accelerator",
                self.name
            )));
        }
        info!("Accelerator {} stopped", self.name);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Backend name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role of the wrapped backend
    pub fn accelerator_type(&self) -> DeviceRole {
        self.role
    }

    pub fn key(&self) -> AcceleratorKey {
        AcceleratorKey::new(self.role, &self.name)
    }

    /// When the backend was last started
    pub fn installed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().installed_at
    }

    /// Health of the wrapped backend; false when none is attached
    pub fn is_device_collection_supported(&self) -> bool {
        self.lock()
            .device
            .as_ref()
            .map(|d| d.is_device_collection_supported())
            .unwrap_or(false)
    }

    /// Run `f` against the backend while holding this accelerator's lock.
    /// Returns `None` when no backend is attached.
    pub fn with_device<R>(&self, f: impl FnOnce(&dyn AcceleratorDevice) -> R) -> Option<R> {
        let state = self.lock();
        match state.device.as_deref() {
            Some(device) => Some(f(device)),
            None => None,
        }
    }

    pub fn with_device_mut<R>(
        &self,
        f: impl FnOnce(&mut dyn AcceleratorDevice) -> R,
    ) -> Option<R> {
        let mut state = self.lock();
        match state.device.as_deref_mut() {
            Some(device) => Some(f(device)),
            None => None,
        }
    }
}

impl std::fmt::Debug for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // None while another caller holds the state lock
        let running = match self.state.try_lock() {
            Ok(state) => Some(state.running),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner().running),
            Err(TryLockError::WouldBlock) => None,
        };
        f.debug_struct("Accelerator")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("running", &running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sources::dummy::Dummy;
    use crate::device::start_backend;
    use std::sync::Arc;
    use std::thread;

    fn backends() -> BackendRegistry {
        let backends = BackendRegistry::new();
        backends
            .register("dummy", DeviceRole::Dummy, || start_backend(Dummy::new()))
            .unwrap();
        backends
    }

    #[test]
    fn test_is_running_reports_stored_flag() {
        let acc = Accelerator::new("dummy", DeviceRole::Dummy);
        assert!(!acc.is_running());

        let acc = Accelerator::from_device(Box::new(Dummy::new()));
        assert!(acc.is_running());
        assert_eq!(acc.accelerator_type(), DeviceRole::Dummy);
        assert_eq!(acc.name(), "dummy");
        assert!(acc.installed_at().is_some());
    }

    #[test]
    fn test_start_stop() {
        let backends = backends();
        let acc = Accelerator::new("dummy", DeviceRole::Dummy);
        assert!(acc.with_device(|d| d.name().to_string()).is_none());

        acc.start(&backends).unwrap();
        assert!(acc.is_running());
        assert_eq!(acc.with_device(|d| d.hw_type()), Some(DeviceRole::Dummy));

        acc.stop().unwrap();
        assert!(!acc.is_running());
        assert!(acc.with_device(|_| ()).is_none());
    }

    #[test]
    fn test_failed_start_stays_stopped() {
        let backends = backends();
        let acc = Accelerator::new("nvml", DeviceRole::Gpu);
        assert!(acc.start(&backends).is_err());
        assert!(!acc.is_running());
        assert!(acc.installed_at().is_none());
    }

    #[test]
    fn test_collection_flag_through_device() {
        let acc = Accelerator::from_device(Box::new(Dummy::new()));
        assert!(!acc.is_device_collection_supported());
        acc.with_device_mut(|d| d.set_device_collection_supported(true));
        assert!(acc.is_device_collection_supported());
    }

    #[test]
    fn test_debug_inside_device_closure() {
        let acc = Accelerator::from_device(Box::new(Dummy::new()));
        let inner = acc.with_device(|_| format!("{:?}", acc)).unwrap();
        assert!(inner.contains("running: None"));
        assert!(format!("{:?}", acc).contains("running: Some(true)"));
    }

    #[test]
    fn test_concurrent_readers_and_stop() {
        let acc = Arc::new(Accelerator::from_device(Box::new(Dummy::new())));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let acc = Arc::clone(&acc);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _ = acc.is_running();
                        let _ = acc.accelerator_type();
                        let _ = acc.with_device(|d| d.devices().len());
                    }
                })
            })
            .collect();

        acc.stop().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert!(!acc.is_running());
    }
}
