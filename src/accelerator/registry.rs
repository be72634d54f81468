//! Active accelerator set

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use super::Accelerator;
use crate::device::{BackendRegistry, DeviceRole};
use crate::error::{Error, Result};

/// How long [`AcceleratorRegistry::create`] waits for a backend to report healthy
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Active-set key: role plus backend name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AcceleratorKey {
    pub role: DeviceRole,
    pub name: String,
}

impl AcceleratorKey {
    pub fn new(role: DeviceRole, name: impl Into<String>) -> Self {
        Self {
            role,
            name: name.into(),
        }
    }
}

impl fmt::Display for AcceleratorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.name)
    }
}

/// Per-accelerator outcome of [`AcceleratorRegistry::shutdown`]
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub results: Vec<(AcceleratorKey, Result<()>)>,
}

impl ShutdownReport {
    /// Number of accelerators a stop was attempted on
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&AcceleratorKey, &Error)> {
        self.results
            .iter()
            .filter_map(|(key, res)| res.as_ref().err().map(|e| (key, e)))
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Set of running accelerators, keyed by role and backend name
pub struct AcceleratorRegistry {
    active: RwLock<HashMap<AcceleratorKey, Arc<Accelerator>>>,
    ready_timeout: Duration,
}

impl Default for AcceleratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorRegistry {
    pub fn new() -> Self {
        Self::with_ready_timeout(DEFAULT_READY_TIMEOUT)
    }

    pub fn with_ready_timeout(ready_timeout: Duration) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            ready_timeout,
        }
    }

    /// Construct and start the accelerator for backend `name`.
    ///
    /// The result is not added to the active set; pass it to
    /// [`must_register`](Self::must_register). With `wait_ready` the call
    /// blocks up to the ready timeout for the backend to report healthy.
    pub fn create(
        &self,
        backends: &BackendRegistry,
        name: &str,
        wait_ready: bool,
    ) -> Result<Arc<Accelerator>> {
        let role = backends
            .device_role(name)
            .ok_or_else(|| Error::UnsupportedType {
                name: name.to_string(),
                supported: backends.all_devices(),
            })?;

        let acc = Accelerator::new(name, role);
        acc.start(backends)?;

        if wait_ready {
            self.wait_ready(&acc);
        }
        Ok(Arc::new(acc))
    }

    fn wait_ready(&self, acc: &Accelerator) {
        let deadline = Instant::now() + self.ready_timeout;
        while !acc.is_device_collection_supported() {
            if Instant::now() >= deadline {
                warn!(
                    "{} did not report ready within {:?}",
                    acc.key(),
                    self.ready_timeout
                );
                return;
            }
            thread::sleep(READY_POLL_INTERVAL);
        }
        debug!("{} ready", acc.key());
    }

    /// Insert into the active set.
    ///
    /// An existing entry under the same key is replaced and handed back.
    /// Stopping it is the caller's job.
    pub fn must_register(&self, acc: Arc<Accelerator>) -> Option<Arc<Accelerator>> {
        let key = acc.key();
        let previous = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            active.insert(key.clone(), acc)
        };

        if let Some(prev) = &previous {
            if prev.is_running() {
                warn!("replaced accelerator {} while it was still running", key);
            }
        }
        info!("Registered accelerator {}", key);
        previous
    }

    /// Snapshot of the active set
    pub fn accelerators(&self) -> HashMap<AcceleratorKey, Arc<Accelerator>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active accelerators of `role` whose backend reports collection support,
    /// sorted by name
    pub fn active_accelerators_by_type(&self, role: DeviceRole) -> Result<Vec<Arc<Accelerator>>> {
        let candidates: Vec<Arc<Accelerator>> = self
            .accelerators()
            .into_iter()
            .filter(|(key, _)| key.role == role)
            .map(|(_, acc)| acc)
            .collect();

        let mut found: Vec<Arc<Accelerator>> = candidates
            .into_iter()
            .filter(|acc| acc.is_device_collection_supported())
            .collect();

        if found.is_empty() {
            return Err(Error::NotFound(format!("no active {} accelerator", role)));
        }
        found.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(found)
    }

    /// Remove `key` from the active set and stop it.
    ///
    /// The entry is gone even when the stop fails.
    pub fn stop(&self, key: &AcceleratorKey) -> Result<()> {
        let removed = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            active.remove(key)
        };
        match removed {
            Some(acc) => acc.stop(),
            None => Err(Error::NotFound(format!("accelerator {} is not active", key))),
        }
    }

    /// Stop every active accelerator and clear the set.
    ///
    /// A failing stop never prevents the remaining ones from being stopped.
    pub fn shutdown(&self) -> ShutdownReport {
        let drained: Vec<(AcceleratorKey, Arc<Accelerator>)> = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            active.drain().collect()
        };

        let mut report = ShutdownReport::default();
        for (key, acc) in drained {
            let res = acc.stop();
            if let Err(e) = &res {
                error!("failed to stop accelerator {}: {}", key, e);
            }
            report.results.push((key, res));
        }
        report.results.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Start the first backend registered under `role` that comes up and
    /// add it to the active set.
    pub fn init_role(
        &self,
        backends: &BackendRegistry,
        role: DeviceRole,
        wait_ready: bool,
    ) -> Result<Arc<Accelerator>> {
        let names = backends.devices_for_role(role);
        if names.is_empty() {
            return Err(Error::NotFound(format!("no {} backend registered", role)));
        }

        for name in names {
            match self.create(backends, &name, wait_ready) {
                Ok(acc) => {
                    if let Some(prev) = self.must_register(Arc::clone(&acc)) {
                        if let Err(e) = prev.stop() {
                            warn!("failed to stop replaced accelerator {}: {}", prev.key(), e);
                        }
                    }
                    return Ok(acc);
                }
                Err(e) => info!("{} backend {} unavailable: {}", role, name, e),
            }
        }
        Err(Error::NotFound(format!(
            "no {} backend could be started",
            role
        )))
    }
}
