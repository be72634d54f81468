//! Configuration management for powerlens
//!
//! Filesystem roots, which accelerator roles to bring up, and where the
//! pre-trained model weights live.

use crate::device::DeviceRole;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// powerlens configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem roots and sampling cadence
    #[serde(default)]
    pub general: GeneralConfig,
    /// Accelerator roles to activate
    #[serde(default)]
    pub accelerators: AcceleratorConfig,
    /// Power model selection
    #[serde(default)]
    pub model: ModelConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// sysfs mount point
    #[serde(default = "default_sys_root")]
    pub sys_root: PathBuf,
    /// debugfs mount point (QAT telemetry)
    #[serde(default = "default_debugfs_root")]
    pub debugfs_root: PathBuf,
    /// Sampling interval in milliseconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

/// Accelerator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceleratorConfig {
    #[serde(default)]
    pub enable_gpu: bool,
    #[serde(default)]
    pub enable_qat: bool,
    /// Block on startup until a backend reports healthy
    #[serde(default = "default_true")]
    pub wait_ready: bool,
    /// Upper bound for `wait_ready`, in milliseconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
}

/// Power model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Predictor family name
    #[serde(default = "default_predictor")]
    pub predictor: String,
    /// JSON file holding the trained weights
    #[serde(default)]
    pub weights_path: Option<PathBuf>,
}

// Default value functions
fn default_sys_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_debugfs_root() -> PathBuf {
    PathBuf::from("/sys/kernel/debug")
}

fn default_sample_interval() -> u64 {
    3000 // 3 seconds
}

fn default_true() -> bool {
    true
}

fn default_ready_timeout() -> u64 {
    5000
}

fn default_predictor() -> String {
    "exponential".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            sys_root: default_sys_root(),
            debugfs_root: default_debugfs_root(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl GeneralConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            enable_gpu: false,
            enable_qat: false,
            wait_ready: true,
            ready_timeout_ms: default_ready_timeout(),
        }
    }
}

impl AcceleratorConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Roles switched on, in activation order
    pub fn enabled_roles(&self) -> Vec<DeviceRole> {
        let mut roles = Vec::new();
        if self.enable_gpu {
            roles.push(DeviceRole::Gpu);
        }
        if self.enable_qat {
            roles.push(DeviceRole::Qat);
        }
        roles
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            predictor: default_predictor(),
            weights_path: None,
        }
    }
}

impl Config {
    /// Get the default configuration directory
    ///
    /// Returns `$XDG_CONFIG_HOME/powerlens`, falling back to
    /// `~/.config/powerlens`.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(|_| PathBuf::from(".config"));

        Ok(config_dir.join("powerlens"))
    }

    /// Load configuration from the default path, or defaults if there is none
    pub fn load() -> Result<Self> {
        let config_file = Self::default_path()?.join("config.toml");

        if !config_file.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&config_file)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_dir = Self::default_path()?;
        std::fs::create_dir_all(&config_dir)?;
        self.save_to(&config_dir.join("config.toml"))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.sys_root, PathBuf::from("/sys"));
        assert_eq!(config.general.sample_interval(), Duration::from_secs(3));
        assert!(config.accelerators.wait_ready);
        assert!(config.accelerators.enabled_roles().is_empty());
        assert_eq!(config.model.predictor, "exponential");
        assert!(config.model.weights_path.is_none());
    }

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [accelerators]
            enable_qat = true
            ready_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.accelerators.enabled_roles(), vec![DeviceRole::Qat]);
        assert_eq!(config.accelerators.ready_timeout(), Duration::from_millis(250));
        assert!(config.accelerators.wait_ready);
        assert_eq!(config.general.debugfs_root, PathBuf::from("/sys/kernel/debug"));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = Config::default();
        config.general.sys_root = tmp.path().join("sys");
        config.accelerators.enable_gpu = true;
        config.model.weights_path = Some(tmp.path().join("weights.json"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.general.sys_root, tmp.path().join("sys"));
        assert_eq!(loaded.accelerators.enabled_roles(), vec![DeviceRole::Gpu]);
        assert_eq!(loaded.model.weights_path, config.model.weights_path);
    }

    #[test]
    fn test_malformed_config() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[general\nsys_root = ").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.is_configuration());
    }
}
