//! Intel QuickAssist (QAT) telemetry backend
//!
//! QAT endpoints are discovered on the PCI bus. Telemetry is switched on by
//! writing `1` to `<debugfs>/qat_<driver>_<bdf>/telemetry/control` and read
//! back from `device_data` in the same directory as whitespace-separated
//! `key value` pairs.

use log::{debug, error, info};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::pci::PciBus;
use crate::device::{
    AcceleratorDevice, DeviceHandle, DeviceRole, ProcessUtilizationSample, QatUtilizationSample,
};
use crate::error::{Error, Result};

pub const QAT_DEVICE: &str = "qat";

/// Telemetry switch values
const TELEMETRY_OFF: u8 = 0;
const TELEMETRY_ON: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QatDevInfo {
    bdf: String,
    driver: String,
    telemetry_dir: PathBuf,
}

impl QatDevInfo {
    fn control_path(&self) -> PathBuf {
        self.telemetry_dir.join("control")
    }

    fn data_path(&self) -> PathBuf {
        self.telemetry_dir.join("device_data")
    }
}

/// QAT telemetry collector
#[derive(Debug)]
pub struct QatTelemetry {
    pci: PciBus,
    debugfs_root: PathBuf,
    /// Keyed by PCI address
    devices: BTreeMap<String, QatDevInfo>,
    collection_supported: bool,
}

impl QatTelemetry {
    /// `sys_root` is the sysfs mount (normally `/sys`), `debugfs_root` the
    /// debugfs mount (normally `/sys/kernel/debug`)
    pub fn new(sys_root: impl AsRef<Path>, debugfs_root: impl Into<PathBuf>) -> Self {
        Self {
            pci: PciBus::new(sys_root),
            debugfs_root: debugfs_root.into(),
            devices: BTreeMap::new(),
            collection_supported: false,
        }
    }

    /// PCI addresses of the devices currently collected
    pub fn device_addresses(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    fn discover(&self) -> Result<BTreeMap<String, QatDevInfo>> {
        let mut found = BTreeMap::new();
        for device in self.pci.list_devices()? {
            if !device.is_qat() {
                continue;
            }
            if !self.pci.is_qat_status_up(&device.address) {
                error!(
                    "found a QAT device {} but its status is down, skipping",
                    device.address
                );
                continue;
            }
            let driver = device.driver.clone().unwrap_or_default();
            let telemetry_dir = self
                .debugfs_root
                .join(format!("qat_{}_{}", driver, device.address))
                .join("telemetry");
            found.insert(
                device.address.clone(),
                QatDevInfo {
                    bdf: device.address,
                    driver,
                    telemetry_dir,
                },
            );
        }

        if found.is_empty() {
            return Err(Error::NotFound(
                "unable to find an available QAT device, please check the status of QAT"
                    .to_string(),
            ));
        }
        Ok(found)
    }

    /// Switch telemetry for every known device, dropping the ones that fail
    fn control_telemetry(&mut self, mode: u8) -> Result<()> {
        self.devices.retain(|bdf, info| {
            match fs::write(info.control_path(), mode.to_string()) {
                Ok(()) => true,
                Err(e) => {
                    error!(
                        "failed to control QAT device {} ({}) with mode {}: {}",
                        bdf, info.driver, mode, e
                    );
                    false
                }
            }
        });

        if self.devices.is_empty() {
            return Err(Error::NotFound(
                "unable to control any QAT device, please check the status of QAT".to_string(),
            ));
        }
        Ok(())
    }

    /// Keep only devices whose telemetry data file is readable
    fn check_data_files(&mut self) -> Result<()> {
        self.devices.retain(|bdf, info| match fs::File::open(info.data_path()) {
            Ok(_) => true,
            Err(e) => {
                error!("failed to open QAT {} telemetry data file: {}", bdf, e);
                false
            }
        });

        if self.devices.is_empty() {
            return Err(Error::NotFound(
                "unable to open any telemetry data file for QAT".to_string(),
            ));
        }
        Ok(())
    }
}

impl AcceleratorDevice for QatTelemetry {
    fn name(&self) -> &str {
        QAT_DEVICE
    }

    fn device_type(&self) -> &str {
        QAT_DEVICE
    }

    fn hw_type(&self) -> DeviceRole {
        DeviceRole::Qat
    }

    fn init_lib(&mut self) -> Result<()> {
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.collection_supported = false;
        self.devices = self.discover()?;
        self.control_telemetry(TELEMETRY_ON)?;
        self.check_data_files()?;

        info!("found {} QAT devices", self.devices.len());
        self.collection_supported = true;
        Ok(())
    }

    fn shutdown(&mut self) -> bool {
        if self.devices.is_empty() {
            return true;
        }
        let ok = self.control_telemetry(TELEMETRY_OFF).is_ok();
        self.collection_supported = false;
        ok
    }

    fn devices(&self) -> BTreeMap<u32, DeviceHandle> {
        self.devices
            .keys()
            .enumerate()
            .map(|(id, bdf)| (id as u32, DeviceHandle::new(bdf.clone(), id as u32)))
            .collect()
    }

    fn process_resource_utilization_per_device(
        &self,
        _device: &DeviceHandle,
        _since: Duration,
    ) -> Result<HashMap<u32, ProcessUtilizationSample>> {
        Ok(HashMap::new())
    }

    fn device_utilization(&self) -> Result<BTreeMap<String, QatUtilizationSample>> {
        let mut stats = BTreeMap::new();
        for (bdf, info) in &self.devices {
            match read_utilization(&info.data_path()) {
                Ok(sample) => {
                    stats.insert(info.bdf.clone(), sample);
                }
                Err(e) => debug!("failed to get QAT utilization on device {}: {}", bdf, e),
            }
        }
        Ok(stats)
    }

    fn is_device_collection_supported(&self) -> bool {
        self.collection_supported
    }

    fn set_device_collection_supported(&mut self, supported: bool) {
        self.collection_supported = supported;
    }
}

fn read_utilization(path: &Path) -> Result<QatUtilizationSample> {
    let data = fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Err(Error::Parse(format!("{} is empty", path.display())));
    }
    Ok(parse_device_data(&data))
}

/// Aggregate a `device_data` dump into one sample. Per-slice utilization
/// keys are summed by function prefix.
pub fn parse_device_data(data: &str) -> QatUtilizationSample {
    let fields: Vec<&str> = data.split_whitespace().collect();
    let mut values: HashMap<&str, u64> = HashMap::new();
    for pair in fields.chunks_exact(2) {
        values.insert(pair[0], pair[1].parse().unwrap_or(0));
    }

    let mut sample = QatUtilizationSample {
        sample_cnt: values.get("sample_cnt").copied().unwrap_or(0),
        pci_trans_cnt: values.get("pci_trans_cnt").copied().unwrap_or(0),
        latency: values.get("lat_acc_avg").copied().unwrap_or(0),
        bw_in: values.get("bw_in").copied().unwrap_or(0),
        bw_out: values.get("bw_out").copied().unwrap_or(0),
        ..Default::default()
    };

    for (key, value) in values {
        if key.starts_with("util_cpr") {
            sample.cpr_util = sample.cpr_util.saturating_add(value);
        } else if key.starts_with("util_dcpr") {
            sample.dcpr_util = sample.dcpr_util.saturating_add(value);
        } else if key.starts_with("util_xlt") {
            sample.xlt_util = sample.xlt_util.saturating_add(value);
        } else if key.starts_with("util_cph") {
            sample.cph_util = sample.cph_util.saturating_add(value);
        } else if key.starts_with("util_ath") {
            sample.ath_util = sample.ath_util.saturating_add(value);
        }
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DEVICE_DATA: &str = "sample_cnt 8\npci_trans_cnt 120\nlat_acc_avg 42\nbw_in 1000\nbw_out 900\n\
        util_cpr0 10\nutil_cpr1 5\nutil_dcpr0 7\nutil_xlt0 1\nutil_cph0 20\nutil_cph1 2\nutil_ath0 3\n";

    fn fake_node(root: &Path) -> (PathBuf, PathBuf) {
        let sys = root.join("sys");
        let debugfs = root.join("debug");
        let dev = sys.join("bus/pci/devices/0000:6b:00.0");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("vendor"), "0x8086\n").unwrap();
        fs::write(dev.join("device"), "0x4940\n").unwrap();

        let telemetry = debugfs.join("qat__0000:6b:00.0/telemetry");
        fs::create_dir_all(&telemetry).unwrap();
        fs::write(telemetry.join("control"), "0").unwrap();
        fs::write(telemetry.join("device_data"), DEVICE_DATA).unwrap();
        (sys, debugfs)
    }

    #[test]
    fn test_parse_device_data() {
        let sample = parse_device_data(DEVICE_DATA);
        assert_eq!(sample.sample_cnt, 8);
        assert_eq!(sample.latency, 42);
        assert_eq!(sample.cpr_util, 15);
        assert_eq!(sample.dcpr_util, 7);
        assert_eq!(sample.cph_util, 22);
        assert_eq!(sample.ath_util, 3);
    }

    #[test]
    fn test_parse_device_data_saturates() {
        let data = format!("util_cpr0 {}\nutil_cpr1 5\nutil_ath0 7\n", u64::MAX);
        let sample = parse_device_data(&data);
        assert_eq!(sample.cpr_util, u64::MAX);
        assert_eq!(sample.ath_util, 7);
    }

    #[test]
    fn test_init_fails_without_devices() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("sys/bus/pci/devices")).unwrap();
        let mut qat = QatTelemetry::new(tmp.path().join("sys"), tmp.path().join("debug"));
        assert!(qat.init().is_err());
        assert!(!qat.is_device_collection_supported());
        assert!(qat.shutdown());
    }

    #[test]
    fn test_lifecycle() {
        let tmp = tempdir().unwrap();
        let (sys, debugfs) = fake_node(tmp.path());
        let control = debugfs.join("qat__0000:6b:00.0/telemetry/control");

        let mut qat = QatTelemetry::new(&sys, &debugfs);
        qat.init().unwrap();
        assert!(qat.is_device_collection_supported());
        assert_eq!(fs::read_to_string(&control).unwrap(), "1");
        assert_eq!(qat.device_addresses(), vec!["0000:6b:00.0"]);
        assert_eq!(qat.devices().len(), 1);

        let stats = qat.device_utilization().unwrap();
        assert_eq!(stats["0000:6b:00.0"].cpr_util, 15);

        assert!(qat.shutdown());
        assert_eq!(fs::read_to_string(&control).unwrap(), "0");
        assert!(!qat.is_device_collection_supported());
    }

    #[test]
    fn test_down_device_is_skipped() {
        let tmp = tempdir().unwrap();
        let (sys, debugfs) = fake_node(tmp.path());
        let state_dir = sys.join("bus/pci/devices/0000:6b:00.0/qat/qat0");
        fs::create_dir_all(&state_dir).unwrap();
        fs::write(state_dir.join("operstate"), "down\n").unwrap();

        let mut qat = QatTelemetry::new(&sys, &debugfs);
        assert!(qat.init().is_err());
    }
}
