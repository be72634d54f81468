//! PCI helpers over sysfs
//!
//! Reads `<sys>/bus/pci/devices/<addr>/...` for device identification, QAT
//! interface state and SR-IOV virtual functions.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const TOTAL_VF_FILE: &str = "sriov_totalvfs";
const CONFIGURED_VF_FILE: &str = "sriov_numvfs";

/// Intel PCI vendor id
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// Device ids of Intel QuickAssist physical and virtual functions
const QAT_DEVICE_IDS: &[u16] = &[
    0x0434, 0x0435, 0x0443, // DH895xCC
    0x19e2, 0x19e3, // C3xxx
    0x37c8, 0x37c9, // C62x
    0x6f54, 0x6f55, // D15xx
    0x18ee, 0x18ef, // 200xx
    0x18a0, 0x18a1, // C4xxx
    0x4940, 0x4941, 0x4942, 0x4943, 0x4944, 0x4945, 0x4946, 0x4947, // 4xxx
];

/// One PCI function found under sysfs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevice {
    /// Bus/device/function address, e.g. "0000:6b:00.0"
    pub address: String,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Bound kernel driver, if any
    pub driver: Option<String>,
}

impl PciDevice {
    /// Whether this function is an Intel QuickAssist endpoint
    pub fn is_qat(&self) -> bool {
        self.vendor_id == INTEL_VENDOR_ID && QAT_DEVICE_IDS.contains(&self.device_id)
    }
}

/// View of the PCI device tree rooted at a sysfs mount
#[derive(Debug, Clone)]
pub struct PciBus {
    devices_dir: PathBuf,
}

impl PciBus {
    /// `sys_root` is the sysfs mount point, normally `/sys`
    pub fn new(sys_root: impl AsRef<Path>) -> Self {
        Self {
            devices_dir: sys_root.as_ref().join("bus/pci/devices"),
        }
    }

    pub fn devices_dir(&self) -> &Path {
        &self.devices_dir
    }

    /// List every PCI function with readable vendor and device ids
    pub fn list_devices(&self) -> Result<Vec<PciDevice>> {
        let mut devices = Vec::new();
        for entry in fs::read_dir(&self.devices_dir)?.flatten() {
            let address = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            let (Some(vendor_id), Some(device_id)) = (
                read_hex_id(&path.join("vendor")),
                read_hex_id(&path.join("device")),
            ) else {
                debug!("skipping PCI device {} without ids", address);
                continue;
            };

            let driver = fs::read_link(path.join("driver"))
                .ok()
                .and_then(|link| link.file_name().map(|n| n.to_string_lossy().to_string()));

            devices.push(PciDevice {
                address,
                vendor_id,
                device_id,
                driver,
            });
        }
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    /// Returns false only if some `qat/*/operstate` file of the device is
    /// unreadable or holds anything other than "up". A device without
    /// operstate files is assumed up.
    pub fn is_qat_status_up(&self, address: &str) -> bool {
        let qat_dir = self.devices_dir.join(address).join("qat");
        let Ok(entries) = fs::read_dir(&qat_dir) else {
            return true;
        };

        for entry in entries.flatten() {
            let operstate = entry.path().join("operstate");
            if !operstate.exists() {
                continue;
            }
            match fs::read_to_string(&operstate) {
                Ok(state) if state.trim() == "up" => {}
                _ => return false,
            }
        }
        true
    }

    /// PCI addresses of all virtual functions of physical function `pf`
    pub fn vf_list(&self, pf: &str) -> Result<Vec<String>> {
        let pf_dir = self.devices_dir.join(pf);
        fs::symlink_metadata(&pf_dir).map_err(|e| {
            Error::NotFound(format!(
                "could not get PF directory information for device {}: {}",
                pf, e
            ))
        })?;

        let mut vfs = Vec::new();
        for entry in fs::read_dir(&pf_dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("virtfn") {
                continue;
            }
            let is_link = entry
                .file_type()
                .map(|t| t.is_symlink())
                .unwrap_or(false);
            if !is_link {
                continue;
            }
            if let Ok(target) = fs::read_link(entry.path()) {
                if let Some(addr) = target.file_name() {
                    vfs.push(addr.to_string_lossy().to_string());
                }
            }
        }
        vfs.sort();
        Ok(vfs)
    }

    /// PCI address of virtual function number `vf` of `pf`
    pub fn pci_addr_from_vf_id(&self, pf: &str, vf: u32) -> Result<String> {
        let vf_dir = self.devices_dir.join(pf).join(format!("virtfn{}", vf));
        let meta = fs::symlink_metadata(&vf_dir).map_err(|e| {
            Error::NotFound(format!(
                "could not get directory information for device {}, VF {}: {}",
                pf, vf, e
            ))
        })?;
        if !meta.file_type().is_symlink() {
            return Err(Error::NotFound(format!(
                "no symbolic link between virtual function and PCI - device {}, VF {}",
                pf, vf
            )));
        }

        let target = fs::read_link(&vf_dir)?;
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::Parse(format!("bad VF link target {}", target.display())))
    }

    /// Maximum number of VFs the device supports; 0 when unknown
    pub fn sriov_vf_capacity(&self, pf: &str) -> u32 {
        read_u32(&self.devices_dir.join(pf).join(TOTAL_VF_FILE)).unwrap_or(0)
    }

    /// Number of VFs currently configured; 0 when unknown
    pub fn sriov_vf_configured(&self, pf: &str) -> u32 {
        read_u32(&self.devices_dir.join(pf).join(CONFIGURED_VF_FILE)).unwrap_or(0)
    }

    pub fn sriov_configured(&self, pf: &str) -> bool {
        self.sriov_vf_configured(pf) > 0
    }
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let raw = fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u16::from_str_radix(digits, 16).ok()
}

fn read_u32(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn add_device(root: &Path, addr: &str, vendor: &str, device: &str) -> PathBuf {
        let dir = root.join("bus/pci/devices").join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
        dir
    }

    #[test]
    fn test_qat_status_without_operstate_is_up() {
        let tmp = tempdir().unwrap();
        add_device(tmp.path(), "0000:6b:00.0", "0x8086", "0x4940");
        let bus = PciBus::new(tmp.path());
        assert!(bus.is_qat_status_up("0000:6b:00.0"));
        assert!(bus.is_qat_status_up("0000:ff:00.0"));
    }

    #[test]
    fn test_qat_status_follows_operstate() {
        let tmp = tempdir().unwrap();
        let dev = add_device(tmp.path(), "0000:6b:00.0", "0x8086", "0x4940");
        fs::create_dir_all(dev.join("qat/qat0")).unwrap();
        fs::write(dev.join("qat/qat0/operstate"), "up\n").unwrap();

        let bus = PciBus::new(tmp.path());
        assert!(bus.is_qat_status_up("0000:6b:00.0"));

        fs::create_dir_all(dev.join("qat/qat1")).unwrap();
        fs::write(dev.join("qat/qat1/operstate"), "down\n").unwrap();
        assert!(!bus.is_qat_status_up("0000:6b:00.0"));
    }

    #[test]
    fn test_list_devices_identifies_qat() {
        let tmp = tempdir().unwrap();
        add_device(tmp.path(), "0000:6b:00.0", "0x8086", "0x4940");
        add_device(tmp.path(), "0000:01:00.0", "0x10de", "0x2204");

        let devices = PciBus::new(tmp.path()).list_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, "0000:01:00.0");
        assert!(!devices[0].is_qat());
        assert!(devices[1].is_qat());
        assert_eq!(devices[1].driver, None);
    }

    #[test]
    #[cfg(unix)]
    fn test_sriov() {
        use std::os::unix::fs::symlink;

        let tmp = tempdir().unwrap();
        let pf = add_device(tmp.path(), "0000:6b:00.0", "0x8086", "0x4940");
        add_device(tmp.path(), "0000:6b:00.1", "0x8086", "0x4941");
        fs::write(pf.join(TOTAL_VF_FILE), "16\n").unwrap();
        fs::write(pf.join(CONFIGURED_VF_FILE), "1\n").unwrap();
        symlink("../0000:6b:00.1", pf.join("virtfn0")).unwrap();

        let bus = PciBus::new(tmp.path());
        assert_eq!(bus.sriov_vf_capacity("0000:6b:00.0"), 16);
        assert!(bus.sriov_configured("0000:6b:00.0"));
        assert_eq!(bus.vf_list("0000:6b:00.0").unwrap(), vec!["0000:6b:00.1"]);
        assert_eq!(
            bus.pci_addr_from_vf_id("0000:6b:00.0", 0).unwrap(),
            "0000:6b:00.1"
        );
        assert!(bus.pci_addr_from_vf_id("0000:6b:00.0", 3).is_err());
        assert!(bus.vf_list("0000:00:00.0").is_err());
    }
}
