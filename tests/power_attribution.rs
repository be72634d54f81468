//! End-to-end checks across registry, lifecycle, energy and model layers.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use tempfile::tempdir;

use powerlens::device::pci::PciBus;
use powerlens::device::sources::dummy::Dummy;
use powerlens::device::start_backend;
use powerlens::{
    new_predictor, Accelerator, AcceleratorDevice, AcceleratorRegistry, BackendRegistry,
    DeviceHandle, DeviceRole, Error, ModelWeights, NodeEnergySource, PredictorFamily,
    ProcessUtilizationSample, RaplSysfs, Registration, Result,
};

/// GPU backend double that is healthy once initialized
struct FakeGpu {
    name: &'static str,
    supported: bool,
}

impl FakeGpu {
    fn startup(name: &'static str) -> Result<Box<dyn AcceleratorDevice>> {
        start_backend(FakeGpu {
            name,
            supported: false,
        })
    }
}

impl AcceleratorDevice for FakeGpu {
    fn name(&self) -> &str {
        self.name
    }

    fn device_type(&self) -> &str {
        self.name
    }

    fn hw_type(&self) -> DeviceRole {
        DeviceRole::Gpu
    }

    fn init_lib(&mut self) -> Result<()> {
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.supported = true;
        Ok(())
    }

    fn shutdown(&mut self) -> bool {
        self.supported = false;
        true
    }

    fn devices(&self) -> BTreeMap<u32, DeviceHandle> {
        [(0, DeviceHandle::new("GPU-0", 0))].into_iter().collect()
    }

    fn process_resource_utilization_per_device(
        &self,
        _device: &DeviceHandle,
        _since: Duration,
    ) -> Result<HashMap<u32, ProcessUtilizationSample>> {
        Ok(HashMap::new())
    }

    fn is_device_collection_supported(&self) -> bool {
        self.supported
    }

    fn set_device_collection_supported(&mut self, supported: bool) {
        self.supported = supported;
    }
}

#[test]
fn gpu_priority_converges_in_either_order() {
    for order in [["nvml", "dcgm"], ["dcgm", "nvml"]] {
        let backends = BackendRegistry::new();
        let mut outcomes = Vec::new();
        for name in order {
            outcomes.push(
                backends
                    .register(name, DeviceRole::Gpu, move || FakeGpu::startup(name))
                    .unwrap(),
            );
        }
        assert_eq!(backends.gpu_devices(), vec!["dcgm".to_string()]);
        assert!(outcomes
            .iter()
            .any(|o| !matches!(o, Registration::Registered)));

        let accelerators = AcceleratorRegistry::new();
        let acc = accelerators
            .init_role(&backends, DeviceRole::Gpu, true)
            .unwrap();
        assert_eq!(acc.name(), "dcgm");
        accelerators.shutdown();
    }
}

#[test]
fn duplicate_backend_is_a_configuration_error() {
    let backends = BackendRegistry::new();
    backends
        .register("fake", DeviceRole::Gpu, || FakeGpu::startup("fake"))
        .unwrap();
    let err = backends
        .register("fake", DeviceRole::Gpu, || FakeGpu::startup("fake"))
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn unsupported_type_registers_nothing() {
    let backends = BackendRegistry::new();
    backends
        .register("dummy", DeviceRole::Dummy, || start_backend(Dummy::new()))
        .unwrap();
    let accelerators = AcceleratorRegistry::new();

    match accelerators.create(&backends, "UNSUPPORTED", false) {
        Err(Error::UnsupportedType { supported, .. }) => {
            assert_eq!(supported, vec!["dummy".to_string()])
        }
        other => panic!("unexpected result: {:?}", other.map(|a| a.key())),
    }
    assert!(accelerators.accelerators().is_empty());
}

#[test]
fn shutdown_leaves_nothing_running() {
    let backends = BackendRegistry::new();
    backends
        .register("fake", DeviceRole::Gpu, || FakeGpu::startup("fake"))
        .unwrap();
    let accelerators = AcceleratorRegistry::new();

    let gpu = accelerators.create(&backends, "fake", true).unwrap();
    let dummy = Arc::new(Accelerator::from_device(Box::new(Dummy::new())));
    accelerators.must_register(Arc::clone(&gpu));
    accelerators.must_register(Arc::clone(&dummy));

    // Dummy never reports collection support
    assert!(accelerators
        .active_accelerators_by_type(DeviceRole::Dummy)
        .is_err());
    assert_eq!(
        accelerators
            .active_accelerators_by_type(DeviceRole::Gpu)
            .unwrap()
            .len(),
        1
    );

    let report = accelerators.shutdown();
    assert_eq!(report.attempted(), 2);
    assert!(!gpu.is_running());
    assert!(!dummy.is_running());
    assert!(accelerators
        .accelerators()
        .values()
        .all(|a| !a.is_running()));
}

fn rapl_package(root: &Path, index: u32, energy_uj: u64) {
    let dir = root
        .join("class/powercap/intel-rapl")
        .join(format!("intel-rapl:{}", index));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("name"), format!("package-{}\n", index)).unwrap();
    fs::write(dir.join("energy_uj"), format!("{}\n", energy_uj)).unwrap();
}

#[test]
fn rapl_sums_packages_in_millijoules() {
    let tmp = tempdir().unwrap();
    rapl_package(tmp.path(), 0, 5_000_000);
    rapl_package(tmp.path(), 1, 3_000_000);

    let rapl = RaplSysfs::new(tmp.path());
    assert!(rapl.is_system_collection_supported());
    assert_eq!(rapl.abs_energy_from_package().unwrap(), 8000);
    assert!(matches!(
        rapl.abs_energy_from_dram(),
        Err(Error::EventNotFound(_))
    ));

    let components = rapl.abs_energy_from_node_components();
    assert_eq!(components[&0].pkg, 5000);
    assert_eq!(components[&1].pkg, 3000);
}

#[test]
fn exponential_model_matches_closed_form() {
    let predictor =
        new_predictor(PredictorFamily::Exponential, ModelWeights::curve_fit(vec![2.0, 1.0, 0.0]))
            .unwrap();
    let power = predictor.predict(&["compute_util"], &[vec![0.0], vec![2f64.ln()]], &[], &[]);
    assert_abs_diff_eq!(power[0], 2.0, epsilon = 1e-12);
    assert_abs_diff_eq!(power[1], 4.0, epsilon = 1e-12);

    let err = new_predictor(PredictorFamily::Exponential, ModelWeights::curve_fit(vec![2.0, 1.0]))
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidModelWeights { .. }));
}

#[test]
fn qat_status_probe() {
    let tmp = tempdir().unwrap();
    let dev = tmp.path().join("bus/pci/devices/0000:6b:00.0");
    fs::create_dir_all(&dev).unwrap();
    let pci = PciBus::new(tmp.path());

    // No operstate anywhere: assume up
    assert!(pci.is_qat_status_up("0000:6b:00.0"));

    fs::create_dir_all(dev.join("qat/qat0")).unwrap();
    fs::write(dev.join("qat/qat0/operstate"), "up\n").unwrap();
    assert!(pci.is_qat_status_up("0000:6b:00.0"));

    fs::create_dir_all(dev.join("qat/qat1")).unwrap();
    fs::write(dev.join("qat/qat1/operstate"), "down\n").unwrap();
    assert!(!pci.is_qat_status_up("0000:6b:00.0"));
}
