//! Simulated USB bus carrying CCD simulator units

use anyhow::Result;
use axon_core::{device_name, Device, LockError, ResourceBackend, ResourceLocks};
use axon_hotplug::{DeviceFactory, HardwareBus, PhysicalDevice};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::camera::{CameraConfig, SimCamera};
use crate::guider::SimGuider;

pub const CAMERA_MODEL: &str = "CCD Simulator";
pub const GUIDER_MODEL: &str = "CCD Simulator (guider)";

/// Open USB session on one simulated unit
#[derive(Debug)]
pub struct UsbHandle {
    pub serial: String,
}

/// Lock registry over the simulated bus
pub type UsbLocks = ResourceLocks<Arc<SimulatedUsb>>;

/// Units currently plugged in, plus open/close counters
#[derive(Default)]
pub struct SimulatedUsb {
    present: Mutex<Vec<PhysicalDevice>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl SimulatedUsb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_for(serial: &str) -> String {
        format!("usb:ccd-sim:{}", serial)
    }

    pub fn plug(&self, serial: &str, has_st4: bool) {
        let mut present = self.present.lock();
        if present.iter().any(|d| d.id == serial) {
            return;
        }
        info!(serial, has_st4, "USB unit plugged");
        present.push(PhysicalDevice {
            id: serial.to_string(),
            model: CAMERA_MODEL.to_string(),
            resource: Self::resource_for(serial),
            has_st4,
        });
    }

    pub fn unplug(&self, serial: &str) -> bool {
        let mut present = self.present.lock();
        let before = present.len();
        present.retain(|d| d.id != serial);
        let removed = present.len() != before;
        if removed {
            info!(serial, "USB unit unplugged");
        }
        removed
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl HardwareBus for SimulatedUsb {
    fn scan(&self) -> Result<Vec<PhysicalDevice>> {
        Ok(self.present.lock().clone())
    }
}

impl ResourceBackend for SimulatedUsb {
    type Handle = UsbHandle;

    fn open(&self, resource: &str) -> Result<UsbHandle, LockError> {
        let present = self.present.lock();
        let unit = present
            .iter()
            .find(|d| d.resource == resource)
            .ok_or_else(|| LockError::Open {
                resource: resource.to_string(),
                reason: "device not present".to_string(),
            })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        debug!(resource, "USB session opened");
        Ok(UsbHandle {
            serial: unit.id.clone(),
        })
    }

    fn close(&self, resource: &str, handle: Arc<UsbHandle>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        debug!(resource, serial = %handle.serial, "USB session closed");
    }
}

/// Creates the camera, and the guider for ST4 units, on arrival
pub struct CameraFactory {
    locks: Arc<UsbLocks>,
    config: CameraConfig,
}

impl CameraFactory {
    pub fn new(locks: Arc<UsbLocks>, config: CameraConfig) -> Self {
        Self { locks, config }
    }
}

impl DeviceFactory for CameraFactory {
    fn create(&self, slot: usize, hardware: &PhysicalDevice) -> Vec<Arc<dyn Device>> {
        let camera_name = device_name(CAMERA_MODEL, &hardware.id);
        self.locks.bind(&hardware.resource, &camera_name);
        let mut devices: Vec<Arc<dyn Device>> = vec![Arc::new(SimCamera::new(
            camera_name,
            hardware.resource.clone(),
            self.config.clone(),
            self.locks.clone(),
        ))];

        if hardware.has_st4 {
            let guider_name = device_name(GUIDER_MODEL, &hardware.id);
            self.locks.bind(&hardware.resource, &guider_name);
            devices.push(Arc::new(SimGuider::new(
                guider_name,
                hardware.resource.clone(),
                self.locks.clone(),
            )));
        }
        debug!(slot, id = %hardware.id, count = devices.len(), "Created simulator devices");
        devices
    }

    fn release(&self, hardware: &PhysicalDevice) {
        if self.locks.evict(&hardware.resource) {
            info!(id = %hardware.id, "Closed session left open by departed unit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::standard::{self, CCD_EXPOSURE};
    use axon_core::{Bus, Client, Property, PropertyState, Timers};
    use axon_hotplug::{HotplugConfig, HotplugManager};
    use std::time::Duration;
    use tokio::runtime::Handle;

    struct Bench {
        bus: Bus,
        usb: Arc<SimulatedUsb>,
        locks: Arc<UsbLocks>,
        manager: Arc<HotplugManager>,
    }

    fn bench() -> Bench {
        let bus = Bus::new(Timers::new(Handle::current()));
        let usb = Arc::new(SimulatedUsb::new());
        let locks = Arc::new(ResourceLocks::new(usb.clone()));
        let config = CameraConfig {
            width: 32,
            height: 32,
            stars: 2,
            connect_delay_ms: 10,
            ..CameraConfig::default()
        };
        let factory = Arc::new(CameraFactory::new(locks.clone(), config));
        let manager = Arc::new(HotplugManager::new(
            HotplugConfig::default(),
            bus.clone(),
            usb.clone(),
            factory,
        ));
        Bench { bus, usb, locks, manager }
    }

    #[test]
    fn test_open_requires_present_unit() {
        let usb = SimulatedUsb::new();
        assert!(matches!(usb.open("usb:ccd-sim:9"), Err(LockError::Open { .. })));
        usb.plug("9", false);
        usb.plug("9", false);
        assert_eq!(usb.scan().unwrap().len(), 1);
        assert_eq!(usb.open("usb:ccd-sim:9").unwrap().serial, "9");
        assert_eq!(usb.open_count(), 1);
        assert!(usb.unplug("9"));
        assert!(!usb.unplug("9"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_st4_unit_gets_guider() {
        let bench = bench();
        bench.usb.plug("A1", true);
        bench.usb.plug("B2", false);
        bench.manager.rescan().await.unwrap();

        let mut names = bench.bus.device_names();
        names.sort();
        assert_eq!(
            names,
            vec![
                "CCD Simulator #A1".to_string(),
                "CCD Simulator #B2".to_string(),
                "CCD Simulator (guider) #A1".to_string(),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_camera_and_guider_share_session() {
        let bench = bench();
        bench.usb.plug("A1", true);
        bench.manager.rescan().await.unwrap();

        for name in ["CCD Simulator #A1", "CCD Simulator (guider) #A1"] {
            bench
                .bus
                .change_property(None, &standard::connect_request(name, true).unwrap())
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resource = SimulatedUsb::resource_for("A1");
        assert_eq!(bench.locks.holders(&resource).len(), 2);
        assert_eq!(bench.usb.open_count(), 1);

        bench.usb.unplug("A1");
        let summary = bench.manager.rescan().await.unwrap();
        assert_eq!(summary.departed, 1);
        assert!(bench.bus.device_names().is_empty());
        assert!(!bench.locks.is_open(&resource));
        assert_eq!(bench.usb.close_count(), 1);
    }

    /// Every CCD_EXPOSURE state a client is shown
    #[derive(Default)]
    struct ExposureWatcher {
        states: Mutex<Vec<PropertyState>>,
    }

    impl Client for ExposureWatcher {
        fn name(&self) -> &str {
            "exposure watcher"
        }

        fn define_property(&self, _bus: &Bus, property: &Property, _message: Option<&str>) {
            if property.name == CCD_EXPOSURE {
                self.states.lock().push(property.state);
            }
        }

        fn update_property(&self, _bus: &Bus, property: &Property, _message: Option<&str>) {
            if property.name == CCD_EXPOSURE {
                self.states.lock().push(property.state);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unplug_during_exposure_fails_frame() {
        let bench = bench();
        let watcher = Arc::new(ExposureWatcher::default());
        bench.bus.attach_client(watcher.clone()).unwrap();
        bench.usb.plug("C3", false);
        bench.manager.rescan().await.unwrap();
        assert_eq!(bench.manager.slots().await.len(), 1);

        let camera = "CCD Simulator #C3";
        bench
            .bus
            .change_property(None, &standard::connect_request(camera, true).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bench
            .bus
            .change_property(None, &standard::exposure_request(camera, 0.5).unwrap())
            .unwrap();
        assert_eq!(watcher.states.lock().last(), Some(&PropertyState::Busy));

        bench.usb.unplug("C3");
        let summary = bench.manager.rescan().await.unwrap();
        assert_eq!(summary.departed, 1);
        assert!(watcher.states.lock().contains(&PropertyState::Alert));
        assert!(bench.manager.slots().await.is_empty());
        assert!(bench.bus.device_names().is_empty());
        assert!(!bench.locks.is_open(&SimulatedUsb::resource_for("C3")));

        let seen = watcher.states.lock().len();
        tokio::time::sleep(Duration::from_millis(800)).await;
        let states = watcher.states.lock();
        assert_eq!(states.len(), seen);
        assert!(!states.contains(&PropertyState::Ok));
    }
}
