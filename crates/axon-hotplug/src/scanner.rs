//! Hotplug manager: turns hardware scans into device attach/detach

use anyhow::Result;
use axon_core::Bus;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hardware::{DeviceFactory, HardwareBus, PhysicalDevice};
use crate::slots::SlotArena;

/// Hotplug manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotplugConfig {
    /// Maximum number of physical units tracked at once
    pub max_slots: usize,
    /// Periodic rescan interval in milliseconds
    pub scan_interval_ms: u64,
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            max_slots: 8,
            scan_interval_ms: 2000,
        }
    }
}

/// Hotplug event for real-time updates
#[derive(Debug, Clone, PartialEq)]
pub enum HotplugEvent {
    /// Hardware took a slot and its devices were attached
    Arrived {
        slot: usize,
        id: String,
        devices: Vec<String>,
    },
    /// Hardware vanished; its devices were detached and the slot freed
    Departed {
        slot: usize,
        id: String,
        devices: Vec<String>,
    },
    /// Hardware seen but every slot is taken
    Dropped { id: String },
    ScanCompleted(ScanSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub arrived: usize,
    pub departed: usize,
    pub dropped: usize,
    pub occupied: usize,
}

/// Snapshot of one occupied slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotInfo {
    pub slot: usize,
    pub hardware: PhysicalDevice,
    pub devices: Vec<String>,
}

struct Occupant {
    hardware: PhysicalDevice,
    devices: Vec<String>,
}

/// Hotplug manager service
pub struct HotplugManager {
    config: HotplugConfig,
    bus: Bus,
    hardware: Arc<dyn HardwareBus>,
    factory: Arc<dyn DeviceFactory>,
    slots: Mutex<SlotArena<Occupant>>,
    event_tx: broadcast::Sender<HotplugEvent>,
}

impl HotplugManager {
    pub fn new(
        config: HotplugConfig,
        bus: Bus,
        hardware: Arc<dyn HardwareBus>,
        factory: Arc<dyn DeviceFactory>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let slots = Mutex::new(SlotArena::new(config.max_slots));
        Self {
            config,
            bus,
            hardware,
            factory,
            slots,
            event_tx,
        }
    }

    /// Subscribe to hotplug events
    pub fn subscribe(&self) -> broadcast::Receiver<HotplugEvent> {
        self.event_tx.subscribe()
    }

    /// Currently occupied slots
    pub async fn slots(&self) -> Vec<SlotInfo> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|(slot, o)| SlotInfo {
                slot,
                hardware: o.hardware.clone(),
                devices: o.devices.clone(),
            })
            .collect()
    }

    /// Arrival/departure notification from the hardware layer
    ///
    /// Never does the work in the caller's context: the rescan runs on a
    /// spawned task whose handle is returned.
    pub fn notify(self: &Arc<Self>) -> JoinHandle<Result<ScanSummary>> {
        let this = self.clone();
        tokio::spawn(async move { this.rescan().await })
    }

    /// Diff the current hardware against the slot table
    pub async fn rescan(&self) -> Result<ScanSummary> {
        let mut slots = self.slots.lock().await;

        let mut present = self.hardware.scan()?;
        let mut seen = HashSet::new();
        present.retain(|hw| seen.insert(hw.id.clone()));

        let mut summary = ScanSummary::default();

        let departed: Vec<usize> = slots
            .iter()
            .filter(|(_, o)| !seen.contains(&o.hardware.id))
            .map(|(slot, _)| slot)
            .collect();

        for slot in departed {
            let Some(occupant) = slots.get(slot) else {
                continue;
            };
            info!(slot, id = %occupant.hardware.id, "Hardware departed");
            for name in occupant.devices.iter().rev() {
                if let Err(e) = self.bus.detach_device(name) {
                    warn!(device = %name, error = %e, "Detach on departure failed");
                }
            }
            self.factory.release(&occupant.hardware);

            if let Some(occupant) = slots.free(slot) {
                summary.departed += 1;
                let _ = self.event_tx.send(HotplugEvent::Departed {
                    slot,
                    id: occupant.hardware.id,
                    devices: occupant.devices,
                });
            }
        }

        for hardware in present {
            if slots.find(|o| o.hardware.id == hardware.id).is_some() {
                debug!(id = %hardware.id, "Hardware already has a slot");
                continue;
            }

            let occupant = Occupant {
                hardware: hardware.clone(),
                devices: Vec::new(),
            };
            let slot = match slots.allocate(occupant) {
                Ok(slot) => slot,
                Err(_) => {
                    warn!(
                        id = %hardware.id,
                        max_slots = self.config.max_slots,
                        "No free slot, ignoring hardware"
                    );
                    summary.dropped += 1;
                    let _ = self.event_tx.send(HotplugEvent::Dropped { id: hardware.id });
                    continue;
                }
            };

            let mut attached = Vec::new();
            for device in self.factory.create(slot, &hardware) {
                let name = device.name().to_string();
                match self.bus.attach_device(device) {
                    Ok(()) => attached.push(name),
                    Err(e) => warn!(device = %name, error = %e, "Attach on arrival failed"),
                }
            }

            info!(slot, id = %hardware.id, devices = ?attached, "Hardware arrived");
            if let Some(occupant) = slots.get_mut(slot) {
                occupant.devices = attached.clone();
            }
            summary.arrived += 1;
            let _ = self.event_tx.send(HotplugEvent::Arrived {
                slot,
                id: hardware.id,
                devices: attached,
            });
        }

        summary.occupied = slots.len();
        let _ = self.event_tx.send(HotplugEvent::ScanCompleted(summary));
        debug!(?summary, "Hotplug scan complete");
        Ok(summary)
    }

    /// Detach every device and free every slot
    pub async fn detach_all(&self) {
        let mut slots = self.slots.lock().await;
        let occupied: Vec<usize> = slots.iter().map(|(slot, _)| slot).collect();
        for slot in occupied {
            if let Some(occupant) = slots.free(slot) {
                for name in occupant.devices.iter().rev() {
                    if let Err(e) = self.bus.detach_device(name) {
                        warn!(device = %name, error = %e, "Detach on shutdown failed");
                    }
                }
                self.factory.release(&occupant.hardware);
            }
        }
    }

    /// Rescan periodically until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(Duration::from_millis(self.config.scan_interval_ms.max(1)));
        info!(interval_ms = self.config.scan_interval_ms, "Hotplug scanner started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Hotplug scanner stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.rescan().await {
                        warn!(error = %e, "Hotplug scan failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::{Bus, BusError, ClientId, Device, Property, Selector, Timers};
    use parking_lot::Mutex as SyncMutex;
    use tokio::runtime::Handle;

    #[derive(Default)]
    struct FakeUsb {
        present: SyncMutex<Vec<PhysicalDevice>>,
    }

    impl FakeUsb {
        fn plug(&self, id: &str, has_st4: bool) {
            self.present.lock().push(PhysicalDevice {
                id: id.to_string(),
                model: "Fake".to_string(),
                resource: format!("usb:{}", id),
                has_st4,
            });
        }

        fn unplug(&self, id: &str) {
            self.present.lock().retain(|d| d.id != id);
        }
    }

    impl HardwareBus for FakeUsb {
        fn scan(&self) -> Result<Vec<PhysicalDevice>> {
            Ok(self.present.lock().clone())
        }
    }

    struct StubDevice {
        name: String,
        log: Arc<SyncMutex<Vec<String>>>,
    }

    impl Device for StubDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn attach(&self, _bus: &Bus) -> Result<(), BusError> {
            self.log.lock().push(format!("attach {}", self.name));
            Ok(())
        }

        fn enumerate_properties(&self, _bus: &Bus, _client: Option<ClientId>, _selector: &Selector) -> Result<(), BusError> {
            Ok(())
        }

        fn change_property(&self, _bus: &Bus, _client: Option<ClientId>, _request: &Property) -> Result<(), BusError> {
            Ok(())
        }

        fn detach(&self, _bus: &Bus) -> Result<(), BusError> {
            self.log.lock().push(format!("detach {}", self.name));
            Ok(())
        }
    }

    struct StubFactory {
        log: Arc<SyncMutex<Vec<String>>>,
    }

    impl DeviceFactory for StubFactory {
        fn create(&self, _slot: usize, hardware: &PhysicalDevice) -> Vec<Arc<dyn Device>> {
            let mut devices: Vec<Arc<dyn Device>> = vec![Arc::new(StubDevice {
                name: format!("Fake #{}", hardware.id),
                log: self.log.clone(),
            })];
            if hardware.has_st4 {
                devices.push(Arc::new(StubDevice {
                    name: format!("Fake (guider) #{}", hardware.id),
                    log: self.log.clone(),
                }));
            }
            devices
        }

        fn release(&self, hardware: &PhysicalDevice) {
            self.log.lock().push(format!("release {}", hardware.resource));
        }
    }

    fn manager(max_slots: usize) -> (Arc<HotplugManager>, Arc<FakeUsb>, Arc<SyncMutex<Vec<String>>>, Bus) {
        let bus = Bus::new(Timers::new(Handle::current()));
        let usb = Arc::new(FakeUsb::default());
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let factory = Arc::new(StubFactory { log: log.clone() });
        let config = HotplugConfig {
            max_slots,
            scan_interval_ms: 10,
        };
        let manager = Arc::new(HotplugManager::new(config, bus.clone(), usb.clone(), factory));
        (manager, usb, log, bus)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_same_id_never_takes_second_slot() {
        let (manager, usb, _log, bus) = manager(4);
        usb.plug("A", false);
        usb.plug("A", false);

        let first = manager.rescan().await.unwrap();
        let second = manager.rescan().await.unwrap();

        assert_eq!(first.arrived, 1);
        assert_eq!(second.arrived, 0);
        assert_eq!(manager.slots().await.len(), 1);
        assert_eq!(bus.device_names(), vec!["Fake #A".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reuses_lowest_free_slot() {
        let (manager, usb, _log, _bus) = manager(4);
        usb.plug("A", false);
        usb.plug("B", false);
        manager.rescan().await.unwrap();

        usb.unplug("A");
        manager.rescan().await.unwrap();
        usb.plug("C", false);
        manager.rescan().await.unwrap();

        let slots: Vec<_> = manager
            .slots()
            .await
            .into_iter()
            .map(|s| (s.slot, s.hardware.id))
            .collect();
        assert_eq!(slots, vec![(0, "C".to_string()), (1, "B".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overflow_is_dropped() {
        let (manager, usb, _log, _bus) = manager(1);
        let mut events = manager.subscribe();
        usb.plug("A", false);
        usb.plug("B", false);

        let summary = manager.rescan().await.unwrap();
        assert_eq!(summary.arrived, 1);
        assert_eq!(summary.dropped, 1);

        let mut dropped = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let HotplugEvent::Dropped { id } = event {
                dropped.push(id);
            }
        }
        assert_eq!(dropped, vec!["B".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_departure_detaches_then_releases() {
        let (manager, usb, log, bus) = manager(2);
        usb.plug("A", true);
        manager.notify().await.unwrap().unwrap();
        assert_eq!(bus.device_names().len(), 2);

        usb.unplug("A");
        let summary = manager.notify().await.unwrap().unwrap();
        assert_eq!(summary.departed, 1);
        assert!(bus.device_names().is_empty());
        assert!(manager.slots().await.is_empty());

        let log = log.lock().clone();
        assert_eq!(
            log,
            vec![
                "attach Fake #A".to_string(),
                "attach Fake (guider) #A".to_string(),
                "detach Fake (guider) #A".to_string(),
                "detach Fake #A".to_string(),
                "release usb:A".to_string(),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_stops_on_cancel() {
        let (manager, usb, _log, bus) = manager(2);
        usb.plug("A", false);
        let shutdown = CancellationToken::new();

        let runner = {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { manager.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bus.is_attached("Fake #A"));

        shutdown.cancel();
        runner.await.unwrap();
        manager.detach_all().await;
        assert!(!bus.is_attached("Fake #A"));
    }
}
