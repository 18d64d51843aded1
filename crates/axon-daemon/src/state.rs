//! Application state management

use anyhow::Result;
use axon_agent::ImagerAgent;
use axon_core::{Bus, Device, ResourceLocks, Timers};
use axon_hotplug::HotplugManager;
use axon_sim::focuser::create_focusers;
use axon_sim::wheel::{self, SimWheel};
use axon_sim::{CameraFactory, SerialPorts, SimulatedUsb};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::monitor::{self, BusEvent, MonitorClient};

/// Shared application state
pub struct AppState {
    pub bus: Bus,
    /// Simulated USB bus the hotplug manager scans
    pub usb: Arc<SimulatedUsb>,
    pub hotplug: Arc<HotplugManager>,
    pub agent: Arc<ImagerAgent>,
    /// Devices attached directly rather than through hotplug
    pub fixed_devices: Vec<String>,
    /// Bus notifications relayed by the monitor client
    pub events: broadcast::Sender<BusEvent>,
    pub stop: CancellationToken,
}

impl AppState {
    /// Create new application state
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let bus = Bus::new(Timers::new(Handle::current()));
        let stop = CancellationToken::new();

        // Monitor first so it sees every define
        let (events, _) = broadcast::channel(config.daemon.event_buffer.max(1));
        bus.attach_client(Arc::new(MonitorClient::new(events.clone())))?;
        if config.daemon.monitor {
            monitor::spawn_logger(events.subscribe(), stop.clone());
        }

        let agent = ImagerAgent::register(&bus, config.to_agent_config())?;

        let usb = Arc::new(SimulatedUsb::new());
        let usb_locks = Arc::new(ResourceLocks::new(usb.clone()));
        let factory = Arc::new(CameraFactory::new(usb_locks.clone(), config.to_camera_config()));
        let hotplug = Arc::new(HotplugManager::new(
            config.to_hotplug_config(),
            bus.clone(),
            usb.clone(),
            factory,
        ));
        for unit in &config.hotplug.cameras {
            usb.plug(&unit.serial, unit.st4);
        }

        let serial_ports = Arc::new(SerialPorts::new());
        let port_locks = Arc::new(ResourceLocks::new(serial_ports.clone()));
        let mut fixed: Vec<Arc<dyn Device>> = Vec::new();
        if let Some(wheel_config) = config.to_wheel_config() {
            fixed.push(Arc::new(SimWheel::new(wheel::DEVICE_NAME, wheel_config)));
        }
        for focuser in create_focusers(&config.to_focuser_config(), &serial_ports, &port_locks) {
            fixed.push(Arc::new(focuser));
        }

        let mut fixed_devices = Vec::new();
        for device in fixed {
            let name = device.name().to_string();
            match bus.attach_device(device) {
                Ok(()) => fixed_devices.push(name),
                Err(e) => warn!(device = %name, error = %e, "Attach failed"),
            }
        }

        // Initial scan so cameras plugged at startup appear before the first tick
        let summary = hotplug.rescan().await?;
        info!(
            cameras = summary.arrived,
            fixed = fixed_devices.len(),
            "Devices attached"
        );

        Ok(Arc::new(Self {
            bus,
            usb,
            hotplug,
            agent,
            fixed_devices,
            events,
            stop,
        }))
    }

    /// Subscribe to bus notifications
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    /// Run the hotplug scanner until shutdown
    pub async fn run(&self) {
        self.hotplug.run(self.stop.clone()).await;
    }

    /// Detach hotplugged devices, then every other device
    pub async fn shutdown(&self) {
        self.stop.cancel();
        self.hotplug.detach_all().await;
        for name in self.fixed_devices.iter().rev() {
            if let Err(e) = self.bus.detach_device(name) {
                warn!(device = %name, error = %e, "Detach on shutdown failed");
            }
        }
        if let Err(e) = self.bus.detach_device(&self.agent.config().name) {
            warn!(error = %e, "Agent detach failed");
        }
        info!("All devices detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraUnit;
    use axon_agent::imager::AGENT_CCD_LIST;
    use axon_core::PropertyState;
    use std::time::Duration;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.daemon.monitor = false;
        config.hotplug.cameras = vec![
            CameraUnit {
                serial: "A1".to_string(),
                st4: true,
            },
            CameraUnit {
                serial: "B2".to_string(),
                st4: false,
            },
        ];
        config.simulator.camera.width = 32;
        config.simulator.camera.height = 32;
        config.simulator.focuser.instances = 2;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_attaches_everything() {
        let state = AppState::new(small_config()).await.unwrap();
        let names = state.bus.device_names();

        for expected in [
            "Imager Agent",
            "CCD Simulator #A1",
            "CCD Simulator (guider) #A1",
            "CCD Simulator #B2",
            wheel::DEVICE_NAME,
            "Focuser Simulator #1",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {}", expected);
        }
        assert_eq!(state.hotplug.slots().await.len(), 2);

        let mut cameras = state.agent.cameras();
        cameras.sort();
        assert_eq!(cameras, vec!["CCD Simulator #A1".to_string(), "CCD Simulator #B2".to_string()]);
        assert_eq!(
            state.agent.property(AGENT_CCD_LIST).map(|p| p.state),
            Some(PropertyState::Ok)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unplug_reaches_agent() {
        let state = AppState::new(small_config()).await.unwrap();
        state.usb.unplug("B2");
        state.hotplug.notify().await.unwrap().unwrap();

        assert!(!state.bus.is_attached("CCD Simulator #B2"));
        assert_eq!(state.agent.cameras(), vec!["CCD Simulator #A1".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_detaches_all() {
        let state = AppState::new(small_config()).await.unwrap();
        let mut events = state.subscribe();
        state.shutdown().await;

        assert!(state.bus.device_names().is_empty());
        assert!(state.stop.is_cancelled());
        let deleted = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(BusEvent::Deleted { name: None, .. }) = events.recv().await {
                    return true;
                }
            }
        })
        .await;
        assert!(matches!(deleted, Ok(true)));
    }
}
