//! Simulated ST4 guide port
//!
//! Shares the USB resource of the camera it belongs to. A pulse holds the
//! guide property Busy for its duration, then zeroes it and reports Ok.

use axon_core::standard::{self, CONNECTION};
use axon_core::{
    Bus, BusError, ClientId, Device, DeviceProperties, Interface, Item, Property, PropertyState, Selector,
    TimerHandle,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::driver::{self, publish, schedule, Updates};
use crate::usb::UsbLocks;

pub const DRIVER_NAME: &str = "axon_guider_simulator";
pub const DRIVER_VERSION: &str = "1.0";

pub const GUIDER_GUIDE_DEC: &str = "GUIDER_GUIDE_DEC";
pub const GUIDE_NORTH: &str = "NORTH";
pub const GUIDE_SOUTH: &str = "SOUTH";
pub const GUIDER_GUIDE_RA: &str = "GUIDER_GUIDE_RA";
pub const GUIDE_EAST: &str = "EAST";
pub const GUIDE_WEST: &str = "WEST";

const GUIDER_GROUP: &str = "Guider";
const MAX_PULSE_MS: f64 = 10_000.0;

struct GuiderState {
    props: DeviceProperties,
    holding: bool,
    pulse_timer: Option<TimerHandle>,
}

struct GuiderCore {
    name: String,
    resource: String,
    locks: Arc<UsbLocks>,
    state: Mutex<GuiderState>,
}

/// Simulated guide port device
pub struct SimGuider {
    core: Arc<GuiderCore>,
}

impl SimGuider {
    pub fn new(name: impl Into<String>, resource: impl Into<String>, locks: Arc<UsbLocks>) -> Self {
        Self {
            core: Arc::new(GuiderCore {
                name: name.into(),
                resource: resource.into(),
                locks,
                state: Mutex::new(GuiderState {
                    props: DeviceProperties::new(),
                    holding: false,
                    pulse_timer: None,
                }),
            }),
        }
    }
}

fn guide_property(device: &str, name: &str, label: &str, axis: [(&str, &str); 2]) -> Result<Property, BusError> {
    Ok(Property::number(device, name, 2)
        .in_group(GUIDER_GROUP)
        .labelled(label)
        .with_state(PropertyState::Ok)
        .with_items(
            axis.into_iter()
                .map(|(item, label)| Item::number(item, label, 0.0, MAX_PULSE_MS, 1.0, 0.0)),
        )?)
}

impl GuiderCore {
    fn change_connection(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(connection) = state.props.get_mut(CONNECTION) else {
                return Ok(());
            };
            let mut message = None;

            if let Err(e) = connection.apply_change(request) {
                let (_, error) = driver::reject(&self.name, connection, e);
                message = error;
            } else if standard::is_connected(connection) {
                if !state.holding {
                    match self.locks.try_acquire(&self.resource, &self.name) {
                        Ok(_) => {
                            state.holding = true;
                            connection.state = PropertyState::Ok;
                            info!(device = %self.name, "Connected");
                        }
                        Err(e) => {
                            warn!(device = %self.name, error = %e, "Connect failed");
                            standard::set_connected(connection, false);
                            connection.state = PropertyState::Alert;
                            message = Some(e.to_string());
                        }
                    }
                }
            } else {
                connection.state = PropertyState::Ok;
                driver::cancel(&mut state.pulse_timer);
                if state.holding {
                    if let Err(e) = self.locks.release(&self.resource, &self.name) {
                        warn!(device = %self.name, error = %e, "Resource release failed");
                    }
                    state.holding = false;
                }
                info!(device = %self.name, "Disconnected");
            }
            state
                .props
                .snapshot(CONNECTION)
                .map(|c| vec![(c, message)])
                .unwrap_or_default()
        };
        publish(bus, updates);
        Ok(())
    }

    fn guide(self: &Arc<Self>, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let connected = state.holding;
            let Some(axis) = state.props.get_mut(&request.name) else {
                return Ok(());
            };

            let mut message = None;
            if !connected {
                axis.state = PropertyState::Alert;
                message = Some("Not connected".to_string());
            } else {
                match axis.copy_values(request, false) {
                    Ok(_) => {
                        driver::cancel(&mut state.pulse_timer);
                        axis.state = PropertyState::Ok;
                        let duration = axis
                            .items()
                            .iter()
                            .filter_map(|i| i.as_number().map(|n| n.value))
                            .find(|ms| *ms > 0.0);
                        if let Some(ms) = duration {
                            axis.state = PropertyState::Busy;
                            debug!(device = %self.name, property = %request.name, ms, "Guide pulse");
                            match schedule(
                                bus,
                                &self.name,
                                self,
                                Duration::from_secs_f64(ms / 1000.0),
                                Self::pulse_finished,
                            ) {
                                Ok(timer) => state.pulse_timer = Some(timer),
                                Err(e) => {
                                    let (_, error) = driver::reject(&self.name, axis, e);
                                    message = error;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        axis.state = PropertyState::Alert;
                        message = Some(e.to_string());
                    }
                }
            }
            state
                .props
                .snapshot(&request.name)
                .map(|p| vec![(p, message)])
                .unwrap_or_default()
        };
        publish(bus, updates);
        Ok(())
    }

    fn pulse_finished(self: &Arc<Self>, bus: &Bus) {
        let updates: Updates = {
            let mut state = self.state.lock();
            state.pulse_timer = None;
            let mut updates = Updates::new();
            for name in [GUIDER_GUIDE_DEC, GUIDER_GUIDE_RA] {
                let Some(axis) = state.props.get_mut(name) else {
                    continue;
                };
                let active: Vec<String> = axis
                    .items()
                    .iter()
                    .filter(|i| i.as_number().map(|n| n.value != 0.0).unwrap_or(false))
                    .map(|i| i.name.clone())
                    .collect();
                if active.is_empty() {
                    continue;
                }
                for item in active {
                    axis.set_number(&item, 0.0);
                }
                axis.state = PropertyState::Ok;
                updates.push((axis.clone(), None));
            }
            updates
        };
        publish(bus, updates);
    }
}

impl Device for SimGuider {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn attach(&self, bus: &Bus) -> Result<(), BusError> {
        let name = self.core.name.as_str();
        let properties = vec![
            standard::connection_property(name)?,
            standard::info_property(name, DRIVER_NAME, DRIVER_VERSION, Interface::GUIDER)?,
            guide_property(name, GUIDER_GUIDE_DEC, "DEC guiding", [(GUIDE_NORTH, "North (ms)"), (GUIDE_SOUTH, "South (ms)")])?,
            guide_property(name, GUIDER_GUIDE_RA, "RA guiding", [(GUIDE_EAST, "East (ms)"), (GUIDE_WEST, "West (ms)")])?,
        ];
        let snapshot = {
            let mut state = self.core.state.lock();
            for property in properties {
                state.props.insert(property);
            }
            state.props.matching(&Selector::all())
        };
        bus.define_all(&snapshot);
        info!(device = %name, resource = %self.core.resource, "Guider simulator attached");
        Ok(())
    }

    fn enumerate_properties(&self, bus: &Bus, _client: Option<ClientId>, selector: &Selector) -> Result<(), BusError> {
        let snapshot = self.core.state.lock().props.matching(selector);
        bus.define_all(&snapshot);
        Ok(())
    }

    fn change_property(&self, bus: &Bus, _client: Option<ClientId>, request: &Property) -> Result<(), BusError> {
        match request.name.as_str() {
            CONNECTION => self.core.change_connection(bus, request),
            GUIDER_GUIDE_DEC | GUIDER_GUIDE_RA => self.core.guide(bus, request),
            _ => Ok(()),
        }
    }

    fn detach(&self, bus: &Bus) -> Result<(), BusError> {
        let updates: Updates = {
            let mut guard = self.core.state.lock();
            let state = &mut *guard;
            driver::cancel(&mut state.pulse_timer);
            if state.holding {
                if let Err(e) = self.core.locks.release(&self.core.resource, &self.core.name) {
                    warn!(device = %self.core.name, error = %e, "Resource release failed");
                }
                state.holding = false;
            }
            let alerts = state.props.alert_busy().into_iter().map(|p| (p, None)).collect();
            state.props.clear();
            alerts
        };
        publish(bus, updates);
        info!(device = %self.core.name, "Guider simulator detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraConfig, SimCamera};
    use crate::usb::SimulatedUsb;
    use axon_core::{ResourceLocks, SwitchRule, Timers};
    use tokio::runtime::Handle;

    fn pulse(name: &str, item: &str, ms: f64) -> Property {
        Property::number("Guider #1", name, 1)
            .with_items([Item::number(item, "", 0.0, 0.0, 0.0, ms)])
            .unwrap()
    }

    struct Bench {
        bus: Bus,
        guider: Arc<SimGuider>,
        locks: Arc<UsbLocks>,
        usb: Arc<SimulatedUsb>,
    }

    fn bench() -> Bench {
        let bus = Bus::new(Timers::new(Handle::current()));
        let usb = Arc::new(SimulatedUsb::new());
        let locks = Arc::new(ResourceLocks::new(usb.clone()));
        usb.plug("1", true);
        let resource = SimulatedUsb::resource_for("1");
        locks.bind(&resource, "Cam #1");
        locks.bind(&resource, "Guider #1");
        let guider = Arc::new(SimGuider::new("Guider #1", resource, locks.clone()));
        bus.attach_device(guider.clone()).unwrap();
        bus.change_property(None, &standard::connect_request("Guider #1", true).unwrap())
            .unwrap();
        Bench { bus, guider, locks, usb }
    }

    fn axis(bench: &Bench, name: &str) -> Property {
        bench.guider.core.state.lock().props.snapshot(name).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pulse_busy_then_zeroed() {
        let bench = bench();
        bench.bus.change_property(None, &pulse(GUIDER_GUIDE_DEC, GUIDE_NORTH, 30.0)).unwrap();
        let dec = axis(&bench, GUIDER_GUIDE_DEC);
        assert_eq!(dec.state, PropertyState::Busy);
        assert_eq!(dec.number_value(GUIDE_NORTH), Some(30.0));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let dec = axis(&bench, GUIDER_GUIDE_DEC);
        assert_eq!(dec.state, PropertyState::Ok);
        assert_eq!(dec.number_value(GUIDE_NORTH), Some(0.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_pulse_replaces_pending() {
        let bench = bench();
        bench.bus.change_property(None, &pulse(GUIDER_GUIDE_RA, GUIDE_EAST, 40.0)).unwrap();
        bench.bus.change_property(None, &pulse(GUIDER_GUIDE_RA, GUIDE_WEST, 400.0)).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        let ra = axis(&bench, GUIDER_GUIDE_RA);
        assert_eq!(ra.state, PropertyState::Busy);
        assert_eq!(ra.number_value(GUIDE_WEST), Some(400.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_zero_pulse_is_ok() {
        let bench = bench();
        bench.bus.change_property(None, &pulse(GUIDER_GUIDE_DEC, GUIDE_SOUTH, 0.0)).unwrap();
        assert_eq!(axis(&bench, GUIDER_GUIDE_DEC).state, PropertyState::Ok);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shares_resource_with_camera() {
        let bench = bench();
        let camera = SimCamera::new(
            "Cam #1",
            SimulatedUsb::resource_for("1"),
            CameraConfig {
                connect_delay_ms: 10,
                ..CameraConfig::default()
            },
            bench.locks.clone(),
        );
        bench.bus.attach_device(Arc::new(camera)).unwrap();
        bench
            .bus
            .change_property(None, &standard::connect_request("Cam #1", true).unwrap())
            .unwrap();

        let mut holders = bench.locks.holders(&SimulatedUsb::resource_for("1"));
        holders.sort();
        assert_eq!(holders, vec!["Cam #1".to_string(), "Guider #1".to_string()]);
        assert_eq!(bench.usb.open_count(), 1);

        bench.bus.detach_device("Guider #1").unwrap();
        assert!(bench.locks.is_open(&SimulatedUsb::resource_for("1")));
        assert_eq!(bench.usb.close_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_outsider_refused() {
        let bench = bench();
        let outsider = SimGuider::new("Guider #9", SimulatedUsb::resource_for("1"), bench.locks.clone());
        bench.bus.attach_device(Arc::new(outsider)).unwrap();
        bench
            .bus
            .change_property(None, &standard::connect_request("Guider #9", true).unwrap())
            .unwrap();
        assert!(!bench.locks.holders(&SimulatedUsb::resource_for("1")).contains(&"Guider #9".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_connection_request_keeps_lock() {
        let bench = bench();
        let nothing = Property::switch("Guider #1", CONNECTION, SwitchRule::OneOfMany, 1)
            .with_items([Item::switch(standard::CONNECTED, "", false)])
            .unwrap();
        bench.bus.change_property(None, &nothing).unwrap();

        let connection = axis(&bench, CONNECTION);
        assert_eq!(connection.state, PropertyState::Alert);
        assert!(standard::is_connected(&connection));
        assert_eq!(
            bench.locks.holders(&SimulatedUsb::resource_for("1")),
            vec!["Guider #1".to_string()]
        );
    }
}
