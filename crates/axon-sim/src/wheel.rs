//! Simulated filter wheel
//!
//! The wheel only turns one way: a move steps the current slot
//! `current % slots + 1` every `step_ms` until it reaches the target.

use axon_core::standard::{self, CONNECTION};
use axon_core::{
    Bus, BusError, ClientId, Device, DeviceProperties, Interface, Item, Property, PropertyState, Selector,
    TimerHandle,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::driver::{self, publish, schedule};

pub const DRIVER_NAME: &str = "axon_wheel_simulator";
pub const DRIVER_VERSION: &str = "1.0";
pub const DEVICE_NAME: &str = "Filter Wheel Simulator";

pub const WHEEL_SLOT: &str = "WHEEL_SLOT";
pub const SLOT: &str = "SLOT";
pub const WHEEL_SLOT_NAME: &str = "WHEEL_SLOT_NAME";

const WHEEL_GROUP: &str = "Filter wheel";

/// Filter wheel simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelConfig {
    pub slots: usize,
    pub step_ms: u64,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self { slots: 5, step_ms: 500 }
    }
}

struct WheelState {
    props: DeviceProperties,
    current: usize,
    target: usize,
    timer: Option<TimerHandle>,
}

struct WheelCore {
    name: String,
    config: WheelConfig,
    state: Mutex<WheelState>,
}

pub struct SimWheel {
    core: Arc<WheelCore>,
}

impl SimWheel {
    pub fn new(name: impl Into<String>, config: WheelConfig) -> Self {
        let config = WheelConfig {
            slots: config.slots.max(1),
            ..config
        };
        Self {
            core: Arc::new(WheelCore {
                name: name.into(),
                config,
                state: Mutex::new(WheelState {
                    props: DeviceProperties::new(),
                    current: 1,
                    target: 1,
                    timer: None,
                }),
            }),
        }
    }

    /// Slot the wheel is physically at
    pub fn current_slot(&self) -> usize {
        self.core.state.lock().current
    }

    pub fn property(&self, name: &str) -> Option<Property> {
        self.core.state.lock().props.snapshot(name)
    }
}

impl WheelCore {
    fn build_properties(&self) -> Result<Vec<Property>, BusError> {
        let name = self.name.as_str();
        let slots = self.config.slots;
        let slot = Property::number(name, WHEEL_SLOT, 1)
            .in_group(WHEEL_GROUP)
            .labelled("Current slot")
            .with_state(PropertyState::Ok)
            .with_items([Item::number(SLOT, "Slot number", 1.0, slots as f64, 1.0, 1.0)])?;
        let names = Property::text(name, WHEEL_SLOT_NAME, slots)
            .in_group(WHEEL_GROUP)
            .labelled("Slot names")
            .with_state(PropertyState::Ok)
            .with_items((1..=slots).map(|n| {
                Item::text(format!("SLOT_NAME_{}", n), format!("Slot #{}", n), format!("Filter #{}", n))
            }))?;
        Ok(vec![
            standard::connection_property(name)?,
            standard::info_property(name, DRIVER_NAME, DRIVER_VERSION, Interface::WHEEL)?,
            slot,
            names,
        ])
    }

    fn change_connection(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let (snapshot, message) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(connection) = state.props.get_mut(CONNECTION) else {
                return Ok(());
            };
            if let Err(e) = connection.apply_change(request) {
                driver::reject(&self.name, connection, e)
            } else {
                connection.state = PropertyState::Ok;
                let connected = standard::is_connected(connection);
                let snapshot = connection.clone();
                if !connected {
                    driver::cancel(&mut state.timer);
                    state.target = state.current;
                    if let Some(slot) = state.props.get_mut(WHEEL_SLOT) {
                        slot.set_number(SLOT, state.current as f64);
                        slot.state = PropertyState::Ok;
                    }
                }
                info!(device = %self.name, connected, "Connection changed");
                (snapshot, None)
            }
        };
        bus.update_property(&snapshot, message.as_deref());
        Ok(())
    }

    fn change_slot(self: &Arc<Self>, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let (snapshot, message) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let connected = state
                .props
                .get(CONNECTION)
                .map(standard::is_connected)
                .unwrap_or(false);
            let current = state.current;
            let Some(slot) = state.props.get_mut(WHEEL_SLOT) else {
                return Ok(());
            };

            let mut message = None;
            if !connected {
                slot.state = PropertyState::Alert;
                message = Some("Not connected".to_string());
            } else if let Err(e) = slot.copy_values(request, false) {
                slot.state = PropertyState::Alert;
                message = Some(e.to_string());
            } else {
                let target = slot.number_value(SLOT).unwrap_or(current as f64).round() as usize;
                if target == current {
                    slot.state = PropertyState::Ok;
                } else {
                    slot.state = PropertyState::Busy;
                    slot.set_number(SLOT, current as f64);
                    state.target = target;
                    debug!(device = %self.name, from = current, to = target, "Wheel moving");
                    match &state.timer {
                        Some(timer) => timer.reschedule(self.step()),
                        None => match schedule(bus, &self.name, self, self.step(), Self::step_tick) {
                            Ok(timer) => state.timer = Some(timer),
                            Err(e) => {
                                state.target = current;
                                let (_, error) = driver::reject(&self.name, slot, e);
                                message = error;
                            }
                        },
                    }
                }
            }
            (state.props.snapshot(WHEEL_SLOT), message)
        };
        if let Some(snapshot) = snapshot {
            bus.update_property(&snapshot, message.as_deref());
        }
        Ok(())
    }

    fn step(&self) -> Duration {
        Duration::from_millis(self.config.step_ms)
    }

    fn step_tick(self: &Arc<Self>, bus: &Bus) {
        let snapshot = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.current = state.current % self.config.slots + 1;
            let arrived = state.current == state.target;
            if !arrived {
                if let Some(timer) = &state.timer {
                    timer.reschedule(self.step());
                }
            }
            let current = state.current;
            state.props.get_mut(WHEEL_SLOT).map(|slot| {
                slot.set_number(SLOT, current as f64);
                if arrived {
                    slot.state = PropertyState::Ok;
                }
                slot.clone()
            })
        };
        if let Some(snapshot) = snapshot {
            bus.update_property(&snapshot, None);
        }
    }
}

impl Device for SimWheel {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn attach(&self, bus: &Bus) -> Result<(), BusError> {
        let properties = self.core.build_properties()?;
        let snapshot = {
            let mut state = self.core.state.lock();
            for property in properties {
                state.props.insert(property);
            }
            state.current = 1;
            state.target = 1;
            state.props.matching(&Selector::all())
        };
        bus.define_all(&snapshot);
        info!(device = %self.core.name, slots = self.core.config.slots, "Filter wheel simulator attached");
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
            WHEEL_SLOT => self.core.change_slot(bus, request),
            _ => Ok(()),
        }
    }

    fn detach(&self, bus: &Bus) -> Result<(), BusError> {
        let alerts = {
            let mut guard = self.core.state.lock();
            let state = &mut *guard;
            driver::cancel(&mut state.timer);
            let alerts = state.props.alert_busy().into_iter().map(|p| (p, None)).collect();
            state.props.clear();
            alerts
        };
        publish(bus, alerts);
        info!(device = %self.core.name, "Filter wheel simulator detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::{SwitchRule, Timers};
    use tokio::runtime::Handle;

    fn slot_request(slot: f64) -> Property {
        Property::number(DEVICE_NAME, WHEEL_SLOT, 1)
            .with_items([Item::number(SLOT, "", 0.0, 0.0, 0.0, slot)])
            .unwrap()
    }

    fn wheel() -> (Bus, Arc<SimWheel>) {
        let bus = Bus::new(Timers::new(Handle::current()));
        let wheel = Arc::new(SimWheel::new(DEVICE_NAME, WheelConfig { slots: 5, step_ms: 20 }));
        bus.attach_device(wheel.clone()).unwrap();
        bus.change_property(None, &standard::connect_request(DEVICE_NAME, true).unwrap())
            .unwrap();
        (bus, wheel)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_move_steps_until_target() {
        let (bus, wheel) = wheel();
        bus.change_property(None, &slot_request(3.0)).unwrap();
        let slot = wheel.property(WHEEL_SLOT).unwrap();
        assert_eq!(slot.state, PropertyState::Busy);
        assert_eq!(slot.number_value(SLOT), Some(1.0));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let slot = wheel.property(WHEEL_SLOT).unwrap();
        assert_eq!(slot.state, PropertyState::Ok);
        assert_eq!(slot.number_value(SLOT), Some(3.0));
        assert_eq!(wheel.current_slot(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_move_wraps_around() {
        let (bus, wheel) = wheel();
        bus.change_property(None, &slot_request(4.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(wheel.current_slot(), 4);

        bus.change_property(None, &slot_request(2.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let slot = wheel.property(WHEEL_SLOT).unwrap();
        assert_eq!(slot.state, PropertyState::Ok);
        assert_eq!(slot.number_value(SLOT), Some(2.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_same_slot_and_out_of_range() {
        let (bus, wheel) = wheel();
        bus.change_property(None, &slot_request(1.0)).unwrap();
        assert_eq!(wheel.property(WHEEL_SLOT).unwrap().state, PropertyState::Ok);

        bus.change_property(None, &slot_request(9.0)).unwrap();
        assert_eq!(wheel.property(WHEEL_SLOT).unwrap().state, PropertyState::Alert);
        assert_eq!(wheel.current_slot(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_request_must_select_one() {
        let (bus, wheel) = wheel();
        let both = Property::switch(DEVICE_NAME, CONNECTION, SwitchRule::OneOfMany, 2)
            .with_items([
                Item::switch(standard::CONNECTED, "", true),
                Item::switch(standard::DISCONNECTED, "", true),
            ])
            .unwrap();
        bus.change_property(None, &both).unwrap();
        let connection = wheel.property(CONNECTION).unwrap();
        assert_eq!(connection.state, PropertyState::Alert);
        assert!(standard::is_connected(&connection));
        assert!(connection.rule_satisfied());

        let wrong_kind = Property::number(DEVICE_NAME, CONNECTION, 1)
            .with_items([Item::number(standard::CONNECTED, "", 0.0, 1.0, 1.0, 0.0)])
            .unwrap();
        bus.change_property(None, &wrong_kind).unwrap();
        assert_eq!(wheel.property(CONNECTION).unwrap().state, PropertyState::Alert);

        bus.change_property(None, &slot_request(2.0)).unwrap();
        assert_eq!(wheel.property(WHEEL_SLOT).unwrap().state, PropertyState::Busy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slot_names_follow_config() {
        let (_bus, wheel) = wheel();
        let names = wheel.property(WHEEL_SLOT_NAME).unwrap();
        assert_eq!(names.len(), 5);
        assert_eq!(names.text_value("SLOT_NAME_2"), Some("Filter #2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_detach_stops_motion() {
        let (bus, wheel) = wheel();
        bus.change_property(None, &slot_request(5.0)).unwrap();
        bus.detach_device(DEVICE_NAME).unwrap();
        let at_detach = wheel.current_slot();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(wheel.current_slot(), at_detach);
        assert!(wheel.property(WHEEL_SLOT).is_none());
    }
}
