//! Focuser driver over the bracketed serial protocol
//!
//! Moves are fire-and-poll: the driver sends the target and a position timer
//! polls `[GMOV]`/`[GPOS]` until the motor stops. Controllers from the second
//! generation on report temperature, polled on its own timer.

use axon_core::standard::{self, CONNECTION, MAIN_GROUP};
use axon_core::{
    device_name, instance_count, Bus, BusError, ClientId, Device, DeviceProperties, Interface, Item, Permission,
    Property, PropertyState, Selector, SwitchRule, TimerHandle,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::driver::{self, publish, schedule, Updates};
use crate::port::{ControllerModel, FocuserPort, PortLocks, SerialPorts, SimulatedFocuserPort, NO_TEMPERATURE};

pub const DRIVER_NAME: &str = "axon_focuser_simulator";
pub const DRIVER_VERSION: &str = "1.0";
pub const MODEL_NAME: &str = "Focuser Simulator";
pub const INSTANCES_VAR: &str = "FOCUSER_SIM_DEVICE_NUMBER";
pub const MAX_INSTANCES: usize = 8;

pub const FOCUSER_INFO: &str = "FOCUSER_INFO";
pub const BOARD: &str = "BOARD";
pub const FIRMWARE: &str = "FIRMWARE";
pub const FOCUSER_POSITION: &str = "FOCUSER_POSITION";
pub const POSITION: &str = "POSITION";
pub const FOCUSER_STEPS: &str = "FOCUSER_STEPS";
pub const STEPS: &str = "STEPS";
pub const FOCUSER_DIRECTION: &str = "FOCUSER_DIRECTION";
pub const MOVE_INWARD: &str = "MOVE_INWARD";
pub const MOVE_OUTWARD: &str = "MOVE_OUTWARD";
pub const FOCUSER_ABORT_MOTION: &str = "FOCUSER_ABORT_MOTION";
pub const ABORT_MOTION: &str = "ABORT_MOTION";
pub const FOCUSER_SPEED: &str = "FOCUSER_SPEED";
pub const SPEED: &str = "SPEED";
pub const FOCUSER_REVERSE_MOTION: &str = "FOCUSER_REVERSE_MOTION";
pub const REVERSE_ENABLED: &str = "ENABLED";
pub const REVERSE_DISABLED: &str = "DISABLED";
pub const FOCUSER_TEMPERATURE: &str = "FOCUSER_TEMPERATURE";
pub const TEMPERATURE: &str = "TEMPERATURE";

const FOCUSER_GROUP: &str = "Focuser";
const NO_SENSOR_MESSAGE: &str = "The temperature sensor is not connected.";

/// Focuser simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocuserConfig {
    /// Instances created when `FOCUSER_SIM_DEVICE_NUMBER` is unset
    pub instances: usize,
    pub poll_ms: u64,
    pub temperature_ms: u64,
    pub temperature_first_ms: u64,
    pub max_position: u32,
    /// Controller steps per second at speed 1
    pub base_rate: f64,
    pub board: String,
}

impl Default for FocuserConfig {
    fn default() -> Self {
        Self {
            instances: 1,
            poll_ms: 500,
            temperature_ms: 2000,
            temperature_first_ms: 1000,
            max_position: 100_000,
            base_rate: 2_000.0,
            board: "DSD AF3".to_string(),
        }
    }
}

impl FocuserConfig {
    fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    fn controller(&self) -> ControllerModel {
        ControllerModel {
            board: self.board.clone(),
            max_position: self.max_position,
            base_rate: self.base_rate,
            ..ControllerModel::default()
        }
    }
}

/// Wire up one simulated controller per instance and build the focusers
pub fn create_focusers(config: &FocuserConfig, ports: &Arc<SerialPorts>, locks: &Arc<PortLocks>) -> Vec<SimFocuser> {
    let count = instance_count(INSTANCES_VAR, config.instances, MAX_INSTANCES);
    (1..=count)
        .map(|n| {
            let path = SerialPorts::path_for(n);
            ports.add(&path, SimulatedFocuserPort::new(config.controller()));
            SimFocuser::new(device_name(MODEL_NAME, n), path, config.clone(), locks.clone())
        })
        .collect()
}

struct FocuserState {
    props: DeviceProperties,
    port: Option<Arc<dyn FocuserPort>>,
    current: u32,
    target: u32,
    has_sensor: bool,
    position_timer: Option<TimerHandle>,
    temperature_timer: Option<TimerHandle>,
}

struct FocuserCore {
    name: String,
    path: String,
    config: FocuserConfig,
    locks: Arc<PortLocks>,
    state: Mutex<FocuserState>,
}

/// Focuser device
pub struct SimFocuser {
    core: Arc<FocuserCore>,
}

impl SimFocuser {
    pub fn new(name: impl Into<String>, path: impl Into<String>, config: FocuserConfig, locks: Arc<PortLocks>) -> Self {
        Self {
            core: Arc::new(FocuserCore {
                name: name.into(),
                path: path.into(),
                config,
                locks,
                state: Mutex::new(FocuserState {
                    props: DeviceProperties::new(),
                    port: None,
                    current: 0,
                    target: 0,
                    has_sensor: true,
                    position_timer: None,
                    temperature_timer: None,
                }),
            }),
        }
    }

    pub fn port_path(&self) -> &str {
        &self.core.path
    }

    /// Snapshot of a property, hidden ones included
    pub fn property(&self, name: &str) -> Option<Property> {
        self.core.state.lock().props.snapshot(name)
    }
}

fn not_connected(property: &mut Property) -> Option<String> {
    property.state = PropertyState::Alert;
    Some("Not connected".to_string())
}

impl FocuserCore {
    fn build_properties(&self) -> Result<Vec<Property>, BusError> {
        let name = self.name.as_str();
        let max = self.config.max_position as f64;
        let info = Property::text(name, FOCUSER_INFO, 2)
            .in_group(MAIN_GROUP)
            .labelled("Controller")
            .with_perm(Permission::ReadOnly)
            .with_state(PropertyState::Ok)
            .with_items([
                Item::text(BOARD, "Board", "N/A"),
                Item::text(FIRMWARE, "Firmware", "N/A"),
            ])?;
        let position = Property::number(name, FOCUSER_POSITION, 1)
            .in_group(FOCUSER_GROUP)
            .labelled("Position")
            .with_state(PropertyState::Ok)
            .with_items([Item::number(POSITION, "Absolute position", 0.0, max, 1.0, 0.0)])?;
        let steps = Property::number(name, FOCUSER_STEPS, 1)
            .in_group(FOCUSER_GROUP)
            .labelled("Relative move")
            .with_state(PropertyState::Ok)
            .with_items([Item::number(STEPS, "Steps", 0.0, max, 1.0, 0.0)])?;
        let direction = Property::switch(name, FOCUSER_DIRECTION, SwitchRule::OneOfMany, 2)
            .in_group(FOCUSER_GROUP)
            .labelled("Direction")
            .with_state(PropertyState::Ok)
            .with_items([
                Item::switch(MOVE_INWARD, "Move inward", true),
                Item::switch(MOVE_OUTWARD, "Move outward", false),
            ])?;
        let abort = Property::switch(name, FOCUSER_ABORT_MOTION, SwitchRule::AtMostOne, 1)
            .in_group(FOCUSER_GROUP)
            .labelled("Abort motion")
            .with_state(PropertyState::Ok)
            .with_items([Item::switch(ABORT_MOTION, "Abort", false)])?;
        let speed = Property::number(name, FOCUSER_SPEED, 1)
            .in_group(FOCUSER_GROUP)
            .labelled("Speed")
            .with_state(PropertyState::Ok)
            .with_items([Item::number(SPEED, "Speed", 1.0, 5.0, 1.0, 1.0)])?;
        let reverse = Property::switch(name, FOCUSER_REVERSE_MOTION, SwitchRule::OneOfMany, 2)
            .in_group(FOCUSER_GROUP)
            .labelled("Reverse motion")
            .with_state(PropertyState::Ok)
            .with_items([
                Item::switch(REVERSE_DISABLED, "Disabled", true),
                Item::switch(REVERSE_ENABLED, "Enabled", false),
            ])?;
        let mut temperature = Property::number(name, FOCUSER_TEMPERATURE, 1)
            .in_group(FOCUSER_GROUP)
            .labelled("Temperature")
            .with_perm(Permission::ReadOnly)
            .with_state(PropertyState::Idle)
            .with_items([Item::number(TEMPERATURE, "Temperature (°C)", -50.0, 50.0, 1.0, 0.0)])?;
        temperature.hidden = true;

        Ok(vec![
            standard::connection_property(name)?,
            standard::info_property(name, DRIVER_NAME, DRIVER_VERSION, Interface::FOCUSER)?,
            info,
            position,
            steps,
            direction,
            abort,
            speed,
            reverse,
            temperature,
        ])
    }

    fn start_poll(self: &Arc<Self>, bus: &Bus, state: &mut FocuserState) -> Result<(), BusError> {
        match &state.position_timer {
            Some(timer) => timer.reschedule(self.config.poll()),
            None => {
                state.position_timer = Some(schedule(bus, &self.name, self, self.config.poll(), Self::position_tick)?)
            }
        }
        Ok(())
    }

    /// Stop polling and give the port back; true if the temperature property was withdrawn
    fn shut_down(&self, state: &mut FocuserState) -> (Updates, bool) {
        driver::cancel(&mut state.position_timer);
        driver::cancel(&mut state.temperature_timer);
        let updates = state.props.alert_busy().into_iter().map(|p| (p, None)).collect();

        if state.port.take().is_some() {
            if let Err(e) = self.locks.release(&self.path, &self.name) {
                warn!(device = %self.name, error = %e, "Port release failed");
            }
        }
        let withdrawn = match state.props.get_mut(FOCUSER_TEMPERATURE) {
            Some(temperature) if !temperature.hidden => {
                temperature.hidden = true;
                true
            }
            _ => false,
        };
        (updates, withdrawn)
    }

    fn change_connection(self: &Arc<Self>, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let mut defines = Vec::new();
        let (updates, withdrawn) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(connection) = state.props.get_mut(CONNECTION) else {
                return Ok(());
            };
            if let Err(e) = connection.apply_change(request) {
                (vec![driver::reject(&self.name, connection, e)], false)
            } else if !standard::is_connected(connection) {
                connection.state = PropertyState::Ok;
                let (mut updates, withdrawn) = self.shut_down(state);
                updates.extend(state.props.snapshot(CONNECTION).map(|c| (c, None)));
                info!(device = %self.name, "Disconnected");
                (updates, withdrawn)
            } else if state.port.is_some() {
                (vec![(connection.clone(), None)], false)
            } else {
                let updates = match self.open(bus, state, &mut defines) {
                    Ok(updates) => updates,
                    Err(message) => {
                        let mut updates = Updates::new();
                        if let Some(connection) = state.props.get_mut(CONNECTION) {
                            standard::set_connected(connection, false);
                            connection.state = PropertyState::Alert;
                            updates.push((connection.clone(), Some(message)));
                        }
                        updates
                    }
                };
                (updates, false)
            }
        };

        publish(bus, updates);
        for property in &defines {
            bus.define_property(property, None);
        }
        if withdrawn {
            bus.delete_property(&self.name, Some(FOCUSER_TEMPERATURE), None);
        }
        Ok(())
    }

    /// Take the port and read the controller's initial state
    fn open(self: &Arc<Self>, bus: &Bus, state: &mut FocuserState, defines: &mut Vec<Property>) -> Result<Updates, String> {
        let port: Arc<dyn FocuserPort> = self.locks.try_acquire(&self.path, &self.name).map_err(|e| {
            warn!(device = %self.name, error = %e, "Connect failed");
            e.to_string()
        })?;

        let position = match port.position() {
            Ok(position) => position,
            Err(e) => {
                error!(device = %self.name, error = %e, "Focuser did not respond");
                if let Err(e) = self.locks.release(&self.path, &self.name) {
                    warn!(device = %self.name, error = %e, "Port release failed");
                }
                return Err("Focuser did not respond".to_string());
            }
        };

        let mut updates = Updates::new();
        let mut version = 0;
        match port.firmware() {
            Ok(firmware) => {
                info!(device = %self.name, board = %firmware.board, firmware = %firmware.version_text, "Controller identified");
                version = firmware.version;
                if let Some(info) = state.props.get_mut(FOCUSER_INFO) {
                    info.set_text(BOARD, firmware.board);
                    info.set_text(FIRMWARE, firmware.version_text);
                    updates.push((info.clone(), None));
                }
            }
            Err(e) => warn!(device = %self.name, error = %e, "Firmware query failed"),
        }

        state.current = position;
        state.target = position;
        if let Some(property) = state.props.get_mut(FOCUSER_POSITION) {
            property.set_number(POSITION, position as f64);
            property.state = PropertyState::Ok;
            updates.push((property.clone(), None));
        }

        if let Some(property) = state.props.get_mut(FOCUSER_SPEED) {
            match port.speed() {
                Ok(speed) => {
                    property.set_number(SPEED, speed as f64);
                    property.state = PropertyState::Ok;
                }
                Err(e) => {
                    warn!(device = %self.name, error = %e, "Speed query failed");
                    property.state = PropertyState::Alert;
                }
            }
            updates.push((property.clone(), None));
        }

        let reverse = state
            .props
            .get(FOCUSER_REVERSE_MOTION)
            .and_then(|p| p.switch_value(REVERSE_ENABLED))
            .unwrap_or(false);
        if let Err(e) = port.set_reverse(reverse) {
            warn!(device = %self.name, error = %e, "Reverse setting not applied");
        }

        if version > 1 {
            if let Some(temperature) = state.props.get_mut(FOCUSER_TEMPERATURE) {
                temperature.hidden = false;
                temperature.state = PropertyState::Idle;
                defines.push(temperature.clone());
            }
            state.has_sensor = true;
            let first = Duration::from_millis(self.config.temperature_first_ms);
            match schedule(bus, &self.name, self, first, Self::temperature_tick) {
                Ok(timer) => state.temperature_timer = Some(timer),
                Err(e) => warn!(device = %self.name, error = %e, "Temperature timer not started"),
            }
        }

        state.port = Some(port);
        if let Some(connection) = state.props.get_mut(CONNECTION) {
            connection.state = PropertyState::Ok;
            updates.push((connection.clone(), None));
        }
        info!(device = %self.name, position, version, "Connected");
        Ok(updates)
    }

    fn change_position(self: &Arc<Self>, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let port = state.port.clone();
            let current = state.current;
            let Some(property) = state.props.get_mut(FOCUSER_POSITION) else {
                return Ok(());
            };

            let mut message = None;
            let mut moving = false;
            let copied = match &port {
                Some(_) => property.copy_values(request, false).map(|_| ()),
                None => Ok(()),
            };
            match (port, copied) {
                (None, _) => message = not_connected(property),
                (_, Err(e)) => {
                    property.state = PropertyState::Alert;
                    message = Some(e.to_string());
                }
                (Some(port), Ok(())) => {
                    let target = property.number_target(POSITION).unwrap_or(current as f64).round() as u32;
                    property.set_number(POSITION, current as f64);
                    if target == current {
                        property.state = PropertyState::Ok;
                    } else {
                        property.state = PropertyState::Busy;
                        debug!(device = %self.name, from = current, to = target, "Go to position");
                        match port.goto(target) {
                            Ok(()) => moving = true,
                            Err(e) => {
                                error!(device = %self.name, target, error = %e, "Go to position failed");
                                property.state = PropertyState::Alert;
                                message = Some(e.to_string());
                            }
                        }
                    }
                    if moving {
                        state.target = target;
                    }
                }
            }
            if moving {
                if let Err(e) = self.start_poll(bus, state) {
                    if let Some(property) = state.props.get_mut(FOCUSER_POSITION) {
                        message = driver::reject(&self.name, property, e).1;
                    }
                }
            }
            state
                .props
                .snapshot(FOCUSER_POSITION)
                .map(|p| vec![(p, message)])
                .unwrap_or_default()
        };
        publish(bus, updates);
        Ok(())
    }

    fn change_steps(self: &Arc<Self>, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let port = state.port.clone();
            let inward = state
                .props
                .get(FOCUSER_DIRECTION)
                .and_then(|p| p.switch_value(MOVE_INWARD))
                .unwrap_or(true);
            let Some(steps) = state.props.get_mut(FOCUSER_STEPS) else {
                return Ok(());
            };

            let mut message = None;
            let mut moving = false;
            let copied = match &port {
                Some(_) => steps.copy_values(request, false).map(|_| ()),
                None => Ok(()),
            };
            match (port, copied) {
                (None, _) => message = not_connected(steps),
                (_, Err(e)) => {
                    steps.state = PropertyState::Alert;
                    message = Some(e.to_string());
                }
                (Some(port), Ok(())) => {
                    steps.state = PropertyState::Busy;
                    let count = steps.number_value(STEPS).unwrap_or(0.0).round() as i64;
                    match port.position() {
                        Ok(position) => state.current = position,
                        Err(e) => warn!(device = %self.name, error = %e, "Position query failed"),
                    }
                    let current = state.current as i64;
                    let target = if inward { current - count } else { current + count };
                    let target = target.clamp(0, self.config.max_position as i64) as u32;
                    debug!(device = %self.name, from = current, to = target, "Relative move");

                    if let Some(position) = state.props.get_mut(FOCUSER_POSITION) {
                        position.set_number(POSITION, current as f64);
                    }
                    match port.goto(target) {
                        Ok(()) => {
                            state.target = target;
                            moving = true;
                        }
                        Err(e) => {
                            error!(device = %self.name, target, error = %e, "Relative move failed");
                            message = Some(e.to_string());
                            if let Some(steps) = state.props.get_mut(FOCUSER_STEPS) {
                                steps.state = PropertyState::Alert;
                            }
                        }
                    }
                }
            }
            if moving {
                if let Err(e) = self.start_poll(bus, state) {
                    if let Some(property) = state.props.get_mut(FOCUSER_STEPS) {
                        message = driver::reject(&self.name, property, e).1;
                    }
                }
            }
            state
                .props
                .snapshot(FOCUSER_STEPS)
                .map(|p| vec![(p, message)])
                .unwrap_or_default()
        };
        publish(bus, updates);
        Ok(())
    }

    fn position_tick(self: &Arc<Self>, bus: &Bus) {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(port) = state.port.clone() else {
                return;
            };

            let reading = port
                .is_moving()
                .and_then(|moving| port.position().map(|position| (moving, position)));
            let settled = match reading {
                Ok((moving, position)) => {
                    state.current = position;
                    let arrived = !moving || position == state.target;
                    if !arrived {
                        if let Some(timer) = &state.position_timer {
                            timer.reschedule(self.config.poll());
                        }
                    }
                    arrived.then_some(PropertyState::Ok)
                }
                Err(e) => {
                    error!(device = %self.name, error = %e, "Position poll failed");
                    Some(PropertyState::Alert)
                }
            };

            let current = state.current as f64;
            let mut updates = Updates::new();
            for name in [FOCUSER_STEPS, FOCUSER_POSITION] {
                if let Some(property) = state.props.get_mut(name) {
                    if name == FOCUSER_POSITION {
                        property.set_number(POSITION, current);
                    }
                    if let Some(settled) = settled {
                        property.state = settled;
                    }
                    updates.push((property.clone(), None));
                }
            }
            updates
        };
        publish(bus, updates);
    }

    fn abort(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(abort) = state.props.get_mut(FOCUSER_ABORT_MOTION) else {
                return Ok(());
            };
            if let Err(e) = abort.copy_values(request, true) {
                let rejected = driver::reject(&self.name, abort, e);
                drop(guard);
                publish(bus, vec![rejected]);
                return Ok(());
            }
            driver::cancel(&mut state.position_timer);

            let mut outcome = PropertyState::Ok;
            if let Some(port) = state.port.clone() {
                if let Err(e) = port.stop() {
                    error!(device = %self.name, error = %e, "Stop failed");
                    outcome = PropertyState::Alert;
                }
                match port.position() {
                    Ok(position) => state.current = position,
                    Err(e) => {
                        error!(device = %self.name, error = %e, "Position query failed");
                        outcome = PropertyState::Alert;
                    }
                }
                info!(device = %self.name, position = state.current, "Motion aborted");
            }
            state.target = state.current;

            let current = state.current as f64;
            let mut updates = Updates::new();
            if let Some(position) = state.props.get_mut(FOCUSER_POSITION) {
                position.set_number(POSITION, current);
                position.state = PropertyState::Ok;
                updates.push((position.clone(), None));
            }
            if let Some(steps) = state.props.get_mut(FOCUSER_STEPS) {
                steps.state = PropertyState::Ok;
                updates.push((steps.clone(), None));
            }
            if let Some(abort) = state.props.get_mut(FOCUSER_ABORT_MOTION) {
                // the switch is momentary
                let _ = abort.copy_values(request, false);
                abort.set_switch(ABORT_MOTION, false);
                abort.state = outcome;
                updates.push((abort.clone(), None));
            }
            updates
        };
        publish(bus, updates);
        Ok(())
    }

    fn change_speed(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let port = state.port.clone();
            let Some(speed) = state.props.get_mut(FOCUSER_SPEED) else {
                return Ok(());
            };

            let mut message = None;
            let copied = match &port {
                Some(_) => speed.copy_values(request, false).map(|_| ()),
                None => Ok(()),
            };
            match (port, copied) {
                (None, _) => message = not_connected(speed),
                (_, Err(e)) => {
                    speed.state = PropertyState::Alert;
                    message = Some(e.to_string());
                }
                (Some(port), Ok(())) => {
                    let requested = speed.number_target(SPEED).unwrap_or(1.0).round() as u32;
                    let applied = port.set_speed(requested).and_then(|_| port.speed());
                    match applied {
                        Ok(actual) => {
                            speed.set_number(SPEED, actual as f64);
                            speed.state = PropertyState::Ok;
                        }
                        Err(e) => {
                            error!(device = %self.name, requested, error = %e, "Speed change failed");
                            speed.state = PropertyState::Alert;
                            message = Some(e.to_string());
                        }
                    }
                }
            }
            vec![(speed.clone(), message)]
        };
        publish(bus, updates);
        Ok(())
    }

    fn change_reverse(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let port = state.port.clone();
            let Some(reverse) = state.props.get_mut(FOCUSER_REVERSE_MOTION) else {
                return Ok(());
            };

            let mut message = None;
            match port {
                None => message = not_connected(reverse),
                Some(port) => match reverse.apply_change(request) {
                    Err(e) => message = driver::reject(&self.name, reverse, e).1,
                    Ok(_) => {
                        let enabled = reverse.switch_value(REVERSE_ENABLED).unwrap_or(false);
                        match port.set_reverse(enabled) {
                            Ok(()) => reverse.state = PropertyState::Ok,
                            Err(e) => {
                                error!(device = %self.name, enabled, error = %e, "Reverse change failed");
                                reverse.state = PropertyState::Alert;
                                message = Some(e.to_string());
                            }
                        }
                    }
                },
            }
            vec![(reverse.clone(), message)]
        };
        publish(bus, updates);
        Ok(())
    }

    fn change_direction(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let (snapshot, message) = {
            let mut state = self.state.lock();
            let Some(direction) = state.props.get_mut(FOCUSER_DIRECTION) else {
                return Ok(());
            };
            match direction.apply_change(request) {
                Ok(_) => {
                    direction.state = PropertyState::Ok;
                    (direction.clone(), None)
                }
                Err(e) => driver::reject(&self.name, direction, e),
            }
        };
        bus.update_property(&snapshot, message.as_deref());
        Ok(())
    }

    fn temperature_tick(self: &Arc<Self>, bus: &Bus) {
        let update = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(port) = state.port.clone() else {
                return;
            };
            if let Some(timer) = &state.temperature_timer {
                timer.reschedule(Duration::from_millis(self.config.temperature_ms));
            }
            let had_sensor = state.has_sensor;
            let Some(temperature) = state.props.get_mut(FOCUSER_TEMPERATURE) else {
                return;
            };

            match port.temperature() {
                Ok(reading) if reading <= NO_TEMPERATURE => {
                    temperature.set_number(TEMPERATURE, reading);
                    temperature.state = PropertyState::Alert;
                    state.has_sensor = false;
                    if had_sensor {
                        info!(device = %self.name, "{}", NO_SENSOR_MESSAGE);
                        Some((temperature.clone(), Some(NO_SENSOR_MESSAGE.to_string())))
                    } else {
                        None
                    }
                }
                Ok(reading) => {
                    temperature.set_number(TEMPERATURE, reading);
                    temperature.state = PropertyState::Ok;
                    state.has_sensor = true;
                    Some((temperature.clone(), None))
                }
                Err(e) => {
                    warn!(device = %self.name, error = %e, "Temperature query failed");
                    temperature.state = PropertyState::Alert;
                    Some((temperature.clone(), None))
                }
            }
        };
        publish(bus, update.into_iter().collect());
    }
}

impl Device for SimFocuser {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn attach(&self, bus: &Bus) -> Result<(), BusError> {
        let properties = self.core.build_properties()?;
        self.core.locks.bind(&self.core.path, &self.core.name);
        let snapshot = {
            let mut state = self.core.state.lock();
            for property in properties {
                state.props.insert(property);
            }
            state.props.matching(&Selector::all())
        };
        bus.define_all(&snapshot);
        info!(device = %self.core.name, port = %self.core.path, "Focuser simulator attached");
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
            FOCUSER_POSITION => self.core.change_position(bus, request),
            FOCUSER_STEPS => self.core.change_steps(bus, request),
            FOCUSER_DIRECTION => self.core.change_direction(bus, request),
            FOCUSER_ABORT_MOTION => self.core.abort(bus, request),
            FOCUSER_SPEED => self.core.change_speed(bus, request),
            FOCUSER_REVERSE_MOTION => self.core.change_reverse(bus, request),
            _ => Ok(()),
        }
    }

    fn detach(&self, bus: &Bus) -> Result<(), BusError> {
        let updates = {
            let mut state = self.core.state.lock();
            let (updates, _) = self.core.shut_down(&mut state);
            state.props.clear();
            updates
        };
        self.core.locks.unbind(&self.core.path, &self.core.name);
        publish(bus, updates);
        info!(device = %self.core.name, "Focuser simulator detached");
        Ok(())
    }
}
