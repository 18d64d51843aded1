//! Simulated CCD camera
//!
//! Connecting takes the USB resource lock and completes after a short delay.
//! Exposures count down on a timer and end with a synthetic 16-bit frame of
//! background noise and gaussian stars. The cooler walks the sensor
//! temperature toward its set-point one degree per tick.

use axon_core::standard::{
    self, ABORT_EXPOSURE, CCD_ABORT_EXPOSURE, CCD_EXPOSURE, CCD_IMAGE, CONNECTION, EXPOSURE, IMAGE,
};
use axon_core::{
    BlobValue, Bus, BusError, ClientId, Device, DeviceProperties, Interface, Item, Permission, Property,
    PropertyState, Selector, SwitchRule, TimerHandle,
};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::driver::{self, publish, schedule, Updates};
use crate::usb::UsbLocks;

pub const DRIVER_NAME: &str = "axon_ccd_simulator";
pub const DRIVER_VERSION: &str = "1.0";

pub const CCD_INFO: &str = "CCD_INFO";
pub const WIDTH: &str = "WIDTH";
pub const HEIGHT: &str = "HEIGHT";
pub const PIXEL_SIZE: &str = "PIXEL_SIZE";
pub const BITS_PER_PIXEL: &str = "BITS_PER_PIXEL";

pub const CCD_COOLER: &str = "CCD_COOLER";
pub const COOLER_ON: &str = "ON";
pub const COOLER_OFF: &str = "OFF";
pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
pub const TEMPERATURE: &str = "TEMPERATURE";
pub const CCD_COOLER_POWER: &str = "CCD_COOLER_POWER";
pub const POWER: &str = "POWER";

const CAMERA_GROUP: &str = "Camera";
const COOLER_GROUP: &str = "Cooler";
const IMAGE_FORMAT: &str = ".raw";
const EXPOSURE_TICK: Duration = Duration::from_secs(1);

/// Camera simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    /// Pixel size in microns
    pub pixel_size: f64,
    pub stars: usize,
    /// Longest exposure accepted, in seconds
    pub max_exposure: f64,
    pub connect_delay_ms: u64,
    pub temperature_period_ms: u64,
    pub ambient_temperature: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 1024,
            pixel_size: 5.2,
            stars: 100,
            max_exposure: 3600.0,
            connect_delay_ms: 500,
            temperature_period_ms: 5000,
            ambient_temperature: 25.0,
        }
    }
}

/// A star of the synthetic field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    pub x: f64,
    pub y: f64,
    pub amplitude: f64,
}

/// Scatter `count` stars over a `width` x `height` frame
pub fn star_field(width: u32, height: u32, count: usize, rng: &mut impl Rng) -> Vec<Star> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    (0..count)
        .map(|_| Star {
            x: rng.gen_range(0.0..width as f64),
            y: rng.gen_range(0.0..height as f64),
            amplitude: rng.gen_range(500.0..30000.0),
        })
        .collect()
}

/// Render one frame as little-endian u16 samples
///
/// Every pixel gets 8-bit background noise; each star adds a gaussian spot
/// clipped to a 9x9 box around its slightly jittered center.
pub fn render_frame(width: u32, height: u32, stars: &[Star], rng: &mut impl Rng) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut raw: Vec<u16> = (0..w * h).map(|_| rng.gen_range(0..256u16)).collect();

    for star in stars {
        let cx = star.x + rng.gen_range(-0.1..0.1);
        let cy = star.y + rng.gen_range(-0.1..0.1);
        let (x0, x1) = ((cx.round() as i64 - 4).max(0), (cx.round() as i64 + 4).min(w as i64 - 1));
        let (y0, y1) = ((cy.round() as i64 - 4).max(0), (cy.round() as i64 + 4).min(h as i64 - 1));
        for y in y0..=y1 {
            for x in x0..=x1 {
                let (dx, dy) = (cx - x as f64, cy - y as f64);
                let v = star.amplitude * (-(dx * dx + dy * dy) / 2.0).exp();
                let pixel = &mut raw[y as usize * w + x as usize];
                *pixel = pixel.saturating_add(v as u16);
            }
        }
    }

    raw.iter().flat_map(|p| p.to_le_bytes()).collect()
}

struct CameraState {
    props: DeviceProperties,
    /// Holding the USB resource
    holding: bool,
    connect_timer: Option<TimerHandle>,
    exposure_timer: Option<TimerHandle>,
    exposure_deadline: Option<Instant>,
    temperature_timer: Option<TimerHandle>,
    current_temperature: f64,
    target_temperature: f64,
    stars: Vec<Star>,
}

struct CameraCore {
    name: String,
    resource: String,
    config: CameraConfig,
    locks: Arc<UsbLocks>,
    state: Mutex<CameraState>,
}

/// Simulated camera device
pub struct SimCamera {
    core: Arc<CameraCore>,
}

impl SimCamera {
    pub fn new(name: impl Into<String>, resource: impl Into<String>, config: CameraConfig, locks: Arc<UsbLocks>) -> Self {
        let ambient = config.ambient_temperature;
        Self {
            core: Arc::new(CameraCore {
                name: name.into(),
                resource: resource.into(),
                config,
                locks,
                state: Mutex::new(CameraState {
                    props: DeviceProperties::new(),
                    holding: false,
                    connect_timer: None,
                    exposure_timer: None,
                    exposure_deadline: None,
                    temperature_timer: None,
                    current_temperature: ambient,
                    target_temperature: ambient,
                    stars: Vec::new(),
                }),
            }),
        }
    }

    pub fn resource(&self) -> &str {
        &self.core.resource
    }

    pub fn property(&self, name: &str) -> Option<Property> {
        self.core.state.lock().props.snapshot(name)
    }
}

impl CameraCore {
    fn build_properties(&self) -> Result<Vec<Property>, BusError> {
        let name = self.name.as_str();
        let config = &self.config;
        Ok(vec![
            standard::connection_property(name)?,
            standard::info_property(name, DRIVER_NAME, DRIVER_VERSION, Interface::CCD)?,
            Property::number(name, CCD_INFO, 4)
                .in_group(CAMERA_GROUP)
                .labelled("CCD info")
                .with_perm(Permission::ReadOnly)
                .with_state(PropertyState::Ok)
                .with_items([
                    Item::number(WIDTH, "Width", 0.0, 0.0, 0.0, config.width as f64),
                    Item::number(HEIGHT, "Height", 0.0, 0.0, 0.0, config.height as f64),
                    Item::number(PIXEL_SIZE, "Pixel size", 0.0, 0.0, 0.0, config.pixel_size),
                    Item::number(BITS_PER_PIXEL, "Bits per pixel", 0.0, 0.0, 0.0, 16.0),
                ])?,
            Property::number(name, CCD_EXPOSURE, 1)
                .in_group(CAMERA_GROUP)
                .labelled("Start exposure")
                .with_items([Item::number(EXPOSURE, "Duration (s)", 0.0, config.max_exposure, 0.001, 0.0)])?,
            Property::switch(name, CCD_ABORT_EXPOSURE, SwitchRule::AnyOfMany, 1)
                .in_group(CAMERA_GROUP)
                .labelled("Abort exposure")
                .with_items([Item::switch(ABORT_EXPOSURE, "Abort exposure", false)])?,
            Property::blob(name, CCD_IMAGE, 1)
                .in_group(CAMERA_GROUP)
                .labelled("Image data")
                .with_perm(Permission::ReadOnly)
                .with_items([Item::blob(IMAGE, "Image")])?,
            Property::switch(name, CCD_COOLER, SwitchRule::OneOfMany, 2)
                .in_group(COOLER_GROUP)
                .labelled("Cooler status")
                .with_items([Item::switch(COOLER_ON, "On", false), Item::switch(COOLER_OFF, "Off", true)])?,
            Property::number(name, CCD_TEMPERATURE, 1)
                .in_group(COOLER_GROUP)
                .labelled("Sensor temperature")
                .with_items([Item::number(
                    TEMPERATURE,
                    "Temperature (\u{b0}C)",
                    -50.0,
                    50.0,
                    1.0,
                    config.ambient_temperature,
                )])?,
            Property::number(name, CCD_COOLER_POWER, 1)
                .in_group(COOLER_GROUP)
                .labelled("Cooler power")
                .with_perm(Permission::ReadOnly)
                .with_items([Item::number(POWER, "Power (%)", 0.0, 100.0, 1.0, 0.0)])?,
        ])
    }

    fn is_connected(state: &CameraState) -> bool {
        state.holding
            && state
                .props
                .get(CONNECTION)
                .map(|c| standard::is_connected(c) && c.state == PropertyState::Ok)
                .unwrap_or(false)
    }

    /// Cancel timers, fail anything in flight and give the resource back
    fn shut_down(&self, state: &mut CameraState) -> Updates {
        driver::cancel(&mut state.connect_timer);
        driver::cancel(&mut state.exposure_timer);
        driver::cancel(&mut state.temperature_timer);
        state.exposure_deadline = None;

        let updates = state.props.alert_busy().into_iter().map(|p| (p, None)).collect();
        if state.holding {
            if let Err(e) = self.locks.release(&self.resource, &self.name) {
                warn!(device = %self.name, error = %e, "Resource release failed");
            }
            state.holding = false;
        }
        updates
    }

    fn change_connection(self: &Arc<Self>, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(connection) = state.props.get_mut(CONNECTION) else {
            return Ok(());
        };
        if let Err(e) = connection.apply_change(request) {
            let rejected = driver::reject(&self.name, connection, e);
            drop(guard);
            publish(bus, vec![rejected]);
            return Ok(());
        }
        let connect = standard::is_connected(connection);

        let mut updates = Updates::new();
        if connect {
            if state.holding {
                let connection = connection.clone();
                drop(guard);
                bus.update_property(&connection, None);
                return Ok(());
            }
            match self.locks.try_acquire(&self.resource, &self.name) {
                Ok(_) => {
                    let delay = Duration::from_millis(self.config.connect_delay_ms);
                    match schedule(bus, &self.name, self, delay, Self::connect_finished) {
                        Ok(timer) => {
                            state.holding = true;
                            state.connect_timer = Some(timer);
                            connection.state = PropertyState::Busy;
                            updates.push((connection.clone(), None));
                            debug!(device = %self.name, "Connecting");
                        }
                        Err(e) => {
                            if let Err(e) = self.locks.release(&self.resource, &self.name) {
                                warn!(device = %self.name, error = %e, "Resource release failed");
                            }
                            standard::set_connected(connection, false);
                            updates.push(driver::reject(&self.name, connection, e));
                        }
                    }
                }
                Err(e) => {
                    warn!(device = %self.name, error = %e, "Connect failed");
                    standard::set_connected(connection, false);
                    connection.state = PropertyState::Alert;
                    updates.push((connection.clone(), Some(e.to_string())));
                }
            }
        } else {
            connection.state = PropertyState::Ok;
            let snapshot = connection.clone();
            updates.extend(self.shut_down(state));
            updates.push((snapshot, None));
            info!(device = %self.name, "Disconnected");
        }
        drop(guard);
        publish(bus, updates);
        Ok(())
    }

    fn connect_finished(self: &Arc<Self>, bus: &Bus) {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.connect_timer = None;
            if !state.holding {
                return;
            }
            let period = Duration::from_millis(self.config.temperature_period_ms);
            match schedule(bus, &self.name, self, period, Self::temperature_tick) {
                Ok(timer) => state.temperature_timer = Some(timer),
                Err(e) => warn!(device = %self.name, error = %e, "Temperature timer not started"),
            }
            state
                .props
                .get_mut(CONNECTION)
                .map(|c| {
                    c.state = PropertyState::Ok;
                    vec![(c.clone(), None)]
                })
                .unwrap_or_default()
        };
        info!(device = %self.name, "Connected");
        publish(bus, updates);
    }

    fn start_exposure(self: &Arc<Self>, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let mut guard = self.state.lock();
        let connected = Self::is_connected(&guard);
        let state = &mut *guard;
        let Some(exposure) = state.props.get_mut(CCD_EXPOSURE) else {
            return Ok(());
        };
        if exposure.state == PropertyState::Busy {
            debug!(device = %self.name, "Exposure in progress, request ignored");
            return Ok(());
        }

        let mut updates = Updates::new();
        if !connected {
            exposure.state = PropertyState::Alert;
            updates.push((exposure.clone(), Some("Not connected".to_string())));
        } else if let Err(e) = exposure.apply_change(request) {
            updates.push(driver::reject(&self.name, exposure, e));
        } else {
            let seconds = exposure.number_target(EXPOSURE).unwrap_or(0.0);
            let length = Duration::from_secs_f64(seconds.max(0.0));
            driver::cancel(&mut state.exposure_timer);
            match schedule(bus, &self.name, self, length.min(EXPOSURE_TICK), Self::exposure_tick) {
                Ok(timer) => {
                    state.exposure_timer = Some(timer);
                    state.exposure_deadline = Some(Instant::now() + length);
                    exposure.state = PropertyState::Busy;
                    updates.push((exposure.clone(), Some("Exposure initiated".to_string())));
                    if let Some(image) = state.props.get_mut(CCD_IMAGE) {
                        image.state = PropertyState::Busy;
                        updates.push((image.clone(), None));
                    }
                    debug!(device = %self.name, seconds, "Exposure started");
                }
                Err(e) => updates.push(driver::reject(&self.name, exposure, e)),
            }
        }
        drop(guard);
        publish(bus, updates);
        Ok(())
    }

    fn exposure_tick(self: &Arc<Self>, bus: &Bus) {
        let stars = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(deadline) = state.exposure_deadline else {
                return;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                if let Some(timer) = &state.exposure_timer {
                    timer.reschedule(remaining.min(EXPOSURE_TICK));
                }
                let countdown = state.props.get_mut(CCD_EXPOSURE).map(|exposure| {
                    exposure.set_number(EXPOSURE, remaining.as_secs_f64());
                    exposure.clone()
                });
                drop(guard);
                if let Some(countdown) = countdown {
                    bus.update_property(&countdown, None);
                }
                return;
            }
            state.exposure_deadline = None;
            state.exposure_timer = None;
            state.stars.clone()
        };

        let frame = render_frame(self.config.width, self.config.height, &stars, &mut rand::thread_rng());

        let updates = {
            let mut state = self.state.lock();
            let mut updates = Updates::new();
            if let Some(image) = state.props.get_mut(CCD_IMAGE) {
                image.set_blob(IMAGE, BlobValue::new(IMAGE_FORMAT, frame));
                image.state = PropertyState::Ok;
                updates.push((image.clone(), None));
            }
            if let Some(exposure) = state.props.get_mut(CCD_EXPOSURE) {
                exposure.set_number(EXPOSURE, 0.0);
                exposure.state = PropertyState::Ok;
                updates.push((exposure.clone(), Some("Exposure done".to_string())));
            }
            updates
        };
        debug!(device = %self.name, "Exposure done");
        publish(bus, updates);
    }

    fn abort_exposure(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut updates = Updates::new();

            let Some(abort) = state.props.get_mut(CCD_ABORT_EXPOSURE) else {
                return Ok(());
            };
            if let Err(e) = abort.copy_values(request, true) {
                let rejected = driver::reject(&self.name, abort, e);
                drop(guard);
                publish(bus, vec![rejected]);
                return Ok(());
            }

            let running = state.exposure_deadline.take().is_some();
            driver::cancel(&mut state.exposure_timer);
            if running {
                if let Some(exposure) = state.props.get_mut(CCD_EXPOSURE) {
                    exposure.set_number(EXPOSURE, 0.0);
                    exposure.state = PropertyState::Alert;
                    updates.push((exposure.clone(), Some("Exposure aborted".to_string())));
                }
                if let Some(image) = state.props.get_mut(CCD_IMAGE) {
                    image.state = PropertyState::Alert;
                    updates.push((image.clone(), None));
                }
                info!(device = %self.name, "Exposure aborted");
            }
            if let Some(abort) = state.props.get_mut(CCD_ABORT_EXPOSURE) {
                // the switch is momentary
                let _ = abort.copy_values(request, false);
                abort.set_switch(ABORT_EXPOSURE, false);
                abort.state = PropertyState::Ok;
                updates.push((abort.clone(), None));
            }
            updates
        };
        publish(bus, updates);
        Ok(())
    }

    fn change_cooler(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(cooler) = state.props.get_mut(CCD_COOLER) else {
                return Ok(());
            };
            if let Err(e) = cooler.apply_change(request) {
                let rejected = driver::reject(&self.name, cooler, e);
                drop(guard);
                publish(bus, vec![rejected]);
                return Ok(());
            }
            cooler.state = PropertyState::Ok;
            let on = cooler.switch_value(COOLER_ON) == Some(true);
            let mut updates = vec![(cooler.clone(), None)];

            if let Some(temperature) = state.props.get_mut(CCD_TEMPERATURE) {
                if on {
                    temperature.perm = Permission::ReadWrite;
                    temperature.state = PropertyState::Busy;
                    state.target_temperature = temperature.number_target(TEMPERATURE).unwrap_or(state.current_temperature);
                } else {
                    temperature.perm = Permission::ReadOnly;
                    temperature.state = PropertyState::Idle;
                    state.target_temperature = self.config.ambient_temperature;
                }
                updates.push((temperature.clone(), None));
            }
            if !on {
                if let Some(power) = state.props.get_mut(CCD_COOLER_POWER) {
                    power.set_number(POWER, 0.0);
                    updates.push((power.clone(), None));
                }
            }
            debug!(device = %self.name, on, target = state.target_temperature, "Cooler changed");
            updates
        };
        publish(bus, updates);
        Ok(())
    }

    fn change_temperature(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let update = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(temperature) = state.props.get_mut(CCD_TEMPERATURE) else {
                return Ok(());
            };
            match temperature.copy_values(request, false) {
                Ok(_) => {
                    state.target_temperature = temperature.number_target(TEMPERATURE).unwrap_or(state.current_temperature);
                    temperature.set_number(TEMPERATURE, state.current_temperature);
                    temperature.state = PropertyState::Busy;
                    (temperature.clone(), Some(format!("Target temperature {}", state.target_temperature)))
                }
                Err(e) => {
                    temperature.state = PropertyState::Alert;
                    (temperature.clone(), Some(e.to_string()))
                }
            }
        };
        publish(bus, vec![update]);
        Ok(())
    }

    fn temperature_tick(self: &Arc<Self>, bus: &Bus) {
        let updates = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let cooler_on = state
                .props
                .get(CCD_COOLER)
                .and_then(|c| c.switch_value(COOLER_ON))
                .unwrap_or(false);
            let diff = state.current_temperature - state.target_temperature;
            let mut updates = Updates::new();

            let power = if diff > 10.0 {
                Some(100.0)
            } else if diff > 5.0 {
                Some(50.0)
            } else if diff < 0.0 {
                Some(0.0)
            } else {
                None
            };
            if let (Some(level), Some(cooler_power)) = (power, state.props.get_mut(CCD_COOLER_POWER)) {
                let level = if cooler_on || level == 0.0 { level } else { 0.0 };
                if cooler_power.number_value(POWER) != Some(level) {
                    cooler_power.set_number(POWER, level);
                    updates.push((cooler_power.clone(), None));
                }
            }

            if diff > 0.0 {
                state.current_temperature -= 1.0;
            } else if diff < 0.0 {
                state.current_temperature += 1.0;
            }
            if let Some(temperature) = state.props.get_mut(CCD_TEMPERATURE) {
                temperature.set_number(TEMPERATURE, state.current_temperature);
                temperature.state = match (cooler_on, diff == 0.0) {
                    (false, _) => PropertyState::Idle,
                    (true, true) => PropertyState::Ok,
                    (true, false) => PropertyState::Busy,
                };
                updates.push((temperature.clone(), None));
            }

            if let Some(timer) = &state.temperature_timer {
                timer.reschedule(Duration::from_millis(self.config.temperature_period_ms));
            }
            updates
        };
        publish(bus, updates);
    }
}

impl Device for SimCamera {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn attach(&self, bus: &Bus) -> Result<(), BusError> {
        let properties = self.core.build_properties()?;
        let config = &self.core.config;
        let stars = star_field(config.width, config.height, config.stars, &mut rand::thread_rng());
        let snapshot = {
            let mut state = self.core.state.lock();
            for property in properties {
                state.props.insert(property);
            }
            state.stars = stars;
            state.props.matching(&Selector::all())
        };
        bus.define_all(&snapshot);
        info!(device = %self.core.name, resource = %self.core.resource, "CCD simulator attached");
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
            CCD_EXPOSURE => self.core.start_exposure(bus, request),
            CCD_ABORT_EXPOSURE => self.core.abort_exposure(bus, request),
            CCD_COOLER => self.core.change_cooler(bus, request),
            CCD_TEMPERATURE => self.core.change_temperature(bus, request),
            _ => Ok(()),
        }
    }

    fn detach(&self, bus: &Bus) -> Result<(), BusError> {
        let updates = {
            let mut state = self.core.state.lock();
            let updates = self.core.shut_down(&mut state);
            state.props.clear();
            updates
        };
        publish(bus, updates);
        info!(device = %self.core.name, "CCD simulator detached");
        Ok(())
    }
}
