//! Imager agent: device-facing controls plus the client observing cameras

use axon_core::standard::{self, CCD_EXPOSURE, CONNECTION, INFO};
use axon_core::{
    Bus, BusError, Client, ClientId, Device, DeviceProperties, Interface, Item, Property, PropertyState, Selector,
    SwitchRule,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::batch::BatchRun;
use crate::cache::PropertyCache;

pub const DRIVER_NAME: &str = "axon_agent_imager";
pub const DRIVER_VERSION: &str = "1.0";

pub const AGENT_CCD_LIST: &str = "AGENT_CCD_LIST";
pub const NONE_ITEM: &str = "NONE";

pub const AGENT_CCD_BATCH: &str = "AGENT_CCD_BATCH";
pub const BATCH_COUNT: &str = "COUNT";
pub const BATCH_DELAY: &str = "DELAY";
pub const BATCH_EXPOSURE: &str = "EXPOSURE";

pub const AGENT_START_PROCESS: &str = "AGENT_START_PROCESS";
pub const START_CCD_BATCH: &str = "CCD_BATCH";

pub const AGENT_ABORT_PROCESS: &str = "AGENT_ABORT_PROCESS";
pub const ABORT: &str = "ABORT";

const BATCH_GROUP: &str = "Batch";

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Device name on the bus
    pub name: String,
    /// Camera list capacity, including the NONE item
    pub max_devices: usize,
    /// Remote property cache capacity
    pub cache_capacity: usize,
    /// Extra time allowed after the exposure length before a frame is failed
    pub completion_grace_ms: u64,
    pub forward_timeout_ms: u64,
    pub forward_poll_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Imager Agent".to_string(),
            max_devices: 32,
            cache_capacity: 512,
            completion_grace_ms: 5000,
            forward_timeout_ms: 10_000,
            forward_poll_ms: 10,
        }
    }
}

/// Latest CCD_EXPOSURE state of the camera a batch is running on
#[derive(Debug, Clone, Default)]
pub(crate) struct ExposureStatus {
    pub seq: u64,
    pub device: String,
    pub state: PropertyState,
}

pub(crate) struct AgentState {
    pub props: DeviceProperties,
    pub cache: PropertyCache,
    pub selected: Option<String>,
    pub client: Option<ClientId>,
    pub bus: Option<Bus>,
    pub batch: Option<BatchRun>,
}

pub(crate) struct AgentShared {
    pub config: AgentConfig,
    pub state: Mutex<AgentState>,
    pub exposure: watch::Sender<ExposureStatus>,
    pub runtime: Handle,
}

/// Device role of the imager agent
pub struct ImagerAgent {
    pub(crate) shared: Arc<AgentShared>,
}

/// Client role of the imager agent; controls the agent device
pub struct AgentClient {
    shared: Arc<AgentShared>,
}

impl ImagerAgent {
    pub fn new(config: AgentConfig, runtime: Handle) -> Self {
        let (exposure, _) = watch::channel(ExposureStatus::default());
        let cache = PropertyCache::new(config.cache_capacity);
        Self {
            shared: Arc::new(AgentShared {
                config,
                state: Mutex::new(AgentState {
                    props: DeviceProperties::new(),
                    cache,
                    selected: None,
                    client: None,
                    bus: None,
                    batch: None,
                }),
                exposure,
                runtime,
            }),
        }
    }

    /// Attach the device role, then the client role
    pub fn register(bus: &Bus, config: AgentConfig) -> Result<Arc<ImagerAgent>, BusError> {
        let agent = Arc::new(ImagerAgent::new(config, Handle::current()));
        bus.attach_device(agent.clone())?;
        bus.attach_client(Arc::new(agent.client()))?;
        Ok(agent)
    }

    pub fn client(&self) -> AgentClient {
        AgentClient {
            shared: self.shared.clone(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.shared.config
    }

    /// Snapshot of one of the agent's own properties
    pub fn property(&self, name: &str) -> Option<Property> {
        self.shared.state.lock().props.snapshot(name)
    }

    /// Discovered cameras in list order
    pub fn cameras(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .props
            .get(AGENT_CCD_LIST)
            .map(|list| {
                list.items()
                    .iter()
                    .filter(|i| i.name != NONE_ITEM)
                    .map(|i| i.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn selected(&self) -> Option<String> {
        self.shared.state.lock().selected.clone()
    }

    /// Latest cached snapshot of a remote property
    pub fn cached(&self, device: &str, name: &str) -> Option<Property> {
        self.shared.state.lock().cache.get(device, name).cloned()
    }

    /// When a remote property was last refreshed
    pub fn cached_at(&self, device: &str, name: &str) -> Option<DateTime<Utc>> {
        self.shared.state.lock().cache.get_entry(device, name).map(|e| e.updated_at)
    }

    pub fn is_batch_running(&self) -> bool {
        self.shared.state.lock().batch.is_some()
    }

    fn build_properties(&self) -> Result<Vec<Property>, BusError> {
        let name = &self.shared.config.name;
        let list = Property::switch(name, AGENT_CCD_LIST, SwitchRule::OneOfMany, self.shared.config.max_devices.max(1))
            .in_group(standard::MAIN_GROUP)
            .labelled("Camera list")
            .with_state(PropertyState::Ok)
            .with_items([Item::switch(NONE_ITEM, "None", true)])?;
        let batch = Property::number(name, AGENT_CCD_BATCH, 3)
            .in_group(BATCH_GROUP)
            .labelled("Batch settings")
            .with_state(PropertyState::Ok)
            .with_items([
                Item::number(BATCH_COUNT, "Frame count", 0.0, 1000.0, 1.0, 1.0),
                Item::number(BATCH_DELAY, "Delay after each exposure", 0.0, 3600.0, 1.0, 0.0),
                Item::number(BATCH_EXPOSURE, "Exposure time", 0.0, 3600.0, 0.001, 1.0),
            ])?;
        let start = Property::switch(name, AGENT_START_PROCESS, SwitchRule::AnyOfMany, 1)
            .in_group(BATCH_GROUP)
            .labelled("Start batch")
            .with_state(PropertyState::Ok)
            .with_items([Item::switch(START_CCD_BATCH, "Start batch", false)])?;
        let abort = Property::switch(name, AGENT_ABORT_PROCESS, SwitchRule::AnyOfMany, 1)
            .in_group(BATCH_GROUP)
            .labelled("Abort batch")
            .with_state(PropertyState::Ok)
            .with_items([Item::switch(ABORT, "Abort batch", false)])?;
        let info = standard::info_property(name, DRIVER_NAME, DRIVER_VERSION, Interface::AGENT)?;
        Ok(vec![list, batch, start, abort, info])
    }

    fn select_camera(&self, bus: &Bus, request: &Property) -> Result<(), BusError> {
        let (previous, next, snapshot, client) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let client = state.client;
            let Some(list) = state.props.get_mut(AGENT_CCD_LIST) else {
                return Ok(());
            };
            let previous = list
                .selected_item()
                .map(|i| i.name.clone())
                .filter(|n| n != NONE_ITEM);

            let mut scratch = list.clone();
            let rejected = match scratch.copy_values(request, false) {
                Err(e) => Some(e.to_string()),
                Ok(_) => {
                    if scratch.selected_item().is_none() {
                        scratch.set_switch(NONE_ITEM, true);
                    }
                    (!scratch.rule_satisfied()).then(|| "Select a single camera".to_string())
                }
            };
            if let Some(message) = rejected {
                warn!(error = %message, "Rejected camera selection");
                list.state = PropertyState::Alert;
                let snapshot = list.clone();
                drop(guard);
                bus.update_property(&snapshot, Some(&message));
                return Ok(());
            }
            *list = scratch;
            let next = list
                .selected_item()
                .map(|i| i.name.clone())
                .filter(|n| n != NONE_ITEM);
            list.state = if next.is_some() {
                PropertyState::Busy
            } else {
                PropertyState::Ok
            };
            let snapshot = list.clone();
            state.selected = next.clone();
            (previous, next, snapshot, client)
        };

        if let Some(previous) = previous {
            debug!(camera = %previous, "Disconnecting previous camera");
            if let Err(e) = bus.change_property(client, &standard::connect_request(&previous, false)?) {
                warn!(camera = %previous, error = %e, "Failed to disconnect previous camera");
            }
        }

        bus.update_property(&snapshot, None);

        if let Some(next) = next {
            info!(camera = %next, "Selecting camera");
            if let Err(e) = bus.change_property(client, &standard::connect_request(&next, true)?) {
                warn!(camera = %next, error = %e, "Failed to connect camera");
                let snapshot = {
                    let mut state = self.shared.state.lock();
                    state.props.get_mut(AGENT_CCD_LIST).map(|list| {
                        list.state = PropertyState::Alert;
                        list.clone()
                    })
                };
                if let Some(snapshot) = snapshot {
                    bus.update_property(&snapshot, Some(&e.to_string()));
                }
            }
        }
        Ok(())
    }

    fn change_batch_settings(&self, bus: &Bus, request: &Property) {
        let result = {
            let mut state = self.shared.state.lock();
            state.props.get_mut(AGENT_CCD_BATCH).map(|batch| {
                let message = match batch.copy_values(request, false) {
                    Ok(_) => {
                        batch.state = PropertyState::Ok;
                        None
                    }
                    Err(e) => {
                        batch.state = PropertyState::Alert;
                        Some(e.to_string())
                    }
                };
                (batch.clone(), message)
            })
        };
        if let Some((snapshot, message)) = result {
            bus.update_property(&snapshot, message.as_deref());
        }
    }
}

impl Device for ImagerAgent {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn attach(&self, bus: &Bus) -> Result<(), BusError> {
        let properties = self.build_properties()?;
        let snapshot = {
            let mut state = self.shared.state.lock();
            for property in properties {
                state.props.insert(property);
            }
            state.bus = Some(bus.clone());
            state.props.matching(&Selector::all())
        };
        bus.define_all(&snapshot);
        info!(device = %self.shared.config.name, "Imager agent attached");
        Ok(())
    }

    fn enumerate_properties(&self, bus: &Bus, client: Option<ClientId>, selector: &Selector) -> Result<(), BusError> {
        let snapshot = {
            let state = self.shared.state.lock();
            if client.is_some() && client == state.client {
                return Ok(());
            }
            state.props.matching(selector)
        };
        bus.define_all(&snapshot);
        Ok(())
    }

    fn change_property(&self, bus: &Bus, client: Option<ClientId>, request: &Property) -> Result<(), BusError> {
        if client.is_some() && client == self.shared.state.lock().client {
            return Ok(());
        }
        match request.name.as_str() {
            AGENT_CCD_LIST => self.select_camera(bus, request),
            AGENT_CCD_BATCH => {
                self.change_batch_settings(bus, request);
                Ok(())
            }
            AGENT_START_PROCESS => self.start_batch(bus, request),
            AGENT_ABORT_PROCESS => self.abort_batch(bus, request),
            _ => Ok(()),
        }
    }

    fn detach(&self, _bus: &Bus) -> Result<(), BusError> {
        let mut state = self.shared.state.lock();
        if let Some(run) = state.batch.take() {
            run.cancel.cancel();
        }
        state.props.clear();
        state.bus = None;
        info!(device = %self.shared.config.name, "Imager agent detached");
        Ok(())
    }
}

impl AgentClient {
    fn remember(&self, property: &Property) {
        let mut state = self.shared.state.lock();
        if let Err(e) = state.cache.store(property) {
            warn!(error = %e, "Property not cached");
        }
        if property.name == CCD_EXPOSURE
            && state.batch.as_ref().map(|b| b.camera == property.device).unwrap_or(false)
        {
            self.shared.exposure.send_modify(|status| {
                status.seq += 1;
                status.device = property.device.clone();
                status.state = property.state;
            });
        }
    }

    fn add_camera(&self, bus: &Bus, info: &Property) {
        let is_camera = standard::interface_of(info)
            .map(|i| i.contains(Interface::CCD))
            .unwrap_or(false);
        if !is_camera || info.device == self.shared.config.name {
            return;
        }
        let snapshot = {
            let mut state = self.shared.state.lock();
            let Some(list) = state.props.get_mut(AGENT_CCD_LIST) else {
                return;
            };
            if list.get_item(&info.device).is_some() {
                return;
            }
            if let Err(e) = list.push_item(Item::switch(info.device.as_str(), info.device.as_str(), false)) {
                warn!(camera = %info.device, error = %e, "Camera list full");
                return;
            }
            list.clone()
        };
        info!(camera = %info.device, "Camera discovered");
        bus.update_property(&snapshot, None);
    }

    fn remove_camera(&self, bus: &Bus, device: &str) {
        let snapshot = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let Some(list) = state.props.get_mut(AGENT_CCD_LIST) else {
                return;
            };
            if list.remove_item(device).is_none() {
                return;
            }
            let mut message = None;
            if state.selected.as_deref() == Some(device) {
                state.selected = None;
                list.set_switch(NONE_ITEM, true);
                list.state = PropertyState::Alert;
                message = Some(format!("Selected camera {} removed", device));
            }
            (list.clone(), message)
        };
        info!(camera = %device, "Camera removed");
        bus.update_property(&snapshot.0, snapshot.1.as_deref());
    }

    fn connection_changed(&self, bus: &Bus, connection: &Property) {
        if connection.state == PropertyState::Busy {
            return;
        }
        let (snapshot, enumerate, client) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.selected.as_deref() != Some(connection.device.as_str()) {
                return;
            }
            let client = state.client;
            let Some(list) = state.props.get_mut(AGENT_CCD_LIST) else {
                return;
            };
            let connected = standard::is_connected(connection);
            let mut enumerate = false;
            match list.state {
                PropertyState::Busy => {
                    if connection.state == PropertyState::Alert {
                        list.state = PropertyState::Alert;
                    } else if connected && connection.state == PropertyState::Ok {
                        list.state = PropertyState::Ok;
                        enumerate = true;
                    }
                }
                PropertyState::Ok if !connected => list.state = PropertyState::Alert,
                _ => return,
            }
            (list.clone(), enumerate, client)
        };

        if enumerate {
            debug!(camera = %connection.device, "Camera connected, enumerating");
            bus.enumerate_properties(client, &Selector::device(&connection.device));
        }
        bus.update_property(&snapshot, None);
    }
}

impl Client for AgentClient {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn controls(&self) -> Option<&str> {
        Some(&self.shared.config.name)
    }

    fn attach(&self, bus: &Bus, id: ClientId) -> Result<(), BusError> {
        {
            let mut state = self.shared.state.lock();
            state.client = Some(id);
            if state.bus.is_none() {
                state.bus = Some(bus.clone());
            }
        }
        bus.enumerate_properties(Some(id), &Selector::all());
        Ok(())
    }

    fn define_property(&self, bus: &Bus, property: &Property, _message: Option<&str>) {
        self.remember(property);
        match property.name.as_str() {
            INFO => self.add_camera(bus, property),
            CONNECTION => self.connection_changed(bus, property),
            _ => {}
        }
    }

    fn update_property(&self, bus: &Bus, property: &Property, _message: Option<&str>) {
        self.remember(property);
        if property.name == CONNECTION {
            self.connection_changed(bus, property);
        }
    }

    fn delete_property(&self, bus: &Bus, device: &str, name: Option<&str>, _message: Option<&str>) {
        {
            let mut state = self.shared.state.lock();
            match name {
                Some(name) => {
                    state.cache.remove(device, name);
                }
                None => {
                    state.cache.remove_device(device);
                }
            }
        }
        if name.is_none() || name == Some(INFO) {
            self.remove_camera(bus, device);
        }
    }

    fn detach(&self, _bus: &Bus) {
        self.shared.state.lock().client = None;
    }
}
