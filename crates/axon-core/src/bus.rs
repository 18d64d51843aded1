//! Dispatch between devices and clients
//!
//! The `Bus` owns the registry of attached devices and clients. Change and
//! enumerate requests are routed synchronously to the addressed device under
//! that device's gate; define/update/delete notifications fan out to every
//! attached client in attach order.

use parking_lot::{ReentrantMutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BusError;
use crate::property::{Property, Selector};
use crate::timer::{TimerHandle, Timers};

/// Per-device exclusion scope
///
/// Change requests, enumerate requests, timer callbacks and detach all run
/// while holding the gate of the device they address. The gate is reentrant
/// so a handler may trigger a nested request into the same device on the
/// same thread.
pub type DeviceGate = Arc<ReentrantMutex<()>>;

/// Opaque client identity assigned at attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device role: owns properties and handles change requests
///
/// Implementations keep their state behind their own lock and must not hold
/// it while calling back into the bus.
pub trait Device: Send + Sync {
    /// Unique name on the bus
    fn name(&self) -> &str;

    /// Build the property set and publish it
    fn attach(&self, bus: &Bus) -> Result<(), BusError>;

    /// Re-emit define notifications for every property matching `selector`
    fn enumerate_properties(
        &self,
        bus: &Bus,
        client: Option<ClientId>,
        selector: &Selector,
    ) -> Result<(), BusError>;

    /// Validate and commit a change request
    fn change_property(
        &self,
        bus: &Bus,
        client: Option<ClientId>,
        request: &Property,
    ) -> Result<(), BusError>;

    /// Release hardware, cancel timers, drop properties
    fn detach(&self, bus: &Bus) -> Result<(), BusError>;
}

/// Client role: observes properties across all devices
#[allow(unused_variables)]
pub trait Client: Send + Sync {
    fn name(&self) -> &str;

    /// Device this client controls; its notifications are not delivered back
    fn controls(&self) -> Option<&str> {
        None
    }

    fn attach(&self, bus: &Bus, id: ClientId) -> Result<(), BusError> {
        Ok(())
    }

    fn define_property(&self, bus: &Bus, property: &Property, message: Option<&str>) {}

    fn update_property(&self, bus: &Bus, property: &Property, message: Option<&str>) {}

    /// `name == None` means the device is gone and everything for it goes
    fn delete_property(&self, bus: &Bus, device: &str, name: Option<&str>, message: Option<&str>) {}

    fn detach(&self, bus: &Bus) {}
}

struct DeviceEntry {
    name: String,
    device: Arc<dyn Device>,
    gate: DeviceGate,
    attached: AtomicBool,
}

struct ClientEntry {
    id: ClientId,
    client: Arc<dyn Client>,
}

struct BusInner {
    devices: RwLock<Vec<Arc<DeviceEntry>>>,
    clients: RwLock<Vec<Arc<ClientEntry>>>,
    timers: Timers,
}

/// Central broker between devices and clients
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(timers: Timers) -> Self {
        Self {
            inner: Arc::new(BusInner {
                devices: RwLock::new(Vec::new()),
                clients: RwLock::new(Vec::new()),
                timers,
            }),
        }
    }

    pub fn timers(&self) -> &Timers {
        &self.inner.timers
    }

    /// Names of attached devices in attach order
    pub fn device_names(&self) -> Vec<String> {
        self.inner.devices.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn is_attached(&self, device: &str) -> bool {
        self.find_device(device).is_some()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    pub fn gate(&self, device: &str) -> Option<DeviceGate> {
        self.find_device(device).map(|e| e.gate.clone())
    }

    fn find_device(&self, name: &str) -> Option<Arc<DeviceEntry>> {
        self.inner
            .devices
            .read()
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    fn controlled_by(&self, client: Option<ClientId>) -> Option<String> {
        let id = client?;
        self.inner
            .clients
            .read()
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.client.controls().map(str::to_string))
    }

    /// Register a device and run its attach handler
    pub fn attach_device(&self, device: Arc<dyn Device>) -> Result<(), BusError> {
        let name = device.name().to_string();
        let entry = {
            let mut devices = self.inner.devices.write();
            if devices.iter().any(|e| e.name == name) {
                return Err(BusError::DuplicateDevice(name));
            }
            let entry = Arc::new(DeviceEntry {
                name: name.clone(),
                device,
                gate: Arc::new(ReentrantMutex::new(())),
                attached: AtomicBool::new(true),
            });
            devices.push(entry.clone());
            entry
        };

        let result = {
            let _gate = entry.gate.lock();
            entry.device.attach(self)
        };

        match result {
            Ok(()) => {
                info!(device = %name, "Device attached");
                Ok(())
            }
            Err(e) => {
                warn!(device = %name, error = %e, "Device attach failed");
                entry.attached.store(false, Ordering::SeqCst);
                self.inner.devices.write().retain(|d| !Arc::ptr_eq(d, &entry));
                Err(e)
            }
        }
    }

    /// Run the detach handler, unregister the device and tell clients it is gone
    pub fn detach_device(&self, name: &str) -> Result<(), BusError> {
        let entry = self
            .find_device(name)
            .ok_or_else(|| BusError::UnknownDevice(name.to_string()))?;

        let result = {
            let _gate = entry.gate.lock();
            let result = entry.device.detach(self);
            entry.attached.store(false, Ordering::SeqCst);
            result
        };

        self.inner.devices.write().retain(|d| !Arc::ptr_eq(d, &entry));
        self.delete_property(name, None, None);

        if let Err(ref e) = result {
            warn!(device = %name, error = %e, "Device detach reported an error");
        } else {
            info!(device = %name, "Device detached");
        }
        result
    }

    pub fn attach_client(&self, client: Arc<dyn Client>) -> Result<ClientId, BusError> {
        let id = ClientId::new();
        let entry = Arc::new(ClientEntry {
            id,
            client: client.clone(),
        });
        self.inner.clients.write().push(entry);

        if let Err(e) = client.attach(self, id) {
            warn!(client = %client.name(), error = %e, "Client attach failed");
            self.inner.clients.write().retain(|c| c.id != id);
            return Err(e);
        }
        info!(client = %client.name(), id = %id, "Client attached");
        Ok(id)
    }

    pub fn detach_client(&self, id: ClientId) -> Result<(), BusError> {
        let entry = {
            let mut clients = self.inner.clients.write();
            let index = clients
                .iter()
                .position(|c| c.id == id)
                .ok_or_else(|| BusError::UnknownClient(id.to_string()))?;
            clients.remove(index)
        };
        entry.client.detach(self);
        info!(client = %entry.client.name(), "Client detached");
        Ok(())
    }

    /// Route a change request to the device(s) it addresses
    ///
    /// An empty `request.device` addresses every device. Returns once each
    /// handler has returned; asynchronous completion arrives later as updates.
    pub fn change_property(&self, client: Option<ClientId>, request: &Property) -> Result<(), BusError> {
        let wildcard = request.device.is_empty();
        let targets: Vec<Arc<DeviceEntry>> = self
            .inner
            .devices
            .read()
            .iter()
            .filter(|e| wildcard || e.name == request.device)
            .cloned()
            .collect();

        if targets.is_empty() && !wildcard {
            return Err(BusError::UnknownDevice(request.device.clone()));
        }

        debug!(
            device = %request.device,
            property = %request.name,
            targets = targets.len(),
            "Routing change request"
        );

        for entry in targets {
            let _gate = entry.gate.lock();
            if !entry.attached.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = entry.device.change_property(self, client, request) {
                warn!(
                    device = %entry.name,
                    property = %request.name,
                    error = %e,
                    "Change request failed"
                );
                if !wildcard {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Ask matching devices to re-emit define notifications
    ///
    /// The device controlled by the requesting client is skipped.
    pub fn enumerate_properties(&self, client: Option<ClientId>, selector: &Selector) {
        let controlled = self.controlled_by(client);
        let targets: Vec<Arc<DeviceEntry>> = self
            .inner
            .devices
            .read()
            .iter()
            .filter(|e| selector.matches_device(&e.name))
            .filter(|e| controlled.as_deref() != Some(e.name.as_str()))
            .cloned()
            .collect();

        for entry in targets {
            let _gate = entry.gate.lock();
            if !entry.attached.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = entry.device.enumerate_properties(self, client, selector) {
                warn!(device = %entry.name, error = %e, "Enumerate failed");
            }
        }
    }

    fn recipients(&self, origin: &str) -> Vec<Arc<ClientEntry>> {
        self.inner
            .clients
            .read()
            .iter()
            .filter(|c| c.client.controls() != Some(origin))
            .cloned()
            .collect()
    }

    pub fn define_property(&self, property: &Property, message: Option<&str>) {
        if property.hidden {
            return;
        }
        for entry in self.recipients(&property.device) {
            entry.client.define_property(self, property, message);
        }
    }

    pub fn define_all(&self, properties: &[Property]) {
        for property in properties {
            self.define_property(property, None);
        }
    }

    pub fn update_property(&self, property: &Property, message: Option<&str>) {
        if property.hidden {
            return;
        }
        for entry in self.recipients(&property.device) {
            entry.client.update_property(self, property, message);
        }
    }

    pub fn update_all(&self, properties: &[Property]) {
        for property in properties {
            self.update_property(property, None);
        }
    }

    pub fn delete_property(&self, device: &str, name: Option<&str>, message: Option<&str>) {
        for entry in self.recipients(device) {
            entry.client.delete_property(self, device, name, message);
        }
    }

    /// Schedule a callback bound to a device
    ///
    /// The callback runs under the device gate and is skipped once the device
    /// has been detached.
    pub fn set_timer<F>(&self, device: &str, delay: Duration, mut callback: F) -> Result<TimerHandle, BusError>
    where
        F: FnMut() + Send + 'static,
    {
        let entry = self
            .find_device(device)
            .ok_or_else(|| BusError::UnknownDevice(device.to_string()))?;
        let gate = entry.gate.clone();
        let weak = Arc::downgrade(&entry);
        drop(entry);

        Ok(self.inner.timers.set(gate, delay, move || {
            let alive = weak
                .upgrade()
                .map(|e| e.attached.load(Ordering::SeqCst))
                .unwrap_or(false);
            if alive {
                callback();
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Item, PropertyState, SwitchRule};
    use crate::standard;
    use parking_lot::Mutex;
    use tokio::runtime::Handle;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Define(String, String, String),
        Update(String, String, String, PropertyState),
        Delete(String, String, Option<String>),
    }

    struct Recorder {
        name: String,
        controls: Option<String>,
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Client for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn controls(&self) -> Option<&str> {
            self.controls.as_deref()
        }

        fn define_property(&self, _bus: &Bus, property: &Property, _message: Option<&str>) {
            self.events.lock().push(Event::Define(
                self.name.clone(),
                property.device.clone(),
                property.name.clone(),
            ));
        }

        fn update_property(&self, _bus: &Bus, property: &Property, _message: Option<&str>) {
            self.events.lock().push(Event::Update(
                self.name.clone(),
                property.device.clone(),
                property.name.clone(),
                property.state,
            ));
        }

        fn delete_property(&self, _bus: &Bus, device: &str, name: Option<&str>, _message: Option<&str>) {
            self.events.lock().push(Event::Delete(
                self.name.clone(),
                device.to_string(),
                name.map(str::to_string),
            ));
        }
    }

    struct TestCamera {
        name: String,
        connect_delay: Duration,
        state: Arc<Mutex<Vec<Property>>>,
    }

    impl TestCamera {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                connect_delay: Duration::from_millis(30),
                state: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Device for TestCamera {
        fn name(&self) -> &str {
            &self.name
        }

        fn attach(&self, bus: &Bus) -> Result<(), BusError> {
            let exposure = Property::number(&self.name, "CCD_EXPOSURE", 1)
                .with_items([Item::number("EXPOSURE", "Duration", 0.0, 3600.0, 1.0, 0.0)])?;
            let props = vec![standard::connection_property(&self.name)?, exposure];
            *self.state.lock() = props.clone();
            bus.define_all(&props);
            Ok(())
        }

        fn enumerate_properties(&self, bus: &Bus, _client: Option<ClientId>, selector: &Selector) -> Result<(), BusError> {
            let props: Vec<Property> = self
                .state
                .lock()
                .iter()
                .filter(|p| selector.matches(p))
                .cloned()
                .collect();
            bus.define_all(&props);
            Ok(())
        }

        fn change_property(&self, bus: &Bus, _client: Option<ClientId>, request: &Property) -> Result<(), BusError> {
            if request.name != standard::CONNECTION {
                return Ok(());
            }
            let snapshot = {
                let mut props = self.state.lock();
                let conn = &mut props[0];
                conn.copy_values(request, false)?;
                conn.state = PropertyState::Busy;
                conn.clone()
            };
            bus.update_property(&snapshot, None);

            let state = self.state.clone();
            let completion_bus = bus.clone();
            bus.set_timer(&self.name, self.connect_delay, move || {
                let snapshot = {
                    let mut props = state.lock();
                    props[0].state = PropertyState::Ok;
                    props[0].clone()
                };
                completion_bus.update_property(&snapshot, None);
            })?;
            Ok(())
        }

        fn detach(&self, _bus: &Bus) -> Result<(), BusError> {
            self.state.lock().clear();
            Ok(())
        }
    }

    fn recorder(name: &str, controls: Option<&str>, events: &Arc<Mutex<Vec<Event>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            controls: controls.map(str::to_string),
            events: events.clone(),
        })
    }

    fn bus() -> Bus {
        Bus::new(Timers::new(Handle::current()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fan_out_in_attach_order() {
        let bus = bus();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.attach_client(recorder("first", None, &events)).unwrap();
        bus.attach_client(recorder("second", None, &events)).unwrap();

        bus.attach_device(Arc::new(TestCamera::new("Cam #1"))).unwrap();

        let events = events.lock().clone();
        assert_eq!(
            events,
            vec![
                Event::Define("first".into(), "Cam #1".into(), "CONNECTION".into()),
                Event::Define("second".into(), "Cam #1".into(), "CONNECTION".into()),
                Event::Define("first".into(), "Cam #1".into(), "CCD_EXPOSURE".into()),
                Event::Define("second".into(), "Cam #1".into(), "CCD_EXPOSURE".into()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_self_notification_suppressed() {
        let bus = bus();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.attach_client(recorder("owner", Some("Cam #1"), &events)).unwrap();
        bus.attach_client(recorder("other", None, &events)).unwrap();
        bus.attach_device(Arc::new(TestCamera::new("Cam #1"))).unwrap();

        let events = events.lock().clone();
        assert!(events.iter().all(|e| !matches!(e, Event::Define(c, _, _) if c == "owner")));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_duplicate_and_unknown_devices() {
        let bus = bus();
        bus.attach_device(Arc::new(TestCamera::new("Cam #1"))).unwrap();
        assert!(matches!(
            bus.attach_device(Arc::new(TestCamera::new("Cam #1"))),
            Err(BusError::DuplicateDevice(_))
        ));

        let request = standard::connect_request("Nope", true).unwrap();
        assert!(matches!(
            bus.change_property(None, &request),
            Err(BusError::UnknownDevice(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enumerate_filters_by_selector() {
        let bus = bus();
        bus.attach_device(Arc::new(TestCamera::new("Cam #1"))).unwrap();
        bus.attach_device(Arc::new(TestCamera::new("Cam #2"))).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        bus.attach_client(recorder("late", None, &events)).unwrap();
        bus.enumerate_properties(None, &Selector::property("Cam #2", "CCD_EXPOSURE"));

        assert_eq!(
            events.lock().clone(),
            vec![Event::Define("late".into(), "Cam #2".into(), "CCD_EXPOSURE".into())]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_detach_emits_device_delete() {
        let bus = bus();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.attach_client(recorder("watcher", None, &events)).unwrap();
        bus.attach_device(Arc::new(TestCamera::new("Cam #1"))).unwrap();

        bus.detach_device("Cam #1").unwrap();
        assert!(!bus.is_attached("Cam #1"));
        assert_eq!(
            events.lock().last().cloned(),
            Some(Event::Delete("watcher".into(), "Cam #1".into(), None))
        );
        assert!(matches!(bus.detach_device("Cam #1"), Err(BusError::UnknownDevice(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_goes_busy_then_ok() {
        let bus = bus();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.attach_client(recorder("client", None, &events)).unwrap();
        bus.attach_device(Arc::new(TestCamera::new("Cam #1"))).unwrap();

        let request = standard::connect_request("Cam #1", true).unwrap();
        bus.change_property(None, &request).unwrap();

        let busy = Event::Update("client".into(), "Cam #1".into(), "CONNECTION".into(), PropertyState::Busy);
        let ok = Event::Update("client".into(), "Cam #1".into(), "CONNECTION".into(), PropertyState::Ok);
        assert_eq!(events.lock().last().cloned(), Some(busy));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(events.lock().last().cloned(), Some(ok));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timer_skipped_after_detach() {
        let bus = bus();
        let events = Arc::new(Mutex::new(Vec::new()));
        bus.attach_client(recorder("client", None, &events)).unwrap();
        bus.attach_device(Arc::new(TestCamera::new("Cam #1"))).unwrap();

        let request = standard::connect_request("Cam #1", true).unwrap();
        bus.change_property(None, &request).unwrap();
        bus.detach_device("Cam #1").unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = events.lock().clone();
        assert!(!events.iter().any(|e| matches!(e, Event::Update(_, _, _, PropertyState::Ok))));
    }

    #[test]
    fn test_switch_rule_helpers_on_connection() {
        let mut conn = standard::connection_property("Dev").unwrap();
        assert!(conn.rule_satisfied());
        assert_eq!(conn.kind, crate::property::PropertyKind::Switch(SwitchRule::OneOfMany));
        conn.set_switch(standard::CONNECTED, true);
        assert!(standard::is_connected(&conn));
    }
}
