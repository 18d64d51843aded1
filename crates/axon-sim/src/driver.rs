//! Plumbing shared by the simulated drivers

use axon_core::{Bus, BusError, Property, PropertyState, TimerHandle};
use std::fmt::Display;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

/// Snapshots to publish once the driver state lock is released
pub(crate) type Updates = Vec<(Property, Option<String>)>;

pub(crate) fn publish(bus: &Bus, updates: Updates) {
    for (property, message) in updates {
        bus.update_property(&property, message.as_deref());
    }
}

/// Put `property` in Alert and return the snapshot to publish with the reason
pub(crate) fn reject(device: &str, property: &mut Property, error: impl Display) -> (Property, Option<String>) {
    warn!(device = %device, property = %property.name, error = %error, "Request rejected");
    property.state = PropertyState::Alert;
    (property.clone(), Some(error.to_string()))
}

/// Schedule `tick` on `core` under `device`'s gate
///
/// The timer only keeps a weak reference to the driver, so a fired timer
/// never outlives a detached device.
pub(crate) fn schedule<T>(
    bus: &Bus,
    device: &str,
    core: &Arc<T>,
    delay: Duration,
    tick: fn(&Arc<T>, &Bus),
) -> Result<TimerHandle, BusError>
where
    T: Send + Sync + 'static,
{
    let weak: Weak<T> = Arc::downgrade(core);
    let owner = bus.clone();
    bus.set_timer(device, delay, move || {
        if let Some(core) = weak.upgrade() {
            tick(&core, &owner);
        }
    })
}

/// Cancel and drop a stored timer handle
pub(crate) fn cancel(timer: &mut Option<TimerHandle>) {
    if let Some(timer) = timer.take() {
        timer.cancel();
    }
}
