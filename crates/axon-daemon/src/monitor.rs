//! Bus monitor: a client relaying notifications to in-process subscribers

use axon_core::{Bus, Client, Property, PropertyState};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Notification seen on the bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum BusEvent {
    #[serde(rename = "define")]
    Defined {
        device: String,
        name: String,
        state: PropertyState,
    },
    #[serde(rename = "update")]
    Updated {
        device: String,
        name: String,
        state: PropertyState,
        message: Option<String>,
    },
    #[serde(rename = "delete")]
    Deleted { device: String, name: Option<String> },
}

pub struct MonitorClient {
    events: broadcast::Sender<BusEvent>,
}

impl MonitorClient {
    pub fn new(events: broadcast::Sender<BusEvent>) -> Self {
        Self { events }
    }
}

impl Client for MonitorClient {
    fn name(&self) -> &str {
        "Bus Monitor"
    }

    fn define_property(&self, _bus: &Bus, property: &Property, _message: Option<&str>) {
        let _ = self.events.send(BusEvent::Defined {
            device: property.device.clone(),
            name: property.name.clone(),
            state: property.state,
        });
    }

    fn update_property(&self, _bus: &Bus, property: &Property, message: Option<&str>) {
        let _ = self.events.send(BusEvent::Updated {
            device: property.device.clone(),
            name: property.name.clone(),
            state: property.state,
            message: message.map(str::to_string),
        });
    }

    fn delete_property(&self, _bus: &Bus, device: &str, name: Option<&str>, _message: Option<&str>) {
        let _ = self.events.send(BusEvent::Deleted {
            device: device.to_string(),
            name: name.map(str::to_string),
        });
    }
}

/// Log every event until `shutdown` fires
pub fn spawn_logger(mut events: broadcast::Receiver<BusEvent>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bus monitor lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}

fn log_event(event: &BusEvent) {
    match event {
        BusEvent::Updated {
            device,
            name,
            state: PropertyState::Alert,
            message,
        } => {
            info!(device = %device, property = %name, message = ?message, "Property alert");
        }
        _ => {
            if let Ok(json) = serde_json::to_string(event) {
                debug!(event = %json, "Bus event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::{Item, Timers};
    use std::sync::Arc;
    use tokio::runtime::Handle;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_relays_notifications() {
        let bus = Bus::new(Timers::new(Handle::current()));
        let (tx, mut rx) = broadcast::channel(16);
        bus.attach_client(Arc::new(MonitorClient::new(tx))).unwrap();

        let property = Property::text("Dev", "NOTE", 1)
            .with_items([Item::text("TEXT", "", "hello")])
            .unwrap();
        bus.update_property(&property, Some("hi"));
        bus.delete_property("Dev", None, None);

        match rx.recv().await.unwrap() {
            BusEvent::Updated { name, message, .. } => {
                assert_eq!(name, "NOTE");
                assert_eq!(message.as_deref(), Some("hi"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), BusEvent::Deleted { name: None, .. }));
    }

    #[test]
    fn test_event_json_shape() {
        let event = BusEvent::Deleted {
            device: "Dev".to_string(),
            name: Some("NOTE".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["data"]["name"], "NOTE");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logger_survives_lag_and_stops() {
        let (tx, rx) = broadcast::channel(1);
        let shutdown = CancellationToken::new();
        for _ in 0..4 {
            let _ = tx.send(BusEvent::Deleted {
                device: "Dev".to_string(),
                name: None,
            });
        }
        let task = spawn_logger(rx, shutdown.clone());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        shutdown.cancel();
        task.await.unwrap();
    }
}
