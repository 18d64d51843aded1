//! Push operator values to a property of the selected camera

use axon_core::{Item, Property, PropertyKind, PropertyState};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AgentError;
use crate::imager::{AgentConfig, ImagerAgent};

/// Bounds for waiting on a forwarded change
#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl From<&AgentConfig> for ForwardOptions {
    fn from(config: &AgentConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.forward_timeout_ms),
            poll_interval: Duration::from_millis(config.forward_poll_ms.max(1)),
        }
    }
}

fn build_request(template: &Property, value: &str) -> Result<Property, AgentError> {
    let invalid = || AgentError::InvalidValue {
        property: template.name.clone(),
        value: value.to_string(),
    };
    let first = template.items().first().map(|i| i.name.clone()).ok_or_else(invalid)?;

    let item = match &template.kind {
        PropertyKind::Text => Item::text(first, "", value),
        PropertyKind::Number => {
            let number = value.trim().parse::<f64>().map_err(|_| invalid())?;
            Item::number(first, "", 0.0, 0.0, 0.0, number)
        }
        PropertyKind::Switch(_) => {
            if template.get_item(value).is_none() {
                return Err(invalid());
            }
            Item::switch(value, "", true)
        }
        other => return Err(AgentError::Unsupported { kind: other.label() }),
    };

    let mut request = template.request();
    request.push_item(item)?;
    Ok(request)
}

impl ImagerAgent {
    /// Set `name` on the selected camera and wait for it to settle
    ///
    /// Returns whether the property settled in Ok. Text and number properties
    /// take the value for their first item; switch properties turn on the
    /// item named by the value.
    pub async fn set_remote_value(
        &self,
        name: &str,
        value: &str,
        options: ForwardOptions,
        cancel: &CancellationToken,
    ) -> Result<bool, AgentError> {
        if value.is_empty() {
            return Ok(true);
        }

        let (bus, client, device, template) = {
            let state = self.shared.state.lock();
            let device = state.selected.clone().ok_or(AgentError::NoCameraSelected)?;
            let bus = state.bus.clone().ok_or(AgentError::NotAttached)?;
            let template = state
                .cache
                .get(&device, name)
                .cloned()
                .ok_or_else(|| AgentError::UnknownProperty {
                    device: device.clone(),
                    name: name.to_string(),
                })?;
            (bus, state.client, device, template)
        };

        let request = build_request(&template, value)?;
        debug!(device = %device, property = %name, value = %value, "Forwarding value");
        bus.change_property(client, &request)?;

        let settle = async {
            loop {
                let state = self
                    .cached(&device, name)
                    .map(|p| p.state)
                    .unwrap_or(PropertyState::Alert);
                if state != PropertyState::Busy {
                    return state;
                }
                tokio::time::sleep(options.poll_interval).await;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            settled = tokio::time::timeout(options.timeout, settle) => match settled {
                Ok(state) => Ok(state == PropertyState::Ok),
                Err(_) => Err(AgentError::Timeout {
                    device: device.clone(),
                    property: name.to_string(),
                }),
            },
        }
    }
}
