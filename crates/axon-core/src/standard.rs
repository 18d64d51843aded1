//! Well-known property and item names, and builders for the standard properties

use crate::device::Interface;
use crate::property::{Item, Permission, Property, PropertyError, SwitchRule};

pub const MAIN_GROUP: &str = "Main";

pub const CONNECTION: &str = "CONNECTION";
pub const CONNECTED: &str = "CONNECTED";
pub const DISCONNECTED: &str = "DISCONNECTED";

pub const INFO: &str = "INFO";
pub const DEVICE_NAME: &str = "DEVICE_NAME";
pub const DEVICE_DRIVER: &str = "DEVICE_DRIVER";
pub const DEVICE_VERSION: &str = "DEVICE_VERSION";
pub const DEVICE_INTERFACE: &str = "DEVICE_INTERFACE";

pub const CCD_EXPOSURE: &str = "CCD_EXPOSURE";
pub const EXPOSURE: &str = "EXPOSURE";
pub const CCD_ABORT_EXPOSURE: &str = "CCD_ABORT_EXPOSURE";
pub const ABORT_EXPOSURE: &str = "ABORT_EXPOSURE";
pub const CCD_IMAGE: &str = "CCD_IMAGE";
pub const IMAGE: &str = "IMAGE";

pub fn connection_property(device: &str) -> Result<Property, PropertyError> {
    Property::switch(device, CONNECTION, SwitchRule::OneOfMany, 2)
        .in_group(MAIN_GROUP)
        .labelled("Connection status")
        .with_items([
            Item::switch(CONNECTED, "Connected", false),
            Item::switch(DISCONNECTED, "Disconnected", true),
        ])
}

pub fn info_property(
    device: &str,
    driver: &str,
    version: &str,
    interface: Interface,
) -> Result<Property, PropertyError> {
    Property::text(device, INFO, 4)
        .in_group(MAIN_GROUP)
        .labelled("Device info")
        .with_perm(Permission::ReadOnly)
        .with_items([
            Item::text(DEVICE_NAME, "Name", device),
            Item::text(DEVICE_DRIVER, "Driver", driver),
            Item::text(DEVICE_VERSION, "Version", version),
            Item::text(DEVICE_INTERFACE, "Interface", interface.to_string()),
        ])
}

/// Interface bits advertised by an INFO property
pub fn interface_of(info: &Property) -> Option<Interface> {
    info.text_value(DEVICE_INTERFACE).and_then(Interface::parse)
}

pub fn is_connected(connection: &Property) -> bool {
    connection.switch_value(CONNECTED) == Some(true)
}

pub fn set_connected(connection: &mut Property, connected: bool) {
    let item = if connected { CONNECTED } else { DISCONNECTED };
    connection.set_switch(item, true);
}

/// Client-side request to connect or disconnect `device`
pub fn connect_request(device: &str, connect: bool) -> Result<Property, PropertyError> {
    let item = if connect { CONNECTED } else { DISCONNECTED };
    Property::switch(device, CONNECTION, SwitchRule::OneOfMany, 2).with_items([Item::switch(item, "", true)])
}

/// Client-side request to start an exposure of `seconds` on `device`
pub fn exposure_request(device: &str, seconds: f64) -> Result<Property, PropertyError> {
    Property::number(device, CCD_EXPOSURE, 1).with_items([Item::number(EXPOSURE, "", 0.0, 0.0, 0.0, seconds)])
}

/// Client-side request to abort the exposure running on `device`
pub fn abort_exposure_request(device: &str) -> Result<Property, PropertyError> {
    Property::switch(device, CCD_ABORT_EXPOSURE, SwitchRule::AnyOfMany, 1)
        .with_items([Item::switch(ABORT_EXPOSURE, "", true)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_carries_interface() {
        let info = info_property("Cam #1", "axon_ccd_simulator", "1.0", Interface::CCD | Interface::GUIDER).unwrap();
        assert_eq!(info.text_value(DEVICE_NAME), Some("Cam #1"));
        assert_eq!(interface_of(&info), Some(Interface(6)));
    }

    #[test]
    fn test_connect_request_applies() {
        let mut conn = connection_property("Cam #1").unwrap();
        assert!(!is_connected(&conn));
        conn.copy_values(&connect_request("Cam #1", true).unwrap(), false).unwrap();
        assert!(is_connected(&conn));
        assert_eq!(conn.switch_value(DISCONNECTED), Some(false));

        set_connected(&mut conn, false);
        assert!(!is_connected(&conn));
    }
}
