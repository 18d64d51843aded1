//! Helpers shared by device drivers: naming, interface bits, property sets

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use tracing::warn;

use crate::property::{Property, PropertyState, Selector};

/// Capability bitmask advertised through the INFO property
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interface(pub u32);

impl Interface {
    pub const NONE: Interface = Interface(0);
    pub const MOUNT: Interface = Interface(1 << 0);
    pub const CCD: Interface = Interface(1 << 1);
    pub const GUIDER: Interface = Interface(1 << 2);
    pub const FOCUSER: Interface = Interface(1 << 3);
    pub const WHEEL: Interface = Interface(1 << 4);
    pub const AGENT: Interface = Interface(1 << 15);

    /// True if every bit of `other` is set (and `other` is not empty)
    pub fn contains(self, other: Interface) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Parse the decimal text form used in DEVICE_INTERFACE
    pub fn parse(text: &str) -> Option<Interface> {
        text.trim().parse::<u32>().ok().map(Interface)
    }
}

impl BitOr for Interface {
    type Output = Interface;

    fn bitor(self, rhs: Interface) -> Interface {
        Interface(self.0 | rhs.0)
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compose a device name from a model and an instance suffix: "Model #2"
pub fn device_name(model: &str, suffix: impl fmt::Display) -> String {
    format!("{} #{}", model, suffix)
}

/// Number of instances to create, read from an environment variable
///
/// Clamped to `1..=max`; `default` is used when the variable is unset or
/// unparseable.
pub fn instance_count(var: &str, default: usize, max: usize) -> usize {
    let value = std::env::var(var).ok();
    parse_instance_count(var, value.as_deref(), default, max)
}

fn parse_instance_count(var: &str, value: Option<&str>, default: usize, max: usize) -> usize {
    let max = max.max(1);
    let Some(value) = value else {
        return default.clamp(1, max);
    };
    match value.trim().parse::<i64>() {
        Ok(n) => n.clamp(1, max as i64) as usize,
        Err(_) => {
            warn!(var, value, "Ignoring unparseable instance count");
            default.clamp(1, max)
        }
    }
}

/// Ordered set of properties owned by one device
#[derive(Debug, Clone, Default)]
pub struct DeviceProperties {
    properties: Vec<Property>,
}

impl DeviceProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by name
    pub fn insert(&mut self, property: Property) {
        match self.properties.iter_mut().find(|p| p.name == property.name) {
            Some(existing) => *existing = property,
            None => self.properties.push(property),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Property> {
        let index = self.properties.iter().position(|p| p.name == name)?;
        Some(self.properties.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn clear(&mut self) {
        self.properties.clear();
    }

    /// Snapshots of published properties matching `selector`
    pub fn matching(&self, selector: &Selector) -> Vec<Property> {
        self.properties
            .iter()
            .filter(|p| !p.hidden && selector.matches(p))
            .cloned()
            .collect()
    }

    /// Move every Busy property to Alert, returning snapshots of the ones changed
    pub fn alert_busy(&mut self) -> Vec<Property> {
        self.properties
            .iter_mut()
            .filter(|p| p.state == PropertyState::Busy)
            .map(|p| {
                p.state = PropertyState::Alert;
                p.clone()
            })
            .collect()
    }

    /// Snapshot of one property, if present
    pub fn snapshot(&self, name: &str) -> Option<Property> {
        self.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Item;

    #[test]
    fn test_device_name() {
        assert_eq!(device_name("CCD Imager Simulator", 1), "CCD Imager Simulator #1");
        assert_eq!(device_name("Touptek GP-1200", "1a2b"), "Touptek GP-1200 #1a2b");
    }

    #[test]
    fn test_instance_count_clamps() {
        assert_eq!(parse_instance_count("N", None, 1, 8), 1);
        assert_eq!(parse_instance_count("N", Some("3"), 1, 8), 3);
        assert_eq!(parse_instance_count("N", Some("0"), 1, 8), 1);
        assert_eq!(parse_instance_count("N", Some("-4"), 1, 8), 1);
        assert_eq!(parse_instance_count("N", Some("42"), 1, 8), 8);
        assert_eq!(parse_instance_count("N", Some("many"), 2, 8), 2);
    }

    #[test]
    fn test_interface_bits() {
        let camera = Interface::CCD | Interface::GUIDER;
        assert!(camera.contains(Interface::CCD));
        assert!(camera.contains(Interface::GUIDER));
        assert!(!camera.contains(Interface::WHEEL));
        assert!(!camera.contains(Interface::NONE));
        assert_eq!(Interface::parse(" 6 "), Some(camera));
        assert_eq!(Interface::parse("ccd"), None);
        assert_eq!(camera.to_string(), "6");
    }

    #[test]
    fn test_alert_busy_only_touches_busy() {
        let mut props = DeviceProperties::new();
        props.insert(Property::text("Dev", "A", 1).with_state(PropertyState::Busy));
        props.insert(Property::text("Dev", "B", 1).with_state(PropertyState::Ok));

        let changed = props.alert_busy();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "A");
        assert_eq!(props.get("A").map(|p| p.state), Some(PropertyState::Alert));
        assert_eq!(props.get("B").map(|p| p.state), Some(PropertyState::Ok));
    }

    #[test]
    fn test_insert_replaces_and_matching_skips_hidden() {
        let mut props = DeviceProperties::new();
        props.insert(Property::text("Dev", "A", 1));
        let mut hidden = Property::text("Dev", "B", 1);
        hidden.hidden = true;
        props.insert(hidden);
        props.insert(
            Property::text("Dev", "A", 1)
                .with_items([Item::text("X", "X", "1")])
                .unwrap(),
        );

        assert_eq!(props.len(), 2);
        assert_eq!(props.get("A").map(|p| p.len()), Some(1));
        let visible = props.matching(&Selector::all());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "A");
    }
}
