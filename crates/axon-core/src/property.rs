//! Property vectors: the unit of state exchanged on the bus
//!
//! A property is identified by `(device, name)` and carries an ordered list of
//! items whose values match the property kind. State transitions are always
//! driven by the owning device; nothing in this module changes `state` on its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropertyError {
    #[error("Property {property} is full ({capacity} items)")]
    CapacityExceeded { property: String, capacity: usize },
    #[error("Property {property} already has an item named {item}")]
    DuplicateItem { property: String, item: String },
    #[error("Kind mismatch on {property}: expected {expected}, got {found}")]
    KindMismatch {
        property: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{property} needs {expected}, request selects {selected}")]
    RuleViolated {
        property: String,
        expected: &'static str,
        selected: usize,
    },
    #[error("Value {value} of {item} is outside [{min}, {max}]")]
    OutOfRange {
        item: String,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Lifecycle state of a property
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyState {
    /// Not actively pursued
    #[default]
    Idle,
    /// Last operation succeeded, value is authoritative
    Ok,
    /// Operation in flight
    Busy,
    /// Last operation failed, value may be stale
    Alert,
}

impl fmt::Display for PropertyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Ok => "Ok",
            Self::Busy => "Busy",
            Self::Alert => "Alert",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    ReadOnly,
    #[default]
    ReadWrite,
    WriteOnly,
}

/// Selection rule for switch properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchRule {
    OneOfMany,
    AtMostOne,
    AnyOfMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Switch(SwitchRule),
    Number,
    Text,
    Light,
    Blob,
}

impl PropertyKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Switch(_) => "switch",
            Self::Number => "number",
            Self::Text => "text",
            Self::Light => "light",
            Self::Blob => "blob",
        }
    }

    fn same_family(&self, other: &PropertyKind) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Numeric item value
///
/// `target` is the last requested set-point, `value` the last observed reading.
/// They diverge while the owning property is Busy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumberValue {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: f64,
    pub target: f64,
}

impl NumberValue {
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Binary payload; the data is shared so snapshots stay cheap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobValue {
    pub format: String,
    pub data: Arc<[u8]>,
}

impl BlobValue {
    pub fn new(format: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            format: format.into(),
            data: data.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new("", Vec::new())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemValue {
    Switch(bool),
    Number(NumberValue),
    Text(String),
    Light(PropertyState),
    Blob(BlobValue),
}

impl ItemValue {
    fn kind_label(&self) -> &'static str {
        match self {
            Self::Switch(_) => "switch",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Light(_) => "light",
            Self::Blob(_) => "blob",
        }
    }
}

/// A single named value within a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub label: String,
    pub value: ItemValue,
}

impl Item {
    pub fn switch(name: impl Into<String>, label: impl Into<String>, on: bool) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            value: ItemValue::Switch(on),
        }
    }

    pub fn number(
        name: impl Into<String>,
        label: impl Into<String>,
        min: f64,
        max: f64,
        step: f64,
        value: f64,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            value: ItemValue::Number(NumberValue {
                min,
                max,
                step,
                value,
                target: value,
            }),
        }
    }

    pub fn text(name: impl Into<String>, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            value: ItemValue::Text(value.into()),
        }
    }

    pub fn light(name: impl Into<String>, label: impl Into<String>, state: PropertyState) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            value: ItemValue::Light(state),
        }
    }

    pub fn blob(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            value: ItemValue::Blob(BlobValue::empty()),
        }
    }

    pub fn as_switch(&self) -> Option<bool> {
        match self.value {
            ItemValue::Switch(on) => Some(on),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<&NumberValue> {
        match &self.value {
            ItemValue::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_number_mut(&mut self) -> Option<&mut NumberValue> {
        match &mut self.value {
            ItemValue::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            ItemValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&BlobValue> {
        match &self.value {
            ItemValue::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// Typed, stateful vector of items owned by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub device: String,
    pub name: String,
    pub group: String,
    pub label: String,
    pub state: PropertyState,
    pub perm: Permission,
    pub kind: PropertyKind,
    /// Constructed but not published
    #[serde(default)]
    pub hidden: bool,
    capacity: usize,
    items: Vec<Item>,
}

impl Property {
    fn new(device: &str, name: &str, kind: PropertyKind, capacity: usize) -> Self {
        Self {
            device: device.to_string(),
            name: name.to_string(),
            group: String::new(),
            label: name.to_string(),
            state: PropertyState::Idle,
            perm: Permission::ReadWrite,
            kind,
            hidden: false,
            capacity,
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn switch(device: &str, name: &str, rule: SwitchRule, capacity: usize) -> Self {
        Self::new(device, name, PropertyKind::Switch(rule), capacity)
    }

    pub fn number(device: &str, name: &str, capacity: usize) -> Self {
        Self::new(device, name, PropertyKind::Number, capacity)
    }

    pub fn text(device: &str, name: &str, capacity: usize) -> Self {
        Self::new(device, name, PropertyKind::Text, capacity)
    }

    pub fn light(device: &str, name: &str, capacity: usize) -> Self {
        Self::new(device, name, PropertyKind::Light, capacity)
    }

    pub fn blob(device: &str, name: &str, capacity: usize) -> Self {
        Self::new(device, name, PropertyKind::Blob, capacity)
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn labelled(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_perm(mut self, perm: Permission) -> Self {
        self.perm = perm;
        self
    }

    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = state;
        self
    }

    pub fn with_items(mut self, items: impl IntoIterator<Item = Item>) -> Result<Self, PropertyError> {
        for item in items {
            self.push_item(item)?;
        }
        Ok(self)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut Item> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push_item(&mut self, item: Item) -> Result<(), PropertyError> {
        if self.items.len() >= self.capacity {
            return Err(PropertyError::CapacityExceeded {
                property: self.name.clone(),
                capacity: self.capacity,
            });
        }
        if self.get_item(&item.name).is_some() {
            return Err(PropertyError::DuplicateItem {
                property: self.name.clone(),
                item: item.name,
            });
        }
        self.items.push(item);
        Ok(())
    }

    /// Remove an item by name, keeping the order of the rest
    pub fn remove_item(&mut self, name: &str) -> Option<Item> {
        let index = self.items.iter().position(|i| i.name == name)?;
        Some(self.items.remove(index))
    }

    pub fn get_item(&self, name: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.name == name)
    }

    pub fn get_item_mut(&mut self, name: &str) -> Option<&mut Item> {
        self.items.iter_mut().find(|i| i.name == name)
    }

    pub fn switch_value(&self, name: &str) -> Option<bool> {
        self.get_item(name).and_then(Item::as_switch)
    }

    pub fn number_value(&self, name: &str) -> Option<f64> {
        self.get_item(name).and_then(Item::as_number).map(|n| n.value)
    }

    pub fn number_target(&self, name: &str) -> Option<f64> {
        self.get_item(name).and_then(Item::as_number).map(|n| n.target)
    }

    pub fn text_value(&self, name: &str) -> Option<&str> {
        self.get_item(name).and_then(Item::as_text)
    }

    /// Set the observed value of a numeric item, leaving its target alone
    pub fn set_number(&mut self, name: &str, value: f64) -> bool {
        match self.get_item_mut(name).and_then(Item::as_number_mut) {
            Some(n) => {
                n.value = value;
                true
            }
            None => false,
        }
    }

    pub fn set_text(&mut self, name: &str, value: impl Into<String>) -> bool {
        match self.get_item_mut(name) {
            Some(Item {
                value: ItemValue::Text(s),
                ..
            }) => {
                *s = value.into();
                true
            }
            _ => false,
        }
    }

    pub fn set_blob(&mut self, name: &str, blob: BlobValue) -> bool {
        match self.get_item_mut(name) {
            Some(item) if matches!(item.value, ItemValue::Blob(_)) => {
                item.value = ItemValue::Blob(blob);
                true
            }
            _ => false,
        }
    }

    /// Set one switch item, honoring the selection rule
    ///
    /// Turning an item on in a OneOfMany or AtMostOne vector turns every other
    /// item off. Returns false if the item does not exist.
    pub fn set_switch(&mut self, name: &str, on: bool) -> bool {
        if self.get_item(name).and_then(Item::as_switch).is_none() {
            return false;
        }
        let exclusive = matches!(
            self.kind,
            PropertyKind::Switch(SwitchRule::OneOfMany) | PropertyKind::Switch(SwitchRule::AtMostOne)
        );
        for item in &mut self.items {
            if let ItemValue::Switch(value) = &mut item.value {
                if item.name == name {
                    *value = on;
                } else if on && exclusive {
                    *value = false;
                }
            }
        }
        true
    }

    /// First selected switch item
    pub fn selected_item(&self) -> Option<&Item> {
        self.items.iter().find(|i| i.as_switch() == Some(true))
    }

    /// Whether the switch items satisfy the selection rule
    pub fn rule_satisfied(&self) -> bool {
        let selected = self.selected_count();
        match self.kind {
            PropertyKind::Switch(SwitchRule::OneOfMany) => selected == 1,
            PropertyKind::Switch(SwitchRule::AtMostOne) => selected <= 1,
            _ => true,
        }
    }

    /// Copy item values from an externally supplied property
    ///
    /// Items are matched by name; source items with no counterpart are ignored.
    /// Switch vectors with an exclusive rule are cleared before copying. Numeric
    /// items take the requested value as both `value` and `target`; the caller
    /// is expected to restore `value` to the observed reading when the effect
    /// is asynchronous. With `validate_only` the property is left untouched.
    ///
    /// Returns the number of matched items.
    pub fn copy_values(&mut self, source: &Property, validate_only: bool) -> Result<usize, PropertyError> {
        if !self.kind.same_family(&source.kind) {
            return Err(PropertyError::KindMismatch {
                property: self.name.clone(),
                expected: self.kind.label(),
                found: source.kind.label(),
            });
        }

        let mut matched = 0;
        for requested in &source.items {
            let Some(current) = self.get_item(&requested.name) else {
                continue;
            };
            match (&current.value, &requested.value) {
                (ItemValue::Number(n), ItemValue::Number(r)) => {
                    if !n.in_range(r.value) {
                        return Err(PropertyError::OutOfRange {
                            item: requested.name.clone(),
                            value: r.value,
                            min: n.min,
                            max: n.max,
                        });
                    }
                }
                (a, b) if std::mem::discriminant(a) != std::mem::discriminant(b) => {
                    return Err(PropertyError::KindMismatch {
                        property: self.name.clone(),
                        expected: a.kind_label(),
                        found: b.kind_label(),
                    });
                }
                _ => {}
            }
            matched += 1;
        }

        if validate_only {
            return Ok(matched);
        }

        if matches!(self.kind, PropertyKind::Switch(rule) if rule != SwitchRule::AnyOfMany) {
            for item in &mut self.items {
                if let ItemValue::Switch(on) = &mut item.value {
                    *on = false;
                }
            }
        }

        for requested in &source.items {
            let Some(current) = self.get_item_mut(&requested.name) else {
                continue;
            };
            match (&mut current.value, &requested.value) {
                (ItemValue::Number(n), ItemValue::Number(r)) => {
                    n.value = r.value;
                    n.target = r.value;
                }
                (slot, value) => *slot = value.clone(),
            }
        }
        Ok(matched)
    }

    /// Commit a change request only if the result keeps the selection rule
    ///
    /// The request is applied to a scratch copy with `copy_values`. A OneOfMany
    /// vector must end with exactly one item on and an AtMostOne vector with at
    /// most one. On any error the property is left as it was.
    pub fn apply_change(&mut self, request: &Property) -> Result<usize, PropertyError> {
        self.copy_values(request, true)?;
        let mut scratch = self.clone();
        let matched = scratch.copy_values(request, false)?;
        if !scratch.rule_satisfied() {
            let expected = match self.kind {
                PropertyKind::Switch(SwitchRule::AtMostOne) => "at most one selected item",
                _ => "exactly one selected item",
            };
            return Err(PropertyError::RuleViolated {
                property: self.name.clone(),
                expected,
                selected: scratch.selected_count(),
            });
        }
        *self = scratch;
        Ok(matched)
    }

    fn selected_count(&self) -> usize {
        self.items.iter().filter(|i| i.as_switch() == Some(true)).count()
    }

    /// Build an empty request addressed to this property (same identity and kind)
    pub fn request(&self) -> Property {
        Property::new(&self.device, &self.name, self.kind, self.capacity)
    }
}

/// Match a template against a candidate property
///
/// `None` is a wildcard. An empty device or name in the template matches any
/// value of that field; otherwise both must be equal.
pub fn matches(template: Option<&Property>, candidate: &Property) -> bool {
    match template {
        None => true,
        Some(t) => {
            (t.device.is_empty() || t.device == candidate.device)
                && (t.name.is_empty() || t.name == candidate.name)
        }
    }
}

/// Field-level filter over `(device, name)` used by enumerate requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub device: Option<String>,
    pub name: Option<String>,
}

impl Selector {
    /// Every property of every device
    pub fn all() -> Self {
        Self::default()
    }

    pub fn device(device: &str) -> Self {
        Self {
            device: Some(device.to_string()),
            name: None,
        }
    }

    pub fn property(device: &str, name: &str) -> Self {
        Self {
            device: Some(device.to_string()),
            name: Some(name.to_string()),
        }
    }

    pub fn matches_device(&self, device: &str) -> bool {
        self.device.as_deref().map_or(true, |d| d.is_empty() || d == device)
    }

    pub fn matches(&self, property: &Property) -> bool {
        self.matches_device(&property.device)
            && self
                .name
                .as_deref()
                .map_or(true, |n| n.is_empty() || n == property.name)
    }
}
