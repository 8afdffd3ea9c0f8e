use serde::{Deserialize, Serialize};

use crate::attributes::AttributeMap;

/// Entity id in `<domain>.<object_id>` form, e.g. `light.kitchen`.
pub type DeviceId = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceDomain {
    Light,
    Other(String),
}

impl DeviceDomain {
    pub fn as_str(&self) -> &str {
        match self {
            DeviceDomain::Light => "light",
            DeviceDomain::Other(name) => name.as_str(),
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "light" => DeviceDomain::Light,
            other => DeviceDomain::Other(other.to_string()),
        }
    }

    /// Domain of an entity id: the exact text before the first `.`.
    /// Ids without a `.` have no domain and return `None`.
    pub fn of(device_id: &str) -> Option<Self> {
        let (domain, object_id) = device_id.split_once('.')?;
        if domain.is_empty() || object_id.is_empty() {
            return None;
        }
        Some(Self::parse(domain))
    }
}

pub fn is_light(device_id: &str) -> bool {
    matches!(DeviceDomain::of(device_id), Some(DeviceDomain::Light))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
        }
    }
}

/// State reported by the device registry for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiveState {
    pub power: PowerState,
    #[serde(default)]
    pub attributes: AttributeMap,
}

impl LiveState {
    pub fn off() -> Self {
        Self {
            power: PowerState::Off,
            attributes: AttributeMap::new(),
        }
    }

    pub fn on(attributes: AttributeMap) -> Self {
        Self {
            power: PowerState::On,
            attributes,
        }
    }
}
