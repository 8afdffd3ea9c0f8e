use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attributes::{AttrKey, AttributeMap};
use crate::device::DeviceId;

pub const LIGHT_DOMAIN: &str = "light";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    TurnOn,
    TurnOff,
}

impl CommandKind {
    pub fn service_name(self) -> &'static str {
        match self {
            CommandKind::TurnOn => "turn_on",
            CommandKind::TurnOff => "turn_off",
        }
    }

    /// `None` for services that are not power commands (`toggle`, `reload`, ...).
    pub fn from_service(service: &str) -> Option<Self> {
        match service {
            "turn_on" => Some(CommandKind::TurnOn),
            "turn_off" => Some(CommandKind::TurnOff),
            _ => None,
        }
    }
}

/// Identifier attached to a command so its echo on the bus can be traced back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A list of ids given either as a JSON list or as a comma separated string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdList {
    Csv(String),
    Many(Vec<String>),
}

impl IdList {
    pub fn to_vec(&self) -> Vec<String> {
        let parts: Vec<&str> = match self {
            IdList::Csv(raw) => raw.split(',').collect(),
            IdList::Many(items) => items.iter().map(String::as_str).collect(),
        };
        parts
            .into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

/// Target of a service call after parsing `entity_id` / `area_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Devices(Vec<DeviceId>),
    Areas(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<IdList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<IdList>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServiceData {
    pub fn for_devices(device_ids: Vec<DeviceId>) -> Self {
        Self {
            entity_id: Some(IdList::Many(device_ids)),
            ..Self::default()
        }
    }

    pub fn for_areas(area_ids: Vec<String>) -> Self {
        Self {
            area_id: Some(IdList::Many(area_ids)),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: AttrKey, value: f64) -> Self {
        self.extra.insert(key.as_str().to_string(), Value::from(value));
        self
    }

    /// A present `entity_id` is used as is, even when it lists nothing; areas
    /// are only consulted without one. `None` when neither key gives a target.
    pub fn selector(&self) -> Option<Selector> {
        if let Some(ids) = self.entity_id.as_ref() {
            return Some(Selector::Devices(ids.to_vec()));
        }
        if let Some(areas) = self.area_id.as_ref().map(IdList::to_vec) {
            if !areas.is_empty() {
                return Some(Selector::Areas(areas));
            }
        }
        None
    }

    /// Recognized numeric attributes carried by the call; anything else is ignored.
    pub fn attributes(&self) -> AttributeMap {
        AttrKey::ALL
            .into_iter()
            .filter_map(|key| {
                self.extra
                    .get(key.as_str())
                    .and_then(Value::as_f64)
                    .map(|value| (key, value))
            })
            .collect()
    }
}

/// A service call observed on the event bus: the command-intent event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    #[serde(default)]
    pub service_data: ServiceData,
    #[serde(default)]
    pub context_id: String,
}

impl ServiceCall {
    pub fn light(
        kind: CommandKind,
        service_data: ServiceData,
        context_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: LIGHT_DOMAIN.to_string(),
            service: kind.service_name().to_string(),
            service_data,
            context_id: context_id.into(),
        }
    }

    /// The bus echo of a command issued through the command service.
    pub fn from_command(command: &DeviceCommand) -> Self {
        let data = command
            .attributes
            .iter()
            .fold(ServiceData::for_devices(command.device_ids.clone()), |data, (key, value)| {
                data.with_attribute(*key, *value)
            });
        Self::light(command.kind, data, command.context_id.as_str())
    }

    pub fn command_kind(&self) -> Option<CommandKind> {
        CommandKind::from_service(&self.service)
    }
}

/// A command handed to the command service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub device_ids: Vec<DeviceId>,
    pub kind: CommandKind,
    #[serde(default)]
    pub attributes: AttributeMap,
    pub context_id: ContextId,
}
