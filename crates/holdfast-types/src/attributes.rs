use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttrKey {
    Brightness,
    ColorTemp,
}

impl AttrKey {
    pub const ALL: [AttrKey; 2] = [AttrKey::Brightness, AttrKey::ColorTemp];

    pub fn as_str(self) -> &'static str {
        match self {
            AttrKey::Brightness => "brightness",
            AttrKey::ColorTemp => "color_temp",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == name)
    }
}

impl fmt::Display for AttrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric attribute values keyed by attribute. Ordered so payloads and logs are stable.
pub type AttributeMap = BTreeMap<AttrKey, f64>;
