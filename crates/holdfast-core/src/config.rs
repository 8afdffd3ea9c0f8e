use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tracing::warn;

use holdfast_types::{is_light, DeviceId};

use crate::error::{HoldfastError, Result};
use crate::reconciler::ReconcileSettings;

fn default_interval_ms() -> u64 {
    1000
}

fn default_tolerance() -> f64 {
    10.0
}

fn default_max_backoff() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnforcerConfig {
    /// Lights whose state is enforced. Fixed for the life of the process.
    #[serde(default)]
    pub lights: Vec<DeviceId>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: u32,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            lights: Vec::new(),
            interval_ms: default_interval_ms(),
            tolerance: default_tolerance(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl EnforcerConfig {
    /// Defaults, then the config file, then `HOLDFAST_*` environment variables,
    /// then CLI overrides. The merged result is validated.
    pub async fn load(path: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self> {
        let file = match path {
            Some(path) => read_config_file(path).await?,
            None => empty_object(),
        };
        Self::from_layers(&file, &env_layer(|key| std::env::var(key).ok()), cli_overrides.as_ref())
    }

    pub fn from_layers(file: &Value, env: &Value, cli: Option<&Value>) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        deep_merge(&mut merged, file);
        deep_merge(&mut merged, env);
        if let Some(cli) = cli {
            deep_merge(&mut merged, cli);
        }
        let config: Self = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(HoldfastError::Config("interval_ms must be greater than 0".into()));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(HoldfastError::Config(format!(
                "tolerance must be a non-negative number, got {}",
                self.tolerance
            )));
        }
        let invalid: Vec<&str> = self
            .lights
            .iter()
            .filter(|id| !is_light(id))
            .map(String::as_str)
            .collect();
        if !invalid.is_empty() {
            return Err(HoldfastError::Config(format!(
                "not light entity ids: {}",
                invalid.join(", ")
            )));
        }
        if self.lights.is_empty() {
            warn!("no lights configured, nothing will be enforced");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            interval: self.interval(),
            tolerance: self.tolerance,
            max_backoff: self.max_backoff,
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// JSON or YAML by extension. A bare list is shorthand for `{ lights: [...] }`.
async fn read_config_file(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).await?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let value: Value = if is_yaml {
        serde_yaml::from_str(&raw)?
    } else {
        serde_json::from_str(&raw)?
    };
    match value {
        Value::Array(lights) => Ok(json!({ "lights": lights })),
        Value::Object(_) => Ok(value),
        Value::Null => Ok(empty_object()),
        other => Err(HoldfastError::Config(format!(
            "{} must contain a mapping or a list of lights, found {}",
            path.display(),
            other
        ))),
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(lights) = lookup("HOLDFAST_LIGHTS") {
        deep_merge(&mut root, &json!({ "lights": parse_csv(&lights) }));
    }
    if let Some(raw) = lookup("HOLDFAST_INTERVAL_MS") {
        match raw.trim().parse::<u64>() {
            Ok(v) => deep_merge(&mut root, &json!({ "interval_ms": v })),
            Err(_) => warn!("ignoring HOLDFAST_INTERVAL_MS={raw:?}: not an integer"),
        }
    }
    if let Some(raw) = lookup("HOLDFAST_TOLERANCE") {
        match raw.trim().parse::<f64>() {
            Ok(v) => deep_merge(&mut root, &json!({ "tolerance": v })),
            Err(_) => warn!("ignoring HOLDFAST_TOLERANCE={raw:?}: not a number"),
        }
    }
    if let Some(raw) = lookup("HOLDFAST_MAX_BACKOFF") {
        match raw.trim().parse::<u32>() {
            Ok(v) => deep_merge(&mut root, &json!({ "max_backoff": v })),
            Err(_) => warn!("ignoring HOLDFAST_MAX_BACKOFF={raw:?}: not an integer"),
        }
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
