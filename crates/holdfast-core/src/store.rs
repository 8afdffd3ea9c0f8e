use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use holdfast_types::{AttributeMap, DeviceId, PowerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredPower {
    /// No external command seen yet; the device is left alone.
    #[default]
    Unset,
    On,
    Off,
}

impl DesiredPower {
    pub fn target(self) -> Option<PowerState> {
        match self {
            DesiredPower::Unset => None,
            DesiredPower::On => Some(PowerState::On),
            DesiredPower::Off => Some(PowerState::Off),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagedDevice {
    pub desired_power: DesiredPower,
    pub desired_attributes: AttributeMap,
    pub backoff_level: u32,
    pub last_correction_at: Option<Instant>,
}

impl ManagedDevice {
    pub fn record_turn_off(&mut self) {
        self.desired_power = DesiredPower::Off;
        self.desired_attributes.clear();
        self.backoff_level = 0;
    }

    /// Keys missing from `attributes` keep their previously desired value.
    pub fn record_turn_on(&mut self, attributes: &AttributeMap) {
        self.desired_power = DesiredPower::On;
        self.backoff_level = 0;
        for (key, value) in attributes {
            self.desired_attributes.insert(*key, *value);
        }
    }

    /// Readiness gate. Open once at least `backoff_level * interval` has passed
    /// since the gate last opened; opening stamps `now` and raises the backoff
    /// level by one, capped at `max_backoff`. A closed gate changes nothing.
    pub fn try_open_gate(&mut self, now: Instant, interval: Duration, max_backoff: u32) -> bool {
        let min_delay = interval.saturating_mul(self.backoff_level);
        let elapsed = match self.last_correction_at {
            Some(last) => now.saturating_duration_since(last),
            None => Duration::MAX,
        };
        if elapsed < min_delay {
            return false;
        }
        self.last_correction_at = Some(now);
        self.backoff_level = self.backoff_level.saturating_add(1).min(max_backoff);
        true
    }
}

/// Desired state for the configured devices. The key set is fixed at
/// construction; all record mutation goes through one coarse lock.
#[derive(Clone, Default)]
pub struct DesiredStateStore {
    managed: Arc<BTreeSet<DeviceId>>,
    devices: Arc<Mutex<HashMap<DeviceId, ManagedDevice>>>,
}

impl DesiredStateStore {
    pub fn new(device_ids: impl IntoIterator<Item = DeviceId>) -> Self {
        let managed: BTreeSet<DeviceId> = device_ids.into_iter().collect();
        let devices = managed
            .iter()
            .map(|id| (id.clone(), ManagedDevice::default()))
            .collect();
        Self {
            managed: Arc::new(managed),
            devices: Arc::new(Mutex::new(devices)),
        }
    }

    pub fn is_managed(&self, device_id: &str) -> bool {
        self.managed.contains(device_id)
    }

    pub fn managed_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.managed.iter()
    }

    pub fn len(&self) -> usize {
        self.managed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managed.is_empty()
    }

    pub async fn get(&self, device_id: &str) -> Option<ManagedDevice> {
        self.devices.lock().await.get(device_id).cloned()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, ManagedDevice>> {
        self.devices.lock().await
    }
}
