//! In-process stand-in for the device registry and command service.
//!
//! Commands change the held live state and are echoed on the bus as service
//! calls with the command's context id, the same way a real home bus reports
//! every executed call back to its listeners.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use holdfast_types::{
    AttributeMap, CommandKind, DeviceCommand, DeviceId, LiveState, PowerState, Selector,
    ServiceCall, ServiceData,
};

use crate::error::{HoldfastError, Result};
use crate::event_bus::EventBus;
use crate::ports::{CommandService, DeviceRegistry};

#[derive(Default)]
pub struct LoopbackHome {
    bus: EventBus,
    states: RwLock<HashMap<DeviceId, LiveState>>,
    areas: RwLock<HashMap<String, Vec<DeviceId>>>,
    frozen: RwLock<HashSet<DeviceId>>,
    failing: RwLock<HashSet<DeviceId>>,
    issued: RwLock<Vec<DeviceCommand>>,
}

impl LoopbackHome {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            ..Self::default()
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn set_live(&self, device_id: &str, state: LiveState) {
        self.states
            .write()
            .await
            .insert(device_id.to_string(), state);
    }

    /// The device stops reporting state until `set_live` is called again.
    pub async fn make_unavailable(&self, device_id: &str) {
        self.states.write().await.remove(device_id);
    }

    pub async fn assign_area(&self, area_id: &str, device_ids: Vec<DeviceId>) {
        self.areas
            .write()
            .await
            .insert(area_id.to_string(), device_ids);
    }

    /// Commands for the device still succeed and echo, but its state no longer
    /// follows them, like a light held by a competing automation.
    pub async fn freeze(&self, device_id: &str) {
        self.frozen.write().await.insert(device_id.to_string());
    }

    pub async fn fail_commands_for(&self, device_id: &str) {
        self.failing.write().await.insert(device_id.to_string());
    }

    pub async fn issued(&self) -> Vec<DeviceCommand> {
        self.issued.read().await.clone()
    }

    /// A call from some other actor: applies it and publishes it with a fresh
    /// context id.
    pub async fn publish_external(
        &self,
        kind: CommandKind,
        service_data: ServiceData,
    ) -> ServiceCall {
        let call = ServiceCall::light(kind, service_data, Uuid::new_v4().to_string());
        self.apply_external(&call).await;
        self.bus.publish(call.clone());
        call
    }

    /// Applies an external call's effect on live state without publishing it.
    pub async fn apply_external(&self, call: &ServiceCall) {
        let Some(kind) = call.command_kind() else {
            return;
        };
        let targets: Vec<DeviceId> = match call.service_data.selector() {
            Some(Selector::Devices(ids)) => ids,
            Some(Selector::Areas(area_ids)) => {
                let areas = self.areas.read().await;
                area_ids
                    .iter()
                    .filter_map(|area| areas.get(area))
                    .flatten()
                    .cloned()
                    .collect()
            }
            None => return,
        };
        let attributes = call.service_data.attributes();
        let mut states = self.states.write().await;
        for id in targets {
            apply(&mut states, id, kind, &attributes);
        }
    }
}

fn apply(
    states: &mut HashMap<DeviceId, LiveState>,
    device_id: DeviceId,
    kind: CommandKind,
    attributes: &AttributeMap,
) {
    match kind {
        CommandKind::TurnOff => {
            states.insert(device_id, LiveState::off());
        }
        CommandKind::TurnOn => {
            let state = states.entry(device_id).or_insert_with(LiveState::off);
            state.power = PowerState::On;
            for (key, value) in attributes {
                state.attributes.insert(*key, *value);
            }
        }
    }
}

#[async_trait]
impl DeviceRegistry for LoopbackHome {
    async fn area_devices(&self, area_id: &str) -> Result<Vec<DeviceId>> {
        Ok(self
            .areas
            .read()
            .await
            .get(area_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn live_state(&self, device_id: &str) -> Option<LiveState> {
        self.states.read().await.get(device_id).cloned()
    }
}

#[async_trait]
impl CommandService for LoopbackHome {
    async fn issue(&self, command: DeviceCommand) -> Result<()> {
        {
            let failing = self.failing.read().await;
            if let Some(id) = command.device_ids.iter().find(|id| failing.contains(*id)) {
                return Err(HoldfastError::Dispatch(format!(
                    "light.{} rejected by '{}'",
                    command.kind.service_name(),
                    id
                )));
            }
        }
        {
            let frozen = self.frozen.read().await;
            let mut states = self.states.write().await;
            for id in command.device_ids.iter().filter(|id| !frozen.contains(*id)) {
                apply(&mut states, id.clone(), command.kind, &command.attributes);
            }
        }
        self.issued.write().await.push(command.clone());
        self.bus.publish(ServiceCall::from_command(&command));
        Ok(())
    }
}
