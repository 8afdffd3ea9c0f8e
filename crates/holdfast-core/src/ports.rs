//! Collaborators the core talks to but does not own: the device registry that
//! reports live state and area membership, and the service that executes
//! commands.

use async_trait::async_trait;

use holdfast_types::{DeviceCommand, DeviceId, LiveState};

use crate::error::Result;

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Entity ids assigned to an area, in any domain. May be empty.
    async fn area_devices(&self, area_id: &str) -> Result<Vec<DeviceId>>;

    /// `None` when the device currently reports no state.
    async fn live_state(&self, device_id: &str) -> Option<LiveState>;
}

#[async_trait]
pub trait CommandService: Send + Sync {
    async fn issue(&self, command: DeviceCommand) -> Result<()>;
}
