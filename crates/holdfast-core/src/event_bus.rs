use tokio::sync::broadcast;

use holdfast_types::ServiceCall;

/// Fan-out of service calls. Every subscriber sees every call published after
/// it subscribed, in publish order.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceCall>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(2048)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceCall> {
        self.tx.subscribe()
    }

    pub fn publish(&self, call: ServiceCall) {
        let _ = self.tx.send(call);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
