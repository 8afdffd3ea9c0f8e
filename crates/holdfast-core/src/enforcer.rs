use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use holdfast_observability::{emit_event, ObservabilityEvent};

use crate::classifier::EventClassifier;
use crate::config::EnforcerConfig;
use crate::context::ContextTagger;
use crate::event_bus::EventBus;
use crate::ports::{CommandService, DeviceRegistry};
use crate::reconciler::Reconciler;
use crate::store::DesiredStateStore;

/// Wires the classifier to the bus and the reconciler to a fixed-period timer.
pub struct Enforcer {
    store: DesiredStateStore,
    classifier: EventClassifier,
    reconciler: Reconciler,
    interval: Duration,
}

impl Enforcer {
    pub fn new(
        config: &EnforcerConfig,
        registry: Arc<dyn DeviceRegistry>,
        commands: Arc<dyn CommandService>,
    ) -> Self {
        let store = DesiredStateStore::new(config.lights.iter().cloned());
        let tagger = Arc::new(ContextTagger::new());
        let classifier = EventClassifier::new(store.clone(), tagger.clone(), registry.clone());
        let reconciler =
            Reconciler::new(store.clone(), tagger, registry, commands, config.settings());
        Self {
            store,
            classifier,
            reconciler,
            interval: config.interval(),
        }
    }

    pub fn store(&self) -> &DesiredStateStore {
        &self.store
    }

    pub fn classifier(&self) -> &EventClassifier {
        &self.classifier
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Spawns the bus listener and the tick loop. Both stop when `cancel` fires;
    /// the subscription is taken before returning so no later call is missed.
    pub fn start(self: Arc<Self>, bus: &EventBus, cancel: CancellationToken) -> JoinSet<()> {
        let mut set = JoinSet::new();
        let mut rx = bus.subscribe();

        let listener = self.clone();
        let listener_cancel = cancel.clone();
        set.spawn(async move {
            loop {
                tokio::select! {
                    _ = listener_cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(call) => {
                            let outcome = listener.classifier.handle(&call).await;
                            debug!(
                                context_id = %call.context_id,
                                "service call classified: {:?}",
                                outcome
                            );
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("event listener lagged, {} service calls dropped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("event listener stopped");
        });

        let ticker_owner = self.clone();
        set.spawn(async move {
            let mut ticker = tokio::time::interval(ticker_owner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = ticker_owner.reconciler.tick(Instant::now()).await;
                        if !report.issued.is_empty() {
                            debug!(
                                "tick issued {} corrections ({} failed)",
                                report.issued.len(),
                                report.failed.len()
                            );
                        }
                    }
                }
            }
            debug!("reconcile loop stopped");
        });

        info!(
            "enforcing {} lights every {:?}",
            self.store.len(),
            self.interval
        );
        emit_event(
            tracing::Level::INFO,
            ObservabilityEvent {
                event: "enforcer.started",
                component: "enforcer",
                status: Some("ok"),
                ..ObservabilityEvent::default()
            },
        );
        set
    }
}
