//! Periodic drift correction.
//!
//! Each tick compares every device with a desired state against what the
//! registry reports and re-issues the desired command where they disagree.
//! Corrections pass through the per-device readiness gate so that a device
//! another automation keeps changing is corrected less and less often, and
//! all corrections of one tick share one context id.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use holdfast_observability::{emit_event, ObservabilityEvent};
use holdfast_types::{
    AttrKey, AttributeMap, CommandKind, ContextId, DeviceCommand, DeviceId, LiveState, PowerState,
};

use crate::context::ContextTagger;
use crate::ports::{CommandService, DeviceRegistry};
use crate::store::{DesiredPower, DesiredStateStore, ManagedDevice};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileSettings {
    pub interval: Duration,
    /// Largest tolerated `|live - desired|`, in attribute units.
    pub tolerance: f64,
    pub max_backoff: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            tolerance: 10.0,
            max_backoff: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Another tick was still running; nothing was evaluated.
    pub skipped: bool,
    pub evaluated: usize,
    pub unavailable: Vec<DeviceId>,
    pub issued: Vec<DeviceCommand>,
    pub failed: Vec<DeviceId>,
    pub context_id: Option<ContextId>,
}

/// Attributes both desired and reported whose difference exceeds `tolerance`.
pub fn drifted_attributes(
    desired: &AttributeMap,
    live: &AttributeMap,
    tolerance: f64,
) -> Vec<AttrKey> {
    desired
        .iter()
        .filter_map(|(key, want)| {
            let have = live.get(key)?;
            ((have - want).abs() > tolerance).then_some(*key)
        })
        .collect()
}

/// Decides whether `device` needs a command now, consuming a gate opening if so.
fn plan_correction(
    device: &mut ManagedDevice,
    live: &LiveState,
    now: Instant,
    settings: &ReconcileSettings,
) -> Option<(CommandKind, AttributeMap)> {
    let target = device.desired_power.target()?;

    if live.power == target {
        if target == PowerState::Off {
            return None;
        }
        let drifted =
            drifted_attributes(&device.desired_attributes, &live.attributes, settings.tolerance);
        if drifted.is_empty() {
            return None;
        }
        debug!("attributes {:?} drifted beyond {}", drifted, settings.tolerance);
    }

    if !device.try_open_gate(now, settings.interval, settings.max_backoff) {
        return None;
    }

    match device.desired_power {
        DesiredPower::Off => Some((CommandKind::TurnOff, AttributeMap::new())),
        _ => Some((CommandKind::TurnOn, device.desired_attributes.clone())),
    }
}

pub struct Reconciler {
    store: DesiredStateStore,
    tagger: Arc<ContextTagger>,
    registry: Arc<dyn DeviceRegistry>,
    commands: Arc<dyn CommandService>,
    settings: ReconcileSettings,
    tick_guard: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: DesiredStateStore,
        tagger: Arc<ContextTagger>,
        registry: Arc<dyn DeviceRegistry>,
        commands: Arc<dyn CommandService>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            tagger,
            registry,
            commands,
            settings,
            tick_guard: Mutex::new(()),
        }
    }

    /// One reconciliation pass. Never overlaps another pass: a call made while
    /// one is in flight returns a skipped report. Gate state is updated before
    /// any command is dispatched; the pass returns once every dispatch settled.
    pub async fn tick(&self, now: Instant) -> TickReport {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!("previous reconcile tick still running, skipping");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        };

        let candidates: Vec<DeviceId> = {
            let devices = self.store.lock().await;
            let mut ids: Vec<DeviceId> = devices
                .iter()
                .filter(|(_, device)| device.desired_power != DesiredPower::Unset)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        };

        let mut report = TickReport {
            evaluated: candidates.len(),
            ..TickReport::default()
        };
        if candidates.is_empty() {
            return report;
        }

        let live_states = join_all(candidates.into_iter().map(|id| async move {
            let state = self.registry.live_state(&id).await;
            (id, state)
        }))
        .await;

        let mut context: Option<ContextId> = None;
        {
            let mut devices = self.store.lock().await;
            for (id, state) in live_states {
                let Some(state) = state else {
                    debug!("no state reported for '{}', skipping this tick", id);
                    report.unavailable.push(id);
                    continue;
                };
                let Some(device) = devices.get_mut(&id) else {
                    continue;
                };
                let Some((kind, attributes)) = plan_correction(device, &state, now, &self.settings)
                else {
                    continue;
                };
                let context_id = context
                    .get_or_insert_with(|| self.tagger.generate())
                    .clone();
                report.issued.push(DeviceCommand {
                    device_ids: vec![id],
                    kind,
                    attributes,
                    context_id,
                });
            }
        }
        report.context_id = context;

        let results = join_all(report.issued.iter().map(|command| async move {
            info!(
                context_id = %command.context_id,
                "correcting {:?} with light.{} {:?}",
                command.device_ids,
                command.kind.service_name(),
                command.attributes
            );
            self.commands.issue(command.clone()).await
        }))
        .await;

        for (command, result) in report.issued.iter().zip(results) {
            if let Err(err) = result {
                let detail = err.to_string();
                warn!("correction for {:?} failed: {}", command.device_ids, detail);
                for id in &command.device_ids {
                    emit_event(
                        tracing::Level::WARN,
                        ObservabilityEvent {
                            event: "correction.failed",
                            component: "reconciler",
                            device_id: Some(id.as_str()),
                            context_id: Some(command.context_id.as_str()),
                            status: Some("failed"),
                            error_code: Some("DISPATCH_FAILED"),
                            detail: Some(detail.as_str()),
                        },
                    );
                    report.failed.push(id.clone());
                }
            }
        }

        report
    }
}
