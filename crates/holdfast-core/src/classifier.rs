//! Turns service calls seen on the bus into desired-state updates.
//!
//! A call updates the store only when it targets at least one managed light
//! and did not originate from this process. Calls carrying a context id from
//! the [`ContextTagger`] are our own corrections echoing back and must never
//! be read as new intent, or every correction would reset its own backoff.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use holdfast_types::{is_light, CommandKind, DeviceId, Selector, ServiceCall, LIGHT_DOMAIN};

use crate::context::ContextTagger;
use crate::ports::DeviceRegistry;
use crate::store::DesiredStateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Not a call in the light domain.
    OtherDomain,
    /// A light service that is neither `turn_on` nor `turn_off`.
    OtherService,
    /// No usable `entity_id` or `area_id`.
    MissingTarget,
    /// Resolved targets contain no managed device.
    Unmanaged,
    /// Issued by this process.
    SelfOrigin,
    Applied {
        kind: CommandKind,
        devices: Vec<DeviceId>,
    },
}

pub struct EventClassifier {
    store: DesiredStateStore,
    tagger: Arc<ContextTagger>,
    registry: Arc<dyn DeviceRegistry>,
}

impl EventClassifier {
    pub fn new(
        store: DesiredStateStore,
        tagger: Arc<ContextTagger>,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Self {
        Self {
            store,
            tagger,
            registry,
        }
    }

    /// Never fails: malformed or irrelevant calls are dropped with a diagnostic.
    pub async fn handle(&self, call: &ServiceCall) -> Classification {
        if call.domain != LIGHT_DOMAIN {
            return Classification::OtherDomain;
        }
        let Some(kind) = call.command_kind() else {
            return Classification::OtherService;
        };
        let Some(selector) = call.service_data.selector() else {
            debug!(
                context_id = %call.context_id,
                "no entity_id or area_id in service_data: {:?}",
                call.service_data
            );
            return Classification::MissingTarget;
        };

        let targets = self.resolve(selector).await;
        let mut seen = HashSet::new();
        let managed: Vec<DeviceId> = targets
            .into_iter()
            .filter(|id| self.store.is_managed(id) && seen.insert(id.clone()))
            .collect();
        if managed.is_empty() {
            return Classification::Unmanaged;
        }

        if self.tagger.is_self_origin(&call.context_id) {
            debug!(
                context_id = %call.context_id,
                "ignoring own light.{}({:?})",
                kind.service_name(),
                managed
            );
            return Classification::SelfOrigin;
        }

        debug!(
            context_id = %call.context_id,
            "detected light.{}({:?})",
            kind.service_name(),
            managed
        );
        let attributes = call.service_data.attributes();
        let mut devices = self.store.lock().await;
        for id in &managed {
            let Some(device) = devices.get_mut(id) else {
                continue;
            };
            match kind {
                CommandKind::TurnOff => device.record_turn_off(),
                CommandKind::TurnOn => device.record_turn_on(&attributes),
            }
        }

        Classification::Applied {
            kind,
            devices: managed,
        }
    }

    async fn resolve(&self, selector: Selector) -> Vec<DeviceId> {
        match selector {
            Selector::Devices(ids) => ids,
            Selector::Areas(areas) => {
                let mut ids = Vec::new();
                for area_id in areas {
                    match self.registry.area_devices(&area_id).await {
                        Ok(members) => {
                            let lights: Vec<DeviceId> =
                                members.into_iter().filter(|id| is_light(id)).collect();
                            debug!("found entity_ids {:?} for area_id '{}'", lights, area_id);
                            ids.extend(lights);
                        }
                        Err(err) => {
                            warn!("could not expand area_id '{}': {}", area_id, err);
                        }
                    }
                }
                ids
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackHome;
    use crate::store::DesiredPower;
    use holdfast_types::{AttrKey, AttributeMap, ServiceData};

    type Setup = (
        EventClassifier,
        DesiredStateStore,
        Arc<ContextTagger>,
        Arc<LoopbackHome>,
    );

    fn setup(lights: &[&str]) -> Setup {
        let store = DesiredStateStore::new(lights.iter().map(|s| s.to_string()));
        let tagger = Arc::new(ContextTagger::new());
        let home = Arc::new(LoopbackHome::default());
        let classifier = EventClassifier::new(store.clone(), tagger.clone(), home.clone());
        (classifier, store, tagger, home)
    }

    fn turn_on(ids: &[&str], attrs: &[(AttrKey, f64)], context_id: &str) -> ServiceCall {
        let data = attrs.iter().fold(
            ServiceData::for_devices(ids.iter().map(|s| s.to_string()).collect()),
            |data, (key, value)| data.with_attribute(*key, *value),
        );
        ServiceCall::light(CommandKind::TurnOn, data, context_id)
    }

    #[tokio::test]
    async fn external_turn_on_records_desired_state() {
        let (classifier, store, _, _) = setup(&["light.a", "light.b"]);
        let outcome = classifier
            .handle(&turn_on(&["light.a", "light.x"], &[(AttrKey::Brightness, 200.0)], "user-1"))
            .await;
        assert_eq!(
            outcome,
            Classification::Applied {
                kind: CommandKind::TurnOn,
                devices: vec!["light.a".to_string()]
            }
        );
        let a = store.get("light.a").await.unwrap();
        assert_eq!(a.desired_power, DesiredPower::On);
        assert_eq!(a.desired_attributes.get(&AttrKey::Brightness), Some(&200.0));
        assert_eq!(
            store.get("light.b").await.unwrap().desired_power,
            DesiredPower::Unset
        );
    }

    #[tokio::test]
    async fn replaying_turn_on_is_idempotent_and_resets_backoff() {
        let (classifier, store, _, _) = setup(&["light.a"]);
        let call = turn_on(
            &["light.a"],
            &[(AttrKey::Brightness, 200.0), (AttrKey::ColorTemp, 300.0)],
            "user-1",
        );

        classifier.handle(&call).await;
        let first = store.get("light.a").await.unwrap();
        store.lock().await.get_mut("light.a").unwrap().backoff_level = 3;
        classifier.handle(&call).await;
        let second = store.get("light.a").await.unwrap();

        assert_eq!(first.desired_attributes, second.desired_attributes);
        assert_eq!(first.backoff_level, 0);
        assert_eq!(second.backoff_level, 0);
    }

    #[tokio::test]
    async fn brightness_only_keeps_color_temp() {
        let (classifier, store, _, _) = setup(&["light.a"]);
        classifier
            .handle(&turn_on(&["light.a"], &[(AttrKey::ColorTemp, 370.0)], "user-1"))
            .await;
        classifier
            .handle(&turn_on(&["light.a"], &[(AttrKey::Brightness, 80.0)], "user-2"))
            .await;
        let expected: AttributeMap = [(AttrKey::Brightness, 80.0), (AttrKey::ColorTemp, 370.0)]
            .into_iter()
            .collect();
        assert_eq!(store.get("light.a").await.unwrap().desired_attributes, expected);
    }

    #[tokio::test]
    async fn self_origin_calls_change_nothing() {
        let (classifier, store, tagger, _) = setup(&["light.a"]);
        classifier
            .handle(&turn_on(&["light.a"], &[(AttrKey::Brightness, 200.0)], "user-1"))
            .await;
        store.lock().await.get_mut("light.a").unwrap().backoff_level = 2;
        let before = store.get("light.a").await.unwrap();

        let own = tagger.generate();
        let outcome = classifier
            .handle(&turn_on(&["light.a"], &[(AttrKey::Brightness, 10.0)], own.as_str()))
            .await;
        let off = ServiceCall::light(
            CommandKind::TurnOff,
            ServiceData::for_devices(vec!["light.a".to_string()]),
            own.as_str(),
        );

        assert_eq!(outcome, Classification::SelfOrigin);
        assert_eq!(classifier.handle(&off).await, Classification::SelfOrigin);
        assert_eq!(store.get("light.a").await.unwrap(), before);
    }

    #[tokio::test]
    async fn area_selector_expands_to_lights_only() {
        let (classifier, store, _, home) = setup(&["light.a", "light.b"]);
        home.assign_area(
            "kitchen",
            vec!["light.a".to_string(), "switch.kettle".to_string(), "light.z".to_string()],
        )
        .await;
        let call = ServiceCall::light(
            CommandKind::TurnOff,
            ServiceData::for_areas(vec!["kitchen".to_string()]),
            "user-1",
        );
        assert_eq!(
            classifier.handle(&call).await,
            Classification::Applied {
                kind: CommandKind::TurnOff,
                devices: vec!["light.a".to_string()]
            }
        );
        assert_eq!(store.get("light.a").await.unwrap().desired_power, DesiredPower::Off);
        assert_eq!(store.get("light.b").await.unwrap().desired_power, DesiredPower::Unset);
    }

    #[tokio::test]
    async fn empty_area_is_unmanaged_not_an_error() {
        let (classifier, _, _, _) = setup(&["light.a"]);
        let call = ServiceCall::light(
            CommandKind::TurnOn,
            ServiceData::for_areas(vec!["attic".to_string()]),
            "user-1",
        );
        assert_eq!(classifier.handle(&call).await, Classification::Unmanaged);
    }

    #[tokio::test]
    async fn empty_entity_id_is_not_widened_to_its_area() {
        let (classifier, store, _, home) = setup(&["light.a"]);
        home.assign_area("kitchen", vec!["light.a".to_string()]).await;
        let data: ServiceData =
            serde_json::from_value(serde_json::json!({"entity_id": "", "area_id": "kitchen"}))
                .unwrap();
        let call = ServiceCall::light(CommandKind::TurnOff, data, "user-1");

        assert_eq!(classifier.handle(&call).await, Classification::Unmanaged);
        assert_eq!(store.get("light.a").await.unwrap().desired_power, DesiredPower::Unset);
    }

    #[tokio::test]
    async fn failed_area_expansion_is_treated_as_empty() {
        struct BrokenRegistry;

        #[async_trait::async_trait]
        impl DeviceRegistry for BrokenRegistry {
            async fn area_devices(&self, area_id: &str) -> crate::error::Result<Vec<DeviceId>> {
                Err(crate::error::HoldfastError::Registry(format!(
                    "area '{area_id}' lookup timed out"
                )))
            }

            async fn live_state(&self, _device_id: &str) -> Option<holdfast_types::LiveState> {
                None
            }
        }

        let store = DesiredStateStore::new(vec!["light.a".to_string()]);
        let classifier = EventClassifier::new(
            store.clone(),
            Arc::new(ContextTagger::new()),
            Arc::new(BrokenRegistry),
        );
        let call = ServiceCall::light(
            CommandKind::TurnOn,
            ServiceData::for_areas(vec!["kitchen".to_string()]),
            "user-1",
        );
        assert_eq!(classifier.handle(&call).await, Classification::Unmanaged);
        assert_eq!(store.get("light.a").await.unwrap().desired_power, DesiredPower::Unset);
    }

    #[tokio::test]
    async fn irrelevant_and_malformed_calls_are_dropped() {
        let (classifier, store, _, _) = setup(&["light.a"]);
        let mut other_domain = turn_on(&["light.a"], &[], "user-1");
        other_domain.domain = "switch".to_string();
        let mut toggle = turn_on(&["light.a"], &[], "user-1");
        toggle.service = "toggle".to_string();
        let no_target = ServiceCall::light(CommandKind::TurnOn, ServiceData::default(), "user-1");

        assert_eq!(classifier.handle(&other_domain).await, Classification::OtherDomain);
        assert_eq!(classifier.handle(&toggle).await, Classification::OtherService);
        assert_eq!(classifier.handle(&no_target).await, Classification::MissingTarget);
        assert_eq!(
            store.get("light.a").await.unwrap().desired_power,
            DesiredPower::Unset
        );
    }

    #[tokio::test]
    async fn empty_managed_set_is_a_no_op() {
        let (classifier, store, _, _) = setup(&[]);
        assert!(store.is_empty());
        assert_eq!(
            classifier.handle(&turn_on(&["light.a"], &[], "user-1")).await,
            Classification::Unmanaged
        );
    }
}
