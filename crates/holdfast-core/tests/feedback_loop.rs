use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use holdfast_core::{
    Classification, DesiredPower, DeviceRegistry, Enforcer, EnforcerConfig, EventBus, LoopbackHome,
    CONTEXT_PREFIX,
};
use holdfast_types::{AttrKey, CommandKind, LiveState, PowerState, ServiceData};

const DELTA: Duration = Duration::from_millis(1000);

fn config(lights: &[&str]) -> EnforcerConfig {
    EnforcerConfig {
        lights: lights.iter().map(|s| s.to_string()).collect(),
        interval_ms: 1000,
        tolerance: 10.0,
        max_backoff: 5,
    }
}

fn setup(lights: &[&str]) -> (Arc<Enforcer>, Arc<LoopbackHome>, EventBus) {
    let bus = EventBus::new();
    let home = Arc::new(LoopbackHome::new(bus.clone()));
    let enforcer = Arc::new(Enforcer::new(&config(lights), home.clone(), home.clone()));
    (enforcer, home, bus)
}

fn brightness(value: f64) -> ServiceData {
    ServiceData::for_devices(vec!["light.a".to_string()]).with_attribute(AttrKey::Brightness, value)
}

#[tokio::test]
async fn corrections_echoed_on_the_bus_are_discarded() {
    let (enforcer, home, bus) = setup(&["light.a"]);
    let mut rx = bus.subscribe();

    let external = home.publish_external(CommandKind::TurnOn, brightness(200.0)).await;
    let _ = rx.recv().await.unwrap();
    assert!(matches!(
        enforcer.classifier().handle(&external).await,
        Classification::Applied { .. }
    ));

    home.set_live(
        "light.a",
        LiveState::on([(AttrKey::Brightness, 120.0)].into_iter().collect()),
    )
    .await;
    let report = enforcer.reconciler().tick(Instant::now()).await;
    assert_eq!(report.issued.len(), 1);
    let before = enforcer.store().get("light.a").await.unwrap();
    assert_eq!(before.backoff_level, 1);

    let echo = rx.recv().await.unwrap();
    assert!(echo.context_id.starts_with(CONTEXT_PREFIX));
    assert_eq!(
        enforcer.classifier().handle(&echo).await,
        Classification::SelfOrigin
    );
    assert_eq!(enforcer.store().get("light.a").await.unwrap(), before);
}

#[tokio::test]
async fn spacing_between_corrections_never_shrinks() {
    let (enforcer, home, _bus) = setup(&["light.a"]);
    let external = home.publish_external(CommandKind::TurnOn, brightness(200.0)).await;
    enforcer.classifier().handle(&external).await;
    home.freeze("light.a").await;
    home.set_live(
        "light.a",
        LiveState::on([(AttrKey::Brightness, 150.0)].into_iter().collect()),
    )
    .await;

    let t0 = Instant::now();
    let mut issued_at = Vec::new();
    let mut last_level = 0;
    for k in 0..30u32 {
        let now = t0 + DELTA * k;
        let report = enforcer.reconciler().tick(now).await;
        if !report.issued.is_empty() {
            issued_at.push(now);
        }
        let level = enforcer.store().get("light.a").await.unwrap().backoff_level;
        assert!(level >= last_level);
        assert!(level <= 5);
        last_level = level;
    }

    let gaps: Vec<Duration> = issued_at.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        &gaps[..5],
        &[DELTA, DELTA * 2, DELTA * 3, DELTA * 4, DELTA * 5]
    );
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*gaps.last().unwrap(), DELTA * 5);
}

#[tokio::test]
async fn external_turn_off_resets_backoff_mid_wait() {
    let (enforcer, home, _bus) = setup(&["light.a"]);
    let external = home.publish_external(CommandKind::TurnOn, brightness(200.0)).await;
    enforcer.classifier().handle(&external).await;
    home.freeze("light.a").await;
    home.set_live("light.a", LiveState::off()).await;

    let t0 = Instant::now();
    enforcer.reconciler().tick(t0).await;
    enforcer.reconciler().tick(t0 + DELTA).await;
    assert_eq!(
        enforcer.store().get("light.a").await.unwrap().backoff_level,
        2
    );

    let off = home
        .publish_external(
            CommandKind::TurnOff,
            ServiceData::for_devices(vec!["light.a".to_string()]),
        )
        .await;
    enforcer.classifier().handle(&off).await;
    let record = enforcer.store().get("light.a").await.unwrap();
    assert_eq!(record.desired_power, DesiredPower::Off);
    assert!(record.desired_attributes.is_empty());
    assert_eq!(record.backoff_level, 0);

    home.set_live("light.a", LiveState::on(Default::default())).await;
    let report = enforcer
        .reconciler()
        .tick(t0 + DELTA + Duration::from_millis(10))
        .await;
    assert_eq!(report.issued.len(), 1);
    assert_eq!(report.issued[0].kind, CommandKind::TurnOff);
}

#[tokio::test]
async fn running_enforcer_restores_drifted_light() {
    let bus = EventBus::new();
    let home = Arc::new(LoopbackHome::new(bus.clone()));
    let mut cfg = config(&["light.a"]);
    cfg.interval_ms = 20;
    let enforcer = Arc::new(Enforcer::new(&cfg, home.clone(), home.clone()));
    let cancel = CancellationToken::new();
    let mut tasks = enforcer.clone().start(&bus, cancel.clone());

    home.publish_external(CommandKind::TurnOn, brightness(200.0)).await;
    home.set_live(
        "light.a",
        LiveState::on([(AttrKey::Brightness, 40.0)].into_iter().collect()),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let restored = home
                .live_state("light.a")
                .await
                .and_then(|s| s.attributes.get(&AttrKey::Brightness).copied())
                == Some(200.0);
            if restored && !home.issued().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("light was not restored");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let record = enforcer.store().get("light.a").await.unwrap();
    assert_eq!(record.desired_power, DesiredPower::On);
    assert!(record.backoff_level >= 1);
    assert!(home
        .issued()
        .await
        .iter()
        .all(|c| c.context_id.as_str().starts_with(CONTEXT_PREFIX)));
    assert_eq!(
        home.live_state("light.a").await.map(|s| s.power),
        Some(PowerState::On)
    );

    cancel.cancel();
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }
}
