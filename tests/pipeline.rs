//! End-to-end pipeline scenarios driven through the controller with simulated
//! devices: evidence flow, degradation paths and the delayed emergency call.

use std::sync::Arc;
use std::time::Duration;

use lifeline::alert::{AlertDispatcher, AlertPhase, DispatcherConfig};
use lifeline::capture::{CaptureConfig, MediaCaptureScheduler};
use lifeline::controller::{ControllerConfig, EmergencyActivationController, HoldOutcome};
use lifeline::device::sim::{
    SimAlertTransport, SimCaptureProvider, SimPositionSource, StaticContactDirectory,
};
use lifeline::location::{LocationSampler, SamplerConfig};
use lifeline::model::{Contact, EmergencyKind, MediaKind, RecordStatus, SourceStream};
use lifeline::store::RecordStore;

struct Rig {
    controller: Arc<EmergencyActivationController>,
    store: Arc<RecordStore>,
    transport: Arc<SimAlertTransport>,
}

async fn build_rig(
    position: Arc<SimPositionSource>,
    provider: Arc<SimCaptureProvider>,
    call_delay: Duration,
) -> Rig {
    let store = Arc::new(RecordStore::open("sqlite::memory:").await.unwrap());
    let transport = Arc::new(SimAlertTransport::default());

    let sampler = Arc::new(LocationSampler::new(
        position as _,
        Arc::clone(&store),
        SamplerConfig {
            interval: Duration::from_millis(20),
            fast_fix_interval: Duration::from_millis(8),
            fast_fix_count: 2,
            alert_every: 0,
            single_shot_timeout: Duration::from_millis(200),
        },
    ));
    let capture = Arc::new(MediaCaptureScheduler::new(
        provider as _,
        Arc::clone(&store),
        CaptureConfig {
            still_interval: Duration::from_millis(10),
            stills_per_source: 3,
        },
    ));
    let dispatcher = Arc::new(AlertDispatcher::new(
        Arc::clone(&transport) as _,
        Arc::clone(&store),
        DispatcherConfig {
            emergency_number: "112".into(),
            call_delay,
        },
    ));
    let contacts = Arc::new(StaticContactDirectory::new(vec![
        Contact {
            id: "contact-0".into(),
            name: "Ada".into(),
            phone: "+31600000000".into(),
        },
        Contact {
            id: "contact-1".into(),
            name: "Grace".into(),
            phone: "+31600000001".into(),
        },
    ]));

    Rig {
        controller: Arc::new(EmergencyActivationController::new(
            Arc::clone(&store),
            sampler,
            capture,
            dispatcher,
            contacts,
            ControllerConfig {
                hold_window: Duration::from_millis(40),
                ..ControllerConfig::default()
            },
        )),
        store,
        transport,
    }
}

async fn default_rig() -> Rig {
    build_rig(
        Arc::new(SimPositionSource::default()),
        Arc::new(SimCaptureProvider::default()),
        Duration::from_secs(60),
    )
    .await
}

#[tokio::test]
async fn test_full_panic_session_lifecycle() {
    let rig = default_rig().await;

    let handle = rig
        .controller
        .activate("traveler-1", EmergencyKind::Panic)
        .await
        .unwrap();

    // Run past the still cap so every evidence stream has produced output.
    tokio::time::sleep(Duration::from_millis(120)).await;
    rig.controller.resolve(&handle).await.unwrap();

    let record = rig.controller.record(handle.id()).await.unwrap();
    assert_eq!(record.status, RecordStatus::Resolved);
    assert!(record.resolved_at.is_some());
    assert!(!record.served_by_fallback);

    // Location evidence: initial fix plus periodic samples, stamps in order.
    assert!(record.location_history.len() >= 3);
    let stamps: Vec<i64> = record
        .location_history
        .iter()
        .map(|s| s.captured_at_ms)
        .collect();
    let mut sorted = stamps.clone();
    sorted.sort();
    assert_eq!(stamps, sorted);
    assert_eq!(
        record.location.unwrap().captured_at_ms,
        *stamps.last().unwrap()
    );

    // Media evidence: capped stills from both cameras plus one combined clip.
    let rear = record
        .media_assets
        .iter()
        .filter(|a| a.kind == MediaKind::Photo && a.source == SourceStream::Rear)
        .count();
    let front = record
        .media_assets
        .iter()
        .filter(|a| a.kind == MediaKind::Photo && a.source == SourceStream::Front)
        .count();
    let clips: Vec<_> = record
        .media_assets
        .iter()
        .filter(|a| a.kind == MediaKind::Video)
        .collect();
    assert_eq!(rear, 3);
    assert_eq!(front, 3);
    assert_eq!(clips.len(), 1);
    assert_eq!(clips[0].source, SourceStream::Combined);

    // Both contacts got the activation and the resolution.
    assert_eq!(record.contacts_notified.len(), 2);
    let phases: Vec<AlertPhase> = rig
        .transport
        .deliveries()
        .into_iter()
        .map(|(_, phase)| phase)
        .collect();
    assert!(phases.contains(&AlertPhase::Activation));
    assert!(phases.contains(&AlertPhase::Resolved));

    // Nothing appends after resolve has returned.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let later = rig.controller.record(handle.id()).await.unwrap();
    assert_eq!(later.location_history.len(), record.location_history.len());
    assert_eq!(later.media_assets.len(), record.media_assets.len());
}

#[tokio::test]
async fn test_cancel_disarms_the_emergency_call() {
    let rig = build_rig(
        Arc::new(SimPositionSource::default()),
        Arc::new(SimCaptureProvider::default()),
        Duration::from_millis(60),
    )
    .await;

    let handle = rig
        .controller
        .activate("traveler-1", EmergencyKind::Panic)
        .await
        .unwrap();
    rig.controller.cancel(&handle).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rig.transport.calls().is_empty());

    let record = rig.controller.record(handle.id()).await.unwrap();
    assert_eq!(record.status, RecordStatus::Cancelled);
    assert!(record.resolved_at.is_none());
    let phases: Vec<AlertPhase> = rig
        .transport
        .deliveries()
        .into_iter()
        .map(|(_, phase)| phase)
        .collect();
    assert!(phases.contains(&AlertPhase::Cancelled));
}

#[tokio::test]
async fn test_emergency_call_fires_after_grace_delay() {
    let rig = build_rig(
        Arc::new(SimPositionSource::default()),
        Arc::new(SimCaptureProvider::default()),
        Duration::from_millis(30),
    )
    .await;

    let handle = rig
        .controller
        .activate("traveler-1", EmergencyKind::Distress)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.transport.calls(), ["112"]);

    // Resolving after the call fired is still a clean teardown.
    rig.controller.resolve(&handle).await.unwrap();
    assert_eq!(rig.transport.calls().len(), 1);
}

#[tokio::test]
async fn test_session_survives_durable_outage() {
    let rig = default_rig().await;
    rig.store.force_durable_outage(true);

    let handle = rig
        .controller
        .activate("traveler-1", EmergencyKind::ManualSos)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.controller.resolve(&handle).await.unwrap();

    let record = rig.controller.record(handle.id()).await.unwrap();
    assert!(record.served_by_fallback);
    assert_eq!(record.status, RecordStatus::Resolved);
    assert!(!record.location_history.is_empty());
    assert!(!record.media_assets.is_empty());

    let (records, fallback_only) = rig
        .controller
        .records_for("traveler-1", None, 10)
        .await
        .unwrap();
    assert!(fallback_only);
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_capture_failure_degrades_session() {
    let provider = Arc::new(SimCaptureProvider::default());
    provider.fail_rear(true);
    let rig = build_rig(
        Arc::new(SimPositionSource::default()),
        provider,
        Duration::from_secs(60),
    )
    .await;

    // No cameras at all; the session still activates and alerts.
    let handle = rig
        .controller
        .activate("traveler-1", EmergencyKind::Panic)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    rig.controller.resolve(&handle).await.unwrap();

    let record = rig.controller.record(handle.id()).await.unwrap();
    assert!(record.media_assets.is_empty());
    assert!(!record.location_history.is_empty());
    assert_eq!(record.contacts_notified.len(), 2);
}

#[tokio::test]
async fn test_denied_position_source_degrades_session() {
    let position = Arc::new(SimPositionSource::default());
    position.deny();
    let rig = build_rig(
        position,
        Arc::new(SimCaptureProvider::default()),
        Duration::from_secs(60),
    )
    .await;

    let handle = rig
        .controller
        .activate("traveler-1", EmergencyKind::Panic)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    rig.controller.resolve(&handle).await.unwrap();

    let record = rig.controller.record(handle.id()).await.unwrap();
    assert!(record.location_history.is_empty());
    assert!(record.location.is_none());
    // Media and alerting are unaffected by the missing fixes.
    assert!(!record.media_assets.is_empty());
    assert!(!rig.transport.deliveries().is_empty());
}

#[tokio::test]
async fn test_owners_activate_independently() {
    let rig = default_rig().await;

    let first = rig
        .controller
        .activate("traveler-1", EmergencyKind::Panic)
        .await
        .unwrap();
    let second = rig
        .controller
        .activate("traveler-2", EmergencyKind::Inactivity)
        .await
        .unwrap();

    assert_ne!(first.id(), second.id());
    rig.controller.resolve(&first).await.unwrap();
    rig.controller.resolve(&second).await.unwrap();

    let record = rig.controller.record(second.id()).await.unwrap();
    assert_eq!(record.owner_id, "traveler-2");
    assert_eq!(record.kind, EmergencyKind::Inactivity);
}

#[tokio::test]
async fn test_hold_to_confirm_end_to_end() {
    let rig = default_rig().await;

    // Early release: nothing happens.
    let session = rig.controller.arm_hold("traveler-1", EmergencyKind::Panic);
    let outcome = rig.controller.release_hold(session.id).await.unwrap();
    assert!(matches!(outcome, HoldOutcome::Released));
    let (records, _) = rig
        .controller
        .records_for("traveler-1", None, 10)
        .await
        .unwrap();
    assert!(records.is_empty());

    // Full hold: activation fires on release.
    let session = rig.controller.arm_hold("traveler-1", EmergencyKind::Panic);
    tokio::time::sleep(Duration::from_millis(60)).await;
    let outcome = rig.controller.release_hold(session.id).await.unwrap();
    let HoldOutcome::Armed(handle) = outcome else {
        panic!("armed hold must activate");
    };

    let record = rig.controller.record(handle.id()).await.unwrap();
    assert_eq!(record.status, RecordStatus::Active);
    assert_eq!(record.kind, EmergencyKind::Panic);
    rig.controller.resolve(&handle).await.unwrap();
}
