//! Integration tests for the Lifeline API endpoints.
//!
//! These tests verify the full request/response cycle through the HTTP API,
//! with simulated devices behind the controller and shortened cadences so
//! sessions produce evidence within a test's lifetime.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use serde_json::json;
use uuid::Uuid;

use lifeline::alert::{AlertDispatcher, DispatcherConfig};
use lifeline::api::{AppState, router};
use lifeline::capture::{CaptureConfig, MediaCaptureScheduler};
use lifeline::controller::{ControllerConfig, EmergencyActivationController};
use lifeline::device::sim::{
    SimAlertTransport, SimCaptureProvider, SimPositionSource, StaticContactDirectory,
};
use lifeline::location::{LocationSampler, SamplerConfig};
use lifeline::model::Contact;
use lifeline::store::RecordStore;

struct Harness {
    server: TestServer,
    store: Arc<RecordStore>,
    transport: Arc<SimAlertTransport>,
}

async fn create_harness() -> Harness {
    let store = Arc::new(RecordStore::open("sqlite::memory:").await.unwrap());
    let transport = Arc::new(SimAlertTransport::default());

    let sampler = Arc::new(LocationSampler::new(
        Arc::new(SimPositionSource::default()),
        Arc::clone(&store),
        SamplerConfig {
            interval: Duration::from_millis(25),
            fast_fix_interval: Duration::from_millis(10),
            fast_fix_count: 2,
            alert_every: 0,
            single_shot_timeout: Duration::from_millis(200),
        },
    ));
    let capture = Arc::new(MediaCaptureScheduler::new(
        Arc::new(SimCaptureProvider::default()),
        Arc::clone(&store),
        CaptureConfig {
            still_interval: Duration::from_millis(10),
            stills_per_source: 2,
        },
    ));
    let dispatcher = Arc::new(AlertDispatcher::new(
        Arc::clone(&transport) as _,
        Arc::clone(&store),
        DispatcherConfig {
            emergency_number: "112".into(),
            // Long enough that no test fires the call by accident.
            call_delay: Duration::from_secs(60),
        },
    ));
    let contacts = Arc::new(StaticContactDirectory::new(vec![Contact {
        id: "contact-0".into(),
        name: "Ada".into(),
        phone: "+31600000000".into(),
    }]));

    let controller = Arc::new(EmergencyActivationController::new(
        Arc::clone(&store),
        sampler,
        capture,
        dispatcher,
        contacts,
        ControllerConfig {
            hold_window: Duration::from_millis(50),
            ..ControllerConfig::default()
        },
    ));

    Harness {
        server: TestServer::new(router(AppState { controller })).unwrap(),
        store,
        transport,
    }
}

async fn activate(server: &TestServer, owner_id: &str) -> String {
    let response = server
        .post("/activate")
        .json(&json!({ "owner_id": owner_id, "kind": "panic" }))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    body["record_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = create_harness().await;

    let response = harness.server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_activate_creates_durable_record() {
    let harness = create_harness().await;

    let response = harness
        .server
        .post("/activate")
        .json(&json!({ "owner_id": "traveler-1", "kind": "manual-sos" }))
        .await;

    response.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "active");
    assert_eq!(body["served_by_fallback"], false);

    let record_id = body["record_id"].as_str().unwrap();
    let response = harness.server.get(&format!("/records/{record_id}")).await;
    response.assert_status_ok();
    let record: serde_json::Value = response.json();
    assert_eq!(record["owner_id"], "traveler-1");
    assert_eq!(record["kind"], "manual-sos");
}

#[tokio::test]
async fn test_duplicate_activation_conflicts() {
    let harness = create_harness().await;
    activate(&harness.server, "traveler-1").await;

    let response = harness
        .server
        .post("/activate")
        .json(&json!({ "owner_id": "traveler-1", "kind": "panic" }))
        .await;

    response.assert_status(axum::http::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_resolve_is_terminal() {
    let harness = create_harness().await;
    let record_id = activate(&harness.server, "traveler-1").await;

    let response = harness
        .server
        .post(&format!("/records/{record_id}/resolve"))
        .await;
    response.assert_status_ok();

    let record: serde_json::Value = harness
        .server
        .get(&format!("/records/{record_id}"))
        .await
        .json();
    assert_eq!(record["status"], "resolved");
    assert!(!record["resolved_at"].is_null());

    // Second terminal transition loses and is surfaced as a conflict.
    let response = harness
        .server
        .post(&format!("/records/{record_id}/resolve"))
        .await;
    response.assert_status(axum::http::StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cancel_does_not_stamp_resolved_at() {
    let harness = create_harness().await;
    let record_id = activate(&harness.server, "traveler-1").await;

    let response = harness
        .server
        .post(&format!("/records/{record_id}/cancel"))
        .await;
    response.assert_status_ok();

    let record: serde_json::Value = harness
        .server
        .get(&format!("/records/{record_id}"))
        .await
        .json();
    assert_eq!(record["status"], "cancelled");
    assert!(record["resolved_at"].is_null());
}

#[tokio::test]
async fn test_unknown_record_is_not_found() {
    let harness = create_harness().await;

    let response = harness
        .server
        .get(&format!("/records/{}", Uuid::new_v4()))
        .await;

    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_records_listing_newest_first() {
    let harness = create_harness().await;

    let first = activate(&harness.server, "traveler-1").await;
    harness
        .server
        .post(&format!("/records/{first}/resolve"))
        .await
        .assert_status_ok();
    // Distinct creation timestamps for a deterministic order.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = activate(&harness.server, "traveler-1").await;

    let response = harness.server.get("/records?owner_id=traveler-1").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["fallback_only"], false);

    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], second.as_str());
    assert_eq!(records[0]["status"], "active");
    assert_eq!(records[1]["id"], first.as_str());
    assert_eq!(records[1]["status"], "resolved");

    let response = harness
        .server
        .get("/records?owner_id=traveler-1&status=resolved")
        .await;
    let body: serde_json::Value = response.json();
    assert_eq!(body["records"].as_array().unwrap().len(), 1);

    harness
        .server
        .post(&format!("/records/{second}/resolve"))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_activation_during_outage_served_by_fallback() {
    let harness = create_harness().await;
    harness.store.force_durable_outage(true);

    let response = harness
        .server
        .post("/activate")
        .json(&json!({ "owner_id": "traveler-1", "kind": "distress" }))
        .await;

    response.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["served_by_fallback"], true);

    let listing: serde_json::Value = harness
        .server
        .get("/records?owner_id=traveler-1")
        .await
        .json();
    assert_eq!(listing["fallback_only"], true);
    assert_eq!(listing["records"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_hold_released_early_creates_nothing() {
    let harness = create_harness().await;

    let response = harness
        .server
        .post("/hold")
        .json(&json!({ "owner_id": "traveler-1" }))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["window_ms"], 50);
    let session_id = body["session_id"].as_str().unwrap().to_string();

    let response = harness
        .server
        .post(&format!("/hold/{session_id}/release"))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["activated"], false);

    let listing: serde_json::Value = harness
        .server
        .get("/records?owner_id=traveler-1")
        .await
        .json();
    assert!(listing["records"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_hold_full_window_activates() {
    let harness = create_harness().await;

    let body: serde_json::Value = harness
        .server
        .post("/hold")
        .json(&json!({ "owner_id": "traveler-1" }))
        .await
        .json();
    let session_id = body["session_id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(80)).await;

    let progress: serde_json::Value = harness
        .server
        .get(&format!("/hold/{session_id}"))
        .await
        .json();
    assert_eq!(progress["armed"], true);
    assert_eq!(progress["progress"], 1.0);

    let response = harness
        .server
        .post(&format!("/hold/{session_id}/release"))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["activated"], true);
    assert_eq!(body["record"]["status"], "active");

    let record_id = body["record"]["record_id"].as_str().unwrap().to_string();
    harness
        .server
        .post(&format!("/records/{record_id}/resolve"))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_release_of_unknown_hold_is_noop() {
    let harness = create_harness().await;

    let response = harness
        .server
        .post(&format!("/hold/{}/release", Uuid::new_v4()))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["activated"], false);
}

#[tokio::test]
async fn test_latest_location_while_active() {
    let harness = create_harness().await;
    let record_id = activate(&harness.server, "traveler-1").await;

    tokio::time::sleep(Duration::from_millis(60)).await;

    let response = harness
        .server
        .get(&format!("/records/{record_id}/location/latest"))
        .await;
    response.assert_status_ok();
    let sample: serde_json::Value = response.json();
    assert!(sample["lat"].as_f64().unwrap() > 48.0);

    harness
        .server
        .post(&format!("/records/{record_id}/resolve"))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_asset_fetch_and_media_deletion() {
    let harness = create_harness().await;
    let record_id = activate(&harness.server, "traveler-1").await;

    // Let the capture ticker hit its per-source cap, then finalize.
    tokio::time::sleep(Duration::from_millis(80)).await;
    harness
        .server
        .post(&format!("/records/{record_id}/resolve"))
        .await
        .assert_status_ok();

    let record: serde_json::Value = harness
        .server
        .get(&format!("/records/{record_id}"))
        .await
        .json();
    let assets = record["media_assets"].as_array().unwrap();
    assert!(!assets.is_empty());

    let photo = assets
        .iter()
        .find(|a| a["kind"] == "photo")
        .expect("at least one still");
    let asset_id = photo["id"].as_str().unwrap();

    let response = harness
        .server
        .get(&format!("/records/{record_id}/assets/{asset_id}"))
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.header("content-type").to_str().unwrap(),
        "image/jpeg"
    );
    assert!(!response.as_bytes().is_empty());

    // Delete one asset, then the rest.
    let body: serde_json::Value = harness
        .server
        .delete(&format!("/records/{record_id}/media?asset_id={asset_id}"))
        .await
        .json();
    assert_eq!(body["deleted"], 1);

    let body: serde_json::Value = harness
        .server
        .delete(&format!("/records/{record_id}/media"))
        .await
        .json();
    assert_eq!(body["deleted"].as_u64().unwrap(), assets.len() as u64 - 1);

    let record: serde_json::Value = harness
        .server
        .get(&format!("/records/{record_id}"))
        .await
        .json();
    assert!(record["media_assets"].as_array().unwrap().is_empty());

    // The payload is gone with the asset.
    let response = harness
        .server
        .get(&format!("/records/{record_id}/assets/{asset_id}"))
        .await;
    response.assert_status(axum::http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_activation_alerts_reach_contacts() {
    let harness = create_harness().await;
    let record_id = activate(&harness.server, "traveler-1").await;

    // The fan-out is spawned off the request path.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.transport.deliveries().is_empty());

    let record: serde_json::Value = harness
        .server
        .get(&format!("/records/{record_id}"))
        .await
        .json();
    assert_eq!(record["contacts_notified"][0], "contact-0");

    harness
        .server
        .post(&format!("/records/{record_id}/resolve"))
        .await
        .assert_status_ok();
}
