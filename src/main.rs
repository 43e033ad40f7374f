//! Lifeline - Emergency activation and evidence capture pipeline.
//!
//! # Overview
//!
//! Runs the activation pipeline behind an HTTP API: hold-to-confirm and
//! direct activation, live session reads, historical record queries, media
//! retrieval and deletion.
//!
//! # Configuration
//!
//! - `LIFELINE_PORT` - listen port (default 3000)
//! - `LIFELINE_DATABASE_URL` - SQLite URL (default `sqlite:lifeline.db?mode=rwc`)
//! - `LIFELINE_GATEWAY_URL` - device gateway base URL; unset runs simulated
//!   devices
//! - `LIFELINE_ALERT_WEBHOOK_URL` - alert webhook base URL; unset runs the
//!   simulated transport
//! - `LIFELINE_EMERGENCY_NUMBER` - public emergency number (default 112)
//! - `LIFELINE_CONTACTS` - JSON array of `{id, name, phone}` contacts

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use lifeline::alert::{AlertDispatcher, AlertTransport, DispatcherConfig};
use lifeline::api::{AppState, router};
use lifeline::capture::{CaptureConfig, CaptureProvider, MediaCaptureScheduler};
use lifeline::controller::{ContactDirectory, ControllerConfig, EmergencyActivationController};
use lifeline::device::gateway::{DeviceGatewayClient, WebhookAlertTransport};
use lifeline::device::sim::{SimAlertTransport, SimCaptureProvider, SimPositionSource, StaticContactDirectory};
use lifeline::location::{LocationSampler, PositionSource, SamplerConfig};
use lifeline::model::Contact;
use lifeline::store::RecordStore;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:lifeline.db?mode=rwc";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("lifeline=info".parse()?))
        .init();

    let port: u16 = env::var("LIFELINE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url = env::var("LIFELINE_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    info!(port, db_url = %db_url, "Starting Lifeline");

    let store = Arc::new(RecordStore::open(&db_url).await?);
    info!("Record store initialized");

    let (position, capture_provider): (Arc<dyn PositionSource>, Arc<dyn CaptureProvider>) =
        match env::var("LIFELINE_GATEWAY_URL") {
            Ok(url) => {
                info!(gateway = %url, "Using device gateway");
                let gateway = DeviceGatewayClient::new(&url);
                (Arc::new(gateway.clone()), Arc::new(gateway))
            }
            Err(_) => {
                info!("No device gateway configured; using simulated devices");
                (
                    Arc::new(SimPositionSource::default()),
                    Arc::new(SimCaptureProvider::default()),
                )
            }
        };

    let transport: Arc<dyn AlertTransport> = match env::var("LIFELINE_ALERT_WEBHOOK_URL") {
        Ok(url) => {
            info!(webhook = %url, "Using alert webhook");
            Arc::new(WebhookAlertTransport::new(&url))
        }
        Err(_) => {
            info!("No alert webhook configured; using simulated transport");
            Arc::new(SimAlertTransport::default())
        }
    };

    let contacts: Vec<Contact> = env::var("LIFELINE_CONTACTS")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    info!(contacts = contacts.len(), "Contact snapshot source loaded");
    let directory: Arc<dyn ContactDirectory> = Arc::new(StaticContactDirectory::new(contacts));

    let dispatcher_config = DispatcherConfig {
        emergency_number: env::var("LIFELINE_EMERGENCY_NUMBER")
            .unwrap_or_else(|_| "112".to_string()),
        ..DispatcherConfig::default()
    };

    let sampler = Arc::new(LocationSampler::new(
        position,
        Arc::clone(&store),
        SamplerConfig::default(),
    ));
    let capture = Arc::new(MediaCaptureScheduler::new(
        capture_provider,
        Arc::clone(&store),
        CaptureConfig::default(),
    ));
    let dispatcher = Arc::new(AlertDispatcher::new(
        transport,
        Arc::clone(&store),
        dispatcher_config,
    ));

    let controller = Arc::new(EmergencyActivationController::new(
        store,
        sampler,
        capture,
        dispatcher,
        directory,
        ControllerConfig::default(),
    ));

    let app = router(AppState { controller });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Lifeline is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
