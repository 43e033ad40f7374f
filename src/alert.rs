//! Outbound alerting: contact fan-out and the delayed emergency call.
//!
//! Deliveries are best-effort fan-out: every contact is attempted
//! independently, failures are logged and counted, and there is no retry
//! queue. The emergency-number call is armed
//! with a grace delay at activation and raced against a cancellation signal;
//! cancelling after the call has fired is a no-op, never an error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::model::{Contact, EmergencyKind, RecordHandle, RecordStatus};
use crate::store::RecordStore;

/// Which moment of the session a message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertPhase {
    Activation,
    LocationUpdate,
    Resolved,
    Cancelled,
}

impl AlertPhase {
    fn headline(self) -> &'static str {
        match self {
            AlertPhase::Activation => "EMERGENCY",
            AlertPhase::LocationUpdate => "LOCATION UPDATE",
            AlertPhase::Resolved => "RESOLVED",
            AlertPhase::Cancelled => "CANCELLED",
        }
    }
}

/// One outbound message. The transport decides the wire format; this is the
/// dispatch contract only.
#[derive(Debug, Clone, Serialize)]
pub struct AlertMessage {
    pub record_id: Uuid,
    pub phase: AlertPhase,
    pub kind: EmergencyKind,
    pub timestamp: DateTime<Utc>,
    /// Map link for the latest known position, when one exists.
    pub location_url: Option<String>,
    pub body: String,
}

/// Outbound transport seam. SMS, push or webhook; the wire format is the
/// transport's concern.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn deliver(&self, contact: &Contact, message: &AlertMessage)
    -> Result<(), DeliveryError>;
    async fn place_emergency_call(&self, number: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Public emergency number dialed after the grace delay.
    pub emergency_number: String,
    /// Grace period between activation and the outbound call.
    pub call_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            emergency_number: "112".to_string(),
            call_delay: Duration::from_secs(10),
        }
    }
}

pub struct AlertDispatcher {
    transport: Arc<dyn AlertTransport>,
    store: Arc<RecordStore>,
    config: DispatcherConfig,
    /// Contact lists snapshotted at activation, dropped at terminal notify.
    snapshots: Mutex<HashMap<Uuid, Vec<Contact>>>,
    /// Armed emergency calls, keyed by record. An entry is the right to fire.
    scheduled_calls: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
}

impl AlertDispatcher {
    pub fn new(
        transport: Arc<dyn AlertTransport>,
        store: Arc<RecordStore>,
        config: DispatcherConfig,
    ) -> Self {
        AlertDispatcher {
            transport,
            store,
            config,
            snapshots: Mutex::new(HashMap::new()),
            scheduled_calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fan the activation message out to the contact snapshot. Returns the
    /// number of contacts successfully addressed; individual failures never
    /// fail the others.
    pub async fn notify_activation(&self, handle: &RecordHandle, contacts: Vec<Contact>) -> usize {
        self.snapshots
            .lock()
            .unwrap()
            .insert(handle.id(), contacts.clone());

        let message = self.compose(handle, AlertPhase::Activation).await;
        let delivered = self.fan_out(&contacts, message).await;

        if let Err(e) = self
            .store
            .mark_contacts_notified(handle, delivered.clone())
            .await
        {
            warn!(record_id = %handle.id(), error = %e, "Failed to record notified contacts");
        }
        info!(
            record_id = %handle.id(),
            delivered = delivered.len(),
            total = contacts.len(),
            "Activation alerts dispatched"
        );
        delivered.len()
    }

    /// Re-send the latest position to the activation snapshot. Triggered by
    /// the location sampler on a slower cadence than raw sampling.
    pub async fn notify_location_update(&self, handle: &RecordHandle) -> usize {
        let contacts = self
            .snapshots
            .lock()
            .unwrap()
            .get(&handle.id())
            .cloned()
            .unwrap_or_default();
        if contacts.is_empty() {
            return 0;
        }

        let message = self.compose(handle, AlertPhase::LocationUpdate).await;
        self.fan_out(&contacts, message).await.len()
    }

    /// Send the terminal message and drop the snapshot.
    pub async fn notify_terminal(&self, handle: &RecordHandle, status: RecordStatus) -> usize {
        let contacts = self
            .snapshots
            .lock()
            .unwrap()
            .remove(&handle.id())
            .unwrap_or_default();
        if contacts.is_empty() {
            return 0;
        }

        let phase = match status {
            RecordStatus::Cancelled => AlertPhase::Cancelled,
            _ => AlertPhase::Resolved,
        };
        let message = self.compose(handle, phase).await;
        self.fan_out(&contacts, message).await.len()
    }

    /// Arm the delayed call to the public emergency number. A second call for
    /// the same record while one is armed is ignored.
    pub fn schedule_emergency_call(&self, record_id: Uuid) {
        let mut calls = self.scheduled_calls.lock().unwrap();
        if calls.contains_key(&record_id) {
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        calls.insert(record_id, cancel_tx);

        let transport = Arc::clone(&self.transport);
        let registry = Arc::clone(&self.scheduled_calls);
        let number = self.config.emergency_number.clone();
        let delay = self.config.call_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    // Removing the entry is the commit: a racing cancel that
                    // got there first disarms the call.
                    let armed = registry.lock().unwrap().remove(&record_id).is_some();
                    if !armed {
                        return;
                    }
                    match transport.place_emergency_call(&number).await {
                        Ok(()) => info!(record_id = %record_id, number = %number, "Emergency call placed"),
                        Err(e) => warn!(record_id = %record_id, error = %e, "Emergency call failed"),
                    }
                }
                _ = cancel_rx => {
                    debug!(record_id = %record_id, "Scheduled emergency call cancelled");
                }
            }
        });
    }

    /// Disarm the delayed call. Idempotent: a call that already fired (or was
    /// never armed) makes this a no-op.
    pub fn cancel_scheduled_call(&self, record_id: Uuid) {
        let cancel = self.scheduled_calls.lock().unwrap().remove(&record_id);
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
    }

    async fn fan_out(&self, contacts: &[Contact], message: AlertMessage) -> Vec<String> {
        let mut deliveries = JoinSet::new();
        for contact in contacts {
            let contact = contact.clone();
            let message = message.clone();
            let transport = Arc::clone(&self.transport);
            deliveries.spawn(async move {
                match transport.deliver(&contact, &message).await {
                    Ok(()) => Some(contact.id),
                    Err(e) => {
                        warn!(contact_id = %e.contact_id, reason = %e.reason, "Alert delivery failed");
                        None
                    }
                }
            });
        }

        let mut delivered = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            if let Ok(Some(contact_id)) = joined {
                delivered.push(contact_id);
            }
        }
        delivered
    }

    async fn compose(&self, handle: &RecordHandle, phase: AlertPhase) -> AlertMessage {
        let location = self
            .store
            .get(handle.id())
            .await
            .ok()
            .and_then(|record| record.location);

        let timestamp = Utc::now();
        let location_url = location.as_ref().map(|sample| {
            format!(
                "https://maps.google.com/?q={}",
                urlencoding::encode(&format!("{},{}", sample.lat, sample.lng))
            )
        });

        let mut body = format!(
            "{} ({}) at {}",
            phase.headline(),
            handle.kind().as_str(),
            timestamp.to_rfc3339(),
        );
        if let Some(url) = &location_url {
            body.push_str(&format!(". Last known location: {url}"));
        }
        if let Some(address) = location.as_ref().and_then(|s| s.address.as_deref()) {
            body.push_str(&format!(" (near {address})"));
        }

        AlertMessage {
            record_id: handle.id(),
            phase,
            kind: handle.kind(),
            timestamp,
            location_url,
            body,
        }
    }
}
