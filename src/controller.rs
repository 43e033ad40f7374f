//! The activation controller: the only component the presentation layer
//! talks to.
//!
//! Owns the record-level state machine (`active` entered once at creation,
//! exactly one of `resolved`/`cancelled` reached exactly once) and the
//! lifecycle of the three concurrent subsystems. The terminal transition
//! commits at the store; racing `resolve`/`cancel` calls are settled there,
//! and the loser gets [`ActivationError::InvalidState`] with no side effects.
//!
//! Accidental activation is prevented by the hold-to-confirm micro state
//! machine ([`ArmingSession`]): holding the panic control for the full
//! confirmation window activates, releasing early is a no-op with no record
//! created.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::AlertDispatcher;
use crate::capture::MediaCaptureScheduler;
use crate::error::{ActivationError, StorageError};
use crate::location::{LocationSampler, LocationUpdateHook};
use crate::model::{
    Contact, EmergencyKind, EmergencyRecord, LocationSample, RecordHandle, RecordStatus,
};
use crate::store::RecordStore;

/// Read-only source of the user's emergency contacts. Snapshotted once at
/// activation; later profile edits are not observed.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contacts_for(&self, owner_id: &str) -> Vec<Contact>;
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long the panic control must be held before activation fires.
    pub hold_window: Duration,
    /// How long a hold session stays resident past its window before it is
    /// treated as abandoned and dropped.
    pub hold_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            hold_window: Duration::from_secs(3),
            hold_grace: Duration::from_secs(30),
        }
    }
}

/// One press-and-hold confirmation gesture: idle → holding → (armed | released).
#[derive(Debug, Clone)]
pub struct ArmingSession {
    pub id: Uuid,
    owner_id: String,
    kind: EmergencyKind,
    started_at: Instant,
    window: Duration,
}

impl ArmingSession {
    fn new(owner_id: String, kind: EmergencyKind, window: Duration) -> Self {
        ArmingSession {
            id: Uuid::new_v4(),
            owner_id,
            kind,
            started_at: Instant::now(),
            window,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Fraction of the confirmation window elapsed, clamped to 1.0.
    pub fn progress(&self) -> f32 {
        let ratio = self.elapsed().as_secs_f32() / self.window.as_secs_f32();
        ratio.min(1.0)
    }

    /// Whether the hold has lasted the full window.
    pub fn is_armed(&self) -> bool {
        self.elapsed() >= self.window
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether the session has outlived its window by more than `grace`:
    /// the client abandoned the gesture without releasing.
    fn is_expired(&self, grace: Duration) -> bool {
        self.elapsed() >= self.window + grace
    }
}

/// What a released hold turned into.
#[derive(Debug)]
pub enum HoldOutcome {
    /// Held for the full window: an activation fired.
    Armed(RecordHandle),
    /// Released early (or unknown session): no record, no error.
    Released,
}

pub struct EmergencyActivationController {
    store: Arc<RecordStore>,
    sampler: Arc<LocationSampler>,
    capture: Arc<MediaCaptureScheduler>,
    dispatcher: Arc<AlertDispatcher>,
    contacts: Arc<dyn ContactDirectory>,
    config: ControllerConfig,
    /// Live sessions by record id; presence of an owner's handle here is the
    /// `AlreadyActive` guard.
    active: tokio::sync::Mutex<HashMap<Uuid, RecordHandle>>,
    /// Owners whose activation is in flight (reserved, record not created
    /// yet). Keeps the `active` lock out of the slow part of `activate`.
    pending_activations: Mutex<HashSet<String>>,
    holds: Mutex<HashMap<Uuid, ArmingSession>>,
}

impl EmergencyActivationController {
    pub fn new(
        store: Arc<RecordStore>,
        sampler: Arc<LocationSampler>,
        capture: Arc<MediaCaptureScheduler>,
        dispatcher: Arc<AlertDispatcher>,
        contacts: Arc<dyn ContactDirectory>,
        config: ControllerConfig,
    ) -> Self {
        EmergencyActivationController {
            store,
            sampler,
            capture,
            dispatcher,
            contacts,
            config,
            active: tokio::sync::Mutex::new(HashMap::new()),
            pending_activations: Mutex::new(HashSet::new()),
            holds: Mutex::new(HashMap::new()),
        }
    }

    /// Begin an emergency session: create the record, start location
    /// sampling, media capture and alerting, and arm the delayed emergency
    /// call.
    pub async fn activate(
        &self,
        owner_id: &str,
        kind: EmergencyKind,
    ) -> Result<RecordHandle, ActivationError> {
        // Check-and-reserve the owner, then release both locks: the contact
        // read, the position fix and the store create below must not
        // serialize activations for unrelated owners.
        {
            let active = self.active.lock().await;
            let mut pending = self.pending_activations.lock().unwrap();
            if active.values().any(|h| h.owner_id() == owner_id)
                || !pending.insert(owner_id.to_string())
            {
                return Err(ActivationError::AlreadyActive(owner_id.to_string()));
            }
        }

        let contacts = self.contacts.contacts_for(owner_id).await;
        let initial_location = self.sampler.single_shot().await;
        let handle = match self
            .store
            .create(owner_id, kind, initial_location, &contacts)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.pending_activations.lock().unwrap().remove(owner_id);
                return Err(e.into());
            }
        };
        // The handle enters `active` before the reservation drops, so a
        // concurrent activate never finds the owner in neither set.
        self.active.lock().await.insert(handle.id(), handle.clone());
        self.pending_activations.lock().unwrap().remove(owner_id);

        info!(
            record_id = %handle.id(),
            owner_id = %owner_id,
            kind = kind.as_str(),
            contacts = contacts.len(),
            "Emergency session activated"
        );

        let hook: LocationUpdateHook = {
            let dispatcher = Arc::clone(&self.dispatcher);
            Arc::new(move |handle: RecordHandle| {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher.notify_location_update(&handle).await;
                });
            })
        };
        self.sampler.start(handle.clone(), Some(hook)).await;

        if let Err(e) = self.capture.start(handle.clone()).await {
            // Degraded session: evidence capture is down but location and
            // alerting continue.
            warn!(record_id = %handle.id(), error = %e, "Media capture unavailable for this session");
        }

        {
            let dispatcher = Arc::clone(&self.dispatcher);
            let handle = handle.clone();
            tokio::spawn(async move {
                dispatcher.notify_activation(&handle, contacts).await;
            });
        }
        self.dispatcher.schedule_emergency_call(handle.id());

        Ok(handle)
    }

    /// End the session with `resolved`. Fails with `InvalidState` and no
    /// side effects if the record is already terminal.
    pub async fn resolve(&self, handle: &RecordHandle) -> Result<(), ActivationError> {
        self.terminate(handle, RecordStatus::Resolved).await
    }

    /// End the session with `cancelled`; used when activation was accidental.
    pub async fn cancel(&self, handle: &RecordHandle) -> Result<(), ActivationError> {
        self.terminate(handle, RecordStatus::Cancelled).await
    }

    async fn terminate(
        &self,
        handle: &RecordHandle,
        status: RecordStatus,
    ) -> Result<(), ActivationError> {
        // The conditional status write is the commit point for racing
        // resolve/cancel calls.
        match self.store.set_status(handle, status).await {
            Ok(()) => {}
            Err(StorageError::InvalidTransition(id)) => {
                return Err(ActivationError::InvalidState(id));
            }
            Err(e) => return Err(e.into()),
        }

        self.dispatcher.cancel_scheduled_call(handle.id());
        self.sampler.stop(handle.id()).await;
        self.capture.stop(handle).await;
        self.dispatcher.notify_terminal(handle, status).await;
        self.active.lock().await.remove(&handle.id());

        info!(
            record_id = %handle.id(),
            status = status.as_str(),
            "Emergency session ended"
        );
        Ok(())
    }

    /// Start the hold-to-confirm gesture.
    pub fn arm_hold(&self, owner_id: &str, kind: EmergencyKind) -> ArmingSession {
        let session = ArmingSession::new(owner_id.to_string(), kind, self.config.hold_window);
        let grace = self.config.hold_grace;
        let mut holds = self.holds.lock().unwrap();
        // Abandoned gestures (client gone mid-hold) are swept here so the
        // map stays bounded by live sessions.
        holds.retain(|_, s| !s.is_expired(grace));
        holds.insert(session.id, session.clone());
        session
    }

    /// Elapsed/armed state of a holding gesture, for UI feedback. Expired
    /// sessions read as unknown.
    pub fn hold_progress(&self, session_id: Uuid) -> Option<ArmingSession> {
        let mut holds = self.holds.lock().unwrap();
        let session = holds.get(&session_id)?.clone();
        if session.is_expired(self.config.hold_grace) {
            holds.remove(&session_id);
            return None;
        }
        Some(session)
    }

    /// Release the control. A hold that lasted the full window activates;
    /// anything shorter (or an unknown session) is a no-op with no record.
    pub async fn release_hold(&self, session_id: Uuid) -> Result<HoldOutcome, ActivationError> {
        let session = self.holds.lock().unwrap().remove(&session_id);
        let Some(session) = session else {
            return Ok(HoldOutcome::Released);
        };

        if session.is_expired(self.config.hold_grace) {
            info!(
                session_id = %session_id,
                "Hold session expired before release; no activation"
            );
            return Ok(HoldOutcome::Released);
        }

        if session.is_armed() {
            let handle = self.activate(&session.owner_id, session.kind).await?;
            Ok(HoldOutcome::Armed(handle))
        } else {
            info!(
                session_id = %session_id,
                held_ms = session.elapsed().as_millis() as u64,
                "Hold released early; no activation"
            );
            Ok(HoldOutcome::Released)
        }
    }

    /// Handle for a live or historical record.
    pub async fn handle_for(&self, record_id: Uuid) -> Result<RecordHandle, ActivationError> {
        if let Some(handle) = self.active.lock().await.get(&record_id) {
            return Ok(handle.clone());
        }
        let record = self.store.get(record_id).await?;
        Ok(RecordHandle::for_record(&record))
    }

    pub async fn record(&self, record_id: Uuid) -> Result<EmergencyRecord, ActivationError> {
        Ok(self.store.get(record_id).await?)
    }

    /// Owner's records newest first, with a flag for fallback-only listings.
    pub async fn records_for(
        &self,
        owner_id: &str,
        status: Option<RecordStatus>,
        limit: u32,
    ) -> Result<(Vec<EmergencyRecord>, bool), ActivationError> {
        Ok(self.store.list_by_owner(owner_id, status, limit).await?)
    }

    /// Best-effort latest position: live sampler state first, then the
    /// stored record.
    pub async fn latest_location(&self, record_id: Uuid) -> Option<LocationSample> {
        if let Some(sample) = self.sampler.latest(record_id) {
            return Some(sample);
        }
        self.store
            .get(record_id)
            .await
            .ok()
            .and_then(|record| record.location)
    }

    pub async fn delete_media(
        &self,
        record_id: Uuid,
        asset_id: Option<Uuid>,
    ) -> Result<usize, ActivationError> {
        Ok(self.store.delete_media(record_id, asset_id).await?)
    }

    /// Payload bytes (and mime type) for one asset of one record.
    pub async fn asset_payload(
        &self,
        record_id: Uuid,
        asset_id: Uuid,
    ) -> Result<(String, Vec<u8>), ActivationError> {
        let record = self.store.get(record_id).await?;
        let asset = record
            .media_assets
            .iter()
            .find(|a| a.id == asset_id)
            .ok_or_else(|| StorageError::PayloadNotFound(asset_id.to_string()))?;
        Ok(self.store.get_payload(&asset.payload_ref).await?)
    }
}
