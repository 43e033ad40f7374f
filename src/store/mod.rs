//! Record store: durable SQLite backend with a bounded in-memory fallback.
//!
//! Every mutating operation funnels through one routing helper
//! ([`RecordStore::apply`]): if the fallback already owns the record the write
//! goes there, otherwise the durable backend is attempted and any
//! infrastructure failure is absorbed by adopting the record into the fallback
//! and tagging it `served_by_fallback`. Once a record falls back, **all**
//! subsequent reads and writes for it are served by the fallback until process
//! restart, so a record's fields never split across backends.
//!
//! Domain errors (unknown record, invalid status transition) are never
//! absorbed; they propagate to the caller from whichever backend raised them.

mod durable;
mod fallback;

pub use durable::DurableStore;
pub use fallback::{DEFAULT_PER_OWNER_CAP, FallbackStore};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{
    Contact, EmergencyKind, EmergencyRecord, LocationSample, MediaAsset, RecordHandle,
    RecordStatus,
};

/// One write against a record, routed as a unit.
enum Mutation {
    AppendLocation(LocationSample),
    AppendMedia { asset: MediaAsset, payload: Vec<u8> },
    SetStatus {
        status: RecordStatus,
        resolved_at_ms: Option<i64>,
    },
    MarkNotified(Vec<String>),
}

impl Mutation {
    fn name(&self) -> &'static str {
        match self {
            Mutation::AppendLocation(_) => "append_location",
            Mutation::AppendMedia { .. } => "append_media",
            Mutation::SetStatus { .. } => "set_status",
            Mutation::MarkNotified(_) => "mark_contacts_notified",
        }
    }
}

pub struct RecordStore {
    durable: DurableStore,
    fallback: FallbackStore,
}

impl RecordStore {
    pub fn new(durable: DurableStore, fallback: FallbackStore) -> Self {
        RecordStore { durable, fallback }
    }

    /// Convenience constructor with a default-capacity fallback.
    pub async fn open(database_url: &str) -> anyhow::Result<Self> {
        Ok(RecordStore::new(
            DurableStore::new(database_url).await?,
            FallbackStore::default(),
        ))
    }

    /// Flip the durable backend into (or out of) a refusing state.
    ///
    /// Exists for the availability tests and outage drills; production code
    /// never calls it.
    pub fn force_durable_outage(&self, down: bool) {
        self.durable.set_unavailable(down);
    }

    /// Create a record for a fresh activation.
    ///
    /// Never fails the caller on durable unavailability alone: the write is
    /// absorbed by the fallback and the record comes back tagged.
    pub async fn create(
        &self,
        owner_id: &str,
        kind: EmergencyKind,
        initial_location: Option<LocationSample>,
        contact_snapshot: &[Contact],
    ) -> Result<RecordHandle, StorageError> {
        let record = EmergencyRecord::new(owner_id, kind, initial_location);
        let handle = RecordHandle::for_record(&record);
        let snapshot_json =
            serde_json::to_string(contact_snapshot).unwrap_or_else(|_| "[]".to_string());

        match self.durable.insert_record(&record, &snapshot_json).await {
            Ok(()) => Ok(handle),
            Err(StorageError::Durable(e)) => {
                warn!(
                    record_id = %record.id,
                    error = %e,
                    "Durable backend rejected create; absorbing into fallback"
                );
                self.fallback.insert(record);
                Ok(handle)
            }
            Err(e) => Err(e),
        }
    }

    /// Route one mutation: fallback if the record already lives there,
    /// otherwise durable-then-fallback with adoption on infrastructure errors.
    async fn apply(&self, handle: &RecordHandle, mutation: Mutation) -> Result<(), StorageError> {
        let id = handle.id();

        if self.fallback.owns(id) {
            return self.apply_fallback(id, mutation);
        }

        let attempt = match &mutation {
            Mutation::AppendLocation(sample) => self.durable.append_location(id, sample).await,
            Mutation::AppendMedia { asset, payload } => {
                self.durable.append_media(id, asset, payload).await
            }
            Mutation::SetStatus {
                status,
                resolved_at_ms,
            } => self.durable.set_status(id, *status, *resolved_at_ms).await,
            Mutation::MarkNotified(contact_ids) => {
                self.durable.mark_contacts_notified(id, contact_ids).await
            }
        };

        match attempt {
            Ok(()) => Ok(()),
            Err(StorageError::Durable(e)) => {
                warn!(
                    record_id = %id,
                    op = mutation.name(),
                    error = %e,
                    "Durable backend failed; record adopted by fallback"
                );
                self.fallback.adopt(handle);
                self.apply_fallback(id, mutation)
            }
            // Domain errors (terminal record, unknown id) are the caller's.
            Err(e) => Err(e),
        }
    }

    fn apply_fallback(&self, id: Uuid, mutation: Mutation) -> Result<(), StorageError> {
        match mutation {
            Mutation::AppendLocation(sample) => self.fallback.append_location(id, sample),
            Mutation::AppendMedia { asset, payload } => {
                self.fallback.append_media(id, asset, payload)
            }
            Mutation::SetStatus {
                status,
                resolved_at_ms,
            } => self.fallback.set_status(id, status, resolved_at_ms),
            Mutation::MarkNotified(contact_ids) => {
                self.fallback.mark_contacts_notified(id, &contact_ids)
            }
        }
    }

    pub async fn append_location(
        &self,
        handle: &RecordHandle,
        sample: LocationSample,
    ) -> Result<(), StorageError> {
        self.apply(handle, Mutation::AppendLocation(sample)).await
    }

    pub async fn append_media(
        &self,
        handle: &RecordHandle,
        asset: MediaAsset,
        payload: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.apply(handle, Mutation::AppendMedia { asset, payload })
            .await
    }

    /// Commit a terminal transition. `resolved_at` is stamped only for
    /// `resolved`; the first committer wins and the loser observes
    /// [`StorageError::InvalidTransition`].
    pub async fn set_status(
        &self,
        handle: &RecordHandle,
        status: RecordStatus,
    ) -> Result<(), StorageError> {
        let resolved_at_ms = matches!(status, RecordStatus::Resolved)
            .then(|| Utc::now().timestamp_millis());
        self.apply(
            handle,
            Mutation::SetStatus {
                status,
                resolved_at_ms,
            },
        )
        .await
    }

    pub async fn mark_contacts_notified(
        &self,
        handle: &RecordHandle,
        contact_ids: Vec<String>,
    ) -> Result<(), StorageError> {
        if contact_ids.is_empty() {
            return Ok(());
        }
        self.apply(handle, Mutation::MarkNotified(contact_ids)).await
    }

    /// Read a record from whichever backend currently owns it.
    pub async fn get(&self, record_id: Uuid) -> Result<EmergencyRecord, StorageError> {
        if let Some(record) = self.fallback.get(record_id) {
            return Ok(record);
        }

        match self.durable.get_record(record_id).await {
            Ok(record) => Ok(record),
            Err(StorageError::Durable(e)) => {
                warn!(record_id = %record_id, error = %e, "Durable read failed with no fallback copy");
                Err(StorageError::Unavailable)
            }
            Err(e) => Err(e),
        }
    }

    /// One owner's records, newest first.
    ///
    /// Healthy path: durable rows merged with fallback-owned copies (the
    /// fallback copy shadows any stale durable row for the same id, keeping
    /// the `served_by_fallback` tag visible). Durable outage: fallback-only,
    /// with the second tuple element set so callers can say so.
    pub async fn list_by_owner(
        &self,
        owner_id: &str,
        status: Option<RecordStatus>,
        limit: u32,
    ) -> Result<(Vec<EmergencyRecord>, bool), StorageError> {
        let fallback_records = self.fallback.list_by_owner(owner_id, status, limit);

        match self.durable.list_by_owner(owner_id, status, limit).await {
            Ok(durable_records) => {
                let mut merged: Vec<EmergencyRecord> = durable_records
                    .into_iter()
                    .filter(|r| !self.fallback.owns(r.id))
                    .collect();
                merged.extend(fallback_records);
                merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                merged.truncate(limit as usize);
                Ok((merged, false))
            }
            Err(StorageError::Durable(e)) => {
                warn!(
                    owner_id = %owner_id,
                    error = %e,
                    "Durable list failed; returning fallback records only"
                );
                Ok((fallback_records, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete one asset, or all of a record's media when `asset_id` is none.
    pub async fn delete_media(
        &self,
        record_id: Uuid,
        asset_id: Option<Uuid>,
    ) -> Result<usize, StorageError> {
        if self.fallback.owns(record_id) {
            return self.fallback.delete_media(record_id, asset_id);
        }
        self.durable.delete_media(record_id, asset_id).await
    }

    /// Resolve a payload ref to (mime type, bytes).
    pub async fn get_payload(&self, payload_ref: &str) -> Result<(String, Vec<u8>), StorageError> {
        if let Some(found) = self.fallback.get_payload(payload_ref) {
            return Ok(found);
        }
        self.durable.get_payload(payload_ref).await
    }
}
