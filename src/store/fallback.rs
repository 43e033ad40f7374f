//! Bounded in-memory fallback backend.
//!
//! Absorbs writes whenever the durable backend is unreachable. This is an
//! availability smoothing mechanism, **not** a durability guarantee: contents
//! live only for the running process, capacity is capped per owner with the
//! oldest record evicted first, and every record held here carries
//! `served_by_fallback = true` so callers can surface "not yet confirmed
//! saved".
//!
//! Writers are serialized per record (each record sits behind its own mutex,
//! looked up through a short-lived registry lock), so two subsystems appending
//! to the same record never interleave partial writes while different records
//! mutate concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{EmergencyRecord, LocationSample, MediaAsset, RecordHandle, RecordStatus};

/// Default number of records retained per owner.
pub const DEFAULT_PER_OWNER_CAP: usize = 8;

type SharedRecord = Arc<Mutex<EmergencyRecord>>;

#[derive(Default)]
struct Registry {
    records: HashMap<Uuid, SharedRecord>,
    /// Insertion order per owner, oldest first, for eviction.
    by_owner: HashMap<String, VecDeque<Uuid>>,
    /// payload_ref -> (mime_type, bytes)
    payloads: HashMap<String, (String, Vec<u8>)>,
}

pub struct FallbackStore {
    registry: Mutex<Registry>,
    per_owner_cap: usize,
}

impl Default for FallbackStore {
    fn default() -> Self {
        Self::new(DEFAULT_PER_OWNER_CAP)
    }
}

impl FallbackStore {
    pub fn new(per_owner_cap: usize) -> Self {
        FallbackStore {
            registry: Mutex::new(Registry::default()),
            per_owner_cap: per_owner_cap.max(1),
        }
    }

    /// Whether this backend currently owns the record.
    pub fn owns(&self, record_id: Uuid) -> bool {
        self.registry.lock().unwrap().records.contains_key(&record_id)
    }

    /// Take ownership of a record, tagging it as fallback-served and evicting
    /// the owner's oldest record if the cap is reached.
    pub fn insert(&self, mut record: EmergencyRecord) {
        record.served_by_fallback = true;

        let mut guard = self.registry.lock().unwrap();
        let registry = &mut *guard;
        let order = registry
            .by_owner
            .entry(record.owner_id.clone())
            .or_default();
        while order.len() >= self.per_owner_cap {
            if let Some(evicted) = order.pop_front() {
                if let Some(old) = registry.records.remove(&evicted) {
                    let old = old.lock().unwrap();
                    for asset in &old.media_assets {
                        registry.payloads.remove(&asset.payload_ref);
                    }
                }
            }
        }
        order.push_back(record.id);
        registry
            .records
            .insert(record.id, Arc::new(Mutex::new(record)));
    }

    /// Adopt a record mid-session: the durable backend failed a write for a
    /// record it owned, so a fallback-served skeleton is built from the
    /// handle's identity. Idempotent.
    pub fn adopt(&self, handle: &RecordHandle) {
        if self.owns(handle.id()) {
            return;
        }
        let record = EmergencyRecord {
            id: handle.id(),
            owner_id: handle.owner_id().to_string(),
            kind: handle.kind(),
            status: RecordStatus::Active,
            created_at: handle.created_at,
            location: None,
            location_history: Vec::new(),
            media_assets: Vec::new(),
            contacts_notified: Vec::new(),
            served_by_fallback: true,
            resolved_at: None,
        };
        self.insert(record);
    }

    fn shared(&self, record_id: Uuid) -> Result<SharedRecord, StorageError> {
        self.registry
            .lock()
            .unwrap()
            .records
            .get(&record_id)
            .cloned()
            .ok_or(StorageError::NotFound(record_id))
    }

    pub fn get(&self, record_id: Uuid) -> Option<EmergencyRecord> {
        let shared = self.shared(record_id).ok()?;
        let record = shared.lock().unwrap();
        Some(record.clone())
    }

    pub fn append_location(
        &self,
        record_id: Uuid,
        sample: LocationSample,
    ) -> Result<(), StorageError> {
        let shared = self.shared(record_id)?;
        let mut record = shared.lock().unwrap();
        record.push_location(sample);
        Ok(())
    }

    pub fn append_media(
        &self,
        record_id: Uuid,
        asset: MediaAsset,
        payload: Vec<u8>,
    ) -> Result<(), StorageError> {
        let shared = self.shared(record_id)?;
        {
            let mut registry = self.registry.lock().unwrap();
            registry
                .payloads
                .insert(asset.payload_ref.clone(), (asset.mime_type.clone(), payload));
        }
        let mut record = shared.lock().unwrap();
        record.media_assets.push(asset);
        Ok(())
    }

    pub fn set_status(
        &self,
        record_id: Uuid,
        status: RecordStatus,
        resolved_at_ms: Option<i64>,
    ) -> Result<(), StorageError> {
        let shared = self.shared(record_id)?;
        let mut record = shared.lock().unwrap();
        if record.status.is_terminal() {
            return Err(StorageError::InvalidTransition(record_id));
        }
        record.status = status;
        record.resolved_at = resolved_at_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        Ok(())
    }

    pub fn mark_contacts_notified(
        &self,
        record_id: Uuid,
        contact_ids: &[String],
    ) -> Result<(), StorageError> {
        let shared = self.shared(record_id)?;
        let mut record = shared.lock().unwrap();
        for id in contact_ids {
            if !record.contacts_notified.contains(id) {
                record.contacts_notified.push(id.clone());
            }
        }
        Ok(())
    }

    pub fn delete_media(
        &self,
        record_id: Uuid,
        asset_id: Option<Uuid>,
    ) -> Result<usize, StorageError> {
        let shared = self.shared(record_id)?;
        let removed: Vec<MediaAsset> = {
            let mut record = shared.lock().unwrap();
            match asset_id {
                Some(asset_id) => {
                    let (kept, removed) = std::mem::take(&mut record.media_assets)
                        .into_iter()
                        .partition(|a| a.id != asset_id);
                    record.media_assets = kept;
                    removed
                }
                None => std::mem::take(&mut record.media_assets),
            }
        };

        let mut registry = self.registry.lock().unwrap();
        for asset in &removed {
            registry.payloads.remove(&asset.payload_ref);
        }
        Ok(removed.len())
    }

    /// Fallback-owned records for one owner, newest first.
    pub fn list_by_owner(
        &self,
        owner_id: &str,
        status: Option<RecordStatus>,
        limit: u32,
    ) -> Vec<EmergencyRecord> {
        let registry = self.registry.lock().unwrap();
        let Some(order) = registry.by_owner.get(owner_id) else {
            return Vec::new();
        };

        let mut records: Vec<EmergencyRecord> = order
            .iter()
            .filter_map(|id| registry.records.get(id))
            .map(|shared| shared.lock().unwrap().clone())
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit as usize);
        records
    }

    pub fn get_payload(&self, payload_ref: &str) -> Option<(String, Vec<u8>)> {
        self.registry
            .lock()
            .unwrap()
            .payloads
            .get(payload_ref)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EmergencyKind, MediaKind, SourceStream};

    fn sample(ts: i64) -> LocationSample {
        LocationSample {
            lat: 1.0,
            lng: 2.0,
            accuracy_m: None,
            address: None,
            captured_at_ms: ts,
        }
    }

    #[test]
    fn test_insert_tags_fallback() {
        let store = FallbackStore::default();
        let record = EmergencyRecord::new("traveler-1", EmergencyKind::Panic, None);
        let id = record.id;
        assert!(!record.served_by_fallback);

        store.insert(record);

        assert!(store.owns(id));
        assert!(store.get(id).unwrap().served_by_fallback);
    }

    #[test]
    fn test_per_owner_cap_evicts_oldest() {
        let store = FallbackStore::new(2);

        let first = EmergencyRecord::new("traveler-1", EmergencyKind::Panic, None);
        let first_id = first.id;
        store.insert(first);
        for _ in 0..2 {
            store.insert(EmergencyRecord::new("traveler-1", EmergencyKind::Panic, None));
        }

        assert!(!store.owns(first_id));
        assert_eq!(store.list_by_owner("traveler-1", None, 10).len(), 2);
    }

    #[test]
    fn test_eviction_drops_payloads() {
        let store = FallbackStore::new(1);

        let record = EmergencyRecord::new("traveler-1", EmergencyKind::Panic, None);
        let id = record.id;
        store.insert(record);
        let asset = MediaAsset::for_capture(MediaKind::Photo, SourceStream::Rear, "image/jpeg", 1, 1);
        let payload_ref = asset.payload_ref.clone();
        store.append_media(id, asset, vec![9]).unwrap();

        store.insert(EmergencyRecord::new("traveler-1", EmergencyKind::Panic, None));

        assert!(store.get_payload(&payload_ref).is_none());
    }

    #[test]
    fn test_set_status_terminal_guard() {
        let store = FallbackStore::default();
        let record = EmergencyRecord::new("traveler-1", EmergencyKind::Panic, None);
        let id = record.id;
        store.insert(record);

        store.set_status(id, RecordStatus::Cancelled, None).unwrap();
        let err = store
            .set_status(id, RecordStatus::Resolved, Some(1))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidTransition(_)));
        assert_eq!(store.get(id).unwrap().status, RecordStatus::Cancelled);
    }

    #[test]
    fn test_adopt_is_idempotent() {
        let store = FallbackStore::default();
        let record = EmergencyRecord::new("traveler-1", EmergencyKind::Distress, None);
        let handle = RecordHandle::for_record(&record);

        store.adopt(&handle);
        store.append_location(handle.id(), sample(1)).unwrap();
        store.adopt(&handle);

        // Second adopt must not wipe accumulated state.
        assert_eq!(store.get(handle.id()).unwrap().location_history.len(), 1);
    }

    #[test]
    fn test_delete_media_one_and_all() {
        let store = FallbackStore::default();
        let record = EmergencyRecord::new("traveler-1", EmergencyKind::Panic, None);
        let id = record.id;
        store.insert(record);

        let a = MediaAsset::for_capture(MediaKind::Photo, SourceStream::Rear, "image/jpeg", 1, 1);
        let b = MediaAsset::for_capture(MediaKind::Photo, SourceStream::Front, "image/jpeg", 1, 2);
        let a_id = a.id;
        store.append_media(id, a, vec![0]).unwrap();
        store.append_media(id, b, vec![0]).unwrap();

        assert_eq!(store.delete_media(id, Some(a_id)).unwrap(), 1);
        assert_eq!(store.delete_media(id, None).unwrap(), 1);
        assert!(store.get(id).unwrap().media_assets.is_empty());
    }
}
