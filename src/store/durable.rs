//! SQLite backend for emergency records.
//!
//! Schema: `emergency_records` rows keyed by id, each owning an append-only
//! `location_samples` log and an append-only `media_assets` log. Payload bytes
//! live in `media_payloads`, keyed by the asset's opaque `payload_ref`, so the
//! queryable tables never inline media bytes.
//!
//! Every operation is fallible by contract: the durable backend is a network
//! resource from the pipeline's point of view, and callers (the routing layer
//! in [`crate::store`]) absorb failures into the fallback backend.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::error::StorageError;
use crate::model::{
    EmergencyKind, EmergencyRecord, LOCATION_HISTORY_CAP, LocationSample, MediaAsset, MediaKind,
    RecordStatus, SourceStream,
};

/// Database connection pool wrapper.
pub struct DurableStore {
    pool: SqlitePool,
    /// Fault-injection switch: when set, every operation refuses before
    /// touching the pool. Used by tests and availability drills.
    unavailable: AtomicBool,
}

impl DurableStore {
    /// Create a new durable store and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:lifeline.db?mode=rwc"
    ///   or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self {
            pool,
            unavailable: AtomicBool::new(false),
        };
        store.initialize_schema().await?;

        Ok(store)
    }

    /// Force the backend into (or out of) a refusing state.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Durable(sqlx::Error::PoolClosed))
        } else {
            Ok(())
        }
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS emergency_records (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                resolved_at INTEGER,
                contacts_notified TEXT NOT NULL DEFAULT '[]',
                contact_snapshot TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for newest-first listing per owner
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_records_owner_created
            ON emergency_records(owner_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS location_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                accuracy_m REAL,
                address TEXT,
                captured_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_samples_record
            ON location_samples(record_id, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_assets (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                record_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                captured_at INTEGER NOT NULL,
                payload_ref TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_assets_record
            ON media_assets(record_id, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_payloads (
                payload_ref TEXT PRIMARY KEY,
                bytes BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a freshly created record along with its contact snapshot.
    pub async fn insert_record(
        &self,
        record: &EmergencyRecord,
        contact_snapshot: &str,
    ) -> Result<(), StorageError> {
        self.guard()?;

        let contacts_notified = serde_json::to_string(&record.contacts_notified)
            .unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO emergency_records
                (id, owner_id, kind, status, created_at, resolved_at, contacts_notified, contact_snapshot)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.owner_id)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at.timestamp_millis())
        .bind(record.resolved_at.map(|t| t.timestamp_millis()))
        .bind(contacts_notified)
        .bind(contact_snapshot)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Durable)?;

        for sample in &record.location_history {
            self.append_location(record.id, sample).await?;
        }

        Ok(())
    }

    pub async fn append_location(
        &self,
        record_id: Uuid,
        sample: &LocationSample,
    ) -> Result<(), StorageError> {
        self.guard()?;

        sqlx::query(
            r#"
            INSERT INTO location_samples (record_id, lat, lng, accuracy_m, address, captured_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record_id.to_string())
        .bind(sample.lat)
        .bind(sample.lng)
        .bind(sample.accuracy_m)
        .bind(sample.address.as_deref())
        .bind(sample.captured_at_ms)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Durable)?;

        Ok(())
    }

    pub async fn append_media(
        &self,
        record_id: Uuid,
        asset: &MediaAsset,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        self.guard()?;

        sqlx::query(
            r#"
            INSERT INTO media_assets
                (id, record_id, kind, source, mime_type, byte_size, captured_at, payload_ref)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(asset.id.to_string())
        .bind(record_id.to_string())
        .bind(asset.kind.as_str())
        .bind(asset.source.as_str())
        .bind(&asset.mime_type)
        .bind(asset.byte_size)
        .bind(asset.captured_at_ms)
        .bind(&asset.payload_ref)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Durable)?;

        sqlx::query(
            r#"
            INSERT INTO media_payloads (payload_ref, bytes) VALUES (?, ?)
            "#,
        )
        .bind(&asset.payload_ref)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Durable)?;

        Ok(())
    }

    /// Conditionally move a record out of `active`.
    ///
    /// The WHERE clause is the commit point for racing resolve/cancel calls:
    /// exactly one update ever matches, the loser sees `InvalidTransition`.
    pub async fn set_status(
        &self,
        record_id: Uuid,
        status: RecordStatus,
        resolved_at_ms: Option<i64>,
    ) -> Result<(), StorageError> {
        self.guard()?;

        let result = sqlx::query(
            r#"
            UPDATE emergency_records
            SET status = ?, resolved_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(status.as_str())
        .bind(resolved_at_ms)
        .bind(record_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Durable)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM emergency_records WHERE id = ?")
                .bind(record_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::Durable)?;

            return match exists {
                Some(_) => Err(StorageError::InvalidTransition(record_id)),
                None => Err(StorageError::NotFound(record_id)),
            };
        }

        Ok(())
    }

    /// Merge newly alerted contact ids into the record's notified set.
    pub async fn mark_contacts_notified(
        &self,
        record_id: Uuid,
        contact_ids: &[String],
    ) -> Result<(), StorageError> {
        self.guard()?;

        let row = sqlx::query("SELECT contacts_notified FROM emergency_records WHERE id = ?")
            .bind(record_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::Durable)?
            .ok_or(StorageError::NotFound(record_id))?;

        let raw: String = row.get("contacts_notified");
        let mut notified: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
        for id in contact_ids {
            if !notified.contains(id) {
                notified.push(id.clone());
            }
        }

        sqlx::query("UPDATE emergency_records SET contacts_notified = ? WHERE id = ?")
            .bind(serde_json::to_string(&notified).unwrap_or_else(|_| "[]".to_string()))
            .bind(record_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StorageError::Durable)?;

        Ok(())
    }

    /// Delete one asset (and its payload), or all assets for the record.
    ///
    /// Returns the number of assets deleted.
    pub async fn delete_media(
        &self,
        record_id: Uuid,
        asset_id: Option<Uuid>,
    ) -> Result<usize, StorageError> {
        self.guard()?;

        match asset_id {
            Some(asset_id) => {
                sqlx::query(
                    r#"
                    DELETE FROM media_payloads WHERE payload_ref IN (
                        SELECT payload_ref FROM media_assets WHERE record_id = ? AND id = ?
                    )
                    "#,
                )
                .bind(record_id.to_string())
                .bind(asset_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(StorageError::Durable)?;

                let result = sqlx::query("DELETE FROM media_assets WHERE record_id = ? AND id = ?")
                    .bind(record_id.to_string())
                    .bind(asset_id.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(StorageError::Durable)?;

                Ok(result.rows_affected() as usize)
            }
            None => {
                sqlx::query(
                    r#"
                    DELETE FROM media_payloads WHERE payload_ref IN (
                        SELECT payload_ref FROM media_assets WHERE record_id = ?
                    )
                    "#,
                )
                .bind(record_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(StorageError::Durable)?;

                let result = sqlx::query("DELETE FROM media_assets WHERE record_id = ?")
                    .bind(record_id.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(StorageError::Durable)?;

                Ok(result.rows_affected() as usize)
            }
        }
    }

    /// Fetch a record's full aggregate: row + capped sample history + assets.
    pub async fn get_record(&self, record_id: Uuid) -> Result<EmergencyRecord, StorageError> {
        self.guard()?;

        let row = sqlx::query(
            r#"
            SELECT id, owner_id, kind, status, created_at, resolved_at, contacts_notified
            FROM emergency_records
            WHERE id = ?
            "#,
        )
        .bind(record_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Durable)?
        .ok_or(StorageError::NotFound(record_id))?;

        let mut record = Self::record_from_row(&row)?;
        record.location_history = self.load_samples(record_id).await?;
        record.location = record.location_history.last().cloned();
        record.media_assets = self.load_assets(record_id).await?;

        Ok(record)
    }

    /// List a single owner's records, newest first.
    pub async fn list_by_owner(
        &self,
        owner_id: &str,
        status: Option<RecordStatus>,
        limit: u32,
    ) -> Result<Vec<EmergencyRecord>, StorageError> {
        self.guard()?;

        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT id FROM emergency_records
                    WHERE owner_id = ? AND status = ?
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(owner_id)
                .bind(status.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id FROM emergency_records
                    WHERE owner_id = ?
                    ORDER BY created_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(owner_id)
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(StorageError::Durable)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let id = parse_uuid(&id)?;
            records.push(self.get_record(id).await?);
        }

        Ok(records)
    }

    /// Fetch payload bytes and their mime type by payload ref.
    pub async fn get_payload(&self, payload_ref: &str) -> Result<(String, Vec<u8>), StorageError> {
        self.guard()?;

        let row = sqlx::query(
            r#"
            SELECT a.mime_type AS mime_type, p.bytes AS bytes
            FROM media_payloads p
            JOIN media_assets a ON a.payload_ref = p.payload_ref
            WHERE p.payload_ref = ?
            "#,
        )
        .bind(payload_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Durable)?
        .ok_or_else(|| StorageError::PayloadNotFound(payload_ref.to_string()))?;

        Ok((row.get("mime_type"), row.get("bytes")))
    }

    async fn load_samples(&self, record_id: Uuid) -> Result<Vec<LocationSample>, StorageError> {
        // Newest-last window of the capped ring: take the last N by insert order.
        let rows = sqlx::query(
            r#"
            SELECT lat, lng, accuracy_m, address, captured_at
            FROM (
                SELECT id, lat, lng, accuracy_m, address, captured_at
                FROM location_samples
                WHERE record_id = ?
                ORDER BY id DESC
                LIMIT ?
            )
            ORDER BY id ASC
            "#,
        )
        .bind(record_id.to_string())
        .bind(LOCATION_HISTORY_CAP as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Durable)?;

        Ok(rows
            .iter()
            .map(|row| LocationSample {
                lat: row.get("lat"),
                lng: row.get("lng"),
                accuracy_m: row.get("accuracy_m"),
                address: row.get("address"),
                captured_at_ms: row.get("captured_at"),
            })
            .collect())
    }

    async fn load_assets(&self, record_id: Uuid) -> Result<Vec<MediaAsset>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, source, mime_type, byte_size, captured_at, payload_ref
            FROM media_assets
            WHERE record_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(record_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Durable)?;

        let mut assets = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let kind: String = row.get("kind");
            let source: String = row.get("source");
            assets.push(MediaAsset {
                id: parse_uuid(&id)?,
                kind: MediaKind::parse(&kind).unwrap_or(MediaKind::Photo),
                source: SourceStream::parse(&source).unwrap_or(SourceStream::Rear),
                mime_type: row.get("mime_type"),
                byte_size: row.get("byte_size"),
                captured_at_ms: row.get("captured_at"),
                payload_ref: row.get("payload_ref"),
            });
        }

        Ok(assets)
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EmergencyRecord, StorageError> {
        let id: String = row.get("id");
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        let created_at: i64 = row.get("created_at");
        let resolved_at: Option<i64> = row.get("resolved_at");
        let notified_raw: String = row.get("contacts_notified");

        Ok(EmergencyRecord {
            id: parse_uuid(&id)?,
            owner_id: row.get("owner_id"),
            kind: EmergencyKind::parse(&kind).unwrap_or(EmergencyKind::Panic),
            status: RecordStatus::parse(&status).unwrap_or(RecordStatus::Active),
            created_at: Utc
                .timestamp_millis_opt(created_at)
                .single()
                .unwrap_or_else(Utc::now),
            location: None,
            location_history: Vec::new(),
            media_assets: Vec::new(),
            contacts_notified: serde_json::from_str(&notified_raw).unwrap_or_default(),
            served_by_fallback: false,
            resolved_at: resolved_at.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|_| StorageError::Durable(sqlx::Error::RowNotFound))
}
