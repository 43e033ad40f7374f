//! Data models for Lifeline.
//!
//! The central aggregate is [`EmergencyRecord`]: one per activation, logically
//! permanent, owning an append-only location history and an append-only media
//! asset log. Children ([`LocationSample`], [`MediaAsset`]) are immutable once
//! created and are never re-attached to a different record.
//!
//! Media payload bytes are **never** inlined into the queryable record; a
//! [`MediaAsset`] carries only an opaque `payload_ref` resolved through the
//! store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of samples retained in a record's location history.
///
/// The history is a ring: once full, the oldest sample is evicted so the
/// newest is always last. The latest sample is additionally mirrored in
/// [`EmergencyRecord::location`].
pub const LOCATION_HISTORY_CAP: usize = 100;

/// What triggered an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmergencyKind {
    /// The hold-to-confirm panic control.
    Panic,
    /// An explicit SOS initiated from a menu rather than the panic control.
    ManualSos,
    /// Raised after a configured period of user inactivity.
    Inactivity,
    /// Raised by an external distress signal (e.g. a paired wearable).
    Distress,
}

impl EmergencyKind {
    /// Stable string form used in SQLite and in alert bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            EmergencyKind::Panic => "panic",
            EmergencyKind::ManualSos => "manual-sos",
            EmergencyKind::Inactivity => "inactivity",
            EmergencyKind::Distress => "distress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "panic" => Some(EmergencyKind::Panic),
            "manual-sos" => Some(EmergencyKind::ManualSos),
            "inactivity" => Some(EmergencyKind::Inactivity),
            "distress" => Some(EmergencyKind::Distress),
            _ => None,
        }
    }
}

/// Lifecycle status of an [`EmergencyRecord`].
///
/// Transitions are monotonic: `active` is entered once at creation, and from
/// there exactly one of `resolved` or `cancelled` is reached, exactly once.
/// No record ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Active,
    Resolved,
    Cancelled,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Resolved => "resolved",
            RecordStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RecordStatus::Active),
            "resolved" => Some(RecordStatus::Resolved),
            "cancelled" => Some(RecordStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this status can never change again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordStatus::Active)
    }
}

/// One position fix. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    /// Horizontal accuracy radius in meters, when the source reports one.
    pub accuracy_m: Option<f64>,
    /// Reverse-geocoded address, when the source resolves one.
    pub address: Option<String>,
    /// Capture time as epoch milliseconds (server clock).
    pub captured_at_ms: i64,
}

/// Which device stream produced a media asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStream {
    Front,
    Rear,
    /// The continuous audio+video recording.
    Combined,
}

impl SourceStream {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStream::Front => "front",
            SourceStream::Rear => "rear",
            SourceStream::Combined => "combined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "front" => Some(SourceStream::Front),
            "rear" => Some(SourceStream::Rear),
            "combined" => Some(SourceStream::Combined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(MediaKind::Photo),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Metadata for one captured still or the finalized recording.
///
/// Immutable once created; deletable individually or en masse. The payload
/// bytes live behind `payload_ref` and are fetched separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: Uuid,
    pub kind: MediaKind,
    pub source: SourceStream,
    pub mime_type: String,
    pub byte_size: i64,
    pub captured_at_ms: i64,
    /// Opaque handle to the externally stored bytes.
    pub payload_ref: String,
}

impl MediaAsset {
    /// Build an asset for freshly captured bytes, minting its payload ref.
    pub fn for_capture(
        kind: MediaKind,
        source: SourceStream,
        mime_type: impl Into<String>,
        byte_size: usize,
        captured_at_ms: i64,
    ) -> Self {
        let id = Uuid::new_v4();
        MediaAsset {
            id,
            kind,
            source,
            mime_type: mime_type.into(),
            byte_size: byte_size as i64,
            captured_at_ms,
            payload_ref: format!("payload:{id}"),
        }
    }
}

/// An emergency contact, snapshotted from the user profile at activation time.
///
/// The pipeline never subscribes to later profile edits: the list read at
/// `activate` is the list alerted for the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
}

/// One emergency session. Created at activation, retained forever for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub kind: EmergencyKind,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    /// Latest known position, mirrored from the history tail.
    pub location: Option<LocationSample>,
    /// Capped ring of samples, newest-last. See [`LOCATION_HISTORY_CAP`].
    pub location_history: Vec<LocationSample>,
    /// Append-only, never reordered.
    pub media_assets: Vec<MediaAsset>,
    /// Ids of contacts successfully alerted for this record.
    pub contacts_notified: Vec<String>,
    /// True if any write for this record was absorbed by the in-memory
    /// fallback instead of the durable backend. Once true, stays true.
    pub served_by_fallback: bool,
    /// Set exactly once, on the transition to `resolved`.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EmergencyRecord {
    pub fn new(
        owner_id: impl Into<String>,
        kind: EmergencyKind,
        initial_location: Option<LocationSample>,
    ) -> Self {
        let mut record = EmergencyRecord {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            kind,
            status: RecordStatus::Active,
            created_at: Utc::now(),
            location: None,
            location_history: Vec::new(),
            media_assets: Vec::new(),
            contacts_notified: Vec::new(),
            served_by_fallback: false,
            resolved_at: None,
        };
        if let Some(sample) = initial_location {
            record.push_location(sample);
        }
        record
    }

    /// Append a sample, evicting the oldest once the ring is full, and mirror
    /// it as the latest location.
    pub fn push_location(&mut self, sample: LocationSample) {
        if self.location_history.len() >= LOCATION_HISTORY_CAP {
            self.location_history.remove(0);
        }
        self.location = Some(sample.clone());
        self.location_history.push(sample);
    }
}

/// Opaque handle returned by `activate` and threaded through every other call.
///
/// Carries enough identity for the store to adopt the record into the fallback
/// backend without a durable read; callers treat it as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHandle {
    pub(crate) id: Uuid,
    pub(crate) owner_id: String,
    pub(crate) kind: EmergencyKind,
    pub(crate) created_at: DateTime<Utc>,
}

impl RecordHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn kind(&self) -> EmergencyKind {
        self.kind
    }

    pub(crate) fn for_record(record: &EmergencyRecord) -> Self {
        RecordHandle {
            id: record.id,
            owner_id: record.owner_id.clone(),
            kind: record.kind,
            created_at: record.created_at,
        }
    }
}

// ============================================================================
// HTTP API types
// ============================================================================

/// Request body for POST /activate.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivateRequest {
    pub owner_id: String,
    pub kind: EmergencyKind,
}

/// Response for POST /activate and POST /hold/:id/release (when armed).
#[derive(Debug, Clone, Serialize)]
pub struct ActivateResponse {
    pub record_id: Uuid,
    pub status: RecordStatus,
    /// False means durably saved; true means the session lives in the
    /// in-memory fallback and is not yet confirmed.
    pub served_by_fallback: bool,
}

/// Request body for POST /hold.
#[derive(Debug, Clone, Deserialize)]
pub struct HoldRequest {
    pub owner_id: String,
    #[serde(default = "default_hold_kind")]
    pub kind: EmergencyKind,
}

fn default_hold_kind() -> EmergencyKind {
    EmergencyKind::Panic
}

/// Response for POST /hold.
#[derive(Debug, Clone, Serialize)]
pub struct HoldStartedResponse {
    pub session_id: Uuid,
    /// How long the control must be held before activation fires.
    pub window_ms: u64,
}

/// Response for GET /hold/:id.
#[derive(Debug, Clone, Serialize)]
pub struct HoldProgressResponse {
    pub session_id: Uuid,
    pub elapsed_ms: u64,
    /// 0.0..=1.0 fraction of the confirmation window elapsed.
    pub progress: f32,
    pub armed: bool,
}

/// Response for POST /hold/:id/release.
#[derive(Debug, Clone, Serialize)]
pub struct HoldReleaseResponse {
    /// True if the hold lasted the full window and an activation fired.
    pub activated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ActivateResponse>,
}

/// Query parameters for GET /records.
#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub owner_id: String,
    /// Optional status filter ("active", "resolved", "cancelled").
    pub status: Option<RecordStatus>,
    #[serde(default = "default_records_limit")]
    pub limit: u32,
}

fn default_records_limit() -> u32 {
    20
}

/// Compact row for GET /records (newest first).
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub id: Uuid,
    pub kind: EmergencyKind,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub location: Option<LocationSample>,
    pub media_count: usize,
    pub served_by_fallback: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl RecordSummary {
    pub fn from_record(record: &EmergencyRecord) -> Self {
        RecordSummary {
            id: record.id,
            kind: record.kind,
            status: record.status,
            created_at: record.created_at,
            location: record.location.clone(),
            media_count: record.media_assets.len(),
            served_by_fallback: record.served_by_fallback,
            resolved_at: record.resolved_at,
        }
    }
}

/// Response for GET /records.
#[derive(Debug, Clone, Serialize)]
pub struct RecordsResponse {
    pub records: Vec<RecordSummary>,
    /// True when the durable backend was unreachable and only fallback
    /// records are listed.
    pub fallback_only: bool,
}

/// Query parameters for DELETE /records/:id/media.
#[derive(Debug, Deserialize)]
pub struct DeleteMediaQuery {
    /// Delete one asset; omit to delete all media for the record.
    pub asset_id: Option<Uuid>,
}

/// Response for DELETE /records/:id/media.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteMediaResponse {
    pub deleted: usize,
}
