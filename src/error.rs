//! Error taxonomy for the activation pipeline.
//!
//! Lifecycle errors ([`ActivationError::AlreadyActive`],
//! [`ActivationError::InvalidState`]) represent caller misuse and surface
//! synchronously. Subsystem-internal failures (one sample, one capture, one
//! delivery) are recovered locally by their owning loop and never appear here.
//! Storage only fails the caller when **both** backends are down
//! ([`StorageError::Unavailable`]).

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the activation controller.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// The owner already has a non-terminal record.
    #[error("an emergency session is already active for owner '{0}'")]
    AlreadyActive(String),

    /// The record is already in a terminal state; no side effects occurred.
    #[error("record {0} is already in a terminal state")]
    InvalidState(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the record store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The durable backend refused or failed an operation. Mutating paths
    /// absorb this into the fallback; it only escapes on read paths.
    #[error("durable backend error: {0}")]
    Durable(#[source] sqlx::Error),

    #[error("record {0} not found")]
    NotFound(Uuid),

    #[error("media payload '{0}' not found")]
    PayloadNotFound(String),

    /// A status write targeted a record that is already terminal.
    #[error("record {0} is already terminal")]
    InvalidTransition(Uuid),

    /// Both the durable backend and the fallback failed.
    #[error("storage unavailable: both durable and fallback backends failed")]
    Unavailable,
}

/// Errors from capture-source acquisition or a single capture.
///
/// Non-fatal by policy: the scheduler logs these and degrades.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("capture failed: {0}")]
    Failed(String),
}

/// Errors from the geolocation source.
#[derive(Debug, Error)]
pub enum PositionError {
    /// Permanent: permission denied. Surfaced once; the sampler keeps its
    /// timer and the controller decides whether to stop.
    #[error("position source permission denied")]
    Denied,

    /// Transient: this sample is skipped, the timer continues.
    #[error("position unavailable: {0}")]
    Unavailable(String),
}

/// A single contact delivery failure. Aggregated into counts, never raised
/// out of the fan-out.
#[derive(Debug, Error)]
#[error("delivery to contact '{contact_id}' failed: {reason}")]
pub struct DeliveryError {
    pub contact_id: String,
    pub reason: String,
}
