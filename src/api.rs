//! HTTP API handlers for Lifeline.
//!
//! The presentation layer talks only to the
//! [`EmergencyActivationController`]; these handlers are thin adapters that
//! map its results onto status codes:
//!
//! - `AlreadyActive` / `InvalidState` → 409 (caller misuse, surfaced loudly)
//! - unknown record or asset → 404
//! - both storage backends down → 503
//!
//! Fallback-served data is never hidden: record payloads carry
//! `served_by_fallback`, and listings carry `fallback_only`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::controller::{EmergencyActivationController, HoldOutcome};
use crate::error::{ActivationError, StorageError};
use crate::model::{
    ActivateRequest, ActivateResponse, DeleteMediaQuery, DeleteMediaResponse, EmergencyRecord,
    HoldProgressResponse, HoldReleaseResponse, HoldRequest, HoldStartedResponse, LocationSample,
    RecordSummary, RecordsQuery, RecordsResponse,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<EmergencyActivationController>,
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/activate", post(post_activate))
        .route("/hold", post(post_hold))
        .route("/hold/:id", get(get_hold))
        .route("/hold/:id/release", post(post_hold_release))
        .route("/records", get(get_records))
        .route("/records/:id", get(get_record))
        .route("/records/:id/resolve", post(post_resolve))
        .route("/records/:id/cancel", post(post_cancel))
        .route("/records/:id/location/latest", get(get_latest_location))
        .route("/records/:id/assets/:asset_id", get(get_asset))
        .route("/records/:id/media", delete(delete_media))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(err: &ActivationError) -> StatusCode {
    match err {
        ActivationError::AlreadyActive(_) | ActivationError::InvalidState(_) => {
            StatusCode::CONFLICT
        }
        ActivationError::Storage(StorageError::NotFound(_))
        | ActivationError::Storage(StorageError::PayloadNotFound(_)) => StatusCode::NOT_FOUND,
        ActivationError::Storage(StorageError::InvalidTransition(_)) => StatusCode::CONFLICT,
        ActivationError::Storage(StorageError::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
        ActivationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn activate_response(record: &EmergencyRecord) -> ActivateResponse {
    ActivateResponse {
        record_id: record.id,
        status: record.status,
        served_by_fallback: record.served_by_fallback,
    }
}

/// POST /activate - Begin an emergency session without the hold gesture
/// (manual SOS, inactivity and distress triggers).
#[instrument(skip(state, request), fields(owner_id = %request.owner_id))]
pub async fn post_activate(
    State(state): State<AppState>,
    Json(request): Json<ActivateRequest>,
) -> Result<(StatusCode, Json<ActivateResponse>), StatusCode> {
    match state
        .controller
        .activate(&request.owner_id, request.kind)
        .await
    {
        Ok(handle) => {
            let record = state
                .controller
                .record(handle.id())
                .await
                .map_err(|e| status_for(&e))?;
            info!(
                record_id = %record.id,
                served_by_fallback = record.served_by_fallback,
                "Activation accepted"
            );
            Ok((StatusCode::CREATED, Json(activate_response(&record))))
        }
        Err(e) => {
            warn!(owner_id = %request.owner_id, error = %e, "Activation rejected");
            Err(status_for(&e))
        }
    }
}

/// POST /hold - Start the hold-to-confirm gesture.
#[instrument(skip(state, request), fields(owner_id = %request.owner_id))]
pub async fn post_hold(
    State(state): State<AppState>,
    Json(request): Json<HoldRequest>,
) -> (StatusCode, Json<HoldStartedResponse>) {
    let session = state.controller.arm_hold(&request.owner_id, request.kind);
    (
        StatusCode::CREATED,
        Json(HoldStartedResponse {
            session_id: session.id,
            window_ms: session.window().as_millis() as u64,
        }),
    )
}

/// GET /hold/:id - Hold progress for UI feedback.
pub async fn get_hold(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<HoldProgressResponse>, StatusCode> {
    let session = state
        .controller
        .hold_progress(session_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(HoldProgressResponse {
        session_id,
        elapsed_ms: session.elapsed().as_millis() as u64,
        progress: session.progress(),
        armed: session.is_armed(),
    }))
}

/// POST /hold/:id/release - Release the control. Held for the full window:
/// activates. Released early: no record, no error.
#[instrument(skip(state))]
pub async fn post_hold_release(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<HoldReleaseResponse>, StatusCode> {
    match state.controller.release_hold(session_id).await {
        Ok(HoldOutcome::Armed(handle)) => {
            let record = state
                .controller
                .record(handle.id())
                .await
                .map_err(|e| status_for(&e))?;
            Ok(Json(HoldReleaseResponse {
                activated: true,
                record: Some(activate_response(&record)),
            }))
        }
        Ok(HoldOutcome::Released) => Ok(Json(HoldReleaseResponse {
            activated: false,
            record: None,
        })),
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Hold release failed");
            Err(status_for(&e))
        }
    }
}

async fn terminate(
    state: &AppState,
    record_id: Uuid,
    cancel: bool,
) -> Result<StatusCode, StatusCode> {
    let handle = state
        .controller
        .handle_for(record_id)
        .await
        .map_err(|e| status_for(&e))?;

    let result = if cancel {
        state.controller.cancel(&handle).await
    } else {
        state.controller.resolve(&handle).await
    };

    match result {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) => {
            warn!(record_id = %record_id, error = %e, "Terminal transition rejected");
            Err(status_for(&e))
        }
    }
}

/// POST /records/:id/resolve - End the session as resolved.
#[instrument(skip(state))]
pub async fn post_resolve(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    terminate(&state, record_id, false).await
}

/// POST /records/:id/cancel - End the session as cancelled (accidental
/// activation).
#[instrument(skip(state))]
pub async fn post_cancel(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    terminate(&state, record_id, true).await
}

/// GET /records - One owner's records, newest first.
#[instrument(skip(state, query), fields(owner_id = %query.owner_id))]
pub async fn get_records(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse>, StatusCode> {
    match state
        .controller
        .records_for(&query.owner_id, query.status, query.limit)
        .await
    {
        Ok((records, fallback_only)) => {
            info!(
                owner_id = %query.owner_id,
                count = records.len(),
                fallback_only,
                "Records listed"
            );
            Ok(Json(RecordsResponse {
                records: records.iter().map(RecordSummary::from_record).collect(),
                fallback_only,
            }))
        }
        Err(e) => {
            warn!(owner_id = %query.owner_id, error = %e, "Record listing failed");
            Err(status_for(&e))
        }
    }
}

/// GET /records/:id - Full record aggregate.
#[instrument(skip(state))]
pub async fn get_record(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<Json<EmergencyRecord>, StatusCode> {
    state
        .controller
        .record(record_id)
        .await
        .map(Json)
        .map_err(|e| status_for(&e))
}

/// GET /records/:id/location/latest - Best-effort latest position.
pub async fn get_latest_location(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<Json<LocationSample>, StatusCode> {
    state
        .controller
        .latest_location(record_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /records/:id/assets/:asset_id - Raw payload bytes for one asset.
#[instrument(skip(state))]
pub async fn get_asset(
    State(state): State<AppState>,
    Path((record_id, asset_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, StatusCode> {
    match state.controller.asset_payload(record_id, asset_id).await {
        Ok((mime_type, bytes)) => Ok(([(header::CONTENT_TYPE, mime_type)], bytes)),
        Err(e) => Err(status_for(&e)),
    }
}

/// DELETE /records/:id/media - Delete one asset (`?asset_id=`) or all media
/// for the record.
#[instrument(skip(state))]
pub async fn delete_media(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    Query(query): Query<DeleteMediaQuery>,
) -> Result<Json<DeleteMediaResponse>, StatusCode> {
    match state
        .controller
        .delete_media(record_id, query.asset_id)
        .await
    {
        Ok(deleted) => {
            info!(record_id = %record_id, deleted, "Media deleted");
            Ok(Json(DeleteMediaResponse { deleted }))
        }
        Err(e) => {
            warn!(record_id = %record_id, error = %e, "Media deletion failed");
            Err(status_for(&e))
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
