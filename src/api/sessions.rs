/// Session administration REST API endpoints
///
/// Lets operators open and close storage sessions, inspect their checkpoints and peek
/// at checkpoint contents. Workflow steps themselves use the library API directly.

use crate::{
    error::StorageError,
    model::{DataModel, Tuple},
    session::SessionRegistry,
    storage::{CheckpointSummary, StorageManager, TypePreview},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Upper bound for rows returned by one preview request
const MAX_PREVIEW_ROWS: usize = 1_000;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Live storage sessions
    pub registry: Arc<SessionRegistry>,
    /// Page size for relational previews
    pub page_size: usize,
}

/// Request body for opening a session
#[derive(Debug, Default, Deserialize)]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub default_stores: HashMap<DataModel, String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub message: String,
}

/// Details of one live session
#[derive(Debug, Serialize)]
pub struct SessionDetails {
    pub session_id: Uuid,
    pub namespaces: Vec<String>,
    pub default_stores: HashMap<DataModel, String>,
    pub checkpoints: Vec<CheckpointSummary>,
}

#[derive(Debug, Deserialize)]
pub struct RowsQuery {
    pub limit: Option<usize>,
}

/// Create session management routes
pub fn create_session_routes() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", post(open_session))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}", delete(close_session))
        .route("/api/sessions/{id}/activities/{activity}", get(preview_activity))
        .route("/api/sessions/{id}/activities/{activity}", delete(drop_activity))
        .route("/api/sessions/{id}/activities/{activity}/outputs/{output}/rows", get(checkpoint_rows))
        .route("/api/manifest/sessions", get(manifest_sessions))
}

/// HTTP status for a storage failure
fn status_of(error: &StorageError) -> StatusCode {
    match error.root() {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::InvalidArgument(_)
        | StorageError::TypeMismatch { .. }
        | StorageError::Parse(_)
        | StorageError::Validation(_) => StatusCode::BAD_REQUEST,
        StorageError::IllegalState(_) | StorageError::Deadlock { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn lookup(state: &AppState, id: &Uuid) -> Result<Arc<StorageManager>, StatusCode> {
    state.registry.get(id).ok_or(StatusCode::NOT_FOUND)
}

/// Open a new storage session
///
/// POST /api/sessions
/// Body: { "default_stores": { "relational": "memory" } }
async fn open_session(
    State(state): State<AppState>,
    Json(payload): Json<OpenSessionRequest>,
) -> Result<Json<SessionResponse>, StatusCode> {
    match state.registry.open_session(payload.default_stores).await {
        Ok(manager) => {
            tracing::info!("🔥 Opened session {}", manager.session_id());
            Ok(Json(SessionResponse {
                session_id: manager.session_id(),
                message: "Session opened successfully".to_string(),
            }))
        }
        Err(e) => {
            tracing::error!("Failed to open session: {}", e);
            match e.downcast_ref::<StorageError>() {
                Some(storage) => Err(status_of(storage)),
                None => Err(StatusCode::INTERNAL_SERVER_ERROR),
            }
        }
    }
}

/// List live session ids
///
/// GET /api/sessions
async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "sessions": state.registry.list_session_ids() }))
}

/// GET /api/sessions/{id}
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionDetails>, StatusCode> {
    let manager = lookup(&state, &id)?;
    let default_stores = DataModel::ALL
        .into_iter()
        .map(|model| (model, manager.default_store(model)))
        .collect();
    Ok(Json(SessionDetails {
        session_id: id,
        namespaces: manager.registered_namespaces(),
        default_stores,
        checkpoints: manager.checkpoints(),
    }))
}

/// Close a session and drop all of its checkpoints
///
/// DELETE /api/sessions/{id}
async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, StatusCode> {
    match state.registry.close_session(&id).await {
        Ok(true) => Ok(Json(SessionResponse {
            session_id: id,
            message: "Session closed successfully".to_string(),
        })),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to close session {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Type previews of every output of an activity
///
/// GET /api/sessions/{id}/activities/{activity}
async fn preview_activity(
    State(state): State<AppState>,
    Path((id, activity)): Path<(Uuid, Uuid)>,
) -> Result<Json<Vec<Option<TypePreview>>>, StatusCode> {
    let manager = lookup(&state, &id)?;
    Ok(Json(manager.checkpoint_preview_types(activity)))
}

/// DELETE /api/sessions/{id}/activities/{activity}
async fn drop_activity(
    State(state): State<AppState>,
    Path((id, activity)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, StatusCode> {
    let manager = lookup(&state, &id)?;
    match manager.drop_checkpoints(activity).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tracing::error!("Failed to drop checkpoints of {}: {}", activity, e);
            Err(status_of(&e))
        }
    }
}

/// First rows of a checkpoint
///
/// GET /api/sessions/{id}/activities/{activity}/outputs/{output}/rows?limit=100
async fn checkpoint_rows(
    State(state): State<AppState>,
    Path((id, activity, output)): Path<(Uuid, Uuid, usize)>,
    Query(query): Query<RowsQuery>,
) -> Result<Json<Vec<Tuple>>, StatusCode> {
    let manager = lookup(&state, &id)?;
    let limit = query.limit.unwrap_or(100).min(MAX_PREVIEW_ROWS);

    let reader = manager.read_checkpoint(activity, output).await.map_err(|e| {
        tracing::error!("Failed to open checkpoint {}/{}: {}", activity, output, e);
        status_of(&e)
    })?;
    let stream = match reader.as_rel() {
        Ok(rel) => rel.iter_batched(state.page_size.min(limit).max(1)),
        Err(_) => reader.iter().await,
    };
    let rows = match stream {
        Ok(stream) => stream.take(limit).try_collect::<Vec<Tuple>>().await,
        Err(e) => Err(e),
    };
    if let Err(e) = reader.close().await {
        tracing::warn!("Failed to close reader of {}/{}: {}", activity, output, e);
    }

    rows.map(Json).map_err(|e| {
        tracing::error!("Failed to read checkpoint {}/{}: {}", activity, output, e);
        status_of(&e)
    })
}

/// Sessions recorded in the manifest, including closed ones
///
/// GET /api/manifest/sessions
async fn manifest_sessions(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let Some(manifest) = state.registry.manifest() else {
        return Ok(Json(json!({ "sessions": [] })));
    };
    match manifest.sessions().await {
        Ok(sessions) => Ok(Json(json!({ "sessions": sessions }))),
        Err(e) => {
            tracing::error!("Failed to list manifest sessions: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
