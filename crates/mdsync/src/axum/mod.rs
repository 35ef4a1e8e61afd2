use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::DocumentRegistry;
use crate::storage::{EditorRecord, MetadataStore};
use crate::{SyncError, SyncResult};

pub mod handler;

pub use handler::WebSocketHandler;

/// Axum state wrapper around the document registry
#[derive(Clone)]
pub struct EditorState {
    registry: Arc<DocumentRegistry>,
}

impl EditorState {
    pub fn new(registry: Arc<DocumentRegistry>) -> Self {
        Self { registry }
    }

    /// Get the document registry
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    fn metadata(&self) -> &dyn MetadataStore {
        self.registry.services().metadata.as_ref()
    }

    async fn require_editor(&self, editor_id: &str) -> SyncResult<()> {
        if self.metadata().editor_exists(editor_id).await? {
            Ok(())
        } else {
            Err(SyncError::DocumentNotFound {
                id: editor_id.to_string(),
            })
        }
    }
}

/// Create a router exposing the editor endpoints
pub fn router(registry: Arc<DocumentRegistry>) -> Router {
    router_with_state(EditorState::new(registry))
}

/// Create a router from an existing [`EditorState`]
pub fn router_with_state(state: EditorState) -> Router {
    Router::new()
        .route("/editors", post(create_editor))
        .route("/editors/{id}", delete(delete_editor))
        .route("/editors/{id}/doc", get(snapshot_handler))
        .route("/editors/{id}/ws", get(websocket_handler))
        .with_state(state)
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = match &self {
            SyncError::DocumentNotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::Protocol { .. } | SyncError::Replica(_) | SyncError::InvalidKey(_) => {
                StatusCode::BAD_REQUEST
            }
            SyncError::ActorStopped { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}

/// WebSocket handler endpoint
async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(editor_id): Path<String>,
    State(state): State<EditorState>,
) -> SyncResult<Response> {
    state.require_editor(&editor_id).await?;
    Ok(ws.on_upgrade(move |socket| WebSocketHandler::new(socket, state, editor_id).handle()))
}

async fn snapshot_handler(
    Path(editor_id): Path<String>,
    State(state): State<EditorState>,
) -> SyncResult<Response> {
    state.require_editor(&editor_id).await?;
    let snapshot = state.registry.snapshot(&editor_id).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        snapshot,
    )
        .into_response())
}

async fn create_editor(
    State(state): State<EditorState>,
) -> SyncResult<(StatusCode, Json<EditorRecord>)> {
    let editor_id = Uuid::new_v4().to_string();
    let record = state.metadata().create_editor(&editor_id).await?;
    // a reused id must not inherit stale state
    state.registry.reset(&editor_id).await?;

    info!("Created editor '{}'", editor_id);
    Ok((StatusCode::CREATED, Json(record)))
}

async fn delete_editor(
    Path(editor_id): Path<String>,
    State(state): State<EditorState>,
) -> SyncResult<StatusCode> {
    if !state.metadata().delete_editor(&editor_id).await? {
        return Err(SyncError::DocumentNotFound { id: editor_id });
    }
    state.registry.purge(&editor_id).await?;

    info!("Deleted editor '{}'", editor_id);
    Ok(StatusCode::NO_CONTENT)
}
