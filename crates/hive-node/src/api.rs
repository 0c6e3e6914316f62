use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware,
    response::Response,
    routing::{delete, get},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use hive_shared::protocol::StoredFileInfo;
use hive_shared::types::{FileId, NodeId, UserId};

use crate::auth::{bearer, require_bearer, NodeToken};
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::file_store::FileStore;
use crate::hub::{ws, Hub};
use crate::status::TransferGauge;

/// Multipart framing allowance on top of the largest accepted file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct NodeState {
    pub files: Arc<FileStore>,
    pub hub: Arc<Hub>,
    pub token: NodeToken,
    pub gauge: TransferGauge,
    pub config: Arc<NodeConfig>,
}

pub fn build_router(state: NodeState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = usize::try_from(state.config.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    let protected = Router::new()
        .route(
            "/files",
            get(list_files)
                .post(upload_file)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/files/:id", delete(delete_file))
        .route("/files/:id/content", get(download_file))
        .route("/files/:id/info", get(file_info))
        .route_layer(middleware::from_fn_with_state(
            state.token.clone(),
            require_bearer,
        ));

    Router::new()
        // The hub checks its own token so browsers can pass it as a query parameter.
        .route("/hub", get(hub_upgrade))
        .route("/health", get(health_check))
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    node_id: NodeId,
    connections: usize,
    active_transfers: u32,
    used_space: u64,
    available_space: u64,
}

async fn health_check(State(state): State<NodeState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        node_id: state.config.node_id.clone(),
        connections: state.hub.connection_count(),
        active_transfers: state.gauge.active(),
        used_space: state.files.used_space(),
        available_space: state.files.available_space(),
    })
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// `multipart/form-data` with a `fileId` text field followed by the `file`
/// part. The file part is streamed to disk chunk by chunk.
async fn upload_file(
    State(state): State<NodeState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<StoredFileInfo>), NodeError> {
    let _transfer = state.gauge.start();
    let mut file_id: Option<FileId> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| NodeError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("fileId") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| NodeError::BadRequest(format!("Unreadable fileId: {e}")))?;
                let id = FileId::parse(raw.trim())
                    .map_err(|e| NodeError::BadRequest(format!("Invalid fileId: {e}")))?;
                file_id = Some(id);
            }
            Some("file") => {
                let id = file_id.ok_or_else(|| {
                    NodeError::BadRequest("fileId must precede the file part".to_string())
                })?;

                let mut pending = state.files.begin_write(id).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| NodeError::BadRequest(format!("Upload interrupted: {e}")))?
                {
                    pending.write(&chunk).await?;
                }
                let stored = pending.commit().await?;

                info!(file_id = %stored.file_id, size = stored.size, "File stored");
                return Ok((StatusCode::CREATED, Json(stored)));
            }
            _ => {}
        }
    }

    Err(NodeError::BadRequest("Missing file part".to_string()))
}

async fn list_files(State(state): State<NodeState>) -> Result<Json<Vec<StoredFileInfo>>, NodeError> {
    Ok(Json(state.files.list().await?))
}

async fn file_info(
    State(state): State<NodeState>,
    Path(id): Path<FileId>,
) -> Result<Json<StoredFileInfo>, NodeError> {
    Ok(Json(state.files.info(id).await?))
}

async fn download_file(
    State(state): State<NodeState>,
    Path(id): Path<FileId>,
) -> Result<Response, NodeError> {
    let transfer = state.gauge.start();
    let (file, stored) = state.files.open_content(id).await?;

    // the transfer counts as active until the body stream is dropped
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _transfer = &transfer;
        chunk
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, stored.size)
        .header("x-checksum", stored.checksum)
        .body(Body::from_stream(stream))
        .map_err(|e| NodeError::Internal(format!("response build: {e}")))
}

async fn delete_file(
    State(state): State<NodeState>,
    Path(id): Path<FileId>,
) -> Result<StatusCode, NodeError> {
    state.files.delete(id).await?;
    info!(file_id = %id, "File deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HubParams {
    access_token: Option<String>,
    user_id: Option<String>,
    #[serde(default)]
    failover: bool,
}

async fn hub_upgrade(
    State(state): State<NodeState>,
    Query(params): Query<HubParams>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, NodeError> {
    let presented = bearer(&headers).or(params.access_token.as_deref());
    if !state.token.accepts(presented) {
        return Err(NodeError::Unauthorized);
    }
    let ws = ws.ok_or_else(|| NodeError::BadRequest("Expected a websocket upgrade".to_string()))?;

    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or(params.user_id)
        .filter(|u| !u.trim().is_empty())
        .map(UserId::new)
        .ok_or_else(|| NodeError::BadRequest("Missing user identity".to_string()))?;

    let max = usize::try_from(state.config.max_connections).unwrap_or(usize::MAX);
    if state.hub.connection_count() >= max {
        return Err(NodeError::Overloaded(format!("{max} hub connections")));
    }

    let hub = state.hub.clone();
    let failover = params.failover;
    Ok(ws.on_upgrade(move |socket| ws::serve_socket(hub, socket, user_id, failover)))
}

pub async fn serve(state: NodeState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting storage node HTTP API");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
