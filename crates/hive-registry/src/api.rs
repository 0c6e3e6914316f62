use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use hive_shared::models::{Channel, FileRecord, Message, StorageNode, User};
use hive_shared::protocol::{
    Heartbeat, LocationsUpdate, MessageSyncAck, MessageSyncEvent, NodeIdList, NodeQuery,
    ReassignmentRequest, ReassignmentResponse, ReplicationCheck, UserStatusUpdate,
};
use hive_shared::types::{from_millis, utc_now_millis, ChannelId, FileId, MessageId, NodeId, UserId};

use crate::auth::{require_bearer, ApiToken};
use crate::chat::{ChatRegistry, NewChannel};
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::file_registry::FileRegistry;
use crate::node_registry::NodeRegistry;
use crate::reassign::Reassigner;

const DEFAULT_SELECTION_COUNT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub nodes: NodeRegistry,
    pub files: FileRegistry,
    pub chat: ChatRegistry,
    pub reassigner: Reassigner,
    pub config: Arc<RegistryConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    let token = ApiToken::new(state.config.api_token.clone());

    let protected = Router::new()
        // nodes
        .route("/nodes", post(register_node).get(list_nodes))
        .route("/nodes/query", post(query_nodes))
        .route("/nodes/by-ids", post(nodes_by_ids))
        .route("/nodes/most-storage", get(nodes_with_most_storage))
        .route("/nodes/lowest-load", get(nodes_with_lowest_load))
        .route("/nodes/available", get(available_nodes))
        .route(
            "/nodes/:id",
            get(get_node).put(update_node).delete(remove_node),
        )
        .route("/nodes/:id/unhealthy", post(mark_node_unhealthy))
        .route("/nodes/:id/heartbeat", post(node_heartbeat))
        .route("/nodes/:id/files", get(files_by_node))
        // files
        .route("/files", post(register_file).get(list_files))
        .route("/files/under-replicated", get(under_replicated_files))
        .route("/files/:id", get(get_file).delete(delete_file))
        .route("/files/:id/locations", put(replace_file_locations))
        .route(
            "/files/:id/locations/:node_id",
            post(add_file_location).delete(remove_file_location),
        )
        .route("/files/:id/replication", get(file_replication))
        // chat
        .route("/channels", post(create_channel))
        .route("/channels/:id", get(get_channel))
        .route("/channels/:id/messages", get(channel_messages))
        .route("/messages/sync", post(sync_message))
        .route("/users/:id", get(get_user))
        .route("/users/:id/status", put(set_user_status))
        .route("/users/:id/channels", get(user_channels))
        // failover
        .route("/gateway/reassign", post(reassign))
        .route_layer(middleware::from_fn_with_state(token, require_bearer));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    healthy_nodes: usize,
}

#[derive(Serialize)]
struct ChangedResponse {
    changed: bool,
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListNodesParams {
    #[serde(default)]
    include_offline: bool,
}

#[derive(Deserialize)]
struct SelectionParams {
    count: Option<usize>,
    region: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableParams {
    #[serde(default)]
    min_space: u64,
    region: Option<String>,
}

#[derive(Deserialize)]
struct ListFilesParams {
    name: Option<String>,
    /// Comma-separated.
    tags: Option<String>,
}

#[derive(Deserialize)]
struct ReplicationParams {
    min: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesParams {
    since: Option<DateTime<Utc>>,
    /// Resume after this message when it shares the `since` timestamp.
    after_id: Option<MessageId>,
    limit: Option<u32>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let healthy_nodes = state
        .nodes
        .get_all_nodes(false)
        .map(|nodes| nodes.len())
        .unwrap_or(0);
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        healthy_nodes,
    })
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

async fn register_node(
    State(state): State<AppState>,
    Json(node): Json<StorageNode>,
) -> Result<(StatusCode, Json<StorageNode>), RegistryError> {
    let node = state.nodes.register_node(node)?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn list_nodes(
    State(state): State<AppState>,
    Query(params): Query<ListNodesParams>,
) -> Result<Json<Vec<StorageNode>>, RegistryError> {
    Ok(Json(state.nodes.get_all_nodes(params.include_offline)?))
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<StorageNode>, RegistryError> {
    state
        .nodes
        .get_node(&id)?
        .map(Json)
        .ok_or(RegistryError::NodeNotFound(id))
}

async fn update_node(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
    Json(node): Json<StorageNode>,
) -> Result<Json<StorageNode>, RegistryError> {
    if node.id != id {
        return Err(RegistryError::BadRequest(format!(
            "path id {id} does not match body id {}",
            node.id
        )));
    }
    Ok(Json(state.nodes.update_node(node)?))
}

async fn remove_node(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<DeletedResponse>, RegistryError> {
    let deleted = state.nodes.remove_node(&id)?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn mark_node_unhealthy(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<ChangedResponse>, RegistryError> {
    let changed = state.nodes.mark_node_unhealthy(&id)?;
    Ok(Json(ChangedResponse { changed }))
}

async fn node_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
    Json(heartbeat): Json<Heartbeat>,
) -> Result<Json<StorageNode>, RegistryError> {
    let node = state
        .nodes
        .record_heartbeat(&id, heartbeat.status, utc_now_millis())?;
    Ok(Json(node))
}

async fn query_nodes(
    State(state): State<AppState>,
    Json(query): Json<NodeQuery>,
) -> Result<Json<Vec<StorageNode>>, RegistryError> {
    Ok(Json(state.nodes.find_nodes(&query)?))
}

async fn nodes_by_ids(
    State(state): State<AppState>,
    Json(list): Json<NodeIdList>,
) -> Result<Json<Vec<StorageNode>>, RegistryError> {
    Ok(Json(state.nodes.nodes_by_ids(&list.node_ids)?))
}

async fn nodes_with_most_storage(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<Json<Vec<StorageNode>>, RegistryError> {
    let count = params.count.unwrap_or(DEFAULT_SELECTION_COUNT);
    Ok(Json(
        state
            .nodes
            .nodes_with_most_storage(count, params.region.as_deref())?,
    ))
}

async fn nodes_with_lowest_load(
    State(state): State<AppState>,
    Query(params): Query<SelectionParams>,
) -> Result<Json<Vec<StorageNode>>, RegistryError> {
    let count = params.count.unwrap_or(DEFAULT_SELECTION_COUNT);
    Ok(Json(
        state
            .nodes
            .nodes_with_lowest_load(count, params.region.as_deref())?,
    ))
}

async fn available_nodes(
    State(state): State<AppState>,
    Query(params): Query<AvailableParams>,
) -> Result<Json<Vec<StorageNode>>, RegistryError> {
    Ok(Json(
        state
            .nodes
            .available_nodes(params.min_space, params.region.as_deref())?,
    ))
}

async fn files_by_node(
    State(state): State<AppState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Vec<FileRecord>>, RegistryError> {
    Ok(Json(state.files.files_by_node(&id)?))
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

async fn register_file(
    State(state): State<AppState>,
    Json(file): Json<FileRecord>,
) -> Result<(StatusCode, Json<FileRecord>), RegistryError> {
    let file = state.files.register_file(file)?;
    Ok((StatusCode::CREATED, Json(file)))
}

async fn list_files(
    State(state): State<AppState>,
    Query(params): Query<ListFilesParams>,
) -> Result<Json<Vec<FileRecord>>, RegistryError> {
    let tags: BTreeSet<String> = params
        .tags
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    Ok(Json(state.files.list_files(params.name.as_deref(), &tags)?))
}

async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
) -> Result<Json<FileRecord>, RegistryError> {
    state
        .files
        .get_file_info(id)?
        .map(Json)
        .ok_or(RegistryError::FileNotFound(id))
}

async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
) -> Result<Json<DeletedResponse>, RegistryError> {
    let deleted = state.files.delete_file(id)?;
    Ok(Json(DeletedResponse { deleted }))
}

async fn replace_file_locations(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
    Json(update): Json<LocationsUpdate>,
) -> Result<Json<FileRecord>, RegistryError> {
    Ok(Json(state.files.update_file_locations(id, &update.node_ids)?))
}

async fn add_file_location(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(FileId, NodeId)>,
) -> Result<Json<FileRecord>, RegistryError> {
    Ok(Json(state.files.add_file_location(id, &node_id)?))
}

async fn remove_file_location(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(FileId, NodeId)>,
) -> Result<Json<FileRecord>, RegistryError> {
    Ok(Json(state.files.remove_file_location(id, &node_id)?))
}

async fn file_replication(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
    Query(params): Query<ReplicationParams>,
) -> Result<Json<ReplicationCheck>, RegistryError> {
    let min = params.min.unwrap_or(state.config.min_replication_factor);
    state
        .files
        .replication_status(id, min)?
        .map(Json)
        .ok_or(RegistryError::FileNotFound(id))
}

async fn under_replicated_files(
    State(state): State<AppState>,
    Query(params): Query<ReplicationParams>,
) -> Result<Json<Vec<FileRecord>>, RegistryError> {
    let min = params.min.unwrap_or(state.config.min_replication_factor);
    Ok(Json(state.files.files_needing_replication(min)?))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

async fn create_channel(
    State(state): State<AppState>,
    Json(new): Json<NewChannel>,
) -> Result<(StatusCode, Json<Channel>), RegistryError> {
    let channel = state.chat.create_channel(new)?;
    Ok((StatusCode::CREATED, Json(channel)))
}

async fn get_channel(
    State(state): State<AppState>,
    Path(id): Path<ChannelId>,
) -> Result<Json<Channel>, RegistryError> {
    state
        .chat
        .get_channel(id)?
        .map(Json)
        .ok_or(RegistryError::ChannelNotFound(id))
}

async fn channel_messages(
    State(state): State<AppState>,
    Path(id): Path<ChannelId>,
    Query(params): Query<MessagesParams>,
) -> Result<Json<Vec<Message>>, RegistryError> {
    let since = params.since.unwrap_or_else(|| from_millis(0));
    Ok(Json(
        state
            .chat
            .messages_since(id, since, params.after_id, params.limit)?,
    ))
}

async fn sync_message(
    State(state): State<AppState>,
    Json(event): Json<MessageSyncEvent>,
) -> Result<Json<MessageSyncAck>, RegistryError> {
    Ok(Json(state.chat.sync_message(event)?))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> Result<Json<User>, RegistryError> {
    state
        .chat
        .get_user(&id)?
        .map(Json)
        .ok_or(RegistryError::UserNotFound(id))
}

async fn set_user_status(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(update): Json<UserStatusUpdate>,
) -> Result<StatusCode, RegistryError> {
    state.chat.set_user_status(&id, &update)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn user_channels(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> Result<Json<Vec<Channel>>, RegistryError> {
    Ok(Json(state.chat.channels_for_user(&id)?))
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

async fn reassign(
    State(state): State<AppState>,
    Json(request): Json<ReassignmentRequest>,
) -> Result<Json<ReassignmentResponse>, RegistryError> {
    Ok(Json(state.reassigner.reassign(&request)?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting registry HTTP API");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::db::SharedDb;
    use crate::node_registry::tests::node;

    fn state(api_token: Option<&str>) -> AppState {
        let db = SharedDb::in_memory().unwrap();
        let nodes = NodeRegistry::new(db.clone());
        let files = FileRegistry::new(db.clone(), nodes.clone(), 100);
        let config = RegistryConfig {
            api_token: api_token.map(String::from),
            ..RegistryConfig::default()
        };
        AppState {
            reassigner: Reassigner::new(
                nodes.clone(),
                files.clone(),
                None,
                config.client_token_ttl,
            ),
            chat: ChatRegistry::new(db),
            nodes,
            files,
            config: Arc::new(config),
        }
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = build_router(state(Some("secret")));
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_routes_need_token() {
        let app = build_router(state(Some("secret")));
        let resp = app
            .clone()
            .oneshot(Request::get("/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::get("/nodes")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_static_routes_win_over_id_routes() {
        let st = state(None);
        st.nodes.register_node(node("a", "eu", 10, 0.0)).unwrap();
        let app = build_router(st);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/nodes/most-storage?count=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/nodes/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_node_is_404() {
        let app = build_router(state(None));
        let body = serde_json::to_string(&Heartbeat {
            status: node("x", "eu", 1, 0.0).status,
        })
        .unwrap();
        let resp = app
            .oneshot(
                Request::post("/nodes/x/heartbeat")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_user_lookup() {
        let st = state(None);
        st.chat
            .set_user_status(
                &UserId::from("alice"),
                &UserStatusUpdate {
                    presence: hive_shared::models::Presence::Online,
                    node_id: Some(NodeId::from("n2")),
                },
            )
            .unwrap();
        let app = build_router(st);

        let resp = app
            .clone()
            .oneshot(Request::get("/users/alice").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/users/carol").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
