//! REST API for the storage manager
//!
//! JSON over HTTP mirroring every facade operation under `/v1`, plus a
//! server-sent event stream of storage notifications at `/v1/events`.
//! Operations that start background work answer `202 Accepted` with the
//! affected resource and the task record.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::controlplane::manager::StorageManager;
use crate::domain::types::{DiskId, GroupId, PoolId, TaskId, VolumeId};
use crate::error::Error;
use crate::raid::RaidLayout;
use crate::scheduler::{Task, TaskFilter, TaskKind, TaskState, TaskTarget};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Create redundancy group request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupRequest {
    pub layout: RaidLayout,
    pub disks: Vec<DiskId>,
}

/// Replace member request
#[derive(Debug, Clone, Deserialize)]
pub struct ReplaceMemberRequest {
    pub old_disk: DiskId,
    pub new_disk: DiskId,
}

/// Create pool request
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub groups: Vec<GroupId>,
}

/// Expand pool request
#[derive(Debug, Clone, Deserialize)]
pub struct ExpandPoolRequest {
    pub groups: Vec<GroupId>,
}

/// Create volume request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateVolumeRequest {
    pub pool: PoolId,
    pub name: String,
    pub size_bytes: u64,
}

/// Resize volume request
#[derive(Debug, Clone, Deserialize)]
pub struct ResizeVolumeRequest {
    pub size_bytes: u64,
}

/// Set quota request; `null` clears the quota
#[derive(Debug, Clone, Deserialize)]
pub struct SetQuotaRequest {
    pub quota_bytes: Option<u64>,
}

/// Usage report from the filesystem layer
#[derive(Debug, Clone, Deserialize)]
pub struct RecordUsageRequest {
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolumeQuery {
    pub pool: Option<PoolId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskQuery {
    pub kind: Option<TaskKind>,
    pub state: Option<TaskState>,
    pub group: Option<GroupId>,
    pub pool: Option<PoolId>,
    pub volume: Option<VolumeId>,
}

impl TaskQuery {
    fn into_filter(self) -> TaskFilter {
        let target = if let Some(group) = self.group {
            Some(TaskTarget::Group(group))
        } else if let Some(pool) = self.pool {
            Some(TaskTarget::Pool(pool))
        } else {
            self.volume.map(TaskTarget::Volume)
        };
        TaskFilter {
            kind: self.kind,
            state: self.state,
            target,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthEventQuery {
    pub since: Option<DateTime<Utc>>,
}

/// A resource together with the task that is working on it
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedResponse<T> {
    pub resource: T,
    pub task: Option<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountPathResponse {
    pub volume: VolumeId,
    pub mount_path: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// =============================================================================
// Error Mapping
// =============================================================================

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,

        Error::InvalidLayout { .. }
        | Error::IncompatibleDiskSize { .. }
        | Error::InsufficientCapacity { .. }
        | Error::EmptyPool
        | Error::ShrinkNotSupported { .. }
        | Error::Configuration(_) => StatusCode::BAD_REQUEST,

        Error::InsufficientFreeSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,

        Error::DiskUnavailable { .. }
        | Error::PoolNotEmpty { .. }
        | Error::GroupNotOnline { .. }
        | Error::GroupInUse { .. }
        | Error::InvalidState { .. }
        | Error::NotMounted { .. }
        | Error::ConcurrentModification { .. } => StatusCode::CONFLICT,

        Error::TargetUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(err: &Error) -> &'static str {
    match err {
        Error::Internal(_) => "internal",
        Error::Configuration(_) => "configuration",
        Error::NotFound { .. } => "not_found",
        Error::InvalidLayout { .. } => "invalid_layout",
        Error::IncompatibleDiskSize { .. } => "incompatible_disk_size",
        Error::InsufficientCapacity { .. } => "insufficient_capacity",
        Error::DiskUnavailable { .. } => "disk_unavailable",
        Error::EmptyPool => "empty_pool",
        Error::PoolNotEmpty { .. } => "pool_not_empty",
        Error::GroupNotOnline { .. } => "group_not_online",
        Error::GroupInUse { .. } => "group_in_use",
        Error::InsufficientFreeSpace { .. } => "insufficient_free_space",
        Error::ShrinkNotSupported { .. } => "shrink_not_supported",
        Error::NotMounted { .. } => "not_mounted",
        Error::TargetUnavailable { .. } => "target_unavailable",
        Error::InvalidState { .. } => "invalid_state",
        Error::ConcurrentModification { .. } => "concurrent_modification",
        Error::TransientIo { .. } => "transient_io",
        Error::Backend { .. } => "backend",
        Error::AttemptTimeout { .. } => "attempt_timeout",
        Error::Cancelled => "cancelled",
        Error::MetadataCorrupt { .. } => "metadata_corrupt",
        Error::Json(_) | Error::Yaml(_) | Error::Io(_) => "internal",
    }
}

fn error_details(err: &Error) -> Option<serde_json::Value> {
    match err {
        Error::InsufficientFreeSpace {
            requested,
            available,
        } => Some(serde_json::json!({
            "requested": requested,
            "available": available,
        })),
        Error::InsufficientCapacity { required, offered } => Some(serde_json::json!({
            "required": required,
            "offered": offered,
        })),
        Error::ConcurrentModification { .. } => Some(serde_json::json!({ "retry": true })),
        _ => None,
    }
}

/// Render a storage error as a JSON error response
fn error_response(err: Error) -> Response {
    let status = error_status(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }

    (
        status,
        Json(ApiErrorResponse {
            error: error_code(&err).into(),
            message: err.to_string(),
            details: error_details(&err),
        }),
    )
        .into_response()
}

fn ok<T: Serialize>(result: crate::error::Result<T>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

fn accepted<T: Serialize>(resource: T, task: Option<Task>) -> Response {
    let status = if task.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(SubmittedResponse { resource, task })).into_response()
}

// =============================================================================
// Router
// =============================================================================

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StorageManager>,
}

/// REST API router builder
pub struct RestRouter {
    state: AppState,
}

impl RestRouter {
    pub fn new(manager: Arc<StorageManager>) -> Self {
        Self {
            state: AppState { manager },
        }
    }

    /// Build the axum router
    pub fn build(self) -> Router {
        Router::new()
            // Disks
            .route("/v1/disks", get(list_disks))
            .route("/v1/disks/:id", get(get_disk))
            .route("/v1/disks/:id/spare", post(add_spare).delete(remove_spare))
            .route("/v1/disks/:id/fail", post(fail_disk))
            // Redundancy groups
            .route("/v1/groups", get(list_groups).post(create_group))
            .route("/v1/groups/:id", get(get_group).delete(delete_group))
            .route("/v1/groups/:id/replace", post(replace_member))
            .route("/v1/groups/:id/scrub", post(scrub_group))
            .route("/v1/groups/:id/activate", post(activate_group))
            .route("/v1/groups/:id/deactivate", post(deactivate_group))
            // Pools
            .route("/v1/pools", get(list_pools).post(create_pool))
            .route("/v1/pools/:id", get(get_pool).delete(delete_pool))
            .route("/v1/pools/:id/expand", post(expand_pool))
            // Volumes
            .route("/v1/volumes", get(list_volumes).post(create_volume))
            .route("/v1/volumes/:id", get(get_volume).delete(delete_volume))
            .route("/v1/volumes/:id/resize", post(resize_volume))
            .route("/v1/volumes/:id/quota", put(set_quota))
            .route("/v1/volumes/:id/usage", put(record_usage))
            .route("/v1/volumes/:id/mount", post(mount_volume))
            .route("/v1/volumes/:id/unmount", post(unmount_volume))
            .route("/v1/volumes/:id/mount-path", get(resolve_mount_path))
            // Tasks
            .route("/v1/tasks", get(list_tasks))
            .route("/v1/tasks/:id", get(get_task))
            .route("/v1/tasks/:id/wait", get(wait_task))
            .route("/v1/tasks/:id/cancel", post(cancel_task))
            .route("/v1/tasks/:id/pause", post(pause_task))
            .route("/v1/tasks/:id/resume", post(resume_task))
            // Health & notifications
            .route("/v1/health/events", get(health_events))
            .route("/v1/health/poll", post(poll_health))
            .route("/v1/events", get(event_stream))
            .with_state(self.state)
    }
}

// =============================================================================
// Disk Handlers
// =============================================================================

async fn list_disks(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.manager.list_disks()))
}

async fn get_disk(State(state): State<AppState>, Path(id): Path<DiskId>) -> Response {
    ok(state.manager.get_disk(&id))
}

async fn add_spare(State(state): State<AppState>, Path(id): Path<DiskId>) -> Response {
    ok(state.manager.add_spare(&id))
}

async fn remove_spare(State(state): State<AppState>, Path(id): Path<DiskId>) -> Response {
    ok(state.manager.remove_spare(&id))
}

/// Report a disk as lost outside of the health monitor
async fn fail_disk(State(state): State<AppState>, Path(id): Path<DiskId>) -> Response {
    warn!("Disk {} reported failed over the API", id);
    match state.manager.handle_member_failure(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Group Handlers
// =============================================================================

async fn list_groups(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.manager.list_groups()))
}

async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<CreateGroupRequest>,
) -> Response {
    match state.manager.create_group(request.layout, request.disks) {
        Ok(group) => (StatusCode::CREATED, Json(group)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_group(State(state): State<AppState>, Path(id): Path<GroupId>) -> Response {
    ok(state.manager.get_group(&id))
}

async fn delete_group(State(state): State<AppState>, Path(id): Path<GroupId>) -> Response {
    ok(state.manager.delete_group(&id))
}

async fn replace_member(
    State(state): State<AppState>,
    Path(id): Path<GroupId>,
    Json(request): Json<ReplaceMemberRequest>,
) -> Response {
    let handle = match state
        .manager
        .replace_member(&id, &request.old_disk, &request.new_disk)
    {
        Ok(handle) => handle,
        Err(e) => return error_response(e),
    };
    match state.manager.get_group(&id) {
        Ok(group) => accepted(group, Some(handle.snapshot())),
        Err(e) => error_response(e),
    }
}

async fn scrub_group(State(state): State<AppState>, Path(id): Path<GroupId>) -> Response {
    let handle = match state.manager.scrub_group(&id) {
        Ok(handle) => handle,
        Err(e) => return error_response(e),
    };
    match state.manager.get_group(&id) {
        Ok(group) => accepted(group, Some(handle.snapshot())),
        Err(e) => error_response(e),
    }
}

async fn activate_group(State(state): State<AppState>, Path(id): Path<GroupId>) -> Response {
    ok(state.manager.activate_group(&id))
}

async fn deactivate_group(State(state): State<AppState>, Path(id): Path<GroupId>) -> Response {
    ok(state.manager.deactivate_group(&id))
}

// =============================================================================
// Pool Handlers
// =============================================================================

async fn list_pools(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.manager.list_pools()))
}

async fn create_pool(
    State(state): State<AppState>,
    Json(request): Json<CreatePoolRequest>,
) -> Response {
    match state.manager.create_pool(&request.name, request.groups) {
        Ok((pool, handle)) => accepted(pool, Some(handle.snapshot())),
        Err(e) => error_response(e),
    }
}

async fn get_pool(State(state): State<AppState>, Path(id): Path<PoolId>) -> Response {
    ok(state.manager.get_pool(&id))
}

async fn delete_pool(State(state): State<AppState>, Path(id): Path<PoolId>) -> Response {
    ok(state.manager.delete_pool(&id))
}

async fn expand_pool(
    State(state): State<AppState>,
    Path(id): Path<PoolId>,
    Json(request): Json<ExpandPoolRequest>,
) -> Response {
    match state.manager.expand_pool(&id, request.groups) {
        Ok((pool, handle)) => accepted(pool, Some(handle.snapshot())),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn list_volumes(
    State(state): State<AppState>,
    Query(query): Query<VolumeQuery>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(state.manager.list_volumes(query.pool.as_ref())),
    )
}

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    match state
        .manager
        .create_volume(&request.pool, &request.name, request.size_bytes)
    {
        Ok((volume, handle)) => accepted(volume, Some(handle.snapshot())),
        Err(e) => error_response(e),
    }
}

async fn get_volume(State(state): State<AppState>, Path(id): Path<VolumeId>) -> Response {
    ok(state.manager.get_volume(&id))
}

async fn delete_volume(State(state): State<AppState>, Path(id): Path<VolumeId>) -> Response {
    match state.manager.delete_volume(&id) {
        Ok((volume, handle)) => accepted(volume, Some(handle.snapshot())),
        Err(e) => error_response(e),
    }
}

async fn resize_volume(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
    Json(request): Json<ResizeVolumeRequest>,
) -> Response {
    match state.manager.resize_volume(&id, request.size_bytes) {
        Ok((volume, handle)) => accepted(volume, handle.map(|h| h.snapshot())),
        Err(e) => error_response(e),
    }
}

async fn set_quota(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
    Json(request): Json<SetQuotaRequest>,
) -> Response {
    ok(state.manager.set_quota(&id, request.quota_bytes))
}

async fn record_usage(
    State(state): State<AppState>,
    Path(id): Path<VolumeId>,
    Json(request): Json<RecordUsageRequest>,
) -> Response {
    ok(state.manager.record_usage(&id, request.used_bytes))
}

async fn mount_volume(State(state): State<AppState>, Path(id): Path<VolumeId>) -> Response {
    ok(state.manager.mount_volume(&id))
}

async fn unmount_volume(State(state): State<AppState>, Path(id): Path<VolumeId>) -> Response {
    ok(state.manager.unmount_volume(&id))
}

async fn resolve_mount_path(State(state): State<AppState>, Path(id): Path<VolumeId>) -> Response {
    ok(state
        .manager
        .resolve_mount_path(&id)
        .map(|path| MountPathResponse {
            volume: id,
            mount_path: path.to_string_lossy().into_owned(),
        }))
}

// =============================================================================
// Task Handlers
// =============================================================================

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(state.manager.list_tasks(&query.into_filter())),
    )
}

async fn get_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Response {
    ok(state.manager.get_task(&id))
}

/// Block until the task is terminal
async fn wait_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Response {
    ok(state.manager.wait_task(&id).await)
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Response {
    ok(state.manager.cancel_task(&id))
}

async fn pause_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Response {
    ok(state.manager.pause_task(&id))
}

async fn resume_task(State(state): State<AppState>, Path(id): Path<TaskId>) -> Response {
    ok(state.manager.resume_task(&id))
}

// =============================================================================
// Health & Event Handlers
// =============================================================================

async fn health_events(
    State(state): State<AppState>,
    Query(query): Query<HealthEventQuery>,
) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(state.manager.get_health_events(query.since)),
    )
}

/// Run one health poll immediately
async fn poll_health(State(state): State<AppState>) -> Response {
    match state.manager.poll_health().await {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "discovered": report.discovered,
                "disappeared": report.disappeared,
                "transitions": report.transitions,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// Server-sent stream of storage events
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state.manager.subscribe();
    let stream = stream::unfold(events, |mut events| async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(data) => Event::default().event("storage").data(data),
                        Err(e) => {
                            warn!("Dropping unserializable event: {}", e);
                            continue;
                        }
                    };
                    return Some((Ok::<_, Infallible>(frame), events));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event stream subscriber lagged, {} events skipped", skipped);
                    let frame = Event::default()
                        .event("lagged")
                        .data(skipped.to_string());
                    return Some((Ok::<_, Infallible>(frame), events));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
