//! HTTP API over the engine, plus the `/ws` upgrade route.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{self, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use remote_device_core::{
    Coded, ErrorBody, ErrorCode, Event, ExecutionResult, LogEntry, LogQuery, TaskDefinition,
};
use remote_device_engine::{ConnectionStatus, Engine, EngineStatus, TaskDetails, TaskSummary};
use serde::{Deserialize, Serialize};

use crate::websocket::ws_handler;

/// Coded failure rendered as `{code, message}` with a matching status.
#[derive(Debug)]
pub struct ApiError(ErrorBody);

impl<E: Coded> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.to_body())
    }
}

const fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::TaskNotFound => StatusCode::NOT_FOUND,
        ErrorCode::TaskAlreadyExists => StatusCode::CONFLICT,
        ErrorCode::InvalidTask
        | ErrorCode::InvalidSchedule
        | ErrorCode::UnknownCommand
        | ErrorCode::UnsupportedChannel
        | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::DeviceNotConnected => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.code);
        if status.is_server_error() {
            tracing::warn!(code = %self.0.code, message = %self.0.message, "Request failed");
        }
        (status, Json(self.0)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the full router.
#[must_use]
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/status", get(status))
        .route("/api/device/connect", post(connect))
        .route("/api/device/disconnect", post(disconnect))
        .route("/api/device/reconnect", post(start_reconnect).delete(stop_reconnect))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{name}",
            get(task_details).put(update_task).delete(delete_task),
        )
        .route("/api/tasks/{name}/run", post(run_task))
        .route("/api/tasks/{name}/enable", post(enable_task))
        .route("/api/tasks/{name}/disable", post(disable_task))
        .route("/api/activity", get(activity))
        .route("/api/logs", get(logs))
        .route("/api/events", get(events))
        .with_state(engine)
}

async fn status(State(engine): State<Arc<Engine>>) -> Json<EngineStatus> {
    Json(engine.status())
}

#[derive(Debug, Default, Deserialize)]
struct ConnectRequest {
    #[serde(default)]
    address: Option<String>,
}

async fn connect(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ConnectRequest>,
) -> ApiResult<ConnectionStatus> {
    Ok(Json(engine.connect(req.address.as_deref()).await?))
}

async fn disconnect(State(engine): State<Arc<Engine>>) -> Json<ConnectionStatus> {
    Json(engine.disconnect().await)
}

#[derive(Serialize)]
struct ReconnectResponse {
    /// Whether a loop was started (POST) or cancelled (DELETE).
    changed: bool,
    status: ConnectionStatus,
}

async fn start_reconnect(State(engine): State<Arc<Engine>>) -> Json<ReconnectResponse> {
    let changed = engine.start_reconnect();
    Json(ReconnectResponse {
        changed,
        status: engine.device_status(),
    })
}

async fn stop_reconnect(State(engine): State<Arc<Engine>>) -> Json<ReconnectResponse> {
    let changed = engine.stop_reconnect();
    Json(ReconnectResponse {
        changed,
        status: engine.device_status(),
    })
}

async fn list_tasks(State(engine): State<Arc<Engine>>) -> Json<Vec<TaskSummary>> {
    Json(engine.list_tasks())
}

async fn task_details(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> ApiResult<TaskDetails> {
    Ok(Json(engine.task_details(&name)?))
}

async fn create_task(
    State(engine): State<Arc<Engine>>,
    Json(task): Json<TaskDefinition>,
) -> Result<(StatusCode, Json<TaskDetails>), ApiError> {
    let name = task.name.clone();
    engine.add_task(task)?;
    Ok((StatusCode::CREATED, Json(engine.task_details(&name)?)))
}

async fn update_task(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
    Json(task): Json<TaskDefinition>,
) -> ApiResult<TaskDetails> {
    let new_name = task.name.clone();
    engine.update_task(&name, task)?;
    Ok(Json(engine.task_details(&new_name)?))
}

async fn delete_task(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine.remove_task(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_task(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> ApiResult<ExecutionResult> {
    Ok(Json(engine.run_task(&name).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnabledResponse {
    name: String,
    enabled: bool,
    next_run: Option<chrono::DateTime<chrono::Local>>,
}

async fn enable_task(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> ApiResult<EnabledResponse> {
    let next_run = engine.set_task_enabled(&name, true)?;
    Ok(Json(EnabledResponse {
        name,
        enabled: true,
        next_run,
    }))
}

async fn disable_task(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
) -> ApiResult<EnabledResponse> {
    let next_run = engine.set_task_enabled(&name, false)?;
    Ok(Json(EnabledResponse {
        name,
        enabled: false,
        next_run,
    }))
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
}

async fn activity(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<ActivityQuery>,
) -> Json<Vec<Event>> {
    Json(engine.broadcaster().recent_activity(query.limit))
}

async fn logs(
    State(engine): State<Arc<Engine>>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<LogEntry>> {
    Json(engine.broadcaster().recent_logs(&query))
}

/// Server-sent events: the recent-activity ring, then every live event.
async fn events(
    State(engine): State<Arc<Engine>>,
) -> Sse<impl Stream<Item = Result<sse::Event, axum::Error>>> {
    let stream = engine
        .broadcaster()
        .history_plus_stream()
        .map(|event| sse::Event::default().event(event.topic.clone()).json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
