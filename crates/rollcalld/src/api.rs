//! Thin HTTP and WebSocket surface over the pipeline.
//!
//! Nothing here waits on recognition: `/recognize` enqueues and returns a
//! task handle, results are fetched from `/tasks/:id` or observed on `/ws`.

use crate::broadcast::{Observer, ObserverRegistry};
use crate::queue::{FramePayload, QueueError, TaskId, TaskQueue, TaskState};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use rollcall_core::{
    BroadcastEvent, ClientMessage, Descriptor, DescriptorExtractor, PersonId, ResetScope,
    StudentListing, PONG,
};
use rollcall_store::{Store, StoreError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Largest accepted request body (frames and registration images).
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const DEFAULT_ATTENDANCE_LIMIT: usize = 100;
const MAX_ATTENDANCE_LIMIT: usize = 1000;

/// Shared application context passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: TaskQueue,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ObserverRegistry>,
    /// Extractor used inline by registration; recognition uses the worker pool.
    pub enroller: Arc<Mutex<Box<dyn DescriptorExtractor>>>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::PersonNotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::DimensionMismatch { .. } => ApiError::BadRequest(err.to_string()),
            StoreError::Database(_) => ApiError::Unavailable(err.to_string()),
            StoreError::CorruptEmbedding(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        }
        let body = Json(json!({ "status": "error", "message": self.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// CORS policy for browser dashboards. `*` (or no origins) allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/recognize", post(recognize))
        .route("/tasks/:id", get(task_status))
        .route("/students", get(list_students).post(register_student))
        .route("/attendance", get(list_attendance))
        .route("/attendance/:person_id", post(mark_attendance))
        .route("/admin/students", delete(reset_students))
        .route("/admin/attendance", delete(reset_attendance))
        .route("/admin/reset", post(reset_all))
        .route("/ws", get(observe))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "observers": state.registry.len(),
        "pending": state.queue.pending(),
    }))
}

#[derive(Deserialize)]
struct RecognizeRequest {
    frame: String,
}

/// Accepts raw image bytes, `text/plain` base64, or JSON `{"frame": base64}`.
async fn recognize(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let payload = if content_type.starts_with("application/json") {
        let req: RecognizeRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))?;
        FramePayload::Base64(req.frame)
    } else if content_type.starts_with("text/plain") {
        let text = String::from_utf8(body.to_vec())
            .map_err(|_| ApiError::BadRequest("text frame is not UTF-8".into()))?;
        FramePayload::Base64(text)
    } else {
        FramePayload::Binary(body.to_vec())
    };

    if payload.is_empty() {
        return Err(ApiError::BadRequest("empty frame".into()));
    }

    let task_id = state.queue.submit(payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "processing", "task_id": task_id })),
    ))
}

async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<Value>> {
    let task = state
        .queue
        .poll(&id)
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    Ok(Json(task_view(id, &task)))
}

/// Flatten a task state into the polling response.
fn task_view(id: TaskId, state: &TaskState) -> Value {
    match state {
        TaskState::Queued | TaskState::Running { .. } => {
            json!({ "status": "processing", "task_id": id })
        }
        TaskState::Succeeded { result } => {
            let mut view = serde_json::to_value(result).unwrap_or_else(|_| json!({}));
            if let Value::Object(map) = &mut view {
                map.insert("task_id".into(), json!(id));
            }
            view
        }
        TaskState::Failed { error, retryable } => json!({
            "status": "failed",
            "task_id": id,
            "error": error,
            "retryable": retryable,
        }),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    roll_number: String,
    name: String,
    department: String,
    /// Base64 image, optionally as a data URI.
    image: String,
}

async fn register_student(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<Value>> {
    let roll_number = req.roll_number.trim().to_string();
    let name = req.name.trim().to_string();
    let department = req.department.trim().to_string();
    if roll_number.is_empty() || name.is_empty() {
        return Err(ApiError::BadRequest("rollNumber and name are required".into()));
    }

    let image = FramePayload::Base64(req.image)
        .into_bytes()
        .map_err(|e| ApiError::BadRequest(format!("image is not valid base64: {e}")))?;

    let enroller = Arc::clone(&state.enroller);
    let descriptor = tokio::task::spawn_blocking(move || {
        let mut extractor = enroller.lock().unwrap_or_else(PoisonError::into_inner);
        extractor.extract(&image)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("extractor task failed: {e}")))?
    .map_err(|e| {
        if e.is_retryable() {
            ApiError::Unavailable(e.to_string())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;

    let embedding = match descriptor {
        Descriptor::Face(embedding) => embedding,
        Descriptor::NoFace => return Err(ApiError::BadRequest("No face detected".into())),
    };

    let student = state
        .store
        .enroll(&roll_number, &name, &department, &embedding)
        .await?;
    state
        .registry
        .broadcast(&BroadcastEvent::StudentRegistered(student.clone()));

    Ok(Json(json!({ "status": "success", "student": student })))
}

async fn list_students(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let students: Vec<StudentListing> = state
        .store
        .persons()
        .await?
        .into_iter()
        .map(StudentListing::from)
        .collect();
    Ok(Json(json!({ "status": "success", "students": students })))
}

#[derive(Deserialize)]
struct AttendanceQuery {
    limit: Option<usize>,
}

async fn list_attendance(
    State(state): State<AppState>,
    Query(query): Query<AttendanceQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ATTENDANCE_LIMIT)
        .min(MAX_ATTENDANCE_LIMIT);
    let records = state.store.recent(limit).await?;
    Ok(Json(json!({ "status": "success", "attendance": records })))
}

async fn mark_attendance(
    State(state): State<AppState>,
    Path(person_id): Path<PersonId>,
) -> ApiResult<Json<Value>> {
    let record = state
        .store
        .append(person_id, None)
        .await?
        .ok_or_else(|| ApiError::Internal("attendance write was not recorded".into()))?;
    state
        .registry
        .broadcast(&BroadcastEvent::AttendanceMarked(record.clone()));
    Ok(Json(json!({ "status": "success", "attendance": record })))
}

async fn reset(state: &AppState, scope: ResetScope) -> ApiResult<Json<Value>> {
    let counts = state.store.reset(scope).await?;
    state
        .registry
        .broadcast(&BroadcastEvent::DatabaseReset { scope });
    Ok(Json(json!({
        "status": "success",
        "scope": scope,
        "removed": { "persons": counts.persons, "attendance": counts.attendance },
    })))
}

async fn reset_students(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    reset(&state, ResetScope::Students).await
}

async fn reset_attendance(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    reset(&state, ResetScope::Attendance).await
}

async fn reset_all(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    reset(&state, ResetScope::All).await
}

async fn observe(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| run_observer(socket, registry))
}

/// Forward broadcasts to one observer and answer its pings until either
/// side goes away.
async fn run_observer(mut socket: WebSocket, registry: Arc<ObserverRegistry>) {
    let Observer { id, mut rx } = registry.connect();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else {
                    // Evicted or registry shut down.
                    break;
                };
                if socket.send(Message::Text(message.to_string())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                if socket.send(Message::Text(PONG.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Unknown) => {
                                tracing::debug!(observer = id, "ignoring unknown message type");
                            }
                            Err(err) => {
                                tracing::debug!(observer = id, error = %err, "ignoring malformed message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(observer = id, error = %err, "observer socket error");
                        break;
                    }
                }
            }
        }
    }

    registry.disconnect(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::RecognitionOutcome;
    use uuid::Uuid;

    #[test]
    fn test_task_view_processing() {
        let id = Uuid::new_v4();
        let view = task_view(id, &TaskState::Running { attempt: 2 });
        assert_eq!(view["status"], "processing");
        assert_eq!(view["task_id"], id.to_string());
    }

    #[test]
    fn test_task_view_matched() {
        let id = Uuid::new_v4();
        let state = TaskState::Succeeded {
            result: RecognitionOutcome::Matched {
                person_id: 1,
                name: "Ada".into(),
                roll_number: "CS-01".into(),
                distance: 0.1,
            },
        };
        let view = task_view(id, &state);
        assert_eq!(view["status"], "matched");
        assert_eq!(view["name"], "Ada");
        assert_eq!(view["rollNumber"], "CS-01");
        assert_eq!(view["task_id"], id.to_string());
    }

    #[test]
    fn test_task_view_failed() {
        let id = Uuid::new_v4();
        let view = task_view(
            id,
            &TaskState::Failed {
                error: "boom".into(),
                retryable: true,
            },
        );
        assert_eq!(view["status"], "failed");
        assert_eq!(view["retryable"], true);
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            ApiError::from(StoreError::PersonNotFound(3)),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StoreError::DimensionMismatch { expected: 2, actual: 3 }),
            ApiError::BadRequest(_)
        ));
    }
}
