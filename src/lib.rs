pub mod application;
pub mod domain;
pub mod infrastructure;

use application::analytics::{AnalyticsPeriod, AnalyticsReport, DashboardSummary};
use application::commands::{
    analytics_impl, create_note_impl, create_task_impl, dashboard_impl, delete_note_impl,
    delete_task_impl, end_session_impl, get_study_record_impl, health_impl,
    identity_webhook_impl, list_notes_impl, list_tasks_impl, pause_timer_impl, reconnect_impl,
    reset_timer_impl, save_study_record_impl, start_timer_impl, timer_state_impl,
    toggle_task_impl, update_note_impl, update_task_impl, update_timer_config_impl, AppState,
    EndSessionResponse, HealthResponse, ReconnectResponse, StudyTotals,
};
use application::session::SessionSnapshot;
use application::webhook::WebhookOutcome;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use domain::models::{DailyStudyRecord, NewNote, NewTask, Note, NotePatch, Task, TaskFilter, TaskPatch};
use domain::timer::TimerConfig;
use infrastructure::error::InfraError;
use infrastructure::webhook_signature::SignatureHeaders;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type SharedState = Arc<AppState>;

const USER_HEADER: &str = "x-user-id";

/// Caller identity forwarded by the upstream identity proxy.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized"))?;
        Ok(Self(user_id.to_string()))
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn from_command(state: &AppState, command: &str, error: InfraError) -> Self {
        let status = status_for(&error);
        Self::new(status, state.command_error(command, &error))
    }
}

fn status_for(error: &InfraError) -> StatusCode {
    match error {
        InfraError::Validation(_) | InfraError::Signature(_) => StatusCode::BAD_REQUEST,
        InfraError::NotFound(_) => StatusCode::NOT_FOUND,
        InfraError::Remote { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct TaskListQuery {
    #[serde(default)]
    filter: Option<TaskFilter>,
}

#[derive(Debug, Default, Deserialize)]
struct NoteListQuery {
    #[serde(default)]
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct DateQuery {
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PeriodQuery {
    #[serde(default)]
    period: Option<AnalyticsPeriod>,
}

#[derive(Debug, Deserialize)]
struct TaskUpdateRequest {
    id: String,
    #[serde(flatten)]
    patch: TaskPatch,
}

#[derive(Debug, Deserialize)]
struct NoteUpdateRequest {
    id: String,
    #[serde(flatten)]
    patch: NotePatch,
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    deleted: bool,
}

fn deleted_or_not_found(
    state: &AppState,
    command: &str,
    kind: &str,
    id: &str,
    removed: bool,
) -> ApiResult<DeletedResponse> {
    if removed {
        Ok(Json(DeletedResponse { deleted: true }))
    } else {
        Err(ApiError::from_command(
            state,
            command,
            InfraError::NotFound(format!("{kind} not found: {id}")),
        ))
    }
}

async fn list_tasks(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Vec<Task>> {
    list_tasks_impl(&state, &user_id, query.filter.unwrap_or_default())
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "list_tasks", error))
}

async fn create_task(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(input): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    create_task_impl(&state, &user_id, input)
        .await
        .map(|task| (StatusCode::CREATED, Json(task)))
        .map_err(|error| ApiError::from_command(&state, "create_task", error))
}

async fn update_task(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<TaskUpdateRequest>,
) -> ApiResult<Task> {
    update_task_impl(&state, &user_id, &request.id, request.patch)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "update_task", error))
}

async fn delete_task(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<IdQuery>,
) -> ApiResult<DeletedResponse> {
    let removed = delete_task_impl(&state, &user_id, &query.id)
        .await
        .map_err(|error| ApiError::from_command(&state, "delete_task", error))?;
    deleted_or_not_found(&state, "delete_task", "task", &query.id, removed)
}

async fn toggle_task(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(task_id): Path<String>,
) -> ApiResult<Task> {
    toggle_task_impl(&state, &user_id, &task_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "toggle_task", error))
}

async fn list_notes(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<NoteListQuery>,
) -> ApiResult<Vec<Note>> {
    list_notes_impl(&state, &user_id, query.search)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "list_notes", error))
}

async fn create_note(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(input): Json<NewNote>,
) -> Result<(StatusCode, Json<Note>), ApiError> {
    create_note_impl(&state, &user_id, input)
        .await
        .map(|note| (StatusCode::CREATED, Json(note)))
        .map_err(|error| ApiError::from_command(&state, "create_note", error))
}

async fn update_note(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(request): Json<NoteUpdateRequest>,
) -> ApiResult<Note> {
    update_note_impl(&state, &user_id, &request.id, request.patch)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "update_note", error))
}

async fn delete_note(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<IdQuery>,
) -> ApiResult<DeletedResponse> {
    let removed = delete_note_impl(&state, &user_id, &query.id)
        .await
        .map_err(|error| ApiError::from_command(&state, "delete_note", error))?;
    deleted_or_not_found(&state, "delete_note", "note", &query.id, removed)
}

async fn get_study_record(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<DateQuery>,
) -> ApiResult<DailyStudyRecord> {
    get_study_record_impl(&state, &user_id, query.date)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "get_study_record", error))
}

async fn save_study_record(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(totals): Json<StudyTotals>,
) -> ApiResult<DailyStudyRecord> {
    save_study_record_impl(&state, &user_id, totals)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "save_study_record", error))
}

async fn timer_state(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<SessionSnapshot> {
    timer_state_impl(&state, &user_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "timer_state", error))
}

async fn start_timer(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<SessionSnapshot> {
    start_timer_impl(&state, &user_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "start_timer", error))
}

async fn pause_timer(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<SessionSnapshot> {
    pause_timer_impl(&state, &user_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "pause_timer", error))
}

async fn reset_timer(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<SessionSnapshot> {
    reset_timer_impl(&state, &user_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "reset_timer", error))
}

async fn update_timer_config(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Json(config): Json<TimerConfig>,
) -> ApiResult<SessionSnapshot> {
    update_timer_config_impl(&state, &user_id, config)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "update_timer_config", error))
}

async fn reconnect(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<ReconnectResponse> {
    reconnect_impl(&state, &user_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "reconnect", error))
}

async fn end_session(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<EndSessionResponse> {
    end_session_impl(&state, &user_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "end_session", error))
}

async fn analytics(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<PeriodQuery>,
) -> ApiResult<AnalyticsReport> {
    analytics_impl(&state, &user_id, query.period.unwrap_or_default())
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "analytics", error))
}

async fn dashboard(
    State(state): State<SharedState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
) -> ApiResult<DashboardSummary> {
    dashboard_impl(&state, &user_id)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "dashboard", error))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

async fn identity_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookOutcome> {
    let signature = SignatureHeaders {
        id: header_str(&headers, "svix-id"),
        timestamp: header_str(&headers, "svix-timestamp"),
        signature: header_str(&headers, "svix-signature"),
    };
    identity_webhook_impl(&state, signature, &body)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_command(&state, "identity_webhook", error))
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(health_impl(&state).await)
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/api/tasks",
            get(list_tasks)
                .post(create_task)
                .put(update_task)
                .delete(delete_task),
        )
        .route("/api/tasks/{id}/toggle", post(toggle_task))
        .route(
            "/api/notes",
            get(list_notes)
                .post(create_note)
                .put(update_note)
                .delete(delete_note),
        )
        .route("/api/pomodoro", get(get_study_record).post(save_study_record))
        .route("/api/timer", get(timer_state).delete(end_session))
        .route("/api/timer/start", post(start_timer))
        .route("/api/timer/pause", post(pause_timer))
        .route("/api/timer/reset", post(reset_timer))
        .route("/api/timer/config", put(update_timer_config))
        .route("/api/timer/reconnect", post(reconnect))
        .route("/api/analytics", get(analytics))
        .route("/api/dashboard", get(dashboard))
        .route("/api/webhook/identity", post(identity_webhook))
        .route("/health", get(health))
        .with_state(state)
}
