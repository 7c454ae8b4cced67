use crate::application::analytics::{
    build_analytics, build_dashboard, AnalyticsPeriod, AnalyticsReport, DashboardSummary,
};
use crate::application::bootstrap::{bootstrap_workspace, BootstrapResult};
use crate::application::reconciler::BackendSelector;
use crate::application::session::{
    ExpiryNotifier, LogNotifier, NowProvider, SessionRuntime, SessionSnapshot, StudySession,
};
use crate::application::settings::{load_remote_settings, load_webhook_secret};
use crate::application::webhook::{handle_event, parse_event, WebhookOutcome};
use crate::domain::models::{
    normalize_tags, parse_date, validate_non_empty, DailyStudyRecord, NewNote, NewTask, Note,
    NotePatch, Task, TaskFilter, TaskPatch,
};
use crate::domain::timer::TimerConfig;
use crate::infrastructure::backend::{BackendKind, LocalBackend, PersistenceBackend};
use crate::infrastructure::config::{read_timer_settings, read_timezone, TimerSettings};
use crate::infrastructure::credential_store::KeyringCredentialStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::local_store::SqliteBlobStore;
use crate::infrastructure::remote_client::RemoteBackend;
use crate::infrastructure::webhook_signature::{SignatureHeaders, WebhookVerifier};
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct AppState {
    workspace_root: PathBuf,
    timer_settings: TimerSettings,
    timezone: Tz,
    remote: Option<Arc<dyn PersistenceBackend>>,
    local: Arc<dyn PersistenceBackend>,
    webhook: Option<WebhookVerifier>,
    notifier: Arc<dyn ExpiryNotifier>,
    now_provider: NowProvider,
    tick_interval: Duration,
    id_sequence: AtomicU64,
    runtime: Mutex<RuntimeState>,
}

#[derive(Default)]
struct RuntimeState {
    selectors: HashMap<String, Arc<BackendSelector>>,
    sessions: HashMap<String, SessionRuntime>,
    // Held while a user's session is opened or torn down.
    lifecycles: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AppState {
    /// Wires backends for an already bootstrapped workspace from config, environment
    /// and the OS keyring.
    pub fn open(bootstrap: BootstrapResult) -> Result<Self, InfraError> {
        let remote = match load_remote_settings(
            &bootstrap.config_dir,
            &KeyringCredentialStore::default(),
        )? {
            Some(settings) => {
                tracing::info!(url = %settings.url, "remote backend configured");
                Some(Arc::new(RemoteBackend::new(&settings.url, settings.api_key)?)
                    as Arc<dyn PersistenceBackend>)
            }
            None => {
                tracing::warn!("remote backend not configured; using local storage only");
                None
            }
        };
        let secret = load_webhook_secret();
        if secret.is_none() {
            tracing::warn!("identity webhook secret not configured; webhook requests will fail");
        }
        Self::assemble(bootstrap, remote, secret.as_deref())
    }

    pub fn with_backends(
        workspace_root: PathBuf,
        remote: Option<Arc<dyn PersistenceBackend>>,
        webhook_secret: Option<&str>,
    ) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        Self::assemble(bootstrap, remote, webhook_secret)
    }

    fn assemble(
        bootstrap: BootstrapResult,
        remote: Option<Arc<dyn PersistenceBackend>>,
        webhook_secret: Option<&str>,
    ) -> Result<Self, InfraError> {
        let timer_settings = read_timer_settings(&bootstrap.config_dir)?;
        let timezone = read_timezone(&bootstrap.config_dir)?;
        let webhook = webhook_secret.map(WebhookVerifier::from_secret).transpose()?;
        let local = Arc::new(LocalBackend::new(Arc::new(SqliteBlobStore::new(
            &bootstrap.database_path,
        ))));

        Ok(Self {
            workspace_root: bootstrap.workspace_root,
            timer_settings,
            timezone,
            remote,
            local,
            webhook,
            notifier: Arc::new(LogNotifier),
            now_provider: Arc::new(Utc::now),
            tick_interval: TICK_INTERVAL,
            id_sequence: AtomicU64::new(1),
            runtime: Mutex::new(RuntimeState::default()),
        })
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ExpiryNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn next_id(&self, prefix: &str) -> String {
        let sequence = self.id_sequence.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{}-{sequence}", (self.now_provider)().timestamp_micros())
    }

    fn today(&self) -> NaiveDate {
        (self.now_provider)().with_timezone(&self.timezone).date_naive()
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        self.log_error(command, &error.to_string());
        error.to_string()
    }

    pub fn log_info(&self, command: &str, message: &str) {
        tracing::info!(command, "{message}");
    }

    pub fn log_error(&self, command: &str, message: &str) {
        tracing::error!(command, "{message}");
    }

    fn selector_for(&self, user_id: &str) -> Result<Arc<BackendSelector>, InfraError> {
        let mut runtime = lock_runtime(self)?;
        let selector = runtime
            .selectors
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Arc::new(BackendSelector::new(
                    self.remote.clone(),
                    Arc::clone(&self.local),
                ))
            });
        Ok(Arc::clone(selector))
    }

    fn existing_session(
        &self,
        user_id: &str,
    ) -> Result<Option<Arc<tokio::sync::Mutex<StudySession>>>, InfraError> {
        let runtime = lock_runtime(self)?;
        Ok(runtime.sessions.get(user_id).map(SessionRuntime::session))
    }

    fn lifecycle_for(&self, user_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, InfraError> {
        let mut runtime = lock_runtime(self)?;
        let gate = runtime.lifecycles.entry(user_id.to_string()).or_default();
        Ok(Arc::clone(gate))
    }

    /// Returns the user's running session, creating and loading it on first use.
    /// Opening waits for any teardown in flight so the load sees its final save.
    async fn session_for(
        &self,
        user_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<StudySession>>, InfraError> {
        if let Some(session) = self.existing_session(user_id)? {
            return Ok(session);
        }

        let gate = self.lifecycle_for(user_id)?;
        let _opening = gate.lock().await;
        if let Some(session) = self.existing_session(user_id)? {
            return Ok(session);
        }

        let selector = self.selector_for(user_id)?;
        let mut session = StudySession::new(
            user_id,
            self.timer_settings.timer,
            selector,
            self.timezone,
        )?
        .with_now_provider(Arc::clone(&self.now_provider))
        .with_notifier(Arc::clone(&self.notifier));
        session.load().await?;

        let mut runtime = lock_runtime(self)?;
        let spawned = SessionRuntime::spawn(
            session,
            self.tick_interval,
            Duration::from_secs(self.timer_settings.save_interval_seconds),
        );
        let handle = spawned.session();
        runtime.sessions.insert(user_id.to_string(), spawned);
        drop(runtime);

        self.log_info("open_session", &format!("opened session user_id={user_id}"));
        Ok(handle)
    }

    fn take_session(&self, user_id: &str) -> Result<Option<SessionRuntime>, InfraError> {
        let mut runtime = lock_runtime(self)?;
        Ok(runtime.sessions.remove(user_id))
    }

    /// Tears down every session, flushing each one. Used on process shutdown.
    pub async fn shutdown_sessions(&self) {
        let sessions = match lock_runtime(self) {
            Ok(mut runtime) => runtime.sessions.drain().collect::<Vec<_>>(),
            Err(error) => {
                self.command_error("shutdown_sessions", &error);
                return;
            }
        };
        for (user_id, session) in sessions {
            if let Err(error) = session.shutdown().await {
                self.log_error(
                    "shutdown_sessions",
                    &format!("final save failed user_id={user_id}: {error}"),
                );
            }
        }
    }
}

fn lock_runtime(state: &AppState) -> Result<MutexGuard<'_, RuntimeState>, InfraError> {
    state
        .runtime
        .lock()
        .map_err(|error| InfraError::InvalidConfig(format!("runtime lock poisoned: {error}")))
}

fn normalize_id(value: &str, field_name: &str) -> Result<String, InfraError> {
    validate_non_empty(value, field_name).map_err(InfraError::Validation)?;
    Ok(value.trim().to_string())
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudyTotals {
    #[serde(alias = "todayStudyTime")]
    pub study_time_seconds: u64,
    #[serde(alias = "todayPomodoros")]
    pub pomodoro_count: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReconnectResponse {
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EndSessionResponse {
    pub ended: bool,
    pub saved: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub remote: &'static str,
}

async fn find_task(
    selector: &BackendSelector,
    user_id: &str,
    task_id: &str,
) -> Result<Task, InfraError> {
    let tasks = selector
        .run("list_tasks", |backend| async move { backend.list_tasks(user_id).await })
        .await?;
    tasks
        .into_iter()
        .find(|task| task.id == task_id)
        .ok_or_else(|| InfraError::NotFound(format!("task not found: {task_id}")))
}

async fn store_task(
    selector: &BackendSelector,
    user_id: &str,
    task: &Task,
) -> Result<(), InfraError> {
    task.validate().map_err(InfraError::Validation)?;
    selector
        .run("save_task", |backend| async move {
            backend.save_task(user_id, task).await
        })
        .await
}

pub async fn list_tasks_impl(
    state: &AppState,
    user_id: &str,
    filter: TaskFilter,
) -> Result<Vec<Task>, InfraError> {
    let selector = state.selector_for(user_id)?;
    let tasks = selector
        .run("list_tasks", |backend| async move { backend.list_tasks(user_id).await })
        .await?;
    Ok(tasks.into_iter().filter(|task| filter.matches(task)).collect())
}

pub async fn create_task_impl(
    state: &AppState,
    user_id: &str,
    input: NewTask,
) -> Result<Task, InfraError> {
    let title = input.title.trim();
    validate_non_empty(title, "title").map_err(InfraError::Validation)?;

    let now = (state.now_provider)();
    let trimmed = |value: Option<String>| value.map(|value| value.trim().to_string()).unwrap_or_default();
    let task = Task {
        id: state.next_id("tsk"),
        title: title.to_string(),
        description: trimmed(input.description),
        category: trimmed(input.category),
        estimated: trimmed(input.estimated),
        priority: input.priority.unwrap_or_default(),
        due: input.due,
        completed: input.completed.unwrap_or(false),
        created_at: now,
        updated_at: now,
    };

    let selector = state.selector_for(user_id)?;
    store_task(&selector, user_id, &task).await?;
    state.log_info("create_task", &format!("created task_id={}", task.id));
    Ok(task)
}

pub async fn update_task_impl(
    state: &AppState,
    user_id: &str,
    task_id: &str,
    patch: TaskPatch,
) -> Result<Task, InfraError> {
    let task_id = normalize_id(task_id, "task_id")?;
    let selector = state.selector_for(user_id)?;
    let mut task = find_task(&selector, user_id, &task_id).await?;
    task.apply_patch(patch, (state.now_provider)())
        .map_err(InfraError::Validation)?;
    store_task(&selector, user_id, &task).await?;
    state.log_info("update_task", &format!("updated task_id={task_id}"));
    Ok(task)
}

pub async fn toggle_task_impl(
    state: &AppState,
    user_id: &str,
    task_id: &str,
) -> Result<Task, InfraError> {
    let task_id = normalize_id(task_id, "task_id")?;
    let selector = state.selector_for(user_id)?;
    let mut task = find_task(&selector, user_id, &task_id).await?;
    task.completed = !task.completed;
    task.updated_at = (state.now_provider)();
    store_task(&selector, user_id, &task).await?;
    state.log_info(
        "toggle_task",
        &format!("toggled task_id={task_id} completed={}", task.completed),
    );
    Ok(task)
}

pub async fn delete_task_impl(
    state: &AppState,
    user_id: &str,
    task_id: &str,
) -> Result<bool, InfraError> {
    let task_id = normalize_id(task_id, "task_id")?;
    let selector = state.selector_for(user_id)?;
    let task_id = task_id.as_str();
    let removed = selector
        .run("delete_task", |backend| async move {
            backend.delete_task(user_id, task_id).await
        })
        .await?;
    if removed {
        state.log_info("delete_task", &format!("deleted task_id={task_id}"));
    }
    Ok(removed)
}

async fn find_note(
    selector: &BackendSelector,
    user_id: &str,
    note_id: &str,
) -> Result<Note, InfraError> {
    let notes = selector
        .run("list_notes", |backend| async move { backend.list_notes(user_id).await })
        .await?;
    notes
        .into_iter()
        .find(|note| note.id == note_id)
        .ok_or_else(|| InfraError::NotFound(format!("note not found: {note_id}")))
}

async fn store_note(
    selector: &BackendSelector,
    user_id: &str,
    note: &Note,
) -> Result<(), InfraError> {
    note.validate().map_err(InfraError::Validation)?;
    selector
        .run("save_note", |backend| async move {
            backend.save_note(user_id, note).await
        })
        .await
}

pub async fn list_notes_impl(
    state: &AppState,
    user_id: &str,
    search: Option<String>,
) -> Result<Vec<Note>, InfraError> {
    let selector = state.selector_for(user_id)?;
    let notes = selector
        .run("list_notes", |backend| async move { backend.list_notes(user_id).await })
        .await?;
    let term = search.unwrap_or_default();
    Ok(notes
        .into_iter()
        .filter(|note| note.matches_search(&term))
        .collect())
}

pub async fn create_note_impl(
    state: &AppState,
    user_id: &str,
    input: NewNote,
) -> Result<Note, InfraError> {
    let now = (state.now_provider)();
    let note = Note {
        id: state.next_id("note"),
        title: input.title.trim().to_string(),
        content: input.content,
        tags: normalize_tags(&input.tags),
        created_at: now,
        updated_at: now,
    };
    let selector = state.selector_for(user_id)?;
    store_note(&selector, user_id, &note).await?;
    state.log_info("create_note", &format!("created note_id={}", note.id));
    Ok(note)
}

pub async fn update_note_impl(
    state: &AppState,
    user_id: &str,
    note_id: &str,
    patch: NotePatch,
) -> Result<Note, InfraError> {
    let note_id = normalize_id(note_id, "note_id")?;
    let selector = state.selector_for(user_id)?;
    let mut note = find_note(&selector, user_id, &note_id).await?;

    if let Some(title) = patch.title {
        note.title = title.trim().to_string();
    }
    if let Some(content) = patch.content {
        note.content = content;
    }
    if let Some(tags) = patch.tags {
        note.tags = normalize_tags(&tags);
    }
    note.updated_at = (state.now_provider)();

    store_note(&selector, user_id, &note).await?;
    state.log_info("update_note", &format!("updated note_id={note_id}"));
    Ok(note)
}

pub async fn delete_note_impl(
    state: &AppState,
    user_id: &str,
    note_id: &str,
) -> Result<bool, InfraError> {
    let note_id = normalize_id(note_id, "note_id")?;
    let selector = state.selector_for(user_id)?;
    let note_id = note_id.as_str();
    let removed = selector
        .run("delete_note", |backend| async move {
            backend.delete_note(user_id, note_id).await
        })
        .await?;
    if removed {
        state.log_info("delete_note", &format!("deleted note_id={note_id}"));
    }
    Ok(removed)
}

pub async fn get_study_record_impl(
    state: &AppState,
    user_id: &str,
    date: Option<String>,
) -> Result<DailyStudyRecord, InfraError> {
    let date = match date.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        Some(raw) => parse_date(raw, "date").map_err(InfraError::Validation)?,
        None => state.today(),
    };
    let selector = state.selector_for(user_id)?;
    let stored = selector
        .run("read_study_record", |backend| async move {
            backend.read_study_record(user_id, date).await
        })
        .await?;
    Ok(stored.unwrap_or_else(|| DailyStudyRecord::empty(user_id, date, (state.now_provider)())))
}

/// Explicit save of today's totals reported by a client. Counters only grow: each one
/// is written as the larger of the stored and the posted value.
pub async fn save_study_record_impl(
    state: &AppState,
    user_id: &str,
    totals: StudyTotals,
) -> Result<DailyStudyRecord, InfraError> {
    let date = state.today();
    let mut record = DailyStudyRecord {
        user_id: user_id.to_string(),
        date,
        study_time_seconds: totals.study_time_seconds,
        pomodoro_count: totals.pomodoro_count,
        updated_at: (state.now_provider)(),
    };
    record.validate().map_err(InfraError::Validation)?;

    let selector = state.selector_for(user_id)?;
    let existing = selector
        .run("read_study_record", |backend| async move {
            backend.read_study_record(user_id, date).await
        })
        .await?;
    if let Some(existing) = existing {
        record.study_time_seconds = record.study_time_seconds.max(existing.study_time_seconds);
        record.pomodoro_count = record.pomodoro_count.max(existing.pomodoro_count);
    }

    let stored = &record;
    selector
        .run("save_study_record", |backend| async move {
            backend.write_study_record(stored).await
        })
        .await?;

    if let Some(session) = state.existing_session(user_id)? {
        session.lock().await.absorb(
            record.date,
            record.study_time_seconds,
            record.pomodoro_count,
        );
    }
    state.log_info(
        "save_study_record",
        &format!("saved study record user_id={user_id} date={}", record.date),
    );
    Ok(record)
}

pub async fn timer_state_impl(
    state: &AppState,
    user_id: &str,
) -> Result<SessionSnapshot, InfraError> {
    let session = state.session_for(user_id).await?;
    let snapshot = session.lock().await.snapshot();
    Ok(snapshot)
}

pub async fn start_timer_impl(
    state: &AppState,
    user_id: &str,
) -> Result<SessionSnapshot, InfraError> {
    let session = state.session_for(user_id).await?;
    let mut session = session.lock().await;
    session.start();
    state.log_info("start_timer", &format!("started timer user_id={user_id}"));
    Ok(session.snapshot())
}

pub async fn pause_timer_impl(
    state: &AppState,
    user_id: &str,
) -> Result<SessionSnapshot, InfraError> {
    let session = state.session_for(user_id).await?;
    let mut session = session.lock().await;
    session.pause();
    state.log_info("pause_timer", &format!("paused timer user_id={user_id}"));
    Ok(session.snapshot())
}

pub async fn reset_timer_impl(
    state: &AppState,
    user_id: &str,
) -> Result<SessionSnapshot, InfraError> {
    let session = state.session_for(user_id).await?;
    let mut session = session.lock().await;
    session.reset();
    state.log_info("reset_timer", &format!("reset timer user_id={user_id}"));
    Ok(session.snapshot())
}

pub async fn update_timer_config_impl(
    state: &AppState,
    user_id: &str,
    config: TimerConfig,
) -> Result<SessionSnapshot, InfraError> {
    let session = state.session_for(user_id).await?;
    let mut session = session.lock().await;
    session.set_config(config)?;
    state.log_info(
        "update_timer_config",
        &format!("updated timer config user_id={user_id}"),
    );
    Ok(session.snapshot())
}

pub async fn end_session_impl(
    state: &AppState,
    user_id: &str,
) -> Result<EndSessionResponse, InfraError> {
    let gate = state.lifecycle_for(user_id)?;
    let _closing = gate.lock().await;
    let Some(session) = state.take_session(user_id)? else {
        return Ok(EndSessionResponse {
            ended: false,
            saved: false,
        });
    };
    let saved = session.shutdown().await?;
    state.log_info("end_session", &format!("ended session user_id={user_id} saved={saved}"));
    Ok(EndSessionResponse { ended: true, saved })
}

pub async fn reconnect_impl(
    state: &AppState,
    user_id: &str,
) -> Result<ReconnectResponse, InfraError> {
    let selector = state.selector_for(user_id)?;
    let backend = selector.reconnect().await;
    state.log_info(
        "reconnect",
        &format!("user_id={user_id} backend={}", backend.as_str()),
    );
    Ok(ReconnectResponse { backend })
}

pub async fn analytics_impl(
    state: &AppState,
    user_id: &str,
    period: AnalyticsPeriod,
) -> Result<AnalyticsReport, InfraError> {
    let selector = state.selector_for(user_id)?;
    build_analytics(&selector, user_id, period, state.today(), state.timezone).await
}

pub async fn dashboard_impl(
    state: &AppState,
    user_id: &str,
) -> Result<DashboardSummary, InfraError> {
    let selector = state.selector_for(user_id)?;
    build_dashboard(&selector, user_id, state.today(), (state.now_provider)()).await
}

pub async fn identity_webhook_impl(
    state: &AppState,
    headers: SignatureHeaders<'_>,
    body: &[u8],
) -> Result<WebhookOutcome, InfraError> {
    let Some(verifier) = &state.webhook else {
        return Err(InfraError::InvalidConfig(
            "identity webhook secret is not configured".to_string(),
        ));
    };
    verifier.verify(&headers, body, (state.now_provider)())?;
    let event = parse_event(body)?;

    let deleted_user = match event.data.id.as_deref().map(str::trim) {
        Some(user_id) if event.event_type == "user.deleted" && !user_id.is_empty() => {
            Some(user_id.to_string())
        }
        _ => None,
    };
    let gate = deleted_user
        .as_deref()
        .map(|user_id| state.lifecycle_for(user_id))
        .transpose()?;
    let _purging = match &gate {
        Some(gate) => Some(gate.lock().await),
        None => None,
    };
    if let Some(user_id) = &deleted_user {
        // Abort without flushing so no save lands after the purge.
        drop(state.take_session(user_id)?);
    }
    let selector = match event.data.id.as_deref().map(str::trim) {
        Some(user_id) if !user_id.is_empty() => state.selector_for(user_id)?,
        _ => Arc::new(BackendSelector::new(state.remote.clone(), Arc::clone(&state.local))),
    };
    let outcome = handle_event(&selector, event).await?;

    if let WebhookOutcome::Purged { user_id } = &outcome {
        let mut runtime = lock_runtime(state)?;
        runtime.selectors.remove(user_id);
        runtime.lifecycles.remove(user_id);
        drop(runtime);
        state.log_info("identity_webhook", &format!("purged user_id={user_id}"));
    }
    Ok(outcome)
}

pub async fn health_impl(state: &AppState) -> HealthResponse {
    let remote = match &state.remote {
        None => "disabled",
        Some(remote) => match remote.ping().await {
            Ok(()) => "reachable",
            Err(error) => {
                tracing::warn!(error = %error, "remote health check failed");
                "unreachable"
            }
        },
    };
    HealthResponse {
        status: "ok",
        remote,
    }
}
