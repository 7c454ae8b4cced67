//! Scriptable backend shared by the application-layer tests.

use crate::domain::models::{DailyStudyRecord, Note, Task};
use crate::infrastructure::backend::{BackendKind, LocalBackend, PersistenceBackend};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::local_store::InMemoryBlobStore;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    None,
    Transport,
    Conflict,
}

pub struct FlakyBackend {
    kind: BackendKind,
    inner: LocalBackend<InMemoryBlobStore>,
    failure: Mutex<FailureMode>,
    calls: AtomicUsize,
    writes: AtomicUsize,
}

impl FlakyBackend {
    fn with_kind(kind: BackendKind) -> Self {
        Self {
            kind,
            inner: LocalBackend::new(Arc::new(InMemoryBlobStore::default())),
            failure: Mutex::new(FailureMode::None),
            calls: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn remote() -> Self {
        Self::with_kind(BackendKind::Remote)
    }

    pub fn local() -> Self {
        Self::with_kind(BackendKind::Local)
    }

    pub fn set_failure(&self, mode: FailureMode) {
        *self.failure.lock().expect("failure lock") = mode;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn study_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), InfraError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.failure.lock().expect("failure lock") {
            FailureMode::None => Ok(()),
            FailureMode::Transport => {
                Err(InfraError::Transport("connection refused".to_string()))
            }
            FailureMode::Conflict => Err(InfraError::Remote {
                status: 409,
                message: "conflict".to_string(),
            }),
        }
    }
}

#[async_trait]
impl PersistenceBackend for FlakyBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn ping(&self) -> Result<(), InfraError> {
        self.enter()
    }

    async fn read_study_record(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyStudyRecord>, InfraError> {
        self.enter()?;
        self.inner.read_study_record(user_id, date).await
    }

    async fn write_study_record(&self, record: &DailyStudyRecord) -> Result<(), InfraError> {
        self.enter()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_study_record(record).await
    }

    async fn list_study_records(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStudyRecord>, InfraError> {
        self.enter()?;
        self.inner.list_study_records(user_id, start, end).await
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        self.enter()?;
        self.inner.list_tasks(user_id).await
    }

    async fn save_task(&self, user_id: &str, task: &Task) -> Result<(), InfraError> {
        self.enter()?;
        self.inner.save_task(user_id, task).await
    }

    async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<bool, InfraError> {
        self.enter()?;
        self.inner.delete_task(user_id, task_id).await
    }

    async fn list_notes(&self, user_id: &str) -> Result<Vec<Note>, InfraError> {
        self.enter()?;
        self.inner.list_notes(user_id).await
    }

    async fn save_note(&self, user_id: &str, note: &Note) -> Result<(), InfraError> {
        self.enter()?;
        self.inner.save_note(user_id, note).await
    }

    async fn delete_note(&self, user_id: &str, note_id: &str) -> Result<bool, InfraError> {
        self.enter()?;
        self.inner.delete_note(user_id, note_id).await
    }

    async fn purge_user(&self, user_id: &str) -> Result<(), InfraError> {
        self.enter()?;
        self.inner.purge_user(user_id).await
    }
}
