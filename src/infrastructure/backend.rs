//! Uniform persistence contract over the hosted REST backend and the local blob store.

use crate::domain::models::{DailyStudyRecord, Note, Task};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::local_store::BlobStore;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

const STUDY_KEY_PREFIX: &str = "studyData_";
const TASKS_KEY_PREFIX: &str = "tasks_";
const NOTES_KEY_PREFIX: &str = "notes_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Remote,
    Local,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

/// Every operation is scoped by `user_id`. "Not found" is `Ok(None)` / `Ok(false)`.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn ping(&self) -> Result<(), InfraError>;

    async fn read_study_record(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyStudyRecord>, InfraError>;

    /// Upsert keyed by `(user_id, date)`.
    async fn write_study_record(&self, record: &DailyStudyRecord) -> Result<(), InfraError>;

    /// Inclusive date range, ordered by date ascending.
    async fn list_study_records(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStudyRecord>, InfraError>;

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, InfraError>;
    async fn save_task(&self, user_id: &str, task: &Task) -> Result<(), InfraError>;
    async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<bool, InfraError>;

    async fn list_notes(&self, user_id: &str) -> Result<Vec<Note>, InfraError>;
    async fn save_note(&self, user_id: &str, note: &Note) -> Result<(), InfraError>;
    async fn delete_note(&self, user_id: &str, note_id: &str) -> Result<bool, InfraError>;

    /// Removes every row owned by the user.
    async fn purge_user(&self, user_id: &str) -> Result<(), InfraError>;
}

pub fn study_key(date: NaiveDate) -> String {
    format!("{STUDY_KEY_PREFIX}{date}")
}

pub fn tasks_key(user_id: &str) -> String {
    format!("{TASKS_KEY_PREFIX}{user_id}")
}

pub fn notes_key(user_id: &str) -> String {
    format!("{NOTES_KEY_PREFIX}{user_id}")
}

pub struct LocalBackend<S>
where
    S: BlobStore,
{
    store: Arc<S>,
}

fn id_of_task(task: &Task) -> &str {
    &task.id
}

fn id_of_note(note: &Note) -> &str {
    &note.id
}

fn read_json<S, T>(store: &S, user_id: &str, key: &str) -> Result<Option<T>, InfraError>
where
    S: BlobStore,
    T: DeserializeOwned,
{
    match store.get(user_id, key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

fn upsert_by_id<S, T>(
    store: &S,
    user_id: &str,
    key: &str,
    item: T,
    id_of: fn(&T) -> &str,
) -> Result<(), InfraError>
where
    S: BlobStore,
    T: Serialize + DeserializeOwned + Clone,
{
    store.update(
        user_id,
        key,
        &mut |current: Option<String>| -> Result<Option<String>, InfraError> {
            let mut items: Vec<T> = match current {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Vec::new(),
            };
            match items
                .iter()
                .position(|existing| id_of(existing) == id_of(&item))
            {
                Some(index) => items[index] = item.clone(),
                None => items.push(item.clone()),
            }
            Ok(Some(serde_json::to_string(&items)?))
        },
    )
}

fn remove_by_id<S, T>(
    store: &S,
    user_id: &str,
    key: &str,
    id: &str,
    id_of: fn(&T) -> &str,
) -> Result<bool, InfraError>
where
    S: BlobStore,
    T: Serialize + DeserializeOwned,
{
    let mut removed = false;
    store.update(
        user_id,
        key,
        &mut |current: Option<String>| -> Result<Option<String>, InfraError> {
            let Some(raw) = current else {
                return Ok(None);
            };
            let mut items: Vec<T> = serde_json::from_str(&raw)?;
            let before = items.len();
            items.retain(|candidate| id_of(candidate) != id);
            removed = items.len() != before;
            if !removed {
                return Ok(None);
            }
            Ok(Some(serde_json::to_string(&items)?))
        },
    )?;
    Ok(removed)
}

impl<S> LocalBackend<S>
where
    S: BlobStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Runs store work on the blocking pool; SQLite calls never sit on a runtime worker.
    async fn blocking<T, F>(&self, work: F) -> Result<T, InfraError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, InfraError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || work(store.as_ref()))
            .await
            .map_err(|error| InfraError::Io(std::io::Error::other(error)))?
    }
}

#[async_trait]
impl<S> PersistenceBackend for LocalBackend<S>
where
    S: BlobStore + 'static,
{
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn ping(&self) -> Result<(), InfraError> {
        Ok(())
    }

    async fn read_study_record(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyStudyRecord>, InfraError> {
        let user_id = user_id.to_string();
        self.blocking(move |store| read_json(store, &user_id, &study_key(date)))
            .await
    }

    async fn write_study_record(&self, record: &DailyStudyRecord) -> Result<(), InfraError> {
        record.validate().map_err(InfraError::Validation)?;
        let raw = serde_json::to_string(record)?;
        let user_id = record.user_id.clone();
        let key = study_key(record.date);
        self.blocking(move |store| store.set(&user_id, &key, &raw))
            .await
    }

    async fn list_study_records(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStudyRecord>, InfraError> {
        let user_id = user_id.to_string();
        self.blocking(move |store| {
            let mut records = Vec::new();
            for key in store.list_keys(&user_id, STUDY_KEY_PREFIX)? {
                let Some(record) = read_json::<S, DailyStudyRecord>(store, &user_id, &key)? else {
                    continue;
                };
                if record.date >= start && record.date <= end {
                    records.push(record);
                }
            }
            records.sort_by_key(|record| record.date);
            Ok(records)
        })
        .await
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        let user_id = user_id.to_string();
        let mut tasks: Vec<Task> = self
            .blocking(move |store| read_json::<S, Vec<Task>>(store, &user_id, &tasks_key(&user_id)))
            .await?
            .unwrap_or_default();
        tasks.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        Ok(tasks)
    }

    async fn save_task(&self, user_id: &str, task: &Task) -> Result<(), InfraError> {
        let user_id = user_id.to_string();
        let task = task.clone();
        self.blocking(move |store| {
            upsert_by_id(store, &user_id, &tasks_key(&user_id), task, id_of_task)
        })
        .await
    }

    async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<bool, InfraError> {
        let user_id = user_id.to_string();
        let id = task_id.to_string();
        self.blocking(move |store| {
            remove_by_id(store, &user_id, &tasks_key(&user_id), &id, id_of_task)
        })
        .await
    }

    async fn list_notes(&self, user_id: &str) -> Result<Vec<Note>, InfraError> {
        let user_id = user_id.to_string();
        let mut notes: Vec<Note> = self
            .blocking(move |store| read_json::<S, Vec<Note>>(store, &user_id, &notes_key(&user_id)))
            .await?
            .unwrap_or_default();
        notes.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        Ok(notes)
    }

    async fn save_note(&self, user_id: &str, note: &Note) -> Result<(), InfraError> {
        let user_id = user_id.to_string();
        let note = note.clone();
        self.blocking(move |store| {
            upsert_by_id(store, &user_id, &notes_key(&user_id), note, id_of_note)
        })
        .await
    }

    async fn delete_note(&self, user_id: &str, note_id: &str) -> Result<bool, InfraError> {
        let user_id = user_id.to_string();
        let id = note_id.to_string();
        self.blocking(move |store| {
            remove_by_id(store, &user_id, &notes_key(&user_id), &id, id_of_note)
        })
        .await
    }

    async fn purge_user(&self, user_id: &str) -> Result<(), InfraError> {
        let user_id = user_id.to_string();
        self.blocking(move |store| store.clear_namespace(&user_id))
            .await
    }
}
