use crate::domain::models::{DailyStudyRecord, Note, Task};
use crate::infrastructure::backend::{BackendKind, PersistenceBackend};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates,return=minimal";
const RETURN_REPRESENTATION: &str = "return=representation";
const USER_OWNED_TABLES: [&str; 5] = [
    "user_settings",
    "timer_data",
    "tasks",
    "notes",
    "user_achievements",
];

/// PostgREST client for the hosted relational backend.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    client: Client,
    base_url: Url,
    api_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskRow {
    user_id: String,
    #[serde(flatten)]
    task: Task,
}

#[derive(Debug, Serialize)]
struct NoteRow<'a> {
    id: &'a str,
    user_id: &'a str,
    title: &'a str,
    content: &'a str,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct NoteWithTagsRow {
    id: String,
    title: String,
    content: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    note_tags: Vec<NoteTagJoin>,
}

#[derive(Debug, Deserialize)]
struct NoteTagJoin {
    tags: Option<TagName>,
}

#[derive(Debug, Deserialize)]
struct TagName {
    name: String,
}

#[derive(Debug, Serialize)]
struct NewTagRow<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct TagRow {
    id: i64,
}

#[derive(Debug, Serialize)]
struct NoteTagRow<'a> {
    note_id: &'a str,
    tag_id: i64,
}

impl NoteWithTagsRow {
    fn into_note(self) -> Note {
        Note {
            id: self.id,
            title: self.title,
            content: self.content,
            tags: self
                .note_tags
                .into_iter()
                .filter_map(|join| join.tags.map(|tag| tag.name))
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl RemoteBackend {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, InfraError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(InfraError::InvalidConfig(
                "remote api key must not be empty".to_string(),
            ));
        }
        let base_url = Url::parse(base_url.trim()).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid remote url '{base_url}': {error}"))
        })?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| InfraError::Transport(format!("failed to build http client: {error}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.trim().to_string(),
        })
    }

    fn table_endpoint(&self, table: &str) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("remote URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("rest");
            segments.push("v1");
            segments.push(table);
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, table: &str) -> Result<RequestBuilder, InfraError> {
        let url = self.table_endpoint(table)?;
        Ok(self
            .client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key))
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> Result<String, InfraError> {
        let response = request
            .send()
            .await
            .map_err(|error| InfraError::Transport(format!("network error while {action}: {error}")))?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Transport(format!("failed reading response while {action}: {error}"))
        })?;

        if !status.is_success() {
            let message = if body.trim().is_empty() {
                format!("{action} failed")
            } else {
                format!("{action} failed; body={body}")
            };
            return Err(InfraError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }

    async fn fetch<T>(&self, request: RequestBuilder, action: &str) -> Result<T, InfraError>
    where
        T: DeserializeOwned,
    {
        let body = self.send(request, action).await?;
        serde_json::from_str(&body).map_err(InfraError::from)
    }

    async fn upsert<T>(&self, table: &str, conflict: &str, rows: &T) -> Result<(), InfraError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let request = self
            .request(reqwest::Method::POST, table)?
            .query(&[("on_conflict", conflict)])
            .header("Prefer", MERGE_DUPLICATES)
            .json(rows);
        self.send(request, &format!("upserting into {table}")).await?;
        Ok(())
    }

    async fn delete_owned(&self, table: &str, user_id: &str, id: &str) -> Result<bool, InfraError> {
        let request = self
            .request(reqwest::Method::DELETE, table)?
            .query(&[
                ("id", format!("eq.{id}")),
                ("user_id", format!("eq.{user_id}")),
            ])
            .header("Prefer", RETURN_REPRESENTATION);
        let deleted: Vec<serde_json::Value> = self
            .fetch(request, &format!("deleting from {table}"))
            .await?;
        Ok(!deleted.is_empty())
    }

    async fn replace_note_tags(&self, note_id: &str, tags: &[String]) -> Result<(), InfraError> {
        let clear = self
            .request(reqwest::Method::DELETE, "note_tags")?
            .query(&[("note_id", format!("eq.{note_id}"))]);
        self.send(clear, "clearing note tags").await?;

        if tags.is_empty() {
            return Ok(());
        }

        let names = tags
            .iter()
            .map(|name| NewTagRow { name: name.as_str() })
            .collect::<Vec<_>>();
        let request = self
            .request(reqwest::Method::POST, "tags")?
            .query(&[("on_conflict", "name")])
            .header(
                "Prefer",
                "resolution=merge-duplicates,return=representation",
            )
            .json(&names);
        let stored: Vec<TagRow> = self.fetch(request, "upserting tags").await?;

        let links = stored
            .iter()
            .map(|tag| NoteTagRow {
                note_id,
                tag_id: tag.id,
            })
            .collect::<Vec<_>>();
        self.upsert("note_tags", "note_id,tag_id", &links).await
    }
}

#[async_trait]
impl PersistenceBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn ping(&self) -> Result<(), InfraError> {
        let request = self
            .request(reqwest::Method::GET, "health_check")?
            .query(&[("select", "*"), ("limit", "1")]);
        self.send(request, "probing health").await?;
        Ok(())
    }

    async fn read_study_record(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyStudyRecord>, InfraError> {
        let request = self
            .request(reqwest::Method::GET, "timer_data")?
            .query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{user_id}")),
                ("date", format!("eq.{date}")),
                ("limit", "1".to_string()),
            ]);
        let rows: Vec<DailyStudyRecord> = self.fetch(request, "reading timer data").await?;
        Ok(rows.into_iter().next())
    }

    async fn write_study_record(&self, record: &DailyStudyRecord) -> Result<(), InfraError> {
        record.validate().map_err(InfraError::Validation)?;
        self.upsert("timer_data", "user_id,date", std::slice::from_ref(record))
            .await
    }

    async fn list_study_records(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyStudyRecord>, InfraError> {
        let request = self
            .request(reqwest::Method::GET, "timer_data")?
            .query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{user_id}")),
                ("date", format!("gte.{start}")),
                ("date", format!("lte.{end}")),
                ("order", "date.asc".to_string()),
            ]);
        self.fetch(request, "listing timer data").await
    }

    async fn list_tasks(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        let request = self
            .request(reqwest::Method::GET, "tasks")?
            .query(&[
                ("select", "*".to_string()),
                ("user_id", format!("eq.{user_id}")),
                ("order", "created_at.desc".to_string()),
            ]);
        let rows: Vec<TaskRow> = self.fetch(request, "listing tasks").await?;
        Ok(rows.into_iter().map(|row| row.task).collect())
    }

    async fn save_task(&self, user_id: &str, task: &Task) -> Result<(), InfraError> {
        let row = TaskRow {
            user_id: user_id.to_string(),
            task: task.clone(),
        };
        self.upsert("tasks", "id", &[row]).await
    }

    async fn delete_task(&self, user_id: &str, task_id: &str) -> Result<bool, InfraError> {
        self.delete_owned("tasks", user_id, task_id).await
    }

    async fn list_notes(&self, user_id: &str) -> Result<Vec<Note>, InfraError> {
        let request = self
            .request(reqwest::Method::GET, "notes")?
            .query(&[
                ("select", "*,note_tags(tags(name))".to_string()),
                ("user_id", format!("eq.{user_id}")),
                ("order", "updated_at.desc".to_string()),
            ]);
        let rows: Vec<NoteWithTagsRow> = self.fetch(request, "listing notes").await?;
        Ok(rows.into_iter().map(NoteWithTagsRow::into_note).collect())
    }

    async fn save_note(&self, user_id: &str, note: &Note) -> Result<(), InfraError> {
        let row = NoteRow {
            id: &note.id,
            user_id,
            title: &note.title,
            content: &note.content,
            created_at: note.created_at,
            updated_at: note.updated_at,
        };
        self.upsert("notes", "id", &[row]).await?;
        self.replace_note_tags(&note.id, &note.tags).await
    }

    async fn delete_note(&self, user_id: &str, note_id: &str) -> Result<bool, InfraError> {
        self.delete_owned("notes", user_id, note_id).await
    }

    async fn purge_user(&self, user_id: &str) -> Result<(), InfraError> {
        for table in USER_OWNED_TABLES {
            let request = self
                .request(reqwest::Method::DELETE, table)?
                .query(&[("user_id", format!("eq.{user_id}"))]);
            self.send(request, &format!("purging {table}")).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskPriority;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn day(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn backend(server: &MockServer) -> RemoteBackend {
        RemoteBackend::new(&server.uri(), "anon-key").expect("remote backend")
    }

    #[tokio::test]
    async fn empty_result_reads_as_missing_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/timer_data"))
            .and(query_param("user_id", "eq.user_1"))
            .and(query_param("date", "eq.2026-02-16"))
            .and(header("apikey", "anon-key"))
            .and(header("authorization", "Bearer anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let record = backend(&server)
            .read_study_record("user_1", day("2026-02-16"))
            .await
            .expect("read");
        assert_eq!(record, None);
    }

    #[tokio::test]
    async fn stored_row_is_parsed_into_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/timer_data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": 7,
                "user_id": "user_1",
                "date": "2026-02-16",
                "study_time_seconds": 1500,
                "pomodoro_count": 1,
                "created_at": "2026-02-16T08:00:00+00:00",
                "updated_at": "2026-02-16T09:00:00.123456+00:00"
            }])))
            .mount(&server)
            .await;

        let record = backend(&server)
            .read_study_record("user_1", day("2026-02-16"))
            .await
            .expect("read")
            .expect("record");
        assert_eq!(record.study_time_seconds, 1500);
        assert_eq!(record.pomodoro_count, 1);
    }

    #[tokio::test]
    async fn study_record_write_is_an_upsert_on_user_and_date() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/timer_data"))
            .and(query_param("on_conflict", "user_id,date"))
            .and(|request: &Request| {
                request
                    .headers
                    .get("prefer")
                    .and_then(|value| value.to_str().ok())
                    == Some(MERGE_DUPLICATES)
            })
            .and(body_json(serde_json::json!([{
                "user_id": "user_1",
                "date": "2026-02-16",
                "study_time_seconds": 60,
                "pomodoro_count": 0,
                "updated_at": "2026-02-16T10:00:00Z"
            }])))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let record = DailyStudyRecord {
            user_id: "user_1".to_string(),
            date: day("2026-02-16"),
            study_time_seconds: 60,
            pomodoro_count: 0,
            updated_at: fixed_time("2026-02-16T10:00:00Z"),
        };
        backend(&server)
            .write_study_record(&record)
            .await
            .expect("write");
    }

    #[tokio::test]
    async fn server_errors_are_failover_class() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let error = backend(&server).ping().await.expect_err("ping should fail");
        assert!(matches!(error, InfraError::Remote { status: 503, .. }));
        assert!(error.is_failover());
    }

    #[tokio::test]
    async fn client_errors_are_not_failover_class() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let error = backend(&server)
            .list_tasks("user_1")
            .await
            .expect_err("listing should fail");
        assert!(!error.is_failover());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let remote =
            RemoteBackend::new(&format!("http://127.0.0.1:{port}"), "anon-key").expect("remote backend");
        let error = remote.ping().await.expect_err("ping should fail");
        assert!(matches!(error, InfraError::Transport(_)));
        assert!(error.is_failover());
    }

    #[tokio::test]
    async fn tasks_are_listed_with_user_scope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/tasks"))
            .and(query_param("user_id", "eq.user_1"))
            .and(query_param("order", "created_at.desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": "tsk-1",
                "user_id": "user_1",
                "title": "Read chapter 4",
                "description": "",
                "category": "",
                "estimated": "",
                "priority": "high",
                "due": null,
                "completed": false,
                "created_at": "2026-02-16T08:00:00+00:00",
                "updated_at": "2026-02-16T08:00:00+00:00"
            }])))
            .mount(&server)
            .await;

        let tasks = backend(&server).list_tasks("user_1").await.expect("list");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, TaskPriority::High);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_matched() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/tasks"))
            .and(query_param("id", "eq.tsk-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{ "id": "tsk-1" }])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/tasks"))
            .and(query_param("id", "eq.missing"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let remote = backend(&server);
        assert!(remote.delete_task("user_1", "tsk-1").await.expect("delete"));
        assert!(!remote.delete_task("user_1", "missing").await.expect("delete"));
    }

    #[tokio::test]
    async fn notes_are_read_with_joined_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/notes"))
            .and(query_param("select", "*,note_tags(tags(name))"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": "note-1",
                "user_id": "user_1",
                "title": "Eigenvalues",
                "content": "det(A - λI) = 0",
                "created_at": "2026-02-16T08:00:00+00:00",
                "updated_at": "2026-02-16T09:00:00+00:00",
                "note_tags": [
                    { "tags": { "name": "math" } },
                    { "tags": null }
                ]
            }])))
            .mount(&server)
            .await;

        let notes = backend(&server).list_notes("user_1").await.expect("list");
        assert_eq!(notes[0].tags, vec!["math".to_string()]);
    }

    #[tokio::test]
    async fn saving_a_note_rewrites_its_tag_links() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/notes"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/note_tags"))
            .and(query_param("note_id", "eq.note-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/tags"))
            .and(query_param("on_conflict", "name"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!([
                { "id": 3, "name": "math" }
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/note_tags"))
            .and(body_json(serde_json::json!([{ "note_id": "note-1", "tag_id": 3 }])))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let note = Note {
            id: "note-1".to_string(),
            title: "Eigenvalues".to_string(),
            content: "det(A - λI) = 0".to_string(),
            tags: vec!["math".to_string()],
            created_at: fixed_time("2026-02-16T08:00:00Z"),
            updated_at: fixed_time("2026-02-16T09:00:00Z"),
        };
        backend(&server)
            .save_note("user_1", &note)
            .await
            .expect("save note");
    }

    #[tokio::test]
    async fn purge_user_deletes_from_every_owned_table() {
        let server = MockServer::start().await;
        for table in USER_OWNED_TABLES {
            Mock::given(method("DELETE"))
                .and(path(format!("/rest/v1/{table}")))
                .and(query_param("user_id", "eq.user_1"))
                .respond_with(ResponseTemplate::new(204))
                .expect(1)
                .mount(&server)
                .await;
        }

        backend(&server).purge_user("user_1").await.expect("purge");
    }

    #[test]
    fn blank_api_key_is_rejected() {
        assert!(matches!(
            RemoteBackend::new("https://db.example.test", " "),
            Err(InfraError::InvalidConfig(_))
        ));
    }
}
