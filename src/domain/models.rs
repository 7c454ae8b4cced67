use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyStudyRecord {
    pub user_id: String,
    pub date: NaiveDate,
    #[serde(alias = "todayStudyTime")]
    pub study_time_seconds: u64,
    #[serde(alias = "todayPomodoros")]
    pub pomodoro_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl DailyStudyRecord {
    pub fn empty(user_id: impl Into<String>, date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            date,
            study_time_seconds: 0,
            pomodoro_count: 0,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.study_time_seconds == 0 && self.pomodoro_count == 0
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.user_id, "study_record.user_id")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub estimated: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub due: Option<NaiveDate>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "task.id")?;
        validate_non_empty(&self.title, "task.title")?;
        if self.updated_at < self.created_at {
            return Err("task.updated_at must be >= task.created_at".to_string());
        }
        Ok(())
    }

    /// Overlays the fields present in `patch`; blank titles are rejected.
    pub fn apply_patch(&mut self, patch: TaskPatch, now: DateTime<Utc>) -> Result<(), String> {
        if let Some(title) = patch.title {
            let title = title.trim();
            validate_non_empty(title, "title")?;
            self.title = title.to_string();
        }
        if let Some(description) = patch.description {
            self.description = description.trim().to_string();
        }
        if let Some(category) = patch.category {
            self.category = category.trim().to_string();
        }
        if let Some(estimated) = patch.estimated {
            self.estimated = estimated.trim().to_string();
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(due) = patch.due {
            self.due = due;
        }
        if let Some(completed) = patch.completed {
            self.completed = completed;
        }
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub estimated: Option<String>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub due: Option<NaiveDate>,
    #[serde(default)]
    pub completed: Option<bool>,
}

/// Partial task update. `due: Some(None)` clears the due date.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub estimated: Option<String>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default, with = "double_option")]
    pub due: Option<Option<NaiveDate>>,
    #[serde(default)]
    pub completed: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskFilter {
    #[default]
    All,
    Active,
    Completed,
}

impl TaskFilter {
    pub fn matches(self, task: &Task) -> bool {
        match self {
            Self::All => true,
            Self::Active => !task.completed,
            Self::Completed => task.completed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "note.id")?;
        validate_non_empty(&self.title, "note.title")?;
        validate_non_empty(&self.content, "note.content")?;
        for tag in &self.tags {
            validate_non_empty(tag, "note.tags[]")?;
        }
        Ok(())
    }

    pub fn matches_search(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return true;
        }
        self.title.to_lowercase().contains(&term)
            || self.content.to_lowercase().contains(&term)
            || self.tags.iter().any(|tag| tag.to_lowercase().contains(&term))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewNote {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Trims, drops blanks and removes duplicates while keeping first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() || normalized.iter().any(|existing| existing == tag) {
            continue;
        }
        normalized.push(tag.to_string());
    }
    normalized
}

pub fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

pub fn parse_date(value: &str, field_name: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| format!("{field_name} must be YYYY-MM-DD"))
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Serialize,
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_task() -> Task {
        Task {
            id: "tsk-1".to_string(),
            title: "Linear algebra problem set".to_string(),
            description: "chapter 3".to_string(),
            category: "math".to_string(),
            estimated: "2h".to_string(),
            priority: TaskPriority::High,
            due: Some(NaiveDate::from_ymd_opt(2026, 2, 20).expect("valid date")),
            completed: false,
            created_at: fixed_time("2026-02-16T08:00:00Z"),
            updated_at: fixed_time("2026-02-16T08:00:00Z"),
        }
    }

    fn sample_note() -> Note {
        Note {
            id: "note-1".to_string(),
            title: "Eigenvalues".to_string(),
            content: "# Summary\n\n`det(A - λI) = 0`".to_string(),
            tags: vec!["math".to_string(), "exam".to_string()],
            created_at: fixed_time("2026-02-16T08:00:00Z"),
            updated_at: fixed_time("2026-02-16T09:00:00Z"),
        }
    }

    #[test]
    fn task_validate_rejects_empty_title() {
        let mut task = sample_task();
        task.title = "   ".to_string();
        assert!(task.validate().is_err());
    }

    #[test]
    fn task_patch_merges_present_fields_only() {
        let mut task = sample_task();
        let now = fixed_time("2026-02-17T10:00:00Z");
        task.apply_patch(
            TaskPatch {
                completed: Some(true),
                due: Some(None),
                ..TaskPatch::default()
            },
            now,
        )
        .expect("apply patch");

        assert!(task.completed);
        assert_eq!(task.due, None);
        assert_eq!(task.title, "Linear algebra problem set");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.updated_at, now);
    }

    #[test]
    fn task_patch_rejects_blank_title() {
        let mut task = sample_task();
        let result = task.apply_patch(
            TaskPatch {
                title: Some(" ".to_string()),
                ..TaskPatch::default()
            },
            Utc::now(),
        );
        assert!(result.is_err());
        assert_eq!(task.title, "Linear algebra problem set");
    }

    #[test]
    fn task_patch_distinguishes_missing_and_null_due() {
        let missing: TaskPatch = serde_json::from_str(r#"{"title":"x"}"#).expect("parse");
        let cleared: TaskPatch = serde_json::from_str(r#"{"due":null}"#).expect("parse");
        let set: TaskPatch = serde_json::from_str(r#"{"due":"2026-03-01"}"#).expect("parse");
        assert_eq!(missing.due, None);
        assert_eq!(cleared.due, Some(None));
        assert_eq!(
            set.due,
            Some(Some(NaiveDate::from_ymd_opt(2026, 3, 1).expect("valid date")))
        );
    }

    #[test]
    fn task_filter_selects_by_completion() {
        let mut done = sample_task();
        done.completed = true;
        let open = sample_task();
        assert!(TaskFilter::All.matches(&done));
        assert!(TaskFilter::Completed.matches(&done));
        assert!(!TaskFilter::Active.matches(&done));
        assert!(TaskFilter::Active.matches(&open));
    }

    #[test]
    fn note_search_is_case_insensitive_over_title_content_and_tags() {
        let note = sample_note();
        assert!(note.matches_search("EIGEN"));
        assert!(note.matches_search("det(a"));
        assert!(note.matches_search("Exa"));
        assert!(note.matches_search("   "));
        assert!(!note.matches_search("physics"));
    }

    #[test]
    fn note_validate_requires_content() {
        let mut note = sample_note();
        note.content = String::new();
        assert!(note.validate().is_err());
    }

    #[test]
    fn study_record_accepts_legacy_local_field_names() {
        let record: DailyStudyRecord = serde_json::from_str(
            r#"{"user_id":"user_1","date":"2026-02-16","todayStudyTime":1500,"todayPomodoros":1,"updated_at":"2026-02-16T10:00:00Z"}"#,
        )
        .expect("parse legacy record");
        assert_eq!(record.study_time_seconds, 1500);
        assert_eq!(record.pomodoro_count, 1);
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("2026-02-16", "date").is_ok());
        assert!(parse_date("16/02/2026", "date").is_err());
    }

    proptest! {
        #[test]
        fn normalized_tags_are_trimmed_distinct_and_non_blank(
            tags in prop::collection::vec("[ a-c]{0,4}", 0..12)
        ) {
            let normalized = normalize_tags(&tags);
            for (index, tag) in normalized.iter().enumerate() {
                prop_assert!(!tag.is_empty());
                prop_assert_eq!(tag.trim(), tag.as_str());
                prop_assert!(!normalized[index + 1..].contains(tag));
            }
            for tag in &tags {
                if !tag.trim().is_empty() {
                    prop_assert!(normalized.iter().any(|candidate| candidate == tag.trim()));
                }
            }
        }
    }

    #[test]
    fn domain_models_support_serde_roundtrip() {
        let task = sample_task();
        let note = sample_note();
        let task_roundtrip: Task =
            serde_json::from_str(&serde_json::to_string(&task).expect("serialize task"))
                .expect("deserialize task");
        let note_roundtrip: Note =
            serde_json::from_str(&serde_json::to_string(&note).expect("serialize note"))
                .expect("deserialize note");
        assert_eq!(task_roundtrip, task);
        assert_eq!(note_roundtrip, note);
    }
}
