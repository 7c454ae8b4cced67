use crate::application::reconciler::BackendSelector;
use crate::domain::models::{DailyStudyRecord, Note, Task};
use crate::infrastructure::error::InfraError;
use chrono::{Datelike, Duration, NaiveDate};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Minimum seconds of study for a day to count towards the streak.
pub const STREAK_MIN_SECONDS: u64 = 300;
pub const STREAK_LOOKBACK_DAYS: i64 = 30;
const TOP_TAGS: usize = 5;
const RECENT_TASKS: usize = 5;
const UPCOMING_TASKS: usize = 5;
const RECENT_NOTES: usize = 3;
const WEEKDAY_LABELS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsPeriod {
    #[default]
    Week,
    Month,
    Year,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodBucket {
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub hours: f64,
    pub completed_tasks: u32,
    pub pomodoros: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagCount {
    pub name: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsStats {
    pub total_hours: f64,
    pub average_hours: f64,
    pub study_days: u32,
    pub completed_tasks: u32,
    pub pomodoro_count: u32,
    pub streak_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub period: AnalyticsPeriod,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub buckets: Vec<PeriodBucket>,
    pub tags: Vec<TagCount>,
    pub stats: AnalyticsStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    pub today: DailyStudyRecord,
    pub streak_days: u32,
    pub recent_tasks: Vec<Task>,
    pub upcoming_tasks: Vec<Task>,
    pub recent_notes: Vec<Note>,
}

/// Consecutive qualifying days ending today; zero when today does not qualify.
pub fn study_streak(records: &[DailyStudyRecord], today: NaiveDate) -> u32 {
    let qualifying = records
        .iter()
        .filter(|record| record.study_time_seconds >= STREAK_MIN_SECONDS)
        .map(|record| record.date)
        .collect::<std::collections::HashSet<_>>();

    let mut streak = 0;
    let mut day = today;
    while qualifying.contains(&day) && i64::from(streak) <= STREAK_LOOKBACK_DAYS {
        streak += 1;
        match day.pred_opt() {
            Some(previous) => day = previous,
            None => break,
        }
    }
    streak
}

/// Tag frequencies across notes, most frequent first, ties by name.
pub fn tag_counts(notes: &[Note]) -> Vec<TagCount> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for note in notes {
        for tag in &note.tags {
            *counts.entry(tag.as_str()).or_default() += 1;
        }
    }
    let mut ranked = counts
        .into_iter()
        .map(|(name, count)| TagCount {
            name: name.to_string(),
            count,
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|left, right| {
        right
            .count
            .cmp(&left.count)
            .then_with(|| left.name.cmp(&right.name))
    });
    ranked.truncate(TOP_TAGS);
    ranked
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

fn bucket_ranges(
    period: AnalyticsPeriod,
    today: NaiveDate,
) -> Result<Vec<(String, NaiveDate, NaiveDate)>, InfraError> {
    let invalid = || InfraError::Validation(format!("cannot build analytics period for {today}"));
    match period {
        AnalyticsPeriod::Week => {
            let sunday =
                today - Duration::days(i64::from(today.weekday().num_days_from_sunday()));
            Ok(WEEKDAY_LABELS
                .iter()
                .enumerate()
                .map(|(offset, label)| {
                    let day = sunday + Duration::days(offset as i64);
                    (label.to_string(), day, day)
                })
                .collect())
        }
        AnalyticsPeriod::Month => {
            let month_end = last_day_of_month(today.year(), today.month()).ok_or_else(invalid)?;
            (0..4u32)
                .map(|week| {
                    let start = NaiveDate::from_ymd_opt(today.year(), today.month(), week * 7 + 1)
                        .ok_or_else(invalid)?;
                    let end = if week == 3 {
                        month_end
                    } else {
                        start + Duration::days(6)
                    };
                    Ok((format!("Week {}", week + 1), start, end))
                })
                .collect()
        }
        AnalyticsPeriod::Year => MONTH_LABELS
            .iter()
            .enumerate()
            .map(|(index, label)| {
                let month = index as u32 + 1;
                let start =
                    NaiveDate::from_ymd_opt(today.year(), month, 1).ok_or_else(invalid)?;
                let end = last_day_of_month(today.year(), month).ok_or_else(invalid)?;
                Ok((label.to_string(), start, end))
            })
            .collect(),
    }
}

/// Aggregates records and completed tasks into the buckets of `period`.
pub fn summarize(
    period: AnalyticsPeriod,
    today: NaiveDate,
    timezone: Tz,
    records: &[DailyStudyRecord],
    tasks: &[Task],
    notes: &[Note],
    streak_days: u32,
) -> Result<AnalyticsReport, InfraError> {
    let ranges = bucket_ranges(period, today)?;
    let (start, end) = match (ranges.first(), ranges.last()) {
        (Some(first), Some(last)) => (first.1, last.2),
        _ => return Err(InfraError::Validation("empty analytics period".to_string())),
    };

    let mut completed_by_day: BTreeMap<NaiveDate, u32> = BTreeMap::new();
    for task in tasks.iter().filter(|task| task.completed) {
        let day = task.updated_at.with_timezone(&timezone).date_naive();
        *completed_by_day.entry(day).or_default() += 1;
    }

    let in_range = |date: NaiveDate, from: NaiveDate, to: NaiveDate| date >= from && date <= to;
    let buckets = ranges
        .into_iter()
        .map(|(label, from, to)| {
            let seconds: u64 = records
                .iter()
                .filter(|record| in_range(record.date, from, to))
                .map(|record| record.study_time_seconds)
                .sum();
            let pomodoros = records
                .iter()
                .filter(|record| in_range(record.date, from, to))
                .map(|record| record.pomodoro_count)
                .sum();
            let completed_tasks = completed_by_day
                .range(from..=to)
                .map(|(_, count)| *count)
                .sum();
            PeriodBucket {
                label,
                start: from,
                end: to,
                hours: round_tenths(seconds as f64 / 3600.0),
                completed_tasks,
                pomodoros,
            }
        })
        .collect::<Vec<_>>();

    let in_period = records
        .iter()
        .filter(|record| in_range(record.date, start, end))
        .collect::<Vec<_>>();
    let total_seconds: u64 = in_period.iter().map(|record| record.study_time_seconds).sum();
    let study_days = in_period
        .iter()
        .filter(|record| record.study_time_seconds > 0)
        .count() as u32;
    let total_hours = total_seconds as f64 / 3600.0;

    Ok(AnalyticsReport {
        period,
        start,
        end,
        buckets,
        tags: tag_counts(notes),
        stats: AnalyticsStats {
            total_hours: round_tenths(total_hours),
            average_hours: round_tenths(total_hours / f64::from(study_days.max(1))),
            study_days,
            completed_tasks: tasks.iter().filter(|task| task.completed).count() as u32,
            pomodoro_count: in_period.iter().map(|record| record.pomodoro_count).sum(),
            streak_days,
        },
    })
}

fn round_tenths(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Picks the recent and upcoming lists shown on the dashboard.
pub fn dashboard_lists(tasks: &[Task], notes: &[Note]) -> (Vec<Task>, Vec<Task>, Vec<Note>) {
    let mut recent_tasks = tasks.to_vec();
    recent_tasks.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
    recent_tasks.truncate(RECENT_TASKS);

    let mut upcoming_tasks = tasks
        .iter()
        .filter(|task| !task.completed && task.due.is_some())
        .cloned()
        .collect::<Vec<_>>();
    upcoming_tasks.sort_by_key(|task| task.due);
    upcoming_tasks.truncate(UPCOMING_TASKS);

    let mut recent_notes = notes.to_vec();
    recent_notes.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
    recent_notes.truncate(RECENT_NOTES);

    (recent_tasks, upcoming_tasks, recent_notes)
}

pub async fn load_streak(
    selector: &BackendSelector,
    user_id: &str,
    today: NaiveDate,
) -> Result<u32, InfraError> {
    let start = today - Duration::days(STREAK_LOOKBACK_DAYS);
    let records = selector
        .run("list_study_records", |backend| async move {
            backend.list_study_records(user_id, start, today).await
        })
        .await?;
    Ok(study_streak(&records, today))
}

pub async fn build_analytics(
    selector: &BackendSelector,
    user_id: &str,
    period: AnalyticsPeriod,
    today: NaiveDate,
    timezone: Tz,
) -> Result<AnalyticsReport, InfraError> {
    let ranges = bucket_ranges(period, today)?;
    let (start, end) = match (ranges.first(), ranges.last()) {
        (Some(first), Some(last)) => (first.1, last.2),
        _ => return Err(InfraError::Validation("empty analytics period".to_string())),
    };

    let records = selector
        .run("list_study_records", |backend| async move {
            backend.list_study_records(user_id, start, end).await
        })
        .await?;
    let tasks = selector
        .run("list_tasks", |backend| async move { backend.list_tasks(user_id).await })
        .await?;
    let notes = selector
        .run("list_notes", |backend| async move { backend.list_notes(user_id).await })
        .await?;
    let streak_days = load_streak(selector, user_id, today).await?;

    summarize(period, today, timezone, &records, &tasks, &notes, streak_days)
}

pub async fn build_dashboard(
    selector: &BackendSelector,
    user_id: &str,
    today: NaiveDate,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<DashboardSummary, InfraError> {
    let stored = selector
        .run("read_study_record", |backend| async move {
            backend.read_study_record(user_id, today).await
        })
        .await?;
    let tasks = selector
        .run("list_tasks", |backend| async move { backend.list_tasks(user_id).await })
        .await?;
    let notes = selector
        .run("list_notes", |backend| async move { backend.list_notes(user_id).await })
        .await?;
    let streak_days = load_streak(selector, user_id, today).await?;

    let (recent_tasks, upcoming_tasks, recent_notes) = dashboard_lists(&tasks, &notes);
    Ok(DashboardSummary {
        today: stored.unwrap_or_else(|| DailyStudyRecord::empty(user_id, today, now)),
        streak_days,
        recent_tasks,
        upcoming_tasks,
        recent_notes,
    })
}
