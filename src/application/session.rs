use crate::application::reconciler::BackendSelector;
use crate::domain::models::DailyStudyRecord;
use crate::domain::timer::{Expiry, SessionTimer, StudyAccrual, TickOutcome, TimerConfig, TimerState};
use crate::infrastructure::backend::BackendKind;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Best-effort signal that a timer period ended.
pub trait ExpiryNotifier: Send + Sync {
    fn notify(&self, user_id: &str, expiry: Expiry) -> Result<(), InfraError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ExpiryNotifier for LogNotifier {
    fn notify(&self, user_id: &str, expiry: Expiry) -> Result<(), InfraError> {
        tracing::info!(
            user_id,
            from = expiry.from.as_str(),
            to = expiry.to.as_str(),
            "timer period finished"
        );
        Ok(())
    }
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct BellNotifier;

impl ExpiryNotifier for BellNotifier {
    fn notify(&self, _user_id: &str, _expiry: Expiry) -> Result<(), InfraError> {
        let mut stderr = std::io::stderr().lock();
        stderr.write_all(b"\x07")?;
        stderr.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub timer: TimerState,
    pub config: TimerConfig,
    pub grace_pending: bool,
    pub date: NaiveDate,
    pub study_time_seconds: u64,
    pub pomodoro_count: u32,
    pub backend: BackendKind,
}

pub struct StudySession {
    user_id: String,
    timer: SessionTimer,
    accrual: StudyAccrual,
    selector: Arc<BackendSelector>,
    notifier: Arc<dyn ExpiryNotifier>,
    timezone: Tz,
    now_provider: NowProvider,
}

impl StudySession {
    pub fn new(
        user_id: impl Into<String>,
        config: TimerConfig,
        selector: Arc<BackendSelector>,
        timezone: Tz,
    ) -> Result<Self, InfraError> {
        let timer = SessionTimer::new(config).map_err(InfraError::Validation)?;
        let now_provider: NowProvider = Arc::new(Utc::now);
        let today = now_provider().with_timezone(&timezone).date_naive();
        Ok(Self {
            user_id: user_id.into(),
            timer,
            accrual: StudyAccrual::new(today),
            selector,
            notifier: Arc::new(LogNotifier),
            timezone,
            now_provider,
        })
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.accrual = StudyAccrual::new(now_provider().with_timezone(&self.timezone).date_naive());
        self.now_provider = now_provider;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ExpiryNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn today(&self) -> NaiveDate {
        (self.now_provider)().with_timezone(&self.timezone).date_naive()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user_id: self.user_id.clone(),
            timer: self.timer.state(),
            config: self.timer.config(),
            grace_pending: self.timer.grace_pending(),
            date: self.accrual.date(),
            study_time_seconds: self.accrual.study_time_seconds(),
            pomodoro_count: self.accrual.pomodoro_count(),
            backend: self.selector.active(),
        }
    }

    async fn fetch_record(&self, date: NaiveDate) -> Result<Option<DailyStudyRecord>, InfraError> {
        let user_id = self.user_id.as_str();
        self.selector
            .run("load_study_record", |backend| async move {
                backend.read_study_record(user_id, date).await
            })
            .await
    }

    /// Pulls the stored counters for the tracked day. A missing record keeps zeros.
    pub async fn load(&mut self) -> Result<(), InfraError> {
        if let Some(record) = self.fetch_record(self.accrual.date()).await? {
            self.accrual
                .hydrate(record.study_time_seconds, record.pomodoro_count);
        }
        Ok(())
    }

    /// Upserts the tracked day's counters. Returns `false` when there was nothing to write.
    pub async fn save(&self) -> Result<bool, InfraError> {
        if self.accrual.study_time_seconds() == 0 && self.accrual.pomodoro_count() == 0 {
            return Ok(false);
        }
        let record = DailyStudyRecord {
            user_id: self.user_id.clone(),
            date: self.accrual.date(),
            study_time_seconds: self.accrual.study_time_seconds(),
            pomodoro_count: self.accrual.pomodoro_count(),
            updated_at: (self.now_provider)(),
        };
        let record = &record;
        self.selector
            .run("save_study_record", |backend| async move {
                backend.write_study_record(record).await
            })
            .await?;
        tracing::debug!(
            user_id = %self.user_id,
            date = %record.date,
            study_time_seconds = record.study_time_seconds,
            pomodoro_count = record.pomodoro_count,
            "study record saved"
        );
        Ok(true)
    }

    /// Advances the timer by one second. A day change is applied only once the new
    /// day's record has been read; until then the tracked day stays as it was.
    pub async fn tick(&mut self) -> TickOutcome {
        let today = self.today();
        if today != self.accrual.date() {
            self.roll_over(today).await;
        }

        let before = self.timer.state();
        let outcome = self.timer.tick();
        self.accrual.observe(&before, &outcome);

        if let TickOutcome::Expired(expiry) = outcome {
            if let Err(error) = self.notifier.notify(&self.user_id, expiry) {
                tracing::warn!(user_id = %self.user_id, error = %error, "expiry notification failed");
            }
        }
        outcome
    }

    async fn roll_over(&mut self, today: NaiveDate) {
        let stored = match self.fetch_record(today).await {
            Ok(stored) => stored,
            Err(error) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    date = %today,
                    error = %error,
                    "could not load the new day; rollover retried on the next tick"
                );
                return;
            }
        };
        if let Err(error) = self.save().await {
            tracing::warn!(user_id = %self.user_id, error = %error, "failed to flush previous day");
        }
        self.accrual.roll_over(today);
        if let Some(record) = stored {
            self.accrual
                .hydrate(record.study_time_seconds, record.pomodoro_count);
        }
        tracing::info!(user_id = %self.user_id, date = %today, "study day rolled over");
    }

    /// Merges externally reported totals for the tracked day.
    pub fn absorb(&mut self, date: NaiveDate, study_time_seconds: u64, pomodoro_count: u32) {
        if date == self.accrual.date() {
            self.accrual.hydrate(study_time_seconds, pomodoro_count);
        }
    }

    pub fn start(&mut self) {
        self.timer.start();
    }

    pub fn pause(&mut self) {
        self.timer.pause();
    }

    pub fn reset(&mut self) {
        self.timer.reset();
    }

    pub fn set_config(&mut self, config: TimerConfig) -> Result<(), InfraError> {
        self.timer.set_config(config).map_err(InfraError::Validation)
    }
}

/// Background task that drives one user's session.
pub struct SessionRuntime {
    session: Arc<Mutex<StudySession>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SessionRuntime {
    pub fn spawn(session: StudySession, tick_every: Duration, save_every: Duration) -> Self {
        let session = Arc::new(Mutex::new(session));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let worker = Arc::clone(&session);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + tick_every, tick_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            let mut saver = tokio::time::interval_at(Instant::now() + save_every, save_every);
            saver.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        worker.lock().await.tick().await;
                    }
                    _ = saver.tick() => {
                        let session = worker.lock().await;
                        if let Err(error) = session.save().await {
                            tracing::error!(user_id = %session.user_id(), error = %error, "periodic save failed");
                        }
                    }
                }
            }
        });

        Self {
            session,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn session(&self) -> Arc<Mutex<StudySession>> {
        Arc::clone(&self.session)
    }

    /// Stops both intervals, waits for the task and performs the final save.
    pub async fn shutdown(mut self) -> Result<bool, InfraError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                tracing::error!(error = %error, "session task ended abnormally");
            }
        }
        let session = self.session.lock().await;
        let saved = session.save().await;
        drop(session);
        saved
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{FailureMode, FlakyBackend};
    use crate::domain::timer::TimerMode;
    use crate::infrastructure::backend::PersistenceBackend;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn one_second_focus() -> TimerConfig {
        TimerConfig {
            focus_seconds: 1,
            short_break_seconds: 3,
            long_break_seconds: 5,
            cycles_until_long_break: 4,
        }
    }

    struct Clock {
        now: Arc<StdMutex<DateTime<Utc>>>,
    }

    impl Clock {
        fn at(value: &str) -> Self {
            Self {
                now: Arc::new(StdMutex::new(fixed_time(value))),
            }
        }

        fn provider(&self) -> NowProvider {
            let now = Arc::clone(&self.now);
            Arc::new(move || *now.lock().expect("clock lock"))
        }

        fn set(&self, value: &str) {
            *self.now.lock().expect("clock lock") = fixed_time(value);
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ExpiryNotifier for CountingNotifier {
        fn notify(&self, _user_id: &str, _expiry: Expiry) -> Result<(), InfraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(InfraError::Io(std::io::Error::other("speaker unplugged")));
            }
            Ok(())
        }
    }

    fn backends() -> (Arc<FlakyBackend>, Arc<FlakyBackend>, Arc<BackendSelector>) {
        let remote = Arc::new(FlakyBackend::remote());
        let local = Arc::new(FlakyBackend::local());
        let selector = Arc::new(BackendSelector::new(
            Some(Arc::clone(&remote) as Arc<dyn PersistenceBackend>),
            Arc::clone(&local) as Arc<dyn PersistenceBackend>,
        ));
        (remote, local, selector)
    }

    fn session(config: TimerConfig, selector: Arc<BackendSelector>, clock: &Clock) -> StudySession {
        StudySession::new("user_1", config, selector, Tz::UTC)
            .expect("session")
            .with_now_provider(clock.provider())
    }

    #[tokio::test]
    async fn final_second_of_focus_accrues_and_grace_restarts_break() {
        let clock = Clock::at("2026-02-16T10:00:00Z");
        let (_, _, selector) = backends();
        let notifier = Arc::new(CountingNotifier::default());
        let mut session = session(one_second_focus(), selector, &clock)
            .with_notifier(Arc::clone(&notifier) as Arc<dyn ExpiryNotifier>);

        session.start();
        let outcome = session.tick().await;
        assert!(matches!(outcome, TickOutcome::Expired(Expiry { from: TimerMode::Focus, to: TimerMode::ShortBreak })));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.study_time_seconds, 1);
        assert_eq!(snapshot.pomodoro_count, 1);
        assert_eq!(snapshot.timer.remaining_seconds, 3);
        assert!(!snapshot.timer.running);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        assert_eq!(session.tick().await, TickOutcome::Grace { restarted: false });
        assert_eq!(session.tick().await, TickOutcome::Grace { restarted: true });
        assert!(session.snapshot().timer.running);

        session.tick().await;
        assert_eq!(session.snapshot().study_time_seconds, 1);
    }

    #[tokio::test]
    async fn notifier_failure_is_swallowed() {
        let clock = Clock::at("2026-02-16T10:00:00Z");
        let (_, _, selector) = backends();
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let mut session = session(one_second_focus(), selector, &clock)
            .with_notifier(Arc::clone(&notifier) as Arc<dyn ExpiryNotifier>);

        session.start();
        assert!(matches!(session.tick().await, TickOutcome::Expired(_)));
        assert_eq!(session.snapshot().pomodoro_count, 1);
    }

    #[tokio::test]
    async fn zero_counters_skip_the_write() {
        let clock = Clock::at("2026-02-16T10:00:00Z");
        let (remote, local, selector) = backends();
        let session = session(TimerConfig::default(), selector, &clock);

        assert!(!session.save().await.expect("save"));
        assert_eq!(remote.study_writes(), 0);
        assert_eq!(local.study_writes(), 0);
    }

    #[tokio::test]
    async fn load_hydrates_counters_from_stored_record() {
        let clock = Clock::at("2026-02-16T10:00:00Z");
        let (remote, _, selector) = backends();
        remote
            .write_study_record(&DailyStudyRecord {
                user_id: "user_1".to_string(),
                date: NaiveDate::from_ymd_opt(2026, 2, 16).expect("valid date"),
                study_time_seconds: 1200,
                pomodoro_count: 2,
                updated_at: fixed_time("2026-02-16T09:00:00Z"),
            })
            .await
            .expect("seed");

        let mut session = session(TimerConfig::default(), selector, &clock);
        session.load().await.expect("load");
        session.start();
        session.tick().await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.study_time_seconds, 1201);
        assert_eq!(snapshot.pomodoro_count, 2);
    }

    #[tokio::test]
    async fn save_fails_over_to_local_when_remote_is_down() {
        let clock = Clock::at("2026-02-16T10:00:00Z");
        let (remote, local, selector) = backends();
        let mut session = session(TimerConfig::default(), Arc::clone(&selector), &clock);
        session.start();
        session.tick().await;

        remote.set_failure(FailureMode::Transport);
        assert!(session.save().await.expect("save should not surface the failure"));
        assert_eq!(local.study_writes(), 1);
        assert_eq!(selector.active(), BackendKind::Local);

        let stored = local
            .read_study_record("user_1", NaiveDate::from_ymd_opt(2026, 2, 16).expect("valid date"))
            .await
            .expect("read")
            .expect("record");
        assert_eq!(stored.study_time_seconds, 1);
    }

    #[tokio::test]
    async fn date_rollover_flushes_resets_and_reloads() {
        let clock = Clock::at("2026-02-16T23:59:59Z");
        let (remote, _, selector) = backends();
        remote
            .write_study_record(&DailyStudyRecord {
                user_id: "user_1".to_string(),
                date: NaiveDate::from_ymd_opt(2026, 2, 17).expect("valid date"),
                study_time_seconds: 30,
                pomodoro_count: 0,
                updated_at: fixed_time("2026-02-17T00:00:00Z"),
            })
            .await
            .expect("seed");

        let mut session = session(TimerConfig::default(), selector, &clock);
        session.start();
        session.tick().await;
        assert_eq!(session.snapshot().study_time_seconds, 1);

        clock.set("2026-02-17T00:00:01Z");
        session.tick().await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.date, NaiveDate::from_ymd_opt(2026, 2, 17).expect("valid date"));
        assert_eq!(snapshot.study_time_seconds, 31);

        let previous = remote
            .read_study_record("user_1", NaiveDate::from_ymd_opt(2026, 2, 16).expect("valid date"))
            .await
            .expect("read")
            .expect("previous day flushed");
        assert_eq!(previous.study_time_seconds, 1);
    }

    #[tokio::test]
    async fn failed_rollover_load_keeps_the_old_day_and_retries() {
        let clock = Clock::at("2026-02-16T23:59:58Z");
        let (remote, _, selector) = backends();
        let next_day = NaiveDate::from_ymd_opt(2026, 2, 17).expect("valid date");
        remote
            .write_study_record(&DailyStudyRecord {
                user_id: "user_1".to_string(),
                date: next_day,
                study_time_seconds: 3000,
                pomodoro_count: 2,
                updated_at: fixed_time("2026-02-17T00:00:00Z"),
            })
            .await
            .expect("seed");

        let mut session = session(TimerConfig::default(), selector, &clock);
        session.start();
        session.tick().await;

        remote.set_failure(FailureMode::Conflict);
        clock.set("2026-02-17T00:00:01Z");
        session.tick().await;
        let deferred = session.snapshot();
        assert_eq!(deferred.date, NaiveDate::from_ymd_opt(2026, 2, 16).expect("valid date"));
        assert_eq!(deferred.timer.remaining_seconds, TimerConfig::default().focus_seconds - 2);

        remote.set_failure(FailureMode::None);
        session.tick().await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.date, next_day);
        assert_eq!(snapshot.study_time_seconds, 3001);
        assert_eq!(snapshot.pomodoro_count, 2);

        session.save().await.expect("save");
        let stored = remote
            .read_study_record("user_1", next_day)
            .await
            .expect("read")
            .expect("record");
        assert_eq!(stored.study_time_seconds, 3001);
    }

    #[tokio::test]
    async fn local_calendar_day_follows_configured_timezone() {
        let clock = Clock::at("2026-02-16T23:30:00Z");
        let (_, _, selector) = backends();
        let session = StudySession::new("user_1", TimerConfig::default(), selector, chrono_tz::Asia::Tokyo)
            .expect("session")
            .with_now_provider(clock.provider());
        assert_eq!(session.today(), NaiveDate::from_ymd_opt(2026, 2, 17).expect("valid date"));
    }

    #[tokio::test]
    async fn config_change_is_rejected_while_running() {
        let clock = Clock::at("2026-02-16T10:00:00Z");
        let (_, _, selector) = backends();
        let mut session = session(TimerConfig::default(), selector, &clock);
        session.start();
        assert!(matches!(
            session.set_config(one_second_focus()),
            Err(InfraError::Validation(_))
        ));
        session.pause();
        session.set_config(one_second_focus()).expect("config while paused");
        assert_eq!(session.snapshot().timer.remaining_seconds, 1);
    }

    #[tokio::test]
    async fn runtime_ticks_in_background_and_flushes_on_shutdown() {
        let (remote, _, selector) = backends();
        let mut session = StudySession::new("user_1", TimerConfig::default(), selector, Tz::UTC)
            .expect("session");
        session.start();
        let today = session.today();

        let runtime = SessionRuntime::spawn(
            session,
            Duration::from_millis(5),
            Duration::from_secs(3600),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runtime.shutdown().await.expect("shutdown save"));

        let stored = remote
            .read_study_record("user_1", today)
            .await
            .expect("read")
            .expect("flushed record");
        assert!(stored.study_time_seconds > 0);
    }
}
