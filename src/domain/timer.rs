//! Pomodoro session timer and the study-time accrual that rides on its ticks.
//!
//! Both types are plain state: they never read the clock or sleep. The runtime feeds
//! them one `tick` per elapsed second and decides what to do with the outcome.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Ticks the timer stays stopped after an expiry before it restarts itself.
pub const GRACE_TICKS: u32 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    Focus,
    ShortBreak,
    LongBreak,
}

impl TimerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Focus => "focus",
            Self::ShortBreak => "short_break",
            Self::LongBreak => "long_break",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerConfig {
    pub focus_seconds: u32,
    pub short_break_seconds: u32,
    pub long_break_seconds: u32,
    pub cycles_until_long_break: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            focus_seconds: 25 * 60,
            short_break_seconds: 5 * 60,
            long_break_seconds: 15 * 60,
            cycles_until_long_break: 4,
        }
    }
}

impl TimerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.focus_seconds == 0 {
            return Err("timer.focus_seconds must be > 0".to_string());
        }
        if self.short_break_seconds == 0 {
            return Err("timer.short_break_seconds must be > 0".to_string());
        }
        if self.long_break_seconds == 0 {
            return Err("timer.long_break_seconds must be > 0".to_string());
        }
        if self.cycles_until_long_break == 0 {
            return Err("timer.cycles_until_long_break must be > 0".to_string());
        }
        Ok(())
    }

    pub fn duration_for(&self, mode: TimerMode) -> u32 {
        match mode {
            TimerMode::Focus => self.focus_seconds,
            TimerMode::ShortBreak => self.short_break_seconds,
            TimerMode::LongBreak => self.long_break_seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerState {
    pub mode: TimerMode,
    pub remaining_seconds: u32,
    pub running: bool,
    pub completed_focus_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub from: TimerMode,
    pub to: TimerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Timer stopped and no grace countdown pending.
    Idle,
    Counting,
    /// Grace countdown consumed one tick; `restarted` is set on the tick that resumed.
    Grace { restarted: bool },
    Expired(Expiry),
}

#[derive(Debug, Clone)]
pub struct SessionTimer {
    config: TimerConfig,
    state: TimerState,
    grace_remaining: Option<u32>,
}

impl SessionTimer {
    pub fn new(config: TimerConfig) -> Result<Self, String> {
        config.validate()?;
        Ok(Self {
            config,
            state: TimerState {
                mode: TimerMode::Focus,
                remaining_seconds: config.focus_seconds,
                running: false,
                completed_focus_count: 0,
            },
            grace_remaining: None,
        })
    }

    pub fn config(&self) -> TimerConfig {
        self.config
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn grace_pending(&self) -> bool {
        self.grace_remaining.is_some()
    }

    pub fn start(&mut self) {
        self.grace_remaining = None;
        if !self.state.running {
            self.state.running = true;
        }
    }

    pub fn pause(&mut self) {
        self.grace_remaining = None;
        if self.state.running {
            self.state.running = false;
        }
    }

    pub fn reset(&mut self) {
        self.grace_remaining = None;
        self.state.running = false;
        self.state.remaining_seconds = self.config.duration_for(self.state.mode);
    }

    pub fn set_config(&mut self, config: TimerConfig) -> Result<(), String> {
        if self.state.running {
            return Err("timer config cannot change while the timer is running".to_string());
        }
        config.validate()?;
        let previous = self.config.duration_for(self.state.mode);
        self.config = config;
        let current = config.duration_for(self.state.mode);
        if current != previous || self.state.remaining_seconds > current {
            self.state.remaining_seconds = current;
        }
        Ok(())
    }

    pub fn tick(&mut self) -> TickOutcome {
        if !self.state.running {
            return self.tick_grace();
        }

        self.state.remaining_seconds = self.state.remaining_seconds.saturating_sub(1);
        if self.state.remaining_seconds > 0 {
            return TickOutcome::Counting;
        }

        let from = self.state.mode;
        let to = match from {
            TimerMode::Focus => {
                self.state.completed_focus_count += 1;
                if self.state.completed_focus_count % self.config.cycles_until_long_break == 0 {
                    TimerMode::LongBreak
                } else {
                    TimerMode::ShortBreak
                }
            }
            TimerMode::LongBreak => {
                self.state.completed_focus_count = 0;
                TimerMode::Focus
            }
            TimerMode::ShortBreak => TimerMode::Focus,
        };

        self.state.mode = to;
        self.state.remaining_seconds = self.config.duration_for(to);
        self.state.running = false;
        self.grace_remaining = Some(GRACE_TICKS);
        TickOutcome::Expired(Expiry { from, to })
    }

    fn tick_grace(&mut self) -> TickOutcome {
        let Some(remaining) = self.grace_remaining else {
            return TickOutcome::Idle;
        };
        let remaining = remaining.saturating_sub(1);
        if remaining == 0 {
            self.start();
            TickOutcome::Grace { restarted: true }
        } else {
            self.grace_remaining = Some(remaining);
            TickOutcome::Grace { restarted: false }
        }
    }
}

/// Per-day study counters derived from timer ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyAccrual {
    date: NaiveDate,
    study_time_seconds: u64,
    pomodoro_count: u32,
}

impl StudyAccrual {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            study_time_seconds: 0,
            pomodoro_count: 0,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn study_time_seconds(&self) -> u64 {
        self.study_time_seconds
    }

    pub fn pomodoro_count(&self) -> u32 {
        self.pomodoro_count
    }

    /// Starts a fresh day. Returns `false` when `today` is the tracked date.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today == self.date {
            return false;
        }
        *self = Self::new(today);
        true
    }

    /// Replaces the counters with stored values; never moves them backwards.
    pub fn hydrate(&mut self, study_time_seconds: u64, pomodoro_count: u32) {
        self.study_time_seconds = self.study_time_seconds.max(study_time_seconds);
        self.pomodoro_count = self.pomodoro_count.max(pomodoro_count);
    }

    /// `before` is the timer state at the moment the tick fired.
    pub fn observe(&mut self, before: &TimerState, outcome: &TickOutcome) {
        if before.running && before.mode == TimerMode::Focus {
            self.study_time_seconds += 1;
        }
        if let TickOutcome::Expired(Expiry {
            from: TimerMode::Focus,
            ..
        }) = outcome
        {
            self.pomodoro_count += 1;
        }
    }
}
