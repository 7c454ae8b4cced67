use crate::domain::timer::TimerConfig;
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const TIMER_JSON: &str = "timer.json";
const BACKEND_JSON: &str = "backend.json";
const DEFAULT_SAVE_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub timer: serde_json::Value,
    pub backend: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    pub timer: TimerConfig,
    pub save_interval_seconds: u64,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "StudyPulse",
                "timezone": "UTC"
            }),
        ),
        (
            TIMER_JSON,
            serde_json::json!({
                "schema": 1,
                "focusMinutes": 25,
                "shortBreakMinutes": 5,
                "longBreakMinutes": 15,
                "cyclesUntilLongBreak": 4,
                "saveIntervalSeconds": DEFAULT_SAVE_INTERVAL_SECONDS
            }),
        ),
        (
            BACKEND_JSON,
            serde_json::json!({
                "schema": 1,
                "mode": "remote",
                "remoteUrl": null
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        timer: read_config(&config_dir.join(TIMER_JSON))?,
        backend: read_config(&config_dir.join(BACKEND_JSON))?,
    })
}

fn read_minutes(value: &serde_json::Value, key: &str, fallback: u32) -> Result<u32, InfraError> {
    match value.get(key) {
        None | Some(serde_json::Value::Null) => Ok(fallback),
        Some(raw) => raw
            .as_u64()
            .and_then(|minutes| u32::try_from(minutes).ok())
            .filter(|minutes| *minutes > 0)
            .ok_or_else(|| InfraError::InvalidConfig(format!("{key} must be a positive integer"))),
    }
}

pub fn read_timer_settings(config_dir: &Path) -> Result<TimerSettings, InfraError> {
    let timer = read_config(&config_dir.join(TIMER_JSON))?;
    let defaults = TimerConfig::default();
    let config = TimerConfig {
        focus_seconds: read_minutes(&timer, "focusMinutes", defaults.focus_seconds / 60)? * 60,
        short_break_seconds: read_minutes(
            &timer,
            "shortBreakMinutes",
            defaults.short_break_seconds / 60,
        )? * 60,
        long_break_seconds: read_minutes(
            &timer,
            "longBreakMinutes",
            defaults.long_break_seconds / 60,
        )? * 60,
        cycles_until_long_break: read_minutes(
            &timer,
            "cyclesUntilLongBreak",
            defaults.cycles_until_long_break,
        )?,
    };
    config.validate().map_err(InfraError::InvalidConfig)?;

    let save_interval_seconds = timer
        .get("saveIntervalSeconds")
        .and_then(serde_json::Value::as_u64)
        .filter(|seconds| *seconds > 0)
        .unwrap_or(DEFAULT_SAVE_INTERVAL_SECONDS);

    Ok(TimerSettings {
        timer: config,
        save_interval_seconds,
    })
}

pub fn read_timezone(config_dir: &Path) -> Result<Tz, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    let name = app
        .get("timezone")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("UTC");
    name.parse::<Tz>()
        .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone '{name}': {error}")))
}

pub fn read_backend_mode(config_dir: &Path) -> Result<BackendMode, InfraError> {
    let backend = read_config(&config_dir.join(BACKEND_JSON))?;
    match backend
        .get("mode")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
    {
        None | Some("remote") => Ok(BackendMode::Remote),
        Some("local") => Ok(BackendMode::Local),
        Some(other) => Err(InfraError::InvalidConfig(format!(
            "unsupported backend mode '{other}'"
        ))),
    }
}

pub fn read_remote_url(config_dir: &Path) -> Result<Option<String>, InfraError> {
    let backend = read_config(&config_dir.join(BACKEND_JSON))?;
    Ok(backend
        .get("remoteUrl")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned))
}
