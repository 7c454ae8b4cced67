use crate::infrastructure::config::{ensure_default_configs, load_configs};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

const DATABASE_FILE: &str = "studypulse.sqlite";

#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
}

/// Creates `config/`, `state/` and `logs/`, writes missing default configs and
/// initialises the local store schema. Safe to run on every start.
pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join(DATABASE_FILE);

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    load_configs(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        logs_dir,
        database_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "studypulse-bootstrap-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            Self { path }
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn bootstrap_creates_layout_and_is_repeatable() {
        let workspace = TempWorkspace::new();
        let first = bootstrap_workspace(&workspace.path).expect("first bootstrap");
        assert!(first.config_dir.join("app.json").exists());
        assert!(first.config_dir.join("timer.json").exists());
        assert!(first.config_dir.join("backend.json").exists());
        assert!(first.logs_dir.is_dir());
        assert!(first.database_path.exists());

        fs::write(
            first.config_dir.join("app.json"),
            r#"{"schema":1,"appName":"Custom","timezone":"Asia/Tokyo"}"#,
        )
        .expect("customize app config");
        bootstrap_workspace(&workspace.path).expect("second bootstrap");
        let app = fs::read_to_string(first.config_dir.join("app.json")).expect("read app config");
        assert!(app.contains("Custom"));
    }

    #[test]
    fn invalid_config_schema_fails_bootstrap() {
        let workspace = TempWorkspace::new();
        bootstrap_workspace(&workspace.path).expect("first bootstrap");
        fs::write(workspace.path.join("config/timer.json"), r#"{"schema":3}"#)
            .expect("break timer config");
        assert!(matches!(
            bootstrap_workspace(&workspace.path),
            Err(InfraError::InvalidConfig(_))
        ));
    }
}
