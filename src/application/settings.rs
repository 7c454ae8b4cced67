use crate::infrastructure::config::{read_backend_mode, read_remote_url, BackendMode};
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::error::InfraError;
use std::path::Path;

const REMOTE_URL_KEYS: [&str; 2] = ["STUDYPULSE_REMOTE_URL", "SUPABASE_URL"];
const REMOTE_KEY_KEYS: [&str; 2] = ["STUDYPULSE_REMOTE_KEY", "SUPABASE_ANON_KEY"];
const WEBHOOK_SECRET_KEYS: [&str; 2] = ["STUDYPULSE_WEBHOOK_SECRET", "IDENTITY_WEBHOOK_SECRET"];

#[derive(Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    pub url: String,
    pub api_key: String,
}

impl std::fmt::Debug for RemoteSettings {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RemoteSettings")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

pub fn load_remote_settings(
    config_dir: &Path,
    credential_store: &dyn CredentialStore,
) -> Result<Option<RemoteSettings>, InfraError> {
    load_remote_settings_from_lookup(config_dir, credential_store, |key| {
        std::env::var(key).ok()
    })
}

/// `None` means the service runs against local storage only.
pub fn load_remote_settings_from_lookup<F>(
    config_dir: &Path,
    credential_store: &dyn CredentialStore,
    lookup: F,
) -> Result<Option<RemoteSettings>, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    if read_backend_mode(config_dir)? == BackendMode::Local {
        return Ok(None);
    }

    let url = match optional_lookup_value(&lookup, &REMOTE_URL_KEYS) {
        Some(url) => Some(url),
        None => read_remote_url(config_dir)?,
    };
    let Some(url) = url else {
        return Ok(None);
    };

    let api_key = match optional_lookup_value(&lookup, &REMOTE_KEY_KEYS) {
        Some(api_key) => Some(api_key),
        None => match credential_store.load_api_key() {
            Ok(api_key) => api_key,
            Err(error) => {
                tracing::warn!(error = %error, "remote api key unavailable from credential store");
                None
            }
        },
    };
    Ok(api_key.map(|api_key| RemoteSettings { url, api_key }))
}

pub fn load_webhook_secret() -> Option<String> {
    load_webhook_secret_from_lookup(|key| std::env::var(key).ok())
}

pub fn load_webhook_secret_from_lookup<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(&lookup, &WEBHOOK_SECRET_KEYS)
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = lookup(key) {
            let normalized = value.trim();
            if !normalized.is_empty() {
                return Some(normalized.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::ensure_default_configs;
    use crate::infrastructure::credential_store::InMemoryCredentialStore;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DIR: AtomicUsize = AtomicUsize::new(0);

    struct TempConfigDir {
        path: PathBuf,
    }

    impl TempConfigDir {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DIR.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "studypulse-settings-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp config dir");
            ensure_default_configs(&path).expect("write defaults");
            Self { path }
        }
    }

    impl Drop for TempConfigDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn primary_keys_take_precedence_over_fallbacks() {
        let dir = TempConfigDir::new();
        let settings = load_remote_settings_from_lookup(
            &dir.path,
            &InMemoryCredentialStore::default(),
            lookup_from(&[
                ("STUDYPULSE_REMOTE_URL", "https://primary.example.test"),
                ("SUPABASE_URL", "https://fallback.example.test"),
                ("SUPABASE_ANON_KEY", " anon-key "),
            ]),
        )
        .expect("load settings")
        .expect("remote configured");

        assert_eq!(settings.url, "https://primary.example.test");
        assert_eq!(settings.api_key, "anon-key");
    }

    #[test]
    fn api_key_falls_back_to_credential_store() {
        let dir = TempConfigDir::new();
        let settings = load_remote_settings_from_lookup(
            &dir.path,
            &InMemoryCredentialStore::with_api_key("stored-key"),
            lookup_from(&[("SUPABASE_URL", "https://db.example.test")]),
        )
        .expect("load settings")
        .expect("remote configured");
        assert_eq!(settings.api_key, "stored-key");
    }

    #[test]
    fn missing_url_or_key_means_local_only() {
        let dir = TempConfigDir::new();
        let store = InMemoryCredentialStore::default();
        assert_eq!(
            load_remote_settings_from_lookup(&dir.path, &store, lookup_from(&[]))
                .expect("load settings"),
            None
        );
        assert_eq!(
            load_remote_settings_from_lookup(
                &dir.path,
                &store,
                lookup_from(&[("SUPABASE_URL", "https://db.example.test")]),
            )
            .expect("load settings"),
            None
        );
    }

    #[test]
    fn local_mode_ignores_remote_credentials() {
        let dir = TempConfigDir::new();
        fs::write(
            dir.path.join("backend.json"),
            r#"{"schema":1,"mode":"local"}"#,
        )
        .expect("write backend config");
        let settings = load_remote_settings_from_lookup(
            &dir.path,
            &InMemoryCredentialStore::default(),
            lookup_from(&[
                ("SUPABASE_URL", "https://db.example.test"),
                ("SUPABASE_ANON_KEY", "anon-key"),
            ]),
        )
        .expect("load settings");
        assert_eq!(settings, None);
    }

    #[test]
    fn blank_webhook_secret_is_ignored() {
        assert_eq!(
            load_webhook_secret_from_lookup(lookup_from(&[
                ("STUDYPULSE_WEBHOOK_SECRET", "  "),
                ("IDENTITY_WEBHOOK_SECRET", "whsec_abc"),
            ])),
            Some("whsec_abc".to_string())
        );
    }
}
