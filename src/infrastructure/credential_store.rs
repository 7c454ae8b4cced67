use crate::infrastructure::error::InfraError;
use std::sync::Mutex;

pub const REMOTE_KEY_SERVICE: &str = "studypulse.remote";

/// Holds the API key of the hosted backend outside the config files.
pub trait CredentialStore: Send + Sync {
    fn save_api_key(&self, api_key: &str) -> Result<(), InfraError>;
    fn load_api_key(&self) -> Result<Option<String>, InfraError>;
    fn delete_api_key(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
    account_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(REMOTE_KEY_SERVICE, "default")
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save_api_key(&self, api_key: &str) -> Result<(), InfraError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(InfraError::Credential("api key must not be empty".to_string()));
        }
        self.entry()?
            .set_password(api_key)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_api_key(&self) -> Result<Option<String>, InfraError> {
        match self.entry()?.get_password() {
            Ok(value) if value.trim().is_empty() => Ok(None),
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }

    fn delete_api_key(&self) -> Result<(), InfraError> {
        match self.entry()?.delete_credential() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    api_key: Mutex<Option<String>>,
}

impl InMemoryCredentialStore {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Mutex::new(Some(api_key.into())),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>, InfraError> {
        self.api_key
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn save_api_key(&self, api_key: &str) -> Result<(), InfraError> {
        *self.lock()? = Some(api_key.trim().to_string());
        Ok(())
    }

    fn load_api_key(&self) -> Result<Option<String>, InfraError> {
        Ok(self.lock()?.clone())
    }

    fn delete_api_key(&self) -> Result<(), InfraError> {
        *self.lock()? = None;
        Ok(())
    }
}
