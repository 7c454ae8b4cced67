use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_database;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// String-blob storage scoped by namespace (the owning user id).
pub trait BlobStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, InfraError>;
    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), InfraError>;
    fn delete(&self, namespace: &str, key: &str) -> Result<(), InfraError>;
    fn list_keys(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, InfraError>;
    fn clear_namespace(&self, namespace: &str) -> Result<(), InfraError>;

    /// Read-modify-write of one blob with no interleaving writer. `apply` returning
    /// `None` leaves the stored value untouched.
    fn update(
        &self,
        namespace: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>, InfraError>,
    ) -> Result<(), InfraError>;
}

fn select_value(
    connection: &Connection,
    namespace: &str,
    key: &str,
) -> Result<Option<String>, InfraError> {
    let value = connection
        .query_row(
            "SELECT value FROM local_store WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

fn upsert_value(
    connection: &Connection,
    namespace: &str,
    key: &str,
    value: &str,
) -> Result<(), InfraError> {
    connection.execute(
        "INSERT INTO local_store (namespace, key, value, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(namespace, key) DO UPDATE SET
           value = excluded.value,
           updated_at = excluded.updated_at",
        params![namespace, key, value, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteBlobStore {
    db_path: PathBuf,
}

impl SqliteBlobStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_database(&self.db_path)
    }
}

impl BlobStore for SqliteBlobStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, InfraError> {
        let connection = self.connect()?;
        select_value(&connection, namespace, key)
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        upsert_value(&connection, namespace, key, value)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "DELETE FROM local_store WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(())
    }

    fn list_keys(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT key FROM local_store WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2
             ORDER BY key",
        )?;
        let keys = statement
            .query_map(params![namespace, prefix], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn clear_namespace(&self, namespace: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "DELETE FROM local_store WHERE namespace = ?1",
            params![namespace],
        )?;
        Ok(())
    }

    fn update(
        &self,
        namespace: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>, InfraError>,
    ) -> Result<(), InfraError> {
        let mut connection = self.connect()?;
        // IMMEDIATE takes the write lock up front so two updaters cannot both read the old value.
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = select_value(&transaction, namespace, key)?;
        if let Some(next) = apply(current)? {
            upsert_value(&transaction, namespace, key, &next)?;
        }
        transaction.commit()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    entries: Mutex<BTreeMap<(String, String), String>>,
}

impl InMemoryBlobStore {
    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), String>>, InfraError> {
        self.entries
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("blob store lock poisoned: {error}")))
    }
}

impl BlobStore for InMemoryBlobStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, InfraError> {
        let entries = self.lock()?;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), InfraError> {
        let mut entries = self.lock()?;
        entries.insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), InfraError> {
        let mut entries = self.lock()?;
        entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn list_keys(&self, namespace: &str, prefix: &str) -> Result<Vec<String>, InfraError> {
        let entries = self.lock()?;
        Ok(entries
            .keys()
            .filter(|(candidate, key)| candidate == namespace && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn clear_namespace(&self, namespace: &str) -> Result<(), InfraError> {
        let mut entries = self.lock()?;
        entries.retain(|(candidate, _), _| candidate != namespace);
        Ok(())
    }

    fn update(
        &self,
        namespace: &str,
        key: &str,
        apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>, InfraError>,
    ) -> Result<(), InfraError> {
        let mut entries = self.lock()?;
        let entry = (namespace.to_string(), key.to_string());
        if let Some(next) = apply(entries.get(&entry).cloned())? {
            entries.insert(entry, next);
        }
        Ok(())
    }
}
