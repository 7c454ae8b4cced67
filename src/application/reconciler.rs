use crate::infrastructure::backend::{BackendKind, PersistenceBackend};
use crate::infrastructure::error::InfraError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Chooses between the remote and local backends for one user.
///
/// Once a remote call fails with a failover-class error every later call goes to the
/// local backend until [`BackendSelector::reconnect`] succeeds.
pub struct BackendSelector {
    remote: Option<Arc<dyn PersistenceBackend>>,
    local: Arc<dyn PersistenceBackend>,
    failed_over: AtomicBool,
}

impl BackendSelector {
    pub fn new(
        remote: Option<Arc<dyn PersistenceBackend>>,
        local: Arc<dyn PersistenceBackend>,
    ) -> Self {
        Self {
            remote,
            local,
            failed_over: AtomicBool::new(false),
        }
    }

    pub fn active(&self) -> BackendKind {
        match &self.remote {
            Some(_) if !self.failed_over.load(Ordering::Acquire) => BackendKind::Remote,
            _ => BackendKind::Local,
        }
    }

    fn active_backend(&self) -> Arc<dyn PersistenceBackend> {
        match &self.remote {
            Some(remote) if !self.failed_over.load(Ordering::Acquire) => Arc::clone(remote),
            _ => Arc::clone(&self.local),
        }
    }

    /// Runs `call` against the active backend; a failover-class remote error switches
    /// to local storage and replays the call there.
    pub async fn run<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, InfraError>
    where
        F: Fn(Arc<dyn PersistenceBackend>) -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        let backend = self.active_backend();
        let kind = backend.kind();
        match call(backend).await {
            Err(error) if kind == BackendKind::Remote && error.is_failover() => {
                self.failed_over.store(true, Ordering::Release);
                tracing::warn!(
                    operation,
                    error = %error,
                    "remote backend unavailable; switching to local storage"
                );
                call(Arc::clone(&self.local)).await
            }
            result => result,
        }
    }

    /// Pings the remote health endpoint and returns to remote only when it answers.
    pub async fn reconnect(&self) -> BackendKind {
        let Some(remote) = &self.remote else {
            return BackendKind::Local;
        };
        match remote.ping().await {
            Ok(()) => {
                if self.failed_over.swap(false, Ordering::AcqRel) {
                    tracing::info!("remote backend reachable again; leaving local storage");
                }
                BackendKind::Remote
            }
            Err(error) => {
                self.failed_over.store(true, Ordering::Release);
                tracing::warn!(error = %error, "remote backend ping failed; staying on local storage");
                BackendKind::Local
            }
        }
    }

    pub fn local(&self) -> Arc<dyn PersistenceBackend> {
        Arc::clone(&self.local)
    }

    pub fn remote(&self) -> Option<Arc<dyn PersistenceBackend>> {
        self.remote.clone()
    }
}
