use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::store::{StateChange, StoreHandle};

use super::{Dispatch, MiddlewareFactory};

/// Writes selected state slices somewhere durable.
#[async_trait]
pub trait Persister: Send + Sync {
    /// `snapshot` is a JSON object of feature key → sub-state.
    async fn persist(&self, snapshot: Value) -> anyhow::Result<()>;
}

/// Overwrites one JSON file with each snapshot.
#[derive(Debug, Clone)]
pub struct JsonFilePersister {
    path: PathBuf,
}

impl JsonFilePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl Persister for JsonFilePersister {
    async fn persist(&self, snapshot: Value) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&self.path, body)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Hands a snapshot of `keys` to a [`Persister`] after every committed
/// change.
///
/// Persistence follows the store's state stream rather than the actions
/// passing through this layer, so commits made later by an inner
/// debounce or batch timer are persisted too. Snapshots are persisted one
/// at a time, in commit order, on a task started at install. Failures are
/// only logged.
pub struct PersistMiddleware {
    persister: Arc<dyn Persister>,
    keys: Arc<Vec<String>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PersistMiddleware {
    pub fn new(
        persister: Arc<dyn Persister>,
        keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            persister,
            keys: Arc::new(keys.into_iter().map(Into::into).collect()),
            listener: Mutex::new(None),
        }
    }

    /// Whether the persistence task is running.
    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl MiddlewareFactory for PersistMiddleware {
    fn name(&self) -> &str {
        "persist"
    }

    fn wrap(&self, _store: StoreHandle, next: Dispatch) -> Dispatch {
        next
    }

    fn install(&self, store: &StoreHandle) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            tracing::warn!("Persist middleware is already installed, ignoring");
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("No runtime available, state will not be persisted");
            return;
        };
        let Some(changes) = store.subscribe() else {
            return;
        };
        *listener = Some(runtime.spawn(persist_changes(
            store.clone(),
            changes,
            self.persister.clone(),
            self.keys.clone(),
        )));
        tracing::debug!(keys = ?self.keys, "Persisting state changes");
    }

    fn teardown(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }
}

async fn persist_changes(
    store: StoreHandle,
    mut changes: broadcast::Receiver<StateChange>,
    persister: Arc<dyn Persister>,
    keys: Arc<Vec<String>>,
) {
    loop {
        let (state, action_type) = match changes.recv().await {
            Ok(change) => (change.current, change.action.action_type().to_string()),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Persistence fell behind, persisting current state");
                match store.state() {
                    Some(state) => (state, "<lagged>".to_string()),
                    None => break,
                }
            }
            Err(RecvError::Closed) => break,
        };
        let Some(snapshot) = store.snapshot_of(&state, Some(keys.as_slice())) else {
            break;
        };
        if let Err(e) = persister.persist(snapshot).await {
            tracing::warn!(
                action_type = %action_type,
                error = %e,
                "Failed to persist state"
            );
        }
    }
}
