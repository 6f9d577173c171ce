use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::error::ErrorReport;
use crate::store::StoreHandle;

use super::persist::Persister;
use super::{Dispatch, MiddlewareFactory};

/// Keeps every [`ErrorReport`] published on the store's error channel and,
/// with a sink, rewrites the whole history after each one.
///
/// The channel carries reducer, middleware, effect and selector failures,
/// including ones absorbed by [`super::ErrorMiddleware`], so this layer
/// records them wherever it sits in the chain.
pub struct ErrorReportMiddleware {
    history: Arc<Mutex<Vec<ErrorReport>>>,
    sink: Option<Arc<dyn Persister>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ErrorReportMiddleware {
    pub fn new() -> Self {
        Self {
            history: Arc::new(Mutex::new(Vec::new())),
            sink: None,
            listener: Mutex::new(None),
        }
    }

    /// Write the history (a JSON array of reports) to `sink` after every error.
    pub fn with_sink(mut self, sink: Arc<dyn Persister>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn history(&self) -> Vec<ErrorReport> {
        self.history.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }
}

impl Default for ErrorReportMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl MiddlewareFactory for ErrorReportMiddleware {
    fn name(&self) -> &str {
        "error-report"
    }

    fn wrap(&self, _store: StoreHandle, next: Dispatch) -> Dispatch {
        next
    }

    fn install(&self, store: &StoreHandle) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            tracing::warn!("Error report middleware is already installed, ignoring");
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("No runtime available, errors will not be recorded");
            return;
        };
        let Some(errors) = store.errors() else {
            return;
        };
        *listener = Some(runtime.spawn(record_errors(
            errors,
            self.history.clone(),
            self.sink.clone(),
        )));
    }

    fn teardown(&self) {
        if let Some(task) = self.listener.lock().take() {
            task.abort();
        }
    }
}

async fn record_errors(
    mut errors: broadcast::Receiver<ErrorReport>,
    history: Arc<Mutex<Vec<ErrorReport>>>,
    sink: Option<Arc<dyn Persister>>,
) {
    loop {
        let report = match errors.recv().await {
            Ok(report) => report,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Error reports dropped before they were recorded");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        tracing::debug!(kind = ?report.kind, message = %report.message, "Error recorded");

        let Some(sink) = &sink else {
            history.lock().push(report);
            continue;
        };
        let snapshot = {
            let mut history = history.lock();
            history.push(report);
            serde_json::to_value(&*history)
        };
        let written = match snapshot {
            Ok(snapshot) => sink.persist(snapshot).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "Failed to write error report");
        }
    }
}
