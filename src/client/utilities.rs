//! # Background Task Supervision
//!
//! The primitives that keep deep background failures from stranding shallow
//! foreground callers: a race between any foreground await and the error
//! queue, a monitored spawn that routes terminal task errors onto that queue,
//! and the owned set of listener handles a dock cancels at shutdown.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{BusError, ErrorQueue};

/// Await `future`, bailing out early if a background error surfaces first
///
/// Races the future against the error queue. If the queue wins, the future is
/// dropped — the cooperative cancel in this model — and the queued error is
/// raised on the foreground path. This is the only safe way to discover that
/// a deep background task has failed while a caller is blocked on a queue
/// that will now never be fed.
pub async fn bail_on_error<T>(
    error_queue: &ErrorQueue,
    future: impl Future<Output = T>,
) -> Result<T, BusError> {
    tokio::select! {
        // Prefer the value when both are ready at once.
        biased;
        value = future => Ok(value),
        record = error_queue.get() => {
            debug!(source = %record.source, "bailing on foreground wait: background task failed");
            Err(record.error)
        }
    }
}

/// Spawn a background task whose terminal failure lands on the error queue
///
/// Every long-lived task in the client goes through here, so no exception can
/// die silently with its task.
pub fn spawn_monitored<F>(
    source: &'static str,
    error_queue: &ErrorQueue,
    future: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), BusError>> + Send + 'static,
{
    let error_queue = error_queue.clone();
    tokio::spawn(async move {
        if let Err(err) = future.await {
            error!(source, error = %err, "background task failed");
            error_queue.put(source, err);
        }
    })
}

/// The set of listener task handles owned by a dock
///
/// Membership is the tag: anything in here is a listener, and shutdown
/// cancels and awaits exactly this set before transports are torn down.
#[derive(Debug, Default)]
pub struct ListenerTasks {
    handles: Vec<JoinHandle<()>>,
}

impl ListenerTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a listener handle
    pub fn register(&mut self, handle: JoinHandle<()>) {
        // Completed listeners removed themselves; no need to keep the handle.
        self.handles.retain(|h| !h.is_finished());
        self.handles.push(handle);
    }

    /// Number of listeners still running
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancel every listener and wait for each to wind down
    ///
    /// Waiting matters: a listener may hold a scoped transport acquisition,
    /// and its pool cannot drain until the guard is dropped.
    pub async fn cancel_all(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(()) => {}
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => {
                    error!(%join_error, "listener task panicked during shutdown");
                }
            }
        }
    }
}
