//! # Error Types and the Error Queue
//!
//! This module defines the error taxonomy for the bus client and the process-wide
//! error queue through which background task failures surface to foreground callers.
//!
//! ## Error Categories
//!
//! - **Configuration**: transport not installed, transport not found, invalid
//!   transport selector — fatal at startup
//! - **Programming**: unrecognised command, consume with no APIs, invalid names —
//!   raised to the caller, never retried
//! - **Schema**: outgoing or incoming validation failures
//! - **Transport I/O**: wrapped [`TransportError`] values raised by backends
//! - **Remote application errors**: rebuilt from an error result message
//! - **Timeouts**: carry the elapsed wait in human form
//!
//! ## Propagation Policy
//!
//! Transports report; docks route to the error queue; subclients surface errors on
//! the foreground await. Recovery is the application's responsibility.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::transport::TransportFamily;
use crate::utils::human_time;

/// Errors raised by transport implementations
///
/// Every transport operation may fail with one of these. Errors raised from
/// within a background task are routed to the error queue rather than being
/// allowed to silently end the task.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been closed and can no longer be used
    #[error("transport is closed")]
    Closed,

    /// A pool refused an acquisition because it is draining or drained
    #[error("transport pool '{pool}' is closed")]
    PoolClosed { pool: String },

    /// The underlying connection or broker failed
    #[error("transport connection failure: {0}")]
    Connection(String),

    /// The transport does not implement the requested operation
    #[error("transport '{transport}' does not support {operation}")]
    Unsupported {
        transport: &'static str,
        operation: &'static str,
    },

    /// An I/O error from the operating system or runtime
    #[error("transport I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Message encoding or decoding failed at the transport boundary
    #[error("transport codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors surfaced by the bus client
#[derive(Debug, Error)]
pub enum BusError {
    // --- Configuration errors, fatal at startup ---
    /// No transports of the given family are registered at all
    #[error(
        "no {family} transports are installed. Register at least one {family} transport \
         plugin (the built-in 'memory' family is registered by default)"
    )]
    TransportsNotInstalled { family: TransportFamily },

    /// A transport was requested by a name that is not registered, or an API has
    /// no transport configured and no default exists
    #[error("transport not found: {0}")]
    TransportNotFound(String),

    /// The configuration could not be parsed or is structurally invalid
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    // --- Programming errors, raised to the caller ---
    /// A dock was handed a command variant it does not own
    #[error("dock '{dock}' did not recognise command '{command}'")]
    UnrecognisedCommand {
        dock: &'static str,
        command: &'static str,
    },

    /// `consume_rpcs` was invoked with nothing to listen on
    #[error(
        "no APIs to consume on in consume_rpcs(). Either this method was called with an \
         empty API list, or the API registry is empty"
    )]
    NoApisToListenOn,

    /// `consume_events` was invoked with nothing to listen for
    #[error("consume_events() was called without providing any events to listen for")]
    NothingToListenFor,

    /// An API, procedure or event name failed validation
    #[error("invalid {kind} name '{name}' on API '{api_name}': {reason}")]
    InvalidName {
        kind: &'static str,
        api_name: String,
        name: String,
        reason: String,
    },

    /// The named API is not registered with this client
    #[error("unknown API '{0}'. Use register_api() to make the API available")]
    UnknownApi(String),

    /// The named procedure does not exist on the API
    #[error("unknown procedure '{name}' on API '{api_name}'")]
    UnknownProcedure { api_name: String, name: String },

    /// The named event does not exist on the API
    #[error("unknown event '{name}' on API '{api_name}'")]
    UnknownEvent { api_name: String, name: String },

    /// The keyword arguments supplied for an event do not match its definition
    #[error("invalid arguments for event '{api_name}.{name}': {reason}")]
    InvalidEventArguments {
        api_name: String,
        name: String,
        reason: String,
    },

    // --- Schema errors ---
    /// A message failed schema validation
    #[error("{direction} schema validation failed: {message}")]
    SchemaValidation {
        direction: &'static str,
        message: String,
    },

    /// A value could not be converted into a bus-safe shape
    #[error("value could not be made bus-safe: {0}")]
    Deform(String),

    // --- Transport I/O ---
    /// A transport operation failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An application-level failure raised by a procedure or hook
    ///
    /// On the serving side this becomes an error result message; the caller
    /// receives it rebuilt as [`BusError::ServerError`].
    #[error("{0}")]
    Application(String),

    // --- Call outcomes ---
    /// No result arrived for an RPC call within the allowed time
    #[error(
        "timeout when calling RPC {canonical_name} after waiting for {}. It is possible \
         no bus process is serving this API, or perhaps it is taking too long to process \
         the request. In which case consider raising the 'rpc_timeout' config option",
        human_time(*.elapsed)
    )]
    RpcTimeout {
        canonical_name: String,
        elapsed: Duration,
    },

    /// The remote procedure raised an error while executing
    #[error(
        "error while calling {canonical_name}: {message}\nRemote stack trace:\n{}",
        .trace.as_deref().unwrap_or("<not available>")
    )]
    ServerError {
        canonical_name: String,
        message: String,
        trace: Option<String>,
    },

    /// Sentinel raised by a procedure to simulate message loss.
    ///
    /// The executor drops the result path entirely, so the caller times out as if
    /// the server process had died mid-call. Only useful from tests.
    #[error("sudden death")]
    SuddenDeath,

    /// The internal command pipeline has shut down
    #[error("the bus client is closed")]
    PipelineClosed,
}

/// A failure captured from a background task
///
/// Records which component produced the error so the foreground report can
/// point at the task that actually failed rather than the await that observed it.
#[derive(Debug)]
pub struct ErrorRecord {
    /// Name of the component or task that produced the error
    pub source: String,
    /// The failure itself
    pub error: BusError,
}

/// Process-wide asynchronous error channel
///
/// Every long-lived background task routes its terminal failure through this
/// queue, and every foreground await that could otherwise hang forever races
/// against it (see `client::utilities::bail_on_error`). Handles are cheap to
/// clone; all clones feed and drain the same queue.
#[derive(Clone)]
pub struct ErrorQueue {
    tx: mpsc::UnboundedSender<ErrorRecord>,
    rx: std::sync::Arc<Mutex<mpsc::UnboundedReceiver<ErrorRecord>>>,
}

impl ErrorQueue {
    /// Create a fresh, empty error queue
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: std::sync::Arc::new(Mutex::new(rx)),
        }
    }

    /// Place an error onto the queue
    ///
    /// Infallible: the queue keeps its own sender alive, so the channel cannot
    /// have been closed underneath us.
    pub fn put(&self, source: impl Into<String>, error: BusError) {
        let record = ErrorRecord {
            source: source.into(),
            error,
        };
        let _ = self.tx.send(record);
    }

    /// Wait for the next error to appear
    ///
    /// Consumers race fairly: whichever caller acquires the receiver first takes
    /// the next record. Cancellation-safe — a caller that gives up while waiting
    /// does not lose a record.
    pub async fn get(&self) -> ErrorRecord {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(record) => record,
            // Unreachable while `self.tx` exists, but never spin if it happens.
            None => std::future::pending().await,
        }
    }

    /// Take an error if one is immediately available
    pub fn try_get(&self) -> Option<ErrorRecord> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Whether any error is currently queued
    pub fn is_empty(&self) -> bool {
        self.rx
            .try_lock()
            .map(|rx| rx.is_empty())
            .unwrap_or(false)
    }
}

impl Default for ErrorQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ErrorQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_includes_human_elapsed() {
        let err = BusError::RpcTimeout {
            canonical_name: "auth.check_password".to_string(),
            elapsed: Duration::from_millis(100),
        };
        let text = err.to_string();
        assert!(text.contains("auth.check_password"));
        assert!(text.contains("0.1 seconds"));
    }

    #[test]
    fn server_error_includes_remote_trace() {
        let err = BusError::ServerError {
            canonical_name: "auth.check_password".to_string(),
            message: "nope".to_string(),
            trace: Some("ValueError: nope".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("nope"));
        assert!(text.contains("Remote stack trace"));
    }

    #[tokio::test]
    async fn error_queue_delivers_in_order() {
        let queue = ErrorQueue::new();
        queue.put("first", BusError::NoApisToListenOn);
        queue.put("second", BusError::PipelineClosed);

        let record = queue.get().await;
        assert_eq!(record.source, "first");
        let record = queue.get().await;
        assert_eq!(record.source, "second");
        assert!(queue.try_get().is_none());
    }
}
