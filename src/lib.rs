//! # Rusty Bus
//!
//! An asynchronous message-bus client library implemented in Rust. It multiplexes
//! two communication patterns over pluggable transport backends: request/response
//! remote procedure calls with timeouts and result correlation, and topic-style
//! event publication and consumption with at-least-once delivery.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod message;
pub mod schema;
pub mod transport;
pub mod utils;

pub use api::{Api, ApiBuilder, ApiRegistry, ParameterKind};
pub use client::BusClient;
pub use config::Config;
pub use error::{BusError, ErrorQueue, ErrorRecord, TransportError};
pub use hooks::{BusHooks, HookRegistry};
pub use message::{EventMessage, Kwargs, ResultMessage, RpcMessage};
pub use transport::{
    CallOptions, EventTransport, ResultTransport, RpcTransport, SchemaTransport, Transport,
    TransportFamily, TransportOptions, TransportPlugins,
};

/// The current version of the bus client library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default depth of each internal command pipeline
    pub const COMMAND_QUEUE_DEPTH: usize = 1000;

    /// Default time to wait for an RPC result before giving up
    pub const RPC_TIMEOUT: Duration = Duration::from_secs(9);

    /// Default maximum number of pooled instances per transport
    pub const TRANSPORT_POOL_SIZE: usize = 8;

    /// Default number of events delivered per consumption batch
    pub const EVENT_BATCH_SIZE: usize = 16;

    /// Default per-subscriber event buffer depth
    pub const EVENT_BUFFER_DEPTH: usize = 128;

    /// Default time-to-live for schemas shared over the bus
    pub const SCHEMA_TTL_SECS: u64 = 60;

    /// Default number of events retained per stream for history queries
    pub const EVENT_HISTORY_LIMIT: usize = 1024;
}
