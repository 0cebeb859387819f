//! # Transport Abstraction Module
//!
//! This module provides the unified abstraction layer over concrete bus
//! transports. It defines the capability contracts the client core invokes,
//! the plugin registry through which transports are discovered by name, and
//! the option types handed through to backends.
//!
//! ## Key Design Principles
//!
//! - **Capability Contracts**: RPC, result, event and schema duties are
//!   separate traits, so a backend implements only what it can serve
//! - **Pure I/O Adapters**: transports never drive control flow; the client's
//!   docks own all orchestration and simply invoke these operations
//! - **Async-First**: built on Tokio for non-blocking I/O
//! - **Stream Consumption**: inbound RPCs and events arrive as streams whose
//!   caller-driven pacing is the backpressure mechanism
//!
//! ## Transport Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │   Bus Client    │───▶│   Capability     │───▶│    Specific     │
//! │  (docks and     │    │     Traits       │    │ Implementation  │
//! │   subclients)   │    │  (abstraction)   │    │ (memory, ...)   │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! ## Transport Families
//!
//! - **RPC**: publishes calls and consumes incoming calls for served APIs
//! - **Result**: routes results back to callers along an opaque return path
//! - **Event**: publishes events and consumes event streams in batches
//! - **Schema**: shares API schemas between bus processes
//!
//! Different APIs may be served by different backends of the same family; the
//! registry in [`registry`] maps each API to its pools.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{BusError, ErrorQueue, TransportError};
use crate::message::{EventMessage, ResultMessage, RpcMessage};

pub mod memory;
pub mod pool;
pub mod registry;

pub use memory::{
    MemoryBroker, MemoryEventTransport, MemoryResultTransport, MemoryRpcTransport,
    MemorySchemaTransport,
};
pub use pool::{PooledTransport, TransportPool};
pub use registry::TransportRegistry;

/// An opaque bag of options passed through to transports unchanged
pub type TransportOptions = serde_json::Map<String, Value>;

/// Options accompanying a single RPC call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the configured result timeout for this call only
    pub timeout: Option<std::time::Duration>,

    /// Backend-specific options, passed through unchanged
    pub bag: TransportOptions,
}

impl CallOptions {
    /// Options carrying only a timeout override
    pub fn with_timeout(timeout: std::time::Duration) -> Self {
        Self {
            timeout: Some(timeout),
            bag: TransportOptions::new(),
        }
    }
}

/// Base lifecycle contract shared by every transport
///
/// Instances are created cold, `open`ed once by the owning pool before first
/// use, and `close`d when the pool drains. Both default to no-ops for
/// transports without connection state.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Set up the transport prior to use: open connections, allocate state
    async fn open(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Clean up prior to termination: close connections, release state
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Sending and receiving of RPC calls
#[async_trait]
pub trait RpcTransport: Transport {
    /// Publish a call to a remote procedure
    async fn call_rpc(
        &mut self,
        rpc_message: &RpcMessage,
        options: &CallOptions,
    ) -> Result<(), TransportError>;

    /// Consume incoming RPC calls for the listed APIs
    ///
    /// The returned stream owns its subscription, so it stays live for as long
    /// as the caller keeps pulling from it, independent of further use of the
    /// transport instance.
    async fn consume_rpcs(
        &mut self,
        api_names: &[String],
    ) -> Result<BoxStream<'static, Result<RpcMessage, TransportError>>, TransportError>;
}

/// Sending and receiving of RPC results
#[async_trait]
pub trait ResultTransport: Transport {
    /// Derive the opaque address a server should send the result of
    /// `rpc_message` to. Must be deterministic: the caller and the server
    /// derive the same path independently.
    fn get_return_path(&self, rpc_message: &RpcMessage) -> String;

    /// Send a result back to the caller along the given return path
    async fn send_result(
        &mut self,
        rpc_message: &RpcMessage,
        result_message: &ResultMessage,
        return_path: &str,
    ) -> Result<(), TransportError>;

    /// Block until the correlated result is available
    ///
    /// Implementations must register their interest in `return_path` before
    /// first suspending, so a receiver armed ahead of the call's dispatch can
    /// never miss a result that arrives promptly.
    async fn receive_result(
        &mut self,
        rpc_message: &RpcMessage,
        return_path: &str,
        options: &CallOptions,
    ) -> Result<ResultMessage, TransportError>;
}

/// Sending and consumption of events
#[async_trait]
pub trait EventTransport: Transport {
    /// Publish an event
    async fn send_event(
        &mut self,
        event_message: &EventMessage,
        options: &TransportOptions,
    ) -> Result<(), TransportError>;

    /// Consume events for the given `(api_name, event_name)` pairs
    ///
    /// Yields batches; the caller must process each batch before pulling the
    /// next, which is what propagates backpressure to the backend. Transport
    /// failures observed while consuming that cannot be yielded in-stream are
    /// reported through `error_queue`.
    async fn consume(
        &mut self,
        listen_for: &[(String, String)],
        listener_name: &str,
        error_queue: ErrorQueue,
        options: &TransportOptions,
    ) -> Result<BoxStream<'static, Result<Vec<EventMessage>, TransportError>>, TransportError>;

    /// Confirm that the given events were successfully processed
    async fn acknowledge(&mut self, _event_messages: &[EventMessage]) -> Result<(), TransportError> {
        Ok(())
    }

    /// Events previously fired for `api_name.event_name`, newest first,
    /// optionally bounded to a time range
    async fn history(
        &mut self,
        _api_name: &str,
        _event_name: &str,
        _start: Option<DateTime<Utc>>,
        _stop: Option<DateTime<Utc>>,
        _start_inclusive: bool,
    ) -> Result<BoxStream<'static, Result<EventMessage, TransportError>>, TransportError> {
        Err(TransportError::Unsupported {
            transport: "event",
            operation: "history",
        })
    }
}

/// Sharing of API schemas between bus processes
#[async_trait]
pub trait SchemaTransport: Transport {
    /// Store a schema for the given API
    async fn store(
        &mut self,
        api_name: &str,
        schema: &Value,
        ttl_seconds: u64,
    ) -> Result<(), TransportError>;

    /// Keep alive a schema already stored via `store`
    ///
    /// Defaults to simply calling `store` on the assumption that this causes
    /// the ttl to be refreshed. Backends may customise this.
    async fn ping(
        &mut self,
        api_name: &str,
        schema: &Value,
        ttl_seconds: u64,
    ) -> Result<(), TransportError> {
        self.store(api_name, schema, ttl_seconds).await
    }

    /// Load the schemas of every API visible on the bus
    async fn load(&mut self) -> Result<HashMap<String, Value>, TransportError>;
}

/// Lifecycle hooks the pool invokes on its members
///
/// The pool stores transports as capability trait objects, which cannot carry
/// the [`Transport`] supertrait bound generically; these forwarding impls give
/// the pool a single bound to name for all four families.
#[async_trait]
pub trait Poolable: Send + Sync {
    async fn open_transport(&mut self) -> Result<(), TransportError>;
    async fn close_transport(&mut self) -> Result<(), TransportError>;
}

macro_rules! poolable {
    ($($family:ty),+ $(,)?) => {$(
        #[async_trait]
        impl Poolable for $family {
            async fn open_transport(&mut self) -> Result<(), TransportError> {
                self.open().await
            }
            async fn close_transport(&mut self) -> Result<(), TransportError> {
                self.close().await
            }
        }
    )+};
}

poolable!(
    dyn RpcTransport,
    dyn ResultTransport,
    dyn EventTransport,
    dyn SchemaTransport,
);

/// The four transport duties a backend may take on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFamily {
    Rpc,
    Result,
    Event,
    Schema,
}

impl std::fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportFamily::Rpc => "rpc",
            TransportFamily::Result => "result",
            TransportFamily::Event => "event",
            TransportFamily::Schema => "schema",
        };
        f.write_str(name)
    }
}

/// Factory producing an RPC transport from its options block
pub type RpcTransportFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn RpcTransport>, BusError> + Send + Sync>;
/// Factory producing a result transport from its options block
pub type ResultTransportFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn ResultTransport>, BusError> + Send + Sync>;
/// Factory producing an event transport from its options block
pub type EventTransportFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn EventTransport>, BusError> + Send + Sync>;
/// Factory producing a schema transport from its options block
pub type SchemaTransportFactory =
    Arc<dyn Fn(&Value) -> Result<Box<dyn SchemaTransport>, BusError> + Send + Sync>;

/// Registry of installed transport implementations
///
/// Maps `(family, name)` to a factory, so configuration can select transports
/// by name. An owned value rather than process-global state: hosts build one,
/// register their backends, and hand it to the client. `Default` registers
/// the built-in `memory` family.
///
/// `transport_name` is the inverse of the factory lookup: given the concrete
/// type of an installed transport it recovers the name it was registered
/// under.
#[derive(Clone)]
pub struct TransportPlugins {
    rpc: HashMap<String, (TypeId, RpcTransportFactory)>,
    result: HashMap<String, (TypeId, ResultTransportFactory)>,
    event: HashMap<String, (TypeId, EventTransportFactory)>,
    schema: HashMap<String, (TypeId, SchemaTransportFactory)>,
}

impl TransportPlugins {
    /// A registry with the built-in `memory` family installed
    pub fn new() -> Self {
        let mut plugins = Self::empty();
        memory::register_memory_family(&mut plugins);
        plugins
    }

    /// A registry with no transports at all
    pub fn empty() -> Self {
        Self {
            rpc: HashMap::new(),
            result: HashMap::new(),
            event: HashMap::new(),
            schema: HashMap::new(),
        }
    }

    /// Register an RPC transport under the given name
    pub fn register_rpc<T, F>(&mut self, name: impl Into<String>, factory: F)
    where
        T: RpcTransport + 'static,
        F: Fn(&Value) -> Result<T, BusError> + Send + Sync + 'static,
    {
        self.rpc.insert(
            name.into(),
            (
                TypeId::of::<T>(),
                Arc::new(move |options| Ok(Box::new(factory(options)?) as Box<dyn RpcTransport>)),
            ),
        );
    }

    /// Register a result transport under the given name
    pub fn register_result<T, F>(&mut self, name: impl Into<String>, factory: F)
    where
        T: ResultTransport + 'static,
        F: Fn(&Value) -> Result<T, BusError> + Send + Sync + 'static,
    {
        self.result.insert(
            name.into(),
            (
                TypeId::of::<T>(),
                Arc::new(move |options| {
                    Ok(Box::new(factory(options)?) as Box<dyn ResultTransport>)
                }),
            ),
        );
    }

    /// Register an event transport under the given name
    pub fn register_event<T, F>(&mut self, name: impl Into<String>, factory: F)
    where
        T: EventTransport + 'static,
        F: Fn(&Value) -> Result<T, BusError> + Send + Sync + 'static,
    {
        self.event.insert(
            name.into(),
            (
                TypeId::of::<T>(),
                Arc::new(move |options| Ok(Box::new(factory(options)?) as Box<dyn EventTransport>)),
            ),
        );
    }

    /// Register a schema transport under the given name
    pub fn register_schema<T, F>(&mut self, name: impl Into<String>, factory: F)
    where
        T: SchemaTransport + 'static,
        F: Fn(&Value) -> Result<T, BusError> + Send + Sync + 'static,
    {
        self.schema.insert(
            name.into(),
            (
                TypeId::of::<T>(),
                Arc::new(move |options| {
                    Ok(Box::new(factory(options)?) as Box<dyn SchemaTransport>)
                }),
            ),
        );
    }

    /// Look up the RPC transport factory registered under `name`
    pub fn rpc_factory(&self, name: &str) -> Result<RpcTransportFactory, BusError> {
        Self::lookup(&self.rpc, TransportFamily::Rpc, name)
    }

    /// Look up the result transport factory registered under `name`
    pub fn result_factory(&self, name: &str) -> Result<ResultTransportFactory, BusError> {
        Self::lookup(&self.result, TransportFamily::Result, name)
    }

    /// Look up the event transport factory registered under `name`
    pub fn event_factory(&self, name: &str) -> Result<EventTransportFactory, BusError> {
        Self::lookup(&self.event, TransportFamily::Event, name)
    }

    /// Look up the schema transport factory registered under `name`
    pub fn schema_factory(&self, name: &str) -> Result<SchemaTransportFactory, BusError> {
        Self::lookup(&self.schema, TransportFamily::Schema, name)
    }

    fn lookup<F: Clone>(
        family_map: &HashMap<String, (TypeId, F)>,
        family: TransportFamily,
        name: &str,
    ) -> Result<F, BusError> {
        if family_map.is_empty() {
            return Err(BusError::TransportsNotInstalled { family });
        }
        family_map
            .get(name)
            .map(|(_, factory)| factory.clone())
            .ok_or_else(|| {
                BusError::TransportNotFound(format!(
                    "no '{family}' transport named '{name}' is registered. Check the transport \
                     is installed, or perhaps there is a typo in the configuration"
                ))
            })
    }

    /// Recover the registration name of a transport type within a family
    ///
    /// Inverse of the factory lookups: for every registered `(family, name)`,
    /// `transport_name(family, type_id_of_that_transport) == name`.
    pub fn transport_name(
        &self,
        family: TransportFamily,
        type_id: TypeId,
    ) -> Result<&str, BusError> {
        let found = match family {
            TransportFamily::Rpc => Self::name_of(&self.rpc, type_id),
            TransportFamily::Result => Self::name_of(&self.result, type_id),
            TransportFamily::Event => Self::name_of(&self.event, type_id),
            TransportFamily::Schema => Self::name_of(&self.schema, type_id),
        };
        found.ok_or_else(|| {
            BusError::TransportNotFound(format!(
                "transport type is not registered as a '{family}' transport"
            ))
        })
    }

    fn name_of<F>(family_map: &HashMap<String, (TypeId, F)>, type_id: TypeId) -> Option<&str> {
        family_map
            .iter()
            .find(|(_, (registered, _))| *registered == type_id)
            .map(|(name, _)| name.as_str())
    }
}

impl Default for TransportPlugins {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportPlugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPlugins")
            .field("rpc", &self.rpc.keys())
            .field("result", &self.result.keys())
            .field("event", &self.event.keys())
            .field("schema", &self.schema.keys())
            .finish()
    }
}
