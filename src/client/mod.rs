//! # Bus Client
//!
//! The user-facing client and its internal machinery. The client wires
//! together the transport registry, the API registry, schema handling, the
//! hook registry and the process-wide error queue, then spawns three workers:
//!
//! - the **RPC/result dock**, turning call/receive/send-result commands into
//!   transport operations
//! - the **RPC executor**, running inbound calls against registered APIs
//! - the **event dock**, managing event listeners and publications
//!
//! All user-facing methods communicate with the workers through command
//! pipelines; none of them touch a transport directly. `close` shuts the
//! pipelines down, waits for the workers to finish their teardown and closes
//! every transport pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub mod commands;
pub mod event;
pub mod rpc_result;
pub mod utilities;

pub use commands::{command_pipeline, Command, CommandConsumer, CommandProducer, SentCommand};
pub use event::{EventClient, EventDock};
pub use rpc_result::{RpcExecutor, RpcResultClient, RpcResultDock};
pub use utilities::{bail_on_error, spawn_monitored, ListenerTasks};

use crate::api::{Api, ApiRegistry};
use crate::config::Config;
use crate::defaults;
use crate::error::{BusError, ErrorQueue};
use crate::hooks::HookRegistry;
use crate::message::{EventMessage, Kwargs};
use crate::schema::Schema;
use crate::transport::{CallOptions, TransportOptions, TransportPlugins, TransportRegistry};

/// An asynchronous message-bus client
///
/// Multiplexes RPC calls and event traffic over the transports selected by
/// its configuration. One client is one bus connection; applications normally
/// create a single client and share it.
pub struct BusClient {
    config: Arc<Config>,
    api_registry: Arc<ApiRegistry>,
    schema: Arc<Schema>,
    transport_registry: Arc<TransportRegistry>,
    error_queue: ErrorQueue,
    rpc: RpcResultClient,
    event: EventClient,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    schema_monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BusClient {
    /// Create a client from configuration, using the built-in transports
    pub fn new(config: Config) -> Result<Self, BusError> {
        Self::with_plugins(config, TransportPlugins::new(), HookRegistry::new())
    }

    /// Create a client with explicit transport plugins and hooks
    pub fn with_plugins(
        config: Config,
        plugins: TransportPlugins,
        hooks: HookRegistry,
    ) -> Result<Self, BusError> {
        let transport_registry = TransportRegistry::load_config(&config, &plugins)?;
        Ok(Self::with_transport_registry(config, transport_registry, hooks))
    }

    /// Create a client over an already-populated transport registry
    ///
    /// The escape hatch for hosts that build pools programmatically instead
    /// of through configuration.
    pub fn with_transport_registry(
        config: Config,
        transport_registry: TransportRegistry,
        hooks: HookRegistry,
    ) -> Self {
        let config = Arc::new(config);
        let transport_registry = Arc::new(transport_registry);
        let api_registry = Arc::new(ApiRegistry::new());
        let hooks = Arc::new(hooks);
        let error_queue = ErrorQueue::new();

        let schema_pool = transport_registry.get_schema_transport_pool().ok();
        let schema = Arc::new(Schema::new(schema_pool, config.bus.schema.ttl));

        let (rpc_producer, rpc_consumer) = command_pipeline(defaults::COMMAND_QUEUE_DEPTH);
        let (executor_producer, executor_consumer) =
            command_pipeline(defaults::COMMAND_QUEUE_DEPTH);
        let (event_producer, event_consumer) = command_pipeline(defaults::COMMAND_QUEUE_DEPTH);

        let worker_handles = vec![
            RpcResultDock::new(
                rpc_consumer,
                executor_producer.clone(),
                Arc::clone(&transport_registry),
                Arc::clone(&config),
                error_queue.clone(),
            )
            .spawn(),
            RpcExecutor::new(
                executor_consumer,
                rpc_producer.clone(),
                Arc::clone(&api_registry),
                Arc::clone(&config),
                Arc::clone(&schema),
                Arc::clone(&hooks),
                error_queue.clone(),
            )
            .spawn(),
            EventDock::new(
                event_consumer,
                Arc::clone(&transport_registry),
                error_queue.clone(),
            )
            .spawn(),
        ];

        let rpc = RpcResultClient::new(
            rpc_producer,
            executor_producer,
            Arc::clone(&api_registry),
            Arc::clone(&schema),
            Arc::clone(&hooks),
            error_queue.clone(),
        );
        let event = EventClient::new(
            event_producer,
            Arc::clone(&api_registry),
            Arc::clone(&schema),
            Arc::clone(&transport_registry),
        );

        debug!("bus client wired and workers spawned");
        Self {
            config,
            api_registry,
            schema,
            transport_registry,
            error_queue,
            rpc,
            event,
            worker_handles: Mutex::new(worker_handles),
            schema_monitor: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Register an API, making its procedures servable and events publishable
    pub async fn register_api(&self, api: Api) -> Result<(), BusError> {
        self.ensure_open()?;
        let api = self.api_registry.register(api).await;
        self.schema.add_api(&api).await;
        info!(api = api.name(), "registered API");
        Ok(())
    }

    /// Call a remote procedure and wait for its result
    pub async fn call_rpc_remote(
        &self,
        api_name: &str,
        name: &str,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<Value, BusError> {
        self.ensure_open()?;
        self.rpc.call_rpc_remote(api_name, name, kwargs, options).await
    }

    /// Serve RPCs for the given APIs (default: every registered API)
    pub async fn consume_rpcs(&self, api_names: Option<Vec<String>>) -> Result<(), BusError> {
        self.ensure_open()?;
        self.rpc.consume_rpcs(api_names).await
    }

    /// Fire an event on a registered API
    pub async fn send_event(
        &self,
        api_name: &str,
        name: &str,
        kwargs: Kwargs,
        options: TransportOptions,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.event.send_event(api_name, name, kwargs, options).await
    }

    /// Consume events, forwarding each onto `destination`
    pub async fn consume_events(
        &self,
        events: Vec<(String, String)>,
        listener_name: &str,
        destination: mpsc::Sender<EventMessage>,
        options: TransportOptions,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.event
            .consume_events(events, listener_name, destination, options)
            .await
    }

    /// Events previously fired for `api_name.event_name`, newest first
    pub async fn event_history(
        &self,
        api_name: &str,
        event_name: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventMessage>, BusError> {
        self.ensure_open()?;
        self.event.event_history(api_name, event_name, start, stop).await
    }

    /// Store this client's API schemas on the bus
    pub async fn save_schema_to_bus(&self) -> Result<(), BusError> {
        self.ensure_open()?;
        self.schema.save_to_bus().await
    }

    /// Load the schemas other bus processes have shared
    pub async fn load_schemas_from_bus(&self) -> Result<(), BusError> {
        self.ensure_open()?;
        self.schema.load_from_bus().await
    }

    /// Periodically re-ping stored schemas so their ttl never lapses
    ///
    /// Replaces any previous monitor. Runs until the client closes.
    pub fn monitor_schema(&self, interval: Duration) -> Result<(), BusError> {
        self.ensure_open()?;
        if !self.schema.is_shared() {
            return Err(BusError::TransportNotFound(
                "schema monitoring requires a configured schema transport".to_string(),
            ));
        }
        let handle = spawn_monitored(
            "schema_monitor",
            &self.error_queue,
            Arc::clone(&self.schema).monitor(interval),
        );
        let previous = self
            .schema_monitor
            .lock()
            .expect("schema monitor lock poisoned")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// The process-wide error queue background failures surface on
    pub fn error_queue(&self) -> &ErrorQueue {
        &self.error_queue
    }

    /// The schemas known to this client
    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    /// The transport registry backing this client
    pub fn transport_registry(&self) -> &TransportRegistry {
        &self.transport_registry
    }

    /// The effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether `close` has completed (or begun)
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut the client down
    ///
    /// Cancels every listener, waits for the workers to finish their teardown
    /// and closes every transport pool. Idempotent.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing bus client");

        let monitor = self
            .schema_monitor
            .lock()
            .expect("schema monitor lock poisoned")
            .take();
        if let Some(monitor) = monitor {
            monitor.abort();
            let _ = monitor.await;
        }

        // Ask the docks to tear down, then wait for them to finish doing so.
        self.rpc.close().await?;
        self.event.close().await?;
        let workers: Vec<JoinHandle<()>> = self
            .worker_handles
            .lock()
            .expect("worker handle lock poisoned")
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.await;
        }

        // The docks have closed their own pools; this sweep catches the
        // schema pool and anything not owned by a dock. Close is idempotent.
        for pool in self.transport_registry.get_all_transport_pools() {
            let _ = pool.close().await;
        }

        info!("bus client closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::PipelineClosed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
