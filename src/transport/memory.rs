//! # In-Process Memory Transports
//!
//! A loopback transport family backed by a process-local broker. Every client
//! in the process that selects the same broker name shares one bus, which
//! makes these transports the reference backend for development and tests:
//! no external services, yet real queueing, correlation and backpressure
//! behaviour.
//!
//! ## Broker Model
//!
//! - **RPC queues**: one queue per API; calls are delivered to exactly one
//!   consumer (round-robin) or held in a backlog until a consumer appears
//! - **Result mailboxes**: keyed by return path; a result arriving before its
//!   receiver is buffered, and duplicate deliveries are discarded (first wins)
//! - **Event fan-out**: every live subscriber whose listen set matches
//!   receives a copy; per-subscriber buffers are bounded, so slow consumers
//!   push back on publishers
//! - **Schema store**: api name to schema document with ttl bookkeeping
//!
//! Configuration options: `{"broker": "main", "batch_size": 16,
//! "buffer_depth": 128}`. All fields optional.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::defaults;
use crate::error::{BusError, ErrorQueue, TransportError};
use crate::message::{EventMessage, ResultMessage, RpcMessage};

use super::{
    CallOptions, EventTransport, ResultTransport, RpcTransport, SchemaTransport, Transport,
    TransportOptions, TransportPlugins,
};

/// Register the `memory` transport family with a plugin registry
pub fn register_memory_family(plugins: &mut TransportPlugins) {
    plugins.register_rpc("memory", MemoryRpcTransport::from_config);
    plugins.register_result("memory", MemoryResultTransport::from_config);
    plugins.register_event("memory", MemoryEventTransport::from_config);
    plugins.register_schema("memory", MemorySchemaTransport::from_config);
}

/// Options accepted by every transport in the `memory` family
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryTransportOptions {
    /// Name of the process-local broker to attach to
    pub broker: String,

    /// Maximum number of events yielded per consumption batch
    pub batch_size: usize,

    /// Per-subscriber event buffer depth; the backpressure bound
    pub buffer_depth: usize,
}

impl Default for MemoryTransportOptions {
    fn default() -> Self {
        Self {
            broker: "default".to_string(),
            batch_size: defaults::EVENT_BATCH_SIZE,
            buffer_depth: defaults::EVENT_BUFFER_DEPTH,
        }
    }
}

impl MemoryTransportOptions {
    fn from_value(options: &Value) -> Result<Self, BusError> {
        if options.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(options.clone()).map_err(|e| {
            BusError::ConfigurationInvalid(format!("invalid memory transport options: {e}"))
        })
    }
}

#[derive(Default)]
struct RpcChannel {
    backlog: VecDeque<RpcMessage>,
    consumers: Vec<mpsc::UnboundedSender<RpcMessage>>,
    next_consumer: usize,
}

enum ResultSlot {
    /// A receiver is armed and waiting
    Waiting(oneshot::Sender<ResultMessage>),
    /// The result arrived before any receiver; held until one turns up
    Delivered(ResultMessage),
}

struct EventSubscriber {
    listener_name: String,
    listen_for: HashSet<(String, String)>,
    sender: mpsc::Sender<EventMessage>,
}

struct StoredSchema {
    schema: Value,
    ttl_seconds: u64,
    stored_at: DateTime<Utc>,
}

struct BrokerShared {
    name: String,
    rpc: Mutex<HashMap<String, RpcChannel>>,
    results: Mutex<HashMap<String, ResultSlot>>,
    subscribers: Mutex<Vec<EventSubscriber>>,
    history: Mutex<HashMap<(String, String), VecDeque<(DateTime<Utc>, EventMessage)>>>,
    schemas: Mutex<HashMap<String, StoredSchema>>,
    unacked: Mutex<HashSet<String>>,
    next_native_id: AtomicU64,
}

/// A process-local message broker shared by `memory` transports
///
/// Cheap to clone; clones share state. Brokers obtained through
/// [`MemoryBroker::named`] are shared process-wide by name, which is how
/// several clients in one process end up on the same bus.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerShared>,
}

static NAMED_BROKERS: OnceLock<Mutex<HashMap<String, MemoryBroker>>> = OnceLock::new();

impl MemoryBroker {
    /// Create a standalone broker not listed in the process-wide registry
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerShared {
                name: name.into(),
                rpc: Mutex::new(HashMap::new()),
                results: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                history: Mutex::new(HashMap::new()),
                schemas: Mutex::new(HashMap::new()),
                unacked: Mutex::new(HashSet::new()),
                next_native_id: AtomicU64::new(1),
            }),
        }
    }

    /// Fetch or create the process-wide broker with the given name
    pub fn named(name: &str) -> Self {
        let registry = NAMED_BROKERS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = registry.lock().expect("broker registry lock poisoned");
        registry
            .entry(name.to_string())
            .or_insert_with(|| Self::new(name))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    // --- RPC queues ---

    /// Deliver a call to one consumer of its API, or hold it until one appears
    fn publish_rpc(&self, message: RpcMessage) {
        let mut rpc = self.inner.rpc.lock().expect("broker rpc lock poisoned");
        let channel = rpc.entry(message.api_name.clone()).or_default();
        channel.consumers.retain(|tx| !tx.is_closed());
        if channel.consumers.is_empty() {
            trace!(broker = %self.inner.name, api = %message.api_name, "no RPC consumer; backlogging call");
            channel.backlog.push_back(message);
            return;
        }
        let index = channel.next_consumer % channel.consumers.len();
        channel.next_consumer = channel.next_consumer.wrapping_add(1);
        let _ = channel.consumers[index].send(message);
    }

    /// Attach a consumer to each named API, draining any backlog to it
    fn subscribe_rpcs(&self, api_names: &[String]) -> Vec<mpsc::UnboundedReceiver<RpcMessage>> {
        let mut rpc = self.inner.rpc.lock().expect("broker rpc lock poisoned");
        api_names
            .iter()
            .map(|api_name| {
                let channel = rpc.entry(api_name.clone()).or_default();
                let (tx, rx) = mpsc::unbounded_channel();
                for message in channel.backlog.drain(..) {
                    let _ = tx.send(message);
                }
                channel.consumers.push(tx);
                rx
            })
            .collect()
    }

    /// Number of live RPC consumers attached to an API
    pub fn rpc_consumer_count(&self, api_name: &str) -> usize {
        let mut rpc = self.inner.rpc.lock().expect("broker rpc lock poisoned");
        rpc.entry(api_name.to_string())
            .or_default()
            .consumers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    // --- Result mailboxes ---

    /// Deliver a result to the waiting receiver, or buffer it until one arms.
    /// A second result for the same return path is discarded.
    fn deliver_result(&self, return_path: &str, message: ResultMessage) {
        let mut results = self.inner.results.lock().expect("broker results lock poisoned");
        match results.remove(return_path) {
            Some(ResultSlot::Waiting(waiter)) => {
                if let Err(unclaimed) = waiter.send(message) {
                    // The receiver gave up (timed out) before we delivered.
                    trace!(
                        broker = %self.inner.name,
                        return_path,
                        rpc_message_id = %unclaimed.rpc_message_id,
                        "dropping result for an abandoned receiver"
                    );
                }
            }
            Some(ResultSlot::Delivered(first)) => {
                trace!(broker = %self.inner.name, return_path, "discarding duplicate result");
                results.insert(return_path.to_string(), ResultSlot::Delivered(first));
            }
            None => {
                results.insert(return_path.to_string(), ResultSlot::Delivered(message));
            }
        }
    }

    /// Wait for the result addressed to `return_path`
    ///
    /// Interest is registered synchronously, before this function first
    /// suspends, so callers who arm before the call is dispatched can never
    /// miss the result.
    async fn await_result(&self, return_path: &str) -> Result<ResultMessage, TransportError> {
        let receiver = {
            let mut results = self.inner.results.lock().expect("broker results lock poisoned");
            match results.remove(return_path) {
                Some(ResultSlot::Delivered(message)) => return Ok(message),
                Some(ResultSlot::Waiting(_stale)) => {
                    warn!(
                        broker = %self.inner.name,
                        return_path,
                        "replacing a stale result receiver"
                    );
                    let (tx, rx) = oneshot::channel();
                    results.insert(return_path.to_string(), ResultSlot::Waiting(tx));
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    results.insert(return_path.to_string(), ResultSlot::Waiting(tx));
                    rx
                }
            }
        };
        receiver.await.map_err(|_| {
            TransportError::Connection("result mailbox was torn down while waiting".to_string())
        })
    }

    // --- Event fan-out ---

    /// Publish an event to every matching subscriber and record it in history
    ///
    /// Blocks when a matching subscriber's buffer is full; that is the
    /// backpressure path from slow consumers back to publishers.
    async fn publish_event(&self, mut message: EventMessage) -> Result<(), TransportError> {
        let native_id = self.inner.next_native_id.fetch_add(1, Ordering::Relaxed);
        message.native_id = Some(native_id.to_string());
        self.inner
            .unacked
            .lock()
            .expect("broker unacked lock poisoned")
            .insert(native_id.to_string());

        {
            let mut history = self.inner.history.lock().expect("broker history lock poisoned");
            let stream = history
                .entry((message.api_name.clone(), message.event_name.clone()))
                .or_default();
            stream.push_back((Utc::now(), message.clone()));
            while stream.len() > defaults::EVENT_HISTORY_LIMIT {
                stream.pop_front();
            }
        }

        let targets: Vec<mpsc::Sender<EventMessage>> = {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .expect("broker subscribers lock poisoned");
            subscribers.retain(|s| !s.sender.is_closed());
            let key = (message.api_name.clone(), message.event_name.clone());
            subscribers
                .iter()
                .filter(|s| s.listen_for.contains(&key))
                .map(|s| s.sender.clone())
                .collect()
        };

        // Send outside the lock: a full subscriber buffer must stall only the
        // publisher, never the broker.
        for target in targets {
            let _ = target.send(message.clone()).await;
        }
        Ok(())
    }

    /// Attach an event subscriber for the given `(api, event)` pairs
    fn subscribe_events(
        &self,
        listen_for: &[(String, String)],
        listener_name: &str,
        buffer_depth: usize,
    ) -> mpsc::Receiver<EventMessage> {
        let (tx, rx) = mpsc::channel(buffer_depth.max(1));
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("broker subscribers lock poisoned");
        subscribers.push(EventSubscriber {
            listener_name: listener_name.to_string(),
            listen_for: listen_for.iter().cloned().collect(),
            sender: tx,
        });
        rx
    }

    /// Number of live event subscribers (listener tasks holding a stream)
    pub fn live_event_subscriber_count(&self) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("broker subscribers lock poisoned");
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.len()
    }

    /// Names of the live event listeners, for diagnostics
    pub fn live_event_listener_names(&self) -> Vec<String> {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("broker subscribers lock poisoned");
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers.iter().map(|s| s.listener_name.clone()).collect()
    }

    fn acknowledge(&self, messages: &[EventMessage]) {
        let mut unacked = self.inner.unacked.lock().expect("broker unacked lock poisoned");
        for message in messages {
            if let Some(native_id) = &message.native_id {
                unacked.remove(native_id);
            }
        }
    }

    /// Number of published events not yet acknowledged by a consumer
    pub fn unacknowledged_count(&self) -> usize {
        self.inner
            .unacked
            .lock()
            .expect("broker unacked lock poisoned")
            .len()
    }

    fn event_history(
        &self,
        api_name: &str,
        event_name: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
        start_inclusive: bool,
    ) -> Vec<EventMessage> {
        let history = self.inner.history.lock().expect("broker history lock poisoned");
        let Some(stream) = history.get(&(api_name.to_string(), event_name.to_string())) else {
            return Vec::new();
        };
        stream
            .iter()
            .rev() // newest first
            .filter(|(at, _)| match start {
                Some(start) if start_inclusive => *at >= start,
                Some(start) => *at > start,
                None => true,
            })
            .filter(|(at, _)| match stop {
                Some(stop) => *at <= stop,
                None => true,
            })
            .map(|(_, message)| message.clone())
            .collect()
    }

    // --- Schema store ---

    fn store_schema(&self, api_name: &str, schema: &Value, ttl_seconds: u64) {
        let mut schemas = self.inner.schemas.lock().expect("broker schemas lock poisoned");
        schemas.insert(
            api_name.to_string(),
            StoredSchema {
                schema: schema.clone(),
                ttl_seconds,
                stored_at: Utc::now(),
            },
        );
    }

    fn load_schemas(&self) -> HashMap<String, Value> {
        let now = Utc::now();
        let schemas = self.inner.schemas.lock().expect("broker schemas lock poisoned");
        schemas
            .iter()
            .filter(|(_, stored)| {
                let expires = stored.stored_at + chrono::Duration::seconds(stored.ttl_seconds as i64);
                expires >= now
            })
            .map(|(api_name, stored)| (api_name.clone(), stored.schema.clone()))
            .collect()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

fn unbounded_stream<T: Send + 'static>(
    receiver: mpsc::UnboundedReceiver<T>,
) -> impl futures::Stream<Item = T> + Send {
    stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    })
}

/// RPC transport over a [`MemoryBroker`]
pub struct MemoryRpcTransport {
    broker: MemoryBroker,
}

impl MemoryRpcTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    fn from_config(options: &Value) -> Result<Self, BusError> {
        let options = MemoryTransportOptions::from_value(options)?;
        Ok(Self::new(MemoryBroker::named(&options.broker)))
    }
}

#[async_trait]
impl Transport for MemoryRpcTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        debug!(broker = %self.broker.name(), "memory RPC transport open");
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for MemoryRpcTransport {
    async fn call_rpc(
        &mut self,
        rpc_message: &RpcMessage,
        _options: &CallOptions,
    ) -> Result<(), TransportError> {
        trace!(
            broker = %self.broker.name(),
            rpc = %rpc_message.canonical_name(),
            id = %rpc_message.id,
            "publishing RPC call"
        );
        self.broker.publish_rpc(rpc_message.clone());
        Ok(())
    }

    async fn consume_rpcs(
        &mut self,
        api_names: &[String],
    ) -> Result<BoxStream<'static, Result<RpcMessage, TransportError>>, TransportError> {
        let receivers = self.broker.subscribe_rpcs(api_names);
        let streams = receivers
            .into_iter()
            .map(|receiver| unbounded_stream(receiver).boxed());
        Ok(stream::select_all(streams).map(Ok).boxed())
    }
}

/// Result transport over a [`MemoryBroker`]
pub struct MemoryResultTransport {
    broker: MemoryBroker,
}

impl MemoryResultTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    fn from_config(options: &Value) -> Result<Self, BusError> {
        let options = MemoryTransportOptions::from_value(options)?;
        Ok(Self::new(MemoryBroker::named(&options.broker)))
    }
}

#[async_trait]
impl Transport for MemoryResultTransport {}

#[async_trait]
impl ResultTransport for MemoryResultTransport {
    fn get_return_path(&self, rpc_message: &RpcMessage) -> String {
        format!("memory://results/{}", rpc_message.id)
    }

    async fn send_result(
        &mut self,
        rpc_message: &RpcMessage,
        result_message: &ResultMessage,
        return_path: &str,
    ) -> Result<(), TransportError> {
        trace!(
            broker = %self.broker.name(),
            rpc = %rpc_message.canonical_name(),
            return_path,
            error = result_message.error,
            "sending RPC result"
        );
        self.broker.deliver_result(return_path, result_message.clone());
        Ok(())
    }

    async fn receive_result(
        &mut self,
        _rpc_message: &RpcMessage,
        return_path: &str,
        _options: &CallOptions,
    ) -> Result<ResultMessage, TransportError> {
        self.broker.await_result(return_path).await
    }
}

/// Event transport over a [`MemoryBroker`]
pub struct MemoryEventTransport {
    broker: MemoryBroker,
    options: MemoryTransportOptions,
}

impl MemoryEventTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            options: MemoryTransportOptions::default(),
        }
    }

    fn from_config(options: &Value) -> Result<Self, BusError> {
        let options = MemoryTransportOptions::from_value(options)?;
        Ok(Self {
            broker: MemoryBroker::named(&options.broker),
            options,
        })
    }
}

#[async_trait]
impl Transport for MemoryEventTransport {}

#[async_trait]
impl EventTransport for MemoryEventTransport {
    async fn send_event(
        &mut self,
        event_message: &EventMessage,
        _options: &TransportOptions,
    ) -> Result<(), TransportError> {
        trace!(
            broker = %self.broker.name(),
            event = %event_message.canonical_name(),
            "publishing event"
        );
        self.broker.publish_event(event_message.clone()).await
    }

    async fn consume(
        &mut self,
        listen_for: &[(String, String)],
        listener_name: &str,
        _error_queue: ErrorQueue,
        _options: &TransportOptions,
    ) -> Result<BoxStream<'static, Result<Vec<EventMessage>, TransportError>>, TransportError>
    {
        debug!(
            broker = %self.broker.name(),
            listener_name,
            events = listen_for.len(),
            "attaching event listener"
        );
        let receiver =
            self.broker
                .subscribe_events(listen_for, listener_name, self.options.buffer_depth);
        let batch_size = self.options.batch_size.max(1);
        let batches = stream::unfold(receiver, move |mut receiver| async move {
            let first = receiver.recv().await?;
            let mut batch = vec![first];
            while batch.len() < batch_size {
                match receiver.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(_) => break,
                }
            }
            Some((Ok(batch), receiver))
        });
        Ok(batches.boxed())
    }

    async fn acknowledge(&mut self, event_messages: &[EventMessage]) -> Result<(), TransportError> {
        self.broker.acknowledge(event_messages);
        Ok(())
    }

    async fn history(
        &mut self,
        api_name: &str,
        event_name: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
        start_inclusive: bool,
    ) -> Result<BoxStream<'static, Result<EventMessage, TransportError>>, TransportError> {
        let events = self
            .broker
            .event_history(api_name, event_name, start, stop, start_inclusive);
        Ok(stream::iter(events).map(Ok).boxed())
    }
}

/// Schema transport over a [`MemoryBroker`]
pub struct MemorySchemaTransport {
    broker: MemoryBroker,
}

impl MemorySchemaTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    fn from_config(options: &Value) -> Result<Self, BusError> {
        let options = MemoryTransportOptions::from_value(options)?;
        Ok(Self::new(MemoryBroker::named(&options.broker)))
    }
}

#[async_trait]
impl Transport for MemorySchemaTransport {}

#[async_trait]
impl SchemaTransport for MemorySchemaTransport {
    async fn store(
        &mut self,
        api_name: &str,
        schema: &Value,
        ttl_seconds: u64,
    ) -> Result<(), TransportError> {
        self.broker.store_schema(api_name, schema, ttl_seconds);
        Ok(())
    }

    async fn load(&mut self) -> Result<HashMap<String, Value>, TransportError> {
        Ok(self.broker.load_schemas())
    }
}
