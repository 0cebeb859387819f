//! # Event Subsystem
//!
//! The user-facing event subclient ([`EventClient`]) and the dock that turns
//! its commands into event-transport operations ([`EventDock`]).
//!
//! Consuming events spawns one listener task per distinct event-transport
//! pool covering the requested events, so APIs that share a transport share a
//! listener. Each listener forwards decoded events onto the caller-provided
//! destination queue in arrival order; the destination's bounded depth is the
//! backpressure boundary — a slow consumer stalls the forwarder, which stops
//! pulling from the transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::api::ApiRegistry;
use crate::client::commands::{Command, CommandConsumer, CommandProducer};
use crate::client::utilities::{spawn_monitored, ListenerTasks};
use crate::error::{BusError, ErrorQueue, TransportError};
use crate::message::{EventMessage, Kwargs};
use crate::schema::Schema;
use crate::transport::registry::AnyTransportPool;
use crate::transport::{TransportOptions, TransportRegistry};
use crate::utils::{deform_kwargs, validate_event_or_rpc_name};

/// User-facing operations for publishing and consuming events
pub struct EventClient {
    producer: CommandProducer,
    api_registry: Arc<ApiRegistry>,
    schema: Arc<Schema>,
    transport_registry: Arc<TransportRegistry>,
}

impl EventClient {
    pub(crate) fn new(
        producer: CommandProducer,
        api_registry: Arc<ApiRegistry>,
        schema: Arc<Schema>,
        transport_registry: Arc<TransportRegistry>,
    ) -> Self {
        Self {
            producer,
            api_registry,
            schema,
            transport_registry,
        }
    }

    /// Publish an event on an API registered with this client
    ///
    /// Only locally registered APIs may fire events, and the kwargs must
    /// match the event's declared parameters exactly.
    pub async fn send_event(
        &self,
        api_name: &str,
        name: &str,
        kwargs: Kwargs,
        options: TransportOptions,
    ) -> Result<(), BusError> {
        validate_event_or_rpc_name(api_name, "event", name)?;
        let kwargs = deform_kwargs(kwargs)?;

        let api = self
            .api_registry
            .get(api_name)
            .await
            .ok_or_else(|| BusError::UnknownApi(api_name.to_string()))?;
        let definition = api.event(name).ok_or_else(|| BusError::UnknownEvent {
            api_name: api_name.to_string(),
            name: name.to_string(),
        })?;

        // Event arguments are part of the contract with listeners; reject
        // anything that does not match the declaration.
        let declared = definition.parameters();
        let mut missing: Vec<&str> = declared
            .iter()
            .filter(|p| !kwargs.contains_key(*p))
            .map(|p| p.as_str())
            .collect();
        let mut unexpected: Vec<&str> = kwargs
            .keys()
            .filter(|k| !declared.contains(k))
            .map(|k| k.as_str())
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            missing.sort_unstable();
            unexpected.sort_unstable();
            return Err(BusError::InvalidEventArguments {
                api_name: api_name.to_string(),
                name: name.to_string(),
                reason: format!("missing: {missing:?}, unexpected: {unexpected:?}"),
            });
        }

        let event_message = EventMessage::new(api_name, name, kwargs);
        self.schema.validate_outgoing_event(&event_message).await?;

        info!(event = %event_message.canonical_name(), "firing event");
        self.producer
            .send(Command::SendEvent {
                message: event_message,
                options,
            })
            .await?
            .wait()
            .await
    }

    /// Start consuming events in the background
    ///
    /// `events` lists `(api_name, event_name)` pairs; every matching event is
    /// forwarded onto `destination`. The listener runs until the client closes.
    pub async fn consume_events(
        &self,
        events: Vec<(String, String)>,
        listener_name: &str,
        destination: mpsc::Sender<EventMessage>,
        options: TransportOptions,
    ) -> Result<(), BusError> {
        if events.is_empty() {
            return Err(BusError::NothingToListenFor);
        }
        for (api_name, event_name) in &events {
            validate_event_or_rpc_name(api_name, "event", event_name)?;
        }

        self.producer
            .send(Command::ConsumeEvents {
                events,
                listener_name: listener_name.to_string(),
                destination,
                options,
            })
            .await?
            .wait()
            .await
    }

    /// Events previously fired for `api_name.event_name`, newest first
    ///
    /// A pull API served directly from the event transport; availability
    /// depends on the backend retaining history at all.
    pub async fn event_history(
        &self,
        api_name: &str,
        event_name: &str,
        start: Option<DateTime<Utc>>,
        stop: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventMessage>, BusError> {
        let pool = self.transport_registry.get_event_transport_pool(api_name)?;
        let mut transport = pool.acquire().await?;
        let stream = transport
            .history(api_name, event_name, start, stop, true)
            .await?;
        let events: Vec<Result<EventMessage, TransportError>> = stream.collect().await;
        events
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(BusError::from)
    }

    /// Shut down the event dock
    pub async fn close(&self) -> Result<(), BusError> {
        if let Ok(sent) = self.producer.send(Command::Close).await {
            let _ = sent.wait().await;
        }
        Ok(())
    }
}

/// Converts event commands into event-transport operations
pub struct EventDock {
    consumer: CommandConsumer,
    transport_registry: Arc<TransportRegistry>,
    error_queue: ErrorQueue,
    listener_tasks: ListenerTasks,
}

impl EventDock {
    pub(crate) fn new(
        consumer: CommandConsumer,
        transport_registry: Arc<TransportRegistry>,
        error_queue: ErrorQueue,
    ) -> Self {
        Self {
            consumer,
            transport_registry,
            error_queue,
            listener_tasks: ListenerTasks::new(),
        }
    }

    /// Run the dock on a background task
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("event dock running");
        while let Some(command) = self.consumer.next().await {
            let closing = matches!(command, Command::Close);
            if let Err(error) = self.handle(command).await {
                self.error_queue.put("event_dock", error);
            }
            if closing {
                break;
            }
        }
        debug!("event dock stopped");
    }

    async fn handle(&mut self, command: Command) -> Result<(), BusError> {
        trace!(command = command.name(), "event dock handling command");
        match command {
            Command::ConsumeEvents {
                events,
                listener_name,
                destination,
                options,
            } => {
                self.handle_consume_events(events, listener_name, destination, options)
                    .await
            }
            Command::SendEvent { message, options } => {
                self.handle_send_event(message, options).await
            }
            Command::Close => self.handle_close().await,
            // Owned by the RPC side; receiving one here is a programming error.
            command @ (Command::CallRpc { .. }
            | Command::ReceiveResult { .. }
            | Command::ExecuteRpc { .. }
            | Command::SendResult { .. }
            | Command::ConsumeRpcs { .. }) => Err(BusError::UnrecognisedCommand {
                dock: "event_dock",
                command: command.name(),
            }),
        }
    }

    async fn handle_consume_events(
        &mut self,
        events: Vec<(String, String)>,
        listener_name: String,
        destination: mpsc::Sender<EventMessage>,
        options: TransportOptions,
    ) -> Result<(), BusError> {
        let api_names: Vec<String> = events.iter().map(|(api, _)| api.clone()).collect();
        let groups = self.transport_registry.get_event_transport_pools(&api_names)?;
        info!(
            listener_name,
            events = events.len(),
            listeners = groups.len(),
            "consuming events"
        );

        // One listener task per transport pool, each given the subset of
        // events its pool serves.
        for (pool, group_apis) in groups {
            let listen_for: Vec<(String, String)> = events
                .iter()
                .filter(|(api, _)| group_apis.contains(api))
                .cloned()
                .collect();
            let destination = destination.clone();
            let listener_name = listener_name.clone();
            let options = options.clone();
            let error_queue = self.error_queue.clone();

            let handle = spawn_monitored("event_dock.listener", &self.error_queue, async move {
                let mut transport = pool.acquire().await?;
                let mut batches = transport
                    .consume(&listen_for, &listener_name, error_queue, &options)
                    .await?;
                while let Some(batch) = batches.next().await {
                    let batch = batch?;
                    for event_message in &batch {
                        trace!(
                            event = %event_message.canonical_name(),
                            "forwarding event to destination queue"
                        );
                        if destination.send(event_message.clone()).await.is_err() {
                            // The consumer hung up; this listener is done.
                            debug!(listener_name, "event destination dropped; stopping listener");
                            return Ok(());
                        }
                    }
                    // The whole batch was handed over; let the transport know.
                    transport.acknowledge(&batch).await?;
                }
                Ok(())
            });
            self.listener_tasks.register(handle);
        }
        Ok(())
    }

    async fn handle_send_event(
        &mut self,
        message: EventMessage,
        options: TransportOptions,
    ) -> Result<(), BusError> {
        let pool = self
            .transport_registry
            .get_event_transport_pool(&message.api_name)?;
        let mut transport = pool.acquire().await?;
        transport.send_event(&message, &options).await?;
        Ok(())
    }

    async fn handle_close(&mut self) -> Result<(), BusError> {
        // Cancellation is awaited before close, so no listener is still
        // consuming when its transport is torn down.
        self.listener_tasks.cancel_all().await;

        let mut first_failure = None;
        for pool in self.transport_registry.get_all_transport_pools() {
            let closed = match &pool {
                AnyTransportPool::Event(pool) => pool.close().await,
                AnyTransportPool::Rpc(_)
                | AnyTransportPool::Result(_)
                | AnyTransportPool::Schema(_) => continue,
            };
            if let Err(error) = closed {
                warn!(%error, "error closing event transport pool at shutdown");
                first_failure.get_or_insert(error);
            }
        }
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
