//! # RPC/Result Subsystem
//!
//! Functionality for both RPCs and results: the user-facing subclient
//! ([`RpcResultClient`]), the dock that converts its commands into transport
//! operations ([`RpcResultDock`]), and the executor that runs inbound RPCs
//! against locally registered APIs ([`RpcExecutor`]).
//!
//! ## Call Path
//!
//! ```text
//! caller ─▶ CallRpc (staged) ─▶ ReceiveResult (receiver armed) ─▶ publish
//!                                        │
//! caller ◀── result queue ◀── receive_result listener ◀── (wire)
//! ```
//!
//! A result can arrive arbitrarily quickly, so the dock stages the outbound
//! call and publishes it only after the result receiver has reported that it
//! is armed. The ordering of the two commands must therefore never be
//! inverted, even though both travel the same asynchronous pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use futures::StreamExt;

use crate::api::ApiRegistry;
use crate::client::commands::{Command, CommandConsumer, CommandProducer, ResultSender};
use crate::client::utilities::{bail_on_error, spawn_monitored, ListenerTasks};
use crate::config::Config;
use crate::error::{BusError, ErrorQueue};
use crate::hooks::HookRegistry;
use crate::message::{Kwargs, ResultMessage, RpcMessage};
use crate::schema::Schema;
use crate::transport::registry::AnyTransportPool;
use crate::transport::{CallOptions, TransportRegistry};
use crate::utils::{cast_to_parameters, deform_kwargs, deform_to_bus, human_time,
    validate_event_or_rpc_name};

/// User-facing operations for calling and serving RPCs
pub struct RpcResultClient {
    producer: CommandProducer,
    executor_producer: CommandProducer,
    api_registry: Arc<ApiRegistry>,
    schema: Arc<Schema>,
    hooks: Arc<HookRegistry>,
    error_queue: ErrorQueue,
}

impl RpcResultClient {
    pub(crate) fn new(
        producer: CommandProducer,
        executor_producer: CommandProducer,
        api_registry: Arc<ApiRegistry>,
        schema: Arc<Schema>,
        hooks: Arc<HookRegistry>,
        error_queue: ErrorQueue,
    ) -> Self {
        Self {
            producer,
            executor_producer,
            api_registry,
            schema,
            hooks,
            error_queue,
        }
    }

    /// Call a remote procedure and wait for its result
    pub async fn call_rpc_remote(
        &self,
        api_name: &str,
        name: &str,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<Value, BusError> {
        validate_event_or_rpc_name(api_name, "rpc", name)?;
        let kwargs = deform_kwargs(kwargs)?;
        let rpc_message = RpcMessage::new(api_name, name, kwargs);

        info!(rpc = %rpc_message.canonical_name(), "calling remote RPC");
        let start = Instant::now();

        self.schema.validate_outgoing_rpc(&rpc_message).await?;
        self.hooks.before_rpc_call(&rpc_message).await?;

        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        // Send the RPC. The dock stages it until the receiver is armed.
        self.producer
            .send(Command::CallRpc {
                message: rpc_message.clone(),
                options: options.clone(),
            })
            .await?
            .wait()
            .await?;

        // Arm a listener for the result. The dock enforces the timeout.
        self.producer
            .send(Command::ReceiveResult {
                message: rpc_message.clone(),
                destination: result_tx,
                options,
            })
            .await?
            .wait()
            .await?;

        // Wait for the result, bailing out if a background task fails first.
        let outcome = bail_on_error(&self.error_queue, result_rx.recv()).await?;
        // First result wins; any duplicate now has nowhere to go.
        drop(result_rx);
        let elapsed = start.elapsed();

        let result_message = match outcome {
            None => {
                // The dock dropped the destination without feeding it; the
                // reason, if any, is on the error queue.
                return match self.error_queue.try_get() {
                    Some(record) => Err(record.error),
                    None => Err(BusError::PipelineClosed),
                };
            }
            Some(Err(BusError::RpcTimeout { canonical_name, .. })) => {
                return Err(BusError::RpcTimeout {
                    canonical_name,
                    elapsed,
                })
            }
            Some(Err(other)) => return Err(other),
            Some(Ok(message)) => message,
        };

        self.hooks
            .after_rpc_call(&rpc_message, &result_message)
            .await?;

        if result_message.error {
            warn!(
                rpc = %rpc_message.canonical_name(),
                took = %human_time(elapsed),
                "server error during remote call"
            );
            let message = match &result_message.result {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            return Err(BusError::ServerError {
                canonical_name: rpc_message.canonical_name(),
                message,
                trace: result_message.trace,
            });
        }

        info!(
            rpc = %rpc_message.canonical_name(),
            took = %human_time(elapsed),
            "remote call completed"
        );
        self.schema.validate_incoming_result(&result_message).await?;
        Ok(result_message.result)
    }

    /// Start consuming RPCs for the given APIs in the background
    ///
    /// Defaults to every API registered with this client.
    pub async fn consume_rpcs(&self, api_names: Option<Vec<String>>) -> Result<(), BusError> {
        let api_names = match api_names {
            Some(names) => names,
            None => self.api_registry.names().await,
        };
        if api_names.is_empty() {
            return Err(BusError::NoApisToListenOn);
        }
        self.producer
            .send(Command::ConsumeRpcs { api_names })
            .await?
            .wait()
            .await
    }

    /// Shut down the dock and the executor
    pub async fn close(&self) -> Result<(), BusError> {
        // A closed pipeline means the dock is already gone; nothing to do.
        if let Ok(sent) = self.producer.send(Command::Close).await {
            let _ = sent.wait().await;
        }
        if let Ok(sent) = self.executor_producer.send(Command::Close).await {
            let _ = sent.wait().await;
        }
        Ok(())
    }
}

/// Converts RPC/result commands into transport operations
pub struct RpcResultDock {
    consumer: CommandConsumer,
    executor_producer: CommandProducer,
    transport_registry: Arc<TransportRegistry>,
    config: Arc<Config>,
    error_queue: ErrorQueue,
    listener_tasks: ListenerTasks,
    /// Outbound calls held back until their result receiver is armed
    staged_calls: HashMap<String, (RpcMessage, CallOptions)>,
}

impl RpcResultDock {
    pub(crate) fn new(
        consumer: CommandConsumer,
        executor_producer: CommandProducer,
        transport_registry: Arc<TransportRegistry>,
        config: Arc<Config>,
        error_queue: ErrorQueue,
    ) -> Self {
        Self {
            consumer,
            executor_producer,
            transport_registry,
            config,
            error_queue,
            listener_tasks: ListenerTasks::new(),
            staged_calls: HashMap::new(),
        }
    }

    /// Run the dock on a background task
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("RPC/result dock running");
        while let Some(command) = self.consumer.next().await {
            let closing = matches!(command, Command::Close);
            if let Err(error) = self.handle(command).await {
                self.error_queue.put("rpc_result_dock", error);
            }
            if closing {
                break;
            }
        }
        debug!("RPC/result dock stopped");
    }

    async fn handle(&mut self, command: Command) -> Result<(), BusError> {
        trace!(command = command.name(), "RPC/result dock handling command");
        match command {
            Command::CallRpc { message, options } => {
                // Held until the matching ReceiveResult arms its listener;
                // publishing now could lose a prompt result.
                self.staged_calls
                    .insert(message.id.clone(), (message, options));
                Ok(())
            }
            Command::ReceiveResult {
                message,
                destination,
                options,
            } => self.handle_receive_result(message, destination, options).await,
            Command::ConsumeRpcs { api_names } => self.handle_consume_rpcs(api_names).await,
            Command::SendResult {
                message,
                rpc_message,
            } => self.handle_send_result(message, rpc_message).await,
            Command::Close => self.handle_close().await,
            // Owned by other docks; receiving one here is a programming error.
            command @ (Command::ExecuteRpc { .. }
            | Command::ConsumeEvents { .. }
            | Command::SendEvent { .. }) => Err(BusError::UnrecognisedCommand {
                dock: "rpc_result_dock",
                command: command.name(),
            }),
        }
    }

    async fn handle_receive_result(
        &mut self,
        message: RpcMessage,
        destination: ResultSender,
        options: CallOptions,
    ) -> Result<(), BusError> {
        let result_pool = self
            .transport_registry
            .get_result_transport_pool(&message.api_name)?;
        let timeout_after = options
            .timeout
            .unwrap_or_else(|| self.config.api(&message.api_name).rpc_timeout);

        let (armed_tx, armed_rx) = oneshot::channel();
        let receive_message = message.clone();
        let handle = spawn_monitored(
            "rpc_result_dock.receive_result",
            &self.error_queue,
            async move {
                let mut transport = result_pool.acquire().await?;
                let return_path = transport.get_return_path(&receive_message);
                // The transport registers interest in the return path before
                // its first suspension, so signalling here makes it safe for
                // the dock to let the staged call out.
                let _ = armed_tx.send(());
                let receive = transport.receive_result(&receive_message, &return_path, &options);
                match timeout(timeout_after, receive).await {
                    Ok(Ok(result_message)) => {
                        let _ = destination.send(Ok(result_message));
                        Ok(())
                    }
                    Ok(Err(transport_error)) => Err(transport_error.into()),
                    Err(_) => {
                        trace!(
                            rpc = %receive_message.canonical_name(),
                            "result wait timed out"
                        );
                        let _ = destination.send(Err(BusError::RpcTimeout {
                            canonical_name: receive_message.canonical_name(),
                            elapsed: timeout_after,
                        }));
                        Ok(())
                    }
                }
            },
        );
        self.listener_tasks.register(handle);

        if armed_rx.await.is_err() {
            // The receiver died before arming (pool refused, open failed);
            // its failure is already on the error queue. Publishing the call
            // now could lose the result, so the staged call stays unsent.
            self.staged_calls.remove(&message.id);
            return Ok(());
        }

        if let Some((staged, staged_options)) = self.staged_calls.remove(&message.id) {
            let rpc_pool = self
                .transport_registry
                .get_rpc_transport_pool(&staged.api_name)?;
            let mut transport = rpc_pool.acquire().await?;
            transport.call_rpc(&staged, &staged_options).await?;
        }
        Ok(())
    }

    async fn handle_consume_rpcs(&mut self, api_names: Vec<String>) -> Result<(), BusError> {
        info!(apis = ?api_names, "consuming RPCs");
        let groups = self.transport_registry.get_rpc_transport_pools(&api_names)?;
        for (pool, names) in groups {
            let executor = self.executor_producer.clone();
            let handle = spawn_monitored(
                "rpc_result_dock.consume_rpcs",
                &self.error_queue,
                async move {
                    let mut transport = pool.acquire().await?;
                    let mut inbound = transport.consume_rpcs(&names).await?;
                    while let Some(received) = inbound.next().await {
                        let rpc_message = received?;
                        trace!(rpc = %rpc_message.canonical_name(), "inbound RPC");
                        executor
                            .send(Command::ExecuteRpc {
                                message: rpc_message,
                            })
                            .await?
                            .wait()
                            .await?;
                    }
                    Ok(())
                },
            );
            self.listener_tasks.register(handle);
        }
        Ok(())
    }

    async fn handle_send_result(
        &mut self,
        message: ResultMessage,
        rpc_message: RpcMessage,
    ) -> Result<(), BusError> {
        let pool = self
            .transport_registry
            .get_result_transport_pool(&rpc_message.api_name)?;
        let mut transport = pool.acquire().await?;
        let return_path = transport.get_return_path(&rpc_message);
        transport
            .send_result(&rpc_message, &message, &return_path)
            .await?;
        Ok(())
    }

    async fn handle_close(&mut self) -> Result<(), BusError> {
        if !self.staged_calls.is_empty() {
            warn!(
                staged = self.staged_calls.len(),
                "dropping staged RPC calls at shutdown"
            );
            self.staged_calls.clear();
        }

        // Listeners may hold scoped pool acquisitions; they must be cancelled
        // and awaited before the pools can drain.
        self.listener_tasks.cancel_all().await;

        let mut first_failure = None;
        for pool in self.transport_registry.get_all_transport_pools() {
            let closed = match &pool {
                AnyTransportPool::Rpc(pool) => pool.close().await,
                AnyTransportPool::Result(pool) => pool.close().await,
                // Event and schema pools belong to their own owners.
                AnyTransportPool::Event(_) | AnyTransportPool::Schema(_) => continue,
            };
            if let Err(error) = closed {
                warn!(%error, "error closing transport pool at shutdown");
                first_failure.get_or_insert(error);
            }
        }
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Executes inbound RPCs against locally registered APIs
pub struct RpcExecutor {
    consumer: CommandConsumer,
    dock_producer: CommandProducer,
    api_registry: Arc<ApiRegistry>,
    config: Arc<Config>,
    schema: Arc<Schema>,
    hooks: Arc<HookRegistry>,
    error_queue: ErrorQueue,
}

impl RpcExecutor {
    pub(crate) fn new(
        consumer: CommandConsumer,
        dock_producer: CommandProducer,
        api_registry: Arc<ApiRegistry>,
        config: Arc<Config>,
        schema: Arc<Schema>,
        hooks: Arc<HookRegistry>,
        error_queue: ErrorQueue,
    ) -> Self {
        Self {
            consumer,
            dock_producer,
            api_registry,
            config,
            schema,
            hooks,
            error_queue,
        }
    }

    /// Run the executor on a background task
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!("RPC executor running");
        while let Some(command) = self.consumer.next().await {
            let closing = matches!(command, Command::Close);
            if let Err(error) = self.handle(command).await {
                self.error_queue.put("rpc_executor", error);
            }
            if closing {
                break;
            }
        }
        debug!("RPC executor stopped");
    }

    async fn handle(&mut self, command: Command) -> Result<(), BusError> {
        match command {
            Command::ExecuteRpc { message } => self.handle_execute_rpc(message).await,
            Command::Close => Ok(()),
            // Owned by the docks; receiving one here is a programming error.
            command @ (Command::CallRpc { .. }
            | Command::ReceiveResult { .. }
            | Command::SendResult { .. }
            | Command::ConsumeRpcs { .. }
            | Command::ConsumeEvents { .. }
            | Command::SendEvent { .. }) => Err(BusError::UnrecognisedCommand {
                dock: "rpc_executor",
                command: command.name(),
            }),
        }
    }

    async fn handle_execute_rpc(&mut self, message: RpcMessage) -> Result<(), BusError> {
        self.schema.validate_incoming_rpc(&message).await?;
        self.hooks.before_rpc_execution(&message).await?;

        let api = self
            .api_registry
            .get(&message.api_name)
            .await
            .ok_or_else(|| BusError::UnknownApi(message.api_name.clone()))?;
        let procedure = api
            .procedure(&message.procedure_name)
            .ok_or_else(|| BusError::UnknownProcedure {
                api_name: message.api_name.clone(),
                name: message.procedure_name.clone(),
            })?
            .clone();

        let kwargs = if self.config.api(&message.api_name).cast_values {
            cast_to_parameters(message.kwargs.clone(), procedure.parameters())
        } else {
            message.kwargs.clone()
        };

        let started = Instant::now();
        let outcome = procedure.call(kwargs).await;

        let result_message = match outcome {
            // Simulated message loss: drop the result path entirely so the
            // caller experiences a server that died mid-call.
            Err(BusError::SuddenDeath) => {
                debug!(
                    rpc = %message.canonical_name(),
                    "sudden death requested; no result will be sent"
                );
                return Ok(());
            }
            Err(error) => {
                warn!(
                    rpc = %message.canonical_name(),
                    took = %human_time(started.elapsed()),
                    error = %error,
                    "error while executing procedure"
                );
                ResultMessage::for_error(&message, &error)
            }
            Ok(value) => {
                info!(
                    rpc = %message.canonical_name(),
                    took = %human_time(started.elapsed()),
                    "executed procedure"
                );
                let value = deform_to_bus(&value)?;
                ResultMessage::for_result(&message, value)
            }
        };

        self.hooks
            .after_rpc_execution(&message, &result_message)
            .await?;
        if !result_message.error {
            self.schema.validate_outgoing_result(&result_message).await?;
        }

        self.dock_producer
            .send(Command::SendResult {
                message: result_message,
                rpc_message: message,
            })
            .await?
            .wait()
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::commands::command_pipeline;
    use crate::defaults;
    use crate::transport::memory::{MemoryBroker, MemoryResultTransport, MemoryRpcTransport};
    use crate::transport::pool::TransportPool;
    use crate::transport::{ResultTransport, RpcTransport};
    use serde_json::json;
    use std::time::Duration;

    fn broker_registry(broker: &MemoryBroker) -> Arc<TransportRegistry> {
        let mut registry = TransportRegistry::new();
        let rpc_broker = broker.clone();
        registry.set_rpc_transport_pool(
            "default",
            TransportPool::new(
                "rpc:memory",
                defaults::TRANSPORT_POOL_SIZE,
                Box::new(move || {
                    Ok(Box::new(MemoryRpcTransport::new(rpc_broker.clone()))
                        as Box<dyn RpcTransport>)
                }),
            ),
        );
        let result_broker = broker.clone();
        registry.set_result_transport_pool(
            "default",
            TransportPool::new(
                "result:memory",
                defaults::TRANSPORT_POOL_SIZE,
                Box::new(move || {
                    Ok(Box::new(MemoryResultTransport::new(result_broker.clone()))
                        as Box<dyn ResultTransport>)
                }),
            ),
        );
        Arc::new(registry)
    }

    fn spawn_dock(
        broker: &MemoryBroker,
        error_queue: &ErrorQueue,
    ) -> (CommandProducer, CommandConsumer) {
        let (producer, consumer) = command_pipeline(defaults::COMMAND_QUEUE_DEPTH);
        let (executor_producer, executor_consumer) =
            command_pipeline(defaults::COMMAND_QUEUE_DEPTH);
        // Tests drive the dock directly; the executor consumer is handed back
        // so the callers can keep its pipeline alive for the test's duration.
        let dock = RpcResultDock::new(
            consumer,
            executor_producer,
            broker_registry(broker),
            Arc::new(Config::default()),
            error_queue.clone(),
        );
        dock.spawn();
        (producer, executor_consumer)
    }

    #[tokio::test]
    async fn a_call_is_published_and_its_result_delivered() {
        let broker = MemoryBroker::new("dock-roundtrip");
        let error_queue = ErrorQueue::new();
        let (producer, _executor) = spawn_dock(&broker, &error_queue);

        // A stand-in server answering over the broker directly.
        let server_broker = broker.clone();
        tokio::spawn(async move {
            let mut rpc_transport = MemoryRpcTransport::new(server_broker.clone());
            let mut inbound = rpc_transport
                .consume_rpcs(&["company.auth".to_string()])
                .await
                .unwrap();
            let call = inbound.next().await.unwrap().unwrap();
            let mut result_transport = MemoryResultTransport::new(server_broker);
            let return_path = result_transport.get_return_path(&call);
            let reply = ResultMessage::for_result(&call, json!("pong"));
            result_transport
                .send_result(&call, &reply, &return_path)
                .await
                .unwrap();
        });

        let message = RpcMessage::new("company.auth", "ping", Kwargs::new());
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        producer
            .send(Command::CallRpc {
                message: message.clone(),
                options: CallOptions::default(),
            })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        producer
            .send(Command::ReceiveResult {
                message,
                destination: result_tx,
                options: CallOptions::default(),
            })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let delivered = result_rx.recv().await.unwrap().unwrap();
        assert_eq!(delivered.result, json!("pong"));
        assert!(error_queue.try_get().is_none());
    }

    #[tokio::test]
    async fn an_unanswered_call_times_out_onto_the_result_queue() {
        let broker = MemoryBroker::new("dock-timeout");
        let error_queue = ErrorQueue::new();
        let (producer, _executor) = spawn_dock(&broker, &error_queue);

        let message = RpcMessage::new("company.auth", "ping", Kwargs::new());
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();

        producer
            .send(Command::CallRpc {
                message: message.clone(),
                options: CallOptions::with_timeout(Duration::from_millis(50)),
            })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        producer
            .send(Command::ReceiveResult {
                message,
                destination: result_tx,
                options: CallOptions::with_timeout(Duration::from_millis(50)),
            })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let delivered = result_rx.recv().await.unwrap();
        assert!(matches!(delivered, Err(BusError::RpcTimeout { .. })));
    }

    #[tokio::test]
    async fn foreign_commands_land_on_the_error_queue() {
        let broker = MemoryBroker::new("dock-foreign");
        let error_queue = ErrorQueue::new();
        let (producer, _executor) = spawn_dock(&broker, &error_queue);

        producer
            .send(Command::ExecuteRpc {
                message: RpcMessage::new("company.auth", "ping", Kwargs::new()),
            })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let record = error_queue.get().await;
        assert!(matches!(
            record.error,
            BusError::UnrecognisedCommand {
                dock: "rpc_result_dock",
                command: "ExecuteRpc"
            }
        ));
    }
}
