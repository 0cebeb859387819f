//! # Internal Command Pipeline
//!
//! User-facing methods never touch transports directly. They assemble a
//! [`Command`], hand it to their subclient's producer and wait only for the
//! consumer to *accept* it. The docks drain the consumer side and own all
//! transport interaction, which is what lets shutdown cancel transport work
//! without stranding callers mid-I/O.
//!
//! ## Acknowledgement Semantics
//!
//! [`SentCommand::wait`] resolves when the consumer has dequeued the command,
//! not when its work has finished. Callers therefore fan out background work
//! without blocking on its completion; outcomes travel back through dedicated
//! destination queues or the error queue.
//!
//! ## Ordering
//!
//! One pipeline is one FIFO: commands are dispatched to the dock in exactly
//! the order they were produced.

use tokio::sync::{mpsc, oneshot};

use crate::error::BusError;
use crate::message::{EventMessage, ResultMessage, RpcMessage};
use crate::transport::{CallOptions, TransportOptions};

/// Destination queue for the result of a single RPC call
///
/// Carries either the correlated result message or the error that ended the
/// wait. The subclient takes the first item and drops the receiver, so any
/// duplicate deliveries simply have nowhere to go.
pub type ResultSender = mpsc::UnboundedSender<Result<ResultMessage, BusError>>;

/// The work items flowing through the internal pipelines
///
/// Each dock owns a subset of these; handing a dock a variant it does not own
/// is a programming error surfaced on the error queue. Every dock names every
/// variant in its dispatch match, so adding a variant here refuses to compile
/// until each dock has decided what to do with it.
#[derive(Debug)]
pub enum Command {
    /// Publish an RPC call over the RPC transport
    CallRpc {
        message: RpcMessage,
        options: CallOptions,
    },

    /// Arm a receiver for the result of `message`, delivering to `destination`
    ReceiveResult {
        message: RpcMessage,
        destination: ResultSender,
        options: CallOptions,
    },

    /// Execute an inbound RPC against a locally registered API
    ExecuteRpc { message: RpcMessage },

    /// Send the result of a locally executed RPC back to its caller
    SendResult {
        message: ResultMessage,
        rpc_message: RpcMessage,
    },

    /// Start consuming inbound RPCs for the named APIs
    ConsumeRpcs { api_names: Vec<String> },

    /// Start consuming events, forwarding them onto `destination`
    ConsumeEvents {
        events: Vec<(String, String)>,
        listener_name: String,
        destination: mpsc::Sender<EventMessage>,
        options: TransportOptions,
    },

    /// Publish an event over the event transport
    SendEvent {
        message: EventMessage,
        options: TransportOptions,
    },

    /// Shut the dock down: cancel its listeners and close its transports
    Close,
}

impl Command {
    /// The variant name, for logs and unrecognised-command errors
    pub fn name(&self) -> &'static str {
        match self {
            Command::CallRpc { .. } => "CallRpc",
            Command::ReceiveResult { .. } => "ReceiveResult",
            Command::ExecuteRpc { .. } => "ExecuteRpc",
            Command::SendResult { .. } => "SendResult",
            Command::ConsumeRpcs { .. } => "ConsumeRpcs",
            Command::ConsumeEvents { .. } => "ConsumeEvents",
            Command::SendEvent { .. } => "SendEvent",
            Command::Close => "Close",
        }
    }
}

struct QueuedCommand {
    command: Command,
    accepted: oneshot::Sender<()>,
}

/// Producer half of a command pipeline
#[derive(Clone)]
pub struct CommandProducer {
    tx: mpsc::Sender<QueuedCommand>,
}

/// Consumer half of a command pipeline, drained by a dock
pub struct CommandConsumer {
    rx: mpsc::Receiver<QueuedCommand>,
}

/// An acknowledgement handle for a produced command
pub struct SentCommand {
    accepted: oneshot::Receiver<()>,
}

/// Create a connected producer/consumer pair with the given queue depth
pub fn command_pipeline(depth: usize) -> (CommandProducer, CommandConsumer) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (CommandProducer { tx }, CommandConsumer { rx })
}

impl CommandProducer {
    /// Enqueue a command, returning a handle that resolves on acceptance
    pub async fn send(&self, command: Command) -> Result<SentCommand, BusError> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.tx
            .send(QueuedCommand {
                command,
                accepted: accepted_tx,
            })
            .await
            .map_err(|_| BusError::PipelineClosed)?;
        Ok(SentCommand {
            accepted: accepted_rx,
        })
    }
}

impl std::fmt::Debug for CommandProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProducer").finish_non_exhaustive()
    }
}

impl CommandConsumer {
    /// Dequeue the next command, acknowledging its producer
    ///
    /// Returns `None` once every producer handle has been dropped.
    pub async fn next(&mut self) -> Option<Command> {
        let queued = self.rx.recv().await?;
        // Acceptance, not completion: the producer unblocks here while the
        // dock goes on to do the actual work.
        let _ = queued.accepted.send(());
        Some(queued.command)
    }
}

impl std::fmt::Debug for CommandConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandConsumer").finish_non_exhaustive()
    }
}

impl SentCommand {
    /// Wait until the consumer has accepted the command
    pub async fn wait(self) -> Result<(), BusError> {
        self.accepted.await.map_err(|_| BusError::PipelineClosed)
    }
}
