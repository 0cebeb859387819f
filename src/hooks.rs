//! # Execution Hooks
//!
//! Typed entry points invoked around RPC calls and executions. Applications
//! implement [`BusHooks`] for the moments they care about; every method has a
//! no-op default, so a hook set only overrides what it needs.
//!
//! Hooks run inline on the calling task. An error returned from a hook aborts
//! the operation it wraps.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;
use crate::message::{ResultMessage, RpcMessage};

/// Hook points the client invokes around RPC traffic
#[async_trait]
pub trait BusHooks: Send + Sync {
    /// Invoked before an outbound RPC call is handed to the pipeline
    async fn before_rpc_call(&self, _rpc_message: &RpcMessage) -> Result<(), BusError> {
        Ok(())
    }

    /// Invoked once the result for an outbound RPC call has arrived
    async fn after_rpc_call(
        &self,
        _rpc_message: &RpcMessage,
        _result_message: &ResultMessage,
    ) -> Result<(), BusError> {
        Ok(())
    }

    /// Invoked before a locally served procedure executes
    async fn before_rpc_execution(&self, _rpc_message: &RpcMessage) -> Result<(), BusError> {
        Ok(())
    }

    /// Invoked after a locally served procedure has produced its result message
    async fn after_rpc_execution(
        &self,
        _rpc_message: &RpcMessage,
        _result_message: &ResultMessage,
    ) -> Result<(), BusError> {
        Ok(())
    }
}

/// An ordered collection of hook sets
///
/// The client invokes every registered hook set in registration order. With no
/// registrations every entry point is a no-op.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn BusHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook set to the end of the invocation order
    pub fn register(&mut self, hooks: Arc<dyn BusHooks>) {
        self.hooks.push(hooks);
    }

    pub async fn before_rpc_call(&self, rpc_message: &RpcMessage) -> Result<(), BusError> {
        for hook in &self.hooks {
            hook.before_rpc_call(rpc_message).await?;
        }
        Ok(())
    }

    pub async fn after_rpc_call(
        &self,
        rpc_message: &RpcMessage,
        result_message: &ResultMessage,
    ) -> Result<(), BusError> {
        for hook in &self.hooks {
            hook.after_rpc_call(rpc_message, result_message).await?;
        }
        Ok(())
    }

    pub async fn before_rpc_execution(&self, rpc_message: &RpcMessage) -> Result<(), BusError> {
        for hook in &self.hooks {
            hook.before_rpc_execution(rpc_message).await?;
        }
        Ok(())
    }

    pub async fn after_rpc_execution(
        &self,
        rpc_message: &RpcMessage,
        result_message: &ResultMessage,
    ) -> Result<(), BusError> {
        for hook in &self.hooks {
            hook.after_rpc_execution(rpc_message, result_message).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hook_sets", &self.hooks.len())
            .finish()
    }
}
