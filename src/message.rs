//! # Bus Message Types
//!
//! The three message shapes carried over transports: RPC calls, RPC results and
//! events. All are short-lived values created per call or per event, serialisable
//! with Serde so concrete transports can put them on a wire, and immutable once
//! constructed.
//!
//! Message identity is a freshly generated UUID per message. The RPC result is
//! correlated back to its call through [`ResultMessage::rpc_message_id`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BusError;

/// Keyword arguments for procedures and events
///
/// Values are wire-shaped JSON values; `utils::deform_to_bus` is the boundary
/// that turns arbitrary serialisable data into this shape.
pub type Kwargs = serde_json::Map<String, Value>;

/// A single outbound or inbound remote procedure call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcMessage {
    /// Fresh opaque identifier for this call, used for result correlation
    pub id: String,

    /// Name of the API holding the procedure, e.g. `company.auth`
    pub api_name: String,

    /// Name of the procedure to invoke
    pub procedure_name: String,

    /// Keyword arguments passed to the procedure
    pub kwargs: Kwargs,
}

impl RpcMessage {
    /// Create a new RPC message with a fresh identifier
    pub fn new(
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs,
        }
    }

    /// The dotted `api.procedure` form used in logs and error messages
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.procedure_name)
    }
}

/// The outcome of executing a remote procedure call
///
/// `error` distinguishes a successful result from a remote application failure;
/// for failures, `result` holds the error description and `trace` the remote
/// stack trace when the server chose to share one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultMessage {
    /// Identifier of the RPC message this result answers
    pub rpc_message_id: String,

    /// Name of the API the call was made against
    pub api_name: String,

    /// Name of the procedure that was executed
    pub procedure_name: String,

    /// The return value, or an error description when `error` is set
    pub result: Value,

    /// Whether the remote execution failed
    pub error: bool,

    /// Remote stack trace accompanying a failed execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ResultMessage {
    /// Build a successful result for the given call
    pub fn for_result(rpc_message: &RpcMessage, result: Value) -> Self {
        Self {
            rpc_message_id: rpc_message.id.clone(),
            api_name: rpc_message.api_name.clone(),
            procedure_name: rpc_message.procedure_name.clone(),
            result,
            error: false,
            trace: None,
        }
    }

    /// Build an error result for the given call
    ///
    /// The error's display form becomes the result payload and its debug form
    /// stands in for a stack trace.
    pub fn for_error(rpc_message: &RpcMessage, error: &BusError) -> Self {
        Self {
            rpc_message_id: rpc_message.id.clone(),
            api_name: rpc_message.api_name.clone(),
            procedure_name: rpc_message.procedure_name.clone(),
            result: Value::String(error.to_string()),
            error: true,
            trace: Some(format!("{error:?}")),
        }
    }

    /// The dotted `api.procedure` form used in logs and error messages
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.procedure_name)
    }
}

/// A single published or consumed event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMessage {
    /// Fresh opaque identifier for this event
    pub id: String,

    /// Name of the API the event belongs to
    pub api_name: String,

    /// Name of the event within the API
    pub event_name: String,

    /// Keyword arguments carried by the event
    pub kwargs: Kwargs,

    /// The transport's own identifier for this delivery, used to acknowledge it.
    /// Absent until a transport has assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_id: Option<String>,
}

impl EventMessage {
    /// Create a new event message with a fresh identifier
    pub fn new(
        api_name: impl Into<String>,
        event_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
            native_id: None,
        }
    }

    /// The dotted `api.event` form used in logs and error messages
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_messages_get_unique_ids() {
        let a = RpcMessage::new("company.auth", "check_password", Kwargs::new());
        let b = RpcMessage::new("company.auth", "check_password", Kwargs::new());
        assert_ne!(a.id, b.id);
        assert_eq!(a.canonical_name(), "company.auth.check_password");
    }

    #[test]
    fn result_correlates_to_its_call() {
        let rpc = RpcMessage::new("company.auth", "check_password", Kwargs::new());
        let result = ResultMessage::for_result(&rpc, json!(true));
        assert_eq!(result.rpc_message_id, rpc.id);
        assert!(!result.error);
        assert!(result.trace.is_none());
    }

    #[test]
    fn error_result_carries_description_and_trace() {
        let rpc = RpcMessage::new("company.auth", "check_password", Kwargs::new());
        let result = ResultMessage::for_error(&rpc, &BusError::NoApisToListenOn);
        assert!(result.error);
        assert!(result.result.as_str().unwrap().contains("consume_rpcs"));
        assert!(result.trace.is_some());
    }

    #[test]
    fn messages_round_trip_through_serde() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("username".to_string(), json!("admin"));
        let event = EventMessage::new("company.auth", "user_created", kwargs);

        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: EventMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, decoded);
    }
}
