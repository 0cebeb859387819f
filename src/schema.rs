//! # Schema Facade
//!
//! Maintains the schema documents describing each API's procedures and events,
//! shares them over the bus through the configured schema transport, and
//! validates messages against whatever schemas are known.
//!
//! Validation here is deliberately shallow — existence of the named procedure
//! or event plus recognised parameter names. Deep payload validation belongs
//! to external schema tooling; a message that passes here may still be
//! rejected by the serving application.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::api::Api;
use crate::error::BusError;
use crate::message::{EventMessage, Kwargs, ResultMessage, RpcMessage};
use crate::transport::registry::SchemaTransportPool;

/// The schemas known to one bus client
pub struct Schema {
    /// Documents generated from locally registered APIs
    local: RwLock<HashMap<String, Value>>,
    /// Documents loaded from the bus
    remote: RwLock<HashMap<String, Value>>,
    pool: Option<SchemaTransportPool>,
    ttl_seconds: u64,
}

impl Schema {
    pub fn new(pool: Option<SchemaTransportPool>, ttl_seconds: u64) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
            pool,
            ttl_seconds,
        }
    }

    /// Generate and record the schema document for a locally registered API
    pub async fn add_api(&self, api: &Api) {
        let procedures: serde_json::Map<String, Value> = api
            .procedures()
            .map(|procedure| {
                let parameters: Vec<&str> =
                    procedure.parameters().iter().map(|p| p.name.as_str()).collect();
                (
                    procedure.name().to_string(),
                    json!({ "parameters": parameters }),
                )
            })
            .collect();
        let events: serde_json::Map<String, Value> = api
            .events()
            .map(|event| {
                (
                    event.name().to_string(),
                    json!({ "parameters": event.parameters() }),
                )
            })
            .collect();

        let document = json!({ "procedures": procedures, "events": events });
        self.local
            .write()
            .await
            .insert(api.name().to_string(), document);
    }

    /// The schema document for an API, local registrations taking precedence
    pub async fn schema_for(&self, api_name: &str) -> Option<Value> {
        if let Some(document) = self.local.read().await.get(api_name) {
            return Some(document.clone());
        }
        self.remote.read().await.get(api_name).cloned()
    }

    /// Names of every API with a known schema
    pub async fn api_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local.read().await.keys().cloned().collect();
        for name in self.remote.read().await.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Store every local schema on the bus
    pub async fn save_to_bus(&self) -> Result<(), BusError> {
        let pool = self.require_pool()?;
        let local = self.local.read().await.clone();
        let mut transport = pool.acquire().await?;
        for (api_name, document) in &local {
            transport.store(api_name, document, self.ttl_seconds).await?;
        }
        info!(apis = local.len(), "saved local API schemas to the bus");
        Ok(())
    }

    /// Keep previously stored schemas alive
    pub async fn ping(&self) -> Result<(), BusError> {
        let pool = self.require_pool()?;
        let local = self.local.read().await.clone();
        let mut transport = pool.acquire().await?;
        for (api_name, document) in &local {
            transport.ping(api_name, document, self.ttl_seconds).await?;
        }
        debug!(apis = local.len(), "pinged schemas on the bus");
        Ok(())
    }

    /// Replace the remote schema set with whatever the bus currently holds
    pub async fn load_from_bus(&self) -> Result<(), BusError> {
        let pool = self.require_pool()?;
        let mut transport = pool.acquire().await?;
        let loaded = transport.load().await?;
        debug!(apis = loaded.len(), "loaded API schemas from the bus");
        *self.remote.write().await = loaded;
        Ok(())
    }

    /// Periodically re-ping schemas so their ttl never lapses
    ///
    /// Runs until cancelled; intended to be spawned as a monitored background
    /// task by the client.
    pub async fn monitor(self: Arc<Self>, interval: Duration) -> Result<(), BusError> {
        loop {
            tokio::time::sleep(interval).await;
            self.ping().await?;
        }
    }

    /// Whether schema sharing is configured at all
    pub fn is_shared(&self) -> bool {
        self.pool.is_some()
    }

    fn require_pool(&self) -> Result<&SchemaTransportPool, BusError> {
        self.pool.as_ref().ok_or_else(|| {
            BusError::TransportNotFound(
                "no schema transport is configured for this bus. Check the schema transport \
                 configuration is set up correctly (config section: bus.schema.transport)"
                    .to_string(),
            )
        })
    }

    // --- Validation ---

    pub async fn validate_outgoing_rpc(&self, rpc_message: &RpcMessage) -> Result<(), BusError> {
        self.validate_rpc(rpc_message, "outgoing").await
    }

    pub async fn validate_incoming_rpc(&self, rpc_message: &RpcMessage) -> Result<(), BusError> {
        self.validate_rpc(rpc_message, "incoming").await
    }

    pub async fn validate_outgoing_result(
        &self,
        result_message: &ResultMessage,
    ) -> Result<(), BusError> {
        self.validate_result(result_message, "outgoing").await
    }

    pub async fn validate_incoming_result(
        &self,
        result_message: &ResultMessage,
    ) -> Result<(), BusError> {
        self.validate_result(result_message, "incoming").await
    }

    pub async fn validate_outgoing_event(
        &self,
        event_message: &EventMessage,
    ) -> Result<(), BusError> {
        self.validate_named(
            &event_message.api_name,
            "events",
            &event_message.event_name,
            Some(&event_message.kwargs),
            "outgoing",
        )
        .await
    }

    pub async fn validate_incoming_event(
        &self,
        event_message: &EventMessage,
    ) -> Result<(), BusError> {
        self.validate_named(
            &event_message.api_name,
            "events",
            &event_message.event_name,
            Some(&event_message.kwargs),
            "incoming",
        )
        .await
    }

    async fn validate_rpc(
        &self,
        rpc_message: &RpcMessage,
        direction: &'static str,
    ) -> Result<(), BusError> {
        self.validate_named(
            &rpc_message.api_name,
            "procedures",
            &rpc_message.procedure_name,
            Some(&rpc_message.kwargs),
            direction,
        )
        .await
    }

    async fn validate_result(
        &self,
        result_message: &ResultMessage,
        direction: &'static str,
    ) -> Result<(), BusError> {
        self.validate_named(
            &result_message.api_name,
            "procedures",
            &result_message.procedure_name,
            None,
            direction,
        )
        .await
    }

    /// Check a named procedure/event exists in the API's schema and that the
    /// supplied kwargs only use declared parameter names. With no schema for
    /// the API there is nothing to validate and the message passes.
    async fn validate_named(
        &self,
        api_name: &str,
        section: &str,
        name: &str,
        kwargs: Option<&Kwargs>,
        direction: &'static str,
    ) -> Result<(), BusError> {
        let Some(document) = self.schema_for(api_name).await else {
            return Ok(());
        };

        let Some(entry) = document.get(section).and_then(|s| s.get(name)) else {
            return Err(BusError::SchemaValidation {
                direction,
                message: format!(
                    "'{name}' is not present in the {section} section of the schema for \
                     API '{api_name}'"
                ),
            });
        };

        if let Some(kwargs) = kwargs {
            let declared: Vec<&str> = entry
                .get("parameters")
                .and_then(|p| p.as_array())
                .map(|params| params.iter().filter_map(|p| p.as_str()).collect())
                .unwrap_or_default();
            for key in kwargs.keys() {
                if !declared.contains(&key.as_str()) {
                    return Err(BusError::SchemaValidation {
                        direction,
                        message: format!(
                            "unexpected argument '{key}' for '{api_name}.{name}'; declared \
                             parameters are: {declared:?}"
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schema")
            .field("shared", &self.pool.is_some())
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ParameterKind;
    use serde_json::json;

    async fn schema_with_auth() -> Schema {
        let api = Api::builder("company.auth")
            .procedure(
                "check_password",
                &[
                    ("username", ParameterKind::String),
                    ("password", ParameterKind::String),
                ],
                |_| async { Ok(json!(true)) },
            )
            .event("user_created", &["username"])
            .build()
            .unwrap();

        let schema = Schema::new(None, 60);
        schema.add_api(&api).await;
        schema
    }

    #[tokio::test]
    async fn known_messages_validate() {
        let schema = schema_with_auth().await;

        let mut kwargs = Kwargs::new();
        kwargs.insert("username".to_string(), json!("admin"));
        let rpc = RpcMessage::new("company.auth", "check_password", kwargs.clone());
        schema.validate_outgoing_rpc(&rpc).await.unwrap();

        let event = EventMessage::new("company.auth", "user_created", kwargs);
        schema.validate_outgoing_event(&event).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_procedures_and_arguments_are_rejected() {
        let schema = schema_with_auth().await;

        let rpc = RpcMessage::new("company.auth", "reset_password", Kwargs::new());
        assert!(matches!(
            schema.validate_outgoing_rpc(&rpc).await,
            Err(BusError::SchemaValidation { direction: "outgoing", .. })
        ));

        let mut kwargs = Kwargs::new();
        kwargs.insert("surprise".to_string(), json!(1));
        let rpc = RpcMessage::new("company.auth", "check_password", kwargs);
        assert!(schema.validate_incoming_rpc(&rpc).await.is_err());
    }

    #[tokio::test]
    async fn apis_without_schemas_pass_untouched() {
        let schema = schema_with_auth().await;
        let rpc = RpcMessage::new("company.unknown", "anything", Kwargs::new());
        schema.validate_outgoing_rpc(&rpc).await.unwrap();
    }

    #[tokio::test]
    async fn sharing_requires_a_configured_transport() {
        let schema = schema_with_auth().await;
        assert!(!schema.is_shared());
        assert!(matches!(
            schema.save_to_bus().await,
            Err(BusError::TransportNotFound(_))
        ));
    }
}
