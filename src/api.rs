//! # API Definitions and Registry
//!
//! An API is a named collection of procedures (async callables with typed
//! parameters) and events (named payload definitions). Applications build APIs
//! with [`ApiBuilder`] and register them with the client, which makes the
//! procedures servable and the events publishable.
//!
//! Identity is the canonical dotted name, e.g. `company.auth`. Registering a
//! second API under the same name replaces the first.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::BusError;
use crate::message::Kwargs;
use crate::utils::{validate_api_name, validate_event_or_rpc_name};

/// The kinds a procedure parameter may declare, used for kwargs coercion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    String,
    Integer,
    Float,
    Boolean,
    /// No coercion; the value is passed through as received
    Any,
}

/// A declared procedure parameter
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
}

/// The user-provided callable behind a procedure
pub type ProcedureHandler =
    Arc<dyn Fn(Kwargs) -> BoxFuture<'static, Result<Value, BusError>> + Send + Sync>;

/// A named remote procedure on an API
#[derive(Clone)]
pub struct Procedure {
    name: String,
    parameters: Vec<Parameter>,
    handler: ProcedureHandler,
}

impl Procedure {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// Invoke the user-provided handler
    pub fn call(&self, kwargs: Kwargs) -> BoxFuture<'static, Result<Value, BusError>> {
        (self.handler)(kwargs)
    }
}

// Procedure holds a closure, so a hand-rolled Debug keeps derive off the handler.
impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// A named event an API may fire
#[derive(Debug, Clone)]
pub struct EventDefinition {
    name: String,
    parameters: Vec<String>,
}

impl EventDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }
}

/// A named collection of procedures and events
#[derive(Clone)]
pub struct Api {
    name: String,
    procedures: HashMap<String, Procedure>,
    events: HashMap<String, EventDefinition>,
}

impl Api {
    /// Start building an API with the given canonical name
    pub fn builder(name: impl Into<String>) -> ApiBuilder {
        ApiBuilder {
            name: name.into(),
            procedures: HashMap::new(),
            events: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDefinition> {
        self.events.get(name)
    }

    pub fn procedures(&self) -> impl Iterator<Item = &Procedure> {
        self.procedures.values()
    }

    pub fn events(&self) -> impl Iterator<Item = &EventDefinition> {
        self.events.values()
    }
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("name", &self.name)
            .field("procedures", &self.procedures.keys())
            .field("events", &self.events.keys())
            .finish()
    }
}

/// Builder for [`Api`] values
pub struct ApiBuilder {
    name: String,
    procedures: HashMap<String, Procedure>,
    events: HashMap<String, EventDefinition>,
}

impl ApiBuilder {
    /// Add a procedure with declared parameters and an async handler
    ///
    /// The handler receives the (possibly cast) kwargs and returns the result
    /// value, or an error that will travel back to the caller as a remote
    /// application failure.
    pub fn procedure<F, Fut>(
        mut self,
        name: impl Into<String>,
        parameters: &[(&str, ParameterKind)],
        handler: F,
    ) -> Self
    where
        F: Fn(Kwargs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, BusError>> + Send + 'static,
    {
        let name = name.into();
        let parameters = parameters
            .iter()
            .map(|(param, kind)| Parameter {
                name: param.to_string(),
                kind: *kind,
            })
            .collect();
        let handler: ProcedureHandler = Arc::new(move |kwargs| Box::pin(handler(kwargs)));
        self.procedures.insert(
            name.clone(),
            Procedure {
                name,
                parameters,
                handler,
            },
        );
        self
    }

    /// Declare an event and the parameter names it carries
    pub fn event(mut self, name: impl Into<String>, parameters: &[&str]) -> Self {
        let name = name.into();
        let parameters = parameters.iter().map(|p| p.to_string()).collect();
        self.events
            .insert(name.clone(), EventDefinition { name, parameters });
        self
    }

    /// Validate names and produce the API
    pub fn build(self) -> Result<Api, BusError> {
        validate_api_name(&self.name)?;
        for name in self.procedures.keys() {
            validate_event_or_rpc_name(&self.name, "rpc", name)?;
        }
        for name in self.events.keys() {
            validate_event_or_rpc_name(&self.name, "event", name)?;
        }
        Ok(Api {
            name: self.name,
            procedures: self.procedures,
            events: self.events,
        })
    }
}

/// Registry of the APIs known to one bus client
///
/// Read-mostly after startup; registration takes a write lock so APIs may also
/// be added while the client is running.
#[derive(Debug, Default)]
pub struct ApiRegistry {
    apis: RwLock<HashMap<String, Arc<Api>>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an API, replacing any previous registration of the same name
    pub async fn register(&self, api: Api) -> Arc<Api> {
        let api = Arc::new(api);
        self.apis
            .write()
            .await
            .insert(api.name().to_string(), Arc::clone(&api));
        api
    }

    /// Look up an API by canonical name
    pub async fn get(&self, api_name: &str) -> Option<Arc<Api>> {
        self.apis.read().await.get(api_name).cloned()
    }

    /// All registered APIs
    pub async fn all(&self) -> Vec<Arc<Api>> {
        self.apis.read().await.values().cloned().collect()
    }

    /// Names of all registered APIs
    pub async fn names(&self) -> Vec<String> {
        self.apis.read().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.apis.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth_api() -> Api {
        Api::builder("company.auth")
            .procedure(
                "check_password",
                &[
                    ("username", ParameterKind::String),
                    ("password", ParameterKind::String),
                ],
                |kwargs| async move { Ok(json!(kwargs["username"] == json!("admin"))) },
            )
            .event("user_created", &["username"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn procedures_and_events_are_addressable() {
        let api = auth_api();
        assert_eq!(api.name(), "company.auth");
        assert!(api.procedure("check_password").is_some());
        assert!(api.procedure("missing").is_none());
        assert!(api.event("user_created").is_some());

        let mut kwargs = Kwargs::new();
        kwargs.insert("username".to_string(), json!("admin"));
        let result = api
            .procedure("check_password")
            .unwrap()
            .call(kwargs)
            .await
            .unwrap();
        assert_eq!(result, json!(true));
    }

    #[test]
    fn builder_rejects_invalid_names() {
        assert!(Api::builder("company..auth").build().is_err());
        assert!(Api::builder("auth")
            .procedure("_hidden", &[], |_| async { Ok(json!(null)) })
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn registry_replaces_duplicate_registrations() {
        let registry = ApiRegistry::new();
        registry.register(auth_api()).await;
        registry.register(auth_api()).await;
        assert_eq!(registry.names().await.len(), 1);
        assert!(registry.get("company.auth").await.is_some());
        assert!(registry.get("missing").await.is_none());
    }
}
