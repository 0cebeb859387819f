//! # Client Configuration
//!
//! Typed configuration for the bus client. The surface mirrors the shape the
//! client consumes at startup:
//!
//! ```json
//! {
//!   "apis": {
//!     "default": {
//!       "rpc_transport":    {"memory": {"broker": "main"}},
//!       "result_transport": {"memory": {"broker": "main"}},
//!       "event_transport":  {"memory": {"broker": "main"}}
//!     },
//!     "company.auth": {
//!       "cast_values": true,
//!       "rpc_timeout": 9.0
//!     }
//!   },
//!   "bus": {
//!     "schema": {"transport": {"memory": {"broker": "main"}}, "ttl": 60}
//!   }
//! }
//! ```
//!
//! Transport selectors carry exactly one named transport config block; the
//! options inside the block are passed through to the transport unchanged.
//! Loading the configuration from files or the environment is the host
//! application's concern — this module only defines the structure.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::defaults;
use crate::error::BusError;

/// Top-level client configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-API configuration, keyed by canonical API name. The entry named
    /// `default` is the fallback for APIs with no entry of their own.
    pub apis: HashMap<String, ApiConfig>,

    /// Bus-wide configuration
    pub bus: BusConfig,
}

impl Config {
    /// Parse a configuration from its JSON form
    pub fn from_json(json: &str) -> Result<Self, BusError> {
        serde_json::from_str(json).map_err(|e| BusError::ConfigurationInvalid(e.to_string()))
    }

    /// The effective configuration for an API
    ///
    /// Falls back to the `default` entry, then to built-in defaults, so callers
    /// never need to care whether an API was configured explicitly.
    pub fn api(&self, api_name: &str) -> ApiConfig {
        self.apis
            .get(api_name)
            .or_else(|| self.apis.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

/// Configuration for a single API (or the `default` fallback entry)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Which RPC transport serves this API
    pub rpc_transport: Option<TransportSelector>,

    /// Which result transport serves this API
    pub result_transport: Option<TransportSelector>,

    /// Which event transport serves this API
    pub event_transport: Option<TransportSelector>,

    /// Whether inbound kwargs are coerced to the procedure's parameter kinds
    pub cast_values: bool,

    /// How long a caller waits for an RPC result, in seconds
    #[serde(deserialize_with = "duration_from_secs")]
    pub rpc_timeout: Duration,

    /// Maximum number of pooled instances per transport for this API
    pub transport_pool_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rpc_transport: None,
            result_transport: None,
            event_transport: None,
            cast_values: true,
            rpc_timeout: defaults::RPC_TIMEOUT,
            transport_pool_size: defaults::TRANSPORT_POOL_SIZE,
        }
    }
}

/// Bus-wide configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub schema: SchemaConfig,
}

/// Schema sharing configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Which transport shares schemas, when schema sharing is wanted at all
    pub transport: Option<TransportSelector>,

    /// Time-to-live for stored schemas, in seconds
    pub ttl: u64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            transport: None,
            ttl: defaults::SCHEMA_TTL_SECS,
        }
    }
}

/// A transport selection: exactly one named transport with its options block
///
/// Deserialised from a single-entry map such as `{"memory": {"broker": "main"}}`.
/// The options value is opaque to the core and handed to the transport factory
/// unchanged.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct TransportSelector {
    entries: HashMap<String, Value>,
}

impl TransportSelector {
    /// Build a selector programmatically
    pub fn new(transport_name: impl Into<String>, options: Value) -> Self {
        let mut entries = HashMap::new();
        entries.insert(transport_name.into(), options);
        Self { entries }
    }

    /// The selected transport name and its options block
    pub fn resolve(&self) -> Result<(&str, &Value), BusError> {
        let mut entries = self.entries.iter();
        match (entries.next(), entries.next()) {
            (Some((name, options)), None) => Ok((name.as_str(), options)),
            (None, _) => Err(BusError::ConfigurationInvalid(
                "transport selector is empty; expected exactly one named transport".to_string(),
            )),
            (Some(_), Some(_)) => Err(BusError::ConfigurationInvalid(
                "transport selector names more than one transport; expected exactly one"
                    .to_string(),
            )),
        }
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(serde::de::Error::custom("duration must be a non-negative number"));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_full_configuration() {
        let config = Config::from_json(
            r#"{
                "apis": {
                    "default": {
                        "rpc_transport": {"memory": {"broker": "main"}},
                        "result_transport": {"memory": {"broker": "main"}},
                        "event_transport": {"memory": {"broker": "main"}}
                    },
                    "company.auth": {"rpc_timeout": 0.5, "cast_values": false}
                },
                "bus": {"schema": {"transport": {"memory": {"broker": "main"}}, "ttl": 120}}
            }"#,
        )
        .unwrap();

        let (name, options) = config
            .api("default")
            .rpc_transport
            .as_ref()
            .unwrap()
            .resolve()
            .map(|(n, o)| (n.to_string(), o.clone()))
            .unwrap();
        assert_eq!(name, "memory");
        assert_eq!(options, json!({"broker": "main"}));

        assert_eq!(config.api("company.auth").rpc_timeout, Duration::from_millis(500));
        assert!(!config.api("company.auth").cast_values);
        assert_eq!(config.bus.schema.ttl, 120);
    }

    #[test]
    fn unconfigured_apis_fall_back_to_default_then_builtin() {
        let config = Config::from_json(
            r#"{"apis": {"default": {"rpc_timeout": 2.0}}}"#,
        )
        .unwrap();
        assert_eq!(config.api("anything").rpc_timeout, Duration::from_secs(2));

        let empty = Config::default();
        assert_eq!(empty.api("anything").rpc_timeout, defaults::RPC_TIMEOUT);
        assert!(empty.api("anything").cast_values);
    }

    #[test]
    fn selector_requires_exactly_one_transport() {
        let selector: TransportSelector =
            serde_json::from_value(json!({"memory": {}, "redis": {}})).unwrap();
        assert!(selector.resolve().is_err());

        let selector: TransportSelector = serde_json::from_value(json!({})).unwrap();
        assert!(selector.resolve().is_err());

        let selector = TransportSelector::new("memory", json!({"broker": "main"}));
        assert_eq!(selector.resolve().unwrap().0, "memory");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            Config::from_json("{"),
            Err(BusError::ConfigurationInvalid(_))
        ));
    }
}
