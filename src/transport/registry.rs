//! # Transport Registry
//!
//! Maps each API to the transport pools that serve it. Different APIs may use
//! different transports; this registry loads that mapping from configuration
//! and answers lookups thereafter.
//!
//! The `default` API name is a special case: it is the fallback for any API
//! without transports of its own. APIs sharing a transport configuration share
//! one pool, which is what lets a single listener task serve several APIs.

use std::collections::HashMap;

use crate::config::Config;
use crate::defaults;
use crate::error::BusError;
use crate::transport::pool::TransportPool;
use crate::transport::{
    EventTransport, Poolable, ResultTransport, RpcTransport, SchemaTransport, TransportPlugins,
};

/// Pool of RPC transports
pub type RpcTransportPool = TransportPool<dyn RpcTransport>;
/// Pool of result transports
pub type ResultTransportPool = TransportPool<dyn ResultTransport>;
/// Pool of event transports
pub type EventTransportPool = TransportPool<dyn EventTransport>;
/// Pool of schema transports
pub type SchemaTransportPool = TransportPool<dyn SchemaTransport>;

/// A transport pool of any family, as handed out for shutdown sweeps
#[derive(Debug, Clone)]
pub enum AnyTransportPool {
    Rpc(RpcTransportPool),
    Result(ResultTransportPool),
    Event(EventTransportPool),
    Schema(SchemaTransportPool),
}

impl AnyTransportPool {
    /// Close the underlying pool (idempotent)
    pub async fn close(&self) -> Result<(), BusError> {
        match self {
            AnyTransportPool::Rpc(pool) => pool.close().await,
            AnyTransportPool::Result(pool) => pool.close().await,
            AnyTransportPool::Event(pool) => pool.close().await,
            AnyTransportPool::Schema(pool) => pool.close().await,
        }
    }

    /// Identity of the underlying pool
    pub fn id(&self) -> usize {
        match self {
            AnyTransportPool::Rpc(pool) => pool.id(),
            AnyTransportPool::Result(pool) => pool.id(),
            AnyTransportPool::Event(pool) => pool.id(),
            AnyTransportPool::Schema(pool) => pool.id(),
        }
    }
}

#[derive(Default, Clone)]
struct RegistryEntry {
    rpc: Option<RpcTransportPool>,
    result: Option<ResultTransportPool>,
    event: Option<EventTransportPool>,
}

/// Manages access to the transport pools serving each API
pub struct TransportRegistry {
    registry: HashMap<String, RegistryEntry>,
    schema: Option<SchemaTransportPool>,
}

impl TransportRegistry {
    /// An empty registry; populate with `set_*` or use [`Self::load_config`]
    pub fn new() -> Self {
        Self {
            registry: HashMap::new(),
            schema: None,
        }
    }

    /// Build a registry from configuration
    ///
    /// Iterates every configured API, resolves each transport selector against
    /// the installed plugins and installs a pool for it. APIs whose selectors
    /// are identical share a single pool, so one listener can serve them all.
    pub fn load_config(config: &Config, plugins: &TransportPlugins) -> Result<Self, BusError> {
        let mut registry = Self::new();

        // One pool per distinct (family, transport name, options) triple.
        let mut rpc_pools: HashMap<String, RpcTransportPool> = HashMap::new();
        let mut result_pools: HashMap<String, ResultTransportPool> = HashMap::new();
        let mut event_pools: HashMap<String, EventTransportPool> = HashMap::new();

        for (api_name, api_config) in &config.apis {
            let pool_size = api_config.transport_pool_size;

            if let Some(selector) = &api_config.rpc_transport {
                let (name, options) = selector.resolve()?;
                let key = pool_key("rpc", name, options);
                let pool = match rpc_pools.get(&key) {
                    Some(pool) => pool.clone(),
                    None => {
                        let factory = plugins.rpc_factory(name)?;
                        let options = options.clone();
                        let pool = TransportPool::new(
                            format!("rpc:{name}"),
                            pool_size,
                            Box::new(move || factory(&options)),
                        );
                        rpc_pools.insert(key, pool.clone());
                        pool
                    }
                };
                registry.set_rpc_transport_pool(api_name, pool);
            }

            if let Some(selector) = &api_config.result_transport {
                let (name, options) = selector.resolve()?;
                let key = pool_key("result", name, options);
                let pool = match result_pools.get(&key) {
                    Some(pool) => pool.clone(),
                    None => {
                        let factory = plugins.result_factory(name)?;
                        let options = options.clone();
                        let pool = TransportPool::new(
                            format!("result:{name}"),
                            pool_size,
                            Box::new(move || factory(&options)),
                        );
                        result_pools.insert(key, pool.clone());
                        pool
                    }
                };
                registry.set_result_transport_pool(api_name, pool);
            }

            if let Some(selector) = &api_config.event_transport {
                let (name, options) = selector.resolve()?;
                let key = pool_key("event", name, options);
                let pool = match event_pools.get(&key) {
                    Some(pool) => pool.clone(),
                    None => {
                        let factory = plugins.event_factory(name)?;
                        let options = options.clone();
                        let pool = TransportPool::new(
                            format!("event:{name}"),
                            pool_size,
                            Box::new(move || factory(&options)),
                        );
                        event_pools.insert(key, pool.clone());
                        pool
                    }
                };
                registry.set_event_transport_pool(api_name, pool);
            }
        }

        if let Some(selector) = &config.bus.schema.transport {
            let (name, options) = selector.resolve()?;
            let factory = plugins.schema_factory(name)?;
            let options = options.clone();
            registry.set_schema_transport_pool(TransportPool::new(
                format!("schema:{name}"),
                defaults::TRANSPORT_POOL_SIZE,
                Box::new(move || factory(&options)),
            ));
        }

        Ok(registry)
    }

    /// Install the RPC transport pool for an API
    pub fn set_rpc_transport_pool(&mut self, api_name: &str, pool: RpcTransportPool) {
        self.registry.entry(api_name.to_string()).or_default().rpc = Some(pool);
    }

    /// Install the result transport pool for an API
    pub fn set_result_transport_pool(&mut self, api_name: &str, pool: ResultTransportPool) {
        self.registry.entry(api_name.to_string()).or_default().result = Some(pool);
    }

    /// Install the event transport pool for an API
    pub fn set_event_transport_pool(&mut self, api_name: &str, pool: EventTransportPool) {
        self.registry.entry(api_name.to_string()).or_default().event = Some(pool);
    }

    /// Install the schema transport pool
    pub fn set_schema_transport_pool(&mut self, pool: SchemaTransportPool) {
        self.schema = Some(pool);
    }

    /// The RPC transport pool serving `api_name`
    pub fn get_rpc_transport_pool(&self, api_name: &str) -> Result<RpcTransportPool, BusError> {
        self.get_pool(api_name, "rpc", |entry| entry.rpc.clone())
    }

    /// The result transport pool serving `api_name`
    pub fn get_result_transport_pool(
        &self,
        api_name: &str,
    ) -> Result<ResultTransportPool, BusError> {
        self.get_pool(api_name, "result", |entry| entry.result.clone())
    }

    /// The event transport pool serving `api_name`
    pub fn get_event_transport_pool(&self, api_name: &str) -> Result<EventTransportPool, BusError> {
        self.get_pool(api_name, "event", |entry| entry.event.clone())
    }

    /// The schema transport pool, when one is configured
    pub fn get_schema_transport_pool(&self) -> Result<SchemaTransportPool, BusError> {
        self.schema.clone().ok_or_else(|| {
            BusError::TransportNotFound(
                "no schema transport is configured for this bus. Check the schema transport \
                 configuration is set up correctly (config section: bus.schema.transport)"
                    .to_string(),
            )
        })
    }

    pub fn has_rpc_transport(&self, api_name: &str) -> bool {
        self.get_rpc_transport_pool(api_name).is_ok()
    }

    pub fn has_result_transport(&self, api_name: &str) -> bool {
        self.get_result_transport_pool(api_name).is_ok()
    }

    pub fn has_event_transport(&self, api_name: &str) -> bool {
        self.get_event_transport_pool(api_name).is_ok()
    }

    pub fn has_schema_transport(&self) -> bool {
        self.schema.is_some()
    }

    /// Group APIs by the RPC pool that serves them
    ///
    /// Useful when multiple APIs can be served by a single transport: each
    /// returned pair is one pool and the APIs it serves, input order preserved
    /// within the pair and duplicates removed.
    pub fn get_rpc_transport_pools(
        &self,
        api_names: &[String],
    ) -> Result<Vec<(RpcTransportPool, Vec<String>)>, BusError> {
        group_by_pool(api_names, |api_name| self.get_rpc_transport_pool(api_name))
    }

    /// Group APIs by the event pool that serves them
    pub fn get_event_transport_pools(
        &self,
        api_names: &[String],
    ) -> Result<Vec<(EventTransportPool, Vec<String>)>, BusError> {
        group_by_pool(api_names, |api_name| self.get_event_transport_pool(api_name))
    }

    /// Every distinct pool known to the registry, irrespective of family
    ///
    /// Used by shutdown to close everything exactly once.
    pub fn get_all_transport_pools(&self) -> Vec<AnyTransportPool> {
        let mut pools: Vec<AnyTransportPool> = Vec::new();
        let mut seen: Vec<usize> = Vec::new();
        let mut push = |pool: AnyTransportPool, seen: &mut Vec<usize>, pools: &mut Vec<_>| {
            if !seen.contains(&pool.id()) {
                seen.push(pool.id());
                pools.push(pool);
            }
        };

        for entry in self.registry.values() {
            if let Some(pool) = &entry.rpc {
                push(AnyTransportPool::Rpc(pool.clone()), &mut seen, &mut pools);
            }
            if let Some(pool) = &entry.result {
                push(AnyTransportPool::Result(pool.clone()), &mut seen, &mut pools);
            }
            if let Some(pool) = &entry.event {
                push(AnyTransportPool::Event(pool.clone()), &mut seen, &mut pools);
            }
        }
        if let Some(pool) = &self.schema {
            push(AnyTransportPool::Schema(pool.clone()), &mut seen, &mut pools);
        }
        pools
    }

    fn get_pool<P: Clone>(
        &self,
        api_name: &str,
        family: &str,
        select: impl Fn(&RegistryEntry) -> Option<P> + Copy,
    ) -> Result<P, BusError> {
        if let Some(pool) = self.registry.get(api_name).and_then(select) {
            return Ok(pool);
        }
        // Fall back to the default API's transports, unless we *are* the
        // default, in which case there is nowhere left to look.
        if api_name != "default" {
            if let Some(pool) = self.registry.get("default").and_then(select) {
                return Ok(pool);
            }
        }
        Err(BusError::TransportNotFound(format!(
            "no {family} transport found for API '{api_name}', and no default {family} \
             transport is configured. Either specify a {family} transport for this specific \
             API, or specify a default {family} transport"
        )))
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("apis", &self.registry.keys())
            .field("has_schema", &self.schema.is_some())
            .finish()
    }
}

fn pool_key(family: &str, transport_name: &str, options: &serde_json::Value) -> String {
    format!("{family}:{transport_name}:{options}")
}

fn group_by_pool<T, F>(
    api_names: &[String],
    lookup: F,
) -> Result<Vec<(TransportPool<T>, Vec<String>)>, BusError>
where
    T: Poolable + ?Sized,
    F: Fn(&str) -> Result<TransportPool<T>, BusError>,
{
    let mut groups: Vec<(TransportPool<T>, Vec<String>)> = Vec::new();
    for api_name in api_names {
        let pool = lookup(api_name)?;
        match groups.iter_mut().find(|(candidate, _)| candidate.same_pool(&pool)) {
            Some((_, names)) => {
                if !names.contains(api_name) {
                    names.push(api_name.clone());
                }
            }
            None => groups.push((pool, vec![api_name.clone()])),
        }
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn shared_and_private_config() -> Config {
        Config::from_json(
            r#"{
                "apis": {
                    "default": {
                        "rpc_transport": {"memory": {"broker": "shared"}},
                        "result_transport": {"memory": {"broker": "shared"}},
                        "event_transport": {"memory": {"broker": "shared"}}
                    },
                    "company.a": {"event_transport": {"memory": {"broker": "shared"}}},
                    "company.b": {"event_transport": {"memory": {"broker": "shared"}}},
                    "company.c": {"event_transport": {"memory": {"broker": "private"}}}
                },
                "bus": {"schema": {"transport": {"memory": {"broker": "shared"}}}}
            }"#,
        )
        .unwrap()
    }

    fn registry() -> TransportRegistry {
        TransportRegistry::load_config(&shared_and_private_config(), &TransportPlugins::new())
            .unwrap()
    }

    #[test]
    fn unconfigured_apis_resolve_to_the_default_pool() {
        let registry = registry();
        let unknown = registry.get_rpc_transport_pool("company.unknown").unwrap();
        let default = registry.get_rpc_transport_pool("default").unwrap();
        assert!(unknown.same_pool(&default));
    }

    #[test]
    fn lookup_fails_without_a_default() {
        let config = Config::from_json(
            r#"{"apis": {"company.a": {"rpc_transport": {"memory": {}}}}}"#,
        )
        .unwrap();
        let registry = TransportRegistry::load_config(&config, &TransportPlugins::new()).unwrap();

        assert!(registry.has_rpc_transport("company.a"));
        assert!(matches!(
            registry.get_rpc_transport_pool("company.other"),
            Err(BusError::TransportNotFound(_))
        ));
        assert!(matches!(
            registry.get_event_transport_pool("company.a"),
            Err(BusError::TransportNotFound(_))
        ));
        assert!(matches!(
            registry.get_schema_transport_pool(),
            Err(BusError::TransportNotFound(_))
        ));
    }

    #[test]
    fn identical_selectors_share_one_pool() {
        let registry = registry();
        let a = registry.get_event_transport_pool("company.a").unwrap();
        let b = registry.get_event_transport_pool("company.b").unwrap();
        let c = registry.get_event_transport_pool("company.c").unwrap();

        assert!(a.same_pool(&b));
        assert!(!a.same_pool(&c));
    }

    #[test]
    fn grouping_covers_every_api_exactly_once() {
        let registry = registry();
        let apis = vec![
            "company.a".to_string(),
            "company.b".to_string(),
            "company.c".to_string(),
            // Duplicates collapse.
            "company.a".to_string(),
        ];
        let groups = registry.get_event_transport_pools(&apis).unwrap();
        assert_eq!(groups.len(), 2);

        let mut covered: Vec<String> = groups
            .iter()
            .flat_map(|(_, names)| names.iter().cloned())
            .collect();
        covered.sort();
        assert_eq!(covered, vec!["company.a", "company.b", "company.c"]);

        // Input order is preserved within each group.
        let shared = groups
            .iter()
            .find(|(pool, _)| {
                pool.same_pool(&registry.get_event_transport_pool("company.a").unwrap())
            })
            .unwrap();
        assert_eq!(shared.1, vec!["company.a", "company.b"]);
    }

    #[test]
    fn all_transport_pools_is_a_deduplicated_union() {
        let registry = registry();
        let pools = registry.get_all_transport_pools();
        // shared rpc+result+event collapse per family, private event and the
        // schema pool stand alone: rpc, result, event(shared), event(private),
        // schema.
        assert_eq!(pools.len(), 5);

        let mut ids: Vec<usize> = pools.iter().map(|p| p.id()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }
}
