//! Named strategy factories
//!
//! Configuration names a strategy and hands it an opaque parameter object.
//! Each factory decodes its own parameters, so adding a strategy never
//! touches the config layer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use super::{Dispatcher, EqualDispatcher, LpDispatcher, SegmentedDispatcher, SmartDispatcher};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown strategy '{0}'")]
    Unknown(String),
    #[error("invalid parameters for '{kind}': {source}")]
    InvalidParams {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// `{ kind = "smart", params = { ... } }` in config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StrategySpec {
    pub fn named(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: serde_json::Value::Null,
        }
    }
}

/// Decode factory params; a missing object means all defaults.
pub fn decode_params<T>(kind: &str, params: serde_json::Value) -> Result<T, RegistryError>
where
    T: DeserializeOwned + Default,
{
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|source| RegistryError::InvalidParams {
        kind: kind.to_string(),
        source,
    })
}

pub type DispatcherFactory =
    Box<dyn Fn(serde_json::Value) -> Result<Arc<dyn Dispatcher>, RegistryError> + Send + Sync>;

pub struct DispatcherRegistry {
    factories: BTreeMap<String, DispatcherFactory>,
}

impl Default for DispatcherRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("equal", |_| Ok(Arc::new(EqualDispatcher)));
        registry.register("smart", |p| {
            Ok(Arc::new(SmartDispatcher::new(decode_params("smart", p)?)))
        });
        registry.register("lp", |p| {
            Ok(Arc::new(LpDispatcher::new(decode_params("lp", p)?)))
        });
        registry.register("segmented", |p| {
            Ok(Arc::new(SegmentedDispatcher::new(decode_params("segmented", p)?)))
        });
        registry
    }
}

impl DispatcherRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(serde_json::Value) -> Result<Arc<dyn Dispatcher>, RegistryError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn create(&self, spec: &StrategySpec) -> Result<Arc<dyn Dispatcher>, RegistryError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| RegistryError::Unknown(spec.kind.clone()))?;
        factory(spec.params.clone())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_strategies() {
        let registry = DispatcherRegistry::default();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["equal", "lp", "segmented", "smart"]
        );
        for name in ["equal", "smart", "lp", "segmented"] {
            let dispatcher = registry.create(&StrategySpec::named(name)).unwrap();
            assert_eq!(dispatcher.name(), name);
        }
    }

    #[test]
    fn test_factory_decodes_params() {
        let spec = StrategySpec {
            kind: "smart".into(),
            params: json!({ "weights": { "availability": 0.4 }, "max_rounds": 0 }),
        };
        let dispatcher = DispatcherRegistry::default().create(&spec).unwrap();
        let weights = dispatcher.tunable_weights().unwrap();
        assert_eq!(weights.lock().availability, 0.4);
        assert_eq!(weights.lock().soc, 0.5);
    }

    #[test]
    fn test_unknown_and_invalid() {
        let registry = DispatcherRegistry::default();
        assert!(matches!(
            registry.create(&StrategySpec::named("quantum")),
            Err(RegistryError::Unknown(_))
        ));
        let bad = StrategySpec {
            kind: "smart".into(),
            params: json!({ "max_rounds": "many" }),
        };
        assert!(matches!(
            registry.create(&bad),
            Err(RegistryError::InvalidParams { .. })
        ));
    }
}
