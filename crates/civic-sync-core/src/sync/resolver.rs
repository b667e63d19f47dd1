//! Conflict resolution strategies
//!
//! A conflict exists when a queued action's baseline version is older than
//! the record's current version. The per-entity-type [`StrategyPolicy`]
//! decides what happens next; for `merge`, a [`ConflictResolver`] from the
//! [`ResolverRegistry`] computes the merged document.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{validate_identifier, ResolutionStrategy};

/// Output of a merge: the document to write and the client values it dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub payload: Value,
    pub discarded: Map<String, Value>,
}

impl Resolution {
    /// Discarded fields as stored on the conflict; `None` when nothing was lost
    pub fn discarded_value(&self) -> Option<Value> {
        (!self.discarded.is_empty()).then(|| Value::Object(self.discarded.clone()))
    }
}

/// Pluggable merge for one entity type
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        client_payload: &Value,
        client_baseline: &Value,
        server_payload: &Value,
    ) -> Resolution;
}

/// Field-level three-way merge over top-level JSON object keys
///
/// Fields only the client changed come from the client. Fields both sides
/// changed keep the server value and the client value is discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMergeResolver;

impl ConflictResolver for FieldMergeResolver {
    fn resolve(
        &self,
        client_payload: &Value,
        client_baseline: &Value,
        server_payload: &Value,
    ) -> Resolution {
        let (Value::Object(client), Value::Object(server)) = (client_payload, server_payload)
        else {
            return Resolution {
                payload: server_payload.clone(),
                discarded: client_payload.as_object().cloned().unwrap_or_default(),
            };
        };
        let empty = Map::new();
        let baseline = client_baseline.as_object().unwrap_or(&empty);

        let mut merged = server.clone();
        let mut discarded = Map::new();

        for (key, change) in client_changes(client, baseline) {
            let server_value = server.get(&key);
            if server_value == change.as_ref() {
                continue;
            }

            let server_untouched = server_value == baseline.get(&key);
            match (server_untouched, change) {
                (true, Some(value)) => {
                    merged.insert(key, value);
                }
                (true, None) => {
                    merged.remove(&key);
                }
                (false, value) => {
                    discarded.insert(key, value.unwrap_or(Value::Null));
                }
            }
        }

        Resolution {
            payload: Value::Object(merged),
            discarded,
        }
    }
}

/// Client values that the server-wins strategy throws away
pub fn discarded_by_server_wins(
    client_payload: Option<&Value>,
    client_baseline: &Value,
    server_payload: &Value,
) -> Map<String, Value> {
    let Some(Value::Object(client)) = client_payload else {
        return Map::new();
    };
    let empty = Map::new();
    let baseline = client_baseline.as_object().unwrap_or(&empty);
    let server = server_payload.as_object().unwrap_or(&empty);

    client_changes(client, baseline)
        .into_iter()
        .filter(|(key, change)| server.get(key) != change.as_ref())
        .map(|(key, change)| (key, change.unwrap_or(Value::Null)))
        .collect()
}

/// Keys whose client value differs from the baseline; `None` marks a removed key
fn client_changes(
    client: &Map<String, Value>,
    baseline: &Map<String, Value>,
) -> Vec<(String, Option<Value>)> {
    let mut changes: Vec<(String, Option<Value>)> = client
        .iter()
        .filter(|(key, value)| baseline.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), Some(value.clone())))
        .collect();

    changes.extend(
        baseline
            .keys()
            .filter(|key| !client.contains_key(*key))
            .map(|key| (key.clone(), None)),
    );
    changes
}

/// Merge resolvers keyed by entity type
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn ConflictResolver>>,
    fallback: FieldMergeResolver,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_resolver(
        mut self,
        entity_type: impl Into<String>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        self.resolvers.insert(entity_type.into(), resolver);
        self
    }

    pub fn resolver_for(&self, entity_type: &str) -> &dyn ConflictResolver {
        self.resolvers
            .get(entity_type)
            .map_or(&self.fallback as &dyn ConflictResolver, |resolver| resolver.as_ref())
    }
}

/// Resolution strategy per entity type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrategyPolicy {
    default: ResolutionStrategy,
    overrides: HashMap<String, ResolutionStrategy>,
}

impl StrategyPolicy {
    pub fn new(default: ResolutionStrategy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, entity_type: impl Into<String>, strategy: ResolutionStrategy) -> Self {
        self.overrides.insert(entity_type.into(), strategy);
        self
    }

    pub fn strategy_for(&self, entity_type: &str) -> ResolutionStrategy {
        self.overrides
            .get(entity_type)
            .copied()
            .unwrap_or(self.default)
    }

    /// Parse `report=server_wins,comment=merge`; `*` sets the default
    pub fn parse(raw: &str) -> Result<Self> {
        let mut policy = Self::default();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (entity_type, strategy) = entry.split_once('=').ok_or_else(|| {
                Error::validation(format!("strategy entry `{entry}` must be entity_type=strategy"))
            })?;
            let entity_type = entity_type.trim();
            let strategy: ResolutionStrategy = strategy.parse()?;

            if entity_type == "*" {
                policy.default = strategy;
            } else {
                validate_identifier("entity_type", entity_type)?;
                policy.overrides.insert(entity_type.to_string(), strategy);
            }
        }
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn merge(client: &Value, baseline: &Value, server: &Value) -> Resolution {
        FieldMergeResolver.resolve(client, baseline, server)
    }

    #[test]
    fn test_merge_takes_disjoint_client_changes() {
        let baseline = json!({"title": "pothole", "severity": "low", "status": "open"});
        let client = json!({"title": "pothole", "severity": "high", "status": "open"});
        let server = json!({"title": "pothole", "severity": "low", "status": "in_progress"});

        let resolution = merge(&client, &baseline, &server);
        assert_eq!(
            resolution.payload,
            json!({"title": "pothole", "severity": "high", "status": "in_progress"})
        );
        assert!(resolution.discarded.is_empty());
        assert_eq!(resolution.discarded_value(), None);
    }

    #[test]
    fn test_merge_keeps_server_on_overlap() {
        let baseline = json!({"severity": "low"});
        let client = json!({"severity": "high"});
        let server = json!({"severity": "critical"});

        let resolution = merge(&client, &baseline, &server);
        assert_eq!(resolution.payload, json!({"severity": "critical"}));
        assert_eq!(
            resolution.discarded_value(),
            Some(json!({"severity": "high"}))
        );
    }

    #[test]
    fn test_merge_applies_client_field_removal() {
        let baseline = json!({"title": "t", "photo": "a.jpg"});
        let client = json!({"title": "t"});
        let server = json!({"title": "t", "photo": "a.jpg", "votes": 3});

        let resolution = merge(&client, &baseline, &server);
        assert_eq!(resolution.payload, json!({"title": "t", "votes": 3}));
    }

    #[test]
    fn test_merge_without_baseline_treats_all_client_fields_as_changes() {
        let client = json!({"severity": "high", "note": "deep"});
        let server = json!({"severity": "low", "status": "open"});

        let resolution = merge(&client, &json!({}), &server);
        assert_eq!(
            resolution.payload,
            json!({"severity": "low", "status": "open", "note": "deep"})
        );
        assert_eq!(
            resolution.discarded_value(),
            Some(json!({"severity": "high"}))
        );
    }

    #[test]
    fn test_server_wins_discards_client_changes_only() {
        let baseline = json!({"severity": "low", "title": "t"});
        let client = json!({"severity": "high", "title": "t"});
        let server = json!({"severity": "low", "title": "renamed"});

        let discarded = discarded_by_server_wins(Some(&client), &baseline, &server);
        assert_eq!(Value::Object(discarded), json!({"severity": "high"}));
        assert!(discarded_by_server_wins(None, &baseline, &server).is_empty());
    }

    #[test]
    fn test_policy_parse() {
        let policy =
            StrategyPolicy::parse("report=server_wins, comment=merge,*=client_wins").unwrap();
        assert_eq!(policy.strategy_for("report"), ResolutionStrategy::ServerWins);
        assert_eq!(policy.strategy_for("comment"), ResolutionStrategy::Merge);
        assert_eq!(policy.strategy_for("vote"), ResolutionStrategy::ClientWins);

        assert!(StrategyPolicy::parse("report").is_err());
        assert!(StrategyPolicy::parse("report=newest").is_err());
        assert_eq!(
            StrategyPolicy::parse("").unwrap().strategy_for("report"),
            ResolutionStrategy::ServerWins
        );
    }

    struct ClientAlways;

    impl ConflictResolver for ClientAlways {
        fn resolve(&self, client: &Value, _baseline: &Value, _server: &Value) -> Resolution {
            Resolution {
                payload: client.clone(),
                discarded: Map::new(),
            }
        }
    }

    #[test]
    fn test_registry_falls_back_to_field_merge() {
        let registry = ResolverRegistry::new().with_resolver("vote", Arc::new(ClientAlways));

        let client = json!({"n": 2});
        let server = json!({"n": 3});
        assert_eq!(
            registry
                .resolver_for("vote")
                .resolve(&client, &json!({"n": 1}), &server)
                .payload,
            client
        );
        assert_eq!(
            registry
                .resolver_for("report")
                .resolve(&client, &json!({"n": 1}), &server)
                .payload,
            server
        );
    }
}
