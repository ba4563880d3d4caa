//! Charm metadata index
//!
//! [`MetadataIndex`] batch-resolves capability metadata for a set of charms
//! through the single-flight [`CharmStoreCache`](crate::store::CharmStoreCache)
//! and builds two reverse indices: interface → charms providing it and
//! interface → charms requiring it.
//!
//! Loads are serialized, not merged: a `load` issued while a previous batch
//! is outstanding waits for it before starting. Queries never block — before
//! the backing load completes they soft-degrade to empty results, so callers
//! that need guaranteed data check [`MetadataIndex::loaded`] first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bundle::Bundle;
use crate::charm::CharmStoreId;
use crate::store::CharmStoreCache;

/// Which side of an interface contract a query refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationDirection {
    Provides,
    Requires,
}

/// Capability metadata for one charm: ordered (relation-name, interface)
/// pairs, plus the raw entity document. Never mutated after creation.
#[derive(Debug, Clone, Default)]
pub struct MetadataRecord {
    pub provides: Vec<(String, String)>,
    pub requires: Vec<(String, String)>,
    pub entity: Arc<JsonValue>,
}

/// External collaborator answering which deployed services use a charm
pub trait CharmLocator {
    /// Names of services whose charm source matches the canonical id
    fn services_with_charm_id(&self, charm_id: &str) -> Vec<String>;
}

impl CharmLocator for Bundle {
    fn services_with_charm_id(&self, charm_id: &str) -> Vec<String> {
        let wanted = CharmStoreId::parse(charm_id).canonical();
        self.services()
            .into_iter()
            .filter(|s| CharmStoreId::parse(&s.charm_source).canonical() == wanted)
            .map(|s| s.service_name)
            .collect()
    }
}

#[derive(Default)]
struct IndexState {
    /// canonical id → full entity document
    charm_info: HashMap<String, Arc<JsonValue>>,
    /// canonical id → requires/provides record
    iface_info: HashMap<String, MetadataRecord>,
    /// interface → (relation-name, canonical id), insertion order
    providing: HashMap<String, Vec<(String, String)>>,
    requiring: HashMap<String, Vec<(String, String)>>,
}

/// Batch-loading interface index over a charm metadata cache
pub struct MetadataIndex {
    cache: CharmStoreCache,
    state: Arc<Mutex<IndexState>>,
    load_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    recommended: Vec<String>,
}

impl MetadataIndex {
    pub fn new(cache: CharmStoreCache) -> Self {
        MetadataIndex {
            cache,
            state: Arc::new(Mutex::new(IndexState::default())),
            load_task: tokio::sync::Mutex::new(None),
            recommended: Vec::new(),
        }
    }

    /// Set the recommended charm names resolved alongside explicit loads
    pub fn with_recommended(mut self, names: Vec<String>) -> Self {
        self.recommended = names;
        self
    }

    /// Batch-resolve metadata for the given charm names or sources
    ///
    /// No-op on an empty list. Waits for any outstanding load to finish
    /// first; recommended charm names are folded into the batch, identifiers
    /// already indexed are skipped, and a batch with nothing new issues no
    /// fetch.
    pub async fn load(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }

        // successive loads are serialized, not merged
        let mut slot = self.load_task.lock().await;
        if let Some(previous) = slot.take() {
            let _ = previous.await;
        }

        let pending: Vec<String> = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            names
                .iter()
                .chain(self.recommended.iter())
                .filter(|name| !state.charm_info.contains_key(&self.cache.cache_key(name)))
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return;
        }

        debug!(count = pending.len(), "loading charm metadata batch");
        let batch = self.cache.resolve_batch(&pending);
        let state = Arc::clone(&self.state);
        *slot = Some(tokio::spawn(async move {
            for (id, outcome) in batch.wait().await {
                if let Ok(entity) = outcome {
                    index_entity(&state, &id, &entity);
                }
            }
        }));
    }

    /// Whether the outstanding batch load, if any, has completed
    pub fn loaded(&self) -> bool {
        match self.load_task.try_lock() {
            Ok(slot) => slot.as_ref().is_none_or(JoinHandle::is_finished),
            Err(_) => false,
        }
    }

    /// Load one more charm if it is not already indexed
    pub async fn add_charm(&self, name: &str) {
        let known = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.charm_info.contains_key(&self.cache.cache_key(name))
        };
        if !known {
            let names = [name.to_string()];
            self.load(&names).await;
        }
    }

    /// (relation-name, interface) pairs the charm provides; empty until the
    /// backing load completes
    pub fn get_provides(&self, charm_id: &str) -> Vec<(String, String)> {
        if !self.loaded() {
            return Vec::new();
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .iface_info
            .get(&self.cache.cache_key(charm_id))
            .map(|record| record.provides.clone())
            .unwrap_or_default()
    }

    /// (relation-name, interface) pairs the charm requires; empty until the
    /// backing load completes
    pub fn get_requires(&self, charm_id: &str) -> Vec<(String, String)> {
        if !self.loaded() {
            return Vec::new();
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .iface_info
            .get(&self.cache.cache_key(charm_id))
            .map(|record| record.requires.clone())
            .unwrap_or_default()
    }

    /// The full entity document for a charm, once loaded
    pub fn get_charm_info(&self, charm_id: &str) -> Option<Arc<JsonValue>> {
        if !self.loaded() {
            return None;
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .charm_info
            .get(&self.cache.cache_key(charm_id))
            .cloned()
    }

    /// Entity documents for the recommended charms that have been resolved
    pub fn get_recommended_charms(&self) -> Vec<Arc<JsonValue>> {
        if !self.loaded() {
            return Vec::new();
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.recommended
            .iter()
            .filter_map(|name| state.charm_info.get(&self.cache.cache_key(name)).cloned())
            .collect()
    }

    pub fn recommended_charm_names(&self) -> &[String] {
        &self.recommended
    }

    /// Cross product of the charms on the given side of an interface with
    /// the deployed services using each charm, as (relation-name, service);
    /// empty until the backing load completes
    pub fn get_services_for_interface(
        &self,
        interface: &str,
        direction: RelationDirection,
        locator: &dyn CharmLocator,
    ) -> Vec<(String, String)> {
        if !self.loaded() {
            return Vec::new();
        }
        let entries = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let index = match direction {
                RelationDirection::Provides => &state.providing,
                RelationDirection::Requires => &state.requiring,
            };
            index.get(interface).cloned().unwrap_or_default()
        };

        let mut services = Vec::new();
        for (relation_name, charm_id) in entries {
            for service in locator.services_with_charm_id(&charm_id) {
                services.push((relation_name.clone(), service));
            }
        }
        services
    }
}

/// Fold one fetched entity into the index state
fn index_entity(state: &Arc<Mutex<IndexState>>, id: &str, entity: &Arc<JsonValue>) {
    let canonical = entity
        .get("Id")
        .and_then(JsonValue::as_str)
        .map_or_else(|| id.to_string(), |raw| CharmStoreId::parse(raw).canonical());

    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.charm_info.contains_key(&canonical) {
        return;
    }

    let metadata = entity.get("Meta").and_then(|m| m.get("charm-metadata"));
    let requires = relation_pairs(metadata.and_then(|md| md.get("Requires")));
    let provides = relation_pairs(metadata.and_then(|md| md.get("Provides")));

    for (relation_name, interface) in &requires {
        state
            .requiring
            .entry(interface.clone())
            .or_default()
            .push((relation_name.clone(), canonical.clone()));
    }
    for (relation_name, interface) in &provides {
        state
            .providing
            .entry(interface.clone())
            .or_default()
            .push((relation_name.clone(), canonical.clone()));
    }

    state.iface_info.insert(
        canonical.clone(),
        MetadataRecord {
            provides,
            requires,
            entity: Arc::clone(entity),
        },
    );
    state.charm_info.insert(canonical, Arc::clone(entity));
}

/// Extract (relation-name, interface) pairs from a Requires/Provides map
fn relation_pairs(section: Option<&JsonValue>) -> Vec<(String, String)> {
    let Some(map) = section.and_then(JsonValue::as_object) else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(relation_name, descriptor)| {
            descriptor
                .get("Interface")
                .and_then(JsonValue::as_str)
                .map(|interface| (relation_name.clone(), interface.to_string()))
        })
        .collect()
}

/// Look up the recommended charm names for a bundle key in an external
/// bundles config document
///
/// The `bundles` section may be a list of entries carrying a `key` field or
/// a map keyed directly.
pub fn recommended_charm_names(config: &JsonValue, key: &str) -> Vec<String> {
    let Some(bundles) = config.get("bundles") else {
        return Vec::new();
    };
    let entry = match bundles {
        JsonValue::Array(items) => items
            .iter()
            .find(|item| item.get("key").and_then(JsonValue::as_str) == Some(key)),
        JsonValue::Object(map) => map.get(key),
        _ => None,
    };
    entry
        .and_then(|e| e.get("recommendedCharms"))
        .and_then(JsonValue::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BundleError, Result};
    use crate::store::CharmSource;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    struct FakeStore {
        batches: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeStore {
        fn new() -> Self {
            FakeStore {
                batches: AtomicUsize::new(0),
                gate: None,
            }
        }
    }

    fn entity_for(id: &str) -> serde_json::Value {
        let (provides, requires) = if id.contains("mysql") {
            (json!({"db": {"Interface": "mysql"}}), json!({}))
        } else {
            (
                json!({"website": {"Interface": "http"}}),
                json!({"db": {"Interface": "mysql"}}),
            )
        };
        json!({
            "Id": format!("{id}-3"),
            "Meta": {
                "charm-metadata": {
                    "Provides": provides,
                    "Requires": requires,
                }
            }
        })
    }

    #[async_trait]
    impl CharmSource for FakeStore {
        async fn fetch_one(&self, id: &str) -> Result<serde_json::Value> {
            Ok(entity_for(id))
        }

        async fn fetch_many(&self, ids: &[String]) -> Result<serde_json::Value> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|_| BundleError::LookupInterrupted)?
                    .forget();
            }
            let mut map = serde_json::Map::new();
            for id in ids {
                map.insert(id.clone(), entity_for(id));
            }
            Ok(serde_json::Value::Object(map))
        }
    }

    fn index_over(store: FakeStore) -> (MetadataIndex, Arc<FakeStore>) {
        let store = Arc::new(store);
        let cache = CharmStoreCache::new(store.clone(), "xenial", None);
        (MetadataIndex::new(cache), store)
    }

    async fn wait_loaded(index: &MetadataIndex) {
        while !index.loaded() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_load_and_query() {
        let (index, _) = index_over(FakeStore::new());
        index
            .load(&["mysql".to_string(), "wordpress".to_string()])
            .await;
        wait_loaded(&index).await;

        assert_eq!(
            index.get_provides("mysql"),
            vec![("db".to_string(), "mysql".to_string())]
        );
        assert_eq!(
            index.get_requires("wordpress"),
            vec![("db".to_string(), "mysql".to_string())]
        );
        assert!(index.get_charm_info("mysql").is_some());
        assert!(index.get_charm_info("unknown-charm").is_none());
    }

    #[tokio::test]
    async fn test_empty_load_is_noop() {
        let (index, store) = index_over(FakeStore::new());
        index.load(&[]).await;
        assert!(index.loaded());
        assert_eq!(store.batches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_known_ids_are_skipped() {
        let (index, store) = index_over(FakeStore::new());
        index.load(&["mysql".to_string()]).await;
        wait_loaded(&index).await;
        index
            .load(&["mysql".to_string(), "cs:xenial/mysql-9".to_string()])
            .await;
        assert_eq!(store.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_ready_queries_degrade_to_empty() {
        let gate = Arc::new(Semaphore::new(0));
        let (index, _) = index_over(FakeStore {
            gate: Some(gate.clone()),
            ..FakeStore::new()
        });
        index.load(&["mysql".to_string()]).await;
        assert!(!index.loaded());
        assert!(index.get_provides("mysql").is_empty());
        assert!(index.get_requires("mysql").is_empty());
        assert!(index.get_charm_info("mysql").is_none());
        assert!(index.get_recommended_charms().is_empty());

        gate.add_permits(1);
        wait_loaded(&index).await;
        assert!(!index.get_provides("mysql").is_empty());
    }

    #[tokio::test]
    async fn test_services_for_interface_empty_while_load_outstanding() {
        let gate = Arc::new(Semaphore::new(1));
        let (index, _) = index_over(FakeStore {
            gate: Some(gate.clone()),
            ..FakeStore::new()
        });
        let bundle = Bundle::from_yaml(
            r#"
services:
  mydb:
    charm: "cs:xenial/mysql-3"
    num_units: 1
"#,
            None,
        )
        .unwrap();

        index.load(&["mysql".to_string()]).await;
        wait_loaded(&index).await;
        index.load(&["wordpress".to_string()]).await;

        // mysql is already indexed, but the outstanding wordpress batch
        // keeps every query degraded, same as the sibling getters
        assert!(!index.loaded());
        assert!(
            index
                .get_services_for_interface("mysql", RelationDirection::Provides, &bundle)
                .is_empty()
        );
        assert!(index.get_provides("mysql").is_empty());

        gate.add_permits(1);
        wait_loaded(&index).await;
        assert_eq!(
            index.get_services_for_interface("mysql", RelationDirection::Provides, &bundle),
            vec![("db".to_string(), "mydb".to_string())]
        );
    }

    #[tokio::test]
    async fn test_services_for_interface_cross_product() {
        let (index, _) = index_over(FakeStore::new());
        index
            .load(&["mysql".to_string(), "wordpress".to_string()])
            .await;
        wait_loaded(&index).await;

        let bundle = Bundle::from_yaml(
            r#"
services:
  mydb:
    charm: "cs:xenial/mysql-3"
    num_units: 1
  otherdb:
    charm: "cs:xenial/mysql-7"
    num_units: 1
  blog:
    charm: "cs:xenial/wordpress-3"
    num_units: 1
"#,
            None,
        )
        .unwrap();

        let mut providers =
            index.get_services_for_interface("mysql", RelationDirection::Provides, &bundle);
        providers.sort();
        assert_eq!(
            providers,
            vec![
                ("db".to_string(), "mydb".to_string()),
                ("db".to_string(), "otherdb".to_string()),
            ]
        );
        let requirers =
            index.get_services_for_interface("mysql", RelationDirection::Requires, &bundle);
        assert_eq!(requirers, vec![("db".to_string(), "blog".to_string())]);
    }

    #[tokio::test]
    async fn test_add_charm_loads_unknown_only() {
        let (index, store) = index_over(FakeStore::new());
        index.add_charm("mysql").await;
        wait_loaded(&index).await;
        index.add_charm("mysql").await;
        assert_eq!(store.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recommended_charms_resolve_after_load() {
        let (index, _) = index_over(FakeStore::new());
        let index = index.with_recommended(vec!["mysql".to_string()]);
        index.load(&["mysql".to_string()]).await;
        wait_loaded(&index).await;
        let recommended = index.get_recommended_charms();
        assert_eq!(recommended.len(), 1);
        assert_eq!(recommended[0]["Id"], json!("cs:xenial/mysql-3"));
    }

    #[test]
    fn test_recommended_names_from_list_config() {
        let config = json!({
            "bundles": [
                {"key": "openstack", "recommendedCharms": ["nova-compute", "glance"]},
                {"key": "other", "recommendedCharms": ["x"]}
            ]
        });
        assert_eq!(
            recommended_charm_names(&config, "openstack"),
            vec!["nova-compute".to_string(), "glance".to_string()]
        );
        assert!(recommended_charm_names(&config, "absent").is_empty());
    }

    #[test]
    fn test_recommended_names_from_map_config() {
        let config = json!({
            "bundles": {"openstack": {"recommendedCharms": ["ceph"]}}
        });
        assert_eq!(
            recommended_charm_names(&config, "openstack"),
            vec!["ceph".to_string()]
        );
        assert!(recommended_charm_names(&json!({}), "openstack").is_empty());
    }
}
