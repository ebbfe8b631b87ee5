use crate::config::{self, GlobalConfig};
use crate::event_mapper::{self, GlobalRequest};
use crate::types::{GlobalReplicasIgnore, ReplicasOverride};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, ListParams},
    runtime::reflector::Store,
    runtime::watcher::{self, Event},
    Client,
};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tracing::*;

/// A consistent view of every policy object. Published as an immutable Arc;
/// never mutated after publication.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub config: GlobalConfig,
    pub overrides: BTreeMap<(String, String), ReplicasOverride>,
    pub ignores: BTreeMap<(String, String), GlobalReplicasIgnore>,
}

impl PolicySnapshot {
    /// Overrides in lexicographic (namespace, name) order.
    pub fn overrides(&self) -> impl Iterator<Item = &ReplicasOverride> {
        self.overrides.values()
    }

    pub fn ignores(&self) -> impl Iterator<Item = &GlobalReplicasIgnore> + Clone {
        self.ignores.values()
    }
}

/// In-process cache of the three policy kinds, refreshed by watch events.
/// Readers take the published snapshot; writers rebuild and swap it under
/// the lock.
pub struct PolicyStore {
    published: RwLock<Arc<PolicySnapshot>>,
}

fn object_key<K: kube::Resource>(obj: &K) -> Option<(String, String)> {
    let name = obj.meta().name.clone()?;
    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    Some((namespace, name))
}

impl PolicyStore {
    pub fn new() -> Self {
        PolicyStore {
            published: RwLock::new(Arc::new(PolicySnapshot::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.published.read().unwrap().clone()
    }

    fn publish(&self, mutate: impl FnOnce(&mut PolicySnapshot)) {
        let mut published = self.published.write().unwrap();
        let mut next = (**published).clone();
        mutate(&mut next);
        *published = Arc::new(next);
    }

    pub fn set_config(&self, config: GlobalConfig) {
        self.publish(|snapshot| snapshot.config = config);
    }

    /// Inserts or refreshes an override. Returns whether its spec changed.
    pub fn upsert_override(&self, obj: ReplicasOverride) -> bool {
        let Some(key) = object_key(&obj) else { return false };
        let mut spec_changed = true;
        self.publish(|snapshot| {
            if let Some(previous) = snapshot.overrides.get(&key) {
                spec_changed = previous.spec != obj.spec;
            }
            snapshot.overrides.insert(key.clone(), obj);
        });
        spec_changed
    }

    pub fn remove_override(&self, obj: &ReplicasOverride) {
        let Some(key) = object_key(obj) else { return };
        self.publish(|snapshot| {
            snapshot.overrides.remove(&key);
        });
    }

    pub fn replace_overrides(&self, objs: Vec<ReplicasOverride>) {
        self.publish(|snapshot| {
            snapshot.overrides = objs.into_iter().filter_map(|o| object_key(&o).map(|k| (k, o))).collect();
        });
    }

    pub fn upsert_ignore(&self, obj: GlobalReplicasIgnore) -> bool {
        let Some(key) = object_key(&obj) else { return false };
        let mut spec_changed = true;
        self.publish(|snapshot| {
            if let Some(previous) = snapshot.ignores.get(&key) {
                spec_changed = previous.spec != obj.spec;
            }
            snapshot.ignores.insert(key.clone(), obj);
        });
        spec_changed
    }

    pub fn remove_ignore(&self, obj: &GlobalReplicasIgnore) {
        let Some(key) = object_key(obj) else { return };
        self.publish(|snapshot| {
            snapshot.ignores.remove(&key);
        });
    }

    pub fn replace_ignores(&self, objs: Vec<GlobalReplicasIgnore>) {
        self.publish(|snapshot| {
            snapshot.ignores = objs.into_iter().filter_map(|o| object_key(&o).map(|k| (k, o))).collect();
        });
    }
}

/// Keeps the override view current. A deletion also requests a full sweep so
/// previously-affected workloads revert promptly.
pub async fn watch_overrides(
    client: Client,
    store: Arc<PolicyStore>,
    global_tx: UnboundedSender<GlobalRequest>,
) {
    let api = Api::<ReplicasOverride>::all(client);
    let mut stream = watcher::watcher(api, ListParams::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(obj)) => {
                store.upsert_override(obj);
            }
            Ok(Event::Deleted(obj)) => {
                info!(
                    override_ = %obj.metadata.name.as_deref().unwrap_or_default(),
                    "ReplicasOverride deleted, requesting full sweep"
                );
                store.remove_override(&obj);
                let _ = global_tx.send(GlobalRequest::AllWorkloads);
            }
            Ok(Event::Restarted(objs)) => store.replace_overrides(objs),
            Err(err) => warn!("ReplicasOverride watch failed: {}", err),
        }
    }
}

/// Keeps the ignore view current. Rule changes re-evaluate every workload.
pub async fn watch_ignores(
    client: Client,
    store: Arc<PolicyStore>,
    global_tx: UnboundedSender<GlobalRequest>,
) {
    let api = Api::<GlobalReplicasIgnore>::all(client);
    let mut stream = watcher::watcher(api, ListParams::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(obj)) => {
                if store.upsert_ignore(obj) {
                    let _ = global_tx.send(GlobalRequest::AllWorkloads);
                }
            }
            Ok(Event::Deleted(obj)) => {
                store.remove_ignore(&obj);
                let _ = global_tx.send(GlobalRequest::AllWorkloads);
            }
            Ok(Event::Restarted(objs)) => store.replace_ignores(objs),
            Err(err) => warn!("GlobalReplicasIgnore watch failed: {}", err),
        }
    }
}

/// Watches the config document and reloads it on change. A failed load keeps
/// the last-known-good config. A successful reload re-enqueues every cached
/// non-ignored Deployment along the global path.
pub async fn watch_config(
    client: Client,
    store: Arc<PolicyStore>,
    namespace: String,
    deployments: Store<Deployment>,
    global_tx: UnboundedSender<GlobalRequest>,
) {
    let api = Api::<ConfigMap>::namespaced(client.clone(), &namespace);
    let params = ListParams::default().fields(&format!("metadata.name={}", config::CONFIG_MAP_NAME));
    let mut stream = watcher::watcher(api, params).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Applied(_)) | Ok(Event::Restarted(_)) => {
                match config::load_config(&client, &namespace).await {
                    Ok(config) => {
                        if store.snapshot().config != config {
                            info!(
                                global_percentage = config.global_percentage,
                                min_replicas = config.min_replicas,
                                max_replicas = config.max_replicas,
                                "Global config reloaded"
                            );
                            store.set_config(config);
                            let snapshot = store.snapshot();
                            let deployments_state: Vec<Deployment> =
                                deployments.state().iter().map(|d| (**d).clone()).collect();
                            for request in
                                event_mapper::map_config_event(&snapshot, &deployments_state)
                            {
                                let _ = global_tx.send(request);
                            }
                        }
                    }
                    Err(err) => warn!("Failed to reload global config, keeping previous: {}", err),
                }
            }
            Ok(Event::Deleted(_)) => {
                warn!("Global config document deleted, keeping previous config");
            }
            Err(err) => warn!("Config watch failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeploymentReference, ReplicasOverrideSpec};

    fn override_named(namespace: &str, name: &str, percentage: i32) -> ReplicasOverride {
        let mut obj = ReplicasOverride::new(
            name,
            ReplicasOverrideSpec {
                deployment_ref: Some(DeploymentReference {
                    name: "web".to_string(),
                    namespace: String::new(),
                }),
                replicas_percentage: percentage,
                ..ReplicasOverrideSpec::default()
            },
        );
        obj.metadata.namespace = Some(namespace.to_string());
        obj
    }

    #[test]
    fn snapshot_is_immutable_once_taken() {
        let store = PolicyStore::new();
        let before = store.snapshot();
        store.upsert_override(override_named("default", "boost", 150));
        assert!(before.overrides.is_empty());
        assert_eq!(store.snapshot().overrides.len(), 1);
    }

    #[test]
    fn overrides_iterate_in_lexicographic_order() {
        let store = PolicyStore::new();
        store.upsert_override(override_named("b-ns", "a", 100));
        store.upsert_override(override_named("a-ns", "z", 100));
        store.upsert_override(override_named("a-ns", "a", 100));
        let snapshot = store.snapshot();
        let keys: Vec<_> = snapshot
            .overrides()
            .map(|o| {
                (
                    o.metadata.namespace.clone().unwrap(),
                    o.metadata.name.clone().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a-ns".to_string(), "a".to_string()),
                ("a-ns".to_string(), "z".to_string()),
                ("b-ns".to_string(), "a".to_string()),
            ]
        );
    }

    #[test]
    fn upsert_reports_spec_changes_only() {
        let store = PolicyStore::new();
        assert!(store.upsert_override(override_named("default", "boost", 150)));
        // Same spec again, e.g. a status-only update.
        assert!(!store.upsert_override(override_named("default", "boost", 150)));
        assert!(store.upsert_override(override_named("default", "boost", 200)));
    }

    #[test]
    fn restart_replaces_the_whole_view() {
        let store = PolicyStore::new();
        store.upsert_override(override_named("default", "old", 100));
        store.replace_overrides(vec![override_named("default", "new", 100)]);
        let snapshot = store.snapshot();
        assert!(snapshot
            .overrides
            .contains_key(&("default".to_string(), "new".to_string())));
        assert_eq!(snapshot.overrides.len(), 1);
    }

    #[test]
    fn config_swap_keeps_policy_views() {
        let store = PolicyStore::new();
        store.upsert_override(override_named("default", "boost", 150));
        store.set_config(GlobalConfig {
            global_percentage: 200,
            min_replicas: 2,
            max_replicas: 50,
        });
        let snapshot = store.snapshot();
        assert_eq!(snapshot.config.global_percentage, 200);
        assert_eq!(snapshot.overrides.len(), 1);
    }
}
