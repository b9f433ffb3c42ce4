//! The configuration snapshot and its owning store.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::Api, Client, ResourceExt};
use parking_lot::RwLock;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{info, trace, warn};
use xds_controller_core::{
    strip_legacy_prefix, xds, Any, Assignment, AssignmentRules, CacheKey, Cluster, DiscoveryResponse,
    Listener, LoadError, Node,
};

/// One immutable, internally consistent version of the desired
/// configuration: listeners, clusters, assignment rules, the set of EDS
/// service names, and the precomputed discovery response for every rule.
///
/// Built once per source update and never mutated afterwards; installed by
/// swapping the store's `Arc<Config>`.
#[derive(Debug, Default)]
pub struct Config {
    version: String,
    listeners: HashMap<String, Listener>,
    clusters: HashMap<String, Cluster>,
    services: HashSet<String>,
    rules: AssignmentRules,
    cache: HashMap<CacheKey, AssignmentResponses>,
}

/// Precomputed response bodies for one assignment rule.
#[derive(Debug)]
struct AssignmentResponses {
    listeners: Bytes,
    clusters: Bytes,
}

// === impl Config ===

impl Config {
    /// Builds a snapshot from the raw configuration object without
    /// installing it anywhere. Also the backing of the validation surfaces.
    pub fn load(cm: &ConfigMap) -> Result<Self, LoadError> {
        let data = cm.data.as_ref();
        let listeners: Vec<Listener> =
            decode_yaml_list("listeners", data.and_then(|d| d.get("listeners")))?;
        let clusters: Vec<Cluster> =
            decode_yaml_list("clusters", data.and_then(|d| d.get("clusters")))?;
        let rules = match data.and_then(|d| d.get("assignments")).map(|s| s.trim()) {
            None | Some("") => AssignmentRules::default(),
            Some(raw) => serde_yaml::from_str(raw).map_err(|source| LoadError::Source {
                field: "assignments",
                source,
            })?,
        };

        let mut config = Self {
            version: cm.metadata.resource_version.clone().unwrap_or_default(),
            listeners: listeners.into_iter().map(|l| (l.name.clone(), l)).collect(),
            clusters: HashMap::with_capacity(clusters.len()),
            services: HashSet::new(),
            rules,
            cache: HashMap::new(),
        };
        for cluster in clusters {
            if let Some(service) = cluster.eds_service_name() {
                config
                    .services
                    .insert(strip_legacy_prefix(service).to_string());
            }
            config.clusters.insert(cluster.name.clone(), cluster);
        }
        config.build_cache()?;
        Ok(config)
    }

    /// Validates every assignment reference and precomputes the response
    /// bodies served for it. Any dangling reference fails the whole load.
    fn build_cache(&mut self) -> Result<(), LoadError> {
        let mut cache =
            HashMap::with_capacity(self.rules.by_node_id.len() + self.rules.by_cluster.len());
        for (id, assignment) in &self.rules.by_node_id {
            cache.insert(CacheKey::Node(id.clone()), self.precompute(assignment)?);
        }
        for (name, assignment) in &self.rules.by_cluster {
            cache.insert(CacheKey::Cluster(name.clone()), self.precompute(assignment)?);
        }
        self.cache = cache;
        Ok(())
    }

    fn precompute(&self, assignment: &Assignment) -> Result<AssignmentResponses, LoadError> {
        let mut listeners = Vec::with_capacity(assignment.listeners.len());
        for name in &assignment.listeners {
            let listener = self
                .listeners
                .get(name)
                .ok_or_else(|| LoadError::MissingListener(name.clone()))?;
            listeners.push(Any::wrap(xds::LISTENER_TYPE_URL, listener)?);
        }

        let mut clusters = Vec::with_capacity(assignment.clusters.len());
        for name in &assignment.clusters {
            let cluster = self
                .clusters
                .get(name)
                .ok_or_else(|| LoadError::UnknownCluster(name.clone()))?;
            clusters.push(Any::wrap(xds::CLUSTER_TYPE_URL, cluster)?);
        }

        Ok(AssignmentResponses {
            listeners: encode_response(&self.version, listeners)?,
            clusters: encode_response(&self.version, clusters)?,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn assignment(&self, node: &Node) -> Option<&AssignmentResponses> {
        self.cache
            .get(&CacheKey::Node(node.id.clone()))
            .or_else(|| self.cache.get(&CacheKey::Cluster(node.cluster.clone())))
    }

    /// The precomputed listener response for a node, resolved node-id
    /// first, then cluster. Never recomputed on demand.
    pub fn get_listeners(&self, node: &Node) -> Option<Bytes> {
        self.assignment(node).map(|a| a.listeners.clone())
    }

    pub fn get_clusters(&self, node: &Node) -> Option<Bytes> {
        self.assignment(node).map(|a| a.clusters.clone())
    }

    /// Every cluster name reachable from a node: the node-id rule's list
    /// concatenated with the cluster rule's. Unlike response lookup this
    /// takes the union of both rules; it feeds the snapshot export, which
    /// wants everything the identity could ever be served.
    pub fn cluster_names(&self, node: &Node) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(assignment) = self.rules.by_node_id.get(&node.id) {
            names.extend(assignment.clusters.iter().cloned());
        }
        if let Some(assignment) = self.rules.by_cluster.get(&node.cluster) {
            names.extend(assignment.clusters.iter().cloned());
        }
        names
    }

    /// Whether any EDS cluster in this snapshot is fed from the named
    /// service. Legacy-prefixed names are compared stripped.
    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains(strip_legacy_prefix(name))
    }

    /// The declared EDS service name of a cluster, as the data plane will
    /// request it.
    pub fn eds_service_name(&self, cluster: &str) -> Option<&str> {
        self.clusters.get(cluster)?.eds_service_name()
    }
}

fn decode_yaml_list<T: DeserializeOwned>(
    kind: &'static str,
    raw: Option<&String>,
) -> Result<Vec<T>, LoadError> {
    let raw = match raw.map(|s| s.trim()) {
        None | Some("") => return Ok(Vec::new()),
        Some(raw) => raw,
    };
    let elements: Vec<serde_yaml::Value> =
        serde_yaml::from_str(raw).map_err(|source| LoadError::Source { field: kind, source })?;
    elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| {
            serde_yaml::from_value(element.clone()).map_err(|error| LoadError::Element {
                kind,
                index,
                reason: error.to_string(),
                dump: serde_yaml::to_string(&element).unwrap_or_default(),
            })
        })
        .collect()
}

fn encode_response(version: &str, resources: Vec<Any>) -> Result<Bytes, LoadError> {
    let body = serde_json::to_vec(&DiscoveryResponse {
        version_info: version.to_string(),
        resources,
    })?;
    Ok(body.into())
}

/// Load/installation counters, registered on the admin registry.
#[derive(Clone, Debug, Default)]
pub struct ConfigMetrics {
    updates: Counter,
    errors: Counter,
}

// === impl ConfigMetrics ===

impl ConfigMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let updates = Counter::default();
        reg.register(
            "config_updates",
            "Configuration snapshots successfully installed",
            updates.clone(),
        );
        let errors = Counter::default();
        reg.register(
            "config_load_errors",
            "Configuration updates rejected by validation",
            errors.clone(),
        );
        Self { updates, errors }
    }
}

/// Status of the store, as reported on the admin surface.
#[derive(Clone, Debug)]
pub struct ConfigStatus {
    pub version: String,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

pub type SharedConfigStore = Arc<RwLock<ConfigStore>>;

/// Owns the lifecycle of the canonical configuration snapshot.
///
/// Updated only by the watch task; read concurrently through
/// [`ConfigStore::snapshot`], which hands out the installed `Arc<Config>`.
#[derive(Debug)]
pub struct ConfigStore {
    namespace: String,
    name: String,

    config: Arc<Config>,
    /// The last raw object applied, kept to cheaply skip no-op updates.
    config_map: Option<ConfigMap>,

    last_update: Option<DateTime<Utc>>,
    last_error: Option<String>,

    metrics: ConfigMetrics,
}

// === impl ConfigStore ===

impl ConfigStore {
    pub fn shared(
        namespace: impl ToString,
        name: impl ToString,
        metrics: ConfigMetrics,
    ) -> SharedConfigStore {
        Arc::new(RwLock::new(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            config: Arc::new(Config::default()),
            config_map: None,
            last_update: None,
            last_error: None,
            metrics,
        }))
    }

    /// Synchronously fetches and installs the initial snapshot. The process
    /// must not serve discovery with no configuration at all, so any
    /// failure here is fatal to startup.
    pub async fn init(store: &SharedConfigStore, client: Client) -> Result<()> {
        let (namespace, name) = {
            let store = store.read();
            (store.namespace.clone(), store.name.clone())
        };
        let cm = Api::<ConfigMap>::namespaced(client, &namespace)
            .get(&name)
            .await
            .with_context(|| format!("failed to fetch configmap {namespace}/{name}"))?;
        store.write().load(cm)?;
        Ok(())
    }

    fn load(&mut self, cm: ConfigMap) -> Result<(), LoadError> {
        self.last_update = Some(Utc::now());
        match Config::load(&cm) {
            Ok(config) => {
                self.config = Arc::new(config);
                self.config_map = Some(cm);
                self.last_error = None;
                self.metrics.updates.inc();
                Ok(())
            }
            Err(error) => {
                self.last_error = Some(error.to_string());
                self.metrics.errors.inc();
                Err(error)
            }
        }
    }

    /// The current snapshot. Never blocks on a load in progress and never
    /// observes a partially built snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.config.clone()
    }

    pub fn status(&self) -> ConfigStatus {
        ConfigStatus {
            version: self.config.version().to_string(),
            last_error: self.last_error.clone(),
            last_update: self.last_update,
        }
    }
}

impl kubert::index::IndexNamespacedResource<ConfigMap> for ConfigStore {
    fn apply(&mut self, cm: ConfigMap) {
        if cm.metadata.namespace.as_deref() != Some(self.namespace.as_str())
            || cm.name_unchecked() != self.name
        {
            return;
        }
        if self.config_map.as_ref() == Some(&cm) {
            trace!("configuration unchanged");
            return;
        }
        match self.load(cm) {
            Ok(()) => info!(version = %self.config.version(), "configuration updated"),
            Err(error) => warn!(%error, "configuration update rejected"),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        if namespace == self.namespace && name == self.name {
            warn!("configuration object deleted; keeping the last good snapshot");
        }
    }

    fn reset(
        &mut self,
        resources: Vec<ConfigMap>,
        _deleted: ahash::AHashMap<String, ahash::AHashSet<String>>,
    ) {
        for cm in resources {
            self.apply(cm);
        }
    }
}
