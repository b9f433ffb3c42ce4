//! The endpoint registry: freshest-known backends for every service
//! referenced by an EDS cluster, kept as ready-to-serve response bodies.

use crate::SharedConfigStore;
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use bytes::Bytes;
use k8s_openapi::api::core::v1::Endpoints;
use kube::{
    api::{Api, ListParams},
    Client, ResourceExt,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use xds_controller_core::{
    resources::{ClusterLoadAssignment, LbEndpoint, LocalityLbEndpoints},
    xds, Any, DiscoveryResponse,
};

/// A cached endpoint discovery response for one service.
#[derive(Debug, PartialEq)]
pub struct EndpointEntry {
    /// The source object's revision token; used to skip rebuilds for
    /// updates that did not actually change the object.
    pub version: String,
    pub body: Bytes,
}

type Registry = Arc<RwLock<HashMap<String, Arc<EndpointEntry>>>>;

/// Read handle shared with request handlers. Cheap to clone; lookups take
/// the read lock only long enough to clone out the entry's `Arc`.
#[derive(Clone, Debug)]
pub struct EndpointCache(Registry);

// === impl EndpointCache ===

impl EndpointCache {
    /// Looks up the response for a service key, stripping the legacy
    /// prefix older clients still send.
    pub fn get(&self, name: &str) -> Option<Arc<EndpointEntry>> {
        self.0
            .read()
            .get(xds_controller_core::strip_legacy_prefix(name))
            .cloned()
    }
}

pub type SharedEndpointIndex = Arc<RwLock<EndpointIndex>>;

/// Watch-driven writer of the endpoint registry.
///
/// Only objects whose `namespace/name` matches a service referenced by the
/// current configuration snapshot are tracked; everything else is dropped
/// on arrival so the registry cannot grow with unrelated services.
#[derive(Debug)]
pub struct EndpointIndex {
    namespace: String,
    config: SharedConfigStore,
    registry: Registry,
}

// === impl EndpointIndex ===

impl EndpointIndex {
    pub fn shared(
        namespace: impl ToString,
        config: SharedConfigStore,
    ) -> (EndpointCache, SharedEndpointIndex) {
        let registry = Registry::default();
        let index = Arc::new(RwLock::new(Self {
            namespace: namespace.to_string(),
            config,
            registry: registry.clone(),
        }));
        (EndpointCache(registry), index)
    }

    /// Synchronously lists and indexes the namespace's current endpoint
    /// objects so no matching service is missing just because the watch
    /// has not delivered its initial state yet. Failure is fatal at
    /// startup.
    pub async fn init(index: &SharedEndpointIndex, client: Client) -> Result<()> {
        let namespace = index.read().namespace.clone();
        let endpoints = Api::<Endpoints>::namespaced(client, &namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list endpoints in {namespace}"))?;
        let mut index = index.write();
        for ep in endpoints.items {
            index.apply_endpoints(ep);
        }
        Ok(())
    }

    fn apply_endpoints(&mut self, ep: Endpoints) {
        let key = format!("{}/{}", self.namespace, ep.name_unchecked());
        let config = self.config.read().snapshot();
        if !config.has_service(&key) {
            trace!(service = %key, "ignoring endpoints for unreferenced service");
            return;
        }

        let version = ep.resource_version().unwrap_or_default();
        if let Some(entry) = self.registry.read().get(&key) {
            if entry.version == version {
                debug!(service = %key, %version, "endpoints unchanged");
                return;
            }
        }

        match build_response(&key, &version, &ep) {
            Ok((body, addresses)) => {
                debug!(service = %key, %version, addresses, "endpoints updated");
                self.registry
                    .write()
                    .insert(key, Arc::new(EndpointEntry { version, body }));
            }
            Err(error) => {
                warn!(service = %key, %error, "failed to encode endpoints response");
            }
        }
    }

    fn remove_endpoints(&mut self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        let config = self.config.read().snapshot();
        if !config.has_service(&key) {
            return;
        }
        if self.registry.write().remove(&key).is_some() {
            info!(service = %key, "removed endpoints");
        }
    }
}

impl kubert::index::IndexNamespacedResource<Endpoints> for EndpointIndex {
    fn apply(&mut self, ep: Endpoints) {
        self.apply_endpoints(ep);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove_endpoints(&namespace, &name);
    }

    fn reset(
        &mut self,
        resources: Vec<Endpoints>,
        deleted: ahash::AHashMap<String, ahash::AHashSet<String>>,
    ) {
        for ep in resources {
            self.apply_endpoints(ep);
        }
        for (namespace, names) in deleted {
            for name in names {
                self.remove_endpoints(&namespace, &name);
            }
        }
    }
}

/// Builds the response envelope for one endpoint object.
///
/// A subset is usable only when it defines exactly one port; zero or
/// several ports leave the backend port ambiguous, so the whole subset is
/// skipped rather than guessed at.
fn build_response(
    key: &str,
    version: &str,
    ep: &Endpoints,
) -> Result<(Bytes, usize), serde_json::Error> {
    let mut lb_endpoints = Vec::new();
    for subset in ep.subsets.iter().flatten() {
        let port = match subset.ports.as_deref() {
            Some([port]) => port.port,
            _ => continue,
        };
        for address in subset.addresses.iter().flatten() {
            lb_endpoints.push(LbEndpoint::tcp(address.ip.clone(), port as u32));
        }
    }

    let count = lb_endpoints.len();
    let cla = ClusterLoadAssignment {
        cluster_name: key.to_string(),
        endpoints: vec![LocalityLbEndpoints { lb_endpoints }],
    };
    let body = serde_json::to_vec(&DiscoveryResponse {
        version_info: version.to_string(),
        resources: vec![Any::wrap(xds::CLUSTER_LOAD_ASSIGNMENT_TYPE_URL, &cla)?],
    })?;
    Ok((body.into(), count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigMetrics, ConfigStore};
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubert::index::IndexNamespacedResource;
    use maplit::btreemap;

    fn mk_store() -> SharedConfigStore {
        let store = ConfigStore::shared("default", "xds", ConfigMetrics::default());
        let cm = k8s_openapi::api::core::v1::ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("xds".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            data: Some(btreemap! {
                "clusters".to_string() => "\
- name: foo
  type: EDS
  eds_cluster_config:
    service_name: k8s:default/foo
"
                .to_string(),
            }),
            ..Default::default()
        };
        store.write().apply(cm);
        store
    }

    fn mk_endpoints(name: &str, version: &str, subsets: Vec<EndpointSubset>) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            subsets: Some(subsets),
        }
    }

    fn mk_subset(ips: &[&str], ports: &[i32]) -> EndpointSubset {
        EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|port| EndpointPort {
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn decode(entry: &EndpointEntry) -> serde_json::Value {
        serde_json::from_slice(&entry.body).expect("body must be valid JSON")
    }

    #[test]
    fn indexes_referenced_service() {
        let (cache, index) = EndpointIndex::shared("default", mk_store());
        index.write().apply(mk_endpoints(
            "foo",
            "7",
            vec![mk_subset(&["10.0.0.1", "10.0.0.2"], &[8080])],
        ));

        let entry = cache.get("default/foo").expect("must be indexed");
        assert_eq!(entry.version, "7");
        let body = decode(&entry);
        assert_eq!(body["version_info"], "7");
        let endpoints = &body["resources"][0]["endpoints"][0]["lb_endpoints"];
        assert_eq!(endpoints.as_array().unwrap().len(), 2);
        let addr = &endpoints[1]["endpoint"]["address"]["socket_address"];
        assert_eq!(addr["address"], "10.0.0.2");
        assert_eq!(addr["port_value"], 8080);

        // Legacy-prefixed lookups resolve the same entry.
        assert!(cache.get("k8s:default/foo").is_some());
    }

    #[test]
    fn ignores_unreferenced_service() {
        let (cache, index) = EndpointIndex::shared("default", mk_store());
        index.write().apply(mk_endpoints(
            "unrelated",
            "1",
            vec![mk_subset(&["10.0.0.1"], &[8080])],
        ));
        assert!(cache.get("default/unrelated").is_none());
    }

    #[test]
    fn ambiguous_subsets_are_skipped_whole() {
        let (cache, index) = EndpointIndex::shared("default", mk_store());
        index.write().apply(mk_endpoints(
            "foo",
            "1",
            vec![
                mk_subset(&["10.0.0.1"], &[8080, 9090]),
                mk_subset(&["10.0.0.2"], &[]),
                mk_subset(&["10.0.0.3"], &[8080]),
            ],
        ));
        let body = decode(&cache.get("default/foo").unwrap());
        let endpoints = &body["resources"][0]["endpoints"][0]["lb_endpoints"];
        assert_eq!(endpoints.as_array().unwrap().len(), 1);
        assert_eq!(
            endpoints[0]["endpoint"]["address"]["socket_address"]["address"],
            "10.0.0.3"
        );
    }

    #[test]
    fn same_version_skips_rebuild() {
        let (cache, index) = EndpointIndex::shared("default", mk_store());
        index
            .write()
            .apply(mk_endpoints("foo", "7", vec![mk_subset(&["10.0.0.1"], &[80])]));
        let first = cache.get("default/foo").unwrap();

        // Same revision, different payload: the event is a no-op.
        index
            .write()
            .apply(mk_endpoints("foo", "7", vec![mk_subset(&["10.9.9.9"], &[80])]));
        let second = cache.get("default/foo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // A new revision rebuilds.
        index
            .write()
            .apply(mk_endpoints("foo", "8", vec![mk_subset(&["10.9.9.9"], &[80])]));
        let third = cache.get("default/foo").unwrap();
        assert_eq!(third.version, "8");
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn delete_removes_entry() {
        let (cache, index) = EndpointIndex::shared("default", mk_store());
        index
            .write()
            .apply(mk_endpoints("foo", "1", vec![mk_subset(&["10.0.0.1"], &[80])]));
        assert!(cache.get("default/foo").is_some());

        index
            .write()
            .delete("default".to_string(), "foo".to_string());
        assert!(cache.get("default/foo").is_none());
    }

    #[test]
    fn delete_of_unreferenced_service_is_ignored() {
        let (cache, index) = EndpointIndex::shared("default", mk_store());
        index
            .write()
            .delete("default".to_string(), "unrelated".to_string());
        assert!(cache.get("default/unrelated").is_none());
    }
}
