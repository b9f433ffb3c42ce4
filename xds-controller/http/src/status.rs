//! Operational surfaces: load status, offline validation, and the
//! portable snapshot export consumed by proxy-mode instances.

use crate::{Reply, XdsHandler};
use http::StatusCode;
use k8s_openapi::api::core::v1::ConfigMap;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use xds_controller_core::{Node, SnapshotDocument};
use xds_controller_index::Config;

impl XdsHandler {
    /// `/config`: the store's view of the last load attempt. Reports 500
    /// while the most recent update is rejected so that fleet dashboards
    /// notice, even though the previous snapshot keeps serving.
    pub(crate) fn serve_status(&self) -> Reply {
        let status = self.config.read().status();
        let code = if status.last_error.is_some() {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        };
        let body = serde_json::json!({
            "version": status.version,
            "last_error": status.last_error.unwrap_or_default(),
            "last_update": status
                .last_update
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        });
        Reply {
            status: code,
            ..Reply::json(
                serde_json::to_vec(&body)
                    .expect("status must serialize")
                    .into(),
            )
        }
    }

    /// `/validate`: runs a configuration object through the same load path
    /// as the watch, without installing anything.
    pub(crate) fn serve_validate(&self, body: &[u8]) -> Reply {
        let cm: ConfigMap = match serde_yaml::from_slice(body) {
            Ok(cm) => cm,
            Err(error) => return Reply::text(StatusCode::BAD_REQUEST, error.to_string()),
        };
        match Config::load(&cm) {
            Ok(config) => {
                debug!(version = %config.version(), "configuration is valid");
                Reply::text(StatusCode::OK, "ok")
            }
            Err(error) => Reply::text(StatusCode::BAD_REQUEST, error.to_string()),
        }
    }

    /// `/bootstrap?id=..&cluster=..`: everything the identity currently
    /// resolves to, bundled into one portable document.
    pub(crate) fn serve_bootstrap(&self, query: Option<&str>) -> Reply {
        let query = query.unwrap_or("");
        let node = Node {
            id: query_param(query, "id").unwrap_or_default(),
            cluster: query_param(query, "cluster").unwrap_or_default(),
        };

        let snapshot = self.config.read().snapshot();
        let (Some(listeners), Some(clusters)) = (
            snapshot.get_listeners(&node),
            snapshot.get_clusters(&node),
        ) else {
            return Reply::text(StatusCode::NOT_FOUND, "identity has no assignment");
        };

        let mut endpoints = BTreeMap::new();
        for cluster in snapshot.cluster_names(&node) {
            let Some(service) = snapshot.eds_service_name(&cluster) else {
                continue;
            };
            match self.endpoints.get(service) {
                Some(entry) => match serde_json::from_slice(&entry.body) {
                    Ok(envelope) => {
                        endpoints.insert(service.to_string(), envelope);
                    }
                    Err(error) => {
                        warn!(%service, %error, "cached endpoints are not valid JSON");
                        return Reply::text(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "failed to encode snapshot",
                        );
                    }
                },
                None => warn!(%service, "no endpoints recorded; omitting from snapshot"),
            }
        }

        let doc = match mk_document(&listeners, &clusters, endpoints) {
            Ok(doc) => doc,
            Err(error) => {
                warn!(%error, "failed to encode snapshot");
                return Reply::text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode snapshot");
            }
        };
        Reply::json(doc.into())
    }
}

fn mk_document(
    listeners: &[u8],
    clusters: &[u8],
    endpoints: BTreeMap<String, serde_json::Value>,
) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&SnapshotDocument {
        clusters: serde_json::from_slice(clusters)?,
        listeners: serde_json::from_slice(listeners)?,
        endpoints,
    })
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}
