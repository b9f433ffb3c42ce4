//! The three discovery endpoints.
//!
//! Every kind shares the freshness contract: a request whose version
//! matches the cached state gets an empty not-modified reply; anything
//! else gets the full precomputed body or a protocol-level not-found.

use crate::{Reply, XdsHandler};
use bytes::Bytes;
use http::StatusCode;
use tracing::debug;
use xds_controller_core::{DiscoveryRequest, Node};
use xds_controller_index::Config;

impl XdsHandler {
    pub(crate) fn serve_eds(&self, body: &[u8]) -> Reply {
        let dr = match parse_request(body) {
            Ok(dr) => dr,
            Err(reply) => {
                self.metrics.observe("endpoints", "invalid");
                return reply;
            }
        };
        if dr.resource_names.len() != 1 {
            self.metrics.observe("endpoints", "invalid");
            return Reply::text(StatusCode::BAD_REQUEST, "must have exactly one resource name");
        }

        let name = &dr.resource_names[0];
        match self.endpoints.get(name) {
            Some(entry) if entry.version == dr.version_info => {
                debug!(service = %name, version = %entry.version, "endpoints not modified");
                self.metrics.observe("endpoints", "not-modified");
                Reply::not_modified()
            }
            Some(entry) => {
                self.metrics.observe("endpoints", "served");
                Reply::json(entry.body.clone())
            }
            None => {
                self.metrics.observe("endpoints", "not-found");
                Reply::text(StatusCode::NOT_FOUND, "not found")
            }
        }
    }

    pub(crate) fn serve_lds(&self, body: &[u8]) -> Reply {
        self.serve_assignment("listeners", body, Config::get_listeners)
    }

    pub(crate) fn serve_cds(&self, body: &[u8]) -> Reply {
        self.serve_assignment("clusters", body, Config::get_clusters)
    }

    fn serve_assignment(
        &self,
        kind: &'static str,
        body: &[u8],
        select: fn(&Config, &Node) -> Option<Bytes>,
    ) -> Reply {
        let dr = match parse_request(body) {
            Ok(dr) => dr,
            Err(reply) => {
                self.metrics.observe(kind, "invalid");
                return reply;
            }
        };

        let snapshot = self.config.read().snapshot();
        if snapshot.version() == dr.version_info {
            debug!(version = %dr.version_info, kind, "configuration not modified");
            self.metrics.observe(kind, "not-modified");
            return Reply::not_modified();
        }

        match select(&snapshot, &dr.node) {
            Some(body) => {
                self.metrics.observe(kind, "served");
                Reply::json(body)
            }
            None => {
                debug!(id = %dr.node.id, cluster = %dr.node.cluster, kind, "no assignment");
                self.metrics.observe(kind, "not-found");
                Reply::text(StatusCode::NOT_FOUND, "not found")
            }
        }
    }
}

fn parse_request(body: &[u8]) -> Result<DiscoveryRequest, Reply> {
    serde_json::from_slice(body)
        .map_err(|error| Reply::text(StatusCode::BAD_REQUEST, error.to_string()))
}

#[cfg(test)]
mod tests {
    use crate::test_util::*;
    use http::StatusCode;
    use serde_json::json;

    fn request(node: serde_json::Value, version: &str, names: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "node": node,
            "version_info": version,
            "resource_names": names,
        }))
        .unwrap()
    }

    #[test]
    fn cds_round_trip_then_not_modified() {
        let (handler, _, _) = mk_handler();
        let node = json!({"cluster": "B"});

        let reply = handler.serve_cds(&request(node.clone(), "", &[]));
        assert_eq!(reply.status, StatusCode::OK);
        let body = body_json(&reply);
        assert_eq!(body["resources"].as_array().unwrap().len(), 1);
        assert_eq!(
            body["resources"][0]["@type"],
            "type.googleapis.com/envoy.api.v2.Cluster"
        );

        // Echoing the returned version short-circuits.
        let version = body["version_info"].as_str().unwrap();
        let reply = handler.serve_cds(&request(node, version, &[]));
        assert_eq!(reply.status, StatusCode::NOT_MODIFIED);
        assert!(reply.body.is_empty());
    }

    #[test]
    fn lds_serves_resolved_assignment() {
        let (handler, _, _) = mk_handler();
        let reply = handler.serve_lds(&request(json!({"cluster": "B"}), "", &[]));
        assert_eq!(reply.status, StatusCode::OK);
        let body = body_json(&reply);
        assert_eq!(
            body["resources"][0]["@type"],
            "type.googleapis.com/envoy.api.v2.Listener"
        );
        assert_eq!(body["resources"][0]["name"], "foo");
    }

    #[test]
    fn stale_version_gets_full_body() {
        let (handler, _, _) = mk_handler();
        let fresh = handler.serve_lds(&request(json!({"cluster": "B"}), "", &[]));
        let stale = handler.serve_lds(&request(json!({"cluster": "B"}), "0-stale", &[]));
        assert_eq!(stale.status, StatusCode::OK);
        assert_eq!(stale.body, fresh.body);
    }

    #[test]
    fn unknown_identity_is_not_found() {
        let (handler, _, _) = mk_handler();
        let reply = handler.serve_cds(&request(json!({"id": "x", "cluster": "y"}), "", &[]));
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn version_match_short_circuits_before_resolution() {
        // Not-modified applies even for an identity with no assignment.
        let (handler, _, _) = mk_handler();
        let reply = handler.serve_cds(&request(json!({"id": "x"}), "1", &[]));
        assert_eq!(reply.status, StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn eds_requires_exactly_one_name() {
        let (handler, _, _) = mk_handler();
        for names in [&[][..], &["a", "b"][..]] {
            let reply = handler.serve_eds(&request(json!({}), "", names));
            assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn eds_round_trip_then_not_modified() {
        let (handler, _, _) = mk_handler();
        let reply = handler.serve_eds(&request(json!({}), "", &["default/foo"]));
        assert_eq!(reply.status, StatusCode::OK);
        let body = body_json(&reply);
        assert_eq!(body["version_info"], "7");
        assert_eq!(
            body["resources"][0]["@type"],
            "type.googleapis.com/envoy.api.v2.ClusterLoadAssignment"
        );

        let reply = handler.serve_eds(&request(json!({}), "7", &["default/foo"]));
        assert_eq!(reply.status, StatusCode::NOT_MODIFIED);
    }

    #[test]
    fn eds_unknown_service_is_not_found() {
        let (handler, _, _) = mk_handler();
        let reply = handler.serve_eds(&request(json!({}), "", &["default/quux"]));
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn eds_strips_legacy_prefix() {
        let (handler, _, _) = mk_handler();
        let reply = handler.serve_eds(&request(json!({}), "", &["k8s:default/foo"]));
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[test]
    fn malformed_body_is_bad_request() {
        let (handler, _, _) = mk_handler();
        let reply = handler.serve_lds(b"{not json");
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    }
}
