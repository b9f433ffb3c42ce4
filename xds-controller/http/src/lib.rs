//! The discovery server's HTTP surface.
//!
//! A single stateless handler translates discovery requests into lookups
//! against the configuration snapshot and the endpoint registry. All
//! request handling is synchronous map lookups plus serialization; the
//! only async work is reading the request body.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod discovery;
mod metrics;
mod status;

pub use self::metrics::Metrics;

use bytes::Bytes;
use futures::future;
use http::{header, request::Parts, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use thiserror::Error;
use xds_controller_core::xds;
use xds_controller_index::{EndpointCache, SharedConfigStore};

pub type Body = http_body_util::Full<Bytes>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Body(#[from] hyper::Error),
}

/// Serves the discovery protocol plus the operational surfaces
/// (status, validation, snapshot export, health).
#[derive(Clone, Debug)]
pub struct XdsHandler {
    config: SharedConfigStore,
    endpoints: EndpointCache,
    metrics: Metrics,
}

// === impl XdsHandler ===

impl XdsHandler {
    pub fn new(config: SharedConfigStore, endpoints: EndpointCache, metrics: Metrics) -> Self {
        Self {
            config,
            endpoints,
            metrics,
        }
    }

    fn handle(&self, parts: &Parts, body: &[u8]) -> Reply {
        match parts.uri.path() {
            xds::ENDPOINTS_PATH => post(parts, || self.serve_eds(body)),
            xds::LISTENERS_PATH => post(parts, || self.serve_lds(body)),
            xds::CLUSTERS_PATH => post(parts, || self.serve_cds(body)),
            "/config" => get(parts, || self.serve_status()),
            "/validate" => post(parts, || self.serve_validate(body)),
            "/bootstrap" => get(parts, || self.serve_bootstrap(parts.uri.query())),
            "/healthz" => Reply::text(StatusCode::OK, "ok"),
            _ => Reply::text(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

impl tower::Service<Request<Incoming>> for XdsHandler {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok(handler.handle(&parts, &body).into_response())
        })
    }
}

fn post(parts: &Parts, f: impl FnOnce() -> Reply) -> Reply {
    if parts.method == Method::POST {
        f()
    } else {
        Reply::text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    }
}

fn get(parts: &Parts, f: impl FnOnce() -> Reply) -> Reply {
    if parts.method == Method::GET {
        f()
    } else {
        Reply::text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    }
}

/// A fully formed reply, kept separate from the hyper response so handlers
/// stay synchronous and directly testable.
#[derive(Clone, Debug)]
pub(crate) struct Reply {
    pub(crate) status: StatusCode,
    pub(crate) body: Bytes,
    content_type: Option<&'static str>,
}

// === impl Reply ===

impl Reply {
    pub(crate) fn text(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            body: Bytes::from(msg.into()),
            content_type: Some("text/plain; charset=utf-8"),
        }
    }

    pub(crate) fn json(body: Bytes) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            content_type: Some("application/json"),
        }
    }

    pub(crate) fn not_modified() -> Self {
        Self {
            status: StatusCode::NOT_MODIFIED,
            body: Bytes::new(),
            content_type: None,
        }
    }

    fn into_response(self) -> Response<Body> {
        let mut rsp = Response::builder().status(self.status);
        if let Some(content_type) = self.content_type {
            rsp = rsp.header(header::CONTENT_TYPE, content_type);
        }
        rsp.body(Body::from(self.body))
            .expect("response must be valid")
    }
}

#[cfg(test)]
mod test_util {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubert::index::IndexNamespacedResource;
    use maplit::btreemap;
    use xds_controller_index::{ConfigMetrics, ConfigStore, EndpointIndex, SharedEndpointIndex};

    pub(crate) const LISTENERS: &str = "\
- name: foo
  address:
    socket_address:
      address: 0.0.0.0
      port_value: 10001
";

    pub(crate) const CLUSTERS: &str = "\
- name: foo
  type: EDS
  connect_timeout: 0.25s
  eds_cluster_config:
    service_name: default/foo
";

    pub(crate) const ASSIGNMENTS: &str = "\
by-cluster:
  B:
    listeners: [foo]
    clusters: [foo]
";

    pub(crate) fn mk_config_map(version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("xds".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            data: Some(btreemap! {
                "listeners".to_string() => LISTENERS.to_string(),
                "clusters".to_string() => CLUSTERS.to_string(),
                "assignments".to_string() => ASSIGNMENTS.to_string(),
            }),
            ..Default::default()
        }
    }

    pub(crate) fn mk_handler() -> (XdsHandler, SharedConfigStore, SharedEndpointIndex) {
        let store = ConfigStore::shared("default", "xds", ConfigMetrics::default());
        store.write().apply(mk_config_map("1"));
        let (cache, index) = EndpointIndex::shared("default", store.clone());
        index.write().apply(mk_endpoints("foo", "7"));
        let handler = XdsHandler::new(store.clone(), cache, Metrics::default());
        (handler, store, index)
    }

    pub(crate) fn mk_endpoints(name: &str, version: &str) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.0.0.1".to_string(),
                    ..Default::default()
                }]),
                ports: Some(vec![EndpointPort {
                    port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
        }
    }

    pub(crate) fn body_json(reply: &Reply) -> serde_json::Value {
        serde_json::from_slice(&reply.body).expect("body must be valid JSON")
    }
}
