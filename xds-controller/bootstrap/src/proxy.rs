//! The snapshot-proxy HTTP service.
//!
//! Discovery requests are answered from the frozen snapshot until each
//! class is consumed, then transparently forwarded to the live upstream.
//! The readiness probe flips once every endpoint service has been
//! consumed.

use crate::{Disposition, Snapshot};
use bytes::Bytes;
use futures::future;
use http::{header, request::Parts, uri::Authority, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use xds_controller_core::{xds, DiscoveryRequest};

pub type Body = Full<Bytes>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Body(#[from] hyper::Error),

    #[error("failed to build upstream request: {0}")]
    Http(#[from] http::Error),

    #[error("failed to rewrite request uri: {0}")]
    Uri(#[from] http::uri::InvalidUriParts),
}

#[derive(Clone)]
pub struct SnapshotProxy {
    snapshot: Arc<Mutex<Snapshot>>,
    authority: Authority,
    client: Client<HttpConnector, Body>,
}

// === impl SnapshotProxy ===

impl SnapshotProxy {
    pub fn new(upstream: Authority, snapshot: Snapshot) -> Self {
        info!(%upstream, "serving bootstrap snapshot until depleted");
        Self {
            snapshot: Arc::new(Mutex::new(snapshot)),
            authority: upstream,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn route(self, req: Request<Incoming>) -> Result<Response<Body>, Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        match parts.uri.path() {
            xds::ENDPOINTS_PATH => self.handle_eds(parts, body).await,
            xds::LISTENERS_PATH => {
                self.handle_class(parts, body, "listeners", Snapshot::listeners_depleted, |s| {
                    s.take_listeners()
                })
                .await
            }
            xds::CLUSTERS_PATH => {
                self.handle_class(parts, body, "clusters", Snapshot::clusters_depleted, |s| {
                    s.take_clusters()
                })
                .await
            }
            "/healthz" => {
                if self.snapshot.lock().endpoints_ready() {
                    Ok(text(StatusCode::OK, "ok"))
                } else {
                    Ok(text(StatusCode::INTERNAL_SERVER_ERROR, "bootstrapping"))
                }
            }
            _ => Ok(text(StatusCode::NOT_FOUND, "not found")),
        }
    }

    async fn handle_eds(self, parts: Parts, body: Bytes) -> Result<Response<Body>, Error> {
        if self.snapshot.lock().endpoints_ready() {
            return self.forward(parts, body).await;
        }
        if parts.method != Method::POST {
            return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
        }
        let dr: DiscoveryRequest = match serde_json::from_slice(&body) {
            Ok(dr) => dr,
            Err(error) => return Ok(text(StatusCode::BAD_REQUEST, error.to_string())),
        };
        if dr.resource_names.len() != 1 {
            return Ok(text(
                StatusCode::BAD_REQUEST,
                "must have exactly one resource name",
            ));
        }

        let name = &dr.resource_names[0];
        // Take the disposition in its own scope so the lock is released
        // before any forwarding await.
        let disposition = self.snapshot.lock().take_endpoints(name);
        match disposition {
            Disposition::Serve(frozen) => {
                info!(service = %name, "serving endpoints from bootstrap data");
                Ok(json(frozen))
            }
            Disposition::Forward => {
                debug!(service = %name, "endpoints already consumed; forwarding");
                self.forward(parts, body).await
            }
            Disposition::Unavailable => {
                warn!(service = %name, "endpoints not covered by bootstrap data");
                Ok(text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "unavailable bootstrap data",
                ))
            }
        }
    }

    async fn handle_class(
        self,
        parts: Parts,
        body: Bytes,
        kind: &'static str,
        depleted: fn(&Snapshot) -> bool,
        take: fn(&mut Snapshot) -> Disposition,
    ) -> Result<Response<Body>, Error> {
        if depleted(&self.snapshot.lock()) {
            return self.forward(parts, body).await;
        }
        if parts.method != Method::POST {
            return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
        }
        if let Err(error) = serde_json::from_slice::<DiscoveryRequest>(&body) {
            return Ok(text(StatusCode::BAD_REQUEST, error.to_string()));
        }

        let disposition = take(&mut self.snapshot.lock());
        match disposition {
            Disposition::Serve(frozen) => {
                info!(kind, "serving from bootstrap data");
                Ok(json(frozen))
            }
            // Another request consumed the class while this one was parsing.
            _ => self.forward(parts, body).await,
        }
    }

    async fn forward(&self, parts: Parts, body: Bytes) -> Result<Response<Body>, Error> {
        let mut uri = parts.uri.into_parts();
        uri.scheme = Some(http::uri::Scheme::HTTP);
        uri.authority = Some(self.authority.clone());

        let mut req = Request::builder()
            .method(parts.method)
            .uri(Uri::from_parts(uri)?)
            .body(Body::from(body))?;
        *req.headers_mut() = parts.headers;
        // The client fills these in for the rewritten request.
        req.headers_mut().remove(header::HOST);
        req.headers_mut().remove(header::CONTENT_LENGTH);

        match self.client.request(req).await {
            Ok(rsp) => {
                let (mut parts, body) = rsp.into_parts();
                let body = body.collect().await?.to_bytes();
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, Body::from(body)))
            }
            Err(error) => {
                warn!(%error, upstream = %self.authority, "upstream request failed");
                Ok(text(StatusCode::BAD_GATEWAY, "bad gateway"))
            }
        }
    }
}

impl tower::Service<Request<Incoming>> for SnapshotProxy {
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
        let proxy = self.clone();
        Box::pin(proxy.route(req))
    }
}

fn text(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(Bytes::from(msg.into())))
        .expect("response must be valid")
}

fn json(body: Bytes) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("response must be valid")
}
