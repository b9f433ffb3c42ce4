//! Offline bootstrap serving.
//!
//! A disconnected data-plane instance starts against a point-in-time
//! snapshot captured earlier from a live control plane. Each resource
//! class is served from the snapshot exactly once and every later request
//! is forwarded to the live upstream, so frozen data is never served twice
//! once the live discovery path is confirmed reachable.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod proxy;

pub use self::proxy::SnapshotProxy;

use ahash::AHashMap as HashMap;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::uri::{Authority, Scheme, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use xds_controller_core::{Node, SnapshotDocument};

/// Depletion state of one resource class.
///
/// The one-shot transition is explicit: once a class leaves `Frozen` it can
/// never serve snapshot data again.
#[derive(Debug)]
enum Class {
    Frozen(Bytes),
    Depleted,
}

/// What to do with a request for a resource class.
#[derive(Debug, PartialEq)]
pub enum Disposition {
    /// Serve the frozen snapshot body; the class is now depleted.
    Serve(Bytes),
    /// The class was already consumed; forward to the live upstream.
    Forward,
    /// The snapshot does not cover this resource.
    Unavailable,
}

/// The depletion state machine over a parsed snapshot document.
///
/// Clusters and listeners are whole classes; endpoints are tracked one
/// class per service name so each can be consumed independently.
#[derive(Debug)]
pub struct Snapshot {
    clusters: Class,
    listeners: Class,
    endpoints: HashMap<String, Class>,
}

// === impl Snapshot ===

impl Snapshot {
    pub fn from_document(doc: SnapshotDocument) -> Result<Self, serde_json::Error> {
        let mut endpoints = HashMap::with_capacity(doc.endpoints.len());
        for (service, envelope) in doc.endpoints {
            endpoints.insert(service, Class::Frozen(serde_json::to_vec(&envelope)?.into()));
        }
        Ok(Self {
            clusters: Class::Frozen(serde_json::to_vec(&doc.clusters)?.into()),
            listeners: Class::Frozen(serde_json::to_vec(&doc.listeners)?.into()),
            endpoints,
        })
    }

    pub fn take_clusters(&mut self) -> Disposition {
        take(&mut self.clusters)
    }

    pub fn take_listeners(&mut self) -> Disposition {
        take(&mut self.listeners)
    }

    /// Consumes the snapshot data for one service. Once every service has
    /// been consumed, all endpoint requests forward, including those for
    /// names the snapshot never covered.
    pub fn take_endpoints(&mut self, name: &str) -> Disposition {
        if self.endpoints_ready() {
            return Disposition::Forward;
        }
        match self.endpoints.get_mut(name) {
            Some(class) => take(class),
            None => Disposition::Unavailable,
        }
    }

    pub fn clusters_depleted(&self) -> bool {
        matches!(self.clusters, Class::Depleted)
    }

    pub fn listeners_depleted(&self) -> bool {
        matches!(self.listeners, Class::Depleted)
    }

    /// Whether every endpoint service in the snapshot has been consumed.
    /// This is the instance's readiness signal: clusters and listeners are
    /// fetched once, early, by the data plane's own startup, so they are
    /// deliberately not part of it.
    pub fn endpoints_ready(&self) -> bool {
        self.endpoints
            .values()
            .all(|class| matches!(class, Class::Depleted))
    }
}

fn take(class: &mut Class) -> Disposition {
    match std::mem::replace(class, Class::Depleted) {
        Class::Frozen(body) => Disposition::Serve(body),
        Class::Depleted => Disposition::Forward,
    }
}

/// Downloads the snapshot document for an identity from a live control
/// plane. The body is parsed before it is returned so a bad upstream can
/// never produce an unusable bootstrap file.
pub async fn fetch(upstream: &Authority, node: &Node) -> Result<Bytes> {
    let uri = Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(upstream.clone())
        .path_and_query(format!(
            "/bootstrap?id={}&cluster={}",
            node.id, node.cluster
        ))
        .build()
        .context("invalid upstream address")?;

    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let req = http::Request::builder()
        .uri(uri)
        .body(Full::default())
        .context("failed to build bootstrap request")?;
    let rsp = client
        .request(req)
        .await
        .with_context(|| format!("failed to fetch bootstrap data from {upstream}"))?;
    let status = rsp.status();
    let body = rsp
        .into_body()
        .collect()
        .await
        .context("failed to read bootstrap response")?
        .to_bytes();
    if !status.is_success() {
        bail!(
            "upstream returned {status}: {}",
            String::from_utf8_lossy(&body)
        );
    }
    serde_json::from_slice::<SnapshotDocument>(&body)
        .context("upstream returned an invalid snapshot document")?;
    Ok(body)
}
