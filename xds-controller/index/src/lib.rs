//! Reconciliation indexes for the xDS controller.
//!
//! Two stores own the controller's state, each fed by a Kubernetes watch:
//!
//! - [`ConfigStore`] tracks a single ConfigMap holding the desired listener,
//!   cluster, and assignment configuration. Every update is built into an
//!   immutable [`Config`] snapshot off to the side and installed with a
//!   single pointer swap, so concurrent readers always observe a complete
//!   snapshot. An invalid update is rejected whole and the previous
//!   snapshot keeps serving.
//! - [`EndpointIndex`] tracks the Endpoints objects of the watched
//!   namespace, filtered down to the services referenced by the current
//!   snapshot's EDS clusters, and keeps a ready-to-serve discovery response
//!   per service.
//!
//! ```text
//! [ ConfigMap ] -> [ Config snapshot ] <- membership -- [ Endpoints ]
//! ```
//!
//! Both stores implement `kubert::index::IndexNamespacedResource`, so a
//! single watch task is the only writer of each; request handlers read
//! through cheap shared handles.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod endpoints;

pub use self::{
    config::{Config, ConfigMetrics, ConfigStatus, ConfigStore, SharedConfigStore},
    endpoints::{EndpointCache, EndpointEntry, EndpointIndex, SharedEndpointIndex},
};

/// Splits a `namespace/name` object reference.
pub fn split_object_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('/')
}
