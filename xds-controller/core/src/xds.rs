//! Wire envelopes of the REST discovery protocol.

use serde::{Deserialize, Serialize};

pub const ENDPOINTS_PATH: &str = "/v2/discovery:endpoints";
pub const LISTENERS_PATH: &str = "/v2/discovery:listeners";
pub const CLUSTERS_PATH: &str = "/v2/discovery:clusters";

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.api.v2.Listener";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.api.v2.Cluster";
pub const CLUSTER_LOAD_ASSIGNMENT_TYPE_URL: &str =
    "type.googleapis.com/envoy.api.v2.ClusterLoadAssignment";

/// The identity a data-plane proxy presents on every discovery request.
///
/// Either field may be empty; an identity that matches no assignment rule is
/// a valid (not-found) outcome, not an error.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub cluster: String,
}

/// A discovery request. Unknown fields are tolerated so that newer
/// data-plane versions can talk to an older control plane.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    #[serde(default)]
    pub node: Node,

    #[serde(default)]
    pub version_info: String,

    #[serde(default)]
    pub resource_names: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<Any>,
}

/// A typed configuration object wrapped for transport, rendered in the
/// protobuf-JSON style: the wrapped object's fields inlined next to an
/// `@type` discriminator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Any {
    #[serde(rename = "@type")]
    pub type_url: String,

    #[serde(flatten)]
    pub value: serde_json::Map<String, serde_json::Value>,
}

impl Any {
    pub fn wrap<T: Serialize>(type_url: &str, value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(value) => Ok(Self {
                type_url: type_url.to_string(),
                value,
            }),
            other => Err(serde::ser::Error::custom(format!(
                "cannot wrap non-object value: {other}"
            ))),
        }
    }
}
