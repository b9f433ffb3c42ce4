//! Typed configuration objects.
//!
//! Listeners and clusters are opaque to the control plane except for the
//! handful of fields it routes on: the unique `name` and, for clusters fed
//! by endpoint discovery, the EDS service name. Everything else is captured
//! verbatim so arbitrary data-plane configuration passes through untouched.

use serde::{Deserialize, Serialize};

/// Service names written by older tooling carry this prefix; it is stripped
/// before any membership comparison.
pub const LEGACY_SERVICE_PREFIX: &str = "k8s:";

pub fn strip_legacy_prefix(name: &str) -> &str {
    name.strip_prefix(LEGACY_SERVICE_PREFIX).unwrap_or(name)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,

    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eds_cluster_config: Option<EdsClusterConfig>,

    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdsClusterConfig {
    pub service_name: String,

    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl Cluster {
    /// The EDS service name as written in the configuration, if any.
    pub fn eds_service_name(&self) -> Option<&str> {
        self.eds_cluster_config
            .as_ref()
            .map(|eds| eds.service_name.as_str())
    }
}

/// The load assignment resource served for one EDS service, in the
/// snake_case JSON rendering the data plane consumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LocalityLbEndpoints>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalityLbEndpoints {
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LbEndpoint {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub socket_address: SocketAddress,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SocketAddress {
    pub protocol: String,
    pub address: String,
    pub port_value: u32,
}

impl LbEndpoint {
    pub fn tcp(address: impl Into<String>, port: u32) -> Self {
        Self {
            endpoint: Endpoint {
                address: Address {
                    socket_address: SocketAddress {
                        protocol: "TCP".to_string(),
                        address: address.into(),
                        port_value: port,
                    },
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_prefix() {
        assert_eq!(strip_legacy_prefix("k8s:default/foo"), "default/foo");
        assert_eq!(strip_legacy_prefix("default/foo"), "default/foo");
    }

    #[test]
    fn cluster_keeps_opaque_fields() {
        let cluster: Cluster = serde_yaml::from_str(
            "name: foo\n\
             type: EDS\n\
             connect_timeout: 0.25s\n\
             eds_cluster_config:\n\
             \x20 service_name: default/foo\n\
             \x20 eds_config:\n\
             \x20   api_config_source:\n\
             \x20     api_type: REST\n",
        )
        .expect("must parse");
        assert_eq!(cluster.name, "foo");
        assert_eq!(cluster.eds_service_name(), Some("default/foo"));
        assert_eq!(cluster.config["type"], "EDS");
        assert_eq!(cluster.config["connect_timeout"], "0.25s");

        let json = serde_json::to_value(&cluster).expect("must serialize");
        assert_eq!(json["type"], "EDS");
        assert_eq!(json["eds_cluster_config"]["service_name"], "default/foo");
        assert!(json["eds_cluster_config"]["eds_config"].is_object());
    }

    #[test]
    fn cluster_without_eds_config() {
        let cluster: Cluster =
            serde_yaml::from_str("name: static\ntype: STATIC\n").expect("must parse");
        assert_eq!(cluster.eds_service_name(), None);
    }

    #[test]
    fn load_assignment_wire_shape() {
        let cla = ClusterLoadAssignment {
            cluster_name: "default/foo".to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint::tcp("10.0.0.1", 8080)],
            }],
        };
        let json = serde_json::to_value(&cla).expect("must serialize");
        let addr = &json["endpoints"][0]["lb_endpoints"][0]["endpoint"]["address"]
            ["socket_address"];
        assert_eq!(addr["protocol"], "TCP");
        assert_eq!(addr["address"], "10.0.0.1");
        assert_eq!(addr["port_value"], 8080);
    }
}
