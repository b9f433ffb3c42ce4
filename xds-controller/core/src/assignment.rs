//! Assignment rules: which listeners and clusters a node receives.

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

/// A named bundle of references into a configuration snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default)]
    pub listeners: Vec<String>,

    #[serde(default)]
    pub clusters: Vec<String>,
}

/// Rules resolving a node identity to an [`Assignment`].
///
/// A node-id rule takes precedence over a cluster rule when both match; the
/// two are never merged for response lookup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRules {
    #[serde(default, rename = "by-node-id")]
    pub by_node_id: HashMap<String, Assignment>,

    #[serde(default, rename = "by-cluster")]
    pub by_cluster: HashMap<String, Assignment>,
}

/// Key of the precomputed response cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Node(String),
    Cluster(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_wire_shape() {
        let rules: AssignmentRules = serde_yaml::from_str(
            "by-node-id:\n\
             \x20 node-a:\n\
             \x20   listeners: [http]\n\
             \x20   clusters: [foo, bar]\n\
             by-cluster:\n\
             \x20 edge:\n\
             \x20   listeners: [http]\n",
        )
        .expect("must parse");
        assert_eq!(rules.by_node_id["node-a"].clusters, vec!["foo", "bar"]);
        // Unlisted fields default to empty.
        assert!(rules.by_cluster["edge"].clusters.is_empty());
    }

    #[test]
    fn node_and_cluster_keys_are_distinct() {
        assert_ne!(
            CacheKey::Node("edge".to_string()),
            CacheKey::Cluster("edge".to_string())
        );
    }
}
