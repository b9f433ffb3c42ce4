//! The portable snapshot document exchanged between a live control plane
//! and an offline proxy instance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A point-in-time capture of everything one identity resolves to: its
/// listener and cluster discovery responses plus the endpoint response of
/// every EDS service reachable from its assignments.
///
/// Response envelopes are embedded as JSON values so the document stays
/// inspectable with ordinary tooling.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotDocument {
    #[serde(default)]
    pub clusters: serde_json::Value,

    #[serde(default)]
    pub listeners: serde_json::Value,

    #[serde(default)]
    pub endpoints: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let raw = r#"{
            "clusters": {"version_info": "1", "resources": []},
            "listeners": {"version_info": "1", "resources": []},
            "endpoints": {"default/foo": {"version_info": "7", "resources": []}}
        }"#;
        let doc: SnapshotDocument = serde_json::from_str(raw).expect("must parse");
        assert_eq!(doc.endpoints.len(), 1);
        assert_eq!(doc.clusters["version_info"], "1");

        let json = serde_json::to_value(&doc).expect("must serialize");
        assert_eq!(json["endpoints"]["default/foo"]["version_info"], "7");
    }

    #[test]
    fn missing_sections_default() {
        let doc: SnapshotDocument = serde_json::from_str("{}").expect("must parse");
        assert!(doc.endpoints.is_empty());
        assert!(doc.clusters.is_null());
    }
}
