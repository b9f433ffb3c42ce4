use thiserror::Error;

/// Why a configuration snapshot failed to build.
///
/// Any of these aborts the whole load; the previously installed snapshot
/// remains in effect.
#[derive(Debug, Error)]
pub enum LoadError {
    /// One of the configuration fields is not valid YAML.
    #[error("{field}: invalid YAML: {source}")]
    Source {
        field: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    /// A single list element failed to decode into its typed form. Carries
    /// the element index and a YAML dump of the element for diagnosis.
    #[error("{kind}: index {index}: {reason}:\n\n{dump}")]
    Element {
        kind: &'static str,
        index: usize,
        reason: String,
        dump: String,
    },

    /// An assignment references a listener absent from the snapshot.
    #[error("missing listener: {0}")]
    MissingListener(String),

    /// An assignment references a cluster absent from the snapshot.
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    /// A precomputed discovery response failed to encode.
    #[error("failed to encode discovery response: {0}")]
    Encode(#[from] serde_json::Error),
}
