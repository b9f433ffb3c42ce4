use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Discovery request counters, labeled by resource kind and outcome.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    requests: Family<RequestLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    kind: &'static str,
    result: &'static str,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Discovery requests handled by kind and result",
            requests.clone(),
        );
        Self { requests }
    }

    pub(crate) fn observe(&self, kind: &'static str, result: &'static str) {
        self.requests
            .get_or_create(&RequestLabels { kind, result })
            .inc();
    }
}
