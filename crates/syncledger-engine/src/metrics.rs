//! Diagnostic counters emitted by the bookkeeping core.

use ::metrics::Label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerMetric {
    /// A source emitted the same checkpoint twice for one stream.
    StateCollisionFromSource,
    /// A destination acknowledged a checkpoint that is not staged.
    UnknownStateFromDestination,
    /// A checksum failure was reported.
    ChecksumCountError,
}

impl TrackerMetric {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::StateCollisionFromSource => "state_error_collision_from_source",
            Self::UnknownStateFromDestination => "state_error_unknown_from_destination",
            Self::ChecksumCountError => "state_checksum_count_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricAttribute {
    pub key: &'static str,
    pub value: String,
}

impl MetricAttribute {
    #[must_use]
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// Counter sink. Implementations must not block.
pub trait MetricClient: Send + Sync {
    fn count(&self, metric: TrackerMetric, value: u64, attributes: &[MetricAttribute]);
}

/// Forwards to whatever recorder is installed for the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetricClient;

impl MetricClient for FacadeMetricClient {
    fn count(&self, metric: TrackerMetric, value: u64, attributes: &[MetricAttribute]) {
        let labels: Vec<Label> = attributes
            .iter()
            .map(|attr| Label::new(attr.key, attr.value.clone()))
            .collect();
        ::metrics::counter!(metric.name(), labels).increment(value);
    }
}
