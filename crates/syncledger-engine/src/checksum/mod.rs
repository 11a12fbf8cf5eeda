//! Checkpoint record-count reconciliation and its side effects.

pub mod publisher;
pub mod reporter;
pub mod validator;

pub use publisher::{ChannelEventPublisher, TelemetryEventPublisher};
pub use reporter::{
    ChecksumErrorReport, ChecksumErrorReporter, ConnectorMetadata, ConnectorMetadataClient,
    ErrorReportSink, StaticMetadataClient, TracingReportSink,
};
pub use validator::{ChecksumCheck, ChecksumOutcome, ChecksumValidator};
