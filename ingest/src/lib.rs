//! Telemetry ingestion: topic-partitioned consumers for logs, events and
//! node-IO records, a persistence seam to the search/OLAP backend, and
//! the audit log with its non-blocking writer and cursor-paginated
//! listing.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod audit;
mod consumer;
mod ingestors;

pub use audit::AuditCursor;
pub use audit::AuditError;
pub use audit::AuditPage;
pub use audit::AuditQuery;
pub use audit::AuditRecord;
pub use audit::AuditStore;
pub use audit::DEFAULT_AUDIT_PAGE_SIZE;
pub use audit::InMemoryAuditStore;
pub use audit::MAX_AUDIT_PAGE_SIZE;
pub use audit::emit_audit;
pub use consumer::ConsumerConfig;
pub use consumer::IngestorKind;
pub use ingestors::InMemoryTelemetryStore;
pub use ingestors::LogTopicRecord;
pub use ingestors::NodeIoMessage;
pub use ingestors::StoreError;
pub use ingestors::TelemetryStore;
pub use ingestors::spawn_event_ingestor;
pub use ingestors::spawn_log_ingestor;
pub use ingestors::spawn_node_io_ingestor;
