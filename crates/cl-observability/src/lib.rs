//! # cl-observability
//!
//! Logging, metrics, and the collection audit trail for cloudits.

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::{AuditEventType, AuditLogEntry, AuditResult, CollectionAuditLog};
pub use logging::{init_logging, init_logging_with_config, LoggingConfig, LoggingError};
pub use metrics::{CollectionMetrics, RunTotals};
