//! Agent platform monitor library
//!
//! This library samples host and application health, turns threshold
//! breaches into alerts, runs registered remediation actions against them
//! and records everything in an append-only audit log.

pub mod actions;
pub mod alert;
pub mod audit;
pub mod config;
pub mod error;
pub mod health;
pub mod integrity;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod process;
pub mod registry;
pub mod responder;
pub mod service;

// Re-export commonly used types
pub use alert::{Alert, AlertEngine, AlertLevel, IncidentType, Thresholds};
pub use audit::{AuditLog, AuditRecord, AuditSummary};
pub use config::MonitorConfig;
pub use error::{MonitorError, Result};
pub use health::{HealthHistory, HealthReport, HealthSnapshot, PerformanceSummary};
pub use monitor::{CheckReport, CleanupReport, Monitor, WorkKind, WorkReport};
pub use probe::{MetricSample, MetricsProbe, ProbeScope, SystemProbe};
pub use registry::{RemediationAction, RemediationRegistry};
pub use responder::{IncidentResponder, ResolutionOutcome};
pub use service::{MonitorService, ServiceState, ServiceStatus};
