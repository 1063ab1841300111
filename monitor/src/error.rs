//! Error handling for the platform monitor
//!
//! This module provides the error types for every stage of the monitoring
//! pipeline: configuration loading, probing, remediation, auditing and
//! notification delivery. Only configuration and scheduler start-up errors
//! are ever surfaced to the process; everything else is recovered locally.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The main error type for the monitor
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Probe sub-check errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Remediation action errors
    #[error("Remediation error: {0}")]
    Action(#[from] ActionError),

    /// Audit log errors
    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),

    /// Notification delivery errors
    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),

    /// Scheduling errors
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Generic(String),
}

/// Configuration related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration value: {field} = {value}")]
    InvalidValue { field: String, value: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Configuration file permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Configuration parsing error: {reason}")]
    ParseError { reason: String },
}

/// Errors raised by a single probe sub-check
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("No mounted filesystem contains {path}")]
    DiskNotFound { path: PathBuf },

    #[error("Process table unavailable: {reason}")]
    ProcessTable { reason: String },

    #[error("Endpoint {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("Endpoint {endpoint} request failed: {reason}")]
    Http { endpoint: String, reason: String },

    #[error("Probe task failed: {reason}")]
    TaskFailed { reason: String },
}

/// Remediation action errors
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Action {action} timed out after {timeout_secs}s")]
    TimedOut { action: String, timeout_secs: u64 },

    #[error("Action cancelled before completion")]
    Cancelled,

    #[error("Action not configured: {reason}")]
    NotConfigured { reason: String },

    #[error("Filesystem operation failed on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to launch service {service}: {reason}")]
    Launch { service: String, reason: String },

    #[error("Unknown remediation action: {id}")]
    UnknownAction { id: String },

    #[error("Action failed: {reason}")]
    Failed { reason: String },
}

/// Audit log errors
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Cannot open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot append to audit log {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Audit record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Notification delivery errors
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification channel {channel} is not configured: {reason}")]
    NotConfigured { channel: String, reason: String },

    #[error("Webhook delivery failed: {reason}")]
    Webhook { reason: String },

    #[error("Email delivery failed: {reason}")]
    Email { reason: String },
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MonitorError>;

/// A specialized result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A specialized result type for probe sub-checks
pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

/// A specialized result type for remediation actions
pub type ActionResult<T> = std::result::Result<T, ActionError>;

/// A specialized result type for audit operations
pub type AuditResult<T> = std::result::Result<T, AuditError>;

/// A specialized result type for notification delivery
pub type NotificationResult<T> = std::result::Result<T, NotificationError>;

impl MonitorError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Config(_) => false,
            MonitorError::Scheduling(_) => false,
            MonitorError::Audit(AuditError::Open { .. }) => false,
            MonitorError::Io(io_error) => {
                matches!(io_error.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            _ => true,
        }
    }

    /// Check if this error requires immediate attention
    pub fn is_critical(&self) -> bool {
        matches!(self, MonitorError::Audit(_) | MonitorError::Scheduling(_))
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::Probe(_) => "probe",
            MonitorError::Action(_) => "remediation",
            MonitorError::Audit(_) => "audit",
            MonitorError::Notification(_) => "notification",
            MonitorError::Scheduling(_) => "scheduling",
            MonitorError::Metrics(_) => "metrics",
            MonitorError::Io(_) => "io",
            MonitorError::Serialization(_) => "serialization",
            MonitorError::Generic(_) => "generic",
        }
    }
}

impl From<String> for MonitorError {
    fn from(msg: String) -> Self {
        MonitorError::Generic(msg)
    }
}

impl From<&str> for MonitorError {
    fn from(msg: &str) -> Self {
        MonitorError::Generic(msg.to_string())
    }
}

impl From<tokio_cron_scheduler::JobSchedulerError> for MonitorError {
    fn from(err: tokio_cron_scheduler::JobSchedulerError) -> Self {
        MonitorError::Scheduling(err.to_string())
    }
}

impl ActionError {
    /// Wrap an I/O failure on a specific path
    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ActionError::Filesystem { path: path.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        let config_error = MonitorError::Config(ConfigError::ParseError { reason: "bad toml".to_string() });
        assert_eq!(config_error.category(), "config");
        assert!(!config_error.is_recoverable());
        assert!(!config_error.is_critical());

        let action_error = MonitorError::Action(ActionError::Cancelled);
        assert_eq!(action_error.category(), "remediation");
        assert!(action_error.is_recoverable());

        let audit_error = MonitorError::Audit(AuditError::Open {
            path: PathBuf::from("/nonexistent/audit.log"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        });
        assert_eq!(audit_error.category(), "audit");
        assert!(!audit_error.is_recoverable());
        assert!(audit_error.is_critical());

        let scheduling_error = MonitorError::Scheduling("scheduler stopped".to_string());
        assert_eq!(scheduling_error.category(), "scheduling");
        assert!(!scheduling_error.is_recoverable());
        assert!(scheduling_error.is_critical());
    }

    #[test]
    fn test_probe_error_display() {
        let error = ProbeError::Timeout { endpoint: "/health".to_string(), timeout_ms: 10_000 };
        assert_eq!(error.to_string(), "Endpoint /health timed out after 10000ms");
    }

    #[test]
    fn test_error_conversion() {
        let monitor_error = MonitorError::from("Test error".to_string());
        assert!(matches!(monitor_error, MonitorError::Generic(_)));

        let monitor_error = MonitorError::from("Test error");
        assert!(matches!(monitor_error, MonitorError::Generic(_)));

        let io_error = io::Error::new(io::ErrorKind::Interrupted, "interrupted");
        let monitor_error = MonitorError::from(io_error);
        assert!(monitor_error.is_recoverable());
    }
}
