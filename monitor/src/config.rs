//! Configuration management for the platform monitor
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files and `AGENT_MONITOR_*` environment variables. Every
//! section has defaults, so a partial file (or none at all) is valid.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::alert::Thresholds;
use crate::error::{ConfigError, ConfigResult};
use crate::integrity::CriticalFile;

const ENV_PREFIX: &str = "AGENT_MONITOR_";

/// Main configuration structure for the monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Workspace layout and critical files
    pub workspace: WorkspaceConfig,

    /// Alert thresholds
    pub thresholds: Thresholds,

    /// Timing of checks, cooldowns and action timeouts
    pub scheduling: SchedulingConfig,

    /// Endpoint and resource probe settings
    pub probe: ProbeConfig,

    /// Services whose liveness is checked and restarted
    pub services: Vec<ServiceConfig>,

    /// Cleanup and rotation limits
    pub cleanup: CleanupConfig,

    /// Alert notification channels
    pub notifications: NotificationConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics export configuration
    pub metrics: MetricsConfig,

    /// Health history and saved health reports
    pub reports: ReportsConfig,

    /// Run remediation actions automatically when alerts are raised
    pub auto_remediate: bool,
}

/// Workspace related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root of the monitored workspace
    pub root: PathBuf,

    /// Directory holding rotated logs, relative to the root unless absolute
    pub log_dir: PathBuf,

    /// Audit log file, relative to the root unless absolute
    pub audit_log_path: PathBuf,

    /// Files verified during diagnostics
    pub critical_files: Vec<CriticalFile>,

    /// Directory names never descended into by workspace walks
    pub exclude_dirs: Vec<String>,

    /// Glob-style patterns removed by temporary file cleanup
    pub temp_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Interval between routine checks in seconds
    pub check_interval_secs: u64,

    /// Window during which a repeated alert is suppressed
    pub alert_cooldown_secs: u64,

    /// Upper bound on a single remediation action
    pub action_timeout_secs: u64,

    /// Gap between the two CPU readings of a sample
    pub cpu_sample_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Base URL prepended to every endpoint
    pub base_url: String,

    /// Endpoint paths probed during diagnostics
    pub endpoints: Vec<String>,

    /// Per-endpoint request timeout
    pub endpoint_timeout_ms: u64,

    /// Any path on the filesystem whose usage is reported
    pub disk_path: PathBuf,
}

/// A monitored service process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Substring matched against the process name or command line
    pub match_pattern: String,

    /// Program and arguments used to start the service
    #[serde(default)]
    pub restart_command: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Directories whose stale top-level files are deleted on low disk
    pub temp_dirs: Vec<PathBuf>,

    /// Minimum age before a temporary file is removed
    pub max_temp_age_hours: u64,

    /// Size above which a log file is rotated
    pub log_rotation_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub email: EmailConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub recipients: Vec<String>,
    /// Use implicit TLS (`smtps://`) instead of STARTTLS
    pub use_tls: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Emit JSON formatted logs
    pub json: bool,

    /// Optional file receiving a copy of the log output
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus textfile written after every work item
    pub textfile_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportsConfig {
    /// Write health reports after diagnostics passes
    pub enabled: bool,

    /// Report directory, relative to the workspace root unless absolute
    pub dir: PathBuf,

    /// Minimum gap between two saved reports
    pub interval_secs: u64,

    /// How long snapshots stay in the health history
    pub history_hours: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig::default(),
            thresholds: Thresholds::default(),
            scheduling: SchedulingConfig::default(),
            probe: ProbeConfig::default(),
            services: Vec::new(),
            cleanup: CleanupConfig::default(),
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            reports: ReportsConfig::default(),
            auto_remediate: true,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            log_dir: PathBuf::from("logs"),
            audit_log_path: PathBuf::from("logs/platform_monitoring.log"),
            critical_files: Vec::new(),
            exclude_dirs: [".git", "node_modules", "venv", ".venv", "target"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            temp_patterns: ["*.tmp", "*.temp", "*.log.old", "*.bak", "__pycache__", "*.pyc"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            alert_cooldown_secs: 300,
            action_timeout_secs: 180,
            cpu_sample_window_ms: 1000,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            endpoints: Vec::new(),
            endpoint_timeout_ms: 10_000,
            disk_path: PathBuf::from("/"),
        }
    }
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("reports"),
            interval_secs: 3600,
            history_hours: 24,
        }
    }
}

impl ReportsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.history_hours.min(i32::MAX as u64) as i64)
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        let mut temp_dirs = vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")];
        if let Some(cache) = dirs::cache_dir() {
            temp_dirs.push(cache);
        }
        Self {
            temp_dirs,
            max_temp_age_hours: 24,
            log_rotation_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            username: String::new(),
            password: String::new(),
            recipients: Vec::new(),
            use_tls: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_path: None,
        }
    }
}

impl WorkspaceConfig {
    /// Resolve a configured path against the workspace root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.log_dir)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.resolve(&self.audit_log_path)
    }
}

impl SchedulingConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn cpu_sample_window(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_window_ms)
    }
}

impl MonitorConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => ConfigError::PermissionDenied {
                path: path.to_string_lossy().to_string(),
            },
            _ => ConfigError::FileNotFound { path: path.to_string_lossy().to_string() },
        })?;

        let mut config: MonitorConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError { reason: e.to_string() })?;

        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults plus environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = MonitorConfig::default();
        config.apply_env()?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback order: file -> defaults, then env overrides
    pub fn load_with_fallback<P: AsRef<Path>>(config_path: Option<P>) -> ConfigResult<Self> {
        let mut config = match config_path {
            Some(path) if path.as_ref().exists() => MonitorConfig::from_file(path)?,
            _ => MonitorConfig::default(),
        };

        config.apply_env()?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    /// Override individual fields from `AGENT_MONITOR_*` variables
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        if let Some(root) = env_var("WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(root);
        }

        if let Some(interval) = env_var("CHECK_INTERVAL_SECS") {
            self.scheduling.check_interval_secs = parse_env("CHECK_INTERVAL_SECS", interval)?;
        }

        if let Some(cooldown) = env_var("ALERT_COOLDOWN_SECS") {
            self.scheduling.alert_cooldown_secs = parse_env("ALERT_COOLDOWN_SECS", cooldown)?;
        }

        if let Some(base_url) = env_var("BASE_URL") {
            self.probe.base_url = base_url;
        }

        if let Some(url) = env_var("WEBHOOK_URL") {
            self.notifications.webhook.url = url;
            self.notifications.webhook.enabled = true;
        }

        if let Some(auto) = env_var("AUTO_REMEDIATE") {
            self.auto_remediate = parse_env("AUTO_REMEDIATE", auto)?;
        }

        if let Some(log_level) = env_var("LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Repair zero durations that would stall the scheduler or every action
    pub fn sanitize(&mut self) {
        let defaults = SchedulingConfig::default();
        let scheduling = &mut self.scheduling;

        for (field, value, default) in [
            ("scheduling.check_interval_secs", &mut scheduling.check_interval_secs, defaults.check_interval_secs),
            ("scheduling.action_timeout_secs", &mut scheduling.action_timeout_secs, defaults.action_timeout_secs),
        ] {
            if *value == 0 {
                warn!(field, default, "Zero duration configured, using default");
                *value = default;
            }
        }

        if self.probe.endpoint_timeout_ms == 0 {
            warn!(field = "probe.endpoint_timeout_ms", default = 10_000u64, "Zero duration configured, using default");
            self.probe.endpoint_timeout_ms = ProbeConfig::default().endpoint_timeout_ms;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(ConfigError::ValidationFailed {
                    reason: "service name must not be empty".to_string(),
                });
            }
            if service.match_pattern.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("services.{}.match_pattern", service.name),
                    value: service.match_pattern.clone(),
                });
            }
        }

        if !self.probe.endpoints.is_empty() && reqwest::Url::parse(&self.probe.base_url).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "probe.base_url".to_string(),
                value: self.probe.base_url.clone(),
            });
        }

        if self.notifications.webhook.enabled && self.notifications.webhook.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "notifications.webhook.url".to_string(),
                value: String::new(),
            });
        }

        if self.cleanup.log_rotation_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cleanup.log_rotation_bytes".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("agent-monitor").join("monitor.toml"))
            .ok_or_else(|| ConfigError::ValidationFailed {
                reason: "Unable to determine config directory".to_string(),
            })
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| ConfigError::ValidationFailed {
                reason: format!("Unable to create config directory: {}", parent.display()),
            })?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationFailed { reason: e.to_string() })?;

        fs::write(path, content).map_err(|_| ConfigError::PermissionDenied {
            path: path.to_string_lossy().to_string(),
        })?;

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str, value: String) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: format!("{ENV_PREFIX}{name}"),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.auto_remediate);
        assert_eq!(config.scheduling.check_interval_secs, 300);
        assert_eq!(config.cleanup.log_rotation_bytes, 10 * 1024 * 1024);
        assert!(config.workspace.exclude_dirs.contains(&".git".to_string()));
        assert!(config.reports.enabled);
        assert_eq!(config.reports.history_retention(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(
            temp_file.path(),
            r#"
            auto_remediate = false

            [workspace]
            root = "/srv/agent"

            [thresholds]
            disk_percent = 70
            cpu_percent = 400

            [[services]]
            name = "knowledge_server"
            match_pattern = "knowledge_server.py"
            restart_command = ["python3", "knowledge_server.py"]
            "#,
        )
        .unwrap();

        let config = MonitorConfig::from_file(temp_file.path()).unwrap();
        assert!(!config.auto_remediate);
        assert_eq!(config.workspace.root, PathBuf::from("/srv/agent"));
        assert_eq!(config.workspace.audit_log_path(), PathBuf::from("/srv/agent/logs/platform_monitoring.log"));
        assert_eq!(config.thresholds.disk_percent, 70.0);
        assert_eq!(config.thresholds.cpu_percent, 95.0);
        assert_eq!(config.thresholds.memory_percent, 90.0);
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].working_dir, None);
    }

    #[test]
    fn test_sanitize_repairs_zero_durations() {
        let mut config = MonitorConfig::default();
        config.scheduling.check_interval_secs = 0;
        config.scheduling.action_timeout_secs = 0;
        config.probe.endpoint_timeout_ms = 0;

        config.sanitize();
        assert_eq!(config.scheduling.check_interval_secs, 300);
        assert_eq!(config.scheduling.action_timeout_secs, 180);
        assert_eq!(config.probe.endpoint_timeout_ms, 10_000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = MonitorConfig::default();
        config.services.push(ServiceConfig {
            name: "api".to_string(),
            match_pattern: " ".to_string(),
            restart_command: Vec::new(),
            working_dir: None,
        });
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.notifications.webhook.enabled = true;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.probe.endpoints = vec!["/health".to_string()];
        config.probe.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let config = MonitorConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        assert!(config.save_to_file(temp_file.path()).is_ok());

        let loaded = MonitorConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.scheduling.alert_cooldown_secs, loaded.scheduling.alert_cooldown_secs);
        assert_eq!(config.thresholds, loaded.thresholds);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[workspace\nroot = ").unwrap();
        assert!(matches!(
            MonitorConfig::from_file(temp_file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
