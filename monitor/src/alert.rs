//! Threshold evaluation and alert deduplication
//!
//! The [`AlertEngine`] turns a [`MetricSample`] into typed [`Alert`]s. Each
//! (incident type, level) pair is rate limited by a cooldown window measured
//! on sample timestamps, so replaying the same samples yields the same alerts.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::probe::MetricSample;

pub const DEFAULT_CPU_PERCENT: f64 = 95.0;
pub const DEFAULT_MEMORY_PERCENT: f64 = 90.0;
pub const DEFAULT_DISK_PERCENT: f64 = 85.0;
pub const DEFAULT_ENDPOINT_HEALTH_PERCENT: f64 = 80.0;
pub const DEFAULT_RESPONSE_TIME_MS: f64 = 5000.0;

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of monitored problem categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    DiskSpace,
    MemoryPressure,
    CpuOverload,
    ServiceDown,
    FileCorruption,
    SecurityBreach,
    ComplianceViolation,
    PerformanceDegradation,
}

impl IncidentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::DiskSpace => "disk_space",
            IncidentType::MemoryPressure => "memory_pressure",
            IncidentType::CpuOverload => "cpu_overload",
            IncidentType::ServiceDown => "service_down",
            IncidentType::FileCorruption => "file_corruption",
            IncidentType::SecurityBreach => "security_breach",
            IncidentType::ComplianceViolation => "compliance_violation",
            IncidentType::PerformanceDegradation => "performance_degradation",
        }
    }
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected threshold crossing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub incident_type: IncidentType,
    pub description: String,
    /// Metric values that triggered the alert
    pub metrics: Map<String, Value>,
    resolved: bool,
    resolution_action: Option<String>,
}

impl Alert {
    pub fn new(
        incident_type: IncidentType,
        level: AlertLevel,
        description: impl Into<String>,
        metrics: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{}_{}_{}", incident_type, level, timestamp.timestamp_millis()),
            timestamp,
            level,
            incident_type,
            description: description.into(),
            metrics,
            resolved: false,
            resolution_action: None,
        }
    }

    pub fn resolved(&self) -> bool {
        self.resolved
    }

    pub fn resolution_action(&self) -> Option<&str> {
        self.resolution_action.as_deref()
    }

    /// Record a successful remediation. Returns `false` if the alert was
    /// already resolved, leaving the first resolution in place.
    pub fn mark_resolved(&mut self, action_id: &str) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.resolution_action = Some(action_id.to_string());
        true
    }
}

/// Limits that trigger alerts
///
/// Percentages outside `1..=100`, non-positive latencies and values of the
/// wrong type fall back to their default with a warning instead of failing
/// the whole configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    #[serde(deserialize_with = "lenient::cpu")]
    pub cpu_percent: f64,

    #[serde(deserialize_with = "lenient::memory")]
    pub memory_percent: f64,

    #[serde(deserialize_with = "lenient::disk")]
    pub disk_percent: f64,

    /// Minimum share of healthy endpoints before a service-down alert
    #[serde(deserialize_with = "lenient::endpoint_health")]
    pub endpoint_health_percent: f64,

    /// 95th percentile endpoint latency above which performance is degraded
    #[serde(deserialize_with = "lenient::response_time")]
    pub response_time_ms: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: DEFAULT_CPU_PERCENT,
            memory_percent: DEFAULT_MEMORY_PERCENT,
            disk_percent: DEFAULT_DISK_PERCENT,
            endpoint_health_percent: DEFAULT_ENDPOINT_HEALTH_PERCENT,
            response_time_ms: DEFAULT_RESPONSE_TIME_MS,
        }
    }
}

impl Thresholds {
    /// The percentage limit for a resource incident type
    pub fn limit_for(&self, incident_type: IncidentType) -> Option<f64> {
        match incident_type {
            IncidentType::CpuOverload => Some(self.cpu_percent),
            IncidentType::MemoryPressure => Some(self.memory_percent),
            IncidentType::DiskSpace => Some(self.disk_percent),
            _ => None,
        }
    }
}

mod lenient {
    use super::*;

    fn percent<'de, D>(deserializer: D, field: &'static str, default: f64) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        bounded(deserializer, field, default, 1.0..=100.0)
    }

    fn bounded<'de, D>(
        deserializer: D,
        field: &'static str,
        default: f64,
        range: std::ops::RangeInclusive<f64>,
    ) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = toml::Value::deserialize(deserializer)?;
        let parsed = match &value {
            toml::Value::Integer(i) => Some(*i as f64),
            toml::Value::Float(f) => Some(f.round()),
            toml::Value::String(s) => s.trim().parse::<f64>().ok().map(f64::round),
            _ => None,
        };

        match parsed {
            Some(limit) if range.contains(&limit) => Ok(limit),
            _ => {
                warn!(field, value = %value, default, "Invalid threshold, using default");
                Ok(default)
            }
        }
    }

    pub fn cpu<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        percent(deserializer, "cpu_percent", DEFAULT_CPU_PERCENT)
    }

    pub fn memory<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        percent(deserializer, "memory_percent", DEFAULT_MEMORY_PERCENT)
    }

    pub fn disk<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        percent(deserializer, "disk_percent", DEFAULT_DISK_PERCENT)
    }

    pub fn endpoint_health<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        percent(deserializer, "endpoint_health_percent", DEFAULT_ENDPOINT_HEALTH_PERCENT)
    }

    pub fn response_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        bounded(deserializer, "response_time_ms", DEFAULT_RESPONSE_TIME_MS, 1.0..=f64::MAX)
    }
}

/// Stateful evaluator holding the per-key cooldown map
#[derive(Debug)]
pub struct AlertEngine {
    cooldown: Duration,
    last_raised: HashMap<(IncidentType, AlertLevel), DateTime<Utc>>,
}

impl AlertEngine {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, last_raised: HashMap::new() }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Evaluate a sample, returning the alerts not suppressed by cooldown
    pub fn evaluate(&mut self, sample: &MetricSample, thresholds: &Thresholds) -> Vec<Alert> {
        detect(sample, thresholds)
            .into_iter()
            .filter(|alert| self.admit(alert))
            .inspect(log_alert)
            .collect()
    }

    fn admit(&mut self, alert: &Alert) -> bool {
        let key = (alert.incident_type, alert.level);
        if let Some(last) = self.last_raised.get(&key) {
            // A sample older than the last alert counts as inside the window
            let within_window = match (alert.timestamp - *last).to_std() {
                Ok(elapsed) => elapsed < self.cooldown,
                Err(_) => true,
            };
            if within_window {
                debug!(
                    incident_type = %alert.incident_type,
                    level = %alert.level,
                    "Alert suppressed by cooldown"
                );
                return false;
            }
        }
        self.last_raised.insert(key, alert.timestamp);
        true
    }
}

fn log_alert(alert: &Alert) {
    match alert.level {
        AlertLevel::Error | AlertLevel::Critical => error!(
            alert_id = %alert.id,
            incident_type = %alert.incident_type,
            level = %alert.level,
            "{}", alert.description
        ),
        AlertLevel::Info | AlertLevel::Warning => warn!(
            alert_id = %alert.id,
            incident_type = %alert.incident_type,
            level = %alert.level,
            "{}", alert.description
        ),
    }
}

/// All threshold crossings in a sample, before cooldown filtering
fn detect(sample: &MetricSample, thresholds: &Thresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let ts = sample.timestamp;

    let resource_rules = [
        (sample.cpu_percent, IncidentType::CpuOverload, AlertLevel::Error, "CPU", "cpu_percent"),
        (sample.memory_percent, IncidentType::MemoryPressure, AlertLevel::Critical, "Memory", "memory_percent"),
        (sample.disk_percent, IncidentType::DiskSpace, AlertLevel::Warning, "Disk", "disk_percent"),
    ];
    for (reading, incident_type, level, label, key) in resource_rules {
        let (Some(value), Some(limit)) = (reading, thresholds.limit_for(incident_type)) else {
            continue;
        };
        if value > limit {
            let mut metrics = Map::new();
            metrics.insert(key.to_string(), json!(value));
            metrics.insert("threshold".to_string(), json!(limit));
            alerts.push(Alert::new(
                incident_type,
                level,
                format!("{label} usage at {value:.1}% exceeds {limit:.0}%"),
                metrics,
                ts,
            ));
        }
    }

    if let Some(alert) = service_down(sample, thresholds) {
        alerts.push(alert);
    }
    alerts.extend(slow_responses(sample, thresholds));
    alerts.extend(file_corruption(sample));
    alerts
}

fn slow_responses(sample: &MetricSample, thresholds: &Thresholds) -> Option<Alert> {
    let p95 = sample.p95_latency_ms()?;
    let limit = thresholds.response_time_ms;
    if p95 as f64 <= limit {
        return None;
    }

    let mut metrics = Map::new();
    metrics.insert("p95_latency_ms".to_string(), json!(p95));
    metrics.insert("threshold".to_string(), json!(limit));
    metrics.insert("slow_endpoints".to_string(), json!(sample.slow_endpoints(limit)));

    Some(Alert::new(
        IncidentType::PerformanceDegradation,
        AlertLevel::Warning,
        format!("95th percentile response time {p95}ms exceeds {limit:.0}ms"),
        metrics,
        sample.timestamp,
    ))
}

fn service_down(sample: &MetricSample, thresholds: &Thresholds) -> Option<Alert> {
    let down: Vec<&str> = sample
        .processes
        .iter()
        .filter(|(_, status)| !status.running)
        .map(|(name, _)| name.as_str())
        .collect();

    let endpoint_health = sample.endpoint_health_percent();
    let endpoints_degraded = endpoint_health.is_some_and(|pct| pct < thresholds.endpoint_health_percent);

    if down.is_empty() && !endpoints_degraded {
        return None;
    }

    let unhealthy: Vec<&str> = sample
        .endpoints
        .iter()
        .filter(|(_, status)| !status.healthy)
        .map(|(endpoint, _)| endpoint.as_str())
        .collect();

    let mut parts = Vec::new();
    if !down.is_empty() {
        parts.push(format!("services not running: {}", down.join(", ")));
    }
    if let (true, Some(pct)) = (endpoints_degraded, endpoint_health) {
        parts.push(format!("endpoint health {pct:.0}% below {:.0}%", thresholds.endpoint_health_percent));
    }

    let mut metrics = Map::new();
    metrics.insert("down_services".to_string(), json!(down));
    metrics.insert("unhealthy_endpoints".to_string(), json!(unhealthy));
    metrics.insert("endpoint_health_percent".to_string(), json!(endpoint_health));

    Some(Alert::new(
        IncidentType::ServiceDown,
        AlertLevel::Error,
        format!("Service degraded: {}", parts.join("; ")),
        metrics,
        sample.timestamp,
    ))
}

fn file_corruption(sample: &MetricSample) -> Vec<Alert> {
    let corrupt: Vec<&str> = sample
        .files
        .iter()
        .filter(|(_, state)| state.is_corrupt())
        .map(|(path, _)| path.as_str())
        .collect();
    let empty: Vec<&str> = sample
        .files
        .iter()
        .filter(|(_, state)| state.is_empty_file())
        .map(|(path, _)| path.as_str())
        .collect();

    let mut alerts = Vec::new();
    if !corrupt.is_empty() {
        let mut metrics = Map::new();
        metrics.insert("files".to_string(), json!(corrupt));
        metrics.insert(
            "states".to_string(),
            json!(corrupt.iter().map(|path| (path.to_string(), json!(sample.files[*path]))).collect::<Map<_, _>>()),
        );
        alerts.push(Alert::new(
            IncidentType::FileCorruption,
            AlertLevel::Error,
            format!("Critical files missing or corrupted: {}", corrupt.join(", ")),
            metrics,
            sample.timestamp,
        ));
    }
    if !empty.is_empty() {
        let mut metrics = Map::new();
        metrics.insert("files".to_string(), json!(empty));
        alerts.push(Alert::new(
            IncidentType::FileCorruption,
            AlertLevel::Warning,
            format!("Critical files are empty: {}", empty.join(", ")),
            metrics,
            sample.timestamp,
        ));
    }
    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::FileState;
    use crate::probe::EndpointStatus;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn resources(ts: DateTime<Utc>, cpu: f64, memory: f64, disk: f64) -> MetricSample {
        MetricSample::new(ts).with_cpu(cpu).with_memory(memory).with_disk(disk)
    }

    #[test]
    fn test_cpu_overload_scenario() {
        let mut engine = AlertEngine::new(Duration::from_secs(300));
        let alerts = engine.evaluate(&resources(at(0), 96.0, 50.0, 40.0), &Thresholds::default());

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].incident_type, IncidentType::CpuOverload);
        assert_eq!(alerts[0].level, AlertLevel::Error);
        assert!(!alerts[0].resolved());
        assert_eq!(alerts[0].metrics["cpu_percent"], json!(96.0));
    }

    #[test]
    fn test_memory_cooldown_scenario() {
        let mut engine = AlertEngine::new(Duration::from_secs(300));
        let thresholds = Thresholds::default();

        let first = engine.evaluate(&resources(at(0), 10.0, 95.0, 10.0), &thresholds);
        let second = engine.evaluate(&resources(at(10), 10.0, 95.0, 10.0), &thresholds);

        assert_eq!(first.len() + second.len(), 1);
        assert_eq!(first[0].incident_type, IncidentType::MemoryPressure);
        assert_eq!(first[0].level, AlertLevel::Critical);

        let after_window = engine.evaluate(&resources(at(301), 10.0, 95.0, 10.0), &thresholds);
        assert_eq!(after_window.len(), 1);
    }

    #[test]
    fn test_missing_readings_do_not_alert() {
        let mut engine = AlertEngine::new(Duration::from_secs(300));
        let sample = MetricSample::new(at(0)).with_probe_error("cpu", "unavailable");
        assert!(engine.evaluate(&sample, &Thresholds::default()).is_empty());
    }

    #[test]
    fn test_service_down_aggregation() {
        let mut engine = AlertEngine::new(Duration::from_secs(300));
        let healthy = EndpointStatus { status_code: 200, latency_ms: 3, healthy: true, error: None };
        let failed = EndpointStatus { status_code: 0, latency_ms: 10_000, healthy: false, error: Some("timeout".into()) };

        let sample = MetricSample::new(at(0))
            .with_process("knowledge_server", "knowledge_server.py", false)
            .with_process("worker", "worker.py", false)
            .with_endpoint("/health", healthy.clone())
            .with_endpoint("/status", failed);

        let alerts = engine.evaluate(&sample, &Thresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].incident_type, IncidentType::ServiceDown);
        assert_eq!(alerts[0].metrics["down_services"], json!(["knowledge_server", "worker"]));
        assert_eq!(alerts[0].metrics["endpoint_health_percent"], json!(50.0));

        let mut engine = AlertEngine::new(Duration::from_secs(300));
        let all_up = MetricSample::new(at(0))
            .with_process("worker", "worker.py", true)
            .with_endpoint("/health", healthy);
        assert!(engine.evaluate(&all_up, &Thresholds::default()).is_empty());
    }

    #[test]
    fn test_file_corruption_levels() {
        let mut engine = AlertEngine::new(Duration::from_secs(300));
        let sample = MetricSample::new(at(0))
            .with_file("server.py", FileState::Missing)
            .with_file("agent/base.py", FileState::Empty)
            .with_file("agent/ok.py", FileState::Present { size: 10 });

        let alerts = engine.evaluate(&sample, &Thresholds::default());
        assert_eq!(alerts.len(), 2);
        assert!(alerts
            .iter()
            .all(|alert| alert.incident_type == IncidentType::FileCorruption));
        assert!(alerts.iter().any(|alert| alert.level == AlertLevel::Error));
        assert!(alerts.iter().any(|alert| alert.level == AlertLevel::Warning));
    }

    #[test]
    fn test_mark_resolved_once() {
        let mut alert = Alert::new(IncidentType::DiskSpace, AlertLevel::Warning, "disk", Map::new(), at(0));
        assert_eq!(alert.id, format!("disk_space_warning_{}", at(0).timestamp_millis()));

        assert!(alert.mark_resolved("disk_cleanup"));
        assert!(!alert.mark_resolved("log_rotation"));
        assert!(alert.resolved());
        assert_eq!(alert.resolution_action(), Some("disk_cleanup"));
    }

    #[test]
    fn test_lenient_threshold_parsing() {
        let thresholds: Thresholds = toml::from_str(
            r#"
            cpu_percent = "high"
            memory_percent = 150
            disk_percent = 70.4
            "#,
        )
        .unwrap();

        assert_eq!(thresholds.cpu_percent, DEFAULT_CPU_PERCENT);
        assert_eq!(thresholds.memory_percent, DEFAULT_MEMORY_PERCENT);
        assert_eq!(thresholds.disk_percent, 70.0);
        assert_eq!(thresholds.endpoint_health_percent, DEFAULT_ENDPOINT_HEALTH_PERCENT);
        assert_eq!(thresholds.response_time_ms, DEFAULT_RESPONSE_TIME_MS);

        let thresholds: Thresholds = toml::from_str("response_time_ms = -5").unwrap();
        assert_eq!(thresholds.response_time_ms, DEFAULT_RESPONSE_TIME_MS);
        let thresholds: Thresholds = toml::from_str("response_time_ms = 1500").unwrap();
        assert_eq!(thresholds.response_time_ms, 1500.0);
    }

    #[test]
    fn test_slow_endpoints_degrade_performance() {
        let mut engine = AlertEngine::new(Duration::from_secs(300));
        let thresholds = Thresholds { response_time_ms: 1000.0, ..Thresholds::default() };
        let answered = |latency_ms| EndpointStatus { status_code: 200, latency_ms, healthy: true, error: None };

        let fast = MetricSample::new(at(0)).with_endpoint("/health", answered(40)).with_endpoint("/agents", answered(900));
        assert!(engine.evaluate(&fast, &thresholds).is_empty());

        let slow = MetricSample::new(at(1)).with_endpoint("/health", answered(40)).with_endpoint("/agents", answered(2400));
        let alerts = engine.evaluate(&slow, &thresholds);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].incident_type, IncidentType::PerformanceDegradation);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[0].metrics["p95_latency_ms"], json!(2400));
        assert_eq!(alerts[0].metrics["slow_endpoints"], json!(["/agents"]));
    }

    proptest! {
        #[test]
        fn disk_over_threshold_alerts_once(disk in 0.0f64..100.0, limit in 1u8..=100) {
            let thresholds = Thresholds { disk_percent: limit as f64, ..Thresholds::default() };
            let mut engine = AlertEngine::new(Duration::from_secs(300));
            let alerts = engine.evaluate(&resources(at(0), 0.0, 0.0, disk), &thresholds);

            let disk_alerts = alerts.iter().filter(|a| a.incident_type == IncidentType::DiskSpace).count();
            prop_assert_eq!(disk_alerts, usize::from(disk > limit as f64));
        }

        #[test]
        fn cooldown_allows_at_most_one(gap in 0i64..300, memory in 91.0f64..100.0) {
            let mut engine = AlertEngine::new(Duration::from_secs(300));
            let thresholds = Thresholds::default();
            let first = engine.evaluate(&resources(at(0), 0.0, memory, 0.0), &thresholds);
            let second = engine.evaluate(&resources(at(gap), 0.0, memory, 0.0), &thresholds);
            prop_assert_eq!(first.len() + second.len(), 1);
        }
    }
}
