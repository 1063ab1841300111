//! Self-metrics for the monitor
//!
//! Counters and gauges describing what the monitor itself observed and did,
//! exported in the Prometheus text format. When a textfile path is
//! configured the exposition is rewritten after every work item so a node
//! exporter can pick it up.

use std::path::{Path, PathBuf};
use std::time::Duration;

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::alert::Alert;
use crate::error::Result;
use crate::probe::MetricSample;
use crate::responder::{ActionAttempt, ResolutionOutcome};

#[derive(Clone)]
pub struct MonitorMetrics {
    registry: Registry,

    pub work_items: IntCounterVec,
    pub work_duration: Histogram,
    pub alerts_raised: IntCounterVec,
    pub remediation_attempts: IntCounterVec,
    pub alerts_unresolved: IntCounter,
    pub probe_failures: IntCounter,
    pub audit_failures: IntCounter,

    pub cpu_percent: Gauge,
    pub memory_percent: Gauge,
    pub disk_percent: Gauge,
}

impl MonitorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("agent_monitor".to_string()), None)?;

        let work_items = IntCounterVec::new(Opts::new("work_items_total", "Work items executed by kind"), &["kind"])?;
        registry.register(Box::new(work_items.clone()))?;

        let work_duration = Histogram::with_opts(
            HistogramOpts::new("work_duration_seconds", "Duration of a work item")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]),
        )?;
        registry.register(Box::new(work_duration.clone()))?;

        let alerts_raised = IntCounterVec::new(
            Opts::new("alerts_raised_total", "Alerts surfaced after cooldown filtering"),
            &["incident_type", "level"],
        )?;
        registry.register(Box::new(alerts_raised.clone()))?;

        let remediation_attempts = IntCounterVec::new(
            Opts::new("remediation_attempts_total", "Remediation attempts by action and outcome"),
            &["action_id", "outcome"],
        )?;
        registry.register(Box::new(remediation_attempts.clone()))?;

        let alerts_unresolved = IntCounter::new("alerts_unresolved_total", "Alerts left for manual attention")?;
        registry.register(Box::new(alerts_unresolved.clone()))?;

        let probe_failures = IntCounter::new("probe_failures_total", "Probe sub-checks that failed")?;
        registry.register(Box::new(probe_failures.clone()))?;

        let audit_failures = IntCounter::new("audit_failures_total", "Audit records that could not be written")?;
        registry.register(Box::new(audit_failures.clone()))?;

        let cpu_percent = Gauge::new("cpu_percent", "Last sampled CPU usage")?;
        registry.register(Box::new(cpu_percent.clone()))?;

        let memory_percent = Gauge::new("memory_percent", "Last sampled memory usage")?;
        registry.register(Box::new(memory_percent.clone()))?;

        let disk_percent = Gauge::new("disk_percent", "Last sampled disk usage")?;
        registry.register(Box::new(disk_percent.clone()))?;

        Ok(Self {
            registry,
            work_items,
            work_duration,
            alerts_raised,
            remediation_attempts,
            alerts_unresolved,
            probe_failures,
            audit_failures,
            cpu_percent,
            memory_percent,
            disk_percent,
        })
    }

    pub fn record_work(&self, kind: &str, duration: Duration) {
        self.work_items.with_label_values(&[kind]).inc();
        self.work_duration.observe(duration.as_secs_f64());
    }

    pub fn record_sample(&self, sample: &MetricSample) {
        for (gauge, reading) in [
            (&self.cpu_percent, sample.cpu_percent),
            (&self.memory_percent, sample.memory_percent),
            (&self.disk_percent, sample.disk_percent),
        ] {
            if let Some(value) = reading {
                gauge.set(value);
            }
        }
        self.probe_failures.inc_by(sample.probe_errors.len() as u64);
    }

    pub fn record_alert(&self, alert: &Alert) {
        self.alerts_raised
            .with_label_values(&[alert.incident_type.as_str(), alert.level.as_str()])
            .inc();
    }

    pub fn record_attempt(&self, attempt: &ActionAttempt) {
        self.remediation_attempts
            .with_label_values(&[attempt.action_id.as_str(), attempt.outcome.as_str()])
            .inc();
    }

    pub fn record_outcome(&self, outcome: &ResolutionOutcome) {
        for attempt in &outcome.attempts {
            self.record_attempt(attempt);
        }
        if !outcome.resolved {
            self.alerts_unresolved.inc();
        }
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Atomically replace the textfile at `path`
    pub async fn write_textfile(&self, path: &Path) -> Result<()> {
        let content = self.render()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = staging_path(path);
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
