//! Health history and periodic health reports
//!
//! Every check leaves a [`HealthSnapshot`] in a rolling [`HealthHistory`].
//! Diagnostics passes write a [`HealthReport`] (the latest snapshot plus a
//! [`PerformanceSummary`] over recent history) to the reports directory at
//! most once per report interval.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::alert::Alert;
use crate::error::Result;
use crate::probe::MetricSample;

/// Snapshots considered by [`HealthHistory::summary`]
pub const SUMMARY_WINDOW: usize = 10;

/// Endpoint latency above which the performance score starts to drop
const SLOW_LATENCY_MS: f64 = 2000.0;

/// One check, reduced to what the history keeps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub score: f64,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub uptime_seconds: Option<u64>,
    pub endpoint_health_percent: Option<f64>,
    pub p95_latency_ms: Option<u64>,
    /// Incident type of every alert raised by the check
    pub alerts: Vec<String>,
}

impl HealthSnapshot {
    pub fn new(sample: &MetricSample, alerts: &[Alert]) -> Self {
        Self {
            timestamp: sample.timestamp,
            healthy: sample.is_healthy() && alerts.iter().all(Alert::resolved),
            score: performance_score(sample),
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            disk_percent: sample.disk_percent,
            uptime_seconds: sample.uptime_seconds,
            endpoint_health_percent: sample.endpoint_health_percent(),
            p95_latency_ms: sample.p95_latency_ms(),
            alerts: alerts.iter().map(|alert| alert.incident_type.to_string()).collect(),
        }
    }
}

/// Score in `0..=100`; slow endpoints, failed endpoints and resource
/// pressure each take points off
pub fn performance_score(sample: &MetricSample) -> f64 {
    let mut score = 100.0;

    for status in sample.endpoints.values().filter(|status| status.healthy) {
        let latency = status.latency_ms as f64;
        if latency > SLOW_LATENCY_MS {
            score -= ((latency - SLOW_LATENCY_MS) / 100.0).min(20.0);
        }
    }

    if let Some(health) = sample.endpoint_health_percent() {
        score -= (100.0 - health) * 2.0;
    }
    if let Some(cpu) = sample.cpu_percent.filter(|cpu| *cpu > 70.0) {
        score -= (cpu - 70.0) / 2.0;
    }
    if let Some(memory) = sample.memory_percent.filter(|memory| *memory > 80.0) {
        score -= (memory - 80.0) / 2.0;
    }

    score.clamp(0.0, 100.0)
}

/// Trend over the most recent snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub snapshots_analyzed: usize,
    pub current_score: f64,
    pub average_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub healthy_share_percent: f64,
    pub total_alerts: usize,
    pub alert_types: BTreeMap<String, usize>,
}

/// Snapshots from the retention window, oldest first
#[derive(Debug, Clone)]
pub struct HealthHistory {
    retention: Duration,
    snapshots: VecDeque<HealthSnapshot>,
}

impl HealthHistory {
    pub fn new(retention: Duration) -> Self {
        Self { retention, snapshots: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest(&self) -> Option<&HealthSnapshot> {
        self.snapshots.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HealthSnapshot> {
        self.snapshots.iter()
    }

    /// Add a snapshot and drop those older than the retention window,
    /// measured from the newest snapshot
    pub fn record(&mut self, snapshot: HealthSnapshot) {
        let cutoff = snapshot.timestamp - self.retention;
        self.snapshots.push_back(snapshot);
        self.snapshots.retain(|kept| kept.timestamp > cutoff);
    }

    pub fn summary(&self) -> Option<PerformanceSummary> {
        let recent: Vec<&HealthSnapshot> = self.snapshots.iter().rev().take(SUMMARY_WINDOW).rev().collect();
        let current = recent.last()?;

        let scores: Vec<f64> = recent.iter().map(|snapshot| snapshot.score).collect();
        let mut alert_types = BTreeMap::new();
        for incident_type in recent.iter().flat_map(|snapshot| &snapshot.alerts) {
            *alert_types.entry(incident_type.clone()).or_insert(0) += 1;
        }
        let healthy = recent.iter().filter(|snapshot| snapshot.healthy).count();

        Some(PerformanceSummary {
            snapshots_analyzed: recent.len(),
            current_score: current.score,
            average_score: scores.iter().sum::<f64>() / scores.len() as f64,
            min_score: scores.iter().copied().fold(f64::INFINITY, f64::min),
            max_score: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            healthy_share_percent: healthy as f64 * 100.0 / recent.len() as f64,
            total_alerts: alert_types.values().sum(),
            alert_types,
        })
    }
}

/// Document written to the reports directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub snapshot: HealthSnapshot,
    pub summary: PerformanceSummary,
}

impl HealthReport {
    pub fn from_history(history: &HealthHistory, generated_at: DateTime<Utc>) -> Option<Self> {
        Some(Self { generated_at, snapshot: history.latest()?.clone(), summary: history.summary()? })
    }

    /// Write as `health_report_<YYYYmmdd_HHMMSS>.json` under `dir`
    pub async fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("health_report_{}.json", self.generated_at.format("%Y%m%d_%H%M%S")));
        fs::write(&path, serde_json::to_vec_pretty(self)?).await?;

        info!(path = %path.display(), score = self.snapshot.score, "Health report saved");
        Ok(path)
    }
}
