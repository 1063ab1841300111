//! Append-only audit log
//!
//! One JSON object per line. The file is only ever opened in append mode;
//! existing records are never rewritten.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::alert::{Alert, AlertLevel, IncidentType};
use crate::error::{AuditError, AuditResult};
use crate::responder::ActionAttempt;

/// A single audit log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditRecord {
    MonitoringAlert {
        timestamp: DateTime<Utc>,
        alert_id: String,
        level: AlertLevel,
        incident_type: IncidentType,
        description: String,
        metrics: Map<String, Value>,
        auto_resolved: bool,
        resolution_action: Option<String>,
    },
    RemediationAttempt {
        timestamp: DateTime<Utc>,
        alert_id: String,
        action_id: String,
        outcome: String,
        detail: Option<String>,
        duration_ms: u64,
    },
}

impl AuditRecord {
    pub fn alert(alert: &Alert) -> Self {
        AuditRecord::MonitoringAlert {
            timestamp: alert.timestamp,
            alert_id: alert.id.clone(),
            level: alert.level,
            incident_type: alert.incident_type,
            description: alert.description.clone(),
            metrics: alert.metrics.clone(),
            auto_resolved: alert.resolved(),
            resolution_action: alert.resolution_action().map(str::to_string),
        }
    }

    pub fn attempt(alert_id: &str, attempt: &ActionAttempt) -> Self {
        AuditRecord::RemediationAttempt {
            timestamp: Utc::now(),
            alert_id: alert_id.to_string(),
            action_id: attempt.action_id.clone(),
            outcome: attempt.outcome.as_str().to_string(),
            detail: attempt.outcome.detail().map(str::to_string),
            duration_ms: attempt.duration.as_millis() as u64,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditRecord::MonitoringAlert { timestamp, .. } | AuditRecord::RemediationAttempt { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

/// Counts over the alert records in the log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub total_alerts: usize,
    pub alerts_last_24h: usize,
    pub critical_last_24h: usize,
    pub auto_resolved_last_24h: usize,
    pub remediation_attempts: usize,
    pub last_alert: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line
    pub async fn append(&self, record: &AuditRecord) -> AuditResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| AuditError::Open { path: parent.to_path_buf(), source })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| AuditError::Open { path: self.path.clone(), source })?;

        file.write_all(line.as_bytes())
            .await
            .map_err(|source| AuditError::Write { path: self.path.clone(), source })?;
        file.flush().await.map_err(|source| AuditError::Write { path: self.path.clone(), source })?;

        debug!(path = %self.path.display(), "Audit record appended");
        Ok(())
    }

    /// Read every parseable record; malformed lines are skipped
    pub async fn read_all(&self) -> AuditResult<Vec<AuditRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(AuditError::Open { path: self.path.clone(), source }),
        };

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed audit record"),
            }
        }
        Ok(records)
    }

    /// The last `limit` records, oldest first
    pub async fn tail(&self, limit: usize) -> AuditResult<Vec<AuditRecord>> {
        let mut records = self.read_all().await?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }

    /// Status view relative to `now`
    pub async fn summary(&self, now: DateTime<Utc>) -> AuditResult<AuditSummary> {
        let records = self.read_all().await?;
        let since = now - Duration::hours(24);
        let mut summary = AuditSummary::default();

        for record in &records {
            match record {
                AuditRecord::MonitoringAlert { timestamp, level, auto_resolved, .. } => {
                    summary.total_alerts += 1;
                    summary.last_alert = summary.last_alert.max(Some(*timestamp));
                    if *timestamp >= since {
                        summary.alerts_last_24h += 1;
                        if *level == AlertLevel::Critical {
                            summary.critical_last_24h += 1;
                        }
                        if *auto_resolved {
                            summary.auto_resolved_last_24h += 1;
                        }
                    }
                }
                AuditRecord::RemediationAttempt { .. } => summary.remediation_attempts += 1,
            }
        }
        Ok(summary)
    }
}
