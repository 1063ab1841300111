//! The monitor object
//!
//! [`Monitor`] wires probe, alert engine, responder, audit log, notifier and
//! metrics together. It is built once at startup and owned by whichever
//! entry point drives it: the service worker, or the CLI for a single pass.
//! Every check is also folded into the health history, and diagnostics
//! passes persist a health report once per report interval.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::actions::ActionContext;
use crate::alert::{Alert, AlertEngine};
use crate::audit::{AuditLog, AuditRecord};
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::health::{HealthHistory, HealthReport, HealthSnapshot, PerformanceSummary};
use crate::metrics::MonitorMetrics;
use crate::notify::NotificationDispatcher;
use crate::probe::{MetricSample, MetricsProbe, ProbeScope, SystemProbe};
use crate::process::{ProcessControl, SystemProcessControl};
use crate::registry::{RemediationRegistry, FILE_STANDARDIZATION, LOG_ROTATION, TEMP_FILE_CLEANUP};
use crate::responder::{ActionAttempt, AttemptOutcome, IncidentResponder, ResolutionOutcome};

/// Audit alert id used for operator-requested cleanup
pub const OPERATOR_CLEANUP: &str = "operator_cleanup";

/// Actions run, in order, by the cleanup trigger
pub const CLEANUP_ACTIONS: [&str; 3] = [TEMP_FILE_CLEANUP, FILE_STANDARDIZATION, LOG_ROTATION];

/// A unit of work the monitor can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Resource probe, alerting and remediation
    RoutineCheck,
    /// Routine check plus services, endpoints and critical files
    Diagnostics,
    /// Temporary file cleanup, permission standardization and log rotation
    Cleanup,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::RoutineCheck => "routine_check",
            WorkKind::Diagnostics => "diagnostics",
            WorkKind::Cleanup => "cleanup",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            WorkKind::RoutineCheck => 0,
            WorkKind::Diagnostics => 1,
            WorkKind::Cleanup => 2,
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a routine check or diagnostics pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub sample: MetricSample,
    pub alerts: Vec<Alert>,
    pub outcomes: Vec<ResolutionOutcome>,
    /// Trend over the recent health history, this check included
    #[serde(default)]
    pub performance: PerformanceSummary,
}

impl CheckReport {
    pub fn healthy(&self) -> bool {
        self.sample.is_healthy() && self.alerts.iter().all(Alert::resolved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub attempts: Vec<ActionAttempt>,
}

/// What a completed work item produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkReport {
    RoutineCheck(CheckReport),
    Diagnostics(CheckReport),
    Cleanup(CleanupReport),
}

impl WorkReport {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkReport::RoutineCheck(_) => WorkKind::RoutineCheck,
            WorkReport::Diagnostics(_) => WorkKind::Diagnostics,
            WorkReport::Cleanup(_) => WorkKind::Cleanup,
        }
    }
}

pub struct Monitor {
    config: MonitorConfig,
    probe: Arc<dyn MetricsProbe>,
    engine: AlertEngine,
    responder: IncidentResponder,
    audit: AuditLog,
    notifier: NotificationDispatcher,
    metrics: MonitorMetrics,
    history: HealthHistory,
    last_report: Option<DateTime<Utc>>,
}

impl Monitor {
    /// Monitor for the local host with the standard remediation set
    pub fn new(config: MonitorConfig, cancel: CancellationToken) -> Result<Self> {
        let process: Arc<dyn ProcessControl> = Arc::new(SystemProcessControl::new());
        let probe = Arc::new(SystemProbe::new(&config, Arc::clone(&process))?);
        Self::with_components(config, probe, process, RemediationRegistry::standard(), cancel)
    }

    pub fn with_components(
        config: MonitorConfig,
        probe: Arc<dyn MetricsProbe>,
        process: Arc<dyn ProcessControl>,
        registry: RemediationRegistry,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let context = ActionContext {
            workspace: config.workspace.clone(),
            cleanup: config.cleanup.clone(),
            services: config.services.clone(),
            process,
        };

        Ok(Self {
            engine: AlertEngine::new(config.scheduling.alert_cooldown()),
            responder: IncidentResponder::new(registry, context, config.scheduling.action_timeout(), cancel),
            audit: AuditLog::new(config.workspace.audit_log_path()),
            notifier: NotificationDispatcher::from_config(&config.notifications),
            metrics: MonitorMetrics::new()?,
            history: HealthHistory::new(config.reports.history_retention()),
            last_report: None,
            probe,
            config,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MonitorMetrics {
        &self.metrics
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn responder(&self) -> &IncidentResponder {
        &self.responder
    }

    pub fn health_history(&self) -> &HealthHistory {
        &self.history
    }

    /// Run one work item to completion
    pub async fn execute(&mut self, kind: WorkKind) -> WorkReport {
        let start = Instant::now();
        let report = match kind {
            WorkKind::RoutineCheck => WorkReport::RoutineCheck(self.routine_check().await),
            WorkKind::Diagnostics => WorkReport::Diagnostics(self.full_diagnostics().await),
            WorkKind::Cleanup => WorkReport::Cleanup(self.cleanup().await),
        };
        let elapsed = start.elapsed();

        self.metrics.record_work(kind.as_str(), elapsed);
        if let Some(path) = &self.config.metrics.textfile_path {
            if let Err(e) = self.metrics.write_textfile(path).await {
                error!(path = %path.display(), error = %e, "Failed to write metrics textfile");
            }
        }

        info!(kind = %kind, duration_ms = elapsed.as_millis() as u64, "Work item completed");
        report
    }

    /// Resource probe, alert evaluation and remediation
    #[instrument(skip(self))]
    pub async fn routine_check(&mut self) -> CheckReport {
        self.check(ProbeScope::Resources).await
    }

    /// Routine check plus service liveness, endpoints and file integrity
    #[instrument(skip(self))]
    pub async fn full_diagnostics(&mut self) -> CheckReport {
        let report = self.check(ProbeScope::Full).await;
        self.save_health_report(report.sample.timestamp).await;
        report
    }

    /// Operator cleanup: temp files, permissions, log rotation
    #[instrument(skip(self))]
    pub async fn cleanup(&mut self) -> CleanupReport {
        let mut attempts = Vec::with_capacity(CLEANUP_ACTIONS.len());

        for action_id in CLEANUP_ACTIONS {
            let start = Instant::now();
            let outcome = match self.responder.run_operator_action(action_id).await {
                Ok(report) => AttemptOutcome::Succeeded { summary: report.summary },
                Err(e) => AttemptOutcome::Failed { error: e.to_string() },
            };
            let attempt = ActionAttempt { action_id: action_id.to_string(), outcome, duration: start.elapsed() };
            self.metrics.record_attempt(&attempt);
            self.append_audit(&AuditRecord::attempt(OPERATOR_CLEANUP, &attempt)).await;
            attempts.push(attempt);
        }

        CleanupReport { attempts }
    }

    async fn check(&mut self, scope: ProbeScope) -> CheckReport {
        let sample = self.probe.sample(scope).await;
        self.metrics.record_sample(&sample);

        let mut alerts = self.engine.evaluate(&sample, &self.config.thresholds);
        let mut outcomes = Vec::new();

        for alert in &mut alerts {
            self.metrics.record_alert(alert);
            // Delivery runs detached; the handles are not awaited
            drop(self.notifier.dispatch(alert, &sample));

            if self.config.auto_remediate {
                let outcome = self.responder.respond(alert).await;
                for attempt in &outcome.attempts {
                    self.append_audit(&AuditRecord::attempt(&alert.id, attempt)).await;
                }
                self.metrics.record_outcome(&outcome);
                outcomes.push(outcome);
            }

            self.append_audit(&AuditRecord::alert(alert)).await;
        }

        self.history.record(HealthSnapshot::new(&sample, &alerts));
        let performance = self.history.summary().unwrap_or_default();
        CheckReport { sample, alerts, outcomes, performance }
    }

    /// Persist a health report unless one was saved within the interval
    async fn save_health_report(&mut self, now: DateTime<Utc>) {
        let reports = &self.config.reports;
        if !reports.enabled {
            return;
        }
        let due = self.last_report.map_or(true, |last| {
            (now - last).to_std().map(|elapsed| elapsed >= reports.interval()).unwrap_or(false)
        });
        if !due {
            return;
        }
        let Some(report) = HealthReport::from_history(&self.history, now) else { return };

        let dir = self.config.workspace.resolve(&reports.dir);
        match report.save(&dir).await {
            Ok(_) => self.last_report = Some(now),
            Err(e) => error!(dir = %dir.display(), error = %e, "Failed to save health report"),
        }
    }

    async fn append_audit(&self, record: &AuditRecord) {
        if let Err(e) = self.audit.append(record).await {
            self.metrics.audit_failures.inc();
            error!(path = %self.audit.path().display(), error = %e, "Failed to write audit record");
        }
    }
}
