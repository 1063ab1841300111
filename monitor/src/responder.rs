//! Incident response
//!
//! The responder walks the registry's candidates for an alert, most specific
//! first, and stops at the first action that succeeds. It owns the only
//! mutable per-action state: when each action last ran and how many failed
//! attempts it has left. A spent budget refills after the action has rested
//! for `cooldown * max_retries` since its last run.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionContext, ActionReport};
use crate::alert::Alert;
use crate::error::{ActionError, ActionResult};
use crate::registry::{RemediationAction, RemediationRegistry};

/// Result of one candidate action for an alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded { summary: String },
    Failed { error: String },
    SkippedCoolingDown,
    SkippedExhausted,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded { .. } => "succeeded",
            AttemptOutcome::Failed { .. } => "failed",
            AttemptOutcome::SkippedCoolingDown => "skipped_cooling_down",
            AttemptOutcome::SkippedExhausted => "skipped_exhausted",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Succeeded { summary } => Some(summary),
            AttemptOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAttempt {
    pub action_id: String,
    pub outcome: AttemptOutcome,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

/// Everything the responder did for one alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub alert_id: String,
    pub resolved: bool,
    pub resolution_action: Option<String>,
    pub attempts: Vec<ActionAttempt>,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    last_executed: Option<DateTime<Utc>>,
    remaining_retries: u32,
}

pub struct IncidentResponder {
    registry: RemediationRegistry,
    context: ActionContext,
    action_timeout: Duration,
    cancel: CancellationToken,
    ledger: HashMap<String, LedgerEntry>,
}

impl IncidentResponder {
    pub fn new(
        registry: RemediationRegistry,
        context: ActionContext,
        action_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { registry, context, action_timeout, cancel, ledger: HashMap::new() }
    }

    pub fn registry(&self) -> &RemediationRegistry {
        &self.registry
    }

    /// Retries left for `action_id` before it is skipped as exhausted
    pub fn remaining_retries(&self, action_id: &str) -> Option<u32> {
        match self.ledger.get(action_id) {
            Some(entry) => Some(entry.remaining_retries),
            None => self.registry.get(action_id).map(|action| action.max_retries),
        }
    }

    /// Try each applicable action until one succeeds
    pub async fn respond(&mut self, alert: &mut Alert) -> ResolutionOutcome {
        let candidates: Vec<RemediationAction> =
            self.registry.lookup(alert.incident_type).into_iter().cloned().collect();
        let mut attempts = Vec::with_capacity(candidates.len());

        if candidates.is_empty() {
            debug!(alert_id = %alert.id, incident_type = %alert.incident_type, "No remediation registered");
        }

        for action in &candidates {
            let now = Utc::now();
            let entry = self.entry(action);

            if let Some(last) = entry.last_executed {
                let cooling = (now - last).to_std().map(|elapsed| elapsed < action.cooldown).unwrap_or(true);
                if cooling {
                    debug!(action_id = %action.id, "Remediation cooling down");
                    attempts.push(skipped(action, AttemptOutcome::SkippedCoolingDown));
                    continue;
                }
            }
            if entry.remaining_retries == 0 {
                // An exhausted action rests for one cooldown per spent retry
                let rest = action.cooldown.saturating_mul(action.max_retries);
                let rested = entry
                    .last_executed
                    .map_or(true, |last| (now - last).to_std().map(|elapsed| elapsed >= rest).unwrap_or(false));
                if !rested || action.max_retries == 0 {
                    warn!(action_id = %action.id, "Remediation retry budget exhausted");
                    attempts.push(skipped(action, AttemptOutcome::SkippedExhausted));
                    continue;
                }
                info!(action_id = %action.id, retries = action.max_retries, "Remediation retry budget refilled");
                entry.remaining_retries = action.max_retries;
            }

            entry.last_executed = Some(now);
            let start = Instant::now();
            let result = self.execute(action).await;
            let duration = start.elapsed();

            match result {
                Ok(report) => {
                    self.entry(action).remaining_retries = action.max_retries;
                    alert.mark_resolved(&action.id);
                    info!(
                        alert_id = %alert.id,
                        action_id = %action.id,
                        duration_ms = duration.as_millis() as u64,
                        "Alert resolved: {}", report.summary
                    );
                    attempts.push(ActionAttempt {
                        action_id: action.id.clone(),
                        outcome: AttemptOutcome::Succeeded { summary: report.summary },
                        duration,
                    });
                    break;
                }
                Err(e) => {
                    let entry = self.entry(action);
                    entry.remaining_retries = entry.remaining_retries.saturating_sub(1);
                    error!(
                        alert_id = %alert.id,
                        action_id = %action.id,
                        remaining_retries = entry.remaining_retries,
                        error = %e,
                        "Remediation failed"
                    );
                    attempts.push(ActionAttempt {
                        action_id: action.id.clone(),
                        outcome: AttemptOutcome::Failed { error: e.to_string() },
                        duration,
                    });
                }
            }
        }

        if !alert.resolved() {
            warn!(
                alert_id = %alert.id,
                incident_type = %alert.incident_type,
                "Alert requires manual attention"
            );
        }

        ResolutionOutcome {
            alert_id: alert.id.clone(),
            resolved: alert.resolved(),
            resolution_action: alert.resolution_action().map(str::to_string),
            attempts,
        }
    }

    /// Run one action on operator request, ignoring its cooldown
    pub async fn run_operator_action(&mut self, action_id: &str) -> ActionResult<ActionReport> {
        let action = self
            .registry
            .get(action_id)
            .cloned()
            .ok_or_else(|| ActionError::UnknownAction { id: action_id.to_string() })?;

        self.entry(&action).last_executed = Some(Utc::now());
        let result = self.execute(&action).await;

        let entry = self.entry(&action);
        match &result {
            Ok(report) => {
                entry.remaining_retries = action.max_retries;
                info!(action_id, "{}", report.summary);
            }
            Err(e) => {
                entry.remaining_retries = entry.remaining_retries.saturating_sub(1);
                error!(action_id, error = %e, "Operator action failed");
            }
        }
        result
    }

    async fn execute(&self, action: &RemediationAction) -> ActionResult<ActionReport> {
        let cancel = self.cancel.child_token();
        info!(action_id = %action.id, name = %action.name, "Executing remediation");

        match tokio::time::timeout(self.action_timeout, action.handler.run(&self.context, cancel.clone())).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(ActionError::TimedOut { action: action.id.clone(), timeout_secs: self.action_timeout.as_secs() })
            }
        }
    }

    fn entry(&mut self, action: &RemediationAction) -> &mut LedgerEntry {
        self.ledger
            .entry(action.id.clone())
            .or_insert_with(|| LedgerEntry { last_executed: None, remaining_retries: action.max_retries })
    }
}

fn skipped(action: &RemediationAction, outcome: AttemptOutcome) -> ActionAttempt {
    ActionAttempt { action_id: action.id.clone(), outcome, duration: Duration::ZERO }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
