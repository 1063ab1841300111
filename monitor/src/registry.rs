//! Remediation action registry
//!
//! The registry is built once at startup and never mutated afterwards. Its
//! entries describe what an action is and when it may run; the code that
//! performs it lives in [`crate::actions`], and the runtime retry/cooldown
//! bookkeeping lives in the responder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{
    ActionHandler, DiskCleanup, FileStandardization, LogRotation, MemoryCleanup, ServiceRestart, TempFileCleanup,
};
use crate::alert::IncidentType;

pub const DISK_CLEANUP: &str = "disk_cleanup";
pub const MEMORY_CLEANUP: &str = "memory_cleanup";
pub const SERVICE_RESTART: &str = "service_restart";
pub const FILE_STANDARDIZATION: &str = "file_standardization";
pub const LOG_ROTATION: &str = "log_rotation";
pub const TEMP_FILE_CLEANUP: &str = "temp_file_cleanup";

/// A registered corrective operation
#[derive(Clone)]
pub struct RemediationAction {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Incident types this action resolves; empty for operator-only actions
    pub applies_to: Vec<IncidentType>,
    pub max_retries: u32,
    pub cooldown: Duration,
    pub handler: Arc<dyn ActionHandler>,
}

impl std::fmt::Debug for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationAction")
            .field("id", &self.id)
            .field("applies_to", &self.applies_to)
            .field("max_retries", &self.max_retries)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

/// Immutable lookup table from incident type to remediation actions
#[derive(Debug, Clone)]
pub struct RemediationRegistry {
    actions: Vec<RemediationAction>,
    by_id: HashMap<String, usize>,
}

impl RemediationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The built-in action set
    pub fn standard() -> Self {
        Self::builder()
            .register(
                DISK_CLEANUP,
                "Disk Space Cleanup",
                "Remove stale files from temporary directories when disk space is low",
                &[IncidentType::DiskSpace],
                2,
                Duration::from_secs(10 * 60),
                Arc::new(DiskCleanup),
            )
            .register(
                MEMORY_CLEANUP,
                "Memory Cleanup",
                "Return free allocator pages to the operating system",
                &[IncidentType::MemoryPressure],
                3,
                Duration::from_secs(5 * 60),
                Arc::new(MemoryCleanup),
            )
            .register(
                SERVICE_RESTART,
                "Service Restart",
                "Relaunch configured services that are not running",
                &[IncidentType::ServiceDown],
                3,
                Duration::from_secs(2 * 60),
                Arc::new(ServiceRestart),
            )
            .register(
                FILE_STANDARDIZATION,
                "File/Folder Standardization",
                "Normalize file and directory permissions in the workspace",
                &[IncidentType::FileCorruption],
                1,
                Duration::from_secs(15 * 60),
                Arc::new(FileStandardization),
            )
            .register(
                LOG_ROTATION,
                "Log Rotation",
                "Rotate oversized log files",
                &[IncidentType::DiskSpace],
                1,
                Duration::from_secs(60 * 60),
                Arc::new(LogRotation),
            )
            .register(
                TEMP_FILE_CLEANUP,
                "Temporary File Cleanup",
                "Remove temporary and cache files from the workspace",
                &[],
                1,
                Duration::from_secs(5 * 60),
                Arc::new(TempFileCleanup),
            )
            .build()
    }

    /// Actions applicable to `incident_type`, most specific first
    ///
    /// Actions covering fewer incident types come first; ties keep
    /// registration order.
    pub fn lookup(&self, incident_type: IncidentType) -> Vec<&RemediationAction> {
        let mut matches: Vec<&RemediationAction> = self
            .actions
            .iter()
            .filter(|action| action.applies_to.contains(&incident_type))
            .collect();
        matches.sort_by_key(|action| action.applies_to.len());
        matches
    }

    pub fn get(&self, id: &str) -> Option<&RemediationAction> {
        self.by_id.get(id).map(|&index| &self.actions[index])
    }

    pub fn actions(&self) -> &[RemediationAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    actions: Vec<RemediationAction>,
}

impl RegistryBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        self,
        id: &str,
        name: &str,
        description: &str,
        applies_to: &[IncidentType],
        max_retries: u32,
        cooldown: Duration,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.action(RemediationAction {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            applies_to: applies_to.to_vec(),
            max_retries,
            cooldown,
            handler,
        })
    }

    /// Add a fully built action; a later action with the same id replaces it
    pub fn action(mut self, action: RemediationAction) -> Self {
        if let Some(existing) = self.actions.iter_mut().find(|existing| existing.id == action.id) {
            *existing = action;
        } else {
            self.actions.push(action);
        }
        self
    }

    pub fn build(self) -> RemediationRegistry {
        let by_id = self
            .actions
            .iter()
            .enumerate()
            .map(|(index, action)| (action.id.clone(), index))
            .collect();
        RemediationRegistry { actions: self.actions, by_id }
    }
}
