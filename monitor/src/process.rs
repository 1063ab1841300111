//! Process liveness and service launching
//!
//! [`ProcessControl`] is the seam between the monitor and the OS process
//! table, so liveness checks and restarts can be faked in tests.

use std::process::Stdio;

use async_trait::async_trait;
use sysinfo::System;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::error::{ActionError, ActionResult, ProbeError, ProbeResult};

#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Whether any process name or command line contains `pattern`
    async fn is_running(&self, pattern: &str) -> ProbeResult<bool>;

    /// Start the service detached, returning its pid
    async fn launch(&self, service: &ServiceConfig) -> ActionResult<u32>;
}

/// Process control backed by sysinfo and `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemProcessControl;

impl SystemProcessControl {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessControl for SystemProcessControl {
    async fn is_running(&self, pattern: &str) -> ProbeResult<bool> {
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            system.refresh_processes();
            system.processes().values().any(|process| {
                process.name().contains(&pattern) || process.cmd().join(" ").contains(&pattern)
            })
        })
        .await
        .map_err(|e| ProbeError::ProcessTable { reason: e.to_string() })
    }

    async fn launch(&self, service: &ServiceConfig) -> ActionResult<u32> {
        let (program, args) = service.restart_command.split_first().ok_or_else(|| ActionError::NotConfigured {
            reason: format!("service {} has no restart_command", service.name),
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = &service.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| ActionError::Launch {
            service: service.name.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| ActionError::Launch {
            service: service.name.clone(),
            reason: "process exited immediately".to_string(),
        })?;
        info!(service = %service.name, pid, "Service launched");

        // Reap the child in the background so it never lingers as a zombie
        let name = service.name.clone();
        tokio::spawn(async move {
            let mut child = child;
            if let Ok(status) = child.wait().await {
                debug!(service = %name, %status, "Launched service exited");
            }
        });

        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detects_own_process() {
        let control = SystemProcessControl::new();
        let own_name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|name| name.to_string_lossy().to_string()))
            .unwrap();
        // Process names are truncated to 15 characters on Linux
        let pattern: String = own_name.chars().take(10).collect();
        assert!(control.is_running(&pattern).await.unwrap());
        assert!(!control.is_running("no-such-process-7f3a9c1e").await.unwrap());
    }

    #[tokio::test]
    async fn test_launch_requires_command() {
        let control = SystemProcessControl::new();
        let service = ServiceConfig {
            name: "api".to_string(),
            match_pattern: "api".to_string(),
            restart_command: Vec::new(),
            working_dir: None,
        };
        assert!(matches!(control.launch(&service).await, Err(ActionError::NotConfigured { .. })));
    }

    #[tokio::test]
    async fn test_launch_missing_program_fails() {
        let control = SystemProcessControl::new();
        let service = ServiceConfig {
            name: "ghost".to_string(),
            match_pattern: "ghost".to_string(),
            restart_command: vec!["/nonexistent/bin/ghost-service".to_string()],
            working_dir: None,
        };
        assert!(matches!(control.launch(&service).await, Err(ActionError::Launch { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_returns_pid() {
        let control = SystemProcessControl::new();
        let service = ServiceConfig {
            name: "sleeper".to_string(),
            match_pattern: "sleep".to_string(),
            restart_command: vec!["sleep".to_string(), "0".to_string()],
            working_dir: Some(std::env::temp_dir()),
        };
        let pid = control.launch(&service).await.unwrap();
        assert!(pid > 0);
    }
}
