//! Resource, process, endpoint and file sampling
//!
//! A probe never fails as a whole. Each sub-check that cannot produce a
//! reading leaves that reading unset (or unhealthy) and records the cause in
//! [`MetricSample::probe_errors`].

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::{debug, warn};

use crate::config::{MonitorConfig, ServiceConfig};
use crate::error::{MonitorError, ProbeError, ProbeResult, Result};
use crate::integrity::{self, CriticalFile, FileState};
use crate::process::ProcessControl;

/// Which sub-checks a sample includes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeScope {
    /// CPU, memory and disk only
    Resources,
    /// Resources plus services, endpoints and critical files
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub pattern: String,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    /// HTTP status, or 0 when no response was received
    pub status_code: u16,
    pub latency_ms: u64,
    pub healthy: bool,
    pub error: Option<String>,
}

/// A sub-check that could not produce a reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeFailure {
    pub check: String,
    pub error: String,
}

/// One point-in-time reading of the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    /// Seconds since the host booted
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    pub processes: BTreeMap<String, ProcessStatus>,
    pub endpoints: BTreeMap<String, EndpointStatus>,
    pub files: BTreeMap<String, FileState>,
    pub probe_errors: Vec<ProbeFailure>,
}

impl MetricSample {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cpu_percent: None,
            memory_percent: None,
            disk_percent: None,
            uptime_seconds: None,
            processes: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            files: BTreeMap::new(),
            probe_errors: Vec::new(),
        }
    }

    pub fn with_cpu(mut self, percent: f64) -> Self {
        self.cpu_percent = Some(percent);
        self
    }

    pub fn with_memory(mut self, percent: f64) -> Self {
        self.memory_percent = Some(percent);
        self
    }

    pub fn with_disk(mut self, percent: f64) -> Self {
        self.disk_percent = Some(percent);
        self
    }

    pub fn with_uptime(mut self, seconds: u64) -> Self {
        self.uptime_seconds = Some(seconds);
        self
    }

    pub fn with_process(mut self, name: impl Into<String>, pattern: impl Into<String>, running: bool) -> Self {
        self.processes.insert(name.into(), ProcessStatus { pattern: pattern.into(), running });
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, status: EndpointStatus) -> Self {
        self.endpoints.insert(endpoint.into(), status);
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, state: FileState) -> Self {
        self.files.insert(path.into(), state);
        self
    }

    pub fn with_probe_error(mut self, check: impl Into<String>, error: impl ToString) -> Self {
        self.probe_errors.push(ProbeFailure { check: check.into(), error: error.to_string() });
        self
    }

    /// False when any sub-check failed to produce a reading
    pub fn is_healthy(&self) -> bool {
        self.probe_errors.is_empty()
    }

    /// Share of healthy endpoints, `None` when no endpoint was probed
    pub fn endpoint_health_percent(&self) -> Option<f64> {
        if self.endpoints.is_empty() {
            return None;
        }
        let healthy = self.endpoints.values().filter(|status| status.healthy).count();
        Some(healthy as f64 * 100.0 / self.endpoints.len() as f64)
    }

    /// Nearest-rank 95th percentile latency of the endpoints that answered
    /// successfully, `None` when none did
    pub fn p95_latency_ms(&self) -> Option<u64> {
        let mut latencies: Vec<u64> =
            self.endpoints.values().filter(|status| status.healthy).map(|status| status.latency_ms).collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();
        let rank = (latencies.len() as f64 * 0.95).ceil() as usize;
        Some(latencies[rank.saturating_sub(1)])
    }

    /// Healthy endpoints slower than `limit_ms`
    pub fn slow_endpoints(&self, limit_ms: f64) -> Vec<&str> {
        self.endpoints
            .iter()
            .filter(|(_, status)| status.healthy && status.latency_ms as f64 > limit_ms)
            .map(|(endpoint, _)| endpoint.as_str())
            .collect()
    }
}

#[async_trait]
pub trait MetricsProbe: Send + Sync {
    async fn sample(&self, scope: ProbeScope) -> MetricSample;
}

/// Probe reading the local host through sysinfo and HTTP
pub struct SystemProbe {
    cpu_window: Duration,
    disk_path: PathBuf,
    base_url: String,
    endpoints: Vec<String>,
    endpoint_timeout: Duration,
    workspace_root: PathBuf,
    critical_files: Vec<CriticalFile>,
    services: Vec<ServiceConfig>,
    process: Arc<dyn ProcessControl>,
    client: reqwest::Client,
}

impl SystemProbe {
    pub fn new(config: &MonitorConfig, process: Arc<dyn ProcessControl>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(concat!("agent-monitor/", env!("CARGO_PKG_VERSION")));
        // Local endpoints never go through a proxy from the environment
        if is_loopback(&config.probe.base_url) {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| {
                MonitorError::Probe(ProbeError::Http { endpoint: config.probe.base_url.clone(), reason: e.to_string() })
            })?;

        Ok(Self {
            cpu_window: config.scheduling.cpu_sample_window().max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
            disk_path: config.probe.disk_path.clone(),
            base_url: config.probe.base_url.trim_end_matches('/').to_string(),
            endpoints: config.probe.endpoints.clone(),
            endpoint_timeout: Duration::from_millis(config.probe.endpoint_timeout_ms),
            workspace_root: config.workspace.root.clone(),
            critical_files: config.workspace.critical_files.clone(),
            services: config.services.clone(),
            process,
            client,
        })
    }

    async fn cpu_percent(&self) -> ProbeResult<f64> {
        let mut system = System::new();
        system.refresh_cpu();
        tokio::time::sleep(self.cpu_window).await;
        system.refresh_cpu();

        if system.cpus().is_empty() {
            return Err(ProbeError::TaskFailed { reason: "no CPU information available".to_string() });
        }
        Ok(system.global_cpu_info().cpu_usage() as f64)
    }

    fn memory_percent() -> ProbeResult<f64> {
        let mut system = System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return Err(ProbeError::TaskFailed { reason: "total memory reported as zero".to_string() });
        }
        let used = total.saturating_sub(system.available_memory());
        Ok(used as f64 * 100.0 / total as f64)
    }

    async fn disk_percent(&self) -> ProbeResult<f64> {
        let path = self.disk_path.clone();
        tokio::task::spawn_blocking(move || disk_usage(&path))
            .await
            .map_err(|e| ProbeError::TaskFailed { reason: e.to_string() })?
    }

    async fn check_services(&self) -> Vec<(String, ProcessStatus, Option<ProbeError>)> {
        let mut results = Vec::with_capacity(self.services.len());
        for service in &self.services {
            let (running, error) = match self.process.is_running(&service.match_pattern).await {
                Ok(running) => (running, None),
                Err(e) => (false, Some(e)),
            };
            results.push((
                service.name.clone(),
                ProcessStatus { pattern: service.match_pattern.clone(), running },
                error,
            ));
        }
        results
    }

    async fn check_endpoint(&self, endpoint: &str) -> EndpointStatus {
        let url = format!("{}{}", self.base_url, endpoint);
        let start = Instant::now();

        let outcome = tokio::time::timeout(self.endpoint_timeout, self.client.get(&url).send()).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(response)) => {
                let status_code = response.status().as_u16();
                debug!(endpoint, status_code, latency_ms, "Endpoint probed");
                EndpointStatus { status_code, latency_ms, healthy: status_code < 400, error: None }
            }
            Ok(Err(e)) => EndpointStatus {
                status_code: 0,
                latency_ms,
                healthy: false,
                error: Some(ProbeError::Http { endpoint: endpoint.to_string(), reason: e.to_string() }.to_string()),
            },
            Err(_) => EndpointStatus {
                status_code: 0,
                latency_ms,
                healthy: false,
                error: Some(
                    ProbeError::Timeout {
                        endpoint: endpoint.to_string(),
                        timeout_ms: self.endpoint_timeout.as_millis() as u64,
                    }
                    .to_string(),
                ),
            },
        }
    }

    async fn check_files(&self) -> ProbeResult<BTreeMap<String, FileState>> {
        let root = self.workspace_root.clone();
        let files = self.critical_files.clone();
        tokio::task::spawn_blocking(move || integrity::verify_all(&root, &files))
            .await
            .map_err(|e| ProbeError::TaskFailed { reason: e.to_string() })
    }
}

#[async_trait]
impl MetricsProbe for SystemProbe {
    async fn sample(&self, scope: ProbeScope) -> MetricSample {
        let mut sample = MetricSample::new(Utc::now()).with_uptime(System::uptime());

        match self.cpu_percent().await {
            Ok(cpu) => sample.cpu_percent = Some(cpu),
            Err(e) => record_failure(&mut sample, "cpu", e),
        }
        match Self::memory_percent() {
            Ok(memory) => sample.memory_percent = Some(memory),
            Err(e) => record_failure(&mut sample, "memory", e),
        }
        match self.disk_percent().await {
            Ok(disk) => sample.disk_percent = Some(disk),
            Err(e) => record_failure(&mut sample, "disk", e),
        }

        if scope == ProbeScope::Resources {
            return sample;
        }

        for (name, status, error) in self.check_services().await {
            if let Some(e) = error {
                record_failure(&mut sample, &format!("process:{name}"), e);
            }
            sample.processes.insert(name, status);
        }

        let statuses = join_all(self.endpoints.iter().map(|endpoint| self.check_endpoint(endpoint))).await;
        for (endpoint, status) in self.endpoints.iter().zip(statuses) {
            if let Some(error) = &status.error {
                sample.probe_errors.push(ProbeFailure { check: format!("endpoint:{endpoint}"), error: error.clone() });
            }
            sample.endpoints.insert(endpoint.clone(), status);
        }

        match self.check_files().await {
            Ok(files) => {
                for (path, state) in &files {
                    if let FileState::Unreadable { error } = state {
                        sample.probe_errors.push(ProbeFailure { check: format!("file:{path}"), error: error.clone() });
                    }
                }
                sample.files = files;
            }
            Err(e) => record_failure(&mut sample, "files", e),
        }

        sample
    }
}

fn record_failure(sample: &mut MetricSample, check: &str, error: ProbeError) {
    warn!(check, error = %error, "Probe sub-check failed");
    sample.probe_errors.push(ProbeFailure { check: check.to_string(), error: error.to_string() });
}

fn is_loopback(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else { return false };
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback()),
        None => false,
    }
}

/// Usage of the filesystem with the longest mount point containing `path`
fn disk_usage(path: &Path) -> ProbeResult<f64> {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .ok_or_else(|| ProbeError::DiskNotFound { path: path.to_path_buf() })?;

    let total = disk.total_space();
    if total == 0 {
        return Err(ProbeError::DiskNotFound { path: path.to_path_buf() });
    }
    let used = total.saturating_sub(disk.available_space());
    Ok(used as f64 * 100.0 / total as f64)
}
