//! Integration tests for the agent platform monitor

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use agent_monitor::{
    alert::{AlertEngine, AlertLevel, IncidentType},
    audit::AuditRecord,
    config::{MonitorConfig, ServiceConfig},
    error::{ActionResult, ProbeResult},
    monitor::{Monitor, WorkKind, WorkReport, OPERATOR_CLEANUP},
    probe::{MetricSample, MetricsProbe, ProbeScope, SystemProbe},
    process::ProcessControl,
    registry::RemediationRegistry,
    service::MonitorService,
};

/// Probe returning queued samples, then empty ones
struct ScriptedProbe {
    samples: Mutex<Vec<MetricSample>>,
}

impl ScriptedProbe {
    fn new(samples: Vec<MetricSample>) -> Arc<Self> {
        Arc::new(Self { samples: Mutex::new(samples) })
    }
}

#[async_trait]
impl MetricsProbe for ScriptedProbe {
    async fn sample(&self, _scope: ProbeScope) -> MetricSample {
        let mut samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            MetricSample::new(Utc::now())
        } else {
            samples.remove(0)
        }
    }
}

/// Process table where nothing runs until it is launched
#[derive(Default)]
struct FakeProcesses {
    launched: Mutex<Vec<String>>,
}

#[async_trait]
impl ProcessControl for FakeProcesses {
    async fn is_running(&self, pattern: &str) -> ProbeResult<bool> {
        Ok(self.launched.lock().unwrap().iter().any(|name| name == pattern))
    }

    async fn launch(&self, service: &ServiceConfig) -> ActionResult<u32> {
        let mut launched = self.launched.lock().unwrap();
        launched.push(service.match_pattern.clone());
        Ok(1000 + launched.len() as u32)
    }
}

/// Create a test configuration rooted in a temporary directory
fn create_test_config(root: &Path) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.workspace.root = root.to_path_buf();
    config.cleanup.temp_dirs = vec![root.join("tmp")];
    config.scheduling.check_interval_secs = 3600;
    config
}

fn create_monitor(config: MonitorConfig, probe: Arc<dyn MetricsProbe>, process: Arc<FakeProcesses>) -> Monitor {
    Monitor::with_components(config, probe, process, RemediationRegistry::standard(), CancellationToken::new())
        .unwrap()
}

fn alert_records(records: &[AuditRecord]) -> Vec<&AuditRecord> {
    records
        .iter()
        .filter(|record| matches!(record, AuditRecord::MonitoringAlert { .. }))
        .collect()
}

#[tokio::test]
async fn test_memory_pressure_alert_respects_cooldown() {
    let temp_dir = TempDir::new().unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let probe = ScriptedProbe::new(vec![
        MetricSample::new(t0).with_cpu(20.0).with_memory(95.0).with_disk(40.0),
        MetricSample::new(t0 + chrono::Duration::seconds(10)).with_cpu(20.0).with_memory(95.0).with_disk(40.0),
    ]);
    let mut monitor = create_monitor(create_test_config(temp_dir.path()), probe, Arc::default());

    let first = monitor.routine_check().await;
    assert_eq!(first.alerts.len(), 1);
    let alert = &first.alerts[0];
    assert_eq!(alert.incident_type, IncidentType::MemoryPressure);
    assert_eq!(alert.level, AlertLevel::Critical);
    assert!(alert.resolved());
    assert_eq!(alert.resolution_action(), Some("memory_cleanup"));

    // Ten seconds later the same condition is still inside the cooldown
    let second = monitor.routine_check().await;
    assert!(second.alerts.is_empty());

    let records = monitor.audit_log().read_all().await.unwrap();
    assert_eq!(alert_records(&records).len(), 1);
    assert!(records.iter().any(|record| matches!(
        record,
        AuditRecord::RemediationAttempt { action_id, outcome, .. }
            if action_id == "memory_cleanup" && outcome == "succeeded"
    )));
}

#[tokio::test]
async fn test_service_down_triggers_restart() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path());
    config.services = vec![ServiceConfig {
        name: "api".to_string(),
        match_pattern: "uvicorn".to_string(),
        restart_command: vec!["uvicorn".to_string(), "app:main".to_string()],
        working_dir: None,
    }];

    let processes = Arc::new(FakeProcesses::default());
    let probe = ScriptedProbe::new(vec![MetricSample::new(Utc::now())
        .with_cpu(10.0)
        .with_memory(10.0)
        .with_process("api", "uvicorn", false)]);
    let mut monitor = create_monitor(config, probe, Arc::clone(&processes));

    let report = monitor.full_diagnostics().await;
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].incident_type, IncidentType::ServiceDown);
    assert_eq!(report.alerts[0].metrics["down_services"], serde_json::json!(["api"]));
    assert!(report.alerts[0].resolved());
    assert_eq!(report.alerts[0].resolution_action(), Some("service_restart"));
    assert_eq!(processes.launched.lock().unwrap().as_slice(), ["uvicorn".to_string()]);
}

#[tokio::test]
async fn test_unhandled_alert_requires_manual_attention() {
    let temp_dir = TempDir::new().unwrap();
    let probe = ScriptedProbe::new(vec![MetricSample::new(Utc::now()).with_cpu(96.0)]);
    let mut monitor = create_monitor(create_test_config(temp_dir.path()), probe, Arc::default());

    let report = monitor.routine_check().await;
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].incident_type, IncidentType::CpuOverload);
    assert!(!report.alerts[0].resolved());
    assert!(report.outcomes[0].attempts.is_empty());

    let records = monitor.audit_log().read_all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(matches!(&records[0], AuditRecord::MonitoringAlert { auto_resolved: false, resolution_action: None, .. }));
}

#[tokio::test]
async fn test_audit_log_is_append_only() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_test_config(temp_dir.path());
    let audit_path = config.workspace.audit_log_path();
    std::fs::create_dir_all(audit_path.parent().unwrap()).unwrap();
    std::fs::write(&audit_path, "previous line\n").unwrap();

    let t0 = Utc::now();
    let probe = ScriptedProbe::new(vec![
        MetricSample::new(t0).with_cpu(99.0),
        MetricSample::new(t0 + chrono::Duration::seconds(400)).with_cpu(99.0),
    ]);
    let mut monitor = create_monitor(config, probe, Arc::default());

    monitor.routine_check().await;
    let after_first = std::fs::read_to_string(&audit_path).unwrap();
    monitor.routine_check().await;
    let after_second = std::fs::read_to_string(&audit_path).unwrap();

    assert!(after_first.starts_with("previous line\n"));
    assert!(after_second.starts_with(&after_first));
    assert_eq!(after_second.lines().count(), 3);
    assert_eq!(alert_records(&monitor.audit_log().read_all().await.unwrap()).len(), 2);
}

#[tokio::test]
async fn test_endpoint_probes_are_isolated() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buffer = [0u8; 1024];
                let read = socket.read(&mut buffer).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buffer[..read]);
                if request.starts_with("GET /hang ") {
                    // Hold the connection open without answering
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            });
        }
    });

    let temp_dir = TempDir::new().unwrap();
    let mut config = create_test_config(temp_dir.path());
    config.probe.base_url = format!("http://{address}");
    config.probe.endpoints = ["/health", "/hang", "/agents", "/tasks", "/metrics"].map(String::from).to_vec();
    config.probe.endpoint_timeout_ms = 500;
    config.probe.disk_path = temp_dir.path().to_path_buf();
    config.scheduling.cpu_sample_window_ms = 200;

    let probe = SystemProbe::new(&config, Arc::new(FakeProcesses::default())).unwrap();
    let sample = timeout(Duration::from_secs(10), probe.sample(ProbeScope::Full)).await.unwrap();

    assert_eq!(sample.endpoints.len(), 5);
    let hung = &sample.endpoints["/hang"];
    assert!(!hung.healthy);
    assert!(hung.error.as_deref().unwrap_or_default().contains("timed out"));
    for (endpoint, status) in sample.endpoints.iter().filter(|(endpoint, _)| endpoint.as_str() != "/hang") {
        assert!(status.healthy, "{endpoint} should be healthy");
        assert_eq!(status.status_code, 200);
        assert!(status.latency_ms < 500, "{endpoint} waited on the hung endpoint");
    }
    assert_eq!(sample.endpoint_health_percent(), Some(80.0));
    assert!(sample.probe_errors.iter().any(|failure| failure.check == "endpoint:/hang"));

    // 80% healthy is below a 90% requirement
    let mut thresholds = config.thresholds.clone();
    thresholds.endpoint_health_percent = 90.0;
    let alerts = AlertEngine::new(Duration::from_secs(300)).evaluate(&sample, &thresholds);
    let service_down: Vec<_> = alerts.iter().filter(|alert| alert.incident_type == IncidentType::ServiceDown).collect();
    assert_eq!(service_down.len(), 1);
    assert_eq!(service_down[0].metrics["unhealthy_endpoints"], serde_json::json!(["/hang"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_service_runs_triggered_cleanup() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("build.tmp"), b"scratch").unwrap();
    std::fs::write(temp_dir.path().join("notes.bak"), b"old").unwrap();
    std::fs::write(temp_dir.path().join("keep.txt"), b"keep").unwrap();

    let config = create_test_config(temp_dir.path());
    let audit_path = config.workspace.audit_log_path();
    let cancel = CancellationToken::new();
    let monitor = Monitor::with_components(
        config,
        ScriptedProbe::new(Vec::new()),
        Arc::new(FakeProcesses::default()),
        RemediationRegistry::standard(),
        cancel.clone(),
    )
    .unwrap();

    let mut service = MonitorService::with_monitor(monitor, cancel);
    let mut reports = service.subscribe();
    service.start().await.unwrap();

    assert!(service.trigger(WorkKind::Cleanup));
    let report = timeout(Duration::from_secs(10), reports.recv()).await.unwrap().unwrap();
    let WorkReport::Cleanup(cleanup) = report else { panic!("expected a cleanup report") };
    assert_eq!(cleanup.attempts.len(), 3);

    assert!(!temp_dir.path().join("build.tmp").exists());
    assert!(!temp_dir.path().join("notes.bak").exists());
    assert!(temp_dir.path().join("keep.txt").exists());

    let content = std::fs::read_to_string(&audit_path).unwrap();
    let operator_records = content.lines().filter(|line| line.contains(OPERATOR_CLEANUP)).count();
    assert_eq!(operator_records, 3);

    let status = service.get_status().await;
    assert_eq!(status.stats.cleanup_runs, 1);

    service.stop().await.unwrap();
}

fn run_once_binary(args: &[&str]) -> (std::process::ExitStatus, serde_json::Value) {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_agent-monitor"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    let document = serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}"));
    (output.status, document)
}

#[test]
fn test_once_reports_missing_config_as_json() {
    let (status, document) = run_once_binary(&["--once", "--config", "/nonexistent/agent-monitor.toml"]);
    assert!(status.success());
    assert!(document["report"].is_null());
    assert!(document["error"].as_str().unwrap().contains("does not exist"));
}

#[test]
fn test_once_stdout_holds_only_the_report() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let config_path = root.join("monitor.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"auto_remediate = false

[workspace]
root = "{root}"

[probe]
base_url = "http://127.0.0.1:1"
endpoints = []
disk_path = "{root}"

[scheduling]
cpu_sample_window_ms = 100

[cleanup]
temp_dirs = []

[logging]
level = "debug"
"#,
            root = root.display()
        ),
    )
    .unwrap();

    let (status, document) = run_once_binary(&["--once", "--config", config_path.to_str().unwrap()]);
    assert!(status.success());
    assert!(document["error"].is_null());
    assert!(!document["report"].is_null());
}
