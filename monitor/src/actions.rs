//! Built-in remediation handlers
//!
//! Every handler is idempotent: running it twice in a row leaves the system
//! in the same state as running it once, and a run with nothing to do is a
//! success. Filesystem work happens on the blocking pool and checks the
//! cancellation token between entries.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::{CleanupConfig, ServiceConfig, WorkspaceConfig};
use crate::error::{ActionError, ActionResult};
use crate::process::ProcessControl;

/// What a successful action did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionReport {
    pub summary: String,
    pub items_affected: u64,
    pub bytes_reclaimed: u64,
}

impl ActionReport {
    fn new(summary: impl Into<String>, items_affected: u64) -> Self {
        Self { summary: summary.into(), items_affected, bytes_reclaimed: 0 }
    }

    fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes_reclaimed = bytes;
        self
    }
}

/// Everything a handler may touch
#[derive(Clone)]
pub struct ActionContext {
    pub workspace: WorkspaceConfig,
    pub cleanup: CleanupConfig,
    pub services: Vec<ServiceConfig>,
    pub process: Arc<dyn ProcessControl>,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, ctx: &ActionContext, cancel: CancellationToken) -> ActionResult<ActionReport>;
}

/// Run filesystem work on the blocking pool
async fn blocking<F>(work: F) -> ActionResult<ActionReport>
where
    F: FnOnce() -> ActionResult<ActionReport> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ActionError::Failed { reason: format!("worker task failed: {e}") })?
}

fn check_cancelled(cancel: &CancellationToken) -> ActionResult<()> {
    if cancel.is_cancelled() {
        Err(ActionError::Cancelled)
    } else {
        Ok(())
    }
}

/// Removes stale top-level files from the temporary directories
pub struct DiskCleanup;

#[async_trait]
impl ActionHandler for DiskCleanup {
    async fn run(&self, ctx: &ActionContext, cancel: CancellationToken) -> ActionResult<ActionReport> {
        let dirs = ctx.cleanup.temp_dirs.clone();
        let max_age = Duration::from_secs(ctx.cleanup.max_temp_age_hours * 3600);
        blocking(move || clean_temp_dirs(&dirs, max_age, &cancel)).await
    }
}

fn clean_temp_dirs(dirs: &[PathBuf], max_age: Duration, cancel: &CancellationToken) -> ActionResult<ActionReport> {
    let mut scanned = 0;
    let mut attempted = 0u64;
    let mut removed = 0u64;
    let mut bytes = 0u64;

    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot scan temporary directory");
                continue;
            }
        };
        scanned += 1;

        for entry in entries.flatten() {
            check_cancelled(cancel)?;

            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_file() {
                continue;
            }
            let stale = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= max_age);
            if !stale {
                continue;
            }

            attempted += 1;
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    bytes += metadata.len();
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Could not remove temporary file"),
            }
        }
    }

    if scanned == 0 {
        return Err(ActionError::Failed { reason: "no temporary directory could be scanned".to_string() });
    }
    if attempted > 0 && removed == 0 {
        return Err(ActionError::Failed { reason: format!("all {attempted} stale file deletions failed") });
    }

    info!(removed, bytes, "Disk cleanup completed");
    Ok(ActionReport::new(format!("removed {removed} stale temporary files"), removed).with_bytes(bytes))
}

/// Hands free heap pages back to the operating system
pub struct MemoryCleanup;

#[async_trait]
impl ActionHandler for MemoryCleanup {
    async fn run(&self, _ctx: &ActionContext, cancel: CancellationToken) -> ActionResult<ActionReport> {
        check_cancelled(&cancel)?;
        let released = release_free_memory();
        info!(released, "Memory cleanup completed");
        let summary = if released { "returned free heap pages to the OS" } else { "no free heap pages to return" };
        Ok(ActionReport::new(summary, u64::from(released)))
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn release_free_memory() -> bool {
    // SAFETY: malloc_trim only inspects and shrinks the allocator's own arenas
    unsafe { libc::malloc_trim(0) == 1 }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn release_free_memory() -> bool {
    false
}

/// Relaunches configured services that are not running
pub struct ServiceRestart;

#[async_trait]
impl ActionHandler for ServiceRestart {
    async fn run(&self, ctx: &ActionContext, cancel: CancellationToken) -> ActionResult<ActionReport> {
        if ctx.services.is_empty() {
            return Err(ActionError::NotConfigured { reason: "no services configured".to_string() });
        }

        let mut restarted = Vec::new();
        for service in &ctx.services {
            check_cancelled(&cancel)?;

            let running = ctx
                .process
                .is_running(&service.match_pattern)
                .await
                .map_err(|e| ActionError::Failed { reason: e.to_string() })?;
            if running {
                debug!(service = %service.name, "Service already running");
                continue;
            }

            let pid = ctx.process.launch(service).await?;
            info!(service = %service.name, pid, "Service restarted");
            restarted.push(service.name.clone());
        }

        let summary = if restarted.is_empty() {
            "all services running".to_string()
        } else {
            format!("restarted {}", restarted.join(", "))
        };
        Ok(ActionReport::new(summary, restarted.len() as u64))
    }
}

fn is_excluded(entry: &DirEntry, exclude_dirs: &[String]) -> bool {
    entry.file_type().is_dir() && exclude_dirs.iter().any(|name| entry.file_name().to_str() == Some(name.as_str()))
}

/// Normalizes permissions across the workspace
pub struct FileStandardization;

#[async_trait]
impl ActionHandler for FileStandardization {
    async fn run(&self, ctx: &ActionContext, cancel: CancellationToken) -> ActionResult<ActionReport> {
        let root = ctx.workspace.root.clone();
        let exclude_dirs = ctx.workspace.exclude_dirs.clone();
        blocking(move || standardize_permissions(&root, &exclude_dirs, &cancel)).await
    }
}

/// Target mode for a workspace entry: directories and scripts are executable
pub fn standard_mode(path: &Path, is_dir: bool) -> u32 {
    let executable = matches!(path.extension().and_then(|ext| ext.to_str()), Some("py" | "sh"));
    if is_dir || executable {
        0o755
    } else {
        0o644
    }
}

#[cfg(unix)]
fn standardize_permissions(root: &Path, exclude_dirs: &[String], cancel: &CancellationToken) -> ActionResult<ActionReport> {
    use std::os::unix::fs::PermissionsExt;

    if !root.is_dir() {
        return Err(ActionError::filesystem(root, std::io::Error::from(std::io::ErrorKind::NotFound)));
    }

    let mut changed = 0u64;
    let mut failed = 0u64;
    let walker = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|entry| !is_excluded(entry, exclude_dirs));

    for entry in walker {
        check_cancelled(cancel)?;

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Cannot read workspace entry");
                continue;
            }
        };
        if entry.path_is_symlink() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };

        let target = standard_mode(entry.path(), metadata.is_dir());
        if metadata.permissions().mode() & 0o777 == target {
            continue;
        }

        match fs::set_permissions(entry.path(), fs::Permissions::from_mode(target)) {
            Ok(()) => changed += 1,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Could not set permissions");
                failed += 1;
            }
        }
    }

    if failed > 0 && changed == 0 {
        return Err(ActionError::Failed { reason: format!("all {failed} permission changes failed") });
    }

    info!(changed, failed, "File standardization completed");
    Ok(ActionReport::new(format!("standardized permissions on {changed} entries"), changed))
}

#[cfg(not(unix))]
fn standardize_permissions(_root: &Path, _exclude_dirs: &[String], cancel: &CancellationToken) -> ActionResult<ActionReport> {
    check_cancelled(cancel)?;
    Ok(ActionReport::new("permission standardization not supported on this platform", 0))
}

/// Rotates log files above the configured size
pub struct LogRotation;

#[async_trait]
impl ActionHandler for LogRotation {
    async fn run(&self, ctx: &ActionContext, cancel: CancellationToken) -> ActionResult<ActionReport> {
        let log_dir = ctx.workspace.log_dir();
        let limit = ctx.cleanup.log_rotation_bytes;
        blocking(move || rotate_logs(&log_dir, limit, &cancel)).await
    }
}

fn rotate_logs(log_dir: &Path, limit: u64, cancel: &CancellationToken) -> ActionResult<ActionReport> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir).map_err(|e| ActionError::filesystem(log_dir, e))?;
        return Ok(ActionReport::new("created log directory", 0));
    }

    let rotated_name = Regex::new(r"_\d{8}_\d{6}(_\d+)?$").map_err(|e| ActionError::Failed { reason: e.to_string() })?;
    let entries = fs::read_dir(log_dir).map_err(|e| ActionError::filesystem(log_dir, e))?;

    let mut rotated = 0u64;
    let mut bytes = 0u64;
    for entry in entries.flatten() {
        check_cancelled(cancel)?;

        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else { continue };
        if rotated_name.is_match(stem) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_file() || metadata.len() <= limit {
            continue;
        }

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let mut target = log_dir.join(format!("{stem}_{timestamp}.log"));
        let mut counter = 1;
        while target.exists() {
            target = log_dir.join(format!("{stem}_{timestamp}_{counter}.log"));
            counter += 1;
        }

        // Rename and recreate form one step; cancellation is only observed between files
        fs::rename(&path, &target).map_err(|e| ActionError::filesystem(&path, e))?;
        fs::File::create(&path).map_err(|e| ActionError::filesystem(&path, e))?;

        info!(from = %path.display(), to = %target.display(), size = metadata.len(), "Log rotated");
        rotated += 1;
        bytes += metadata.len();
    }

    Ok(ActionReport::new(format!("rotated {rotated} log files"), rotated).with_bytes(bytes))
}

/// Removes temporary and cache files from the workspace
pub struct TempFileCleanup;

#[async_trait]
impl ActionHandler for TempFileCleanup {
    async fn run(&self, ctx: &ActionContext, cancel: CancellationToken) -> ActionResult<ActionReport> {
        let root = ctx.workspace.root.clone();
        let exclude_dirs = ctx.workspace.exclude_dirs.clone();
        let patterns = ctx.workspace.temp_patterns.clone();
        blocking(move || clean_workspace_temp_files(&root, &exclude_dirs, &patterns, &cancel)).await
    }
}

/// `*.ext` matches by suffix, anything else by exact name
fn matches_pattern(name: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    }
}

fn clean_workspace_temp_files(
    root: &Path,
    exclude_dirs: &[String],
    patterns: &[String],
    cancel: &CancellationToken,
) -> ActionResult<ActionReport> {
    if !root.is_dir() {
        return Err(ActionError::filesystem(root, std::io::Error::from(std::io::ErrorKind::NotFound)));
    }

    let mut removed = 0u64;
    let mut bytes = 0u64;
    // Excluded directories are pruned unless they are themselves temp entries
    let is_temp = |entry: &DirEntry| {
        entry.file_name().to_str().is_some_and(|name| patterns.iter().any(|pattern| matches_pattern(name, pattern)))
    };
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| is_temp(entry) || !is_excluded(entry, exclude_dirs));

    while let Some(entry) = walker.next() {
        check_cancelled(cancel)?;

        let Ok(entry) = entry else { continue };
        if !is_temp(&entry) {
            continue;
        }

        let path = entry.path().to_path_buf();
        let result = if entry.file_type().is_dir() {
            walker.skip_current_dir();
            fs::remove_dir_all(&path)
        } else {
            let size = entry.metadata().map(|metadata| metadata.len()).unwrap_or(0);
            fs::remove_file(&path).map(|()| bytes += size)
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove temporary file"),
        }
    }

    info!(removed, bytes, "Temporary file cleanup completed");
    Ok(ActionReport::new(format!("removed {removed} temporary files and directories"), removed).with_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::error::{ProbeError, ProbeResult};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeProcesses {
        running: Vec<String>,
        launched: Mutex<Vec<String>>,
        fail_launch: bool,
    }

    #[async_trait]
    impl ProcessControl for FakeProcesses {
        async fn is_running(&self, pattern: &str) -> ProbeResult<bool> {
            if pattern == "unreadable" {
                return Err(ProbeError::ProcessTable { reason: "denied".to_string() });
            }
            Ok(self.running.iter().any(|running| running == pattern))
        }

        async fn launch(&self, service: &ServiceConfig) -> ActionResult<u32> {
            if self.fail_launch {
                return Err(ActionError::Launch { service: service.name.clone(), reason: "exec failed".to_string() });
            }
            self.launched.lock().unwrap().push(service.name.clone());
            Ok(4242)
        }
    }

    fn context(root: &Path, process: Arc<dyn ProcessControl>) -> ActionContext {
        let mut config = MonitorConfig::default();
        config.workspace.root = root.to_path_buf();
        config.cleanup.temp_dirs = vec![root.join("tmp")];
        ActionContext {
            workspace: config.workspace,
            cleanup: config.cleanup,
            services: Vec::new(),
            process,
        }
    }

    fn service(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            match_pattern: format!("{name}.py"),
            restart_command: vec!["python3".to_string(), format!("{name}.py")],
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_log_rotation_of_large_file() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path(), Arc::new(FakeProcesses::default()));
        let log_dir = ctx.workspace.log_dir();
        fs::create_dir_all(&log_dir).unwrap();
        let log_path = log_dir.join("server.log");
        fs::write(&log_path, vec![b'x'; 11 * 1024 * 1024]).unwrap();
        fs::write(log_dir.join("small.log"), b"tail\n").unwrap();

        let report = LogRotation.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.items_affected, 1);
        assert_eq!(fs::metadata(&log_path).unwrap().len(), 0);

        let rotated_name = Regex::new(r"^server_\d{8}_\d{6}\.log$").unwrap();
        let rotated: Vec<_> = fs::read_dir(&log_dir)
            .unwrap()
            .flatten()
            .filter(|entry| rotated_name.is_match(&entry.file_name().to_string_lossy()))
            .collect();
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].metadata().unwrap().len(), 11 * 1024 * 1024);

        // Second run finds only a fresh empty log and already-rotated files
        let again = LogRotation.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(again.items_affected, 0);
    }

    #[tokio::test]
    async fn test_log_rotation_creates_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path(), Arc::new(FakeProcesses::default()));

        let report = LogRotation.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.items_affected, 0);
        assert!(ctx.workspace.log_dir().is_dir());
    }

    #[tokio::test]
    async fn test_rotated_logs_are_not_rotated_again() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path(), Arc::new(FakeProcesses::default()));
        ctx.cleanup.log_rotation_bytes = 4;
        let log_dir = ctx.workspace.log_dir();
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join("server_20240101_120000.log"), b"old rotated content").unwrap();

        let report = LogRotation.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.items_affected, 0);
    }

    #[tokio::test]
    async fn test_disk_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path(), Arc::new(FakeProcesses::default()));
        let tmp = temp_dir.path().join("tmp");
        fs::create_dir_all(tmp.join("nested")).unwrap();
        fs::write(tmp.join("stale.tmp"), b"0123456789").unwrap();
        fs::write(tmp.join("nested").join("kept.tmp"), b"nested").unwrap();

        // Fresh files survive the default age limit
        let report = DiskCleanup.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.items_affected, 0);
        assert!(tmp.join("stale.tmp").exists());

        ctx.cleanup.max_temp_age_hours = 0;
        let report = DiskCleanup.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.items_affected, 1);
        assert_eq!(report.bytes_reclaimed, 10);
        assert!(!tmp.join("stale.tmp").exists());
        assert!(tmp.join("nested").join("kept.tmp").exists());
    }

    #[tokio::test]
    async fn test_disk_cleanup_without_scannable_dirs_fails() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path(), Arc::new(FakeProcesses::default()));
        ctx.cleanup.temp_dirs = vec![temp_dir.path().join("does-not-exist")];

        assert!(DiskCleanup.run(&ctx, CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_cleanup_stops() {
        let temp_dir = TempDir::new().unwrap();
        let mut ctx = context(temp_dir.path(), Arc::new(FakeProcesses::default()));
        ctx.cleanup.max_temp_age_hours = 0;
        let tmp = temp_dir.path().join("tmp");
        fs::create_dir_all(&tmp).unwrap();
        fs::write(tmp.join("a.tmp"), b"a").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = DiskCleanup.run(&ctx, cancel).await;
        assert!(matches!(result, Err(ActionError::Cancelled)));
        assert!(tmp.join("a.tmp").exists());
    }

    #[tokio::test]
    async fn test_memory_cleanup_succeeds() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = context(temp_dir.path(), Arc::new(FakeProcesses::default()));
        assert!(MemoryCleanup.run(&ctx, CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_service_restart() {
        let temp_dir = TempDir::new().unwrap();

        let ctx = context(temp_dir.path(), Arc::new(FakeProcesses::default()));
        assert!(matches!(
            ServiceRestart.run(&ctx, CancellationToken::new()).await,
            Err(ActionError::NotConfigured { .. })
        ));

        let process = Arc::new(FakeProcesses { running: vec!["api.py".to_string()], ..Default::default() });
        let mut ctx = context(temp_dir.path(), process.clone());
        ctx.services = vec![service("api"), service("worker")];
        let report = ServiceRestart.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.items_affected, 1);
        assert_eq!(*process.launched.lock().unwrap(), vec!["worker".to_string()]);

        let process = Arc::new(FakeProcesses { fail_launch: true, ..Default::default() });
        let mut ctx = context(temp_dir.path(), process);
        ctx.services = vec![service("worker")];
        assert!(matches!(
            ServiceRestart.run(&ctx, CancellationToken::new()).await,
            Err(ActionError::Launch { .. })
        ));
    }

    #[tokio::test]
    async fn test_temp_file_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let ctx = context(root, Arc::new(FakeProcesses::default()));

        fs::create_dir_all(root.join("agent/__pycache__")).unwrap();
        fs::write(root.join("agent/__pycache__/base.cpython-311.pyc"), b"bytecode").unwrap();
        fs::write(root.join("agent/base.py"), b"pass\n").unwrap();
        fs::write(root.join("notes.bak"), b"backup").unwrap();
        fs::write(root.join("server.log.old"), b"old").unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join(".git/index.tmp"), b"git").unwrap();

        let report = TempFileCleanup.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.items_affected, 3);
        assert!(!root.join("agent/__pycache__").exists());
        assert!(!root.join("notes.bak").exists());
        assert!(!root.join("server.log.old").exists());
        assert!(root.join("agent/base.py").exists());
        assert!(root.join(".git/index.tmp").exists());
    }

    #[tokio::test]
    async fn test_temp_cleanup_reaches_excluded_cache_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let mut ctx = context(root, Arc::new(FakeProcesses::default()));
        ctx.workspace.exclude_dirs.push("__pycache__".to_string());

        fs::create_dir_all(root.join("agent/__pycache__")).unwrap();
        fs::write(root.join("agent/__pycache__/server.cpython-311.pyc"), b"bytecode").unwrap();
        fs::create_dir_all(root.join("node_modules")).unwrap();
        fs::write(root.join("node_modules/cache.tmp"), b"kept").unwrap();

        let report = TempFileCleanup.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(report.items_affected, 1);
        assert!(!root.join("agent/__pycache__").exists());
        assert!(root.join("node_modules/cache.tmp").exists());
    }

    #[test]
    fn test_standard_mode() {
        assert_eq!(standard_mode(Path::new("run.sh"), false), 0o755);
        assert_eq!(standard_mode(Path::new("agent/server.py"), false), 0o755);
        assert_eq!(standard_mode(Path::new("README.md"), false), 0o644);
        assert_eq!(standard_mode(Path::new("agent"), true), 0o755);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_standardization() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let ctx = context(root, Arc::new(FakeProcesses::default()));

        fs::create_dir_all(root.join("agent")).unwrap();
        fs::write(root.join("agent/server.py"), b"pass\n").unwrap();
        fs::write(root.join("README.md"), b"docs\n").unwrap();
        fs::create_dir_all(root.join("node_modules")).unwrap();
        fs::write(root.join("node_modules/pkg.js"), b"").unwrap();
        fs::set_permissions(root.join("agent/server.py"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(root.join("README.md"), fs::Permissions::from_mode(0o777)).unwrap();
        fs::set_permissions(root.join("node_modules/pkg.js"), fs::Permissions::from_mode(0o600)).unwrap();

        FileStandardization.run(&ctx, CancellationToken::new()).await.unwrap();

        let mode = |path: &str| fs::metadata(root.join(path)).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode("agent/server.py"), 0o755);
        assert_eq!(mode("README.md"), 0o644);
        assert_eq!(mode("agent"), 0o755);
        assert_eq!(mode("node_modules/pkg.js"), 0o600);

        // Nothing left to change on a second pass
        let again = FileStandardization.run(&ctx, CancellationToken::new()).await.unwrap();
        assert_eq!(again.items_affected, 0);
    }
}
