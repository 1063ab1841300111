//! Agent platform monitor entry point
//!
//! Runs the monitoring daemon, a single diagnostics pass, or small operator
//! commands against the audit log and a running daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use agent_monitor::{AuditLog, Monitor, MonitorConfig, MonitorService, WorkKind, WorkReport};

const PID_FILE_NAME: &str = "agent-monitor.pid";

/// Agent platform monitor command line interface
#[derive(Parser)]
#[command(name = "agent-monitor")]
#[command(about = "Platform monitor with threshold alerts, automated remediation and audit logging")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Run one diagnostics pass, print the report and exit
    #[arg(long)]
    once: bool,

    /// PID file written by the daemon and read by `trigger`
    #[arg(long)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl Cli {
    fn runs_once(&self) -> bool {
        self.once || matches!(self.command, Some(Commands::Once))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitoring daemon
    Run,

    /// Run one diagnostics pass and print the report as JSON
    Once,

    /// Ask a running daemon to perform work now
    Trigger {
        #[arg(value_enum)]
        kind: TriggerKind,
    },

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Summarize the audit log and print its latest records
    Audit {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerKind {
    /// Temporary files, permissions and log rotation (SIGUSR1)
    Cleanup,
    /// Full system check (SIGUSR2)
    Diagnostics,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Warnings raised while loading configuration go to stderr
    let bootstrap = fmt().with_writer(std::io::stderr).with_target(false).finish();
    let config = match tracing::subscriber::with_default(bootstrap, || load_configuration(&cli)) {
        Ok(config) => config,
        Err(e) if cli.runs_once() => {
            print_once_output(&once_output(Err(format!("Failed to load configuration: {e:#}"))));
            return;
        }
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            process::exit(1);
        }
    };

    let _guard = match initialize_logging(&cli, &config) {
        Ok(guard) => guard,
        Err(e) if cli.runs_once() => {
            print_once_output(&once_output(Err(format!("Failed to initialize logging: {e:#}"))));
            return;
        }
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            process::exit(1);
        }
    };

    if cli.runs_once() {
        run_once(config).await;
        return;
    }

    let result = match &cli.command {
        Some(Commands::Run) | None => run_daemon(&cli, config).await,
        Some(Commands::Once) => {
            run_once(config).await;
            Ok(())
        }
        Some(Commands::Trigger { kind }) => trigger(&cli, &config, *kind),
        Some(Commands::Config { show }) => handle_config(&config, *show),
        Some(Commands::Audit { limit }) => show_audit(&config, *limit).await,
    };

    if let Err(e) = result {
        error!("Command failed: {e:#}");
        process::exit(1);
    }
}

/// Initialize logging based on configuration and flags
fn initialize_logging(cli: &Cli, config: &MonitorConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let requested = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level = match requested.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("agent_monitor={log_level}").parse()?)
        .add_directive("tokio_cron_scheduler=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    // stdout carries command output only
    let json = cli.json_logs || config.logging.json;
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    });

    let mut guard = None;
    if let Some(path) = &config.logging.file_path {
        let path = config.workspace.resolve(path);
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let file_name = path.file_name().ok_or_else(|| anyhow!("log file path {} has no file name", path.display()))?;
        fs::create_dir_all(&directory).with_context(|| format!("creating {}", directory.display()))?;

        let (writer, file_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&directory, file_name));
        layers.push(if json {
            fmt::layer().json().with_writer(writer).boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        });
        guard = Some(file_guard);
    }

    tracing_subscriber::registry().with(layers).with(filter).init();
    Ok(guard)
}

/// Load configuration: explicit file, default location, then defaults
fn load_configuration(cli: &Cli) -> anyhow::Result<MonitorConfig> {
    let path = match &cli.config {
        Some(path) if !path.exists() => return Err(anyhow!("configuration file {} does not exist", path.display())),
        Some(path) => Some(path.clone()),
        None => MonitorConfig::default_config_path().ok(),
    };

    match &path {
        Some(path) if path.exists() => info!("Loading configuration from: {}", path.display()),
        _ => info!("Using default configuration"),
    }

    Ok(MonitorConfig::load_with_fallback(path)?)
}

/// Start the daemon and block until SIGTERM or SIGINT
async fn run_daemon(cli: &Cli, config: MonitorConfig) -> anyhow::Result<()> {
    let pid_file = pid_file_path(cli, &config);
    if let Some(parent) = pid_file.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(&pid_file, process::id().to_string()).with_context(|| format!("writing {}", pid_file.display()))?;
    info!(pid = process::id(), pid_file = %pid_file.display(), "Created PID file");

    let mut service = MonitorService::new(config)?;
    service.start().await?;

    service.wait_for_shutdown().await?;

    info!("Initiating graceful shutdown");
    service.stop().await?;

    if let Err(e) = fs::remove_file(&pid_file) {
        error!(pid_file = %pid_file.display(), error = %e, "Failed to remove PID file");
    }
    Ok(())
}

/// One diagnostics pass; always exits successfully
async fn run_once(config: MonitorConfig) {
    let outcome = match Monitor::new(config, CancellationToken::new()) {
        Ok(mut monitor) => Ok(monitor.execute(WorkKind::Diagnostics).await),
        Err(e) => {
            error!(error = %e, "Failed to initialize monitor");
            Err(e.to_string())
        }
    };
    print_once_output(&once_output(outcome));
}

/// JSON document printed by `--once`: a report or the error that prevented one
fn once_output(outcome: Result<WorkReport, String>) -> serde_json::Value {
    match outcome {
        Ok(report) => json!({ "report": report, "error": null }),
        Err(message) => json!({ "report": null, "error": message }),
    }
}

fn print_once_output(output: &serde_json::Value) {
    match serde_json::to_string_pretty(output) {
        Ok(text) => println!("{text}"),
        Err(e) => println!("{}", json!({ "report": null, "error": e.to_string() })),
    }
}

#[cfg(unix)]
fn trigger(cli: &Cli, config: &MonitorConfig, kind: TriggerKind) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_file = pid_file_path(cli, config);
    let contents = fs::read_to_string(&pid_file)
        .with_context(|| format!("reading {}; is the daemon running?", pid_file.display()))?;
    let pid: i32 = contents
        .trim()
        .parse()
        .with_context(|| format!("{} does not contain a process id", pid_file.display()))?;

    let (signal, work) = match kind {
        TriggerKind::Cleanup => (Signal::SIGUSR1, WorkKind::Cleanup),
        TriggerKind::Diagnostics => (Signal::SIGUSR2, WorkKind::Diagnostics),
    };
    kill(Pid::from_raw(pid), signal).with_context(|| format!("signalling process {pid}"))?;

    info!(pid, signal = %signal, kind = %work, "Trigger sent");
    println!("Sent {signal} to agent-monitor (pid {pid}) for {work}");
    Ok(())
}

#[cfg(not(unix))]
fn trigger(_cli: &Cli, _config: &MonitorConfig, _kind: TriggerKind) -> anyhow::Result<()> {
    Err(anyhow!("signal triggers are only available on unix"))
}

/// Handle configuration commands
fn handle_config(config: &MonitorConfig, show: bool) -> anyhow::Result<()> {
    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        config.validate()?;
        println!("Configuration is valid");
    }

    Ok(())
}

async fn show_audit(config: &MonitorConfig, limit: usize) -> anyhow::Result<()> {
    let log = AuditLog::new(config.workspace.audit_log_path());
    let summary = log.summary(chrono::Utc::now()).await?;

    println!("Audit log: {}", log.path().display());
    println!("{}", serde_json::to_string_pretty(&summary)?);

    for record in log.tail(limit).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn pid_file_path(cli: &Cli, config: &MonitorConfig) -> PathBuf {
    cli.pid_file
        .clone()
        .unwrap_or_else(|| config.workspace.log_dir().join(PID_FILE_NAME))
}
