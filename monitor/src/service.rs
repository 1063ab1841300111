//! Monitor service
//!
//! Owns the single worker task that drives a [`Monitor`]. Work arrives from
//! three sources: the interval job on the cron scheduler, OS signals
//! (`SIGUSR1` for cleanup, `SIGUSR2` for diagnostics) and [`MonitorService::trigger`].
//! Everything goes through one queue so at most one work item runs at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::monitor::{Monitor, WorkKind, WorkReport};

const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Service state
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub status: ServiceStatus,

    /// Completion time of the last work item
    pub last_run: Option<DateTime<Utc>>,

    pub last_kind: Option<WorkKind>,

    pub stats: WorkStats,
}

/// Service status
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStatus {
    Starting,
    Running,
    Processing,
    Stopping,
    Stopped,
    Error(String),
}

/// Work statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkStats {
    pub total_runs: u64,
    pub routine_checks: u64,
    pub diagnostics_runs: u64,
    pub cleanup_runs: u64,
    pub alerts_raised: u64,
    pub unresolved_alerts: u64,
    pub coalesced_triggers: u64,
}

impl WorkStats {
    fn record(&mut self, report: &WorkReport) {
        self.total_runs += 1;
        let check = match report {
            WorkReport::RoutineCheck(check) => {
                self.routine_checks += 1;
                check
            }
            WorkReport::Diagnostics(check) => {
                self.diagnostics_runs += 1;
                check
            }
            WorkReport::Cleanup(_) => {
                self.cleanup_runs += 1;
                return;
            }
        };
        self.alerts_raised += check.alerts.len() as u64;
        self.unresolved_alerts += check.alerts.iter().filter(|alert| !alert.resolved()).count() as u64;
    }
}

/// Sending half of the work queue
///
/// Each kind has a pending flag that is set on enqueue and cleared when the
/// worker dequeues it, so a kind that is already waiting is not queued twice.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<WorkKind>,
    pending: Arc<[AtomicBool; 3]>,
    coalesced: Arc<AtomicU64>,
}

impl WorkQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<WorkKind>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            pending: Arc::new([AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)]),
            coalesced: Arc::new(AtomicU64::new(0)),
        };
        (queue, rx)
    }

    /// Queue `kind`; false when it was coalesced or the worker is gone
    pub fn enqueue(&self, kind: WorkKind) -> bool {
        let flag = &self.pending[kind.index()];
        if flag.swap(true, Ordering::AcqRel) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %kind, "Work already pending, coalesced");
            return false;
        }

        if self.tx.send(kind).is_err() {
            flag.store(false, Ordering::Release);
            warn!(kind = %kind, "Worker is not running, trigger dropped");
            return false;
        }
        true
    }

    fn dequeued(&self, kind: WorkKind) {
        self.pending[kind.index()].store(false, Ordering::Release);
    }

    fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

/// Monitor service
pub struct MonitorService {
    config: MonitorConfig,

    monitor: Option<Monitor>,

    queue: WorkQueue,

    receiver: Option<mpsc::UnboundedReceiver<WorkKind>>,

    reports: broadcast::Sender<WorkReport>,

    state: Arc<RwLock<ServiceState>>,

    scheduler: Option<JobScheduler>,

    cancel: CancellationToken,

    worker: Option<JoinHandle<()>>,

    signals: Option<JoinHandle<()>>,
}

impl MonitorService {
    /// Service over a monitor for the local host
    pub fn new(config: MonitorConfig) -> Result<Self> {
        let cancel = CancellationToken::new();
        let monitor = Monitor::new(config.clone(), cancel.clone())?;
        Ok(Self::with_monitor(monitor, cancel))
    }

    /// Service over an existing monitor
    ///
    /// `cancel` must be the token the monitor's responder was built with so
    /// that stopping the service also interrupts in-flight actions.
    pub fn with_monitor(monitor: Monitor, cancel: CancellationToken) -> Self {
        let (queue, receiver) = WorkQueue::new();
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let state = Arc::new(RwLock::new(ServiceState {
            status: ServiceStatus::Stopped,
            last_run: None,
            last_kind: None,
            stats: WorkStats::default(),
        }));

        Self {
            config: monitor.config().clone(),
            monitor: Some(monitor),
            queue,
            receiver: Some(receiver),
            reports,
            state,
            scheduler: None,
            cancel,
            worker: None,
            signals: None,
        }
    }

    /// Start the worker, the interval job and the signal listener
    pub async fn start(&mut self) -> Result<()> {
        let (Some(monitor), Some(receiver)) = (self.monitor.take(), self.receiver.take()) else {
            return Err(MonitorError::Generic("monitor service was already started".to_string()));
        };

        info!(
            check_interval_secs = self.config.scheduling.check_interval_secs,
            auto_remediate = self.config.auto_remediate,
            "Starting monitor service"
        );
        self.state.write().await.status = ServiceStatus::Starting;

        if let Err(e) = self.schedule_routine_checks().await {
            self.state.write().await.status = ServiceStatus::Error(e.to_string());
            return Err(e);
        }

        self.signals = Some(tokio::spawn(listen_for_signals(self.queue.clone(), self.cancel.clone())));

        // Running must be set before the worker can flip it to Processing
        self.state.write().await.status = ServiceStatus::Running;
        self.worker = Some(tokio::spawn(run_worker(
            monitor,
            receiver,
            self.queue.clone(),
            self.reports.clone(),
            Arc::clone(&self.state),
            self.cancel.clone(),
        )));

        info!("Monitor service started");
        Ok(())
    }

    async fn schedule_routine_checks(&mut self) -> Result<()> {
        let scheduler = JobScheduler::new().await?;
        let interval = self.config.scheduling.check_interval();
        let queue = self.queue.clone();

        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let queue = queue.clone();
            Box::pin(async move {
                queue.enqueue(WorkKind::RoutineCheck);
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;
        self.scheduler = Some(scheduler);

        info!(interval_secs = interval.as_secs(), "Scheduled routine checks");
        Ok(())
    }

    /// Queue a work item; false when an item of this kind is already waiting
    pub fn trigger(&self, kind: WorkKind) -> bool {
        info!(kind = %kind, "Work triggered");
        self.queue.enqueue(kind)
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Receive every report completed after this call
    pub fn subscribe(&self) -> broadcast::Receiver<WorkReport> {
        self.reports.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Get service status
    pub async fn get_status(&self) -> ServiceState {
        let mut state = self.state.read().await.clone();
        state.stats.coalesced_triggers = self.queue.coalesced();
        state
    }

    /// Stop the service and wait for the worker to exit
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping monitor service");
        self.state.write().await.status = ServiceStatus::Stopping;

        self.cancel.cancel();

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown().await?;
        }

        if let Some(signals) = self.signals.take() {
            signals.abort();
        }

        let mut final_status = ServiceStatus::Stopped;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Monitor worker terminated abnormally");
                final_status = ServiceStatus::Error(e.to_string());
            }
        }

        self.state.write().await.status = final_status;
        info!("Monitor service stopped");
        Ok(())
    }

    /// Block until SIGTERM or SIGINT
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        wait_for_shutdown_signal().await
    }
}

async fn run_worker(
    mut monitor: Monitor,
    mut receiver: mpsc::UnboundedReceiver<WorkKind>,
    queue: WorkQueue,
    reports: broadcast::Sender<WorkReport>,
    state: Arc<RwLock<ServiceState>>,
    cancel: CancellationToken,
) {
    debug!("Monitor worker started");

    loop {
        let kind = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Some(kind) => kind,
                None => break,
            },
        };
        queue.dequeued(kind);

        state.write().await.status = ServiceStatus::Processing;

        let report = monitor.execute(kind).await;

        {
            let mut state = state.write().await;
            if state.status == ServiceStatus::Processing {
                state.status = ServiceStatus::Running;
            }
            state.last_run = Some(Utc::now());
            state.last_kind = Some(kind);
            state.stats.record(&report);
        }

        // No subscribers is fine
        let _ = reports.send(report);
    }

    debug!("Monitor worker exited");
}

#[cfg(unix)]
async fn listen_for_signals(queue: WorkQueue, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut cleanup, mut diagnostics) =
        match (signal(SignalKind::user_defined1()), signal(SignalKind::user_defined2())) {
            (Ok(cleanup), Ok(diagnostics)) => (cleanup, diagnostics),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers, signal triggers disabled");
                return;
            }
        };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = cleanup.recv() => {
                info!("Received SIGUSR1, queueing cleanup");
                queue.enqueue(WorkKind::Cleanup);
            }
            _ = diagnostics.recv() => {
                info!("Received SIGUSR2, queueing diagnostics");
                queue.enqueue(WorkKind::Diagnostics);
            }
        }
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(_queue: WorkQueue, cancel: CancellationToken) {
    warn!("Signal triggers are only available on unix");
    cancel.cancelled().await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, initiating graceful shutdown");
    Ok(())
}
