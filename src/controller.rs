use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use crate::progress::{LogEntry, RunContext, STATUS_LOG_TAIL};
use crate::scheduler::{self, SchedulerConfig, DEFAULT_BATCH_SIZE, DEFAULT_COLLECT_TIMEOUT};
use crate::store::{self, ResultStore, SharedStore, SnapshotSink, XlsxSink};
use crate::tabular::{self, TabularError};
use crate::transport::ProbeTransport;
use crate::types::{Credential, MAX_CONCURRENCY, MIN_CONCURRENCY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("concurrency must be between 1 and 500, got {0}")]
    InvalidConcurrency(usize),
    #[error(transparent)]
    Input(#[from] TabularError),
    #[error("loading input failed: {0}")]
    Load(String),
}

/// Read-only view handed to status pollers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub is_running: bool,
    pub phase: RunPhase,
    pub progress: u8,
    pub total: u64,
    pub current: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub concurrency: usize,
    pub last_error: Option<String>,
    pub log_messages: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Where reports go; `None` writes next to each input file.
    pub results_dir: Option<PathBuf>,
    pub batch_size: usize,
    pub collect_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            results_dir: None,
            batch_size: DEFAULT_BATCH_SIZE,
            collect_timeout: DEFAULT_COLLECT_TIMEOUT,
        }
    }
}

struct ControllerState {
    phase: RunPhase,
    concurrency: usize,
    ctx: Arc<RunContext>,
    store: SharedStore,
    sink: Option<Arc<dyn SnapshotSink>>,
    report_dir: Option<PathBuf>,
    task: Option<JoinHandle<()>>,
    last_error: Option<String>,
    /// Mirrors `phase` for callers that need to await a transition.
    phase_tx: watch::Sender<RunPhase>,
}

/// Owns the lifecycle of validation runs; at most one runs at a time.
#[derive(Clone)]
pub struct RunController {
    inner: Arc<RwLock<ControllerState>>,
    transport: Arc<dyn ProbeTransport>,
    opts: ControllerOptions,
}

impl RunController {
    pub fn new(transport: Arc<dyn ProbeTransport>, opts: ControllerOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ControllerState {
                phase: RunPhase::Idle,
                concurrency: crate::types::DEFAULT_CONCURRENCY,
                ctx: Arc::new(RunContext::new()),
                store: Arc::new(Mutex::new(ResultStore::new())),
                sink: None,
                report_dir: opts.results_dir.clone(),
                task: None,
                last_error: None,
                phase_tx: watch::Sender::new(RunPhase::Idle),
            })),
            transport,
            opts,
        }
    }

    pub fn validate_concurrency(concurrency: usize) -> Result<usize, ControlError> {
        if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            Ok(concurrency)
        } else {
            Err(ControlError::InvalidConcurrency(concurrency))
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.phase == RunPhase::Running
    }

    /// Load `path` and start a run that writes its reports as xlsx files.
    pub async fn start_file(&self, path: &Path, concurrency: usize) -> Result<(), ControlError> {
        Self::validate_concurrency(concurrency)?;
        if self.is_running().await {
            return Err(ControlError::AlreadyRunning);
        }
        let owned = path.to_path_buf();
        let credentials = tokio::task::spawn_blocking(move || tabular::load_credentials(&owned))
            .await
            .map_err(|e| ControlError::Load(e.to_string()))??;
        let sink = XlsxSink::for_input(path, self.opts.results_dir.as_deref());
        let dir = sink.dir().to_path_buf();
        let preamble = vec![
            format!("processing {}", path.display()),
            format!("results will be saved in {}", dir.display()),
        ];
        self.launch(credentials, concurrency, Arc::new(sink), Some(dir), preamble)
            .await
    }

    /// Reset all per-run state and launch the scheduler in the background.
    pub async fn start(
        &self,
        credentials: Vec<Credential>,
        concurrency: usize,
        sink: Arc<dyn SnapshotSink>,
    ) -> Result<(), ControlError> {
        self.launch(credentials, concurrency, sink, None, Vec::new())
            .await
    }

    async fn launch(
        &self,
        credentials: Vec<Credential>,
        concurrency: usize,
        sink: Arc<dyn SnapshotSink>,
        report_dir: Option<PathBuf>,
        preamble: Vec<String>,
    ) -> Result<(), ControlError> {
        Self::validate_concurrency(concurrency)?;
        let mut s = self.inner.write().await;
        if s.phase == RunPhase::Running {
            return Err(ControlError::AlreadyRunning);
        }

        let ctx = Arc::new(RunContext::new());
        let store: SharedStore = Arc::new(Mutex::new(ResultStore::new()));
        ctx.set_total(credentials.len() as u64);
        for line in preamble {
            ctx.record_message(line);
        }

        s.phase = RunPhase::Running;
        s.phase_tx.send_replace(RunPhase::Running);
        s.concurrency = concurrency;
        s.ctx = ctx.clone();
        s.store = store.clone();
        s.sink = Some(sink.clone());
        s.last_error = None;
        if let Some(dir) = report_dir {
            s.report_dir = Some(dir);
        }

        let cfg = SchedulerConfig {
            batch_size: self.opts.batch_size,
            concurrency,
            collect_timeout: self.opts.collect_timeout,
        };
        info!(total = credentials.len(), concurrency, "run starting");
        s.task = Some(tokio::spawn(supervise(
            self.inner.clone(),
            self.transport.clone(),
            credentials,
            cfg,
            ctx,
            store,
            sink,
        )));
        Ok(())
    }

    /// Ask the running run to wind down. Probes already dispatched finish normally.
    pub async fn stop(&self) -> bool {
        let s = self.inner.read().await;
        if s.phase != RunPhase::Running {
            return false;
        }
        s.ctx.record_message("stop requested, finishing in-flight probes");
        s.ctx.cancel();
        info!("run stop requested");
        true
    }

    /// Hard stop for process exit: cancel, kill every probe process, give the current window
    /// up to `collect_timeout` to record what the killed probes returned, then persist.
    pub async fn shutdown(&self) -> Option<PathBuf> {
        let (ctx, store, sink, running, mut phase_rx) = {
            let s = self.inner.read().await;
            (
                s.ctx.clone(),
                s.store.clone(),
                s.sink.clone(),
                s.phase == RunPhase::Running,
                s.phase_tx.subscribe(),
            )
        };
        ctx.cancel();
        self.transport.terminate_all();
        if !running {
            return None;
        }
        ctx.record_message("interrupted, saving results");

        let drained = time::timeout(
            self.opts.collect_timeout,
            phase_rx.wait_for(|p| *p != RunPhase::Running),
        )
        .await
        .is_ok();
        if !drained {
            warn!("run did not drain in time; saving what was recorded");
        }

        let sink = sink?;
        store::flush(&store, &sink, &ctx).await
    }

    /// Wait for the background run, if any, to finish.
    pub async fn wait(&self) {
        let task = self.inner.write().await.task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "run supervisor task failed");
            }
        }
    }

    pub async fn status(&self) -> StatusView {
        let s = self.inner.read().await;
        let view = s.ctx.progress(STATUS_LOG_TAIL);
        StatusView {
            is_running: s.phase == RunPhase::Running,
            phase: s.phase,
            progress: view.counters.percent(),
            total: view.counters.total,
            current: view.counters.current,
            success_count: view.counters.success,
            failure_count: view.counters.failure,
            concurrency: s.concurrency,
            last_error: s.last_error.clone(),
            log_messages: view.log,
        }
    }

    /// Most recently written report in the current report directory.
    pub async fn latest_result_file(&self) -> Option<PathBuf> {
        let dir = self
            .inner
            .read()
            .await
            .report_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        store::latest_result_file(&dir)
    }
}

async fn supervise(
    inner: Arc<RwLock<ControllerState>>,
    transport: Arc<dyn ProbeTransport>,
    credentials: Vec<Credential>,
    cfg: SchedulerConfig,
    ctx: Arc<RunContext>,
    store: SharedStore,
    sink: Arc<dyn SnapshotSink>,
) {
    let (phase, err) = match transport.preflight().await {
        Err(e) => {
            error!(error = %e, "probe transport unavailable");
            ctx.record_message(format!("error: {e}"));
            (RunPhase::Failed, Some(e.to_string()))
        }
        Ok(()) => {
            let run = tokio::spawn(scheduler::execute(
                credentials,
                cfg,
                ctx.clone(),
                store.clone(),
                transport,
                sink.clone(),
            ));
            match run.await {
                Ok(Ok(summary)) if summary.cancelled => {
                    info!(outcomes = summary.outcomes, "run stopped");
                    (RunPhase::Stopped, None)
                }
                Ok(Ok(summary)) => {
                    info!(outcomes = summary.outcomes, "run completed");
                    (RunPhase::Completed, None)
                }
                Ok(Err(e)) => {
                    error!(error = %e, "run failed");
                    (RunPhase::Failed, Some(e.to_string()))
                }
                Err(e) => {
                    error!(error = %e, "run task panicked; writing final snapshot");
                    ctx.record_message(format!("run crashed: {e}"));
                    store::flush(&store, &sink, &ctx).await;
                    (RunPhase::Failed, Some(e.to_string()))
                }
            }
        }
    };

    let mut s = inner.write().await;
    if Arc::ptr_eq(&s.ctx, &ctx) {
        s.phase = phase;
        s.phase_tx.send_replace(phase);
        s.last_error = err;
    } else {
        warn!("finished run no longer current; state left untouched");
    }
}
