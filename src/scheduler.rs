use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

use crate::progress::RunContext;
use crate::store::{self, SharedStore, SnapshotSink};
use crate::transport::{probe_credential, ProbeTransport, EMPTY_CREDENTIAL_NOTE};
use crate::types::{Credential, ProbeOutcome, Verdict};

pub const DEFAULT_BATCH_SIZE: usize = 200;
/// Caller-side bound on waiting for one probe, independent of the transport's own deadline.
pub const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub collect_timeout: Duration,
}

impl SchedulerConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency,
            collect_timeout: DEFAULT_COLLECT_TIMEOUT,
        }
    }
}

/// What a finished (or cancelled) run got through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub windows_total: usize,
    pub windows_done: usize,
    pub outcomes: usize,
    pub cancelled: bool,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("worker pool closed unexpectedly")]
    PoolClosed,
}

/// Number of windows `n` credentials split into.
pub fn window_count(n: usize, batch_size: usize) -> usize {
    n.div_ceil(batch_size.max(1))
}

/// Probe every credential window by window, persisting after each window.
///
/// - At most `concurrency` probes are in flight: a permit is taken before a task is spawned.
/// - Each probe is bounded by `collect_timeout`; a late probe becomes a failure.
/// - Cancellation is checked before every submission and between windows; tasks already
///   dispatched are allowed to finish.
///
/// Does not write the final snapshot; see [`execute`].
pub async fn run_batches(
    credentials: &[Credential],
    cfg: &SchedulerConfig,
    ctx: Arc<RunContext>,
    store: SharedStore,
    transport: Arc<dyn ProbeTransport>,
    sink: Arc<dyn SnapshotSink>,
) -> Result<RunSummary, SchedulerError> {
    let batch_size = cfg.batch_size.max(1);
    let sem = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
    let cancel = ctx.cancel_token();
    let mut summary = RunSummary {
        windows_total: window_count(credentials.len(), batch_size),
        ..RunSummary::default()
    };

    for (window_no, window) in credentials.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        debug!(window = window_no, size = window.len(), "window started");

        let mut recorded = 0usize;
        let mut set = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Credential> = HashMap::new();

        for cred in window {
            if cancel.is_cancelled() {
                break;
            }
            if !cred.is_valid() {
                let outcome =
                    ProbeOutcome::from_verdict(cred, Verdict::failure(EMPTY_CREDENTIAL_NOTE));
                commit(&store, &ctx, outcome).await;
                recorded += 1;
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                p = sem.clone().acquire_owned() => p.map_err(|_| SchedulerError::PoolClosed)?,
            };

            let cred_task = cred.clone();
            let ctx_task = ctx.clone();
            let store_task = store.clone();
            let transport = transport.clone();
            let limit = cfg.collect_timeout;
            let handle = set.spawn(async move {
                let _permit = permit;
                let probe = probe_credential(transport.as_ref(), &cred_task);
                let verdict = match time::timeout(limit, probe).await {
                    Ok(v) => v,
                    Err(_) => Verdict::failure(format!(
                        "failure - timed out waiting for result ({}s)",
                        limit.as_secs()
                    )),
                };
                let outcome = ProbeOutcome::from_verdict(&cred_task, verdict);
                commit(&store_task, &ctx_task, outcome).await;
            });
            in_flight.insert(handle.id(), cred.clone());
        }

        while let Some(res) = set.join_next_with_id().await {
            match res {
                Ok((id, ())) => {
                    in_flight.remove(&id);
                    recorded += 1;
                }
                Err(err) => {
                    let Some(cred) = in_flight.remove(&err.id()) else {
                        warn!(error = %err, "probe task failed with unknown id");
                        continue;
                    };
                    warn!(index = cred.sequence_index, error = %err, "probe task failed");
                    let outcome = ProbeOutcome::from_verdict(
                        &cred,
                        Verdict::failure(format!("probe task error: {err}")),
                    );
                    commit(&store, &ctx, outcome).await;
                    recorded += 1;
                }
            }
        }

        summary.outcomes += recorded;
        summary.windows_done += 1;

        let c = ctx.counters();
        info!(
            window = window_no + 1,
            of = summary.windows_total,
            done = c.current,
            total = c.total,
            success = c.success,
            failure = c.failure,
            "window finished"
        );
        store::flush(&store, &sink, &ctx).await;
    }

    summary.cancelled = cancel.is_cancelled();
    Ok(summary)
}

/// Stored before counted, so every counted outcome is already in the store.
async fn commit(store: &SharedStore, ctx: &RunContext, outcome: ProbeOutcome) {
    store.lock().await.append([outcome.clone()]);
    ctx.record_outcome(&outcome);
}

/// Full run: announce, schedule every window, and always write one last snapshot.
pub async fn execute(
    credentials: Vec<Credential>,
    cfg: SchedulerConfig,
    ctx: Arc<RunContext>,
    store: SharedStore,
    transport: Arc<dyn ProbeTransport>,
    sink: Arc<dyn SnapshotSink>,
) -> Result<RunSummary, SchedulerError> {
    ctx.set_total(credentials.len() as u64);
    ctx.record_message(format!(
        "found {} records, testing with concurrency {}",
        credentials.len(),
        cfg.concurrency
    ));

    let res = run_batches(
        &credentials,
        &cfg,
        ctx.clone(),
        store.clone(),
        transport,
        sink.clone(),
    )
    .await;

    match &res {
        Ok(s) if s.cancelled => {
            ctx.record_message(format!("run stopped after {} results", s.outcomes))
        }
        Ok(s) => ctx.record_message(format!("run finished: {} results", s.outcomes)),
        Err(e) => ctx.record_message(format!("run aborted: {e}")),
    }
    store::flush(&store, &sink, &ctx).await;
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_count_is_ceiling() {
        assert_eq!(window_count(0, 200), 0);
        assert_eq!(window_count(1, 200), 1);
        assert_eq!(window_count(200, 200), 1);
        assert_eq!(window_count(201, 200), 2);
        assert_eq!(window_count(1000, 200), 5);
        assert_eq!(window_count(7, 0), 7);
    }
}
