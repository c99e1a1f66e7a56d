use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::types::{now_local_clock, ProbeOutcome};

/// Entries kept in the run log before the oldest are dropped.
pub const LOG_CAPACITY: usize = 1000;
/// Entries returned to a status poller.
pub const STATUS_LOG_TAIL: usize = 100;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub time: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub total: u64,
    pub current: u64,
    pub success: u64,
    pub failure: u64,
}

impl Counters {
    /// floor(100 * current / total), clamped to 0..=100; 0 when nothing is scheduled.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = self.current.saturating_mul(100) / self.total;
        pct.min(100) as u8
    }
}

/// Consistent copy of counters plus the newest log entries.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ProgressView {
    pub counters: Counters,
    pub log: Vec<LogEntry>,
}

#[derive(Debug)]
struct Inner {
    counters: Counters,
    log: VecDeque<LogEntry>,
    capacity: usize,
}

impl Inner {
    fn push(&mut self, message: String) {
        self.log.push_back(LogEntry {
            time: now_local_clock(),
            message,
        });
        if self.log.len() > self.capacity {
            let excess = self.log.len() - self.capacity;
            self.log.drain(..excess);
        }
    }
}

/// Per-run shared state: counters, the bounded log and the cancellation token.
///
/// Counters and log sit behind one lock so a poller never sees a count without its log line
/// or a `current` that disagrees with `success + failure`.
#[derive(Debug)]
pub struct RunContext {
    inner: Mutex<Inner>,
    cancel: CancellationToken,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                counters: Counters::default(),
                log: VecDeque::new(),
                capacity: capacity.max(1),
            }),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_total(&self, total: u64) {
        self.lock().counters.total = total;
    }

    pub fn record_outcome(&self, outcome: &ProbeOutcome) {
        let mut inner = self.lock();
        inner.counters.current += 1;
        if outcome.is_success() {
            inner.counters.success += 1;
        } else {
            inner.counters.failure += 1;
        }
        inner.push(outcome.log_line());
    }

    pub fn record_message(&self, message: impl Into<String>) {
        self.lock().push(message.into());
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn log_len(&self) -> usize {
        self.lock().log.len()
    }

    pub fn progress(&self, tail: usize) -> ProgressView {
        let inner = self.lock();
        let skip = inner.log.len().saturating_sub(tail);
        ProgressView {
            counters: inner.counters,
            log: inner.log.iter().skip(skip).cloned().collect(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
