#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proxy_audit::store::{PersistError, SnapshotSink};
use proxy_audit::tabular::TabularError;
use proxy_audit::transport::{ProbeFuture, ProbeTransport, RawProbe};
use proxy_audit::types::{Credential, ProbeOutcome};

pub const MOCK_IP: &str = "1.2.3.4";

#[derive(Debug, Default)]
pub struct ProbeStats {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub terminations: AtomicUsize,
}

struct InFlight(Arc<ProbeStats>);

impl InFlight {
    fn enter(stats: Arc<ProbeStats>) -> Self {
        stats.calls.fetch_add(1, Ordering::SeqCst);
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted transport: succeeds with [`MOCK_IP`] unless told otherwise per sequence index.
#[derive(Default)]
pub struct MockTransport {
    pub delay: Duration,
    pub hang: HashSet<usize>,
    pub fail: HashSet<usize>,
    pub panic_on: HashSet<usize>,
    pub stats: Arc<ProbeStats>,
}

impl MockTransport {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

impl ProbeTransport for MockTransport {
    fn probe(&self, credential: &Credential) -> ProbeFuture {
        let index = credential.sequence_index;
        let delay = if self.hang.contains(&index) {
            Duration::from_secs(600)
        } else {
            self.delay
        };
        let fail = self.fail.contains(&index);
        let panic = self.panic_on.contains(&index);
        let stats = self.stats.clone();
        Box::pin(async move {
            let _guard = InFlight::enter(stats);
            tokio::time::sleep(delay).await;
            if panic {
                panic!("mock transport panic for {index}");
            }
            if fail {
                return Ok(RawProbe {
                    exit_code: Some(7),
                    stdout: String::new(),
                    stderr: "curl: (7) Failed to connect".to_string(),
                    elapsed: delay,
                });
            }
            Ok(RawProbe {
                exit_code: Some(0),
                stdout: format!("{{\"ip\": \"{MOCK_IP}\"}}\n200,0.25,2048"),
                stderr: String::new(),
                elapsed: delay,
            })
        })
    }

    fn terminate_all(&self) {
        self.stats.terminations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Keeps every snapshot in memory instead of writing files.
#[derive(Default)]
pub struct MemorySink {
    pub snapshots: Mutex<Vec<Vec<ProbeOutcome>>>,
    pub fail: bool,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn snapshots(&self) -> Vec<Vec<ProbeOutcome>> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Vec<ProbeOutcome>> {
        self.snapshots.lock().unwrap().last().cloned()
    }
}

impl SnapshotSink for MemorySink {
    fn persist(&self, rows: &[ProbeOutcome]) -> Result<PathBuf, PersistError> {
        if self.fail {
            return Err(PersistError::Write(TabularError::NoSheet(PathBuf::from("disk-full.xlsx"))));
        }
        let mut snaps = self.snapshots.lock().unwrap();
        snaps.push(rows.to_vec());
        Ok(PathBuf::from(format!("memory-{}", snaps.len())))
    }
}

pub fn credentials(n: usize) -> Vec<Credential> {
    (0..n)
        .map(|i| Credential::new(i, format!("user{i}"), format!("pass{i}")))
        .collect()
}
