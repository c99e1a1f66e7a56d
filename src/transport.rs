use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::parser::parse_probe;
use crate::types::{Credential, Verdict, PROXY_HOST, PROXY_PORT, TARGET_URL};

/// `-w` format: appended to the body so one stdout carries both payload and timings.
pub const STATS_FORMAT: &str = "%{http_code},%{time_total},%{speed_download}";

pub const EMPTY_CREDENTIAL_NOTE: &str = "invalid credential: account or password is empty";

/// Captured output of one external probe process.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProbe {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall time measured around the process, from spawn to exit.
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error while waiting for probe: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection timed out ({}s)", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Unavailable(String),
}

pub type ProbeFuture = Pin<Box<dyn Future<Output = Result<RawProbe, TransportError>> + Send>>;
pub type PreflightFuture = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send>>;

/// Something able to push one credential through the upstream proxy.
pub trait ProbeTransport: Send + Sync {
    fn probe(&self, credential: &Credential) -> ProbeFuture;

    /// Checked once before a run starts.
    fn preflight(&self) -> PreflightFuture {
        Box::pin(async { Ok(()) })
    }

    /// Best-effort termination of every probe still in flight.
    fn terminate_all(&self) {}
}

/// Probe one credential and turn every possible result into a [`Verdict`].
pub async fn probe_credential(transport: &dyn ProbeTransport, credential: &Credential) -> Verdict {
    if !credential.is_valid() {
        return Verdict::failure(EMPTY_CREDENTIAL_NOTE);
    }
    match transport.probe(credential).await {
        Ok(raw) => parse_probe(&raw),
        Err(err @ TransportError::Timeout(_)) => Verdict::failure(format!("failure - {err}")),
        Err(err) => Verdict::failure(format!("probe error: {err}")),
    }
}

#[derive(Debug, Clone)]
pub struct CurlOptions {
    pub program: PathBuf,
    /// Passed to curl as `--connect-timeout`.
    pub connect_timeout: Duration,
    /// Passed to curl as `--max-time`.
    pub max_time: Duration,
    /// Enforced by us; curl does not always honour its own limits during DNS/TLS stalls.
    pub supervise_timeout: Duration,
}

impl Default for CurlOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("curl"),
            connect_timeout: Duration::from_secs(5),
            max_time: Duration::from_secs(10),
            supervise_timeout: Duration::from_secs(15),
        }
    }
}

/// Runs `curl` through the SOCKS5 proxy, one process (and process group) per probe.
#[derive(Debug, Clone, Default)]
pub struct CurlTransport {
    opts: CurlOptions,
    live_groups: Arc<Mutex<HashSet<i32>>>,
}

impl CurlTransport {
    pub fn new(opts: CurlOptions) -> Self {
        Self {
            opts,
            live_groups: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn options(&self) -> &CurlOptions {
        &self.opts
    }

    /// Number of probe processes currently running.
    pub fn live_count(&self) -> usize {
        self.live_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn command(&self, credential: &Credential) -> Command {
        let mut cmd = Command::new(&self.opts.program);
        cmd.arg("-x")
            .arg(format!("socks5://{PROXY_HOST}:{PROXY_PORT}"))
            .arg("--proxy-user")
            .arg(format!("{}:{}", credential.account, credential.secret))
            .arg("--connect-timeout")
            .arg(self.opts.connect_timeout.as_secs().to_string())
            .arg("--max-time")
            .arg(self.opts.max_time.as_secs().to_string())
            .arg("-s")
            .arg("-w")
            .arg(STATS_FORMAT)
            .arg(TARGET_URL)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl ProbeTransport for CurlTransport {
    fn probe(&self, credential: &Credential) -> ProbeFuture {
        let mut cmd = self.command(credential);
        let program = self.opts.program.display().to_string();
        let deadline = self.opts.supervise_timeout;
        let live_groups = self.live_groups.clone();
        let index = credential.sequence_index;

        Box::pin(async move {
            let start = Instant::now();
            let child = cmd.spawn().map_err(|source| TransportError::Spawn {
                program: program.clone(),
                source,
            })?;
            let guard = ProcessGroupGuard::register(child.id(), live_groups);
            debug!(index, pid = ?child.id(), "probe spawned");

            match time::timeout(deadline, child.wait_with_output()).await {
                Ok(Ok(output)) => {
                    guard.release();
                    Ok(RawProbe {
                        exit_code: output.status.code(),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                        elapsed: start.elapsed(),
                    })
                }
                Ok(Err(e)) => Err(TransportError::Io(e)),
                Err(_) => {
                    warn!(
                        index,
                        timeout_secs = deadline.as_secs(),
                        "probe exceeded supervisory timeout; killing process group"
                    );
                    Err(TransportError::Timeout(deadline))
                }
            }
        })
    }

    fn preflight(&self) -> PreflightFuture {
        let program = self.opts.program.clone();
        Box::pin(async move {
            let status = Command::new(&program)
                .arg("--version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();
            match time::timeout(Duration::from_secs(5), status).await {
                Ok(Ok(s)) if s.success() => Ok(()),
                Ok(Ok(s)) => Err(TransportError::Unavailable(format!(
                    "{} --version exited with {s}",
                    program.display()
                ))),
                Ok(Err(e)) => Err(TransportError::Unavailable(format!(
                    "curl is not installed or not executable ({}): {e}",
                    program.display()
                ))),
                Err(_) => Err(TransportError::Unavailable(format!(
                    "{} --version did not answer",
                    program.display()
                ))),
            }
        })
    }

    fn terminate_all(&self) {
        let groups: Vec<i32> = self
            .live_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        if !groups.is_empty() {
            warn!(count = groups.len(), "terminating lingering probe processes");
        }
        for pgid in groups {
            signal_group(pgid, Signal::Terminate);
        }
    }
}

/// Kills the probe's process group when dropped, unless the process already exited normally.
///
/// Covers every way a probe future can end early: supervisory timeout, collection timeout,
/// an aborted task, or a panic in the caller.
struct ProcessGroupGuard {
    pgid: Option<i32>,
    live_groups: Arc<Mutex<HashSet<i32>>>,
}

impl ProcessGroupGuard {
    fn register(pid: Option<u32>, live_groups: Arc<Mutex<HashSet<i32>>>) -> Self {
        let pgid = pid.and_then(|p| i32::try_from(p).ok());
        if let Some(pgid) = pgid {
            live_groups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(pgid);
        }
        Self { pgid, live_groups }
    }

    fn release(mut self) {
        if let Some(pgid) = self.pgid.take() {
            self.forget(pgid);
        }
    }

    fn forget(&self, pgid: i32) {
        self.live_groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pgid);
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            signal_group(pgid, Signal::Kill);
            self.forget(pgid);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg only sends a signal; an already-gone group yields ESRCH which we ignore.
    let rc = unsafe { libc::killpg(pgid, sig) };
    if rc != 0 {
        debug!(pgid, ?signal, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: Signal) {
    // kill_on_drop covers the direct child on platforms without process groups.
}
