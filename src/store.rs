use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use time::macros::format_description;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::progress::RunContext;
use crate::tabular::{self, TabularError};
use crate::types::{now_local, ProbeOutcome, RESULT_MARKER};

/// Outcomes of the current run keyed by their input position.
#[derive(Debug, Default, Clone)]
pub struct ResultStore {
    outcomes: BTreeMap<usize, ProbeOutcome>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, outcomes: impl IntoIterator<Item = ProbeOutcome>) {
        for o in outcomes {
            self.outcomes.insert(o.sequence_index, o);
        }
    }

    /// All outcomes, ascending by sequence index.
    pub fn snapshot(&self) -> Vec<ProbeOutcome> {
        self.outcomes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

pub type SharedStore = Arc<Mutex<ResultStore>>;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Write(#[from] TabularError),
    #[error("snapshot writer task failed: {0}")]
    Join(String),
}

/// Durable destination for snapshots.
pub trait SnapshotSink: Send + Sync {
    /// Write the full, sorted snapshot. Returns where it went.
    fn persist(&self, rows: &[ProbeOutcome]) -> Result<PathBuf, PersistError>;
}

/// Writes every snapshot to a fresh `{stem}_result_{timestamp}.xlsx`.
#[derive(Debug, Clone)]
pub struct XlsxSink {
    dir: PathBuf,
    stem: String,
}

impl XlsxSink {
    pub fn new(dir: impl Into<PathBuf>, stem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            stem: stem.into(),
        }
    }

    /// Reports land next to the input file unless `results_dir` says otherwise.
    pub fn for_input(input: &Path, results_dir: Option<&Path>) -> Self {
        let dir = match results_dir {
            Some(d) => d.to_path_buf(),
            None => input
                .canonicalize()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "credentials".to_string());
        Self::new(dir, stem)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_path(&self) -> PathBuf {
        let stamp = now_local()
            .format(format_description!(
                "[year][month][day]_[hour][minute][second]_[subsecond digits:3]"
            ))
            .unwrap_or_else(|_| String::from("00000000_000000_000"));
        self.dir
            .join(format!("{}{}{}.xlsx", self.stem, RESULT_MARKER, stamp))
    }
}

impl SnapshotSink for XlsxSink {
    fn persist(&self, rows: &[ProbeOutcome]) -> Result<PathBuf, PersistError> {
        let path = self.next_path();
        tabular::write_outcomes(rows, &path)?;
        make_world_writable(&path);
        Ok(path)
    }
}

fn make_world_writable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o666)) {
            warn!(path = %path.display(), error = %e, "chmod 0666 failed");
        }
    }
}

/// Write the current snapshot through `sink`. Failures are logged and swallowed: the in-memory
/// store is still intact and the next flush retries with everything.
pub async fn flush(
    store: &SharedStore,
    sink: &Arc<dyn SnapshotSink>,
    ctx: &RunContext,
) -> Option<PathBuf> {
    let rows = store.lock().await.snapshot();
    let count = rows.len();
    let sink = sink.clone();
    let res = tokio::task::spawn_blocking(move || sink.persist(&rows))
        .await
        .map_err(|e| PersistError::Join(e.to_string()))
        .and_then(|r| r);
    match res {
        Ok(path) => {
            info!(rows = count, path = %path.display(), "snapshot persisted");
            ctx.record_message(format!("saved {count} results to {}", path.display()));
            Some(path)
        }
        Err(e) => {
            warn!(rows = count, error = %e, "snapshot persistence failed");
            ctx.record_message(format!("failed to save results: {e}"));
            None
        }
    }
}

/// Newest report in `dir` by modification time.
pub fn latest_result_file(dir: &Path) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|e| is_result_file(&e.path()))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, p)| p)
}

pub fn is_result_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.contains(RESULT_MARKER) && name.ends_with(".xlsx")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Credential, Verdict};

    fn outcome(i: usize) -> ProbeOutcome {
        ProbeOutcome::from_verdict(&Credential::new(i, format!("u{i}"), "p"), Verdict::failure("x"))
    }

    #[test]
    fn snapshot_is_sorted_and_stable() {
        let mut store = ResultStore::new();
        store.append([outcome(5), outcome(1), outcome(3)]);
        store.append([outcome(0), outcome(4), outcome(2)]);
        let first: Vec<_> = store.snapshot().iter().map(|o| o.sequence_index).collect();
        assert_eq!(first, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(store.snapshot(), store.snapshot());
    }

    #[test]
    fn append_replaces_same_index() {
        let mut store = ResultStore::new();
        store.append([outcome(1)]);
        let mut again = outcome(1);
        again.note = "second".into();
        store.append([again]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].note, "second");
    }

    #[test]
    fn sink_names_carry_marker_and_stem() {
        let sink = XlsxSink::new("/tmp/out", "accounts");
        let p = sink.next_path();
        let name = p.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("accounts_result_"));
        assert!(is_result_file(&p));
        assert!(!is_result_file(Path::new("accounts.xlsx")));
        assert!(!is_result_file(Path::new("accounts_result_1.csv")));
    }

    #[test]
    fn latest_result_file_picks_newest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_result_file(dir.path()).is_none());
        let old = dir.path().join("a_result_1.xlsx");
        let new = dir.path().join("a_result_2.xlsx");
        fs::write(&old, b"old").unwrap();
        fs::write(dir.path().join("a.xlsx"), b"input").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&new, b"new").unwrap();
        assert_eq!(latest_result_file(dir.path()), Some(new));
    }
}
