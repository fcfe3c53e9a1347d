//! Checkpoint ledger: which postal codes are done, across runs.
//!
//! Two newline-delimited files, `succeeded.txt` and `failed.txt`, sorted on
//! write. An identifier is in at most one of them. Only the orchestrator
//! writes the ledger, once per run, after all workers have finished.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use cepgeo_common::CepGeoError;
use tracing::info;

use crate::store::atomic;

pub const SUCCEEDED_FILE: &str = "succeeded.txt";
pub const FAILED_FILE: &str = "failed.txt";

/// Identifiers settled during one run (or one worker's share of it).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LedgerDelta {
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl LedgerDelta {
    pub fn extend(&mut self, other: LedgerDelta) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Clone)]
pub struct Ledger {
    dir: PathBuf,
    succeeded: BTreeSet<String>,
    failed: BTreeSet<String>,
}

impl Ledger {
    /// Load both sets from `dir`. Missing files are empty sets.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, CepGeoError> {
        let dir = dir.into();
        let succeeded = read_set(&dir.join(SUCCEEDED_FILE))?;
        let mut failed = read_set(&dir.join(FAILED_FILE))?;
        // Heal snapshots written by older tools that let the sets overlap.
        failed.retain(|id| !succeeded.contains(id));
        Ok(Self {
            dir,
            succeeded,
            failed,
        })
    }

    pub fn succeeded(&self) -> &BTreeSet<String> {
        &self.succeeded
    }

    pub fn failed(&self) -> &BTreeSet<String> {
        &self.failed
    }

    /// Whether `identifier` should be left out of this run's candidates.
    pub fn is_settled(&self, identifier: &str, retry_failed: bool) -> bool {
        self.succeeded.contains(identifier) || (!retry_failed && self.failed.contains(identifier))
    }

    /// Fold a run's results in. Success wins over failure.
    pub fn merge(&mut self, delta: &LedgerDelta) {
        for id in &delta.succeeded {
            self.failed.remove(id);
            self.succeeded.insert(id.clone());
        }
        for id in &delta.failed {
            if !self.succeeded.contains(id) {
                self.failed.insert(id.clone());
            }
        }
    }

    /// Persist both sets, sorted, each via temp-file-then-rename.
    pub fn save(&self) -> Result<(), CepGeoError> {
        std::fs::create_dir_all(&self.dir)?;
        write_set(&self.dir.join(SUCCEEDED_FILE), &self.succeeded)?;
        write_set(&self.dir.join(FAILED_FILE), &self.failed)?;
        info!(
            succeeded = self.succeeded.len(),
            failed = self.failed.len(),
            dir = %self.dir.display(),
            "Ledger saved"
        );
        Ok(())
    }
}

fn read_set(path: &Path) -> Result<BTreeSet<String>, CepGeoError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(CepGeoError::Ledger(format!("cannot read {}: {e}", path.display()))),
    }
}

fn write_set(path: &Path, set: &BTreeSet<String>) -> Result<(), CepGeoError> {
    let mut body = String::new();
    for id in set {
        body.push_str(id);
        body.push('\n');
    }
    atomic::write_atomic(path, body.as_bytes())
        .map_err(|e| CepGeoError::Ledger(format!("cannot write {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Per-worker failure log
// ---------------------------------------------------------------------------

/// Append-only list of identifiers a parallel worker could not resolve.
/// One file per worker, so workers never contend for a file.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn for_worker(dir: &Path, worker: usize) -> Self {
        Self {
            path: dir.join(format!("failures_worker_{worker}.txt")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, identifier: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{identifier}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(succeeded: &[&str], failed: &[&str]) -> LedgerDelta {
        LedgerDelta {
            succeeded: succeeded.iter().map(|s| s.to_string()).collect(),
            failed: failed.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn load_from_empty_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::load(dir.path()).unwrap();
        assert!(ledger.succeeded().is_empty());
        assert!(ledger.failed().is_empty());
    }

    #[test]
    fn load_ignores_blank_lines_and_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SUCCEEDED_FILE), "b\n\n  a \n").unwrap();
        let ledger = Ledger::load(dir.path()).unwrap();
        assert_eq!(ledger.succeeded().iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn load_heals_overlapping_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SUCCEEDED_FILE), "a\n").unwrap();
        std::fs::write(dir.path().join(FAILED_FILE), "a\nb\n").unwrap();
        let ledger = Ledger::load(dir.path()).unwrap();
        assert!(!ledger.failed().contains("a"));
        assert!(ledger.failed().contains("b"));
    }

    #[test]
    fn merge_keeps_sets_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();
        ledger.merge(&delta(&["a"], &["b", "c"]));
        ledger.merge(&delta(&["b"], &["a", "d"]));

        for id in ledger.succeeded() {
            assert!(!ledger.failed().contains(id), "{id} in both sets");
        }
        assert_eq!(ledger.succeeded().len(), 2);
        assert!(ledger.failed().contains("c"));
        assert!(ledger.failed().contains("d"));
        assert!(!ledger.failed().contains("a"));
    }

    #[test]
    fn merge_with_same_id_in_both_sides_prefers_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();
        ledger.merge(&delta(&["x"], &["x"]));
        assert!(ledger.succeeded().contains("x"));
        assert!(!ledger.failed().contains("x"));
    }

    #[test]
    fn is_settled_respects_retry_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();
        ledger.merge(&delta(&["ok"], &["bad"]));
        assert!(ledger.is_settled("ok", false));
        assert!(ledger.is_settled("ok", true));
        assert!(ledger.is_settled("bad", false));
        assert!(!ledger.is_settled("bad", true));
        assert!(!ledger.is_settled("new", false));
    }

    #[test]
    fn save_writes_sorted_files_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();
        ledger.merge(&delta(&["30130000", "01001000"], &["99999999"]));
        ledger.save().unwrap();

        let text = std::fs::read_to_string(dir.path().join(SUCCEEDED_FILE)).unwrap();
        assert_eq!(text, "01001000\n30130000\n");

        let reloaded = Ledger::load(dir.path()).unwrap();
        assert_eq!(reloaded.succeeded(), ledger.succeeded());
        assert_eq!(reloaded.failed(), ledger.failed());
    }

    #[test]
    fn failure_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let log = FailureLog::for_worker(dir.path(), 3);
        log.append("a").unwrap();
        log.append("b").unwrap();
        assert!(log.path().ends_with("failures_worker_3.txt"));
        assert_eq!(std::fs::read_to_string(log.path()).unwrap(), "a\nb\n");
    }
}
