//! Run log: persisted JSON timeline of every attempt made during a batch run.
//!
//! Each run produces a single `{DATA_DIR}/runs/{run_id}.json` file containing
//! the final stats and an ordered list of timestamped events. Workers keep
//! their own `RunLog` and the orchestrator absorbs them after join.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::RunStats;
use crate::store::atomic;

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

pub struct RunLog {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    events: Vec<RunEvent>,
    seq: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u32,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        mode: String,
        candidates: usize,
        sources: Vec<String>,
    },
    SourceAttempt {
        worker: usize,
        cep: String,
        source: String,
        outcome: String,
        reason: Option<String>,
    },
    RecordResolved {
        worker: usize,
        cep: String,
        source: String,
        latitude: String,
        longitude: String,
    },
    RecordFailed {
        worker: usize,
        cep: String,
        reason: String,
    },
    RecordSkipped {
        worker: usize,
        cep: String,
    },
    BudgetExhausted {
        worker: usize,
        attempts: u32,
        reason: String,
    },
    WorkerFinished {
        worker: usize,
        attempted: u32,
        resolved: u32,
        failed: u32,
        skipped: u32,
    },
    WorkerAborted {
        worker: usize,
        error: String,
    },
}

impl RunLog {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            events: Vec::new(),
            seq: 0,
        }
    }

    pub fn log(&mut self, kind: EventKind) {
        self.events.push(RunEvent {
            seq: self.seq,
            ts: Utc::now(),
            kind,
        });
        self.seq += 1;
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    /// Merge a worker's log into this one, keeping events in time order.
    pub fn absorb(&mut self, other: RunLog) {
        self.events.extend(other.events);
        self.events.sort_by_key(|e| e.ts);
        for (i, event) in self.events.iter_mut().enumerate() {
            event.seq = i as u32;
        }
        self.seq = self.events.len() as u32;
    }

    /// Serialize the run log to JSON under `data_dir/runs/`.
    /// Returns the file path on success.
    pub fn save(&self, data_dir: &Path, stats: &RunStats) -> Result<PathBuf> {
        let dir = data_dir.join("runs");
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.run_id));

        let output = SerializedRunLog {
            run_id: &self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            stats: SerializedStats::from(stats),
            events: &self.events,
        };

        atomic::write_atomic(&path, serde_json::to_string_pretty(&output)?.as_bytes())?;
        info!(path = %path.display(), events = self.events.len(), "Run log saved");

        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Serialization wrappers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SerializedRunLog<'a> {
    run_id: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    stats: SerializedStats,
    events: &'a [RunEvent],
}

#[derive(Serialize)]
struct SerializedStats {
    attempted: u32,
    resolved: u32,
    failed: u32,
    skipped: u32,
    total_succeeded: usize,
    total_failed: usize,
}

impl From<&RunStats> for SerializedStats {
    fn from(s: &RunStats) -> Self {
        Self {
            attempted: s.attempted,
            resolved: s.resolved,
            failed: s.failed,
            skipped: s.skipped,
            total_succeeded: s.total_succeeded,
            total_failed: s.total_failed,
        }
    }
}
