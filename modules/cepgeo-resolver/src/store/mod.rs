//! Record store: one JSON file per postal code in a flat directory.
//!
//! Saves go through `atomic`, so a reader (or a crash) never observes a
//! half-written record. Every save normalizes the record first.

pub mod atomic;

use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use cepgeo_common::{canonical_cep, CepGeoError, Record};

pub const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

/// What a canonicalization pass did.
#[derive(Debug, Default)]
pub struct CanonicalizeReport {
    pub scanned: usize,
    /// (identifier, old cep, new cep)
    pub changed: Vec<(String, String, String)>,
    pub errors: Vec<(String, String)>,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.{RECORD_EXTENSION}"))
    }

    /// Identifiers (file stems) of every record, sorted. Hidden files,
    /// including leftover temp files, are ignored.
    pub fn list_identifiers(&self) -> Result<Vec<String>, CepGeoError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            CepGeoError::Store(format!("cannot read {}: {e}", self.dir.display()))
        })?;

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.is_empty() || stem.starts_with('.') {
                continue;
            }
            ids.push(stem.to_string());
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, identifier: &str) -> Result<Record, CepGeoError> {
        let path = self.path_for(identifier);
        let text = std::fs::read_to_string(&path).map_err(|e| CepGeoError::MalformedRecord {
            identifier: identifier.to_string(),
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&text).map_err(|e| CepGeoError::MalformedRecord {
            identifier: identifier.to_string(),
            reason: format!("invalid JSON: {e}"),
        })
    }

    /// Normalize `record` in place, then atomically replace its file.
    pub fn save(&self, identifier: &str, record: &mut Record) -> Result<(), CepGeoError> {
        record.normalize();
        let body = serde_json::to_string_pretty(record)
            .map_err(|e| CepGeoError::Store(format!("cannot serialize {identifier}: {e}")))?;
        atomic::write_atomic(&self.path_for(identifier), body.as_bytes())?;
        Ok(())
    }

    /// Rewrite one record's `cep` into digit-only form.
    /// Returns `(old, new)` when the field changed.
    pub fn canonicalize_one(
        &self,
        identifier: &str,
    ) -> Result<Option<(String, String)>, CepGeoError> {
        let mut record = self.load(identifier)?;
        let Some(current) = record.cep.clone() else {
            return Ok(None);
        };
        let canonical = canonical_cep(&current);
        if canonical == current || canonical.is_empty() {
            return Ok(None);
        }
        record.cep = Some(canonical.clone());
        self.save(identifier, &mut record)?;
        Ok(Some((current, canonical)))
    }

    /// Canonicalize every record's `cep` field, `parallelism` files at a time.
    /// Per-file failures are reported, not raised.
    pub async fn canonicalize_identifiers(
        &self,
        parallelism: usize,
    ) -> Result<CanonicalizeReport, CepGeoError> {
        let ids = self.list_identifiers()?;
        info!(files = ids.len(), "Canonicalizing postal codes");

        let results: Vec<(String, Result<Option<(String, String)>, CepGeoError>)> =
            stream::iter(ids)
                .map(|id| {
                    let store = self.clone();
                    async move {
                        let task_id = id.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            store.canonicalize_one(&task_id)
                        })
                        .await
                        .unwrap_or_else(|e| {
                            Err(CepGeoError::Store(format!("canonicalize task failed: {e}")))
                        });
                        (id, result)
                    }
                })
                .buffer_unordered(parallelism.max(1))
                .collect()
                .await;

        let mut report = CanonicalizeReport {
            scanned: results.len(),
            ..Default::default()
        };
        for (id, result) in results {
            match result {
                Ok(Some((old, new))) => {
                    info!(file = id.as_str(), old = old.as_str(), new = new.as_str(), "Canonicalized");
                    report.changed.push((id, old, new));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(file = id.as_str(), error = %e, "Failed to canonicalize");
                    report.errors.push((id, e.to_string()));
                }
            }
        }
        report.changed.sort();
        report.errors.sort();
        Ok(report)
    }
}
