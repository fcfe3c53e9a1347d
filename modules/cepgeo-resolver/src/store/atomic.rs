//! Temp-file-then-rename writes.
//!
//! The temp file lives in the target's directory so the final rename never
//! crosses a filesystem. Readers see either the old file or the new one.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Bytes written and synced to a temp file, not yet visible at `target`.
/// Dropping without `commit` discards the temp file.
pub struct StagedWrite {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically replace `target` with the staged contents.
    pub fn commit(self) -> io::Result<()> {
        self.temp.persist(&self.target).map_err(|e| e.error)?;
        Ok(())
    }

    /// Leave the temp file on disk without renaming it, as a crash would.
    pub fn abandon(self) -> io::Result<PathBuf> {
        self.temp.into_temp_path().keep().map_err(|e| e.error)
    }
}

pub fn stage(target: &Path, bytes: &[u8]) -> io::Result<StagedWrite> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let stem = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{stem}."))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    // The temp file starts out owner-only; keep the mode of the file it replaces.
    if let Ok(existing) = std::fs::metadata(target) {
        temp.as_file().set_permissions(existing.permissions())?;
    }
    temp.as_file().sync_all()?;

    Ok(StagedWrite {
        temp,
        target: target.to_path_buf(),
    })
}

pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    stage(target, bytes)?.commit()
}
