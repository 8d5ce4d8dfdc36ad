use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use log::{debug, error, trace};
use tempfile::NamedTempFile;

use crate::{DocumentId, NotebookError, Result};

/// Writes `bytes` to `path` atomically: a temporary file in the same
/// directory is written, flushed and then renamed over the target.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    if !dir.exists() {
        debug!("Creating parent directory: {}", dir.display());
        fs::create_dir_all(dir).map_err(|e| {
            error!("Failed to create directory {}: {}", dir.display(), e);
            NotebookError::DirectoryError {
                path: dir.to_path_buf(),
            }
        })?;
    }

    trace!("Creating temporary file in directory: {}", dir.display());
    let mut temp_file =
        NamedTempFile::new_in(dir).map_err(|e| NotebookError::persistence(dir, e))?;

    temp_file
        .write_all(bytes)
        .and_then(|_| temp_file.flush())
        .map_err(|e| {
            error!("Failed to write temporary file for {}: {}", path.display(), e);
            NotebookError::persistence(path, e)
        })?;

    temp_file.persist(path).map_err(|e| {
        error!("Failed to persist file {}: {}", path.display(), e.error);
        NotebookError::persistence(path, e.error)
    })?;

    trace!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn write_json_atomically<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomically(path, &json)
}

/// Reads a JSON document from disk without binding it to a schema.
pub fn read_json_value(path: &Path) -> Result<serde_json::Value> {
    debug!("Reading JSON from file: {}", path.display());
    let content = fs::read(path).map_err(|e| NotebookError::persistence(path, e))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Moves an unreadable file aside so a fresh one can take its place.
pub fn quarantine_file(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let target = path.with_file_name(format!(
        "{}.corrupt-{}",
        file_name,
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    fs::rename(path, &target).map_err(|e| NotebookError::persistence(path, e))?;
    Ok(target)
}

/// Current time as unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// Helper method for parsing comma-separated document ids
pub fn parse_ids(ids: Option<String>) -> Vec<DocumentId> {
    ids.map(|t| {
        t.split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(DocumentId::from)
            .collect()
    })
    .unwrap_or_default()
}
