//! Full-state snapshots of the notebook.
//!
//! Each backup is a zip archive holding a single `notebook.json` entry with
//! the note and category collections. Routine backups live directly in the
//! backup directory and are subject to the retention sweep; prefixed
//! backups (for example `upgrade/v3_`) form a separate namespace that is
//! never pruned automatically.
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{NotebookError, Result};

/// File name prefix shared by every routine backup.
pub const BACKUP_FILE_PREFIX: &str = "neatnote_backup_";
pub const BACKUP_EXTENSION: &str = "zip";
const BACKUP_ENTRY_NAME: &str = "notebook.json";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";
const TIMESTAMP_LEN: usize = 19;

/// A routine backup found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub file_name: String,
    /// Parsed from the file name; `None` if the name was not produced by us.
    pub taken_at: Option<DateTime<Utc>>,
}

/// Writes, lists and prunes snapshot files under one backup directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Serializes `payload` into a new timestamped backup archive.
    ///
    /// With a prefix such as `upgrade/v3_`, the part up to the last `/`
    /// selects a subdirectory and the rest is prepended to the file name.
    ///
    /// # Returns
    ///
    /// The path of the created backup file
    pub fn create_backup<T>(&self, payload: &T, prefix: Option<&str>) -> Result<PathBuf>
    where
        T: Serialize + ?Sized,
    {
        let (dir, name_prefix) = self.resolve_prefix(prefix)?;

        if !dir.exists() {
            debug!("Creating backup directory: {}", dir.display());
            fs::create_dir_all(&dir).map_err(|e| {
                error!("Failed to create backup directory: {}", e);
                NotebookError::DirectoryError { path: dir.clone() }
            })?;
        }

        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let base_name = format!("{}{}{}", name_prefix, BACKUP_FILE_PREFIX, timestamp);
        let mut backup_path = dir.join(format!("{}.{}", base_name, BACKUP_EXTENSION));
        let mut attempt = 1;
        while backup_path.exists() {
            backup_path = dir.join(format!("{}_{:03}.{}", base_name, attempt, BACKUP_EXTENSION));
            attempt += 1;
        }

        let json = serde_json::to_vec_pretty(payload)?;

        let temp_file =
            NamedTempFile::new_in(&dir).map_err(|e| NotebookError::persistence(&dir, e))?;
        let mut zip = ZipWriter::new(temp_file);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);

        zip.start_file(BACKUP_ENTRY_NAME, options)?;
        zip.write_all(&json).map_err(|e| NotebookError::BackupFailed {
            message: format!("Failed to write snapshot to backup: {}", e),
        })?;
        let temp_file = zip.finish()?;

        temp_file.persist(&backup_path).map_err(|e| {
            error!(
                "Failed to persist backup {}: {}",
                backup_path.display(),
                e.error
            );
            NotebookError::persistence(&backup_path, e.error)
        })?;

        info!(
            "Backup created successfully at {} ({} bytes of JSON)",
            backup_path.display(),
            json.len()
        );
        Ok(backup_path)
    }

    /// Lists routine backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.backup_dir)
            .min_depth(1)
            .max_depth(1) // Prefixed backups live in subdirectories
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !is_routine_backup_name(&file_name) {
                continue;
            }
            entries.push(BackupEntry {
                path: entry.path().to_path_buf(),
                taken_at: parse_backup_timestamp(&file_name),
                file_name,
            });
        }

        // Embedded timestamps sort lexicographically in chronological order.
        entries.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(entries)
    }

    /// Newest routine backup, if any.
    pub fn latest_backup(&self) -> Result<Option<BackupEntry>> {
        Ok(self.list_backups()?.into_iter().next())
    }

    /// Deletes routine backups beyond the newest `retention` ones.
    ///
    /// A retention of 0 keeps every backup. Prefixed backups are never
    /// touched. Returns the number of files removed.
    pub fn delete_backups(&self, retention: usize) -> Result<usize> {
        if retention == 0 {
            return Ok(0);
        }

        let entries = self.list_backups()?;
        let mut removed = 0;
        for stale in entries.iter().skip(retention) {
            match fs::remove_file(&stale.path) {
                Ok(_) => {
                    debug!("Removed old backup: {}", stale.path.display());
                    removed += 1;
                }
                Err(e) => {
                    // Continue processing even if we couldn't delete this file
                    warn!(
                        "Failed to remove old backup {}: {}",
                        stale.path.display(),
                        e
                    );
                }
            }
        }

        if removed > 0 {
            debug!(
                "Cleanup complete: kept {} backups, removed {} old backups",
                entries.len() - removed,
                removed
            );
        }
        Ok(removed)
    }

    fn resolve_prefix(&self, prefix: Option<&str>) -> Result<(PathBuf, String)> {
        let prefix = match prefix {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => return Ok((self.backup_dir.clone(), String::new())),
        };

        let (sub_dir, name_prefix) = match prefix.rsplit_once('/') {
            Some((sub_dir, name_prefix)) => (sub_dir, name_prefix),
            None => ("", prefix),
        };

        let sub_path = Path::new(sub_dir);
        let valid_dir = sub_path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !valid_dir || name_prefix.contains('\\') {
            return Err(NotebookError::InvalidFormat {
                message: format!("backup prefix `{}` must stay inside the backup directory", prefix),
            });
        }

        Ok((self.backup_dir.join(sub_path), name_prefix.to_string()))
    }
}

/// Reads the JSON snapshot stored inside a backup archive.
pub fn read_backup(path: &Path) -> Result<serde_json::Value> {
    let file = File::open(path).map_err(|e| NotebookError::persistence(path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| NotebookError::RestoreFailed {
        message: format!("{} is not a backup archive: {}", path.display(), e),
    })?;

    let mut entry = archive
        .by_name(BACKUP_ENTRY_NAME)
        .map_err(|e| NotebookError::RestoreFailed {
            message: format!(
                "{} has no {} entry: {}",
                path.display(),
                BACKUP_ENTRY_NAME,
                e
            ),
        })?;

    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|e| NotebookError::RestoreFailed {
            message: format!("Failed to read backup {}: {}", path.display(), e),
        })?;

    Ok(serde_json::from_slice(&content)?)
}

fn is_routine_backup_name(file_name: &str) -> bool {
    file_name.starts_with(BACKUP_FILE_PREFIX)
        && Path::new(file_name)
            .extension()
            .is_some_and(|ext| ext == BACKUP_EXTENSION)
}

fn parse_backup_timestamp(file_name: &str) -> Option<DateTime<Utc>> {
    let stamp = file_name.strip_prefix(BACKUP_FILE_PREFIX)?.get(..TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
