//! Error types for the neatnote document store.
//!
//! This module defines the error taxonomy shared by the document store,
//! the backup manager and the migrator. Most store operations treat a
//! missing document as a benign no-op, so `NotFound` is only raised by
//! explicit lookups.

use std::{io, path::PathBuf};

use thiserror::Error;

/// The main error type for the neatnote library.
#[derive(Error, Debug)]
pub enum NotebookError {
    /// Errors related to file I/O operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File system failure while saving, backing up or restoring a file.
    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Errors related to serialization/deserialization operations.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors related to zip operations.
    #[error("Zip error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    /// Document was not found when performing an operation.
    #[error("Document not found: {id}")]
    NotFound { id: String },

    /// Body bytes are not valid codec output.
    #[error("Corrupt document body: {message}")]
    CorruptBody { message: String },

    /// Body mutation attempted while the document is stored compressed.
    #[error("Document {id} is not open for editing")]
    NotEditable { id: String },

    /// A migration step failed; the stored version was not advanced past it.
    #[error("Migration to version {version} failed: {message}")]
    MigrationStep { version: u32, message: String },

    /// A single-flight operation is already in progress.
    #[error("Another {operation} is already in progress")]
    Busy { operation: &'static str },

    /// Invalid document, payload or backup format.
    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    /// Errors related to backup operations.
    #[error("Backup failed: {message}")]
    BackupFailed { message: String },

    /// Error when attempting to restore from backup.
    #[error("Restore failed: {message}")]
    RestoreFailed { message: String },

    /// Errors related to configuration.
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// Directory creation or access failed.
    #[error("Failed to create or access directory: {path}")]
    DirectoryError { path: PathBuf },

    /// for mutex lock acquisition issues
    #[error("{message}")]
    LockAcquisitionFailed { message: String },

    /// Generic application error with a custom message.
    #[error("{message}")]
    ApplicationError { message: String },
}

impl NotebookError {
    /// Wraps an I/O error together with the path it happened on.
    pub fn persistence(path: impl Into<PathBuf>, source: io::Error) -> Self {
        NotebookError::Persistence {
            path: path.into(),
            source,
        }
    }
}
