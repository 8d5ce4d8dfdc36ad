//! Application-side glue around the document store.
//!
//! A [`Workspace`] performs the startup sequence (load, migrate, decode),
//! keeps a mirror of what is on disk and merges the store's save records
//! into it. It is also what the [`PersistenceScheduler`](crate::PersistenceScheduler)
//! drives through [`PersistenceHooks`].
use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use log::{debug, error, info, warn};

use crate::{
    helper, BackupManager, ConfigFile, DocumentChange, DocumentId, DocumentSortType,
    ImportSummary, MigrationReport, MigrationStatus, Migrator, NotebookConfig, NotebookError,
    NotebookService, PersistenceHooks, Result, UniqueDocument, WorkspacePaths, CURRENT_VERSION,
};
use crate::store::VersionedPayload;

pub struct Workspace {
    paths: WorkspacePaths,
    config_file: ConfigFile,
    /// Settings and documents as last written to disk.
    persisted: Mutex<NotebookConfig>,
    service: NotebookService,
    backups: BackupManager,
    migration: MigrationReport,
    /// Cleared when the stored data could not be decoded and must not be overwritten.
    writable: bool,
}

fn merge_change(config: &mut NotebookConfig, change: &DocumentChange) {
    match change {
        DocumentChange::Note(note) => {
            match config.notes.iter_mut().find(|stored| stored.id() == note.id()) {
                Some(stored) => *stored = note.clone(),
                None => config.notes.insert(0, note.clone()),
            }
        }
        DocumentChange::Category(category) => {
            match config
                .categories
                .iter_mut()
                .find(|stored| stored.id() == category.id())
            {
                Some(stored) => *stored = category.clone(),
                None => config.categories.insert(0, category.clone()),
            }
        }
        DocumentChange::Removed(id) => {
            config.notes.retain(|note| note.id() != id);
            config.categories.retain(|category| category.id() != id);
        }
    }
}

impl Workspace {
    /// Opens the notebook stored under `paths`, creating it if needed.
    ///
    /// Older stored data is migrated first. A file that cannot be decoded
    /// after a successful migration is quarantined and a new notebook is
    /// started; if migration did not complete, the stored file is left
    /// alone and the workspace opens read-only.
    pub fn open(paths: WorkspacePaths) -> Result<Self> {
        info!("Opening notebook at {}", paths.config_file.display());
        let config_file = ConfigFile::new(&paths.config_file);
        let backups = BackupManager::new(&paths.backup_dir);

        let mut writable = true;
        let (mut config, migration) = match config_file.load_raw()? {
            None => {
                info!("Starting a new notebook");
                let config = NotebookConfig::default();
                config_file.save(&config)?;
                (config, MigrationReport::up_to_date(CURRENT_VERSION))
            }
            Some(raw) => {
                let outcome = Migrator::default().migrate(raw, &backups, |state| {
                    config_file.write_raw(state)
                });
                let completed = matches!(
                    outcome.report.status,
                    MigrationStatus::UpToDate { .. } | MigrationStatus::Upgraded { .. }
                );

                let state = if matches!(outcome.report.status, MigrationStatus::Failed { .. }) {
                    // The stored file keeps its old layout until an upgrade completes
                    error!("Notebook upgrade did not complete; opening read-only");
                    writable = false;
                    match Migrator::default().upgrade_payload(outcome.state.clone()) {
                        Ok(upgraded) => upgraded,
                        Err(e) => {
                            warn!("Stored notebook cannot be upgraded in memory: {}", e);
                            outcome.state
                        }
                    }
                } else {
                    outcome.state
                };

                let config = match serde_json::from_value::<NotebookConfig>(state) {
                    Ok(config) => config,
                    Err(e) if completed => {
                        config_file.quarantine(&e.to_string())?;
                        let config = NotebookConfig::default();
                        config_file.save(&config)?;
                        config
                    }
                    Err(e) => {
                        error!(
                            "Stored notebook could not be read ({}); opening read-only",
                            e
                        );
                        writable = false;
                        NotebookConfig::default()
                    }
                };
                (config, outcome.report)
            }
        };

        if migration.needs_attention() {
            warn!("Notebook migration needs attention: {:?}", migration.status);
        }
        config.normalize();

        let service = NotebookService::new(config.notes.clone(), config.categories.clone());
        let report = service.load_report()?;
        if report != Default::default() {
            warn!(
                "Repaired notebook on load: {} corrupt bodies, {} duplicate ids, {} dangling references",
                report.corrupt_bodies, report.duplicate_ids, report.dangling_references
            );
        }

        let workspace = Workspace {
            paths,
            config_file,
            persisted: Mutex::new(config),
            service,
            backups,
            migration,
            writable,
        };

        // Repaired documents no longer line up with the stored records
        if report != Default::default() && workspace.writable {
            workspace.save_full()?;
        }
        Ok(workspace)
    }

    fn lock(&self) -> Result<MutexGuard<'_, NotebookConfig>> {
        self.persisted
            .lock()
            .map_err(|_| NotebookError::LockAcquisitionFailed {
                message: "Failed to acquire lock on persisted configuration".to_string(),
            })
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            return Ok(());
        }
        Err(NotebookError::ApplicationError {
            message: format!(
                "{} could not be read; saving is disabled to protect it",
                self.config_file.path().display()
            ),
        })
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    pub fn service(&self) -> &NotebookService {
        &self.service
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Current settings, without the document collections.
    pub fn config(&self) -> Result<NotebookConfig> {
        let persisted = self.lock()?;
        Ok(NotebookConfig {
            notes: Vec::new(),
            categories: Vec::new(),
            ..persisted.clone()
        })
    }

    /// Changes settings and writes them out. Returns the new settings.
    pub fn update_config<F>(&self, f: F) -> Result<NotebookConfig>
    where
        F: FnOnce(&mut NotebookConfig) -> Result<()>,
    {
        self.ensure_writable()?;
        {
            let mut persisted = self.lock()?;
            let mut updated = NotebookConfig {
                notes: Vec::new(),
                categories: Vec::new(),
                ..persisted.clone()
            };
            f(&mut updated)?;
            updated.normalize();
            updated.version = persisted.version;
            updated.notes = std::mem::take(&mut persisted.notes);
            updated.categories = std::mem::take(&mut persisted.categories);
            *persisted = updated;
            self.config_file.save(&persisted)?;
        }
        self.config()
    }

    fn write_persisted<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut NotebookConfig),
    {
        self.ensure_writable()?;
        let mut persisted = self.lock()?;
        f(&mut persisted);
        self.config_file.save(&persisted)
    }

    /// Partial save of a single document.
    pub fn save_document(&self, id: &DocumentId) -> Result<bool> {
        self.service.save_document(id, |change| {
            self.write_persisted(|config| merge_change(config, change))
        })
    }

    /// Partial save of every changed document.
    pub fn save_pending(&self) -> Result<usize> {
        self.service.save_dirty(|changes| {
            self.write_persisted(|config| {
                for change in changes {
                    merge_change(config, change);
                }
            })
        })
    }

    /// Full save of both collections.
    pub fn save_full(&self) -> Result<usize> {
        self.service.save_full_notebook(|payload| {
            self.write_persisted(|config| {
                config.notes = payload.notes.clone();
                config.categories = payload.categories.clone();
            })
        })
    }

    /// Takes a routine backup when the backup frequency has elapsed.
    ///
    /// The backup time is recorded before the attempt, so a failing backup
    /// is retried on the normal schedule rather than at every check.
    pub fn backup_if_due(&self) -> Result<Option<PathBuf>> {
        let now = helper::now_millis();
        {
            let mut persisted = self.lock()?;
            if !persisted.is_backup_due(now) {
                return Ok(None);
            }
            persisted.last_backup = now;
            if self.writable {
                if let Err(e) = self.config_file.save(&persisted) {
                    warn!("Failed to record backup time: {}", e);
                }
            }
        }
        debug!("Routine backup is due");
        self.backup_now().map(Some)
    }

    /// Takes a routine backup of the current documents and prunes old ones.
    pub fn backup_now(&self) -> Result<PathBuf> {
        let mut payload = self.service.snapshot()?;
        payload.compress_all()?;
        let path = self
            .backups
            .create_backup(&VersionedPayload::new(&payload), None)?;

        let retention = self.lock()?.backup_retention;
        match self.backups.delete_backups(retention) {
            Ok(0) => {}
            Ok(removed) => debug!("Removed {} old backups", removed),
            Err(e) => warn!("Failed to prune old backups: {}", e),
        }
        Ok(path)
    }

    /// Replaces the notebook with a backup file and writes it out.
    pub fn restore(&self, path: &Path) -> Result<ImportSummary> {
        self.ensure_writable()?;
        let summary = self.service.import_backup(path)?;
        self.save_full()?;
        Ok(summary)
    }

    /// Re-sorts notes and remembers the order.
    pub fn set_note_sort(&self, sort: DocumentSortType) -> Result<()> {
        self.service.sort_notes(sort)?;
        self.update_config(|config| {
            config.note_sort_type = sort;
            Ok(())
        })?;
        self.save_full()?;
        Ok(())
    }

    /// Re-sorts categories and remembers the order.
    pub fn set_category_sort(&self, sort: DocumentSortType) -> Result<()> {
        self.service.sort_categories(sort)?;
        self.update_config(|config| {
            config.category_sort_type = sort;
            Ok(())
        })?;
        self.save_full()?;
        Ok(())
    }

    /// Closes the open document and writes everything out.
    pub fn shutdown(&self) -> Result<()> {
        self.service.close_document()?;
        if self.writable {
            self.save_full()?;
        }
        info!("Notebook closed");
        Ok(())
    }
}

impl PersistenceHooks for Workspace {
    fn save_pending(&self) -> Result<usize> {
        Workspace::save_pending(self)
    }

    fn save_full(&self) -> Result<usize> {
        Workspace::save_full(self)
    }

    fn backup_if_due(&self) -> Result<Option<PathBuf>> {
        Workspace::backup_if_due(self)
    }

    fn backup_now(&self) -> Result<PathBuf> {
        Workspace::backup_now(self)
    }
}
