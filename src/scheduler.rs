//! Timer-driven persistence task.
//!
//! The scheduler owns a tokio task with three timers: the frequent partial
//! save, the less frequent full save and the routine backup check. It only
//! holds a weak reference to its [`PersistenceHooks`] and ends when their
//! owner goes away.
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

use crate::{NotebookConfig, NotebookError, Result};

/// Upper bound on how long a due backup can wait for the next check.
const MAX_BACKUP_CHECK: Duration = Duration::from_secs(60);

/// Operations the scheduler triggers on the application.
pub trait PersistenceHooks: Send + Sync + 'static {
    /// Writes changed documents. Returns how many were written.
    fn save_pending(&self) -> Result<usize>;

    /// Writes the entire notebook. Returns how many documents were written.
    fn save_full(&self) -> Result<usize>;

    /// Takes a routine backup if the backup frequency has elapsed.
    fn backup_if_due(&self) -> Result<Option<PathBuf>>;

    /// Takes a routine backup unconditionally.
    fn backup_now(&self) -> Result<PathBuf>;
}

/// Timer periods of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerIntervals {
    pub save: Duration,
    pub full_save: Duration,
    pub backup_check: Duration,
}

impl SchedulerIntervals {
    pub fn from_config(config: &NotebookConfig) -> Self {
        SchedulerIntervals {
            save: Duration::from_millis(config.save_frequency_ms),
            full_save: Duration::from_millis(config.full_save_frequency_ms),
            backup_check: Duration::from_millis(config.backup_frequency_ms).min(MAX_BACKUP_CHECK),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    /// Whether the scheduler is running
    pub is_running: bool,
    pub last_save_time: Option<DateTime<Utc>>,
    pub last_full_save_time: Option<DateTime<Utc>>,
    /// The time the last backup was created
    pub last_backup_time: Option<DateTime<Utc>>,
    /// The path to the last backup file
    pub last_backup_path: Option<PathBuf>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SchedulerCommand {
    /// Run a partial save immediately
    SaveNow,
    /// Create a routine backup immediately
    BackupNow,
    /// Restart the timers with new periods
    Reconfigure(SchedulerIntervals),
    /// Stop the scheduler
    Stop,
}

pub struct PersistenceScheduler {
    intervals: SchedulerIntervals,

    /// Channel to send commands to the scheduler task
    command_tx: Option<mpsc::Sender<SchedulerCommand>>,

    /// Handle to the scheduler task
    scheduler_task: Option<JoinHandle<()>>,

    status: Arc<Mutex<SchedulerStatus>>,

    hooks: Option<Weak<dyn PersistenceHooks>>,
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Save,
    FullSave,
    BackupCheck,
    BackupNow,
}

fn timer(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn update_status<F: FnOnce(&mut SchedulerStatus)>(status: &Mutex<SchedulerStatus>, f: F) {
    match status.lock() {
        Ok(mut status) => f(&mut status),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

fn run_save(hooks: &dyn PersistenceHooks, status: &Mutex<SchedulerStatus>) {
    match hooks.save_pending() {
        Ok(0) => {}
        Ok(count) => {
            debug!("Scheduled save wrote {} documents", count);
            update_status(status, |s| s.last_save_time = Some(Utc::now()));
        }
        Err(e) => {
            error!("Scheduled save failed: {}", e);
            update_status(status, |s| s.last_error = Some(e.to_string()));
        }
    }
}

fn run_full_save(hooks: &dyn PersistenceHooks, status: &Mutex<SchedulerStatus>) {
    match hooks.save_full() {
        Ok(count) => {
            info!("Scheduled full save wrote {} documents", count);
            update_status(status, |s| s.last_full_save_time = Some(Utc::now()));
        }
        Err(e) => {
            error!("Scheduled full save failed: {}", e);
            update_status(status, |s| s.last_error = Some(e.to_string()));
        }
    }
}

fn record_backup(status: &Mutex<SchedulerStatus>, path: PathBuf) {
    update_status(status, |s| {
        s.last_backup_time = Some(Utc::now());
        s.last_backup_path = Some(path);
    });
}

fn run_backup_check(hooks: &dyn PersistenceHooks, status: &Mutex<SchedulerStatus>) {
    match hooks.backup_if_due() {
        Ok(Some(path)) => {
            info!("Scheduled backup completed at {}", path.display());
            record_backup(status, path);
        }
        Ok(None) => {}
        Err(e) => {
            // Retried on the normal schedule.
            error!("Scheduled backup failed: {}", e);
            update_status(status, |s| s.last_error = Some(e.to_string()));
        }
    }
}

fn run_backup_now(hooks: &dyn PersistenceHooks, status: &Mutex<SchedulerStatus>) {
    match hooks.backup_now() {
        Ok(path) => {
            info!("Manual backup completed at {}", path.display());
            record_backup(status, path);
        }
        Err(e) => {
            error!("Manual backup failed: {}", e);
            update_status(status, |s| s.last_error = Some(e.to_string()));
        }
    }
}

impl PersistenceScheduler {
    pub fn new(intervals: SchedulerIntervals) -> Self {
        debug!("Initializing persistence scheduler with {:?}", intervals);
        Self {
            intervals,
            command_tx: None,
            scheduler_task: None,
            status: Arc::new(Mutex::new(SchedulerStatus::default())),
            hooks: None,
        }
    }

    /// Set the weak reference to the persistence hooks
    pub fn set_hooks<H: PersistenceHooks>(&mut self, hooks: &Arc<H>) {
        let hooks: Arc<dyn PersistenceHooks> = hooks.clone();
        self.hooks = Some(Arc::downgrade(&hooks));
    }

    /// Spawns the scheduler task. Must be called within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            debug!("Persistence scheduler already running");
            return Ok(());
        }

        let weak = match &self.hooks {
            Some(weak) if weak.strong_count() > 0 => weak.clone(),
            Some(_) => {
                error!("Persistence hooks are no longer valid.");
                return Err(NotebookError::ApplicationError {
                    message: "Persistence hooks are no longer valid.".to_string(),
                });
            }
            None => {
                error!("No persistence hooks set on the scheduler.");
                return Err(NotebookError::ApplicationError {
                    message: "Scheduler does not have persistence hooks.".to_string(),
                });
            }
        };

        let (command_tx, mut command_rx) = mpsc::channel(10);
        self.command_tx = Some(command_tx);

        let intervals = self.intervals;
        let status = Arc::clone(&self.status);
        update_status(&status, |s| s.is_running = true);

        let task = tokio::spawn(async move {
            let mut save_timer = timer(intervals.save);
            let mut full_save_timer = timer(intervals.full_save);
            let mut backup_timer = timer(intervals.backup_check);

            loop {
                let job = tokio::select! {
                    _ = save_timer.tick() => Job::Save,
                    _ = full_save_timer.tick() => Job::FullSave,
                    _ = backup_timer.tick() => Job::BackupCheck,
                    command = command_rx.recv() => match command {
                        Some(SchedulerCommand::SaveNow) => Job::Save,
                        Some(SchedulerCommand::BackupNow) => Job::BackupNow,
                        Some(SchedulerCommand::Reconfigure(new_intervals)) => {
                            info!("Scheduler intervals changed to {:?}", new_intervals);
                            save_timer = timer(new_intervals.save);
                            full_save_timer = timer(new_intervals.full_save);
                            backup_timer = timer(new_intervals.backup_check);
                            continue;
                        }
                        Some(SchedulerCommand::Stop) | None => {
                            info!("Persistence scheduler stopping...");
                            break;
                        }
                    }
                };

                let Some(hooks) = weak.upgrade() else {
                    info!("Persistence hooks dropped, scheduler stopping");
                    break;
                };
                match job {
                    Job::Save => run_save(hooks.as_ref(), &status),
                    Job::FullSave => run_full_save(hooks.as_ref(), &status),
                    Job::BackupCheck => run_backup_check(hooks.as_ref(), &status),
                    Job::BackupNow => run_backup_now(hooks.as_ref(), &status),
                }
            }

            update_status(&status, |s| s.is_running = false);
        });

        self.scheduler_task = Some(task);
        info!("Persistence scheduler started");
        Ok(())
    }

    /// Stop the scheduler if it's running
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.scheduler_task.take() {
            if let Some(command_tx) = self.command_tx.take() {
                if let Err(e) = command_tx.send(SchedulerCommand::Stop).await {
                    debug!("Scheduler task already gone: {}", e);
                }
            }

            if let Err(e) = task.await {
                let error_msg = format!("Failed to stop persistence scheduler: {}", e);
                error!("{}", error_msg);
                return Err(NotebookError::ApplicationError { message: error_msg });
            }
            info!("Persistence scheduler stopped");
        } else {
            debug!("Persistence scheduler is not running");
        }

        Ok(())
    }

    /// Hands a command to the running task.
    pub async fn send(&self, command: SchedulerCommand) -> Result<()> {
        let command_tx = match &self.command_tx {
            Some(command_tx) if self.is_running() => command_tx,
            _ => {
                return Err(NotebookError::ApplicationError {
                    message: "Persistence scheduler is not running".to_string(),
                })
            }
        };

        command_tx
            .send(command)
            .await
            .map_err(|e| NotebookError::ApplicationError {
                message: format!("Failed to send scheduler command: {}", e),
            })
    }

    pub async fn save_now(&self) -> Result<()> {
        self.send(SchedulerCommand::SaveNow).await
    }

    /// Create a backup immediately, regardless of the schedule
    pub async fn backup_now(&self) -> Result<()> {
        self.send(SchedulerCommand::BackupNow).await
    }

    /// Applies new timer periods, restarting the running timers.
    pub async fn reconfigure(&mut self, intervals: SchedulerIntervals) -> Result<()> {
        if intervals == self.intervals {
            return Ok(());
        }
        self.intervals = intervals;
        if self.is_running() {
            self.send(SchedulerCommand::Reconfigure(intervals)).await?;
        } else {
            warn!("Scheduler not running; new intervals apply on next start");
        }
        Ok(())
    }

    pub fn intervals(&self) -> SchedulerIntervals {
        self.intervals
    }

    pub fn is_running(&self) -> bool {
        self.get_status().is_running
    }

    /// Get the current status of the scheduler
    pub fn get_status(&self) -> SchedulerStatus {
        match self.status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
