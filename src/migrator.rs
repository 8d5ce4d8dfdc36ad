//! Schema upgrades for the persisted notebook.
//!
//! The persisted record is upgraded as an untyped JSON value by a linear
//! chain of steps, each keyed by the version it produces. Every step
//! tolerates input that is already in its target shape, and the stored
//! version only advances once a step has been applied and persisted.
use std::{collections::HashMap, path::PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::{BackupManager, NotebookError, Result};

/// Schema version written by this build.
pub const CURRENT_VERSION: u32 = 4;

/// Prefix of the snapshot taken before upgrading from `version`.
pub fn upgrade_backup_prefix(version: u32) -> String {
    format!("upgrade/v{}_", version)
}

type StepFn = fn(&mut Value) -> std::result::Result<(), String>;

/// One transformation of the persisted state.
#[derive(Clone)]
pub struct MigrationStep {
    /// Version the state has after this step.
    pub version: u32,
    pub description: &'static str,
    apply: StepFn,
}

impl MigrationStep {
    pub fn new(version: u32, description: &'static str, apply: StepFn) -> Self {
        MigrationStep {
            version,
            description,
            apply,
        }
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// Outcome of comparing and upgrading the stored version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStatus {
    UpToDate { version: u32 },
    Upgraded { from: u32, to: u32 },
    /// The stored state is newer than this build; it is loaded as is.
    Downgraded { stored: u32, running: u32 },
    /// Migration stopped at `reached`; the state of that version is kept.
    Failed {
        from: u32,
        reached: u32,
        message: String,
    },
}

/// What happened during startup migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    /// The pre-upgrade snapshot, when one was taken.
    pub backup: Option<PathBuf>,
}

impl MigrationReport {
    pub fn up_to_date(version: u32) -> Self {
        MigrationReport {
            status: MigrationStatus::UpToDate { version },
            backup: None,
        }
    }

    /// Whether the collaborator layer should surface a warning.
    pub fn needs_attention(&self) -> bool {
        matches!(
            self.status,
            MigrationStatus::Downgraded { .. } | MigrationStatus::Failed { .. }
        )
    }
}

/// Upgraded state together with the report describing how it got there.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub report: MigrationReport,
    pub state: Value,
}

/// Ordered chain of migration steps.
#[derive(Debug, Clone)]
pub struct Migrator {
    steps: Vec<MigrationStep>,
}

impl Default for Migrator {
    fn default() -> Self {
        Migrator {
            steps: vec![
                MigrationStep::new(1, "snake_case field names", rename_legacy_fields),
                MigrationStep::new(2, "stable ids and category references", assign_stable_ids),
                MigrationStep::new(3, "normalized timestamps", normalize_timestamps),
                MigrationStep::new(4, "annotation lists", default_annotation_lists),
            ],
        }
    }
}

impl Migrator {
    /// Builds a migrator from steps with strictly increasing versions.
    pub fn new(steps: Vec<MigrationStep>) -> Result<Self> {
        for pair in steps.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(NotebookError::ConfigError {
                    message: format!(
                        "migration step {} is not ordered after step {}",
                        pair[1].version, pair[0].version
                    ),
                });
            }
        }
        Ok(Migrator { steps })
    }

    /// Version the chain upgrades to.
    pub fn running_version(&self) -> u32 {
        self.steps.last().map_or(0, |step| step.version)
    }

    fn pending(&self, stored: u32) -> impl Iterator<Item = &MigrationStep> {
        self.steps.iter().filter(move |step| step.version > stored)
    }

    /// Upgrades persisted state at startup.
    ///
    /// When the stored version is older, a snapshot is written with the
    /// `upgrade/v<stored>_` prefix before anything changes; if that fails
    /// no step runs. After each step the new state is handed to `persist`.
    /// A failing step or persist stops the chain and the last persisted
    /// state is returned.
    pub fn migrate<F>(&self, state: Value, backups: &BackupManager, mut persist: F) -> MigrationOutcome
    where
        F: FnMut(&Value) -> Result<()>,
    {
        let stored = stored_version(&state);
        let running = self.running_version();

        if stored == running {
            debug!("Stored notebook is at version {}", stored);
            return MigrationOutcome {
                report: MigrationReport::up_to_date(stored),
                state,
            };
        }

        if stored > running {
            warn!(
                "Stored notebook version {} is newer than supported version {}; loading anyway",
                stored, running
            );
            return MigrationOutcome {
                report: MigrationReport {
                    status: MigrationStatus::Downgraded { stored, running },
                    backup: None,
                },
                state,
            };
        }

        info!("Upgrading notebook from version {} to {}", stored, running);
        let backup = match backups.create_backup(&state, Some(&upgrade_backup_prefix(stored))) {
            Ok(path) => path,
            Err(e) => {
                error!("Upgrade backup failed, skipping migration: {}", e);
                return MigrationOutcome {
                    report: MigrationReport {
                        status: MigrationStatus::Failed {
                            from: stored,
                            reached: stored,
                            message: format!("upgrade backup failed: {}", e),
                        },
                        backup: None,
                    },
                    state,
                };
            }
        };

        let mut current = state;
        let mut reached = stored;
        for step in self.pending(stored) {
            let mut next = current.clone();
            let applied = (step.apply)(&mut next)
                .map_err(|message| NotebookError::MigrationStep {
                    version: step.version,
                    message,
                })
                .and_then(|_| {
                    set_version(&mut next, step.version);
                    persist(&next)
                });

            if let Err(e) = applied {
                error!("Migration stopped at version {}: {}", reached, e);
                return MigrationOutcome {
                    report: MigrationReport {
                        status: MigrationStatus::Failed {
                            from: stored,
                            reached,
                            message: e.to_string(),
                        },
                        backup: Some(backup),
                    },
                    state: current,
                };
            }

            info!("Migrated notebook to version {} ({})", step.version, step.description);
            current = next;
            reached = step.version;
        }

        MigrationOutcome {
            report: MigrationReport {
                status: MigrationStatus::Upgraded {
                    from: stored,
                    to: reached,
                },
                backup: Some(backup),
            },
            state: current,
        }
    }

    /// Applies pending steps without taking a backup or persisting.
    ///
    /// Used for imported snapshots, which may come from any version.
    pub fn upgrade_payload(&self, mut value: Value) -> Result<Value> {
        let stored = stored_version(&value);
        if stored > self.running_version() {
            warn!(
                "Snapshot version {} is newer than supported version {}",
                stored,
                self.running_version()
            );
            return Ok(value);
        }
        for step in self.pending(stored) {
            (step.apply)(&mut value).map_err(|message| NotebookError::MigrationStep {
                version: step.version,
                message,
            })?;
            set_version(&mut value, step.version);
        }
        Ok(value)
    }
}

/// Version recorded in persisted state.
///
/// Records in the legacy PascalCase layout carry an unrelated `Version`
/// number and count as version 0, as does anything without a version.
pub fn stored_version(state: &Value) -> u32 {
    state
        .get("version")
        .and_then(Value::as_u64)
        .and_then(|version| u32::try_from(version).ok())
        .unwrap_or(0)
}

fn set_version(state: &mut Value, version: u32) {
    if let Some(object) = state.as_object_mut() {
        object.insert("version".to_string(), Value::from(version));
    }
}

fn root_object(state: &mut Value) -> std::result::Result<&mut Map<String, Value>, String> {
    state
        .as_object_mut()
        .ok_or_else(|| "persisted state is not an object".to_string())
}

/// Mutable access to the documents of one collection. Missing or null
/// collections yield nothing.
fn documents_mut<'a>(
    root: &'a mut Map<String, Value>,
    key: &str,
) -> std::result::Result<Vec<&'a mut Map<String, Value>>, String> {
    match root.get_mut(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter_mut()
            .map(|item| {
                item.as_object_mut()
                    .ok_or_else(|| format!("entry in `{}` is not an object", key))
            })
            .collect(),
        Some(_) => Err(format!("`{}` is not a list", key)),
    }
}

fn rename_keys(object: &mut Map<String, Value>, renames: &[(&str, &str)]) {
    for (from, to) in renames {
        if let Some(value) = object.remove(*from) {
            if !object.contains_key(*to) {
                object.insert(to.to_string(), value);
            }
        }
    }
}

const ROOT_RENAMES: &[(&str, &str)] = &[
    ("Notes", "notes"),
    ("Categories", "categories"),
    ("IncludeNoteBodiesInSearch", "include_note_bodies_in_search"),
    ("PenThickness", "pen_thickness"),
    ("PenColor", "pen_color"),
    ("LastBackup", "last_backup"),
    ("BackupRetention", "backup_retention"),
    // Frequencies were already stored in milliseconds and sort orders as codes
    ("BackupFrequency", "backup_frequency_ms"),
    ("SaveFrequency", "save_frequency_ms"),
    ("FullSaveFrequency", "full_save_frequency_ms"),
    ("NoteSortType", "note_sort_type"),
    ("CategorySortType", "category_sort_type"),
    ("ShowContentPreview", "show_content_preview"),
];

const DOCUMENT_RENAMES: &[(&str, &str)] = &[
    ("Id", "id"),
    ("InternalName", "internal_name"),
    ("Name", "name"),
    ("Body", "body"),
    ("Images", "images"),
    ("Lines", "lines"),
    ("Categories", "categories"),
    ("Color", "color"),
    ("Created", "created"),
    ("Modified", "modified"),
];

/// v1: PascalCase field names become snake_case.
fn rename_legacy_fields(state: &mut Value) -> std::result::Result<(), String> {
    let root = root_object(state)?;
    root.remove("Version");
    rename_keys(root, ROOT_RENAMES);
    for collection in ["notes", "categories"] {
        for document in documents_mut(root, collection)? {
            rename_keys(document, DOCUMENT_RENAMES);
            if let Some(Value::Array(embedded)) = document.get_mut("categories") {
                for category in embedded.iter_mut().filter_map(Value::as_object_mut) {
                    rename_keys(category, DOCUMENT_RENAMES);
                }
            }
        }
    }
    Ok(())
}

/// v2: every document gets a stable id and notes reference categories by id.
///
/// Legacy documents were identified by `internal_name = "<name>##<uid>"`;
/// the uid becomes the id and the part before `##` the name. Documents
/// without a uid get `legacy-<kind>-<index>`.
fn assign_stable_ids(state: &mut Value) -> std::result::Result<(), String> {
    let root = root_object(state)?;

    let mut by_internal_name: HashMap<String, String> = HashMap::new();
    for collection in ["categories", "notes"] {
        let kind = collection.trim_end_matches('s');
        for (index, document) in documents_mut(root, collection)?.into_iter().enumerate() {
            let internal_name = document
                .remove("internal_name")
                .and_then(|value| value.as_str().map(str::to_string));

            let has_id = document
                .get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| !id.is_empty());
            if !has_id {
                let id = internal_name
                    .as_deref()
                    .and_then(|name| name.split_once("##"))
                    .map(|(_, uid)| uid.trim())
                    .filter(|uid| !uid.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("legacy-{}-{}", kind, index));
                document.insert("id".to_string(), Value::from(id));
            }

            if let Some(internal_name) = internal_name {
                let named = document
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| !name.is_empty());
                if !named {
                    let display = internal_name
                        .split_once("##")
                        .map_or(internal_name.as_str(), |(name, _)| name);
                    document.insert("name".to_string(), Value::from(display));
                }
                if collection == "categories" {
                    if let Some(id) = document.get("id").and_then(Value::as_str) {
                        by_internal_name.insert(internal_name, id.to_string());
                    }
                }
            }
        }
    }

    for note in documents_mut(root, "notes")? {
        let Some(Value::Array(references)) = note.get_mut("categories") else {
            continue;
        };
        let resolved: Vec<Value> = references
            .iter()
            .filter_map(|reference| match reference {
                Value::String(_) => Some(reference.clone()),
                Value::Object(embedded) => embedded
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| {
                        embedded
                            .get("internal_name")
                            .and_then(Value::as_str)
                            .and_then(|name| by_internal_name.get(name).cloned())
                    })
                    .map(Value::from),
                _ => None,
            })
            .collect();
        *references = resolved;
    }
    Ok(())
}

fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|millis| millis as i64)),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|parsed| parsed.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|naive| naive.and_utc())
            })
            .ok()
            .map(|parsed| parsed.timestamp_millis()),
        _ => None,
    }
}

/// v3: `created` and `modified` are unix milliseconds with modified >= created.
fn normalize_timestamps(state: &mut Value) -> std::result::Result<(), String> {
    let root = root_object(state)?;
    // Undated records fall back to the last backup time, else the epoch
    let fallback = root
        .get("last_backup")
        .and_then(timestamp_millis)
        .filter(|millis| *millis > 0)
        .unwrap_or(0);
    for collection in ["notes", "categories"] {
        for document in documents_mut(root, collection)? {
            let created = document.get("created").and_then(timestamp_millis);
            let modified = document.get("modified").and_then(timestamp_millis);
            let created = created.or(modified).unwrap_or(fallback);
            let modified = modified.unwrap_or(created).max(created);
            document.insert("created".to_string(), Value::from(created));
            document.insert("modified".to_string(), Value::from(modified));
        }
    }
    Ok(())
}

/// v4: annotation and category lists are present, never null.
fn default_annotation_lists(state: &mut Value) -> std::result::Result<(), String> {
    let root = root_object(state)?;
    for collection in ["notes", "categories"] {
        for document in documents_mut(root, collection)? {
            for key in ["images", "lines"] {
                if document.get(key).map_or(true, Value::is_null) {
                    document.insert(key.to_string(), Value::Array(Vec::new()));
                }
            }
            if collection == "notes" && document.get("categories").map_or(true, Value::is_null) {
                document.insert("categories".to_string(), Value::Array(Vec::new()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn legacy_state() -> Value {
        json!({
            "Version": 2,
            "IncludeNoteBodiesInSearch": true,
            "BackupFrequency": 3_600_000,
            "SaveFrequency": 30_000,
            "FullSaveFrequency": 7_200_000,
            "NoteSortType": 0,
            "CategorySortType": 5,
            "ShowContentPreview": true,
            "Categories": [
                { "InternalName": "Work##c-1", "Body": "work stuff", "Color": { "X": 1.0, "Y": 0.0, "Z": 0.0 } }
            ],
            "Notes": [
                {
                    "InternalName": "Plans##n-1",
                    "Body": "ship it",
                    "Created": "2021-03-04T05:06:07Z",
                    "Categories": [ { "InternalName": "Work##c-1", "Body": "work stuff" } ],
                    "Images": null
                }
            ]
        })
    }

    #[test]
    fn upgrades_legacy_layout() {
        let upgraded = Migrator::default().upgrade_payload(legacy_state()).unwrap();

        assert_eq!(stored_version(&upgraded), CURRENT_VERSION);
        assert_eq!(upgraded["include_note_bodies_in_search"], true);
        assert!(upgraded.get("Version").is_none());
        assert_eq!(upgraded["backup_frequency_ms"], 3_600_000);
        assert_eq!(upgraded["save_frequency_ms"], 30_000);
        assert_eq!(upgraded["full_save_frequency_ms"], 7_200_000);
        assert_eq!(upgraded["show_content_preview"], true);

        let config: crate::NotebookConfig = serde_json::from_value(upgraded.clone()).unwrap();
        assert_eq!(config.note_sort_type, crate::DocumentSortType::NameAscending);
        assert_eq!(
            config.category_sort_type,
            crate::DocumentSortType::ModifiedDescending
        );
        assert_eq!(config.backup_frequency_ms, 3_600_000);
        assert!(config.show_content_preview);

        let category = &upgraded["categories"][0];
        assert_eq!(category["id"], "c-1");
        assert_eq!(category["name"], "Work");
        assert_eq!(category["images"], json!([]));

        let note = &upgraded["notes"][0];
        assert_eq!(note["id"], "n-1");
        assert_eq!(note["name"], "Plans");
        assert_eq!(note["categories"], json!(["c-1"]));
        assert_eq!(note["images"], json!([]));
        assert_eq!(note["lines"], json!([]));
        assert_eq!(note["created"], 1_614_834_367_000i64);
        assert_eq!(note["modified"], note["created"]);
        assert!(note.get("internal_name").is_none());
    }

    #[test]
    fn steps_tolerate_already_migrated_state() {
        let migrator = Migrator::default();
        let once = migrator.upgrade_payload(legacy_state()).unwrap();

        let mut again = once.clone();
        for step in &migrator.steps {
            (step.apply)(&mut again).unwrap();
        }
        set_version(&mut again, CURRENT_VERSION);
        assert_eq!(again, once);
    }

    #[test]
    fn records_without_uid_or_dates_upgrade_the_same_way_every_time() {
        let state = json!({
            "LastBackup": 1_600_000_000_000i64,
            "Categories": [ { "Name": "Loose" } ],
            "Notes": [ { "InternalName": "NoUid", "Body": "x" }, { "Body": "y" } ]
        });
        let migrator = Migrator::default();

        let first = migrator.upgrade_payload(state.clone()).unwrap();
        let second = migrator.upgrade_payload(state).unwrap();
        assert_eq!(first, second);

        assert_eq!(first["categories"][0]["id"], "legacy-category-0");
        assert_eq!(first["notes"][0]["id"], "legacy-note-0");
        assert_eq!(first["notes"][0]["name"], "NoUid");
        assert_eq!(first["notes"][1]["id"], "legacy-note-1");
        assert_eq!(first["notes"][1]["created"], 1_600_000_000_000i64);
        assert_eq!(first["notes"][1]["modified"], 1_600_000_000_000i64);
    }

    #[test]
    fn migrate_takes_upgrade_backup_and_persists_each_step() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupManager::new(dir.path().join("backups"));
        let state = json!({ "version": 3, "notes": [ { "id": "a", "name": "n", "created": 5, "modified": 5 } ] });

        let mut persisted = Vec::new();
        let outcome = Migrator::default().migrate(state, &backups, |value| {
            persisted.push(stored_version(value));
            Ok(())
        });

        assert_eq!(
            outcome.report.status,
            MigrationStatus::Upgraded { from: 3, to: 4 }
        );
        assert_eq!(persisted, vec![4]);
        assert_eq!(outcome.state["notes"][0]["images"], json!([]));

        let backup = outcome.report.backup.unwrap();
        assert!(backup.starts_with(dir.path().join("backups").join("upgrade")));
        let name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("v3_"));
        assert_eq!(crate::read_backup(&backup).unwrap()["version"], 3);
    }

    #[test]
    fn migrating_twice_matches_migrating_once() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupManager::new(dir.path());
        let migrator = Migrator::default();

        let first = migrator.migrate(legacy_state(), &backups, |_| Ok(()));
        let second = migrator.migrate(first.state.clone(), &backups, |_| Ok(()));

        assert_eq!(second.state, first.state);
        assert_eq!(
            second.report.status,
            MigrationStatus::UpToDate {
                version: CURRENT_VERSION
            }
        );
        assert!(second.report.backup.is_none());
    }

    #[test]
    fn failing_step_keeps_last_persisted_version() {
        fn broken(_: &mut Value) -> std::result::Result<(), String> {
            Err("boom".to_string())
        }

        let dir = tempfile::tempdir().unwrap();
        let backups = BackupManager::new(dir.path());
        let migrator = Migrator::new(vec![
            MigrationStep::new(1, "ok", rename_legacy_fields),
            MigrationStep::new(2, "broken", broken),
        ])
        .unwrap();

        let mut persisted = Vec::new();
        let outcome = migrator.migrate(json!({ "Notes": [] }), &backups, |value| {
            persisted.push(value.clone());
            Ok(())
        });

        match &outcome.report.status {
            MigrationStatus::Failed { from, reached, message } => {
                assert_eq!((*from, *reached), (0, 1));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(outcome.report.needs_attention());
        assert_eq!(stored_version(&outcome.state), 1);
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0], outcome.state);
    }

    #[test]
    fn failed_persist_stops_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupManager::new(dir.path());
        let outcome = Migrator::default().migrate(json!({ "version": 2 }), &backups, |value| {
            if stored_version(value) == 4 {
                return Err(NotebookError::ApplicationError {
                    message: "read-only".to_string(),
                });
            }
            Ok(())
        });

        assert!(matches!(
            outcome.report.status,
            MigrationStatus::Failed { from: 2, reached: 3, .. }
        ));
        assert_eq!(stored_version(&outcome.state), 3);
    }

    #[test]
    fn backup_failure_prevents_migration() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let backups = BackupManager::new(blocker.join("backups"));

        let mut persisted = 0;
        let state = json!({ "version": 1 });
        let outcome = Migrator::default().migrate(state.clone(), &backups, |_| {
            persisted += 1;
            Ok(())
        });

        assert!(matches!(
            outcome.report.status,
            MigrationStatus::Failed { from: 1, reached: 1, .. }
        ));
        assert_eq!(outcome.state, state);
        assert_eq!(persisted, 0);
    }

    #[test]
    fn newer_state_is_loaded_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let backups = BackupManager::new(dir.path());
        let state = json!({ "version": CURRENT_VERSION + 1, "notes": [] });

        let outcome = Migrator::default().migrate(state.clone(), &backups, |_| Ok(()));
        assert_eq!(
            outcome.report.status,
            MigrationStatus::Downgraded {
                stored: CURRENT_VERSION + 1,
                running: CURRENT_VERSION
            }
        );
        assert!(outcome.report.needs_attention());
        assert_eq!(outcome.state, state);
    }

    #[test]
    fn steps_must_be_ordered() {
        let err = Migrator::new(vec![
            MigrationStep::new(2, "b", default_annotation_lists),
            MigrationStep::new(2, "again", default_annotation_lists),
        ])
        .unwrap_err();
        assert!(matches!(err, NotebookError::ConfigError { .. }));
    }

    #[test]
    fn non_list_collection_fails_the_step() {
        let err = Migrator::default()
            .upgrade_payload(json!({ "version": 3, "notes": 5 }))
            .unwrap_err();
        assert!(matches!(err, NotebookError::MigrationStep { version: 4, .. }));
    }
}
