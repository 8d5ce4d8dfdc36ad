use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    helper, Category, DocumentSortType, Note, NotebookError, Result, Rgb, CURRENT_VERSION,
};

pub const CONFIG_FILE_NAME: &str = "notebook.json";
pub const BACKUP_DIR_NAME: &str = "backups";

pub const MIN_SAVE_FREQUENCY_MS: u64 = 1_000;
pub const MAX_SAVE_FREQUENCY_MS: u64 = 300_000;
pub const MIN_FULL_SAVE_FREQUENCY_MS: u64 = 3_600_000;
pub const MAX_FULL_SAVE_FREQUENCY_MS: u64 = 12 * 3_600_000;
pub const MIN_BACKUP_FREQUENCY_MS: u64 = 60_000;

/// The persisted notebook: settings plus both document collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotebookConfig {
    /// Schema version of this record
    pub version: u32,

    /// Time of the last routine backup (unix milliseconds)
    pub last_backup: i64,

    /// Minimum time between routine backups
    pub backup_frequency_ms: u64,

    /// Number of routine backups to keep (0 keeps all)
    pub backup_retention: usize,

    /// Interval of the partial save
    pub save_frequency_ms: u64,

    /// Interval of the full save
    pub full_save_frequency_ms: u64,

    pub include_note_bodies_in_search: bool,

    #[serde(deserialize_with = "lenient_sort")]
    pub note_sort_type: DocumentSortType,

    #[serde(deserialize_with = "lenient_sort")]
    pub category_sort_type: DocumentSortType,

    pub show_content_preview: bool,
    pub pen_thickness: f32,
    pub pen_color: Rgb,

    #[serde(deserialize_with = "crate::document::null_as_empty")]
    pub notes: Vec<Note>,

    #[serde(deserialize_with = "crate::document::null_as_empty")]
    pub categories: Vec<Category>,
}

impl Default for NotebookConfig {
    fn default() -> Self {
        NotebookConfig {
            version: CURRENT_VERSION,
            last_backup: 0,
            backup_frequency_ms: 24 * 3_600_000,
            backup_retention: 7,
            save_frequency_ms: 10_000,
            full_save_frequency_ms: 3_600_000,
            include_note_bodies_in_search: false,
            note_sort_type: DocumentSortType::default(),
            category_sort_type: DocumentSortType::default(),
            show_content_preview: false,
            pen_thickness: 2.0,
            pen_color: Rgb::WHITE,
            notes: Vec::new(),
            categories: Vec::new(),
        }
    }
}

/// Accepts a sort name or a legacy numeric code; anything else falls back
/// to the default order.
fn lenient_sort<'de, D>(deserializer: D) -> std::result::Result<DocumentSortType, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let parsed = match &raw {
        Value::String(text) => DocumentSortType::from_str(text).ok(),
        Value::Number(code) => code
            .as_u64()
            .and_then(|code| u8::try_from(code).ok())
            .and_then(DocumentSortType::from_code),
        _ => None,
    };
    Ok(parsed.unwrap_or_else(|| {
        warn!("Unknown sort order {} in configuration, using default", raw);
        DocumentSortType::default()
    }))
}

fn parse_setting<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| NotebookError::ConfigError {
        message: format!("invalid value `{}` for {}", value, key),
    })
}

impl NotebookConfig {
    /// Whether a routine backup is due at `now` (unix milliseconds).
    pub fn is_backup_due(&self, now: i64) -> bool {
        let frequency = i64::try_from(self.backup_frequency_ms).unwrap_or(i64::MAX);
        now > self.last_backup.saturating_add(frequency)
    }

    /// Clamps intervals into their supported ranges. Returns `true` if
    /// anything changed.
    pub fn normalize(&mut self) -> bool {
        let before = (
            self.save_frequency_ms,
            self.full_save_frequency_ms,
            self.backup_frequency_ms,
        );

        self.save_frequency_ms = self
            .save_frequency_ms
            .clamp(MIN_SAVE_FREQUENCY_MS, MAX_SAVE_FREQUENCY_MS);
        self.full_save_frequency_ms = self
            .full_save_frequency_ms
            .clamp(MIN_FULL_SAVE_FREQUENCY_MS, MAX_FULL_SAVE_FREQUENCY_MS);
        self.backup_frequency_ms = self.backup_frequency_ms.max(MIN_BACKUP_FREQUENCY_MS);
        if !self.pen_thickness.is_finite() || self.pen_thickness <= 0.0 {
            self.pen_thickness = 2.0;
        }

        let after = (
            self.save_frequency_ms,
            self.full_save_frequency_ms,
            self.backup_frequency_ms,
        );
        if before != after {
            warn!("Adjusted out-of-range save or backup intervals in configuration");
        }
        before != after
    }

    /// Updates one setting from its textual form, as given on the command line.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key.trim() {
            "backup_frequency_ms" => self.backup_frequency_ms = parse_setting(key, value)?,
            "backup_retention" => self.backup_retention = parse_setting(key, value)?,
            "save_frequency_ms" => self.save_frequency_ms = parse_setting(key, value)?,
            "full_save_frequency_ms" => self.full_save_frequency_ms = parse_setting(key, value)?,
            "include_note_bodies_in_search" => {
                self.include_note_bodies_in_search = parse_setting(key, value)?
            }
            "show_content_preview" => self.show_content_preview = parse_setting(key, value)?,
            "pen_thickness" => self.pen_thickness = parse_setting(key, value)?,
            "note_sort_type" => self.note_sort_type = value.parse()?,
            "category_sort_type" => self.category_sort_type = value.parse()?,
            "pen_color" => {
                self.pen_color = Rgb::from_hex(value).ok_or_else(|| NotebookError::ConfigError {
                    message: format!("invalid colour `{}` (expected #rrggbb)", value),
                })?
            }
            other => {
                return Err(NotebookError::ConfigError {
                    message: format!("unknown setting `{}`", other),
                })
            }
        }
        self.normalize();
        Ok(())
    }

    /// Settings without the document collections, for display.
    pub fn settings_json(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("notes");
            object.remove("categories");
        }
        Ok(value)
    }
}

/// The configuration file on disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file as untyped JSON.
    ///
    /// A missing file yields `None`. A file that does not parse is moved
    /// aside and also yields `None`; other I/O errors are returned.
    pub fn load_raw(&self) -> Result<Option<Value>> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No configuration at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(NotebookError::persistence(&self.path, e)),
        };

        match serde_json::from_slice::<Value>(&content) {
            Ok(value) if value.is_object() => Ok(Some(value)),
            Ok(_) => {
                self.quarantine("not a JSON object")?;
                Ok(None)
            }
            Err(e) => {
                self.quarantine(&e.to_string())?;
                Ok(None)
            }
        }
    }

    /// Moves the current file aside so a fresh notebook can be written.
    pub fn quarantine(&self, reason: &str) -> Result<PathBuf> {
        let moved = helper::quarantine_file(&self.path)?;
        warn!(
            "Configuration {} is unreadable ({}); moved to {}",
            self.path.display(),
            reason,
            moved.display()
        );
        Ok(moved)
    }

    pub fn write_raw(&self, value: &Value) -> Result<()> {
        helper::write_json_atomically(&self.path, value)
    }

    pub fn save(&self, config: &NotebookConfig) -> Result<()> {
        helper::write_json_atomically(&self.path, config)?;
        debug!("Configuration saved to {}", self.path.display());
        Ok(())
    }
}

/// Where a notebook keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub data_dir: PathBuf,
    pub config_file: PathBuf,
    pub backup_dir: PathBuf,
}

impl WorkspacePaths {
    /// `notebook.json` and `backups/` under `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        WorkspacePaths {
            config_file: data_dir.join(CONFIG_FILE_NAME),
            backup_dir: data_dir.join(BACKUP_DIR_NAME),
            data_dir,
        }
    }

    /// The platform data directory for neatnote.
    pub fn default_location() -> Result<Self> {
        let dirs = ProjectDirs::from("dev", "neatnote", "NeatNote").ok_or_else(|| {
            NotebookError::ConfigError {
                message: "could not determine a home directory".to_string(),
            }
        })?;
        let paths = Self::in_dir(dirs.data_dir());
        info!("Using data directory {}", paths.data_dir.display());
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_take_defaults() {
        let config: NotebookConfig = serde_json::from_value(json!({
            "version": 4,
            "backup_retention": 3,
            "notes": null
        }))
        .unwrap();

        assert_eq!(config.backup_retention, 3);
        assert_eq!(config.save_frequency_ms, 10_000);
        assert_eq!(config.pen_thickness, 2.0);
        assert_eq!(config.pen_color, Rgb::WHITE);
        assert!(config.notes.is_empty());
        assert_eq!(config.note_sort_type, DocumentSortType::CreatedDescending);
    }

    #[test]
    fn sort_types_accept_codes_and_tolerate_garbage() {
        let config: NotebookConfig = serde_json::from_value(json!({
            "note_sort_type": 0,
            "category_sort_type": "sideways"
        }))
        .unwrap();
        assert_eq!(config.note_sort_type, DocumentSortType::NameAscending);
        assert_eq!(config.category_sort_type, DocumentSortType::default());
    }

    #[test]
    fn backup_due_only_after_frequency_elapsed() {
        let config = NotebookConfig {
            last_backup: 1_000,
            backup_frequency_ms: 500,
            ..NotebookConfig::default()
        };
        assert!(!config.is_backup_due(1_500));
        assert!(config.is_backup_due(1_501));
    }

    #[test]
    fn set_value_parses_and_clamps() {
        let mut config = NotebookConfig::default();
        config.set_value("save_frequency_ms", "999999").unwrap();
        assert_eq!(config.save_frequency_ms, MAX_SAVE_FREQUENCY_MS);

        config.set_value("note_sort_type", "name-desc").unwrap();
        assert_eq!(config.note_sort_type, DocumentSortType::NameDescending);

        config.set_value("pen_color", "#ff0000").unwrap();
        assert_eq!(config.pen_color, Rgb::new(1.0, 0.0, 0.0));

        config.set_value("include_note_bodies_in_search", "true").unwrap();
        assert!(config.include_note_bodies_in_search);

        assert!(config.set_value("backup_retention", "many").is_err());
        assert!(config.set_value("favourite_colour", "blue").is_err());
    }

    #[test]
    fn settings_json_omits_documents() {
        let value = NotebookConfig::default().settings_json().unwrap();
        assert!(value.get("notes").is_none());
        assert!(value.get("categories").is_none());
        assert_eq!(value["backup_retention"], 7);
    }

    #[test]
    fn load_raw_handles_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join(CONFIG_FILE_NAME));
        assert!(file.load_raw().unwrap().is_none());

        fs::write(file.path(), "{ truncated").unwrap();
        assert!(file.load_raw().unwrap().is_none());
        assert!(!file.path().exists());
        let quarantined = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(quarantined, 1);

        file.save(&NotebookConfig::default()).unwrap();
        let raw = file.load_raw().unwrap().unwrap();
        assert_eq!(raw["version"], CURRENT_VERSION);
    }

    #[test]
    fn paths_are_rooted_in_data_dir() {
        let paths = WorkspacePaths::in_dir("/tmp/notes");
        assert_eq!(paths.config_file, PathBuf::from("/tmp/notes/notebook.json"));
        assert_eq!(paths.backup_dir, PathBuf::from("/tmp/notes/backups"));
    }
}
