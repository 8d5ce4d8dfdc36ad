//! Shared types for the neatnote library.
//!
//! This module contains the result alias, sort orders, save records and the
//! CLI subcommands.
use std::{fmt, path::PathBuf, str::FromStr};

use clap::Subcommand;
use serde::{Deserialize, Serialize};

use crate::{Category, DocumentId, Note, NotebookError};

/// A specialized Result type for neatnote operations.
pub type Result<T> = std::result::Result<T, NotebookError>;

/// Field a document list is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Created,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// The six orderings offered for notes and categories.
///
/// The numeric codes match the ones stored by earlier versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentSortType {
    NameAscending,
    NameDescending,
    CreatedAscending,
    #[default]
    CreatedDescending,
    ModifiedAscending,
    ModifiedDescending,
}

impl DocumentSortType {
    pub const ALL: [DocumentSortType; 6] = [
        DocumentSortType::NameAscending,
        DocumentSortType::NameDescending,
        DocumentSortType::CreatedAscending,
        DocumentSortType::CreatedDescending,
        DocumentSortType::ModifiedAscending,
        DocumentSortType::ModifiedDescending,
    ];

    pub fn new(key: SortKey, direction: SortDirection) -> Self {
        use SortDirection::*;
        match (key, direction) {
            (SortKey::Name, Ascending) => DocumentSortType::NameAscending,
            (SortKey::Name, Descending) => DocumentSortType::NameDescending,
            (SortKey::Created, Ascending) => DocumentSortType::CreatedAscending,
            (SortKey::Created, Descending) => DocumentSortType::CreatedDescending,
            (SortKey::Modified, Ascending) => DocumentSortType::ModifiedAscending,
            (SortKey::Modified, Descending) => DocumentSortType::ModifiedDescending,
        }
    }

    pub fn key(&self) -> SortKey {
        match self {
            DocumentSortType::NameAscending | DocumentSortType::NameDescending => SortKey::Name,
            DocumentSortType::CreatedAscending | DocumentSortType::CreatedDescending => {
                SortKey::Created
            }
            DocumentSortType::ModifiedAscending | DocumentSortType::ModifiedDescending => {
                SortKey::Modified
            }
        }
    }

    pub fn direction(&self) -> SortDirection {
        match self {
            DocumentSortType::NameAscending
            | DocumentSortType::CreatedAscending
            | DocumentSortType::ModifiedAscending => SortDirection::Ascending,
            _ => SortDirection::Descending,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            DocumentSortType::NameAscending => 0,
            DocumentSortType::NameDescending => 1,
            DocumentSortType::CreatedAscending => 2,
            DocumentSortType::CreatedDescending => 3,
            DocumentSortType::ModifiedAscending => 4,
            DocumentSortType::ModifiedDescending => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn label(&self) -> &'static str {
        match self {
            DocumentSortType::NameAscending => "name-ascending",
            DocumentSortType::NameDescending => "name-descending",
            DocumentSortType::CreatedAscending => "created-ascending",
            DocumentSortType::CreatedDescending => "created-descending",
            DocumentSortType::ModifiedAscending => "modified-ascending",
            DocumentSortType::ModifiedDescending => "modified-descending",
        }
    }
}

impl fmt::Display for DocumentSortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DocumentSortType {
    type Err = NotebookError;

    /// Accepts `name-ascending`, the short `name-asc` form, a bare key
    /// (ascending) or a numeric code.
    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        if let Ok(code) = normalized.parse::<u8>() {
            return Self::from_code(code).ok_or_else(|| invalid_sort(value));
        }

        let (key, direction) = match normalized.split_once('-') {
            Some((key, direction)) => (key, direction),
            None => (normalized.as_str(), "asc"),
        };
        let key = match key {
            "name" => SortKey::Name,
            "created" => SortKey::Created,
            "modified" => SortKey::Modified,
            _ => return Err(invalid_sort(value)),
        };
        let direction = match direction {
            "asc" | "ascending" => SortDirection::Ascending,
            "desc" | "descending" => SortDirection::Descending,
            _ => return Err(invalid_sort(value)),
        };
        Ok(Self::new(key, direction))
    }
}

fn invalid_sort(value: &str) -> NotebookError {
    NotebookError::InvalidFormat {
        message: format!(
            "unknown sort order `{}` (expected name|created|modified with -asc or -desc)",
            value
        ),
    }
}

/// A persisted-form document produced by a partial save.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    Note(Note),
    Category(Category),
    /// The document no longer exists and must be dropped from storage.
    Removed(DocumentId),
}

/// What was repaired while loading a set of collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Bodies that failed to decode and were replaced by empty ones.
    pub corrupt_bodies: usize,
    /// Documents given a fresh id because theirs was already taken.
    pub duplicate_ids: usize,
    /// Category references removed because the category does not exist.
    pub dangling_references: usize,
}

/// Summary of a backup import.
#[derive(Debug, Clone)]
pub struct ImportSummary {
    /// File the notebook was restored from
    pub source: PathBuf,
    pub notes: usize,
    pub categories: usize,
    pub repairs: LoadReport,
}

/// Available subcommands for the neatnote application
#[derive(Subcommand)]
pub enum Commands {
    /// Create a new note
    Note {
        /// Name of the note
        #[clap(short = 'T', long)]
        name: Option<String>,

        /// Body text of the note
        #[clap(short, long)]
        body: Option<String>,

        /// Category ids to assign (comma-separated)
        #[clap(short, long)]
        categories: Option<String>,
    },

    /// Create a new category
    Category {
        /// Name of the category
        #[clap(short = 'T', long)]
        name: Option<String>,

        /// Description stored as the category body
        #[clap(short, long)]
        description: Option<String>,

        /// Display colour as #rrggbb (random when omitted)
        #[clap(long)]
        color: Option<String>,
    },

    /// List notes with optional search and category filter
    List {
        /// Only show notes whose name contains this text
        #[clap(short, long)]
        search: Option<String>,

        /// Also match the search text against note bodies
        #[clap(short = 'b', long)]
        include_bodies: bool,

        /// Only show notes carrying all of these category ids (comma-separated)
        #[clap(short, long)]
        categories: Option<String>,

        /// Order to display, e.g. name-asc or modified-desc
        #[clap(long)]
        sort: Option<String>,

        /// Format output as JSON
        #[clap(short, long)]
        json: bool,
    },

    /// List categories
    Categories {
        /// Order to display, e.g. name-asc or created-desc
        #[clap(long)]
        sort: Option<String>,

        /// Format output as JSON
        #[clap(short, long)]
        json: bool,
    },

    /// Show a note or category by ID
    Show {
        /// ID of the document
        id: String,

        /// Format output as raw JSON
        #[clap(short, long)]
        json: bool,
    },

    /// Rename a note or category
    Rename {
        /// ID of the document
        id: String,

        /// New name
        name: String,
    },

    /// Replace the body of a note or category
    Write {
        /// ID of the document
        id: String,

        /// New body text
        #[clap(short, long)]
        body: Option<String>,

        /// Path to a file containing the new body
        #[clap(short, long)]
        file: Option<PathBuf>,
    },

    /// Add a category to a note, or remove it
    Assign {
        /// ID of the note
        note_id: String,

        /// ID of the category
        category_id: String,

        /// Remove the category instead of adding it
        #[clap(short, long)]
        remove: bool,
    },

    /// Delete a note or category by ID
    Delete {
        /// ID of the document
        id: String,
    },

    /// Change the stored order of notes (or categories)
    Sort {
        /// Order, e.g. name-asc or modified-desc
        order: String,

        /// Sort categories instead of notes
        #[clap(long)]
        categories: bool,
    },

    /// Export all notes as CSV
    Export {
        /// Write to this file instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Create a backup (a routine backup when no path is given)
    Backup {
        /// Path for a manual JSON backup
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace the notebook with the contents of a backup file
    Restore {
        /// Path to a JSON backup or a routine .zip backup
        path: PathBuf,
    },

    /// List routine backups
    Backups {
        /// Delete routine backups beyond the retention limit
        #[clap(short, long)]
        prune: bool,
    },

    /// Configuration management
    Config {
        /// Show current configuration
        #[clap(short = 'S', long)]
        show: bool,

        /// Update a configuration setting (key=value)
        #[clap(short, long)]
        set: Option<String>,
    },

    /// Show notebook and migration status
    Status,

    /// Keep the notebook open and run scheduled saves and backups until interrupted
    Autosave,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_codes_round_trip() {
        for sort in DocumentSortType::ALL {
            assert_eq!(DocumentSortType::from_code(sort.code()), Some(sort));
            assert_eq!(DocumentSortType::new(sort.key(), sort.direction()), sort);
        }
        assert_eq!(DocumentSortType::from_code(6), None);
    }

    #[test]
    fn sort_parsing_accepts_short_and_long_forms() {
        assert_eq!(
            "name-asc".parse::<DocumentSortType>().unwrap(),
            DocumentSortType::NameAscending
        );
        assert_eq!(
            "Modified-Descending".parse::<DocumentSortType>().unwrap(),
            DocumentSortType::ModifiedDescending
        );
        assert_eq!(
            "created".parse::<DocumentSortType>().unwrap(),
            DocumentSortType::CreatedAscending
        );
        assert_eq!(
            "5".parse::<DocumentSortType>().unwrap(),
            DocumentSortType::ModifiedDescending
        );
        assert!("size-asc".parse::<DocumentSortType>().is_err());
        assert!("name-up".parse::<DocumentSortType>().is_err());
    }
}
