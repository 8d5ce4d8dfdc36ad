//! CLI module for the neatnote application
//!
//! This module turns parsed subcommands into calls on the open workspace and
//! prints the results.
use std::{fs::read_to_string, path::PathBuf, sync::Arc};

use log::{info, warn};

use crate::{
    filter_by_categories, parse_ids, sort_documents, write_atomically, Category, Commands,
    DocumentId, DocumentKind, DocumentSortType, MigrationStatus, Note, NotebookError,
    PersistenceScheduler, Result, Rgb, SchedulerIntervals, UniqueDocument, Workspace,
};

const PREVIEW_LENGTH: usize = 100;

/// CLI Application handler - processes CLI commands against an open workspace
pub struct App {
    /// The open notebook together with its configuration and backups
    workspace: Arc<Workspace>,

    /// Whether to display verbose output
    verbose: bool,
}

impl App {
    /// Create a new CLI application over the given workspace
    pub fn new(workspace: Arc<Workspace>, verbose: bool) -> Self {
        Self { workspace, verbose }
    }

    /// Run the CLI application with the given command
    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Note {
                name,
                body,
                categories,
            } => self.create_note(name, body, categories)?,

            Commands::Category {
                name,
                description,
                color,
            } => self.create_category(name, description, color)?,

            Commands::List {
                search,
                include_bodies,
                categories,
                sort,
                json,
            } => self.list_notes(search, include_bodies, categories, sort, json)?,

            Commands::Categories { sort, json } => self.list_categories(sort, json)?,

            Commands::Show { id, json } => self.show_document(id.into(), json)?,

            Commands::Rename { id, name } => self.rename_document(id.into(), &name)?,

            Commands::Write { id, body, file } => self.write_body(id.into(), body, file)?,

            Commands::Assign {
                note_id,
                category_id,
                remove,
            } => self.assign_category(note_id.into(), category_id.into(), remove)?,

            Commands::Delete { id } => self.delete_document(id.into())?,

            Commands::Sort { order, categories } => self.change_sort(&order, categories)?,

            Commands::Export { output } => self.export_notes(output)?,

            Commands::Backup { output } => self.create_backup(output)?,

            Commands::Restore { path } => {
                let summary = self.workspace.restore(&path)?;
                println!(
                    "Restored {} notes and {} categories from {}",
                    summary.notes,
                    summary.categories,
                    summary.source.display()
                );
                if summary.repairs != Default::default() {
                    println!("Repairs: {:?}", summary.repairs);
                }
            }

            Commands::Backups { prune } => self.list_backups(prune)?,

            Commands::Config { show, set } => self.handle_config(show, set)?,

            Commands::Status => self.show_status()?,

            Commands::Autosave => self.autosave().await?,
        }

        Ok(())
    }

    fn create_note(
        &self,
        name: Option<String>,
        body: Option<String>,
        categories: Option<String>,
    ) -> Result<()> {
        let service = self.workspace.service();
        let note = service.create_note()?;
        let id = note.id().clone();

        if let Some(name) = name {
            service.rename_document(&id, &name)?;
        }
        if let Some(body) = body {
            service.set_body(&id, &body)?;
            self.warn_if_long(&id)?;
        }
        for category_id in parse_ids(categories) {
            if !service.assign_category(&id, &category_id)? {
                warn!("Category {} does not exist, skipping", category_id);
            }
        }

        self.workspace.save_document(&id)?;
        println!("Note created with ID: {}", id);
        Ok(())
    }

    fn create_category(
        &self,
        name: Option<String>,
        description: Option<String>,
        color: Option<String>,
    ) -> Result<()> {
        // Parse before creating so a bad colour leaves nothing behind
        let color = color.map(|hex| parse_color(&hex)).transpose()?;

        let service = self.workspace.service();
        let category = service.create_category()?;
        let id = category.id().clone();

        if let Some(name) = name {
            service.rename_document(&id, &name)?;
        }
        if let Some(description) = description {
            service.set_body(&id, &description)?;
        }
        if let Some(color) = color {
            service.set_category_color(&id, color)?;
        }

        self.workspace.save_document(&id)?;
        println!("Category created with ID: {}", id);
        Ok(())
    }

    /// List notes according to provided filters and options
    fn list_notes(
        &self,
        search: Option<String>,
        include_bodies: bool,
        categories: Option<String>,
        sort: Option<String>,
        json: bool,
    ) -> Result<()> {
        let config = self.workspace.config()?;
        let service = self.workspace.service();

        // Step 1: Retrieve notes matching the search text
        let fragment = search.unwrap_or_default();
        let include_bodies = include_bodies || config.include_note_bodies_in_search;
        let found = service.search(&fragment, include_bodies)?;

        // Step 2: Keep notes carrying every requested category
        let required = parse_ids(categories);
        let filtered: Vec<Note> = filter_by_categories(found.iter(), &required)
            .cloned()
            .collect();

        // Step 3: Sort when asked, otherwise keep the stored order
        let notes = match sort {
            Some(order) => sort_documents(&filtered, order.parse()?),
            None => filtered,
        };

        // Step 4: Display notes in requested format
        let category_list = service.categories()?;
        self.display_notes(&notes, &category_list, json, config.show_content_preview)
    }

    /// Display notes in the requested format
    fn display_notes(
        &self,
        notes: &[Note],
        categories: &[Category],
        json: bool,
        preview: bool,
    ) -> Result<()> {
        if notes.is_empty() {
            println!("No notes found matching the criteria.");
            return Ok(());
        }

        if json {
            self.display_notes_json(notes)?;
        } else {
            self.display_notes_text(notes, categories, preview);
        }

        println!(
            "\nFound {} note{}",
            notes.len(),
            if notes.len() == 1 { "" } else { "s" }
        );

        Ok(())
    }

    /// Display notes in JSON format
    fn display_notes_json(&self, notes: &[Note]) -> Result<()> {
        let simplified_notes: Vec<serde_json::Value> = notes.iter().map(note_summary).collect();
        println!("{}", serde_json::to_string_pretty(&simplified_notes)?);
        Ok(())
    }

    /// Display notes in text format
    fn display_notes_text(&self, notes: &[Note], categories: &[Category], preview: bool) {
        for (i, note) in notes.iter().enumerate() {
            if i > 0 {
                println!("{}", "-".repeat(50));
            }

            let created = note.created().format("%Y-%m-%d %H:%M");
            println!("ID: {} | Created: {}", note.id(), created);
            println!("Name: {}", note.name());

            let names = category_names(note, categories);
            if !names.is_empty() {
                println!("Categories: {}", names.join(", "));
            }

            if self.verbose {
                println!(
                    "Words: {} | Modified: {}",
                    note.word_count(),
                    note.modified().format("%Y-%m-%d %H:%M")
                );
            }

            if preview {
                let text = get_content_preview(&note.body_text(), PREVIEW_LENGTH);
                if !text.is_empty() {
                    println!("\n{}", text);
                }
            }
        }
    }

    fn list_categories(&self, sort: Option<String>, json: bool) -> Result<()> {
        let service = self.workspace.service();
        let stored = service.categories()?;
        let categories = match sort {
            Some(order) => sort_documents(&stored, order.parse()?),
            None => stored,
        };

        if categories.is_empty() {
            println!("No categories yet.");
            return Ok(());
        }

        let notes = service.notes()?;
        let usage = |id: &DocumentId| notes.iter().filter(|n| n.has_category(id)).count();

        if json {
            let simplified: Vec<serde_json::Value> = categories
                .iter()
                .map(|category| {
                    serde_json::json!({
                        "id": category.id(),
                        "name": category.name(),
                        "color": category.color().to_hex(),
                        "notes": usage(category.id()),
                        "created": category.created().to_rfc3339(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&simplified)?);
        } else {
            for category in &categories {
                println!(
                    "ID: {} | {} | {} | {} note{}",
                    category.id(),
                    category.color().to_hex(),
                    category.name(),
                    usage(category.id()),
                    if usage(category.id()) == 1 { "" } else { "s" }
                );
            }
        }

        Ok(())
    }

    fn show_document(&self, id: DocumentId, json: bool) -> Result<()> {
        let service = self.workspace.service();
        match service.kind_of(&id)? {
            Some(DocumentKind::Note) => {
                let note = service.get_note(&id)?.ok_or_else(|| not_found(&id))?;
                if json {
                    let mut summary = note_summary(&note);
                    summary["body"] = serde_json::Value::String(note.body_text().into_owned());
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    return Ok(());
                }

                let categories = service.categories()?;
                print_header(&note);
                let names = category_names(&note, &categories);
                if !names.is_empty() {
                    println!("Categories: {}", names.join(", "));
                }
                println!(
                    "Words: {} | Characters: {} | Images: {} | Lines: {}",
                    note.word_count(),
                    note.core().char_count(),
                    note.core().images().len(),
                    note.core().lines().len()
                );
                if note.core().exceeds_safe_length() {
                    println!("Warning: this note is longer than is comfortable to edit");
                }
                println!("\n{}", note.body_text());
            }
            Some(DocumentKind::Category) => {
                let category = service.get_category(&id)?.ok_or_else(|| not_found(&id))?;
                if json {
                    let summary = serde_json::json!({
                        "id": category.id(),
                        "name": category.name(),
                        "color": category.color().to_hex(),
                        "created": category.created().to_rfc3339(),
                        "modified": category.modified().to_rfc3339(),
                        "body": category.body_text(),
                    });
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                    return Ok(());
                }

                print_header(&category);
                println!("Colour: {}", category.color().to_hex());
                println!("\n{}", category.body_text());
            }
            None => return Err(not_found(&id)),
        }
        Ok(())
    }

    fn rename_document(&self, id: DocumentId, name: &str) -> Result<()> {
        if !self.workspace.service().rename_document(&id, name)? {
            return Err(not_found(&id));
        }
        self.workspace.save_document(&id)?;
        println!("Renamed {} to \"{}\"", id, name);
        Ok(())
    }

    fn write_body(&self, id: DocumentId, body: Option<String>, file: Option<PathBuf>) -> Result<()> {
        let text = match (body, file) {
            (Some(text), None) => text,
            (None, Some(path)) => {
                read_to_string(&path).map_err(|e| NotebookError::persistence(path.clone(), e))?
            }
            _ => {
                return Err(NotebookError::ApplicationError {
                    message: "Provide exactly one of --body or --file".to_string(),
                })
            }
        };

        let service = self.workspace.service();
        let opened = match service.kind_of(&id)? {
            Some(DocumentKind::Note) => service.open_note(&id)?.is_some(),
            Some(DocumentKind::Category) => service.open_category(&id)?.is_some(),
            None => false,
        };
        if !opened {
            return Err(not_found(&id));
        }

        let written = service.set_body(&id, &text);
        service.close_document()?;
        written?;

        self.warn_if_long(&id)?;
        self.workspace.save_document(&id)?;
        println!("Updated body of {}", id);
        Ok(())
    }

    fn assign_category(
        &self,
        note_id: DocumentId,
        category_id: DocumentId,
        remove: bool,
    ) -> Result<()> {
        let service = self.workspace.service();
        if service.get_note(&note_id)?.is_none() {
            return Err(not_found(&note_id));
        }
        if service.get_category(&category_id)?.is_none() {
            return Err(not_found(&category_id));
        }

        let changed = if remove {
            service.unassign_category(&note_id, &category_id)?
        } else {
            service.assign_category(&note_id, &category_id)?
        };

        if !changed {
            println!("Nothing to change");
            return Ok(());
        }

        self.workspace.save_document(&note_id)?;
        if remove {
            println!("Removed category {} from note {}", category_id, note_id);
        } else {
            println!("Added category {} to note {}", category_id, note_id);
        }
        Ok(())
    }

    fn delete_document(&self, id: DocumentId) -> Result<()> {
        let service = self.workspace.service();
        let deleted = match service.kind_of(&id)? {
            Some(DocumentKind::Note) => service.delete_note(&id)?,
            Some(DocumentKind::Category) => service.delete_category(&id)?,
            None => false,
        };
        if !deleted {
            return Err(not_found(&id));
        }

        // Deleting a category also touches every note that carried it
        let saved = self.workspace.save_pending()?;
        info!("Saved {} changed documents after delete", saved);
        println!("Deleted {}", id);
        Ok(())
    }

    fn change_sort(&self, order: &str, categories: bool) -> Result<()> {
        let sort: DocumentSortType = order.parse()?;
        if categories {
            self.workspace.set_category_sort(sort)?;
            println!("Categories are now sorted by {}", sort);
        } else {
            self.workspace.set_note_sort(sort)?;
            println!("Notes are now sorted by {}", sort);
        }
        Ok(())
    }

    fn export_notes(&self, output: Option<PathBuf>) -> Result<()> {
        let csv = self.workspace.service().export_notes()?;
        match output {
            Some(path) => {
                write_atomically(&path, csv.as_bytes())?;
                println!("Exported notes to {}", path.display());
            }
            None => print!("{}", csv),
        }
        Ok(())
    }

    fn create_backup(&self, output: Option<PathBuf>) -> Result<()> {
        let path = match output {
            Some(path) => self.workspace.service().create_backup(&path)?,
            None => self.workspace.backup_now()?,
        };
        println!("Backup written to {}", path.display());
        Ok(())
    }

    fn list_backups(&self, prune: bool) -> Result<()> {
        let backups = self.workspace.backups();
        if prune {
            let retention = self.workspace.config()?.backup_retention;
            let removed = backups.delete_backups(retention)?;
            println!(
                "Removed {} backup{}",
                removed,
                if removed == 1 { "" } else { "s" }
            );
        }

        let entries = backups.list_backups()?;
        if entries.is_empty() {
            println!("No backups in {}", backups.backup_dir().display());
            return Ok(());
        }

        for entry in &entries {
            match entry.taken_at {
                Some(taken_at) => println!(
                    "{} | {}",
                    taken_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.file_name
                ),
                None => println!("{}", entry.file_name),
            }
        }
        Ok(())
    }

    fn handle_config(&self, show: bool, set: Option<String>) -> Result<()> {
        if let Some(assignment) = set {
            let (key, value) =
                assignment
                    .split_once('=')
                    .ok_or_else(|| NotebookError::ConfigError {
                        message: format!("expected key=value, got `{}`", assignment),
                    })?;
            let key = key.trim();
            let updated = self
                .workspace
                .update_config(|config| config.set_value(key, value))?;
            println!("Updated {}", key);
            if show {
                println!("{}", serde_json::to_string_pretty(&updated.settings_json()?)?);
            }
            return Ok(());
        }

        let config = self.workspace.config()?;
        println!("{}", serde_json::to_string_pretty(&config.settings_json()?)?);
        Ok(())
    }

    fn show_status(&self) -> Result<()> {
        let workspace = &self.workspace;
        let service = workspace.service();

        println!("Notebook: {}", workspace.paths().config_file.display());
        println!("Backups: {}", workspace.paths().backup_dir.display());
        println!(
            "Notes: {} | Categories: {}",
            service.notes()?.len(),
            service.categories()?.len()
        );

        let report = workspace.migration_report();
        match &report.status {
            MigrationStatus::UpToDate { version } => println!("Version: {}", version),
            MigrationStatus::Upgraded { from, to } => {
                println!("Version: {} (upgraded from {})", to, from)
            }
            MigrationStatus::Downgraded { stored, running } => println!(
                "Version: {} stored by a newer release (this is {})",
                stored, running
            ),
            MigrationStatus::Failed {
                from,
                reached,
                message,
            } => println!(
                "Version: {} (upgrade from {} failed: {})",
                reached, from, message
            ),
        }
        if let Some(backup) = &report.backup {
            println!("Upgrade backup: {}", backup.display());
        }

        let repairs = service.load_report()?;
        if repairs != Default::default() {
            println!(
                "Repaired on load: {} corrupt bodies, {} duplicate ids, {} dangling references",
                repairs.corrupt_bodies, repairs.duplicate_ids, repairs.dangling_references
            );
        }

        if !workspace.is_writable() {
            println!("Read-only: changes will not be saved");
        }
        if service.is_dirty()? {
            println!("Unsaved changes pending");
        }

        match workspace.backups().latest_backup()? {
            Some(entry) => println!("Latest backup: {}", entry.file_name),
            None => println!("Latest backup: none"),
        }
        Ok(())
    }

    async fn autosave(&self) -> Result<()> {
        let config = self.workspace.config()?;
        let mut scheduler = PersistenceScheduler::new(SchedulerIntervals::from_config(&config));
        scheduler.set_hooks(&self.workspace);
        scheduler.start()?;

        println!("Autosave running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;

        scheduler.stop().await?;
        let status = scheduler.get_status();
        if let Some(error) = status.last_error {
            warn!("Last scheduled task failed: {}", error);
        }
        self.workspace.shutdown()?;
        println!("Notebook saved");
        Ok(())
    }

    fn warn_if_long(&self, id: &DocumentId) -> Result<()> {
        let long = match self.workspace.service().get_note(id)? {
            Some(note) => note.core().exceeds_safe_length(),
            None => false,
        };
        if long {
            println!("Warning: note {} is long and may be slow to edit", id);
        }
        Ok(())
    }
}

fn not_found(id: &DocumentId) -> NotebookError {
    NotebookError::NotFound { id: id.to_string() }
}

fn parse_color(hex: &str) -> Result<Rgb> {
    Rgb::from_hex(hex).ok_or_else(|| NotebookError::InvalidFormat {
        message: format!("`{}` is not a #rrggbb colour", hex),
    })
}

fn print_header<D: UniqueDocument>(document: &D) {
    println!(
        "ID: {} | Created: {} | Modified: {}",
        document.id(),
        document.created().format("%Y-%m-%d %H:%M"),
        document.modified().format("%Y-%m-%d %H:%M")
    );
    println!("Name: {}", document.name());
}

fn note_summary(note: &Note) -> serde_json::Value {
    serde_json::json!({
        "id": note.id(),
        "name": note.name(),
        "created": note.created().to_rfc3339(),
        "modified": note.modified().to_rfc3339(),
        "categories": note.categories(),
        "words": note.word_count(),
    })
}

fn category_names(note: &Note, categories: &[Category]) -> Vec<String> {
    note.categories()
        .iter()
        .map(|id| {
            categories
                .iter()
                .find(|c| c.id() == id)
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| id.to_string())
        })
        .collect()
}

/// First line of the body, cut to `max_len` characters
pub fn get_content_preview(content: &str, max_len: usize) -> String {
    let first_line = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let trimmed = first_line.trim();
    if trimmed.chars().count() <= max_len {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_takes_first_non_empty_line() {
        assert_eq!(get_content_preview("\n\n  hello world  \nmore", 100), "hello world");
        assert_eq!(get_content_preview("", 10), "");
        assert_eq!(get_content_preview("abcdefghij", 4), "abcd...");
    }

    #[test]
    fn unknown_colour_is_rejected() {
        assert!(parse_color("#00ff00").is_ok());
        assert!(parse_color("green").is_err());
    }
}
