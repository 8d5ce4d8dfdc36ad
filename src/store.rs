//! The in-memory document store.
//!
//! [`NotebookService`] owns the note and category collections behind a
//! short-held mutex. Anything expensive (body encoding, serialization, file
//! I/O) happens on a cloned snapshot after the lock is released, so the
//! timer-driven save and backup paths never iterate live collections.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::{
    backup, helper, Category, DocumentChange, DocumentCore, DocumentId, DocumentKind,
    DocumentSortType, ImageRef, ImportSummary, LoadReport, Migrator, Note, NotebookError,
    NotebookPayload, Result, Rgb, SortKey, SortDirection, Stroke, UniqueDocument,
    CURRENT_VERSION,
};

/// Serialized form of a full snapshot: the payload tagged with the schema version.
#[derive(Debug, Serialize)]
pub(crate) struct VersionedPayload<'a> {
    pub version: u32,
    pub notes: &'a [Note],
    pub categories: &'a [Category],
}

impl<'a> VersionedPayload<'a> {
    pub(crate) fn new(payload: &'a NotebookPayload) -> Self {
        VersionedPayload {
            version: CURRENT_VERSION,
            notes: &payload.notes,
            categories: &payload.categories,
        }
    }
}

#[derive(Debug, Default)]
struct Notebook {
    notes: Vec<Note>,
    categories: Vec<Category>,
    /// The document currently open for editing; never compressed in memory.
    open: Option<DocumentId>,
    revision: u64,
    /// Unsaved document ids with the revision of their latest change.
    dirty: BTreeMap<DocumentId, u64>,
    report: LoadReport,
}

impl Notebook {
    /// Builds a notebook from decoded collections, repairing what it can.
    fn from_collections(notes: Vec<Note>, categories: Vec<Category>) -> Self {
        let mut payload = NotebookPayload::new(notes, categories);
        let mut report = LoadReport {
            corrupt_bodies: payload.decompress_all(),
            ..LoadReport::default()
        };

        let mut seen = HashSet::new();
        let mut repaired = Vec::new();
        let cores = payload
            .categories
            .iter_mut()
            .map(|category| category.core_mut())
            .chain(payload.notes.iter_mut().map(|note| note.core_mut()));
        for core in cores {
            if seen.contains(core.id()) {
                let previous = core.id().clone();
                while seen.contains(core.id()) {
                    core.regenerate_id();
                }
                warn!(
                    "Duplicate document id {} replaced with {}",
                    previous,
                    core.id()
                );
                report.duplicate_ids += 1;
                repaired.push(core.id().clone());
            }
            seen.insert(core.id().clone());
            core.normalize_timestamps();
        }

        let known: HashSet<DocumentId> = payload
            .categories
            .iter()
            .map(|category| category.id().clone())
            .collect();
        for note in &mut payload.notes {
            let dropped = note.retain_categories(|id| known.contains(id));
            if dropped > 0 {
                warn!(
                    "Removed {} dangling category reference(s) from note {}",
                    dropped,
                    note.id()
                );
                report.dangling_references += dropped;
                repaired.push(note.id().clone());
            }
        }

        let mut notebook = Notebook {
            notes: payload.notes,
            categories: payload.categories,
            report,
            ..Notebook::default()
        };
        for id in repaired {
            notebook.mark_dirty(&id);
        }
        notebook
    }

    fn mark_dirty(&mut self, id: &DocumentId) {
        self.revision += 1;
        self.dirty.insert(id.clone(), self.revision);
    }

    fn acknowledge(&mut self, marks: &[(DocumentId, u64)]) {
        for (id, revision) in marks {
            if self.dirty.get(id) == Some(revision) {
                self.dirty.remove(id);
            }
        }
    }

    fn ids(&self) -> Vec<DocumentId> {
        self.notes
            .iter()
            .map(|note| note.id().clone())
            .chain(self.categories.iter().map(|category| category.id().clone()))
            .collect()
    }

    fn contains_id(&self, id: &DocumentId) -> bool {
        self.kind_of(id).is_some()
    }

    fn kind_of(&self, id: &DocumentId) -> Option<DocumentKind> {
        if self.notes.iter().any(|note| note.id() == id) {
            Some(DocumentKind::Note)
        } else if self.categories.iter().any(|category| category.id() == id) {
            Some(DocumentKind::Category)
        } else {
            None
        }
    }

    fn note_mut(&mut self, id: &DocumentId) -> Option<&mut Note> {
        self.notes.iter_mut().find(|note| note.id() == id)
    }

    fn category_mut(&mut self, id: &DocumentId) -> Option<&mut Category> {
        self.categories.iter_mut().find(|category| category.id() == id)
    }

    fn core_mut(&mut self, id: &DocumentId) -> Option<&mut DocumentCore> {
        if let Some(position) = self.notes.iter().position(|note| note.id() == id) {
            return Some(self.notes[position].core_mut());
        }
        self.category_mut(id).map(|category| category.core_mut())
    }

    /// Plain copy of the current state of `id`, or a removal record.
    fn change_for(&self, id: &DocumentId) -> DocumentChange {
        if let Some(note) = self.notes.iter().find(|note| note.id() == id) {
            return DocumentChange::Note(note.clone());
        }
        if let Some(category) = self.categories.iter().find(|category| category.id() == id) {
            return DocumentChange::Category(category.clone());
        }
        DocumentChange::Removed(id.clone())
    }

    /// Compresses the open document, if any, unless it is `keep`.
    fn close_open(&mut self, keep: Option<&DocumentId>) {
        let Some(open) = self.open.take() else {
            return;
        };
        if keep == Some(&open) {
            self.open = Some(open);
            return;
        }
        if let Some(core) = self.core_mut(&open) {
            if let Err(e) = core.compress_body() {
                warn!("Failed to compress body of closed document {}: {}", open, e);
            }
        }
    }

    /// Swaps in the stored bodies of documents that are idle and have not
    /// been touched since `persisted` was taken.
    fn compress_idle(&mut self, persisted: &NotebookPayload) -> usize {
        let stored: HashMap<&DocumentId, &DocumentCore> = persisted
            .notes
            .iter()
            .map(|note| (note.id(), note.core()))
            .chain(
                persisted
                    .categories
                    .iter()
                    .map(|category| (category.id(), category.core())),
            )
            .collect();

        let open = self.open.clone();
        let dirty = &self.dirty;
        let mut compressed = 0;
        let cores = self
            .notes
            .iter_mut()
            .map(|note| note.core_mut())
            .chain(self.categories.iter_mut().map(|category| category.core_mut()));
        for core in cores {
            // Edited after the snapshot was taken
            if open.as_ref() == Some(core.id())
                || core.body().is_compressed()
                || dirty.contains_key(core.id())
            {
                continue;
            }
            if let Some(saved) = stored.get(core.id()) {
                if saved.modified() == core.modified() && saved.body().is_compressed() {
                    core.replace_body(saved.body().clone());
                    compressed += 1;
                }
            }
        }
        compressed
    }

    fn refresh_visibility(&mut self) -> usize {
        let required: Vec<DocumentId> = self
            .categories
            .iter()
            .filter(|category| category.core().is_selected())
            .map(|category| category.id().clone())
            .collect();

        let mut visible = 0;
        for note in &mut self.notes {
            let matches = note.has_all_categories(&required);
            note.core_mut().set_visible(matches);
            if matches {
                visible += 1;
            }
        }
        visible
    }
}

/// Clears a single-flight flag when dropped.
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool, operation: &'static str) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                debug!("Rejected concurrent {}", operation);
                NotebookError::Busy { operation }
            })?;
        Ok(FlightGuard { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the note and category collections and every operation on them.
///
/// Cloning is cheap and yields a handle to the same notebook.
#[derive(Debug, Clone, Default)]
pub struct NotebookService {
    notebook: Arc<Mutex<Notebook>>,
    saving: Arc<AtomicBool>,
    loading: Arc<AtomicBool>,
}

impl NotebookService {
    /// Creates a service over decoded collections.
    ///
    /// Bodies are decompressed (corrupt ones become empty and flagged),
    /// duplicate ids are regenerated and references to missing categories
    /// are dropped. See [`NotebookService::load_report`] for the tally.
    pub fn new(notes: Vec<Note>, categories: Vec<Category>) -> Self {
        let notebook = Notebook::from_collections(notes, categories);
        info!(
            "Notebook loaded with {} notes and {} categories",
            notebook.notes.len(),
            notebook.categories.len()
        );
        NotebookService {
            notebook: Arc::new(Mutex::new(notebook)),
            saving: Arc::new(AtomicBool::new(false)),
            loading: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Notebook>> {
        self.notebook
            .lock()
            .map_err(|_| NotebookError::LockAcquisitionFailed {
                message: "Failed to acquire lock on notebook".to_string(),
            })
    }

    /// Repairs made while loading the current collections.
    pub fn load_report(&self) -> Result<LoadReport> {
        Ok(self.lock()?.report.clone())
    }

    /// Creates a note at the front of the collection and returns it.
    pub fn create_note(&self) -> Result<Note> {
        let mut notebook = self.lock()?;
        let mut note = Note::new();
        while notebook.contains_id(note.id()) {
            note.core_mut().regenerate_id();
        }
        notebook.notes.insert(0, note.clone());
        notebook.mark_dirty(note.id());
        debug!("Created note {}", note.id());
        Ok(note)
    }

    /// Creates a category with a random colour at the front of the collection.
    pub fn create_category(&self) -> Result<Category> {
        let mut notebook = self.lock()?;
        let mut category = Category::new();
        while notebook.contains_id(category.id()) {
            category.core_mut().regenerate_id();
        }
        notebook.categories.insert(0, category.clone());
        notebook.mark_dirty(category.id());
        debug!("Created category {}", category.id());
        Ok(category)
    }

    /// Removes a note. Returns `false` if it did not exist.
    pub fn delete_note(&self, id: &DocumentId) -> Result<bool> {
        let mut notebook = self.lock()?;
        let Some(position) = notebook.notes.iter().position(|note| note.id() == id) else {
            trace!("Delete of unknown note {} ignored", id);
            return Ok(false);
        };
        notebook.notes.remove(position);
        if notebook.open.as_ref() == Some(id) {
            notebook.open = None;
        }
        notebook.mark_dirty(id);
        debug!("Deleted note {}", id);
        Ok(true)
    }

    /// Removes a category and strips it from every note that carried it.
    pub fn delete_category(&self, id: &DocumentId) -> Result<bool> {
        let mut notebook = self.lock()?;
        let Some(position) = notebook
            .categories
            .iter()
            .position(|category| category.id() == id)
        else {
            trace!("Delete of unknown category {} ignored", id);
            return Ok(false);
        };
        notebook.categories.remove(position);
        if notebook.open.as_ref() == Some(id) {
            notebook.open = None;
        }

        let mut affected = Vec::new();
        for note in &mut notebook.notes {
            if note.remove_category(id) {
                affected.push(note.id().clone());
            }
        }
        notebook.mark_dirty(id);
        for note_id in &affected {
            notebook.mark_dirty(note_id);
        }
        debug!(
            "Deleted category {} and removed it from {} notes",
            id,
            affected.len()
        );
        Ok(true)
    }

    pub fn get_note(&self, id: &DocumentId) -> Result<Option<Note>> {
        let notebook = self.lock()?;
        Ok(notebook.notes.iter().find(|note| note.id() == id).cloned())
    }

    pub fn get_category(&self, id: &DocumentId) -> Result<Option<Category>> {
        let notebook = self.lock()?;
        Ok(notebook
            .categories
            .iter()
            .find(|category| category.id() == id)
            .cloned())
    }

    /// Whether `id` names a note, a category or nothing.
    pub fn kind_of(&self, id: &DocumentId) -> Result<Option<DocumentKind>> {
        Ok(self.lock()?.kind_of(id))
    }

    /// Notes in storage order.
    pub fn notes(&self) -> Result<Vec<Note>> {
        Ok(self.lock()?.notes.clone())
    }

    /// Categories in storage order.
    pub fn categories(&self) -> Result<Vec<Category>> {
        Ok(self.lock()?.categories.clone())
    }

    /// Opens a note for editing, decompressing its body.
    ///
    /// The previously open document, if any, is closed first.
    pub fn open_note(&self, id: &DocumentId) -> Result<Option<Note>> {
        let mut notebook = self.lock()?;
        if notebook.kind_of(id) != Some(DocumentKind::Note) {
            return Ok(None);
        }
        notebook.close_open(Some(id));
        let Some(note) = notebook.note_mut(id) else {
            return Ok(None);
        };
        note.core_mut().decompress_body();
        let opened = note.clone();
        notebook.open = Some(id.clone());
        Ok(Some(opened))
    }

    /// Opens a category for editing, decompressing its body.
    pub fn open_category(&self, id: &DocumentId) -> Result<Option<Category>> {
        let mut notebook = self.lock()?;
        if notebook.kind_of(id) != Some(DocumentKind::Category) {
            return Ok(None);
        }
        notebook.close_open(Some(id));
        let Some(category) = notebook.category_mut(id) else {
            return Ok(None);
        };
        category.core_mut().decompress_body();
        let opened = category.clone();
        notebook.open = Some(id.clone());
        Ok(Some(opened))
    }

    pub fn open_document(&self) -> Result<Option<DocumentId>> {
        Ok(self.lock()?.open.clone())
    }

    /// Closes the open document and compresses its body.
    pub fn close_document(&self) -> Result<()> {
        self.lock()?.close_open(None);
        Ok(())
    }

    pub fn rename_document(&self, id: &DocumentId, name: &str) -> Result<bool> {
        let mut notebook = self.lock()?;
        let Some(core) = notebook.core_mut(id) else {
            return Ok(false);
        };
        core.set_name(name);
        notebook.mark_dirty(id);
        Ok(true)
    }

    /// Replaces the body of an open document.
    ///
    /// Fails with `NotEditable` if the document is stored compressed.
    pub fn set_body(&self, id: &DocumentId, text: &str) -> Result<bool> {
        let mut notebook = self.lock()?;
        let Some(core) = notebook.core_mut(id) else {
            return Ok(false);
        };
        core.set_body(text)?;
        if core.exceeds_safe_length() {
            debug!(
                "Body of {} is {} characters long, editing may be slow",
                id,
                core.char_count()
            );
        }
        notebook.mark_dirty(id);
        Ok(true)
    }

    pub fn add_stroke(&self, id: &DocumentId, stroke: Stroke) -> Result<bool> {
        let mut notebook = self.lock()?;
        let Some(core) = notebook.core_mut(id) else {
            return Ok(false);
        };
        core.push_stroke(stroke);
        notebook.mark_dirty(id);
        Ok(true)
    }

    /// Removes every stroke. Returns `false` if there were none.
    pub fn clear_strokes(&self, id: &DocumentId) -> Result<bool> {
        let mut notebook = self.lock()?;
        let cleared = match notebook.core_mut(id) {
            Some(core) => core.clear_strokes(),
            None => false,
        };
        if cleared {
            notebook.mark_dirty(id);
        }
        Ok(cleared)
    }

    pub fn add_image(&self, id: &DocumentId, image: ImageRef) -> Result<bool> {
        let mut notebook = self.lock()?;
        let Some(core) = notebook.core_mut(id) else {
            return Ok(false);
        };
        core.push_image(image);
        notebook.mark_dirty(id);
        Ok(true)
    }

    pub fn remove_image(&self, id: &DocumentId, index: usize) -> Result<Option<ImageRef>> {
        let mut notebook = self.lock()?;
        let removed = notebook
            .core_mut(id)
            .and_then(|core| core.remove_image(index));
        if removed.is_some() {
            notebook.mark_dirty(id);
        }
        Ok(removed)
    }

    /// Tags a note with a category. Unknown ids are ignored.
    pub fn assign_category(&self, note_id: &DocumentId, category_id: &DocumentId) -> Result<bool> {
        let mut notebook = self.lock()?;
        if notebook.kind_of(category_id) != Some(DocumentKind::Category) {
            return Ok(false);
        }
        let added = match notebook.note_mut(note_id) {
            Some(note) => note.add_category(category_id),
            None => false,
        };
        if added {
            notebook.mark_dirty(note_id);
            notebook.refresh_visibility();
        }
        Ok(added)
    }

    pub fn unassign_category(
        &self,
        note_id: &DocumentId,
        category_id: &DocumentId,
    ) -> Result<bool> {
        let mut notebook = self.lock()?;
        let removed = match notebook.note_mut(note_id) {
            Some(note) => note.remove_category(category_id),
            None => false,
        };
        if removed {
            notebook.mark_dirty(note_id);
            notebook.refresh_visibility();
        }
        Ok(removed)
    }

    pub fn set_category_color(&self, id: &DocumentId, color: Rgb) -> Result<bool> {
        let mut notebook = self.lock()?;
        let Some(category) = notebook.category_mut(id) else {
            return Ok(false);
        };
        category.set_color(color);
        notebook.mark_dirty(id);
        Ok(true)
    }

    /// Toggles a category in the filter selection and refreshes note visibility.
    pub fn set_category_selected(&self, id: &DocumentId, selected: bool) -> Result<bool> {
        let mut notebook = self.lock()?;
        let Some(category) = notebook.category_mut(id) else {
            return Ok(false);
        };
        category.core_mut().set_selected(selected);
        notebook.refresh_visibility();
        Ok(true)
    }

    pub fn selected_categories(&self) -> Result<Vec<DocumentId>> {
        let notebook = self.lock()?;
        Ok(notebook
            .categories
            .iter()
            .filter(|category| category.core().is_selected())
            .map(|category| category.id().clone())
            .collect())
    }

    /// Marks notes visible when they carry every selected category.
    ///
    /// Returns the number of visible notes.
    pub fn refresh_visibility(&self) -> Result<usize> {
        Ok(self.lock()?.refresh_visibility())
    }

    /// Visible notes matching `fragment`, in storage order.
    pub fn visible_notes(&self, fragment: &str, include_bodies: bool) -> Result<Vec<Note>> {
        let notes = self.notes()?;
        Ok(search_notes(&notes, fragment, include_bodies)
            .filter(|note| note.core().is_visible())
            .cloned()
            .collect())
    }

    /// Notes whose name (and optionally body) contains `fragment`.
    pub fn search(&self, fragment: &str, include_bodies: bool) -> Result<Vec<Note>> {
        let notes = self.notes()?;
        Ok(search_notes(&notes, fragment, include_bodies)
            .cloned()
            .collect())
    }

    /// Reorders the stored note collection.
    pub fn sort_notes(&self, sort: DocumentSortType) -> Result<()> {
        let mut notebook = self.lock()?;
        sort_in_place(&mut notebook.notes, sort);
        debug!("Sorted notes by {}", sort);
        Ok(())
    }

    /// Reorders the stored category collection.
    pub fn sort_categories(&self, sort: DocumentSortType) -> Result<()> {
        let mut notebook = self.lock()?;
        sort_in_place(&mut notebook.categories, sort);
        debug!("Sorted categories by {}", sort);
        Ok(())
    }

    /// Plain copies of both collections taken under a single lock.
    pub fn snapshot(&self) -> Result<NotebookPayload> {
        let notebook = self.lock()?;
        Ok(NotebookPayload::new(
            notebook.notes.clone(),
            notebook.categories.clone(),
        ))
    }

    /// Whether any document changed since it was last saved.
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.lock()?.dirty.is_empty())
    }

    /// Partial save of one document.
    ///
    /// `persist` receives the compressed record and runs without the lock
    /// held. Returns `false` when there was nothing to save. The document
    /// stays dirty if `persist` fails.
    pub fn save_document<F>(&self, id: &DocumentId, persist: F) -> Result<bool>
    where
        F: FnOnce(&DocumentChange) -> Result<()>,
    {
        let (change, revision) = {
            let notebook = self.lock()?;
            let revision = notebook.dirty.get(id).copied();
            if revision.is_none() && !notebook.contains_id(id) {
                return Ok(false);
            }
            (notebook.change_for(id), revision)
        };

        let change = compress_change(change)?;
        persist(&change)?;

        if let Some(revision) = revision {
            self.lock()?.acknowledge(&[(id.clone(), revision)]);
        }
        trace!("Saved document {}", id);
        Ok(true)
    }

    /// Partial save of every dirty document. Returns how many were saved.
    pub fn save_dirty<F>(&self, persist: F) -> Result<usize>
    where
        F: FnOnce(&[DocumentChange]) -> Result<()>,
    {
        let (changes, marks) = {
            let notebook = self.lock()?;
            let marks: Vec<(DocumentId, u64)> = notebook
                .dirty
                .iter()
                .map(|(id, revision)| (id.clone(), *revision))
                .collect();
            let changes: Vec<DocumentChange> =
                marks.iter().map(|(id, _)| notebook.change_for(id)).collect();
            (changes, marks)
        };

        if changes.is_empty() {
            return Ok(0);
        }

        let changes = changes
            .into_iter()
            .map(compress_change)
            .collect::<Result<Vec<_>>>()?;
        persist(&changes)?;

        self.lock()?.acknowledge(&marks);
        debug!("Saved {} changed documents", changes.len());
        Ok(changes.len())
    }

    /// Full save of both collections.
    ///
    /// `persist` receives a compressed snapshot. Afterwards every idle
    /// document is held compressed in memory. Returns the number of
    /// documents written.
    pub fn save_full_notebook<F>(&self, persist: F) -> Result<usize>
    where
        F: FnOnce(&NotebookPayload) -> Result<()>,
    {
        let (mut payload, marks) = {
            let notebook = self.lock()?;
            let marks: Vec<(DocumentId, u64)> = notebook
                .dirty
                .iter()
                .map(|(id, revision)| (id.clone(), *revision))
                .collect();
            (
                NotebookPayload::new(notebook.notes.clone(), notebook.categories.clone()),
                marks,
            )
        };

        payload.compress_all()?;
        persist(&payload)?;

        let compressed = {
            let mut notebook = self.lock()?;
            notebook.acknowledge(&marks);
            notebook.compress_idle(&payload)
        };

        let written = payload.notes.len() + payload.categories.len();
        debug!(
            "Full save wrote {} documents, {} bodies compressed in memory",
            written, compressed
        );
        Ok(written)
    }

    /// All notes as CSV, one row per note.
    pub fn export_notes(&self) -> Result<String> {
        let _guard = FlightGuard::acquire(&self.saving, "export")?;
        let payload = self.snapshot()?;
        Ok(notes_to_csv(&payload.notes, &payload.categories))
    }

    /// Writes a full JSON snapshot to a user-chosen path.
    pub fn create_backup(&self, path: &Path) -> Result<PathBuf> {
        let _guard = FlightGuard::acquire(&self.saving, "backup")?;
        let mut payload = self.snapshot()?;
        payload.compress_all()?;
        helper::write_json_atomically(path, &VersionedPayload::new(&payload))?;
        info!(
            "Notebook exported to {} ({} notes, {} categories)",
            path.display(),
            payload.notes.len(),
            payload.categories.len()
        );
        Ok(path.to_path_buf())
    }

    /// Replaces both collections with the contents of a backup file.
    ///
    /// Accepts a JSON snapshot (current or legacy layout) or a routine
    /// `.zip` backup. On any error the current collections are untouched.
    pub fn import_backup(&self, path: &Path) -> Result<ImportSummary> {
        let _guard = FlightGuard::acquire(&self.loading, "restore")?;

        let value = if path
            .extension()
            .is_some_and(|ext| ext == backup::BACKUP_EXTENSION)
        {
            backup::read_backup(path)?
        } else {
            helper::read_json_value(path)?
        };
        let value = Migrator::default().upgrade_payload(value)?;
        let payload: NotebookPayload =
            serde_json::from_value(value).map_err(|e| NotebookError::RestoreFailed {
                message: format!("{} does not contain a notebook: {}", path.display(), e),
            })?;
        if payload.is_empty() {
            warn!("Backup {} contains no documents", path.display());
        }

        let mut restored = Notebook::from_collections(payload.notes, payload.categories);
        let summary = ImportSummary {
            source: path.to_path_buf(),
            notes: restored.notes.len(),
            categories: restored.categories.len(),
            repairs: restored.report.clone(),
        };

        {
            let mut notebook = self.lock()?;
            let previous = notebook.ids();
            restored.revision = notebook.revision;
            restored.dirty = std::mem::take(&mut notebook.dirty);
            *notebook = restored;
            for id in previous.iter().chain(notebook.ids().iter()) {
                notebook.mark_dirty(id);
            }
        }

        info!(
            "Restored {} notes and {} categories from {}",
            summary.notes,
            summary.categories,
            path.display()
        );
        Ok(summary)
    }

    /// Whether a backup or export is in progress.
    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    /// Whether a restore is in progress.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }
}

fn compress_change(change: DocumentChange) -> Result<DocumentChange> {
    Ok(match change {
        DocumentChange::Note(mut note) => {
            note.core_mut().compress_body()?;
            DocumentChange::Note(note)
        }
        DocumentChange::Category(mut category) => {
            category.core_mut().compress_body()?;
            DocumentChange::Category(category)
        }
        removed @ DocumentChange::Removed(_) => removed,
    })
}

fn note_matches(note: &Note, fragment: &str, include_bodies: bool) -> bool {
    note.name().contains(fragment) || (include_bodies && note.body_text().contains(fragment))
}

/// Notes whose name contains `fragment`, and with `include_bodies` also
/// those whose decoded body does. Case-sensitive; keeps collection order.
///
/// The returned iterator can be cloned to restart the scan.
pub fn search_notes<'a>(
    notes: &'a [Note],
    fragment: &'a str,
    include_bodies: bool,
) -> impl Iterator<Item = &'a Note> + Clone + 'a {
    notes
        .iter()
        .filter(move |note| note_matches(note, fragment, include_bodies))
}

/// Notes carrying every category in `required`. An empty filter keeps all notes.
pub fn filter_by_categories<'a, I>(
    notes: I,
    required: &'a [DocumentId],
) -> impl Iterator<Item = &'a Note> + 'a
where
    I: IntoIterator<Item = &'a Note>,
    I::IntoIter: 'a,
{
    notes
        .into_iter()
        .filter(move |note| note.has_all_categories(required))
}

fn compare_documents<D: UniqueDocument>(a: &D, b: &D, sort: DocumentSortType) -> std::cmp::Ordering {
    let ordering = match sort.key() {
        SortKey::Name => a.name().cmp(b.name()),
        SortKey::Created => a.created().cmp(&b.created()),
        SortKey::Modified => a.modified().cmp(&b.modified()),
    };
    match sort.direction() {
        SortDirection::Ascending => ordering,
        SortDirection::Descending => ordering.reverse(),
    }
}

fn sort_in_place<D: UniqueDocument>(documents: &mut [D], sort: DocumentSortType) {
    documents.sort_by(|a, b| compare_documents(a, b, sort));
}

/// Sorted copy of `documents`. Names compare byte-wise and ties keep
/// their original relative order.
pub fn sort_documents<D: UniqueDocument + Clone>(documents: &[D], sort: DocumentSortType) -> Vec<D> {
    let mut sorted = documents.to_vec();
    sort_in_place(&mut sorted, sort);
    sorted
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Flattens notes into CSV with a header row. Category ids are resolved
/// to names where possible and joined with `;`.
pub fn notes_to_csv(notes: &[Note], categories: &[Category]) -> String {
    let names: HashMap<&DocumentId, &str> = categories
        .iter()
        .map(|category| (category.id(), category.name()))
        .collect();

    let mut csv = String::from("id,name,categories,created,modified,body\n");
    for note in notes {
        let tags = note
            .categories()
            .iter()
            .map(|id| names.get(id).copied().unwrap_or(id.as_str()))
            .collect::<Vec<_>>()
            .join(";");
        let row = [
            csv_field(note.id().as_str()),
            csv_field(note.name()),
            csv_field(&tags),
            note.created().to_rfc3339(),
            note.modified().to_rfc3339(),
            csv_field(&note.body_text()),
        ];
        csv.push_str(&row.join(","));
        csv.push('\n');
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Point;
    use serde_json::json;

    fn service_with_named_notes(names: &[&str]) -> (NotebookService, Vec<DocumentId>) {
        let service = NotebookService::default();
        let mut ids = Vec::new();
        for name in names {
            let note = service.create_note().unwrap();
            service.rename_document(note.id(), name).unwrap();
            ids.push(note.id().clone());
        }
        (service, ids)
    }

    #[test]
    fn create_note_inserts_at_front_with_distinct_ids() {
        let service = NotebookService::default();
        let first = service.create_note().unwrap();
        let second = service.create_note().unwrap();

        assert_ne!(first.id(), second.id());
        let notes = service.notes().unwrap();
        assert_eq!(notes[0].id(), second.id());
        assert_eq!(notes[1].id(), first.id());

        assert!(service.delete_note(first.id()).unwrap());
        let notes = service.notes().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id(), second.id());

        assert_eq!(service.search("New", true).unwrap().len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let service = NotebookService::default();
        let note = service.create_note().unwrap();
        assert!(service.delete_note(note.id()).unwrap());
        assert!(!service.delete_note(note.id()).unwrap());
        assert!(!service.delete_category(&DocumentId::from("missing")).unwrap());
    }

    #[test]
    fn deleting_category_strips_it_from_notes() {
        let service = NotebookService::default();
        let work = service.create_category().unwrap();
        let home = service.create_category().unwrap();
        let a = service.create_note().unwrap();
        let b = service.create_note().unwrap();
        service.assign_category(a.id(), work.id()).unwrap();
        service.assign_category(b.id(), work.id()).unwrap();
        service.assign_category(b.id(), home.id()).unwrap();

        assert!(service.delete_category(work.id()).unwrap());

        for note in service.notes().unwrap() {
            assert!(!note.has_category(work.id()));
        }
        let b = service.get_note(b.id()).unwrap().unwrap();
        assert_eq!(b.categories(), &[home.id().clone()]);
    }

    #[test]
    fn assigning_unknown_category_is_ignored() {
        let service = NotebookService::default();
        let note = service.create_note().unwrap();
        assert!(!service
            .assign_category(note.id(), &DocumentId::from("nope"))
            .unwrap());
        assert!(service.get_note(note.id()).unwrap().unwrap().categories().is_empty());
    }

    #[test]
    fn search_matches_names_and_optionally_bodies() {
        let (service, ids) = service_with_named_notes(&["Groceries", "Ideas"]);
        service.set_body(&ids[1], "buy a new bicycle").unwrap();

        assert_eq!(service.search("", false).unwrap().len(), 2);
        assert!(service.search("bicycle", false).unwrap().is_empty());
        let hits = service.search("bicycle", true).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), &ids[1]);

        // Case-sensitive.
        assert!(service.search("groceries", true).unwrap().is_empty());
    }

    #[test]
    fn search_iterator_is_restartable_and_ordered() {
        let (service, _) = service_with_named_notes(&["alpha", "beta", "alphabet"]);
        let notes = service.notes().unwrap();
        let hits = search_notes(&notes, "alpha", false);

        let first: Vec<&str> = hits.clone().map(|note| note.name()).collect();
        let second: Vec<&str> = hits.map(|note| note.name()).collect();
        assert_eq!(first, vec!["alphabet", "alpha"]);
        assert_eq!(first, second);
    }

    #[test]
    fn search_scans_compressed_bodies_decoded() {
        let (service, ids) = service_with_named_notes(&["Stored"]);
        service.set_body(&ids[0], "hidden treasure").unwrap();
        service.save_full_notebook(|_| Ok(())).unwrap();

        let stored = service.get_note(&ids[0]).unwrap().unwrap();
        assert!(stored.core().body().is_compressed());
        assert_eq!(service.search("treasure", true).unwrap().len(), 1);
    }

    #[test]
    fn filter_uses_and_semantics() {
        let service = NotebookService::default();
        let a = service.create_category().unwrap();
        let b = service.create_category().unwrap();
        let both = service.create_note().unwrap();
        let only_a = service.create_note().unwrap();
        service.assign_category(both.id(), a.id()).unwrap();
        service.assign_category(both.id(), b.id()).unwrap();
        service.assign_category(only_a.id(), a.id()).unwrap();

        let notes = service.notes().unwrap();
        assert_eq!(filter_by_categories(&notes, &[]).count(), notes.len());

        let required = [a.id().clone(), b.id().clone()];
        let hits: Vec<&Note> = filter_by_categories(&notes, &required).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id(), both.id());
    }

    #[test]
    fn selection_drives_visibility() {
        let service = NotebookService::default();
        let category = service.create_category().unwrap();
        let tagged = service.create_note().unwrap();
        service.create_note().unwrap();
        service.assign_category(tagged.id(), category.id()).unwrap();

        assert_eq!(service.visible_notes("", false).unwrap().len(), 2);

        service.set_category_selected(category.id(), true).unwrap();
        assert_eq!(service.selected_categories().unwrap(), vec![category.id().clone()]);
        let visible = service.visible_notes("", false).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id(), tagged.id());

        service.set_category_selected(category.id(), false).unwrap();
        assert_eq!(service.refresh_visibility().unwrap(), 2);
    }

    #[test]
    fn name_sort_reverses_cleanly_without_ties() {
        let (service, _) = service_with_named_notes(&["delta", "Alpha", "charlie", "bravo"]);
        let notes = service.notes().unwrap();

        let ascending = sort_documents(&notes, DocumentSortType::NameAscending);
        let mut descending = sort_documents(&notes, DocumentSortType::NameDescending);
        descending.reverse();
        assert_eq!(ascending, descending);

        // Ordinal comparison puts uppercase first.
        let names: Vec<&str> = ascending.iter().map(|note| note.name()).collect();
        assert_eq!(names, vec!["Alpha", "bravo", "charlie", "delta"]);
    }

    #[test]
    fn sort_is_stable_for_ties() {
        let (service, ids) = service_with_named_notes(&["same", "same", "same"]);
        let notes = service.notes().unwrap();
        let original: Vec<&DocumentId> = notes.iter().map(|note| note.id()).collect();

        for sort in [DocumentSortType::NameAscending, DocumentSortType::NameDescending] {
            let sorted = sort_documents(&notes, sort);
            let order: Vec<&DocumentId> = sorted.iter().map(|note| note.id()).collect();
            assert_eq!(order, original);
        }
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn sort_notes_reorders_storage() {
        let (service, _) = service_with_named_notes(&["b", "c", "a"]);
        service.sort_notes(DocumentSortType::NameAscending).unwrap();
        let names: Vec<String> = service
            .notes()
            .unwrap()
            .iter()
            .map(|note| note.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn compressed_document_must_be_opened_before_editing() {
        let (service, ids) = service_with_named_notes(&["Draft"]);
        service.save_full_notebook(|_| Ok(())).unwrap();

        let err = service.set_body(&ids[0], "edit").unwrap_err();
        assert!(matches!(err, NotebookError::NotEditable { .. }));

        let opened = service.open_note(&ids[0]).unwrap().unwrap();
        assert!(!opened.core().body().is_compressed());
        assert!(service.set_body(&ids[0], "edit").unwrap());
        assert_eq!(service.open_document().unwrap(), Some(ids[0].clone()));

        service.close_document().unwrap();
        let closed = service.get_note(&ids[0]).unwrap().unwrap();
        assert!(closed.core().body().is_compressed());
        assert_eq!(closed.body_text(), "edit");
    }

    #[test]
    fn full_save_keeps_open_document_plain() {
        let (service, ids) = service_with_named_notes(&["open", "idle"]);
        service.open_note(&ids[0]).unwrap();

        let mut persisted = None;
        service
            .save_full_notebook(|payload| {
                persisted = Some(payload.clone());
                Ok(())
            })
            .unwrap();

        let persisted = persisted.unwrap();
        assert!(persisted
            .notes
            .iter()
            .all(|note| note.core().body().is_compressed()));

        let open = service.get_note(&ids[0]).unwrap().unwrap();
        let idle = service.get_note(&ids[1]).unwrap().unwrap();
        assert!(!open.core().body().is_compressed());
        assert!(idle.core().body().is_compressed());
        assert!(!service.is_dirty().unwrap());
    }

    #[test]
    fn edit_during_full_save_is_not_overwritten() {
        // `modified` far ahead of the clock, so the edit cannot advance it
        let note: Note = serde_json::from_value(json!({
            "id": "ahead", "name": "n", "body": "old",
            "created": 1000, "modified": 32_503_680_000_000i64
        }))
        .unwrap();
        let service = NotebookService::new(vec![note], Vec::new());
        let id = DocumentId::from("ahead");

        service
            .save_full_notebook(|_| {
                service.set_body(&id, "new edit")?;
                Ok(())
            })
            .unwrap();

        let note = service.get_note(&id).unwrap().unwrap();
        assert!(!note.core().body().is_compressed());
        assert_eq!(note.body_text(), "new edit");
        assert!(service.is_dirty().unwrap());

        let mut saved = Vec::new();
        service
            .save_dirty(|changes| {
                saved.extend_from_slice(changes);
                Ok(())
            })
            .unwrap();
        match &saved[..] {
            [DocumentChange::Note(note)] => assert_eq!(note.body_text(), "new edit"),
            other => panic!("unexpected changes {:?}", other),
        }
    }

    #[test]
    fn full_saves_see_whole_documents_while_notes_are_added() {
        let service = NotebookService::default();
        let dir = tempfile::tempdir().unwrap();

        std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                for i in 0..200 {
                    let note = service.create_note().unwrap();
                    service
                        .rename_document(note.id(), &format!("note {}", i))
                        .unwrap();
                }
            });

            for round in 0..20 {
                service
                    .save_full_notebook(|payload| {
                        let ids: HashSet<&DocumentId> =
                            payload.notes.iter().map(|note| note.id()).collect();
                        assert_eq!(ids.len(), payload.notes.len());
                        for note in &payload.notes {
                            assert!(note.core().body().is_compressed());
                            assert!(
                                note.name() == crate::DEFAULT_NOTE_NAME
                                    || note.name().starts_with("note ")
                            );
                        }
                        Ok(())
                    })
                    .unwrap();
                service
                    .create_backup(&dir.path().join(format!("snapshot-{}.json", round)))
                    .unwrap();
            }
            writer.join().unwrap();
        });

        let mut written = 0;
        service
            .save_full_notebook(|payload| {
                written = payload.notes.len();
                Ok(())
            })
            .unwrap();
        assert_eq!(written, 200);
        assert!(!service.is_dirty().unwrap());
    }

    #[test]
    fn failed_partial_save_keeps_documents_dirty() {
        let (service, ids) = service_with_named_notes(&["one"]);

        let err = service
            .save_dirty(|_| {
                Err(NotebookError::ApplicationError {
                    message: "disk full".to_string(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, NotebookError::ApplicationError { .. }));
        assert!(service.is_dirty().unwrap());

        let mut saved = Vec::new();
        let count = service
            .save_dirty(|changes| {
                saved.extend_from_slice(changes);
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
        assert!(!service.is_dirty().unwrap());
        match &saved[0] {
            DocumentChange::Note(note) => {
                assert_eq!(note.id(), &ids[0]);
                assert!(note.core().body().is_compressed());
            }
            other => panic!("unexpected change {:?}", other),
        }
        assert_eq!(service.save_dirty(|_| Ok(())).unwrap(), 0);
    }

    #[test]
    fn deleted_documents_are_saved_as_removals() {
        let (service, ids) = service_with_named_notes(&["gone"]);
        service.save_dirty(|_| Ok(())).unwrap();
        service.delete_note(&ids[0]).unwrap();

        let mut change = None;
        assert!(service
            .save_document(&ids[0], |saved| {
                change = Some(saved.clone());
                Ok(())
            })
            .unwrap());
        assert_eq!(change, Some(DocumentChange::Removed(ids[0].clone())));
        assert!(!service
            .save_document(&ids[0], |_| Ok(()))
            .unwrap());
    }

    #[test]
    fn annotations_touch_the_document() {
        let (service, ids) = service_with_named_notes(&["sketch"]);
        service.save_dirty(|_| Ok(())).unwrap();

        let stroke = Stroke {
            start: Point::new(0.0, 0.0),
            end: Point::new(5.0, 5.0),
            color: Rgb::WHITE,
            width: 2.0,
        };
        assert!(service.add_stroke(&ids[0], stroke).unwrap());
        assert!(service
            .add_image(
                &ids[0],
                ImageRef {
                    data: "aGVsbG8=".to_string(),
                    position: Point::default(),
                }
            )
            .unwrap());
        assert!(service.is_dirty().unwrap());

        assert!(service.clear_strokes(&ids[0]).unwrap());
        assert!(!service.clear_strokes(&ids[0]).unwrap());
        assert!(service.remove_image(&ids[0], 0).unwrap().is_some());
        assert!(service.remove_image(&ids[0], 0).unwrap().is_none());
    }

    #[test]
    fn loading_repairs_duplicates_and_dangling_references() {
        let category: Category = serde_json::from_value(json!({
            "id": "cat", "name": "Work", "created": 5, "modified": 1
        }))
        .unwrap();
        let note: Note = serde_json::from_value(json!({
            "id": "dup", "name": "first", "created": 1, "modified": 2,
            "categories": ["cat", "missing", "cat"]
        }))
        .unwrap();
        let twin: Note = serde_json::from_value(json!({
            "id": "dup", "name": "second", "created": 1, "modified": 2,
            "body": { "deflate": "not base64 at all!" }
        }))
        .unwrap();

        let service = NotebookService::new(vec![note, twin], vec![category]);
        let report = service.load_report().unwrap();
        assert_eq!(report.duplicate_ids, 1);
        assert_eq!(report.dangling_references, 2);
        assert_eq!(report.corrupt_bodies, 1);

        let notes = service.notes().unwrap();
        assert_ne!(notes[0].id(), notes[1].id());
        assert_eq!(notes[0].categories(), &[DocumentId::from("cat")]);
        assert!(notes[1].core().is_body_corrupt());

        let category = service.get_category(&DocumentId::from("cat")).unwrap().unwrap();
        assert!(category.modified() >= category.created());
        assert!(service.is_dirty().unwrap());
    }

    #[test]
    fn concurrent_backup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = NotebookService::default();
        let _in_flight = FlightGuard::acquire(&service.saving, "backup").unwrap();
        assert!(service.is_saving());

        let err = service.create_backup(&dir.path().join("b.json")).unwrap_err();
        assert!(matches!(err, NotebookError::Busy { .. }));
        assert!(matches!(
            service.export_notes().unwrap_err(),
            NotebookError::Busy { .. }
        ));
    }

    #[test]
    fn flight_flag_is_released_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let service = NotebookService::default();
        service.create_backup(&dir.path().join("a.json")).unwrap();
        assert!(!service.is_saving());
        service.create_backup(&dir.path().join("b.json")).unwrap();
    }

    #[test]
    fn backup_and_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual.json");

        let source = NotebookService::default();
        let category = source.create_category().unwrap();
        let note = source.create_note().unwrap();
        source.set_body(note.id(), "remember the milk").unwrap();
        source.assign_category(note.id(), category.id()).unwrap();
        source.create_backup(&path).unwrap();

        let target = NotebookService::default();
        let stale = target.create_note().unwrap();
        target.save_dirty(|_| Ok(())).unwrap();

        let summary = target.import_backup(&path).unwrap();
        assert_eq!(summary.notes, 1);
        assert_eq!(summary.categories, 1);
        assert!(!target.is_loading());

        let restored = target.get_note(note.id()).unwrap().unwrap();
        assert_eq!(restored.body_text(), "remember the milk");
        assert!(restored.has_category(category.id()));
        assert!(target.get_note(stale.id()).unwrap().is_none());

        let mut changes = Vec::new();
        target
            .save_dirty(|saved| {
                changes.extend_from_slice(saved);
                Ok(())
            })
            .unwrap();
        assert!(changes.contains(&DocumentChange::Removed(stale.id().clone())));
    }

    #[test]
    fn failed_import_leaves_notebook_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let service = NotebookService::default();
        let note = service.create_note().unwrap();
        assert!(service.import_backup(&path).is_err());
        assert!(service.get_note(note.id()).unwrap().is_some());
        assert!(!service.is_loading());
    }

    #[test]
    fn csv_export_quotes_and_resolves_categories() {
        let service = NotebookService::default();
        let category = service.create_category().unwrap();
        service.rename_document(category.id(), "Work").unwrap();
        let note = service.create_note().unwrap();
        service.rename_document(note.id(), "Plan, v2").unwrap();
        service
            .set_body(note.id(), "say \"hi\"\nthen leave")
            .unwrap();
        service.assign_category(note.id(), category.id()).unwrap();

        let csv = service.export_notes().unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("id,name,categories,created,modified,body"));
        let row = lines.next().unwrap();
        assert!(row.starts_with(&format!("{},\"Plan, v2\",Work,", note.id())));
        assert!(csv.contains("\"say \"\"hi\"\"\nthen leave\""));
    }
}
