//! Core data structures for the neatnote document store.
//!
//! Notes and categories share one [`DocumentCore`] (identity, timestamps,
//! body and freehand annotations) and add their own fields on top. The
//! [`UniqueDocument`] trait exposes the shared part to generic code such as
//! sorting.
use std::{
    borrow::Cow,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{codec, NotebookError, Result};

/// Body length above which the editor warns about sluggish input.
pub const MAX_SAFE_BODY_CHARS: usize = 2048;

pub const DEFAULT_NOTE_NAME: &str = "New Note";
pub const DEFAULT_CATEGORY_NAME: &str = "New Category";
pub const DEFAULT_CATEGORY_BODY: &str = "Category description";

static ID_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Stable identifier of a note or category.
///
/// Generated once from the creation timestamp plus a salt and never derived
/// from mutable fields such as the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generates a fresh identifier.
    pub fn generate() -> Self {
        let now = Utc::now();
        let nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000));
        let sequence = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xffff;
        let salt: u16 = rand::random();
        DocumentId(format!("{:x}-{:04x}{:04x}", nanos, sequence, salt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        DocumentId(value.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        DocumentId(value)
    }
}

/// The two document variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Note,
    Category,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Note => f.write_str("note"),
            DocumentKind::Category => f.write_str("category"),
        }
    }
}

/// A 2D position on the document canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(alias = "X")]
    pub x: f32,
    #[serde(alias = "Y")]
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Point { x, y }
    }
}

/// RGB colour with components in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb {
    #[serde(alias = "X")]
    pub r: f32,
    #[serde(alias = "Y")]
    pub g: f32,
    #[serde(alias = "Z")]
    pub b: f32,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb {
        r: 1.0,
        g: 1.0,
        b: 1.0,
    };

    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Rgb {
            r: r.clamp(0.0, 1.0),
            g: g.clamp(0.0, 1.0),
            b: b.clamp(0.0, 1.0),
        }
    }

    /// Random colour used for freshly created categories.
    pub fn random() -> Self {
        Rgb::new(rand::random(), rand::random(), rand::random())
    }

    pub fn white() -> Self {
        Rgb::WHITE
    }

    /// Parses `#rrggbb` (the leading `#` is optional).
    pub fn from_hex(value: &str) -> Option<Self> {
        let hex = value.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16)
                .ok()
                .map(|value| f32::from(value) / 255.0)
        };
        Some(Rgb::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }

    /// `#rrggbb` representation.
    pub fn to_hex(&self) -> String {
        let channel = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for Rgb {
    fn default() -> Self {
        Rgb::WHITE
    }
}

/// Embedded image: an opaque base64 blob anchored at a canvas position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub data: String,
    #[serde(default)]
    pub position: Point,
}

/// One freehand annotation segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    #[serde(alias = "Item1")]
    pub start: Point,
    #[serde(alias = "Item2")]
    pub end: Point,
    #[serde(alias = "Item3")]
    pub color: Rgb,
    #[serde(alias = "Item4")]
    pub width: f32,
}

/// Document body, either editable plain text or its stored compact form.
///
/// Legacy records carry a bare string, which deserializes as `Plain`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Plain(String),
    Compressed { deflate: String },
}

impl Default for Body {
    fn default() -> Self {
        Body::Plain(String::new())
    }
}

impl Body {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Body::Compressed { .. })
    }

    /// Compresses in place. Returns `false` when already compressed.
    pub fn compress(&mut self) -> Result<bool> {
        if let Body::Plain(text) = self {
            let deflate = codec::encode_to_string(text)?;
            *self = Body::Compressed { deflate };
            return Ok(true);
        }
        Ok(false)
    }

    /// Decompresses in place. Returns `false` when already plain.
    ///
    /// On a decode failure the body is replaced by an empty one and the
    /// error is returned so the caller can flag the document.
    pub fn decompress(&mut self) -> Result<bool> {
        let decoded = match self {
            Body::Plain(_) => return Ok(false),
            Body::Compressed { deflate } => codec::decode_from_str(deflate),
        };

        match decoded {
            Ok(text) => {
                *self = Body::Plain(text);
                Ok(true)
            }
            Err(e) => {
                *self = Body::Plain(String::new());
                Err(e)
            }
        }
    }

    /// Plain text of the body, decoding on the fly when compressed.
    ///
    /// A corrupt compressed body reads as empty.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            Body::Plain(text) => Cow::Borrowed(text),
            Body::Compressed { deflate } => match codec::decode_from_str(deflate) {
                Ok(text) => Cow::Owned(text),
                Err(e) => {
                    warn!("Reading corrupt body as empty: {}", e);
                    Cow::Borrowed("")
                }
            },
        }
    }
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

fn visible_by_default() -> bool {
    true
}

/// Treats an explicit `null` the same as a missing sequence.
pub(crate) fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Fields shared by every document kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCore {
    id: DocumentId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    body: Body,
    #[serde(default = "unix_epoch", with = "chrono::serde::ts_milliseconds")]
    created: DateTime<Utc>,
    #[serde(default = "unix_epoch", with = "chrono::serde::ts_milliseconds")]
    modified: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    images: Vec<ImageRef>,
    #[serde(default, deserialize_with = "null_as_empty")]
    lines: Vec<Stroke>,

    #[serde(skip)]
    is_selected: bool,
    #[serde(skip, default = "visible_by_default")]
    is_visible: bool,
    #[serde(skip)]
    body_corrupt: bool,
}

impl DocumentCore {
    fn new(name: &str, body: &str) -> Self {
        let now = Utc::now();
        DocumentCore {
            id: DocumentId::generate(),
            name: name.to_string(),
            body: Body::Plain(body.to_string()),
            created: now,
            modified: now,
            images: Vec::new(),
            lines: Vec::new(),
            is_selected: false,
            is_visible: true,
            body_corrupt: false,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn images(&self) -> &[ImageRef] {
        &self.images
    }

    pub fn lines(&self) -> &[Stroke] {
        &self.lines
    }

    pub fn is_selected(&self) -> bool {
        self.is_selected
    }

    pub fn is_visible(&self) -> bool {
        self.is_visible
    }

    /// Set when the stored body failed to decode and was replaced by an empty one.
    pub fn is_body_corrupt(&self) -> bool {
        self.body_corrupt
    }

    /// Compresses the body for storage. No-op when already compressed.
    pub fn compress_body(&mut self) -> Result<bool> {
        self.body.compress()
    }

    /// Decompresses the body for editing. No-op when already plain.
    ///
    /// Returns `false` when the stored body was corrupt; the body is then
    /// empty and the document is flagged.
    pub fn decompress_body(&mut self) -> bool {
        match self.body.decompress() {
            Ok(_) => true,
            Err(e) => {
                warn!("Document {} has a corrupt body, using empty body: {}", self.id, e);
                self.body_corrupt = true;
                false
            }
        }
    }

    /// Number of whitespace separated words in the body.
    pub fn word_count(&self) -> usize {
        self.body.text().split_whitespace().count()
    }

    pub fn char_count(&self) -> usize {
        self.body.text().chars().count()
    }

    pub fn exceeds_safe_length(&self) -> bool {
        self.char_count() > MAX_SAFE_BODY_CHARS
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
        self.touch();
    }

    pub(crate) fn set_body(&mut self, text: &str) -> Result<()> {
        match &mut self.body {
            Body::Plain(current) => {
                current.clear();
                current.push_str(text);
            }
            Body::Compressed { .. } => {
                return Err(NotebookError::NotEditable {
                    id: self.id.to_string(),
                })
            }
        }
        self.body_corrupt = false;
        self.touch();
        Ok(())
    }

    pub(crate) fn push_stroke(&mut self, stroke: Stroke) {
        self.lines.push(stroke);
        self.touch();
    }

    pub(crate) fn clear_strokes(&mut self) -> bool {
        if self.lines.is_empty() {
            return false;
        }
        self.lines.clear();
        self.touch();
        true
    }

    pub(crate) fn push_image(&mut self, image: ImageRef) {
        self.images.push(image);
        self.touch();
    }

    pub(crate) fn remove_image(&mut self, index: usize) -> Option<ImageRef> {
        if index >= self.images.len() {
            return None;
        }
        let removed = self.images.remove(index);
        self.touch();
        Some(removed)
    }

    pub(crate) fn set_selected(&mut self, selected: bool) {
        self.is_selected = selected;
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.is_visible = visible;
    }

    pub(crate) fn replace_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Refreshes `modified`, never letting it fall behind `created`.
    pub(crate) fn touch(&mut self) {
        self.modified = Utc::now().max(self.created).max(self.modified);
    }

    /// Repairs records whose `modified` predates `created`.
    pub(crate) fn normalize_timestamps(&mut self) {
        if self.modified < self.created {
            self.modified = self.created;
        }
    }

    pub(crate) fn regenerate_id(&mut self) {
        self.id = DocumentId::generate();
    }
}

/// Shared behaviour of notes and categories.
pub trait UniqueDocument {
    const KIND: DocumentKind;

    fn core(&self) -> &DocumentCore;

    fn core_mut(&mut self) -> &mut DocumentCore;

    fn id(&self) -> &DocumentId {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn created(&self) -> DateTime<Utc> {
        self.core().created()
    }

    fn modified(&self) -> DateTime<Utc> {
        self.core().modified()
    }

    fn body_text(&self) -> Cow<'_, str> {
        self.core().body().text()
    }

    fn word_count(&self) -> usize {
        self.core().word_count()
    }
}

/// A free-form note, optionally tagged with categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(flatten)]
    core: DocumentCore,
    /// Category ids; kept free of duplicates.
    #[serde(default, deserialize_with = "null_as_empty")]
    categories: Vec<DocumentId>,
}

impl Note {
    pub(crate) fn new() -> Self {
        Note {
            core: DocumentCore::new(DEFAULT_NOTE_NAME, ""),
            categories: Vec::new(),
        }
    }

    pub fn categories(&self) -> &[DocumentId] {
        &self.categories
    }

    pub fn has_category(&self, id: &DocumentId) -> bool {
        self.categories.contains(id)
    }

    /// Whether this note carries every category in `required`.
    pub fn has_all_categories(&self, required: &[DocumentId]) -> bool {
        required.iter().all(|id| self.has_category(id))
    }

    pub(crate) fn add_category(&mut self, id: &DocumentId) -> bool {
        if self.has_category(id) {
            return false;
        }
        self.categories.push(id.clone());
        self.core.touch();
        true
    }

    pub(crate) fn remove_category(&mut self, id: &DocumentId) -> bool {
        let before = self.categories.len();
        self.categories.retain(|existing| existing != id);
        if self.categories.len() == before {
            return false;
        }
        self.core.touch();
        true
    }

    /// Drops duplicate and unknown category references. Returns how many were dropped.
    pub(crate) fn retain_categories<F>(&mut self, mut known: F) -> usize
    where
        F: FnMut(&DocumentId) -> bool,
    {
        let before = self.categories.len();
        let mut seen = Vec::with_capacity(before);
        self.categories.retain(|id| {
            if seen.contains(id) || !known(id) {
                return false;
            }
            seen.push(id.clone());
            true
        });
        before - self.categories.len()
    }
}

impl UniqueDocument for Note {
    const KIND: DocumentKind = DocumentKind::Note;

    fn core(&self) -> &DocumentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DocumentCore {
        &mut self.core
    }
}

/// A tag used to group notes, displayed with its colour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    #[serde(flatten)]
    core: DocumentCore,
    #[serde(default = "Rgb::white")]
    color: Rgb,
}

impl Category {
    pub(crate) fn new() -> Self {
        Category {
            core: DocumentCore::new(DEFAULT_CATEGORY_NAME, DEFAULT_CATEGORY_BODY),
            color: Rgb::random(),
        }
    }

    pub fn color(&self) -> Rgb {
        self.color
    }

    pub(crate) fn set_color(&mut self, color: Rgb) {
        self.color = color;
        self.core.touch();
    }
}

impl UniqueDocument for Category {
    const KIND: DocumentKind = DocumentKind::Category;

    fn core(&self) -> &DocumentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DocumentCore {
        &mut self.core
    }
}

/// The note and category collections as written to backups and exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotebookPayload {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub notes: Vec<Note>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub categories: Vec<Category>,
}

impl NotebookPayload {
    pub fn new(notes: Vec<Note>, categories: Vec<Category>) -> Self {
        NotebookPayload { notes, categories }
    }

    /// Compresses every body for storage.
    pub fn compress_all(&mut self) -> Result<()> {
        for note in &mut self.notes {
            note.core_mut().compress_body()?;
        }
        for category in &mut self.categories {
            category.core_mut().compress_body()?;
        }
        Ok(())
    }

    /// Decompresses every body. Returns the number of corrupt bodies replaced.
    pub fn decompress_all(&mut self) -> usize {
        let mut corrupt = 0;
        for note in &mut self.notes {
            if !note.core_mut().decompress_body() {
                corrupt += 1;
            }
        }
        for category in &mut self.categories {
            if !category.core_mut().decompress_body() {
                corrupt += 1;
            }
        }
        corrupt
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty() && self.categories.is_empty()
    }
}
