//! Catalog of the content tree: markdown documents with their declared
//! permissions, other files for embed lookup, and registered fonts.
//!
//! Readers grab the current [`IndexSnapshot`] and keep using it for the whole
//! operation. A scan builds a fresh snapshot off to the side and publishes it
//! with a single pointer swap.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::ScanError;
use crate::permission::{Evaluator, MatchMode, PermissionSpec};
use crate::principal::Principal;


pub const MAIN_FONTS_DIR: &str = "assets/main-fonts/";
pub const NAV_FONTS_DIR: &str = "assets/nav-fonts/";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DocumentEntry {
    /// Relative to the content root, `/`-separated.
    pub path: String,
    pub full_path: String,
    pub path_without_ext: String,
    pub folders: String,
    pub folder_array: Vec<String>,
    pub depth: usize,
    pub file_name: String,
    pub file_name_without_extension: String,
    pub last_folder: String,
    pub css_name: String,
    pub permissions: PermissionSpec,
    /// Milliseconds since the unix epoch.
    pub mtime: u64,
}

impl DocumentEntry {
    fn new(prefix: &str, path: &str, permissions: PermissionSpec, mtime: u64) -> Self {
        let (folders, file_name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir.to_string(), name.to_string()),
            None => (String::new(), path.to_string()),
        };
        let stem = file_name.strip_suffix(".md").unwrap_or(&file_name);
        let path_without_ext = if folders.is_empty() {
            stem.to_string()
        } else {
            format!("{folders}/{stem}")
        };
        let folder_array: Vec<String> = if folders.is_empty() {
            Vec::new()
        } else {
            folders.split('/').map(str::to_string).collect()
        };
        Self {
            path: path.to_string(),
            full_path: format!("{prefix}{path}"),
            file_name_without_extension: stem.split('.').next().unwrap_or_default().to_string(),
            last_folder: folder_array.last().cloned().unwrap_or_default(),
            depth: folder_array.len(),
            css_name: css_safe(&folders),
            path_without_ext,
            folders,
            folder_array,
            file_name,
            permissions,
            mtime,
        }
    }
}

/// Listing order: folder segments compared case-insensitively; on a shared
/// prefix the deeper folder comes first; then the file name.
pub fn listing_order(a: &DocumentEntry, b: &DocumentEntry) -> Ordering {
    for (x, y) in a.folder_array.iter().zip(&b.folder_array) {
        let ord = x.to_lowercase().cmp(&y.to_lowercase());
        if ord != Ordering::Equal {
            return ord;
        }
    }
    b.folder_array
        .len()
        .cmp(&a.folder_array.len())
        .then_with(|| a.file_name.to_lowercase().cmp(&b.file_name.to_lowercase()))
}

/// Class-name-safe slug of a folder path.
pub fn css_safe(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            ' ' => out.push('-'),
            'A'..='Z' => {
                out.push('_');
                out.push(c.to_ascii_lowercase());
            }
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("__{unit:04x}"));
                }
            }
        }
    }
    out
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl ScanDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct IndexSnapshot {
    pub root: PathBuf,
    pub prefix: String,
    /// Markdown documents in listing order.
    pub entries: Vec<DocumentEntry>,
    /// Document base name (no `.md`) to relative paths.
    pub md_by_name: BTreeMap<String, Vec<String>>,
    /// Non-markdown file name to relative paths.
    pub files_by_name: BTreeMap<String, Vec<String>>,
    pub md_by_path: BTreeMap<String, String>,
    pub main_fonts: Vec<(String, String)>,
    pub nav_fonts: Vec<(String, String)>,
    /// `prefix + path` to last seen modification time.
    pub mtimes: BTreeMap<String, SystemTime>,
}

impl IndexSnapshot {
    pub fn entry(&self, path: &str) -> Option<&DocumentEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn documents_named(&self, stem: &str) -> &[String] {
        self.md_by_name.get(stem).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn files_named(&self, name: &str) -> &[String] {
        self.files_by_name.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn absolute(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn register_font(fonts: &mut Vec<(String, String)>, name: String, path: String) {
    match fonts.iter_mut().find(|(n, _)| *n == name) {
        Some(existing) => existing.1 = path,
        None => fonts.push((name, path)),
    }
}

/// Leading zero-width characters and byte-order marks that editors leave at
/// the start of a file.
pub(crate) fn strip_leading_marker(text: &str) -> &str {
    let mut chars = text.chars();
    match chars.next() {
        Some('\u{200B}'..='\u{200F}' | '\u{FEFF}') => chars.as_str(),
        _ => text,
    }
}

/// Declared permissions from the first line only.
pub fn read_permissions(path: &Path) -> Result<PermissionSpec, ScanError> {
    let io_err = |source| ScanError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut line = String::new();
    BufReader::new(file).read_line(&mut line).map_err(io_err)?;
    let line = strip_leading_marker(line.trim_end_matches(['\n', '\r']));
    Ok(PermissionSpec::parse_directive(line).unwrap_or_default())
}

fn millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    Some(parts.join("/"))
}

fn is_skipped(entry: &DirEntry, root: &Path, excluded: &[String]) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    if entry.file_name().to_string_lossy().starts_with('.') {
        return true;
    }
    entry.file_type().is_dir()
        && relative(root, entry.path()).is_some_and(|rel| {
            excluded
                .iter()
                .any(|ex| rel == *ex || rel.starts_with(&format!("{ex}/")))
        })
}

pub struct DocumentIndex {
    snapshot: RwLock<Arc<IndexSnapshot>>,
    scan_lock: Mutex<()>,
}

impl Default for DocumentIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentIndex {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            scan_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<IndexSnapshot> {
        self.snapshot.read().clone()
    }

    /// Rebuilds the whole index from disk and reports how the set of
    /// markdown files changed since the previous scan. Blocking.
    pub fn scan(&self, prefix: &str, root: &Path, reset_fonts: bool, excluded: &[String]) -> ScanDiff {
        let _guard = self.scan_lock.lock();
        let previous = self.current();
        let mut next = IndexSnapshot {
            root: root.to_path_buf(),
            prefix: prefix.to_string(),
            ..IndexSnapshot::default()
        };
        if !reset_fonts {
            next.main_fonts = previous.main_fonts.clone();
            next.nav_fonts = previous.nav_fonts.clone();
        }

        let walker = WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| !is_skipped(e, root, excluded));
        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(source) => {
                    let err = ScanError::Walk {
                        path: source.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
                        source,
                    };
                    warn!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = relative(root, entry.path()) else {
                continue;
            };
            let file_name = entry.file_name().to_string_lossy().into_owned();

            if file_name.ends_with(".md") {
                let scanned = entry
                    .metadata()
                    .map_err(|source| ScanError::Walk {
                        path: entry.path().to_path_buf(),
                        source,
                    })
                    .and_then(|meta| {
                        let permissions = read_permissions(entry.path())?;
                        Ok((meta.modified().unwrap_or(UNIX_EPOCH), permissions))
                    });
                let (modified, permissions) = match scanned {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(error = %err, "excluding unreadable document");
                        continue;
                    }
                };
                let doc = DocumentEntry::new(prefix, &rel, permissions, millis(modified));
                let stem = file_name.strip_suffix(".md").unwrap_or(&file_name).to_string();
                next.md_by_name
                    .entry(stem)
                    .or_default()
                    .push(rel.clone());
                next.md_by_path.insert(rel.clone(), doc.path_without_ext.clone());
                next.mtimes.insert(format!("{prefix}{rel}"), modified);
                next.entries.push(doc);
            } else {
                next.files_by_name
                    .entry(file_name.clone())
                    .or_default()
                    .push(rel.clone());
                let font = file_name.strip_suffix(".ttf").unwrap_or(&file_name).to_string();
                if rel.starts_with(MAIN_FONTS_DIR) {
                    register_font(&mut next.main_fonts, font, rel);
                } else if rel.starts_with(NAV_FONTS_DIR) {
                    register_font(&mut next.nav_fonts, font, rel);
                }
            }
        }

        next.entries.sort_by(listing_order);
        for paths in next.md_by_name.values_mut().chain(next.files_by_name.values_mut()) {
            paths.sort();
        }

        let diff = diff_mtimes(&previous.mtimes, &next.mtimes);
        info!(
            documents = next.entries.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "content index rebuilt"
        );
        debug!(?diff, "scan diff");
        *self.snapshot.write() = Arc::new(next);
        diff
    }

    /// Sorted listing restricted to documents the principal may open.
    pub async fn visible_entries(&self, evaluator: &Evaluator, principal: &Principal) -> Vec<DocumentEntry> {
        let snapshot = self.current();
        if snapshot.entries.iter().all(|e| e.permissions.is_public()) {
            return snapshot.entries.clone();
        }
        let ctx = evaluator.access_context(principal).await;
        snapshot
            .entries
            .iter()
            .filter(|e| ctx.permits(&e.permissions, MatchMode::Any, true))
            .cloned()
            .collect()
    }
}

fn diff_mtimes(previous: &BTreeMap<String, SystemTime>, next: &BTreeMap<String, SystemTime>) -> ScanDiff {
    let mut diff = ScanDiff::default();
    for (path, mtime) in next {
        match previous.get(path) {
            None => diff.added.push(path.clone()),
            Some(before) if before != mtime => diff.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    diff.removed = previous
        .keys()
        .filter(|path| !next.contains_key(*path))
        .cloned()
        .collect();
    diff
}
