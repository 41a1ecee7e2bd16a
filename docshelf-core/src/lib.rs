use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("4f1c9a27-6d0b-5e83-9c14-2ab7d45f8e61").expect("valid namespace UUID")
});

/// Derives the stable identity of a document from its source path.
///
/// The id must survive rescans and process restarts: persisted favorite
/// and recent-file references are resolved through it. It is therefore a
/// v5 UUID over the resolved path, never anything random.
pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    Pdf,
    /// XML-based slide deck (`.pptx`), renderable in-process.
    SlideDeck,
    /// Pre-XML slide deck (`.ppt`); routed to a placeholder view.
    LegacySlideDeck,
}

impl DocumentKind {
    /// Classifies a file by extension, case-insensitively. Unrecognized
    /// extensions yield `None` and the file is excluded from the index.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let lower = file_name.to_lowercase();
        if lower.ends_with(".pdf") {
            Some(Self::Pdf)
        } else if lower.ends_with(".pptx") {
            Some(Self::SlideDeck)
        } else if lower.ends_with(".ppt") {
            Some(Self::LegacySlideDeck)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOrigin {
    /// Shipped with the app; read-only, never deletable.
    Bundled,
    UserUploaded,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub source_path: PathBuf,
    pub category_id: String,
    pub kind: DocumentKind,
    pub origin: DocumentOrigin,
    pub size_bytes: Option<u64>,
    /// Derived from the [`LibraryStore`] at query time, never cached.
    pub is_favorite: bool,
}

/// File stem used as the display title, e.g. `intro.pdf` -> `intro`.
pub fn title_from_file_name(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => file_name[..idx].to_string(),
        _ => file_name.to_string(),
    }
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["KB", "MB", "GB", "TB", "PB", "EB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let exp = (63 - bytes.leading_zeros() as u64) / 10;
    let exp = exp.min(UNITS.len() as u64) as usize;
    let value = bytes as f64 / 1024f64.powi(exp as i32);
    format!("{:.1} {}", value, UNITS[exp - 1])
}

#[derive(Debug, Clone)]
pub struct Category {
    pub id: String,
    pub display_name: String,
    pub display_name_localized: String,
    pub icon_ref: String,
    /// Sub-path under both storage roots holding this category's files.
    pub storage_subpath: String,
}

impl Category {
    pub fn new(id: &str, display_name: &str, display_name_localized: &str, icon_ref: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            display_name_localized: display_name_localized.to_string(),
            icon_ref: icon_ref.to_string(),
            storage_subpath: id.to_string(),
        }
    }
}

/// Fixed set of categories, established at construction and immutable
/// afterwards. Iteration order is registration order.
#[derive(Debug, Clone)]
pub struct CategoryRegistry {
    categories: Vec<Category>,
}

impl CategoryRegistry {
    pub fn new(categories: Vec<Category>) -> Self {
        Self { categories }
    }

    /// The product's six built-in categories.
    pub fn builtin() -> Self {
        Self::new(vec![
            Category::new("maruzalar", "Lectures", "Ma'ruzalar", "ic_lecture"),
            Category::new("adabiyotlar", "Literature", "Adabiyotlar", "ic_book"),
            Category::new("labaratoriya", "Laboratory", "Labaratoriya", "ic_lab"),
            Category::new("amaliy", "Practical", "Amaliy mashg'ulot", "ic_practise"),
            Category::new("masalalar", "Problems", "Masalalar", "ic_problem"),
            Category::new("sillabus", "Syllabus", "Sillabus", "ic_syllabus"),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn get(&self, category_id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == category_id)
    }

    pub fn localized_name(&self, category_id: &str) -> Option<&str> {
        self.get(category_id)
            .map(|c| c.display_name_localized.as_str())
    }

    pub fn icon_ref(&self, category_id: &str) -> Option<&str> {
        self.get(category_id).map(|c| c.icon_ref.as_str())
    }
}

/// Maximum number of entries retained in the recent-file list.
pub const RECENT_CAP: usize = 20;

/// Persisted favorites set and recent-file list, injected into the
/// index and the presentation layer. Implementations must keep the
/// recent list de-duplicated, most-recent-first and capped at
/// [`RECENT_CAP`] entries.
pub trait LibraryStore: Send + Sync {
    fn add_favorite(&self, id: DocumentId) -> Result<()>;
    fn remove_favorite(&self, id: DocumentId) -> Result<()>;
    fn favorites(&self) -> Result<HashSet<DocumentId>>;
    fn is_favorite(&self, id: DocumentId) -> Result<bool> {
        Ok(self.favorites()?.contains(&id))
    }

    fn add_recent(&self, path: &Path) -> Result<()>;
    fn recent_paths(&self) -> Result<Vec<PathBuf>>;
    fn clear_recent(&self) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    favorites: BTreeSet<DocumentId>,
    recent: Vec<PathBuf>,
}

impl StoreData {
    fn push_recent(&mut self, path: &Path) {
        self.recent.retain(|p| p != path);
        self.recent.insert(0, path.to_path_buf());
        self.recent.truncate(RECENT_CAP);
    }
}

pub struct MemoryLibraryStore {
    inner: Mutex<StoreData>,
}

impl MemoryLibraryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreData::default()),
        }
    }
}

impl Default for MemoryLibraryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryStore for MemoryLibraryStore {
    fn add_favorite(&self, id: DocumentId) -> Result<()> {
        self.inner.lock().favorites.insert(id);
        Ok(())
    }

    fn remove_favorite(&self, id: DocumentId) -> Result<()> {
        self.inner.lock().favorites.remove(&id);
        Ok(())
    }

    fn favorites(&self) -> Result<HashSet<DocumentId>> {
        Ok(self.inner.lock().favorites.iter().copied().collect())
    }

    fn add_recent(&self, path: &Path) -> Result<()> {
        self.inner.lock().push_recent(path);
        Ok(())
    }

    fn recent_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self.inner.lock().recent.clone())
    }

    fn clear_recent(&self) -> Result<()> {
        self.inner.lock().recent.clear();
        Ok(())
    }
}

/// JSON-file-backed store. Writes go through a temp file followed by a
/// rename so a crash mid-write cannot corrupt the previous contents.
pub struct FileLibraryStore {
    path: PathBuf,
    inner: Mutex<StoreData>,
}

impl FileLibraryStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory at {:?}", parent))?;
        }
        let data = if path.exists() {
            let mut file = File::open(&path)
                .with_context(|| format!("failed to open store file {:?}", path))?;
            let mut buf = String::new();
            file.read_to_string(&mut buf)?;
            let data: StoreData = serde_json::from_str(&buf)
                .with_context(|| format!("failed to decode store file {:?}", path))?;
            debug!(path = %path.display(), favorites = data.favorites.len(), "loaded library store");
            data
        } else {
            StoreData::default()
        };
        Ok(Self {
            path,
            inner: Mutex::new(data),
        })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(data)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp store file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

impl LibraryStore for FileLibraryStore {
    fn add_favorite(&self, id: DocumentId) -> Result<()> {
        let mut data = self.inner.lock();
        data.favorites.insert(id);
        self.persist(&data)
    }

    fn remove_favorite(&self, id: DocumentId) -> Result<()> {
        let mut data = self.inner.lock();
        data.favorites.remove(&id);
        self.persist(&data)
    }

    fn favorites(&self) -> Result<HashSet<DocumentId>> {
        Ok(self.inner.lock().favorites.iter().copied().collect())
    }

    fn add_recent(&self, path: &Path) -> Result<()> {
        let mut data = self.inner.lock();
        data.push_recent(path);
        self.persist(&data)
    }

    fn recent_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self.inner.lock().recent.clone())
    }

    fn clear_recent(&self) -> Result<()> {
        let mut data = self.inner.lock();
        data.recent.clear();
        self.persist(&data)
    }
}

fn default_debounce_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root of the read-only bundled store, one sub-directory per category.
    pub bundled_root: PathBuf,
    /// Root of the writable user-upload area, mirroring the category layout.
    pub user_root: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub search_debounce_ms: u64,
}

impl LibraryConfig {
    pub fn new(bundled_root: PathBuf, user_root: PathBuf) -> Self {
        Self {
            bundled_root,
            user_root,
            search_debounce_ms: default_debounce_ms(),
        }
    }

    /// Platform defaults under the app's local data directory.
    pub fn default_dirs() -> Result<Self> {
        let dirs = ProjectDirs::from("uz", "docshelf", "docshelf")
            .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
        let data = dirs.data_local_dir();
        Ok(Self::new(data.join("bundled"), data.join("user_files")))
    }

    /// Loads the TOML config at `path`, falling back to platform
    /// defaults when the file does not exist. A present but malformed
    /// file is an error rather than a silent fallback.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::default_dirs();
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config file {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn document_id_is_stable_for_same_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("sample.pdf");
        std::fs::write(&file_path, b"dummy").unwrap();

        let first = document_id_for_path(&file_path);
        let second = document_id_for_path(&file_path);

        assert_eq!(first, second);
    }

    #[test]
    fn document_ids_differ_for_distinct_paths() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        assert_ne!(document_id_for_path(&a), document_id_for_path(&b));
    }

    #[test]
    fn kind_is_derived_from_extension_case_insensitively() {
        assert_eq!(
            DocumentKind::from_file_name("intro.pdf"),
            Some(DocumentKind::Pdf)
        );
        assert_eq!(
            DocumentKind::from_file_name("topic2.PDF"),
            Some(DocumentKind::Pdf)
        );
        assert_eq!(
            DocumentKind::from_file_name("deck.PptX"),
            Some(DocumentKind::SlideDeck)
        );
        assert_eq!(
            DocumentKind::from_file_name("old.ppt"),
            Some(DocumentKind::LegacySlideDeck)
        );
        assert_eq!(DocumentKind::from_file_name("notes.txt"), None);
        assert_eq!(DocumentKind::from_file_name("noext"), None);
    }

    #[test]
    fn title_strips_only_the_final_extension() {
        assert_eq!(title_from_file_name("intro.pdf"), "intro");
        assert_eq!(title_from_file_name("archive.tar.pdf"), "archive.tar");
        assert_eq!(title_from_file_name("noext"), "noext");
        assert_eq!(title_from_file_name(".hidden"), ".hidden");
    }

    #[test]
    fn builtin_registry_keeps_registration_order() {
        let registry = CategoryRegistry::builtin();
        let ids: Vec<_> = registry.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            [
                "maruzalar",
                "adabiyotlar",
                "labaratoriya",
                "amaliy",
                "masalalar",
                "sillabus"
            ]
        );
        assert_eq!(registry.localized_name("maruzalar"), Some("Ma'ruzalar"));
        assert_eq!(registry.icon_ref("sillabus"), Some("ic_syllabus"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn recent_list_moves_to_front_dedupes_and_caps() {
        let store = MemoryLibraryStore::new();
        for i in 0..(RECENT_CAP + 5) {
            store.add_recent(Path::new(&format!("/docs/{i}.pdf"))).unwrap();
        }
        store.add_recent(Path::new("/docs/7.pdf")).unwrap();

        let recent = store.recent_paths().unwrap();
        assert_eq!(recent.len(), RECENT_CAP);
        assert_eq!(recent[0], PathBuf::from("/docs/7.pdf"));
        assert_eq!(recent.iter().filter(|p| **p == recent[0]).count(), 1);

        store.clear_recent().unwrap();
        assert!(store.recent_paths().unwrap().is_empty());
    }

    #[test]
    fn file_store_round_trips_across_reopen() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("library.json");
        let id = document_id_for_path(Path::new("/docs/intro.pdf"));

        {
            let store = FileLibraryStore::new(store_path.clone()).unwrap();
            store.add_favorite(id).unwrap();
            store.add_recent(Path::new("/docs/intro.pdf")).unwrap();
        }

        let store = FileLibraryStore::new(store_path).unwrap();
        assert!(store.is_favorite(id).unwrap());
        assert_eq!(
            store.recent_paths().unwrap(),
            vec![PathBuf::from("/docs/intro.pdf")]
        );

        store.remove_favorite(id).unwrap();
        assert!(!store.is_favorite(id).unwrap());
    }

    #[test]
    fn config_missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = LibraryConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.search_debounce_ms, 250);
    }

    #[test]
    fn config_parses_toml_with_defaulted_debounce() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("docshelf.toml");
        std::fs::write(
            &path,
            "bundled_root = \"/srv/bundled\"\nuser_root = \"/srv/user\"\n",
        )
        .unwrap();

        let config = LibraryConfig::load_or_default(&path).unwrap();
        assert_eq!(config.bundled_root, PathBuf::from("/srv/bundled"));
        assert_eq!(config.search_debounce_ms, 250);
    }

    #[test]
    fn size_formatting_is_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
