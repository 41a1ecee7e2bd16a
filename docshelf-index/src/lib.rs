use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use docshelf_core::{
    document_id_for_path, title_from_file_name, CategoryRegistry, Document, DocumentId,
    DocumentKind, DocumentOrigin, LibraryConfig, LibraryStore,
};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unknown category {0:?}")]
    UnknownCategory(String),
    #[error("unsupported file extension for {0:?}")]
    UnsupportedExtension(String),
    #[error("a file named {0:?} already exists in this category")]
    DuplicateName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One cache slot per category. Population of a slot is serialized by
/// its own mutex so concurrent first requests for the same category
/// trigger a single scan, while distinct categories never contend.
#[derive(Default)]
struct CategorySlot {
    entries: Mutex<Option<Vec<Document>>>,
}

/// Discovers documents from the bundled store and the user-upload area,
/// assigns stable identities and serves cached per-category listings,
/// whole-library views and substring search.
///
/// The cache lives for the process lifetime and is invalidated per
/// category after a successful delete or import, never globally.
pub struct DocumentIndex {
    registry: CategoryRegistry,
    bundled_root: PathBuf,
    user_root: PathBuf,
    store: Arc<dyn LibraryStore>,
    slots: Mutex<HashMap<String, Arc<CategorySlot>>>,
}

impl DocumentIndex {
    pub fn new(
        registry: CategoryRegistry,
        bundled_root: PathBuf,
        user_root: PathBuf,
        store: Arc<dyn LibraryStore>,
    ) -> Self {
        Self {
            registry,
            bundled_root,
            user_root,
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(
        registry: CategoryRegistry,
        config: &LibraryConfig,
        store: Arc<dyn LibraryStore>,
    ) -> Self {
        Self::new(
            registry,
            config.bundled_root.clone(),
            config.user_root.clone(),
            store,
        )
    }

    pub fn registry(&self) -> &CategoryRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn LibraryStore> {
        &self.store
    }

    fn slot(&self, category_id: &str) -> Arc<CategorySlot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(category_id.to_string()).or_default())
    }

    fn invalidate_category(&self, category_id: &str) {
        let slot = self.slot(category_id);
        *slot.entries.lock() = None;
        debug!(category = category_id, "category cache invalidated");
    }

    /// Cached, title-sorted listing of one category. Unknown categories
    /// and unreadable storage degrade to an empty listing.
    #[instrument(skip(self))]
    pub fn list_category(&self, category_id: &str) -> Vec<Document> {
        let Some(category) = self.registry.get(category_id) else {
            return Vec::new();
        };

        let slot = self.slot(category_id);
        let mut guard = slot.entries.lock();
        if guard.is_none() {
            let mut documents = self.scan_origin(
                &self.bundled_root.join(&category.storage_subpath),
                category_id,
                DocumentOrigin::Bundled,
            );
            documents.extend(self.scan_origin(
                &self.user_root.join(&category.storage_subpath),
                category_id,
                DocumentOrigin::UserUploaded,
            ));
            documents.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()));
            *guard = Some(documents);
        }
        let documents = guard.as_ref().expect("slot must be populated").clone();
        drop(guard);

        self.decorate_favorites(documents)
    }

    /// Enumerates one origin directory. The two origins are independent
    /// failure domains: an unreadable directory yields zero documents
    /// from that origin and never aborts the whole listing.
    fn scan_origin(
        &self,
        dir: &Path,
        category_id: &str,
        origin: DocumentOrigin,
    ) -> Vec<Document> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                if origin == DocumentOrigin::Bundled || dir.exists() {
                    warn!(?err, dir = %dir.display(), "failed to read origin directory");
                }
                return Vec::new();
            }
        };

        let mut documents = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(?err, dir = %dir.display(), "failed to read directory entry");
                    continue;
                }
            };
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(kind) = DocumentKind::from_file_name(file_name) else {
                continue;
            };

            let path = entry.path();
            let size_bytes = match origin {
                DocumentOrigin::UserUploaded => entry.metadata().ok().map(|m| m.len()),
                DocumentOrigin::Bundled => None,
            };
            documents.push(Document {
                id: document_id_for_path(&path),
                title: title_from_file_name(file_name),
                source_path: path,
                category_id: category_id.to_string(),
                kind,
                origin,
                size_bytes,
                is_favorite: false,
            });
        }
        documents
    }

    fn decorate_favorites(&self, mut documents: Vec<Document>) -> Vec<Document> {
        let favorites = self.store.favorites().unwrap_or_else(|err| {
            warn!(?err, "failed to load favorites");
            HashSet::new()
        });
        for doc in &mut documents {
            doc.is_favorite = favorites.contains(&doc.id);
        }
        documents
    }

    /// Every document in the library, in registry order, each category
    /// sorted by title.
    pub fn list_all(&self) -> Vec<Document> {
        let ids: Vec<String> = self.registry.iter().map(|c| c.id.clone()).collect();
        ids.iter()
            .flat_map(|id| self.list_category(id))
            .collect()
    }

    /// Case-insensitive substring match against titles. A blank query
    /// matches nothing.
    #[instrument(skip(self))]
    pub fn search(&self, query: &str) -> Vec<Document> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        self.list_all()
            .into_iter()
            .filter(|doc| doc.title.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn find_by_id(&self, id: DocumentId) -> Option<Document> {
        self.list_all().into_iter().find(|doc| doc.id == id)
    }

    pub fn find_by_ids(&self, ids: &HashSet<DocumentId>) -> Vec<Document> {
        self.list_all()
            .into_iter()
            .filter(|doc| ids.contains(&doc.id))
            .collect()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<Document> {
        self.list_all()
            .into_iter()
            .find(|doc| doc.source_path == path)
    }

    /// Resolves paths back to live documents, preserving the input
    /// order and silently skipping paths no longer present.
    pub fn find_by_paths(&self, paths: &[PathBuf]) -> Vec<Document> {
        let all = self.list_all();
        paths
            .iter()
            .filter_map(|path| all.iter().find(|doc| &doc.source_path == path).cloned())
            .collect()
    }

    /// The persisted favorites set resolved to live documents.
    pub fn favorite_documents(&self) -> Vec<Document> {
        let favorites = self.store.favorites().unwrap_or_else(|err| {
            warn!(?err, "failed to load favorites");
            HashSet::new()
        });
        self.find_by_ids(&favorites)
    }

    /// The persisted recent-file list resolved to live documents;
    /// deleted files drop out of the result.
    pub fn recent_documents(&self) -> Vec<Document> {
        let recent = self.store.recent_paths().unwrap_or_else(|err| {
            warn!(?err, "failed to load recent files");
            Vec::new()
        });
        self.find_by_paths(&recent)
    }

    /// Records a document in the recent-file list; call when a viewer
    /// opens it.
    pub fn mark_opened(&self, document: &Document) {
        if let Err(err) = self.store.add_recent(&document.source_path) {
            warn!(?err, "failed to record recent file");
        }
    }

    /// Deletes a user-uploaded file and invalidates its category.
    /// Bundled documents are never deletable; the call fails with no
    /// side effect.
    #[instrument(skip(self, document), fields(title = %document.title))]
    pub fn delete_user_document(&self, document: &Document) -> bool {
        if document.origin == DocumentOrigin::Bundled {
            warn!("refusing to delete a bundled document");
            return false;
        }
        match fs::remove_file(&document.source_path) {
            Ok(()) => {
                self.invalidate_category(&document.category_id);
                true
            }
            Err(err) => {
                warn!(?err, path = %document.source_path.display(), "failed to delete file");
                false
            }
        }
    }

    /// Copies a user-supplied file into the category's upload area.
    /// Validation is by extension only; duplicate basenames within the
    /// category's user area are rejected before anything is written.
    #[instrument(skip(self, source), fields(source = %source.display()))]
    pub fn import_user_document(
        &self,
        category_id: &str,
        source: &Path,
    ) -> Result<Document, ImportError> {
        let category = self
            .registry
            .get(category_id)
            .ok_or_else(|| ImportError::UnknownCategory(category_id.to_string()))?;

        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ImportError::UnsupportedExtension(source.display().to_string()))?
            .to_string();
        let kind = DocumentKind::from_file_name(&file_name)
            .ok_or_else(|| ImportError::UnsupportedExtension(file_name.clone()))?;

        let dest_dir = self.user_root.join(&category.storage_subpath);
        fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(&file_name);
        if dest.exists() {
            return Err(ImportError::DuplicateName(file_name));
        }

        let size_bytes = fs::copy(source, &dest)?;
        self.invalidate_category(category_id);
        debug!(dest = %dest.display(), "imported user document");

        Ok(Document {
            id: document_id_for_path(&dest),
            title: title_from_file_name(&file_name),
            source_path: dest,
            category_id: category_id.to_string(),
            kind,
            origin: DocumentOrigin::UserUploaded,
            size_bytes: Some(size_bytes),
            is_favorite: false,
        })
    }
}

/// Display state updates emitted by the [`SearchCoordinator`].
#[derive(Debug, Clone)]
pub enum SearchUpdate {
    /// No query; the caller shows its initial state.
    Idle,
    Results {
        query: String,
        documents: Vec<Document>,
    },
}

/// Debounces raw query-text edits and discards superseded results.
///
/// Every edit bumps a monotonic token. A scheduled search sleeps out
/// the debounce window, then re-checks the token before scanning and
/// again before delivering, so a rapid typist never sees results for an
/// intermediate query. Cancellation is cooperative: an in-flight scan
/// may finish, but its result is dropped if stale.
pub struct SearchCoordinator {
    index: Arc<DocumentIndex>,
    debounce: Duration,
    token: Arc<AtomicU64>,
    updates: mpsc::UnboundedSender<SearchUpdate>,
}

impl SearchCoordinator {
    pub fn new(
        index: Arc<DocumentIndex>,
        debounce: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SearchUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        (
            Self {
                index,
                debounce,
                token: Arc::new(AtomicU64::new(0)),
                updates,
            },
            rx,
        )
    }

    /// Feed one raw query-text change event. Must be called from within
    /// a tokio runtime.
    pub fn query_changed(&self, text: &str) {
        let trimmed = text.trim().to_string();
        let token = self.token.fetch_add(1, Ordering::SeqCst) + 1;

        if trimmed.is_empty() {
            let _ = self.updates.send(SearchUpdate::Idle);
            return;
        }

        let index = Arc::clone(&self.index);
        let current = Arc::clone(&self.token);
        let updates = self.updates.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if current.load(Ordering::SeqCst) != token {
                return;
            }

            let query = trimmed.clone();
            let documents = tokio::task::spawn_blocking(move || index.search(&query))
                .await
                .unwrap_or_else(|err| {
                    warn!(?err, "search task failed");
                    Vec::new()
                });

            if current.load(Ordering::SeqCst) != token {
                return;
            }
            let _ = updates.send(SearchUpdate::Results {
                query: trimmed,
                documents,
            });
        });
    }
}
