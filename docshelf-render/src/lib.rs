//! Rendering pipeline: turns an opened document into renderable pages
//! or slides depending on its kind.

use std::num::NonZeroUsize;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tracing::instrument;

use docshelf_core::{Document, DocumentKind};

pub mod slides;

#[cfg(feature = "pdf")]
mod pdfium;
#[cfg(feature = "pdf")]
pub use pdfium::PdfiumPageProvider;
pub use slides::{extract_slides, extract_slides_async, Slide};

/// Rasterized page pixels, RGBA8 row-major.
#[derive(Debug, Clone)]
pub struct PageBitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("page {index} out of range for a {page_count}-page document")]
    PageOutOfRange { index: usize, page_count: usize },
    #[error("failed to render page {index}")]
    Backend {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// An opened fixed-page-count document that can rasterize single pages.
/// Page height follows from the page's native aspect ratio at the
/// requested width.
pub trait PagedDocument: Send {
    fn page_count(&self) -> usize;
    fn render_page(&self, index: usize, target_width: u32) -> Result<PageBitmap>;
}

#[async_trait]
pub trait PagedDocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn PagedDocument>>;
}

/// Lazily rasterizes pages into a bounded LRU cache keyed by page
/// number. Capacity is `max(4, page_count)`, so small documents end up
/// fully cached. The cache and the underlying handle live for one
/// viewing session and are released on drop, whether or not any page
/// was ever requested.
pub struct PageRenderer {
    source: Box<dyn PagedDocument>,
    cache: LruCache<usize, PageBitmap>,
    target_width: u32,
}

impl PageRenderer {
    pub fn new(source: Box<dyn PagedDocument>, target_width: u32) -> Self {
        let capacity = NonZeroUsize::new(source.page_count().max(4))
            .expect("capacity has a nonzero floor");
        Self {
            source,
            cache: LruCache::new(capacity),
            target_width,
        }
    }

    pub fn page_count(&self) -> usize {
        self.source.page_count()
    }

    pub fn target_width(&self) -> u32 {
        self.target_width
    }

    #[cfg(test)]
    fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// Returns the rendered page, rasterizing on a cache miss.
    /// Rasterization is synchronous and may block for one page's
    /// duration; offload calls from an interactive thread.
    #[instrument(skip(self))]
    pub fn page(&mut self, index: usize) -> Result<PageBitmap, RenderError> {
        let page_count = self.source.page_count();
        if index >= page_count {
            return Err(RenderError::PageOutOfRange { index, page_count });
        }

        if let Some(hit) = self.cache.get(&index) {
            return Ok(hit.clone());
        }

        let bitmap = self
            .source
            .render_page(index, self.target_width)
            .map_err(|source| RenderError::Backend { index, source })?;
        self.cache.put(index, bitmap.clone());
        Ok(bitmap)
    }
}

/// What the presentation layer gets for an opened document. The match
/// on [`DocumentKind`] is exhaustive, so adding a kind forces a
/// decision here rather than silently dropping it.
pub enum DocumentView {
    Paged(PageRenderer),
    Slides(Vec<Slide>),
    /// Legacy slide decks have no in-app rendering; the presentation
    /// layer shows its placeholder.
    Unsupported,
}

pub async fn open_document(
    provider: &dyn PagedDocumentProvider,
    document: &Document,
    target_width: u32,
) -> Result<DocumentView> {
    match document.kind {
        DocumentKind::Pdf => {
            let source = provider.open(&document.source_path).await?;
            Ok(DocumentView::Paged(PageRenderer::new(source, target_width)))
        }
        DocumentKind::SlideDeck => Ok(DocumentView::Slides(
            extract_slides_async(document.source_path.clone()).await,
        )),
        DocumentKind::LegacySlideDeck => Ok(DocumentView::Unsupported),
    }
}
