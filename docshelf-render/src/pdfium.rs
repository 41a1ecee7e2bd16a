use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::warn;

use crate::{PageBitmap, PagedDocument, PagedDocumentProvider};

/// Opens PDF files through a shared Pdfium binding.
pub struct PdfiumPageProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumPageProvider {
    pub fn new() -> Result<Self> {
        let pdfium = bind_pdfium()?;
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl PagedDocumentProvider for PdfiumPageProvider {
    async fn open(&self, path: &Path) -> Result<Box<dyn PagedDocument>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let page_count = {
            let document = self
                .pdfium
                .load_pdf_from_file(&absolute, None)
                .with_context(|| format!("failed to open {:?}", absolute))?;
            usize::try_from(document.pages().len()).unwrap_or_default()
        };
        Ok(Box::new(PdfiumPagedDocument {
            pdfium: Arc::clone(&self.pdfium),
            path: absolute,
            page_count,
            document: Mutex::new(None),
        }))
    }
}

struct PdfiumPagedDocument {
    // document must be declared before pdfium: fields drop in
    // declaration order and the cached document borrows the bindings.
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
    path: PathBuf,
    page_count: usize,
}

impl PdfiumPagedDocument {
    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the returned PdfDocument borrows from the Pdfium
        // bindings kept alive by self.pdfium. It is stored in
        // self.document, which is declared before pdfium and therefore
        // drops first, so the borrow never outlives the bindings.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        if guard.is_none() {
            let document = self.open_document()?;
            *guard = Some(document);
        }
        let document = guard.as_ref().expect("document must be loaded");
        f(document)
    }
}

impl PagedDocument for PdfiumPagedDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn render_page(&self, index: usize, target_width: u32) -> Result<PageBitmap> {
        self.with_document(|document| {
            let page_index: PdfPageIndex = index
                .try_into()
                .map_err(|_| anyhow!("page {} is out of supported range", index))?;
            let page = document
                .pages()
                .get(page_index)
                .with_context(|| format!("page {} out of range", index))?;

            let page_width = page.width().value;
            if page_width <= 0.0 {
                return Err(anyhow!("page {} has no width", index));
            }
            let scale = (target_width as f32 / page_width).max(0.01);
            let config = PdfRenderConfig::new().scale_page_by_factor(scale);
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", index))?;
            let image = bitmap.as_image().to_rgba8();
            let pixels = image.into_raw();

            Ok(PageBitmap {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            })
        })
    }
}

fn bind_pdfium() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            warn!("no pdfium library could be bound");
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
