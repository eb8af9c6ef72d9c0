use std::convert::TryFrom;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use markpage_core::{
    DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider, DocumentSource, PageSize,
    RenderImage, RenderRequest,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

/// Opens PDF sources through a shared Pdfium binding.
pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumRenderFactory {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_build_hint() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentBackend>> {
        let origin = match source {
            DocumentSource::Path(path) => Origin::File(
                path.canonicalize()
                    .with_context(|| format!("failed to resolve path for {:?}", path))?,
            ),
            DocumentSource::Memory { bytes, .. } => Origin::Bytes(Arc::clone(bytes)),
        };
        let document = PdfiumDocument::open(Arc::clone(&self.pdfium), origin, source)?;
        Ok(Arc::new(document))
    }
}

enum Origin {
    File(PathBuf),
    Bytes(Arc<Vec<u8>>),
}

/// One loaded PDF. The parsed document is kept open between renders.
struct PdfiumDocument {
    info: DocumentInfo,
    origin: Origin,
    // Declared before `pdfium` so it is dropped first.
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
}

impl PdfiumDocument {
    fn open(pdfium: Arc<Pdfium>, origin: Origin, source: &DocumentSource) -> Result<Self> {
        let mut this = Self {
            info: DocumentInfo {
                id: source.id(),
                label: source.label(),
                page_count: 0,
                metadata: DocumentMetadata::default(),
            },
            origin,
            document: Mutex::new(None),
            pdfium,
        };
        let (page_count, metadata) = this.with_document(|document| {
            let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
            let metadata = document.metadata();
            let tag = |kind| metadata.get(kind).map(|t| t.value().to_owned());
            Ok((
                page_count,
                DocumentMetadata {
                    title: tag(PdfDocumentMetadataTagType::Title),
                    author: tag(PdfDocumentMetadataTagType::Author),
                },
            ))
        })?;
        this.info.page_count = page_count;
        this.info.metadata = metadata;
        debug!(label = %this.info.label, page_count, "pdf loaded");
        Ok(this)
    }

    fn load(&self) -> Result<PdfDocument<'static>> {
        let document = match &self.origin {
            Origin::File(path) => self
                .pdfium
                .load_pdf_from_file(path, None)
                .with_context(|| format!("failed to open {:?}", path))?,
            Origin::Bytes(bytes) => self
                .pdfium
                .load_pdf_from_byte_vec(bytes.as_ref().clone(), None)
                .with_context(|| format!("failed to parse {}", self.info.label))?,
        };
        // SAFETY: the document borrows the bindings behind `self.pdfium`. It
        // is only ever stored in `self.document`, which drops before
        // `self.pdfium`, so the borrow never outlives the bindings.
        Ok(unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) })
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        let document = match guard.take() {
            Some(document) => document,
            None => self.load()?,
        };
        let result = f(&document);
        *guard = Some(document);
        result
    }
}

fn pdfium_index(page_index: usize) -> Result<PdfPageIndex> {
    PdfPageIndex::try_from(page_index)
        .map_err(|_| anyhow!("page {} is out of supported range", page_index + 1))
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        self.with_document(|document| {
            let page = document
                .pages()
                .get(pdfium_index(page_index)?)
                .with_context(|| format!("page {} out of range", page_index + 1))?;
            Ok(PageSize {
                width: page.width().value,
                height: page.height().value,
            })
        })
    }

    #[instrument(skip(self), fields(label = %self.info.label))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.with_document(|document| {
            let page = document
                .pages()
                .get(pdfium_index(request.page_index)?)
                .with_context(|| format!("page {} out of range", request.page_index + 1))?;
            let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", request.page_index + 1))?;
            let pixels = bitmap.as_image().to_rgba8().into_raw();
            Ok(RenderImage {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            })
        })
    }
}

fn bind_pdfium_from_build_hint() -> Option<Pdfium> {
    let path = option_env!("MARKPAGE_PDFIUM_LIBRARY_PATH").filter(|path| !path.is_empty())?;
    match Pdfium::bind_to_library(path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(path, %err, "failed to load bundled Pdfium");
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let local = Pdfium::pdfium_platform_library_name_at_path("./");
    let local_err = match Pdfium::bind_to_library(&local) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => err,
    };
    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|system_err| {
            anyhow!(
                "failed to bind to a Pdfium library ({}: {}; system: {})",
                local.display(),
                local_err,
                system_err
            )
        })
}
