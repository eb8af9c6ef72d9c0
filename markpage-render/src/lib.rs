//! Document backends for the annotation engine: Pdfium for PDFs and the
//! `image` decoders for single-page scans.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use markpage_core::{DocumentBackend, DocumentProvider, DocumentSource};
use tracing::debug;

mod bitmap;
#[cfg(feature = "pdf")]
mod pdfium;

pub use bitmap::ImageProvider;
#[cfg(feature = "pdf")]
pub use pdfium::PdfiumRenderFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Image,
}

impl SourceKind {
    /// Sniffs in-memory bytes by magic number and paths by extension.
    pub fn detect(source: &DocumentSource) -> Self {
        match source {
            DocumentSource::Memory { bytes, .. } if bytes.starts_with(b"%PDF") => SourceKind::Pdf,
            DocumentSource::Memory { .. } => SourceKind::Image,
            DocumentSource::Path(path) => Self::from_path(path),
        }
    }

    fn from_path(path: &Path) -> Self {
        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if is_pdf {
            SourceKind::Pdf
        } else {
            SourceKind::Image
        }
    }
}

/// Routes each source to the backend that understands it. Pdfium is bound
/// lazily so image-only sessions work without the library installed.
#[derive(Default)]
pub struct AutoProvider {
    #[cfg(feature = "pdf")]
    pdf: once_cell::sync::OnceCell<PdfiumRenderFactory>,
    images: ImageProvider,
}

impl AutoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "pdf")]
    fn pdf(&self) -> Result<&PdfiumRenderFactory> {
        self.pdf.get_or_try_init(PdfiumRenderFactory::new)
    }
}

#[async_trait]
impl DocumentProvider for AutoProvider {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentBackend>> {
        let kind = SourceKind::detect(source);
        debug!(?kind, label = %source.label(), "selecting document backend");
        match kind {
            #[cfg(feature = "pdf")]
            SourceKind::Pdf => self.pdf()?.open(source).await,
            #[cfg(not(feature = "pdf"))]
            SourceKind::Pdf => Err(anyhow::anyhow!(
                "{} is a PDF but PDF support was not compiled in",
                source.label()
            )),
            SourceKind::Image => self.images.open(source).await,
        }
    }
}
