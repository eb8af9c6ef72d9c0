use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::RgbaImage;
use markpage_core::{
    DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider, DocumentSource, PageSize,
    RenderImage, RenderRequest,
};
use tracing::debug;

/// Treats a PNG or JPEG scan as a one-page document. One pixel of the
/// source is one point at scale 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageProvider;

#[async_trait]
impl DocumentProvider for ImageProvider {
    async fn open(&self, source: &DocumentSource) -> Result<Arc<dyn DocumentBackend>> {
        let source = source.clone();
        let page = tokio::task::spawn_blocking(move || decode(&source).map(|image| (source, image)))
            .await
            .context("image decoder task failed")??;
        let (source, image) = page;
        debug!(label = %source.label(), width = image.width(), height = image.height(), "image loaded");
        Ok(Arc::new(ImageDocument {
            info: DocumentInfo {
                id: source.id(),
                label: source.label(),
                page_count: 1,
                metadata: DocumentMetadata::default(),
            },
            image,
        }))
    }
}

fn decode(source: &DocumentSource) -> Result<RgbaImage> {
    let image = match source {
        DocumentSource::Path(path) => {
            image::open(path).with_context(|| format!("failed to decode {:?}", path))?
        }
        DocumentSource::Memory { label, bytes } => image::load_from_memory(bytes)
            .with_context(|| format!("failed to decode {label}"))?,
    };
    Ok(image.to_rgba8())
}

struct ImageDocument {
    info: DocumentInfo,
    image: RgbaImage,
}

impl ImageDocument {
    fn check_page(&self, page_index: usize) -> Result<()> {
        anyhow::ensure!(page_index == 0, "page {} out of range", page_index + 1);
        Ok(())
    }
}

impl DocumentBackend for ImageDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn page_size(&self, page_index: usize) -> Result<PageSize> {
        self.check_page(page_index)?;
        Ok(PageSize {
            width: self.image.width() as f32,
            height: self.image.height() as f32,
        })
    }

    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        let (width, height) = self.page_size(request.page_index)?.scaled(request.scale);
        let pixels = if (width, height) == self.image.dimensions() {
            self.image.as_raw().clone()
        } else {
            imageops::resize(&self.image, width, height, FilterType::Triangle).into_raw()
        };
        Ok(RenderImage {
            width,
            height,
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([200, 200, 200, 255]));
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[tokio::test]
    async fn opens_a_scan_as_a_single_page() {
        let source = DocumentSource::Memory {
            label: "scan.png".to_string(),
            bytes: Arc::new(png_bytes(40, 60)),
        };
        let backend = ImageProvider.open(&source).await.unwrap();
        assert_eq!(backend.info().page_count, 1);
        assert_eq!(
            backend.page_size(0).unwrap(),
            PageSize {
                width: 40.0,
                height: 60.0
            }
        );
        let render = backend
            .render_page(RenderRequest {
                page_index: 0,
                scale: 1.5,
            })
            .unwrap();
        assert_eq!((render.width, render.height), (60, 90));
        assert_eq!(render.pixels.len(), 60 * 90 * 4);
        assert!(backend.page_size(1).is_err());
    }

    #[tokio::test]
    async fn garbage_bytes_fail_to_open() {
        let source = DocumentSource::Memory {
            label: "broken.png".to_string(),
            bytes: Arc::new(vec![1, 2, 3]),
        };
        assert!(ImageProvider.open(&source).await.is_err());
    }
}
