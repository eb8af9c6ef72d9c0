//! Reassembly of annotated pages into one multi-page PDF.
//!
//! Pages are laid out on a fixed geometry: the page width comes from the
//! options and the height from the first page's aspect ratio. Pages with a
//! different aspect are stretched to that geometry rather than fitted.

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};
use printpdf::{
    Mm, Op, PdfDocument, PdfPage, PdfSaveOptions, PdfWarnMsg, Pt, RawImage, RawImageData,
    RawImageFormat, XObjectTransform,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::surface::Snapshot;

/// Bitmaps are placed at 72 dpi so one pixel maps to one point before
/// scaling to the page box.
const PLACEMENT_DPI: f32 = 72.0;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("page {page} is unavailable for export: {reason}")]
    PageUnavailable { page: usize, reason: String },
    #[error("nothing to export: the document has no pages")]
    NoPages,
    #[error("failed to encode page bitmap: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub title: String,
    pub page_width_mm: f32,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            title: "Annotated document".to_string(),
            page_width_mm: 210.0,
        }
    }
}

/// One exported page, numbered from 1.
#[derive(Debug, Clone, PartialEq)]
pub struct PageImage {
    pub page: usize,
    pub image: Snapshot,
}

/// Builds a PDF with one page per image, in the given order.
#[instrument(skip(pages, options), fields(pages = pages.len()))]
pub fn assemble_pdf(pages: &[PageImage], options: &ExportOptions) -> Result<Vec<u8>, ExportError> {
    let first = pages.first().ok_or(ExportError::NoPages)?;
    let (page_w, page_h) = page_geometry(first.image.dimensions(), options.page_width_mm);
    let page_w_pt = page_w.into_pt().0;
    let page_h_pt = page_h.into_pt().0;

    info!(
        title = %options.title,
        width_mm = page_w.0,
        height_mm = page_h.0,
        "assembling multi-page document"
    );

    let flattened: Vec<RawImage> = pages
        .par_iter()
        .map(|page| {
            let (width, height) = page.image.dimensions();
            RawImage {
                pixels: RawImageData::U8(flatten_on_white(page.image.image())),
                width: width as usize,
                height: height as usize,
                data_format: RawImageFormat::RGB8,
                tag: Vec::new(),
            }
        })
        .collect();

    let mut doc = PdfDocument::new(&options.title);
    let mut pdf_pages = Vec::with_capacity(flattened.len());
    for raw in &flattened {
        let xobject_id = doc.add_image(raw);
        let scale_x = page_w_pt / raw.width.max(1) as f32;
        let scale_y = page_h_pt / raw.height.max(1) as f32;
        let ops = vec![Op::UseXobject {
            id: xobject_id,
            transform: XObjectTransform {
                translate_x: Some(Pt(0.0)),
                translate_y: Some(Pt(0.0)),
                scale_x: Some(scale_x),
                scale_y: Some(scale_y),
                dpi: Some(PLACEMENT_DPI),
                rotate: None,
            },
        }];
        pdf_pages.push(PdfPage::new(page_w, page_h, ops));
    }
    doc.with_pages(pdf_pages);

    let mut warnings: Vec<PdfWarnMsg> = Vec::new();
    let output = doc.save(&PdfSaveOptions::default(), &mut warnings);
    debug!(
        bytes = output.len(),
        warnings = warnings.len(),
        "document assembled"
    );
    Ok(output)
}

/// Encodes a single page bitmap as PNG.
pub fn encode_png(snapshot: &Snapshot) -> Result<Vec<u8>, ExportError> {
    let mut buffer = Cursor::new(Vec::new());
    snapshot.image().write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

fn page_geometry((width, height): (u32, u32), page_width_mm: f32) -> (Mm, Mm) {
    let page_width_mm = if page_width_mm.is_finite() && page_width_mm > 0.0 {
        page_width_mm
    } else {
        ExportOptions::default().page_width_mm
    };
    let aspect = height.max(1) as f32 / width.max(1) as f32;
    (Mm(page_width_mm), Mm(page_width_mm * aspect))
}

/// Drops the alpha channel, compositing erased (transparent) pixels onto
/// white paper.
fn flatten_on_white(image: &RgbaImage) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((image.width() * image.height() * 3) as usize);
    for pixel in image.pixels() {
        let alpha = pixel[3] as u32;
        for channel in 0..3 {
            let value = (pixel[channel] as u32 * alpha + 255 * (255 - alpha) + 127) / 255;
            rgb.push(value as u8);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn page(number: usize, width: u32, height: u32) -> PageImage {
        PageImage {
            page: number,
            image: Snapshot::new(RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]))),
        }
    }

    #[test]
    fn empty_export_is_an_error() {
        assert!(matches!(
            assemble_pdf(&[], &ExportOptions::default()),
            Err(ExportError::NoPages)
        ));
    }

    #[test]
    fn assembles_a_pdf_document() {
        let pages = vec![page(1, 20, 30), page(2, 30, 20)];
        let bytes = assemble_pdf(&pages, &ExportOptions::default()).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn geometry_follows_first_page_aspect() {
        let (w, h) = page_geometry((100, 200), 210.0);
        assert_eq!(w.0, 210.0);
        assert_eq!(h.0, 420.0);
        let (fallback, _) = page_geometry((100, 100), -1.0);
        assert_eq!(fallback.0, 210.0);
    }

    #[test]
    fn transparent_pixels_flatten_to_white() {
        let mut image = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 0, 0]));
        image.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        assert_eq!(flatten_on_white(&image), vec![255, 255, 255, 0, 0, 0]);
    }

    #[test]
    fn png_encoding_has_signature() {
        let bytes = encode_png(&page(1, 3, 3).image).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
