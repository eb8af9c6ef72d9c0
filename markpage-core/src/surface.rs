//! The live bitmap for the active page and its drawing primitives.
//!
//! Everything drawn here is flattened into a single RGBA buffer: ink, text
//! and stamps are composited onto the page raster, and the eraser clears
//! pixels regardless of whether they came from ink or from the page.

use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgba, RgbaImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::glyph;
use crate::ledger::Stamp;
use crate::tool::{Brush, Color, ToolConfig};
use crate::RenderImage;

const ERASED: Rgba<u8> = Rgba([0, 0, 0, 0]);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Immutable capture of a surface. Clones share the pixel buffer.
#[derive(Debug, Clone)]
pub struct Snapshot(Arc<RgbaImage>);

impl Snapshot {
    pub fn new(image: RgbaImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn from_render(image: RenderImage) -> Option<Self> {
        image.into_rgba().map(Self::new)
    }

    pub fn image(&self) -> &RgbaImage {
        &self.0
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    /// Returns a copy resampled to `width`×`height`, or a cheap clone when
    /// the size already matches.
    pub fn resized(&self, width: u32, height: u32) -> Snapshot {
        if self.dimensions() == (width, height) {
            return self.clone();
        }
        Snapshot::new(imageops::resize(
            self.image(),
            width,
            height,
            FilterType::Triangle,
        ))
    }

    pub fn to_render_image(&self) -> RenderImage {
        RenderImage {
            width: self.width(),
            height: self.height(),
            pixels: self.0.as_raw().clone(),
        }
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.dimensions() == other.dimensions() && self.0.as_raw() == other.0.as_raw())
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveStroke {
    brush: Brush,
    last: Point,
    previous: Option<Point>,
}

pub struct DrawingSurface {
    canvas: RgbaImage,
    base: Snapshot,
    stroke: Option<ActiveStroke>,
}

impl DrawingSurface {
    /// A fresh surface showing the clean page raster.
    pub fn new(base: Snapshot) -> Self {
        Self {
            canvas: base.image().clone(),
            base,
            stroke: None,
        }
    }

    /// A surface showing previously committed content on top of `base`.
    ///
    /// `content_base` is the clean raster `content` was drawn over. Only the
    /// pixels where the two differ are carried over, resampled when the
    /// resolution changed, so the rest of the page shows the new raster.
    pub fn with_content(base: Snapshot, content: &Snapshot, content_base: &Snapshot) -> Self {
        let canvas = overlay_edits(&base, content, content_base);
        Self {
            canvas,
            base,
            stroke: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.canvas.width()
    }

    pub fn height(&self) -> u32 {
        self.canvas.height()
    }

    /// The clean page raster this surface was created from.
    pub fn base(&self) -> &Snapshot {
        &self.base
    }

    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    /// `true` while nothing on the surface differs from the clean raster.
    pub fn is_pristine(&self) -> bool {
        self.canvas.as_raw() == self.base.image().as_raw()
    }

    pub fn is_stroking(&self) -> bool {
        self.stroke.is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.canvas.clone())
    }

    pub fn restore(&mut self, snapshot: &Snapshot) {
        let (width, height) = self.canvas.dimensions();
        self.canvas = snapshot.resized(width, height).image().clone();
        self.stroke = None;
    }

    /// Starts a drag. Returns `false` for tools that do not draw by
    /// dragging, in which case the surface is untouched.
    pub fn begin_stroke(&mut self, point: Point, tools: &ToolConfig) -> bool {
        self.begin_brush(point, tools.brush())
    }

    /// Starts a drag with an already resolved brush.
    pub fn begin_brush(&mut self, point: Point, brush: Option<Brush>) -> bool {
        let Some(brush) = brush else {
            return false;
        };
        if let Brush::Erase { half_extent } = brush {
            self.erase_at(point, half_extent);
        }
        self.stroke = Some(ActiveStroke {
            brush,
            last: point,
            previous: None,
        });
        true
    }

    /// Continues the current drag; a no-op when no stroke is active.
    pub fn extend_stroke(&mut self, point: Point) {
        let Some(stroke) = self.stroke.as_mut() else {
            return;
        };
        let from = stroke.last;
        let previous = stroke.previous.map(|start| (start, from));
        stroke.previous = Some(from);
        stroke.last = point;
        match stroke.brush {
            Brush::Ink {
                color,
                width,
                alpha,
            } => draw_segment(&mut self.canvas, (from, point), previous, width, color, alpha),
            Brush::Erase { half_extent } => self.erase_at(point, half_extent),
        }
    }

    /// Finishes the drag and returns the snapshot to commit, or `None` if no
    /// stroke was in progress.
    pub fn end_stroke(&mut self) -> Option<Snapshot> {
        self.stroke.take().map(|_| self.snapshot())
    }

    /// Draws a stamp glyph centred on `point`.
    pub fn place_stamp(&mut self, point: Point, stamp: Stamp, tools: &ToolConfig) -> Snapshot {
        self.stroke = None;
        let cell = glyph::cell_size(tools.brush_size);
        match stamp {
            Stamp::Numeric(marks) => {
                let label = marks.to_string();
                let (width, height) = glyph::measure(&label, cell);
                let x = (point.x - width as f32 / 2.0).round() as i32;
                let y = (point.y - height as f32 / 2.0).round() as i32;
                glyph::draw_text(&mut self.canvas, x, y, &label, cell, tools.color);
            }
            Stamp::Tick => {
                let unit = (glyph::GLYPH_ROWS * cell) as f32 / 2.0;
                let width = cell as f32;
                let knee = Point::new(point.x - unit * 0.2, point.y + unit * 0.7);
                let start = Point::new(point.x - unit, point.y);
                let end = Point::new(point.x + unit, point.y - unit * 0.9);
                draw_segment(&mut self.canvas, (start, knee), None, width, tools.color, 1.0);
                draw_segment(&mut self.canvas, (knee, end), None, width, tools.color, 1.0);
            }
            Stamp::Cross => {
                let unit = (glyph::GLYPH_ROWS * cell) as f32 / 2.0;
                let width = cell as f32;
                let (x, y) = (point.x, point.y);
                draw_segment(
                    &mut self.canvas,
                    (Point::new(x - unit, y - unit), Point::new(x + unit, y + unit)),
                    None,
                    width,
                    tools.color,
                    1.0,
                );
                draw_segment(
                    &mut self.canvas,
                    (Point::new(x + unit, y - unit), Point::new(x - unit, y + unit)),
                    None,
                    width,
                    tools.color,
                    1.0,
                );
            }
        }
        self.snapshot()
    }

    /// Writes `text` with its top-left corner at `point`. Blank text draws
    /// nothing and returns `None`.
    pub fn insert_text(&mut self, point: Point, text: &str, tools: &ToolConfig) -> Option<Snapshot> {
        if text.trim().is_empty() {
            return None;
        }
        self.stroke = None;
        let cell = glyph::cell_size(tools.brush_size);
        glyph::draw_text(
            &mut self.canvas,
            point.x.round() as i32,
            point.y.round() as i32,
            text,
            cell,
            tools.color,
        );
        Some(self.snapshot())
    }

    /// Drops all ink and shows the clean page raster again.
    pub fn clear(&mut self) -> Snapshot {
        self.stroke = None;
        self.canvas = self.base.image().clone();
        self.snapshot()
    }

    fn erase_at(&mut self, point: Point, half_extent: u32) {
        let (width, height) = self.canvas.dimensions();
        let half_extent = half_extent.min(width.max(height));
        let side = half_extent * 2;
        if side == 0 {
            return;
        }
        let x = point.x.round() as i32 - half_extent as i32;
        let y = point.y.round() as i32 - half_extent as i32;
        draw_filled_rect_mut(&mut self.canvas, Rect::at(x, y).of_size(side, side), ERASED);
    }
}

/// Keeps the pixels where `content` departs from `content_base` and shows
/// `base` everywhere else.
fn overlay_edits(base: &Snapshot, content: &Snapshot, content_base: &Snapshot) -> RgbaImage {
    let (width, height) = base.dimensions();
    if content.dimensions() != content_base.dimensions() {
        // edits cannot be told apart from the page; keep everything
        return content.resized(width, height).image().clone();
    }

    let (content_w, content_h) = content.dimensions();
    let edited = GrayImage::from_fn(content_w, content_h, |x, y| {
        if content.image().get_pixel(x, y) == content_base.image().get_pixel(x, y) {
            Luma([0])
        } else {
            Luma([255])
        }
    });
    if edited.pixels().all(|mask| mask[0] == 0) {
        return base.image().clone();
    }

    let edited = if edited.dimensions() == (width, height) {
        edited
    } else {
        imageops::resize(&edited, width, height, FilterType::Triangle)
    };
    let edits = content.resized(width, height);
    let mut canvas = base.image().clone();
    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        if edited.get_pixel(x, y)[0] > 0 {
            *pixel = *edits.image().get_pixel(x, y);
        }
    }
    canvas
}

/// Paints the segment `from`→`to` with round caps, blending each covered
/// pixel once. Pixels already covered by `previous`, the segment drawn just
/// before in the same stroke, are skipped so translucent ink does not
/// darken at the joints. Non-adjacent segments that cross still overlap.
fn draw_segment(
    image: &mut RgbaImage,
    (from, to): (Point, Point),
    previous: Option<(Point, Point)>,
    width: f32,
    color: Color,
    alpha: f32,
) {
    let radius = (width / 2.0).max(0.5);
    let (img_w, img_h) = image.dimensions();
    if img_w == 0 || img_h == 0 {
        return;
    }

    let min_x = (from.x.min(to.x) - radius).floor().max(0.0) as u32;
    let min_y = (from.y.min(to.y) - radius).floor().max(0.0) as u32;
    let max_x = (from.x.max(to.x) + radius).ceil().min(img_w as f32 - 1.0);
    let max_y = (from.y.max(to.y) + radius).ceil().min(img_h as f32 - 1.0);
    if max_x < 0.0 || max_y < 0.0 {
        return;
    }
    let (max_x, max_y) = (max_x as u32, max_y as u32);

    let radius_sq = radius * radius;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let center = Point::new(x as f32 + 0.5, y as f32 + 0.5);
            if distance_sq_to_segment(center, from, to) > radius_sq {
                continue;
            }
            let covered = previous
                .is_some_and(|(a, b)| distance_sq_to_segment(center, a, b) <= radius_sq);
            if !covered {
                blend_pixel(image.get_pixel_mut(x, y), color, alpha);
            }
        }
    }
}

fn distance_sq_to_segment(p: Point, a: Point, b: Point) -> f32 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq <= f32::EPSILON {
        0.0
    } else {
        (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.x + t * dx, a.y + t * dy);
    (p.x - cx).powi(2) + (p.y - cy).powi(2)
}

fn blend_pixel(pixel: &mut Rgba<u8>, color: Color, alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    let dst_alpha = pixel[3] as f32 / 255.0;
    let out_alpha = alpha + dst_alpha * (1.0 - alpha);
    if out_alpha <= f32::EPSILON {
        *pixel = ERASED;
        return;
    }
    for (channel, src) in color.channels().into_iter().enumerate() {
        let dst = pixel[channel] as f32;
        let mixed = (src as f32 * alpha + dst * dst_alpha * (1.0 - alpha)) / out_alpha;
        pixel[channel] = mixed.round().clamp(0.0, 255.0) as u8;
    }
    pixel[3] = (out_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
}
