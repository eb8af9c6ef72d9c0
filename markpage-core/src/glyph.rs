//! Built-in 3×5 bitmap font used for stamps and free text.
//!
//! Each glyph row is a 3-bit mask, most significant bit on the left. A font
//! pixel is drawn as a `cell`×`cell` square, so a glyph covers `3 * cell` by
//! `5 * cell` device pixels with one cell of spacing between characters.

use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use crate::tool::{clamp_brush_size, Color};

pub const GLYPH_COLUMNS: u32 = 3;
pub const GLYPH_ROWS: u32 = 5;

pub fn glyph_rows(c: char) -> [u8; 5] {
    match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        ',' => [0b000, 0b000, 0b000, 0b010, 0b100],
        ':' => [0b000, 0b010, 0b000, 0b010, 0b000],
        '-' => [0b000, 0b000, 0b111, 0b000, 0b000],
        '+' => [0b000, 0b010, 0b111, 0b010, 0b000],
        '/' => [0b001, 0b001, 0b010, 0b100, 0b100],
        '=' => [0b000, 0b111, 0b000, 0b111, 0b000],
        '(' => [0b010, 0b100, 0b100, 0b100, 0b010],
        ')' => [0b010, 0b001, 0b001, 0b001, 0b010],
        '!' => [0b010, 0b010, 0b010, 0b000, 0b010],
        '?' => [0b111, 0b001, 0b010, 0b000, 0b010],
        '\'' | '"' => [0b010, 0b010, 0b000, 0b000, 0b000],
        'a' | 'A' => [0b010, 0b101, 0b111, 0b101, 0b101],
        'b' | 'B' => [0b110, 0b101, 0b110, 0b101, 0b110],
        'c' | 'C' => [0b011, 0b100, 0b100, 0b100, 0b011],
        'd' | 'D' => [0b110, 0b101, 0b101, 0b101, 0b110],
        'e' | 'E' => [0b111, 0b100, 0b110, 0b100, 0b111],
        'f' | 'F' => [0b111, 0b100, 0b110, 0b100, 0b100],
        'g' | 'G' => [0b011, 0b100, 0b101, 0b101, 0b011],
        'h' | 'H' => [0b101, 0b101, 0b111, 0b101, 0b101],
        'i' | 'I' => [0b111, 0b010, 0b010, 0b010, 0b111],
        'j' | 'J' => [0b001, 0b001, 0b001, 0b101, 0b010],
        'k' | 'K' => [0b101, 0b101, 0b110, 0b101, 0b101],
        'l' | 'L' => [0b100, 0b100, 0b100, 0b100, 0b111],
        'm' | 'M' => [0b101, 0b111, 0b101, 0b101, 0b101],
        'n' | 'N' => [0b101, 0b111, 0b111, 0b101, 0b101],
        'o' | 'O' => [0b010, 0b101, 0b101, 0b101, 0b010],
        'p' | 'P' => [0b110, 0b101, 0b110, 0b100, 0b100],
        'q' | 'Q' => [0b010, 0b101, 0b101, 0b111, 0b011],
        'r' | 'R' => [0b110, 0b101, 0b110, 0b101, 0b101],
        's' | 'S' => [0b011, 0b100, 0b010, 0b001, 0b110],
        't' | 'T' => [0b111, 0b010, 0b010, 0b010, 0b010],
        'u' | 'U' => [0b101, 0b101, 0b101, 0b101, 0b111],
        'v' | 'V' => [0b101, 0b101, 0b101, 0b101, 0b010],
        'w' | 'W' => [0b101, 0b101, 0b101, 0b111, 0b101],
        'x' | 'X' => [0b101, 0b101, 0b010, 0b101, 0b101],
        'y' | 'Y' => [0b101, 0b101, 0b010, 0b010, 0b010],
        'z' | 'Z' => [0b111, 0b001, 0b010, 0b100, 0b111],
        _ => [0b000; 5],
    }
}

/// Device-pixel size of one font pixel for a given brush size.
pub fn cell_size(brush_size: u32) -> u32 {
    (clamp_brush_size(brush_size) * 2).max(3)
}

/// Width and height, in device pixels, of `text` laid out on one line.
pub fn measure(text: &str, cell: u32) -> (u32, u32) {
    let count = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    if count == 0 {
        return (0, 0);
    }
    let advance = (GLYPH_COLUMNS + 1).saturating_mul(cell);
    (
        count.saturating_mul(advance).saturating_sub(cell),
        GLYPH_ROWS.saturating_mul(cell),
    )
}

/// Draws `text` with its top-left corner at `(x, y)`. Pixels falling
/// outside the image are clipped.
pub fn draw_text(image: &mut RgbaImage, x: i32, y: i32, text: &str, cell: u32, color: Color) {
    if cell == 0 {
        return;
    }
    let [r, g, b] = color.channels();
    let paint = Rgba([r, g, b, 255]);
    let Ok(cell_i) = i32::try_from(cell) else {
        return;
    };
    let advance = cell_i.saturating_mul(GLYPH_COLUMNS as i32 + 1);
    let right_edge = i32::try_from(image.width()).unwrap_or(i32::MAX);

    for (index, c) in text.chars().enumerate() {
        let offset = i32::try_from(index).map_or(i32::MAX, |i| i.saturating_mul(advance));
        let origin_x = x.saturating_add(offset);
        if origin_x >= right_edge {
            break;
        }
        for (row_idx, row) in glyph_rows(c).iter().enumerate() {
            for col in 0..GLYPH_COLUMNS {
                if (row >> (GLYPH_COLUMNS - 1 - col)) & 1 == 0 {
                    continue;
                }
                let px = origin_x.saturating_add((col as i32).saturating_mul(cell_i));
                let py = y.saturating_add((row_idx as i32).saturating_mul(cell_i));
                draw_filled_rect_mut(image, Rect::at(px, py).of_size(cell, cell), paint);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_folds_to_uppercase() {
        assert_eq!(glyph_rows('k'), glyph_rows('K'));
        assert_eq!(glyph_rows('§'), [0; 5]);
    }

    #[test]
    fn measure_accounts_for_spacing() {
        assert_eq!(measure("7.5", 2), (22, 10));
        assert_eq!(measure("", 2), (0, 0));
    }

    #[test]
    fn draw_text_paints_only_glyph_cells() {
        let mut image = RgbaImage::from_pixel(8, 10, Rgba([255, 255, 255, 255]));
        draw_text(&mut image, 0, 0, "1", 2, Color::BLACK);

        // top row of '1' is 0b010: only the middle cell is inked
        assert_eq!(image.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
        assert_eq!(image.get_pixel(2, 0), &Rgba([0, 0, 0, 255]));
        assert_eq!(image.get_pixel(3, 1), &Rgba([0, 0, 0, 255]));
        assert_eq!(image.get_pixel(4, 0), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn huge_cells_and_long_text_do_not_overflow() {
        assert_eq!(cell_size(u32::MAX), 1024);
        assert_eq!(measure("88", u32::MAX).1, u32::MAX);
        let mut image = RgbaImage::from_pixel(6, 6, Rgba([255, 255, 255, 255]));
        draw_text(&mut image, 0, 0, &"8".repeat(10_000), 1024, Color::BLACK);
        assert_eq!(image.get_pixel(5, 5), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn draw_text_clips_at_edges() {
        let mut image = RgbaImage::from_pixel(4, 4, Rgba([255, 255, 255, 255]));
        draw_text(&mut image, -3, -3, "88", 3, Color::BLACK);
        draw_text(&mut image, 100, 100, "88", 3, Color::BLACK);
    }
}
