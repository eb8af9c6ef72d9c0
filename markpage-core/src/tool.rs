use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Highlighter ink is laid down at this opacity so the page stays readable.
pub const HIGHLIGHTER_OPACITY: f32 = 0.3;
/// Highlighter strokes are this many times wider than the brush size.
pub const HIGHLIGHTER_WIDTH_FACTOR: u32 = 3;
/// Largest brush size accepted from scripts, preferences or callers.
pub const MAX_BRUSH_SIZE: u32 = 512;

pub fn clamp_brush_size(size: u32) -> u32 {
    size.clamp(1, MAX_BRUSH_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    #[default]
    Pen,
    Highlighter,
    Eraser,
    Text,
    Stamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const RED: Color = Color::rgb(220, 30, 30);
    pub const WHITE: Color = Color::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn channels(&self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(format!("expected a #rrggbb color, got {:?}", s));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16)
                .map_err(|_| format!("expected a #rrggbb color, got {:?}", s))
        };
        Ok(Color::rgb(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl TryFrom<String> for Color {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.to_string()
    }
}

/// Session-wide tool selection. Passed explicitly into every drawing call so
/// the surface never reads ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tool: Tool,
    pub color: Color,
    pub brush_size: u32,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            tool: Tool::Pen,
            color: Color::RED,
            brush_size: 2,
        }
    }
}

/// How a pointer drag affects the surface for a given tool selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Brush {
    Ink { color: Color, width: f32, alpha: f32 },
    Erase { half_extent: u32 },
}

impl ToolConfig {
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tool = tool;
        self
    }

    /// The same selection with the brush size forced into `1..=MAX_BRUSH_SIZE`.
    pub fn clamped(mut self) -> Self {
        self.brush_size = clamp_brush_size(self.brush_size);
        self
    }

    /// `None` for tools that do not draw by dragging (text and stamps).
    pub fn brush(&self) -> Option<Brush> {
        self.brush_with(HIGHLIGHTER_OPACITY)
    }

    /// Like [`ToolConfig::brush`] with a configured highlighter opacity.
    pub fn brush_with(&self, highlighter_opacity: f32) -> Option<Brush> {
        let size = clamp_brush_size(self.brush_size);
        match self.tool {
            Tool::Pen => Some(Brush::Ink {
                color: self.color,
                width: size as f32,
                alpha: 1.0,
            }),
            Tool::Highlighter => Some(Brush::Ink {
                color: self.color,
                width: (size * HIGHLIGHTER_WIDTH_FACTOR) as f32,
                alpha: highlighter_opacity.clamp(0.0, 1.0),
            }),
            Tool::Eraser => Some(Brush::Erase { half_extent: size }),
            Tool::Text | Tool::Stamp => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_parses_with_and_without_hash() {
        assert_eq!("#ff0080".parse::<Color>().unwrap(), Color::rgb(255, 0, 128));
        assert_eq!("00ff00".parse::<Color>().unwrap(), Color::rgb(0, 255, 0));
        assert!("#fff".parse::<Color>().is_err());
        assert!("#gg0000".parse::<Color>().is_err());
    }

    #[test]
    fn color_serializes_as_hex_string() {
        let json = serde_json::to_string(&Color::rgb(1, 2, 3)).unwrap();
        assert_eq!(json, "\"#010203\"");
        let back: Color = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Color::rgb(1, 2, 3));
    }

    #[test]
    fn highlighter_is_wide_and_translucent() {
        let tools = ToolConfig {
            tool: Tool::Highlighter,
            color: Color::BLACK,
            brush_size: 4,
        };
        match tools.brush() {
            Some(Brush::Ink { width, alpha, .. }) => {
                assert_eq!(width, 12.0);
                assert!(alpha < 1.0);
            }
            other => panic!("unexpected brush: {:?}", other),
        }
        match tools.brush_with(2.0) {
            Some(Brush::Ink { alpha, .. }) => assert_eq!(alpha, 1.0),
            other => panic!("unexpected brush: {:?}", other),
        }
    }

    #[test]
    fn oversized_brushes_are_clamped() {
        let tools = ToolConfig {
            tool: Tool::Highlighter,
            color: Color::BLACK,
            brush_size: u32::MAX,
        };
        match tools.brush() {
            Some(Brush::Ink { width, .. }) => {
                assert_eq!(width, (MAX_BRUSH_SIZE * HIGHLIGHTER_WIDTH_FACTOR) as f32)
            }
            other => panic!("unexpected brush: {:?}", other),
        }
        assert_eq!(tools.clamped().brush_size, MAX_BRUSH_SIZE);
        assert_eq!(clamp_brush_size(0), 1);
    }

    #[test]
    fn eraser_uses_brush_size_as_half_extent() {
        let tools = ToolConfig::default().with_tool(Tool::Eraser);
        assert_eq!(tools.brush(), Some(Brush::Erase { half_extent: 2 }));
        assert_eq!(ToolConfig::default().with_tool(Tool::Stamp).brush(), None);
    }
}
