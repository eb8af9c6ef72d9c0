use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::export::ExportOptions;
use crate::tool::HIGHLIGHTER_OPACITY;

/// Engine tunables. Every field has a default, so a config file only needs
/// the keys it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Maximum undo snapshots kept for the active page; 0 keeps all.
    pub history_depth: usize,
    pub highlighter_opacity: f32,
    /// Number of clean page rasters kept around for navigation and export.
    pub cache_capacity: usize,
    /// Scale used when export has to rasterize a page that was never opened.
    pub base_scale: f32,
    pub export: ExportOptions,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            history_depth: 0,
            highlighter_opacity: HIGHLIGHTER_OPACITY,
            cache_capacity: 10,
            base_scale: 1.0,
            export: ExportOptions::default(),
        }
    }
}

impl EditorConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).context("failed to parse editor configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {:?}", path))?;
        Self::from_toml_str(&source).with_context(|| format!("invalid configuration in {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = EditorConfig::from_toml_str(
            r#"
            history_depth = 5

            [export]
            page_width_mm = 297.0
            "#,
        )
        .unwrap();
        assert_eq!(config.history_depth, 5);
        assert_eq!(EditorConfig::default().history_depth, 0);
        assert_eq!(config.cache_capacity, 10);
        assert_eq!(config.highlighter_opacity, HIGHLIGHTER_OPACITY);
        assert_eq!(config.base_scale, 1.0);
        assert_eq!(config.export.page_width_mm, 297.0);
        assert_eq!(config.export.title, ExportOptions::default().title);
    }

    #[test]
    fn unknown_values_are_reported() {
        assert!(EditorConfig::from_toml_str("history_depth = \"many\"").is_err());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markpage.toml");
        std::fs::write(&path, "base_scale = 2.0\n").unwrap();
        assert_eq!(EditorConfig::load(&path).unwrap().base_scale, 2.0);
        assert!(EditorConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
