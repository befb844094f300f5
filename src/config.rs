// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub atlas: AtlasConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Widget Presentation".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Present modes in order of preference; FIFO is always appended as the last resort.
    pub present_modes: Vec<String>,
    pub clear_color: [f32; 4],
    /// Per pipeline, per frame. Must stay addressable by 16-bit quad indices.
    pub max_vertices: u32,
    pub shader_dir: PathBuf,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_modes: vec!["mailbox".to_string(), "fifo".to_string()],
            clear_color: [0.08, 0.08, 0.1, 1.0],
            max_vertices: 65536,
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

/// Texture atlas layout shared by the image and SDF pipelines
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// Pages along each side of one square atlas layer.
    pub pages_per_row: u32,
    pub max_layers: u32,
    pub staging_width: u32,
    pub staging_height: u32,
}

impl AtlasConfig {
    /// Reject layouts with an empty side or whose page and texel counts overflow.
    pub fn validate(&self) -> Result<()> {
        if self.pages_per_row == 0 || self.max_layers == 0 {
            anyhow::bail!("atlas.pages_per_row and atlas.max_layers must be non-zero");
        }
        if self.staging_width == 0 || self.staging_height == 0 {
            anyhow::bail!("atlas.staging_width and atlas.staging_height must be non-zero");
        }
        self.pages_per_row
            .checked_mul(crate::atlas::PAGE_SIZE)
            .context("atlas.pages_per_row makes a layer wider than u32 texels")?;
        self.pages_per_row
            .checked_mul(self.pages_per_row)
            .and_then(|per_layer| per_layer.checked_mul(self.max_layers))
            .context("atlas.pages_per_row and atlas.max_layers give more than u32 pages")?;
        self.staging_width
            .checked_mul(self.staging_height)
            .context("atlas staging area holds more than u32 texels")?;
        Ok(())
    }
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            pages_per_row: 16,
            max_layers: 4,
            staging_width: 1024,
            staging_height: 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "widget_present.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.graphics.max_vertices == 0 || config.graphics.max_vertices > 65536 {
            anyhow::bail!(
                "graphics.max_vertices must be in 1..=65536, got {}",
                config.graphics.max_vertices
            );
        }
        config.atlas.validate()?;
        Ok(config)
    }

    /// Present modes as Vulkan enums, in preference order, always ending with FIFO
    pub fn present_mode_preference(&self) -> Vec<vk::PresentModeKHR> {
        let mut modes: Vec<vk::PresentModeKHR> = self
            .graphics
            .present_modes
            .iter()
            .filter_map(|name| match name.to_lowercase().as_str() {
                "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
                "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
                "fifo" => Some(vk::PresentModeKHR::FIFO),
                "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
                _ => {
                    log::warn!("Unknown present mode '{}', skipping", name);
                    None
                }
            })
            .collect();

        if !modes.contains(&vk::PresentModeKHR::FIFO) {
            modes.push(vk::PresentModeKHR::FIFO); // FIFO is always supported
        }
        modes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.max_vertices, 65536);
        assert_eq!(config.atlas.pages_per_row, 16);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            title = "Demo"

            [atlas]
            max_layers = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.window.title, "Demo");
        assert_eq!(config.window.height, 720);
        assert_eq!(config.atlas.max_layers, 2);
        assert_eq!(config.atlas.staging_width, 1024);
    }

    #[test]
    fn present_modes_skip_unknown_and_end_with_fifo() {
        let config = Config::parse(
            r#"
            [graphics]
            present_modes = ["Immediate", "warp-speed", "mailbox"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.present_mode_preference(),
            vec![
                vk::PresentModeKHR::IMMEDIATE,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::FIFO
            ]
        );
    }

    #[test]
    fn empty_staging_area_is_rejected() {
        let err = Config::parse("[atlas]\nstaging_height = 0\n").unwrap_err();
        assert!(err.to_string().contains("staging_height"));
    }

    #[test]
    fn overflowing_atlas_layouts_are_rejected() {
        // 65536^2 pages on one layer
        assert!(Config::parse("[atlas]\npages_per_row = 65536\n").is_err());
        // 4096^2 pages fit on one layer, 1024 layers of them do not
        let err = Config::parse("[atlas]\npages_per_row = 4096\nmax_layers = 1024\n").unwrap_err();
        assert!(err.to_string().contains("u32 pages"));
        assert!(Config::parse("[atlas]\nstaging_width = 65536\nstaging_height = 65536\n").is_err());
        assert!(AtlasConfig::default().validate().is_ok());
    }

    #[test]
    fn oversized_vertex_budget_is_rejected() {
        let err = Config::parse("[graphics]\nmax_vertices = 70000\n").unwrap_err();
        assert!(err.to_string().contains("max_vertices"));
    }
}
