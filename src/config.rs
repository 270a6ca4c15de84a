// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every field has a default, so a missing or partial config.toml still yields
// a usable configuration.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings. The window is fixed-size: there is no resize path.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Paced Renderer".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode; falls back to mailbox, then FIFO
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Upper bound for the per-frame fence wait and image acquire
    pub frame_timeout_ms: u64,
    /// Descriptors per type (and max sets) in the shared descriptor pool
    pub descriptor_pool_size: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.4, 0.8, 1.0, 1.0],
            frame_timeout_ms: 1000,
            descriptor_pool_size: 1024,
        }
    }
}

impl GraphicsConfig {
    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    pub fn frame_timeout_ns(&self) -> u64 {
        self.frame_timeout_ms.saturating_mul(1_000_000)
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

/// Outcome of looking for a config file. Loading happens before logging is
/// set up, so the caller reports it once the logger exists.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Invalid(PathBuf, anyhow::Error),
}

impl ConfigSource {
    pub fn report(&self) {
        match self {
            Self::File(path) => log::info!("Loaded configuration from {:?}", path),
            Self::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            Self::Invalid(path, e) => {
                log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e)
            }
        }
    }
}

impl Config {
    /// Load `config.toml`, falling back to defaults if missing or malformed
    pub fn load() -> (Self, ConfigSource) {
        Self::load_from_path("config.toml")
    }

    /// Load configuration from a specific path, falling back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return (Config::default(), ConfigSource::Missing(path));
        }

        match Self::read(&path) {
            Ok(config) => (config, ConfigSource::File(path)),
            Err(e) => (Config::default(), ConfigSource::Invalid(path, e)),
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validation is only honoured in builds with debug assertions
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}
