//! Configuration persistence for segcast settings
//!
//! Settings live in a JSON document. Loading is tolerant per key: anything
//! missing, mistyped or out of range silently takes its default.

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use crate::domain::{Region, Resolution};

pub const SEGMENT_DURATION_RANGE: RangeInclusive<u32> = 1..=3600;
pub const WIDTH_RANGE: RangeInclusive<u32> = 320..=7680;
pub const HEIGHT_RANGE: RangeInclusive<u32> = 240..=4320;
pub const FRAMERATE_RANGE: RangeInclusive<u32> = 1..=120;

/// Name of the preset used when width/height are set explicitly
pub const CUSTOM_PRESET: &str = "Custom";

/// Named resolution presets offered by the settings dialog
pub const RESOLUTION_PRESETS: &[(&str, u32, u32)] = &[
    ("480p", 854, 480),
    ("720p", 1280, 720),
    ("1080p", 1920, 1080),
    ("1440p", 2560, 1440),
    ("4K", 3840, 2160),
    ("8K", 7680, 4320),
];

/// Look up a preset's dimensions by name
pub fn preset_dimensions(name: &str) -> Option<(u32, u32)> {
    RESOLUTION_PRESETS
        .iter()
        .find(|(preset, _, _)| *preset == name)
        .map(|(_, w, h)| (*w, *h))
}

/// Image format used for scratch frames and fallback exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpg => "jpg",
        }
    }
}

/// Video container format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Avi,
    Mkv,
}

impl Container {
    /// Get file extension for this container
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Avi => "avi",
            Container::Mkv => "mkv",
        }
    }

    /// Get GStreamer muxer element name
    pub fn muxer_element(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4mux",
            Container::Avi => "avimux",
            Container::Mkv => "matroskamux",
        }
    }
}

/// User settings persisted between sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Format of captured frames on scratch storage
    pub image_format: ImageFormat,
    /// Preferred container; candidates using it are tried first
    pub video_format: Container,
    /// Where finished segments are written
    pub output_directory: PathBuf,
    /// Segment length in seconds (1-3600)
    pub segment_duration: u32,
    /// Target frame width (320-7680)
    pub resolution_width: u32,
    /// Target frame height (240-4320)
    pub resolution_height: u32,
    /// Preset label, or "Custom"
    pub resolution_preset: String,
    /// Sampling and encoding rate (1-120)
    pub framerate: u32,
    /// Parent of the scratch directory (None = working directory)
    pub scratch_directory: Option<PathBuf>,
}

fn default_output_directory() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("segcast")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image_format: ImageFormat::Png,
            video_format: Container::Mp4,
            output_directory: default_output_directory(),
            segment_duration: 60,
            resolution_width: 1920,
            resolution_height: 1080,
            resolution_preset: "1080p".to_string(),
            framerate: 24,
            scratch_directory: None,
        }
    }
}

/// Read one key, discarding it if missing, mistyped or rejected by `valid`
fn field<T: DeserializeOwned>(
    map: &Map<String, Value>,
    key: &str,
    valid: impl Fn(&T) -> bool,
) -> Option<T> {
    let value = map.get(key)?;
    match serde_json::from_value::<T>(value.clone()) {
        Ok(parsed) if valid(&parsed) => Some(parsed),
        Ok(_) => {
            log::debug!("Settings key '{}' out of range, using default", key);
            None
        }
        Err(e) => {
            log::debug!("Settings key '{}' malformed ({}), using default", key, e);
            None
        }
    }
}

fn check_range(key: &str, value: u32, range: &RangeInclusive<u32>) -> Result<()> {
    if !range.contains(&value) {
        bail!(
            "{} = {} is outside {}..={}",
            key,
            value,
            range.start(),
            range.end()
        );
    }
    Ok(())
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("segcast").join("settings.json"))
    }

    /// Build settings from a parsed document, key by key
    pub fn from_value(value: &Value) -> Self {
        let defaults = Self::default();
        let Some(map) = value.as_object() else {
            log::warn!("Settings document is not an object, using defaults");
            return defaults;
        };

        let mut settings = Self {
            image_format: field(map, "image_format", |_| true).unwrap_or(defaults.image_format),
            video_format: field(map, "video_format", |_| true).unwrap_or(defaults.video_format),
            output_directory: field(map, "output_directory", |p: &PathBuf| {
                !p.as_os_str().is_empty()
            })
            .unwrap_or(defaults.output_directory),
            segment_duration: field(map, "segment_duration", |v| {
                SEGMENT_DURATION_RANGE.contains(v)
            })
            .unwrap_or(defaults.segment_duration),
            resolution_width: field(map, "resolution_width", |v| WIDTH_RANGE.contains(v))
                .unwrap_or(defaults.resolution_width),
            resolution_height: field(map, "resolution_height", |v| HEIGHT_RANGE.contains(v))
                .unwrap_or(defaults.resolution_height),
            resolution_preset: field(map, "resolution_preset", |_: &String| true)
                .unwrap_or(defaults.resolution_preset),
            framerate: field(map, "framerate", |v| FRAMERATE_RANGE.contains(v))
                .unwrap_or(defaults.framerate),
            scratch_directory: field(map, "scratch_directory", |_: &Option<PathBuf>| true)
                .unwrap_or(defaults.scratch_directory),
        };
        settings.reconcile_preset();
        settings
    }

    /// Load settings from `path`, falling back to defaults on any problem
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            log::info!("No settings found at {}, using defaults", path.display());
            return Self::default();
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                log::warn!("Failed to read settings {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<Value>(&contents) {
            Ok(value) => {
                log::info!("Loaded settings from {}", path.display());
                Self::from_value(&value)
            }
            Err(e) => {
                log::warn!("Failed to parse settings {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Check ranged fields against the same limits `load` enforces
    pub fn validate(&self) -> Result<()> {
        check_range("segment_duration", self.segment_duration, &SEGMENT_DURATION_RANGE)?;
        check_range("resolution_width", self.resolution_width, &WIDTH_RANGE)?;
        check_range("resolution_height", self.resolution_height, &HEIGHT_RANGE)?;
        check_range("framerate", self.framerate, &FRAMERATE_RANGE)?;
        if self.output_directory.as_os_str().is_empty() {
            bail!("output_directory must not be empty");
        }
        Ok(())
    }

    /// Save settings to `path`
    ///
    /// Values `load` would discard are rejected instead of written.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate().context("Refusing to save invalid settings")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings dir: {}", parent.display()))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write settings: {}", path.display()))?;

        log::info!("Saved settings to {}", path.display());
        Ok(())
    }

    /// Select a named preset, updating width and height
    ///
    /// Returns false (and changes nothing) for unknown names.
    pub fn apply_preset(&mut self, name: &str) -> bool {
        match preset_dimensions(name) {
            Some((width, height)) => {
                self.resolution_width = width;
                self.resolution_height = height;
                self.resolution_preset = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Relabel as Custom when the preset name does not match the dimensions
    fn reconcile_preset(&mut self) {
        let matches = preset_dimensions(&self.resolution_preset)
            == Some((self.resolution_width, self.resolution_height));
        if !matches && self.resolution_preset != CUSTOM_PRESET {
            self.resolution_preset = CUSTOM_PRESET.to_string();
        }
    }

    /// Snapshot the fields the recorder needs for the next session
    pub fn recording_config(&self, region: Option<Region>) -> Result<RecordingConfig> {
        self.validate()?;
        let resolution = Resolution::new(self.resolution_width, self.resolution_height)
            .with_context(|| {
                format!(
                    "Invalid resolution {}x{}",
                    self.resolution_width, self.resolution_height
                )
            })?;
        let scratch_directory = match &self.scratch_directory {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()),
        };

        Ok(RecordingConfig {
            resolution,
            frames_per_second: self.framerate.max(1),
            segment_duration_seconds: self.segment_duration.max(1),
            output_directory: self.output_directory.clone(),
            scratch_directory,
            image_format: self.image_format,
            preferred_container: self.video_format,
            region,
        })
    }
}

/// Immutable recording parameters, fixed for the lifetime of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingConfig {
    /// Every frame is rescaled to exactly this size
    pub resolution: Resolution,
    pub frames_per_second: u32,
    pub segment_duration_seconds: u32,
    pub output_directory: PathBuf,
    /// Parent directory for the session's scratch area
    pub scratch_directory: PathBuf,
    pub image_format: ImageFormat,
    pub preferred_container: Container,
    /// Capture rectangle, or None for the full virtual display
    pub region: Option<Region>,
}

impl RecordingConfig {
    /// Number of frames that make up one full segment
    pub fn frames_per_segment(&self) -> usize {
        (self.frames_per_second as usize) * (self.segment_duration_seconds as usize)
    }
}
