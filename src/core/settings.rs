use crate::recorder::types::{MediaFileFormat, Rect, VideoDepth, DEFAULT_FRAME_RATE};
use crate::shared::paths::{default_output_file, get_settings_path};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Recording configuration. Read once at startup; the controller keeps its
/// own copy and never writes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureSettings {
    /// Screen area to record. `None` records the whole primary screen.
    pub capture_area: Option<Rect>,
    /// Frames per second. Zero falls back to the capture default.
    pub frame_rate: u32,
    pub scale: f32,
    pub video_depth: VideoDepth,
    pub output_file_name: PathBuf,
    pub output_format: String,
    /// Codec name for the output format. Empty selects the first one offered.
    pub output_codec: String,
    /// Where captured frames are spooled. `None` uses the system temporary directory.
    pub spool_dir: Option<PathBuf>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            capture_area: None,
            frame_rate: DEFAULT_FRAME_RATE,
            scale: 1.0,
            video_depth: VideoDepth::default(),
            output_file_name: default_output_file(),
            output_format: MediaFileFormat::default().short_name().to_string(),
            output_codec: String::new(),
            spool_dir: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse settings: {0}")]
    ParseError(#[from] serde_json::Error),
}

pub fn load_settings() -> CaptureSettings {
    let path = get_settings_path();

    if !path.exists() {
        return CaptureSettings::default();
    }

    load_settings_from_file(&path).unwrap_or_else(|e| {
        tracing::warn!("Ignoring settings file {:?}: {}", path, e);
        CaptureSettings::default()
    })
}

pub fn load_settings_from_file(path: &Path) -> Result<CaptureSettings, SettingsError> {
    let contents = std::fs::read_to_string(path)?;
    let settings = serde_json::from_str(&contents)?;
    Ok(settings)
}
