use serde::{Deserialize, Serialize};

pub const ENCODING_CRF: &str = "18";
pub const ENCODING_PRESET: &str = "slower";

/// Frame rate used when the configured rate is zero.
pub const FALLBACK_FRAME_RATE: u32 = 10;
pub const DEFAULT_FRAME_RATE: u32 = 20;

/// Screen-space rectangle. Origin may be negative on multi-monitor layouts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        let right = self.x as i64 + self.width as i64;
        let bottom = self.y as i64 + self.height as i64;
        (x as i64) >= self.x as i64
            && (x as i64) < right
            && (y as i64) >= self.y as i64
            && (y as i64) < bottom
    }

    /// Target frame for the encoder: origin at zero, size scaled and never
    /// smaller than one pixel.
    pub fn scaled(&self, scale: f32) -> Rect {
        let scale_dim = |dim: u32| ((dim as f64 * scale as f64).round() as u32).max(1);
        Rect::new(0, 0, scale_dim(self.width), scale_dim(self.height))
    }
}

/// Pixel depth of the encoded clip.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoDepth {
    #[default]
    Rgba32,
    Rgb24,
    Gray8,
}

impl VideoDepth {
    /// ffmpeg `format=` filter applied before the codec, if any.
    pub fn format_filter(&self) -> Option<&'static str> {
        match self {
            VideoDepth::Rgba32 => None,
            VideoDepth::Rgb24 => Some("format=rgb24"),
            VideoDepth::Gray8 => Some("format=gray"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MediaFileFormat {
    #[default]
    Mp4,
    Matroska,
    WebM,
    Gif,
    /// Numbered still images in a directory; no container, no codec pipeline.
    ImageSequence,
}

impl MediaFileFormat {
    pub const ALL: [MediaFileFormat; 5] = [
        MediaFileFormat::Mp4,
        MediaFileFormat::Matroska,
        MediaFileFormat::WebM,
        MediaFileFormat::Gif,
        MediaFileFormat::ImageSequence,
    ];

    pub fn short_name(&self) -> &'static str {
        match self {
            MediaFileFormat::Mp4 => "mp4",
            MediaFileFormat::Matroska => "mkv",
            MediaFileFormat::WebM => "webm",
            MediaFileFormat::Gif => "gif",
            MediaFileFormat::ImageSequence => "frames",
        }
    }

    pub fn pretty_name(&self) -> &'static str {
        match self {
            MediaFileFormat::Mp4 => "MPEG-4 (MP4)",
            MediaFileFormat::Matroska => "Matroska (MKV)",
            MediaFileFormat::WebM => "WebM",
            MediaFileFormat::Gif => "Animated GIF",
            MediaFileFormat::ImageSequence => "Image sequence",
        }
    }

    /// File extension of the produced output, `None` for directory outputs.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            MediaFileFormat::ImageSequence => None,
            other => Some(other.short_name()),
        }
    }

    /// Name of the ffmpeg muxer, `None` when ffmpeg is not involved.
    pub fn muxer(&self) -> Option<&'static str> {
        match self {
            MediaFileFormat::Mp4 => Some("mp4"),
            MediaFileFormat::Matroska => Some("matroska"),
            MediaFileFormat::WebM => Some("webm"),
            MediaFileFormat::Gif => Some("gif"),
            MediaFileFormat::ImageSequence => None,
        }
    }

    /// Accepts either the short or the pretty name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|format| {
            format.short_name().eq_ignore_ascii_case(name)
                || format.pretty_name().eq_ignore_ascii_case(name)
        })
    }
}

/// A codec offered for a media file format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Codec {
    /// Human readable name, used for selection.
    pub name: String,
    /// Encoder identifier understood by the encoding backend.
    pub encoder: String,
}

impl Codec {
    pub fn new(name: impl Into<String>, encoder: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            encoder: encoder.into(),
        }
    }
}
