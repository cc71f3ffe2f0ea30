//! Consumer side of a recording.
//!
//! An `Encoder` takes ownership of a finished `FrameStore`, consumes it in
//! sequence order and writes a single output. Output goes to a uniquely named
//! temporary path next to the destination first; the controller relocates it
//! once encoding succeeds.

mod ffmpeg;
mod sequence;

pub use ffmpeg::FfmpegEncoder;
pub use sequence::SequenceWriter;

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::errors::EncodeError;
use super::frames::FrameStore;
use super::task::CancelToken;
use super::types::{Codec, MediaFileFormat, Rect, VideoDepth};

const TEMP_PREFIX: &str = ".screenclip-";
const RESERVE_ATTEMPTS: usize = 8;

/// Everything an encoder needs, snapshotted when the recording stops.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeJob {
    /// Reserved temporary output the encoder writes to.
    pub output: PathBuf,
    /// Where the finished clip is moved afterwards.
    pub destination: PathBuf,
    pub format: MediaFileFormat,
    pub codec: Codec,
    /// Size of the encoded frames.
    pub target: Rect,
    pub depth: VideoDepth,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeProgress {
    pub frames_remaining: usize,
    pub frames_total: usize,
    pub text: Option<String>,
    /// Set on the first event of a pass so observers restart their progress bar.
    pub reset: bool,
}

impl EncodeProgress {
    pub fn started(frames_total: usize, text: impl Into<String>) -> Self {
        Self {
            frames_remaining: frames_total,
            frames_total,
            text: Some(text.into()),
            reset: true,
        }
    }

    pub fn frames(frames_remaining: usize, frames_total: usize) -> Self {
        Self {
            frames_remaining,
            frames_total,
            text: None,
            reset: false,
        }
    }

    pub fn text(frames_remaining: usize, frames_total: usize, text: impl Into<String>) -> Self {
        Self {
            frames_remaining,
            frames_total,
            text: Some(text.into()),
            reset: false,
        }
    }
}

pub trait Encoder: Send + Sync {
    /// Output formats this encoder can produce.
    fn formats(&self) -> Vec<MediaFileFormat>;

    /// Codecs offered for `format`, preferred first. Empty if unsupported.
    fn codecs(&self, format: MediaFileFormat) -> Vec<Codec>;

    /// Consumes `frames` in order and writes `job.output`.
    ///
    /// Must stop consuming frames soon after `cancel` fires and return
    /// `EncodeError::Cancelled` instead of success.
    fn encode(
        &self,
        job: &EncodeJob,
        frames: FrameStore,
        progress: &mut dyn FnMut(EncodeProgress),
        cancel: &CancelToken,
    ) -> Result<(), EncodeError>;
}

/// Default encoder: ffmpeg for container formats when it is installed, plus
/// the built-in image sequence writer.
pub struct MediaEncoder {
    ffmpeg: Option<FfmpegEncoder>,
    sequence: SequenceWriter,
}

impl MediaEncoder {
    pub fn new(ffmpeg: Option<FfmpegEncoder>) -> Self {
        Self {
            ffmpeg,
            sequence: SequenceWriter::new(),
        }
    }

    /// Probes for ffmpeg on `PATH`.
    pub fn detect() -> Self {
        let ffmpeg = FfmpegEncoder::new();
        if ffmpeg.is_available() {
            tracing::info!(target: "recorder", "[ENCODE] Using ffmpeg at {:?}", ffmpeg.program());
            Self::new(Some(ffmpeg))
        } else {
            tracing::warn!(target: "recorder", "[ENCODE] ffmpeg not found, only image sequences are available");
            Self::new(None)
        }
    }

    fn backend(&self, format: MediaFileFormat) -> Option<&dyn Encoder> {
        if format == MediaFileFormat::ImageSequence {
            return Some(&self.sequence);
        }
        self.ffmpeg.as_ref().map(|ffmpeg| ffmpeg as &dyn Encoder)
    }
}

impl Encoder for MediaEncoder {
    fn formats(&self) -> Vec<MediaFileFormat> {
        let mut formats = self
            .ffmpeg
            .as_ref()
            .map(|ffmpeg| ffmpeg.formats())
            .unwrap_or_default();
        formats.extend(self.sequence.formats());
        formats
    }

    fn codecs(&self, format: MediaFileFormat) -> Vec<Codec> {
        self.backend(format)
            .map(|backend| backend.codecs(format))
            .unwrap_or_default()
    }

    fn encode(
        &self,
        job: &EncodeJob,
        frames: FrameStore,
        progress: &mut dyn FnMut(EncodeProgress),
        cancel: &CancelToken,
    ) -> Result<(), EncodeError> {
        match self.backend(job.format) {
            Some(backend) => backend.encode(job, frames, progress, cancel),
            None => Err(EncodeError::FfmpegNotFound),
        }
    }
}

/// Destination adjusted to the format: the format's extension, or no
/// extension for directory outputs.
pub fn output_destination(path: &Path, format: MediaFileFormat) -> PathBuf {
    path.with_extension(format.extension().unwrap_or(""))
}

/// Creates a uniquely named temporary output in the destination's directory,
/// creating that directory if needed. Directory formats get a directory.
pub fn reserve_temp_output(
    destination: &Path,
    format: MediaFileFormat,
) -> Result<PathBuf, EncodeError> {
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| EncodeError::Output(e.to_string()))?;

    for _ in 0..RESERVE_ATTEMPTS {
        let mut name = format!("{}{}", TEMP_PREFIX, Uuid::new_v4().simple());
        if let Some(extension) = format.extension() {
            name.push('.');
            name.push_str(extension);
        }
        let path = parent.join(name);

        let created = match format.extension() {
            Some(_) => OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map(|_| ()),
            None => fs::create_dir(&path),
        };

        match created {
            Ok(()) => {
                tracing::debug!(target: "recorder", "[ENCODE] Reserved temporary output {:?}", path);
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(EncodeError::Output(e.to_string())),
        }
    }

    Err(EncodeError::Output(format!(
        "no unique temporary name in {:?}",
        parent
    )))
}

/// `path` if free, otherwise the first free `stem-N.ext`.
pub fn unique_destination(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| {
            let name = match &extension {
                Some(ext) => format!("{}-{}.{}", stem, n, ext),
                None => format!("{}-{}", stem, n),
            };
            path.with_file_name(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Moves a finished output to a free path at `destination`. Returns where it landed.
pub fn relocate(temp: &Path, destination: &Path) -> Result<PathBuf, EncodeError> {
    let target = unique_destination(destination);
    fs::rename(temp, &target)
        .map_err(|e| EncodeError::Relocation(format!("{:?} -> {:?}: {}", temp, target, e)))?;

    tracing::info!(target: "recorder", "[ENCODE] Clip saved to {:?}", target);
    Ok(target)
}

/// Best-effort removal of a temporary output file or directory.
pub fn remove_output(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => {
            tracing::debug!(target: "recorder", "[ENCODE] Removed temporary output {:?}", path);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(target: "recorder", "[ENCODE] Failed to remove {:?}: {}", path, e);
        }
    }
}
