use std::path::PathBuf;
use thiserror::Error;

/// Errors from the capture side of a recording.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Failed to read the screen: {0}")]
    DeviceRead(String),
    #[error("No monitor contains the capture area origin ({0}, {1})")]
    MonitorNotFound(i32, i32),
    #[error("Out of resources while buffering frames: {0}")]
    OutOfResources(String),
    #[error("Failed to spawn capture thread: {0}")]
    SpawnFailed(String),
    #[error("Capture thread panicked")]
    WorkerPanicked,
}

/// Errors from the on-disk frame spool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameStoreError {
    #[error("Temporary frame directory unavailable: {0}")]
    SpoolUnavailable(String),
    #[error("Failed to spool frame {index}: {reason}")]
    Append { index: u64, reason: String },
    #[error("Failed to read spooled frame {index}: {reason}")]
    Read { index: u64, reason: String },
    #[error("Spooled frame {0} does not match its recorded dimensions")]
    Corrupt(u64),
    #[error("Failed to write frame image {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Errors from the encoding stage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("Nothing was recorded")]
    EmptyRecording,
    #[error("FFmpeg not found. Please install ffmpeg.")]
    FfmpegNotFound,
    #[error("FFmpeg process failed with exit code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },
    #[error("Failed to write to FFmpeg: {0}")]
    WriteFailed(String),
    #[error(transparent)]
    Frame(#[from] FrameStoreError),
    #[error("Failed to prepare temporary output: {0}")]
    Output(String),
    #[error("Failed to move clip to its destination: {0}")]
    Relocation(String),
    #[error("Failed to spawn encode thread: {0}")]
    SpawnFailed(String),
    #[error("Encoding thread panicked")]
    WorkerPanicked,
    #[error("Encoding cancelled")]
    Cancelled,
}

/// Errors returned by the session controller's command surface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Encoding(#[from] EncodeError),
    #[error(transparent)]
    Store(#[from] FrameStoreError),
    #[error("Unable to find a suitable media file format")]
    NoSuitableFormat,
    #[error("Media file format not supported by the encoder: {0}")]
    UnsupportedFormat(String),
    #[error("Unknown codec for the current format: {0}")]
    UnknownCodec(String),
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
    #[error("Recording already in progress")]
    RecordingInProgress,
}

/// Why the application may not quit right now.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitRefusal {
    #[error("Recording in progress.")]
    Recording,
    #[error("Encoding in progress.")]
    Encoding,
}
