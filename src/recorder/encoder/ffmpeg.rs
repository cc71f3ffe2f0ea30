use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use image::imageops::{self, FilterType};
use image::RgbaImage;

use super::{remove_output, EncodeJob, EncodeProgress, Encoder};
use crate::recorder::errors::EncodeError;
use crate::recorder::frames::FrameStore;
use crate::recorder::task::CancelToken;
use crate::recorder::types::{Codec, MediaFileFormat, ENCODING_CRF, ENCODING_PRESET};

/// A running ffmpeg child writing one temporary output.
///
/// Unless `finish` sees ffmpeg exit cleanly, dropping this kills the child and
/// removes the temporary output. Returning early from the frame loop (cancel,
/// broken pipe, unreadable frame) therefore never leaves a half-written clip
/// next to the destination.
struct FfmpegProcess {
    child: Option<Child>,
    temp_output: PathBuf,
    finished: bool,
}

impl FfmpegProcess {
    fn spawn(program: &Path, args: &[String], temp_output: &Path) -> Result<Self, EncodeError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => EncodeError::FfmpegNotFound,
                _ => EncodeError::WriteFailed(format!("Failed to spawn FFmpeg: {}", e)),
            })?;

        Ok(Self {
            child: Some(child),
            temp_output: temp_output.to_path_buf(),
            finished: false,
        })
    }

    fn stdin(&mut self) -> Result<ChildStdin, EncodeError> {
        self.child
            .as_mut()
            .and_then(|child| child.stdin.take())
            .ok_or_else(|| EncodeError::WriteFailed("FFmpeg stdin unavailable".to_string()))
    }

    /// Waits for ffmpeg to exit once its stdin is closed. The temporary output
    /// is kept only on a zero exit status.
    fn finish(mut self) -> Result<(), EncodeError> {
        let child = self
            .child
            .take()
            .ok_or_else(|| EncodeError::WriteFailed("FFmpeg already reaped".to_string()))?;

        let output = child
            .wait_with_output()
            .map_err(|e| EncodeError::WriteFailed(format!("FFmpeg wait failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(target: "recorder", "[FFMPEG] Exited with {}: {}", output.status, stderr);
            return Err(EncodeError::ProcessFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.finished = true;
        Ok(())
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::info!(target: "recorder", "[FFMPEG] Stopping unfinished encode of {:?}", self.temp_output);
            if let Err(e) = child.kill() {
                tracing::warn!(target: "recorder", "[FFMPEG] Failed to kill FFmpeg: {}", e);
            }
            let _ = child.wait();
        }

        if !self.finished {
            remove_output(&self.temp_output);
        }
    }
}

/// Resizes `image` to `width`x`height` if it differs. Returns whether it did.
fn conform(image: RgbaImage, width: u32, height: u32) -> (RgbaImage, bool) {
    if image.dimensions() == (width, height) {
        return (image, false);
    }
    (imageops::resize(&image, width, height, FilterType::Triangle), true)
}

/// Codecs ffmpeg is asked to use for each container, preferred first.
pub fn codecs_for(format: MediaFileFormat) -> Vec<Codec> {
    match format {
        MediaFileFormat::Mp4 => vec![
            Codec::new("H.264", "libx264"),
            Codec::new("H.265", "libx265"),
            Codec::new("MPEG-4", "mpeg4"),
        ],
        MediaFileFormat::Matroska => vec![
            Codec::new("H.264", "libx264"),
            Codec::new("H.265", "libx265"),
            Codec::new("VP9", "libvpx-vp9"),
            Codec::new("FFV1", "ffv1"),
        ],
        MediaFileFormat::WebM => vec![
            Codec::new("VP8", "libvpx"),
            Codec::new("VP9", "libvpx-vp9"),
            Codec::new("AV1", "libaom-av1"),
        ],
        MediaFileFormat::Gif => vec![Codec::new("GIF", "gif")],
        MediaFileFormat::ImageSequence => Vec::new(),
    }
}

/// Codecs that need 4:2:0 chroma and therefore even frame dimensions.
fn needs_yuv420(encoder: &str) -> bool {
    matches!(
        encoder,
        "libx264" | "libx265" | "mpeg4" | "libvpx" | "libvpx-vp9" | "libaom-av1"
    )
}

fn even(dim: u32) -> u32 {
    (dim & !1).max(2)
}

/// Builds the ffmpeg command line for raw RGBA frames of `width`x`height`
/// arriving on stdin.
pub fn build_args(job: &EncodeJob, width: u32, height: u32) -> Vec<String> {
    let yuv = needs_yuv420(&job.codec.encoder);
    let (target_width, target_height) = if yuv {
        (even(job.target.width), even(job.target.height))
    } else {
        (job.target.width.max(1), job.target.height.max(1))
    };

    let mut filters = vec![format!("scale={}:{}", target_width, target_height)];
    if let Some(filter) = job.depth.format_filter() {
        filters.push(filter.to_string());
    }

    let mut args: Vec<String> = Vec::new();
    args.extend([
        "-hide_banner".to_string(),
        "-loglevel".to_string(), "error".to_string(),
        "-nostats".to_string(),
    ]);

    args.extend([
        "-f".to_string(), "rawvideo".to_string(),
        "-pixel_format".to_string(), "rgba".to_string(),
        "-video_size".to_string(), format!("{}x{}", width, height),
        "-framerate".to_string(), job.frame_rate.max(1).to_string(),
        "-i".to_string(), "pipe:0".to_string(),
    ]);

    args.extend(["-vf".to_string(), filters.join(",")]);
    args.extend(["-c:v".to_string(), job.codec.encoder.clone()]);

    if yuv {
        args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
    }
    if matches!(job.codec.encoder.as_str(), "libx264" | "libx265") {
        args.extend([
            "-crf".to_string(), ENCODING_CRF.to_string(),
            "-preset".to_string(), ENCODING_PRESET.to_string(),
        ]);
    }
    if job.format == MediaFileFormat::Mp4 {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }

    if let Some(muxer) = job.format.muxer() {
        args.extend(["-f".to_string(), muxer.to_string()]);
    }
    args.extend(["-y".to_string(), job.output.to_string_lossy().to_string()]);

    args
}

/// Pipes frames into an `ffmpeg` child process.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self::with_program("ffmpeg")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for FfmpegEncoder {
    fn formats(&self) -> Vec<MediaFileFormat> {
        MediaFileFormat::ALL
            .into_iter()
            .filter(|format| format.muxer().is_some())
            .collect()
    }

    fn codecs(&self, format: MediaFileFormat) -> Vec<Codec> {
        codecs_for(format)
    }

    fn encode(
        &self,
        job: &EncodeJob,
        mut frames: FrameStore,
        progress: &mut dyn FnMut(EncodeProgress),
        cancel: &CancelToken,
    ) -> Result<(), EncodeError> {
        let total = frames.len();
        let (width, height) = frames
            .front()
            .map(|frame| frame.dimensions())
            .ok_or(EncodeError::EmptyRecording)?;

        let args = build_args(job, width, height);
        tracing::info!(target: "recorder",
            "[FFMPEG] Starting: {} frames {}x{} @ {}fps -> {}x{} {} ({})",
            total, width, height, job.frame_rate, job.target.width, job.target.height,
            job.codec.encoder, job.format.short_name());
        tracing::debug!(target: "recorder", "[FFMPEG] Args: {:?}", args);

        let mut process = FfmpegProcess::spawn(&self.program, &args, &job.output)?;
        let mut stdin = process.stdin()?;

        progress(EncodeProgress::started(total, "Encoding"));

        let mut written: usize = 0;
        let mut rescaled: usize = 0;
        while let Some(frame) = frames.pop_front() {
            if cancel.is_cancelled() {
                tracing::info!(target: "recorder", "[FFMPEG] Cancelled after {} frames", written);
                return Err(EncodeError::Cancelled);
            }

            // The input size is fixed by the first frame; a monitor scale
            // change mid-recording yields frames of another size.
            let (image, resized) = conform(frame.load()?, width, height);
            if resized {
                rescaled += 1;
                tracing::debug!(target: "recorder",
                    "[FFMPEG] Frame {} rescaled from {:?} to {}x{}",
                    frame.index(), frame.dimensions(), width, height);
            }

            stdin.write_all(image.as_raw()).map_err(|e| {
                EncodeError::WriteFailed(format!("Failed to write frame {}: {}", frame.index(), e))
            })?;
            written += 1;

            progress(EncodeProgress::frames(frames.len(), total));

            if written % 60 == 0 {
                tracing::debug!(target: "recorder", "[FFMPEG] Written {} frames", written);
            }
        }

        drop(stdin);
        progress(EncodeProgress::text(0, total, "Finalizing"));
        tracing::debug!(target: "recorder", "[FFMPEG] Waiting for FFmpeg to finish...");

        process.finish()?;

        if rescaled > 0 {
            tracing::warn!(target: "recorder",
                "[FFMPEG] {} of {} frames did not match {}x{} and were rescaled",
                rescaled, written, width, height);
        }
        tracing::info!(target: "recorder", "[FFMPEG] Complete, {} frames written", written);
        Ok(())
    }
}
