use super::{EncodeJob, EncodeProgress, Encoder};
use crate::recorder::errors::EncodeError;
use crate::recorder::frames::{FrameNaming, FrameStore};
use crate::recorder::task::CancelToken;
use crate::recorder::types::{Codec, MediaFileFormat};

/// Writes the recording as numbered PNG files into a directory.
///
/// No codec pipeline is involved, so frames keep their captured size; scale
/// and depth settings do not apply.
#[derive(Debug, Clone, Default)]
pub struct SequenceWriter {
    naming: FrameNaming,
}

impl SequenceWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for SequenceWriter {
    fn formats(&self) -> Vec<MediaFileFormat> {
        vec![MediaFileFormat::ImageSequence]
    }

    fn codecs(&self, format: MediaFileFormat) -> Vec<Codec> {
        match format {
            MediaFileFormat::ImageSequence => vec![Codec::new("PNG", "png")],
            _ => Vec::new(),
        }
    }

    fn encode(
        &self,
        job: &EncodeJob,
        mut frames: FrameStore,
        progress: &mut dyn FnMut(EncodeProgress),
        cancel: &CancelToken,
    ) -> Result<(), EncodeError> {
        let total = frames.len();
        if total == 0 {
            return Err(EncodeError::EmptyRecording);
        }

        tracing::info!(target: "recorder", "[ENCODE] Writing {} frames to {:?}", total, job.output);
        progress(EncodeProgress::started(total, "Writing frames"));

        let written = frames.drain_to_disk(&job.output, &self.naming, |written| {
            progress(EncodeProgress::frames(total - written, total));
            !cancel.is_cancelled()
        })?;

        if cancel.is_cancelled() {
            tracing::info!(target: "recorder", "[ENCODE] Image sequence cancelled after {} frames", written);
            return Err(EncodeError::Cancelled);
        }

        Ok(())
    }
}
