//! Ordered, disk-spooled frame sequence bridging capture and encode.
//!
//! A `FrameStore` has exactly one owner at a time: the capture thread while
//! recording, then the encode thread. Frames are spooled as raw RGBA files in a
//! per-store directory under a process-wide temporary directory. The shared
//! directory is created lazily and removed once the last store is dropped.

use std::collections::VecDeque;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use image::{ImageFormat, RgbaImage};
use once_cell::sync::Lazy;
use uuid::Uuid;

use super::errors::FrameStoreError;

const SPOOL_PREFIX: &str = "screenclip-";
const CREATE_ATTEMPTS: usize = 8;

static SPOOL_ROOT: Lazy<Mutex<Weak<SpoolDir>>> = Lazy::new(|| Mutex::new(Weak::new()));

struct SpoolDir {
    path: PathBuf,
}

impl SpoolDir {
    fn acquire() -> Result<Arc<SpoolDir>, FrameStoreError> {
        let mut slot = SPOOL_ROOT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = slot.upgrade() {
            return Ok(dir);
        }

        let dir = Arc::new(SpoolDir::create(&std::env::temp_dir())?);
        *slot = Arc::downgrade(&dir);
        Ok(dir)
    }

    fn create(base: &Path) -> Result<SpoolDir, FrameStoreError> {
        let path = create_unique_dir(base, SPOOL_PREFIX)?;
        tracing::debug!(target: "recorder", "[STORE] Created spool directory {:?}", path);
        Ok(SpoolDir { path })
    }
}

impl Drop for SpoolDir {
    fn drop(&mut self) {
        tracing::debug!(target: "recorder", "[STORE] Removing spool directory {:?}", self.path);
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(target: "recorder", "[STORE] Failed to remove spool directory: {}", e);
            }
        }
    }
}

/// Creates `base/<prefix><uuid>`, retrying on the unlikely name collision.
fn create_unique_dir(base: &Path, prefix: &str) -> Result<PathBuf, FrameStoreError> {
    for _ in 0..CREATE_ATTEMPTS {
        let path = base.join(format!("{}{}", prefix, Uuid::new_v4().simple()));
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(FrameStoreError::SpoolUnavailable(e.to_string())),
        }
    }

    Err(FrameStoreError::SpoolUnavailable(format!(
        "no unique directory name under {:?}",
        base
    )))
}

/// One captured frame. Owns its spool file, which is deleted on drop.
#[derive(Debug)]
pub struct FrameRecord {
    index: u64,
    timestamp: Instant,
    width: u32,
    height: u32,
    spool_path: PathBuf,
}

impl FrameRecord {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Reads the spooled pixels back into memory.
    pub fn load(&self) -> Result<RgbaImage, FrameStoreError> {
        let bytes = fs::read(&self.spool_path).map_err(|e| FrameStoreError::Read {
            index: self.index,
            reason: e.to_string(),
        })?;

        RgbaImage::from_raw(self.width, self.height, bytes).ok_or(FrameStoreError::Corrupt(self.index))
    }

    /// Writes the frame as an image file in the given format.
    pub fn save_as(&self, path: &Path, format: ImageFormat) -> Result<(), FrameStoreError> {
        let image = self.load()?;
        image
            .save_with_format(path, format)
            .map_err(|e| FrameStoreError::Write {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }
}

impl Drop for FrameRecord {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.spool_path);
    }
}

/// File naming for `FrameStore::drain_to_disk`: `<prefix><zero-padded index>.<ext>`.
#[derive(Clone, Debug)]
pub struct FrameNaming {
    pub prefix: String,
    pub digits: usize,
    pub format: ImageFormat,
}

impl FrameNaming {
    pub fn file_name(&self, index: u64) -> String {
        let extension = self.format.extensions_str().first().copied().unwrap_or("img");
        format!(
            "{}{:0width$}.{}",
            self.prefix,
            index,
            extension,
            width = self.digits
        )
    }
}

impl Default for FrameNaming {
    fn default() -> Self {
        Self {
            prefix: "frame_".to_string(),
            digits: 7,
            format: ImageFormat::Png,
        }
    }
}

pub struct FrameStore {
    frames: VecDeque<FrameRecord>,
    next_index: u64,
    dir: PathBuf,
    _spool: Arc<SpoolDir>,
}

impl FrameStore {
    /// Creates an empty store with its own directory under the process-wide
    /// spool in the system temporary directory.
    pub fn new() -> Result<Self, FrameStoreError> {
        Self::in_spool(SpoolDir::acquire()?)
    }

    /// Creates an empty store spooling under `base`, which is created if
    /// missing. The spool directory made there goes away with the store.
    pub fn new_in(base: &Path) -> Result<Self, FrameStoreError> {
        fs::create_dir_all(base).map_err(|e| FrameStoreError::SpoolUnavailable(e.to_string()))?;
        Self::in_spool(Arc::new(SpoolDir::create(base)?))
    }

    fn in_spool(spool: Arc<SpoolDir>) -> Result<Self, FrameStoreError> {
        let dir = create_unique_dir(&spool.path, "store-")?;

        Ok(Self {
            frames: VecDeque::new(),
            next_index: 0,
            dir,
            _spool: spool,
        })
    }

    /// Spools `image` and appends it. Returns the assigned sequence index.
    ///
    /// Indices start at zero and are gapless: a failed append does not consume one.
    pub fn append(&mut self, image: RgbaImage, timestamp: Instant) -> Result<u64, FrameStoreError> {
        let index = self.next_index;
        let spool_path = self.dir.join(format!("{:08}.rgba", index));

        if let Err(e) = fs::write(&spool_path, image.as_raw()) {
            let _ = fs::remove_file(&spool_path);
            return Err(FrameStoreError::Append {
                index,
                reason: e.to_string(),
            });
        }

        self.frames.push_back(FrameRecord {
            index,
            timestamp,
            width: image.width(),
            height: image.height(),
            spool_path,
        });
        self.next_index += 1;

        Ok(index)
    }

    pub fn pop_front(&mut self) -> Option<FrameRecord> {
        self.frames.pop_front()
    }

    pub fn front(&self) -> Option<&FrameRecord> {
        self.frames.front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Time between the first and the last buffered frame.
    pub fn timespan(&self) -> Option<Duration> {
        let first = self.frames.front()?;
        let last = self.frames.back()?;
        Some(last.timestamp.saturating_duration_since(first.timestamp))
    }

    /// Destroys every spooled frame. Sequence numbering continues.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn spool_dir(&self) -> &Path {
        &self.dir
    }

    /// Pops every frame and writes it to `dir` as an image named after its
    /// sequence index. `on_frame` receives the number written so far and may
    /// return false to stop early. Returns the number of frames written.
    pub fn drain_to_disk(
        &mut self,
        dir: &Path,
        naming: &FrameNaming,
        mut on_frame: impl FnMut(usize) -> bool,
    ) -> Result<usize, FrameStoreError> {
        fs::create_dir_all(dir).map_err(|e| FrameStoreError::Write {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut written = 0;
        while let Some(frame) = self.pop_front() {
            let path = dir.join(naming.file_name(frame.index()));
            frame.save_as(&path, naming.format)?;
            written += 1;

            if !on_frame(written) {
                break;
            }
        }

        tracing::debug!(target: "recorder", "[STORE] Wrote {} frames to {:?}", written, dir);
        Ok(written)
    }
}

impl Drop for FrameStore {
    fn drop(&mut self) {
        self.frames.clear();
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(target: "recorder", "[STORE] Failed to remove store directory: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("frames", &self.frames.len())
            .field("next_index", &self.next_index)
            .field("dir", &self.dir)
            .finish()
    }
}
