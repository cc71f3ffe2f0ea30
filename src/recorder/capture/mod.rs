//! Producer side of a recording: the frame source abstraction and the
//! capture loop that paces it into a `FrameStore`.

mod screen;

pub use screen::ScreenSource;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use image::RgbaImage;

use super::errors::{CaptureError, FrameStoreError};
use super::frames::FrameStore;
use super::task::CancelToken;
use super::types::{Rect, FALLBACK_FRAME_RATE};

/// Poll interval while paused.
pub const PAUSE_POLL: Duration = Duration::from_millis(500);

/// Something that can snapshot a region of the screen.
pub trait FrameSource: Send + Sync {
    /// Bounds of the default capture area (the primary screen).
    fn screen_frame(&self) -> Result<Rect, CaptureError>;

    /// Snapshot `area` into a freshly allocated image.
    fn grab(&self, area: Rect) -> Result<RgbaImage, CaptureError>;

    /// Whether `wait_for_retrace` can block until the next display refresh.
    fn supports_retrace(&self) -> bool {
        false
    }

    /// Block until the next display refresh or `timeout`, whichever is first.
    fn wait_for_retrace(&self, timeout: Duration) {
        let _ = timeout;
    }
}

/// Settings snapshot taken when a recording starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureParams {
    pub area: Rect,
    pub frame_rate: u32,
}

impl CaptureParams {
    pub fn new(area: Rect, frame_rate: u32) -> Self {
        let frame_rate = if frame_rate == 0 {
            FALLBACK_FRAME_RATE
        } else {
            frame_rate
        };
        Self { area, frame_rate }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.frame_rate as u64)
    }
}

/// Pause flag shared between the controller and the capture loop.
///
/// The loop appends frames while holding the gate, so once `set(true)`
/// returns no further frame reaches the store until `set(false)`.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: Mutex<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, paused: bool) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = paused;
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `admit` unless paused. Pausing waits for a running `admit`.
    fn admit<R>(&self, admit: impl FnOnce() -> R) -> Option<R> {
        let paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        if *paused {
            return None;
        }
        Some(admit())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u32,
    /// Snapshots that finished after a kill or pause request and were thrown away.
    pub discarded: u32,
}

/// Runs until `token` is cancelled or a snapshot/append fails.
///
/// Each iteration grabs one frame, appends it to `store` and bumps
/// `frame_count`, then waits out the rest of the frame interval. Frames may be
/// late under load but are never early. While `paused` is set the loop only
/// sleeps, and a snapshot that completes after a pause is dropped.
pub fn run_capture_loop(
    source: &dyn FrameSource,
    store: &mut FrameStore,
    params: &CaptureParams,
    paused: &PauseGate,
    frame_count: &AtomicU32,
    token: &CancelToken,
) -> Result<CaptureStats, CaptureError> {
    let interval = params.interval();
    let mut stats = CaptureStats::default();

    tracing::info!(target: "recorder",
        "[CAPTURE] Loop started: area={:?} @ {}fps",
        params.area, params.frame_rate);

    loop {
        if token.is_cancelled() {
            break;
        }

        if paused.is_paused() {
            token.sleep(PAUSE_POLL);
            continue;
        }

        let image = source.grab(params.area).map_err(|e| {
            tracing::error!(target: "recorder", "[CAPTURE] Snapshot failed: {}", e);
            e
        })?;

        if token.is_cancelled() {
            stats.discarded += 1;
            tracing::debug!(target: "recorder", "[CAPTURE] Kill requested during snapshot, discarding frame");
            break;
        }

        let timestamp = Instant::now();
        let appended = paused.admit(|| -> Result<u32, FrameStoreError> {
            store.append(image, timestamp)?;
            Ok(frame_count.fetch_add(1, Ordering::SeqCst) + 1)
        });
        let total = match appended {
            None => {
                stats.discarded += 1;
                tracing::debug!(target: "recorder", "[CAPTURE] Paused during snapshot, discarding frame");
                continue;
            }
            Some(Err(e)) => {
                tracing::error!(target: "recorder", "[CAPTURE] Frame store append failed: {}", e);
                return Err(CaptureError::OutOfResources(e.to_string()));
            }
            Some(Ok(total)) => total,
        };
        stats.frames += 1;

        if total % 100 == 0 {
            tracing::debug!(target: "recorder", "[CAPTURE] Captured {} frames", total);
        }

        let deadline = timestamp + interval;
        if source.supports_retrace() {
            source.wait_for_retrace(deadline.saturating_duration_since(Instant::now()));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !remaining.is_zero() {
            token.sleep(remaining);
        }
    }

    tracing::info!(target: "recorder",
        "[CAPTURE] Loop finished: {} frames, {} discarded",
        stats.frames, stats.discarded);

    Ok(stats)
}
