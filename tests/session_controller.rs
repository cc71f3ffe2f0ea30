//! Integration tests for the session controller.
//!
//! The controller is driven with an in-memory frame source and a fake encoder
//! that records what it was handed, so the full capture -> store -> encode
//! pipeline runs on real threads without touching the display or ffmpeg.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use tokio::sync::broadcast::error::TryRecvError;

use screenclip_lib::core::settings::CaptureSettings;
use screenclip_lib::recorder::task::CancelToken;
use screenclip_lib::recorder::{
    CaptureError, Codec, EncodeError, EncodeJob, EncodeProgress, Encoder, FrameSource, FrameStore,
    MediaFileFormat, Notification, NotificationReceiver, QuitRefusal, Rect, SessionController,
    SessionError, SessionState, Status, VideoDepth,
};

const SCREEN: Rect = Rect::new(0, 0, 8, 6);
const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Fakes
// =============================================================================

/// Produces solid frames whose red channel is the grab counter.
#[derive(Default)]
struct SolidSource {
    grabs: AtomicU32,
    fail_at: Option<u32>,
    grab_delay: Duration,
    /// Deletes this directory during the given grab.
    wipe_at: Option<(u32, PathBuf)>,
}

impl SolidSource {
    fn failing_at(grab: u32) -> Self {
        Self {
            fail_at: Some(grab),
            ..Default::default()
        }
    }

    fn wiping_at(grab: u32, dir: PathBuf) -> Self {
        Self {
            wipe_at: Some((grab, dir)),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            grab_delay: delay,
            ..Default::default()
        }
    }
}

impl FrameSource for SolidSource {
    fn screen_frame(&self) -> Result<Rect, CaptureError> {
        Ok(SCREEN)
    }

    fn grab(&self, area: Rect) -> Result<RgbaImage, CaptureError> {
        if !self.grab_delay.is_zero() {
            thread::sleep(self.grab_delay);
        }
        let n = self.grabs.fetch_add(1, Ordering::SeqCst);
        if Some(n) == self.fail_at {
            return Err(CaptureError::DeviceRead("display disconnected".to_string()));
        }
        if let Some((_, dir)) = self.wipe_at.as_ref().filter(|(at, _)| *at == n) {
            let _ = fs::remove_dir_all(dir);
        }
        Ok(RgbaImage::from_pixel(
            area.width,
            area.height,
            Rgba([n as u8, 0, 0, 255]),
        ))
    }
}

#[derive(Default)]
struct Seen {
    indices: Vec<u64>,
    timestamps: Vec<Instant>,
    jobs: Vec<EncodeJob>,
}

/// Consumes frames in order and writes the first pixel of each to the output.
struct FakeEncoder {
    formats: Vec<MediaFileFormat>,
    per_frame: Duration,
    /// Keeps going after cancellation, like an encoder that cannot be interrupted.
    stubborn: bool,
    seen: Mutex<Seen>,
}

impl Default for FakeEncoder {
    fn default() -> Self {
        Self {
            formats: vec![MediaFileFormat::Mp4, MediaFileFormat::Gif],
            per_frame: Duration::ZERO,
            stubborn: false,
            seen: Mutex::new(Seen::default()),
        }
    }
}

impl FakeEncoder {
    fn slow(per_frame: Duration) -> Self {
        Self {
            per_frame,
            ..Default::default()
        }
    }

    fn stubborn(per_frame: Duration) -> Self {
        Self {
            per_frame,
            stubborn: true,
            ..Default::default()
        }
    }

    fn indices(&self) -> Vec<u64> {
        self.seen.lock().unwrap().indices.clone()
    }

    fn jobs(&self) -> Vec<EncodeJob> {
        self.seen.lock().unwrap().jobs.clone()
    }
}

impl Encoder for FakeEncoder {
    fn formats(&self) -> Vec<MediaFileFormat> {
        self.formats.clone()
    }

    fn codecs(&self, format: MediaFileFormat) -> Vec<Codec> {
        if !self.formats.contains(&format) {
            return Vec::new();
        }
        match format {
            MediaFileFormat::Mp4 => vec![Codec::new("H.264", "libx264"), Codec::new("MPEG-4", "mpeg4")],
            MediaFileFormat::Gif => vec![Codec::new("GIF", "gif")],
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
        self.seen.lock().unwrap().jobs.push(job.clone());

        let total = frames.len();
        progress(EncodeProgress::started(total, "Encoding"));

        let mut pixels = Vec::with_capacity(total);
        while let Some(frame) = frames.pop_front() {
            if cancel.is_cancelled() && !self.stubborn {
                return Err(EncodeError::Cancelled);
            }

            let image = frame.load()?;
            pixels.push(image.get_pixel(0, 0)[0]);
            {
                let mut seen = self.seen.lock().unwrap();
                seen.indices.push(frame.index());
                seen.timestamps.push(frame.timestamp());
            }

            if !self.per_frame.is_zero() {
                if self.stubborn {
                    thread::sleep(self.per_frame);
                } else {
                    cancel.sleep(self.per_frame);
                }
            }
            progress(EncodeProgress::frames(frames.len(), total));
        }

        fs::write(&job.output, &pixels).map_err(|e| EncodeError::WriteFailed(e.to_string()))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn settings(dir: &Path, fps: u32) -> CaptureSettings {
    CaptureSettings {
        capture_area: Some(SCREEN),
        frame_rate: fps,
        output_file_name: dir.join("clip.mp4"),
        ..Default::default()
    }
}

fn controller(
    settings: CaptureSettings,
    source: SolidSource,
    encoder: &Arc<FakeEncoder>,
) -> SessionController {
    let encoder: Arc<dyn Encoder> = encoder.clone();
    SessionController::new(settings, Arc::new(source), encoder).unwrap()
}

/// Collects notifications until one matches `done` or `timeout` passes.
/// The matching notification is the last element when found.
fn collect_until(
    rx: &mut NotificationReceiver,
    timeout: Duration,
    mut done: impl FnMut(&Notification) -> bool,
) -> (Vec<Notification>, bool) {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();

    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(event) => {
                let matched = done(&event);
                events.push(event);
                if matched {
                    return (events, true);
                }
            }
            Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => break,
        }
    }

    (events, false)
}

fn is_encode_finished(event: &Notification) -> bool {
    matches!(event, Notification::EncodeFinished { .. })
}

/// Waits for the terminal encode notification and returns its payload.
fn wait_encode_finished(rx: &mut NotificationReceiver) -> (Status, Option<PathBuf>, Vec<Notification>) {
    let (events, found) = collect_until(rx, FINISH_TIMEOUT, is_encode_finished);
    assert!(found, "no EncodeFinished within {:?}: {:?}", FINISH_TIMEOUT, events);

    match events.last() {
        Some(Notification::EncodeFinished {
            status,
            output_path,
        }) => (status.clone(), output_path.clone(), events),
        _ => unreachable!(),
    }
}

fn drain(rx: &mut NotificationReceiver) -> Vec<Notification> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    entries.sort();
    entries
}

// =============================================================================
// Recording and handoff
// =============================================================================

#[test]
fn test_ten_fps_for_half_a_second_captures_five_frames() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 10), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    assert_eq!(controller.state(), SessionState::Recording { paused: false });
    thread::sleep(Duration::from_millis(450));
    controller.toggle_capture();

    let frames = controller.recorded_frames();
    assert!((4..=6).contains(&frames), "captured {} frames", frames);

    let (status, output, events) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Ok);
    assert_eq!(output, Some(tmp.path().join("clip.mp4")));
    assert!(events.contains(&Notification::EncodeStarted {
        frames_total: frames as usize
    }));

    assert_eq!(encoder.indices(), (0..frames as u64).collect::<Vec<_>>());
    assert_eq!(fs::read(tmp.path().join("clip.mp4")).unwrap().len(), frames as usize);
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.average_fps() > 0.0);
}

#[test]
fn test_frames_reach_encoder_in_capture_order() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 50), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(200));
    controller.toggle_capture();
    let (status, _, events) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Ok);

    let seen = encoder.seen.lock().unwrap();
    assert!(!seen.indices.is_empty());
    assert!(seen.indices.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(seen.timestamps.windows(2).all(|w| w[1] > w[0]));

    // Pixel values are the grab counter, so the output preserves capture order.
    let written = fs::read(tmp.path().join("clip.mp4")).unwrap();
    assert!(written.windows(2).all(|w| w[1] == w[0] + 1));

    let remaining: Vec<usize> = events
        .iter()
        .filter_map(|event| match event {
            Notification::EncodeProgress {
                frames_remaining, ..
            } => Some(*frames_remaining),
            _ => None,
        })
        .collect();
    assert!(!remaining.is_empty());
    assert!(remaining.windows(2).all(|w| w[1] <= w[0]), "{:?}", remaining);
    assert_eq!(remaining.last(), Some(&0));

    let started = events
        .iter()
        .position(|e| matches!(e, Notification::EncodeStarted { .. }))
        .unwrap();
    let first_progress = events
        .iter()
        .position(|e| matches!(e, Notification::EncodeProgress { .. }))
        .unwrap();
    assert!(started < first_progress);
}

#[test]
fn test_settings_are_snapshotted_when_recording_starts() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 10), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    controller.set_capture_frame_rate(30);
    controller.set_capture_area(Rect::new(0, 0, 4, 2)).unwrap();
    thread::sleep(Duration::from_millis(150));
    controller.toggle_capture();
    wait_encode_finished(&mut rx);

    let jobs = encoder.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].frame_rate, 10);
    assert_eq!(jobs[0].target, Rect::new(0, 0, 8, 6));
    assert_eq!(jobs[0].codec, Codec::new("H.264", "libx264"));
    assert_eq!(controller.settings().frame_rate, 30);
}

#[test]
fn test_toggle_cycles_never_overwrite_previous_clip() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 20), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    let mut outputs = Vec::new();
    for _ in 0..2 {
        controller.toggle_capture();
        assert!(controller.state().is_recording());
        thread::sleep(Duration::from_millis(120));
        controller.toggle_capture();

        let (status, output, _) = wait_encode_finished(&mut rx);
        assert_eq!(status, Status::Ok);
        assert_eq!(controller.state(), SessionState::Idle);
        outputs.push(output.unwrap());
    }

    assert_eq!(
        outputs,
        vec![tmp.path().join("clip.mp4"), tmp.path().join("clip-1.mp4")]
    );
    outputs.sort();
    assert_eq!(dir_entries(tmp.path()), outputs);
}

#[test]
fn test_toggle_is_ignored_while_encoding() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::slow(Duration::from_millis(40)));
    let controller = controller(settings(tmp.path(), 50), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(150));
    controller.toggle_capture();
    assert_eq!(controller.state(), SessionState::Encoding);

    controller.toggle_capture();
    assert_eq!(controller.state(), SessionState::Encoding);
    assert_eq!(controller.can_quit(), Err(QuitRefusal::Encoding));

    let (status, _, events) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Ok);
    let starts = events
        .iter()
        .filter(|e| matches!(e, Notification::CaptureStarted))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(controller.can_quit(), Ok(()));
}

// =============================================================================
// Pause and auto-stop
// =============================================================================

#[test]
fn test_pause_freezes_frames_and_clock() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 20), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    controller.toggle_pause();
    assert_eq!(controller.state(), SessionState::Recording { paused: true });

    // Let any in-flight iteration finish before sampling.
    thread::sleep(Duration::from_millis(100));
    let frames_at_pause = controller.recorded_frames();
    let clock_at_pause = controller.record_time();
    thread::sleep(Duration::from_secs(1));
    assert_eq!(controller.recorded_frames(), frames_at_pause);
    assert_eq!(controller.record_time(), clock_at_pause);

    controller.toggle_pause();
    assert_eq!(controller.state(), SessionState::Recording { paused: false });
    // The loop notices a resume at its next pause poll.
    thread::sleep(Duration::from_millis(700));
    controller.toggle_capture();

    let elapsed = controller.record_time();
    assert!(elapsed >= Duration::from_millis(650), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1300), "{:?}", elapsed);
    assert!(controller.recorded_frames() > frames_at_pause);

    let (status, _, events) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Ok);
    assert!(events.contains(&Notification::CapturePaused));
    assert!(events.contains(&Notification::CaptureResumed));

    // Resuming continued the same numbering.
    let indices = encoder.indices();
    assert_eq!(indices, (0..indices.len() as u64).collect::<Vec<_>>());
}

#[test]
fn test_pause_during_slow_snapshot_adds_no_frame() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(
        settings(tmp.path(), 2),
        SolidSource::slow(Duration::from_millis(300)),
        &encoder,
    );

    controller.toggle_capture();
    // The first snapshot is still in flight when the pause lands.
    thread::sleep(Duration::from_millis(100));
    controller.toggle_pause();
    let frames_at_pause = controller.recorded_frames();

    thread::sleep(Duration::from_secs(1));
    assert_eq!(
        controller.recorded_frames(),
        frames_at_pause,
        "frame count changed while paused"
    );

    controller.cancel();
    assert_eq!(controller.state(), SessionState::Idle);
}

#[test]
fn test_auto_stop_ends_recording_once() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 20), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller
        .set_recording_time(Duration::from_millis(400))
        .unwrap();
    let start = Instant::now();
    controller.toggle_capture();

    let (_, stopped) = collect_until(&mut rx, FINISH_TIMEOUT, |e| {
        matches!(e, Notification::CaptureStopped { .. })
    });
    assert!(stopped);
    let stopped_after = start.elapsed();
    assert!(stopped_after >= Duration::from_millis(400), "{:?}", stopped_after);
    assert!(stopped_after < Duration::from_secs(3), "{:?}", stopped_after);

    let (status, _, _) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Ok);
    assert_eq!(controller.state(), SessionState::Idle);

    // The duration was consumed by the first recording.
    controller.toggle_capture();
    thread::sleep(Duration::from_millis(700));
    assert!(controller.state().is_recording());
    controller.toggle_capture();
    wait_encode_finished(&mut rx);
}

#[test]
fn test_recording_time_rejected_while_recording() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 20), SolidSource::default(), &encoder);

    controller.toggle_capture();
    assert_eq!(
        controller.set_recording_time(Duration::from_secs(1)),
        Err(SessionError::RecordingInProgress)
    );
    controller.cancel();

    assert_eq!(controller.set_recording_time(Duration::from_secs(1)), Ok(()));
    assert_eq!(controller.set_recording_time(Duration::ZERO), Ok(()));
}

// =============================================================================
// Cancellation
// =============================================================================

#[test]
fn test_cancel_recording_discards_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 50), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(150));
    assert!(controller.recorded_frames() > 0);
    controller.cancel();

    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(controller.recorded_frames(), 0);

    thread::sleep(Duration::from_millis(100));
    let events = drain(&mut rx);
    assert!(events.contains(&Notification::CaptureStopped {
        status: Status::Cancelled
    }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Notification::EncodeStarted { .. } | Notification::EncodeFinished { .. })));
    assert!(encoder.jobs().is_empty());
    assert!(dir_entries(tmp.path()).is_empty());
}

#[test]
fn test_cancel_paused_recording() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 50), SolidSource::default(), &encoder);

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(60));
    controller.toggle_pause();

    let start = Instant::now();
    controller.cancel();
    assert!(start.elapsed() < Duration::from_millis(400));
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(controller.recorded_frames(), 0);
}

#[test]
fn test_cancel_during_encoding_reports_cancelled() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::slow(Duration::from_millis(100)));
    let controller = controller(settings(tmp.path(), 50), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(200));
    controller.toggle_capture();
    assert_eq!(controller.state(), SessionState::Encoding);

    controller.cancel();
    assert_eq!(controller.state(), SessionState::Idle);

    let (status, output, _) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Cancelled);
    assert_eq!(output, None);
    assert!(dir_entries(tmp.path()).is_empty());
}

#[test]
fn test_cancel_is_reported_even_if_encoder_finishes() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::stubborn(Duration::from_millis(20)));
    let controller = controller(settings(tmp.path(), 50), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(200));
    controller.toggle_capture();
    controller.cancel();

    let (status, output, _) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Cancelled);
    assert_eq!(output, None);
    assert!(!tmp.path().join("clip.mp4").exists());
    assert!(dir_entries(tmp.path()).is_empty());
}

#[test]
fn test_drop_while_recording_joins_capture() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 50), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller
        .set_recording_time(Duration::from_secs(30))
        .unwrap();
    controller.toggle_capture();
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    drop(controller);
    assert!(start.elapsed() < Duration::from_secs(2));

    let events = drain(&mut rx);
    assert!(events.contains(&Notification::CaptureStopped {
        status: Status::Cancelled
    }));
    assert!(encoder.jobs().is_empty());
}

#[test]
fn test_drop_while_encoding_cancels_encoder() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::slow(Duration::from_millis(100)));
    let controller = controller(settings(tmp.path(), 50), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(200));
    controller.toggle_capture();
    drop(controller);

    // Dropping joined the encode thread, so its terminal event is already queued.
    let events = drain(&mut rx);
    assert!(events.contains(&Notification::EncodeFinished {
        status: Status::Cancelled,
        output_path: None,
    }));
    assert!(dir_entries(tmp.path()).is_empty());
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_empty_recording_never_reaches_encoder() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(
        settings(tmp.path(), 10),
        SolidSource::slow(Duration::from_millis(300)),
        &encoder,
    );
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    controller.toggle_capture();

    let (status, output, events) = wait_encode_finished(&mut rx);
    assert!(matches!(status, Status::Error { ref message } if message == "Nothing was recorded"));
    assert_eq!(output, None);
    assert!(!events
        .iter()
        .any(|e| matches!(e, Notification::EncodeStarted { .. })));

    thread::sleep(Duration::from_millis(200));
    assert!(!drain(&mut rx).iter().any(is_encode_finished));
    assert!(encoder.jobs().is_empty());
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(controller.recorded_frames(), 0);
}

#[test]
fn test_capture_failure_returns_to_idle() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 50), SolidSource::failing_at(2), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    let (events, stopped) = collect_until(&mut rx, FINISH_TIMEOUT, |e| {
        matches!(e, Notification::CaptureStopped { .. })
    });
    assert!(stopped);
    match events.last() {
        Some(Notification::CaptureStopped {
            status: Status::Error { message },
        }) => assert!(message.contains("display disconnected"), "{}", message),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(controller.recorded_frames(), 0);
    assert!(encoder.jobs().is_empty());

    // The controller stays usable for the next attempt.
    controller.toggle_capture();
    thread::sleep(Duration::from_millis(100));
    controller.toggle_capture();
    let (status, _, _) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Ok);
}

#[test]
fn test_spool_failure_mid_recording_stops_with_error() {
    let tmp = tempfile::tempdir().unwrap();
    let spool = tmp.path().join("spool");
    let mut config = settings(tmp.path(), 50);
    config.spool_dir = Some(spool.clone());

    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(config, SolidSource::wiping_at(3, spool), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    let (events, stopped) = collect_until(&mut rx, FINISH_TIMEOUT, |e| {
        matches!(e, Notification::CaptureStopped { .. })
    });
    assert!(stopped, "recording kept going without storage: {:?}", events);
    match events.last() {
        Some(Notification::CaptureStopped {
            status: Status::Error { message },
        }) => assert!(
            message.starts_with("Out of resources while buffering frames"),
            "{}",
            message
        ),
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(controller.recorded_frames(), 0);
    assert!(encoder.jobs().is_empty());
}

#[test]
fn test_spool_is_emptied_after_each_recording() {
    let tmp = tempfile::tempdir().unwrap();
    let spool = tmp.path().join("spool");
    let mut config = settings(tmp.path(), 50);
    config.spool_dir = Some(spool.clone());

    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(config, SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(dir_entries(&spool).len(), 1, "one spool directory while recording");
    controller.toggle_capture();
    let (status, _, _) = wait_encode_finished(&mut rx);
    assert_eq!(status, Status::Ok);
    assert!(dir_entries(&spool).is_empty(), "spool left after encoding");

    controller.toggle_capture();
    thread::sleep(Duration::from_millis(100));
    controller.cancel();
    assert!(dir_entries(&spool).is_empty(), "spool left after cancel");
}

// =============================================================================
// Queries and settings
// =============================================================================

#[test]
fn test_can_quit_follows_state() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 20), SolidSource::default(), &encoder);

    assert_eq!(controller.can_quit(), Ok(()));
    controller.toggle_capture();
    let refusal = controller.can_quit().unwrap_err();
    assert_eq!(refusal, QuitRefusal::Recording);
    assert_eq!(refusal.to_string(), "Recording in progress.");
    controller.cancel();
    assert_eq!(controller.can_quit(), Ok(()));
}

#[test]
fn test_setters_publish_notifications() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 20), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.set_capture_area(Rect::new(10, 20, 100, 50)).unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![
            Notification::SourceFrameChanged {
                rect: Rect::new(10, 20, 100, 50)
            },
            Notification::CodecListUpdated,
            Notification::TargetFrameChanged {
                rect: Rect::new(0, 0, 100, 50),
                scale: 1.0
            },
        ]
    );

    controller.set_scale(0.5).unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![Notification::TargetFrameChanged {
            rect: Rect::new(0, 0, 50, 25),
            scale: 0.5
        }]
    );
    assert_eq!(controller.target_frame(), Rect::new(0, 0, 50, 25));

    controller.set_capture_frame_rate(30);
    controller.set_video_depth(VideoDepth::Gray8);
    assert_eq!(
        drain(&mut rx),
        vec![
            Notification::CaptureFrameRateChanged { fps: 30 },
            Notification::VideoDepthChanged {
                depth: VideoDepth::Gray8
            },
        ]
    );

    controller.set_media_file_format("gif").unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![
            Notification::MediaFileFormatChanged {
                name: "gif".to_string()
            },
            Notification::CodecListUpdated,
            Notification::CodecChanged {
                name: "GIF".to_string()
            },
        ]
    );
    assert_eq!(controller.media_file_format(), MediaFileFormat::Gif);
    assert_eq!(controller.codecs(), vec![Codec::new("GIF", "gif")]);

    controller.set_media_file_format("mp4").unwrap();
    controller.set_media_codec("mpeg4").unwrap();
    assert_eq!(controller.media_codec(), Codec::new("MPEG-4", "mpeg4"));
    assert_eq!(
        drain(&mut rx).last(),
        Some(&Notification::CodecChanged {
            name: "MPEG-4".to_string()
        })
    );

    // Switching format keeps a codec the new format also offers.
    controller.set_media_file_format("mp4").unwrap();
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, Notification::CodecChanged { .. })));
}

#[test]
fn test_invalid_settings_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 20), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    assert!(matches!(
        controller.set_scale(0.0),
        Err(SessionError::InvalidSetting(_))
    ));
    assert!(matches!(
        controller.set_scale(f32::NAN),
        Err(SessionError::InvalidSetting(_))
    ));
    assert!(matches!(
        controller.set_capture_area(Rect::new(0, 0, 0, 10)),
        Err(SessionError::InvalidSetting(_))
    ));
    assert_eq!(
        controller.set_media_file_format("webm"),
        Err(SessionError::UnsupportedFormat("webm".to_string()))
    );
    assert_eq!(
        controller.set_media_file_format("avi"),
        Err(SessionError::UnsupportedFormat("avi".to_string()))
    );
    assert_eq!(
        controller.set_media_codec("vp9"),
        Err(SessionError::UnknownCodec("vp9".to_string()))
    );

    assert!(drain(&mut rx).is_empty());
    assert_eq!(controller.media_file_format(), MediaFileFormat::Mp4);
}

#[test]
fn test_selection_window_and_reset() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let controller = controller(settings(tmp.path(), 5), SolidSource::default(), &encoder);
    let mut rx = controller.subscribe();

    controller.selection_window_closed(None);
    assert_eq!(drain(&mut rx), vec![Notification::SelectionWindowClosed]);

    controller.selection_window_closed(Some(Rect::new(2, 2, 4, 4)));
    let events = drain(&mut rx);
    assert_eq!(events[0], Notification::SelectionWindowClosed);
    assert!(events.contains(&Notification::SourceFrameChanged {
        rect: Rect::new(2, 2, 4, 4)
    }));
    assert_eq!(controller.settings().capture_area, Some(Rect::new(2, 2, 4, 4)));

    controller.set_media_file_format("gif").unwrap();
    drain(&mut rx);
    controller.reset_settings();

    assert_eq!(drain(&mut rx), vec![Notification::ResetSettings]);
    let settings = controller.settings();
    assert_eq!(settings.capture_area, Some(SCREEN));
    assert_eq!(settings.frame_rate, CaptureSettings::default().frame_rate);
    assert_eq!(settings.scale, 1.0);
    assert_eq!(settings.output_format, "mp4");
    assert_eq!(settings.output_codec, "H.264");
}

#[test]
fn test_construction_resolves_format_and_codec() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder = Arc::new(FakeEncoder::default());
    let mut config = settings(tmp.path(), 20);
    config.output_format = "avi".to_string();
    config.output_codec = "MPEG-4".to_string();
    config.capture_area = None;

    let controller = controller(config, SolidSource::default(), &encoder);

    assert_eq!(
        controller.media_file_formats(),
        vec![MediaFileFormat::Mp4, MediaFileFormat::Gif]
    );
    assert_eq!(controller.media_file_format(), MediaFileFormat::Mp4);
    assert_eq!(controller.media_codec(), Codec::new("MPEG-4", "mpeg4"));
    assert_eq!(controller.settings().capture_area, Some(SCREEN));
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(controller.record_time(), Duration::ZERO);
    assert_eq!(controller.average_fps(), 0.0);
}

#[test]
fn test_construction_fails_without_usable_format() {
    let tmp = tempfile::tempdir().unwrap();
    let encoder: Arc<dyn Encoder> = Arc::new(FakeEncoder {
        formats: Vec::new(),
        ..Default::default()
    });

    let result = SessionController::new(
        settings(tmp.path(), 20),
        Arc::new(SolidSource::default()),
        encoder,
    );
    assert!(matches!(result, Err(SessionError::NoSuitableFormat)));
}
