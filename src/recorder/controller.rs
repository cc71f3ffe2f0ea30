//! SessionController - single owner of the recording session.
//!
//! The controller owns the capture and encode threads, the frame store while
//! it is in transit between them, the recording stopwatch and the optional
//! auto-stop timer. Commands are serialized through a command lock and
//! inspect or mutate the session under a second, short-lived session lock.
//! Worker threads only ever take the session lock, and no lock is held while
//! a worker is joined.
//!
//! Lifecycle:
//! - Idle -> Recording: allocate a `FrameStore`, move it into the capture thread
//! - Recording -> Encoding: cancel and join the capture thread, move its store
//!   into the encode thread
//! - Encoding -> Idle: the encode thread relocates the output and clears its
//!   own handle
//!
//! The state is never stored; `state()` derives it from which handles are live.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::settings::CaptureSettings;
use crate::shared::paths::default_output_file;

use super::capture::{run_capture_loop, CaptureParams, CaptureStats, FrameSource, PauseGate};
use super::encoder::{
    output_destination, relocate, remove_output, reserve_temp_output, EncodeJob, EncodeProgress,
    Encoder,
};
use super::errors::{CaptureError, EncodeError, QuitRefusal, SessionError};
use super::frames::FrameStore;
use super::notify::{Notification, NotificationBus, NotificationReceiver, Status};
use super::state::{transition, SessionEvent, SessionState, SideEffect};
use super::stopwatch::Stopwatch;
use super::task::{CancelToken, Joinable, OneShotTimer, WorkerTask};
use super::types::{Codec, MediaFileFormat, Rect, VideoDepth, DEFAULT_FRAME_RATE};

/// Capture area used when neither the settings nor the screen provide one.
const FALLBACK_AREA: Rect = Rect::new(0, 0, 640, 480);

type CaptureReport = Result<(FrameStore, CaptureStats), CaptureError>;

struct Session {
    area: Rect,
    screen: Rect,
    frame_rate: u32,
    scale: f32,
    depth: VideoDepth,
    output_file: PathBuf,
    spool_dir: Option<PathBuf>,
    format: MediaFileFormat,
    codec: Codec,
    codecs: Vec<Codec>,

    capture: Option<WorkerTask<CaptureReport>>,
    /// Area and rate the current (or last) recording was started with.
    recording: CaptureParams,
    encode: Option<WorkerTask<()>>,
    /// Between joining the capture thread and handing its frames to the encoder.
    handoff_pending: bool,
    paused: bool,
    stopwatch: Stopwatch,
    requested_duration: Option<Duration>,
    auto_stop: Option<OneShotTimer>,
    /// Threads that are done or were told to stop, awaiting a join.
    retired: Vec<Box<dyn Joinable>>,
    shutting_down: bool,
}

impl Session {
    fn state(&self) -> SessionState {
        if self.capture.is_some() {
            SessionState::Recording {
                paused: self.paused,
            }
        } else if self.encode.is_some() || self.handoff_pending {
            SessionState::Encoding
        } else {
            SessionState::Idle
        }
    }

    fn target_frame(&self) -> Rect {
        self.area.scaled(self.scale)
    }

    fn disarm_auto_stop(&mut self) {
        if let Some(timer) = self.auto_stop.take() {
            let handle = timer.disarm();
            self.retired.push(handle);
        }
    }
}

struct Shared {
    commands: Mutex<()>,
    session: Mutex<Session>,
    /// Read without any lock for live FPS queries.
    frame_count: AtomicU32,
    paused: PauseGate,
    next_task_id: AtomicU64,
    bus: NotificationBus,
    source: Arc<dyn FrameSource>,
    encoder: Arc<dyn Encoder>,
}

/// Explicitly owned controller for one recording session at a time.
///
/// Dropping it cancels whatever is in flight and joins every thread it started.
pub struct SessionController {
    shared: Arc<Shared>,
}

/// Picks the configured format if the encoder supports it, otherwise the
/// default format, otherwise the first supported format with codecs.
fn resolve_format(
    encoder: &dyn Encoder,
    name: &str,
) -> Result<(MediaFileFormat, Vec<Codec>), SessionError> {
    let supported = encoder.formats();
    let preferred = MediaFileFormat::from_name(name)
        .into_iter()
        .chain(std::iter::once(MediaFileFormat::default()))
        .chain(supported.iter().copied());

    for format in preferred {
        if !supported.contains(&format) {
            continue;
        }
        let codecs = encoder.codecs(format);
        if !codecs.is_empty() {
            return Ok((format, codecs));
        }
    }

    Err(SessionError::NoSuitableFormat)
}

fn find_codec(codecs: &[Codec], name: &str) -> Option<Codec> {
    let name = name.trim();
    codecs
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name) || c.encoder.eq_ignore_ascii_case(name))
        .cloned()
}

impl SessionController {
    pub fn new(
        settings: CaptureSettings,
        source: Arc<dyn FrameSource>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, SessionError> {
        let (format, codecs) = resolve_format(encoder.as_ref(), &settings.output_format)?;
        let codec = find_codec(&codecs, &settings.output_codec)
            .or_else(|| codecs.first().cloned())
            .ok_or(SessionError::NoSuitableFormat)?;

        let screen = source.screen_frame().unwrap_or_else(|e| {
            tracing::warn!(target: "recorder", "[SESSION] Screen bounds unavailable ({}), using {:?}", e, FALLBACK_AREA);
            FALLBACK_AREA
        });
        let area = settings
            .capture_area
            .filter(|area| !area.is_empty())
            .unwrap_or(screen);
        let scale = if settings.scale.is_finite() && settings.scale > 0.0 {
            settings.scale
        } else {
            1.0
        };

        tracing::info!(target: "recorder",
            "[SESSION] Controller ready: area={:?} @ {}fps, {} / {}",
            area, settings.frame_rate, format.short_name(), codec.name);

        let session = Session {
            area,
            screen,
            frame_rate: settings.frame_rate,
            scale,
            depth: settings.video_depth,
            output_file: settings.output_file_name,
            spool_dir: settings.spool_dir,
            format,
            codec,
            codecs,
            capture: None,
            recording: CaptureParams::new(area, settings.frame_rate),
            encode: None,
            handoff_pending: false,
            paused: false,
            stopwatch: Stopwatch::default(),
            requested_duration: None,
            auto_stop: None,
            retired: Vec::new(),
            shutting_down: false,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                commands: Mutex::new(()),
                session: Mutex::new(session),
                frame_count: AtomicU32::new(0),
                paused: PauseGate::new(),
                next_task_id: AtomicU64::new(1),
                bus: NotificationBus::new(),
                source,
                encoder,
            }),
        })
    }

    pub fn subscribe(&self) -> NotificationReceiver {
        self.shared.bus.subscribe()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Starts a recording when idle, stops it when recording. Ignored while encoding.
    pub fn toggle_capture(&self) {
        self.shared.command(SessionEvent::ToggleCapture);
    }

    pub fn toggle_pause(&self) {
        self.shared.command(SessionEvent::TogglePause);
    }

    /// Discards a recording (joining the capture thread) or asks the encoder
    /// to stop (without waiting for it).
    pub fn cancel(&self) {
        self.shared.command(SessionEvent::Cancel);
    }

    /// Arms auto-stop for the next recording. Zero clears it.
    pub fn set_recording_time(&self, duration: Duration) -> Result<(), SessionError> {
        self.shared.configure(|_, session| {
            if session.state().is_recording() {
                return Err(SessionError::RecordingInProgress);
            }
            session.requested_duration = (!duration.is_zero()).then_some(duration);
            tracing::debug!(target: "recorder", "[SESSION] Recording time set to {:?}", duration);
            Ok(())
        })
    }

    pub fn set_capture_area(&self, rect: Rect) -> Result<(), SessionError> {
        self.shared
            .configure(|bus, session| apply_capture_area(bus, session, rect))
    }

    pub fn set_capture_frame_rate(&self, fps: u32) {
        let _ = self.shared.configure(|bus, session| {
            session.frame_rate = fps;
            bus.publish(Notification::CaptureFrameRateChanged { fps });
            Ok(())
        });
    }

    pub fn set_scale(&self, scale: f32) -> Result<(), SessionError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(SessionError::InvalidSetting(format!("scale {}", scale)));
        }
        self.shared.configure(|bus, session| {
            session.scale = scale;
            bus.publish(Notification::TargetFrameChanged {
                rect: session.target_frame(),
                scale,
            });
            Ok(())
        })
    }

    pub fn set_video_depth(&self, depth: VideoDepth) {
        let _ = self.shared.configure(|bus, session| {
            session.depth = depth;
            bus.publish(Notification::VideoDepthChanged { depth });
            Ok(())
        });
    }

    pub fn set_output_file_name(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let _ = self.shared.configure(|_, session| {
            tracing::debug!(target: "recorder", "[SESSION] Output file set to {:?}", path);
            session.output_file = path;
            Ok(())
        });
    }

    /// Switches the output format and refreshes the codec list. The current
    /// codec is kept if the new format offers it, otherwise the first one is
    /// selected.
    pub fn set_media_file_format(&self, name: &str) -> Result<(), SessionError> {
        let encoder = Arc::clone(&self.shared.encoder);
        self.shared.configure(|bus, session| {
            let format = MediaFileFormat::from_name(name)
                .filter(|format| encoder.formats().contains(format))
                .ok_or_else(|| SessionError::UnsupportedFormat(name.to_string()))?;
            let codecs = encoder.codecs(format);
            let first = codecs
                .first()
                .cloned()
                .ok_or_else(|| SessionError::UnsupportedFormat(name.to_string()))?;

            session.format = format;
            bus.publish(Notification::MediaFileFormatChanged {
                name: format.short_name().to_string(),
            });

            let keep = codecs.contains(&session.codec);
            session.codecs = codecs;
            bus.publish(Notification::CodecListUpdated);

            if !keep {
                session.codec = first;
                bus.publish(Notification::CodecChanged {
                    name: session.codec.name.clone(),
                });
            }
            Ok(())
        })
    }

    pub fn set_media_codec(&self, name: &str) -> Result<(), SessionError> {
        self.shared.configure(|bus, session| {
            let codec = find_codec(&session.codecs, name)
                .ok_or_else(|| SessionError::UnknownCodec(name.to_string()))?;
            session.codec = codec;
            bus.publish(Notification::CodecChanged {
                name: session.codec.name.clone(),
            });
            Ok(())
        })
    }

    /// The area-selection overlay closed. A non-empty selection becomes the
    /// capture area.
    pub fn selection_window_closed(&self, selection: Option<Rect>) {
        let _ = self.shared.configure(|bus, session| {
            bus.publish(Notification::SelectionWindowClosed);
            match selection {
                Some(rect) if !rect.is_empty() => apply_capture_area(bus, session, rect),
                _ => Ok(()),
            }
        });
    }

    /// Restores default settings in memory. The capture area returns to the
    /// whole screen.
    pub fn reset_settings(&self) {
        let encoder = Arc::clone(&self.shared.encoder);
        let _ = self.shared.configure(|bus, session| {
            session.area = session.screen;
            session.frame_rate = DEFAULT_FRAME_RATE;
            session.scale = 1.0;
            session.depth = VideoDepth::default();
            session.output_file = default_output_file();
            if let Ok((format, codecs)) =
                resolve_format(encoder.as_ref(), MediaFileFormat::default().short_name())
            {
                session.format = format;
                if let Some(first) = codecs.first() {
                    session.codec = first.clone();
                }
                session.codecs = codecs;
            }

            tracing::info!(target: "recorder", "[SESSION] Settings reset to defaults");
            bus.publish(Notification::ResetSettings);
            Ok(())
        });
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.shared.lock_session().state()
    }

    /// Frames captured in the current (or last) recording.
    pub fn recorded_frames(&self) -> u32 {
        self.shared.frame_count.load(Ordering::SeqCst)
    }

    /// Unpaused recording time of the current (or last) recording.
    pub fn record_time(&self) -> Duration {
        self.shared.lock_session().stopwatch.elapsed()
    }

    pub fn average_fps(&self) -> f64 {
        let seconds = self.record_time().as_secs_f64();
        if seconds <= 0.0 {
            return 0.0;
        }
        self.recorded_frames() as f64 / seconds
    }

    /// Quitting is refused while a recording or an encode is in flight.
    pub fn can_quit(&self) -> Result<(), QuitRefusal> {
        let state = self.state();
        if !state.is_busy() {
            return Ok(());
        }
        match state {
            SessionState::Encoding => Err(QuitRefusal::Encoding),
            _ => Err(QuitRefusal::Recording),
        }
    }

    /// Current settings as they would apply to the next recording.
    pub fn settings(&self) -> CaptureSettings {
        let session = self.shared.lock_session();
        CaptureSettings {
            capture_area: Some(session.area),
            frame_rate: session.frame_rate,
            scale: session.scale,
            video_depth: session.depth,
            output_file_name: session.output_file.clone(),
            output_format: session.format.short_name().to_string(),
            output_codec: session.codec.name.clone(),
            spool_dir: session.spool_dir.clone(),
        }
    }

    pub fn media_file_formats(&self) -> Vec<MediaFileFormat> {
        self.shared.encoder.formats()
    }

    pub fn media_file_format(&self) -> MediaFileFormat {
        self.shared.lock_session().format
    }

    pub fn media_codec(&self) -> Codec {
        self.shared.lock_session().codec.clone()
    }

    pub fn codecs(&self) -> Vec<Codec> {
        self.shared.lock_session().codecs.clone()
    }

    pub fn target_frame(&self) -> Rect {
        self.shared.lock_session().target_frame()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

fn apply_capture_area(
    bus: &NotificationBus,
    session: &mut Session,
    rect: Rect,
) -> Result<(), SessionError> {
    if rect.is_empty() {
        return Err(SessionError::InvalidSetting(format!(
            "capture area {}x{}",
            rect.width, rect.height
        )));
    }

    session.area = rect;
    bus.publish(Notification::SourceFrameChanged { rect });
    bus.publish(Notification::CodecListUpdated);
    bus.publish(Notification::TargetFrameChanged {
        rect: session.target_frame(),
        scale: session.scale,
    });
    Ok(())
}

impl Shared {
    fn lock_commands(&self) -> MutexGuard<'_, ()> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command(self: &Arc<Self>, event: SessionEvent) {
        let _cmd = self.lock_commands();
        self.reap();
        if self.lock_session().shutting_down {
            return;
        }
        self.dispatch(event);
    }

    /// Runs a setter under both locks. Settings are snapshotted when a
    /// recording starts or stops, so changes apply from the next one.
    fn configure<F>(&self, apply: F) -> Result<(), SessionError>
    where
        F: FnOnce(&NotificationBus, &mut Session) -> Result<(), SessionError>,
    {
        let _cmd = self.lock_commands();
        self.reap();
        let mut session = self.lock_session();
        apply(&self.bus, &mut session)
    }

    fn dispatch(self: &Arc<Self>, event: SessionEvent) {
        let state = self.lock_session().state();
        let (next, effects) = transition(state, event);

        if effects.is_empty() {
            tracing::debug!(target: "recorder", "[SESSION] Ignoring {:?} in {:?}", event, state);
            return;
        }
        tracing::debug!(target: "recorder", "[SESSION] {:?} + {:?} -> {:?}", state, event, next);

        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(self: &Arc<Self>, effect: SideEffect) {
        match effect {
            SideEffect::StartCapture => self.start_capture(),
            SideEffect::PauseCapture => self.set_paused(true),
            SideEffect::ResumeCapture => self.set_paused(false),
            SideEffect::EndCapture => self.end_capture(),
            SideEffect::AbortCapture => self.abort_capture(),
            SideEffect::CancelEncode => self.cancel_encode(),
        }
    }

    /// Joins retired threads that have already exited.
    fn reap(&self) {
        let finished: Vec<Box<dyn Joinable>> = {
            let mut session = self.lock_session();
            let (finished, pending) = mem::take(&mut session.retired)
                .into_iter()
                .partition(|handle| handle.is_finished());
            session.retired = pending;
            finished
        };

        for handle in finished {
            handle.join_boxed();
        }
    }

    fn next_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    fn start_capture(self: &Arc<Self>) {
        self.frame_count.store(0, Ordering::SeqCst);
        self.paused.set(false);

        let mut session = self.lock_session();
        let store = match session.spool_dir.as_deref() {
            Some(base) => FrameStore::new_in(base),
            None => FrameStore::new(),
        };
        let store = match store {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(target: "recorder", "[SESSION] Cannot allocate frame store: {}", e);
                self.bus.publish(Notification::CaptureStopped {
                    status: Status::error(&e),
                });
                return;
            }
        };

        let params = CaptureParams::new(session.area, session.frame_rate);
        let id = self.next_id();
        let shared = Arc::clone(self);

        let task = match WorkerTask::spawn("capture", id, move |token| {
            shared.capture_worker(id, store, params, token)
        }) {
            Ok(task) => task,
            Err(e) => {
                let err = CaptureError::SpawnFailed(e.to_string());
                tracing::error!(target: "recorder", "[SESSION] {}", err);
                self.bus.publish(Notification::CaptureStopped {
                    status: Status::error(&err),
                });
                return;
            }
        };

        session.capture = Some(task);
        session.recording = params;
        session.paused = false;
        session.stopwatch = Stopwatch::started();

        if let Some(duration) = session.requested_duration.take() {
            let weak = Arc::downgrade(self);
            let timer = OneShotTimer::arm(duration, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.auto_stop(id);
                }
            });
            match timer {
                Ok(timer) => {
                    tracing::info!(target: "recorder", "[SESSION] Auto-stop armed for {:?}", duration);
                    session.auto_stop = Some(timer);
                }
                Err(e) => {
                    tracing::warn!(target: "recorder", "[SESSION] Failed to arm auto-stop timer: {}", e);
                }
            }
        }

        tracing::info!(target: "recorder",
            "[SESSION] Recording started: area={:?} @ {}fps",
            params.area, params.frame_rate);

        // Published under the session lock so it precedes any failure report.
        self.bus.publish(Notification::CaptureStarted);
    }

    fn capture_worker(
        &self,
        id: u64,
        mut store: FrameStore,
        params: CaptureParams,
        token: CancelToken,
    ) -> CaptureReport {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            run_capture_loop(
                self.source.as_ref(),
                &mut store,
                &params,
                &self.paused,
                &self.frame_count,
                &token,
            )
        }))
        .unwrap_or(Err(CaptureError::WorkerPanicked));

        match result {
            Ok(stats) => Ok((store, stats)),
            Err(e) => {
                drop(store);
                self.capture_exited(id, &e);
                Err(e)
            }
        }
    }

    /// The capture thread failed on its own. Clears its handle if nobody has
    /// taken it yet, so the session reads as idle again.
    fn capture_exited(&self, id: u64, err: &CaptureError) {
        let mut session = self.lock_session();
        if session.capture.as_ref().map(WorkerTask::id) != Some(id) {
            return;
        }

        if let Some(task) = session.capture.take() {
            session.retired.push(task.into_joinable());
        }
        session.paused = false;
        session.stopwatch.suspend();
        session.disarm_auto_stop();
        self.paused.set(false);
        self.frame_count.store(0, Ordering::SeqCst);

        tracing::error!(target: "recorder", "[SESSION] Recording failed: {}", err);
        self.bus.publish(Notification::CaptureStopped {
            status: Status::error(err),
        });
    }

    fn auto_stop(self: &Arc<Self>, id: u64) {
        let _cmd = self.lock_commands();
        {
            let session = self.lock_session();
            if session.shutting_down || session.capture.as_ref().map(WorkerTask::id) != Some(id) {
                tracing::debug!(target: "recorder", "[SESSION] Stale auto-stop for capture {}", id);
                return;
            }
        }

        tracing::info!(target: "recorder", "[SESSION] Auto-stop fired");
        self.dispatch(SessionEvent::AutoStop);
    }

    fn set_paused(&self, paused: bool) {
        let mut session = self.lock_session();
        let state = session.state();
        if !state.is_recording() || state.is_paused() == paused {
            return;
        }

        session.paused = paused;
        self.paused.set(paused);
        if paused {
            session.stopwatch.suspend();
            tracing::info!(target: "recorder", "[SESSION] Recording paused");
            self.bus.publish(Notification::CapturePaused);
        } else {
            session.stopwatch.resume();
            tracing::info!(target: "recorder", "[SESSION] Recording resumed");
            self.bus.publish(Notification::CaptureResumed);
        }
    }

    /// Takes the capture thread out of the session and tells it to stop.
    fn take_capture(&self, handoff: bool) -> Option<WorkerTask<CaptureReport>> {
        let mut session = self.lock_session();
        let task = session.capture.take()?;
        session.handoff_pending = handoff;
        session.paused = false;
        session.stopwatch.suspend();
        session.disarm_auto_stop();
        self.paused.set(false);
        task.cancel();
        Some(task)
    }

    fn end_capture(self: &Arc<Self>) {
        let Some(task) = self.take_capture(true) else {
            return;
        };

        let report = task.join().unwrap_or(Err(CaptureError::WorkerPanicked));
        match report {
            Ok((store, stats)) => {
                tracing::info!(target: "recorder",
                    "[SESSION] Recording stopped: {} frames spanning {:?} in {:?}",
                    stats.frames, store.timespan().unwrap_or_default(),
                    self.lock_session().stopwatch.elapsed());
                self.bus.publish(Notification::CaptureStopped { status: Status::Ok });
                self.encode_movie(store);
            }
            Err(e) => {
                tracing::error!(target: "recorder", "[SESSION] Recording failed: {}", e);
                self.lock_session().handoff_pending = false;
                self.frame_count.store(0, Ordering::SeqCst);
                self.bus.publish(Notification::CaptureStopped {
                    status: Status::error(&e),
                });
            }
        }
    }

    fn abort_capture(&self) {
        let Some(task) = self.take_capture(false) else {
            return;
        };

        match task.join() {
            Ok(Ok((store, stats))) => {
                tracing::info!(target: "recorder", "[SESSION] Recording cancelled, discarding {} frames", stats.frames);
                drop(store);
            }
            Ok(Err(e)) => {
                tracing::warn!(target: "recorder", "[SESSION] Cancelled recording had failed: {}", e);
            }
            Err(_) => {
                tracing::warn!(target: "recorder", "[SESSION] Cancelled capture thread panicked");
            }
        }

        self.frame_count.store(0, Ordering::SeqCst);
        self.bus.publish(Notification::CaptureStopped {
            status: Status::Cancelled,
        });
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    fn encode_movie(self: &Arc<Self>, store: FrameStore) {
        let mut session = self.lock_session();
        session.handoff_pending = false;

        if store.is_empty() {
            drop(session);
            tracing::warn!(target: "recorder", "[SESSION] Nothing recorded, skipping encode");
            self.bus.publish(Notification::EncodeFinished {
                status: Status::error(EncodeError::EmptyRecording),
                output_path: None,
            });
            return;
        }

        let destination = output_destination(&session.output_file, session.format);
        let output = match reserve_temp_output(&destination, session.format) {
            Ok(output) => output,
            Err(e) => {
                drop(session);
                tracing::error!(target: "recorder", "[SESSION] {}", e);
                self.bus.publish(Notification::EncodeFinished {
                    status: Status::error(&e),
                    output_path: None,
                });
                return;
            }
        };

        let job = EncodeJob {
            output,
            destination,
            format: session.format,
            codec: session.codec.clone(),
            target: session.recording.area.scaled(session.scale),
            depth: session.depth,
            frame_rate: session.recording.frame_rate,
        };
        let frames_total = store.len();
        let temp_output = job.output.clone();

        tracing::info!(target: "recorder",
            "[SESSION] Encoding {} frames to {:?} ({} / {})",
            frames_total, job.destination, job.format.short_name(), job.codec.name);
        self.bus.publish(Notification::EncodeStarted { frames_total });

        let id = self.next_id();
        let shared = Arc::clone(self);
        // Spawned under the session lock so the worker cannot report back
        // before its handle is stored.
        match WorkerTask::spawn("encode", id, move |token| {
            shared.encode_worker(id, job, store, token)
        }) {
            Ok(task) => session.encode = Some(task),
            Err(e) => {
                drop(session);
                remove_output(&temp_output);
                let err = EncodeError::SpawnFailed(e.to_string());
                tracing::error!(target: "recorder", "[SESSION] {}", err);
                self.bus.publish(Notification::EncodeFinished {
                    status: Status::error(&err),
                    output_path: None,
                });
            }
        }
    }

    fn encode_worker(&self, id: u64, job: EncodeJob, store: FrameStore, token: CancelToken) {
        let bus = self.bus.clone();
        let mut progress = |p: EncodeProgress| {
            bus.publish(Notification::EncodeProgress {
                frames_remaining: p.frames_remaining,
                frames_total: p.frames_total,
                text: p.text,
                reset: p.reset,
            });
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.encoder.encode(&job, store, &mut progress, &token)
        }))
        .unwrap_or(Err(EncodeError::WorkerPanicked));

        self.encoding_finished(id, &job, result, &token);
    }

    fn encoding_finished(
        &self,
        id: u64,
        job: &EncodeJob,
        result: Result<(), EncodeError>,
        token: &CancelToken,
    ) {
        let (status, output_path) = if token.is_cancelled() || result == Err(EncodeError::Cancelled) {
            tracing::info!(target: "recorder", "[SESSION] Encoding cancelled");
            remove_output(&job.output);
            (Status::Cancelled, None)
        } else {
            match result {
                Ok(()) => match relocate(&job.output, &job.destination) {
                    Ok(path) => (Status::Ok, Some(path)),
                    Err(e) => {
                        tracing::error!(target: "recorder", "[SESSION] {}", e);
                        (Status::error(&e), Some(job.output.clone()))
                    }
                },
                Err(e) => {
                    tracing::error!(target: "recorder", "[SESSION] Encoding failed: {}", e);
                    remove_output(&job.output);
                    (Status::error(&e), None)
                }
            }
        };

        let mut session = self.lock_session();
        if session.encode.as_ref().map(WorkerTask::id) == Some(id) {
            if let Some(task) = session.encode.take() {
                session.retired.push(task.into_joinable());
            }
        }
        // Published under the lock so observers see the session idle.
        self.bus.publish(Notification::EncodeFinished {
            status,
            output_path,
        });
    }

    fn cancel_encode(&self) {
        let mut session = self.lock_session();
        if let Some(task) = session.encode.take() {
            tracing::info!(target: "recorder", "[SESSION] Cancelling encode {}", task.id());
            task.cancel();
            session.retired.push(task.into_joinable());
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn shutdown(self: &Arc<Self>) {
        let handles = {
            let _cmd = self.lock_commands();
            let state = {
                let mut session = self.lock_session();
                session.shutting_down = true;
                session.disarm_auto_stop();
                session.state()
            };

            match state {
                SessionState::Recording { .. } => self.abort_capture(),
                SessionState::Encoding => self.cancel_encode(),
                SessionState::Idle => {}
            }

            let retired = mem::take(&mut self.lock_session().retired);
            retired
        };

        if !handles.is_empty() {
            tracing::debug!(target: "recorder", "[SESSION] Joining {} worker threads", handles.len());
        }
        for handle in handles {
            handle.join_boxed();
        }
    }
}
