//! Pure state machine for the recording session lifecycle.
//!
//! `(SessionState, SessionEvent) -> (SessionState, Vec<SideEffect>)`
//!
//! The controller derives the current state from the worker handles it owns,
//! asks this module what to do, and executes the returned effects. Invalid
//! transitions return the current state with no effects.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionState {
    /// Nothing in flight; ready to record.
    #[default]
    Idle,

    /// The capture thread is producing frames (or sleeping while paused).
    Recording { paused: bool },

    /// The encode thread owns the frame store.
    Encoding,
}

impl SessionState {
    pub fn is_recording(&self) -> bool {
        matches!(self, SessionState::Recording { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, SessionState::Recording { paused: true })
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self, SessionState::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Start when idle, stop when recording.
    ToggleCapture,

    TogglePause,

    Cancel,

    /// The auto-stop timer for the current recording fired.
    AutoStop,
}

/// Work the controller performs for a transition. The state machine itself
/// never touches threads, files or the notification bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Allocate a frame store, spawn the capture thread, start the stopwatch
    /// and arm the auto-stop timer if a duration was requested.
    StartCapture,

    PauseCapture,

    ResumeCapture,

    /// Stop and join the capture thread, then hand its frames to the encoder.
    EndCapture,

    /// Stop and join the capture thread, then discard its frames.
    AbortCapture,

    /// Ask the encode thread to stop without waiting for it.
    CancelEncode,
}

pub fn transition(state: SessionState, event: SessionEvent) -> (SessionState, Vec<SideEffect>) {
    match (state, event) {
        (SessionState::Idle, SessionEvent::ToggleCapture) => (
            SessionState::Recording { paused: false },
            vec![SideEffect::StartCapture],
        ),

        (SessionState::Recording { paused: false }, SessionEvent::TogglePause) => (
            SessionState::Recording { paused: true },
            vec![SideEffect::PauseCapture],
        ),

        (SessionState::Recording { paused: true }, SessionEvent::TogglePause) => (
            SessionState::Recording { paused: false },
            vec![SideEffect::ResumeCapture],
        ),

        // Stopping passes through Idle; the controller reports Encoding once
        // the frames have been handed over, or Idle if there were none.
        (SessionState::Recording { .. }, SessionEvent::ToggleCapture)
        | (SessionState::Recording { .. }, SessionEvent::AutoStop) => {
            (SessionState::Encoding, vec![SideEffect::EndCapture])
        }

        (SessionState::Recording { .. }, SessionEvent::Cancel) => {
            (SessionState::Idle, vec![SideEffect::AbortCapture])
        }

        (SessionState::Encoding, SessionEvent::Cancel) => {
            (SessionState::Idle, vec![SideEffect::CancelEncode])
        }

        // Includes ToggleCapture while encoding and a stale AutoStop.
        _ => (state, vec![]),
    }
}
