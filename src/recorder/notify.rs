//! One-to-many notification bus for session observers.
//!
//! Backed by a bounded `tokio::sync::broadcast` channel. Delivery is
//! fire-and-forget: when a subscriber falls more than `BUS_CAPACITY` events
//! behind, the oldest events are dropped for it and its next `recv` reports
//! `Lagged(n)`. Publishing never blocks and never fails.

use std::fmt::Display;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use super::types::{Rect, VideoDepth};

pub const BUS_CAPACITY: usize = 64;

pub type NotificationReceiver = broadcast::Receiver<Notification>;

/// Terminal status carried by `CaptureStopped` and `EncodeFinished`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Status {
    Ok,
    Cancelled,
    Error { message: String },
}

impl Status {
    pub fn error(err: impl Display) -> Self {
        Status::Error {
            message: err.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Notification {
    CaptureStarted,
    CapturePaused,
    CaptureResumed,
    CaptureStopped {
        status: Status,
    },
    EncodeStarted {
        frames_total: usize,
    },
    EncodeProgress {
        frames_remaining: usize,
        frames_total: usize,
        text: Option<String>,
        reset: bool,
    },
    EncodeFinished {
        status: Status,
        output_path: Option<PathBuf>,
    },
    SourceFrameChanged {
        rect: Rect,
    },
    TargetFrameChanged {
        rect: Rect,
        scale: f32,
    },
    CaptureFrameRateChanged {
        fps: u32,
    },
    VideoDepthChanged {
        depth: VideoDepth,
    },
    CodecChanged {
        name: String,
    },
    MediaFileFormatChanged {
        name: String,
    },
    CodecListUpdated,
    SelectionWindowClosed,
    ResetSettings,
}

#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> NotificationReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        tracing::trace!(target: "recorder", "[BUS] {:?}", notification);
        // No subscribers is not an error.
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
