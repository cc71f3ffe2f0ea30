//! Screen recording pipeline: capture thread -> frame store -> encode thread,
//! owned and sequenced by the `SessionController`.

pub mod capture;
pub mod controller;
pub mod encoder;
pub mod errors;
pub mod frames;
pub mod notify;
pub mod state;
pub mod stopwatch;
pub mod task;
pub mod types;

pub use capture::{FrameSource, ScreenSource};
pub use controller::SessionController;
pub use encoder::{EncodeJob, EncodeProgress, Encoder, MediaEncoder};
pub use errors::{CaptureError, EncodeError, FrameStoreError, QuitRefusal, SessionError};
pub use frames::{FrameRecord, FrameStore};
pub use notify::{Notification, NotificationReceiver, Status};
pub use state::SessionState;
pub use types::{Codec, MediaFileFormat, Rect, VideoDepth};
