pub mod core;
pub mod recorder;
pub mod shared;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use recorder::{MediaEncoder, Notification, ScreenSource, SessionController, Status};
use shared::errors::AppError;

const DEFAULT_RECORDING_SECONDS: u64 = 5;

/// Seconds to record, from the first command-line argument.
fn recording_seconds(mut args: impl Iterator<Item = String>) -> Result<u64, AppError> {
    let Some(arg) = args.next() else {
        return Ok(DEFAULT_RECORDING_SECONDS);
    };

    match arg.trim().parse::<u64>() {
        Ok(seconds) if seconds > 0 => Ok(seconds),
        _ => Err(AppError::InvalidArgument(format!(
            "expected a positive number of seconds, got {:?}",
            arg
        ))),
    }
}

/// Records one time-boxed clip with the configured settings and prints where
/// it was saved.
pub fn run() -> Result<(), AppError> {
    let _logging = crate::core::logging::init_logging()?;
    let seconds = recording_seconds(std::env::args().skip(1))?;
    let settings = crate::core::settings::load_settings();

    let controller = SessionController::new(
        settings,
        Arc::new(ScreenSource::new()),
        Arc::new(MediaEncoder::detect()),
    )?;
    let mut events = controller.subscribe();
    tracing::debug!(
        "Formats available: {:?}",
        controller
            .media_file_formats()
            .iter()
            .map(|format| format.short_name())
            .collect::<Vec<_>>()
    );

    tracing::info!("Recording for {}s", seconds);
    controller.set_recording_time(Duration::from_secs(seconds))?;
    controller.toggle_capture();

    loop {
        match events.blocking_recv() {
            Ok(Notification::CaptureStopped {
                status: Status::Error { message },
            }) => return Err(AppError::recording_failed(message)),
            Ok(Notification::EncodeProgress {
                frames_remaining,
                frames_total,
                ..
            }) => {
                tracing::debug!("Encoding: {}/{} frames left", frames_remaining, frames_total);
            }
            Ok(Notification::EncodeFinished {
                status,
                output_path,
            }) => {
                return match (status, output_path) {
                    (status, Some(path)) if status.is_ok() => {
                        println!("{}", path.display());
                        Ok(())
                    }
                    (Status::Error { message }, _) => Err(AppError::recording_failed(message)),
                    (status, _) => Err(AppError::recording_failed(format!("{:?}", status))),
                };
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Missed {} notifications", skipped);
            }
            Err(RecvError::Closed) => {
                return Err(AppError::recording_failed("notification channel closed"));
            }
        }
    }
}
