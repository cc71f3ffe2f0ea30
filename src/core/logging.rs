use crate::shared::paths::{ensure_dir, get_log_dir};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Targets that get a log file of their own. Everything else goes to `system.log`.
const COMPONENT_TARGETS: [&str; 1] = ["recorder"];

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to create logs directory: {0}")]
    LogDir(#[from] std::io::Error),
    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Flushes the background log writers when dropped. Hold for the life of the process.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

struct TargetWriter {
    writers: HashMap<&'static str, NonBlocking>,
    system_writer: NonBlocking,
}

impl TargetWriter {
    fn writer_for(&self, target: &str) -> &NonBlocking {
        self.writers
            .iter()
            .find(|(name, _)| target_matches(target, name))
            .map(|(_, writer)| writer)
            .unwrap_or(&self.system_writer)
    }
}

/// `target` is `name` itself or one of its `name::` submodules.
fn target_matches(target: &str, name: &str) -> bool {
    target == name
        || target
            .strip_prefix(name)
            .is_some_and(|rest| rest.starts_with("::"))
}

impl<'a> MakeWriter<'a> for TargetWriter {
    type Writer = NonBlocking;

    fn make_writer(&'a self) -> Self::Writer {
        self.system_writer.clone()
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        self.writer_for(meta.target()).clone()
    }
}

fn file_writer(log_dir: &Path, file_name: &str, guards: &mut Vec<WorkerGuard>) -> NonBlocking {
    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    guards.push(guard);
    writer
}

pub fn init_logging() -> Result<LoggingGuards, LoggingError> {
    let log_dir = get_log_dir();
    ensure_dir(&log_dir)?;

    let mut guards = Vec::new();
    let writers = COMPONENT_TARGETS
        .into_iter()
        .map(|target| {
            let writer = file_writer(&log_dir, &format!("{}.log", target), &mut guards);
            (target, writer)
        })
        .collect();
    let system_writer = file_writer(&log_dir, "system.log", &mut guards);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(TargetWriter {
                writers,
                system_writer,
            })
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(true),
    );

    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!(target: "system", "Logging initialized at {:?}", log_dir);

    Ok(LoggingGuards { _guards: guards })
}
