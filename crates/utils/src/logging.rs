//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// When `log_file` is set, events are additionally written to a daily
/// rolling file next to the stderr output. The returned guard must be held
/// for the lifetime of the process, dropping it flushes the file writer.
pub fn init<P: AsRef<Path>>(log_file: Option<P>) -> Option<WorkerGuard> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    match log_file {
        Some(path) => {
            let path = path.as_ref();
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let prefix = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("agent.log");

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(3)
                .build(dir)
                .expect("failed to create rolling file appender");

            let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

            let file_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(filter::LevelFilter::INFO);

            registry().with(fmt_layer).with(file_layer).init();
            Some(file_guard)
        }
        None => {
            registry().with(fmt_layer).init();
            None
        }
    }
}
