//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Directory for rolling log files. When unset, logs go to stderr.
pub const LOG_PATH_ENV_VAR: &str = "TF_LOG_PATH";

const LOG_FILE_PREFIX: &str = "device-plugin.log";

/// Build the formatting layer, writing either to stderr or to a daily rolling
/// file under `log_path`.
///
/// The returned guard must be kept alive for the file writer to flush.
pub fn get_fmt_layer<S>(
    log_path: Option<impl AsRef<Path>>,
) -> (Box<dyn Layer<S> + Send + Sync>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let Some(log_path) = log_path else {
        let fmt_layer = layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(env_filter)
            .boxed();
        return (fmt_layer, None);
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(3)
        .build(log_path.as_ref());

    match appender {
        Ok(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let fmt_layer = layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter)
                .boxed();
            (fmt_layer, Some(guard))
        }
        Err(e) => {
            eprintln!(
                "failed to create log file under {}: {e}, logging to stderr",
                log_path.as_ref().display()
            );
            let fmt_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(env_filter)
                .boxed();
            (fmt_layer, None)
        }
    }
}

/// initiate the global tracing subscriber
pub fn init() -> Option<WorkerGuard> {
    let log_path = std::env::var(LOG_PATH_ENV_VAR).ok();
    let (fmt_layer, guard) = get_fmt_layer(log_path);

    registry().with(fmt_layer).init();
    guard
}
