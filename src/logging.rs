use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::{LookupSpan, Registry};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_ENV: &str = "HEADLOG_LOG";
pub const DEFAULT_FILTER: &str = "headlog=info,headlog_lib=info,sqlx=warn";
pub const LOG_FILE_NAME: &str = "headlog.log";

const DEFAULT_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 5;

static FILE_GUARD: OnceCell<Mutex<Option<WorkerGuard>>> = OnceCell::new();

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn file_layer<S>(log_dir: &Path) -> anyhow::Result<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("create log directory {}", log_dir.display()))?;

    let max_size = env_usize("HEADLOG_LOG_MAX_SIZE_BYTES").unwrap_or(DEFAULT_MAX_SIZE_BYTES);
    let max_files = env_usize("HEADLOG_LOG_MAX_FILES").unwrap_or(DEFAULT_MAX_FILES);

    let rotating = FileRotate::new(
        log_dir.join(LOG_FILE_NAME),
        AppendCount::new(max_files),
        ContentLimit::BytesSurpassed(max_size),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    let (writer, guard) = tracing_appender::non_blocking(rotating);
    let slot = FILE_GUARD.get_or_init(|| Mutex::new(None));
    if let Ok(mut held) = slot.lock() {
        *held = Some(guard);
    }

    Ok(fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(writer))
}

/// Installs the global subscriber: JSON lines on stderr and, when `log_dir`
/// is given, a size-rotated JSON log file as well.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stderr = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr);
    let file: Option<Box<dyn Layer<Registry> + Send + Sync>> = match log_dir {
        Some(dir) => Some(file_layer::<Registry>(dir)?.boxed()),
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(file)
        .with(filter)
        .with(stderr)
        .try_init();
    Ok(())
}

/// Drops the file writer guard so buffered lines reach disk before exit.
pub fn flush_file_logs() {
    if let Some(slot) = FILE_GUARD.get() {
        if let Ok(mut held) = slot.lock() {
            held.take();
        }
    }
}
