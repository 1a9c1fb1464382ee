use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::time::now_ms;
use crate::AppError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLogEntry {
    pub entry_id: Uuid,
    pub timestamp: i64,
    pub operation: String,
    pub error: AppError,
}

/// Sink for failures the user should be able to review later. Recording is
/// informational: callers never let a logging failure change their outcome.
pub trait ErrorLog: Send + Sync {
    fn record(&self, operation: &str, error: &AppError) -> anyhow::Result<()>;
}

/// Records into the tracing stream only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorLog;

impl ErrorLog for TracingErrorLog {
    fn record(&self, operation: &str, err: &AppError) -> anyhow::Result<()> {
        error!(
            target: "headlog",
            event = "error_logged",
            operation,
            code = %err.code(),
            error = %err
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file and mirrors it to tracing.
#[derive(Debug, Clone)]
pub struct JsonlErrorLog {
    path: PathBuf,
}

impl JsonlErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read_entries(&self) -> anyhow::Result<Vec<ErrorLogEntry>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(anyhow::Error::from))
            .collect()
    }
}

impl ErrorLog for JsonlErrorLog {
    fn record(&self, operation: &str, err: &AppError) -> anyhow::Result<()> {
        TracingErrorLog.record(operation, err)?;
        let entry = ErrorLogEntry {
            entry_id: Uuid::now_v7(),
            timestamp: now_ms(),
            operation: operation.to_string(),
            error: err.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// Keeps entries in memory; used by tests and embedding hosts that forward them elsewhere.
#[derive(Debug, Default)]
pub struct MemoryErrorLog {
    entries: Mutex<Vec<(String, AppError)>>,
}

impl MemoryErrorLog {
    pub fn entries(&self) -> Vec<(String, AppError)> {
        self.entries
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl ErrorLog for MemoryErrorLog {
    fn record(&self, operation: &str, err: &AppError) -> anyhow::Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("error log lock poisoned"))?
            .push((operation.to_string(), err.clone()));
        Ok(())
    }
}

/// Records `err`, swallowing any failure of the log itself.
pub fn report(log: &Arc<dyn ErrorLog>, operation: &str, err: &AppError) {
    if let Err(log_err) = log.record(operation, err) {
        warn!(
            target: "headlog",
            event = "error_log_failed",
            operation,
            error = %log_err
        );
    }
}
