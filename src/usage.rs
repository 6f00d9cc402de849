//! Usage logger — one structured JSON line per tool invocation.
//!
//! Writes to an append-only sink, flushing after every record. A failing
//! sink (disk full, permissions) never surfaces to the caller: the tool
//! result must not be masked or delayed by observability.

use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::Serialize;

/// A single usage record as it appears on disk.
#[derive(Debug, Serialize)]
struct UsageRecord<'a> {
    timestamp: f64,
    iso_time: String,
    tool: &'a str,
    success: bool,
    duration: f64,
    error: Option<&'a str>,
}

/// Append-only JSONL logger for tool invocations.
pub struct UsageLogger {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl UsageLogger {
    /// Open a logger that appends to the given file path.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Create a logger over an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Record one invocation outcome. Write failures are swallowed.
    pub fn record(&self, tool: &str, success: bool, duration: Duration, error: Option<&str>) {
        if let Err(e) = self.write_record(tool, success, duration, error) {
            tracing::debug!(tool, error = %e, "usage log write failed");
        }
    }

    fn write_record(
        &self,
        tool: &str,
        success: bool,
        duration: Duration,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let record = UsageRecord {
            timestamp,
            iso_time: Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            tool,
            success,
            duration: duration.as_secs_f64(),
            error,
        };
        let line = serde_json::to_string(&record)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| anyhow::anyhow!("usage lock poisoned: {e}"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}
