use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Progress,
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: Level,
    pub message: String,
}

impl LogEntry {
    pub fn now(level: Level, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now().to_rfc3339(),
            level,
            message: message.into(),
        }
    }
}

/// Append-only `logs.csv` in the output folder.
pub struct RunLog {
    wtr: Mutex<csv::Writer<File>>,
}

impl RunLog {
    pub fn open(output_folder: &Path) -> Result<Self> {
        let log_path = output_folder.join("logs.csv");
        let file_exists = log_path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;

        let wtr = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);
        Ok(Self { wtr: Mutex::new(wtr) })
    }

    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut wtr = self
            .wtr
            .lock()
            .map_err(|_| anyhow::anyhow!("run log writer poisoned"))?;
        wtr.serialize(entry)?;
        // Keep the log readable if the run dies mid-subject.
        wtr.flush()?;
        Ok(())
    }
}
