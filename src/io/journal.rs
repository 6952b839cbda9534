//! Telemetry journal - appends classified events to a JSONL file
//!
//! One JSON object per line: the event as sent to push clients plus the
//! originating topic and the time it was recorded.

use crate::domain::types::TelemetryEvent;
use crate::services::classifier::TelemetrySink;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info};

#[derive(Serialize)]
struct JournalRecord<'a> {
    recorded_at: String,
    topic: &'a str,
    #[serde(flatten)]
    event: &'a TelemetryEvent,
}

pub struct Journal {
    file_path: String,
}

impl Journal {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "journal_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Append one event. Returns true if it was written.
    pub fn write_event(&self, event: &TelemetryEvent) -> bool {
        let record = JournalRecord {
            recorded_at: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            topic: &event.topic,
            event,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!(session_id = %event.session_id, error = %e, "journal_serialize_failed");
                return false;
            }
        };

        match self.append_line(&line) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    session_id = %event.session_id,
                    file = %self.file_path,
                    error = %e,
                    "journal_write_failed"
                );
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "journal_written");

        Ok(())
    }
}

impl TelemetrySink for Journal {
    fn record(&self, event: &TelemetryEvent) {
        self.write_event(event);
    }
}
