pub mod file;
pub mod snapshot;
pub mod sqlite;
pub mod tabular;

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::SinkError;
use crate::model::CombinedRecord;
use crate::report::RunReport;

pub use file::FileSink;
pub use snapshot::Snapshots;
pub use sqlite::SqliteSink;
pub use tabular::{TabularFormat, TabularSink};

/// Placeholder replaced with the run timestamp in sink paths.
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

/// What a relational sink does when a record's key already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Update matching rows in place, insert the rest.
    #[default]
    Replace,
    /// Insert every record; duplicates are allowed.
    Append,
    /// Abort the whole write if any key collides.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows: usize,
    pub target: String,
}

/// A durable destination for combined records.
///
/// Writes are independent per sink. A failure here never touches any other
/// sink's output.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// A required sink that fails makes the whole run fail.
    fn required(&self) -> bool {
        false
    }

    fn write(&self, records: &[CombinedRecord]) -> Result<WriteSummary, SinkError>;

    /// Called once with the finished report. Most sinks have nothing to log.
    fn record_run(&self, _report: &RunReport) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Result of one sink's write, as carried in the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkSummary {
    pub name: String,
    pub required: bool,
    pub success: bool,
    pub rows: usize,
    pub target: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SinkReport {
    pub sinks: Vec<SinkSummary>,
}

impl SinkReport {
    pub fn succeeded(&self) -> usize {
        self.sinks.iter().filter(|s| s.success).count()
    }

    pub fn failed(&self) -> usize {
        self.sinks.len() - self.succeeded()
    }

    pub fn required_failed(&self) -> bool {
        self.sinks.iter().any(|s| s.required && !s.success)
    }
}

/// Publishes the same record set to every enabled sink.
#[derive(Default)]
pub struct SinkFanout {
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write to every sink in order; each failure is reported, none is raised.
    pub fn publish(&self, records: &[CombinedRecord]) -> SinkReport {
        let sinks = self
            .sinks
            .iter()
            .map(|sink| match sink.write(records) {
                Ok(summary) => {
                    info!(sink = sink.name(), rows = summary.rows, target = %summary.target, "sink written");
                    SinkSummary {
                        name: sink.name().to_string(),
                        required: sink.required(),
                        success: true,
                        rows: summary.rows,
                        target: Some(summary.target),
                        error: None,
                    }
                }
                Err(e) => {
                    if sink.required() {
                        error!(sink = sink.name(), error = %e, "required sink failed");
                    } else {
                        warn!(sink = sink.name(), error = %e, "sink failed");
                    }
                    SinkSummary {
                        name: sink.name().to_string(),
                        required: sink.required(),
                        success: false,
                        rows: 0,
                        target: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();
        SinkReport { sinks }
    }

    /// Hand the finished report to every sink's run log.
    pub fn record_run(&self, report: &RunReport) {
        for sink in &self.sinks {
            if let Err(e) = sink.record_run(report) {
                warn!(sink = sink.name(), error = %e, "failed to record run");
            }
        }
    }
}

/// Fill the timestamp placeholder and make sure the parent directory exists.
pub fn render_path(template: &str, now: &DateTime<Local>) -> Result<PathBuf, SinkError> {
    let path = PathBuf::from(template.replace(TIMESTAMP_PLACEHOLDER, &now.format("%Y%m%d_%H%M%S").to_string()));
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::testing::{combined, FailingSink, RecordingSink};

    #[test]
    fn one_failure_does_not_block_others() {
        let recording = RecordingSink::new("csv");
        let written = recording.written();
        let fanout = SinkFanout::new()
            .with_sink(Box::new(FailingSink::new("database", false)))
            .with_sink(Box::new(recording));

        let records = vec![combined(1, "A", true), combined(2, "B", false)];
        let report = fanout.publish(&records);

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.required_failed());
        assert_eq!(report.sinks[0].name, "database");
        assert!(report.sinks[0].error.as_deref().unwrap().contains("connection"));
        assert_eq!(report.sinks[1].rows, 2);
        assert_eq!(written.lock().unwrap().len(), 2);
    }

    #[test]
    fn required_failure_is_flagged() {
        let fanout = SinkFanout::new().with_sink(Box::new(FailingSink::new("database", true)));
        assert!(fanout.publish(&[]).required_failed());
    }

    #[test]
    fn renders_timestamped_paths() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("nested/out_{timestamp}.csv");
        let now = Local.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let path = render_path(template.to_str().unwrap(), &now).unwrap();
        assert!(path.ends_with("nested/out_20250304_050607.csv"));
        assert!(dir.path().join("nested").is_dir());
    }
}
