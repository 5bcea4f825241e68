use std::fs::File;
use std::io::{BufWriter, Write};

use chrono::Local;

use super::{render_path, Sink, WriteSummary};
use crate::error::SinkError;
use crate::model::CombinedRecord;

/// Full nested JSON document: every combined record with its detail.
pub struct FileSink {
    path: String,
    required: bool,
}

impl FileSink {
    pub fn new(path: impl Into<String>, required: bool) -> Self {
        Self {
            path: path.into(),
            required,
        }
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn required(&self) -> bool {
        self.required
    }

    fn write(&self, records: &[CombinedRecord]) -> Result<WriteSummary, SinkError> {
        let path = render_path(&self.path, &Local::now())?;
        let mut out = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut out, records)?;
        out.flush()?;
        Ok(WriteSummary {
            rows: records.len(),
            target: path.display().to_string(),
        })
    }
}
