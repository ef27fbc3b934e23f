//! Per-tick population metrics written as JSON lines.

use anyhow::Result;
use foxhare_core::{MetricsSink, PopulationSummary};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Appends one JSON object per tick to a line-delimited file.
pub struct JsonlSink {
    writer: BufWriter<File>,
    failed: bool,
}

impl JsonlSink {
    /// Create (truncating) the metrics file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            failed: false,
        })
    }
}

impl MetricsSink for JsonlSink {
    fn on_tick(&mut self, summary: &PopulationSummary) {
        if self.failed {
            return;
        }
        if let Err(error) = serde_json::to_writer(&mut self.writer, summary) {
            warn!(%error, "metrics write failed, disabling sink");
            self.failed = true;
            return;
        }
        if let Err(error) = self.writer.write_all(b"\n") {
            warn!(%error, "metrics write failed, disabling sink");
            self.failed = true;
        }
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
