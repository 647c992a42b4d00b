//! Incremental telemetry recording.
//!
//! One [`TelemetryWriter`] owns one per-scenario CSV file. Rows are written
//! as they are produced and the driver flushes once per sampling interval,
//! so an interrupted run keeps every completed interval on disk instead of
//! buffering the whole run in memory.

use qkdsim_common::{TelemetrySample, TELEMETRY_HEADER};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Streaming CSV writer for telemetry samples.
pub struct TelemetryWriter<W: Write> {
    writer: W,
    rows: u64,
}

impl TelemetryWriter<BufWriter<File>> {
    /// Create the output file (and its parent directory) and write the
    /// header. Any existing file at `path` is truncated.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_writer(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> TelemetryWriter<W> {
    /// Wrap an arbitrary writer and emit the header.
    pub fn from_writer(mut writer: W) -> std::io::Result<Self> {
        writeln!(writer, "{}", TELEMETRY_HEADER)?;
        Ok(Self { writer, rows: 0 })
    }

    /// Append one sample as one CSV row.
    pub fn write_sample(&mut self, sample: &TelemetrySample) -> std::io::Result<()> {
        writeln!(self.writer, "{}", sample.to_csv_row())?;
        self.rows += 1;
        Ok(())
    }

    /// Flush buffered rows to the underlying writer.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Rows written so far (excluding the header).
    pub fn rows(&self) -> u64 {
        self.rows
    }
}

/// Conventional per-scenario file name inside a data directory.
pub fn scenario_file(data_dir: &Path, scenario_name: &str) -> PathBuf {
    data_dir.join(format!("dataset_{scenario_name}.csv"))
}
