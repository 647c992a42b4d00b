//! Dataset consolidation and feature engineering.
//!
//! Reads the six per-scenario telemetry files, derives trend/alert
//! features per (scenario, link) group in timestamp order, assigns the
//! scenario's class label to every row, and concatenates the six labeled
//! frames into one dataset without reordering. Scenario files are
//! independent units of work and are parsed concurrently; the final merge
//! is a single-threaded write so output ordering is deterministic and
//! re-running on the same inputs is byte-identical.

use qkdsim_common::{SimTime, TelemetrySample, TELEMETRY_HEADER};
use qkdsim_faults::SCENARIO_NAMES;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Back-reflection power above this is anomalous (watts). Healthy sources
/// reflect at the femtowatt class; a Trojan-horse probe is milliwatt class.
pub const BACK_REFLECTION_ALERT_W: f64 = 1e-6;

/// Classical QBER alarm threshold (the Tokyo KMS uses 5%).
pub const QBER_ALERT_THRESHOLD: f64 = 0.05;

/// Trailing window length for moving average and variance.
pub const TREND_WINDOW: usize = 5;

/// Exact header of the consolidated dataset file: all telemetry columns
/// plus the derived features and the class label.
pub const DATASET_HEADER: &str = "link_id,timestamp,qber,key_rate_sifted,key_rate_final,detection_count,error_count,dark_count_rate,detector_efficiency,back_reflection_power,phase_error_rate,qber_delta,qber_ma5,qber_var5,key_rate_drop,dark_count_delta,back_reflection_alert,qber_alert,label";

// ============================================================================
// Error Types
// ============================================================================

/// Errors from dataset assembly. All are fatal for the consolidation and
/// name the offending file; no input is ever silently dropped.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// A required per-scenario input file does not exist.
    #[error("Missing scenario input file: {path}")]
    MissingInput {
        /// Expected file path.
        path: PathBuf,
    },

    /// An input file's header does not match the telemetry schema.
    #[error("Schema mismatch in {path}: expected '{expected}', found '{found}'")]
    SchemaMismatch {
        /// Offending file path.
        path: PathBuf,
        /// Expected header.
        expected: String,
        /// Header actually present.
        found: String,
    },

    /// A row could not be parsed.
    #[error("Malformed row in {path} line {line}: {message}")]
    Malformed {
        /// Offending file path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// IO failure reading an input or writing the output.
    #[error("IO error on {path}: {source}")]
    Io {
        /// File path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Feature Derivation
// ============================================================================

/// Fixed-size trailing window over a per-link series. The window shrinks
/// near the start of a group and never looks ahead.
#[derive(Debug, Clone, Default)]
struct RollingWindow {
    buf: [f64; TREND_WINDOW],
    len: usize,
    next: usize,
}

impl RollingWindow {
    fn push(&mut self, value: f64) {
        self.buf[self.next] = value;
        self.next = (self.next + 1) % TREND_WINDOW;
        if self.len < TREND_WINDOW {
            self.len += 1;
        }
    }

    fn mean(&self) -> f64 {
        self.buf[..self.len.max(1)].iter().sum::<f64>() / self.len.max(1) as f64
    }

    /// Sample variance (n-1 denominator); zero for windows of size one.
    fn variance(&self) -> f64 {
        if self.len < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let ss: f64 = self.buf[..self.len]
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum();
        ss / (self.len - 1) as f64
    }
}

/// Per-(scenario, link) derivation state. Features depend only on the same
/// link's prior samples within the same scenario run.
#[derive(Debug, Default)]
struct GroupState {
    window: RollingWindow,
    prev_qber: Option<f64>,
    prev_dark: Option<f64>,
    first_final_rate: Option<f64>,
}

/// One row of the consolidated dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    /// The underlying telemetry sample.
    pub sample: TelemetrySample,
    /// First difference of QBER within the group (0 at the first row).
    pub qber_delta: f64,
    /// Trailing moving average of QBER, window of up to 5.
    pub qber_ma5: f64,
    /// Trailing sample variance of QBER, same window.
    pub qber_var5: f64,
    /// Final-key-rate drop relative to the group's own first sample.
    pub key_rate_drop: f64,
    /// First difference of the dark-count rate (0 at the first row).
    pub dark_count_delta: f64,
    /// 1 if back-reflection power exceeds [`BACK_REFLECTION_ALERT_W`].
    pub back_reflection_alert: u8,
    /// 1 if QBER exceeds [`QBER_ALERT_THRESHOLD`].
    pub qber_alert: u8,
    /// Class label of the owning scenario.
    pub label: u8,
}

impl DatasetRecord {
    /// Serialize as one CSV row matching [`DATASET_HEADER`].
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.sample.to_csv_row(),
            self.qber_delta,
            self.qber_ma5,
            self.qber_var5,
            self.key_rate_drop,
            self.dark_count_delta,
            self.back_reflection_alert,
            self.qber_alert,
            self.label,
        )
    }
}

/// Derive features for one scenario frame, preserving row order.
///
/// Rows must be in increasing timestamp order per link (the order the
/// telemetry recorder emits). Rows of different links may interleave;
/// state is tracked per link.
pub fn derive_features(label: u8, samples: &[TelemetrySample]) -> Vec<DatasetRecord> {
    let mut groups: BTreeMap<&str, GroupState> = BTreeMap::new();
    let mut records = Vec::with_capacity(samples.len());

    for sample in samples {
        let state = groups.entry(sample.link_id.as_str()).or_default();

        let qber_delta = state.prev_qber.map_or(0.0, |prev| sample.qber - prev);
        let dark_count_delta = state
            .prev_dark
            .map_or(0.0, |prev| sample.dark_count_rate - prev);

        state.window.push(sample.qber);
        let qber_ma5 = state.window.mean();
        let qber_var5 = state.window.variance();

        let first = *state
            .first_final_rate
            .get_or_insert(sample.key_rate_final);
        let key_rate_drop = if first > 0.0 {
            (first - sample.key_rate_final) / first
        } else {
            0.0
        };

        state.prev_qber = Some(sample.qber);
        state.prev_dark = Some(sample.dark_count_rate);

        records.push(DatasetRecord {
            qber_delta,
            qber_ma5,
            qber_var5,
            key_rate_drop,
            dark_count_delta,
            back_reflection_alert: u8::from(
                sample.back_reflection_power > BACK_REFLECTION_ALERT_W,
            ),
            qber_alert: u8::from(sample.qber > QBER_ALERT_THRESHOLD),
            label,
            sample: sample.clone(),
        });
    }

    records
}

// ============================================================================
// Telemetry Parsing
// ============================================================================

/// Parse one telemetry file: header check, then rows in file order.
pub fn read_telemetry_file(path: &Path) -> Result<Vec<TelemetrySample>, ConsolidationError> {
    if !path.exists() {
        return Err(ConsolidationError::MissingInput {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConsolidationError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut lines = text.lines();
    let header = lines.next().unwrap_or("");
    if header != TELEMETRY_HEADER {
        return Err(ConsolidationError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: TELEMETRY_HEADER.to_string(),
            found: header.to_string(),
        });
    }

    let mut samples = Vec::new();
    for (i, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }
        samples.push(parse_row(path, i + 2, line)?);
    }
    Ok(samples)
}

fn parse_row(path: &Path, line_no: usize, line: &str) -> Result<TelemetrySample, ConsolidationError> {
    let malformed = |message: String| ConsolidationError::Malformed {
        path: path.to_path_buf(),
        line: line_no,
        message,
    };

    let fields: Vec<&str> = line.split(',').collect();
    let expected = TELEMETRY_HEADER.split(',').count();
    if fields.len() != expected {
        return Err(malformed(format!(
            "expected {expected} fields, found {}",
            fields.len()
        )));
    }

    fn num<T: std::str::FromStr>(field: &str, name: &str) -> Result<T, String> {
        field
            .parse()
            .map_err(|_| format!("invalid {name}: '{field}'"))
    }

    Ok(TelemetrySample {
        link_id: fields[0].to_string(),
        timestamp: SimTime::from_ps(num(fields[1], "timestamp").map_err(&malformed)?),
        qber: num(fields[2], "qber").map_err(&malformed)?,
        key_rate_sifted: num(fields[3], "key_rate_sifted").map_err(&malformed)?,
        key_rate_final: num(fields[4], "key_rate_final").map_err(&malformed)?,
        detection_count: num(fields[5], "detection_count").map_err(&malformed)?,
        error_count: num(fields[6], "error_count").map_err(&malformed)?,
        dark_count_rate: num(fields[7], "dark_count_rate").map_err(&malformed)?,
        detector_efficiency: num(fields[8], "detector_efficiency").map_err(&malformed)?,
        back_reflection_power: num(fields[9], "back_reflection_power").map_err(&malformed)?,
        phase_error_rate: num(fields[10], "phase_error_rate").map_err(&malformed)?,
    })
}

// ============================================================================
// Consolidation
// ============================================================================

/// Consolidate the six per-scenario telemetry files in `data_dir`
/// (`dataset_<scenario>.csv`, one per scenario) into one labeled dataset
/// at `output`. Returns the total row count written.
///
/// Files are parsed and feature-derived concurrently (one unit of work per
/// scenario); the concatenation is a single sequential write in class-label
/// order, so the result is deterministic and groups never split across the
/// merge boundary.
pub fn consolidate(data_dir: &Path, output: &Path) -> Result<u64, ConsolidationError> {
    let paths: Vec<PathBuf> = SCENARIO_NAMES
        .iter()
        .map(|name| crate::telemetry::scenario_file(data_dir, name))
        .collect();

    // Fail on missing inputs before spawning any work.
    for path in &paths {
        if !path.exists() {
            return Err(ConsolidationError::MissingInput { path: path.clone() });
        }
    }

    // Every frame must parse before the output file is touched, so a bad
    // input never leaves a truncated dataset behind.
    let frames: Vec<Vec<DatasetRecord>> = std::thread::scope(|scope| {
        let handles: Vec<_> = paths
            .iter()
            .enumerate()
            .map(|(label, path)| {
                scope.spawn(move || {
                    let samples = read_telemetry_file(path)?;
                    Ok(derive_features(label as u8, &samples))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| panic!("consolidation worker panicked")))
            .collect::<Result<_, ConsolidationError>>()
    })?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| ConsolidationError::Io {
                path: output.to_path_buf(),
                source,
            })?;
        }
    }
    let io_err = |source| ConsolidationError::Io {
        path: output.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(output).map_err(io_err)?);

    writeln!(writer, "{}", DATASET_HEADER).map_err(io_err)?;
    let mut rows = 0u64;
    for frame in frames {
        for record in &frame {
            writeln!(writer, "{}", record.to_csv_row()).map_err(io_err)?;
            rows += 1;
        }
        tracing::debug!(rows = frame.len(), "merged scenario frame");
    }
    writer.flush().map_err(io_err)?;

    tracing::info!(rows, output = %output.display(), "consolidated dataset written");
    Ok(rows)
}

// ============================================================================
// Tests
// ============================================================================
