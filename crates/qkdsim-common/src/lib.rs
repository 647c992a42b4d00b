//! # qkdsim-common
//!
//! Common types for the QKD fault-telemetry simulation pipeline.
//!
//! This crate provides core primitives shared by the other workspace members:
//! - Simulated time in picoseconds ([`SimTime`])
//! - Per-link baseline physics ([`ParameterSet`])
//! - Partial fault perturbations ([`ParameterOverride`])
//! - Raw per-interval counters returned by the physical engine
//!   ([`RawCounters`], [`DetectorReadout`])
//! - The telemetry record schema ([`TelemetrySample`])

use serde::{Deserialize, Serialize};

// ============================================================================
// Time Types
// ============================================================================

/// Simulated time in picoseconds since run start.
///
/// Picoseconds match the resolution of optical-channel event timing; one
/// simulated second is `1e12` ps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    /// Zero time.
    pub const ZERO: SimTime = SimTime(0);

    /// One simulated second.
    pub const SECOND: SimTime = SimTime(1_000_000_000_000);

    /// Create from picoseconds.
    pub fn from_ps(ps: u64) -> Self {
        SimTime(ps)
    }

    /// Create from milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        SimTime(ms * 1_000_000_000)
    }

    /// Create from seconds (float).
    pub fn from_secs(s: f64) -> Self {
        SimTime((s * 1e12) as u64)
    }

    /// Get as picoseconds.
    pub fn as_ps(&self) -> u64 {
        self.0
    }

    /// Get as seconds (float).
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e12
    }

    /// Integer division into `n` equal intervals.
    pub fn div(&self, n: u64) -> SimTime {
        SimTime(self.0 / n)
    }

    /// Scale by an integer factor.
    pub fn mul(&self, n: u64) -> SimTime {
        SimTime(self.0 * n)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Self) -> Self::Output {
        SimTime(self.0 + rhs.0)
    }
}

impl std::ops::Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Self) -> Self::Output {
        SimTime(self.0.saturating_sub(rhs.0))
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ps", self.0)
    }
}

// ============================================================================
// Physical Parameters
// ============================================================================

/// Effective physical parameters of one link for one sampling interval.
///
/// A baseline `ParameterSet` is fixed at run start by the topology; the
/// active fault scenario perturbs it per interval through
/// [`ParameterOverride::applied`]. All rates are per second, lengths in
/// meters, attenuation in dB/km, optical power in watts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Fiber length in meters.
    pub length_m: f64,
    /// Fiber attenuation in dB/km.
    pub attenuation_db_per_km: f64,
    /// Mean photon number per signal pulse (decoy-state signal intensity).
    pub mean_photon_number: f64,
    /// Intrinsic quantum bit error rate of the link (optics + electronics).
    pub qber_floor: f64,
    /// Detector quantum efficiency in [0, 1].
    pub detector_efficiency: f64,
    /// Detector dark counts per second.
    pub dark_count_rate: f64,
    /// Back-reflected optical power on the source side, in watts.
    pub back_reflection_power: f64,
    /// Error rate on the auxiliary (X) basis.
    pub phase_error_rate: f64,
    /// Multiplier on sifted/final key production. 1.0 at baseline; faults
    /// that stop key distillation without touching the optics set it to 0.
    pub key_rate_multiplier: f64,
}

impl ParameterSet {
    /// Effective QBER for this interval.
    pub fn qber(&self) -> f64 {
        self.qber_floor.clamp(0.0, 1.0)
    }

    /// One-way channel transmittance from fiber loss.
    pub fn transmittance(&self) -> f64 {
        let loss_db = self.attenuation_db_per_km * self.length_m / 1000.0;
        10f64.powf(-loss_db / 10.0)
    }
}

/// Partial perturbation of a [`ParameterSet`].
///
/// Fields left as `None` retain the baseline value. Scenario functions are
/// pure: the same `(t, link)` always yields the same override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterOverride {
    /// Additive QBER offset, applied after the multiplier.
    pub qber_offset: Option<f64>,
    /// Multiplier on the QBER floor.
    pub qber_multiplier: Option<f64>,
    /// Multiplier on the fiber attenuation coefficient.
    pub attenuation_multiplier: Option<f64>,
    /// Multiplier on sifted/final key production.
    pub key_rate_multiplier: Option<f64>,
    /// Multiplier on the dark-count rate.
    pub dark_count_multiplier: Option<f64>,
    /// Multiplier on detector efficiency (result clamped to [0, 1]).
    pub detector_efficiency_multiplier: Option<f64>,
    /// Absolute back-reflection power in watts.
    pub back_reflection_power: Option<f64>,
    /// Additive offset on the phase error rate.
    pub phase_error_offset: Option<f64>,
}

impl ParameterOverride {
    /// An override that changes nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// True if every field is unset.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply this override on top of a baseline, yielding the effective
    /// parameters for one interval. The baseline itself is never mutated.
    pub fn applied(&self, baseline: &ParameterSet) -> ParameterSet {
        let mut p = baseline.clone();
        if let Some(m) = self.qber_multiplier {
            p.qber_floor *= m;
        }
        if let Some(o) = self.qber_offset {
            p.qber_floor += o;
        }
        p.qber_floor = p.qber_floor.clamp(0.0, 1.0);
        if let Some(m) = self.attenuation_multiplier {
            p.attenuation_db_per_km *= m;
        }
        if let Some(m) = self.key_rate_multiplier {
            p.key_rate_multiplier *= m;
        }
        if let Some(m) = self.dark_count_multiplier {
            p.dark_count_rate *= m;
        }
        if let Some(m) = self.detector_efficiency_multiplier {
            p.detector_efficiency = (p.detector_efficiency * m).clamp(0.0, 1.0);
        }
        if let Some(w) = self.back_reflection_power {
            p.back_reflection_power = w;
        }
        if let Some(o) = self.phase_error_offset {
            p.phase_error_rate = (p.phase_error_rate + o).clamp(0.0, 1.0);
        }
        p
    }
}

// ============================================================================
// Engine Output
// ============================================================================

/// Raw per-link counters for one sampling interval.
///
/// Counters are signed on purpose: the engine contract is external, and the
/// driver must reject (never clamp) physically impossible values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawCounters {
    /// Total detector clicks (signal + dark/forced counts).
    pub detections: i64,
    /// Bit errors among the detections.
    pub errors: i64,
    /// Bits surviving basis sifting.
    pub sifted_bits: i64,
    /// Secure bits after error correction and privacy amplification.
    pub final_bits: i64,
}

/// Measured detector-side analog values for one interval.
///
/// These are the effective parameters as a monitoring tap would observe
/// them, including measurement noise.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectorReadout {
    /// Observed dark counts per second.
    pub dark_count_rate: f64,
    /// Observed detector efficiency.
    pub detector_efficiency: f64,
    /// Observed back-reflection power in watts.
    pub back_reflection_power: f64,
    /// Observed phase error rate.
    pub phase_error_rate: f64,
}

/// Everything the physical engine reports for one (link, interval).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IntervalOutput {
    /// Raw counters for the interval.
    pub counters: RawCounters,
    /// Detector-side analog readout.
    pub readout: DetectorReadout,
}

// ============================================================================
// Telemetry Schema
// ============================================================================

/// Exact header of a per-scenario telemetry CSV file.
pub const TELEMETRY_HEADER: &str = "link_id,timestamp,qber,key_rate_sifted,key_rate_final,detection_count,error_count,dark_count_rate,detector_efficiency,back_reflection_power,phase_error_rate";

/// One telemetry record: one (link, interval) observation.
///
/// Append-only; never mutated after emission. Rates are counters divided by
/// the interval length in seconds, identically across all scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Link identifier.
    pub link_id: String,
    /// Sample timestamp (end of the interval).
    pub timestamp: SimTime,
    /// Quantum bit error rate, errors / detections.
    pub qber: f64,
    /// Sifted key rate in bits per second.
    pub key_rate_sifted: f64,
    /// Final secure key rate in bits per second.
    pub key_rate_final: f64,
    /// Detector clicks in the interval.
    pub detection_count: u64,
    /// Bit errors in the interval.
    pub error_count: u64,
    /// Observed dark counts per second.
    pub dark_count_rate: f64,
    /// Observed detector efficiency.
    pub detector_efficiency: f64,
    /// Observed back-reflection power in watts.
    pub back_reflection_power: f64,
    /// Observed phase error rate.
    pub phase_error_rate: f64,
}

impl TelemetrySample {
    /// Serialize as one CSV row matching [`TELEMETRY_HEADER`].
    ///
    /// Floats use Rust's shortest round-trip formatting: full precision,
    /// no rounding that could hide small trend signals.
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.link_id,
            self.timestamp.as_ps(),
            self.qber,
            self.key_rate_sifted,
            self.key_rate_final,
            self.detection_count,
            self.error_count,
            self.dark_count_rate,
            self.detector_efficiency,
            self.back_reflection_power,
            self.phase_error_rate,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
