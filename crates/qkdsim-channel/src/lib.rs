//! # qkdsim-channel
//!
//! BB84 physical-layer engine for the QKD fault-telemetry pipeline.
//!
//! This crate provides:
//! - The engine seam ([`QuantumEngine`]) the simulation driver talks to
//! - A per-interval BB84 counter model ([`Bb84Engine`])
//! - PHY helpers ([`binary_entropy`], [`secure_fraction`])
//! - A seeded measurement-noise model ([`NoiseConfig`])
//!
//! The engine owns all stochastic behavior. Fault trends are applied
//! upstream through parameter overrides; the engine only sees effective
//! parameters per interval, so the deterministic trend and the noise layer
//! stay separable.

use qkdsim_common::{DetectorReadout, IntervalOutput, ParameterSet, RawCounters, SimTime};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Failure reported by a physical engine for one interval.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient failure; the driver may retry the interval once.
    #[error("transient engine failure: {0}")]
    Transient(String),

    /// Unrecoverable failure for this run.
    #[error("engine failure: {0}")]
    Fatal(String),

    /// Parameters the engine cannot simulate.
    #[error("invalid engine input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    /// True if the interval may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

// ============================================================================
// Engine Seam
// ============================================================================

/// The contract between the simulation driver and the physical engine.
///
/// The driver never inspects engine internals: per interval it hands over
/// the effective parameters and receives aggregate counters back. State may
/// accumulate inside the engine across intervals of one run (the interval
/// loop is strictly sequential for this reason), so one engine instance
/// must never be shared between scenario runs.
pub trait QuantumEngine {
    /// Advance the physical state of one link over one sampling interval
    /// and return the raw counters and detector readout for it.
    fn advance_interval(
        &mut self,
        link_id: &str,
        params: &ParameterSet,
        interval: SimTime,
        source_frequency_hz: f64,
    ) -> Result<IntervalOutput, EngineError>;
}

// ============================================================================
// PHY Helpers
// ============================================================================

/// Shannon binary entropy h2(p), zero at the endpoints.
pub fn binary_entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -p * p.log2() - (1.0 - p) * (1.0 - p).log2()
}

/// Error-correction inefficiency over the Shannon limit (Cascade class).
pub const EC_INEFFICIENCY: f64 = 1.16;

/// Fraction of sifted bits surviving error correction and privacy
/// amplification at a given QBER: `1 - h2(q) - f·h2(q)`, floored at zero.
/// Goes to zero slightly above the 11% BB84 security threshold.
pub fn secure_fraction(qber: f64) -> f64 {
    (1.0 - (1.0 + EC_INEFFICIENCY) * binary_entropy(qber)).max(0.0)
}

// ============================================================================
// Noise Model
// ============================================================================

/// Measurement-noise magnitudes layered on top of the deterministic trend.
///
/// Defaults are small enough that a nominal run never trips the 5% QBER
/// alert and a faulted run's trend shape stays visible through the noise.
#[derive(Debug, Clone)]
pub struct NoiseConfig {
    /// Relative sigma on detection counts.
    pub detection_rel_sigma: f64,
    /// Absolute sigma on the observed QBER.
    pub qber_sigma: f64,
    /// Relative sigma on the observed dark-count rate.
    pub dark_count_rel_sigma: f64,
    /// Absolute sigma on the observed detector efficiency.
    pub efficiency_sigma: f64,
    /// Relative sigma on the observed back-reflection power.
    pub back_reflection_rel_sigma: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            detection_rel_sigma: 0.01,
            qber_sigma: 0.0008,
            dark_count_rel_sigma: 0.02,
            efficiency_sigma: 0.002,
            back_reflection_rel_sigma: 0.03,
        }
    }
}

impl NoiseConfig {
    /// Noise disabled entirely; the engine output equals the deterministic
    /// expectation. Used by tests asserting exact trend shape.
    pub fn disabled() -> Self {
        Self {
            detection_rel_sigma: 0.0,
            qber_sigma: 0.0,
            dark_count_rel_sigma: 0.0,
            efficiency_sigma: 0.0,
            back_reflection_rel_sigma: 0.0,
        }
    }
}

// ============================================================================
// BB84 Engine
// ============================================================================

/// Per-interval BB84 counter model.
///
/// For each interval the expected detection budget is
/// `pulses · µ · T(fiber) · η` signal clicks plus `dark_rate · Δt` dark
/// clicks; half the signal survives basis sifting and the secure fraction
/// of that survives distillation. Gaussian measurement noise (seeded,
/// reproducible) perturbs counts and readouts.
pub struct Bb84Engine {
    rng: ChaCha8Rng,
    noise: NoiseConfig,
}

impl Bb84Engine {
    /// Create an engine for one scenario run.
    ///
    /// `seed` is the dataset-wide seed; `stream` separates scenario runs
    /// (the scenario label is used), keeping parallel runs independently
    /// reproducible.
    pub fn new(seed: u64, stream: u64) -> Self {
        Self::with_noise(seed, stream, NoiseConfig::default())
    }

    /// Create an engine with an explicit noise configuration.
    pub fn with_noise(seed: u64, stream: u64, noise: NoiseConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(stream);
        Self { rng, noise }
    }

    /// Draw from N(mean, sigma), with sigma 0 collapsing to the mean.
    fn gauss(&mut self, mean: f64, sigma: f64) -> f64 {
        if sigma <= 0.0 {
            return mean;
        }
        match Normal::new(mean, sigma) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => mean,
        }
    }
}

impl QuantumEngine for Bb84Engine {
    fn advance_interval(
        &mut self,
        _link_id: &str,
        params: &ParameterSet,
        interval: SimTime,
        source_frequency_hz: f64,
    ) -> Result<IntervalOutput, EngineError> {
        let dt_s = interval.as_secs_f64();
        if dt_s <= 0.0 {
            return Err(EngineError::InvalidInput(
                "sampling interval must be positive".to_string(),
            ));
        }
        if source_frequency_hz <= 0.0 {
            return Err(EngineError::InvalidInput(
                "light-source frequency must be positive".to_string(),
            ));
        }

        let pulses = source_frequency_hz * dt_s;
        let p_click = params.mean_photon_number * params.transmittance() * params.detector_efficiency;
        let expected_signal = pulses * p_click;
        let expected_dark = params.dark_count_rate * dt_s;

        let signal = self
            .gauss(
                expected_signal,
                expected_signal * self.noise.detection_rel_sigma,
            )
            .max(0.0);
        let dark = self
            .gauss(expected_dark, expected_dark * self.noise.dark_count_rel_sigma)
            .max(0.0);

        let detections = (signal + dark).round() as i64;
        let qber = (params.qber() + self.gauss(0.0, self.noise.qber_sigma)).clamp(0.0, 1.0);
        let errors = ((detections as f64) * qber).round() as i64;

        // Basis sifting keeps half the signal clicks; distillation keeps
        // the secure fraction of that. The key-rate multiplier models the
        // protocol layer stopping (relay down, channel dead) without
        // touching the optics.
        let sifted = (signal / 2.0 * params.key_rate_multiplier).round() as i64;
        let final_bits = (sifted as f64 * secure_fraction(qber)).round() as i64;

        let readout = DetectorReadout {
            dark_count_rate: self
                .gauss(
                    params.dark_count_rate,
                    params.dark_count_rate * self.noise.dark_count_rel_sigma,
                )
                .max(0.0),
            detector_efficiency: self
                .gauss(params.detector_efficiency, self.noise.efficiency_sigma)
                .clamp(0.0, 1.0),
            back_reflection_power: self
                .gauss(
                    params.back_reflection_power,
                    params.back_reflection_power * self.noise.back_reflection_rel_sigma,
                )
                .max(0.0),
            phase_error_rate: params.phase_error_rate,
        };

        Ok(IntervalOutput {
            counters: RawCounters {
                detections,
                errors,
                sifted_bits: sifted,
                final_bits,
            },
            readout,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
