//! # qkdsim-faults
//!
//! Fault scenario models for the QKD fault-telemetry pipeline.
//!
//! A [`FaultScenario`] is a closed sum type over the six operating
//! conditions. Each variant carries its own onset/magnitude parameters and
//! is dispatched through a single [`FaultScenario::compute_override`]
//! operation: a *pure, deterministic* mapping from simulated time (and link
//! identity) to a partial parameter perturbation. Stochastic measurement
//! noise lives in the channel's noise model, never here, so tests can
//! assert trend shape independent of noise draws.

use qkdsim_common::{ParameterOverride, ParameterSet, SimTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Error parsing a scenario name.
#[derive(Debug, Error)]
#[error("Unknown fault scenario '{0}' (expected one of: normal, qber, degrade, node_fail, blinding, trojan)")]
pub struct UnknownScenario(pub String);

// ============================================================================
// Scenario Type
// ============================================================================

/// Number of scenario classes.
pub const SCENARIO_COUNT: usize = 6;

/// Scenario names in class-label order.
pub const SCENARIO_NAMES: [&str; SCENARIO_COUNT] =
    ["normal", "qber", "degrade", "node_fail", "blinding", "trojan"];

/// One of the six mutually exclusive operating conditions of a run.
///
/// Exactly one scenario is active per run. Fields not perturbed by a
/// scenario retain their baseline values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FaultScenario {
    /// Baseline operation; the override is always empty.
    Normal,

    /// Intercept-resend attack onset: QBER ramps monotonically from the
    /// link's floor toward a high plateau, dragging the final key rate
    /// down through the error-correction cost.
    Qber {
        /// Centre of the logistic ramp.
        onset: SimTime,
        /// Ramp width; ~98% of the rise happens within ±2 widths.
        ramp_width: SimTime,
        /// QBER plateau, absolute (Tokyo field observation: ~25%).
        plateau: f64,
    },

    /// Gradual channel degradation: key production decays progressively
    /// toward zero while fiber loss grows and QBER rises mildly. The
    /// progressive shape is what separates it from the step-like `qber`.
    Degrade {
        /// Time at which the key-rate multiplier has fallen to `exp(-4)`.
        span: SimTime,
        /// Fiber attenuation multiplier reached at `span` (linear growth).
        attenuation_growth: f64,
        /// Additive QBER drift reached at `span` (linear growth).
        qber_drift: f64,
    },

    /// Trusted-relay outage: key distillation stops on the affected links
    /// at onset while the optical channel itself stays up.
    NodeFail {
        /// Outage time.
        onset: SimTime,
        /// Ids of the links that lose their relay.
        affected_links: Vec<String>,
    },

    /// Detector blinding: the detector saturates (efficiency pinned to 1)
    /// and click rates explode while QBER stays at baseline, evading
    /// QBER-threshold detection.
    Blinding {
        /// Attack start.
        onset: SimTime,
        /// Dark/forced count rate under blinding, counts per second.
        saturated_dark_count_rate: f64,
    },

    /// Trojan-horse probing: anomalous back-reflected power and a small
    /// phase-error elevation while QBER and key rates stay at baseline.
    Trojan {
        /// Attack start.
        onset: SimTime,
        /// Injected back-reflection power in watts (baseline is fW class).
        back_reflection_power: f64,
        /// Additive phase-error elevation from modulator disturbance.
        phase_error_offset: f64,
    },
}

impl FaultScenario {
    /// Scenario name, as used in dataset file names.
    pub fn name(&self) -> &'static str {
        match self {
            FaultScenario::Normal => "normal",
            FaultScenario::Qber { .. } => "qber",
            FaultScenario::Degrade { .. } => "degrade",
            FaultScenario::NodeFail { .. } => "node_fail",
            FaultScenario::Blinding { .. } => "blinding",
            FaultScenario::Trojan { .. } => "trojan",
        }
    }

    /// Fixed integer class label for the consolidated dataset.
    pub fn label(&self) -> u8 {
        match self {
            FaultScenario::Normal => 0,
            FaultScenario::Qber { .. } => 1,
            FaultScenario::Degrade { .. } => 2,
            FaultScenario::NodeFail { .. } => 3,
            FaultScenario::Blinding { .. } => 4,
            FaultScenario::Trojan { .. } => 5,
        }
    }

    /// Label for a scenario name without constructing the scenario.
    pub fn label_for(name: &str) -> Result<u8, UnknownScenario> {
        SCENARIO_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| i as u8)
            .ok_or_else(|| UnknownScenario(name.to_string()))
    }

    /// Build the standard scenario for a run of the given duration.
    ///
    /// Magnitudes follow the Tokyo QKD field signatures: fault onset at
    /// half the run, QBER plateau 25%, blinding at 5e6 counts/s, trojan
    /// back-reflection 1 mW with a 0.02 phase-error elevation.
    /// `affected_links` applies to `node_fail` only and is ignored by the
    /// other scenarios.
    pub fn standard(
        name: &str,
        duration: SimTime,
        affected_links: Vec<String>,
    ) -> Result<FaultScenario, UnknownScenario> {
        let onset = duration.div(2);
        Ok(match name {
            "normal" => FaultScenario::Normal,
            "qber" => FaultScenario::Qber {
                onset,
                ramp_width: duration.div(20),
                plateau: 0.25,
            },
            "degrade" => FaultScenario::Degrade {
                span: duration,
                attenuation_growth: 3.0,
                qber_drift: 0.01,
            },
            "node_fail" => FaultScenario::NodeFail {
                onset,
                affected_links,
            },
            "blinding" => FaultScenario::Blinding {
                onset,
                saturated_dark_count_rate: 5e6,
            },
            "trojan" => FaultScenario::Trojan {
                onset,
                back_reflection_power: 1e-3,
                phase_error_offset: 0.02,
            },
            other => return Err(UnknownScenario(other.to_string())),
        })
    }

    /// Compute the perturbation this scenario applies to `link_id` at
    /// simulated time `t`, on top of `baseline`.
    ///
    /// Pure and deterministic: no randomness, no hidden state.
    pub fn compute_override(
        &self,
        t: SimTime,
        link_id: &str,
        baseline: &ParameterSet,
    ) -> ParameterOverride {
        match self {
            FaultScenario::Normal => ParameterOverride::none(),

            FaultScenario::Qber {
                onset,
                ramp_width,
                plateau,
            } => {
                let target = logistic_ramp(t, *onset, *ramp_width, baseline.qber_floor, *plateau);
                ParameterOverride {
                    qber_offset: Some(target - baseline.qber_floor),
                    ..Default::default()
                }
            }

            FaultScenario::Degrade {
                span,
                attenuation_growth,
                qber_drift,
            } => {
                let frac = if span.as_ps() == 0 {
                    1.0
                } else {
                    (t.as_ps() as f64 / span.as_ps() as f64).min(1.0)
                };
                ParameterOverride {
                    // exp(-4) at span end: key production effectively gone.
                    key_rate_multiplier: Some((-4.0 * frac).exp()),
                    attenuation_multiplier: Some(1.0 + (attenuation_growth - 1.0) * frac),
                    qber_offset: Some(qber_drift * frac),
                    ..Default::default()
                }
            }

            FaultScenario::NodeFail {
                onset,
                affected_links,
            } => {
                if t >= *onset && affected_links.iter().any(|l| l == link_id) {
                    ParameterOverride {
                        key_rate_multiplier: Some(0.0),
                        ..Default::default()
                    }
                } else {
                    ParameterOverride::none()
                }
            }

            FaultScenario::Blinding {
                onset,
                saturated_dark_count_rate,
            } => {
                if t >= *onset {
                    ParameterOverride {
                        dark_count_multiplier: Some(
                            saturated_dark_count_rate / baseline.dark_count_rate.max(1.0),
                        ),
                        // Pin efficiency to 1.0: the detector is saturated
                        // into linear mode.
                        detector_efficiency_multiplier: Some(
                            1.0 / baseline.detector_efficiency.max(f64::MIN_POSITIVE),
                        ),
                        ..Default::default()
                    }
                } else {
                    ParameterOverride::none()
                }
            }

            FaultScenario::Trojan {
                onset,
                back_reflection_power,
                phase_error_offset,
            } => {
                if t >= *onset {
                    ParameterOverride {
                        back_reflection_power: Some(*back_reflection_power),
                        phase_error_offset: Some(*phase_error_offset),
                        ..Default::default()
                    }
                } else {
                    ParameterOverride::none()
                }
            }
        }
    }
}

impl std::str::FromStr for FaultScenario {
    type Err = UnknownScenario;

    /// Parse a scenario name into its standard one-second-run form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FaultScenario::standard(s, SimTime::SECOND, Vec::new())
    }
}

/// Monotonic logistic ramp from `floor` to `plateau`, centred on `onset`.
fn logistic_ramp(t: SimTime, onset: SimTime, width: SimTime, floor: f64, plateau: f64) -> f64 {
    let w = width.as_ps().max(1) as f64;
    let x = (t.as_ps() as f64 - onset.as_ps() as f64) / w;
    floor + (plateau - floor) / (1.0 + (-x).exp())
}

// ============================================================================
// Tests
// ============================================================================
