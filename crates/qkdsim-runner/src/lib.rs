//! # qkdsim-runner
//!
//! Scenario driver, telemetry recording, and dataset consolidation for the
//! QKD fault-telemetry pipeline.
//!
//! One run wires a topology and one active fault scenario into the
//! physical engine, advances simulated time in fixed sampling intervals,
//! and streams one telemetry row per (link, interval) to a per-scenario
//! CSV file. The six scenario runs are independent (each owns its engine
//! instance and output file) and may execute in parallel. The interval
//! loop inside a run is strictly sequential because engine state
//! accumulates across intervals.

pub mod dataset;
pub mod telemetry;

use parking_lot::Mutex;
use qkdsim_channel::{Bb84Engine, EngineError, QuantumEngine};
use qkdsim_common::{IntervalOutput, RawCounters, SimTime, TelemetrySample};
use qkdsim_faults::{FaultScenario, SCENARIO_NAMES};
use qkdsim_model::{ConfigError, NodeRole, Topology};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use dataset::{consolidate, ConsolidationError, DATASET_HEADER};
pub use telemetry::{scenario_file, TelemetryWriter};

// ============================================================================
// Error Types
// ============================================================================

/// The physical engine reported an impossible or failing interval.
///
/// Fatal for the owning scenario run only; other runs are unaffected.
/// Every variant names the scenario and interval index so a bad run is
/// reproducible.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// A raw counter came back negative. Never clamped.
    #[error("scenario '{scenario}', interval {interval}, link '{link}': negative {counter} ({value})")]
    NegativeCounter {
        /// Scenario name.
        scenario: &'static str,
        /// Interval index.
        interval: usize,
        /// Link id.
        link: String,
        /// Counter name.
        counter: &'static str,
        /// Offending value.
        value: i64,
    },

    /// Counters contradict each other (errors beyond detections, final key
    /// beyond sifted key).
    #[error("scenario '{scenario}', interval {interval}, link '{link}': {constraint} violated ({got} > {bound})")]
    InconsistentCounter {
        /// Scenario name.
        scenario: &'static str,
        /// Interval index.
        interval: usize,
        /// Link id.
        link: String,
        /// Constraint description.
        constraint: &'static str,
        /// Offending value.
        got: i64,
        /// Violated bound.
        bound: i64,
    },

    /// Sifted-bit rate above the light-source pulse rate: bits cannot be
    /// sifted faster than pulses arrive.
    #[error("scenario '{scenario}', interval {interval}, link '{link}': sifted rate {rate_bps} bps exceeds source frequency {source_hz} Hz")]
    RateExceedsSource {
        /// Scenario name.
        scenario: &'static str,
        /// Interval index.
        interval: usize,
        /// Link id.
        link: String,
        /// Observed sifted rate.
        rate_bps: f64,
        /// Light-source frequency.
        source_hz: f64,
    },

    /// The engine failed (after the single interval-level retry for
    /// transient failures).
    #[error("scenario '{scenario}', interval {interval}: {source}")]
    Engine {
        /// Scenario name.
        scenario: &'static str,
        /// Interval index.
        interval: usize,
        /// Engine error.
        #[source]
        source: EngineError,
    },
}

/// Errors from driving one or more scenario runs.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Topology/configuration error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Physical-engine contract violation.
    #[error("Simulation error: {0}")]
    Simulation(#[from] SimulationError),

    /// Dataset assembly error.
    #[error("Consolidation error: {0}")]
    Consolidation(#[from] ConsolidationError),

    /// Invalid run settings.
    #[error("Invalid settings: {0}")]
    Settings(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Run Settings
// ============================================================================

/// Knobs of one scenario run, shared across all six scenarios of a dataset.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Total simulated duration.
    pub duration: SimTime,
    /// Number of sampling intervals (interval = duration / samples).
    pub samples: usize,
    /// Light-source operating frequency in Hz.
    pub source_frequency_hz: f64,
    /// Dataset-wide RNG seed.
    pub seed: u64,
}

impl Default for RunSettings {
    /// One simulated second, 100 samples, 1 MHz source, seed 42.
    fn default() -> Self {
        Self {
            duration: SimTime::SECOND,
            samples: 100,
            source_frequency_hz: 1e6,
            seed: 42,
        }
    }
}

impl RunSettings {
    fn validate(&self) -> Result<(), RunnerError> {
        if self.duration == SimTime::ZERO {
            return Err(RunnerError::Settings("duration must be positive".into()));
        }
        if self.samples == 0 {
            return Err(RunnerError::Settings("sample count must be positive".into()));
        }
        if self.duration.as_ps() < self.samples as u64 {
            return Err(RunnerError::Settings(
                "duration shorter than one picosecond per sample".into(),
            ));
        }
        if !(self.source_frequency_hz > 0.0) {
            return Err(RunnerError::Settings(
                "light-source frequency must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Length of one sampling interval.
    pub fn interval(&self) -> SimTime {
        self.duration.div(self.samples as u64)
    }
}

/// What one scenario run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Scenario name.
    pub scenario: String,
    /// Class label.
    pub label: u8,
    /// Telemetry file written.
    pub output: PathBuf,
    /// Links simulated.
    pub links: usize,
    /// Sampling intervals completed.
    pub samples: usize,
    /// Telemetry rows written.
    pub rows: u64,
    /// Simulated duration in picoseconds.
    pub duration_ps: u64,
    /// Seed used.
    pub seed: u64,
}

// ============================================================================
// Simulation Driver
// ============================================================================

/// Drive one full run for one fault scenario, writing telemetry to `output`.
///
/// The interval loop is strictly sequential. Raw counters are validated
/// against the physical contract on every interval; violations abort the
/// run with a [`SimulationError`] naming scenario, interval, and link.
/// Transient engine failures are retried once at the interval level.
pub fn run_scenario<E: QuantumEngine>(
    topology: &Topology,
    scenario: &FaultScenario,
    settings: &RunSettings,
    engine: &mut E,
    output: &Path,
) -> Result<RunSummary, RunnerError> {
    settings.validate()?;

    let baselines: Vec<_> = topology
        .links()
        .iter()
        .map(|link| {
            topology
                .baseline_parameters(&link.id)
                .map(|params| (link.id.clone(), params))
        })
        .collect::<Result<_, _>>()?;

    let interval = settings.interval();
    let dt_s = interval.as_secs_f64();
    let mut writer = TelemetryWriter::create(output)?;

    tracing::info!(
        scenario = scenario.name(),
        links = baselines.len(),
        samples = settings.samples,
        interval_ps = interval.as_ps(),
        "starting scenario run"
    );

    for i in 0..settings.samples {
        let t = interval.mul(i as u64 + 1);
        for (link_id, baseline) in &baselines {
            let params = scenario.compute_override(t, link_id, baseline).applied(baseline);
            let out = advance_with_retry(
                engine,
                scenario.name(),
                i,
                link_id,
                &params,
                interval,
                settings.source_frequency_hz,
            )?;
            let c = validate_counters(
                scenario.name(),
                i,
                link_id,
                &out,
                dt_s,
                settings.source_frequency_hz,
            )?;

            let qber = if c.detections > 0 {
                c.errors as f64 / c.detections as f64
            } else {
                0.0
            };
            writer.write_sample(&TelemetrySample {
                link_id: link_id.clone(),
                timestamp: t,
                qber,
                key_rate_sifted: c.sifted_bits as f64 / dt_s,
                key_rate_final: c.final_bits as f64 / dt_s,
                detection_count: c.detections as u64,
                error_count: c.errors as u64,
                dark_count_rate: out.readout.dark_count_rate,
                detector_efficiency: out.readout.detector_efficiency,
                back_reflection_power: out.readout.back_reflection_power,
                phase_error_rate: out.readout.phase_error_rate,
            })?;
        }
        // Completed intervals survive an interruption.
        writer.flush()?;
    }

    let summary = RunSummary {
        scenario: scenario.name().to_string(),
        label: scenario.label(),
        output: output.to_path_buf(),
        links: baselines.len(),
        samples: settings.samples,
        rows: writer.rows(),
        duration_ps: settings.duration.as_ps(),
        seed: settings.seed,
    };
    tracing::info!(
        scenario = scenario.name(),
        rows = summary.rows,
        "scenario run complete"
    );
    Ok(summary)
}

fn advance_with_retry<E: QuantumEngine>(
    engine: &mut E,
    scenario: &'static str,
    interval_idx: usize,
    link_id: &str,
    params: &qkdsim_common::ParameterSet,
    interval: SimTime,
    source_hz: f64,
) -> Result<IntervalOutput, SimulationError> {
    match engine.advance_interval(link_id, params, interval, source_hz) {
        Ok(out) => Ok(out),
        Err(e) if e.is_transient() => {
            tracing::warn!(
                scenario,
                interval = interval_idx,
                link = link_id,
                error = %e,
                "transient engine failure, retrying interval once"
            );
            engine
                .advance_interval(link_id, params, interval, source_hz)
                .map_err(|source| SimulationError::Engine {
                    scenario,
                    interval: interval_idx,
                    source,
                })
        }
        Err(source) => Err(SimulationError::Engine {
            scenario,
            interval: interval_idx,
            source,
        }),
    }
}

fn validate_counters(
    scenario: &'static str,
    interval: usize,
    link: &str,
    out: &IntervalOutput,
    dt_s: f64,
    source_hz: f64,
) -> Result<RawCounters, SimulationError> {
    let c = out.counters;
    for (counter, value) in [
        ("detection_count", c.detections),
        ("error_count", c.errors),
        ("sifted_bits", c.sifted_bits),
        ("final_bits", c.final_bits),
    ] {
        if value < 0 {
            return Err(SimulationError::NegativeCounter {
                scenario,
                interval,
                link: link.to_string(),
                counter,
                value,
            });
        }
    }
    if c.errors > c.detections {
        return Err(SimulationError::InconsistentCounter {
            scenario,
            interval,
            link: link.to_string(),
            constraint: "errors <= detections",
            got: c.errors,
            bound: c.detections,
        });
    }
    if c.final_bits > c.sifted_bits {
        return Err(SimulationError::InconsistentCounter {
            scenario,
            interval,
            link: link.to_string(),
            constraint: "final_bits <= sifted_bits",
            got: c.final_bits,
            bound: c.sifted_bits,
        });
    }
    let sifted_rate = c.sifted_bits as f64 / dt_s;
    if sifted_rate > source_hz {
        return Err(SimulationError::RateExceedsSource {
            scenario,
            interval,
            link: link.to_string(),
            rate_bps: sifted_rate,
            source_hz,
        });
    }
    Ok(c)
}

// ============================================================================
// Multi-Scenario Orchestration
// ============================================================================

/// Pick the default `node_fail` victim: the last trusted relay encountered
/// walking the links in declaration order (the relay closest to the
/// detector end of the chain).
pub fn default_failed_relay(topology: &Topology) -> Option<String> {
    let mut victim = None;
    for link in topology.links() {
        for name in [&link.from, &link.to] {
            if let Ok(node) = topology.get_node(name) {
                if node.role == NodeRole::TrustedRelay {
                    victim = Some(node.name.clone());
                }
            }
        }
    }
    victim
}

/// Build the six standard scenarios for a run of `duration`, with
/// `node_fail` hitting the links incident to the default victim relay.
pub fn standard_scenarios(
    topology: &Topology,
    duration: SimTime,
) -> Vec<FaultScenario> {
    let affected = default_failed_relay(topology)
        .map(|relay| topology.links_incident(&relay))
        .unwrap_or_default();
    SCENARIO_NAMES
        .iter()
        .map(|name| {
            FaultScenario::standard(name, duration, affected.clone())
                .unwrap_or_else(|e| unreachable!("standard scenario name: {e}"))
        })
        .collect()
}

/// Run all six scenarios against one topology, writing
/// `dataset_<scenario>.csv` files into `data_dir`.
///
/// Runs execute on one thread per scenario; there is no shared mutable
/// state between them (each owns its engine, seeded on its own RNG stream,
/// and its output file), so a failed run never corrupts another's output.
/// All runs are driven to completion before the first error (in class-label
/// order) is reported.
pub fn run_all_scenarios(
    topology: &Topology,
    settings: &RunSettings,
    data_dir: &Path,
) -> Result<Vec<RunSummary>, RunnerError> {
    settings.validate()?;
    std::fs::create_dir_all(data_dir)?;

    let scenarios = standard_scenarios(topology, settings.duration);
    let summaries: Mutex<Vec<RunSummary>> = Mutex::new(Vec::new());
    let failures: Mutex<Vec<(u8, RunnerError)>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        let summaries = &summaries;
        let failures = &failures;
        for scenario in &scenarios {
            scope.spawn(move || {
                let label = scenario.label();
                let output = scenario_file(data_dir, scenario.name());
                let mut engine = Bb84Engine::new(settings.seed, label as u64);
                match run_scenario(topology, scenario, settings, &mut engine, &output) {
                    Ok(summary) => summaries.lock().push(summary),
                    Err(e) => {
                        tracing::error!(scenario = scenario.name(), error = %e, "scenario run failed");
                        failures.lock().push((label, e));
                    }
                }
            });
        }
    });

    let mut failures = failures.into_inner();
    if !failures.is_empty() {
        failures.sort_by_key(|(label, _)| *label);
        return Err(failures.remove(0).1);
    }

    let mut summaries = summaries.into_inner();
    summaries.sort_by_key(|s| s.label);
    Ok(summaries)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use qkdsim_channel::NoiseConfig;
    use qkdsim_common::{DetectorReadout, ParameterSet};

    fn settings(samples: usize) -> RunSettings {
        RunSettings {
            samples,
            ..Default::default()
        }
    }

    /// Engine double returning scripted outputs.
    struct ScriptedEngine {
        outputs: Vec<Result<IntervalOutput, EngineError>>,
        calls: usize,
    }

    impl QuantumEngine for ScriptedEngine {
        fn advance_interval(
            &mut self,
            _link_id: &str,
            _params: &ParameterSet,
            _interval: SimTime,
            _source_frequency_hz: f64,
        ) -> Result<IntervalOutput, EngineError> {
            let idx = self.calls.min(self.outputs.len() - 1);
            self.calls += 1;
            match &self.outputs[idx] {
                Ok(o) => Ok(*o),
                Err(EngineError::Transient(m)) => Err(EngineError::Transient(m.clone())),
                Err(EngineError::Fatal(m)) => Err(EngineError::Fatal(m.clone())),
                Err(EngineError::InvalidInput(m)) => Err(EngineError::InvalidInput(m.clone())),
            }
        }
    }

    fn good_output() -> IntervalOutput {
        IntervalOutput {
            counters: RawCounters {
                detections: 580,
                errors: 16,
                sifted_bits: 290,
                final_bits: 229,
            },
            readout: DetectorReadout {
                dark_count_rate: 100.0,
                detector_efficiency: 0.8,
                back_reflection_power: 1e-15,
                phase_error_rate: 0.005,
            },
        }
    }

    #[test]
    fn test_run_emits_one_row_per_link_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let path = dir.path().join("dataset_normal.csv");
        let mut engine = Bb84Engine::new(42, 0);
        let summary = run_scenario(
            &topo,
            &FaultScenario::Normal,
            &settings(10),
            &mut engine,
            &path,
        )
        .unwrap();
        assert_eq!(summary.rows, 40);
        assert_eq!(summary.links, 4);

        let samples = dataset::read_telemetry_file(&path).unwrap();
        assert_eq!(samples.len(), 40);
        // Timestamps strictly increase within each link group.
        for link in topo.links() {
            let ts: Vec<u64> = samples
                .iter()
                .filter(|s| s.link_id == link.id)
                .map(|s| s.timestamp.as_ps())
                .collect();
            assert_eq!(ts.len(), 10);
            assert!(ts.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_rates_are_counters_over_interval() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let path = dir.path().join("dataset_normal.csv");
        let mut engine = ScriptedEngine {
            outputs: vec![Ok(good_output())],
            calls: 0,
        };
        let cfg = settings(1);
        run_scenario(&topo, &FaultScenario::Normal, &cfg, &mut engine, &path).unwrap();
        let samples = dataset::read_telemetry_file(&path).unwrap();
        let dt_s = cfg.interval().as_secs_f64();
        assert!((samples[0].key_rate_sifted - 290.0 / dt_s).abs() < 1e-9);
        assert!((samples[0].key_rate_final - 229.0 / dt_s).abs() < 1e-9);
        assert!((samples[0].qber - 16.0 / 580.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_counter_rejected_not_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let mut out = good_output();
        out.counters.detections = -5;
        let mut engine = ScriptedEngine {
            outputs: vec![Ok(out)],
            calls: 0,
        };
        let err = run_scenario(
            &topo,
            &FaultScenario::Normal,
            &settings(1),
            &mut engine,
            &dir.path().join("x.csv"),
        )
        .unwrap_err();
        match err {
            RunnerError::Simulation(SimulationError::NegativeCounter {
                counter, value, interval, ..
            }) => {
                assert_eq!(counter, "detection_count");
                assert_eq!(value, -5);
                assert_eq!(interval, 0);
            }
            other => panic!("expected NegativeCounter, got {other}"),
        }
    }

    #[test]
    fn test_inconsistent_counters_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let mut out = good_output();
        out.counters.errors = out.counters.detections + 1;
        let mut engine = ScriptedEngine {
            outputs: vec![Ok(out)],
            calls: 0,
        };
        let err = run_scenario(
            &topo,
            &FaultScenario::Normal,
            &settings(1),
            &mut engine,
            &dir.path().join("x.csv"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Simulation(SimulationError::InconsistentCounter { .. })
        ));
    }

    #[test]
    fn test_sifted_rate_above_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let mut out = good_output();
        // 20_000 bits in a 10 ms interval = 2 MHz > 1 MHz source.
        out.counters.detections = 40_000;
        out.counters.sifted_bits = 20_000;
        out.counters.final_bits = 10_000;
        out.counters.errors = 100;
        let mut engine = ScriptedEngine {
            outputs: vec![Ok(out)],
            calls: 0,
        };
        let err = run_scenario(
            &topo,
            &FaultScenario::Normal,
            &settings(100),
            &mut engine,
            &dir.path().join("x.csv"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Simulation(SimulationError::RateExceedsSource { .. })
        ));
    }

    #[test]
    fn test_transient_failure_retried_once() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let mut engine = ScriptedEngine {
            outputs: vec![
                Err(EngineError::Transient("detector warm-up".into())),
                Ok(good_output()),
            ],
            calls: 0,
        };
        let summary = run_scenario(
            &topo,
            &FaultScenario::Normal,
            &settings(1),
            &mut engine,
            &dir.path().join("x.csv"),
        )
        .unwrap();
        assert_eq!(summary.rows, 4);
        assert_eq!(engine.calls, 5);
    }

    #[test]
    fn test_persistent_transient_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let mut engine = ScriptedEngine {
            outputs: vec![Err(EngineError::Transient("stuck".into()))],
            calls: 0,
        };
        let err = run_scenario(
            &topo,
            &FaultScenario::Normal,
            &settings(1),
            &mut engine,
            &dir.path().join("x.csv"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Simulation(SimulationError::Engine { interval: 0, .. })
        ));
        // One retry, no more.
        assert_eq!(engine.calls, 2);
    }

    #[test]
    fn test_fatal_failure_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let mut engine = ScriptedEngine {
            outputs: vec![Err(EngineError::Fatal("broken".into()))],
            calls: 0,
        };
        let err = run_scenario(
            &topo,
            &FaultScenario::Normal,
            &settings(1),
            &mut engine,
            &dir.path().join("x.csv"),
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::Simulation(_)));
        assert_eq!(engine.calls, 1);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let mut engine = Bb84Engine::new(42, 0);
        let bad = RunSettings {
            samples: 0,
            ..Default::default()
        };
        assert!(matches!(
            run_scenario(
                &topo,
                &FaultScenario::Normal,
                &bad,
                &mut engine,
                &dir.path().join("x.csv"),
            ),
            Err(RunnerError::Settings(_))
        ));
    }

    #[test]
    fn test_default_failed_relay_is_nearest_detector_end() {
        let topo = Topology::tokyo_reference();
        assert_eq!(default_failed_relay(&topo).as_deref(), Some("Hakusan"));
    }

    #[test]
    fn test_standard_scenarios_cover_all_labels() {
        let topo = Topology::tokyo_reference();
        let scenarios = standard_scenarios(&topo, SimTime::SECOND);
        let labels: Vec<u8> = scenarios.iter().map(|s| s.label()).collect();
        assert_eq!(labels, vec![0, 1, 2, 3, 4, 5]);
        match &scenarios[3] {
            FaultScenario::NodeFail { affected_links, .. } => {
                assert_eq!(
                    affected_links,
                    &vec!["Otemachi-Hakusan".to_string(), "Hakusan-Hongo".to_string()]
                );
            }
            other => panic!("expected NodeFail, got {other:?}"),
        }
    }

    #[test]
    fn test_same_seed_reproduces_run_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let topo = Topology::tokyo_reference();
        let scenario: FaultScenario = "qber".parse().unwrap();
        let cfg = settings(20);

        for name in ["a.csv", "b.csv"] {
            let mut engine =
                Bb84Engine::with_noise(cfg.seed, scenario.label() as u64, NoiseConfig::default());
            run_scenario(&topo, &scenario, &cfg, &mut engine, &dir.path().join(name)).unwrap();
        }
        let a = std::fs::read(dir.path().join("a.csv")).unwrap();
        let b = std::fs::read(dir.path().join("b.csv")).unwrap();
        assert_eq!(a, b);
    }
}
