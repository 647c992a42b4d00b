//! End-to-end pipeline tests: scenario runs, per-scenario telemetry files,
//! and consolidation into one labeled dataset.

use qkdsim_channel::{Bb84Engine, NoiseConfig};
use qkdsim_common::SimTime;
use qkdsim_faults::{FaultScenario, SCENARIO_NAMES};
use qkdsim_model::Topology;
use qkdsim_runner::dataset::{self, DatasetRecord, DATASET_HEADER};
use qkdsim_runner::{
    consolidate, run_all_scenarios, run_scenario, scenario_file, ConsolidationError, RunSettings,
    RunnerError,
};
use std::path::Path;
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

fn settings(samples: usize) -> RunSettings {
    RunSettings {
        samples,
        ..Default::default()
    }
}

/// Run one scenario with measurement noise disabled and return its derived
/// feature records.
fn run_quiet(dir: &Path, name: &str, samples: usize) -> Vec<DatasetRecord> {
    let topo = Topology::tokyo_reference();
    let cfg = settings(samples);
    let affected = topo.links_incident("Hakusan");
    let scenario = FaultScenario::standard(name, cfg.duration, affected).unwrap();
    let mut engine = Bb84Engine::with_noise(
        cfg.seed,
        scenario.label() as u64,
        NoiseConfig::disabled(),
    );
    let output = scenario_file(dir, name);
    run_scenario(&topo, &scenario, &cfg, &mut engine, &output).unwrap();
    let samples = dataset::read_telemetry_file(&output).unwrap();
    dataset::derive_features(scenario.label(), &samples)
}

fn link_rows<'a>(records: &'a [DatasetRecord], link: &str) -> Vec<&'a DatasetRecord> {
    records
        .iter()
        .filter(|r| r.sample.link_id == link)
        .collect()
}

// ============================================================================
// Full Pipeline
// ============================================================================

#[test]
fn test_full_pipeline_produces_2400_labeled_rows() {
    let dir = TempDir::new().unwrap();
    let topo = Topology::tokyo_reference();
    let cfg = RunSettings::default();

    let summaries = run_all_scenarios(&topo, &cfg, dir.path()).unwrap();
    assert_eq!(summaries.len(), 6);
    for (summary, name) in summaries.iter().zip(SCENARIO_NAMES) {
        assert_eq!(summary.scenario, name);
        assert_eq!(summary.rows, 400);
        assert!(summary.output.exists());
    }

    let output = dir.path().join("dataset_full.csv");
    let rows = consolidate(dir.path(), &output).unwrap();
    assert_eq!(rows, 2400);

    let text = std::fs::read_to_string(&output).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some(DATASET_HEADER));

    // 400 rows per class label, in label order.
    let mut counts = [0usize; 6];
    let mut last_label = 0usize;
    for line in lines {
        let label: usize = line.rsplit(',').next().unwrap().parse().unwrap();
        assert!(label >= last_label);
        last_label = label;
        counts[label] += 1;
    }
    assert_eq!(counts, [400; 6]);
}

#[test]
fn test_consolidation_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let topo = Topology::tokyo_reference();
    let cfg = settings(10);

    run_all_scenarios(&topo, &cfg, dir.path()).unwrap();
    let out_a = dir.path().join("a.csv");
    let out_b = dir.path().join("b.csv");
    consolidate(dir.path(), &out_a).unwrap();
    consolidate(dir.path(), &out_b).unwrap();

    let a = std::fs::read(&out_a).unwrap();
    let b = std::fs::read(&out_b).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_consolidation_requires_all_six_files() {
    let dir = TempDir::new().unwrap();
    let topo = Topology::tokyo_reference();
    let cfg = settings(5);

    run_all_scenarios(&topo, &cfg, dir.path()).unwrap();
    std::fs::remove_file(scenario_file(dir.path(), "blinding")).unwrap();

    let err = consolidate(dir.path(), &dir.path().join("full.csv")).unwrap_err();
    match err {
        ConsolidationError::MissingInput { path } => {
            assert!(path.ends_with("dataset_blinding.csv"));
        }
        other => panic!("expected MissingInput, got {other}"),
    }
    // No partial output is left behind.
    assert!(!dir.path().join("full.csv").exists());
}

#[test]
fn test_consolidation_writes_nothing_on_bad_input() {
    let dir = TempDir::new().unwrap();
    let topo = Topology::tokyo_reference();

    run_all_scenarios(&topo, &settings(5), dir.path()).unwrap();
    // Corrupt one input's header after a complete set of runs.
    std::fs::write(
        scenario_file(dir.path(), "trojan"),
        "link_id,timestamp,qber\nA,1,0.02\n",
    )
    .unwrap();

    let output = dir.path().join("full.csv");
    let err = consolidate(dir.path(), &output).unwrap_err();
    match err {
        ConsolidationError::SchemaMismatch { path, .. } => {
            assert!(path.ends_with("dataset_trojan.csv"));
        }
        other => panic!("expected SchemaMismatch, got {other}"),
    }
    // Not even a truncated output file may exist.
    assert!(!output.exists());
}

#[test]
fn test_failed_scenario_named_in_error() {
    let dir = TempDir::new().unwrap();
    let topo = Topology::tokyo_reference();
    // A duration of zero is rejected before any file is touched.
    let bad = RunSettings {
        duration: SimTime::ZERO,
        ..Default::default()
    };
    assert!(matches!(
        run_all_scenarios(&topo, &bad, dir.path()),
        Err(RunnerError::Settings(_))
    ));
}

// ============================================================================
// Per-Scenario Signatures
// ============================================================================

#[test]
fn test_normal_scenario_raises_no_alerts() {
    let dir = TempDir::new().unwrap();
    let records = run_quiet(dir.path(), "normal", 50);
    assert_eq!(records.len(), 200);
    for r in &records {
        assert_eq!(r.label, 0);
        assert_eq!(r.qber_alert, 0);
        assert_eq!(r.back_reflection_alert, 0);
        // Baseline QBER sits at the floor.
        assert!((r.sample.qber - 0.027).abs() < 0.005);
    }
}

#[test]
fn test_qber_scenario_alert_fires_once_per_link_after_onset() {
    let dir = TempDir::new().unwrap();
    let records = run_quiet(dir.path(), "qber", 100);
    let topo = Topology::tokyo_reference();

    for link in topo.links() {
        let rows = link_rows(&records, &link.id);
        assert_eq!(rows.len(), 100);

        // Exactly one 0 -> 1 transition, and it never clears again.
        let transitions = rows
            .windows(2)
            .filter(|w| w[0].qber_alert == 0 && w[1].qber_alert == 1)
            .count();
        assert_eq!(transitions, 1, "link {}", link.id);
        assert_eq!(rows.first().unwrap().qber_alert, 0);
        assert_eq!(rows.last().unwrap().qber_alert, 1);

        // The ramp is centred on the half-duration onset; the 5% threshold
        // is crossed a couple of ramp widths before centre.
        let first_alert = rows.iter().position(|r| r.qber_alert == 1).unwrap();
        assert!((35..=50).contains(&first_alert), "link {}", link.id);

        // Late QBER reaches the plateau; the secret fraction is gone there.
        let last = rows.last().unwrap();
        assert!((last.sample.qber - 0.25).abs() < 0.01);
        assert_eq!(last.sample.key_rate_final, 0.0);
    }
}

#[test]
fn test_degrade_scenario_key_rate_collapses() {
    let dir = TempDir::new().unwrap();
    let records = run_quiet(dir.path(), "degrade", 100);
    let topo = Topology::tokyo_reference();

    for link in topo.links() {
        let rows = link_rows(&records, &link.id);
        let drops: Vec<f64> = rows.iter().map(|r| r.key_rate_drop).collect();
        assert_eq!(drops[0], 0.0);
        assert!(drops.last().unwrap() > &0.9, "link {}", link.id);
        // Monotone collapse, up to integer-counter rounding.
        assert!(
            drops.windows(2).all(|w| w[1] >= w[0] - 0.02),
            "link {}",
            link.id
        );
        // Gradual drift, never an alert-level QBER excursion.
        for r in &rows {
            assert!(r.sample.qber < 0.05);
        }
    }
}

#[test]
fn test_node_fail_zeroes_only_affected_links_after_onset() {
    let dir = TempDir::new().unwrap();
    let records = run_quiet(dir.path(), "node_fail", 100);
    let topo = Topology::tokyo_reference();
    let affected = topo.links_incident("Hakusan");
    let onset_ps = SimTime::SECOND.as_ps() / 2;

    for link in topo.links() {
        let rows = link_rows(&records, &link.id);
        for r in rows {
            let down = affected.contains(&link.id) && r.sample.timestamp.as_ps() >= onset_ps;
            if down {
                assert_eq!(r.sample.key_rate_sifted, 0.0);
                assert_eq!(r.sample.key_rate_final, 0.0);
                // The optics still click while key distillation is down.
                assert!(r.sample.detection_count > 0);
            } else {
                assert!(r.sample.key_rate_sifted > 0.0, "link {}", link.id);
            }
        }
    }
}

#[test]
fn test_blinding_scenario_floods_dark_counts_without_qber_alert() {
    let dir = TempDir::new().unwrap();
    let records = run_quiet(dir.path(), "blinding", 100);
    let onset_ps = SimTime::SECOND.as_ps() / 2;

    let mut saw_jump = false;
    for r in &records {
        assert_eq!(r.qber_alert, 0, "blinding must stay under the QBER alert");
        if r.sample.timestamp.as_ps() >= onset_ps {
            assert!(r.sample.dark_count_rate >= 5e6);
            assert!((r.sample.detector_efficiency - 1.0).abs() < 1e-12);
        } else {
            assert!((r.sample.dark_count_rate - 100.0).abs() < 1e-9);
        }
        if r.dark_count_delta > 1e6 {
            saw_jump = true;
        }
    }
    assert!(saw_jump, "onset must show a dark-count step in the features");
}

#[test]
fn test_trojan_scenario_trips_back_reflection_alert() {
    let dir = TempDir::new().unwrap();
    let records = run_quiet(dir.path(), "trojan", 100);
    let onset_ps = SimTime::SECOND.as_ps() / 2;

    for r in &records {
        if r.sample.timestamp.as_ps() >= onset_ps {
            assert_eq!(r.back_reflection_alert, 1);
            assert!((r.sample.back_reflection_power - 1e-3).abs() < 1e-4);
            // Probe light adds a fixed phase-error offset.
            assert!((r.sample.phase_error_rate - 0.025).abs() < 1e-9);
        } else {
            assert_eq!(r.back_reflection_alert, 0);
            assert!(r.sample.back_reflection_power < 1e-6);
        }
    }
}

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_same_seed_yields_identical_dataset() {
    let topo = Topology::tokyo_reference();
    let cfg = settings(20);

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let dir = TempDir::new().unwrap();
        run_all_scenarios(&topo, &cfg, dir.path()).unwrap();
        let full = dir.path().join("full.csv");
        consolidate(dir.path(), &full).unwrap();
        outputs.push(std::fs::read(&full).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn test_different_seeds_yield_different_counts() {
    let topo = Topology::tokyo_reference();
    let dir = TempDir::new().unwrap();

    let mut detections = Vec::new();
    for seed in [42, 43] {
        let cfg = RunSettings {
            seed,
            ..settings(10)
        };
        let scenario = FaultScenario::standard("normal", cfg.duration, Vec::new()).unwrap();
        let mut engine = Bb84Engine::new(cfg.seed, 0);
        let output = dir.path().join(format!("seed_{seed}.csv"));
        run_scenario(&topo, &scenario, &cfg, &mut engine, &output).unwrap();
        let samples = dataset::read_telemetry_file(&output).unwrap();
        detections.push(samples.iter().map(|s| s.detection_count).collect::<Vec<_>>());
    }
    assert_ne!(detections[0], detections[1]);
}
