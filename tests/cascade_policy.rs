//! Recompute-policy semantics of the cascade orchestrator, observed through
//! per-link objective-evaluation counters: a link whose output is reloaded
//! from disk never evaluates its objective.

use ndarray::{Array3, Array4};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

use voxfit::config::{ChunkPolicy, RunConfig, RunContext};
use voxfit::fit::cascade::{ModelRun, RunOptions, SampleRun};
use voxfit::fit::model::{
    CascadeLink, CascadeSpec, InitValue, InitializationData, ModelNode, SeedMode, SeedRule,
    TerminalModel,
};
use voxfit::fit::FitError;
use voxfit::ndio;
use voxfit::types::{Acquisition, InputData, VolumeMetadata};

/// A level-fit model whose objective evaluation count is observable.
fn counted_level_model(name: &str, counter: Arc<AtomicUsize>) -> TerminalModel {
    TerminalModel::builder(name)
        .parameter("level", 0.0)
        .objective(move |params, obs| {
            counter.fetch_add(1, Ordering::Relaxed);
            obs.signal.iter().map(|&s| (s - params[0]).powi(2)).sum()
        })
        .build()
        .unwrap()
}

fn three_link_cascade(
    counters: &[Arc<AtomicUsize>; 3],
) -> ModelNode {
    let a = counted_level_model("LinkA", Arc::clone(&counters[0]));
    let b = counted_level_model("LinkB", Arc::clone(&counters[1]));
    let c = counted_level_model("LinkC", Arc::clone(&counters[2]));
    let seed = |source: &str| {
        vec![SeedRule {
            target_param: "level".to_string(),
            source_model: source.to_string(),
            source_output: "level".to_string(),
            mode: SeedMode::Init,
        }]
    };
    ModelNode::Cascade(CascadeSpec {
        name: "Level (Cascade)".to_string(),
        links: vec![
            CascadeLink {
                node: ModelNode::Terminal(a),
                seeds: vec![],
            },
            CascadeLink {
                node: ModelNode::Terminal(b),
                seeds: seed("LinkA"),
            },
            CascadeLink {
                node: ModelNode::Terminal(c),
                seeds: seed("LinkB"),
            },
        ],
    })
}

fn small_input() -> InputData {
    let mut mask = Array3::from_elem((2, 2, 1), false);
    mask[[0, 0, 0]] = true;
    mask[[0, 1, 0]] = true;
    mask[[1, 0, 0]] = true;
    let mut signals = Array4::zeros((2, 2, 1, 3));
    for ((x, y, z), &active) in mask.indexed_iter() {
        if active {
            let level = 1.0 + (x * 2 + y) as f64;
            for i in 0..3 {
                signals[[x, y, z, i]] = level;
            }
        }
    }
    InputData::new(
        signals,
        mask,
        Acquisition::unstructured(3),
        VolumeMetadata::default(),
    )
    .unwrap()
}

fn ctx_for(output: &Path) -> RunContext {
    let config = RunConfig {
        chunks: ChunkPolicy {
            max_voxels_per_chunk: 2,
        },
        ..RunConfig::default()
    };
    RunContext::for_output(output, &config)
}

fn counts(counters: &[Arc<AtomicUsize>; 3]) -> [usize; 3] {
    [
        counters[0].load(Ordering::Relaxed),
        counters[1].load(Ordering::Relaxed),
        counters[2].load(Ordering::Relaxed),
    ]
}

fn reset(counters: &[Arc<AtomicUsize>; 3]) {
    for c in counters {
        c.store(0, Ordering::Relaxed);
    }
}

fn run(
    node: &ModelNode,
    input: &InputData,
    output: &Path,
    recalculate: bool,
    only_recalculate_last: bool,
) -> Result<(), FitError> {
    let ctx = ctx_for(output);
    ModelRun::new(
        node.clone(),
        input,
        output,
        &ctx,
        RunOptions {
            recalculate,
            only_recalculate_last,
        },
    )
    .run()
    .map(|_| ())
}

#[test]
fn recompute_policy_over_a_three_link_chain() {
    let counters: [Arc<AtomicUsize>; 3] = Default::default();
    let node = three_link_cascade(&counters);
    let input = small_input();
    let out = tempdir().unwrap();

    // First run fits every link.
    run(&node, &input, out.path(), false, false).unwrap();
    let first = counts(&counters);
    assert!(first.iter().all(|&c| c > 0), "first run fits all links: {first:?}");

    // recalculate = false: nothing is refitted.
    reset(&counters);
    run(&node, &input, out.path(), false, false).unwrap();
    assert_eq!(counts(&counters), [0, 0, 0]);

    // recalculate with only_recalculate_last: link 3 only.
    reset(&counters);
    run(&node, &input, out.path(), true, true).unwrap();
    let third = counts(&counters);
    assert_eq!([third[0], third[1]], [0, 0]);
    assert!(third[2] > 0);

    // Full recalculate: all three.
    reset(&counters);
    run(&node, &input, out.path(), true, false).unwrap();
    let all = counts(&counters);
    assert!(all.iter().all(|&c| c > 0), "forced run refits all links: {all:?}");
}

#[test]
fn only_recalculate_last_still_fits_links_with_missing_output() {
    let counters: [Arc<AtomicUsize>; 3] = Default::default();
    let node = three_link_cascade(&counters);
    let input = small_input();
    let out = tempdir().unwrap();

    run(&node, &input, out.path(), false, false).unwrap();

    // Erase link 1's output; under only_recalculate_last it must be refitted
    // because its own output is missing, while link 2 is reloaded.
    std::fs::remove_dir_all(out.path().join("LinkA")).unwrap();
    reset(&counters);
    run(&node, &input, out.path(), true, true).unwrap();
    let c = counts(&counters);
    assert!(c[0] > 0, "missing output must be recomputed: {c:?}");
    assert_eq!(c[1], 0, "intact interior link is reloaded: {c:?}");
    assert!(c[2] > 0, "last link is forced: {c:?}");
}

#[test]
fn cascade_links_seed_from_prior_results() {
    let counters: [Arc<AtomicUsize>; 3] = Default::default();
    let node = three_link_cascade(&counters);
    let input = small_input();
    let out = tempdir().unwrap();

    let combined = {
        let ctx = ctx_for(out.path());
        ModelRun::new(node, &input, out.path(), &ctx, RunOptions::default())
            .run()
            .unwrap()
    };

    // Each link converges to the same per-voxel level; the last link's ROI
    // output carries it.
    let level = &combined.roi["level"];
    assert_eq!(level.nrows(), 3);
    assert!((level[[0, 0]] - 1.0).abs() < 1e-4);
    assert!((level[[1, 0]] - 2.0).abs() < 1e-4);
    assert!((level[[2, 0]] - 3.0).abs() < 1e-4);
}

#[test]
fn user_initialization_reaches_only_the_last_link() {
    let counters: [Arc<AtomicUsize>; 3] = Default::default();
    let node = three_link_cascade(&counters);
    let input = small_input();
    let out = tempdir().unwrap();

    let combined = {
        let ctx = ctx_for(out.path());
        ModelRun::new(node, &input, out.path(), &ctx, RunOptions::default())
            .with_initialization(
                InitializationData::new().fix("level", InitValue::Scalar(7.0)),
            )
            .run()
            .unwrap()
    };

    // The last link was pinned at 7.0 for every voxel...
    let level = &combined.roi["level"];
    for row in 0..level.nrows() {
        assert_eq!(level[[row, 0]], 7.0);
    }

    // ...but the interior links fitted freely.
    let link_b = ndio::read_f64(&out.path().join("LinkB").join("level.vxa")).unwrap();
    assert!((link_b[[0, 0, 0, 0]] - 1.0).abs() < 1e-4);
}

#[test]
fn insufficient_input_is_surfaced_with_diagnostics() {
    let model = TerminalModel::builder("Demanding")
        .parameter("p", 0.0)
        .requires_column("gradient_strength")
        .requires_min_observations(100)
        .objective(|_, _| 0.0)
        .build()
        .unwrap();
    let input = small_input();
    let out = tempdir().unwrap();
    let ctx = ctx_for(out.path());

    let err = ModelRun::new(
        ModelNode::Terminal(model),
        &input,
        out.path(),
        &ctx,
        RunOptions::default(),
    )
    .run()
    .unwrap_err();

    match err {
        FitError::InsufficientInput { model, problems } => {
            assert_eq!(model, "Demanding");
            assert_eq!(problems.len(), 2);
            assert!(problems.iter().any(|p| p.contains("gradient_strength")));
        }
        other => panic!("expected InsufficientInput, got {other:?}"),
    }
}

#[test]
fn sampling_trace_shape_is_chunk_independent() {
    // 10×10×1 volume with 37 active voxels; 10-voxel chunks cut it into
    // {10, 10, 10, 7}.
    let mut mask = Array3::from_elem((10, 10, 1), false);
    for i in 0..37 {
        mask[[i / 10, i % 10, 0]] = true;
    }
    let mut signals = Array4::zeros((10, 10, 1, 3));
    for ((x, y, z), &active) in mask.indexed_iter() {
        if active {
            for i in 0..3 {
                signals[[x, y, z, i]] = 1.0 + 0.1 * (x * 10 + y) as f64;
            }
        }
    }
    let input = InputData::new(
        signals,
        mask,
        Acquisition::unstructured(3),
        VolumeMetadata::default(),
    )
    .unwrap();
    let model = counted_level_model("Sampled", Arc::new(AtomicUsize::new(0)));

    let run_sampling = |max_voxels: usize| {
        let out = tempdir().unwrap();
        let mut config = RunConfig {
            chunks: ChunkPolicy {
                max_voxels_per_chunk: max_voxels,
            },
            ..RunConfig::default()
        };
        config.sampling.samples = 100;
        config.sampling.burnin = 50;
        let ctx = RunContext::for_output(out.path(), &config);
        SampleRun::new(model.clone(), &input, out.path(), &ctx, false)
            .run()
            .unwrap();
        let trace = ndio::read_f64(
            &out.path()
                .join("Sampled")
                .join("samples")
                .join("level.vxa"),
        )
        .unwrap();
        (out, trace)
    };

    let (_keep_a, chunked) = run_sampling(10);
    let (_keep_b, single) = run_sampling(1_000);

    // 37 active voxels × 100 retained samples, whether the run used 4
    // chunks or 1.
    assert_eq!(chunked.shape(), &[37, 100]);
    assert_eq!(single.shape(), &[37, 100]);

    // Per-voxel seeding makes the traces identical across chunk layouts.
    for (a, b) in chunked.iter().zip(single.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn sampling_produces_posterior_spread_maps() {
    let input = small_input();
    let model = counted_level_model("Spread", Arc::new(AtomicUsize::new(0)));
    let out = tempdir().unwrap();

    let mut config = RunConfig::default();
    config.sampling.samples = 200;
    config.sampling.burnin = 100;
    let ctx = RunContext::for_output(out.path(), &config);

    let combined = SampleRun::new(model, &input, out.path(), &ctx, false)
        .run()
        .unwrap();

    let mean = &combined.roi["level"];
    let std = &combined.roi["level.std"];
    assert_eq!(mean.nrows(), 3);
    assert_eq!(std.nrows(), 3);
    // The chain wanders near the exact level with a finite spread.
    assert!((mean[[0, 0]] - 1.0).abs() < 0.5);
    assert!(std[[0, 0]] > 0.0);
}
