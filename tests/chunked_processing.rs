//! End-to-end properties of the chunked processing engine: chunked runs
//! match single-chunk runs bit for bit, finished runs are never recomputed,
//! and interrupted runs resume where they stopped.

use ahash::AHashMap;
use ndarray::{Array2, Array3, Array4};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::tempdir;

use voxfit::chunk_store::{CombinedOutput, StoreError};
use voxfit::config::{ChunkPolicy, RunConfig, RunContext};
use voxfit::fit::cascade::{ModelRun, RunOptions};
use voxfit::fit::library;
use voxfit::fit::model::{ModelNode, TerminalModel};
use voxfit::fit::optimize::BfgsOptimizer;
use voxfit::scheduler;
use voxfit::types::{Acquisition, InputData, VolumeMetadata};
use voxfit::worker::{ComputationWorker, FittingWorker, ProcessError};
use voxfit::{addressing, ndio};

const B_VALUES: [f64; 5] = [0.0, 250.0, 500.0, 750.0, 1000.0];

/// 10×10×1 volume with the first 37 positions (row-major) active.
fn mask_37() -> Array3<bool> {
    let mut mask = Array3::from_elem((10, 10, 1), false);
    for i in 0..37 {
        mask[[i / 10, i % 10, 0]] = true;
    }
    mask
}

/// Noiseless mono-exponential signals with per-voxel ground truth.
fn exp_decay_input(mask: Array3<bool>) -> InputData {
    let (nx, ny, nz) = mask.dim();
    let mut signals = Array4::zeros((nx, ny, nz, B_VALUES.len()));
    for ((x, y, z), &active) in mask.indexed_iter() {
        if active {
            let s0 = 1.5 + 0.01 * (x * 10 + y) as f64;
            let d = 1e-3 + 1e-5 * (y + 1) as f64;
            for (i, &b) in B_VALUES.iter().enumerate() {
                signals[[x, y, z, i]] = s0 * (-b * d).exp();
            }
        }
    }
    let acquisition = Acquisition::new(
        vec!["b".to_string()],
        Array2::from_shape_vec((B_VALUES.len(), 1), B_VALUES.to_vec()).unwrap(),
    );
    InputData::new(signals, mask, acquisition, VolumeMetadata::default()).unwrap()
}

fn run_config(max_voxels: usize) -> RunConfig {
    RunConfig {
        chunks: ChunkPolicy {
            max_voxels_per_chunk: max_voxels,
        },
        ..RunConfig::default()
    }
}

fn fit(input: &InputData, output: &Path, max_voxels: usize) -> CombinedOutput {
    let config = run_config(max_voxels);
    let ctx = RunContext::for_output(output, &config);
    let node = ModelNode::Terminal(library::exp_decay().unwrap());
    ModelRun::new(node, input, output, &ctx, RunOptions::default())
        .run()
        .unwrap()
}

#[test]
fn chunked_run_matches_single_chunk_run_bit_for_bit() {
    let input = exp_decay_input(mask_37());
    let chunked_dir = tempdir().unwrap();
    let single_dir = tempdir().unwrap();

    let chunked = fit(&input, chunked_dir.path(), 10);
    let single = fit(&input, single_dir.path(), 1_000);

    assert_eq!(chunked.roi.len(), single.roi.len());
    for (name, roi) in &chunked.roi {
        let other = &single.roi[name];
        assert_eq!(roi.dim(), other.dim(), "shape of '{name}'");
        for (a, b) in roi.iter().zip(other.iter()) {
            assert_eq!(a.to_bits(), b.to_bits(), "'{name}' differs between runs");
        }
    }
}

#[test]
fn combined_output_covers_exactly_the_active_voxels() {
    let input = exp_decay_input(mask_37());
    let out = tempdir().unwrap();
    let combined = fit(&input, out.path(), 10);

    // 37 active voxels, ROI length 37 for every map.
    for (name, roi) in &combined.roi {
        assert_eq!(roi.nrows(), 37, "ROI length of '{name}'");
    }
    assert_eq!(combined.used_mask, *input.mask());

    // The dense volume is populated exactly at mask positions: S0 >= 1.5 on
    // the mask, and bit-zero off it.
    let s0 = &combined.volumes["S0"];
    let mut populated = 0;
    for ((x, y, z), &active) in input.mask().indexed_iter() {
        if active {
            assert!(s0[[x, y, z, 0]] > 0.0);
            populated += 1;
        } else {
            assert_eq!(s0[[x, y, z, 0]], 0.0);
        }
    }
    assert_eq!(populated, 37);

    // Accuracy sanity: recovered parameters sit at the noiseless truth.
    let roi_d = &combined.roi["D"];
    let expected_first_d = 1e-3 + 1e-5; // voxel (0, 0, 0)
    assert!((roi_d[[0, 0]] - expected_first_d).abs() < 1e-5);
}

#[test]
fn rerunning_a_finished_fit_is_byte_identical_and_recomputes_nothing() {
    let input = exp_decay_input(mask_37());
    let out = tempdir().unwrap();
    let first = fit(&input, out.path(), 10);

    let files: Vec<_> = std::fs::read_dir(out.path().join("ExpDecay"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .collect();
    assert!(!files.is_empty());
    let before: Vec<Vec<u8>> = files.iter().map(|p| std::fs::read(p).unwrap()).collect();

    let second = fit(&input, out.path(), 10);
    let after: Vec<Vec<u8>> = files.iter().map(|p| std::fs::read(p).unwrap()).collect();
    assert_eq!(before, after);

    for (name, roi) in &first.roi {
        assert_eq!(roi, &second.roi[name]);
    }
}

/// Delegating worker that counts `process` calls and can be told to fail
/// after a number of chunks, standing in for a killed run.
struct FlakyWorker {
    inner: FittingWorker,
    processed: AtomicUsize,
    fail_after: Option<usize>,
}

impl FlakyWorker {
    fn new(fail_after: Option<usize>) -> Self {
        FlakyWorker {
            inner: FittingWorker::new(std::sync::Arc::new(BfgsOptimizer::default())),
            processed: AtomicUsize::new(0),
            fail_after,
        }
    }
}

impl ComputationWorker for FlakyWorker {
    fn process(
        &self,
        model: &TerminalModel,
        input: &InputData,
        chunk_mask: &Array3<bool>,
        store_dir: &Path,
    ) -> Result<AHashMap<String, Array2<f64>>, ProcessError> {
        let done = self.processed.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if done >= limit {
                return Err(ProcessError::Store(StoreError::ChunkLengthMismatch {
                    param: "simulated crash".to_string(),
                    rows: 0,
                    expected: 0,
                }));
            }
        }
        self.inner.process(model, input, chunk_mask, store_dir)
    }

    fn output_exists(
        &self,
        model: &TerminalModel,
        chunk_mask: &Array3<bool>,
        store_dir: &Path,
    ) -> Result<bool, ProcessError> {
        self.inner.output_exists(model, chunk_mask, store_dir)
    }

    fn combine(
        &self,
        model: &TerminalModel,
        input: &InputData,
        store_dir: &Path,
        output_dir: &Path,
    ) -> Result<CombinedOutput, ProcessError> {
        self.inner.combine(model, input, store_dir, output_dir)
    }
}

#[test]
fn second_scheduler_pass_skips_every_stored_chunk() {
    let input = exp_decay_input(mask_37());
    let model = library::exp_decay().unwrap();
    let dirs = tempdir().unwrap();
    let store = dirs.path().join("store");
    let out = dirs.path().join("out");
    let policy = ChunkPolicy {
        max_voxels_per_chunk: 10,
    };

    let worker = FlakyWorker::new(None);
    scheduler::process_model(&worker, &model, &input, &store, &out, &policy, false).unwrap();
    assert_eq!(worker.processed.load(Ordering::SeqCst), 4);

    let again = FlakyWorker::new(None);
    scheduler::process_model(&again, &model, &input, &store, &out, &policy, false).unwrap();
    assert_eq!(again.processed.load(Ordering::SeqCst), 0);
}

#[test]
fn interrupted_run_resumes_with_only_the_missing_chunks() {
    let input = exp_decay_input(mask_37());
    let model = library::exp_decay().unwrap();
    let dirs = tempdir().unwrap();
    let store = dirs.path().join("store");
    let out = dirs.path().join("out");
    let policy = ChunkPolicy {
        max_voxels_per_chunk: 10,
    };

    // Dies after 2 of the 4 chunks.
    let crashing = FlakyWorker::new(Some(2));
    let err =
        scheduler::process_model(&crashing, &model, &input, &store, &out, &policy, false);
    assert!(err.is_err());
    assert_eq!(crashing.processed.load(Ordering::SeqCst), 3); // 2 stored + 1 failed

    // The restart only runs the chunks the crash left behind.
    let resumed = FlakyWorker::new(None);
    let combined =
        scheduler::process_model(&resumed, &model, &input, &store, &out, &policy, false).unwrap();
    assert_eq!(resumed.processed.load(Ordering::SeqCst), 2);

    // And the final result matches an uninterrupted run, bit for bit.
    let clean_dirs = tempdir().unwrap();
    let clean = FlakyWorker::new(None);
    let reference = scheduler::process_model(
        &clean,
        &model,
        &input,
        &clean_dirs.path().join("store"),
        &clean_dirs.path().join("out"),
        &policy,
        false,
    )
    .unwrap();
    for (name, roi) in &reference.roi {
        let resumed_roi = &combined.roi[name];
        for (a, b) in roi.iter().zip(resumed_roi.iter()) {
            assert_eq!(a.to_bits(), b.to_bits(), "'{name}' differs after resume");
        }
    }
}

#[test]
fn forced_recompute_clears_prior_state_first() {
    let input = exp_decay_input(mask_37());
    let model = library::exp_decay().unwrap();
    let dirs = tempdir().unwrap();
    let store = dirs.path().join("store");
    let out = dirs.path().join("out");
    let policy = ChunkPolicy {
        max_voxels_per_chunk: 10,
    };

    let first = FlakyWorker::new(None);
    scheduler::process_model(&first, &model, &input, &store, &out, &policy, false).unwrap();

    let forced = FlakyWorker::new(None);
    scheduler::process_model(&forced, &model, &input, &store, &out, &policy, true).unwrap();
    assert_eq!(forced.processed.load(Ordering::SeqCst), 4);
}

#[test]
fn stale_mask_with_missing_parameter_file_forces_recompute() {
    let input = exp_decay_input(mask_37());
    let model = library::exp_decay().unwrap();
    let dirs = tempdir().unwrap();
    let store = dirs.path().join("store");
    let out = dirs.path().join("out");
    let policy = ChunkPolicy {
        max_voxels_per_chunk: 1_000,
    };

    let first = FlakyWorker::new(None);
    scheduler::process_model(&first, &model, &input, &store, &out, &policy, false).unwrap();

    // Corrupt the store: drop one declared output but keep the mask.
    std::fs::remove_file(store.join("D.vxa")).unwrap();

    let repair = FlakyWorker::new(None);
    scheduler::process_model(&repair, &model, &input, &store, &out, &policy, false).unwrap();
    assert_eq!(repair.processed.load(Ordering::SeqCst), 1);
}

#[test]
fn extract_restore_round_trip_through_files() {
    // The addressing identity holds through a write/read cycle of the codec.
    let mask = mask_37();
    let dense = Array4::from_shape_fn((10, 10, 1, 2), |(x, y, _, c)| {
        (x * 100 + y * 2 + c) as f64 + 0.5
    });
    let roi = addressing::extract(dense.view().into_dyn(), &mask).unwrap();
    let restored = addressing::restore4(roi.view(), &mask).unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("roundtrip.vxa");
    ndio::write_f64(&path, restored.view().into_dyn()).unwrap();
    let back = ndio::read_f64(&path).unwrap();

    for ((x, y, z), &active) in mask.indexed_iter() {
        for c in 0..2 {
            let expected = if active { dense[[x, y, z, c]] } else { 0.0 };
            assert_eq!(back[[x, y, z, c]].to_bits(), expected.to_bits());
        }
    }
}
