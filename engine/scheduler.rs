//! # The Chunk Scheduler
//!
//! Drives one model-processing run: partitions the active mask into
//! bounded-size chunks, walks them in a fixed order with a skip / process /
//! store decision per chunk, and finishes with a single combine.
//!
//! Chunk boundaries derive purely from the immutable mask and the configured
//! policy, never from prior run state, so an interrupted run re-partitions
//! identically and resumes after its last completed chunk. Changing the mask
//! or the policy between runs invalidates resumability; that is a documented
//! precondition, not something the scheduler detects.
//!
//! Chunk iteration is strictly sequential: the store's mask accumulation is
//! single-writer. Parallelism lives inside the worker's `process`.

use crate::addressing;
use crate::chunk_store::{self, CombinedOutput};
use crate::config::ChunkPolicy;
use crate::types::InputData;
use crate::worker::{ComputationWorker, ProcessError};
use ahash::AHashMap;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use ndarray::Array3;
use std::io::IsTerminal;
use std::path::Path;
use std::time::Instant;

use crate::fit::model::TerminalModel;

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());

    pb
}

/// Cuts the mask's ROI order every `max_voxels_per_chunk` active voxels.
/// The resulting chunk masks are disjoint and cover the mask exactly once;
/// a mask smaller than one chunk yields the degenerate single-chunk
/// partition.
pub fn partition(mask: &Array3<bool>, policy: &ChunkPolicy) -> Vec<Array3<bool>> {
    let indices = addressing::roi_indices(mask);
    let dim = mask.dim();
    let per_chunk = policy.max_voxels_per_chunk.max(1);

    indices
        .chunks(per_chunk)
        .map(|chunk_indices| {
            let mut chunk = Array3::from_elem(dim, false);
            for &flat in chunk_indices {
                let (x, y, z) = addressing::unflatten_index(flat, dim);
                chunk[[x, y, z]] = true;
            }
            chunk
        })
        .collect()
}

/// Runs the full chunked skip / process / store / combine loop for one
/// model. With `recalculate` the store directory is cleared first; without
/// it, chunks whose output already exists are skipped, which is what makes
/// an interrupted run resumable.
pub fn process_model<W: ComputationWorker>(
    worker: &W,
    model: &TerminalModel,
    input: &InputData,
    store_dir: &Path,
    output_dir: &Path,
    policy: &ChunkPolicy,
    recalculate: bool,
) -> Result<CombinedOutput, ProcessError> {
    let start = Instant::now();
    let mask = input.mask();
    let chunks = partition(mask, policy);
    let n_active = addressing::active_voxel_count(mask);
    info!(
        "processing model '{}': {} active voxels in {} chunk(s) of at most {}",
        model.name(),
        n_active,
        chunks.len(),
        policy.max_voxels_per_chunk
    );

    if recalculate {
        info!("recomputation requested, clearing '{}'", store_dir.display());
        chunk_store::clear(store_dir)?;
    }

    if chunks.is_empty() {
        // Nothing to compute; still leave a valid (empty) store behind so
        // combine and later existence checks behave uniformly.
        chunk_store::write(&AHashMap::new(), &Array3::from_elem(mask.dim(), false), store_dir)?;
    }

    let pb = create_progress_bar(chunks.len() as u64, model.name());
    let mut processed = 0usize;
    let mut skipped = 0usize;
    for (index, chunk_mask) in chunks.iter().enumerate() {
        if !recalculate && worker.output_exists(model, chunk_mask, store_dir)? {
            debug!(
                "chunk {}/{} of '{}' already stored, skipping",
                index + 1,
                chunks.len(),
                model.name()
            );
            skipped += 1;
        } else {
            worker.process(model, input, chunk_mask, store_dir)?;
            processed += 1;
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    let combined = worker.combine(model, input, store_dir, output_dir)?;
    info!(
        "model '{}' done in {:.1}s ({} chunk(s) processed, {} skipped)",
        model.name(),
        start.elapsed().as_secs_f64(),
        processed,
        skipped
    );
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn mask_with_active(n: usize) -> Array3<bool> {
        let mut mask = Array3::from_elem((10, 10, 1), false);
        let mut placed = 0;
        for x in 0..10 {
            for y in 0..10 {
                if placed < n {
                    mask[[x, y, 0]] = true;
                    placed += 1;
                }
            }
        }
        mask
    }

    #[test]
    fn partition_cuts_every_max_voxels() {
        let mask = mask_with_active(37);
        let chunks = partition(
            &mask,
            &ChunkPolicy {
                max_voxels_per_chunk: 10,
            },
        );
        let sizes: Vec<usize> = chunks
            .iter()
            .map(crate::addressing::active_voxel_count)
            .collect();
        assert_eq!(sizes, vec![10, 10, 10, 7]);
    }

    #[test]
    fn partition_is_disjoint_and_covers_the_mask() {
        let mask = mask_with_active(23);
        let chunks = partition(
            &mask,
            &ChunkPolicy {
                max_voxels_per_chunk: 5,
            },
        );

        let mut union = Array3::from_elem(mask.dim(), false);
        for chunk in &chunks {
            for ((x, y, z), &active) in chunk.indexed_iter() {
                if active {
                    assert!(!union[[x, y, z]], "chunks overlap at ({x},{y},{z})");
                    union[[x, y, z]] = true;
                }
            }
        }
        assert_eq!(union, mask);
    }

    #[test]
    fn single_chunk_partition_is_valid() {
        let mask = mask_with_active(12);
        let chunks = partition(
            &mask,
            &ChunkPolicy {
                max_voxels_per_chunk: 1000,
            },
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], mask);
    }

    #[test]
    fn partition_is_deterministic() {
        let mask = mask_with_active(31);
        let policy = ChunkPolicy {
            max_voxels_per_chunk: 8,
        };
        assert_eq!(partition(&mask, &policy), partition(&mask, &policy));
    }
}
