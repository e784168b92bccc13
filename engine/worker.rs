//! # Computation Workers
//!
//! A `ComputationWorker` is the pluggable unit the chunk scheduler drives:
//! it processes exactly the voxels a chunk mask selects, persists the chunk
//! through the chunk store, knows whether a chunk's output already exists,
//! and combines all stored chunks into the final whole-volume result.
//!
//! Two variants are provided. `FittingWorker` produces point estimates
//! through a `PointOptimizer`; `SamplingWorker` runs a Markov chain per
//! voxel, stores posterior means and standard deviations as point outputs,
//! and accumulates full-mask-sized sample traces across chunks. Both
//! parallelize across the voxels *within* one chunk; chunk-to-chunk
//! sequencing belongs to the scheduler.

use crate::addressing::{self, AddressingError};
use crate::chunk_store::{self, CombinedOutput, StoreError};
use crate::config::SamplingConfig;
use crate::fit::model::{ModelError, TerminalModel, VoxelObservations, OBJECTIVE_OUTPUT};
use crate::fit::optimize::PointOptimizer;
use crate::fit::sample::PosteriorSampler;
use crate::types::InputData;
use crate::volume::{RawVolumeWriter, VolumeError, VolumeWriter};
use ahash::AHashMap;
use log::debug;
use ndarray::{Array1, Array2, Array3};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Addressing(#[from] AddressingError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("failed to relocate sample traces to '{path}': {source}")]
    SampleRelocation {
        path: String,
        source: std::io::Error,
    },
}

/// The capability interface between the scheduler and the numerical work.
pub trait ComputationWorker {
    /// Runs the computation over exactly the voxels selected by
    /// `chunk_mask`, persists the results through the chunk store, and
    /// returns them keyed by output name.
    fn process(
        &self,
        model: &TerminalModel,
        input: &InputData,
        chunk_mask: &Array3<bool>,
        store_dir: &Path,
    ) -> Result<AHashMap<String, Array2<f64>>, ProcessError>;

    /// Whether output already exists for every voxel of the chunk.
    fn output_exists(
        &self,
        model: &TerminalModel,
        chunk_mask: &Array3<bool>,
        store_dir: &Path,
    ) -> Result<bool, ProcessError>;

    /// Combines all stored chunks into the final whole-volume result set.
    fn combine(
        &self,
        model: &TerminalModel,
        input: &InputData,
        store_dir: &Path,
        output_dir: &Path,
    ) -> Result<CombinedOutput, ProcessError>;
}

/// Re-derives the ROI view of combined volumes against the full input mask,
/// as opposed to the store's accumulated processed-mask.
fn reextract_with_input_mask(
    mut combined: CombinedOutput,
    input: &InputData,
) -> Result<CombinedOutput, ProcessError> {
    let mut roi = AHashMap::with_capacity(combined.volumes.len());
    for (name, volume) in &combined.volumes {
        roi.insert(
            name.clone(),
            addressing::extract(volume.view().into_dyn(), input.mask())?,
        );
    }
    combined.roi = roi;
    Ok(combined)
}

// ========================================================================================
//                                   Point estimation
// ========================================================================================

pub struct FittingWorker {
    optimizer: Arc<dyn PointOptimizer>,
    writer: Arc<dyn VolumeWriter>,
}

impl FittingWorker {
    pub fn new(optimizer: Arc<dyn PointOptimizer>) -> Self {
        FittingWorker {
            optimizer,
            writer: Arc::new(RawVolumeWriter),
        }
    }

    pub fn with_writer(optimizer: Arc<dyn PointOptimizer>, writer: Arc<dyn VolumeWriter>) -> Self {
        FittingWorker { optimizer, writer }
    }
}

impl ComputationWorker for FittingWorker {
    fn process(
        &self,
        model: &TerminalModel,
        input: &InputData,
        chunk_mask: &Array3<bool>,
        store_dir: &Path,
    ) -> Result<AHashMap<String, Array2<f64>>, ProcessError> {
        let chunk_rows = addressing::roi_rows_within(input.mask(), chunk_mask)?;
        let observations = addressing::extract(input.signals().view().into_dyn(), chunk_mask)?;
        let n_voxels = observations.nrows();
        debug!("fitting '{}' over {} voxels", model.name(), n_voxels);

        let fits: Vec<(Vec<f64>, f64)> = (0..n_voxels)
            .into_par_iter()
            .map(|i| {
                let voxel = VoxelObservations {
                    signal: observations.row(i),
                    acquisition: input.acquisition(),
                };
                let full_row = chunk_rows[i];
                let x0 = model.starting_point(full_row);
                let objective = |x: &Array1<f64>| {
                    model.objective_value(
                        x.as_slice().expect("owned 1-D arrays are contiguous"),
                        full_row,
                        &voxel,
                    )
                };
                let outcome = self.optimizer.minimize(&objective, x0);
                let full = model.full_parameter_vector(
                    outcome
                        .point
                        .as_slice()
                        .expect("owned 1-D arrays are contiguous"),
                    full_row,
                );
                (full, outcome.value)
            })
            .collect();

        let mut results = AHashMap::new();
        let mut offset = 0usize;
        for spec in model.params() {
            let mut values = Array2::zeros((n_voxels, spec.components));
            for (i, (full, _)) in fits.iter().enumerate() {
                for c in 0..spec.components {
                    values[[i, c]] = full[offset + c];
                }
            }
            results.insert(spec.name.clone(), values);
            offset += spec.components;
        }
        let objective_values =
            Array2::from_shape_fn((n_voxels, 1), |(i, _)| fits[i].1);
        results.insert(OBJECTIVE_OUTPUT.to_string(), objective_values);

        chunk_store::write(&results, chunk_mask, store_dir)?;
        Ok(results)
    }

    fn output_exists(
        &self,
        model: &TerminalModel,
        chunk_mask: &Array3<bool>,
        store_dir: &Path,
    ) -> Result<bool, ProcessError> {
        Ok(chunk_store::has_complete_output(
            &model.optimization_output_param_names(),
            chunk_mask,
            store_dir,
        )?)
    }

    fn combine(
        &self,
        model: &TerminalModel,
        input: &InputData,
        store_dir: &Path,
        output_dir: &Path,
    ) -> Result<CombinedOutput, ProcessError> {
        debug!("combining chunk store of '{}'", model.name());
        let combined =
            chunk_store::combine(store_dir, output_dir, input.metadata(), self.writer.as_ref())?;
        reextract_with_input_mask(combined, input)
    }
}

// ========================================================================================
//                                  Markov-chain sampling
// ========================================================================================

pub struct SamplingWorker {
    sampler: Arc<dyn PosteriorSampler>,
    config: SamplingConfig,
    writer: Arc<dyn VolumeWriter>,
}

impl SamplingWorker {
    pub fn new(sampler: Arc<dyn PosteriorSampler>, config: SamplingConfig) -> Self {
        SamplingWorker {
            sampler,
            config,
            writer: Arc::new(RawVolumeWriter),
        }
    }

    /// One trace file per free scalar component: `<param>` for scalars,
    /// `<param>.<component>` for vector parameters.
    fn trace_names(model: &TerminalModel) -> Vec<(String, usize)> {
        let mut names = Vec::new();
        let mut offset = 0usize;
        for spec in model.free_params() {
            if spec.components == 1 {
                names.push((spec.name.clone(), offset));
            } else {
                for c in 0..spec.components {
                    names.push((format!("{}.{c}", spec.name), offset + c));
                }
            }
            offset += spec.components;
        }
        names
    }

    /// Point outputs of a sampling run: every parameter (posterior mean for
    /// free, pinned value for fixed) plus `<param>.std` for free parameters.
    pub fn output_names(model: &TerminalModel) -> Vec<String> {
        let mut names: Vec<String> = model.params().iter().map(|p| p.name.clone()).collect();
        for spec in model.free_params() {
            names.push(format!("{}.std", spec.name));
        }
        names
    }
}

impl ComputationWorker for SamplingWorker {
    fn process(
        &self,
        model: &TerminalModel,
        input: &InputData,
        chunk_mask: &Array3<bool>,
        store_dir: &Path,
    ) -> Result<AHashMap<String, Array2<f64>>, ProcessError> {
        let chunk_rows = addressing::roi_rows_within(input.mask(), chunk_mask)?;
        let observations = addressing::extract(input.signals().view().into_dyn(), chunk_mask)?;
        let n_voxels = observations.nrows();
        let total_rows = addressing::active_voxel_count(input.mask());
        debug!(
            "sampling '{}' over {} voxels ({} retained samples each)",
            model.name(),
            n_voxels,
            self.config.samples
        );

        let chains: Vec<crate::fit::sample::SampleChain> = (0..n_voxels)
            .into_par_iter()
            .map(|i| {
                let voxel = VoxelObservations {
                    signal: observations.row(i),
                    acquisition: input.acquisition(),
                };
                let full_row = chunk_rows[i];
                let x0 = model.starting_point(full_row);
                let log_prob = |x: &Array1<f64>| {
                    -model.objective_value(
                        x.as_slice().expect("owned 1-D arrays are contiguous"),
                        full_row,
                        &voxel,
                    )
                };
                // Seeding by the full-mask row makes the chain independent
                // of the chunk layout.
                let seed = self.config.seed.wrapping_add(full_row as u64);
                self.sampler.sample(&log_prob, x0, &self.config, seed)
            })
            .collect();

        let means: Vec<Array1<f64>> = chains.iter().map(|c| c.mean()).collect();
        let stds: Vec<Array1<f64>> = chains.iter().map(|c| c.std()).collect();

        let mut results = AHashMap::new();
        let mut offset = 0usize;
        let mut free_offset = 0usize;
        for spec in model.params() {
            let mut values = Array2::zeros((n_voxels, spec.components));
            if model.is_fixed(&spec.name) {
                for (i, &full_row) in chunk_rows.iter().enumerate() {
                    let full = model.full_parameter_vector(
                        means[i]
                            .as_slice()
                            .expect("owned 1-D arrays are contiguous"),
                        full_row,
                    );
                    for c in 0..spec.components {
                        values[[i, c]] = full[offset + c];
                    }
                }
            } else {
                let mut std_values = Array2::zeros((n_voxels, spec.components));
                for i in 0..n_voxels {
                    for c in 0..spec.components {
                        values[[i, c]] = means[i][free_offset + c];
                        std_values[[i, c]] = stds[i][free_offset + c];
                    }
                }
                results.insert(format!("{}.std", spec.name), std_values);
                free_offset += spec.components;
            }
            results.insert(spec.name.clone(), values);
            offset += spec.components;
        }

        for (trace_name, component) in Self::trace_names(model) {
            let mut trace = Array2::zeros((n_voxels, self.config.samples));
            for (i, chain) in chains.iter().enumerate() {
                for s in 0..chain.samples.nrows().min(self.config.samples) {
                    trace[[i, s]] = chain.samples[[s, component]];
                }
            }
            chunk_store::write_samples(&trace_name, &chunk_rows, &trace, total_rows, store_dir)?;
        }

        chunk_store::write(&results, chunk_mask, store_dir)?;
        Ok(results)
    }

    fn output_exists(
        &self,
        model: &TerminalModel,
        chunk_mask: &Array3<bool>,
        store_dir: &Path,
    ) -> Result<bool, ProcessError> {
        if !chunk_store::has_complete_output(&Self::output_names(model), chunk_mask, store_dir)? {
            return Ok(false);
        }
        // Point outputs alone are not enough: the traces must be there too.
        let samples = chunk_store::samples_dir(store_dir);
        for (trace_name, _) in Self::trace_names(model) {
            if !samples.join(format!("{trace_name}.vxa")).exists() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn combine(
        &self,
        model: &TerminalModel,
        input: &InputData,
        store_dir: &Path,
        output_dir: &Path,
    ) -> Result<CombinedOutput, ProcessError> {
        debug!("combining sampled chunk store of '{}'", model.name());
        let combined =
            chunk_store::combine(store_dir, output_dir, input.metadata(), self.writer.as_ref())?;

        // Publish the accumulated traces next to the point outputs.
        let source = chunk_store::samples_dir(store_dir);
        if source.is_dir() {
            let target = output_dir.join("samples");
            relocate_dir(&source, &target)?;
        }
        reextract_with_input_mask(combined, input)
    }
}

/// Moves a directory of trace files, falling back to copy-and-remove when a
/// plain rename is not possible (different filesystems).
fn relocate_dir(source: &Path, target: &Path) -> Result<(), ProcessError> {
    let relocation_err = |e: std::io::Error| ProcessError::SampleRelocation {
        path: target.display().to_string(),
        source: e,
    };

    if target.exists() {
        std::fs::remove_dir_all(target).map_err(relocation_err)?;
    }
    if std::fs::rename(source, target).is_ok() {
        return Ok(());
    }
    std::fs::create_dir_all(target).map_err(relocation_err)?;
    for entry in std::fs::read_dir(source).map_err(relocation_err)? {
        let entry = entry.map_err(relocation_err)?;
        let from = entry.path();
        if from.is_file() {
            std::fs::copy(&from, target.join(entry.file_name())).map_err(relocation_err)?;
        }
    }
    std::fs::remove_dir_all(source).map_err(relocation_err)?;
    Ok(())
}
