//! # The Chunk Store
//!
//! Durable, resumable storage for partial per-voxel results. Every output
//! parameter accumulates into one dense memory-mapped file sized to the full
//! volume (plus a trailing component axis); a single processed-mask file of
//! the same spatial shape records which voxels have been computed and
//! stored.
//!
//! The crash-consistency protocol is ordering, not journaling: a chunk's
//! data files are flushed before its processed-mask bits are set, so a
//! process killed mid-write leaves those voxels unflagged and a restart
//! recomputes exactly them. Files grow monotonically and are never truncated
//! by a write; already-flagged voxels are only recomputed when the caller
//! clears the store first.

use crate::addressing;
use crate::ndio::{self, ArrayFileMut, DType};
use crate::types::VolumeMetadata;
use crate::volume::{VolumeError, VolumeWriter};
use ahash::AHashMap;
use log::{debug, warn};
use ndarray::{Array2, Array3, Array4, Ix3, Ix4};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the accumulated processed-mask. The double underscore keeps
/// it sorted apart from parameter files and excluded from combination.
const PROCESSED_MASK_FILE: &str = "__processed_mask.vxa";
const ARRAY_EXT: &str = "vxa";
const SAMPLES_DIR: &str = "samples";
/// Name under which the accumulated processed-mask is published to the final
/// output directory. Its presence marks a completed combine.
pub const USED_MASK_NAME: &str = "used_mask";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Ndio(#[from] ndio::NdioError),
    #[error(transparent)]
    Addressing(#[from] addressing::AddressingError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("chunk store I/O failure at '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("result '{param}' carries {rows} voxel rows but the chunk selects {expected} voxels")]
    ChunkLengthMismatch {
        param: String,
        rows: usize,
        expected: usize,
    },
    #[error("sample trace rows exceed the trace file size ({row} >= {total_rows})")]
    TraceRowOutOfRange { row: usize, total_rows: usize },
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn param_path(store_dir: &Path, name: &str) -> PathBuf {
    store_dir.join(format!("{name}.{ARRAY_EXT}"))
}

fn mask_path(store_dir: &Path) -> PathBuf {
    store_dir.join(PROCESSED_MASK_FILE)
}

/// Location of the per-parameter sample trace files.
pub fn samples_dir(store_dir: &Path) -> PathBuf {
    store_dir.join(SAMPLES_DIR)
}

/// The reassembled whole-volume result set of one model run.
#[derive(Debug)]
pub struct CombinedOutput {
    /// Per parameter, the `[n_voxels, k]` ROI view derived from the
    /// accumulated processed-mask.
    pub roi: AHashMap<String, Array2<f64>>,
    /// Per parameter, the dense `[x, y, z, k]` volume.
    pub volumes: AHashMap<String, Array4<f64>>,
    /// The accumulated processed-mask at combination time.
    pub used_mask: Array3<bool>,
}

/// Scatters one chunk's results into the per-parameter accumulation files,
/// then flags the chunk's voxels in the processed-mask. Creates the store
/// directory and any missing accumulation files on first use.
pub fn write(
    results: &AHashMap<String, Array2<f64>>,
    chunk_mask: &Array3<bool>,
    store_dir: &Path,
) -> Result<(), StoreError> {
    std::fs::create_dir_all(store_dir).map_err(|e| io_err(store_dir, e))?;

    let chunk_indices = addressing::roi_indices(chunk_mask);
    let (nx, ny, nz) = chunk_mask.dim();

    // Parameter order on disk must not depend on map iteration order.
    let mut names: Vec<&String> = results.keys().collect();
    names.sort();

    for name in &names {
        let values = &results[*name];
        if values.nrows() != chunk_indices.len() {
            return Err(StoreError::ChunkLengthMismatch {
                param: (*name).clone(),
                rows: values.nrows(),
                expected: chunk_indices.len(),
            });
        }
        let k = values.ncols().max(1);
        let path = param_path(store_dir, name);
        let mut file = ArrayFileMut::create_or_open(&path, DType::F64, &[nx, ny, nz, k])?;
        for (row, &flat) in chunk_indices.iter().enumerate() {
            for c in 0..values.ncols() {
                file.put_f64(flat * k + c, values[[row, c]]);
            }
        }
        // Data reaches disk before any processed-mask bit for these voxels.
        file.flush()?;
        debug!(
            "stored {} voxels of '{}' into {}",
            chunk_indices.len(),
            name,
            path.display()
        );
    }

    let mut mask_file = ArrayFileMut::create_or_open(&mask_path(store_dir), DType::U8, &[nx, ny, nz])?;
    for &flat in &chunk_indices {
        mask_file.put_u8(flat, 1);
    }
    mask_file.flush()?;
    Ok(())
}

/// True iff the processed-mask covers every voxel of `chunk_mask` and an
/// accumulation file exists for every declared output name. A satisfied mask
/// with a missing parameter file is a partial or corrupted prior run; it is
/// reported (at warn) and treated as "output does not exist" so the chunk is
/// recomputed rather than failing or returning wrong data.
pub fn has_complete_output(
    output_names: &[String],
    chunk_mask: &Array3<bool>,
    store_dir: &Path,
) -> Result<bool, StoreError> {
    let mask_file = mask_path(store_dir);
    if !mask_file.exists() {
        return Ok(false);
    }

    let stored = ndio::read_u8(&mask_file)?;
    if stored.shape() != chunk_mask.shape() {
        warn!(
            "processed-mask shape {:?} does not match the run mask {:?}; treating store '{}' as empty",
            stored.shape(),
            chunk_mask.shape(),
            store_dir.display()
        );
        return Ok(false);
    }
    let stored = stored
        .into_dimensionality::<Ix3>()
        .expect("shape equality checked above");

    for ((x, y, z), &active) in chunk_mask.indexed_iter() {
        if active && stored[[x, y, z]] == 0 {
            return Ok(false);
        }
    }

    for name in output_names {
        let path = param_path(store_dir, name);
        if !path.exists() {
            warn!(
                "processed-mask claims completed voxels but '{}' is missing; forcing recomputation",
                path.display()
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Materializes the final whole-volume result set: writes every accumulated
/// parameter through the volume-writer collaborator, publishes the
/// accumulated processed-mask, and returns the ROI-addressable view of all
/// combined parameters.
pub fn combine(
    store_dir: &Path,
    output_dir: &Path,
    metadata: &VolumeMetadata,
    writer: &dyn VolumeWriter,
) -> Result<CombinedOutput, StoreError> {
    std::fs::create_dir_all(output_dir).map_err(|e| io_err(output_dir, e))?;

    let stored = ndio::read_u8(&mask_path(store_dir))?;
    let used_mask = stored
        .mapv(|v| v != 0)
        .into_dimensionality::<Ix3>()
        .map_err(|e| VolumeError::Ndio(ndio::NdioError::BadHeader {
            path: mask_path(store_dir).display().to_string(),
            reason: e.to_string(),
        }))?;

    let mut entries: Vec<PathBuf> = std::fs::read_dir(store_dir)
        .map_err(|e| io_err(store_dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == ARRAY_EXT)
                && path.file_name().is_some_and(|n| n != PROCESSED_MASK_FILE)
        })
        .collect();
    entries.sort();

    let mut roi = AHashMap::new();
    let mut volumes = AHashMap::new();
    for path in entries {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let dense = ndio::read_f64(&path)?;
        let dense = dense.into_dimensionality::<Ix4>().map_err(|e| {
            VolumeError::Ndio(ndio::NdioError::BadHeader {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;

        writer.write_volume(&name, dense.view().into_dyn(), metadata, output_dir)?;
        roi.insert(name.clone(), addressing::extract(dense.view().into_dyn(), &used_mask)?);
        volumes.insert(name, dense);
    }

    // The published mask doubles as the completion marker of the run.
    let mask_out = output_dir.join(format!("{USED_MASK_NAME}.{ARRAY_EXT}"));
    ndio::write_u8(&mask_out, used_mask.mapv(|v| v as u8).view().into_dyn())?;

    debug!(
        "combined {} parameters from {} into {}",
        roi.len(),
        store_dir.display(),
        output_dir.display()
    );
    Ok(CombinedOutput {
        roi,
        volumes,
        used_mask,
    })
}

/// Removes all accumulated state for a run. This is the RecomputeRequested
/// control path, not an error path.
pub fn clear(store_dir: &Path) -> Result<(), StoreError> {
    match std::fs::remove_dir_all(store_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(store_dir, e)),
    }
}

/// Scatters one chunk's retained sample rows into the full-mask-sized trace
/// file of a parameter. The trace file is sized `[total_rows, n_samples]`
/// once and shared by every chunk of the run, so the final trace is
/// identical whether the run used one chunk or many.
pub fn write_samples(
    name: &str,
    rows: &[usize],
    trace: &Array2<f64>,
    total_rows: usize,
    store_dir: &Path,
) -> Result<(), StoreError> {
    let dir = samples_dir(store_dir);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let n_samples = trace.ncols();
    let path = param_path(&dir, name);
    let mut file = ArrayFileMut::create_or_open(&path, DType::F64, &[total_rows, n_samples])?;
    for (i, &row) in rows.iter().enumerate() {
        if row >= total_rows {
            return Err(StoreError::TraceRowOutOfRange { row, total_rows });
        }
        for s in 0..n_samples {
            file.put_f64(row * n_samples + s, trace[[i, s]]);
        }
    }
    file.flush()?;
    Ok(())
}
