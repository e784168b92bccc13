//! # Voxel Addressing
//!
//! Bidirectional mapping between a dense 3-D boolean mask and the flat,
//! ordered sequence of its active voxel positions (the region of interest,
//! ROI). The canonical ROI order is the row-major flatten order of the mask
//! and is reused for every parameter of a run, so that row `i` of any ROI
//! matrix always refers to the same spatial position.
//!
//! Everything in this module is pure; the persistence layer and the workers
//! build on these functions for scatter/gather between volumes and ROI
//! matrices.

use ndarray::{Array2, Array3, Array4, ArrayD, ArrayView2, ArrayViewD, Ix3, Ix4};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AddressingError {
    #[error("volume has spatial shape {volume:?} but the mask has shape {mask:?}")]
    SpatialShapeMismatch {
        volume: Vec<usize>,
        mask: Vec<usize>,
    },
    #[error("expected a 3-D or 4-D volume, got {ndim} dimensions")]
    UnsupportedDimensionality { ndim: usize },
    #[error("ROI matrix has {rows} rows but the mask holds {active} active voxels")]
    RoiLengthMismatch { rows: usize, active: usize },
}

/// Number of active (true) voxels in the mask.
pub fn active_voxel_count(mask: &Array3<bool>) -> usize {
    mask.iter().filter(|&&v| v).count()
}

/// Deterministic linearization of the active positions: the flat row-major
/// index of every true voxel, in row-major order. This order defines ROI row
/// numbering for the entire run.
pub fn roi_indices(mask: &Array3<bool>) -> Vec<usize> {
    let (_, ny, nz) = mask.dim();
    mask.indexed_iter()
        .filter(|&(_, &active)| active)
        .map(|((x, y, z), _)| (x * ny + y) * nz + z)
        .collect()
}

/// Converts a flat row-major spatial index back to (x, y, z).
pub fn unflatten_index(flat: usize, dim: (usize, usize, usize)) -> (usize, usize, usize) {
    let (_, ny, nz) = dim;
    let z = flat % nz;
    let y = (flat / nz) % ny;
    let x = flat / (ny * nz);
    (x, y, z)
}

/// Maps every active voxel of `subset` to its row number in the ROI order of
/// `full`. Used by workers to address full-mask-sized state (per-voxel
/// initialization vectors, sample trace rows) from within one chunk.
///
/// `subset` must select a subset of `full`'s active voxels.
pub fn roi_rows_within(full: &Array3<bool>, subset: &Array3<bool>) -> Result<Vec<usize>, AddressingError> {
    if full.dim() != subset.dim() {
        return Err(AddressingError::SpatialShapeMismatch {
            volume: subset.shape().to_vec(),
            mask: full.shape().to_vec(),
        });
    }
    let mut rows = Vec::new();
    let mut full_row = 0usize;
    for (&in_full, &in_subset) in full.iter().zip(subset.iter()) {
        if in_full {
            if in_subset {
                rows.push(full_row);
            }
            full_row += 1;
        }
    }
    Ok(rows)
}

/// Gathers the values at active mask positions into a `[n_voxels, k]` ROI
/// matrix, in canonical order. A 3-D source is treated as having a trailing
/// singleton component axis; a 4-D source contributes its fourth axis as the
/// component axis.
pub fn extract(dense: ArrayViewD<'_, f64>, mask: &Array3<bool>) -> Result<Array2<f64>, AddressingError> {
    let dense4: Array4<f64> = match dense.ndim() {
        3 => {
            let v = dense
                .into_dimensionality::<Ix3>()
                .expect("ndim checked above");
            let (nx, ny, nz) = v.dim();
            v.to_owned()
                .into_shape_with_order((nx, ny, nz, 1))
                .expect("adding a trailing singleton axis cannot fail")
        }
        4 => dense
            .into_dimensionality::<Ix4>()
            .expect("ndim checked above")
            .to_owned(),
        ndim => return Err(AddressingError::UnsupportedDimensionality { ndim }),
    };

    let (nx, ny, nz, k) = dense4.dim();
    if (nx, ny, nz) != mask.dim() {
        return Err(AddressingError::SpatialShapeMismatch {
            volume: vec![nx, ny, nz],
            mask: mask.shape().to_vec(),
        });
    }

    let n_active = active_voxel_count(mask);
    let mut roi = Array2::zeros((n_active, k));
    let mut row = 0usize;
    for ((x, y, z), &active) in mask.indexed_iter() {
        if active {
            for c in 0..k {
                roi[[row, c]] = dense4[[x, y, z, c]];
            }
            row += 1;
        }
    }
    Ok(roi)
}

/// Scatters a `[n_voxels, k]` ROI matrix back into a zero-filled dense array
/// of the mask's shape. With `with_component_dim` the result is 4-D
/// `[x, y, z, k]`; without it the result is the 3-D volume of component 0.
pub fn restore(
    roi: ArrayView2<'_, f64>,
    mask: &Array3<bool>,
    with_component_dim: bool,
) -> Result<ArrayD<f64>, AddressingError> {
    let n_active = active_voxel_count(mask);
    if roi.nrows() != n_active {
        return Err(AddressingError::RoiLengthMismatch {
            rows: roi.nrows(),
            active: n_active,
        });
    }
    let (nx, ny, nz) = mask.dim();
    let k = roi.ncols();

    let mut dense = Array4::<f64>::zeros((nx, ny, nz, k.max(1)));
    let mut row = 0usize;
    for ((x, y, z), &active) in mask.indexed_iter() {
        if active {
            for c in 0..k {
                dense[[x, y, z, c]] = roi[[row, c]];
            }
            row += 1;
        }
    }

    if with_component_dim {
        Ok(dense.into_dyn())
    } else {
        Ok(dense.index_axis_move(ndarray::Axis(3), 0).into_dyn())
    }
}

/// Scatters a ROI matrix into a dense `[x, y, z, k]` volume. Convenience
/// wrapper for callers that statically want the 4-D form.
pub fn restore4(roi: ArrayView2<'_, f64>, mask: &Array3<bool>) -> Result<Array4<f64>, AddressingError> {
    Ok(restore(roi, mask, true)?
        .into_dimensionality::<Ix4>()
        .expect("restore with component dim is 4-D"))
}
