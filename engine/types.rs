// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is only for types that are shared between modules, not types
// that are used in one module only.

use ndarray::{Array2, Array3, Array4, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputDataError {
    #[error("signal volume has spatial shape {signals:?} but the mask has shape {mask:?}")]
    ShapeMismatch {
        signals: Vec<usize>,
        mask: Vec<usize>,
    },
    #[error(
        "signal volume holds {volumes} observations per voxel but the acquisition table has {rows} rows"
    )]
    ObservationCountMismatch { volumes: usize, rows: usize },
    #[error("acquisition table line {line} has {found} values, expected {expected}")]
    RaggedTable {
        line: usize,
        found: usize,
        expected: usize,
    },
    #[error("acquisition table line {line}: '{token}' is not a number")]
    BadNumber { line: usize, token: String },
    #[error("acquisition table is empty")]
    EmptyTable,
}

/// Per-observation acquisition settings: one named column per setting, one
/// row per acquired volume. The text form is a `#`-prefixed header line with
/// column names followed by whitespace-separated rows, the same shape as the
/// protocol tables of the original acquisition tooling.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    columns: Vec<String>,
    table: Array2<f64>,
}

impl Acquisition {
    pub fn new(columns: Vec<String>, table: Array2<f64>) -> Self {
        debug_assert_eq!(columns.len(), table.ncols());
        Acquisition { columns, table }
    }

    /// An acquisition with zero settings columns, for models that only need
    /// the observation count.
    pub fn unstructured(n_observations: usize) -> Self {
        Acquisition {
            columns: Vec::new(),
            table: Array2::zeros((n_observations, 0)),
        }
    }

    pub fn len(&self) -> usize {
        self.table.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.table.nrows() == 0
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.table.column(idx))
    }

    /// Parses the text table form.
    pub fn from_table_text(text: &str) -> Result<Self, InputDataError> {
        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<f64>> = Vec::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('#') {
                if columns.is_empty() {
                    columns = header.split_whitespace().map(str::to_string).collect();
                }
                continue;
            }
            let mut row = Vec::new();
            for token in line.split_whitespace() {
                let value: f64 = token.parse().map_err(|_| InputDataError::BadNumber {
                    line: line_no + 1,
                    token: token.to_string(),
                })?;
                row.push(value);
            }
            if let Some(first) = rows.first() {
                if row.len() != first.len() {
                    return Err(InputDataError::RaggedTable {
                        line: line_no + 1,
                        found: row.len(),
                        expected: first.len(),
                    });
                }
            }
            rows.push(row);
        }

        if rows.is_empty() {
            return Err(InputDataError::EmptyTable);
        }
        let ncols = rows[0].len();
        if columns.len() != ncols {
            // Header absent or inconsistent: fall back to positional names.
            columns = (0..ncols).map(|i| format!("col{i}")).collect();
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let table = Array2::from_shape_vec((flat.len() / ncols, ncols), flat)
            .expect("row lengths validated above");
        Ok(Acquisition { columns, table })
    }

    /// Renders the text table form, suitable for writing next to run output.
    pub fn to_table_text(&self) -> String {
        let mut out = String::new();
        if !self.columns.is_empty() {
            out.push('#');
            for name in &self.columns {
                let _ = write!(out, " {name}");
            }
            out.push('\n');
        }
        for row in self.table.rows() {
            let mut first = true;
            for v in row.iter() {
                if !first {
                    out.push(' ');
                }
                let _ = write!(out, "{v}");
                first = false;
            }
            out.push('\n');
        }
        out
    }
}

/// Coordinate and provenance information carried through to the final output
/// volumes. The actual volume codec is an external collaborator; this struct
/// is the metadata it is handed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub voxel_size_mm: [f64; 3],
    pub origin_mm: [f64; 3],
    #[serde(default)]
    pub description: String,
}

impl Default for VolumeMetadata {
    fn default() -> Self {
        VolumeMetadata {
            voxel_size_mm: [1.0, 1.0, 1.0],
            origin_mm: [0.0, 0.0, 0.0],
            description: String::new(),
        }
    }
}

/// The full input of one model-processing run: the measured signal volume
/// (`[x, y, z, observation]`), the region-of-interest mask, the acquisition
/// table, and the output volume metadata. The mask is immutable once
/// processing begins; changing it between runs invalidates resumability.
#[derive(Debug, Clone)]
pub struct InputData {
    signals: Array4<f64>,
    mask: Array3<bool>,
    acquisition: Acquisition,
    metadata: VolumeMetadata,
}

impl InputData {
    pub fn new(
        signals: Array4<f64>,
        mask: Array3<bool>,
        acquisition: Acquisition,
        metadata: VolumeMetadata,
    ) -> Result<Self, InputDataError> {
        let (sx, sy, sz, n_obs) = signals.dim();
        if (sx, sy, sz) != mask.dim() {
            return Err(InputDataError::ShapeMismatch {
                signals: vec![sx, sy, sz],
                mask: mask.shape().to_vec(),
            });
        }
        if n_obs != acquisition.len() {
            return Err(InputDataError::ObservationCountMismatch {
                volumes: n_obs,
                rows: acquisition.len(),
            });
        }
        Ok(InputData {
            signals,
            mask,
            acquisition,
            metadata,
        })
    }

    pub fn signals(&self) -> &Array4<f64> {
        &self.signals
    }

    pub fn mask(&self) -> &Array3<bool> {
        &self.mask
    }

    pub fn acquisition(&self) -> &Acquisition {
        &self.acquisition
    }

    pub fn metadata(&self) -> &VolumeMetadata {
        &self.metadata
    }

    pub fn observations_per_voxel(&self) -> usize {
        self.signals.dim().3
    }
}
