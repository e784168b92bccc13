//! The seam to the external volume codec. The engine never commits to a
//! neuroimaging file format; it hands finished dense volumes plus metadata to
//! a `VolumeWriter`, and ships a raw-container implementation so the pipeline
//! is usable (and testable) without an external codec.

use crate::ndio;
use crate::types::VolumeMetadata;
use ndarray::{ArrayD, ArrayViewD};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error(transparent)]
    Ndio(#[from] ndio::NdioError),
    #[error("failed to write volume metadata next to '{path}': {source}")]
    Metadata {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to serialize volume metadata: {0}")]
    MetadataFormat(#[from] toml::ser::Error),
    #[error("failed to create output directory '{path}': {source}")]
    OutputDir {
        path: String,
        source: std::io::Error,
    },
}

/// External collaborator contract: writes one whole-volume output file for a
/// named parameter, using the caller-supplied metadata, and reports the path
/// it wrote to.
pub trait VolumeWriter: Send + Sync {
    fn write_volume(
        &self,
        name: &str,
        volume: ArrayViewD<'_, f64>,
        metadata: &VolumeMetadata,
        output_dir: &Path,
    ) -> Result<PathBuf, VolumeError>;
}

/// Default writer: one ndio container per parameter plus a single shared
/// TOML metadata sidecar per output directory.
#[derive(Debug, Default, Clone)]
pub struct RawVolumeWriter;

impl RawVolumeWriter {
    fn ensure_dir(output_dir: &Path) -> Result<(), VolumeError> {
        std::fs::create_dir_all(output_dir).map_err(|e| VolumeError::OutputDir {
            path: output_dir.display().to_string(),
            source: e,
        })
    }
}

impl VolumeWriter for RawVolumeWriter {
    fn write_volume(
        &self,
        name: &str,
        volume: ArrayViewD<'_, f64>,
        metadata: &VolumeMetadata,
        output_dir: &Path,
    ) -> Result<PathBuf, VolumeError> {
        Self::ensure_dir(output_dir)?;
        let path = volume_path(output_dir, name);
        ndio::write_f64(&path, volume)?;

        let sidecar = output_dir.join("volume_metadata.toml");
        if !sidecar.exists() {
            let text = toml::to_string_pretty(metadata)?;
            std::fs::write(&sidecar, text).map_err(|e| VolumeError::Metadata {
                path: sidecar.display().to_string(),
                source: e,
            })?;
        }
        Ok(path)
    }
}

/// The canonical file location of a named parameter volume.
pub fn volume_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join(format!("{name}.vxa"))
}

/// Reads a parameter volume previously written by `RawVolumeWriter`.
pub fn read_volume(output_dir: &Path, name: &str) -> Result<ArrayD<f64>, VolumeError> {
    Ok(ndio::read_f64(&volume_path(output_dir, name))?)
}
