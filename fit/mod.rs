pub mod batch;
pub mod cascade;
pub mod library;
pub mod model;
pub mod optimize;
pub mod sample;

use crate::chunk_store::StoreError;
use crate::volume::VolumeError;
use crate::worker::ProcessError;
use model::ModelError;
use thiserror::Error;

/// Failures surfaced by the fitting and sampling entry points.
#[derive(Error, Debug)]
pub enum FitError {
    #[error(
        "input data is insufficient for model '{model}': {}",
        .problems.join("; ")
    )]
    InsufficientInput {
        model: String,
        problems: Vec<String>,
    },
    #[error(
        "model '{model}' seeds parameter '{param}' from '{source_model}.{source_output}', but no prior cascade link produced that output"
    )]
    MissingSeedSource {
        model: String,
        param: String,
        source_model: String,
        source_output: String,
    },
    #[error("cascade '{model}' has no links")]
    EmptyCascade { model: String },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error("I/O failure at '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}
