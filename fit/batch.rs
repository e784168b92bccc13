//! Batch fitting: run a set of models over a set of subjects, skipping
//! subjects whose output already exists and carrying on past models whose
//! input data is insufficient. A model that cannot be fitted for one
//! subject (too few observations, missing acquisition column) is logged and
//! skipped; any other failure aborts the batch.

use crate::config::{RunConfig, RunContext};
use crate::fit::cascade::{model_output_exists, ModelRun, RunOptions};
use crate::fit::model::ModelNode;
use crate::fit::FitError;
use crate::types::InputData;
use log::info;
use std::path::Path;
use std::time::Instant;

/// One subject's identifier and loaded input data.
pub struct SubjectData {
    pub id: String,
    pub input: InputData,
}

/// What happened across the batch.
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Model runs that completed (freshly fitted or reloaded).
    pub fitted: usize,
    /// Subjects skipped entirely because every model's output existed.
    pub subjects_skipped: usize,
    /// `(subject, model)` pairs skipped for insufficient input data.
    pub insufficient: Vec<(String, String)>,
}

pub fn run_batch(
    subjects: &[SubjectData],
    models: &[ModelNode],
    output_root: &Path,
    config: &RunConfig,
    options: RunOptions,
) -> Result<BatchSummary, FitError> {
    let total = subjects.len();
    let mut summary = BatchSummary::default();

    for (index, subject) in subjects.iter().enumerate() {
        info!(
            "going to process subject {} ({} of {}, {:.0}% done)",
            subject.id,
            index + 1,
            total,
            100.0 * index as f64 / total.max(1) as f64
        );
        let subject_output = output_root.join(&subject.id);

        if !options.recalculate
            && models
                .iter()
                .all(|model| model_output_exists(model, &subject_output))
        {
            info!("skipping subject {}, output exists", subject.id);
            summary.subjects_skipped += 1;
            continue;
        }

        let ctx = RunContext::for_output(&subject_output, config);
        let start = Instant::now();
        for model in models {
            info!("going to fit model '{}' on subject {}", model.name(), subject.id);
            let run = ModelRun::new(model.clone(), &subject.input, &subject_output, &ctx, options);
            match run.run() {
                Ok(_) => {
                    summary.fitted += 1;
                    info!(
                        "done fitting model '{}' on subject {}",
                        model.name(),
                        subject.id
                    );
                }
                Err(FitError::InsufficientInput { model: name, problems }) => {
                    info!(
                        "could not fit model '{name}' on subject {}: {}",
                        subject.id,
                        problems.join("; ")
                    );
                    summary
                        .insufficient
                        .push((subject.id.clone(), name));
                }
                Err(other) => return Err(other),
            }
        }
        info!(
            "fitted all models on subject {} in {:.1}s",
            subject.id,
            start.elapsed().as_secs_f64()
        );
    }
    Ok(summary)
}
