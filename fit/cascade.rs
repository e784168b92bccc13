//! # The Cascade Orchestrator
//!
//! `ModelRun` is the user-facing fitting entry point over a model chain
//! node. A terminal node goes straight to the chunk scheduler; a cascade is
//! walked link by link, each link seeded from any prior link's per-voxel
//! point estimates, under the recompute policy:
//!
//! - `recalculate = false`: never recompute a link whose output fully
//!   exists;
//! - `recalculate = true, only_recalculate_last = true`: only the last link
//!   of the outermost chain is forced; everything else recomputes only if
//!   its own output is missing;
//! - `recalculate = true, only_recalculate_last = false`: every link at
//!   every level is forced.
//!
//! "Last" means last in iteration order over the explicit link list.
//! Caller-supplied initialization data applies to the user-facing model
//! only: a bare terminal node, or the last link of the outermost chain —
//! never to interior cascade steps.
//!
//! `SampleRun` is the sampling counterpart over a single terminal model.

use crate::chunk_store::{self, CombinedOutput, USED_MASK_NAME};
use crate::config::RunContext;
use crate::fit::model::{
    InitValue, InitializationData, ModelNode, SeedMode, SeedRule, TerminalModel,
};
use crate::fit::optimize::{BfgsOptimizer, PointOptimizer};
use crate::fit::sample::{MetropolisSampler, PosteriorSampler};
use crate::fit::FitError;
use crate::scheduler;
use crate::types::InputData;
use crate::volume;
use crate::worker::{FittingWorker, SamplingWorker};
use crate::{addressing, ndio};
use ahash::AHashMap;
use log::{info, warn};
use ndarray::{Array2, Ix3, Ix4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Recompute policy of one fitting run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub recalculate: bool,
    /// Only meaningful together with `recalculate`; applies to the first
    /// (outermost) cascade level.
    pub only_recalculate_last: bool,
}

/// The per-voxel point estimates of the links already fitted at the current
/// cascade level, in fitting order.
type PriorResults = Vec<(String, AHashMap<String, Array2<f64>>)>;

/// One fitting run over a model chain node.
pub struct ModelRun<'a> {
    node: ModelNode,
    input: &'a InputData,
    output_root: PathBuf,
    ctx: &'a RunContext,
    options: RunOptions,
    initialization: Option<InitializationData>,
    optimizer: Arc<dyn PointOptimizer>,
}

impl<'a> ModelRun<'a> {
    pub fn new(
        node: ModelNode,
        input: &'a InputData,
        output_root: &Path,
        ctx: &'a RunContext,
        options: RunOptions,
    ) -> Self {
        ModelRun {
            node,
            input,
            output_root: output_root.to_path_buf(),
            ctx,
            options,
            initialization: None,
            optimizer: Arc::new(BfgsOptimizer::default()),
        }
    }

    /// Extra initialization applied to the user-facing model before
    /// processing. Inside a cascade this reaches the last link only.
    pub fn with_initialization(mut self, initialization: InitializationData) -> Self {
        self.initialization = Some(initialization);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Arc<dyn PointOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Runs the chain and returns the final (last link's) whole-volume
    /// result set.
    pub fn run(self) -> Result<CombinedOutput, FitError> {
        let ModelRun {
            node,
            input,
            output_root,
            ctx,
            options,
            initialization,
            optimizer,
        } = self;
        let mut runner = Runner {
            input,
            output_root,
            ctx,
            initialization,
            optimizer,
            name_trail: Vec::new(),
        };
        runner.run_node(node, options.recalculate, options.only_recalculate_last, true)
    }
}

struct Runner<'a> {
    input: &'a InputData,
    output_root: PathBuf,
    ctx: &'a RunContext,
    initialization: Option<InitializationData>,
    optimizer: Arc<dyn PointOptimizer>,
    name_trail: Vec<String>,
}

impl Runner<'_> {
    fn run_node(
        &mut self,
        node: ModelNode,
        recalculate: bool,
        only_recalculate_last: bool,
        user_facing: bool,
    ) -> Result<CombinedOutput, FitError> {
        self.name_trail.push(node.name().to_string());
        let result = match node {
            ModelNode::Cascade(spec) => {
                let n_links = spec.links.len();
                if n_links == 0 {
                    self.name_trail.pop();
                    return Err(FitError::EmptyCascade { model: spec.name });
                }
                info!("running cascade '{}' with {} link(s)", spec.name, n_links);

                let mut prior: PriorResults = Vec::new();
                let mut last = None;
                for (index, link) in spec.links.into_iter().enumerate() {
                    let is_last = index + 1 == n_links;
                    let sub_recalculate =
                        recalculate && (!only_recalculate_last || is_last);

                    let mut sub_node = link.node;
                    let link_name = sub_node.name().to_string();
                    match &mut sub_node {
                        ModelNode::Terminal(model) => {
                            apply_seeds(model, &link.seeds, &prior)?;
                        }
                        ModelNode::Cascade(_) => {
                            if !link.seeds.is_empty() {
                                warn!(
                                    "seed rules on nested cascade link '{link_name}' are ignored"
                                );
                            }
                        }
                    }

                    // Nested chains are never "the outermost level": their
                    // links recompute only when forced as a whole.
                    let sub_result =
                        self.run_node(sub_node, sub_recalculate, false, user_facing && is_last)?;
                    prior.push((link_name, sub_result.roi.clone()));
                    last = Some(sub_result);
                }
                let last = last.expect("non-empty cascade produced a result");
                Ok(last)
            }
            ModelNode::Terminal(model) => self.run_terminal(model, recalculate, user_facing),
        };
        self.name_trail.pop();
        result
    }

    fn run_terminal(
        &mut self,
        mut model: TerminalModel,
        recalculate: bool,
        user_facing: bool,
    ) -> Result<CombinedOutput, FitError> {
        if !model.is_input_data_sufficient(self.input) {
            let problems = model
                .get_input_data_problems(self.input)
                .iter()
                .map(|p| p.to_string())
                .collect();
            return Err(FitError::InsufficientInput {
                model: model.name().to_string(),
                problems,
            });
        }

        if user_facing {
            if let Some(initialization) = &self.initialization {
                if !initialization.is_empty() {
                    info!(
                        "preparing model '{}' with the user provided initialization data",
                        model.name()
                    );
                    initialization.apply_to(&mut model)?;
                }
            }
        }

        let output_dir = self.output_root.join(model.name());
        let output_names = model.optimization_output_param_names();

        if !recalculate {
            if let Some(existing) = try_load_output(&output_dir, &output_names, self.input) {
                info!("not recalculating '{}' model, output exists", model.name());
                return Ok(existing);
            }
        }

        info!(
            "fitting '{}' (cascade trail: {:?})",
            model.name(),
            self.name_trail
        );
        let store_dir = self.ctx.store_dir(model.name());
        let policy = self.ctx.policy_for(&self.name_trail);
        let worker = FittingWorker::new(Arc::clone(&self.optimizer));
        let combined = scheduler::process_model(
            &worker,
            &model,
            self.input,
            &store_dir,
            &output_dir,
            &policy,
            recalculate,
        )?;

        write_used_acquisition(&output_dir, self.input)?;
        if !self.ctx.keep_tmp_store {
            chunk_store::clear(&store_dir)?;
        }
        Ok(combined)
    }
}

/// Copies prior links' point estimates into a later link's parameter table.
fn apply_seeds(
    model: &mut TerminalModel,
    seeds: &[SeedRule],
    prior: &PriorResults,
) -> Result<(), FitError> {
    for seed in seeds {
        // The most recent run of the named source model wins.
        let source = prior
            .iter()
            .rev()
            .find_map(|(name, roi)| {
                if *name == seed.source_model {
                    roi.get(&seed.source_output)
                } else {
                    None
                }
            })
            .ok_or_else(|| FitError::MissingSeedSource {
                model: model.name().to_string(),
                param: seed.target_param.clone(),
                source_model: seed.source_model.clone(),
                source_output: seed.source_output.clone(),
            })?;

        let value = InitValue::PerVoxel(source.clone());
        match seed.mode {
            SeedMode::Init => model.init(&seed.target_param, value)?,
            SeedMode::Fix => model.fix(&seed.target_param, value)?,
        }
    }
    Ok(())
}

/// True when a completed run of the model already sits in `output_dir`: the
/// published used-mask marker plus one volume per declared output.
pub fn terminal_output_exists(output_dir: &Path, output_names: &[String]) -> bool {
    if !output_dir.join(format!("{USED_MASK_NAME}.vxa")).exists() {
        return false;
    }
    output_names
        .iter()
        .all(|name| volume::volume_path(output_dir, name).exists())
}

/// True when every terminal model reachable from the node has complete
/// output under `output_root`.
pub fn model_output_exists(node: &ModelNode, output_root: &Path) -> bool {
    node.terminals().iter().all(|model| {
        terminal_output_exists(
            &output_root.join(model.name()),
            &model.optimization_output_param_names(),
        )
    })
}

/// Reloads a prior run's outputs. Any unreadable or missing file means the
/// prior run is unusable and yields `None`, forcing recomputation rather
/// than failing.
fn try_load_output(
    output_dir: &Path,
    output_names: &[String],
    input: &InputData,
) -> Option<CombinedOutput> {
    if !terminal_output_exists(output_dir, output_names) {
        return None;
    }

    let mask_file = output_dir.join(format!("{USED_MASK_NAME}.vxa"));
    let used_mask = match ndio::read_u8(&mask_file) {
        Ok(stored) => stored
            .mapv(|v| v != 0)
            .into_dimensionality::<Ix3>()
            .ok()?,
        Err(e) => {
            warn!("unreadable used-mask '{}': {e}", mask_file.display());
            return None;
        }
    };

    let mut roi = AHashMap::new();
    let mut volumes = AHashMap::new();
    for name in output_names {
        let dense = match volume::read_volume(output_dir, name) {
            Ok(dense) => dense,
            Err(e) => {
                warn!("unreadable prior output '{name}': {e}");
                return None;
            }
        };
        let dense = dense.into_dimensionality::<Ix4>().ok()?;
        let extracted = addressing::extract(dense.view().into_dyn(), input.mask()).ok()?;
        roi.insert(name.clone(), extracted);
        volumes.insert(name.clone(), dense);
    }
    Some(CombinedOutput {
        roi,
        volumes,
        used_mask,
    })
}

fn write_used_acquisition(output_dir: &Path, input: &InputData) -> Result<(), FitError> {
    if input.acquisition().is_empty() {
        return Ok(());
    }
    let path = output_dir.join("used_acquisition.txt");
    std::fs::write(&path, input.acquisition().to_table_text()).map_err(|e| FitError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// One sampling run over a terminal model.
pub struct SampleRun<'a> {
    model: TerminalModel,
    input: &'a InputData,
    output_root: PathBuf,
    ctx: &'a RunContext,
    recalculate: bool,
    initialization: Option<InitializationData>,
    sampler: Arc<dyn PosteriorSampler>,
}

impl<'a> SampleRun<'a> {
    pub fn new(
        model: TerminalModel,
        input: &'a InputData,
        output_root: &Path,
        ctx: &'a RunContext,
        recalculate: bool,
    ) -> Self {
        SampleRun {
            model,
            input,
            output_root: output_root.to_path_buf(),
            ctx,
            recalculate,
            initialization: None,
            sampler: Arc::new(MetropolisSampler),
        }
    }

    pub fn with_initialization(mut self, initialization: InitializationData) -> Self {
        self.initialization = Some(initialization);
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn PosteriorSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn run(self) -> Result<CombinedOutput, FitError> {
        let SampleRun {
            mut model,
            input,
            output_root,
            ctx,
            recalculate,
            initialization,
            sampler,
        } = self;

        if !model.is_input_data_sufficient(input) {
            let problems = model
                .get_input_data_problems(input)
                .iter()
                .map(|p| p.to_string())
                .collect();
            return Err(FitError::InsufficientInput {
                model: model.name().to_string(),
                problems,
            });
        }

        if let Some(initialization) = &initialization {
            if !initialization.is_empty() {
                info!(
                    "preparing model '{}' with the user provided initialization data",
                    model.name()
                );
                initialization.apply_to(&mut model)?;
            }
        }

        let output_dir = output_root.join(model.name());
        let output_names = SamplingWorker::output_names(&model);
        if !recalculate
            && output_dir.join("samples").is_dir()
        {
            if let Some(existing) = try_load_output(&output_dir, &output_names, input) {
                info!("not recalculating '{}' model, samples exist", model.name());
                return Ok(existing);
            }
        }

        // The sampling store is kept apart from the fitting store of the
        // same model; their accumulation files have different meanings.
        let store_dir = ctx.store_dir(&format!("{}-sampling", model.name()));
        let trail = vec![model.name().to_string()];
        let policy = ctx.policy_for(&trail);
        let worker = SamplingWorker::new(sampler, ctx.sampling);
        let combined = scheduler::process_model(
            &worker,
            &model,
            input,
            &store_dir,
            &output_dir,
            &policy,
            recalculate,
        )?;

        write_used_acquisition(&output_dir, input)?;
        if !ctx.keep_tmp_store {
            chunk_store::clear(&store_dir)?;
        }
        Ok(combined)
    }
}
