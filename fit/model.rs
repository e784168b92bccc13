//! # The Model Contract
//!
//! A `TerminalModel` is the concrete, statically-typed unit the engine fits
//! or samples: named parameters, input requirements, and an objective
//! function evaluated per voxel. Models are built by `ModelBuilder`; there
//! is no runtime class machinery, and the small set of model kinds is a
//! tagged enum (`ModelNode`) rather than an inheritance tree.
//!
//! A cascade is an explicit ordered list of links plus seeding rules that
//! copy one link's per-voxel point estimates into the next link's parameter
//! table. Iteration state lives with the orchestrator, not the model.

use crate::types::InputData;
use ahash::AHashMap;
use ndarray::{Array1, Array2};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Name of the derived per-voxel objective-value output every fitting run
/// produces alongside the parameter maps.
pub const OBJECTIVE_OUTPUT: &str = "Objective";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model '{model}' has no parameter named '{param}'")]
    UnknownParameter { model: String, param: String },
    #[error("invalid initialization of '{model}.{param}': {reason}")]
    InvalidInitialization {
        model: String,
        param: String,
        reason: String,
    },
    #[error("model '{model}' declares parameter '{param}' twice")]
    DuplicateParameter { model: String, param: String },
    #[error("model '{model}' was built without an objective function")]
    MissingObjective { model: String },
    #[error("model '{model}' was built without parameters")]
    NoParameters { model: String },
}

/// The per-voxel view a model's objective function sees: the voxel's
/// measured signal and the shared acquisition table.
pub struct VoxelObservations<'a> {
    pub signal: ndarray::ArrayView1<'a, f64>,
    pub acquisition: &'a crate::types::Acquisition,
}

/// Objective evaluated per voxel over the full parameter vector (fixed
/// parameters included, in declaration order). Lower is better.
pub type ObjectiveFn = dyn Fn(&[f64], &VoxelObservations<'_>) -> f64 + Send + Sync;

/// Declaration of one model parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    /// Components per voxel; 1 for scalars.
    pub components: usize,
    pub initial: f64,
    pub lower: f64,
    pub upper: f64,
}

/// A per-parameter initialization value: one scalar for every voxel, or one
/// row per voxel in the full-mask ROI order.
#[derive(Debug, Clone)]
pub enum InitValue {
    Scalar(f64),
    PerVoxel(Array2<f64>),
}

/// What a model's input data must provide before fitting may start.
#[derive(Debug, Clone)]
pub enum InputRequirement {
    MinObservations(usize),
    AcquisitionColumn(String),
}

/// A diagnostic for one unmet input requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputProblem {
    TooFewObservations { found: usize, required: usize },
    MissingColumn { column: String },
}

impl fmt::Display for InputProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputProblem::TooFewObservations { found, required } => write!(
                f,
                "needs at least {required} observations per voxel, input has {found}"
            ),
            InputProblem::MissingColumn { column } => {
                write!(f, "acquisition table lacks the required column '{column}'")
            }
        }
    }
}

/// Caller-supplied initialization applied to the user-facing model before a
/// run: `init` seeds free parameters, `fix` pins them constant.
#[derive(Debug, Clone, Default)]
pub struct InitializationData {
    inits: Vec<(String, InitValue)>,
    fixes: Vec<(String, InitValue)>,
}

impl InitializationData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(mut self, param: &str, value: InitValue) -> Self {
        self.inits.push((param.to_string(), value));
        self
    }

    pub fn fix(mut self, param: &str, value: InitValue) -> Self {
        self.fixes.push((param.to_string(), value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inits.is_empty() && self.fixes.is_empty()
    }

    /// Copies the values into the model's parameter table. The model owns
    /// its table afterwards; later changes to `self` have no effect.
    pub fn apply_to(&self, model: &mut TerminalModel) -> Result<(), ModelError> {
        for (param, value) in &self.inits {
            model.init(param, value.clone())?;
        }
        for (param, value) in &self.fixes {
            model.fix(param, value.clone())?;
        }
        Ok(())
    }
}

/// A concrete model: the unit of one chunked-processing run.
#[derive(Clone)]
pub struct TerminalModel {
    name: String,
    params: Vec<ParamSpec>,
    requirements: Vec<InputRequirement>,
    objective: Arc<ObjectiveFn>,
    inits: AHashMap<String, InitValue>,
    fixes: AHashMap<String, InitValue>,
}

impl fmt::Debug for TerminalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalModel")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("fixed", &self.fixes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl TerminalModel {
    pub fn builder(name: &str) -> ModelBuilder {
        ModelBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn is_fixed(&self, param: &str) -> bool {
        self.fixes.contains_key(param)
    }

    /// Parameters the optimizer actually searches over.
    pub fn free_params(&self) -> Vec<&ParamSpec> {
        self.params
            .iter()
            .filter(|p| !self.fixes.contains_key(&p.name))
            .collect()
    }

    pub fn n_free_components(&self) -> usize {
        self.free_params().iter().map(|p| p.components).sum()
    }

    pub fn is_input_data_sufficient(&self, input: &InputData) -> bool {
        self.get_input_data_problems(input).is_empty()
    }

    pub fn get_input_data_problems(&self, input: &InputData) -> Vec<InputProblem> {
        let mut problems = Vec::new();
        for requirement in &self.requirements {
            match requirement {
                InputRequirement::MinObservations(required) => {
                    let found = input.observations_per_voxel();
                    if found < *required {
                        problems.push(InputProblem::TooFewObservations {
                            found,
                            required: *required,
                        });
                    }
                }
                InputRequirement::AcquisitionColumn(column) => {
                    if !input.acquisition().has_column(column) {
                        problems.push(InputProblem::MissingColumn {
                            column: column.clone(),
                        });
                    }
                }
            }
        }
        problems
    }

    /// Names of every output map a fitting run of this model produces: all
    /// parameters (fixed ones included) plus the objective value.
    pub fn optimization_output_param_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.params.iter().map(|p| p.name.clone()).collect();
        names.push(OBJECTIVE_OUTPUT.to_string());
        names
    }

    fn check_value(&self, param: &str, value: &InitValue) -> Result<(), ModelError> {
        let spec = self
            .params
            .iter()
            .find(|p| p.name == param)
            .ok_or_else(|| ModelError::UnknownParameter {
                model: self.name.clone(),
                param: param.to_string(),
            })?;
        if let InitValue::PerVoxel(values) = value {
            if values.ncols() != spec.components {
                return Err(ModelError::InvalidInitialization {
                    model: self.name.clone(),
                    param: param.to_string(),
                    reason: format!(
                        "per-voxel value has {} components, parameter declares {}",
                        values.ncols(),
                        spec.components
                    ),
                });
            }
        }
        Ok(())
    }

    /// Seeds a free parameter's starting value.
    pub fn init(&mut self, param: &str, value: InitValue) -> Result<(), ModelError> {
        self.check_value(param, &value)?;
        self.inits.insert(param.to_string(), value);
        Ok(())
    }

    /// Pins a parameter to a constant; it is removed from the optimized set
    /// but still appears in the full parameter vector and the output maps.
    pub fn fix(&mut self, param: &str, value: InitValue) -> Result<(), ModelError> {
        self.check_value(param, &value)?;
        self.fixes.insert(param.to_string(), value);
        Ok(())
    }

    fn table_value(
        table: &AHashMap<String, InitValue>,
        spec: &ParamSpec,
        component: usize,
        full_roi_row: usize,
    ) -> Option<f64> {
        match table.get(&spec.name)? {
            InitValue::Scalar(v) => Some(*v),
            InitValue::PerVoxel(values) => {
                if full_roi_row < values.nrows() {
                    Some(values[[full_roi_row, component]])
                } else {
                    None
                }
            }
        }
    }

    /// Starting point of the free components for the voxel at the given
    /// full-mask ROI row, clamped to the declared bounds.
    pub fn starting_point(&self, full_roi_row: usize) -> Array1<f64> {
        let mut x = Vec::with_capacity(self.n_free_components());
        for spec in self.free_params() {
            for c in 0..spec.components {
                let v = Self::table_value(&self.inits, spec, c, full_roi_row)
                    .unwrap_or(spec.initial);
                x.push(v.clamp(spec.lower, spec.upper));
            }
        }
        Array1::from_vec(x)
    }

    /// Expands free components into the full parameter vector (declaration
    /// order), filling fixed parameters from their pinned values and
    /// clamping free values to their bounds.
    pub fn full_parameter_vector(&self, free: &[f64], full_roi_row: usize) -> Vec<f64> {
        let mut full = Vec::with_capacity(self.params.iter().map(|p| p.components).sum());
        let mut cursor = 0usize;
        for spec in &self.params {
            if self.fixes.contains_key(&spec.name) {
                for c in 0..spec.components {
                    let v = Self::table_value(&self.fixes, spec, c, full_roi_row)
                        .unwrap_or(spec.initial);
                    full.push(v);
                }
            } else {
                for _ in 0..spec.components {
                    full.push(free[cursor].clamp(spec.lower, spec.upper));
                    cursor += 1;
                }
            }
        }
        full
    }

    /// Evaluates the objective for a voxel given its free components.
    pub fn objective_value(
        &self,
        free: &[f64],
        full_roi_row: usize,
        observations: &VoxelObservations<'_>,
    ) -> f64 {
        let full = self.full_parameter_vector(free, full_roi_row);
        (self.objective)(&full, observations)
    }
}

/// Builds a `TerminalModel` from a declarative description.
pub struct ModelBuilder {
    name: String,
    params: Vec<ParamSpec>,
    requirements: Vec<InputRequirement>,
    objective: Option<Arc<ObjectiveFn>>,
}

impl ModelBuilder {
    pub fn new(name: &str) -> Self {
        ModelBuilder {
            name: name.to_string(),
            params: Vec::new(),
            requirements: Vec::new(),
            objective: None,
        }
    }

    /// Declares a scalar parameter with effectively unbounded range.
    pub fn parameter(self, name: &str, initial: f64) -> Self {
        self.bounded_parameter(name, initial, f64::NEG_INFINITY, f64::INFINITY)
    }

    pub fn bounded_parameter(mut self, name: &str, initial: f64, lower: f64, upper: f64) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            components: 1,
            initial,
            lower,
            upper,
        });
        self
    }

    /// Declares a parameter with `components` values per voxel.
    pub fn vector_parameter(mut self, name: &str, components: usize, initial: f64) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            components,
            initial,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        });
        self
    }

    pub fn requires_min_observations(mut self, n: usize) -> Self {
        self.requirements.push(InputRequirement::MinObservations(n));
        self
    }

    pub fn requires_column(mut self, column: &str) -> Self {
        self.requirements
            .push(InputRequirement::AcquisitionColumn(column.to_string()));
        self
    }

    pub fn objective<F>(mut self, objective: F) -> Self
    where
        F: Fn(&[f64], &VoxelObservations<'_>) -> f64 + Send + Sync + 'static,
    {
        self.objective = Some(Arc::new(objective));
        self
    }

    pub fn build(self) -> Result<TerminalModel, ModelError> {
        if self.params.is_empty() {
            return Err(ModelError::NoParameters { model: self.name });
        }
        for (i, a) in self.params.iter().enumerate() {
            if self.params[..i].iter().any(|b| b.name == a.name) {
                return Err(ModelError::DuplicateParameter {
                    model: self.name.clone(),
                    param: a.name.clone(),
                });
            }
        }
        let objective = self
            .objective
            .ok_or(ModelError::MissingObjective {
                model: self.name.clone(),
            })?;
        Ok(TerminalModel {
            name: self.name,
            params: self.params,
            requirements: self.requirements,
            objective,
            inits: AHashMap::new(),
            fixes: AHashMap::new(),
        })
    }
}

/// How a cascade link seeds one of its parameters from a prior link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    Init,
    Fix,
}

/// Copies a prior link's per-voxel output into a later link's parameter.
#[derive(Debug, Clone)]
pub struct SeedRule {
    pub target_param: String,
    pub source_model: String,
    pub source_output: String,
    pub mode: SeedMode,
}

/// One link of a cascade and its seeding rules. Seed rules apply to
/// terminal links; a nested cascade link carries its own rules inside.
#[derive(Debug, Clone)]
pub struct CascadeLink {
    pub node: ModelNode,
    pub seeds: Vec<SeedRule>,
}

/// An ordered chain of models; each link may read any prior link's outputs
/// as initialization.
#[derive(Debug, Clone)]
pub struct CascadeSpec {
    pub name: String,
    pub links: Vec<CascadeLink>,
}

/// A model chain node: terminal, or an ordered cascade of further nodes.
#[derive(Debug, Clone)]
pub enum ModelNode {
    Terminal(TerminalModel),
    Cascade(CascadeSpec),
}

impl ModelNode {
    pub fn name(&self) -> &str {
        match self {
            ModelNode::Terminal(model) => model.name(),
            ModelNode::Cascade(spec) => &spec.name,
        }
    }

    /// Every terminal model reachable from this node, in fitting order.
    pub fn terminals(&self) -> Vec<&TerminalModel> {
        match self {
            ModelNode::Terminal(model) => vec![model],
            ModelNode::Cascade(spec) => spec
                .links
                .iter()
                .flat_map(|link| link.node.terminals())
                .collect(),
        }
    }
}
