//! The stock model library the CLI exposes. Small on purpose: the engine is
//! model-agnostic, and anything beyond these is built through
//! `ModelBuilder` by the calling code.

use crate::fit::model::{
    CascadeLink, CascadeSpec, ModelError, ModelNode, SeedMode, SeedRule, TerminalModel,
};

/// Baseline-signal model: a single level fitted against all observations.
pub fn s0() -> Result<TerminalModel, ModelError> {
    TerminalModel::builder("S0")
        .bounded_parameter("S0", 1.0, 0.0, f64::INFINITY)
        .requires_min_observations(1)
        .objective(|params, obs| {
            let s0 = params[0];
            obs.signal.iter().map(|&s| (s - s0).powi(2)).sum()
        })
        .build()
}

/// Mono-exponential decay over the acquisition's `b` column:
/// `S(b) = S0 * exp(-b * D)`.
pub fn exp_decay() -> Result<TerminalModel, ModelError> {
    TerminalModel::builder("ExpDecay")
        .bounded_parameter("S0", 1.0, 0.0, f64::INFINITY)
        .bounded_parameter("D", 1e-3, 0.0, 0.1)
        .requires_min_observations(2)
        .requires_column("b")
        .objective(|params, obs| {
            let (s0, d) = (params[0], params[1]);
            let b = obs
                .acquisition
                .column("b")
                .expect("required column is checked before fitting");
            obs.signal
                .iter()
                .zip(b.iter())
                .map(|(&s, &bv)| (s - s0 * (-bv * d).exp()).powi(2))
                .sum()
        })
        .build()
}

/// Two-link chain: the baseline fit seeds the decay fit's `S0`.
pub fn exp_decay_cascade() -> Result<ModelNode, ModelError> {
    Ok(ModelNode::Cascade(CascadeSpec {
        name: "ExpDecay (Cascade)".to_string(),
        links: vec![
            CascadeLink {
                node: ModelNode::Terminal(s0()?),
                seeds: vec![],
            },
            CascadeLink {
                node: ModelNode::Terminal(exp_decay()?),
                seeds: vec![SeedRule {
                    target_param: "S0".to_string(),
                    source_model: "S0".to_string(),
                    source_output: "S0".to_string(),
                    mode: SeedMode::Init,
                }],
            },
        ],
    }))
}

/// Looks a model up by its public name.
pub fn by_name(name: &str) -> Option<Result<ModelNode, ModelError>> {
    match name {
        "S0" => Some(s0().map(ModelNode::Terminal)),
        "ExpDecay" => Some(exp_decay().map(ModelNode::Terminal)),
        "ExpDecay (Cascade)" => Some(exp_decay_cascade()),
        _ => None,
    }
}

/// Names accepted by `by_name`, for CLI help output.
pub fn available_models() -> &'static [&'static str] {
    &["S0", "ExpDecay", "ExpDecay (Cascade)"]
}
