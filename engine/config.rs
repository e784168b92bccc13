//! Run configuration. A `RunConfig` can be loaded from a TOML file or built
//! in code; a `RunContext` is the explicitly constructed, passed-down bundle
//! of everything a single run needs (temporary results root, chunk policy,
//! sampler settings). There is no process-wide configuration state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("chunk policy must allow at least one voxel per chunk")]
    EmptyChunks,
}

/// Partitioning policy of the chunk scheduler: cut the ROI order every
/// `max_voxels_per_chunk` active voxels. Derived purely from the mask and
/// this value, so re-partitioning is deterministic across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPolicy {
    pub max_voxels_per_chunk: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        // Sized so a chunk's per-voxel working set stays comfortably inside
        // memory for typical observation counts.
        ChunkPolicy {
            max_voxels_per_chunk: 40_000,
        }
    }
}

/// Settings of the sampling worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of retained samples per voxel.
    pub samples: usize,
    /// Samples discarded before retention starts.
    pub burnin: usize,
    /// Proposals drawn per retained sample; 1 retains every post-burn-in
    /// draw.
    pub thinning: usize,
    /// Standard deviation of the random-walk proposal.
    pub proposal_std: f64,
    /// Base seed; each voxel derives its own deterministic stream from this
    /// plus its full-mask ROI row, so chunk layout cannot change results.
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            samples: 500,
            burnin: 500,
            thinning: 1,
            proposal_std: 0.05,
            seed: 0,
        }
    }
}

/// On-disk run configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub chunks: ChunkPolicy,
    pub sampling: SamplingConfig,
    /// Per-model-family chunk policies, looked up through the cascade name
    /// trail (innermost name wins). Models not listed use `chunks`.
    pub chunk_overrides: BTreeMap<String, ChunkPolicy>,
    /// Root for temporary (resumable) chunk state. Defaults to
    /// `<output>/tmp_results` when unset.
    pub tmp_results_dir: Option<PathBuf>,
    /// Keep the per-model chunk store after a successful combine instead of
    /// removing it.
    pub keep_tmp_store: bool,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<RunConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: RunConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunks.max_voxels_per_chunk == 0 {
            return Err(ConfigError::EmptyChunks);
        }
        Ok(())
    }
}

/// Everything one run needs, passed down the call tree explicitly.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub tmp_root: PathBuf,
    pub chunks: ChunkPolicy,
    pub chunk_overrides: BTreeMap<String, ChunkPolicy>,
    pub sampling: SamplingConfig,
    pub keep_tmp_store: bool,
}

impl RunContext {
    /// Builds the context for a run writing under `output_root`.
    pub fn for_output(output_root: &Path, config: &RunConfig) -> RunContext {
        let tmp_root = config
            .tmp_results_dir
            .clone()
            .unwrap_or_else(|| output_root.join("tmp_results"));
        RunContext {
            tmp_root,
            chunks: config.chunks,
            chunk_overrides: config.chunk_overrides.clone(),
            sampling: config.sampling,
            keep_tmp_store: config.keep_tmp_store,
        }
    }

    /// The chunk-store directory owned by the named model under this run.
    pub fn store_dir(&self, model_name: &str) -> PathBuf {
        self.tmp_root.join(model_name)
    }

    /// Resolves the chunk policy for a model through its cascade name trail;
    /// the innermost (most specific) name wins.
    pub fn policy_for(&self, name_trail: &[String]) -> ChunkPolicy {
        for name in name_trail.iter().rev() {
            if let Some(policy) = self.chunk_overrides.get(name) {
                return *policy;
            }
        }
        self.chunks
    }
}
