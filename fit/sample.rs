//! The Markov-chain sampling collaborator: a `PosteriorSampler` trait and a
//! random-walk Metropolis implementation with burn-in and thinning. Chains
//! are seeded per voxel from the run seed plus the voxel's full-mask ROI
//! row, so the retained samples do not depend on how the volume was chunked.

use crate::config::SamplingConfig;
use ndarray::{Array1, Array2};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Normal;

/// The retained chain of one voxel: `[retained_samples, dim]`.
#[derive(Debug, Clone)]
pub struct SampleChain {
    pub samples: Array2<f64>,
    pub accepted: usize,
    pub proposed: usize,
}

impl SampleChain {
    /// Per-dimension posterior mean.
    pub fn mean(&self) -> Array1<f64> {
        let n = self.samples.nrows().max(1) as f64;
        self.samples.sum_axis(ndarray::Axis(0)) / n
    }

    /// Per-dimension posterior standard deviation (population form).
    pub fn std(&self) -> Array1<f64> {
        let n = self.samples.nrows().max(1) as f64;
        let mean = self.mean();
        let mut acc = Array1::<f64>::zeros(self.samples.ncols());
        for row in self.samples.rows() {
            for (i, &v) in row.iter().enumerate() {
                let d = v - mean[i];
                acc[i] += d * d;
            }
        }
        acc.mapv(|v| (v / n).sqrt())
    }
}

/// External sampler contract: draw from the distribution with the given
/// unnormalized log-probability, starting at `x0`, deterministically for a
/// given seed.
pub trait PosteriorSampler: Send + Sync {
    fn sample(
        &self,
        log_prob: &(dyn Fn(&Array1<f64>) -> f64 + Sync),
        x0: Array1<f64>,
        config: &SamplingConfig,
        seed: u64,
    ) -> SampleChain;
}

/// Symmetric random-walk Metropolis.
#[derive(Debug, Default, Clone)]
pub struct MetropolisSampler;

impl PosteriorSampler for MetropolisSampler {
    fn sample(
        &self,
        log_prob: &(dyn Fn(&Array1<f64>) -> f64 + Sync),
        x0: Array1<f64>,
        config: &SamplingConfig,
        seed: u64,
    ) -> SampleChain {
        let dim = x0.len();
        let retained = config.samples;
        let thinning = config.thinning.max(1);
        let total = config.burnin + retained * thinning;

        let mut rng = StdRng::seed_from_u64(seed);
        let proposal = Normal::new(0.0, config.proposal_std)
            .unwrap_or_else(|_| Normal::new(0.0, 1.0).expect("unit normal is valid"));
        let unit = Uniform::new(0.0f64, 1.0);

        let mut current = x0;
        let mut current_lp = log_prob(&current);
        if !current_lp.is_finite() {
            current_lp = f64::NEG_INFINITY;
        }

        let mut samples = Array2::zeros((retained, dim));
        let mut accepted = 0usize;
        let mut kept = 0usize;

        for step in 0..total {
            let mut candidate = current.clone();
            for v in candidate.iter_mut() {
                *v += proposal.sample(&mut rng);
            }
            let mut candidate_lp = log_prob(&candidate);
            if !candidate_lp.is_finite() {
                candidate_lp = f64::NEG_INFINITY;
            }

            let accept = candidate_lp >= current_lp
                || unit.sample(&mut rng).ln() < candidate_lp - current_lp;
            if accept {
                current = candidate;
                current_lp = candidate_lp;
                accepted += 1;
            }

            if step >= config.burnin && (step - config.burnin) % thinning == 0 && kept < retained {
                for (i, &v) in current.iter().enumerate() {
                    samples[[kept, i]] = v;
                }
                kept += 1;
            }
        }

        SampleChain {
            samples,
            accepted,
            proposed: total,
        }
    }
}
