//! The point-estimation collaborator. The engine only depends on the
//! `PointOptimizer` trait; the default implementation drives `wolfe_bfgs`
//! with central-difference gradients.

use log::debug;
use ndarray::Array1;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Cost substituted when the objective returns a non-finite value, so a bad
/// region of parameter space cannot poison the line search.
const NON_FINITE_COST: f64 = 1e10;

/// Result of one per-voxel minimization.
#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    pub point: Array1<f64>,
    pub value: f64,
}

/// External optimizer contract: minimize a per-voxel objective starting
/// from `x0`. Implementations must be deterministic for a given `(objective,
/// x0)` so that chunk boundaries cannot change results.
pub trait PointOptimizer: Send + Sync {
    fn minimize(
        &self,
        objective: &(dyn Fn(&Array1<f64>) -> f64 + Sync),
        x0: Array1<f64>,
    ) -> OptimizeOutcome;
}

/// BFGS with a Wolfe line search and numerical gradients.
#[derive(Debug, Clone)]
pub struct BfgsOptimizer {
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Step used for central-difference gradients.
    pub gradient_step: f64,
}

impl Default for BfgsOptimizer {
    fn default() -> Self {
        BfgsOptimizer {
            tolerance: 1e-6,
            max_iterations: 200,
            gradient_step: 1e-6,
        }
    }
}

impl BfgsOptimizer {
    fn guarded(objective: &(dyn Fn(&Array1<f64>) -> f64 + Sync), x: &Array1<f64>) -> f64 {
        let cost = objective(x);
        if cost.is_finite() { cost } else { NON_FINITE_COST }
    }
}

impl PointOptimizer for BfgsOptimizer {
    fn minimize(
        &self,
        objective: &(dyn Fn(&Array1<f64>) -> f64 + Sync),
        x0: Array1<f64>,
    ) -> OptimizeOutcome {
        // Zero free dimensions happens when every parameter is pinned; the
        // objective is then a constant and there is nothing to search.
        if x0.is_empty() {
            let value = Self::guarded(objective, &x0);
            return OptimizeOutcome { point: x0, value };
        }

        let h = self.gradient_step;
        let start = x0.clone();
        let cost_and_grad = |x: &Array1<f64>| -> (f64, Array1<f64>) {
            let cost = Self::guarded(objective, x);
            let mut grad = Array1::zeros(x.len());
            let mut probe = x.clone();
            for i in 0..x.len() {
                let xi = x[i];
                probe[i] = xi + h;
                let up = Self::guarded(objective, &probe);
                probe[i] = xi - h;
                let down = Self::guarded(objective, &probe);
                probe[i] = xi;
                grad[i] = (up - down) / (2.0 * h);
            }
            (cost, grad)
        };

        match Bfgs::new(x0, cost_and_grad)
            .with_tolerance(self.tolerance)
            .with_max_iterations(self.max_iterations)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                final_value,
                ..
            }) => OptimizeOutcome {
                point: final_point,
                value: final_value,
            },
            Err(e) => {
                // One pathological voxel must not abort a whole-volume run;
                // fall back to the starting point.
                debug!("BFGS failed, keeping the starting point: {e:?}");
                let value = Self::guarded(objective, &start);
                OptimizeOutcome {
                    point: start,
                    value,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn minimizes_a_shifted_quadratic() {
        let optimizer = BfgsOptimizer::default();
        let objective =
            |x: &Array1<f64>| (x[0] - 3.0).powi(2) + 2.0 * (x[1] + 1.5).powi(2) + 0.75;
        let outcome = optimizer.minimize(&objective, array![0.0, 0.0]);

        assert_abs_diff_eq!(outcome.point[0], 3.0, epsilon = 1e-3);
        assert_abs_diff_eq!(outcome.point[1], -1.5, epsilon = 1e-3);
        assert_abs_diff_eq!(outcome.value, 0.75, epsilon = 1e-6);
    }

    #[test]
    fn empty_search_space_returns_the_constant_objective() {
        let optimizer = BfgsOptimizer::default();
        let outcome = optimizer.minimize(&|_| 42.0, Array1::zeros(0));
        assert_eq!(outcome.value, 42.0);
        assert!(outcome.point.is_empty());
    }

    #[test]
    fn is_deterministic_for_identical_inputs() {
        let optimizer = BfgsOptimizer::default();
        let objective = |x: &Array1<f64>| x[0].powi(4) - 3.0 * x[0].powi(2) + x[0];
        let a = optimizer.minimize(&objective, array![0.1]);
        let b = optimizer.minimize(&objective, array![0.1]);
        assert_eq!(a.point[0].to_bits(), b.point[0].to_bits());
        assert_eq!(a.value.to_bits(), b.value.to_bits());
    }
}
