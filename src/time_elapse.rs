//! Basis matrices for continuous time elapse.
//!
//! The stepping loop only needs `get_basis_matrix(step)`: the matrix `e^{A·step·h}`
//! mapping a mode's initial-time variables to its current-time variables, and,
//! for modes with inputs, the matrix mapping the inputs of the latest step to
//! their effect on the state.

use log::debug;
use nalgebra::DMatrix;

use crate::automaton::Mode;
use crate::error::{ReachError, Result};

/// Step-indexed source of basis matrices for one mode.
///
/// Queries may repeat or go back to earlier steps; they are always answered.
pub trait TimeElapse {
    fn get_basis_matrix(&mut self, step: usize) -> Result<(DMatrix<f64>, Option<DMatrix<f64>>)>;
}

/// Matrix exponential of one step, then repeated multiplication, with every
/// step's result cached.
///
/// With inputs, the one-step input effect `G = ∫₀ʰ e^{As} B ds` is the top-right
/// block of `exp([[A, B], [0, 0]]·h)`; the effect of the inputs chosen during
/// step `k` is `e^{A(k-1)h}·G`.
#[derive(Debug, Clone)]
pub struct ExpMultElapser {
    one_step: DMatrix<f64>,
    input_one_step: Option<DMatrix<f64>>,
    cache: Vec<(DMatrix<f64>, Option<DMatrix<f64>>)>,
}

impl ExpMultElapser {
    /// Prepares the elapser for `mode` and reserves its per-step cache.
    ///
    /// Fails with [`ReachError::InsufficientMemory`] before allocating if
    /// `num_steps` cached matrices would exceed `max_cache_bytes`.
    pub fn new(mode: &Mode, step_size: f64, num_steps: usize, max_cache_bytes: usize) -> Result<Self> {
        let a = mode.a_matrix().ok_or_else(|| {
            ReachError::ModelDefinition(format!("time elapse requested for error mode '{}'", mode.name()))
        })?;
        let dims = a.nrows();
        let num_inputs = mode.inputs().map_or(0, |i| i.num_inputs());

        let per_step = (dims * dims + dims * num_inputs) * std::mem::size_of::<f64>();
        let required = per_step.saturating_mul(num_steps + 1);
        if required > max_cache_bytes {
            return Err(ReachError::InsufficientMemory {
                required,
                available: max_cache_bytes,
            });
        }

        let one_step = (a * step_size).exp();
        let input_one_step = mode.inputs().map(|inputs| {
            let n = dims + num_inputs;
            let mut aug = DMatrix::zeros(n, n);
            aug.view_mut((0, 0), (dims, dims)).copy_from(a);
            aug.view_mut((0, dims), (dims, num_inputs)).copy_from(&inputs.b_matrix);
            let exp = (aug * step_size).exp();
            exp.view((0, dims), (dims, num_inputs)).into_owned()
        });

        debug!(
            "time elapse for mode '{}': {} dims, {} inputs, step {}",
            mode.name(),
            dims,
            num_inputs,
            step_size
        );

        let mut cache = Vec::with_capacity(num_steps + 1);
        cache.push((DMatrix::identity(dims, dims), None));

        Ok(ExpMultElapser {
            one_step,
            input_one_step,
            cache,
        })
    }
}

impl TimeElapse for ExpMultElapser {
    fn get_basis_matrix(&mut self, step: usize) -> Result<(DMatrix<f64>, Option<DMatrix<f64>>)> {
        while self.cache.len() <= step {
            let prev = &self.cache[self.cache.len() - 1].0;
            let basis = &self.one_step * prev;
            let input_effects = self.input_one_step.as_ref().map(|g| prev * g);
            self.cache.push((basis, input_effects));
        }
        Ok(self.cache[step].clone())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::automaton::{HybridAutomaton, Inputs};

    #[test]
    fn test_harmonic_oscillator_quarter_turn() {
        let mut ha = HybridAutomaton::new("osc");
        let m = ha.new_mode("m");
        ha.set_dynamics(m, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 0.0])).unwrap();

        let h = std::f64::consts::FRAC_PI_2;
        let mut elapser = ExpMultElapser::new(ha.mode(m), h, 4, 1 << 20).unwrap();

        let (basis, ie) = elapser.get_basis_matrix(1).unwrap();
        assert!(ie.is_none());
        let expected = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 0.0]);
        assert!((basis - expected).abs().max() < 1e-9);

        // going back to an earlier step is answered from the cache
        let (basis0, _) = elapser.get_basis_matrix(0).unwrap();
        assert_eq!(basis0, DMatrix::identity(2, 2));

        let (basis2, _) = elapser.get_basis_matrix(2).unwrap();
        assert!((basis2 + DMatrix::identity(2, 2)).abs().max() < 1e-9);
    }

    #[test]
    fn test_input_effects() {
        // x' = u, u in [0, 1]
        let mut ha = HybridAutomaton::new("inputs");
        let m = ha.new_mode("m");
        ha.set_dynamics(m, DMatrix::zeros(1, 1)).unwrap();
        ha.set_inputs(
            m,
            Inputs {
                b_matrix: DMatrix::from_element(1, 1, 1.0),
                u_constraints: DMatrix::from_column_slice(2, 1, &[1.0, -1.0]),
                u_rhs: vec![1.0, 0.0],
            },
        )
        .unwrap();

        let mut elapser = ExpMultElapser::new(ha.mode(m), 0.5, 4, 1 << 20).unwrap();
        let (_, ie) = elapser.get_basis_matrix(3).unwrap();
        let ie = ie.unwrap();
        assert!((ie[(0, 0)] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_insufficient_memory() {
        let mut ha = HybridAutomaton::new("big");
        let m = ha.new_mode("m");
        ha.set_dynamics(m, DMatrix::zeros(10, 10)).unwrap();
        let err = ExpMultElapser::new(ha.mode(m), 0.1, 1000, 1024).unwrap_err();
        assert!(matches!(err, ReachError::InsufficientMemory { available: 1024, .. }));
    }
}
