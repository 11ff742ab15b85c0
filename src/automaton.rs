//! Linear hybrid automaton model.
//!
//! A [`HybridAutomaton`] owns its modes and transitions; both are referred to
//! by index handles ([`ModeId`], [`TransitionId`]). A mode without a dynamics
//! matrix is an error mode: reaching it is what the analysis looks for.

use log::{debug, info};
use nalgebra::DMatrix;

use crate::error::{ReachError, Result};
use crate::lp::{LpInstance, LpOutcome};
use crate::types::{ModeId, TransitionId};
use crate::utils::{allclose, matrix_from_rows};

/// A single linear inequality `coeffs · x <= rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearConstraint {
    pub coeffs: Vec<f64>,
    pub rhs: f64,
}

impl LinearConstraint {
    pub fn new(coeffs: impl Into<Vec<f64>>, rhs: f64) -> Self {
        LinearConstraint {
            coeffs: coeffs.into(),
            rhs,
        }
    }

    /// The closed complement `-coeffs · x <= -rhs`.
    pub fn negate(&self) -> Self {
        LinearConstraint {
            coeffs: self.coeffs.iter().map(|c| -c).collect(),
            rhs: -self.rhs,
        }
    }

    pub fn dims(&self) -> usize {
        self.coeffs.len()
    }
}

/// Splits a constraint list into a dense matrix and its right-hand side.
pub fn constraints_to_matrix(constraints: &[LinearConstraint], dims: usize) -> (DMatrix<f64>, Vec<f64>) {
    let rows: Vec<Vec<f64>> = constraints.iter().map(|c| c.coeffs.clone()).collect();
    let rhs = constraints.iter().map(|c| c.rhs).collect();
    (matrix_from_rows(&rows, dims), rhs)
}

/// Bounded nondeterminism added by a reset: `M·y` with `C·y <= rhs`.
#[derive(Debug, Clone)]
pub struct Minkowski {
    pub matrix: DMatrix<f64>,
    pub constraints: DMatrix<f64>,
    pub rhs: Vec<f64>,
}

/// Affine reset `x' = R·x (+ M·y)`.
#[derive(Debug, Clone)]
pub struct Reset {
    pub matrix: DMatrix<f64>,
    pub minkowski: Option<Minkowski>,
}

impl Reset {
    pub fn new(matrix: DMatrix<f64>) -> Self {
        Reset { matrix, minkowski: None }
    }

    pub fn with_minkowski(matrix: DMatrix<f64>, minkowski: Minkowski) -> Self {
        Reset {
            matrix,
            minkowski: Some(minkowski),
        }
    }
}

/// Inputs `x' = A·x + B·u` with `u_constraints · u <= u_rhs`.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub b_matrix: DMatrix<f64>,
    pub u_constraints: DMatrix<f64>,
    pub u_rhs: Vec<f64>,
}

impl Inputs {
    pub fn num_inputs(&self) -> usize {
        self.b_matrix.ncols()
    }
}

#[derive(Debug, Clone)]
pub struct Mode {
    id: ModeId,
    name: String,
    a_matrix: Option<DMatrix<f64>>,
    inputs: Option<Inputs>,
    invariant: Vec<LinearConstraint>,
    transitions: Vec<TransitionId>,
}

impl Mode {
    pub fn id(&self) -> ModeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn a_matrix(&self) -> Option<&DMatrix<f64>> {
        self.a_matrix.as_ref()
    }

    pub fn inputs(&self) -> Option<&Inputs> {
        self.inputs.as_ref()
    }

    pub fn has_inputs(&self) -> bool {
        self.inputs.is_some()
    }

    pub fn invariant(&self) -> &[LinearConstraint] {
        &self.invariant
    }

    /// Outgoing transitions, in creation order.
    pub fn transitions(&self) -> &[TransitionId] {
        &self.transitions
    }

    /// Number of continuous variables, `None` for an error mode.
    pub fn dims(&self) -> Option<usize> {
        self.a_matrix.as_ref().map(|a| a.nrows())
    }

    pub fn is_error(&self) -> bool {
        self.a_matrix.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    id: TransitionId,
    name: String,
    from: ModeId,
    to: ModeId,
    guard: Vec<LinearConstraint>,
    reset: Option<Reset>,
    time_triggered: bool,
}

impl Transition {
    pub fn id(&self) -> TransitionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn from(&self) -> ModeId {
        self.from
    }

    pub fn to(&self) -> ModeId {
        self.to
    }

    /// Guard rows; an empty guard is always enabled.
    pub fn guard(&self) -> &[LinearConstraint] {
        &self.guard
    }

    /// Reset; `None` means identity.
    pub fn reset(&self) -> Option<&Reset> {
        self.reset.as_ref()
    }

    pub fn is_time_triggered(&self) -> bool {
        self.time_triggered
    }
}

#[derive(Debug, Clone, Default)]
pub struct HybridAutomaton {
    pub name: String,
    modes: Vec<Mode>,
    transitions: Vec<Transition>,
}

impl HybridAutomaton {
    pub fn new(name: impl Into<String>) -> Self {
        HybridAutomaton {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn new_mode(&mut self, name: impl Into<String>) -> ModeId {
        let id = ModeId::new(self.modes.len());
        self.modes.push(Mode {
            id,
            name: name.into(),
            a_matrix: None,
            inputs: None,
            invariant: Vec::new(),
            transitions: Vec::new(),
        });
        id
    }

    pub fn new_transition(&mut self, from: ModeId, to: ModeId, name: impl Into<String>) -> TransitionId {
        let id = TransitionId::new(self.transitions.len());
        self.transitions.push(Transition {
            id,
            name: name.into(),
            from,
            to,
            guard: Vec::new(),
            reset: None,
            time_triggered: false,
        });
        self.modes[from.index()].transitions.push(id);
        id
    }

    pub fn mode(&self, id: ModeId) -> &Mode {
        &self.modes[id.index()]
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn mode_by_name(&self, name: &str) -> Option<&Mode> {
        self.modes.iter().find(|m| m.name == name)
    }

    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.index()]
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Position of a transition in its source mode's outgoing list.
    pub fn transition_index_in_source(&self, id: TransitionId) -> usize {
        let t = self.transition(id);
        self.mode(t.from)
            .transitions
            .iter()
            .position(|&x| x == id)
            .unwrap_or_else(|| panic!("transition {} missing from its source mode", id))
    }

    pub fn set_dynamics(&mut self, mode: ModeId, a_matrix: DMatrix<f64>) -> Result<()> {
        if !a_matrix.is_square() {
            return Err(ReachError::dims(
                format!("dynamics of mode '{}'", self.mode(mode).name),
                a_matrix.nrows(),
                a_matrix.ncols(),
            ));
        }
        self.modes[mode.index()].a_matrix = Some(a_matrix);
        Ok(())
    }

    pub fn set_inputs(&mut self, mode: ModeId, inputs: Inputs) -> Result<()> {
        let m = self.mode(mode);
        let dims = m.dims().ok_or_else(|| {
            ReachError::ModelDefinition(format!("inputs set on error mode '{}'", m.name))
        })?;
        if inputs.b_matrix.nrows() != dims {
            return Err(ReachError::dims("input matrix rows", dims, inputs.b_matrix.nrows()));
        }
        if inputs.u_constraints.ncols() != inputs.num_inputs() {
            return Err(ReachError::dims(
                "input constraint columns",
                inputs.num_inputs(),
                inputs.u_constraints.ncols(),
            ));
        }
        if inputs.u_constraints.nrows() != inputs.u_rhs.len() {
            return Err(ReachError::dims(
                "input constraint rhs",
                inputs.u_constraints.nrows(),
                inputs.u_rhs.len(),
            ));
        }
        self.modes[mode.index()].inputs = Some(inputs);
        Ok(())
    }

    pub fn set_invariant(&mut self, mode: ModeId, invariant: Vec<LinearConstraint>) -> Result<()> {
        let m = self.mode(mode);
        if let Some(dims) = m.dims() {
            for c in &invariant {
                if c.dims() != dims {
                    return Err(ReachError::dims(format!("invariant of mode '{}'", m.name), dims, c.dims()));
                }
            }
        }
        self.modes[mode.index()].invariant = invariant;
        Ok(())
    }

    pub fn set_guard(&mut self, transition: TransitionId, guard: Vec<LinearConstraint>) -> Result<()> {
        if let Some(dims) = self.mode(self.transition(transition).from).dims() {
            for c in &guard {
                if c.dims() != dims {
                    return Err(ReachError::dims(
                        format!("guard of transition '{}'", self.transition(transition).name),
                        dims,
                        c.dims(),
                    ));
                }
            }
        }
        self.transitions[transition.index()].guard = guard;
        Ok(())
    }

    pub fn set_reset(&mut self, transition: TransitionId, reset: Reset) -> Result<()> {
        if let Some(mink) = &reset.minkowski {
            if mink.matrix.nrows() != reset.matrix.nrows() {
                return Err(ReachError::dims("minkowski matrix rows", reset.matrix.nrows(), mink.matrix.nrows()));
            }
            if mink.constraints.ncols() != mink.matrix.ncols() {
                return Err(ReachError::dims(
                    "minkowski constraint columns",
                    mink.matrix.ncols(),
                    mink.constraints.ncols(),
                ));
            }
            if mink.constraints.nrows() != mink.rhs.len() {
                return Err(ReachError::dims("minkowski constraint rhs", mink.constraints.nrows(), mink.rhs.len()));
            }
        }
        self.transitions[transition.index()].reset = Some(reset);
        Ok(())
    }

    /// Checks dimensions of every transition against its source and target modes.
    pub fn validate(&self) -> Result<()> {
        for mode in &self.modes {
            if let Some(dims) = mode.dims() {
                for c in &mode.invariant {
                    if c.dims() != dims {
                        return Err(ReachError::dims(format!("invariant of mode '{}'", mode.name), dims, c.dims()));
                    }
                }
            } else if !mode.transitions.is_empty() {
                return Err(ReachError::ModelDefinition(format!(
                    "error mode '{}' has outgoing transitions",
                    mode.name
                )));
            }
        }

        for t in &self.transitions {
            let from = self.mode(t.from);
            let to = self.mode(t.to);
            let Some(from_dims) = from.dims() else {
                return Err(ReachError::ModelDefinition(format!(
                    "transition '{}' leaves error mode '{}'",
                    t.name, from.name
                )));
            };
            for c in &t.guard {
                if c.dims() != from_dims {
                    return Err(ReachError::dims(format!("guard of transition '{}'", t.name), from_dims, c.dims()));
                }
            }
            let out_dims = match &t.reset {
                Some(reset) => {
                    if reset.matrix.ncols() != from_dims {
                        return Err(ReachError::dims(
                            format!("reset columns of transition '{}'", t.name),
                            from_dims,
                            reset.matrix.ncols(),
                        ));
                    }
                    reset.matrix.nrows()
                }
                None => from_dims,
            };
            if let Some(to_dims) = to.dims() {
                if to_dims != out_dims {
                    return Err(ReachError::dims(format!("target of transition '{}'", t.name), to_dims, out_dims));
                }
            }
        }
        Ok(())
    }

    /// Flags transitions whose guard is exactly the complement of the source invariant.
    ///
    /// Returns the number of time-triggered transitions found.
    pub fn detect_tt_transitions(&mut self, tol: f64) -> usize {
        let mut count = 0;
        for i in 0..self.transitions.len() {
            let t = &self.transitions[i];
            let inv = &self.modes[t.from.index()].invariant;
            let tt = inv.len() == 1 && t.guard.len() == 1 && {
                let neg = inv[0].negate();
                allclose(&neg.coeffs, &t.guard[0].coeffs, tol) && (neg.rhs - t.guard[0].rhs).abs() <= tol
            };
            if tt {
                debug!("transition '{}' is time-triggered", t.name);
                count += 1;
            }
            self.transitions[i].time_triggered = tt;
        }
        count
    }

    /// Appends target-invariant rows to identity-reset guards when the guard does not imply them.
    ///
    /// Returns the number of rows added.
    pub fn do_guard_strengthening(&mut self, tol: f64) -> Result<usize> {
        let mut added = 0;
        for i in 0..self.transitions.len() {
            let t = &self.transitions[i];
            if t.reset.is_some() {
                continue;
            }
            let (Some(dims), Some(to_dims)) = (self.mode(t.from).dims(), self.mode(t.to).dims()) else {
                continue;
            };
            if dims != to_dims {
                continue;
            }

            let mut new_rows = Vec::new();
            for inv in self.mode(t.to).invariant.iter() {
                if !guard_implies(&t.guard, inv, dims, tol)? {
                    new_rows.push(inv.clone());
                }
            }

            if !new_rows.is_empty() {
                info!(
                    "strengthened guard of '{}' with {} invariant rows of '{}'",
                    t.name,
                    new_rows.len(),
                    self.mode(t.to).name
                );
                added += new_rows.len();
                self.transitions[i].guard.extend(new_rows);
            }
        }
        Ok(added)
    }
}

/// Checks whether every point of the guard polytope satisfies `cond`.
fn guard_implies(guard: &[LinearConstraint], cond: &LinearConstraint, dims: usize, tol: f64) -> Result<bool> {
    let mut lpi = LpInstance::new();
    lpi.add_cols((0..dims).map(|d| format!("x{}", d)));
    let (mat, rhs) = constraints_to_matrix(guard, dims);
    lpi.add_rows_less_equal(&rhs);
    lpi.set_constraints(&mat, 0, 0)?;

    let objective: Vec<(usize, f64)> = cond.coeffs.iter().enumerate().map(|(i, &c)| (i, -c)).collect();
    lpi.set_objective(&objective);
    Ok(match lpi.optimize()? {
        LpOutcome::Optimal(x) => {
            let max: f64 = cond.coeffs.iter().zip(&x).map(|(c, v)| c * v).sum();
            max <= cond.rhs + tol
        }
        LpOutcome::Infeasible => true,
        LpOutcome::Unbounded => false,
    })
}
