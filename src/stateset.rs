//! Symbolic reachable sets.
//!
//! A [`StateSet`] owns one [`LpInstance`] and the [`Layout`] describing it,
//! plus the bookkeeping needed to keep stepping it: the basis matrix of the
//! current step, the input-effect matrices added so far and the cached row of
//! every invariant condition.

use log::{debug, trace};
use nalgebra::DMatrix;
use petgraph::graph::NodeIndex;

use crate::automaton::{LinearConstraint, Mode};
use crate::error::{ReachError, Result};
use crate::lp::LpInstance;
use crate::lputil::{self, Layout};
use crate::time_elapse::TimeElapse;
use crate::types::{ModeId, OpId, TransitionId};
use crate::verts::{self, PlotAxis};

/// How a set came into existence.
#[derive(Debug, Clone, PartialEq)]
pub enum Predecessor {
    /// Produced by a single discrete transition out of `parent_node`.
    Transition {
        parent_node: NodeIndex,
        transition: TransitionId,
        op: OpId,
    },
    /// Produced by merging the successors of several transition operations.
    /// `None` stands for an initial state.
    Aggregation { ops: Vec<Option<OpId>> },
}

/// One invariant condition written into a set's LP during a continuous step.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvariantCut {
    pub step: usize,
    pub i_index: usize,
    pub is_stronger: bool,
}

/// Outcome of [`StateSet::intersect_invariant`].
#[derive(Debug, Clone, Default)]
pub struct InvariantOutcome {
    pub feasible: bool,
    pub cuts: Vec<InvariantCut>,
}

#[derive(Debug, Clone)]
struct VertsCache {
    xaxis: PlotAxis,
    yaxis: PlotAxis,
    verts: Vec<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct StateSet {
    pub mode: ModeId,
    pub lpi: LpInstance,
    pub layout: Layout,
    pub cur_step_in_mode: usize,
    /// `[min, max]` number of steps since the start of the run.
    pub cur_steps_since_start: [usize; 2],
    /// Whether the set is exact, i.e. no aggregation happened on its history.
    pub is_concrete: bool,
    pub predecessor: Option<Predecessor>,
    basis_matrix: DMatrix<f64>,
    input_effects_list: Option<Vec<DMatrix<f64>>>,
    invariant_constraint_rows: Vec<Option<usize>>,
    verts: Option<VertsCache>,
}

impl StateSet {
    /// Wraps an LP whose basis rows currently hold the identity.
    pub fn new(lpi: LpInstance, layout: Layout, mode: &Mode) -> Result<Self> {
        if let Some(dims) = mode.dims() {
            if dims != layout.dims {
                return Err(ReachError::dims(format!("state of mode '{}'", mode.name()), dims, layout.dims));
            }
        }
        if mode.has_inputs() != layout.input_effects_offsets.is_some() {
            return Err(ReachError::ModelDefinition(format!(
                "input block of state does not match mode '{}'",
                mode.name()
            )));
        }
        Ok(StateSet {
            mode: mode.id(),
            lpi,
            layout,
            cur_step_in_mode: 0,
            cur_steps_since_start: [0, 0],
            is_concrete: true,
            predecessor: None,
            basis_matrix: DMatrix::identity(layout.dims, layout.dims),
            input_effects_list: mode.has_inputs().then(Vec::new),
            invariant_constraint_rows: vec![None; mode.invariant().len()],
            verts: None,
        })
    }

    pub fn from_box(bounds: &[(f64, f64)], mode: &Mode) -> Result<Self> {
        let (lpi, layout) = lputil::from_box(bounds, mode)?;
        StateSet::new(lpi, layout, mode)
    }

    pub fn from_constraints(mat: &DMatrix<f64>, rhs: &[f64], mode: &Mode) -> Result<Self> {
        let (lpi, layout) = lputil::from_constraints(mat, rhs, mode)?;
        StateSet::new(lpi, layout, mode)
    }

    pub fn dims(&self) -> usize {
        self.layout.dims
    }

    pub fn basis_matrix(&self) -> &DMatrix<f64> {
        &self.basis_matrix
    }

    pub fn input_effects_list(&self) -> Option<&[DMatrix<f64>]> {
        self.input_effects_list.as_deref()
    }

    /// Advances the set by one step.
    pub fn step(&mut self, elapser: &mut dyn TimeElapse, mode: &Mode) -> Result<()> {
        self.step_to(self.cur_step_in_mode + 1, elapser, mode)
    }

    /// Advances the set to `step_in_mode`.
    ///
    /// # Panics
    ///
    /// Panics if `step_in_mode` is before the current step: input effects are
    /// accumulated and cannot be taken back.
    pub fn step_to(&mut self, step_in_mode: usize, elapser: &mut dyn TimeElapse, mode: &Mode) -> Result<()> {
        assert!(
            step_in_mode >= self.cur_step_in_mode,
            "cannot step backwards from {} to {}",
            self.cur_step_in_mode,
            step_in_mode
        );
        assert_eq!(mode.id(), self.mode, "stepping with the dynamics of another mode");

        let delta = step_in_mode - self.cur_step_in_mode;
        if delta == 0 {
            return Ok(());
        }

        for step in self.cur_step_in_mode + 1..=step_in_mode {
            if self.input_effects_list.is_none() {
                break;
            }
            let (_, input_effects) = elapser.get_basis_matrix(step)?;
            let input_effects = input_effects.ok_or_else(|| {
                ReachError::ModelDefinition(format!("time elapse of '{}' returned no input effects", mode.name()))
            })?;
            lputil::add_input_effects_matrix(&mut self.lpi, &self.layout, &input_effects, mode)?;
            if let Some(list) = self.input_effects_list.as_mut() {
                list.push(input_effects);
            }
        }

        let (basis_matrix, _) = elapser.get_basis_matrix(step_in_mode)?;
        lputil::set_basis_matrix(&mut self.lpi, &self.layout, &basis_matrix)?;
        self.basis_matrix = basis_matrix;

        self.cur_step_in_mode = step_in_mode;
        self.cur_steps_since_start[0] += delta;
        self.cur_steps_since_start[1] += delta;
        self.verts = None;

        trace!(
            "stepped state in {} to step {} (since start {:?})",
            self.mode,
            step_in_mode,
            self.cur_steps_since_start
        );
        Ok(())
    }

    /// Intersects the set with the mode invariant.
    ///
    /// Each invariant row that the set might violate is written as an
    /// initial-time constraint, replacing the row written for it earlier when
    /// the new one subsumes it. Returns whether the set is still non-empty and
    /// which rows were written.
    pub fn intersect_invariant(&mut self, mode: &Mode, tol: f64) -> Result<InvariantOutcome> {
        assert_eq!(mode.id(), self.mode, "intersecting with the invariant of another mode");
        let mut cuts = Vec::new();

        for (i, inv) in mode.invariant().iter().enumerate() {
            if !lputil::check_intersection(&mut self.lpi, &self.layout, &inv.negate(), tol)? {
                continue;
            }

            let (row, is_stronger) = match self.invariant_constraint_rows[i] {
                None => {
                    let row = lputil::add_init_constraint(
                        &mut self.lpi,
                        &self.layout,
                        &inv.coeffs,
                        inv.rhs,
                        &self.basis_matrix,
                        self.input_effects_list.as_deref(),
                    )?;
                    (row, true)
                }
                Some(old_row) => lputil::try_replace_init_constraint(
                    &mut self.lpi,
                    &self.layout,
                    old_row,
                    &inv.coeffs,
                    inv.rhs,
                    &self.basis_matrix,
                    self.input_effects_list.as_deref(),
                    tol,
                )?,
            };
            self.invariant_constraint_rows[i] = Some(row);
            self.verts = None;
            cuts.push(InvariantCut {
                step: self.cur_step_in_mode,
                i_index: i,
                is_stronger,
            });

            if !self.lpi.is_feasible()? {
                debug!("state in {} left invariant row {} at step {}", self.mode, i, self.cur_step_in_mode);
                return Ok(InvariantOutcome { feasible: false, cuts });
            }
        }

        Ok(InvariantOutcome { feasible: true, cuts })
    }

    /// Forgets which rows hold invariant conditions, so the next intersection adds fresh rows.
    pub fn reset_invariant_rows(&mut self) {
        self.invariant_constraint_rows.iter_mut().for_each(|r| *r = None);
    }

    /// Checks whether some point of the set satisfies `cond`.
    pub fn intersects(&mut self, cond: &LinearConstraint, tol: f64) -> Result<bool> {
        lputil::check_intersection(&mut self.lpi, &self.layout, cond, tol)
    }

    pub fn is_feasible(&mut self) -> Result<bool> {
        self.lpi.is_feasible()
    }

    pub fn box_bounds(&mut self) -> Result<Vec<(f64, f64)>> {
        lputil::get_box_bounds(&mut self.lpi, &self.layout)
    }

    pub fn box_center(&mut self) -> Result<Vec<f64>> {
        lputil::get_box_center(&mut self.lpi, &self.layout)
    }

    pub fn contains_point(&self, point: &[f64], tol: f64) -> Result<bool> {
        lputil::contains_point(&self.lpi, &self.layout, point, tol)
    }

    /// Polygon of the set projected on the two axes, cached until the set changes.
    pub fn verts(
        &mut self,
        xaxis: &PlotAxis,
        yaxis: &PlotAxis,
        num_angles: usize,
        step_size: f64,
        tol: f64,
    ) -> Result<Vec<(f64, f64)>> {
        if let Some(cache) = &self.verts {
            if &cache.xaxis == xaxis && &cache.yaxis == yaxis {
                return Ok(cache.verts.clone());
            }
        }
        let time_range = (
            self.cur_steps_since_start[0] as f64 * step_size,
            self.cur_steps_since_start[1] as f64 * step_size,
        );
        let verts = verts::get_verts(&mut self.lpi, &self.layout, xaxis, yaxis, num_angles, time_range, tol)?;
        self.verts = Some(VertsCache {
            xaxis: xaxis.clone(),
            yaxis: yaxis.clone(),
            verts: verts.clone(),
        });
        Ok(verts)
    }
}
