//! Polytope algebra on LP instances.
//!
//! A reachable set is an [`LpInstance`] whose columns hold a chain of symbolic
//! transformations: initial-time variables of the first mode, reset and input
//! variables, and finally the current mode's initial-time variables, its
//! current-time variables (always the right-most `dims` state columns) and,
//! with inputs, a block of total input effects.
//!
//! Where the interesting blocks live is described by a [`Layout`] value. Every
//! operation that changes the block structure returns the new layout instead
//! of mutating shared offsets, so callers always hold a layout that matches
//! the LP they hold.

use log::{debug, trace};
use nalgebra::DMatrix;
use rand::Rng;

use crate::automaton::{LinearConstraint, Mode, Reset};
use crate::error::{ReachError, Result};
use crate::lp::{LpInstance, RowKind};
use crate::types::ModeId;
use crate::utils::{allclose, norm, row_vec, single_nonzero};

/// Position of the live blocks inside an LP.
///
/// - rows `basis_mat_pos.0 .. +dims` are the equalities `BM·init - cur (+ ti) = 0`
/// - the basis matrix occupies columns `basis_mat_pos.1 .. +dims` of those rows
/// - current-time variables are columns `cur_vars_offset .. +dims`
/// - `input_effects_offsets = (row, col)`: rows `-ti + Σ M_k·u_k = 0` and the `ti` columns
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Layout {
    pub dims: usize,
    pub basis_mat_pos: (usize, usize),
    pub cur_vars_offset: usize,
    pub input_effects_offsets: Option<(usize, usize)>,
}

impl Layout {
    pub fn cur_columns(&self) -> Vec<usize> {
        (self.cur_vars_offset..self.cur_vars_offset + self.dims).collect()
    }

    /// Maps a direction over the state to a sparse objective over current-time columns.
    pub fn objective(&self, direction: &[f64]) -> Vec<(usize, f64)> {
        assert_eq!(direction.len(), self.dims, "direction has wrong dimension");
        direction
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, &v)| (self.cur_vars_offset + i, v))
            .collect()
    }
}

fn mode_dims(mode: &Mode, found: usize) -> Result<usize> {
    match mode.dims() {
        Some(dims) if dims != found => Err(ReachError::dims(format!("state of mode '{}'", mode.name()), dims, found)),
        _ => Ok(found),
    }
}

/// Builds the set `{x : lb <= x <= ub}` in the given mode.
pub fn from_box(bounds: &[(f64, f64)], mode: &Mode) -> Result<(LpInstance, Layout)> {
    let dims = bounds.len();
    let mut mat = DMatrix::zeros(2 * dims, dims);
    let mut rhs = Vec::with_capacity(2 * dims);
    for (d, &(lb, ub)) in bounds.iter().enumerate() {
        mat[(2 * d, d)] = -1.0;
        rhs.push(-lb);
        mat[(2 * d + 1, d)] = 1.0;
        rhs.push(ub);
    }
    from_constraints(&mat, &rhs, mode)
}

/// Builds the set `{x : mat·x <= rhs}` in the given mode.
///
/// Fails with [`ReachError::InfeasibleInitialSet`] if the constraints are empty.
pub fn from_constraints(mat: &DMatrix<f64>, rhs: &[f64], mode: &Mode) -> Result<(LpInstance, Layout)> {
    let dims = mode_dims(mode, mat.ncols())?;
    if mat.nrows() != rhs.len() {
        return Err(ReachError::dims("initial constraint rhs", mat.nrows(), rhs.len()));
    }
    let id = mode.id().index();
    let has_inputs = mode.has_inputs();

    let mut lpi = LpInstance::new();
    lpi.add_cols((0..dims).map(|d| format!("m{}_i{}", id, d)));
    lpi.add_cols((0..dims).map(|d| format!("m{}_c{}", id, d)));
    if has_inputs {
        lpi.add_cols((0..dims).map(|d| format!("m{}_ti{}", id, d)));
    }

    lpi.add_rows_equal_zero(dims);
    lpi.add_rows_less_equal(rhs);

    let ident = DMatrix::<f64>::identity(dims, dims);
    lpi.set_constraints(&ident, 0, 0)?;
    lpi.set_constraints(&(-&ident), 0, dims)?;
    if has_inputs {
        lpi.set_constraints(&ident, 0, 2 * dims)?;
    }
    lpi.set_constraints(mat, dims, 0)?;

    let input_effects_offsets = if has_inputs {
        let row = lpi.num_rows();
        lpi.add_rows_equal_zero(dims);
        lpi.set_constraints(&(-&ident), row, 2 * dims)?;
        Some((row, 2 * dims))
    } else {
        None
    };

    if !lpi.is_feasible()? {
        return Err(ReachError::InfeasibleInitialSet);
    }

    let layout = Layout {
        dims,
        basis_mat_pos: (0, 0),
        cur_vars_offset: dims,
        input_effects_offsets,
    };
    Ok((lpi, layout))
}

/// Rewrites the basis equalities so that `cur = basis_mat·init (+ ti)`.
pub fn set_basis_matrix(lpi: &mut LpInstance, layout: &Layout, basis_mat: &DMatrix<f64>) -> Result<()> {
    let dims = layout.dims;
    if basis_mat.nrows() != dims || basis_mat.ncols() != dims {
        return Err(ReachError::dims("basis matrix", dims, basis_mat.nrows().max(basis_mat.ncols())));
    }
    let (row, col) = layout.basis_mat_pos;
    for r in 0..dims {
        let mut entries: Vec<(usize, f64)> = (0..dims).map(|c| (col + c, basis_mat[(r, c)])).collect();
        entries.push((layout.cur_vars_offset + r, -1.0));
        if let Some((_, ie_col)) = layout.input_effects_offsets {
            entries.push((ie_col + r, 1.0));
        }
        lpi.set_row(row + r, &entries)?;
    }
    Ok(())
}

/// Reads the current basis matrix back from the LP.
pub fn get_basis_matrix(lpi: &LpInstance, layout: &Layout) -> Result<DMatrix<f64>> {
    let (row, col) = layout.basis_mat_pos;
    lpi.dense_block(row, col, layout.dims, layout.dims)
}

/// Appends one step's input variables `u` with `input_mat·u` added to the total input effect.
pub fn add_input_effects_matrix(
    lpi: &mut LpInstance,
    layout: &Layout,
    input_mat: &DMatrix<f64>,
    mode: &Mode,
) -> Result<()> {
    let inputs = mode
        .inputs()
        .ok_or_else(|| ReachError::ModelDefinition(format!("mode '{}' has no inputs", mode.name())))?;
    let (ie_row, _) = layout
        .input_effects_offsets
        .ok_or_else(|| ReachError::ModelDefinition("LP has no input effects block".to_string()))?;
    if input_mat.nrows() != layout.dims || input_mat.ncols() != inputs.num_inputs() {
        return Err(ReachError::dims("input effects matrix", inputs.num_inputs(), input_mat.ncols()));
    }

    let pre_cols = lpi.num_cols();
    let pre_rows = lpi.num_rows();
    let id = mode.id().index();
    lpi.add_cols((0..inputs.num_inputs()).map(|i| format!("m{}_I{}", id, i)));
    lpi.add_rows_less_equal(&inputs.u_rhs);

    lpi.set_constraints(input_mat, ie_row, pre_cols)?;
    lpi.set_constraints(&inputs.u_constraints, pre_rows, pre_cols)?;
    Ok(())
}

/// Checks whether some point of the set satisfies `cond`.
///
/// Only the objective is touched; the constraint system is unchanged. The test
/// is `min cond.coeffs·x <= cond.rhs + tol`, so boundary contact counts as an
/// intersection.
pub fn check_intersection(lpi: &mut LpInstance, layout: &Layout, cond: &LinearConstraint, tol: f64) -> Result<bool> {
    let objective = layout.objective(&cond.coeffs);
    if objective.is_empty() {
        return Ok(0.0 <= cond.rhs + tol);
    }
    let cols: Vec<usize> = objective.iter().map(|&(c, _)| c).collect();
    let res = lpi.minimize(Some(&objective), Some(&cols), true)?.ok_or(ReachError::Unsat)?;
    let value: f64 = objective.iter().zip(&res).map(|(&(_, c), v)| c * v).sum();
    trace!("check_intersection: min = {}, rhs = {}", value, cond.rhs);
    Ok(value <= cond.rhs + tol)
}

/// Maximum of `direction·cur` over the set, `None` if infeasible.
pub fn maximize_direction(lpi: &mut LpInstance, layout: &Layout, direction: &[f64]) -> Result<Option<f64>> {
    let negated: Vec<f64> = direction.iter().map(|v| -v).collect();
    Ok(minimize_direction(lpi, layout, &negated)?.map(|v| -v))
}

/// Minimum of `direction·cur` over the set, `None` if infeasible.
pub fn minimize_direction(lpi: &mut LpInstance, layout: &Layout, direction: &[f64]) -> Result<Option<f64>> {
    let objective = layout.objective(direction);
    if objective.is_empty() {
        return Ok(if lpi.is_feasible()? { Some(0.0) } else { None });
    }
    let cols: Vec<usize> = objective.iter().map(|&(c, _)| c).collect();
    Ok(lpi
        .minimize(Some(&objective), Some(&cols), false)?
        .map(|res| objective.iter().zip(&res).map(|(&(_, c), v)| c * v).sum()))
}

/// Row entries for `direction·(basis_mat·init + Σ ie_k·u_k)`.
fn init_constraint_entries(
    layout: &Layout,
    direction: &[f64],
    basis_mat: &DMatrix<f64>,
    input_effects_list: Option<&[DMatrix<f64>]>,
) -> Result<Vec<(usize, f64)>> {
    let dims = layout.dims;
    if direction.len() != dims {
        return Err(ReachError::dims("init constraint direction", dims, direction.len()));
    }
    let (_, basis_col) = layout.basis_mat_pos;
    let mut entries = Vec::new();
    for c in 0..dims {
        let v: f64 = (0..dims).map(|r| direction[r] * basis_mat[(r, c)]).sum();
        entries.push((basis_col + c, v));
    }

    if let Some(list) = input_effects_list.filter(|l| !l.is_empty()) {
        let (_, ie_col) = layout
            .input_effects_offsets
            .ok_or_else(|| ReachError::ModelDefinition("input effects without an input block".to_string()))?;
        let mut offset = ie_col + dims;
        for mat in list {
            for c in 0..mat.ncols() {
                let v: f64 = (0..dims).map(|r| direction[r] * mat[(r, c)]).sum();
                entries.push((offset + c, v));
            }
            offset += mat.ncols();
        }
    }
    Ok(entries)
}

/// Adds `direction·cur <= rhs`, re-expressed over the persistent initial-time and input variables.
///
/// Returns the index of the new row.
pub fn add_init_constraint(
    lpi: &mut LpInstance,
    layout: &Layout,
    direction: &[f64],
    rhs: f64,
    basis_mat: &DMatrix<f64>,
    input_effects_list: Option<&[DMatrix<f64>]>,
) -> Result<usize> {
    let entries = init_constraint_entries(layout, direction, basis_mat, input_effects_list)?;
    let row = lpi.num_rows();
    lpi.add_rows_less_equal(&[rhs]);
    lpi.set_row(row, &entries)?;
    Ok(row)
}

/// Adds the constraint, overwriting `old_row` in place if the new one subsumes it.
///
/// The old row is flipped (with `rhs + tol` so that an identical candidate
/// counts as subsuming) and the candidate added; an infeasible combination
/// means the candidate alone is at least as strong. Returns `(row, is_stronger)`
/// where `row` is the row now holding the candidate.
#[allow(clippy::too_many_arguments)]
pub fn try_replace_init_constraint(
    lpi: &mut LpInstance,
    layout: &Layout,
    old_row: usize,
    direction: &[f64],
    rhs: f64,
    basis_mat: &DMatrix<f64>,
    input_effects_list: Option<&[DMatrix<f64>]>,
    tol: f64,
) -> Result<(usize, bool)> {
    let old = lpi.row(old_row)?.clone();
    if old.kind != RowKind::LessEqual {
        return Err(ReachError::ModelDefinition(format!("row {} is not an inequality", old_row)));
    }

    let gap = tol * (1.0 + old.rhs.abs());
    lpi.flip_row(old_row)?;
    lpi.set_row_rhs(old_row, old.rhs + gap)?;
    let new_row = add_init_constraint(lpi, layout, direction, rhs, basis_mat, input_effects_list)?;
    let sat = lpi.is_feasible();
    lpi.flip_row(old_row)?;
    lpi.set_row_rhs(old_row, old.rhs)?;

    if sat? {
        return Ok((new_row, false));
    }

    let entries: Vec<(usize, f64)> = lpi.row(new_row)?.coeffs.iter().map(|(&c, &v)| (c, v)).collect();
    lpi.delete_row(new_row)?;
    lpi.set_row(old_row, &entries)?;
    lpi.set_row_rhs(old_row, rhs)?;
    Ok((old_row, true))
}

/// Adds `mat·cur <= rhs` rows (used for guards).
pub fn add_curtime_constraints(lpi: &mut LpInstance, layout: &Layout, mat: &DMatrix<f64>, rhs: &[f64]) -> Result<()> {
    if mat.ncols() != layout.dims {
        return Err(ReachError::dims("current-time constraints", layout.dims, mat.ncols()));
    }
    if mat.nrows() != rhs.len() {
        return Err(ReachError::dims("current-time constraint rhs", mat.nrows(), rhs.len()));
    }
    let row = lpi.num_rows();
    lpi.add_rows_less_equal(rhs);
    lpi.set_constraints(mat, row, layout.cur_vars_offset)?;
    Ok(())
}

/// Appends a discrete reset `new_init = R·cur + M·y`, `C·y <= rhs`, and fresh variables of the target mode.
///
/// `R` may be non-square, so the target may have a different number of dimensions.
pub fn add_reset_variables(
    lpi: &mut LpInstance,
    layout: &Layout,
    mode_id: ModeId,
    transition_index: usize,
    reset: Option<&Reset>,
    successor_has_inputs: bool,
) -> Result<Layout> {
    let old_dims = layout.dims;
    let cols = lpi.num_cols();
    let rows = lpi.num_rows();

    let reset_mat = match reset {
        Some(r) => r.matrix.clone(),
        None => DMatrix::identity(old_dims, old_dims),
    };
    if reset_mat.ncols() != old_dims {
        return Err(ReachError::dims("reset matrix columns", old_dims, reset_mat.ncols()));
    }
    let new_dims = reset_mat.nrows();
    let mink = reset.and_then(|r| r.minkowski.as_ref());
    let min_vars = mink.map_or(0, |m| m.matrix.ncols());

    let id = mode_id.index();
    let mut names: Vec<String> = (0..min_vars).map(|k| format!("reset{}", k)).collect();
    names.push(format!("m{}_i0_t{}", id, transition_index));
    names.extend((1..new_dims).map(|d| format!("m{}_i{}", id, d)));
    names.extend((0..new_dims).map(|d| format!("m{}_c{}", id, d)));
    if successor_has_inputs {
        names.extend((0..new_dims).map(|d| format!("m{}_ti{}", id, d)));
    }
    lpi.add_cols(names);

    let init_col = cols + min_vars;
    let cur_col = init_col + new_dims;
    let ti_col = cur_col + new_dims;

    lpi.add_rows_equal_zero(2 * new_dims);
    if let Some(m) = mink {
        lpi.add_rows_less_equal(&m.rhs);
    }

    for r in 0..new_dims {
        let mut entries: Vec<(usize, f64)> = (0..old_dims)
            .map(|c| (layout.cur_vars_offset + c, reset_mat[(r, c)]))
            .collect();
        if let Some(m) = mink {
            entries.extend((0..min_vars).map(|k| (cols + k, m.matrix[(r, k)])));
        }
        entries.push((init_col + r, -1.0));
        lpi.set_row(rows + r, &entries)?;

        let mut entries = vec![(init_col + r, 1.0), (cur_col + r, -1.0)];
        if successor_has_inputs {
            entries.push((ti_col + r, 1.0));
        }
        lpi.set_row(rows + new_dims + r, &entries)?;
    }

    if let Some(m) = mink {
        lpi.set_constraints(&m.constraints, rows + 2 * new_dims, cols)?;
    }

    let input_effects_offsets = if successor_has_inputs {
        let ie_row = lpi.num_rows();
        lpi.add_rows_equal_zero(new_dims);
        for r in 0..new_dims {
            lpi.set_row(ie_row + r, &[(ti_col + r, -1.0)])?;
        }
        Some((ie_row, ti_col))
    } else {
        None
    };

    Ok(Layout {
        dims: new_dims,
        basis_mat_pos: (rows + new_dims, init_col),
        cur_vars_offset: cur_col,
        input_effects_offsets,
    })
}

/// Per-dimension `(min, max)` of the current-time variables.
pub fn get_box_bounds(lpi: &mut LpInstance, layout: &Layout) -> Result<Vec<(f64, f64)>> {
    let mut bounds = Vec::with_capacity(layout.dims);
    for d in 0..layout.dims {
        let mut dir = vec![0.0; layout.dims];
        dir[d] = 1.0;
        let lo = minimize_direction(lpi, layout, &dir)?.ok_or(ReachError::Unsat)?;
        let hi = maximize_direction(lpi, layout, &dir)?.ok_or(ReachError::Unsat)?;
        bounds.push((lo, hi));
    }
    Ok(bounds)
}

/// Center of the bounding box of the current-time variables.
pub fn get_box_center(lpi: &mut LpInstance, layout: &Layout) -> Result<Vec<f64>> {
    Ok(get_box_bounds(lpi, layout)?.into_iter().map(|(lo, hi)| (lo + hi) / 2.0).collect())
}

fn check_finite(values: &[f64], what: &str) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ReachError::NumericalDirection(format!("{} contains non-finite values", what)))
    }
}

/// Projects out `basis` from `v` and normalises it; `None` if it collapses below `tol`.
fn orthonormal_extension(basis: &[Vec<f64>], mut v: Vec<f64>, tol: f64) -> Result<Option<Vec<f64>>> {
    for prev in basis {
        let d: f64 = prev.iter().zip(&v).map(|(a, b)| a * b).sum();
        for (x, p) in v.iter_mut().zip(prev) {
            *x -= p * d;
        }
    }
    let n = norm(&v);
    if !n.is_finite() {
        return Err(ReachError::NumericalDirection("direction norm is not finite".to_string()));
    }
    if n < tol {
        return Ok(None);
    }
    Ok(Some(v.into_iter().map(|x| x / n).collect()))
}

/// A fresh vector not yet covered: the first unit vector whose dimension no
/// basis vector touches, otherwise a random one.
fn fill_vector<R: Rng + ?Sized>(basis: &[Vec<f64>], dims: usize, rng: &mut R, tol: f64) -> Vec<f64> {
    for d in 0..dims {
        if basis.iter().all(|v| v[d].abs() <= tol) {
            let mut e = vec![0.0; dims];
            e[d] = 1.0;
            return e;
        }
    }
    (0..dims).map(|_| rng.random::<f64>()).collect()
}

/// Builds `dims` orthonormal directions from the dynamics sampled at `point`.
///
/// The first direction is `A·point`, each next one is `A` applied to the
/// previous; when the Krylov sequence collapses, unused unit vectors and then
/// random vectors from `rng` fill the rest.
pub fn make_direction_matrix<R: Rng + ?Sized>(
    point: &[f64],
    a_matrix: &DMatrix<f64>,
    rng: &mut R,
    tol: f64,
) -> Result<DMatrix<f64>> {
    let dims = point.len();
    if a_matrix.nrows() != dims || a_matrix.ncols() != dims {
        return Err(ReachError::dims("direction sampling dynamics", dims, a_matrix.nrows()));
    }
    check_finite(point, "sample point")?;

    let mut rv: Vec<Vec<f64>> = Vec::with_capacity(dims);
    let mut cur: Option<Vec<f64>> = Some(point.to_vec());
    while rv.len() < dims {
        let candidate = match cur.take() {
            Some(v) => (0..dims).map(|r| (0..dims).map(|c| a_matrix[(r, c)] * v[c]).sum()).collect(),
            None => fill_vector(&rv, dims, rng, tol),
        };
        if let Some(v) = orthonormal_extension(&rv, candidate, tol)? {
            rv.push(v.clone());
            cur = Some(v);
        }
    }
    debug!("direction matrix from point {:?}: {} rows", point, rv.len());
    Ok(DMatrix::from_fn(dims, dims, |r, c| rv[r][c]))
}

/// Turns the rows of `mat` into `dims` orthonormal directions, in order,
/// dropping dependent rows and filling up like [`make_direction_matrix`].
pub fn reorthogonalize_matrix<R: Rng + ?Sized>(
    mat: &DMatrix<f64>,
    dims: usize,
    rng: &mut R,
    tol: f64,
) -> Result<DMatrix<f64>> {
    if mat.ncols() != dims {
        return Err(ReachError::dims("reorthogonalized matrix", dims, mat.ncols()));
    }
    let mut rv: Vec<Vec<f64>> = Vec::with_capacity(dims);
    for r in 0..mat.nrows() {
        if rv.len() == dims {
            break;
        }
        let v = row_vec(mat, r);
        check_finite(&v, "direction")?;
        if let Some(v) = orthonormal_extension(&rv, v, tol)? {
            rv.push(v);
        }
    }
    while rv.len() < dims {
        let v = fill_vector(&rv, dims, rng, tol);
        if let Some(v) = orthonormal_extension(&rv, v, tol)? {
            rv.push(v);
        }
    }
    Ok(DMatrix::from_fn(dims, dims, |r, c| rv[r][c]))
}

/// Template directions kept for aggregation: nonzero and pairwise distinct
/// after normalisation. A direction and its negation bound the same slab, so
/// only the first of the two is kept.
fn distinct_directions(directions: &DMatrix<f64>, tol: f64) -> Vec<Vec<f64>> {
    let mut kept: Vec<Vec<f64>> = Vec::new();
    let mut normalized: Vec<Vec<f64>> = Vec::new();
    for r in 0..directions.nrows() {
        let d = row_vec(directions, r);
        let n = norm(&d);
        if n < tol {
            continue;
        }
        let unit: Vec<f64> = d.iter().map(|x| x / n).collect();
        let negated: Vec<f64> = unit.iter().map(|x| -x).collect();
        if normalized.iter().any(|u| allclose(u, &unit, tol) || allclose(u, &negated, tol)) {
            continue;
        }
        normalized.push(unit);
        kept.push(d);
    }
    kept
}

/// Template-polytope over-approximation of the union of the given sets.
///
/// Each direction is minimised and maximised over every input; the result is a
/// clone of the middle input (keeping its history columns) with fresh
/// variables appended: `agg{k}` for each direction that is not a box direction,
/// then `snap{d}` (initial-time) and `snap_c{d}` (current-time) state variables.
pub fn aggregate(
    inputs: &mut [(&mut LpInstance, Layout)],
    directions: &DMatrix<f64>,
    mode: &Mode,
    tol: f64,
) -> Result<(LpInstance, Layout)> {
    assert!(inputs.len() > 1, "expected more than one set to aggregate");
    let dims = mode_dims(mode, inputs[0].1.dims)?;
    for (_, layout) in inputs.iter() {
        if layout.dims != dims {
            return Err(ReachError::dims("aggregated set", dims, layout.dims));
        }
    }
    if directions.ncols() != dims {
        return Err(ReachError::dims("aggregation directions", dims, directions.ncols()));
    }

    let dirs = distinct_directions(directions, tol);
    let mut bounds = Vec::with_capacity(dirs.len());
    for dir in &dirs {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for (lpi, layout) in inputs.iter_mut() {
            lo = lo.min(minimize_direction(lpi, layout, dir)?.ok_or(ReachError::Unsat)?);
            hi = hi.max(maximize_direction(lpi, layout, dir)?.ok_or(ReachError::Unsat)?);
        }
        bounds.push((lo, hi));
    }

    let middle = inputs.len() / 2;
    let mut lpi = inputs[middle].0.clone();
    let cols = lpi.num_cols();
    let rows = lpi.num_rows();
    let has_inputs = mode.has_inputs();

    let general: Vec<usize> = (0..dirs.len()).filter(|&i| single_nonzero(&dirs[i], 0.0).is_none()).collect();
    let snap_col = cols + general.len();
    let snap_c_col = snap_col + dims;
    let ti_col = snap_c_col + dims;

    lpi.add_cols((0..general.len()).map(|k| format!("agg{}", k)));
    lpi.add_cols((0..dims).map(|d| format!("snap{}", d)));
    lpi.add_cols((0..dims).map(|d| format!("snap_c{}", d)));
    if has_inputs {
        lpi.add_cols((0..dims).map(|d| format!("snap_ti{}", d)));
    }

    lpi.add_rows_equal_zero(dims);
    for d in 0..dims {
        let mut entries = vec![(snap_col + d, 1.0), (snap_c_col + d, -1.0)];
        if has_inputs {
            entries.push((ti_col + d, 1.0));
        }
        lpi.set_row(rows + d, &entries)?;
    }

    let def_row = lpi.num_rows();
    lpi.add_rows_equal_zero(general.len());
    for (k, &i) in general.iter().enumerate() {
        let mut entries = vec![(cols + k, 1.0)];
        entries.extend(dirs[i].iter().enumerate().filter(|(_, &v)| v != 0.0).map(|(j, &v)| (snap_col + j, -v)));
        lpi.set_row(def_row + k, &entries)?;
    }

    for (i, dir) in dirs.iter().enumerate() {
        let (lo, hi) = bounds[i];
        let upper: Vec<(usize, f64)> = match general.iter().position(|&g| g == i) {
            Some(k) => vec![(cols + k, 1.0)],
            None => dir.iter().enumerate().filter(|(_, &v)| v != 0.0).map(|(j, &v)| (snap_col + j, v)).collect(),
        };
        let lower: Vec<(usize, f64)> = upper.iter().map(|&(c, v)| (c, -v)).collect();
        let row = lpi.num_rows();
        lpi.add_rows_less_equal(&[hi, -lo]);
        lpi.set_row(row, &upper)?;
        lpi.set_row(row + 1, &lower)?;
    }

    let input_effects_offsets = if has_inputs {
        let ie_row = lpi.num_rows();
        lpi.add_rows_equal_zero(dims);
        for d in 0..dims {
            lpi.set_row(ie_row + d, &[(ti_col + d, -1.0)])?;
        }
        Some((ie_row, ti_col))
    } else {
        None
    };

    debug!(
        "aggregated {} sets along {} directions ({} non-box)",
        inputs.len(),
        dirs.len(),
        general.len()
    );

    Ok((
        lpi,
        Layout {
            dims,
            basis_mat_pos: (rows, snap_col),
            cur_vars_offset: snap_c_col,
            input_effects_offsets,
        },
    ))
}

/// Exact convex hull of the union of the given sets.
///
/// Each input is copied into homogenised variables `h{i}_*` scaled by a weight
/// `h{i}_lambda >= 0` (rhs `b` becomes `b·lambda`), the weights sum to one and
/// the new state is the sum of the copies' current-time variables.
pub fn aggregate_chull(inputs: &[(&LpInstance, Layout)], mode: &Mode) -> Result<(LpInstance, Layout)> {
    assert!(inputs.len() > 1, "expected more than one set to aggregate");
    let dims = mode_dims(mode, inputs[0].1.dims)?;
    for (_, layout) in inputs {
        if layout.dims != dims {
            return Err(ReachError::dims("convex hull input", dims, layout.dims));
        }
    }
    let has_inputs = mode.has_inputs();

    let mut lpi = LpInstance::new();
    let mut lambda_cols = Vec::with_capacity(inputs.len());
    let mut cur_cols = Vec::with_capacity(inputs.len());

    for (i, (src, layout)) in inputs.iter().enumerate() {
        let lambda = lpi.num_cols();
        lpi.add_cols([format!("h{}_lambda", i)]);
        let offset = lpi.num_cols();
        lpi.add_cols(src.names().iter().map(|n| format!("h{}_{}", i, n)));
        lambda_cols.push(lambda);
        cur_cols.push(offset + layout.cur_vars_offset);

        for row in src.rows() {
            let (sign, kind) = match row.kind {
                RowKind::GreaterEqual => (-1.0, RowKind::LessEqual),
                kind => (1.0, kind),
            };
            let mut entries: Vec<(usize, f64)> = row.coeffs.iter().map(|(&c, &v)| (offset + c, sign * v)).collect();
            if row.rhs != 0.0 {
                entries.push((lambda, -sign * row.rhs));
            }
            let r = lpi.num_rows();
            match kind {
                RowKind::Equal => lpi.add_rows_equal_zero(1),
                _ => lpi.add_rows_less_equal(&[0.0]),
            }
            lpi.set_row(r, &entries)?;
        }

        let r = lpi.num_rows();
        lpi.add_rows_less_equal(&[0.0]);
        lpi.set_row(r, &[(lambda, -1.0)])?;
    }

    let r = lpi.num_rows();
    lpi.add_rows_equal(&[1.0]);
    let weights: Vec<(usize, f64)> = lambda_cols.iter().map(|&c| (c, 1.0)).collect();
    lpi.set_row(r, &weights)?;

    let snap_col = lpi.num_cols();
    let snap_c_col = snap_col + dims;
    let ti_col = snap_c_col + dims;
    lpi.add_cols((0..dims).map(|d| format!("snap{}", d)));
    lpi.add_cols((0..dims).map(|d| format!("snap_c{}", d)));
    if has_inputs {
        lpi.add_cols((0..dims).map(|d| format!("snap_ti{}", d)));
    }

    let sum_row = lpi.num_rows();
    lpi.add_rows_equal_zero(dims);
    for d in 0..dims {
        let mut entries = vec![(snap_col + d, 1.0)];
        entries.extend(cur_cols.iter().map(|&c| (c + d, -1.0)));
        lpi.set_row(sum_row + d, &entries)?;
    }

    let basis_row = lpi.num_rows();
    lpi.add_rows_equal_zero(dims);
    for d in 0..dims {
        let mut entries = vec![(snap_col + d, 1.0), (snap_c_col + d, -1.0)];
        if has_inputs {
            entries.push((ti_col + d, 1.0));
        }
        lpi.set_row(basis_row + d, &entries)?;
    }

    let input_effects_offsets = if has_inputs {
        let ie_row = lpi.num_rows();
        lpi.add_rows_equal_zero(dims);
        for d in 0..dims {
            lpi.set_row(ie_row + d, &[(ti_col + d, -1.0)])?;
        }
        Some((ie_row, ti_col))
    } else {
        None
    };

    Ok((
        lpi,
        Layout {
            dims,
            basis_mat_pos: (basis_row, snap_col),
            cur_vars_offset: snap_c_col,
            input_effects_offsets,
        },
    ))
}

/// Whether `{x : mat·x <= rhs}` is non-empty.
pub fn is_feasible(mat: &DMatrix<f64>, rhs: &[f64]) -> Result<bool> {
    if mat.nrows() != rhs.len() {
        return Err(ReachError::dims("constraint rhs", mat.nrows(), rhs.len()));
    }
    let mut lpi = LpInstance::new();
    lpi.add_cols((0..mat.ncols()).map(|d| format!("x{}", d)));
    lpi.add_rows_less_equal(rhs);
    lpi.set_constraints(mat, 0, 0)?;
    lpi.is_feasible()
}

/// Whether a point (over current-time variables) lies in the set, within `tol`.
pub fn contains_point(lpi: &LpInstance, layout: &Layout, point: &[f64], tol: f64) -> Result<bool> {
    if point.len() != layout.dims {
        return Err(ReachError::dims("point", layout.dims, point.len()));
    }
    let mut copy = lpi.clone();
    let mut mat = DMatrix::zeros(2 * layout.dims, layout.dims);
    let mut rhs = Vec::with_capacity(2 * layout.dims);
    for (d, &v) in point.iter().enumerate() {
        mat[(2 * d, d)] = 1.0;
        rhs.push(v + tol);
        mat[(2 * d + 1, d)] = -1.0;
        rhs.push(-v + tol);
    }
    add_curtime_constraints(&mut copy, layout, &mat, &rhs)?;
    copy.is_feasible()
}
