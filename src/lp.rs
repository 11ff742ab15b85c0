//! The LP oracle.
//!
//! [`LpInstance`] is a linear program over free, named columns with sparse
//! rows of kind `=`, `≤` or `≥`. It supports the incremental operations the
//! polytope layer needs (append columns and rows, overwrite a rectangular
//! block, replace/flip/delete a single row) and direction minimisation.
//!
//! Solving is delegated to the dense simplex in [`simplex`]. A numerical
//! failure (iteration limit) is retried once from a cold basis with Bland's
//! rule; a second failure is a [`ReachError::SolverFailure`].

pub mod simplex;

use std::collections::BTreeMap;
use std::fmt;

use log::{trace, warn};
use nalgebra::DMatrix;

use crate::error::{ReachError, Result};
use simplex::{PivotRule, SimplexOutcome};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RowKind {
    Equal,
    LessEqual,
    GreaterEqual,
}

/// A single sparse constraint row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub coeffs: BTreeMap<usize, f64>,
    pub kind: RowKind,
    pub rhs: f64,
}

impl Row {
    fn empty(kind: RowKind, rhs: f64) -> Self {
        Row {
            coeffs: BTreeMap::new(),
            kind,
            rhs,
        }
    }

    pub fn get(&self, col: usize) -> f64 {
        self.coeffs.get(&col).copied().unwrap_or(0.0)
    }

    fn set(&mut self, col: usize, value: f64) {
        if value == 0.0 {
            self.coeffs.remove(&col);
        } else {
            self.coeffs.insert(col, value);
        }
    }
}

/// Result of an optimisation that is allowed to be unbounded.
#[derive(Debug, Clone)]
pub enum LpOutcome {
    Optimal(Vec<f64>),
    Infeasible,
    Unbounded,
}

/// Solver counters, kept per instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct LpStats {
    pub solves: usize,
    pub iterations: usize,
    pub retries: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LpInstance {
    names: Vec<String>,
    rows: Vec<Row>,
    objective: Vec<(usize, f64)>,
    stats: LpStats,
}

impl LpInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_cols(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn stats(&self) -> LpStats {
        self.stats
    }

    pub fn row(&self, i: usize) -> Result<&Row> {
        self.rows.get(i).ok_or(ReachError::RowOutOfRange {
            row: i,
            rows: self.rows.len(),
        })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Appends free variables with the given names.
    pub fn add_cols<S: Into<String>>(&mut self, names: impl IntoIterator<Item = S>) {
        self.names.extend(names.into_iter().map(Into::into));
    }

    pub fn add_rows_equal_zero(&mut self, n: usize) {
        self.rows.extend((0..n).map(|_| Row::empty(RowKind::Equal, 0.0)));
    }

    pub fn add_rows_equal(&mut self, rhs: &[f64]) {
        self.rows.extend(rhs.iter().map(|&b| Row::empty(RowKind::Equal, b)));
    }

    pub fn add_rows_less_equal(&mut self, rhs: &[f64]) {
        self.rows.extend(rhs.iter().map(|&b| Row::empty(RowKind::LessEqual, b)));
    }

    /// Overwrites a rectangular region of the constraint matrix.
    ///
    /// Zero entries of `block` clear the corresponding coefficients.
    pub fn set_constraints(&mut self, block: &DMatrix<f64>, row_offset: usize, col_offset: usize) -> Result<()> {
        if row_offset + block.nrows() > self.num_rows() || col_offset + block.ncols() > self.num_cols() {
            return Err(ReachError::ConstraintsOutOfBounds {
                row_offset,
                col_offset,
                block_rows: block.nrows(),
                block_cols: block.ncols(),
                lp_rows: self.num_rows(),
                lp_cols: self.num_cols(),
            });
        }
        for r in 0..block.nrows() {
            let row = &mut self.rows[row_offset + r];
            for c in 0..block.ncols() {
                row.set(col_offset + c, block[(r, c)]);
            }
        }
        Ok(())
    }

    /// Replaces every coefficient of row `i` with the given entries.
    pub fn set_row(&mut self, i: usize, entries: &[(usize, f64)]) -> Result<()> {
        let num_cols = self.num_cols();
        let num_rows = self.num_rows();
        let row = self.rows.get_mut(i).ok_or(ReachError::RowOutOfRange { row: i, rows: num_rows })?;
        if let Some(&(col, _)) = entries.iter().find(|(c, _)| *c >= num_cols) {
            return Err(ReachError::ConstraintsOutOfBounds {
                row_offset: i,
                col_offset: col,
                block_rows: 1,
                block_cols: 1,
                lp_rows: num_rows,
                lp_cols: num_cols,
            });
        }
        row.coeffs.clear();
        for &(col, val) in entries {
            row.set(col, val);
        }
        Ok(())
    }

    pub fn set_row_rhs(&mut self, i: usize, rhs: f64) -> Result<()> {
        let rows = self.num_rows();
        let row = self.rows.get_mut(i).ok_or(ReachError::RowOutOfRange { row: i, rows })?;
        row.rhs = rhs;
        Ok(())
    }

    /// Toggles row `i` between `≤` and `≥`. Returns `true` if the row is now `≤`.
    ///
    /// Flipping an equality row is rejected.
    pub fn flip_row(&mut self, i: usize) -> Result<bool> {
        let rows = self.num_rows();
        let row = self.rows.get_mut(i).ok_or(ReachError::RowOutOfRange { row: i, rows })?;
        row.kind = match row.kind {
            RowKind::LessEqual => RowKind::GreaterEqual,
            RowKind::GreaterEqual => RowKind::LessEqual,
            RowKind::Equal => {
                return Err(ReachError::ModelDefinition(format!("cannot flip equality row {}", i)));
            }
        };
        Ok(row.kind == RowKind::LessEqual)
    }

    /// Deletes row `i`; later rows shift up by one.
    pub fn delete_row(&mut self, i: usize) -> Result<()> {
        if i >= self.num_rows() {
            return Err(ReachError::RowOutOfRange {
                row: i,
                rows: self.num_rows(),
            });
        }
        self.rows.remove(i);
        Ok(())
    }

    /// Reads back a dense block of the constraint matrix.
    pub fn dense_block(
        &self,
        row_offset: usize,
        col_offset: usize,
        nrows: usize,
        ncols: usize,
    ) -> Result<DMatrix<f64>> {
        if row_offset + nrows > self.num_rows() || col_offset + ncols > self.num_cols() {
            return Err(ReachError::ConstraintsOutOfBounds {
                row_offset,
                col_offset,
                block_rows: nrows,
                block_cols: ncols,
                lp_rows: self.num_rows(),
                lp_cols: self.num_cols(),
            });
        }
        Ok(DMatrix::from_fn(nrows, ncols, |r, c| self.rows[row_offset + r].get(col_offset + c)))
    }

    /// Sets the objective as sparse `(column, coefficient)` pairs.
    pub fn set_objective(&mut self, objective: &[(usize, f64)]) {
        self.objective = objective.iter().copied().filter(|&(_, v)| v != 0.0).collect();
    }

    fn solve(&mut self, objective: Option<Vec<(usize, f64)>>) -> Result<LpOutcome> {
        self.stats.solves += 1;
        let num_cols = self.num_cols();
        let mut last_failure = String::new();
        for (attempt, rule) in [PivotRule::Dantzig, PivotRule::Bland].into_iter().enumerate() {
            match simplex::solve(&self.rows, num_cols, objective.as_deref(), rule) {
                Ok(solved) => {
                    self.stats.iterations += solved.iterations;
                    trace!(
                        "solved LP {}x{} in {} iterations ({})",
                        self.num_rows(),
                        num_cols,
                        solved.iterations,
                        match solved.outcome {
                            SimplexOutcome::Optimal(_) => "optimal",
                            SimplexOutcome::Infeasible => "infeasible",
                            SimplexOutcome::Unbounded => "unbounded",
                        }
                    );
                    return Ok(match solved.outcome {
                        SimplexOutcome::Optimal(x) => LpOutcome::Optimal(x),
                        SimplexOutcome::Infeasible => LpOutcome::Infeasible,
                        SimplexOutcome::Unbounded => LpOutcome::Unbounded,
                    });
                }
                Err(failure) => {
                    warn!("simplex attempt {} failed: {}", attempt + 1, failure.reason);
                    self.stats.retries += 1;
                    last_failure = failure.reason;
                }
            }
        }
        Err(ReachError::SolverFailure {
            attempts: 2,
            reason: last_failure,
        })
    }

    /// Minimises the stored objective without turning unboundedness into an error.
    pub fn optimize(&mut self) -> Result<LpOutcome> {
        let objective = self.objective.clone();
        self.solve(Some(objective))
    }

    /// Minimises `objective` (or the stored objective if `None`).
    ///
    /// Returns the values of `columns` (all columns if `None`) at the optimum,
    /// `Ok(None)` on infeasibility when `fail_on_unsat` is false, and an error
    /// on infeasibility otherwise or on an unbounded objective.
    pub fn minimize(
        &mut self,
        objective: Option<&[(usize, f64)]>,
        columns: Option<&[usize]>,
        fail_on_unsat: bool,
    ) -> Result<Option<Vec<f64>>> {
        if let Some(objective) = objective {
            self.set_objective(objective);
        }
        match self.optimize()? {
            LpOutcome::Optimal(x) => Ok(Some(match columns {
                Some(cols) => cols.iter().map(|&c| x[c]).collect(),
                None => x,
            })),
            LpOutcome::Infeasible if fail_on_unsat => Err(ReachError::Unsat),
            LpOutcome::Infeasible => Ok(None),
            LpOutcome::Unbounded => Err(ReachError::Unbounded),
        }
    }

    /// Checks whether the constraint system has any solution.
    pub fn is_feasible(&mut self) -> Result<bool> {
        Ok(!matches!(self.solve(None)?, LpOutcome::Infeasible))
    }

    /// Returns some feasible point, if any.
    pub fn feasible_point(&mut self) -> Result<Option<Vec<f64>>> {
        match self.solve(None)? {
            LpOutcome::Optimal(x) => Ok(Some(x)),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for LpInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "LP with {} rows and {} cols", self.num_rows(), self.num_cols())?;
        write!(f, "{:>8}", "")?;
        for name in &self.names {
            write!(f, " {:>8}", name)?;
        }
        writeln!(f)?;
        for (i, row) in self.rows.iter().enumerate() {
            write!(f, "{:>8}", format!("r{}", i))?;
            for c in 0..self.num_cols() {
                let v = row.get(c);
                if v == 0.0 {
                    write!(f, " {:>8}", ".")?;
                } else {
                    write!(f, " {:>8.3}", v)?;
                }
            }
            let sense = match row.kind {
                RowKind::Equal => "==",
                RowKind::LessEqual => "<=",
                RowKind::GreaterEqual => ">=",
            };
            writeln!(f, " {} {}", sense, row.rhs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    /// `0 <= x <= 1`, `2 <= y <= 3`.
    fn unit_lp() -> LpInstance {
        let mut lpi = LpInstance::new();
        lpi.add_cols(["x", "y"]);
        lpi.add_rows_less_equal(&[1.0, 0.0, 3.0, -2.0]);
        let block = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, -1.0, 0.0, 0.0, 1.0, 0.0, -1.0]);
        lpi.set_constraints(&block, 0, 0).unwrap();
        lpi
    }

    #[test]
    fn test_minimize() {
        let mut lpi = unit_lp();
        let res = lpi.minimize(Some(&[(0, -1.0), (1, 1.0)]), None, true).unwrap().unwrap();
        assert!((res[0] - 1.0).abs() < 1e-9);
        assert!((res[1] - 2.0).abs() < 1e-9);

        let res = lpi.minimize(Some(&[(1, -1.0)]), Some(&[1]), true).unwrap().unwrap();
        assert_eq!(res.len(), 1);
        assert!((res[0] - 3.0).abs() < 1e-9);
        assert_eq!(lpi.stats().solves, 2);
    }

    #[test]
    fn test_set_constraints_out_of_bounds() {
        let mut lpi = unit_lp();
        let block = DMatrix::from_element(2, 2, 1.0);
        let err = lpi.set_constraints(&block, 3, 0).unwrap_err();
        assert!(matches!(err, ReachError::ConstraintsOutOfBounds { .. }));
    }

    #[test]
    fn test_flip_and_infeasible() {
        let mut lpi = unit_lp();
        assert!(lpi.is_feasible().unwrap());

        // x <= 1 becomes x >= 1; adding x <= 0.5 empties the set
        assert!(!lpi.flip_row(0).unwrap());
        lpi.add_rows_less_equal(&[0.5]);
        lpi.set_row(4, &[(0, 1.0)]).unwrap();
        assert!(!lpi.is_feasible().unwrap());
        assert_eq!(lpi.minimize(Some(&[(0, 1.0)]), None, false).unwrap(), None);
        assert!(matches!(lpi.minimize(None, None, true), Err(ReachError::Unsat)));

        assert!(lpi.flip_row(0).unwrap());
        assert!(lpi.is_feasible().unwrap());
        lpi.delete_row(4).unwrap();
        assert_eq!(lpi.num_rows(), 4);
    }

    #[test]
    fn test_flip_equality_rejected() {
        let mut lpi = LpInstance::new();
        lpi.add_cols(["x"]);
        lpi.add_rows_equal_zero(1);
        assert!(lpi.flip_row(0).is_err());
        assert!(lpi.flip_row(7).is_err());
    }

    #[test]
    fn test_unbounded_is_error() {
        let mut lpi = LpInstance::new();
        lpi.add_cols(["x"]);
        lpi.add_rows_less_equal(&[1.0]);
        lpi.set_row(0, &[(0, 1.0)]).unwrap();
        assert!(matches!(lpi.minimize(Some(&[(0, 1.0)]), None, true), Err(ReachError::Unbounded)));
        assert!(matches!(lpi.optimize().unwrap(), LpOutcome::Unbounded));
    }

    #[test]
    fn test_clone_is_independent() {
        let lpi = unit_lp();
        let mut copy = lpi.clone();
        copy.add_rows_less_equal(&[-5.0]);
        copy.set_row(4, &[(0, 1.0)]).unwrap();
        assert_eq!(lpi.num_rows(), 4);
        assert!(!copy.is_feasible().unwrap());
    }

    #[test]
    fn test_dense_block_and_display() {
        let lpi = unit_lp();
        let block = lpi.dense_block(0, 0, 2, 2).unwrap();
        assert_eq!(block, DMatrix::from_row_slice(2, 2, &[1.0, 0.0, -1.0, 0.0]));
        let text = lpi.to_string();
        assert!(text.contains("4 rows and 2 cols"));
        assert!(text.contains("<= 3"));
    }
}
