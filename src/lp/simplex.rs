//! Dense two-phase primal simplex.
//!
//! Every structural variable is free and is split as `x = x⁺ - x⁻`. Rows are
//! normalised to a non-negative right-hand side; `≤`/`≥` rows get a slack, and
//! rows whose slack cannot start in the basis get an artificial variable.
//! Phase one minimises the sum of artificials, phase two the real objective.
//!
//! The solver is stateless: each call builds a fresh tableau (a cold start).

use log::trace;

use super::{Row, RowKind};

/// Minimum magnitude of a pivot element.
const PIVOT_TOL: f64 = 1e-9;
/// Reduced costs above `-COST_TOL` are treated as non-improving.
const COST_TOL: f64 = 1e-9;
/// Phase-one residual (relative to the largest rhs) accepted as feasible.
const FEAS_TOL: f64 = 1e-11;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PivotRule {
    /// Most negative reduced cost. Fast, but may cycle on degenerate vertices.
    Dantzig,
    /// Smallest eligible index. Slower, never cycles.
    Bland,
}

#[derive(Debug, Clone)]
pub(crate) enum SimplexOutcome {
    Optimal(Vec<f64>),
    Infeasible,
    Unbounded,
}

#[derive(Debug, Clone)]
pub(crate) struct SimplexFailure {
    pub reason: String,
}

#[derive(Debug)]
pub(crate) struct Solved {
    pub outcome: SimplexOutcome,
    pub iterations: usize,
}

enum PhaseEnd {
    Optimal,
    Unbounded,
}

struct Tableau {
    /// `m` rows of `ncols + 1` entries; the last entry is the rhs.
    data: Vec<Vec<f64>>,
    basis: Vec<usize>,
    ncols: usize,
    /// Columns at or beyond this index are artificial.
    art_start: usize,
    rule: PivotRule,
    iterations: usize,
    max_iterations: usize,
}

impl Tableau {
    fn build(rows: &[Row], num_vars: usize, rule: PivotRule) -> Self {
        let m = rows.len();
        let mut next = 2 * num_vars;

        let mut slack_of_row = vec![None; m];
        for (i, row) in rows.iter().enumerate() {
            if row.kind != RowKind::Equal {
                slack_of_row[i] = Some(next);
                next += 1;
            }
        }
        let art_start = next;

        let signs: Vec<f64> = rows.iter().map(|r| if r.rhs < 0.0 { -1.0 } else { 1.0 }).collect();

        // A row can start with its slack basic only if the slack keeps a +1 coefficient.
        let mut basis = vec![0; m];
        let mut art_of_row = vec![None; m];
        for (i, row) in rows.iter().enumerate() {
            let slack_coeff = match row.kind {
                RowKind::LessEqual => signs[i],
                RowKind::GreaterEqual => -signs[i],
                RowKind::Equal => 0.0,
            };
            match slack_of_row[i] {
                Some(s) if slack_coeff > 0.0 => basis[i] = s,
                _ => {
                    art_of_row[i] = Some(next);
                    basis[i] = next;
                    next += 1;
                }
            }
        }
        let ncols = next;

        let mut data = Vec::with_capacity(m);
        for (i, row) in rows.iter().enumerate() {
            let sign = signs[i];
            let mut line = vec![0.0; ncols + 1];
            for (&col, &val) in &row.coeffs {
                line[2 * col] += sign * val;
                line[2 * col + 1] -= sign * val;
            }
            if let Some(s) = slack_of_row[i] {
                line[s] = match row.kind {
                    RowKind::LessEqual => sign,
                    RowKind::GreaterEqual => -sign,
                    RowKind::Equal => 0.0,
                };
            }
            if let Some(a) = art_of_row[i] {
                line[a] = 1.0;
            }
            line[ncols] = sign * row.rhs;
            data.push(line);
        }

        let max_iterations = match rule {
            PivotRule::Dantzig => 20 * (m + ncols) + 200,
            PivotRule::Bland => 200 * (m + ncols) + 2000,
        };

        Tableau {
            data,
            basis,
            ncols,
            art_start,
            rule,
            iterations: 0,
            max_iterations,
        }
    }

    fn pivot(&mut self, p: usize, q: usize, z: &mut [f64]) {
        let piv = self.data[p][q];
        for v in self.data[p].iter_mut() {
            *v /= piv;
        }
        let prow = self.data[p].clone();
        for (i, line) in self.data.iter_mut().enumerate() {
            if i == p {
                continue;
            }
            let f = line[q];
            if f != 0.0 {
                for (v, pv) in line.iter_mut().zip(&prow) {
                    *v -= f * pv;
                }
            }
        }
        let f = z[q];
        if f != 0.0 {
            for (v, pv) in z.iter_mut().zip(&prow) {
                *v -= f * pv;
            }
        }
        self.basis[p] = q;
    }

    fn reduced_costs(&self, cost: &[f64]) -> Vec<f64> {
        let mut z = cost.to_vec();
        z.push(0.0);
        for (i, line) in self.data.iter().enumerate() {
            let cb = cost[self.basis[i]];
            if cb != 0.0 {
                for (v, lv) in z.iter_mut().zip(line) {
                    *v -= cb * lv;
                }
            }
        }
        z
    }

    fn entering(&self, z: &[f64], allowed: usize) -> Option<usize> {
        match self.rule {
            PivotRule::Bland => (0..allowed).find(|&j| z[j] < -COST_TOL),
            PivotRule::Dantzig => {
                let mut best: Option<usize> = None;
                for j in 0..allowed {
                    if z[j] < -COST_TOL && best.map_or(true, |b| z[j] < z[b]) {
                        best = Some(j);
                    }
                }
                best
            }
        }
    }

    fn leaving(&self, q: usize) -> Option<usize> {
        let rhs = self.ncols;
        let mut best: Option<(usize, f64)> = None;
        for (i, line) in self.data.iter().enumerate() {
            let a = line[q];
            if a <= PIVOT_TOL {
                continue;
            }
            let ratio = line[rhs].max(0.0) / a;
            best = match best {
                None => Some((i, ratio)),
                Some((b, r)) => {
                    if ratio < r - 1e-12 || (ratio <= r + 1e-12 && self.basis[i] < self.basis[b]) {
                        Some((i, ratio))
                    } else {
                        Some((b, r))
                    }
                }
            };
        }
        best.map(|(i, _)| i)
    }

    fn run_phase(&mut self, cost: &[f64], allowed: usize) -> Result<PhaseEnd, SimplexFailure> {
        let mut z = self.reduced_costs(cost);
        loop {
            let Some(q) = self.entering(&z, allowed) else {
                return Ok(PhaseEnd::Optimal);
            };
            let Some(p) = self.leaving(q) else {
                return Ok(PhaseEnd::Unbounded);
            };
            self.pivot(p, q, &mut z);
            self.iterations += 1;
            if self.iterations > self.max_iterations {
                return Err(SimplexFailure {
                    reason: format!("iteration limit {} reached with {:?} pricing", self.max_iterations, self.rule),
                });
            }
        }
    }

    /// Phase one. Returns `false` if the system is infeasible.
    fn find_feasible_basis(&mut self, max_abs_rhs: f64) -> Result<bool, SimplexFailure> {
        if self.art_start == self.ncols {
            return Ok(true);
        }
        let cost: Vec<f64> = (0..self.ncols).map(|j| if j >= self.art_start { 1.0 } else { 0.0 }).collect();
        if let PhaseEnd::Unbounded = self.run_phase(&cost, self.ncols)? {
            return Err(SimplexFailure {
                reason: "phase one reported an unbounded ray".to_string(),
            });
        }

        let rhs = self.ncols;
        let residual: f64 = self
            .data
            .iter()
            .zip(&self.basis)
            .filter(|(_, &b)| b >= self.art_start)
            .map(|(line, _)| line[rhs].abs())
            .sum();
        if residual > FEAS_TOL * (1.0 + max_abs_rhs) {
            trace!("phase one residual {:e}: infeasible", residual);
            return Ok(false);
        }

        // Drive the remaining (zero-valued) artificials out of the basis.
        let mut z = vec![0.0; self.ncols + 1];
        let mut p = 0;
        while p < self.data.len() {
            if self.basis[p] < self.art_start {
                p += 1;
                continue;
            }
            let q = (0..self.art_start).find(|&j| self.data[p][j].abs() > PIVOT_TOL);
            match q {
                Some(q) => {
                    self.pivot(p, q, &mut z);
                    p += 1;
                }
                None => {
                    // Redundant row.
                    self.data.remove(p);
                    self.basis.remove(p);
                }
            }
        }
        Ok(true)
    }

    fn values(&self, num_vars: usize) -> Vec<f64> {
        let rhs = self.ncols;
        let mut raw = vec![0.0; 2 * num_vars];
        for (line, &b) in self.data.iter().zip(&self.basis) {
            if b < raw.len() {
                raw[b] = line[rhs];
            }
        }
        (0..num_vars).map(|j| raw[2 * j] - raw[2 * j + 1]).collect()
    }
}

/// Solves `min objective·x` subject to `rows`, all variables free.
///
/// With `objective = None` only phase one runs and any feasible point is returned.
pub(crate) fn solve(
    rows: &[Row],
    num_vars: usize,
    objective: Option<&[(usize, f64)]>,
    rule: PivotRule,
) -> Result<Solved, SimplexFailure> {
    let mut tab = Tableau::build(rows, num_vars, rule);
    let max_abs_rhs = rows.iter().map(|r| r.rhs.abs()).fold(0.0, f64::max);

    if !tab.find_feasible_basis(max_abs_rhs)? {
        return Ok(Solved {
            outcome: SimplexOutcome::Infeasible,
            iterations: tab.iterations,
        });
    }

    if let Some(objective) = objective.filter(|o| !o.is_empty()) {
        let mut cost = vec![0.0; tab.ncols];
        for &(col, val) in objective {
            cost[2 * col] += val;
            cost[2 * col + 1] -= val;
        }
        let allowed = tab.art_start;
        if let PhaseEnd::Unbounded = tab.run_phase(&cost, allowed)? {
            return Ok(Solved {
                outcome: SimplexOutcome::Unbounded,
                iterations: tab.iterations,
            });
        }
    }

    Ok(Solved {
        outcome: SimplexOutcome::Optimal(tab.values(num_vars)),
        iterations: tab.iterations,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use test_log::test;

    use super::*;

    fn row(coeffs: &[(usize, f64)], kind: RowKind, rhs: f64) -> Row {
        Row {
            coeffs: coeffs.iter().copied().collect::<BTreeMap<_, _>>(),
            kind,
            rhs,
        }
    }

    fn optimal(solved: Solved) -> Vec<f64> {
        match solved.outcome {
            SimplexOutcome::Optimal(x) => x,
            other => panic!("expected optimal, got {:?}", other),
        }
    }

    #[test]
    fn test_box_minimum() {
        // 1 <= x <= 3, -2 <= y <= 5
        let rows = vec![
            row(&[(0, 1.0)], RowKind::LessEqual, 3.0),
            row(&[(0, -1.0)], RowKind::LessEqual, -1.0),
            row(&[(1, 1.0)], RowKind::LessEqual, 5.0),
            row(&[(1, -1.0)], RowKind::LessEqual, 2.0),
        ];
        for rule in [PivotRule::Dantzig, PivotRule::Bland] {
            let x = optimal(solve(&rows, 2, Some(&[(0, 1.0), (1, -1.0)]), rule).unwrap());
            assert!((x[0] - 1.0).abs() < 1e-9, "x = {:?}", x);
            assert!((x[1] - 5.0).abs() < 1e-9, "x = {:?}", x);
        }
    }

    #[test]
    fn test_equality_and_ge() {
        // x + y = 4, x >= 1, y >= 1, minimize x
        let rows = vec![
            row(&[(0, 1.0), (1, 1.0)], RowKind::Equal, 4.0),
            row(&[(0, 1.0)], RowKind::GreaterEqual, 1.0),
            row(&[(1, 1.0)], RowKind::GreaterEqual, 1.0),
        ];
        let x = optimal(solve(&rows, 2, Some(&[(0, 1.0)]), PivotRule::Dantzig).unwrap());
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_infeasible() {
        let rows = vec![
            row(&[(0, 1.0)], RowKind::LessEqual, 1.0),
            row(&[(0, 1.0)], RowKind::GreaterEqual, 2.0),
        ];
        let solved = solve(&rows, 1, None, PivotRule::Dantzig).unwrap();
        assert!(matches!(solved.outcome, SimplexOutcome::Infeasible));
    }

    #[test]
    fn test_unbounded() {
        let rows = vec![row(&[(0, 1.0)], RowKind::LessEqual, 1.0)];
        let solved = solve(&rows, 1, Some(&[(0, 1.0)]), PivotRule::Bland).unwrap();
        assert!(matches!(solved.outcome, SimplexOutcome::Unbounded));
    }

    #[test]
    fn test_redundant_equalities() {
        // x - y = 0 twice, 0 <= x <= 2, maximize y
        let rows = vec![
            row(&[(0, 1.0), (1, -1.0)], RowKind::Equal, 0.0),
            row(&[(0, 2.0), (1, -2.0)], RowKind::Equal, 0.0),
            row(&[(0, 1.0)], RowKind::LessEqual, 2.0),
            row(&[(0, -1.0)], RowKind::LessEqual, 0.0),
            row(&[], RowKind::Equal, 0.0),
        ];
        let x = optimal(solve(&rows, 2, Some(&[(1, -1.0)]), PivotRule::Dantzig).unwrap());
        assert!((x[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_rows() {
        let x = optimal(solve(&[], 3, None, PivotRule::Dantzig).unwrap());
        assert_eq!(x, vec![0.0; 3]);
    }
}
