//! 2D projections of reachable sets for plotting.
//!
//! Along two state directions the polygon is sampled by support functions:
//! for `num_angles` evenly spaced angles the set is maximised along
//! `cos θ·x + sin θ·y` and the optimal point projected. When one axis is time,
//! the projection is the rectangle spanned by the set's time interval and its
//! extent along the other axis.

use std::f64::consts::PI;

use crate::error::{ReachError, Result};
use crate::lp::LpInstance;
use crate::lputil::{self, Layout};

/// What a plot axis shows.
#[derive(Debug, Clone, PartialEq)]
pub enum PlotAxis {
    /// A single state variable.
    Dim(usize),
    /// A linear combination of state variables.
    Direction(Vec<f64>),
    /// Elapsed time since the start of the run.
    Time,
}

impl PlotAxis {
    fn direction(&self, dims: usize) -> Result<Option<Vec<f64>>> {
        match self {
            PlotAxis::Dim(d) if *d >= dims => Err(ReachError::dims("plot axis", dims, *d + 1)),
            PlotAxis::Dim(d) => {
                let mut v = vec![0.0; dims];
                v[*d] = 1.0;
                Ok(Some(v))
            }
            PlotAxis::Direction(v) if v.len() != dims => Err(ReachError::dims("plot axis direction", dims, v.len())),
            PlotAxis::Direction(v) => Ok(Some(v.clone())),
            PlotAxis::Time => Ok(None),
        }
    }
}

/// Polygon vertices of the set projected on `(xaxis, yaxis)`.
///
/// `time_range` is the set's `[min, max]` elapsed time. Returns an empty list
/// for an infeasible set.
pub fn get_verts(
    lpi: &mut LpInstance,
    layout: &Layout,
    xaxis: &PlotAxis,
    yaxis: &PlotAxis,
    num_angles: usize,
    time_range: (f64, f64),
    tol: f64,
) -> Result<Vec<(f64, f64)>> {
    let xdir = xaxis.direction(layout.dims)?;
    let ydir = yaxis.direction(layout.dims)?;

    let mut pts = match (xdir, ydir) {
        (Some(xd), Some(yd)) => support_polygon(lpi, layout, &xd, &yd, num_angles)?,
        (xd, yd) => {
            let xr = match xd {
                Some(d) => extent(lpi, layout, &d)?,
                None => Some(time_range),
            };
            let yr = match yd {
                Some(d) => extent(lpi, layout, &d)?,
                None => Some(time_range),
            };
            match (xr, yr) {
                (Some((x0, x1)), Some((y0, y1))) => vec![(x0, y0), (x1, y0), (x1, y1), (x0, y1)],
                _ => Vec::new(),
            }
        }
    };

    pts.dedup_by(|a, b| (a.0 - b.0).abs() <= tol && (a.1 - b.1).abs() <= tol);
    while pts.len() > 1 {
        let (first, last) = (pts[0], pts[pts.len() - 1]);
        if (first.0 - last.0).abs() <= tol && (first.1 - last.1).abs() <= tol {
            pts.pop();
        } else {
            break;
        }
    }
    Ok(pts)
}

fn extent(lpi: &mut LpInstance, layout: &Layout, dir: &[f64]) -> Result<Option<(f64, f64)>> {
    let Some(lo) = lputil::minimize_direction(lpi, layout, dir)? else {
        return Ok(None);
    };
    let hi = lputil::maximize_direction(lpi, layout, dir)?.ok_or(ReachError::Unsat)?;
    Ok(Some((lo, hi)))
}

fn support_polygon(
    lpi: &mut LpInstance,
    layout: &Layout,
    xdir: &[f64],
    ydir: &[f64],
    num_angles: usize,
) -> Result<Vec<(f64, f64)>> {
    assert!(num_angles > 0, "polygon sampling needs at least one angle");
    let cols = layout.cur_columns();
    let mut pts = Vec::with_capacity(num_angles);
    for k in 0..num_angles {
        let theta = 2.0 * PI * k as f64 / num_angles as f64;
        let (c, s) = (theta.cos(), theta.sin());
        // maximise by minimising the negated direction
        let dir: Vec<f64> = xdir.iter().zip(ydir).map(|(x, y)| -(c * x + s * y)).collect();
        let objective = layout.objective(&dir);
        let Some(point) = lpi.minimize(Some(&objective), Some(&cols), false)? else {
            return Ok(Vec::new());
        };
        let px: f64 = xdir.iter().zip(&point).map(|(a, b)| a * b).sum();
        let py: f64 = ydir.iter().zip(&point).map(|(a, b)| a * b).sum();
        pts.push((px, py));
    }
    Ok(pts)
}
