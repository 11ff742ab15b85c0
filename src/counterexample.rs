//! Counterexample traces decoded from an LP solution.
//!
//! The LP of a concrete set names its columns after the path that produced
//! it, so one feasible point of the set intersected with an error guard
//! can be read back segment by segment:
//!
//! - `m{id}_i{d}` starts a segment in mode `id` (at `d = 0`) and holds its start point;
//!   a `_t{k}` suffix means it was entered through the previous mode's `k`-th outgoing transition
//! - `m{id}_c{d}` is the segment's end point
//! - `m{id}_I{k}` are one step's inputs (`k = 0` opens a new step)
//! - `reset{k}` are the Minkowski variables of the transition leaving the segment

use std::fmt;

use crate::automaton::HybridAutomaton;
use crate::error::{ReachError, Result};
use crate::types::{ModeId, TransitionId};

#[derive(Debug, Clone, PartialEq)]
pub struct CounterExampleSegment {
    pub mode: ModeId,
    pub start: Vec<f64>,
    pub end: Vec<f64>,
    /// Transition taken at the end of the segment.
    pub outgoing_transition: Option<TransitionId>,
    /// Minkowski variables of the outgoing transition's reset.
    pub reset_minkowski_vars: Vec<f64>,
    /// Inputs of each step, in time order.
    pub inputs: Vec<Vec<f64>>,
}

impl CounterExampleSegment {
    fn new(mode: ModeId) -> Self {
        CounterExampleSegment {
            mode,
            start: Vec::new(),
            end: Vec::new(),
            outgoing_transition: None,
            reset_minkowski_vars: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

/// Splits `m{id}_{rest}` into the mode index and `rest`.
fn split_mode_prefix(name: &str) -> Option<(usize, &str)> {
    let rest = name.strip_prefix('m')?;
    let (id, rest) = rest.split_once('_')?;
    Some((id.parse().ok()?, rest))
}

/// Decodes the trace from column `names` and their `values`.
///
/// `error_transition` is the transition into the error mode that ends the trace.
pub fn make_counterexample(
    ha: &HybridAutomaton,
    names: &[String],
    values: &[f64],
    error_transition: TransitionId,
) -> Result<Vec<CounterExampleSegment>> {
    if names.len() != values.len() {
        return Err(ReachError::dims("counterexample point", names.len(), values.len()));
    }
    let mut segments: Vec<CounterExampleSegment> = Vec::new();

    for (name, &value) in names.iter().zip(values) {
        if name.starts_with("reset") {
            if let Some(seg) = segments.last_mut() {
                seg.reset_minkowski_vars.push(value);
            }
            continue;
        }
        let Some((mode_index, rest)) = split_mode_prefix(name) else {
            continue;
        };

        if let Some(var) = rest.strip_prefix("ti") {
            if var.parse::<usize>().is_ok() {
                continue;
            }
        }

        if let Some(var) = rest.strip_prefix('i') {
            let (dim, transition) = match var.split_once("_t") {
                Some((d, t)) => (d, Some(t)),
                None => (var, None),
            };
            let Ok(dim) = dim.parse::<usize>() else {
                continue;
            };
            if dim == 0 {
                if let (Some(k), Some(prev)) = (transition, segments.last_mut()) {
                    let k: usize = k
                        .parse()
                        .map_err(|_| ReachError::ModelDefinition(format!("malformed column name '{}'", name)))?;
                    let outgoing = ha.mode(prev.mode).transitions();
                    let tid = outgoing.get(k).copied().ok_or_else(|| {
                        ReachError::ModelDefinition(format!("column '{}' refers to a missing transition", name))
                    })?;
                    prev.outgoing_transition = Some(tid);
                }
                segments.push(CounterExampleSegment::new(ModeId::new(mode_index)));
            }
            if let Some(seg) = segments.last_mut() {
                seg.start.push(value);
            }
        } else if let Some(var) = rest.strip_prefix('c') {
            if var.parse::<usize>().is_ok() {
                if let Some(seg) = segments.last_mut() {
                    seg.end.push(value);
                }
            }
        } else if let Some(var) = rest.strip_prefix('I') {
            let Ok(k) = var.parse::<usize>() else {
                continue;
            };
            if let Some(seg) = segments.last_mut() {
                // the most recent step's inputs are appended last but act first
                if k == 0 || seg.inputs.is_empty() {
                    seg.inputs.insert(0, Vec::new());
                }
                seg.inputs[0].push(value);
            }
        }
    }

    if let Some(last) = segments.last_mut() {
        last.outgoing_transition = Some(error_transition);
    }
    Ok(segments)
}

/// Formats a whole trace, one segment per line.
pub fn format_counterexample(ha: &HybridAutomaton, segments: &[CounterExampleSegment]) -> String {
    segments
        .iter()
        .map(|seg| {
            let via = seg
                .outgoing_transition
                .map(|t| ha.transition(t).name().to_string())
                .unwrap_or_else(|| "-".to_string());
            format!("{} -> '{}'", seg, via)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl fmt::Display for CounterExampleSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?} -> {:?}", self.mode, self.start, self.end)?;
        if !self.reset_minkowski_vars.is_empty() {
            write!(f, ", reset vars {:?}", self.reset_minkowski_vars)?;
        }
        if !self.inputs.is_empty() {
            write!(f, ", {} input steps", self.inputs.len())?;
        }
        Ok(())
    }
}
