//! Aggregation strategies.
//!
//! A strategy decides which waiting-list entries are popped together, how a
//! group of popped sets is merged, and whether an aggregated error should be
//! refined by deaggregating one of its ancestors.
//!
//! - [`Unaggregated`]: pop one entry at a time, in insertion order. Never over-approximates.
//! - [`Aggregated`]: pick the best entry by a [`PopPolicy`] score, then merge it
//!   with every other entry in the same mode (and, optionally, reached through the
//!   same transition out of the same node).

use std::fmt;

use log::trace;
use petgraph::graph::NodeIndex;

use crate::aggdag::AggDag;
use crate::automaton::HybridAutomaton;
use crate::error::Result;
use crate::lp::LpInstance;
use crate::lputil::{self, Layout};

/// Template used to over-approximate a group of sets.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AggKind {
    /// Axis-aligned bounding box.
    Box,
    /// Directions sampled from the predecessor's dynamics at the transition point,
    /// mapped through the reset, plus the box directions.
    ArnoldiBox,
    /// Exact convex hull.
    ConvexHull,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AggType {
    pub kind: AggKind,
    /// Also bound along the rows of the incoming guard.
    pub add_guard: bool,
}

impl AggType {
    pub fn new(kind: AggKind) -> Self {
        AggType { kind, add_guard: false }
    }

    pub fn with_guard(self, add_guard: bool) -> Self {
        AggType { add_guard, ..self }
    }
}

impl Default for AggType {
    fn default() -> Self {
        AggType::new(AggKind::Box)
    }
}

/// Which waiting-list entry is popped first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum PopPolicy {
    /// Smallest minimum number of steps since the start.
    #[default]
    LowestMinTime,
    /// Smallest average number of steps since the start.
    LowestAvgTime,
    /// Largest maximum number of steps since the start.
    LargestMaxTime,
}

impl PopPolicy {
    /// Higher is better.
    fn score(self, steps: [usize; 2]) -> i64 {
        let (lo, hi) = (steps[0] as i64, steps[1] as i64);
        match self {
            PopPolicy::LowestMinTime => -lo,
            PopPolicy::LowestAvgTime => -(lo + hi),
            PopPolicy::LargestMaxTime => hi,
        }
    }
}

pub trait AggregationStrategy: fmt::Debug {
    /// Indices of the waiting-list entries to pop together.
    ///
    /// Must return at least one index when the waiting list is non-empty.
    fn pop_waiting_list(&self, ha: &HybridAutomaton, aggdag: &AggDag) -> Vec<usize>;

    /// How popped groups with more than one entry are merged.
    fn agg_type(&self) -> AggType;

    /// Node to deaggregate before the next pop, if any.
    fn get_deagg_node(&self, _ha: &HybridAutomaton, _aggdag: &AggDag) -> Option<NodeIndex> {
        None
    }

    /// Point in the predecessor mode recorded with each transition, used to
    /// sample aggregation directions. `lpi` is the set intersected with the guard.
    fn premode_center(&self, _lpi: &mut LpInstance, _layout: &Layout) -> Result<Option<Vec<f64>>> {
        Ok(None)
    }
}

/// Pops the oldest entry, alone.
#[derive(Debug, Clone, Default)]
pub struct Unaggregated;

impl AggregationStrategy for Unaggregated {
    fn pop_waiting_list(&self, _ha: &HybridAutomaton, aggdag: &AggDag) -> Vec<usize> {
        if aggdag.waiting_list.is_empty() {
            Vec::new()
        } else {
            vec![0]
        }
    }

    fn agg_type(&self) -> AggType {
        AggType::default()
    }
}

#[derive(Debug, Clone)]
pub struct Aggregated {
    pub agg_type: AggType,
    pub pop_policy: PopPolicy,
    pub require_same_path: bool,
    /// Refine aggregated errors by splitting an ancestor aggregation.
    pub deaggregate: bool,
    /// Split the aggregation closest to the error first (otherwise the one closest to the roots).
    pub deagg_leaves_first: bool,
}

impl Default for Aggregated {
    fn default() -> Self {
        Aggregated {
            agg_type: AggType::default(),
            pop_policy: PopPolicy::default(),
            require_same_path: true,
            deaggregate: false,
            deagg_leaves_first: true,
        }
    }
}

impl Aggregated {
    pub fn new(agg_type: AggType) -> Self {
        Aggregated {
            agg_type,
            ..Default::default()
        }
    }

    pub fn with_pop_policy(mut self, pop_policy: PopPolicy) -> Self {
        self.pop_policy = pop_policy;
        self
    }

    pub fn with_same_path(mut self, require_same_path: bool) -> Self {
        self.require_same_path = require_same_path;
        self
    }

    pub fn with_deaggregation(mut self, deaggregate: bool, leaves_first: bool) -> Self {
        self.deaggregate = deaggregate;
        self.deagg_leaves_first = leaves_first;
        self
    }

    fn same_path(aggdag: &AggDag, a: usize, b: usize) -> bool {
        let (ea, eb) = (&aggdag.waiting_list[a], &aggdag.waiting_list[b]);
        match (ea.op, eb.op) {
            (None, None) => true,
            (Some(x), Some(y)) => {
                let (ox, oy) = (aggdag.op(x), aggdag.op(y));
                ox.parent_node == oy.parent_node && ox.transition == oy.transition
            }
            _ => false,
        }
    }
}

impl AggregationStrategy for Aggregated {
    fn pop_waiting_list(&self, ha: &HybridAutomaton, aggdag: &AggDag) -> Vec<usize> {
        let wl = &aggdag.waiting_list;
        let key = |i: usize| {
            let e = &wl[i];
            (self.pop_policy.score(e.state.cur_steps_since_start), ha.mode(e.state.mode).name())
        };

        // best score first, ties to the smaller mode name, then to the older entry
        let Some(best) = (0..wl.len()).min_by(|&a, &b| {
            let (sa, na) = key(a);
            let (sb, nb) = key(b);
            sb.cmp(&sa).then_with(|| na.cmp(nb))
        }) else {
            return Vec::new();
        };

        if wl[best].exact {
            return vec![best];
        }

        let mode = wl[best].state.mode;
        let picked: Vec<usize> = (0..wl.len())
            .filter(|&i| {
                i == best
                    || (!wl[i].exact
                        && wl[i].state.mode == mode
                        && (!self.require_same_path || Self::same_path(aggdag, best, i)))
            })
            .collect();
        trace!("popping {} of {} waiting entries in {}", picked.len(), wl.len(), mode);
        picked
    }

    fn agg_type(&self) -> AggType {
        self.agg_type
    }

    fn get_deagg_node(&self, ha: &HybridAutomaton, aggdag: &AggDag) -> Option<NodeIndex> {
        if !self.deaggregate {
            return None;
        }
        let entry = aggdag
            .waiting_list
            .iter()
            .find(|e| !e.state.is_concrete && ha.mode(e.state.mode).is_error())?;
        let op = entry.op?;

        let mut ancestors = aggdag.ancestors(aggdag.op(op).parent_node);
        if !self.deagg_leaves_first {
            ancestors.reverse();
        }
        ancestors.into_iter().find(|&n| {
            let node = aggdag.node(n);
            node.parent_ops.len() > 1 && !node.deaggregated
        })
    }

    fn premode_center(&self, lpi: &mut LpInstance, layout: &Layout) -> Result<Option<Vec<f64>>> {
        match self.agg_type.kind {
            AggKind::ArnoldiBox => Ok(Some(lputil::get_box_center(lpi, layout)?)),
            _ => Ok(None),
        }
    }
}
