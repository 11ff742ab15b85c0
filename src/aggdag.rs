//! The aggregation DAG.
//!
//! Every popped group of waiting-list entries becomes a node. A node records
//! the transition operations that produced its constituents (its parents), the
//! operations performed while it was being stepped (invariant cuts and outgoing
//! transitions), and, when it merged more than one set, the original sets so
//! that the aggregation can be undone later.
//!
//! Nodes live in a [`petgraph`] arena and are never removed during a run. An
//! edge `parent -> child` carries the [`OpId`] of the transition operation that
//! links them.

use std::collections::{HashSet, VecDeque};

use log::{debug, info};
use nalgebra::DMatrix;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::aggstrat::{AggKind, AggType, AggregationStrategy};
use crate::automaton::HybridAutomaton;
use crate::error::{ReachError, Result};
use crate::lp::LpInstance;
use crate::lputil::{self, Layout};
use crate::stateset::{InvariantCut, Predecessor, StateSet};
use crate::types::{ModeId, OpId, TransitionId};
use crate::utils::{matrix_from_rows, row_vec};

/// A successor produced by one feasible guard check.
#[derive(Debug, Clone)]
pub struct OpTransition {
    /// Step in the source mode at which the guard was feasible.
    pub step: usize,
    pub parent_node: NodeIndex,
    /// Node that consumed the successor, once popped.
    pub child_node: Option<NodeIndex>,
    pub transition: TransitionId,
    pub premode_center: Option<Vec<f64>>,
}

/// Something that happened to a node's set while it was being stepped.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Transition(OpId),
    InvIntersect(InvariantCut),
}

#[derive(Debug, Clone)]
pub struct AggDagNode {
    pub mode: ModeId,
    pub op_list: Vec<Op>,
    /// One entry per merged set; `None` for initial states.
    pub parent_ops: Vec<Option<OpId>>,
    /// The set as it was when the node was created.
    pub state: StateSet,
    /// The sets that were merged into `state`, empty unless more than one.
    pub constituents: Vec<(StateSet, Option<OpId>)>,
    pub deaggregated: bool,
}

impl AggDagNode {
    pub fn is_aggregated(&self) -> bool {
        self.parent_ops.len() > 1
    }
}

#[derive(Debug, Clone)]
pub struct WaitingEntry {
    pub state: StateSet,
    pub op: Option<OpId>,
    /// Re-queued by deaggregation: popped alone, never merged.
    pub exact: bool,
}

#[derive(Debug, Clone)]
pub struct AggDag {
    graph: DiGraph<AggDagNode, OpId>,
    ops: Vec<OpTransition>,
    roots: Vec<NodeIndex>,
    pub waiting_list: Vec<WaitingEntry>,
    cur_node: Option<NodeIndex>,
    rng: ChaCha8Rng,
    tol: f64,
}

impl AggDag {
    pub fn new(seed: u64, tol: f64) -> Self {
        AggDag {
            graph: DiGraph::new(),
            ops: Vec::new(),
            roots: Vec::new(),
            waiting_list: Vec::new(),
            cur_node: None,
            rng: ChaCha8Rng::seed_from_u64(seed),
            tol,
        }
    }

    pub fn graph(&self) -> &DiGraph<AggDagNode, OpId> {
        &self.graph
    }

    pub fn node(&self, node: NodeIndex) -> &AggDagNode {
        &self.graph[node]
    }

    pub fn op(&self, op: OpId) -> &OpTransition {
        &self.ops[op.index()]
    }

    pub fn ops(&self) -> &[OpTransition] {
        &self.ops
    }

    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    pub fn cur_node(&self) -> Option<NodeIndex> {
        self.cur_node
    }

    pub fn add_init_state(&mut self, state: StateSet) {
        self.waiting_list.push(WaitingEntry {
            state,
            op: None,
            exact: false,
        });
    }

    /// Queues the successor of a feasible guard check of the current node.
    ///
    /// # Panics
    ///
    /// Panics if no node is being stepped.
    pub fn add_transition_successor(
        &mut self,
        state: StateSet,
        transition: TransitionId,
        step: usize,
        premode_center: Option<Vec<f64>>,
    ) -> OpId {
        let parent_node = self
            .cur_node
            .unwrap_or_else(|| panic!("transition successor without a current node"));
        let op = OpId::new(self.ops.len());
        self.ops.push(OpTransition {
            step,
            parent_node,
            child_node: None,
            transition,
            premode_center,
        });
        self.graph[parent_node].op_list.push(Op::Transition(op));
        self.waiting_list.push(WaitingEntry {
            state,
            op: Some(op),
            exact: false,
        });
        op
    }

    /// Appends invariant cuts to the current node's operation list.
    pub fn record_cuts(&mut self, cuts: &[InvariantCut]) {
        if let Some(node) = self.cur_node {
            self.graph[node].op_list.extend(cuts.iter().copied().map(Op::InvIntersect));
        }
    }

    /// Pops the entries chosen by `strategy`, merging them if there is more than one.
    ///
    /// The result becomes a new node, which is then the current node.
    ///
    /// # Panics
    ///
    /// Panics if the waiting list is empty or the strategy selects nothing.
    pub fn pop(&mut self, ha: &HybridAutomaton, strategy: &dyn AggregationStrategy) -> Result<StateSet> {
        assert!(!self.waiting_list.is_empty(), "pop from an empty waiting list");
        let mut indices = strategy.pop_waiting_list(ha, self);
        assert!(!indices.is_empty(), "aggregation strategy selected no waiting entries");
        indices.sort_unstable();
        indices.dedup();

        let mut entries: Vec<WaitingEntry> = indices.iter().rev().map(|&i| self.waiting_list.remove(i)).collect();
        entries.reverse();
        let parent_ops: Vec<Option<OpId>> = entries.iter().map(|e| e.op).collect();

        let (state, constituents) = if entries.len() == 1 {
            let mut entries = entries.into_iter();
            let Some(entry) = entries.next() else {
                unreachable!("one entry was selected");
            };
            let mut state = entry.state;
            if let Some(op) = entry.op {
                let o = &self.ops[op.index()];
                state.predecessor = Some(Predecessor::Transition {
                    parent_node: o.parent_node,
                    transition: o.transition,
                    op,
                });
            }
            (state, Vec::new())
        } else {
            let mut state = self.perform_aggregation(&mut entries, ha, strategy.agg_type())?;
            state.predecessor = Some(Predecessor::Aggregation {
                ops: parent_ops.clone(),
            });
            (state, entries.into_iter().map(|e| (e.state, e.op)).collect())
        };

        let node = self.graph.add_node(AggDagNode {
            mode: state.mode,
            op_list: Vec::new(),
            parent_ops: parent_ops.clone(),
            state: state.clone(),
            constituents,
            deaggregated: false,
        });
        for op in parent_ops.iter().flatten() {
            let parent = self.ops[op.index()].parent_node;
            self.graph.add_edge(parent, node, *op);
            self.ops[op.index()].child_node = Some(node);
        }
        if parent_ops.iter().any(Option::is_none) {
            self.roots.push(node);
        }

        debug!(
            "popped node {} in {} from {} waiting entries ({} left)",
            node.index(),
            state.mode,
            parent_ops.len(),
            self.waiting_list.len()
        );
        self.cur_node = Some(node);
        Ok(state)
    }

    /// Merges the sets of `entries` (all in one mode) into one over-approximating set.
    fn perform_aggregation(
        &mut self,
        entries: &mut [WaitingEntry],
        ha: &HybridAutomaton,
        agg_type: AggType,
    ) -> Result<StateSet> {
        let mode_id = entries[0].state.mode;
        assert!(
            entries.iter().all(|e| e.state.mode == mode_id),
            "aggregating sets of different modes"
        );
        let mode = ha.mode(mode_id);
        let dims = entries[0].state.dims();

        let steps = [
            entries.iter().map(|e| e.state.cur_steps_since_start[0]).min().unwrap_or(0),
            entries.iter().map(|e| e.state.cur_steps_since_start[1]).max().unwrap_or(0),
        ];

        let (lpi, layout) = if agg_type.kind == AggKind::ConvexHull {
            let inputs: Vec<(&LpInstance, Layout)> = entries.iter().map(|e| (&e.state.lpi, e.state.layout)).collect();
            lputil::aggregate_chull(&inputs, mode)?
        } else {
            let mut dirs: Vec<Vec<f64>> = match agg_type.kind {
                AggKind::ArnoldiBox => self.arnoldi_directions(entries, ha, dims)?,
                _ => Vec::new(),
            };
            dirs.extend((0..dims).map(|d| {
                let mut e = vec![0.0; dims];
                e[d] = 1.0;
                e
            }));
            if agg_type.add_guard {
                dirs.extend(self.guard_directions(entries, ha, dims)?);
            }
            let dirs = matrix_from_rows(&dirs, dims);

            let mut inputs: Vec<(&mut LpInstance, Layout)> =
                entries.iter_mut().map(|e| (&mut e.state.lpi, e.state.layout)).collect();
            lputil::aggregate(&mut inputs, &dirs, mode, self.tol)?
        };

        let mut state = StateSet::new(lpi, layout, mode)?;
        state.cur_steps_since_start = steps;
        state.is_concrete = false;
        info!(
            "aggregated {} sets in mode '{}' ({:?}), steps {:?}",
            entries.len(),
            mode.name(),
            agg_type.kind,
            steps
        );
        Ok(state)
    }

    /// The incoming transition's source dynamics sampled at the recorded
    /// predecessor center, mapped through the reset and made orthonormal.
    ///
    /// The center comes from the middle entry, the same one whose LP the
    /// aggregated set is built on.
    fn arnoldi_directions(
        &mut self,
        entries: &[WaitingEntry],
        ha: &HybridAutomaton,
        dims: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let found = entries[entries.len() / 2]
            .op
            .and_then(|op| self.ops[op.index()].premode_center.clone().map(|c| (op, c)));
        let Some((op, center)) = found else {
            return Ok(Vec::new());
        };

        let t = ha.transition(self.ops[op.index()].transition);
        let premode = ha.mode(t.from());
        let a = premode
            .a_matrix()
            .ok_or_else(|| ReachError::ModelDefinition(format!("mode '{}' has no dynamics", premode.name())))?;

        let pre_dirs = lputil::make_direction_matrix(&center, a, &mut self.rng, self.tol)?;
        let projected = match t.reset() {
            Some(reset) => pre_dirs * reset.matrix.transpose(),
            None => pre_dirs,
        };
        let dirs = lputil::reorthogonalize_matrix(&projected, dims, &mut self.rng, self.tol)?;
        Ok((0..dirs.nrows()).map(|r| row_vec(&dirs, r)).collect())
    }

    /// Rows of the guards of the incoming transitions, mapped through their resets.
    fn guard_directions(&self, entries: &[WaitingEntry], ha: &HybridAutomaton, dims: usize) -> Result<Vec<Vec<f64>>> {
        let mut seen = HashSet::new();
        let mut dirs = Vec::new();
        for op in entries.iter().filter_map(|e| e.op) {
            let tid = self.ops[op.index()].transition;
            if !seen.insert(tid) {
                continue;
            }
            let t = ha.transition(tid);
            for g in t.guard() {
                let row = DMatrix::from_row_slice(1, g.coeffs.len(), &g.coeffs);
                let row = match t.reset() {
                    Some(reset) => row * reset.matrix.transpose(),
                    None => row,
                };
                if row.ncols() != dims {
                    return Err(ReachError::dims("guard direction", dims, row.ncols()));
                }
                dirs.push(row_vec(&row, 0));
            }
        }
        Ok(dirs)
    }

    /// `node` and its ancestors, nearest first.
    pub fn ancestors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut visited = HashSet::from([node]);
        let mut order = Vec::new();
        let mut queue = VecDeque::from([node]);
        while let Some(n) = queue.pop_front() {
            order.push(n);
            for p in self.graph.neighbors_directed(n, Direction::Incoming) {
                if visited.insert(p) {
                    queue.push_back(p);
                }
            }
        }
        order
    }

    /// `node` and everything reachable from it.
    pub fn descendants(&self, node: NodeIndex) -> HashSet<NodeIndex> {
        let mut dfs = Dfs::new(&self.graph, node);
        let mut result = HashSet::new();
        while let Some(n) = dfs.next(&self.graph) {
            result.insert(n);
        }
        result
    }

    /// Undoes the aggregation at `node`.
    ///
    /// Waiting entries derived from `node` or its descendants are dropped and
    /// the node's constituents are queued again as exact entries. Returns
    /// whether the current node was among the dropped ones.
    pub fn deaggregate(&mut self, node: NodeIndex) -> bool {
        let descendants = self.descendants(node);
        self.graph[node].deaggregated = true;

        let before = self.waiting_list.len();
        let ops = &self.ops;
        self.waiting_list
            .retain(|e| e.op.map_or(true, |op| !descendants.contains(&ops[op.index()].parent_node)));
        let dropped = before - self.waiting_list.len();

        let dropped_cur = self.cur_node.is_some_and(|n| descendants.contains(&n));
        if dropped_cur {
            self.cur_node = None;
        }

        let constituents = self.graph[node].constituents.clone();
        info!(
            "deaggregating node {} into {} sets ({} waiting entries dropped)",
            node.index(),
            constituents.len(),
            dropped
        );
        for (state, op) in constituents {
            self.waiting_list.push(WaitingEntry { state, op, exact: true });
        }
        dropped_cur
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::aggstrat::{Aggregated, Unaggregated};
    use crate::utils::{allclose, DEFAULT_TOLERANCE as TOL};

    fn automaton() -> (HybridAutomaton, ModeId, ModeId, TransitionId) {
        let mut ha = HybridAutomaton::new("dag");
        let m = ha.new_mode("m");
        ha.set_dynamics(m, DMatrix::zeros(2, 2)).unwrap();
        let err = ha.new_mode("error");
        let t = ha.new_transition(m, err, "to_error");
        (ha, m, err, t)
    }

    fn two_init_states(ha: &HybridAutomaton, m: ModeId) -> AggDag {
        let mut dag = AggDag::new(0, TOL);
        dag.add_init_state(StateSet::from_box(&[(0.0, 1.0), (0.0, 1.0)], ha.mode(m)).unwrap());
        dag.add_init_state(StateSet::from_box(&[(2.0, 3.0), (0.0, 2.0)], ha.mode(m)).unwrap());
        dag
    }

    #[test]
    fn test_unaggregated_pops_one() {
        let (ha, m, _, _) = automaton();
        let mut dag = two_init_states(&ha, m);

        let state = dag.pop(&ha, &Unaggregated).unwrap();
        assert!(state.is_concrete);
        assert_eq!(dag.waiting_list.len(), 1);
        assert_eq!(dag.roots().len(), 1);
        assert!(!dag.node(dag.cur_node().unwrap()).is_aggregated());
    }

    #[test]
    fn test_box_aggregation() {
        let (ha, m, _, _) = automaton();
        let mut dag = two_init_states(&ha, m);

        let mut state = dag.pop(&ha, &Aggregated::default()).unwrap();
        assert!(dag.waiting_list.is_empty());
        assert!(!state.is_concrete);
        assert_eq!(state.predecessor, Some(Predecessor::Aggregation { ops: vec![None, None] }));

        let bounds = state.box_bounds().unwrap();
        assert!(allclose(&[bounds[0].0, bounds[0].1], &[0.0, 3.0], 1e-9));
        assert!(allclose(&[bounds[1].0, bounds[1].1], &[0.0, 2.0], 1e-9));

        let node = dag.node(dag.cur_node().unwrap());
        assert!(node.is_aggregated());
        assert_eq!(node.constituents.len(), 2);
    }

    #[test]
    fn test_convex_hull_aggregation() {
        let (ha, m, _, _) = automaton();
        let mut dag = two_init_states(&ha, m);
        let strat = Aggregated::new(AggType::new(AggKind::ConvexHull));

        let state = dag.pop(&ha, &strat).unwrap();
        assert!(state.contains_point(&[1.5, 1.0], 1e-7).unwrap());
        // inside the bounding box, outside the hull
        assert!(!state.contains_point(&[0.0, 2.0], 1e-7).unwrap());
    }

    #[test]
    fn test_arnoldi_center_from_middle_entry() {
        let mut ha = HybridAutomaton::new("swap");
        let m1 = ha.new_mode("m1");
        ha.set_dynamics(m1, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]))
            .unwrap();
        let m2 = ha.new_mode("m2");
        ha.set_dynamics(m2, DMatrix::zeros(2, 2)).unwrap();
        let t = ha.new_transition(m1, m2, "swap");

        let mut dag = AggDag::new(0, TOL);
        dag.add_init_state(StateSet::from_box(&[(0.0, 1.0), (0.0, 1.0)], ha.mode(m1)).unwrap());
        dag.pop(&ha, &Unaggregated).unwrap();
        for (step, center) in [(1, [1.0, 0.0]), (2, [1.0, 1.0]), (3, [1.0, 0.0])] {
            let succ = StateSet::from_box(&[(0.0, 1.0), (0.0, 1.0)], ha.mode(m2)).unwrap();
            dag.add_transition_successor(succ, t, step, Some(center.to_vec()));
        }

        let entries = std::mem::take(&mut dag.waiting_list);
        let dirs = dag.arnoldi_directions(&entries, &ha, 2).unwrap();
        assert_eq!(dirs.len(), 2);
        // A·(1, 1) from the middle entry, not A·(1, 0) from the first
        let d = std::f64::consts::FRAC_1_SQRT_2;
        assert!(allclose(&dirs[0], &[d, d], 1e-9), "got {:?}", dirs[0]);
    }

    #[test]
    fn test_deaggregation() {
        let (ha, m, err, t) = automaton();
        let mut dag = two_init_states(&ha, m);
        let strat = Aggregated::default().with_deaggregation(true, true);

        let state = dag.pop(&ha, &strat).unwrap();
        let root = dag.cur_node().unwrap();

        let mut lpi = state.lpi.clone();
        let layout = lputil::add_reset_variables(&mut lpi, &state.layout, err, 0, None, false).unwrap();
        let mut succ = StateSet::new(lpi, layout, ha.mode(err)).unwrap();
        succ.is_concrete = false;
        let op = dag.add_transition_successor(succ, t, 0, None);
        assert_eq!(dag.op(op).parent_node, root);

        assert_eq!(strat.get_deagg_node(&ha, &dag), Some(root));
        let dropped_cur = dag.deaggregate(root);
        assert!(dropped_cur);
        assert_eq!(dag.waiting_list.len(), 2);
        assert!(dag.waiting_list.iter().all(|e| e.exact && e.state.is_concrete));
        assert_eq!(strat.get_deagg_node(&ha, &dag), None);

        // exact entries are popped one by one
        let state = dag.pop(&ha, &strat).unwrap();
        assert!(state.is_concrete);
        assert_eq!(dag.waiting_list.len(), 1);
    }
}
