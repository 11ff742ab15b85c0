//! Aggregation DAG to DOT (Graphviz) conversion.
//!
//! The generated DOT output follows these conventions:
//! - **Nodes** are labelled with their mode name and the `[min, max]` steps
//!   since the start at which they were created
//! - **Aggregated nodes** (more than one parent operation) use a separate shape;
//!   deaggregated ones are additionally dashed
//! - **Edges** go from the node that checked a guard to the node that consumed the
//!   successor, labelled with the transition name and the step in the source mode
//! - **Initial states** hang off a single `init` point at the top (source rank)
//!
//! # Examples
//!
//! ```
//! use lhreach_rs::aggdag::AggDag;
//! use lhreach_rs::automaton::HybridAutomaton;
//!
//! let ha = HybridAutomaton::new("empty");
//! let dag = AggDag::new(0, 1e-9);
//! let dot = dag.to_dot(&ha).unwrap();
//! // Write to file and render with: dot -Tpng output.dot -o output.png
//! assert!(dot.starts_with("digraph {"));
//! ```

use std::fmt::Write as _;

use crate::aggdag::{AggDag, Op};
use crate::automaton::HybridAutomaton;

/// Configuration options for DOT output generation.
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Shape for nodes holding a single set (default: "box")
    pub node_shape: &'static str,
    /// Shape for aggregated nodes (default: "doubleoctagon")
    pub aggregated_shape: &'static str,
    /// Shape for the initial point (default: "point")
    pub init_shape: &'static str,
    /// Style for transition edges (default: "solid")
    pub edge_style: &'static str,
    /// Whether to list the invariant cuts of each node in its label (default: false)
    pub show_invariant_ops: bool,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            node_shape: "box",
            aggregated_shape: "doubleoctagon",
            init_shape: "point",
            edge_style: "solid",
            show_invariant_ops: false,
        }
    }
}

impl AggDag {
    /// Converts the DAG to DOT format with the default configuration.
    pub fn to_dot(&self, ha: &HybridAutomaton) -> Result<String, std::fmt::Error> {
        self.to_dot_with_config(ha, &DotConfig::default())
    }

    /// Converts the DAG to DOT format.
    pub fn to_dot_with_config(&self, ha: &HybridAutomaton, config: &DotConfig) -> Result<String, std::fmt::Error> {
        let graph = self.graph();

        let mut dot = String::new();
        writeln!(dot, "digraph {{")?;
        writeln!(dot, "node [shape={}];", config.node_shape)?;

        writeln!(dot, "{{ rank=source")?;
        writeln!(dot, "init [shape={}, label=\"\"];", config.init_shape)?;
        writeln!(dot, "}}")?;

        for n in graph.node_indices() {
            let node = &graph[n];
            let steps = node.state.cur_steps_since_start;
            let mut label = format!("{}\\n[{}, {}]", ha.mode(node.mode).name(), steps[0], steps[1]);
            if config.show_invariant_ops {
                let cuts = node.op_list.iter().filter(|op| matches!(op, Op::InvIntersect(_))).count();
                write!(label, "\\n{} inv cuts", cuts)?;
            }

            let mut attrs = vec![format!("label=\"{}\"", label)];
            if node.is_aggregated() {
                attrs.push(format!("shape={}", config.aggregated_shape));
            }
            if node.deaggregated {
                attrs.push("style=dashed".to_string());
            }
            writeln!(dot, "n{} [{}];", n.index(), attrs.join(", "))?;
        }

        for &root in self.roots() {
            writeln!(dot, "init -> n{};", root.index())?;
        }

        for e in graph.edge_indices() {
            let Some((from, to)) = graph.edge_endpoints(e) else {
                continue;
            };
            let op = self.op(graph[e]);
            writeln!(
                dot,
                "n{} -> n{} [style={}, label=\"{} @{}\"];",
                from.index(),
                to.index(),
                config.edge_style,
                ha.transition(op.transition).name(),
                op.step
            )?;
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::DMatrix;
    use test_log::test;

    use super::*;
    use crate::aggstrat::Aggregated;
    use crate::lputil;
    use crate::stateset::StateSet;

    #[test]
    fn test_to_dot_with_transition() {
        let mut ha = HybridAutomaton::new("dot");
        let m1 = ha.new_mode("first");
        ha.set_dynamics(m1, DMatrix::zeros(1, 1)).unwrap();
        let m2 = ha.new_mode("second");
        ha.set_dynamics(m2, DMatrix::zeros(1, 1)).unwrap();
        let t = ha.new_transition(m1, m2, "jump");

        let mut dag = AggDag::new(0, 1e-9);
        dag.add_init_state(StateSet::from_box(&[(0.0, 1.0)], ha.mode(m1)).unwrap());
        dag.add_init_state(StateSet::from_box(&[(2.0, 3.0)], ha.mode(m1)).unwrap());
        let state = dag.pop(&ha, &Aggregated::default()).unwrap();

        let mut lpi = state.lpi.clone();
        let layout = lputil::add_reset_variables(&mut lpi, &state.layout, m2, 0, None, false).unwrap();
        let succ = StateSet::new(lpi, layout, ha.mode(m2)).unwrap();
        dag.add_transition_successor(succ, t, 3, None);
        dag.pop(&ha, &Aggregated::default()).unwrap();

        let dot = dag.to_dot(&ha).unwrap();
        assert!(dot.starts_with("digraph {"));
        assert!(dot.ends_with("}\n"));
        assert!(dot.contains("init -> n0;"));
        assert!(dot.contains("n0 -> n1"));
        assert!(dot.contains("jump @3"));
        assert!(dot.contains("doubleoctagon"));
    }

    #[test]
    fn test_to_dot_with_config() {
        let ha = HybridAutomaton::new("empty");
        let dag = AggDag::new(0, 1e-9);
        let config = DotConfig {
            init_shape: "circle",
            ..DotConfig::default()
        };
        let dot = dag.to_dot_with_config(&ha, &config).unwrap();
        assert!(dot.contains("init [shape=circle"));
    }
}
