//! The reachability loop.
//!
//! [`Core::run`] alternates between popping a set from the aggregation DAG
//! and stepping it through its mode's dynamics until it leaves the invariant,
//! hits the time bound or takes a time-triggered transition. Every step the
//! outgoing guards are checked and feasible successors are queued.
//!
//! ```
//! use lhreach_rs::automaton::{HybridAutomaton, LinearConstraint};
//! use lhreach_rs::core::Core;
//! use lhreach_rs::settings::ReachSettings;
//! use lhreach_rs::stateset::StateSet;
//! use nalgebra::DMatrix;
//!
//! let mut ha = HybridAutomaton::new("ramp");
//! let m = ha.new_mode("m");
//! ha.set_dynamics(m, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0])).unwrap();
//! let err = ha.new_mode("error");
//! let t = ha.new_transition(m, err, "x >= 10");
//! ha.set_guard(t, vec![LinearConstraint::new([-1.0, 0.0], -10.0)]).unwrap();
//!
//! let init = StateSet::from_box(&[(0.0, 1.0), (1.0, 1.0)], ha.mode(m)).unwrap();
//! let mut core = Core::new(ha, ReachSettings::new(1.0, 5.0)).unwrap();
//! let result = core.run(vec![init]).unwrap();
//! assert!(result.safe);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info, warn};

use crate::aggdag::AggDag;
use crate::automaton::{constraints_to_matrix, HybridAutomaton};
use crate::counterexample::{self, CounterExampleSegment};
use crate::error::{ReachError, Result};
use crate::lputil;
use crate::settings::ReachSettings;
use crate::stateset::StateSet;
use crate::time_elapse::{ExpMultElapser, TimeElapse};
use crate::types::{ModeId, OpId};
use crate::utils::is_zero_matrix;

/// Outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct ReachResult {
    pub safe: bool,
    /// An error mode was reached through an aggregated (over-approximated) set.
    pub has_aggregated_error: bool,
    /// An error mode was reached through a concrete set.
    pub has_concrete_error: bool,
    /// Trace of the first concrete error.
    pub counterexample: Option<Vec<CounterExampleSegment>>,
    /// Polygons of every recorded step, keyed by mode name.
    pub mode_to_polys: BTreeMap<String, Vec<Vec<(f64, f64)>>>,
    /// The last popped set, as it was when it stopped being stepped.
    pub last_cur_state: Option<StateSet>,
    pub num_popped: usize,
    pub num_tt_transitions: usize,
    pub num_strengthened_rows: usize,
}

pub struct Core {
    ha: HybridAutomaton,
    settings: ReachSettings,
    elapsers: Vec<Option<Box<dyn TimeElapse>>>,
    aggdag: AggDag,
    cur_state: Option<StateSet>,
    took_tt_transition: bool,
    stopped: bool,
    num_steps: usize,
    /// Aggregated error successors not yet refuted by deaggregation.
    agg_error_ops: BTreeSet<OpId>,
    result: ReachResult,
}

impl Core {
    /// Validates the automaton and prepares the time elapse of every mode.
    ///
    /// Time-triggered detection and guard strengthening run here if enabled.
    pub fn new(mut ha: HybridAutomaton, settings: ReachSettings) -> Result<Self> {
        if !(settings.step_size > 0.0) || !settings.step_size.is_finite() {
            return Err(ReachError::ModelDefinition(format!("invalid step size {}", settings.step_size)));
        }
        ha.validate()?;
        let num_steps = settings.num_steps();
        let tol = settings.tolerance;

        let mut result = ReachResult::default();
        if settings.optimize_tt_transitions {
            result.num_tt_transitions = ha.detect_tt_transitions(tol);
        }
        if settings.do_guard_strengthening {
            result.num_strengthened_rows = ha.do_guard_strengthening(tol)?;
        }

        let mut elapsers: Vec<Option<Box<dyn TimeElapse>>> = Vec::with_capacity(ha.modes().len());
        for mode in ha.modes() {
            if mode.is_error() {
                elapsers.push(None);
            } else {
                let elapser =
                    ExpMultElapser::new(mode, settings.step_size, num_steps, settings.max_basis_cache_bytes)?;
                elapsers.push(Some(Box::new(elapser)));
            }
        }

        info!(
            "automaton '{}': {} modes, {} transitions, {} steps of {}",
            ha.name,
            ha.modes().len(),
            ha.transitions().len(),
            num_steps,
            settings.step_size
        );

        let aggdag = AggDag::new(settings.seed, tol);
        Ok(Core {
            ha,
            settings,
            elapsers,
            aggdag,
            cur_state: None,
            took_tt_transition: false,
            stopped: false,
            num_steps,
            agg_error_ops: BTreeSet::new(),
            result,
        })
    }

    /// Replaces the time elapse of one mode.
    pub fn with_time_elapse(mut self, mode: ModeId, elapser: Box<dyn TimeElapse>) -> Self {
        self.elapsers[mode.index()] = Some(elapser);
        self
    }

    pub fn automaton(&self) -> &HybridAutomaton {
        &self.ha
    }

    pub fn settings(&self) -> &ReachSettings {
        &self.settings
    }

    pub fn aggdag(&self) -> &AggDag {
        &self.aggdag
    }

    /// Computes the reachable states from `init_states`.
    ///
    /// Fails with [`ReachError::NoFeasibleInitialStates`] if every initial set
    /// is empty within its mode invariant.
    pub fn run(&mut self, init_states: Vec<StateSet>) -> Result<ReachResult> {
        self.setup(init_states)?;

        while !self.is_finished() {
            self.do_step()?;
        }

        let result = &mut self.result;
        result.safe = !(result.has_aggregated_error || result.has_concrete_error);
        info!(
            "finished: {} after {} popped sets",
            if result.safe { "safe" } else { "unsafe" },
            result.num_popped
        );
        Ok(std::mem::take(result))
    }

    fn setup(&mut self, init_states: Vec<StateSet>) -> Result<()> {
        let tol = self.settings.tolerance;
        for mut state in init_states {
            let mode = self.ha.mode(state.mode);
            if mode.is_error() {
                return Err(ReachError::ModelDefinition(format!(
                    "initial state in error mode '{}'",
                    mode.name()
                )));
            }
            if !state.is_feasible()? {
                warn!("skipping infeasible initial state in mode '{}'", mode.name());
                continue;
            }
            if !state.intersect_invariant(mode, tol)?.feasible {
                warn!("skipping initial state outside the invariant of mode '{}'", mode.name());
                continue;
            }
            state.reset_invariant_rows();
            self.aggdag.add_init_state(state);
        }

        if self.aggdag.waiting_list.is_empty() {
            return Err(ReachError::NoFeasibleInitialStates);
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.stopped || (self.cur_state.is_none() && self.aggdag.waiting_list.is_empty())
    }

    /// One iteration: pop if nothing is being stepped, otherwise step.
    pub fn do_step(&mut self) -> Result<()> {
        if self.cur_state.is_none() {
            self.pop_state()
        } else {
            self.continuous_post()
        }
    }

    fn pop_state(&mut self) -> Result<()> {
        if let Some(node) = self.settings.aggstrat.get_deagg_node(&self.ha, &self.aggdag) {
            self.aggdag.deaggregate(node);
            let aggdag = &self.aggdag;
            self.agg_error_ops.retain(|&op| {
                aggdag.op(op).child_node.is_some() || aggdag.waiting_list.iter().any(|e| e.op == Some(op))
            });
            self.result.has_aggregated_error = !self.agg_error_ops.is_empty();
            if self.aggdag.waiting_list.is_empty() {
                return Ok(());
            }
        }

        let mut state = self.aggdag.pop(&self.ha, self.settings.aggstrat.as_ref())?;
        self.result.num_popped += 1;

        let mode = self.ha.mode(state.mode);
        if mode.is_error() {
            debug!("popped a set in error mode '{}'", mode.name());
            self.result.last_cur_state = Some(state);
            return Ok(());
        }
        info!(
            "entered mode '{}' at steps {:?}{}",
            mode.name(),
            state.cur_steps_since_start,
            if state.is_concrete { "" } else { " (aggregated)" }
        );

        let outcome = state.intersect_invariant(mode, self.settings.tolerance)?;
        if !outcome.feasible {
            info!("set left the invariant of '{}' on entry", mode.name());
            self.result.last_cur_state = Some(state);
            return Ok(());
        }

        self.record_poly(&mut state)?;
        if self.settings.process_urgent_guards {
            self.check_guards(&mut state)?;
        }
        self.keep_or_retire(state, true);
        Ok(())
    }

    /// Keeps stepping `state` next iteration, or retires it as the last state.
    fn keep_or_retire(&mut self, state: StateSet, keep: bool) {
        if keep && !self.stopped {
            self.cur_state = Some(state);
        } else {
            self.result.last_cur_state = Some(state);
        }
    }

    fn continuous_post(&mut self) -> Result<()> {
        let Some(mut state) = self.cur_state.take() else {
            return Ok(());
        };
        let keep = self.advance(&mut state)?;
        self.keep_or_retire(state, keep);
        Ok(())
    }

    /// One step of `state` in its mode. Returns whether it stays in the mode.
    fn advance(&mut self, state: &mut StateSet) -> Result<bool> {
        if state.cur_steps_since_start[0] >= self.num_steps {
            debug!("set in {} reached the time bound", state.mode);
            return Ok(false);
        }
        if self.took_tt_transition {
            self.took_tt_transition = false;
            debug!("set in {} took a time-triggered transition", state.mode);
            return Ok(false);
        }

        let mode = self.ha.mode(state.mode);
        let outcome = state.intersect_invariant(mode, self.settings.tolerance)?;
        self.aggdag.record_cuts(&outcome.cuts);
        if !outcome.feasible {
            info!("set left the invariant of '{}' at step {}", mode.name(), state.cur_step_in_mode);
            return Ok(false);
        }

        let elapser = self.elapsers[state.mode.index()]
            .as_mut()
            .ok_or_else(|| ReachError::ModelDefinition(format!("mode '{}' has no time elapse", mode.name())))?;
        state.step(elapser.as_mut(), mode)?;
        let frozen = mode.a_matrix().is_some_and(is_zero_matrix) && !mode.has_inputs();

        self.record_poly(state)?;
        self.check_guards(state)?;

        if frozen {
            debug!("set in {} has no dynamics, leaving after one step", state.mode);
            return Ok(false);
        }
        Ok(true)
    }

    fn record_poly(&mut self, state: &mut StateSet) -> Result<()> {
        let plot = &self.settings.plot;
        if !plot.store_plot_result {
            return Ok(());
        }
        let name = self.ha.mode(state.mode).name();
        let (xaxis, yaxis) = plot.axes_for(name);
        let verts = state.verts(xaxis, yaxis, plot.num_angles, self.settings.step_size, self.settings.tolerance)?;
        self.result.mode_to_polys.entry(name.to_string()).or_default().push(verts);
        Ok(())
    }

    /// Checks every outgoing guard of the set and queues feasible successors.
    fn check_guards(&mut self, state: &mut StateSet) -> Result<()> {
        let Core {
            ha,
            settings,
            aggdag,
            result,
            took_tt_transition,
            stopped,
            agg_error_ops,
            ..
        } = self;
        let (ha, settings) = (&*ha, &*settings);
        let tol = settings.tolerance;
        let mode = ha.mode(state.mode);

        for (t_index, &tid) in mode.transitions().iter().enumerate() {
            let t = ha.transition(tid);
            let (mat, rhs) = constraints_to_matrix(t.guard(), state.dims());
            let mut lpi = state.lpi.clone();
            lputil::add_curtime_constraints(&mut lpi, &state.layout, &mat, &rhs)?;
            if !lpi.is_feasible()? {
                continue;
            }

            let premode_center = settings.aggstrat.premode_center(&mut lpi, &state.layout)?;
            let target = ha.mode(t.to());
            let mut aggregated_error = false;

            if target.is_error() {
                if state.is_concrete {
                    result.has_concrete_error = true;
                    info!("concrete error: '{}' reached at steps {:?}", target.name(), state.cur_steps_since_start);
                    if result.counterexample.is_none() {
                        if let Some(point) = lpi.feasible_point()? {
                            let cex = counterexample::make_counterexample(ha, lpi.names(), &point, tid)?;
                            debug!("counterexample:\n{}", counterexample::format_counterexample(ha, &cex));
                            result.counterexample = Some(cex);
                        }
                    }
                    if settings.stop_on_concrete_error {
                        *stopped = true;
                        break;
                    }
                } else {
                    result.has_aggregated_error = true;
                    aggregated_error = true;
                    info!(
                        "aggregated error: '{}' reached at steps {:?}",
                        target.name(),
                        state.cur_steps_since_start
                    );
                    if settings.stop_on_aggregated_error {
                        *stopped = true;
                        break;
                    }
                }
            }

            let layout =
                lputil::add_reset_variables(&mut lpi, &state.layout, t.to(), t_index, t.reset(), target.has_inputs())?;
            let mut successor = StateSet::new(lpi, layout, target)?;
            successor.cur_steps_since_start = state.cur_steps_since_start;
            successor.is_concrete = state.is_concrete;
            let op = aggdag.add_transition_successor(successor, tid, state.cur_step_in_mode, premode_center);
            if aggregated_error {
                agg_error_ops.insert(op);
            }
            debug!(
                "transition '{}' enabled at step {} of '{}'",
                t.name(),
                state.cur_step_in_mode,
                mode.name()
            );

            if settings.optimize_tt_transitions && t.is_time_triggered() {
                let mut taken = true;
                for g in t.guard() {
                    let max = lputil::maximize_direction(&mut state.lpi, &state.layout, &g.coeffs)?
                        .ok_or(ReachError::Unsat)?;
                    if max > g.rhs + tol {
                        taken = false;
                        break;
                    }
                }
                if taken {
                    *took_tt_transition = true;
                }
            }
        }
        Ok(())
    }
}
