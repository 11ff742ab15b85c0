use std::f64::consts::FRAC_PI_4;

use nalgebra::DMatrix;
use test_log::test;

use lhreach_rs::aggstrat::{AggKind, AggType, Aggregated, Unaggregated};
use lhreach_rs::automaton::{HybridAutomaton, Inputs, LinearConstraint, Minkowski, Reset};
use lhreach_rs::core::{Core, ReachResult};
use lhreach_rs::error::Result;
use lhreach_rs::settings::{PlotSettings, ReachSettings};
use lhreach_rs::stateset::{Predecessor, StateSet};
use lhreach_rs::time_elapse::TimeElapse;
use lhreach_rs::verts::PlotAxis;

const EPS: f64 = 1e-6;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= EPS
}

fn x_range(poly: &[(f64, f64)]) -> (f64, f64) {
    poly.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(x, _)| (lo.min(x), hi.max(x)))
}

fn y_range(poly: &[(f64, f64)]) -> (f64, f64) {
    poly.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, y)| (lo.min(y), hi.max(y)))
}

fn assert_range(actual: (f64, f64), expected: (f64, f64)) {
    assert!(
        close(actual.0, expected.0) && close(actual.1, expected.1),
        "expected range {:?}, got {:?}",
        expected,
        actual
    );
}

fn plotting() -> PlotSettings {
    PlotSettings {
        store_plot_result: true,
        num_angles: 16,
        ..PlotSettings::default()
    }
}

// ─── Harmonic oscillator ─────────────────────────────────────────────────────

fn oscillator() -> HybridAutomaton {
    let mut ha = HybridAutomaton::new("oscillator");
    let m = ha.new_mode("m");
    ha.set_dynamics(m, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 0.0]))
        .unwrap();
    let err = ha.new_mode("error");
    let t = ha.new_transition(m, err, "x == 4");
    ha.set_guard(
        t,
        vec![
            LinearConstraint::new([1.0, 0.0], 4.0),
            LinearConstraint::new([-1.0, 0.0], -4.0),
        ],
    )
    .unwrap();
    ha
}

#[test]
fn test_oscillator_counterexample() {
    let ha = oscillator();
    let m = ha.mode_by_name("m").unwrap().id();
    let init = StateSet::from_box(&[(-5.0, -4.0), (0.0, 1.0)], ha.mode(m)).unwrap();

    let settings = ReachSettings::new(FRAC_PI_4, 3.0 * FRAC_PI_4);
    let mut core = Core::new(ha, settings).unwrap();
    let result = core.run(vec![init]).unwrap();

    assert!(!result.safe);
    assert!(result.has_concrete_error);
    assert!(!result.has_aggregated_error);

    let cex = result.counterexample.expect("concrete error has a counterexample");
    assert_eq!(cex.len(), 1);
    let seg = &cex[0];
    assert_eq!(seg.mode, m);

    let (x0, y0) = (seg.start[0], seg.start[1]);
    assert!((-5.0 - EPS..=-4.0 + EPS).contains(&x0));
    assert!((0.0 - EPS..=1.0 + EPS).contains(&y0));
    assert!(close(seg.end[0], 4.0));

    // the end point is the start rotated by 3π/4
    let t = 3.0 * FRAC_PI_4;
    assert!(close(seg.end[0], x0 * t.cos() + y0 * t.sin()));
    assert!(close(seg.end[1], -x0 * t.sin() + y0 * t.cos()));
}

#[test]
fn test_oscillator_short_horizon_is_safe() {
    let ha = oscillator();
    let m = ha.mode_by_name("m").unwrap().id();
    let init = StateSet::from_box(&[(-5.0, -4.0), (0.0, 1.0)], ha.mode(m)).unwrap();

    let settings = ReachSettings::new(FRAC_PI_4, 2.0 * FRAC_PI_4);
    let result = Core::new(ha, settings).unwrap().run(vec![init]).unwrap();
    assert!(result.safe);
    assert!(result.counterexample.is_none());
}

// ─── Invariant cuts ──────────────────────────────────────────────────────────

/// `x' = a`, `y' = a`, `a' = 0` with invariant `x <= 2.5`.
fn ramp() -> HybridAutomaton {
    let mut ha = HybridAutomaton::new("ramp");
    let m = ha.new_mode("m");
    ha.set_dynamics(
        m,
        DMatrix::from_row_slice(3, 3, &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]),
    )
    .unwrap();
    ha.set_invariant(m, vec![LinearConstraint::new([1.0, 0.0, 0.0], 2.5)])
        .unwrap();
    ha
}

fn ramp_init(ha: &HybridAutomaton) -> StateSet {
    let m = ha.mode_by_name("m").unwrap();
    StateSet::from_box(&[(0.0, 1.0), (0.0, 1.0), (1.0, 1.0)], m).unwrap()
}

#[test]
fn test_invariant_cut_polygons() {
    let ha = ramp();
    let init = ramp_init(&ha);

    let settings = ReachSettings::new(1.0, 10.0).with_plot(plotting());
    let result = Core::new(ha, settings).unwrap().run(vec![init]).unwrap();
    assert!(result.safe);

    let polys = &result.mode_to_polys["m"];
    assert_eq!(polys.len(), 4);
    let expected = [(0.0, 1.0), (1.0, 2.0), (2.0, 3.0), (3.0, 3.5)];
    for (poly, &range) in polys.iter().zip(&expected) {
        assert_range(x_range(poly), range);
    }
    // the cut constrains x only
    assert_range(y_range(&polys[3]), (3.0, 4.0));
}

#[test]
fn test_invariant_rows_do_not_accumulate() {
    let ha = ramp();
    let init = ramp_init(&ha);

    let settings = ReachSettings::new(0.1, 5.0);
    let result = Core::new(ha, settings).unwrap().run(vec![init]).unwrap();

    let last = result.last_cur_state.expect("a set was stepped");
    // basis rows, box rows and a single invariant row
    assert_eq!(last.lpi.num_rows(), 3 + 6 + 1);
}

/// `x' = a` stepped twice as fast as the dynamics say.
struct DoubleSpeed {
    step_size: f64,
}

impl TimeElapse for DoubleSpeed {
    fn get_basis_matrix(&mut self, step: usize) -> Result<(DMatrix<f64>, Option<DMatrix<f64>>)> {
        let t = 2.0 * self.step_size * step as f64;
        Ok((DMatrix::from_row_slice(2, 2, &[1.0, t, 0.0, 1.0]), None))
    }
}

#[test]
fn test_custom_time_elapse() {
    let mut ha = HybridAutomaton::new("fast");
    let m = ha.new_mode("m");
    ha.set_dynamics(m, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]))
        .unwrap();
    let init = StateSet::from_box(&[(0.0, 1.0), (1.0, 1.0)], ha.mode(m)).unwrap();

    let settings = ReachSettings::new(1.0, 3.0).with_plot(plotting());
    let mut core = Core::new(ha, settings)
        .unwrap()
        .with_time_elapse(m, Box::new(DoubleSpeed { step_size: 1.0 }));
    let result = core.run(vec![init]).unwrap();
    assert!(result.safe);

    let polys = &result.mode_to_polys["m"];
    assert_eq!(polys.len(), 4);
    let expected = [(0.0, 1.0), (2.0, 3.0), (4.0, 5.0), (6.0, 7.0)];
    for (poly, &range) in polys.iter().zip(&expected) {
        assert_range(x_range(poly), range);
    }
}

// ─── Urgent guards ───────────────────────────────────────────────────────────

/// `x' = a` leaving the error guard `x <= 0.5` during the first step.
fn run_leaving_error(urgent: bool) -> ReachResult {
    let mut ha = HybridAutomaton::new("leaving");
    let m = ha.new_mode("m");
    ha.set_dynamics(m, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]))
        .unwrap();
    let err = ha.new_mode("error");
    let t = ha.new_transition(m, err, "x <= 0.5");
    ha.set_guard(t, vec![LinearConstraint::new([1.0, 0.0], 0.5)])
        .unwrap();
    let init = StateSet::from_box(&[(0.0, 1.0), (1.0, 1.0)], ha.mode(m)).unwrap();

    let settings = ReachSettings::new(1.0, 3.0).with_urgent_guards(urgent);
    Core::new(ha, settings).unwrap().run(vec![init]).unwrap()
}

#[test]
fn test_guards_skipped_on_entry() {
    let result = run_leaving_error(false);
    assert!(result.safe);
}

#[test]
fn test_urgent_guards_checked_on_entry() {
    let result = run_leaving_error(true);
    assert!(!result.safe);
    assert!(result.has_concrete_error);

    let cex = result.counterexample.expect("concrete error has a counterexample");
    assert_eq!(cex.len(), 1);
    assert!(cex[0].start[0] <= 0.5 + EPS);
    assert!(close(cex[0].start[0], cex[0].end[0]));
}

// ─── Inputs ──────────────────────────────────────────────────────────────────

#[test]
fn test_counterexample_inputs() {
    let mut ha = HybridAutomaton::new("drift");
    let m = ha.new_mode("m");
    ha.set_dynamics(m, DMatrix::zeros(1, 1)).unwrap();
    ha.set_inputs(
        m,
        Inputs {
            b_matrix: DMatrix::from_row_slice(1, 1, &[1.0]),
            u_constraints: DMatrix::from_row_slice(2, 1, &[1.0, -1.0]),
            u_rhs: vec![1.0, 0.0],
        },
    )
    .unwrap();
    let err = ha.new_mode("error");
    let t = ha.new_transition(m, err, "x >= 1.5");
    ha.set_guard(t, vec![LinearConstraint::new([-1.0], -1.5)])
        .unwrap();
    let init = StateSet::from_box(&[(0.0, 0.0)], ha.mode(m)).unwrap();

    let settings = ReachSettings::new(1.0, 3.0).with_aggstrat(Box::new(Unaggregated));
    let result = Core::new(ha, settings).unwrap().run(vec![init]).unwrap();
    assert!(!result.safe);

    let cex = result.counterexample.expect("concrete error has a counterexample");
    assert_eq!(cex.len(), 1);
    let seg = &cex[0];
    // x(2) = x(0) + u0 + u1 with u in [0, 1]
    assert_eq!(seg.inputs.len(), 2);
    assert!(seg.inputs.iter().all(|u| u.len() == 1 && (-EPS..=1.0 + EPS).contains(&u[0])));
    let total: f64 = seg.inputs.iter().map(|u| u[0]).sum();
    assert!(close(seg.start[0], 0.0));
    assert!(close(seg.end[0], total));
    assert!(seg.end[0] >= 1.5 - EPS);
}

// ─── Resets and aggregation ──────────────────────────────────────────────────

/// `m1` is `x' = a`; the transition to `m2` is always enabled and adds `y = 3`.
fn grow_dims() -> HybridAutomaton {
    let mut ha = HybridAutomaton::new("grow");
    let m1 = ha.new_mode("m1");
    ha.set_dynamics(m1, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]))
        .unwrap();
    ha.set_invariant(m1, vec![LinearConstraint::new([1.0, 0.0], 3.0)])
        .unwrap();

    let m2 = ha.new_mode("m2");
    ha.set_dynamics(
        m2,
        DMatrix::from_row_slice(3, 3, &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
    )
    .unwrap();

    let t = ha.new_transition(m1, m2, "grow");
    let reset = Reset::with_minkowski(
        DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]),
        Minkowski {
            matrix: DMatrix::from_row_slice(3, 1, &[0.0, 0.0, 1.0]),
            constraints: DMatrix::from_row_slice(2, 1, &[1.0, -1.0]),
            rhs: vec![3.0, -3.0],
        },
    );
    ha.set_reset(t, reset).unwrap();
    ha
}

fn run_grow_dims(agg_type: AggType) -> ReachResult {
    let ha = grow_dims();
    let m1 = ha.mode_by_name("m1").unwrap();
    let init = StateSet::from_box(&[(0.0, 1.0), (1.0, 1.0)], m1).unwrap();

    let mut plot = plotting();
    plot.ydim_dir_by_mode.insert("m2".to_string(), PlotAxis::Dim(2));
    let settings = ReachSettings::new(1.0, 2.0)
        .with_aggstrat(Box::new(Aggregated::new(agg_type)))
        .with_plot(plot)
        .with_seed(7);
    Core::new(ha, settings).unwrap().run(vec![init]).unwrap()
}

#[test]
fn test_arnoldi_aggregation_to_more_dims() {
    let result = run_grow_dims(AggType::new(AggKind::ArnoldiBox));
    assert!(result.safe);
    assert_eq!(result.mode_to_polys["m1"].len(), 3);

    let polys = &result.mode_to_polys["m2"];
    assert_eq!(polys.len(), 2);
    assert_range(x_range(&polys[0]), (1.0, 3.0));
    assert_range(y_range(&polys[0]), (3.0, 3.0));
    assert_range(x_range(&polys[1]), (1.0, 3.0));
    assert_range(y_range(&polys[1]), (4.0, 4.0));

    let last = result.last_cur_state.expect("a set was stepped");
    assert!(!last.is_concrete);
    assert_eq!(last.cur_steps_since_start, [2, 3]);
    let expected = [
        "m0_i0", "m0_i1", "m0_c0", "m0_c1", "reset0", "m1_i0_t0", "m1_i1", "m1_i2", "m1_c0", "m1_c1", "m1_c2",
        "snap0", "snap1", "snap2", "snap_c0", "snap_c1", "snap_c2",
    ];
    assert_eq!(last.lpi.names(), expected);
}

#[test]
fn test_box_aggregation_predecessor() {
    let result = run_grow_dims(AggType::default());
    let last = result.last_cur_state.expect("a set was stepped");
    match &last.predecessor {
        Some(Predecessor::Aggregation { ops }) => assert_eq!(ops.len(), 2),
        other => panic!("expected an aggregated predecessor, got {:?}", other),
    }
    assert_range(x_range(&result.mode_to_polys["m2"][0]), (1.0, 3.0));
}

#[test]
fn test_runs_are_deterministic() {
    let a = run_grow_dims(AggType::new(AggKind::ArnoldiBox));
    let b = run_grow_dims(AggType::new(AggKind::ArnoldiBox));
    assert_eq!(a.safe, b.safe);
    assert_eq!(a.num_popped, b.num_popped);
    assert_eq!(a.mode_to_polys, b.mode_to_polys);
}

/// `x' = a`, `y' = -a`, so `x + y` stays fixed; the transition guard bounds it.
fn run_sliding(add_guard: bool) -> ReachResult {
    let mut ha = HybridAutomaton::new("sliding");
    let m1 = ha.new_mode("m1");
    ha.set_dynamics(
        m1,
        DMatrix::from_row_slice(3, 3, &[0.0, 0.0, 1.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0]),
    )
    .unwrap();
    let m2 = ha.new_mode("m2");
    ha.set_dynamics(m2, DMatrix::zeros(3, 3)).unwrap();
    let t = ha.new_transition(m1, m2, "x + y >= -10");
    ha.set_guard(t, vec![LinearConstraint::new([-1.0, -1.0, 0.0], 10.0)])
        .unwrap();
    let init = StateSet::from_box(&[(0.0, 1.0), (0.0, 0.0), (1.0, 1.0)], ha.mode(m1)).unwrap();

    let agg_type = AggType::new(AggKind::Box).with_guard(add_guard);
    let settings = ReachSettings::new(1.0, 2.0).with_aggstrat(Box::new(Aggregated::new(agg_type)));
    Core::new(ha, settings).unwrap().run(vec![init]).unwrap()
}

#[test]
fn test_guard_directions_tighten_box() {
    let result = run_sliding(true);
    assert!(result.safe);
    let last = result.last_cur_state.expect("a set was stepped");
    assert!(!last.is_concrete);

    let names = last.lpi.names();
    assert!(names.iter().any(|n| n == "agg0"));
    assert!(!names.iter().any(|n| n == "agg1"));

    // successors at x in [1, 2], y = -1 and x in [2, 3], y = -2
    assert!(last.contains_point(&[2.0, -1.5, 1.0], 1e-7).unwrap());
    assert!(!last.contains_point(&[1.0, -2.0, 1.0], 1e-7).unwrap());
    assert!(!last.contains_point(&[3.0, -1.0, 1.0], 1e-7).unwrap());
}

#[test]
fn test_box_without_guard_directions() {
    let result = run_sliding(false);
    let last = result.last_cur_state.expect("a set was stepped");
    assert!(!last.lpi.names().iter().any(|n| n.starts_with("agg")));
    assert!(last.contains_point(&[1.0, -2.0, 1.0], 1e-7).unwrap());
}

#[test]
fn test_arnoldi_general_directions() {
    let rotation = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 0.0]);
    let mut ha = HybridAutomaton::new("rotate");
    let m1 = ha.new_mode("m1");
    ha.set_dynamics(m1, rotation.clone()).unwrap();
    let m2 = ha.new_mode("m2");
    ha.set_dynamics(m2, rotation).unwrap();
    ha.new_transition(m1, m2, "always");
    let init = StateSet::from_box(&[(1.0, 2.0), (0.0, 1.0)], ha.mode(m1)).unwrap();

    let agg_type = AggType::new(AggKind::ArnoldiBox);
    let settings = ReachSettings::new(FRAC_PI_4, 2.0 * FRAC_PI_4)
        .with_aggstrat(Box::new(Aggregated::new(agg_type)))
        .with_plot(plotting());
    let result = Core::new(ha, settings).unwrap().run(vec![init]).unwrap();
    assert!(result.safe);
    assert!(!result.mode_to_polys["m2"].is_empty());

    let last = result.last_cur_state.expect("a set was stepped");
    let names = last.lpi.names();
    // the sampled directions are off-axis; the box directions only bound the snapshot
    for expected in ["agg0", "agg1", "snap0", "snap1", "snap_c0", "snap_c1"] {
        assert!(names.iter().any(|n| n == expected), "missing column {} in {:?}", expected, names);
    }
}

// ─── Time-triggered transitions ──────────────────────────────────────────────

#[test]
fn test_time_triggered_counterexample() {
    let mut ha = HybridAutomaton::new("tt");
    let ramp = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 0.0, 0.0]);
    let m1 = ha.new_mode("m1");
    ha.set_dynamics(m1, ramp.clone()).unwrap();
    ha.set_invariant(m1, vec![LinearConstraint::new([1.0, 0.0], 2.0)])
        .unwrap();
    let m2 = ha.new_mode("m2");
    ha.set_dynamics(m2, ramp).unwrap();
    let err = ha.new_mode("error");

    let t12 = ha.new_transition(m1, m2, "x >= 2");
    ha.set_guard(t12, vec![LinearConstraint::new([-1.0, 0.0], -2.0)])
        .unwrap();
    let t2e = ha.new_transition(m2, err, "x >= 4");
    ha.set_guard(t2e, vec![LinearConstraint::new([-1.0, 0.0], -4.0)])
        .unwrap();

    let init = StateSet::from_box(&[(0.0, 1.0), (1.0, 1.0)], ha.mode(m1)).unwrap();
    let settings = ReachSettings::new(1.0, 4.0)
        .with_aggstrat(Box::new(Unaggregated))
        .with_plot(plotting());
    let mut core = Core::new(ha, settings).unwrap();
    assert!(core.automaton().transition(t12).is_time_triggered());

    let result = core.run(vec![init]).unwrap();
    assert!(!result.safe);
    assert_eq!(result.num_tt_transitions, 1);
    assert_eq!(result.mode_to_polys["m1"].len(), 3);
    assert_eq!(result.mode_to_polys["m2"].len(), 3);

    let cex = result.counterexample.expect("concrete error has a counterexample");
    assert_eq!(cex.len(), 2);
    assert_eq!(cex[0].mode, m1);
    assert_eq!(cex[0].outgoing_transition, Some(t12));
    assert!(close(cex[0].start[0], 1.0));
    assert!(close(cex[0].end[0], 2.0));
    assert_eq!(cex[1].mode, m2);
    assert_eq!(cex[1].outgoing_transition, Some(t2e));
    assert!(close(cex[1].start[0], 2.0));
    assert!(close(cex[1].end[0], 4.0));
}

// ─── Deaggregation ───────────────────────────────────────────────────────────

fn split_boxes(deaggregate: bool, leaves_first: bool) -> ReachResult {
    let mut ha = HybridAutomaton::new("split");
    let m = ha.new_mode("m");
    ha.set_dynamics(m, DMatrix::zeros(2, 2)).unwrap();
    let err = ha.new_mode("error");
    let t = ha.new_transition(m, err, "x - y >= 2.5");
    ha.set_guard(t, vec![LinearConstraint::new([-1.0, 1.0], -2.5)])
        .unwrap();

    let init = vec![
        StateSet::from_box(&[(0.0, 1.0), (0.0, 1.0)], ha.mode(m)).unwrap(),
        StateSet::from_box(&[(2.0, 3.0), (2.0, 3.0)], ha.mode(m)).unwrap(),
    ];
    let strategy = Aggregated::default().with_deaggregation(deaggregate, leaves_first);
    let settings = ReachSettings::new(1.0, 3.0)
        .with_aggstrat(Box::new(strategy))
        .with_stop_on_aggregated_error(false);
    Core::new(ha, settings).unwrap().run(init).unwrap()
}

#[test]
fn test_aggregated_error_without_deaggregation() {
    let result = split_boxes(false, true);
    assert!(!result.safe);
    assert!(result.has_aggregated_error);
    assert!(!result.has_concrete_error);
    assert!(result.counterexample.is_none());
}

#[test]
fn test_deaggregation_refutes_spurious_error() {
    let result = split_boxes(true, true);
    assert!(result.safe);
    assert!(!result.has_aggregated_error);
    // the merged root, then both halves alone
    assert_eq!(result.num_popped, 3);
}

#[test]
fn test_roots_first_deaggregation() {
    let result = split_boxes(true, false);
    assert!(result.safe);
    assert!(!result.has_aggregated_error);
    assert_eq!(result.num_popped, 3);
}
