//! # lhreach-rs: Reachability Analysis of Linear Hybrid Automata
//!
//! **`lhreach-rs`** computes an over-approximation of the states a linear
//! hybrid automaton can reach from an initial set within a bounded time
//! horizon, and reports whether an error mode is reachable. When the error is
//! reached without over-approximation, a concrete counterexample trace is
//! extracted.
//!
//! ## How it works
//!
//! Reachable sets are kept symbolically as linear programs. Each set carries
//! the variables of the initial states of its first mode, the variables
//! introduced by every reset and input along its path, and its current-time
//! state. Stepping only rewrites the block relating a mode's initial and
//! current states with a precomputed basis matrix `e^{A·t}`, so the LP never
//! grows with the number of steps; invariant conditions are re-expressed over
//! initial-time variables and replaced in place when a stronger one arrives.
//!
//! When several sets cross into the same mode they can be merged into one
//! template polytope (box, dynamics-aligned directions or convex hull). The
//! merge history forms an aggregation DAG, which also allows undoing a merge
//! that led to a spurious error.
//!
//! ## Basic Usage
//!
//! ```rust
//! use lhreach_rs::automaton::{HybridAutomaton, LinearConstraint};
//! use lhreach_rs::core::Core;
//! use lhreach_rs::settings::ReachSettings;
//! use lhreach_rs::stateset::StateSet;
//! use nalgebra::DMatrix;
//!
//! // 1. Describe the automaton: a harmonic oscillator with an error guard
//! let mut ha = HybridAutomaton::new("oscillator");
//! let m = ha.new_mode("m");
//! ha.set_dynamics(m, DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 0.0])).unwrap();
//! let err = ha.new_mode("error");
//! let t = ha.new_transition(m, err, "x >= 4");
//! ha.set_guard(t, vec![LinearConstraint::new([-1.0, 0.0], -4.0)]).unwrap();
//!
//! // 2. Pick the initial set
//! let init = StateSet::from_box(&[(-5.0, -4.0), (0.0, 1.0)], ha.mode(m)).unwrap();
//!
//! // 3. Run
//! let settings = ReachSettings::new(std::f64::consts::FRAC_PI_4, std::f64::consts::PI);
//! let result = Core::new(ha, settings).unwrap().run(vec![init]).unwrap();
//! assert!(!result.safe);
//! assert!(result.counterexample.is_some());
//! ```
//!
//! ## Core Components
//!
//! - **[`lp`]**: the LP oracle all sets are built on.
//! - **[`lputil`]**: polytope operations on LPs and the [`Layout`][crate::lputil::Layout] of their blocks.
//! - **[`stateset`]**: a reachable set with stepping and invariant intersection.
//! - **[`aggdag`]** and **[`aggstrat`]**: the waiting list, aggregation and deaggregation.
//! - **[`core`]**: the stepping loop and its [`ReachResult`][crate::core::ReachResult].

pub mod aggdag;
pub mod aggstrat;
pub mod automaton;
pub mod core;
pub mod counterexample;
pub mod dot;
pub mod error;
pub mod lp;
pub mod lputil;
pub mod settings;
pub mod stateset;
pub mod time_elapse;
pub mod types;
pub mod utils;
pub mod verts;
