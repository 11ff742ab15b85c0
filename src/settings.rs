//! Run configuration.
//!
//! # Examples
//!
//! ```
//! use lhreach_rs::aggstrat::Unaggregated;
//! use lhreach_rs::settings::ReachSettings;
//!
//! let settings = ReachSettings::new(0.1, 2.0)
//!     .with_aggstrat(Box::new(Unaggregated))
//!     .with_stop_on_concrete_error(false);
//! assert_eq!(settings.num_steps(), 20);
//! ```

use std::collections::HashMap;

use crate::aggstrat::{Aggregated, AggregationStrategy};
use crate::utils::DEFAULT_TOLERANCE;
use crate::verts::PlotAxis;

/// Plot history options.
#[derive(Debug, Clone)]
pub struct PlotSettings {
    /// Record a polygon per step in [`ReachResult::mode_to_polys`][crate::core::ReachResult::mode_to_polys].
    pub store_plot_result: bool,
    pub xdim: PlotAxis,
    pub ydim: PlotAxis,
    /// Per-mode overrides of `xdim`, keyed by mode name.
    pub xdim_dir_by_mode: HashMap<String, PlotAxis>,
    /// Per-mode overrides of `ydim`, keyed by mode name.
    pub ydim_dir_by_mode: HashMap<String, PlotAxis>,
    /// Number of support directions sampled per polygon.
    pub num_angles: usize,
}

impl Default for PlotSettings {
    fn default() -> Self {
        PlotSettings {
            store_plot_result: false,
            xdim: PlotAxis::Dim(0),
            ydim: PlotAxis::Dim(1),
            xdim_dir_by_mode: HashMap::new(),
            ydim_dir_by_mode: HashMap::new(),
            num_angles: 64,
        }
    }
}

impl PlotSettings {
    pub fn axes_for(&self, mode_name: &str) -> (&PlotAxis, &PlotAxis) {
        (
            self.xdim_dir_by_mode.get(mode_name).unwrap_or(&self.xdim),
            self.ydim_dir_by_mode.get(mode_name).unwrap_or(&self.ydim),
        )
    }
}

#[derive(Debug)]
pub struct ReachSettings {
    pub step_size: f64,
    pub max_time: f64,
    pub stop_on_aggregated_error: bool,
    pub stop_on_concrete_error: bool,
    /// Leave a mode right after a time-triggered transition is certainly taken.
    pub optimize_tt_transitions: bool,
    /// Add target-invariant rows to identity-reset guards before the run.
    pub do_guard_strengthening: bool,
    /// Also check guards right after entering a mode, before the first step.
    pub process_urgent_guards: bool,
    pub aggstrat: Box<dyn AggregationStrategy>,
    pub plot: PlotSettings,
    /// Seed of the generator used when building aggregation directions.
    pub seed: u64,
    pub tolerance: f64,
    /// Upper bound on the memory of each mode's cached basis matrices.
    pub max_basis_cache_bytes: usize,
}

impl ReachSettings {
    pub fn new(step_size: f64, max_time: f64) -> Self {
        ReachSettings {
            step_size,
            max_time,
            stop_on_aggregated_error: true,
            stop_on_concrete_error: true,
            optimize_tt_transitions: true,
            do_guard_strengthening: false,
            process_urgent_guards: false,
            aggstrat: Box::new(Aggregated::default()),
            plot: PlotSettings::default(),
            seed: 0,
            tolerance: DEFAULT_TOLERANCE,
            max_basis_cache_bytes: 1 << 30,
        }
    }

    /// Number of steps covering `max_time`.
    pub fn num_steps(&self) -> usize {
        let steps = (self.max_time / self.step_size - 1e-9).ceil();
        if steps > 0.0 {
            steps as usize
        } else {
            0
        }
    }

    pub fn with_aggstrat(mut self, aggstrat: Box<dyn AggregationStrategy>) -> Self {
        self.aggstrat = aggstrat;
        self
    }

    pub fn with_stop_on_aggregated_error(mut self, stop: bool) -> Self {
        self.stop_on_aggregated_error = stop;
        self
    }

    pub fn with_stop_on_concrete_error(mut self, stop: bool) -> Self {
        self.stop_on_concrete_error = stop;
        self
    }

    pub fn with_tt_optimization(mut self, enabled: bool) -> Self {
        self.optimize_tt_transitions = enabled;
        self
    }

    pub fn with_guard_strengthening(mut self, enabled: bool) -> Self {
        self.do_guard_strengthening = enabled;
        self
    }

    pub fn with_urgent_guards(mut self, enabled: bool) -> Self {
        self.process_urgent_guards = enabled;
        self
    }

    pub fn with_plot(mut self, plot: PlotSettings) -> Self {
        self.plot = plot;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_basis_cache_bytes(mut self, bytes: usize) -> Self {
        self.max_basis_cache_bytes = bytes;
        self
    }
}
