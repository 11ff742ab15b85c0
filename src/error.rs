//! Error taxonomy for reachability runs.
//!
//! Infeasibility is not an error: LP queries report it as `None` / `false` and
//! callers branch on it. Everything in [`ReachError`] aborts the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReachError {
    #[error(
        "constraint block {block_rows}x{block_cols} at ({row_offset}, {col_offset}) \
         is outside the LP extent {lp_rows}x{lp_cols}"
    )]
    ConstraintsOutOfBounds {
        row_offset: usize,
        col_offset: usize,
        block_rows: usize,
        block_cols: usize,
        lp_rows: usize,
        lp_cols: usize,
    },

    #[error("row {row} is out of range (LP has {rows} rows)")]
    RowOutOfRange { row: usize, rows: usize },

    #[error("LP was infeasible where a solution was required")]
    Unsat,

    #[error("LP was unbounded where a bounded optimum was required")]
    Unbounded,

    #[error("simplex failed after {attempts} attempts: {reason}")]
    SolverFailure { attempts: usize, reason: String },

    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid model: {0}")]
    ModelDefinition(String),

    #[error("initial set is infeasible")]
    InfeasibleInitialSet,

    #[error("none of the initial states were feasible within their mode invariants")]
    NoFeasibleInitialStates,

    #[error(
        "basis matrix cache needs {required} bytes but only {available} bytes are allowed"
    )]
    InsufficientMemory { required: usize, available: usize },

    #[error("non-finite values while building directions: {0}")]
    NumericalDirection(String),
}

pub type Result<T> = std::result::Result<T, ReachError>;

impl ReachError {
    pub(crate) fn dims(context: impl Into<String>, expected: usize, found: usize) -> Self {
        ReachError::DimensionMismatch {
            context: context.into(),
            expected,
            found,
        }
    }
}
