//! Type-safe handles for modes, transitions and transition operations.
//!
//! Mode and transition ids are plain indices into the owning
//! [`HybridAutomaton`][crate::automaton::HybridAutomaton]; operation ids index the
//! operation list of an [`AggDag`][crate::aggdag::AggDag]. Each is wrapped so one kind of
//! handle can never be used where another is expected.

use std::fmt;

/// Index of a mode in its automaton (0-indexed, in creation order).
///
/// The index also determines the LP column prefix of states in this mode:
/// a mode with id `3` names its variables `m3_i0`, `m3_c0`, and so on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ModeId(usize);

impl ModeId {
    pub fn new(index: usize) -> Self {
        ModeId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl From<ModeId> for usize {
    fn from(id: ModeId) -> Self {
        id.0
    }
}

/// Index of a transition in its automaton (0-indexed, in creation order).
///
/// # Invariants
///
/// - A transition also has a position in its source mode's outgoing list;
///   that position (not this global index) is what reset columns encode
///   in their `_t{k}` suffix.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransitionId(usize);

impl TransitionId {
    pub fn new(index: usize) -> Self {
        TransitionId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TransitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<TransitionId> for usize {
    fn from(id: TransitionId) -> Self {
        id.0
    }
}

/// Index of a transition operation (a successor produced by one guard check) in an aggregation DAG.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpId(usize);

impl OpId {
    pub fn new(index: usize) -> Self {
        OpId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_id() {
        let m0 = ModeId::new(0);
        let m1 = ModeId::new(1);
        assert_eq!(m0.index(), 0);
        assert!(m0 < m1);
        assert_eq!(m1.to_string(), "m1");
        assert_eq!(usize::from(m1), 1);
    }

    #[test]
    fn test_transition_id() {
        let t = TransitionId::new(4);
        assert_eq!(t.index(), 4);
        assert_eq!(t.to_string(), "t4");
    }
}
