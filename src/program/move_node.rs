//! Move nodes: a move plus its scheduling state.

use super::{Move, PoId};
use crate::machine::FuId;
use std::fmt;

/// Index of a move node in the dependence graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One move being scheduled.
///
/// A node is either unscheduled (no cycle) or scheduled at exactly one
/// cycle. Only the resource manager changes that state.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveNode {
    pub id: NodeId,
    pub mv: Move,
    cycle: Option<i32>,
    /// Operation whose result this move reads.
    pub source_operation: Option<PoId>,
    /// Operation whose operand this move writes.
    pub destination_operation: Option<PoId>,
    /// Units allowed for the source operation, set by the copy adder.
    pub allowed_source_units: Option<Vec<FuId>>,
    /// Units allowed for the destination operation, set by the copy adder.
    pub allowed_destination_units: Option<Vec<FuId>>,
    /// Inserted by the copy adder to satisfy connectivity.
    pub connectivity_copy: bool,
    /// Position in the original program order.
    pub order: usize,
    /// Basic block the move came from.
    pub block: usize,
}

impl MoveNode {
    pub fn new(id: NodeId, mv: Move, order: usize, block: usize) -> Self {
        Self {
            id,
            mv,
            cycle: None,
            source_operation: None,
            destination_operation: None,
            allowed_source_units: None,
            allowed_destination_units: None,
            connectivity_copy: false,
            order,
            block,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.cycle.is_some()
    }

    pub fn cycle(&self) -> Option<i32> {
        self.cycle
    }

    pub(crate) fn set_cycle(&mut self, cycle: Option<i32>) {
        self.cycle = cycle;
    }

    pub fn is_source_operation(&self) -> bool {
        self.source_operation.is_some()
    }

    pub fn is_destination_operation(&self) -> bool {
        self.destination_operation.is_some()
    }

    /// Reads a general purpose register.
    pub fn is_source_variable(&self) -> bool {
        self.mv.source.is_register()
    }

    pub fn is_source_immediate(&self) -> bool {
        self.mv.source.is_immediate()
    }

    pub fn is_guarded(&self) -> bool {
        !self.mv.guard.is_unconditional()
    }

    /// True if both nodes belong to one operation as operand or result.
    pub fn in_same_operation(&self, other: &MoveNode) -> bool {
        let mine = [self.source_operation, self.destination_operation];
        let theirs = [other.source_operation, other.destination_operation];
        mine.iter()
            .flatten()
            .any(|po| theirs.iter().flatten().any(|o| o == po))
    }
}
