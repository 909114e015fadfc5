//! Program operations: the moves realizing one operation.

use super::NodeId;
use crate::machine::{Machine, OpId};
use std::fmt;

/// Index of a program operation in the dependence graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoId(pub usize);

impl fmt::Display for PoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "po{}", self.0)
    }
}

/// Operand and result moves of one executed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramOperation {
    pub id: PoId,
    pub operation: OpId,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    pub input_count: u8,
    pub output_count: u8,
}

impl ProgramOperation {
    pub fn new(id: PoId, operation: OpId, machine: &Machine) -> Self {
        let info = machine.operation(operation);
        Self {
            id,
            operation,
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_count: info.inputs,
            output_count: info.outputs,
        }
    }

    /// All operand moves are present.
    pub fn is_ready(&self) -> bool {
        self.inputs.len() >= self.input_count as usize
    }

    /// All result moves are present.
    pub fn is_complete(&self) -> bool {
        self.is_ready() && self.outputs.len() >= self.output_count as usize
    }

    pub fn add_input(&mut self, node: NodeId) {
        if !self.inputs.contains(&node) {
            self.inputs.push(node);
        }
    }

    pub fn add_output(&mut self, node: NodeId) {
        if !self.outputs.contains(&node) {
            self.outputs.push(node);
        }
    }

    pub fn remove_output(&mut self, node: NodeId) -> bool {
        let before = self.outputs.len();
        self.outputs.retain(|n| *n != node);
        before != self.outputs.len()
    }

    pub fn remove_input(&mut self, node: NodeId) -> bool {
        let before = self.inputs.len();
        self.inputs.retain(|n| *n != node);
        before != self.inputs.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs.iter().chain(self.outputs.iter()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::presets;

    #[test]
    fn test_readiness() {
        let m = presets::minimal().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let mut po = ProgramOperation::new(PoId(0), add, &m);
        assert!(!po.is_ready());
        po.add_input(NodeId(0));
        po.add_input(NodeId(0));
        assert_eq!(po.inputs.len(), 1);
        po.add_input(NodeId(1));
        assert!(po.is_ready());
        assert!(!po.is_complete());
        po.add_output(NodeId(2));
        assert!(po.is_complete());
        assert!(po.remove_output(NodeId(2)));
        assert!(!po.remove_output(NodeId(2)));
    }
}
