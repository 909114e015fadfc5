//! Consistency check of edge claims against the moves they connect.

use super::{DataDependenceGraph, DataTag, DependenceType, EdgeEntry, EdgeReason, GraphId};
use crate::core::{ScheduleResult, SchedulerError};
use crate::machine::{Machine, RegisterRef};
use crate::program::{MoveNode, Terminal};

impl DataDependenceGraph {
    /// Check every visible edge of `graph`.
    ///
    /// Fails with an internal invariant error naming the first offending pair of moves.
    pub fn sanity_check(&self, graph: GraphId, machine: &Machine) -> ScheduleResult<()> {
        let view = self.view(graph);
        for (id, entry) in self.edge_entries() {
            if !view.edge_visible(id) {
                continue;
            }
            if let Err(reason) = self.check_edge(entry, machine) {
                let tail = self.node(entry.tail);
                let head = self.node(entry.head);
                return Err(SchedulerError::InternalInvariant {
                    reason: format!(
                        "edge {} from '{}' to '{}': {}",
                        entry.edge.display(Some(machine)),
                        tail.mv.display(machine),
                        head.mv.display(machine),
                        reason
                    ),
                    dot: Some(self.dot_string(graph, Some(machine))),
                });
            }
        }
        log::trace!("Sanity check of {} passed", view.name());
        Ok(())
    }

    fn check_edge(&self, entry: &EdgeEntry, machine: &Machine) -> Result<(), String> {
        let edge = &entry.edge;
        let tail = self.node(entry.tail);
        let head = self.node(entry.head);
        match edge.reason {
            EdgeReason::Register => {
                let DataTag::Register(reg) = edge.data else {
                    return Err("register edge without a register".into());
                };
                match edge.kind {
                    DependenceType::Raw => {
                        expect(writes(tail, reg), "tail does not write the register")?;
                        let reads = if edge.guard_use {
                            head.mv.guard.register() == Some(reg)
                        } else {
                            head.mv.source.register() == Some(reg)
                        };
                        expect(reads, "head does not read the register")
                    }
                    DependenceType::War => {
                        let reads = if edge.guard_use {
                            tail.mv.guard.register() == Some(reg)
                        } else {
                            tail.mv.source.register() == Some(reg)
                        };
                        expect(reads || edge.tail_pseudo, "tail does not read the register")?;
                        expect(writes(head, reg) || edge.head_pseudo, "head does not write the register")
                    }
                    DependenceType::Waw => {
                        expect(writes(tail, reg) || edge.tail_pseudo, "tail does not write the register")?;
                        expect(writes(head, reg) || edge.head_pseudo, "head does not write the register")
                    }
                    DependenceType::Unknown => Ok(()),
                }
            }
            EdgeReason::Operation => expect(
                tail.destination_operation.is_some()
                    && tail.destination_operation == head.source_operation,
                "operation edge outside one operation",
            ),
            EdgeReason::Memory => {
                expect(touches_memory(tail, machine), "tail is not a memory operation")?;
                expect(touches_memory(head, machine), "head is not a memory operation")
            }
            EdgeReason::Ra => expect(
                touches_return_address(tail, machine) && touches_return_address(head, machine),
                "return address edge between moves not using it",
            ),
            EdgeReason::FuState => {
                if edge.head_pseudo {
                    expect(is_control_flow(head, machine), "pseudo edge head is not control flow")
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn expect(condition: bool, reason: &str) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(reason.to_string())
    }
}

fn writes(node: &MoveNode, reg: RegisterRef) -> bool {
    node.mv.destination.register() == Some(reg)
}

fn operation_of<'m>(node: &MoveNode, machine: &'m Machine) -> Option<&'m crate::machine::OperationInfo> {
    node.mv
        .destination
        .fu_terminal()
        .map(|ft| machine.operation(ft.operation))
}

fn touches_memory(node: &MoveNode, machine: &Machine) -> bool {
    operation_of(node, machine).is_some_and(|op| op.uses_memory() || op.has_side_effects)
}

fn touches_return_address(node: &MoveNode, machine: &Machine) -> bool {
    matches!(node.mv.source, Terminal::ReturnAddress)
        || matches!(node.mv.destination, Terminal::ReturnAddress)
        || operation_of(node, machine).is_some_and(|op| op.is_call)
}

fn is_control_flow(node: &MoveNode, machine: &Machine) -> bool {
    operation_of(node, machine).is_some_and(|op| op.control_flow)
}

#[cfg(test)]
mod tests {
    use crate::core::SchedulerError;
    use crate::ddg::{DataDependenceEdge, DdgBuilder, DependenceType, GraphId};
    use crate::machine::{presets, RegisterRef, RfId};
    use crate::program::{BasicBlock, Move, NodeId, Terminal};

    #[test]
    fn test_built_graph_is_sane_and_bogus_edge_is_not() {
        let m = presets::minimal().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let r = |i| Terminal::Register(RegisterRef::new(RfId(0), i));
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(r(1), Terminal::fu_port(add, 1))],
            vec![Move::new(r(2), Terminal::fu_port(add, 2))],
            vec![Move::new(Terminal::fu_port(add, 3), r(1))],
        ];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        ddg.sanity_check(GraphId::ROOT, &m).unwrap();

        ddg.connect_nodes(
            NodeId(1),
            NodeId(2),
            DataDependenceEdge::register(DependenceType::Raw, RegisterRef::new(RfId(0), 7)),
        );
        match ddg.sanity_check(GraphId::ROOT, &m) {
            Err(SchedulerError::InternalInvariant { reason, dot }) => {
                assert!(reason.contains("RF.2 -> add.2"));
                assert!(dot.is_some_and(|d| d.contains("digraph")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
