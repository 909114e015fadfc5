//! Builds dependence graphs from basic blocks.
//!
//! Moves are scanned in program order. Operand moves join the first open
//! program operation of the same kind still lacking that operand, result
//! moves join the latest ready one. Dependences are tracked per register,
//! for the return address and for memory (all memory operations may alias).
//! A single-block loop is scanned twice; edges whose tail was seen in the
//! first scan and whose head in the second become loop-carried edges.
//!
//! The moves of one listing instruction are scanned left to right like
//! consecutive instructions: `RF.1 -> RF.2, RF.2 -> RF.3` copies RF.1 into
//! both registers. Moves that must read before a neighbour writes go first.

use super::{DataDependenceEdge, DataDependenceGraph, DataTag, DependenceType, EdgeReason, GraphId};
use crate::core::{ScheduleResult, SchedulerError};
use crate::machine::{Machine, RegisterRef};
use crate::program::{BasicBlock, Move, NodeId, PoId, Procedure};
use hashbrown::HashMap;

/// A node as seen during one scan of the block.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    node: NodeId,
    iteration: u8,
}

/// Reaching writers and readers of one storage location.
#[derive(Debug, Default)]
struct Access {
    defs: Vec<Stamp>,
    /// Readers since the last unconditional write; `true` for guard reads.
    uses: Vec<(Stamp, bool)>,
}

#[derive(Debug, Default)]
struct BlockState {
    registers: HashMap<RegisterRef, Access>,
    return_address: Access,
    memory: Access,
    open_operations: Vec<PoId>,
    ready_operations: Vec<PoId>,
    earlier_nodes: Vec<NodeId>,
    control_flow_seen: bool,
    iteration: u8,
}

/// Dependence graph builder for one machine.
pub struct DdgBuilder<'m> {
    machine: &'m Machine,
}

impl<'m> DdgBuilder<'m> {
    pub fn new(machine: &'m Machine) -> Self {
        Self { machine }
    }

    /// Graph for a whole procedure: one child graph per block, no edges between blocks.
    pub fn build_procedure(&self, procedure: &Procedure) -> ScheduleResult<DataDependenceGraph> {
        let mut ddg = DataDependenceGraph::new(&procedure.name);
        ddg.set_machine(self.machine);
        for block in &procedure.blocks {
            self.add_block(&mut ddg, block)?;
        }
        log::debug!(
            "Built DDG for {}: {} blocks, {} nodes",
            procedure.name,
            procedure.blocks.len(),
            ddg.root().node_count()
        );
        Ok(ddg)
    }

    /// Graph holding a single block.
    pub fn build_block(&self, block: &BasicBlock) -> ScheduleResult<DataDependenceGraph> {
        let mut ddg = DataDependenceGraph::new(&block.label);
        ddg.set_machine(self.machine);
        self.add_block(&mut ddg, block)?;
        Ok(ddg)
    }

    /// Add `block` to `ddg` as a new child graph. Returns the block index.
    pub fn add_block(&self, ddg: &mut DataDependenceGraph, block: &BasicBlock) -> ScheduleResult<usize> {
        let index = ddg.add_block(&block.label, block.is_loop);
        let graph = ddg.block(index).graph;
        let mut nodes = Vec::with_capacity(block.move_count());
        for mv in block.moves() {
            self.validate_move(mv)?;
            nodes.push(ddg.add_node(graph, *mv, index));
        }

        let mut state = BlockState::default();
        for node in &nodes {
            self.group_operation(ddg, graph, &mut state, *node)?;
            self.add_dependences(ddg, &mut state, *node)?;
        }
        if let Some(po) = state.open_operations.first() {
            let operation = &self.machine.operation(ddg.operation(*po).operation).name;
            return Err(SchedulerError::precondition(format!(
                "operation {} in block {} is missing operands",
                operation, block.label
            )));
        }

        if block.is_loop {
            state.iteration = 1;
            state.control_flow_seen = false;
            for node in &nodes {
                self.add_dependences(ddg, &mut state, *node)?;
            }
        }

        log::debug!(
            "Built DDG for block {}: {} nodes, {} operations",
            block.label,
            nodes.len(),
            ddg.view(graph).operations().len()
        );
        Ok(index)
    }

    fn validate_move(&self, mv: &Move) -> ScheduleResult<()> {
        for terminal in [&mv.source, &mv.destination] {
            if let Some(ft) = terminal.fu_terminal() {
                let info = self.machine.operation(ft.operation);
                if ft.operand == 0 || ft.operand > info.inputs + info.outputs {
                    return Err(SchedulerError::precondition(format!(
                        "{} has no operand {}",
                        info.name, ft.operand
                    )));
                }
                if let Some(fu) = ft.unit {
                    if !self.machine.function_unit(fu).supports(ft.operation) {
                        return Err(SchedulerError::NoUnitSupportsOperation {
                            operation: format!("{} on {}", info.name, self.machine.function_unit(fu).name),
                        });
                    }
                } else if self.machine.units_supporting(ft.operation).next().is_none() {
                    return Err(SchedulerError::NoUnitSupportsOperation {
                        operation: info.name.clone(),
                    });
                }
            }
            if let Some(reg) = terminal.register() {
                if reg.index >= self.machine.register_file(reg.rf).size {
                    return Err(SchedulerError::precondition(format!(
                        "register index {} out of range in {}",
                        reg.index,
                        self.machine.register_file(reg.rf).name
                    )));
                }
            }
        }
        Ok(())
    }

    fn group_operation(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        state: &mut BlockState,
        node: NodeId,
    ) -> ScheduleResult<()> {
        let mv = ddg.node(node).mv;

        if let Some(ft) = mv.destination.fu_terminal() {
            let info = self.machine.operation(ft.operation);
            if !info.is_input(ft.operand) {
                return Err(SchedulerError::precondition(format!(
                    "{} writes result operand {} of {}",
                    mv.display(self.machine),
                    ft.operand,
                    info.name
                )));
            }
            let existing = state.open_operations.iter().copied().find(|po| {
                ddg.operation(*po).operation == ft.operation && !has_operand(ddg, *po, ft.operand)
            });
            let po = match existing {
                Some(po) => po,
                None => {
                    let po = ddg.add_program_operation(graph, ft.operation, self.machine);
                    state.open_operations.push(po);
                    po
                }
            };
            ddg.set_destination_operation(node, po);
            if ddg.operation(po).is_ready() {
                state.open_operations.retain(|p| *p != po);
                state.ready_operations.push(po);
            }
        }

        if let Some(ft) = mv.source.fu_terminal() {
            let info = self.machine.operation(ft.operation);
            if !info.is_output(ft.operand) {
                return Err(SchedulerError::precondition(format!(
                    "{} reads input operand {} of {}",
                    mv.display(self.machine),
                    ft.operand,
                    info.name
                )));
            }
            let po = state
                .ready_operations
                .iter()
                .rev()
                .copied()
                .find(|po| ddg.operation(*po).operation == ft.operation)
                .ok_or_else(|| {
                    SchedulerError::precondition(format!(
                        "{} reads a result of {} before it is triggered",
                        mv.display(self.machine),
                        info.name
                    ))
                })?;
            ddg.set_source_operation(node, po);
            let inputs = ddg.operation(po).inputs.clone();
            for input in inputs {
                ddg.connect_or_merge(input, node, DataDependenceEdge::operation(ft.operation));
            }
        }
        Ok(())
    }

    /// True if `mv` writes the triggering operand of its operation.
    fn is_trigger(&self, mv: &Move) -> bool {
        let Some(ft) = mv.destination.fu_terminal() else {
            return false;
        };
        let trigger = match ft.unit {
            Some(fu) => self.machine.trigger_operand_on(fu, ft.operation),
            None => self.machine.trigger_operand(ft.operation),
        };
        trigger == Some(ft.operand)
    }

    fn add_dependences(
        &self,
        ddg: &mut DataDependenceGraph,
        state: &mut BlockState,
        node: NodeId,
    ) -> ScheduleResult<()> {
        let mv = ddg.node(node).mv;
        if state.control_flow_seen {
            return Err(SchedulerError::precondition(format!(
                "{} follows the control flow operation of its block",
                mv.display(self.machine)
            )));
        }
        let me = Stamp {
            node,
            iteration: state.iteration,
        };

        if let Some(reg) = mv.source.register() {
            let access = state.registers.entry(reg).or_default();
            read(ddg, access, me, EdgeReason::Register, DataTag::Register(reg), false);
        }
        if let Some(reg) = mv.guard.register() {
            let access = state.registers.entry(reg).or_default();
            read(ddg, access, me, EdgeReason::Register, DataTag::Register(reg), true);
        }
        if mv.source.is_return_address() {
            read(ddg, &mut state.return_address, me, EdgeReason::Ra, DataTag::ReturnAddress, false);
        }

        let trigger = self.is_trigger(&mv);
        let info = mv
            .destination
            .fu_terminal()
            .map(|ft| self.machine.operation(ft.operation));
        if let (true, Some(info)) = (trigger, info) {
            if info.reads_memory || info.has_side_effects {
                read(ddg, &mut state.memory, me, EdgeReason::Memory, DataTag::Memory, false);
            }
            if info.writes_memory || info.has_side_effects {
                write(ddg, &mut state.memory, me, EdgeReason::Memory, DataTag::Memory);
            }
            if info.is_call {
                write(ddg, &mut state.return_address, me, EdgeReason::Ra, DataTag::ReturnAddress);
            }
        }

        if let Some(reg) = mv.destination.register() {
            let access = state.registers.entry(reg).or_default();
            write(ddg, access, me, EdgeReason::Register, DataTag::Register(reg));
        }
        if mv.destination.is_return_address() {
            write(ddg, &mut state.return_address, me, EdgeReason::Ra, DataTag::ReturnAddress);
        }

        if let (true, Some(info)) = (trigger, info) {
            if info.control_flow {
                if state.iteration == 0 {
                    let pseudo = DataDependenceEdge::new(EdgeReason::FuState, DependenceType::Unknown, DataTag::None)
                        .with_head_pseudo();
                    for earlier in &state.earlier_nodes {
                        if !ddg.node(*earlier).in_same_operation(ddg.node(node)) {
                            ddg.connect_or_merge(*earlier, node, pseudo);
                        }
                    }
                }
                state.control_flow_seen = true;
            }
        }
        if state.iteration == 0 {
            state.earlier_nodes.push(node);
        }
        Ok(())
    }
}

fn has_operand(ddg: &DataDependenceGraph, po: PoId, operand: u8) -> bool {
    ddg.operation(po).inputs.iter().any(|i| {
        ddg.node(*i)
            .mv
            .destination
            .fu_terminal()
            .is_some_and(|t| t.operand == operand)
    })
}

fn exclusive(ddg: &DataDependenceGraph, a: NodeId, b: NodeId) -> bool {
    ddg.node(a).mv.guard.excludes(&ddg.node(b).mv.guard)
}

fn link(ddg: &mut DataDependenceGraph, tail: Stamp, head: Stamp, edge: DataDependenceEdge) {
    if tail.node == head.node {
        return;
    }
    let depth = head.iteration.saturating_sub(tail.iteration);
    if depth == 0 && head.iteration > 0 {
        // Already added by the first scan.
        return;
    }
    let edge = if depth > 0 { edge.loop_carried(depth) } else { edge };
    ddg.connect_or_merge(tail.node, head.node, edge);
}

fn read(
    ddg: &mut DataDependenceGraph,
    access: &mut Access,
    reader: Stamp,
    reason: EdgeReason,
    data: DataTag,
    guard_use: bool,
) {
    let mut edge = DataDependenceEdge::new(reason, DependenceType::Raw, data);
    edge.guard_use = guard_use;
    for def in access.defs.clone() {
        if !exclusive(ddg, def.node, reader.node) {
            link(ddg, def, reader, edge);
        }
    }
    access.uses.push((reader, guard_use));
}

fn write(ddg: &mut DataDependenceGraph, access: &mut Access, writer: Stamp, reason: EdgeReason, data: DataTag) {
    for (reader, guard_use) in access.uses.clone() {
        if !exclusive(ddg, reader.node, writer.node) {
            let mut edge = DataDependenceEdge::new(reason, DependenceType::War, data);
            edge.guard_use = guard_use;
            link(ddg, reader, writer, edge);
        }
    }
    for def in access.defs.clone() {
        if !exclusive(ddg, def.node, writer.node) {
            link(ddg, def, writer, DataDependenceEdge::new(reason, DependenceType::Waw, data));
        }
    }
    let guard = ddg.node(writer.node).mv.guard;
    if guard.is_unconditional() {
        access.defs = vec![writer];
        access.uses.clear();
    } else {
        access.defs.retain(|d| ddg.node(d.node).mv.guard != guard);
        access.defs.push(writer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{presets, Guard, RfId};
    use crate::program::Terminal;

    fn reg(i: u16) -> Terminal {
        Terminal::Register(RegisterRef::new(RfId(0), i))
    }

    fn edge_kinds(ddg: &DataDependenceGraph, tail: usize, head: usize) -> Vec<(EdgeReason, DependenceType, u8)> {
        ddg.edge_entries()
            .filter(|(_, e)| e.tail == NodeId(tail) && e.head == NodeId(head))
            .map(|(_, e)| (e.edge.reason, e.edge.kind, e.edge.loop_depth))
            .collect()
    }

    #[test]
    fn test_register_and_operation_edges() {
        let m = presets::minimal().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(Terminal::Immediate(5), reg(1))],
            vec![Move::new(reg(1), Terminal::fu_port(add, 1))],
            vec![Move::new(reg(2), Terminal::fu_port(add, 2))],
            vec![Move::new(Terminal::fu_port(add, 3), reg(1))],
        ];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        assert_eq!(edge_kinds(&ddg, 0, 1), vec![(EdgeReason::Register, DependenceType::Raw, 0)]);
        assert_eq!(edge_kinds(&ddg, 1, 3)[0].0, EdgeReason::Operation);
        assert!(edge_kinds(&ddg, 1, 3).contains(&(EdgeReason::Register, DependenceType::War, 0)));
        assert!(edge_kinds(&ddg, 0, 3).contains(&(EdgeReason::Register, DependenceType::Waw, 0)));
        assert_eq!(ddg.operation_count(), 1);
        assert!(ddg.operation(PoId(0)).is_complete());
    }

    #[test]
    fn test_moves_of_one_instruction_are_ordered() {
        let m = presets::minimal().unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![vec![Move::new(reg(1), reg(2)), Move::new(reg(2), reg(3))]];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        assert_eq!(edge_kinds(&ddg, 0, 1), vec![(EdgeReason::Register, DependenceType::Raw, 0)]);
        assert!(edge_kinds(&ddg, 1, 0).is_empty());

        // Reading first gives the parallel meaning.
        block.instructions = vec![vec![Move::new(reg(2), reg(3)), Move::new(reg(1), reg(2))]];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        assert_eq!(edge_kinds(&ddg, 0, 1), vec![(EdgeReason::Register, DependenceType::War, 0)]);
    }

    #[test]
    fn test_exclusive_guards_do_not_depend() {
        let m = presets::minimal().unwrap();
        let b = m.rf_by_name("BOOL").unwrap();
        let g = Guard::Register {
            reg: RegisterRef::new(b, 0),
            inverted: false,
        };
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::guarded(Terminal::Immediate(1), reg(1), g)],
            vec![Move::guarded(Terminal::Immediate(2), reg(1), g.inverse())],
        ];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        assert!(edge_kinds(&ddg, 0, 1).is_empty());
    }

    #[test]
    fn test_result_before_trigger_is_rejected() {
        let m = presets::minimal().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![vec![Move::new(Terminal::fu_port(add, 3), reg(1))]];
        let err = DdgBuilder::new(&m).build_block(&block).unwrap_err();
        assert!(matches!(err, SchedulerError::Precondition { .. }));
    }

    #[test]
    fn test_loop_carried_edges() {
        let m = presets::minimal().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let mut block = BasicBlock::new("loop");
        block.is_loop = true;
        block.instructions = vec![
            vec![Move::new(reg(1), Terminal::fu_port(add, 1))],
            vec![Move::new(Terminal::Immediate(1), Terminal::fu_port(add, 2))],
            vec![Move::new(Terminal::fu_port(add, 3), reg(1))],
        ];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        assert!(edge_kinds(&ddg, 2, 0).contains(&(EdgeReason::Register, DependenceType::Raw, 1)));
        assert!(edge_kinds(&ddg, 0, 2).contains(&(EdgeReason::Register, DependenceType::War, 0)));
    }

    #[test]
    fn test_memory_and_jump_edges() {
        let m = presets::minimal().unwrap();
        let stw = m.operation_by_name("stw").unwrap();
        let ldw = m.operation_by_name("ldw").unwrap();
        let jump = m.operation_by_name("jump").unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(1), Terminal::fu_port(stw, 1))],
            vec![Move::new(reg(2), Terminal::fu_port(stw, 2))],
            vec![Move::new(reg(1), Terminal::fu_port(ldw, 1))],
            vec![Move::new(Terminal::fu_port(ldw, 2), reg(3))],
            vec![Move::new(Terminal::InstructionAddress(0), Terminal::fu_port(jump, 1))],
        ];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let stw_trigger = m.trigger_operand(stw).unwrap() as usize - 1;
        assert!(edge_kinds(&ddg, stw_trigger, 2).contains(&(EdgeReason::Memory, DependenceType::Raw, 0)));
        for tail in 0..4 {
            assert!(ddg
                .edge_entries()
                .any(|(_, e)| e.tail == NodeId(tail) && e.head == NodeId(4) && e.edge.head_pseudo));
        }

        block.instructions.push(vec![Move::new(reg(1), reg(2))]);
        assert!(DdgBuilder::new(&m).build_block(&block).is_err());
    }
}
