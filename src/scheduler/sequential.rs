//! First-fit scheduling in program order.
//!
//! Every move goes to the first cycle after the previous move where its
//! dependences and resources allow it. A trigger waits for the operands that
//! follow it in the listing. Operation latencies and delay slots show up as
//! NOP instructions. Nothing is ever moved once placed.

use super::{block_end, BlockScheduler, RegisterCopyAdder, ScheduledBlock};
use crate::core::{ScheduleResult, SchedulerError, SchedulingSession};
use crate::ddg::{CycleQuery, DataDependenceGraph, DependenceType, GraphId};
use crate::machine::Machine;
use crate::program::NodeId;
use crate::resource::{AssignOptions, BusChoice, SimpleResourceManager};

pub struct SequentialScheduler<'m> {
    machine: &'m Machine,
}

impl<'m> SequentialScheduler<'m> {
    pub fn new(machine: &'m Machine) -> Self {
        Self { machine }
    }

    fn schedule_node(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        rm: &mut SimpleResourceManager<'m>,
        node: NodeId,
        last: &mut i32,
        session: &SchedulingSession,
    ) -> ScheduleResult<()> {
        if ddg.node(node).is_scheduled() {
            return Ok(());
        }
        for pred in copies_around(ddg, graph, node, true) {
            self.schedule_node(ddg, graph, rm, pred, last, session)?;
        }

        let start = (*last + 1).max(0);
        if let Some(BusChoice::ViaRegister(reg)) = rm.find_bus(ddg, start, node)? {
            let copy = RegisterCopyAdder::new(self.machine)
                .with_reserved(rm.reserved_registers())
                .split_through_register(ddg, node, reg)?;
            session.record_copies_added(1);
            log::debug!("Routed {} through {} with {}", node, self.machine.register_name(reg), copy);
            return self.schedule_node(ddg, graph, rm, node, last, session);
        }

        let dependences = ddg
            .view(graph)
            .earliest_cycle(node, 0, CycleQuery::default())?
            .ok_or_else(|| {
                SchedulerError::invariant(format!("{} has an unscheduled predecessor in program order", node))
            })?;
        let from = dependences.max(start);
        let cycle = rm
            .earliest_cycle(ddg, from, node, AssignOptions::default())
            .ok_or_else(|| SchedulerError::SchedulingFailed {
                node: format!("{} ({})", node, ddg.node(node).mv.display(self.machine)),
                reason: format!("no free resources from cycle {}", from),
            })?;
        rm.assign(ddg, cycle, node, AssignOptions::default())?;
        *last = cycle;

        for succ in copies_around(ddg, graph, node, false) {
            self.schedule_node(ddg, graph, rm, succ, last, session)?;
        }
        Ok(())
    }

    /// True if `node` triggers an operation with operands still to come.
    fn waits_for_operands(&self, ddg: &DataDependenceGraph, node: NodeId) -> bool {
        let Some(po) = ddg.node(node).destination_operation else {
            return false;
        };
        ddg.trigger_of(po, self.machine) == Some(node)
            && ddg
                .operation(po)
                .inputs
                .iter()
                .any(|n| *n != node && !ddg.node(*n).is_scheduled())
    }
}

impl BlockScheduler for SequentialScheduler<'_> {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn schedule_block(
        &mut self,
        ddg: &mut DataDependenceGraph,
        block: usize,
        session: &mut SchedulingSession,
    ) -> ScheduleResult<ScheduledBlock> {
        let info = ddg.block(block).clone();
        let graph = info.graph;
        let mut rm = SimpleResourceManager::new(self.machine, 0);
        rm.reserve_registers(ddg.program_registers());
        let mut last = -1;
        let mut waiting: Vec<NodeId> = Vec::new();

        for node in ddg.view(graph).nodes() {
            if ddg.node(node).is_scheduled() {
                continue;
            }
            if self.waits_for_operands(ddg, node) {
                waiting.push(node);
                continue;
            }
            self.schedule_node(ddg, graph, &mut rm, node, &mut last, session)?;
            while let Some(pos) = waiting.iter().position(|t| !self.waits_for_operands(ddg, *t)) {
                let trigger = waiting.remove(pos);
                self.schedule_node(ddg, graph, &mut rm, trigger, &mut last, session)?;
            }
        }
        if let Some(trigger) = waiting.first() {
            return Err(SchedulerError::invariant(format!(
                "trigger {} of {} never got its operands",
                trigger, info.label
            )));
        }

        let instructions = match block_end(ddg, graph, self.machine) {
            Some(end) => rm.commit(rm.smallest_cycle().unwrap_or(0).min(0), end),
            None => Vec::new(),
        };
        session.record_region_scheduled(&info.label, ddg.view(graph).node_count(), instructions.len());
        log::debug!(
            "Scheduled {} sequentially in {} instructions",
            info.label,
            instructions.len()
        );
        Ok(ScheduledBlock {
            label: info.label,
            instructions,
            loop_schedule: None,
        })
    }
}

/// Unscheduled connectivity copies feeding (`before`) or fed by `node`.
fn copies_around(ddg: &DataDependenceGraph, graph: GraphId, node: NodeId, before: bool) -> Vec<NodeId> {
    let view = ddg.view(graph);
    let edges = if before { view.in_edges(node) } else { view.out_edges(node) };
    edges
        .into_iter()
        .filter_map(|e| ddg.edge(e))
        .filter(|entry| {
            entry.edge.kind == DependenceType::Raw && !entry.edge.guard_use && !entry.edge.back_edge
        })
        .map(|entry| if before { entry.tail } else { entry.head })
        .filter(|n| *n != node && ddg.node(*n).connectivity_copy && !ddg.node(*n).is_scheduled())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddg::DdgBuilder;
    use crate::machine::{presets, RegisterRef};
    use crate::program::{BasicBlock, Move, Terminal};

    fn reg(m: &Machine, rf: &str, i: u16) -> Terminal {
        Terminal::Register(RegisterRef::new(m.rf_by_name(rf).unwrap(), i))
    }

    fn schedule(m: &Machine, block: &BasicBlock) -> (DataDependenceGraph, ScheduledBlock, SchedulingSession) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut ddg = DdgBuilder::new(m).build_block(block).unwrap();
        let mut session = SchedulingSession::new();
        let scheduled = SequentialScheduler::new(m)
            .schedule_block(&mut ddg, 0, &mut session)
            .unwrap();
        (ddg, scheduled, session)
    }

    fn cycles(ddg: &DataDependenceGraph, count: usize) -> Vec<Option<i32>> {
        (0..count).map(|i| ddg.node(NodeId(i)).cycle()).collect()
    }

    #[test]
    fn test_program_order_with_latency() {
        let m = presets::minimal().unwrap();
        let mul = m.operation_by_name("mul").unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(&m, "RF", 1), Terminal::fu_port(mul, 1))],
            vec![Move::new(reg(&m, "RF", 2), Terminal::fu_port(mul, 2))],
            vec![Move::new(Terminal::fu_port(mul, 3), reg(&m, "RF", 3))],
            vec![Move::new(reg(&m, "RF", 3), reg(&m, "RF", 4))],
        ];
        let (ddg, scheduled, session) = schedule(&m, &block);
        assert_eq!(cycles(&ddg, 4), vec![Some(0), Some(1), Some(4), Some(5)]);
        assert_eq!(scheduled.instructions.len(), 6);
        assert!(scheduled.instructions[2].is_nop());
        assert!(scheduled.instructions[3].is_nop());
        assert_eq!(session.stats().moves_scheduled, 4);
    }

    #[test]
    fn test_trigger_waits_for_late_operand() {
        let m = presets::minimal().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(&m, "RF", 2), Terminal::fu_port(add, 2))],
            vec![Move::new(reg(&m, "RF", 1), Terminal::fu_port(add, 1))],
            vec![Move::new(Terminal::fu_port(add, 3), reg(&m, "RF", 3))],
        ];
        let (ddg, _, _) = schedule(&m, &block);
        assert_eq!(cycles(&ddg, 3), vec![Some(1), Some(0), Some(2)]);
    }

    #[test]
    fn test_delay_slots_padded() {
        let m = presets::minimal().unwrap();
        let jump = m.operation_by_name("jump").unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(&m, "RF", 1), reg(&m, "RF", 2))],
            vec![Move::new(Terminal::InstructionAddress(0), Terminal::fu_port(jump, 1))],
        ];
        let (ddg, scheduled, _) = schedule(&m, &block);
        assert_eq!(cycles(&ddg, 2), vec![Some(0), Some(1)]);
        assert_eq!(scheduled.instructions.len(), 3);
        assert!(scheduled.instructions[2].is_nop());
    }

    #[test]
    fn test_unconnected_move_routed_through_register() {
        let m = presets::clustered().unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![vec![Move::new(reg(&m, "RFA", 1), reg(&m, "RFC", 1))]];
        let (ddg, scheduled, session) = schedule(&m, &block);
        assert_eq!(ddg.root().node_count(), 2);
        let copy = NodeId(1);
        assert!(ddg.node(copy).connectivity_copy);
        assert_eq!(ddg.node(copy).cycle(), Some(0));
        assert_eq!(ddg.node(NodeId(0)).cycle(), Some(1));
        assert_eq!(ddg.node(copy).mv.destination, reg(&m, "RFB", 7));
        assert_eq!(scheduled.instructions.len(), 2);
        assert_eq!(session.stats().copies_added, 1);
    }
}
