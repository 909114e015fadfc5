//! Greedy top-down list scheduling of one basic block.
//!
//! Ready units are picked by their longest path to a sink. A unit is either
//! the operand moves of one operation (non-trigger operands first, trigger
//! last, then the results that are ready) or a single move. When an
//! operation cannot be completed its moves are unassigned and the whole
//! operation is retried one cycle later.
//!
//! With bypassing enabled an operand reading a register written by a
//! scheduled result move may read the result port directly. The bypass is
//! kept only when it lets the operand go earlier.

use super::{block_end, BlockScheduler, RegisterCopyAdder, ScheduledBlock, SchedulerOptions};
use crate::core::{ScheduleResult, SchedulerError, SchedulingSession};
use crate::ddg::{CycleQuery, DataDependenceGraph, GraphId};
use crate::machine::Machine;
use crate::program::{NodeId, PoId};
use crate::resource::{AssignOptions, BusChoice, SimpleResourceManager};
use hashbrown::{HashMap, HashSet};
use std::cmp::Reverse;

/// Times an operation is restarted one cycle later before giving up.
const MAX_OPERATION_ATTEMPTS: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Operation(PoId),
    Move(NodeId),
}

/// Outcome of placing one move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    At(i32),
    NoRoom,
    /// A connectivity copy was added; readiness must be recomputed.
    Split,
}

pub struct ListScheduler<'m> {
    machine: &'m Machine,
    options: SchedulerOptions,
}

impl<'m> ListScheduler<'m> {
    pub fn new(machine: &'m Machine, options: SchedulerOptions) -> Self {
        Self { machine, options }
    }

    /// Ready units, preferring operations whose results can follow right away.
    fn ready_units(&self, ddg: &DataDependenceGraph, graph: GraphId) -> Vec<Unit> {
        let view = ddg.view(graph);
        let mut units = Vec::new();
        let mut operations = Vec::new();
        let mut seen = HashSet::new();
        for node in view.unscheduled_nodes() {
            match ddg.node(node).destination_operation {
                Some(po) => {
                    if seen.insert(po) && self.operation_ready(ddg, graph, po) {
                        operations.push(po);
                    }
                }
                None => {
                    if move_ready(ddg, graph, node) {
                        units.push(Unit::Move(node));
                    }
                }
            }
        }
        let complete: Vec<PoId> = operations
            .iter()
            .copied()
            .filter(|po| self.results_follow(ddg, graph, *po))
            .collect();
        let operations = if complete.is_empty() { operations } else { complete };
        units.extend(operations.into_iter().map(Unit::Operation));
        units
    }

    /// Every operand's predecessors outside the operation are scheduled.
    fn operation_ready(&self, ddg: &DataDependenceGraph, graph: GraphId, po: PoId) -> bool {
        let inputs = &ddg.operation(po).inputs;
        inputs
            .iter()
            .filter(|n| ddg.view(graph).contains(**n) && !ddg.node(**n).is_scheduled())
            .all(|n| waits_only_on(ddg, graph, *n, inputs))
    }

    /// The results of `po` depend on nothing unscheduled but its operands.
    fn results_follow(&self, ddg: &DataDependenceGraph, graph: GraphId, po: PoId) -> bool {
        let operation = ddg.operation(po);
        operation
            .outputs
            .iter()
            .filter(|n| ddg.view(graph).contains(**n) && !ddg.node(**n).is_scheduled())
            .filter(|n| !ddg.node(**n).is_destination_operation())
            .all(|n| waits_only_on(ddg, graph, *n, &operation.inputs))
    }

    /// Pending result reads first, then the longest path to a sink, then program order.
    fn pick(&self, ddg: &DataDependenceGraph, units: &[Unit], sinks: &HashMap<NodeId, i32>) -> Option<Unit> {
        units.iter().copied().max_by_key(|unit| {
            let nodes: Vec<NodeId> = match unit {
                Unit::Operation(po) => ddg.operation(*po).inputs.clone(),
                Unit::Move(n) => vec![*n],
            };
            let result_read = matches!(unit, Unit::Move(n) if ddg.node(*n).is_source_operation());
            let distance = nodes.iter().filter_map(|n| sinks.get(n)).copied().max().unwrap_or(0);
            let first = nodes
                .iter()
                .map(|n| (ddg.node(*n).order, n.0))
                .min()
                .unwrap_or((usize::MAX, usize::MAX));
            (result_read, distance, Reverse(first))
        })
    }

    /// Earliest cycle allowed by both dependences and resources, not before `min`.
    fn earliest_feasible(
        &self,
        ddg: &DataDependenceGraph,
        graph: GraphId,
        rm: &SimpleResourceManager<'m>,
        node: NodeId,
        min: i32,
    ) -> ScheduleResult<Option<i32>> {
        let dependences = ddg
            .view(graph)
            .earliest_cycle(node, 0, CycleQuery::default())?
            .ok_or_else(|| SchedulerError::invariant(format!("{} scheduled before its predecessors", node)))?;
        Ok(rm.earliest_cycle(ddg, dependences.max(min), node, AssignOptions::default()))
    }

    /// Route `node` through a scratch register if no bus connects its ends.
    fn split_if_unconnected(
        &self,
        ddg: &mut DataDependenceGraph,
        rm: &SimpleResourceManager<'m>,
        node: NodeId,
        cycle: i32,
        session: &SchedulingSession,
    ) -> ScheduleResult<bool> {
        let Some(BusChoice::ViaRegister(reg)) = rm.find_bus(ddg, cycle, node)? else {
            return Ok(false);
        };
        let copy = RegisterCopyAdder::new(self.machine)
            .with_reserved(rm.reserved_registers())
            .split_through_register(ddg, node, reg)?;
        session.record_copies_added(1);
        log::debug!("Routed {} through {} with {}", node, self.machine.register_name(reg), copy);
        Ok(true)
    }

    /// Scheduled result move `node` could read its value from, if bypassing is worth a try.
    fn bypass_source(&self, ddg: &DataDependenceGraph, graph: GraphId, node: NodeId) -> Option<NodeId> {
        let def = ddg.view(graph).only_register_raw_source(node)?;
        let def_node = ddg.node(def);
        let guard = ddg.node(node).mv.guard;
        let same_condition = def_node.mv.guard.is_unconditional() || def_node.mv.guard == guard;
        (def_node.is_scheduled()
            && def_node.is_source_operation()
            && !def_node.is_destination_operation()
            && same_condition
            && ddg.merge_and_keep_allowed(def, node))
        .then_some(def)
    }

    #[allow(clippy::too_many_arguments)]
    fn place_operand(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        rm: &mut SimpleResourceManager<'m>,
        node: NodeId,
        min: i32,
        merged: &mut Vec<(NodeId, NodeId)>,
        session: &SchedulingSession,
    ) -> ScheduleResult<Placement> {
        if self.split_if_unconnected(ddg, rm, node, min.max(0), session)? {
            return Ok(Placement::Split);
        }
        let plain = self.earliest_feasible(ddg, graph, rm, node, min)?;
        let mut choice = plain;
        if self.options.bypass {
            if let Some(def) = self.bypass_source(ddg, graph, node) {
                ddg.merge_and_keep(def, node)?;
                let bypassed = self.earliest_feasible(ddg, graph, rm, node, min)?;
                let better = match (bypassed, plain) {
                    (Some(b), Some(p)) => b < p,
                    (Some(_), None) => true,
                    _ => false,
                };
                if better {
                    log::debug!("Bypassing {} into {}: {:?} instead of {:?}", def, node, bypassed, plain);
                    merged.push((def, node));
                    choice = bypassed;
                } else {
                    ddg.un_merge(def, node)?;
                }
            }
        }
        match choice {
            Some(cycle) => {
                rm.assign(ddg, cycle, node, AssignOptions::default())?;
                Ok(Placement::At(cycle))
            }
            None => Ok(Placement::NoRoom),
        }
    }

    /// Schedule the operands and ready results of `po`. Returns true if the graph changed shape.
    fn schedule_operation(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        rm: &mut SimpleResourceManager<'m>,
        po: PoId,
        session: &SchedulingSession,
    ) -> ScheduleResult<bool> {
        let trigger = ddg.trigger_of(po, self.machine);
        let pending = |ddg: &DataDependenceGraph, n: &NodeId| {
            ddg.view(graph).contains(*n) && !ddg.node(*n).is_scheduled()
        };
        let mut inputs: Vec<NodeId> = ddg
            .operation(po)
            .inputs
            .iter()
            .copied()
            .filter(|n| pending(ddg, n) && Some(*n) != trigger)
            .collect();
        inputs.sort_by_key(|n| (ddg.node(*n).order, n.0));
        if let Some(t) = trigger.filter(|t| pending(ddg, t)) {
            inputs.push(t);
        }

        let mut min = 0;
        for _ in 0..MAX_OPERATION_ATTEMPTS {
            let mut placed: Vec<(NodeId, i32)> = Vec::new();
            let mut merged = Vec::new();
            let mut outcome = Placement::At(min);
            for node in &inputs {
                outcome = self.place_operand(ddg, graph, rm, *node, min, &mut merged, session)?;
                match outcome {
                    Placement::At(cycle) => placed.push((*node, cycle)),
                    _ => break,
                }
            }
            if matches!(outcome, Placement::At(_)) {
                outcome = self.schedule_results(ddg, graph, rm, po, &mut placed, session)?;
            }
            if matches!(outcome, Placement::At(_)) {
                for _ in &merged {
                    session.record_bypass();
                }
                return Ok(false);
            }

            let first = placed.first().map_or(min, |(_, c)| *c);
            for (node, _) in placed.iter().rev() {
                rm.unassign(ddg, *node)?;
            }
            for (def, node) in merged.iter().rev() {
                ddg.un_merge(*def, *node)?;
            }
            if outcome == Placement::Split {
                return Ok(true);
            }
            min = first.max(min) + 1;
            log::trace!("Restarting {} at cycle {}", po, min);
        }
        Err(SchedulerError::SchedulingFailed {
            node: format!("{} ({})", po, self.machine.operation(ddg.operation(po).operation).name),
            reason: format!("no placement after {} attempts", MAX_OPERATION_ATTEMPTS),
        })
    }

    /// Place the result reads of `po` whose other predecessors are scheduled.
    fn schedule_results(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        rm: &mut SimpleResourceManager<'m>,
        po: PoId,
        placed: &mut Vec<(NodeId, i32)>,
        session: &SchedulingSession,
    ) -> ScheduleResult<Placement> {
        let outputs = ddg.operation(po).outputs.clone();
        for node in outputs {
            let mn = ddg.node(node);
            if !ddg.view(graph).contains(node)
                || mn.is_scheduled()
                || mn.is_destination_operation()
                || !move_ready(ddg, graph, node)
            {
                continue;
            }
            // The result keeps its read; the copy goes after it.
            self.split_if_unconnected(ddg, rm, node, 0, session)?;
            match self.earliest_feasible(ddg, graph, rm, node, 0)? {
                Some(cycle) => {
                    rm.assign(ddg, cycle, node, AssignOptions::default())?;
                    placed.push((node, cycle));
                }
                None => return Ok(Placement::NoRoom),
            }
        }
        Ok(Placement::At(0))
    }

    /// Schedule a lone move. Returns true if the graph changed shape.
    fn schedule_move(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        rm: &mut SimpleResourceManager<'m>,
        node: NodeId,
        session: &SchedulingSession,
    ) -> ScheduleResult<bool> {
        // A split result read keeps its source; anything else now waits for its copy.
        let result_read = ddg.node(node).is_source_operation();
        if self.split_if_unconnected(ddg, rm, node, 0, session)? && !result_read {
            return Ok(true);
        }
        let cycle = self
            .earliest_feasible(ddg, graph, rm, node, 0)?
            .ok_or_else(|| SchedulerError::SchedulingFailed {
                node: format!("{} ({})", node, ddg.node(node).mv.display(self.machine)),
                reason: "no free resources".to_string(),
            })?;
        rm.assign(ddg, cycle, node, AssignOptions::default())?;
        Ok(false)
    }
}

/// Every predecessor of `node` is scheduled.
fn move_ready(ddg: &DataDependenceGraph, graph: GraphId, node: NodeId) -> bool {
    waits_only_on(ddg, graph, node, &[])
}

/// Every predecessor of `node` is scheduled or one of `pending`.
fn waits_only_on(ddg: &DataDependenceGraph, graph: GraphId, node: NodeId, pending: &[NodeId]) -> bool {
    ddg.view(graph).in_edges(node).into_iter().all(|e| {
        let Some(entry) = ddg.edge(e) else { return true };
        entry.edge.back_edge
            || entry.tail == node
            || pending.contains(&entry.tail)
            || ddg.node(entry.tail).is_scheduled()
    })
}

impl BlockScheduler for ListScheduler<'_> {
    fn name(&self) -> &'static str {
        "list"
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
        let mut sinks = ddg.sink_distances(graph)?;

        loop {
            let units = self.ready_units(ddg, graph);
            let Some(unit) = self.pick(ddg, &units, &sinks) else {
                let left = ddg.view(graph).unscheduled_nodes();
                if left.is_empty() {
                    break;
                }
                return Err(SchedulerError::InternalInvariant {
                    reason: format!("{} moves of {} never became ready", left.len(), info.label),
                    dot: Some(ddg.dot_string(graph, Some(self.machine))),
                });
            };
            let reshaped = match unit {
                Unit::Operation(po) => self.schedule_operation(ddg, graph, &mut rm, po, session)?,
                Unit::Move(node) => self.schedule_move(ddg, graph, &mut rm, node, session)?,
            };
            if reshaped {
                sinks = ddg.sink_distances(graph)?;
            }
        }

        let instructions = match block_end(ddg, graph, self.machine) {
            Some(end) => rm.commit(rm.smallest_cycle().unwrap_or(0).min(0), end),
            None => Vec::new(),
        };
        session.record_region_scheduled(&info.label, ddg.view(graph).node_count(), instructions.len());
        log::debug!("List scheduled {} in {} instructions", info.label, instructions.len());
        Ok(ScheduledBlock {
            label: info.label,
            instructions,
            loop_schedule: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddg::DdgBuilder;
    use crate::machine::{presets, RegisterRef};
    use crate::program::{BasicBlock, Move, Terminal};

    fn reg(m: &Machine, i: u16) -> Terminal {
        Terminal::Register(RegisterRef::new(m.rf_by_name("RF").unwrap(), i))
    }

    fn two_adds(m: &Machine, chained: bool) -> BasicBlock {
        let add = m.operation_by_name("add").unwrap();
        let first_input = if chained { reg(m, 3) } else { reg(m, 4) };
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(m, 1), Terminal::fu_port(add, 1))],
            vec![Move::new(reg(m, 2), Terminal::fu_port(add, 2))],
            vec![Move::new(Terminal::fu_port(add, 3), reg(m, 3))],
            vec![Move::new(first_input, Terminal::fu_port(add, 1))],
            vec![Move::new(reg(m, 5), Terminal::fu_port(add, 2))],
            vec![Move::new(Terminal::fu_port(add, 3), reg(m, 6))],
        ];
        block
    }

    fn schedule(
        m: &Machine,
        block: &BasicBlock,
        options: SchedulerOptions,
    ) -> (DataDependenceGraph, ScheduledBlock, SchedulingSession) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut ddg = DdgBuilder::new(m).build_block(block).unwrap();
        let mut session = SchedulingSession::new();
        let scheduled = ListScheduler::new(m, options)
            .schedule_block(&mut ddg, 0, &mut session)
            .unwrap();
        (ddg, scheduled, session)
    }

    #[test]
    fn test_independent_operations_overlap() {
        let m = presets::minimal().unwrap();
        let (ddg, scheduled, _) = schedule(&m, &two_adds(&m, false), SchedulerOptions::default());
        assert_eq!(scheduled.instructions.len(), 3);
        let graph = ddg.block(0).graph;
        assert!(ddg.view(graph).unscheduled_nodes().is_empty());
        assert!(ddg.verify_schedule(graph, 0).is_ok());
    }

    #[test]
    fn test_bypass_kept_when_earlier() {
        let m = presets::minimal().unwrap();
        let (ddg, plain, _) = schedule(&m, &two_adds(&m, true), SchedulerOptions::default());
        assert_eq!(plain.instructions.len(), 4);
        assert!(!ddg.is_merged(NodeId(2), NodeId(3)));

        let options = SchedulerOptions {
            bypass: true,
            ..Default::default()
        };
        let (ddg, bypassed, session) = schedule(&m, &two_adds(&m, true), options);
        assert_eq!(bypassed.instructions.len(), 3);
        assert!(ddg.is_merged(NodeId(2), NodeId(3)));
        assert!(ddg.node(NodeId(3)).mv.source.is_fu_port());
        assert_eq!(session.stats().bypasses, 1);
        assert!(ddg.verify_schedule(ddg.block(0).graph, 0).is_ok());
    }

    #[test]
    fn test_jump_pads_delay_slots() {
        let m = presets::minimal().unwrap();
        let jump = m.operation_by_name("jump").unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(&m, 1), reg(&m, 2))],
            vec![Move::new(Terminal::InstructionAddress(0), Terminal::fu_port(jump, 1))],
        ];
        let (ddg, scheduled, _) = schedule(&m, &block, SchedulerOptions::default());
        let jump_cycle = ddg.node(NodeId(1)).cycle().unwrap();
        assert_eq!(scheduled.instructions.len() as i32, jump_cycle + 2);
        assert!(ddg.node(NodeId(0)).cycle().unwrap() <= jump_cycle + 1);
    }
}
