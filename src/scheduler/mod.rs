// This module holds the scheduling drivers. A procedure is scheduled one basic block at a
// time: the dependence graph is built for the whole procedure (no edges between blocks),
// the register copy adder makes every move of the block transportable, the graph is
// sanity checked and one of the block schedulers places every move with the resource
// manager. SequentialScheduler is the first-fit reference scheduler, ListScheduler the
// greedy top-down scheduler with optional software bypassing and LoopScheduler the
// bottom-up modulo scheduler for single-block loops with prolog mirroring and jump
// guards. Every finished block is checked against its dependence edges before it is
// returned. SchedulerOptions carries the knobs the driver exposes on the command line.

//! Scheduling drivers.
//!
//! # Key Components
//!
//! - [`BlockScheduler`]: one basic block at a time, sharing a [`SchedulingSession`]
//! - [`SequentialScheduler`], [`ListScheduler`], [`LoopScheduler`]
//! - [`RegisterCopyAdder`]: connectivity copies inserted before scheduling
//! - [`schedule_procedure`]: the whole pipeline for one procedure

pub mod copy_adder;
pub mod list;
pub mod loop_sched;
pub mod sequential;

pub use copy_adder::{AddedRegisterCopies, RegisterCopyAdder, MAX_COPIES_PER_MOVE};
pub use list::ListScheduler;
pub use loop_sched::{LoopScheduler, ModuloContext, PROLOG_CYCLE_BIAS};
pub use sequential::SequentialScheduler;

use crate::core::{ScheduleResult, SchedulingSession};
use crate::ddg::{DataDependenceGraph, DdgBuilder, GraphId};
use crate::machine::Machine;
use crate::program::{NodeId, Procedure, ScheduledInstruction};

/// Knobs shared by the schedulers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Try software bypassing in the list scheduler.
    pub bypass: bool,
    /// First initiation interval tried; the resource bound when unset.
    pub initiation_interval: Option<u32>,
    /// Largest initiation interval tried before giving up.
    pub max_ii: u32,
    /// Insert connectivity copies before scheduling.
    pub copy_adder: bool,
    /// Mirror the first stage of a loop into a prolog.
    pub loop_prolog: bool,
    /// Log the dependence graph of every scheduled block.
    pub dot_dumps: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            bypass: false,
            initiation_interval: None,
            max_ii: 16,
            copy_adder: true,
            loop_prolog: true,
            dot_dumps: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Sequential,
    List,
    /// List scheduling for straight-line blocks, modulo scheduling for loops.
    Loop,
}

/// Modulo schedule of a single-block loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopSchedule {
    pub ii: u32,
    /// First stage of the first iteration, executed once before the kernel.
    pub prolog: Vec<ScheduledInstruction>,
    /// `ii` instructions executed once per iteration.
    pub kernel: Vec<ScheduledInstruction>,
    /// Iterations overlapping in the kernel.
    pub stages: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduledBlock {
    pub label: String,
    /// The block's instructions; the kernel for modulo scheduled loops.
    pub instructions: Vec<ScheduledInstruction>,
    pub loop_schedule: Option<LoopSchedule>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduledProcedure {
    pub name: String,
    pub blocks: Vec<ScheduledBlock>,
}

/// Places every move of one basic block.
///
/// On success every node of the block graph is scheduled and the returned
/// instructions hold them. On error the graph may be partially scheduled.
pub trait BlockScheduler {
    fn name(&self) -> &'static str;

    fn schedule_block(
        &mut self,
        ddg: &mut DataDependenceGraph,
        block: usize,
        session: &mut SchedulingSession,
    ) -> ScheduleResult<ScheduledBlock>;
}

/// True if `node` may execute for an iteration that turns out not to happen.
///
/// Only operand writes qualify, and only for operations without memory
/// access, side effects, control flow or effects on other operations.
pub fn can_be_speculated(ddg: &DataDependenceGraph, node: NodeId, machine: &Machine) -> bool {
    let Some(po) = ddg.node(node).destination_operation else {
        return false;
    };
    let info = machine.operation(ddg.operation(po).operation);
    !(info.uses_memory() || info.has_side_effects || info.control_flow || info.affects_count > 0)
}

/// Schedule every block of `procedure`.
pub fn schedule_procedure(
    machine: &Machine,
    procedure: &Procedure,
    kind: SchedulerKind,
    options: &SchedulerOptions,
    session: &mut SchedulingSession,
) -> ScheduleResult<ScheduledProcedure> {
    session.set_current_procedure(&procedure.name);
    let mut ddg = DdgBuilder::new(machine).build_procedure(procedure)?;
    for reg in ddg.program_registers().iter().filter(|r| machine.is_scratch_register(*r)) {
        log::debug!(
            "{} keeps values in {}; copies will not use it",
            procedure.name,
            machine.register_name(reg)
        );
    }
    let mut blocks = Vec::with_capacity(procedure.blocks.len());
    for index in 0..ddg.blocks().len() {
        let block = ddg.block(index).clone();
        if options.copy_adder {
            let added = RegisterCopyAdder::new(machine)
                .with_reserved(ddg.program_registers())
                .add_copies_for_graph(&mut ddg, block.graph)?;
            session.record_copies_added(added.count);
        }
        ddg.sanity_check(block.graph, machine)?;

        let scheduled = match (kind, block.is_loop) {
            (SchedulerKind::Sequential, _) => {
                SequentialScheduler::new(machine).schedule_block(&mut ddg, index, session)?
            }
            (SchedulerKind::Loop, true) => {
                LoopScheduler::new(machine, options.clone()).schedule_block(&mut ddg, index, session)?
            }
            _ => ListScheduler::new(machine, options.clone()).schedule_block(&mut ddg, index, session)?,
        };
        if options.dot_dumps {
            log::debug!("Scheduled {}:\n{}", block.label, ddg.dot_string(block.graph, Some(machine)));
        }
        let ii = scheduled.loop_schedule.as_ref().map_or(0, |l| l.ii as i32);
        ddg.verify_schedule(block.graph, ii)?;
        blocks.push(scheduled);
    }
    session.clear_procedure_state();
    Ok(ScheduledProcedure {
        name: procedure.name.clone(),
        blocks,
    })
}

/// Last cycle of the block: its last move or the last delay slot of its control flow.
pub(crate) fn block_end(ddg: &DataDependenceGraph, graph: GraphId, machine: &Machine) -> Option<i32> {
    let view = ddg.view(graph);
    let largest = view.largest_cycle()?;
    let delay = machine.control_unit.delay_slots as i32;
    let jump_end = view
        .nodes()
        .into_iter()
        .filter(|n| is_control_flow_trigger(ddg, *n, machine))
        .filter_map(|n| ddg.node(n).cycle())
        .map(|c| c + delay)
        .max();
    Some(jump_end.map_or(largest, |j| j.max(largest)))
}

/// True if `node` triggers a control flow operation.
pub(crate) fn is_control_flow_trigger(ddg: &DataDependenceGraph, node: NodeId, machine: &Machine) -> bool {
    let Some(ft) = ddg.node(node).mv.destination.fu_terminal() else {
        return false;
    };
    machine.operation(ft.operation).control_flow && machine.trigger_operand(ft.operation) == Some(ft.operand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{presets, RegisterRef};
    use crate::program::{BasicBlock, Move, Terminal};

    #[test]
    fn test_speculation_refuses_memory_and_control_flow() {
        let m = presets::minimal().unwrap();
        let r = |i| Terminal::Register(RegisterRef::new(m.rf_by_name("RF").unwrap(), i));
        let op = |name| m.operation_by_name(name).unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(r(1), Terminal::fu_port(op("add"), 1))],
            vec![Move::new(r(2), Terminal::fu_port(op("add"), 2))],
            vec![Move::new(Terminal::fu_port(op("add"), 3), r(3))],
            vec![Move::new(r(3), Terminal::fu_port(op("ldw"), 1))],
            vec![Move::new(Terminal::fu_port(op("ldw"), 2), r(4))],
            vec![Move::new(r(5), Terminal::fu_port(op("stw"), 1))],
            vec![Move::new(r(4), Terminal::fu_port(op("stw"), 2))],
            vec![Move::new(r(4), r(6))],
            vec![Move::new(Terminal::InstructionAddress(0), Terminal::fu_port(op("jump"), 1))],
        ];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let speculable: Vec<bool> = (0..9).map(|i| can_be_speculated(&ddg, NodeId(i), &m)).collect();
        assert_eq!(
            speculable,
            vec![true, true, false, false, false, false, false, false, false]
        );
    }

    #[test]
    fn test_default_options() {
        let options = SchedulerOptions::default();
        assert!(options.copy_adder);
        assert!(options.loop_prolog);
        assert!(!options.bypass);
        assert_eq!(options.initiation_interval, None);
    }

    #[test]
    fn test_program_scratch_register_is_never_a_copy_temporary() {
        let m = presets::clustered().unwrap();
        let text = "proc clash {\nentry:\n    RFB.3 -> RFB.7\n    RFA.1 -> RFC.1\n    RFB.7 -> RFB.2\n}\n";
        let procedure = crate::listing::parse_listing(text, &m).unwrap().remove(0);
        let mut session = SchedulingSession::new();
        // RFB.7 is the only temporary between RFA and RFC, and the program keeps a value in it.
        let err = schedule_procedure(&m, &procedure, SchedulerKind::List, &SchedulerOptions::default(), &mut session)
            .unwrap_err();
        assert!(err.is_machine_insufficiency(), "{}", err);

        let text = "proc free {\nentry:\n    RFB.3 -> RFB.6\n    RFA.1 -> RFC.1\n    RFB.6 -> RFB.2\n}\n";
        let procedure = crate::listing::parse_listing(text, &m).unwrap().remove(0);
        let scheduled =
            schedule_procedure(&m, &procedure, SchedulerKind::List, &SchedulerOptions::default(), &mut session)
                .unwrap();
        assert_eq!(scheduled.blocks.len(), 1);
        assert_eq!(session.stats().copies_added, 1);
    }
}
