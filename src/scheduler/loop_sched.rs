//! Bottom-up modulo scheduling of single-block loops.
//!
//! The loop body is placed in `[0, 2 * ii)`, so an iteration spans at most
//! two stages. Nodes are picked once all their successors are placed and each
//! is tried from the latest cycle its successors allow downwards. A result
//! read may therefore land before its trigger has a cycle; the trigger is
//! bounded by it later.
//!
//! Moves of the first stage also run once before the kernel as a prolog. The
//! prolog is kept in its own resource manager, offset by [`PROLOG_CYCLE_BIAS`],
//! and every first-stage placement must fit both. A first-stage move that
//! cannot be speculated gets the loop jump's guard so that it does not run
//! for the iteration that never happens.

use super::{can_be_speculated, is_control_flow_trigger, BlockScheduler, LoopSchedule, ScheduledBlock, SchedulerOptions};
use crate::core::{ScheduleResult, SchedulerError, SchedulingSession};
use crate::ddg::{CycleQuery, DataDependenceGraph, DependenceType, GraphId};
use crate::machine::{Guard, Machine};
use crate::program::{Move, NodeId, ScheduledInstruction};
use crate::resource::{AssignOptions, SimpleResourceManager};
use hashbrown::{HashMap, HashSet};

/// Cycle offset of the prolog copies inside the prolog resource manager.
pub const PROLOG_CYCLE_BIAS: i32 = 1000;

/// Placement state for one attempt at one initiation interval.
pub struct ModuloContext<'m> {
    machine: &'m Machine,
    pub rm: SimpleResourceManager<'m>,
    pub prolog_rm: Option<SimpleResourceManager<'m>>,
    prolog_graph: GraphId,
    pub ii: i32,
    /// Trigger of the loop's control flow operation.
    pub jump: Option<NodeId>,
    /// Move computing the jump's guard in the same iteration.
    pub guard_writer: Option<NodeId>,
    jump_guarded: HashSet<NodeId>,
    /// Nodes in assignment order.
    assigned: Vec<NodeId>,
}

impl<'m> ModuloContext<'m> {
    pub fn new(
        machine: &'m Machine,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        ii: u32,
        prolog: bool,
    ) -> ScheduleResult<Self> {
        let view = ddg.view(graph);
        let jump = view
            .nodes()
            .into_iter()
            .find(|n| is_control_flow_trigger(ddg, *n, machine));
        let guard_writer = jump.and_then(|j| {
            let writers: HashSet<NodeId> = view
                .in_edges(j)
                .into_iter()
                .filter_map(|e| ddg.edge(e))
                .filter(|entry| {
                    entry.edge.guard_use && entry.edge.kind == DependenceType::Raw && !entry.edge.back_edge
                })
                .map(|entry| entry.tail)
                .collect();
            (writers.len() == 1).then(|| writers.into_iter().next()).flatten()
        });
        let prolog_graph = ddg.create_subgraph(GraphId::ROOT, &[], true)?;
        Ok(Self {
            machine,
            rm: SimpleResourceManager::new(machine, ii),
            prolog_rm: prolog.then(|| SimpleResourceManager::new(machine, 0)),
            prolog_graph,
            ii: ii as i32,
            jump,
            guard_writer,
            jump_guarded: HashSet::new(),
            assigned: Vec::new(),
        })
    }

    fn jump_guard(&self, ddg: &DataDependenceGraph) -> Guard {
        self.jump.map_or(Guard::Unconditional, |j| ddg.node(j).mv.guard)
    }

    /// True if `node` at `cycle` runs in the prolog and must not run unconditionally.
    pub fn need_jump_guard(&self, ddg: &DataDependenceGraph, node: NodeId, cycle: i32) -> bool {
        self.prolog_rm.is_some()
            && self.jump.is_some_and(|j| j != node)
            && !self.jump_guard(ddg).is_unconditional()
            && cycle < self.ii
            && !can_be_speculated(ddg, node, self.machine)
    }

    /// First cycle a move of the first stage can be guarded by the loop jump's condition.
    pub fn jump_guard_available_cycle(&self, ddg: &DataDependenceGraph, node: NodeId) -> i32 {
        let guard = self.jump_guard(ddg);
        if self.jump.is_none() {
            return i32::MAX;
        }
        if guard.is_unconditional() {
            return 0;
        }
        let Some(writer) = self.guard_writer else {
            return i32::MAX;
        };
        if writer == node {
            return 0;
        }
        match ddg.node(writer).cycle() {
            Some(cycle) => self.machine.guard_latency(&guard) as i32 + cycle - self.ii,
            None => i32::MAX,
        }
    }

    pub fn set_jump_guard(&self, ddg: &mut DataDependenceGraph, node: NodeId) {
        let guard = self.jump_guard(ddg);
        ddg.node_mut(node).mv.guard = guard;
        log::trace!("Jump guard {} set on {}", self.machine.guard_name(&guard), node);
    }

    pub fn unset_jump_guard(&self, ddg: &mut DataDependenceGraph, node: NodeId) {
        ddg.node_mut(node).mv.guard = Guard::Unconditional;
    }

    fn needs_prolog_copy(&self, ddg: &DataDependenceGraph, node: NodeId, cycle: i32) -> bool {
        self.prolog_rm.is_some() && cycle < self.ii && !is_control_flow_trigger(ddg, node, self.machine)
    }

    /// True if `node` fits at `cycle` in the kernel and, when mirrored, in the prolog.
    pub fn can_assign(&self, ddg: &mut DataDependenceGraph, node: NodeId, cycle: i32) -> bool {
        let unguarded = ddg.node(node).mv;
        let guard = self.need_jump_guard(ddg, node, cycle);
        if guard {
            if ddg.node(node).is_guarded() || cycle < self.jump_guard_available_cycle(ddg, node) {
                return false;
            }
            self.set_jump_guard(ddg, node);
        }
        let mut fits = self.rm.can_assign(ddg, cycle, node, AssignOptions::default());
        if fits && self.needs_prolog_copy(ddg, node, cycle) {
            fits = self
                .prolog_rm
                .as_ref()
                .is_some_and(|prm| prm.can_assign_copy(ddg, cycle + PROLOG_CYCLE_BIAS, node, unguarded));
        }
        if guard {
            self.unset_jump_guard(ddg, node);
        }
        fits
    }

    pub fn assign(
        &mut self,
        ddg: &mut DataDependenceGraph,
        node: NodeId,
        cycle: i32,
        session: &mut SchedulingSession,
    ) -> ScheduleResult<()> {
        let unguarded = ddg.node(node).mv;
        let guard = self.need_jump_guard(ddg, node, cycle);
        if guard {
            if ddg.node(node).is_guarded() {
                return Err(SchedulerError::invariant(format!(
                    "{} is guarded already and cannot take the jump guard at cycle {}",
                    node, cycle
                )));
            }
            self.set_jump_guard(ddg, node);
        }
        if let Err(e) = self.rm.assign(ddg, cycle, node, AssignOptions::default()) {
            if guard {
                self.unset_jump_guard(ddg, node);
            }
            return Err(e);
        }
        if guard {
            self.jump_guarded.insert(node);
            session.record_jump_guard();
        }
        self.assigned.push(node);

        if self.needs_prolog_copy(ddg, node, cycle) {
            if let Some(prm) = self.prolog_rm.as_mut() {
                let placed = prm.assign_copy(ddg, cycle + PROLOG_CYCLE_BIAS, node, unguarded)?;
                let block = ddg.node(node).block;
                let copy = ddg.add_node(self.prolog_graph, placed, block);
                ddg.node_mut(copy).set_cycle(Some(cycle));
                session.set_prolog_move(node, copy);
                log::trace!("Prolog copy {} of {} at {}", copy, node, cycle);
            }
        }
        Ok(())
    }

    pub fn unassign(
        &mut self,
        ddg: &mut DataDependenceGraph,
        node: NodeId,
        session: &mut SchedulingSession,
    ) -> ScheduleResult<()> {
        self.rm.unassign(ddg, node)?;
        self.assigned.retain(|n| *n != node);
        if let Some(copy) = session.remove_prolog_move(node) {
            if let Some(prm) = self.prolog_rm.as_mut() {
                prm.unassign_copy(node)?;
            }
            ddg.remove_node(copy);
        }
        if self.jump_guarded.remove(&node) {
            self.unset_jump_guard(ddg, node);
        }
        Ok(())
    }

    /// Undo every assignment, latest first.
    pub fn unassign_all(&mut self, ddg: &mut DataDependenceGraph, session: &mut SchedulingSession) -> ScheduleResult<()> {
        while let Some(node) = self.assigned.last().copied() {
            self.unassign(ddg, node, session)?;
        }
        Ok(())
    }

    /// The kernel: all placements folded into `ii` instructions.
    fn kernel(&self) -> Vec<ScheduledInstruction> {
        let mut kernel: Vec<ScheduledInstruction> = (0..self.ii)
            .map(|cycle| ScheduledInstruction {
                cycle,
                ..Default::default()
            })
            .collect();
        let (Some(first), Some(last)) = (self.rm.smallest_cycle(), self.rm.largest_cycle()) else {
            return kernel;
        };
        for ins in self.rm.commit(first.min(0), last) {
            let slot = &mut kernel[ins.cycle.rem_euclid(self.ii) as usize];
            slot.moves.extend(ins.moves);
            slot.immediates.extend(ins.immediates);
        }
        for slot in &mut kernel {
            slot.moves.sort_by_key(|mv| mv.bus);
        }
        kernel
    }

    /// The first stage of the first iteration, renumbered from cycle 0.
    fn prolog(&self) -> Vec<ScheduledInstruction> {
        let Some(prm) = self.prolog_rm.as_ref().filter(|prm| prm.assigned_count() > 0) else {
            return Vec::new();
        };
        let first = prm.smallest_cycle().map_or(PROLOG_CYCLE_BIAS, |c| c.min(PROLOG_CYCLE_BIAS));
        prm.commit(first, PROLOG_CYCLE_BIAS + self.ii - 1)
            .into_iter()
            .map(|mut ins| {
                ins.cycle -= first;
                ins
            })
            .collect()
    }
}

/// Lower bound of the initiation interval from resource use alone.
pub fn resource_mii(ddg: &DataDependenceGraph, graph: GraphId, machine: &Machine) -> u32 {
    let view = ddg.view(graph);
    let nodes = view.nodes();
    let ceil = |count: usize, capacity: usize| count.div_ceil(capacity.max(1));

    let mut mii = ceil(nodes.len(), machine.buses.len());

    let mut triggers: HashMap<usize, usize> = HashMap::new();
    for po in view.operations() {
        let op = ddg.operation(po).operation;
        let mut units = machine.units_supporting(op);
        if let (Some(fu), None) = (units.next(), units.next()) {
            *triggers.entry(fu.index()).or_default() += 1;
        }
    }
    mii = mii.max(triggers.values().copied().max().unwrap_or(0));

    let mut reads: HashMap<usize, usize> = HashMap::new();
    let mut writes: HashMap<usize, usize> = HashMap::new();
    for n in &nodes {
        let mv = ddg.node(*n).mv;
        if let Some(reg) = mv.source.register() {
            *reads.entry(reg.rf.index()).or_default() += 1;
        }
        if let Some(reg) = mv.destination.register() {
            *writes.entry(reg.rf.index()).or_default() += 1;
        }
    }
    for (rf, count) in reads {
        mii = mii.max(ceil(count, machine.register_files[rf].read_ports as usize));
    }
    for (rf, count) in writes {
        mii = mii.max(ceil(count, machine.register_files[rf].write_ports as usize));
    }
    mii.max(1) as u32
}

pub struct LoopScheduler<'m> {
    machine: &'m Machine,
    options: SchedulerOptions,
}

impl<'m> LoopScheduler<'m> {
    pub fn new(machine: &'m Machine, options: SchedulerOptions) -> Self {
        Self { machine, options }
    }

    /// Unplaced nodes whose successors are all placed, best first.
    fn ready_nodes(
        &self,
        ddg: &DataDependenceGraph,
        graph: GraphId,
        sources: &HashMap<NodeId, i32>,
    ) -> Vec<NodeId> {
        let view = ddg.view(graph);
        let mut ready: Vec<NodeId> = view
            .unscheduled_nodes()
            .into_iter()
            .filter(|n| {
                view.out_edges(*n).into_iter().all(|e| {
                    let Some(entry) = ddg.edge(e) else { return true };
                    entry.edge.back_edge || entry.head == *n || ddg.node(entry.head).is_scheduled()
                })
            })
            .filter(|n| self.trigger_cycle_of(ddg, *n).is_ok())
            .collect();
        ready.sort_by_key(|n| {
            (
                std::cmp::Reverse(sources.get(n).copied().unwrap_or(0)),
                std::cmp::Reverse(ddg.node(*n).order),
                std::cmp::Reverse(n.0),
            )
        });
        ready
    }

    /// `Ok(Some(c))` for an operand whose trigger is at `c`, `Ok(None)` for
    /// nodes that are not waiting on a trigger, `Err(())` while the trigger is unplaced.
    fn trigger_cycle_of(&self, ddg: &DataDependenceGraph, node: NodeId) -> Result<Option<i32>, ()> {
        let Some(po) = ddg.node(node).destination_operation else {
            return Ok(None);
        };
        match ddg.trigger_of(po, self.machine) {
            Some(t) if t != node => ddg.node(t).cycle().map(Some).ok_or(()),
            _ => Ok(None),
        }
    }

    fn schedule_node(
        &self,
        ctx: &mut ModuloContext<'m>,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        node: NodeId,
        session: &mut SchedulingSession,
    ) -> ScheduleResult<bool> {
        let ii = ctx.ii;
        let query = CycleQuery {
            ignore_unscheduled: true,
            ..Default::default()
        };
        let view = ddg.view(graph);
        let mut lc = view
            .latest_cycle(node, ii, query)?
            .unwrap_or(i32::MAX)
            .min(2 * ii - 1);
        if let Ok(Some(trigger)) = self.trigger_cycle_of(ddg, node) {
            lc = lc.min(trigger);
        }
        if is_control_flow_trigger(ddg, node, self.machine) {
            lc = lc.min(2 * ii - 1 - self.machine.control_unit.delay_slots as i32);
        }
        let ec = view.earliest_cycle(node, ii, query)?.unwrap_or(0).max(0);
        let lower = ec.max(lc - 2 * ii + 1).max(0);

        for cycle in (lower..=lc).rev() {
            if ctx.can_assign(ddg, node, cycle) {
                ctx.assign(ddg, node, cycle, session)?;
                return Ok(true);
            }
        }
        log::debug!("No cycle in [{}, {}] for {} at ii {}", lower, lc, node, ii);
        Ok(false)
    }

    /// Try to place the whole block at `ii`. On failure nothing stays assigned.
    fn try_ii(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        ii: u32,
        session: &mut SchedulingSession,
    ) -> ScheduleResult<Option<ModuloContext<'m>>> {
        let mut ctx = ModuloContext::new(self.machine, ddg, graph, ii, self.options.loop_prolog)?;
        let sources = ddg.source_distances(graph)?;
        loop {
            let Some(node) = self.ready_nodes(ddg, graph, &sources).first().copied() else {
                break;
            };
            if !self.schedule_node(&mut ctx, ddg, graph, node, session)? {
                ctx.unassign_all(ddg, session)?;
                return Ok(None);
            }
        }
        let left = ddg.view(graph).unscheduled_nodes();
        if !left.is_empty() {
            ctx.unassign_all(ddg, session)?;
            return Err(SchedulerError::InternalInvariant {
                reason: format!("{} loop moves never became ready", left.len()),
                dot: Some(ddg.dot_string(graph, Some(self.machine))),
            });
        }
        Ok(Some(ctx))
    }
}

impl BlockScheduler for LoopScheduler<'_> {
    fn name(&self) -> &'static str {
        "loop"
    }

    fn schedule_block(
        &mut self,
        ddg: &mut DataDependenceGraph,
        block: usize,
        session: &mut SchedulingSession,
    ) -> ScheduleResult<ScheduledBlock> {
        let info = ddg.block(block).clone();
        let graph = info.graph;
        if ddg.view(graph).node_count() == 0 {
            return Ok(ScheduledBlock {
                label: info.label,
                ..Default::default()
            });
        }

        let mii = resource_mii(ddg, graph, self.machine);
        let start = self.options.initiation_interval.unwrap_or(mii).max(1);
        let max_ii = self.options.max_ii.max(start);
        log::debug!("Modulo scheduling {} from ii {} (resource bound {})", info.label, start, mii);

        for ii in start..=max_ii {
            let Some(ctx) = self.try_ii(ddg, graph, ii, session)? else {
                session.record_ii_attempt(ii, false);
                continue;
            };
            session.record_ii_attempt(ii, true);

            let kernel = ctx.kernel();
            let prolog = ctx.prolog();
            let view = ddg.view(graph);
            let stages = match (view.smallest_cycle(), view.largest_cycle()) {
                (Some(first), Some(last)) => (last.div_euclid(ctx.ii) - first.div_euclid(ctx.ii) + 1) as u32,
                _ => 1,
            };
            session.record_region_scheduled(&info.label, view.node_count(), kernel.len());
            log::debug!(
                "Scheduled loop {} at ii {} with {} stages and {} prolog instructions",
                info.label,
                ii,
                stages,
                prolog.len()
            );
            return Ok(ScheduledBlock {
                label: info.label,
                instructions: kernel.clone(),
                loop_schedule: Some(LoopSchedule {
                    ii,
                    prolog,
                    kernel,
                    stages,
                }),
            });
        }
        Err(SchedulerError::SchedulingFailed {
            node: info.label,
            reason: format!("no modulo schedule with ii in {}..={}", start, max_ii),
        })
    }
}
