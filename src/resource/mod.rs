// This module implements the resource manager: a per-cycle model of bus, function unit,
// register file port and immediate unit occupancy. A placement of a move at a cycle is
// computed by a pure check (try_place) that picks a bus, binds the operations the move
// reads from or writes to onto function units, and for immediates too wide for any bus
// routes the value through an immediate unit register written iu.latency cycles earlier.
// assign applies the marks of that placement and records them together with the
// original move, so unassign restores occupancy, instruction contents and the node
// exactly. With a non-zero initiation interval every resource slot is taken modulo the
// interval. Function unit timing is modelled per port: operand values are held from
// their write until the trigger, results from their arrival until the last read, and no
// other operation may write or deliver into a held port. The resource manager keeps its
// own record of assigned cycles, which lets a second instance mirror the placements of
// a loop body (the prolog) without touching the nodes.

//! Resource manager.
//!
//! # Key Components
//!
//! - [`SimpleResourceManager`]: occupancy model, `can_assign`/`assign`/`unassign`
//! - [`BusChoice`]: answer of [`SimpleResourceManager::find_bus`]
//! - [`table::ResourceTable`]: slot table shared by all resource kinds

pub mod table;

pub use table::{Mark, Owner, ResourceKey, ResourceTable};

use crate::core::{RegisterSet, ScheduleResult, SchedulerError};
use crate::ddg::DataDependenceGraph;
use crate::machine::{BusId, Endpoint, FuId, IuId, Machine, OpId, RegisterRef};
use crate::program::{LongImmediate, Move, MoveNode, NodeId, PoId, ScheduledInstruction, Terminal};
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// Cycles past the last used instruction scanned before giving up.
const SCAN_SLACK: i32 = 32;

/// Forced choices for an assignment. Unset fields are chosen freely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssignOptions {
    pub bus: Option<BusId>,
    pub source_unit: Option<FuId>,
    pub destination_unit: Option<FuId>,
    pub immediate_unit: Option<IuId>,
}

/// How a move can be transported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusChoice {
    /// A free bus connects both ends, possibly reading a long immediate.
    Direct { bus: BusId, long_immediate: Option<IuId> },
    /// No bus connects both ends; route through this register.
    ViaRegister(RegisterRef),
}

/// Where a transported value comes from, for connectivity searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSource {
    Endpoint(Endpoint),
    Immediate(i64),
}

#[derive(Debug, Clone)]
struct Placement {
    mv: Move,
    bindings: Vec<(PoId, FuId)>,
    immediate: Option<(LongImmediate, i32)>,
    marks: Vec<(ResourceKey, i32, Owner)>,
    /// Holds a trigger adds for operands and results placed before it, keyed by that node.
    held_for: Vec<(NodeId, ResourceKey, i32, Owner)>,
}

#[derive(Debug, Clone)]
struct AssignmentRecord {
    cycle: i32,
    original: Move,
    placed: Move,
    marks: Vec<Mark>,
    /// Released with the held node as well as with this one.
    held_for: Vec<(NodeId, Mark)>,
    bindings: Vec<PoId>,
    immediate_cycle: Option<i32>,
    /// Placement of a copy; the node itself was left alone.
    mirrored: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct InstructionSlot {
    moves: Vec<(NodeId, Move)>,
    immediates: Vec<(NodeId, LongImmediate)>,
}

/// Full observable state, for comparing before and after.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub cells: Vec<((ResourceKey, i32), Vec<Owner>)>,
    pub instructions: Vec<ScheduledInstruction>,
    pub bindings: Vec<(PoId, FuId, usize)>,
}

/// Resource manager over one machine.
pub struct SimpleResourceManager<'m> {
    machine: &'m Machine,
    ii: i32,
    table: ResourceTable,
    instructions: BTreeMap<i32, InstructionSlot>,
    records: HashMap<NodeId, AssignmentRecord>,
    /// Unit each operation is bound to, with the number of placed moves keeping it bound.
    unit_bindings: HashMap<PoId, (FuId, usize)>,
    reserved_registers: RegisterSet,
    reserved_units: HashMap<PoId, FuId>,
}

impl<'m> SimpleResourceManager<'m> {
    /// New manager; `ii == 0` for straight-line code.
    pub fn new(machine: &'m Machine, ii: u32) -> Self {
        let ii = ii as i32;
        Self {
            machine,
            ii,
            table: ResourceTable::new(ii),
            instructions: BTreeMap::new(),
            records: HashMap::new(),
            unit_bindings: HashMap::new(),
            reserved_registers: RegisterSet::new(),
            reserved_units: HashMap::new(),
        }
    }

    pub fn machine(&self) -> &'m Machine {
        self.machine
    }

    pub fn initiation_interval(&self) -> u32 {
        self.ii as u32
    }

    // ---------------------------------------------------------------------
    // Reservations
    // ---------------------------------------------------------------------

    /// Keep `reg` out of the scratch pool.
    pub fn reserve_register(&mut self, reg: RegisterRef) {
        self.reserved_registers.insert(reg);
    }

    pub fn reserve_registers(&mut self, regs: &RegisterSet) {
        self.reserved_registers.union(regs);
    }

    pub fn is_register_reserved(&self, reg: RegisterRef) -> bool {
        self.reserved_registers.contains(reg)
    }

    pub fn reserved_registers(&self) -> &RegisterSet {
        &self.reserved_registers
    }

    /// Bind `po` to `unit`, or to the first capable unit if `unit` is `None`.
    pub fn reserve_function_unit(
        &mut self,
        ddg: &DataDependenceGraph,
        po: PoId,
        unit: Option<FuId>,
    ) -> ScheduleResult<FuId> {
        let op = ddg.operation(po).operation;
        let name = &self.machine.operation(op).name;
        let fu = match unit {
            Some(fu) if self.machine.function_unit(fu).supports(op) => fu,
            Some(fu) => {
                return Err(SchedulerError::NoUnitSupportsOperation {
                    operation: format!("{} on {}", name, self.machine.function_unit(fu).name),
                })
            }
            None => self
                .machine
                .units_supporting(op)
                .next()
                .ok_or_else(|| SchedulerError::NoUnitSupportsOperation {
                    operation: name.clone(),
                })?,
        };
        self.reserved_units.insert(po, fu);
        Ok(fu)
    }

    /// Unit `po` is bound to by placed moves, if any.
    pub fn bound_unit(&self, po: PoId) -> Option<FuId> {
        self.unit_bindings.get(&po).map(|(fu, _)| *fu)
    }

    // ---------------------------------------------------------------------
    // Assignment
    // ---------------------------------------------------------------------

    /// True if `node` fits at `cycle`. Changes nothing.
    pub fn can_assign(&self, ddg: &DataDependenceGraph, cycle: i32, node: NodeId, opts: AssignOptions) -> bool {
        !self.records.contains_key(&node)
            && self.try_place(ddg, cycle, node, ddg.node(node).mv, opts).is_some()
    }

    /// Place `node` at `cycle`, updating its cycle, bus, unit bindings and source.
    pub fn assign(
        &mut self,
        ddg: &mut DataDependenceGraph,
        cycle: i32,
        node: NodeId,
        opts: AssignOptions,
    ) -> ScheduleResult<()> {
        if ddg.node(node).is_scheduled() || self.records.contains_key(&node) {
            return Err(SchedulerError::precondition(format!("{} is already assigned", node)));
        }
        let original = ddg.node(node).mv;
        let placement = self.try_place(ddg, cycle, node, original, opts).ok_or_else(|| {
            SchedulerError::SchedulingFailed {
                node: format!("{} ({})", node, original.display(self.machine)),
                reason: format!("no free resources at cycle {}", cycle),
            }
        })?;
        let placed = self.apply(cycle, node, original, placement, false);
        let mn = ddg.node_mut(node);
        mn.mv = placed;
        mn.set_cycle(Some(cycle));
        log::trace!("Assigned {} at {}: {}", node, cycle, placed.display(self.machine));
        Ok(())
    }

    /// Undo the assignment of `node`.
    pub fn unassign(&mut self, ddg: &mut DataDependenceGraph, node: NodeId) -> ScheduleResult<()> {
        let record = self.release(node)?;
        if !record.mirrored {
            let mn = ddg.node_mut(node);
            mn.mv = record.original;
            mn.set_cycle(None);
        }
        log::trace!("Unassigned {} from {}", node, record.cycle);
        Ok(())
    }

    /// True if a copy of `node` moving `mv` fits at `cycle`.
    pub fn can_assign_copy(&self, ddg: &DataDependenceGraph, cycle: i32, node: NodeId, mv: Move) -> bool {
        !self.records.contains_key(&node)
            && self.try_place(ddg, cycle, node, mv, AssignOptions::default()).is_some()
    }

    /// Place a copy of `node` moving `mv` at `cycle` without touching the node.
    ///
    /// Returns the placed move.
    pub fn assign_copy(&mut self, ddg: &DataDependenceGraph, cycle: i32, node: NodeId, mv: Move) -> ScheduleResult<Move> {
        if self.records.contains_key(&node) {
            return Err(SchedulerError::precondition(format!("copy of {} is already assigned", node)));
        }
        let placement = self
            .try_place(ddg, cycle, node, mv, AssignOptions::default())
            .ok_or_else(|| SchedulerError::SchedulingFailed {
                node: format!("copy of {}", node),
                reason: format!("no free resources at cycle {}", cycle),
            })?;
        Ok(self.apply(cycle, node, mv, placement, true))
    }

    pub fn unassign_copy(&mut self, node: NodeId) -> ScheduleResult<()> {
        self.release(node).map(|_| ())
    }

    /// Cycle `node` is assigned to in this manager.
    pub fn assigned_cycle(&self, node: NodeId) -> Option<i32> {
        self.records.get(&node).map(|r| r.cycle)
    }

    /// Move of `node` as it was before assignment.
    pub fn original_move(&self, node: NodeId) -> Option<Move> {
        self.records.get(&node).map(|r| r.original)
    }

    /// Move of `node` as placed.
    pub fn placed_move(&self, node: NodeId) -> Option<Move> {
        self.records.get(&node).map(|r| r.placed)
    }

    pub fn assigned_count(&self) -> usize {
        self.records.len()
    }

    fn apply(&mut self, cycle: i32, node: NodeId, original: Move, placement: Placement, mirrored: bool) -> Move {
        let marks = placement
            .marks
            .iter()
            .map(|(key, c, owner)| self.table.mark(*key, *c, *owner))
            .collect();
        let held_for = placement
            .held_for
            .iter()
            .map(|(held, key, c, owner)| (*held, self.table.mark(*key, *c, *owner)))
            .collect();
        let mut bindings = Vec::new();
        for (po, fu) in placement.bindings {
            let entry = self.unit_bindings.entry(po).or_insert((fu, 0));
            entry.1 += 1;
            bindings.push(po);
        }
        self.instructions
            .entry(cycle)
            .or_default()
            .moves
            .push((node, placement.mv));
        let immediate_cycle = placement.immediate.map(|(imm, write_cycle)| {
            self.instructions
                .entry(write_cycle)
                .or_default()
                .immediates
                .push((node, imm));
            write_cycle
        });
        self.records.insert(
            node,
            AssignmentRecord {
                cycle,
                original,
                placed: placement.mv,
                marks,
                held_for,
                bindings,
                immediate_cycle,
                mirrored,
            },
        );
        placement.mv
    }

    fn release(&mut self, node: NodeId) -> ScheduleResult<AssignmentRecord> {
        let record = self
            .records
            .remove(&node)
            .ok_or_else(|| SchedulerError::precondition(format!("{} is not assigned", node)))?;
        for mark in record.marks.iter().rev() {
            self.table.unmark(mark);
        }
        for (_, mark) in &record.held_for {
            self.table.unmark(mark);
        }
        // A trigger placed after this move extended its hold; that part goes too.
        let table = &mut self.table;
        for other in self.records.values_mut() {
            other.held_for.retain(|(held, mark)| {
                if *held == node {
                    table.unmark(mark);
                    false
                } else {
                    true
                }
            });
        }
        for po in &record.bindings {
            if let Some(entry) = self.unit_bindings.get_mut(po) {
                entry.1 -= 1;
                if entry.1 == 0 {
                    self.unit_bindings.remove(po);
                }
            }
        }
        self.remove_from_instruction(record.cycle, node);
        if let Some(c) = record.immediate_cycle {
            self.remove_from_instruction(c, node);
        }
        Ok(record)
    }

    fn remove_from_instruction(&mut self, cycle: i32, node: NodeId) {
        if let Some(slot) = self.instructions.get_mut(&cycle) {
            slot.moves.retain(|(n, _)| *n != node);
            slot.immediates.retain(|(n, _)| *n != node);
            if slot.moves.is_empty() && slot.immediates.is_empty() {
                self.instructions.remove(&cycle);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Placement check
    // ---------------------------------------------------------------------

    fn cycle_of(&self, node: NodeId) -> Option<i32> {
        self.records.get(&node).map(|r| r.cycle)
    }

    fn too_long(&self, from: i32, to: i32) -> bool {
        self.ii > 0 && to - from >= self.ii
    }

    fn candidate_units(
        &self,
        op: OpId,
        po: Option<PoId>,
        terminal_unit: Option<FuId>,
        allowed: Option<&Vec<FuId>>,
        forced: Option<FuId>,
    ) -> Vec<FuId> {
        let bound = po.and_then(|p| self.bound_unit(p));
        let reserved = po.and_then(|p| self.reserved_units.get(&p).copied());
        self.machine
            .units_supporting(op)
            .filter(|fu| bound.map_or(true, |b| b == *fu))
            .filter(|fu| reserved.map_or(true, |r| r == *fu))
            .filter(|fu| terminal_unit.map_or(true, |t| t == *fu))
            .filter(|fu| forced.map_or(true, |f| f == *fu))
            .filter(|fu| allowed.map_or(true, |a| a.contains(fu)))
            .collect()
    }

    fn try_place(
        &self,
        ddg: &DataDependenceGraph,
        cycle: i32,
        node: NodeId,
        mv: Move,
        opts: AssignOptions,
    ) -> Option<Placement> {
        if self.ii == 0 && cycle < 0 {
            return None;
        }
        let mn = ddg.node(node);
        let destination_units: Vec<Option<FuId>> = match mv.destination.fu_terminal() {
            Some(ft) => self
                .candidate_units(
                    ft.operation,
                    mn.destination_operation,
                    ft.unit,
                    mn.allowed_destination_units.as_ref(),
                    opts.destination_unit,
                )
                .into_iter()
                .map(Some)
                .collect(),
            None => vec![None],
        };
        let source_units: Vec<Option<FuId>> = match mv.source.fu_terminal() {
            Some(ft) => self
                .candidate_units(
                    ft.operation,
                    mn.source_operation,
                    ft.unit,
                    mn.allowed_source_units.as_ref(),
                    opts.source_unit,
                )
                .into_iter()
                .map(Some)
                .collect(),
            None => vec![None],
        };
        for dst in &destination_units {
            for src in &source_units {
                if let Some(p) = self.place_with_units(ddg, cycle, mn, mv, *src, *dst, opts) {
                    return Some(p);
                }
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn place_with_units(
        &self,
        ddg: &DataDependenceGraph,
        cycle: i32,
        mn: &MoveNode,
        mut mv: Move,
        src_unit: Option<FuId>,
        dst_unit: Option<FuId>,
        opts: AssignOptions,
    ) -> Option<Placement> {
        let me = Owner::Node(mn.id);
        let mut marks = Vec::new();
        let mut held_for = Vec::new();
        let mut bindings = Vec::new();

        let destination = match mv.destination {
            Terminal::FuPort(ft) => {
                let fu = dst_unit?;
                let po = mn.destination_operation?;
                let port = self.machine.function_unit(fu).hw_operation(ft.operation)?.port(ft.operand)?;
                self.check_operand(
                    ddg,
                    cycle,
                    mn.id,
                    po,
                    fu,
                    (ft.operation, ft.operand, port),
                    &mut marks,
                    &mut held_for,
                )?;
                if let Some(t) = mv.destination.fu_terminal_mut() {
                    t.unit = Some(fu);
                }
                bindings.push((po, fu));
                Endpoint::FuPort { fu, port }
            }
            Terminal::Register(reg) => {
                let rf = self.machine.register_file(reg.rf);
                if self.table.count(ResourceKey::RegisterWrite(reg.rf), cycle) >= rf.write_ports as usize {
                    return None;
                }
                marks.push((ResourceKey::RegisterWrite(reg.rf), cycle, me));
                Endpoint::RegisterFile(reg.rf)
            }
            Terminal::ReturnAddress => self.machine.return_address_endpoint(),
            _ => return None,
        };

        let source = match mv.source {
            Terminal::FuPort(ft) => {
                let fu = src_unit?;
                let po = mn.source_operation?;
                let port = self.machine.function_unit(fu).hw_operation(ft.operation)?.port(ft.operand)?;
                self.check_result(ddg, cycle, po, fu, ft.operation, port, &mut marks)?;
                if let Some(t) = mv.source.fu_terminal_mut() {
                    t.unit = Some(fu);
                }
                bindings.push((po, fu));
                TransportSource::Endpoint(Endpoint::FuPort { fu, port })
            }
            Terminal::Register(reg) => {
                let rf = self.machine.register_file(reg.rf);
                if self.table.count(ResourceKey::RegisterRead(reg.rf), cycle) >= rf.read_ports as usize {
                    return None;
                }
                marks.push((ResourceKey::RegisterRead(reg.rf), cycle, me));
                TransportSource::Endpoint(Endpoint::RegisterFile(reg.rf))
            }
            Terminal::ReturnAddress => TransportSource::Endpoint(self.machine.return_address_endpoint()),
            Terminal::ImmediateRegister { iu, .. } => TransportSource::Endpoint(Endpoint::ImmediateUnit(iu)),
            Terminal::Immediate(v) | Terminal::Address(v) => TransportSource::Immediate(v),
            Terminal::InstructionAddress(b) => TransportSource::Immediate(b as i64),
        };

        let guard = mv.guard;
        let usable = |b: BusId| {
            let bus = self.machine.bus(b);
            opts.bus.map_or(true, |f| f == b)
                && bus.writes(destination)
                && bus.supports_guard(&guard)
                && self.table.count(ResourceKey::Bus(b), cycle) == 0
        };

        let mut immediate = None;
        let bus = match source {
            TransportSource::Endpoint(src) => self
                .machine
                .bus_ids()
                .find(|b| usable(*b) && self.machine.bus(*b).reads(src))?,
            TransportSource::Immediate(value) => {
                let short = if opts.immediate_unit.is_none() {
                    self.machine
                        .bus_ids()
                        .find(|b| usable(*b) && self.machine.bus(*b).can_carry_immediate(value))
                } else {
                    None
                };
                match short {
                    Some(b) => b,
                    None => {
                        let (b, imm, write_cycle, iu_marks) =
                            self.place_long_immediate(cycle, me, value, destination, opts, &usable)?;
                        mv.source = Terminal::ImmediateRegister {
                            iu: imm.iu,
                            index: imm.index,
                        };
                        marks.extend(iu_marks);
                        immediate = Some((imm, write_cycle));
                        b
                    }
                }
            }
        };
        marks.push((ResourceKey::Bus(bus), cycle, me));
        mv.bus = Some(bus);
        Some(Placement {
            mv,
            bindings,
            immediate,
            marks,
            held_for,
        })
    }

    #[allow(clippy::type_complexity)]
    fn place_long_immediate(
        &self,
        cycle: i32,
        me: Owner,
        value: i64,
        destination: Endpoint,
        opts: AssignOptions,
        usable: &dyn Fn(BusId) -> bool,
    ) -> Option<(BusId, LongImmediate, i32, Vec<(ResourceKey, i32, Owner)>)> {
        let units = match opts.immediate_unit {
            Some(iu) => vec![iu],
            None => self.machine.immediate_units_reaching(value, destination),
        };
        for iu in units {
            let unit = self.machine.immediate_unit(iu);
            if !unit.can_hold(value) {
                continue;
            }
            let write_cycle = cycle - unit.latency as i32;
            if (self.ii == 0 && write_cycle < 0) || self.too_long(write_cycle, cycle) {
                continue;
            }
            if self.table.count(ResourceKey::ImmediateWrite(iu), write_cycle) > 0 {
                continue;
            }
            let Some(bus) = self
                .machine
                .bus_ids()
                .find(|b| usable(*b) && self.machine.bus(*b).reads(Endpoint::ImmediateUnit(iu)))
            else {
                continue;
            };
            let Some(index) = (0..unit.registers).find(|i| {
                self.table
                    .interval_free_for(ResourceKey::ImmediateRegister(iu, *i), write_cycle, cycle, me)
            }) else {
                continue;
            };
            let mut marks = vec![(ResourceKey::ImmediateWrite(iu), write_cycle, me)];
            for c in write_cycle..=cycle {
                marks.push((ResourceKey::ImmediateRegister(iu, index), c, me));
            }
            return Some((bus, LongImmediate { iu, index, value }, write_cycle, marks));
        }
        None
    }

    /// Cycle of the placed trigger move of `po` on `fu`.
    fn trigger_cycle(&self, ddg: &DataDependenceGraph, po: PoId, fu: FuId) -> Option<i32> {
        let operation = ddg.operation(po);
        let trigger = self.machine.trigger_operand_on(fu, operation.operation)?;
        operation
            .inputs
            .iter()
            .filter(|n| operand_of(ddg.node(**n)) == Some(trigger))
            .find_map(|n| self.cycle_of(*n))
    }

    /// Operand value held in `port` over `[from, to]`.
    fn hold_operand(
        &self,
        fu: FuId,
        port: u8,
        from: i32,
        to: i32,
        owner: Owner,
        marks: &mut Vec<(ResourceKey, i32, Owner)>,
    ) -> Option<()> {
        if from > to || self.too_long(from, to) {
            return None;
        }
        for c in from..=to {
            if !self.table.free_for(ResourceKey::InputHold(fu, port), c, owner) {
                return None;
            }
            if c > from && !self.table.free_for(ResourceKey::PortWrite(fu, port), c, owner) {
                return None;
            }
            marks.push((ResourceKey::InputHold(fu, port), c, owner));
        }
        Some(())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_operand(
        &self,
        ddg: &DataDependenceGraph,
        cycle: i32,
        node: NodeId,
        po: PoId,
        fu: FuId,
        (op, operand, port): (OpId, u8, u8),
        marks: &mut Vec<(ResourceKey, i32, Owner)>,
        held_for: &mut Vec<(NodeId, ResourceKey, i32, Owner)>,
    ) -> Option<()> {
        let owner = Owner::Operation(po);
        if self.table.count(ResourceKey::PortWrite(fu, port), cycle) > 0
            || !self.table.free_for(ResourceKey::InputHold(fu, port), cycle, owner)
        {
            return None;
        }
        marks.push((ResourceKey::PortWrite(fu, port), cycle, owner));

        let unit = self.machine.function_unit(fu);
        let hw = unit.hw_operation(op)?;
        let trigger = self.machine.trigger_operand_on(fu, op)?;
        if operand == trigger {
            if self.table.count(ResourceKey::Trigger(fu), cycle) > 0 {
                return None;
            }
            marks.push((ResourceKey::Trigger(fu), cycle, owner));
            for input in &ddg.operation(po).inputs {
                if *input == node {
                    continue;
                }
                let (Some(c), Some(in_operand)) = (self.cycle_of(*input), operand_of(ddg.node(*input))) else {
                    continue;
                };
                let mut hold = Vec::new();
                self.hold_operand(fu, hw.port(in_operand)?, c, cycle, owner, &mut hold)?;
                held_for.extend(hold.into_iter().map(|(key, c, owner)| (*input, key, c, owner)));
            }
            let info = self.machine.operation(op);
            let arrival = cycle + hw.latency as i32;
            for output in info.inputs + 1..=info.inputs + info.outputs {
                let out_port = hw.port(output)?;
                if self.table.count(ResourceKey::ResultArrival(fu, out_port), arrival) > 0
                    || !self.table.free_for(ResourceKey::ResultHold(fu, out_port), arrival, owner)
                {
                    return None;
                }
                marks.push((ResourceKey::ResultArrival(fu, out_port), arrival, owner));
            }
            // Results placed before the trigger get their hold now.
            for output in &ddg.operation(po).outputs {
                let Some(read) = self.cycle_of(*output) else { continue };
                let Some(out_operand) = ddg.node(*output).mv.source.fu_terminal().map(|t| t.operand) else {
                    continue;
                };
                let out_port = hw.port(out_operand)?;
                if read < arrival || self.too_long(arrival, read) {
                    return None;
                }
                for c in arrival..=read {
                    if !self.table.free_for(ResourceKey::ResultHold(fu, out_port), c, owner) {
                        return None;
                    }
                    held_for.push((*output, ResourceKey::ResultHold(fu, out_port), c, owner));
                }
            }
        } else if let Some(t) = self.trigger_cycle(ddg, po, fu) {
            self.hold_operand(fu, port, cycle, t, owner, marks)?;
        }
        Some(())
    }

    #[allow(clippy::too_many_arguments)]
    fn check_result(
        &self,
        ddg: &DataDependenceGraph,
        cycle: i32,
        po: PoId,
        fu: FuId,
        op: OpId,
        port: u8,
        marks: &mut Vec<(ResourceKey, i32, Owner)>,
    ) -> Option<()> {
        let owner = Owner::Operation(po);
        let Some(trigger) = self.trigger_cycle(ddg, po, fu) else {
            // The trigger marks the hold once it is placed.
            if !self.table.free_for(ResourceKey::ResultHold(fu, port), cycle, owner) {
                return None;
            }
            marks.push((ResourceKey::ResultHold(fu, port), cycle, owner));
            return Some(());
        };
        let arrival = trigger + self.machine.latency_on(fu, op)? as i32;
        if cycle < arrival || self.too_long(arrival, cycle) {
            return None;
        }
        for c in arrival..=cycle {
            if !self.table.free_for(ResourceKey::ResultHold(fu, port), c, owner)
                || !self.table.free_for(ResourceKey::ResultArrival(fu, port), c, owner)
            {
                return None;
            }
            marks.push((ResourceKey::ResultHold(fu, port), c, owner));
        }
        Some(())
    }

    // ---------------------------------------------------------------------
    // Windows and buses
    // ---------------------------------------------------------------------

    /// First cycle at or after `from` where `node` fits, ignoring dependences.
    pub fn earliest_cycle(
        &self,
        ddg: &DataDependenceGraph,
        from: i32,
        node: NodeId,
        opts: AssignOptions,
    ) -> Option<i32> {
        let from = if self.ii == 0 { from.max(0) } else { from };
        let last = if self.ii > 0 {
            from + self.ii - 1
        } else {
            from.max(self.largest_cycle().unwrap_or(0)) + SCAN_SLACK
        };
        (from..=last).find(|c| self.can_assign(ddg, *c, node, opts))
    }

    /// Last cycle at or before `from` where `node` fits, ignoring dependences.
    pub fn latest_cycle(
        &self,
        ddg: &DataDependenceGraph,
        from: i32,
        node: NodeId,
        opts: AssignOptions,
    ) -> Option<i32> {
        let (first, start) = if self.ii > 0 {
            (from - self.ii + 1, from)
        } else {
            let cap = self.largest_cycle().unwrap_or(0).saturating_add(SCAN_SLACK);
            (0, from.min(cap))
        };
        (first..=start).rev().find(|c| self.can_assign(ddg, *c, node, opts))
    }

    /// Bus for `node` at `cycle`, or the register to route it through.
    ///
    /// `Ok(None)` means connected buses exist but none is free at `cycle`.
    pub fn find_bus(&self, ddg: &DataDependenceGraph, cycle: i32, node: NodeId) -> ScheduleResult<Option<BusChoice>> {
        let mn = ddg.node(node);
        let mv = mn.mv;
        let destination = self.destination_endpoint(mn)?;
        let source = self.source_endpoint(mn)?;
        let guard_ok = |b: BusId| self.machine.bus(b).supports_guard(&mv.guard);
        let free = |b: BusId| self.table.count(ResourceKey::Bus(b), cycle) == 0;

        let direct: Vec<(BusId, Option<IuId>)> = match source {
            TransportSource::Endpoint(src) => self
                .machine
                .buses_connecting(src, destination)
                .filter(|b| guard_ok(*b))
                .map(|b| (b, None))
                .collect(),
            TransportSource::Immediate(value) => {
                let mut buses: Vec<(BusId, Option<IuId>)> = self
                    .machine
                    .bus_ids()
                    .filter(|b| {
                        let bus = self.machine.bus(*b);
                        bus.writes(destination) && bus.can_carry_immediate(value) && guard_ok(*b)
                    })
                    .map(|b| (b, None))
                    .collect();
                for iu in self.machine.immediate_units_reaching(value, destination) {
                    buses.extend(
                        self.machine
                            .buses_connecting(Endpoint::ImmediateUnit(iu), destination)
                            .filter(|b| guard_ok(*b))
                            .map(|b| (b, Some(iu))),
                    );
                }
                buses
            }
        };
        if !direct.is_empty() {
            return Ok(direct
                .into_iter()
                .find(|(b, _)| free(*b))
                .map(|(bus, long_immediate)| BusChoice::Direct { bus, long_immediate }));
        }
        let reg = self.find_temp_reg_connected_to(source, destination)?;
        log::debug!(
            "No bus for {}, routing through {}",
            mv.display(self.machine),
            self.machine.register_name(reg)
        );
        Ok(Some(BusChoice::ViaRegister(reg)))
    }

    /// Unreserved scratch register reachable from `source` that can reach `destination`.
    pub fn find_temp_reg_connected_to(
        &self,
        source: TransportSource,
        destination: Endpoint,
    ) -> ScheduleResult<RegisterRef> {
        self.machine
            .scratch_registers
            .iter()
            .copied()
            .filter(|r| !self.reserved_registers.contains(*r))
            .find(|r| {
                let rf = Endpoint::RegisterFile(r.rf);
                let reachable = match source {
                    TransportSource::Endpoint(src) => self.machine.is_connected(src, rf),
                    TransportSource::Immediate(value) => self.machine.can_transport_immediate(value, rf),
                };
                reachable && self.machine.is_connected(rf, destination)
            })
            .ok_or_else(|| {
                let from = match source {
                    TransportSource::Endpoint(e) => self.machine.endpoint_name(e),
                    TransportSource::Immediate(v) => format!("#{}", v),
                };
                SchedulerError::insufficiency(
                    format!("{} -> {}", from, self.machine.endpoint_name(destination)),
                    "no scratch register is connected to both ends",
                )
            })
    }

    /// Endpoint the move writes, using the first unit it could be bound to.
    pub fn destination_endpoint(&self, mn: &MoveNode) -> ScheduleResult<Endpoint> {
        match mn.mv.destination {
            Terminal::FuPort(ft) => {
                let fu = self
                    .candidate_units(
                        ft.operation,
                        mn.destination_operation,
                        ft.unit,
                        mn.allowed_destination_units.as_ref(),
                        None,
                    )
                    .into_iter()
                    .next()
                    .ok_or_else(|| self.no_unit(ft.operation))?;
                self.machine
                    .operand_endpoint(fu, ft.operation, ft.operand)
                    .ok_or_else(|| self.no_unit(ft.operation))
            }
            Terminal::Register(reg) => Ok(Endpoint::RegisterFile(reg.rf)),
            Terminal::ReturnAddress => Ok(self.machine.return_address_endpoint()),
            _ => Err(SchedulerError::precondition(format!(
                "{} writes a constant",
                mn.mv.display(self.machine)
            ))),
        }
    }

    /// Source of the move, using the bound or first capable unit for results.
    pub fn source_endpoint(&self, mn: &MoveNode) -> ScheduleResult<TransportSource> {
        Ok(match mn.mv.source {
            Terminal::FuPort(ft) => {
                let fu = self
                    .candidate_units(
                        ft.operation,
                        mn.source_operation,
                        ft.unit,
                        mn.allowed_source_units.as_ref(),
                        None,
                    )
                    .into_iter()
                    .next()
                    .ok_or_else(|| self.no_unit(ft.operation))?;
                TransportSource::Endpoint(
                    self.machine
                        .operand_endpoint(fu, ft.operation, ft.operand)
                        .ok_or_else(|| self.no_unit(ft.operation))?,
                )
            }
            Terminal::Register(reg) => TransportSource::Endpoint(Endpoint::RegisterFile(reg.rf)),
            Terminal::ReturnAddress => TransportSource::Endpoint(self.machine.return_address_endpoint()),
            Terminal::ImmediateRegister { iu, .. } => TransportSource::Endpoint(Endpoint::ImmediateUnit(iu)),
            Terminal::Immediate(v) | Terminal::Address(v) => TransportSource::Immediate(v),
            Terminal::InstructionAddress(b) => TransportSource::Immediate(b as i64),
        })
    }

    fn no_unit(&self, op: OpId) -> SchedulerError {
        SchedulerError::NoUnitSupportsOperation {
            operation: self.machine.operation(op).name.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // Instructions
    // ---------------------------------------------------------------------

    pub fn smallest_cycle(&self) -> Option<i32> {
        self.instructions.keys().next().copied()
    }

    pub fn largest_cycle(&self) -> Option<i32> {
        self.instructions.keys().next_back().copied()
    }

    /// Contents of the instruction at `cycle`, if it holds anything.
    pub fn instruction(&self, cycle: i32) -> Option<ScheduledInstruction> {
        let slot = self.instructions.get(&cycle)?;
        let mut moves: Vec<Move> = slot.moves.iter().map(|(_, mv)| *mv).collect();
        moves.sort_by_key(|mv| mv.bus);
        Some(ScheduledInstruction {
            cycle,
            moves,
            immediates: slot.immediates.iter().map(|(_, imm)| *imm).collect(),
        })
    }

    /// Instructions `first..=last`, empty cycles filled with NOPs.
    pub fn commit(&self, first: i32, last: i32) -> Vec<ScheduledInstruction> {
        (first..=last)
            .map(|c| {
                self.instruction(c).unwrap_or(ScheduledInstruction {
                    cycle: c,
                    ..Default::default()
                })
            })
            .collect()
    }

    pub fn resource_snapshot(&self) -> ResourceSnapshot {
        let mut bindings: Vec<(PoId, FuId, usize)> = self
            .unit_bindings
            .iter()
            .map(|(po, (fu, count))| (*po, *fu, *count))
            .collect();
        bindings.sort();
        ResourceSnapshot {
            cells: self.table.snapshot(),
            instructions: self
                .instructions
                .keys()
                .filter_map(|c| self.instruction(*c))
                .collect(),
            bindings,
        }
    }
}

fn operand_of(node: &MoveNode) -> Option<u8> {
    node.mv.destination.fu_terminal().map(|t| t.operand)
}
