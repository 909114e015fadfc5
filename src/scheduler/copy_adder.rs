//! Register copies for moves the interconnect cannot carry directly.
//!
//! A move whose source and destination share no bus is split into a chain
//! `source -> t1 [-> t2] -> destination` through scratch registers. The
//! node keeps the end that touches its operation (the result read for
//! result moves, the operand write otherwise) and the new nodes take the
//! other end together with its dependences.

use crate::core::{RegisterSet, ScheduleResult, SchedulerError};
use crate::ddg::{DataDependenceEdge, DataDependenceGraph, DependenceType, EdgeReason, GraphId};
use crate::machine::{Endpoint, FuId, Guard, Machine, OpId, RegisterRef};
use crate::program::{Move, MoveNode, NodeId, PoId, Terminal};
use crate::resource::TransportSource;
use hashbrown::HashMap;

/// Longest chain of copies inserted for one move.
pub const MAX_COPIES_PER_MOVE: usize = 2;

/// Copies inserted by one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddedRegisterCopies {
    pub count: usize,
    /// Split node to the nodes added for it, in chain order.
    pub copies: HashMap<NodeId, Vec<NodeId>>,
}

impl AddedRegisterCopies {
    pub fn merge(&mut self, other: AddedRegisterCopies) {
        self.count += other.count;
        for (node, added) in other.copies {
            self.copies.entry(node).or_default().extend(added);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Inserts connectivity copies into a dependence graph.
pub struct RegisterCopyAdder<'m> {
    machine: &'m Machine,
    reserved: RegisterSet,
}

impl<'m> RegisterCopyAdder<'m> {
    pub fn new(machine: &'m Machine) -> Self {
        Self {
            machine,
            reserved: RegisterSet::new(),
        }
    }

    /// Keep registers out of the scratch pool.
    pub fn with_reserved(mut self, reserved: &RegisterSet) -> Self {
        self.reserved = reserved.clone();
        self
    }

    /// Copies needed for every operation and register to register move of `graph`.
    pub fn add_copies_for_graph(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
    ) -> ScheduleResult<AddedRegisterCopies> {
        let mut added = AddedRegisterCopies::default();
        for po in ddg.view(graph).operations() {
            added.merge(self.add_minimum_register_copies(ddg, po)?);
        }
        for node in ddg.view(graph).nodes() {
            let mn = ddg.node(node);
            if mn.is_source_operation() || mn.is_destination_operation() || mn.connectivity_copy {
                continue;
            }
            added.merge(self.add_register_copies_to_rr_move(ddg, node)?);
        }
        if !added.is_empty() {
            log::debug!("Added {} register copies in {}", added.count, ddg.view(graph).name());
        }
        Ok(added)
    }

    /// Copies each capable unit would need for `po`; `None` if a move cannot be connected.
    pub fn required_register_copies_for_each_fu(
        &self,
        ddg: &DataDependenceGraph,
        po: PoId,
    ) -> ScheduleResult<Vec<(FuId, Option<usize>)>> {
        let operation = ddg.operation(po).operation;
        let mut counts = Vec::new();
        for fu in self.machine.units_supporting(operation) {
            if !self.unit_allowed(ddg, po, fu) {
                continue;
            }
            let mut total = Some(0);
            for node in ddg.operation(po).nodes() {
                let path = self.path_on_unit(ddg, po, node, fu)?;
                total = match (total, path) {
                    (Some(t), Some(p)) => Some(t + p.len()),
                    _ => None,
                };
            }
            counts.push((fu, total));
        }
        Ok(counts)
    }

    /// Connect every move of `po` on the unit needing the fewest copies.
    pub fn add_minimum_register_copies(
        &self,
        ddg: &mut DataDependenceGraph,
        po: PoId,
    ) -> ScheduleResult<AddedRegisterCopies> {
        let operation = ddg.operation(po).operation;
        let name = self.machine.operation(operation).name.clone();
        let counts = self.required_register_copies_for_each_fu(ddg, po)?;
        if counts.is_empty() {
            return Err(SchedulerError::NoUnitSupportsOperation { operation: name });
        }
        let mut best: Option<(FuId, usize)> = None;
        for (fu, count) in counts {
            let Some(count) = count else { continue };
            if best.map_or(true, |(_, b)| count < b) {
                best = Some((fu, count));
            }
            if count == 0 {
                break;
            }
        }
        let Some((fu, count)) = best else {
            return Err(SchedulerError::insufficiency(
                format!("{} ({})", name, po),
                format!("no unit can be connected with at most {} register copies per move", MAX_COPIES_PER_MOVE),
            ));
        };

        let mut added = AddedRegisterCopies::default();
        if count > 0 {
            log::debug!(
                "{} needs {} register copies on {}",
                po,
                count,
                self.machine.function_unit(fu).name
            );
            let nodes: Vec<NodeId> = ddg.operation(po).nodes().collect();
            for node in nodes {
                let temps = self.path_on_unit(ddg, po, node, fu)?.unwrap_or_default();
                if temps.is_empty() {
                    continue;
                }
                let chain = self.insert_chain(ddg, node, &temps)?;
                added.count += temps.len();
                added.copies.insert(node, chain);
            }
        }
        self.add_candidate_set_annotations(ddg, po)?;
        Ok(added)
    }

    /// Restrict the moves of `po` to the units they are connected to without copies.
    pub fn add_candidate_set_annotations(&self, ddg: &mut DataDependenceGraph, po: PoId) -> ScheduleResult<()> {
        let operation = ddg.operation(po).operation;
        let counts = self.required_register_copies_for_each_fu(ddg, po)?;
        let units: Vec<FuId> = counts
            .iter()
            .filter(|(_, c)| *c == Some(0))
            .map(|(fu, _)| *fu)
            .collect();
        if units.is_empty() {
            return Err(SchedulerError::invariant(format!(
                "{} has no connected unit after adding copies",
                po
            )));
        }
        if units.len() == self.machine.units_supporting(operation).count() {
            return Ok(());
        }
        let (inputs, outputs) = {
            let operation = ddg.operation(po);
            (operation.inputs.clone(), operation.outputs.clone())
        };
        for node in inputs {
            ddg.node_mut(node).allowed_destination_units = Some(units.clone());
        }
        for node in outputs {
            ddg.node_mut(node).allowed_source_units = Some(units.clone());
        }
        Ok(())
    }

    /// Connect a move that neither reads nor writes an operation port.
    pub fn add_register_copies_to_rr_move(
        &self,
        ddg: &mut DataDependenceGraph,
        node: NodeId,
    ) -> ScheduleResult<AddedRegisterCopies> {
        let mn = ddg.node(node);
        let destination = self.destination_of(mn, None)?;
        if mn.is_source_immediate() || matches!(mn.mv.source, Terminal::InstructionAddress(_)) {
            return self.add_connection_register_copies_immediate(ddg, node, destination);
        }
        let source = self.source_of(mn, None)?;
        self.connect(ddg, node, source, destination)
    }

    /// Connect an immediate source to `destination`, loading it into a register if needed.
    pub fn add_connection_register_copies_immediate(
        &self,
        ddg: &mut DataDependenceGraph,
        node: NodeId,
        destination: Endpoint,
    ) -> ScheduleResult<AddedRegisterCopies> {
        let mn = ddg.node(node);
        let value = match mn.mv.source {
            Terminal::Immediate(v) | Terminal::Address(v) => v,
            Terminal::InstructionAddress(b) => b as i64,
            _ => {
                return Err(SchedulerError::precondition(format!(
                    "{} does not read an immediate",
                    mn.mv.display(self.machine)
                )))
            }
        };
        self.connect(ddg, node, TransportSource::Immediate(value), destination)
    }

    /// Route `node` through `reg`. Returns the added node.
    pub fn split_through_register(
        &self,
        ddg: &mut DataDependenceGraph,
        node: NodeId,
        reg: RegisterRef,
    ) -> ScheduleResult<NodeId> {
        let chain = self.insert_chain(ddg, node, &[reg])?;
        chain
            .first()
            .copied()
            .ok_or_else(|| SchedulerError::invariant(format!("splitting {} added no node", node)))
    }

    fn connect(
        &self,
        ddg: &mut DataDependenceGraph,
        node: NodeId,
        source: TransportSource,
        destination: Endpoint,
    ) -> ScheduleResult<AddedRegisterCopies> {
        let guard = ddg.node(node).mv.guard;
        let temps = self.plan(source, destination, &guard).ok_or_else(|| {
            SchedulerError::insufficiency(
                ddg.node(node).mv.display(self.machine).to_string(),
                format!(
                    "not connected through at most {} scratch registers",
                    MAX_COPIES_PER_MOVE
                ),
            )
        })?;
        let mut added = AddedRegisterCopies::default();
        if !temps.is_empty() {
            let chain = self.insert_chain(ddg, node, &temps)?;
            added.count = temps.len();
            added.copies.insert(node, chain);
        }
        Ok(added)
    }

    // ---------------------------------------------------------------------
    // Connectivity
    // ---------------------------------------------------------------------

    fn unit_allowed(&self, ddg: &DataDependenceGraph, po: PoId, fu: FuId) -> bool {
        ddg.operation(po).nodes().all(|n| {
            let mn = ddg.node(n);
            let terminal = if mn.destination_operation == Some(po) {
                mn.mv.destination.fu_terminal()
            } else {
                mn.mv.source.fu_terminal()
            };
            terminal.and_then(|t| t.unit).map_or(true, |u| u == fu)
        })
    }

    /// Temporaries `node` needs when `po` runs on `fu`.
    fn path_on_unit(
        &self,
        ddg: &DataDependenceGraph,
        po: PoId,
        node: NodeId,
        fu: FuId,
    ) -> ScheduleResult<Option<Vec<RegisterRef>>> {
        let mn = ddg.node(node);
        let (source, destination) = if mn.destination_operation == Some(po) {
            (self.source_of(mn, None)?, self.destination_of(mn, Some(fu))?)
        } else {
            (self.source_of(mn, Some(fu))?, self.destination_of(mn, None)?)
        };
        Ok(self.plan(source, destination, &mn.mv.guard))
    }

    /// Scratch registers usable as temporaries, the first free one of each file.
    fn temporaries(&self) -> Vec<RegisterRef> {
        let mut temps: Vec<RegisterRef> = Vec::new();
        for reg in &self.machine.scratch_registers {
            if self.reserved.contains(*reg) || temps.iter().any(|t| t.rf == reg.rf) {
                continue;
            }
            temps.push(*reg);
        }
        temps
    }

    fn reaches(&self, source: TransportSource, destination: Endpoint, guard: &Guard) -> bool {
        let guarded = |b| self.machine.bus(b).supports_guard(guard);
        match source {
            TransportSource::Endpoint(src) => self.machine.buses_connecting(src, destination).any(guarded),
            TransportSource::Immediate(value) => {
                self.machine.bus_ids().any(|b| {
                    let bus = self.machine.bus(b);
                    bus.writes(destination) && bus.can_carry_immediate(value) && guarded(b)
                }) || self
                    .machine
                    .immediate_units_reaching(value, destination)
                    .into_iter()
                    .any(|iu| {
                        self.machine
                            .buses_connecting(Endpoint::ImmediateUnit(iu), destination)
                            .any(guarded)
                    })
            }
        }
    }

    /// Shortest chain of temporaries from `source` to `destination`.
    fn plan(&self, source: TransportSource, destination: Endpoint, guard: &Guard) -> Option<Vec<RegisterRef>> {
        if self.reaches(source, destination, guard) {
            return Some(Vec::new());
        }
        let temps = self.temporaries();
        let rf = |r: &RegisterRef| Endpoint::RegisterFile(r.rf);
        let first_hops: Vec<RegisterRef> = temps
            .iter()
            .copied()
            .filter(|t| self.reaches(source, rf(t), guard))
            .collect();
        if let Some(t) = first_hops
            .iter()
            .find(|t| self.reaches(TransportSource::Endpoint(rf(t)), destination, guard))
        {
            return Some(vec![*t]);
        }
        for t1 in &first_hops {
            let from = TransportSource::Endpoint(rf(t1));
            if let Some(t2) = temps.iter().find(|t2| {
                t2.rf != t1.rf
                    && self.reaches(from, rf(t2), guard)
                    && self.reaches(TransportSource::Endpoint(rf(t2)), destination, guard)
            }) {
                return Some(vec![*t1, *t2]);
            }
        }
        None
    }

    fn unit_for(&self, operation: OpId, fixed: Option<FuId>, allowed: Option<&Vec<FuId>>) -> Option<FuId> {
        fixed.or_else(|| {
            self.machine
                .units_supporting(operation)
                .find(|fu| allowed.map_or(true, |a| a.contains(fu)))
        })
    }

    fn source_of(&self, mn: &MoveNode, unit: Option<FuId>) -> ScheduleResult<TransportSource> {
        Ok(match mn.mv.source {
            Terminal::FuPort(ft) => {
                let fu = self
                    .unit_for(ft.operation, unit.or(ft.unit), mn.allowed_source_units.as_ref())
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

    fn destination_of(&self, mn: &MoveNode, unit: Option<FuId>) -> ScheduleResult<Endpoint> {
        match mn.mv.destination {
            Terminal::FuPort(ft) => {
                let fu = self
                    .unit_for(ft.operation, unit.or(ft.unit), mn.allowed_destination_units.as_ref())
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

    fn no_unit(&self, operation: OpId) -> SchedulerError {
        SchedulerError::NoUnitSupportsOperation {
            operation: self.machine.operation(operation).name.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // Graph surgery
    // ---------------------------------------------------------------------

    /// Split `node` through `temps` and fix up the dependences. Returns the added nodes.
    fn insert_chain(
        &self,
        ddg: &mut DataDependenceGraph,
        node: NodeId,
        temps: &[RegisterRef],
    ) -> ScheduleResult<Vec<NodeId>> {
        if temps.is_empty() || temps.len() > MAX_COPIES_PER_MOVE {
            return Err(SchedulerError::precondition(format!(
                "{} temporaries requested for {}",
                temps.len(),
                node
            )));
        }
        let original = ddg.node(node).clone();
        if original.is_scheduled() {
            return Err(SchedulerError::precondition(format!(
                "cannot add copies to scheduled {}",
                node
            )));
        }

        let mut terminals = vec![original.mv.source];
        terminals.extend(temps.iter().map(|r| Terminal::Register(*r)));
        terminals.push(original.mv.destination);
        let hops: Vec<Move> = terminals
            .windows(2)
            .map(|pair| Move::guarded(pair[0], pair[1], original.mv.guard))
            .collect();

        // Result reads stay with their operation; everything else keeps the destination.
        let keep_source = original.is_source_operation();
        let kept = if keep_source { 0 } else { hops.len() - 1 };
        let mut chain = Vec::with_capacity(hops.len());
        let mut added = Vec::new();
        for (i, hop) in hops.iter().enumerate() {
            if i == kept {
                let mn = ddg.node_mut(node);
                mn.mv = *hop;
                chain.push(node);
            } else {
                let copy = ddg.add_node_near(node, *hop);
                ddg.node_mut(copy).connectivity_copy = true;
                chain.push(copy);
                added.push(copy);
            }
        }
        let first = chain[0];
        let last = chain[chain.len() - 1];

        if keep_source {
            if let Some(po) = original.destination_operation {
                ddg.operation_mut(po).remove_input(node);
                ddg.node_mut(node).destination_operation = None;
                ddg.set_destination_operation(last, po);
                let allowed = ddg.node_mut(node).allowed_destination_units.take();
                ddg.node_mut(last).allowed_destination_units = allowed;
            }
        }

        self.rehome_edges(ddg, node, first, last, &added);

        for (i, reg) in temps.iter().enumerate() {
            ddg.connect_nodes(chain[i], chain[i + 1], DataDependenceEdge::register(DependenceType::Raw, *reg));
        }
        let block = ddg.block(original.block).clone();
        for (i, reg) in temps.iter().enumerate() {
            self.order_against_other_users(ddg, block.graph, &chain, i, *reg, original.order, block.is_loop);
        }
        log::trace!(
            "Split {} into {} moves through {}",
            node,
            chain.len(),
            temps
                .iter()
                .map(|r| self.machine.register_name(*r))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(added)
    }

    /// Move each dependence of `node` to the chain end it belongs to.
    fn rehome_edges(&self, ddg: &mut DataDependenceGraph, node: NodeId, first: NodeId, last: NodeId, added: &[NodeId]) {
        for e in ddg.in_edges_raw(node) {
            let Some(entry) = ddg.edge(e).copied() else { continue };
            if entry.tail == node {
                continue;
            }
            let edge = entry.edge;
            if edge.guard_use && edge.kind == DependenceType::Raw {
                for copy in added {
                    ddg.connect_or_merge(entry.tail, *copy, edge);
                }
                continue;
            }
            let reads_source = !edge.head_pseudo
                && edge.kind == DependenceType::Raw
                && matches!(edge.reason, EdgeReason::Register | EdgeReason::Operation | EdgeReason::Ra);
            let target = if reads_source { first } else { last };
            if target != node {
                ddg.remove_edge(e);
                ddg.connect_nodes(entry.tail, target, edge);
            }
        }
        for e in ddg.out_edges_raw(node) {
            let Some(entry) = ddg.edge(e).copied() else { continue };
            if entry.head == node {
                continue;
            }
            let edge = entry.edge;
            if edge.head_pseudo {
                for copy in added {
                    ddg.connect_or_merge(*copy, entry.head, edge);
                }
                continue;
            }
            let source_read = edge.kind == DependenceType::War
                && !edge.guard_use
                && matches!(edge.reason, EdgeReason::Register | EdgeReason::Ra);
            let tail = if source_read { first } else { last };
            if tail != node {
                ddg.remove_edge(e);
                ddg.connect_nodes(tail, entry.head, edge);
            }
        }
    }

    /// Serialize the use of `reg` by `chain[hop]`/`chain[hop + 1]` against every other move touching it.
    #[allow(clippy::too_many_arguments)]
    fn order_against_other_users(
        &self,
        ddg: &mut DataDependenceGraph,
        graph: GraphId,
        chain: &[NodeId],
        hop: usize,
        reg: RegisterRef,
        order: usize,
        is_loop: bool,
    ) {
        let writer = chain[hop];
        let reader = chain[hop + 1];
        let war = DataDependenceEdge::register(DependenceType::War, reg);
        let waw = DataDependenceEdge::register(DependenceType::Waw, reg);
        if is_loop {
            ddg.connect_or_merge(reader, writer, war.loop_carried(1));
        }
        for other in ddg.view(graph).nodes() {
            if chain.contains(&other) {
                continue;
            }
            let mn = ddg.node(other);
            let data_read = mn.mv.source.register() == Some(reg);
            let guard_read = mn.mv.guard.register() == Some(reg);
            let writes = mn.mv.destination.register() == Some(reg);
            if !(data_read || guard_read || writes) {
                continue;
            }
            let read_edge = if data_read { war } else { war.with_guard_use() };
            if mn.order <= order {
                if data_read || guard_read {
                    ddg.connect_or_merge(other, writer, read_edge);
                }
                if writes {
                    ddg.connect_or_merge(other, writer, waw);
                    if is_loop {
                        ddg.connect_or_merge(reader, other, war.loop_carried(1));
                    }
                }
            } else {
                if writes {
                    ddg.connect_or_merge(reader, other, war);
                    ddg.connect_or_merge(writer, other, waw);
                }
                if data_read || guard_read {
                    // A later read of the value from before the chain must happen before the chain overwrites it.
                    if !reads_write_after(ddg, other, reg, order) {
                        ddg.connect_or_merge(other, writer, read_edge);
                    } else if is_loop {
                        ddg.connect_or_merge(other, writer, read_edge.loop_carried(1));
                    }
                }
            }
        }
    }
}

/// True if `node` reads `reg` as written by a move after program position `order`.
fn reads_write_after(ddg: &DataDependenceGraph, node: NodeId, reg: RegisterRef, order: usize) -> bool {
    ddg.in_edges_raw(node)
        .into_iter()
        .filter_map(|e| ddg.edge(e))
        .any(|entry| {
            entry.edge.kind == DependenceType::Raw
                && !entry.edge.back_edge
                && entry.edge.data.register() == Some(reg)
                && ddg.node(entry.tail).order > order
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddg::{CycleQuery, DdgBuilder};
    use crate::machine::presets;
    use crate::program::BasicBlock;
    use crate::scheduler::BlockScheduler;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn reg(m: &Machine, rf: &str, i: u16) -> Terminal {
        Terminal::Register(RegisterRef::new(m.rf_by_name(rf).unwrap(), i))
    }

    fn binary_block(m: &Machine, op: &str, rf: &str) -> BasicBlock {
        let op = m.operation_by_name(op).unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(m, rf, 1), Terminal::fu_port(op, 1))],
            vec![Move::new(reg(m, rf, 2), Terminal::fu_port(op, 2))],
            vec![Move::new(Terminal::fu_port(op, 3), reg(m, rf, 3))],
        ];
        block
    }

    #[test]
    fn test_connected_unit_needs_no_copies() {
        init_logger();
        let m = presets::clustered().unwrap();
        let mut ddg = DdgBuilder::new(&m).build_block(&binary_block(&m, "add", "RFB")).unwrap();
        let adder = RegisterCopyAdder::new(&m);
        let counts = adder.required_register_copies_for_each_fu(&ddg, PoId(0)).unwrap();
        let alua = m.fu_by_name("ALUA").unwrap();
        let alub = m.fu_by_name("ALUB").unwrap();
        assert_eq!(counts, vec![(alua, Some(3)), (alub, Some(0))]);

        let added = adder.add_minimum_register_copies(&mut ddg, PoId(0)).unwrap();
        assert_eq!(added.count, 0);
        assert_eq!(ddg.root().node_count(), 3);
        assert_eq!(ddg.node(NodeId(0)).allowed_destination_units, Some(vec![alub]));
        assert_eq!(ddg.node(NodeId(2)).allowed_source_units, Some(vec![alub]));
    }

    #[test]
    fn test_two_hop_chains() {
        init_logger();
        let m = presets::clustered().unwrap();
        let mut ddg = DdgBuilder::new(&m).build_block(&binary_block(&m, "mul", "RFA")).unwrap();
        let adder = RegisterCopyAdder::new(&m);
        let added = adder.add_minimum_register_copies(&mut ddg, PoId(0)).unwrap();
        assert_eq!(added.count, 6);
        for copies in added.copies.values() {
            assert!(copies.len() <= MAX_COPIES_PER_MOVE);
        }

        // The operand write keeps its node and now reads the last temporary.
        let rfc = m.rf_by_name("RFC").unwrap();
        assert_eq!(ddg.node(NodeId(0)).mv.source.register().map(|r| r.rf), Some(rfc));
        assert_eq!(ddg.node(NodeId(0)).destination_operation, Some(PoId(0)));
        // The result read keeps its node and now writes the first temporary.
        assert_eq!(ddg.node(NodeId(2)).mv.destination.register().map(|r| r.rf), Some(rfc));
        assert_eq!(ddg.node(NodeId(2)).source_operation, Some(PoId(0)));
        assert!(ddg.sanity_check(GraphId::ROOT, &m).is_ok());
        assert_eq!(adder.required_register_copies_for_each_fu(&ddg, PoId(0)).unwrap()[0].1, Some(0));
    }

    #[test]
    fn test_copy_chain_dependences() {
        let m = presets::clustered().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let alub = m.fu_by_name("ALUB").unwrap();
        let mut dst = Terminal::fu_port(add, 1);
        if let Some(t) = dst.fu_terminal_mut() {
            t.unit = Some(alub);
        }
        let mut trig = Terminal::fu_port(add, 2);
        if let Some(t) = trig.fu_terminal_mut() {
            t.unit = Some(alub);
        }
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(Terminal::Immediate(3), reg(&m, "RFA", 1))],
            vec![Move::new(reg(&m, "RFA", 1), dst)],
            vec![Move::new(reg(&m, "RFB", 2), trig)],
        ];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let adder = RegisterCopyAdder::new(&m);
        let added = adder.add_minimum_register_copies(&mut ddg, PoId(0)).unwrap();
        assert_eq!(added.count, 1);
        let copy = added.copies[&NodeId(1)][0];
        assert!(ddg.node(copy).connectivity_copy);
        // The RAW on RFA.1 now feeds the copy, which feeds the operand write.
        assert!(ddg.root().has_edge(NodeId(0), copy));
        assert!(!ddg.root().has_edge(NodeId(0), NodeId(1)));
        assert!(ddg.root().has_edge(copy, NodeId(1)));

        ddg.node_mut(NodeId(0)).set_cycle(Some(0));
        ddg.node_mut(copy).set_cycle(Some(1));
        assert_eq!(
            ddg.earliest_cycle(NodeId(1), 0, CycleQuery::default()).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn test_unconnected_move_is_insufficiency() {
        let m = presets::clustered().unwrap();
        let mut block = BasicBlock::new("entry");
        // XAB carries no guards, so a guarded RFA -> RFB copy is impossible on BA.
        let flag = RegisterRef::new(m.rf_by_name("BOOL").unwrap(), 0);
        let guard = Guard::Register {
            reg: flag,
            inverted: false,
        };
        block.instructions = vec![vec![Move::guarded(reg(&m, "RFA", 1), reg(&m, "RFC", 2), guard)]];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let err = RegisterCopyAdder::new(&m)
            .add_register_copies_to_rr_move(&mut ddg, NodeId(0))
            .unwrap_err();
        assert!(err.is_machine_insufficiency());
    }

    #[test]
    fn test_immediate_loaded_through_register() {
        let m = presets::clustered().unwrap();
        let mut block = BasicBlock::new("entry");
        // Only BA carries immediates; RFC is two copies away.
        block.instructions = vec![vec![Move::new(Terminal::Immediate(7), reg(&m, "RFC", 1))]];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let adder = RegisterCopyAdder::new(&m);
        let added = adder.add_register_copies_to_rr_move(&mut ddg, NodeId(0)).unwrap();
        assert_eq!(added.count, 2);
        let first = added.copies[&NodeId(0)][0];
        assert_eq!(ddg.node(first).mv.source, Terminal::Immediate(7));
        assert_eq!(ddg.node(NodeId(0)).mv.destination, reg(&m, "RFC", 1));

        let mut connected = BasicBlock::new("entry");
        connected.instructions = vec![vec![Move::new(Terminal::Immediate(7), reg(&m, "RFA", 1))]];
        let mut ddg = DdgBuilder::new(&m).build_block(&connected).unwrap();
        let rfa = Endpoint::RegisterFile(m.rf_by_name("RFA").unwrap());
        let added = adder
            .add_connection_register_copies_immediate(&mut ddg, NodeId(0), rfa)
            .unwrap();
        assert_eq!(added.count, 0);
    }

    #[test]
    fn test_chains_share_scratch_register_in_order() {
        let m = presets::clustered().unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(&m, "RFA", 1), reg(&m, "RFC", 1))],
            vec![Move::new(reg(&m, "RFA", 2), reg(&m, "RFC", 2))],
        ];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let adder = RegisterCopyAdder::new(&m);
        let added = adder.add_copies_for_graph(&mut ddg, GraphId::ROOT).unwrap();
        assert_eq!(added.count, 2);
        let first_copy = added.copies[&NodeId(0)][0];
        let second_copy = added.copies[&NodeId(1)][0];
        // The second chain may only overwrite RFB.7 after the first has read it.
        assert!(ddg.root().has_edge(NodeId(0), second_copy));
        assert!(ddg.root().has_edge(first_copy, second_copy));
        assert!(ddg.sanity_check(GraphId::ROOT, &m).is_ok());
    }

    #[test]
    fn test_chain_waits_for_later_reader_of_scratch_register() {
        init_logger();
        let m = presets::clustered().unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(&m, "RFB", 3), reg(&m, "RFB", 7))],
            vec![Move::new(reg(&m, "RFA", 1), reg(&m, "RFC", 1))],
            vec![Move::new(reg(&m, "RFB", 7), reg(&m, "RFB", 2))],
        ];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let added = RegisterCopyAdder::new(&m)
            .add_copies_for_graph(&mut ddg, GraphId::ROOT)
            .unwrap();
        assert_eq!(added.count, 1);
        let copy = added.copies[&NodeId(1)][0];
        assert_eq!(ddg.node(copy).mv.destination, reg(&m, "RFB", 7));

        // RFB.2 still receives RFB.3: the copy overwrites RFB.7 only after node 2 read it.
        assert!(ddg.root().has_edge(NodeId(0), copy));
        assert!(ddg.root().has_edge(NodeId(2), copy));
        assert!(!ddg.root().has_edge(copy, NodeId(2)));

        let mut session = crate::core::SchedulingSession::new();
        crate::scheduler::ListScheduler::new(&m, crate::scheduler::SchedulerOptions::default())
            .schedule_block(&mut ddg, 0, &mut session)
            .unwrap();
        let cycle = |n: NodeId| ddg.node(n).cycle().unwrap();
        assert!(cycle(NodeId(0)) < cycle(NodeId(2)));
        assert!(cycle(NodeId(2)) <= cycle(copy));
        assert!(cycle(copy) < cycle(NodeId(1)));
    }

    #[test]
    fn test_reserved_scratch_register_is_not_used() {
        let m = presets::clustered().unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![vec![Move::new(reg(&m, "RFA", 1), reg(&m, "RFC", 1))]];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let mut reserved = RegisterSet::new();
        reserved.insert(RegisterRef::new(m.rf_by_name("RFB").unwrap(), 7));
        let err = RegisterCopyAdder::new(&m)
            .with_reserved(&reserved)
            .add_copies_for_graph(&mut ddg, GraphId::ROOT)
            .unwrap_err();
        assert!(err.is_machine_insufficiency());
    }
}
