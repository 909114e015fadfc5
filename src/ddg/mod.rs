// This module implements the data dependence graph over move nodes. The root graph is an
// arena owning every MoveNode, ProgramOperation and DataDependenceEdge of a scheduling
// region; nodes and operations are addressed by index and edges by EdgeId, with per-node
// incoming and outgoing edge lists. Subgraphs are id-addressed views over the root: a
// node set, a set of dropped edges and a flag hiding loop back edges, so several filtered
// views can coexist without owning anything. Queries go through GraphView, which applies
// the view's filter. The latency model (delay slots, minimum operation latencies, guard
// latencies) is copied from the machine by set_machine and must be present before any
// cycle query. Construction lives in builder.rs, software bypassing in bypass.rs,
// register renaming with undo in rename.rs, the sanity check in sanity.rs, dot output in
// dot.rs, heuristic edge weights in weight.rs and the schedule verifier in verify.rs.

//! Data dependence graph.
//!
//! Earliest and latest cycle queries follow these rules for an edge
//! `tail -> head` with both ends scheduled:
//!
//! | edge | constraint |
//! |---|---|
//! | RAW | `head >= tail + latency` (operation latency within one operation, guard latency for guard uses, else 1) |
//! | WAR | `head >= tail - latency + 1` (latency is the tail's guard latency for guard uses, else 1) |
//! | WAW | `head >= tail + 1` |
//! | head pseudo | `head >= tail - delay_slots` |
//!
//! Loop-carried edges of depth `d` use `head + d * ii` in place of `head`.

pub mod builder;
pub mod bypass;
pub mod dot;
pub mod edge;
pub mod rename;
pub mod sanity;
pub mod verify;
pub mod weight;

pub use builder::DdgBuilder;
pub use edge::{DataDependenceEdge, DataTag, DependenceType, EdgeEntry, EdgeId, EdgeReason};
pub use rename::UndoData;

use crate::core::{RegisterSet, ScheduleResult, SchedulerError};
use crate::machine::{Guard, Machine, OpId};
use crate::program::{Move, MoveNode, NodeId, PoId, ProgramOperation};
use hashbrown::HashSet;
use std::collections::VecDeque;

/// Index of a graph view. The root graph is always `GraphId::ROOT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(pub usize);

impl GraphId {
    pub const ROOT: GraphId = GraphId(0);
}

/// Machine parameters the cycle queries need.
#[derive(Debug, Clone)]
pub struct LatencyModel {
    pub delay_slots: i32,
    /// Smallest latency of each operation over all units; indexed by `OpId`.
    operation_latencies: Vec<Option<i32>>,
    rf_guard_latencies: Vec<i32>,
    global_guard_latency: i32,
    control_flow: Vec<bool>,
}

impl LatencyModel {
    pub fn from_machine(machine: &Machine) -> Self {
        Self {
            delay_slots: machine.control_unit.delay_slots as i32,
            operation_latencies: (0..machine.operations.len())
                .map(|op| machine.operation_latency(OpId(op)).map(i32::from))
                .collect(),
            rf_guard_latencies: machine
                .register_files
                .iter()
                .map(|rf| rf.guard_latency as i32)
                .collect(),
            global_guard_latency: machine.control_unit.global_guard_latency as i32,
            control_flow: machine.operations.iter().map(|op| op.control_flow).collect(),
        }
    }

    pub fn is_control_flow(&self, op: OpId) -> bool {
        self.control_flow.get(op.0).copied().unwrap_or(false)
    }

    /// Operation latency, 1 for operations no unit implements.
    pub fn operation_latency(&self, op: OpId) -> i32 {
        self.operation_latencies
            .get(op.0)
            .copied()
            .flatten()
            .unwrap_or(1)
    }

    pub fn guard_latency(&self, guard: &Guard) -> i32 {
        match guard {
            Guard::Unconditional => 0,
            Guard::Register { reg, .. } => {
                self.rf_guard_latencies.get(reg.rf.0).copied().unwrap_or(1)
                    + self.global_guard_latency
            }
            Guard::Port { .. } => self.global_guard_latency.max(1),
        }
    }
}

/// Flags relaxing the cycle queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleQuery {
    pub ignore_register_war: bool,
    pub ignore_register_waw: bool,
    pub ignore_guards: bool,
    /// Skip function unit state and memory edges.
    pub ignore_fu_deps: bool,
    pub ignore_same_operation_edges: bool,
    /// Skip unscheduled neighbours instead of answering "unknown".
    pub ignore_unscheduled: bool,
}

/// Basic block the nodes came from.
#[derive(Debug, Clone)]
pub struct BasicBlockNode {
    pub label: String,
    pub is_loop: bool,
    pub graph: GraphId,
}

#[derive(Debug, Clone)]
struct ViewData {
    name: String,
    parent: Option<GraphId>,
    nodes: HashSet<NodeId>,
    operations: HashSet<PoId>,
    dropped_edges: HashSet<EdgeId>,
    drop_back_edges: bool,
}

/// Root dependence graph arena.
#[derive(Debug, Clone)]
pub struct DataDependenceGraph {
    latency: Option<LatencyModel>,
    nodes: Vec<MoveNode>,
    edges: Vec<Option<EdgeEntry>>,
    in_edges: Vec<Vec<EdgeId>>,
    out_edges: Vec<Vec<EdgeId>>,
    operations: Vec<ProgramOperation>,
    blocks: Vec<BasicBlockNode>,
    views: Vec<ViewData>,
    merges: Vec<bypass::MergeRecord>,
    /// Registers named by the moves added with `add_node`.
    program_registers: RegisterSet,
}

impl Default for DataDependenceGraph {
    fn default() -> Self {
        Self::new("root")
    }
}

impl DataDependenceGraph {
    pub fn new(name: &str) -> Self {
        Self {
            latency: None,
            nodes: Vec::new(),
            edges: Vec::new(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            operations: Vec::new(),
            blocks: Vec::new(),
            views: vec![ViewData {
                name: name.to_string(),
                parent: None,
                nodes: HashSet::new(),
                operations: HashSet::new(),
                dropped_edges: HashSet::new(),
                drop_back_edges: false,
            }],
            merges: Vec::new(),
            program_registers: RegisterSet::new(),
        }
    }

    /// Bind the machine used for latencies.
    pub fn set_machine(&mut self, machine: &Machine) {
        self.latency = Some(LatencyModel::from_machine(machine));
    }

    pub fn latency_model(&self) -> ScheduleResult<&LatencyModel> {
        self.latency
            .as_ref()
            .ok_or_else(|| SchedulerError::precondition("set_machine() must be called before cycle queries"))
    }

    pub fn name(&self, graph: GraphId) -> &str {
        &self.views[graph.0].name
    }

    // ---------------------------------------------------------------------
    // Nodes, operations, blocks
    // ---------------------------------------------------------------------

    pub fn add_block(&mut self, label: &str, is_loop: bool) -> usize {
        let graph = GraphId(self.views.len());
        self.views.push(ViewData {
            name: label.to_string(),
            parent: Some(GraphId::ROOT),
            nodes: HashSet::new(),
            operations: HashSet::new(),
            dropped_edges: HashSet::new(),
            drop_back_edges: false,
        });
        self.blocks.push(BasicBlockNode {
            label: label.to_string(),
            is_loop,
            graph,
        });
        self.blocks.len() - 1
    }

    pub fn block(&self, index: usize) -> &BasicBlockNode {
        &self.blocks[index]
    }

    pub fn blocks(&self) -> &[BasicBlockNode] {
        &self.blocks
    }

    /// Add a move to `graph` and every graph above it.
    pub fn add_node(&mut self, graph: GraphId, mv: Move, block: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        let order = self.nodes.len();
        for reg in [mv.source.register(), mv.destination.register(), mv.guard.register()]
            .into_iter()
            .flatten()
        {
            self.program_registers.insert(reg);
        }
        self.nodes.push(MoveNode::new(id, mv, order, block));
        self.in_edges.push(Vec::new());
        self.out_edges.push(Vec::new());
        self.include_node(graph, id);
        id
    }

    /// Registers the program reads, writes or guards on. Copies never add to this set.
    pub fn program_registers(&self) -> &RegisterSet {
        &self.program_registers
    }

    /// Add a copy move right after `related` in program order, in every graph holding `related`.
    pub fn add_node_near(&mut self, related: NodeId, mv: Move) -> NodeId {
        let block = self.nodes[related.0].block;
        let id = NodeId(self.nodes.len());
        let order = self.nodes[related.0].order;
        self.nodes.push(MoveNode::new(id, mv, order, block));
        self.in_edges.push(Vec::new());
        self.out_edges.push(Vec::new());
        for view in self.views.iter_mut() {
            if view.nodes.contains(&related) {
                view.nodes.insert(id);
            }
        }
        id
    }

    fn include_node(&mut self, graph: GraphId, node: NodeId) {
        let mut current = Some(graph);
        while let Some(g) = current {
            self.views[g.0].nodes.insert(node);
            current = self.views[g.0].parent;
        }
        // Nodes always belong to the root even if the chain above was broken.
        self.views[GraphId::ROOT.0].nodes.insert(node);
    }

    /// Remove a node and all its edges from every graph.
    pub fn remove_node(&mut self, node: NodeId) {
        let edges: Vec<EdgeId> = self.in_edges[node.0]
            .iter()
            .chain(self.out_edges[node.0].iter())
            .copied()
            .collect();
        for e in edges {
            self.remove_edge(e);
        }
        for view in self.views.iter_mut() {
            view.nodes.remove(&node);
        }
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.views[GraphId::ROOT.0].nodes.contains(&node)
    }

    pub fn node(&self, id: NodeId) -> &MoveNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut MoveNode {
        &mut self.nodes[id.0]
    }

    pub fn add_program_operation(&mut self, graph: GraphId, operation: OpId, machine: &Machine) -> PoId {
        let id = PoId(self.operations.len());
        self.operations.push(ProgramOperation::new(id, operation, machine));
        let mut current = Some(graph);
        while let Some(g) = current {
            self.views[g.0].operations.insert(id);
            current = self.views[g.0].parent;
        }
        self.views[GraphId::ROOT.0].operations.insert(id);
        id
    }

    pub fn operation(&self, id: PoId) -> &ProgramOperation {
        &self.operations[id.0]
    }

    pub(crate) fn operation_mut(&mut self, id: PoId) -> &mut ProgramOperation {
        &mut self.operations[id.0]
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Make `node` an operand move of `po`.
    pub fn set_destination_operation(&mut self, node: NodeId, po: PoId) {
        self.nodes[node.0].destination_operation = Some(po);
        self.operations[po.0].add_input(node);
    }

    /// Make `node` a result move of `po`.
    pub fn set_source_operation(&mut self, node: NodeId, po: PoId) {
        self.nodes[node.0].source_operation = Some(po);
        self.operations[po.0].add_output(node);
    }

    /// Trigger move of the operation `node` writes, if it has been added.
    pub fn trigger_of(&self, po: PoId, machine: &Machine) -> Option<NodeId> {
        let operation = self.operations[po.0].operation;
        let trigger = machine.trigger_operand(operation)?;
        self.operations[po.0].inputs.iter().copied().find(|n| {
            self.nodes[n.0]
                .mv
                .destination
                .fu_terminal()
                .is_some_and(|t| t.operand == trigger)
        })
    }

    // ---------------------------------------------------------------------
    // Edges
    // ---------------------------------------------------------------------

    pub fn connect_nodes(&mut self, tail: NodeId, head: NodeId, edge: DataDependenceEdge) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.edges.push(Some(EdgeEntry { tail, head, edge }));
        self.out_edges[tail.0].push(id);
        self.in_edges[head.0].push(id);
        id
    }

    /// Connect unless an identical edge already exists. Returns the new edge, if any.
    pub fn connect_or_merge(&mut self, tail: NodeId, head: NodeId, edge: DataDependenceEdge) -> Option<EdgeId> {
        if self.has_equal_edge(tail, head, &edge) {
            return None;
        }
        Some(self.connect_nodes(tail, head, edge))
    }

    pub fn has_equal_edge(&self, tail: NodeId, head: NodeId, edge: &DataDependenceEdge) -> bool {
        self.out_edges[tail.0].iter().any(|e| {
            self.edges[e.0]
                .as_ref()
                .is_some_and(|entry| entry.head == head && entry.edge == *edge)
        })
    }

    pub fn edge(&self, id: EdgeId) -> Option<&EdgeEntry> {
        self.edges.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn edge_mut(&mut self, id: EdgeId) -> Option<&mut EdgeEntry> {
        self.edges.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Remove an edge from the arena and every view.
    pub fn remove_edge(&mut self, id: EdgeId) -> Option<EdgeEntry> {
        let entry = self.edges.get_mut(id.0)?.take()?;
        self.out_edges[entry.tail.0].retain(|e| *e != id);
        self.in_edges[entry.head.0].retain(|e| *e != id);
        Some(entry)
    }

    /// Put a removed edge back under its old id.
    pub(crate) fn restore_edge(&mut self, id: EdgeId, entry: EdgeEntry) {
        if id.0 >= self.edges.len() {
            self.edges.resize(id.0 + 1, None);
        }
        self.out_edges[entry.tail.0].push(id);
        self.in_edges[entry.head.0].push(id);
        self.edges[id.0] = Some(entry);
    }

    /// Every live edge, in id order.
    pub fn edge_entries(&self) -> impl Iterator<Item = (EdgeId, &EdgeEntry)> {
        self.edges
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|entry| (EdgeId(i), entry)))
    }

    /// Sorted snapshot of the edge set, for comparing graph states.
    pub fn edge_set(&self) -> Vec<(NodeId, NodeId, DataDependenceEdge)> {
        let mut set: Vec<_> = self
            .edge_entries()
            .map(|(_, e)| (e.tail, e.head, e.edge))
            .collect();
        set.sort_by_key(|(t, h, e)| (*t, *h, format!("{:?}", e)));
        set
    }

    // ---------------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------------

    pub fn view(&self, graph: GraphId) -> GraphView<'_> {
        GraphView { ddg: self, id: graph }
    }

    pub fn root(&self) -> GraphView<'_> {
        self.view(GraphId::ROOT)
    }

    /// Create a filtered child graph of `parent` over `nodes`.
    ///
    /// With `include_loops == false` the child hides loop back edges.
    pub fn create_subgraph(
        &mut self,
        parent: GraphId,
        nodes: &[NodeId],
        include_loops: bool,
    ) -> ScheduleResult<GraphId> {
        let parent_view = self
            .views
            .get(parent.0)
            .ok_or_else(|| SchedulerError::precondition(format!("no graph {:?}", parent)))?;
        if let Some(missing) = nodes.iter().find(|n| !parent_view.nodes.contains(*n)) {
            return Err(SchedulerError::precondition(format!(
                "{} is not in graph {}",
                missing, parent_view.name
            )));
        }
        let node_set: HashSet<NodeId> = nodes.iter().copied().collect();
        let operations: HashSet<PoId> = nodes
            .iter()
            .flat_map(|n| {
                let node = &self.nodes[n.0];
                [node.source_operation, node.destination_operation]
            })
            .flatten()
            .collect();
        let view = ViewData {
            name: format!("{}_sub{}", parent_view.name, self.views.len()),
            parent: Some(parent),
            nodes: node_set,
            operations,
            dropped_edges: parent_view.dropped_edges.clone(),
            drop_back_edges: parent_view.drop_back_edges || !include_loops,
        };
        let id = GraphId(self.views.len());
        log::trace!("Created subgraph {} with {} nodes", view.name, view.nodes.len());
        self.views.push(view);
        Ok(id)
    }

    /// Hide loop back edges in `graph`.
    pub fn drop_back_edges(&mut self, graph: GraphId) {
        self.views[graph.0].drop_back_edges = true;
    }

    /// Hide a single edge in `graph` only.
    pub fn drop_edge(&mut self, graph: GraphId, edge: EdgeId) {
        self.views[graph.0].dropped_edges.insert(edge);
    }

    // Root shorthands.

    pub fn earliest_cycle(&self, node: NodeId, ii: i32, query: CycleQuery) -> ScheduleResult<Option<i32>> {
        self.root().earliest_cycle(node, ii, query)
    }

    pub fn latest_cycle(&self, node: NodeId, ii: i32, query: CycleQuery) -> ScheduleResult<Option<i32>> {
        self.root().latest_cycle(node, ii, query)
    }

    /// Minimum distance `head - tail` an edge requires, before loop adjustment.
    pub fn edge_latency(&self, entry: &EdgeEntry) -> ScheduleResult<i32> {
        let latency = self.latency_model()?;
        Ok(self.distance_with(latency, entry))
    }

    fn distance_with(&self, latency: &LatencyModel, entry: &EdgeEntry) -> i32 {
        let edge = &entry.edge;
        let tail = &self.nodes[entry.tail.0];
        let head = &self.nodes[entry.head.0];
        if edge.head_pseudo {
            return -latency.delay_slots;
        }
        if edge.reason == EdgeReason::Operation
            && head.is_source_operation()
            && tail.in_same_operation(head)
        {
            return match edge.data {
                DataTag::Operation(op) => latency.operation_latency(op),
                _ => head
                    .source_operation
                    .map(|po| latency.operation_latency(self.operations[po.0].operation))
                    .unwrap_or(1),
            };
        }
        match edge.kind {
            DependenceType::Waw => 1,
            DependenceType::War => {
                let lat = if edge.guard_use {
                    latency.guard_latency(&tail.mv.guard)
                } else {
                    1
                };
                1 - lat
            }
            DependenceType::Raw | DependenceType::Unknown => {
                if edge.guard_use {
                    latency.guard_latency(&head.mv.guard)
                } else {
                    1
                }
            }
        }
    }
}

/// Read-only, filtered access to one graph.
#[derive(Clone, Copy)]
pub struct GraphView<'g> {
    ddg: &'g DataDependenceGraph,
    id: GraphId,
}

impl<'g> GraphView<'g> {
    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn ddg(&self) -> &'g DataDependenceGraph {
        self.ddg
    }

    fn data(&self) -> &'g ViewData {
        &self.ddg.views[self.id.0]
    }

    pub fn name(&self) -> &'g str {
        &self.data().name
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.data().nodes.contains(&node)
    }

    pub fn node(&self, id: NodeId) -> &'g MoveNode {
        self.ddg.node(id)
    }

    /// Nodes of the view in program order.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.data().nodes.iter().copied().collect();
        nodes.sort_by_key(|n| (self.ddg.nodes[n.0].order, n.0));
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.data().nodes.len()
    }

    /// Program operations with at least one move in the view, by id.
    pub fn operations(&self) -> Vec<PoId> {
        let mut ops: Vec<PoId> = self.data().operations.iter().copied().collect();
        ops.sort();
        ops
    }

    pub fn edge_visible(&self, id: EdgeId) -> bool {
        let Some(entry) = self.ddg.edge(id) else {
            return false;
        };
        let view = self.data();
        view.nodes.contains(&entry.tail)
            && view.nodes.contains(&entry.head)
            && !view.dropped_edges.contains(&id)
            && !(view.drop_back_edges && entry.edge.back_edge)
    }

    pub fn in_edges(&self, node: NodeId) -> Vec<EdgeId> {
        self.ddg.in_edges[node.0]
            .iter()
            .copied()
            .filter(|e| self.edge_visible(*e))
            .collect()
    }

    pub fn out_edges(&self, node: NodeId) -> Vec<EdgeId> {
        self.ddg.out_edges[node.0]
            .iter()
            .copied()
            .filter(|e| self.edge_visible(*e))
            .collect()
    }

    pub fn in_degree(&self, node: NodeId) -> usize {
        self.in_edges(node).len()
    }

    pub fn out_degree(&self, node: NodeId) -> usize {
        self.out_edges(node).len()
    }

    fn entry(&self, id: EdgeId) -> Option<&'g EdgeEntry> {
        self.ddg.edge(id)
    }

    /// Visible edges from `tail` to `head`.
    pub fn connecting_edges(&self, tail: NodeId, head: NodeId) -> Vec<EdgeId> {
        self.out_edges(tail)
            .into_iter()
            .filter(|e| self.entry(*e).is_some_and(|entry| entry.head == head))
            .collect()
    }

    pub fn has_edge(&self, tail: NodeId, head: NodeId) -> bool {
        !self.connecting_edges(tail, head).is_empty()
    }

    /// True if `to` is reachable from `from` without crossing loop back edges.
    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(n) = queue.pop_front() {
            if n == to {
                return true;
            }
            if !seen.insert(n) {
                continue;
            }
            for e in self.out_edges(n) {
                if let Some(entry) = self.entry(e) {
                    if !entry.edge.back_edge {
                        queue.push_back(entry.head);
                    }
                }
            }
        }
        false
    }

    /// Earliest cycle allowed by scheduled predecessors.
    ///
    /// `None` if a predecessor that matters is still unscheduled.
    pub fn earliest_cycle(&self, node: NodeId, ii: i32, query: CycleQuery) -> ScheduleResult<Option<i32>> {
        let latency = self.ddg.latency_model()?;
        let me = self.node(node);
        let mut min_cycle = 0;
        for e in self.in_edges(node) {
            let Some(entry) = self.entry(e) else { continue };
            let edge = &entry.edge;
            if entry.tail == node || skip_edge(edge, &query) || (edge.loop_depth > 0 && ii == 0) {
                continue;
            }
            let tail = self.node(entry.tail);
            if query.ignore_same_operation_edges
                && !edge.back_edge
                && me.is_source_operation()
                && me.source_operation == tail.destination_operation
            {
                continue;
            }
            match tail.cycle() {
                Some(tail_cycle) => {
                    let eff = tail_cycle + self.ddg.distance_with(latency, entry)
                        - ii * edge.loop_depth as i32;
                    min_cycle = min_cycle.max(eff);
                }
                None => {
                    if !edge.back_edge && !query.ignore_unscheduled {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(Some(min_cycle))
    }

    /// Latest cycle allowed by scheduled successors; `i32::MAX` if unconstrained.
    ///
    /// `None` if a successor that matters is still unscheduled.
    pub fn latest_cycle(&self, node: NodeId, ii: i32, query: CycleQuery) -> ScheduleResult<Option<i32>> {
        let latency = self.ddg.latency_model()?;
        let mut max_cycle = i32::MAX;
        for e in self.out_edges(node) {
            let Some(entry) = self.entry(e) else { continue };
            let edge = &entry.edge;
            if entry.head == node || skip_edge(edge, &query) || (edge.loop_depth > 0 && ii == 0) {
                continue;
            }
            let head = self.node(entry.head);
            match head.cycle() {
                Some(head_cycle) => {
                    let eff = head_cycle - self.ddg.distance_with(latency, entry)
                        + ii * edge.loop_depth as i32;
                    max_cycle = max_cycle.min(eff);
                }
                None => {
                    if !edge.back_edge && !query.ignore_unscheduled {
                        return Ok(None);
                    }
                }
            }
        }
        Ok(Some(max_cycle))
    }

    /// All predecessors outside the node's own operation are scheduled.
    pub fn predecessors_ready(&self, node: NodeId) -> bool {
        let me = self.node(node);
        self.in_edges(node).into_iter().all(|e| {
            let Some(entry) = self.entry(e) else { return true };
            let tail = self.node(entry.tail);
            entry.edge.back_edge
                || entry.tail == node
                || tail.is_scheduled()
                || tail.in_same_operation(me)
        })
    }

    /// All successors outside the node's own operation are scheduled.
    pub fn successors_ready(&self, node: NodeId) -> bool {
        let me = self.node(node);
        self.out_edges(node).into_iter().all(|e| {
            let Some(entry) = self.entry(e) else { return true };
            let head = self.node(entry.head);
            entry.edge.back_edge
                || entry.head == node
                || head.is_scheduled()
                || head.in_same_operation(me)
        })
    }

    pub fn scheduled_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .filter(|n| self.node(*n).is_scheduled())
            .collect()
    }

    pub fn unscheduled_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .filter(|n| !self.node(*n).is_scheduled())
            .collect()
    }

    pub fn smallest_cycle(&self) -> Option<i32> {
        self.data()
            .nodes
            .iter()
            .filter_map(|n| self.node(*n).cycle())
            .min()
    }

    pub fn largest_cycle(&self) -> Option<i32> {
        self.data()
            .nodes
            .iter()
            .filter_map(|n| self.node(*n).cycle())
            .max()
    }

    /// Single register RAW predecessor of `node`, if exactly one exists.
    pub fn only_register_raw_source(&self, node: NodeId) -> Option<NodeId> {
        let mut sources = self.in_edges(node).into_iter().filter_map(|e| {
            let entry = self.entry(e)?;
            (entry.edge.is_register_raw() && !entry.edge.guard_use && !entry.edge.back_edge)
                .then_some(entry.tail)
        });
        let first = sources.next()?;
        match sources.next() {
            Some(_) => None,
            None => Some(first),
        }
    }

    /// Register RAW successors of `node` reading its destination as data.
    pub fn register_raw_successors(&self, node: NodeId) -> Vec<NodeId> {
        self.out_edges(node)
            .into_iter()
            .filter_map(|e| {
                let entry = self.entry(e)?;
                (entry.edge.is_register_raw() && !entry.edge.guard_use).then_some(entry.head)
            })
            .collect()
    }

    /// Register WAR successors: later writers of registers `node` reads.
    pub fn register_war_successors(&self, node: NodeId) -> Vec<NodeId> {
        self.out_edges(node)
            .into_iter()
            .filter_map(|e| {
                let entry = self.entry(e)?;
                entry.edge.is_register_war().then_some(entry.head)
            })
            .collect()
    }

    /// Scheduled node reading `reg` (as data or guard) at the highest cycle.
    pub fn last_scheduled_register_read(&self, reg: crate::machine::RegisterRef) -> Option<NodeId> {
        self.data()
            .nodes
            .iter()
            .copied()
            .filter(|n| {
                let mn = self.node(*n);
                mn.is_scheduled()
                    && (mn.mv.source.register() == Some(reg) || mn.mv.guard.register() == Some(reg))
            })
            .max_by_key(|n| (self.node(*n).cycle(), n.0))
    }

    /// Scheduled node writing `reg` at the highest cycle.
    pub fn last_scheduled_register_write(&self, reg: crate::machine::RegisterRef) -> Option<NodeId> {
        self.data()
            .nodes
            .iter()
            .copied()
            .filter(|n| {
                let mn = self.node(*n);
                mn.is_scheduled() && mn.mv.destination.register() == Some(reg)
            })
            .max_by_key(|n| (self.node(*n).cycle(), n.0))
    }

    /// True if the guards of the two nodes can never both be true.
    pub fn exclusive_guards(&self, a: NodeId, b: NodeId) -> bool {
        self.node(a).mv.guard.excludes(&self.node(b).mv.guard)
    }
}

fn skip_edge(edge: &DataDependenceEdge, query: &CycleQuery) -> bool {
    (query.ignore_guards && edge.guard_use)
        || (query.ignore_fu_deps
            && matches!(edge.reason, EdgeReason::FuState | EdgeReason::Memory))
        || (query.ignore_same_operation_edges && edge.reason == EdgeReason::Operation)
        || (query.ignore_register_war && edge.is_register_war() && !edge.head_pseudo)
        || (query.ignore_register_waw && edge.is_register_waw() && !edge.head_pseudo)
}
