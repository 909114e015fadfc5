//! Edge weights and path lengths for list scheduling priorities.
//!
//! These are heuristics. Correctness only depends on the cycle queries.

use super::{DataDependenceGraph, DataTag, DependenceType, EdgeEntry, EdgeReason, GraphId};
use crate::core::ScheduleResult;
use crate::program::NodeId;
use hashbrown::HashMap;

impl DataDependenceGraph {
    /// Heuristic latency of an edge.
    pub fn edge_weight(&self, entry: &EdgeEntry) -> ScheduleResult<i32> {
        let latency = self.latency_model()?;
        let edge = &entry.edge;
        if edge.head_pseudo {
            return Ok(0);
        }
        let head = self.node(entry.head);
        let head_is_control_flow = head
            .mv
            .destination
            .fu_terminal()
            .is_some_and(|ft| latency.is_control_flow(ft.operation));
        let weight = match edge.reason {
            EdgeReason::Operation => match edge.data {
                DataTag::Operation(op) => latency.operation_latency(op),
                _ => 1,
            },
            EdgeReason::Memory => match edge.kind {
                // A store may share the cycle of an earlier load.
                DependenceType::Raw => 0,
                _ => 1,
            },
            EdgeReason::Register | EdgeReason::Ra => match edge.kind {
                DependenceType::Raw if edge.guard_use => {
                    let guard = latency.guard_latency(&head.mv.guard);
                    if head_is_control_flow {
                        (guard + latency.delay_slots).max(1)
                    } else {
                        guard.max(1)
                    }
                }
                DependenceType::Raw if head_is_control_flow => latency.delay_slots + 1,
                DependenceType::War => 0,
                _ => 1,
            },
            EdgeReason::FuState => 1,
        };
        Ok(weight)
    }

    /// Longest weighted path from any root to each node, back edges ignored.
    pub fn source_distances(&self, graph: GraphId) -> ScheduleResult<HashMap<NodeId, i32>> {
        let view = self.view(graph);
        let mut distances = HashMap::new();
        for n in self.topological_order(graph) {
            let mut best = 0;
            for e in view.in_edges(n) {
                let Some(entry) = self.edge(e) else { continue };
                if entry.edge.back_edge || entry.tail == n {
                    continue;
                }
                let tail = distances.get(&entry.tail).copied().unwrap_or(0);
                best = best.max(tail + self.edge_weight(entry)?);
            }
            distances.insert(n, best);
        }
        Ok(distances)
    }

    /// Longest weighted path from each node to any sink, back edges ignored.
    pub fn sink_distances(&self, graph: GraphId) -> ScheduleResult<HashMap<NodeId, i32>> {
        let view = self.view(graph);
        let mut distances = HashMap::new();
        for n in self.topological_order(graph).into_iter().rev() {
            let mut best = 0;
            for e in view.out_edges(n) {
                let Some(entry) = self.edge(e) else { continue };
                if entry.edge.back_edge || entry.head == n {
                    continue;
                }
                let head = distances.get(&entry.head).copied().unwrap_or(0);
                best = best.max(head + self.edge_weight(entry)?);
            }
            distances.insert(n, best);
        }
        Ok(distances)
    }

    pub fn max_source_distance(&self, graph: GraphId, node: NodeId) -> ScheduleResult<i32> {
        Ok(self.source_distances(graph)?.get(&node).copied().unwrap_or(0))
    }

    pub fn max_sink_distance(&self, graph: GraphId, node: NodeId) -> ScheduleResult<i32> {
        Ok(self.sink_distances(graph)?.get(&node).copied().unwrap_or(0))
    }

    /// Nodes ordered so every forward edge points later. Ties keep program order.
    pub fn topological_order(&self, graph: GraphId) -> Vec<NodeId> {
        let view = self.view(graph);
        let nodes = view.nodes();
        let mut pending: HashMap<NodeId, usize> = nodes
            .iter()
            .map(|n| {
                let count = view
                    .in_edges(*n)
                    .into_iter()
                    .filter_map(|e| self.edge(e))
                    .filter(|entry| !entry.edge.back_edge && entry.tail != *n)
                    .count();
                (*n, count)
            })
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        let mut ready: Vec<NodeId> = nodes.iter().copied().filter(|n| pending[n] == 0).collect();
        while let Some(pos) = (0..ready.len()).min_by_key(|i| (self.node(ready[*i]).order, ready[*i])) {
            let n = ready.swap_remove(pos);
            order.push(n);
            for e in view.out_edges(n) {
                let Some(entry) = self.edge(e) else { continue };
                if entry.edge.back_edge || entry.head == n {
                    continue;
                }
                if let Some(count) = pending.get_mut(&entry.head) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(entry.head);
                    }
                }
            }
        }
        if order.len() < nodes.len() {
            // Cycle without back edge markings; fall back to program order for the rest.
            log::warn!("Dependence cycle in {}, ordering by program order", view.name());
            for n in nodes {
                if !order.contains(&n) {
                    order.push(n);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use crate::ddg::{DdgBuilder, GraphId};
    use crate::machine::{presets, RegisterRef, RfId};
    use crate::program::{BasicBlock, Move, NodeId, Terminal};

    #[test]
    fn test_sink_distance_follows_latency() {
        let m = presets::minimal().unwrap();
        let mul = m.operation_by_name("mul").unwrap();
        let r = |i| Terminal::Register(RegisterRef::new(RfId(0), i));
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(r(1), Terminal::fu_port(mul, 1))],
            vec![Move::new(r(2), Terminal::fu_port(mul, 2))],
            vec![Move::new(Terminal::fu_port(mul, 3), r(3))],
            vec![Move::new(r(3), r(4))],
        ];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let sinks = ddg.sink_distances(GraphId::ROOT).unwrap();
        assert_eq!(sinks[&NodeId(3)], 0);
        assert_eq!(sinks[&NodeId(2)], 1);
        assert_eq!(sinks[&NodeId(0)], 4);
        assert_eq!(ddg.max_source_distance(GraphId::ROOT, NodeId(3)).unwrap(), 4);
        assert_eq!(ddg.max_sink_distance(GraphId::ROOT, NodeId(0)).unwrap(), 4);
        assert_eq!(ddg.topological_order(GraphId::ROOT), vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)]);
    }
}
