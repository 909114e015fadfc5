//! Checks a finished schedule against the dependence edges.

use super::{DataDependenceGraph, GraphId};
use crate::core::{ScheduleResult, SchedulerError};

impl DataDependenceGraph {
    /// Every edge between two scheduled nodes whose constraint is broken.
    ///
    /// Loop-carried edges are checked with `head + depth * ii`; at `ii == 0` they are skipped.
    pub fn schedule_violations(&self, graph: GraphId, ii: i32) -> ScheduleResult<Vec<String>> {
        let view = self.view(graph);
        let mut violations = Vec::new();
        for (id, entry) in self.edge_entries() {
            if !view.edge_visible(id) || entry.tail == entry.head {
                continue;
            }
            if entry.edge.loop_depth > 0 && ii == 0 {
                continue;
            }
            let (Some(tail), Some(head)) = (self.node(entry.tail).cycle(), self.node(entry.head).cycle()) else {
                continue;
            };
            let required = tail + self.edge_latency(entry)?;
            let effective = head + ii * entry.edge.loop_depth as i32;
            if effective < required {
                violations.push(format!(
                    "{} -> {} ({}): head at {}, needs {}",
                    entry.tail,
                    entry.head,
                    entry.edge.display(None),
                    effective,
                    required
                ));
            }
        }
        Ok(violations)
    }

    pub fn verify_schedule(&self, graph: GraphId, ii: i32) -> ScheduleResult<()> {
        let violations = self.schedule_violations(graph, ii)?;
        if violations.is_empty() {
            return Ok(());
        }
        Err(SchedulerError::InternalInvariant {
            reason: format!("schedule breaks dependences: {}", violations.join("; ")),
            dot: Some(self.dot_string(graph, None)),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::ddg::{DataDependenceEdge, DataDependenceGraph, DependenceType, GraphId};
    use crate::machine::{presets, RegisterRef, RfId};
    use crate::program::{Move, Terminal};

    #[test]
    fn test_loop_edge_checked_with_ii() {
        let m = presets::minimal().unwrap();
        let r = RegisterRef::new(RfId(0), 1);
        let mut ddg = DataDependenceGraph::new("loop");
        ddg.set_machine(&m);
        let a = ddg.add_node(GraphId::ROOT, Move::new(Terminal::Immediate(1), Terminal::Register(r)), 0);
        let b = ddg.add_node(GraphId::ROOT, Move::new(Terminal::Register(r), Terminal::Register(r)), 0);
        ddg.connect_nodes(b, a, DataDependenceEdge::register(DependenceType::Raw, r).loop_carried(1));
        ddg.node_mut(a).set_cycle(Some(0));
        ddg.node_mut(b).set_cycle(Some(3));
        assert!(ddg.verify_schedule(GraphId::ROOT, 0).is_ok());
        assert!(ddg.verify_schedule(GraphId::ROOT, 4).is_ok());
        assert_eq!(ddg.schedule_violations(GraphId::ROOT, 3).unwrap().len(), 1);
    }
}
