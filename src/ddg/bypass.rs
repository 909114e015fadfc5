//! Software bypassing: let a consumer read a value straight from its producer.
//!
//! `merge_and_keep(def, use)` makes `use` read the source of `def` and rewires
//! the edges of `use` accordingly. Every merge is recorded; `un_merge`
//! restores the exact edge set, including edge ids.

use super::{DataDependenceGraph, EdgeEntry, EdgeId, GraphId};
use crate::core::{ScheduleResult, SchedulerError};
use crate::machine::FuId;
use crate::program::{NodeId, PoId, Terminal};

/// What a merge changed.
#[derive(Debug, Clone)]
pub(crate) struct MergeRecord {
    def: NodeId,
    use_node: NodeId,
    old_source: Terminal,
    old_source_operation: Option<PoId>,
    old_allowed_source_units: Option<Vec<FuId>>,
    /// Operation `use` was added to as a result reader.
    joined_operation: Option<PoId>,
    added_edges: Vec<EdgeId>,
    removed_edges: Vec<(EdgeId, EdgeEntry)>,
}

impl DataDependenceGraph {
    /// False if bypassing would let a write of the bypassed register overtake `use`.
    pub fn merge_and_keep_allowed(&self, def: NodeId, use_node: NodeId) -> bool {
        let root = self.root();
        root.out_edges(def).into_iter().all(|e| {
            let Some(entry) = self.edge(e) else { return true };
            let edge = &entry.edge;
            if !edge.is_register_war() || edge.tail_pseudo {
                return true;
            }
            let target = entry.head;
            target == use_node
                || root.exclusive_guards(target, use_node)
                || !root.has_path(target, use_node)
        })
    }

    /// Make `use_node` read what `def` reads, dropping the register between them.
    pub fn merge_and_keep(&mut self, def: NodeId, use_node: NodeId) -> ScheduleResult<()> {
        if self.root().connecting_edges(def, use_node).is_empty() {
            return Err(SchedulerError::InternalInvariant {
                reason: format!("cannot merge {} and {}: no edge connects them", def, use_node),
                dot: Some(self.dot_string(GraphId::ROOT, None)),
            });
        }
        let raw_edges: Vec<EdgeId> = self
            .root()
            .connecting_edges(def, use_node)
            .into_iter()
            .filter(|e| {
                self.edge(*e)
                    .is_some_and(|entry| entry.edge.is_register_raw() && !entry.edge.guard_use)
            })
            .collect();
        let Some(reg) = raw_edges
            .first()
            .and_then(|e| self.edge(*e))
            .and_then(|entry| entry.edge.data.register())
        else {
            return Err(SchedulerError::InternalInvariant {
                reason: format!("cannot merge {} and {}: no register RAW edge", def, use_node),
                dot: Some(self.dot_string(GraphId::ROOT, None)),
            });
        };

        let def_node = self.node(def).clone();
        let old = self.node(use_node).clone();
        let mut record = MergeRecord {
            def,
            use_node,
            old_source: old.mv.source,
            old_source_operation: old.source_operation,
            old_allowed_source_units: old.allowed_source_units.clone(),
            joined_operation: None,
            added_edges: Vec::new(),
            removed_edges: Vec::new(),
        };

        {
            let node = self.node_mut(use_node);
            node.mv.source = def_node.mv.source;
            node.source_operation = def_node.source_operation;
            node.allowed_source_units = def_node.allowed_source_units.clone();
        }
        if let Some(po) = def_node.source_operation {
            if !self.operation(po).outputs.contains(&use_node) {
                self.operation_mut(po).add_output(use_node);
                record.joined_operation = Some(po);
            }
        }

        for e in raw_edges {
            if let Some(entry) = self.remove_edge(e) {
                record.removed_edges.push((e, entry));
            }
        }

        for e in self.in_edges_raw(def) {
            let Some(entry) = self.edge(e).copied() else { continue };
            let edge = entry.edge;
            if (edge.is_register_anti() && edge.data.register() == Some(reg)) || edge.guard_use {
                continue;
            }
            if entry.tail == use_node {
                continue;
            }
            if let Some(added) = self.connect_or_merge(entry.tail, use_node, edge) {
                record.added_edges.push(added);
            }
        }

        if def_node.is_source_variable() {
            for e in self.out_edges_raw(def) {
                let Some(entry) = self.edge(e).copied() else { continue };
                if !entry.edge.is_register_war() || entry.edge.guard_use || entry.head == use_node {
                    continue;
                }
                if self.node(entry.head).mv.guard.excludes(&old.mv.guard) {
                    continue;
                }
                if let Some(added) = self.connect_or_merge(use_node, entry.head, entry.edge) {
                    record.added_edges.push(added);
                }
            }
        }

        if def_node.mv.source.register() != Some(reg) {
            for e in self.out_edges_raw(use_node) {
                let Some(entry) = self.edge(e).copied() else { continue };
                let edge = entry.edge;
                if edge.is_register_war() && !edge.guard_use && edge.data.register() == Some(reg) {
                    if let Some(removed) = self.remove_edge(e) {
                        record.removed_edges.push((e, removed));
                    }
                }
            }
        }

        log::debug!(
            "Merged {} into {} (+{} -{} edges)",
            def,
            use_node,
            record.added_edges.len(),
            record.removed_edges.len()
        );
        self.merges.push(record);
        Ok(())
    }

    /// Undo the latest merge of `def` into `use_node`.
    pub fn un_merge(&mut self, def: NodeId, use_node: NodeId) -> ScheduleResult<()> {
        if self.node(use_node).is_scheduled() {
            return Err(SchedulerError::precondition(format!(
                "cannot unmerge {}: it is scheduled",
                use_node
            )));
        }
        let Some(pos) = self
            .merges
            .iter()
            .rposition(|r| r.def == def && r.use_node == use_node)
        else {
            return Err(SchedulerError::precondition(format!(
                "{} was not merged into {}",
                def, use_node
            )));
        };
        let record = self.merges.remove(pos);

        for e in record.added_edges.iter().rev() {
            self.remove_edge(*e);
        }
        for (id, entry) in record.removed_edges.into_iter().rev() {
            self.restore_edge(id, entry);
        }
        if let Some(po) = record.joined_operation {
            self.operation_mut(po).remove_output(use_node);
        }
        let node = self.node_mut(use_node);
        node.mv.source = record.old_source;
        node.source_operation = record.old_source_operation;
        node.allowed_source_units = record.old_allowed_source_units;
        log::debug!("Unmerged {} from {}", def, use_node);
        Ok(())
    }

    /// True if `use_node` currently reads through a merge with `def`.
    pub fn is_merged(&self, def: NodeId, use_node: NodeId) -> bool {
        self.merges.iter().any(|r| r.def == def && r.use_node == use_node)
    }

    pub(crate) fn in_edges_raw(&self, node: NodeId) -> Vec<EdgeId> {
        self.in_edges[node.0].clone()
    }

    pub(crate) fn out_edges_raw(&self, node: NodeId) -> Vec<EdgeId> {
        self.out_edges[node.0].clone()
    }
}

#[cfg(test)]
mod tests {
    use crate::ddg::DdgBuilder;
    use crate::machine::{presets, Guard, RegisterRef, RfId};
    use crate::program::{BasicBlock, Move, NodeId, Terminal};

    fn reg(i: u16) -> Terminal {
        Terminal::Register(RegisterRef::new(RfId(0), i))
    }

    #[test]
    fn test_merge_and_unmerge_restore_edges() {
        let m = presets::minimal().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(4), Terminal::fu_port(add, 1))],
            vec![Move::new(Terminal::Immediate(1), Terminal::fu_port(add, 2))],
            vec![Move::new(Terminal::fu_port(add, 3), reg(1))],
            vec![Move::new(reg(1), reg(2))],
            vec![Move::new(Terminal::Immediate(0), reg(1))],
        ];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let before = ddg.edge_set();
        let (def, use_node) = (NodeId(2), NodeId(3));
        assert!(ddg.merge_and_keep_allowed(def, use_node));
        ddg.merge_and_keep(def, use_node).unwrap();
        assert!(ddg.node(use_node).mv.source.is_fu_port());
        assert_eq!(ddg.node(use_node).source_operation, ddg.node(def).source_operation);
        assert!(!ddg.root().has_edge(def, use_node));
        assert!(ddg.root().has_edge(NodeId(0), use_node));
        ddg.un_merge(def, use_node).unwrap();
        assert_eq!(ddg.edge_set(), before);
        assert_eq!(ddg.node(use_node).mv.source, reg(1));
        assert!(ddg.node(use_node).source_operation.is_none());
    }

    #[test]
    fn test_merge_without_edge_is_invariant_error() {
        let m = presets::minimal().unwrap();
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(Terminal::Immediate(1), reg(1))],
            vec![Move::new(reg(5), reg(2))],
        ];
        let mut ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        let err = ddg.merge_and_keep(NodeId(0), NodeId(1)).unwrap_err();
        assert!(matches!(err, crate::core::SchedulerError::InternalInvariant { dot: Some(_), .. }));
    }

    #[test]
    fn test_merge_refused_when_overwrite_precedes_use() {
        let m = presets::minimal().unwrap();
        let bool_rf = m.rf_by_name("BOOL").unwrap();
        let flag = RegisterRef::new(bool_rf, 0);
        let guard = Guard::Register {
            reg: flag,
            inverted: false,
        };
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(3), reg(5))],
            vec![Move::new(Terminal::Immediate(9), reg(3))],
            vec![Move::new(reg(3), Terminal::Register(flag))],
            vec![Move::guarded(reg(5), reg(6), guard)],
        ];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        // n3 depends on the overwrite of r3 through its guard.
        assert!(ddg.root().has_path(NodeId(1), NodeId(3)));
        assert!(!ddg.merge_and_keep_allowed(NodeId(0), NodeId(3)));

        block.instructions[3] = vec![Move::new(reg(5), reg(6))];
        let ddg = DdgBuilder::new(&m).build_block(&block).unwrap();
        assert!(ddg.merge_and_keep_allowed(NodeId(0), NodeId(3)));
    }
}
