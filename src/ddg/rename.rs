//! Edge maintenance after register renaming.
//!
//! The caller renames a terminal of a move first and then calls the matching
//! `*_renamed` method, which drops the register edges that no longer apply and
//! retags the ones that still do. The returned `UndoData` reverses exactly
//! that, once the terminal has been renamed back.

use super::{DataDependenceEdge, DataDependenceGraph, DataTag, EdgeEntry, EdgeId};
use crate::core::{ScheduleResult, SchedulerError};
use crate::machine::RegisterRef;
use crate::program::NodeId;

/// Graph changes made by one renaming.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UndoData {
    pub removed: Vec<(EdgeId, EdgeEntry)>,
    /// Edges retagged, with their previous tag.
    pub changed: Vec<(EdgeId, DataTag)>,
    pub added: Vec<EdgeId>,
}

impl UndoData {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.changed.is_empty() && self.added.is_empty()
    }
}

impl DataDependenceGraph {
    /// The source register of `node` was renamed.
    pub fn source_renamed(&mut self, node: NodeId) -> ScheduleResult<UndoData> {
        let reg = self.node(node).mv.source.register().ok_or_else(|| {
            SchedulerError::precondition(format!("source of {} is not a register", node))
        })?;
        Ok(self.reader_renamed(node, reg, false))
    }

    /// The guard register of `node` was renamed.
    pub fn guard_renamed(&mut self, node: NodeId) -> ScheduleResult<UndoData> {
        let reg = self.node(node).mv.guard.register().ok_or_else(|| {
            SchedulerError::precondition(format!("{} has no register guard", node))
        })?;
        Ok(self.reader_renamed(node, reg, true))
    }

    fn reader_renamed(&mut self, node: NodeId, reg: RegisterRef, guard_use: bool) -> UndoData {
        let mut undo = UndoData::default();
        for e in self.out_edges_raw(node) {
            let Some(entry) = self.edge(e).copied() else { continue };
            let edge = entry.edge;
            if !edge.is_register_war() || edge.tail_pseudo || edge.guard_use != guard_use {
                continue;
            }
            let written = self.node(entry.head).mv.destination.register();
            if edge.head_pseudo || written.is_some_and(|w| w != reg) {
                if let Some(removed) = self.remove_edge(e) {
                    undo.removed.push((e, removed));
                }
            } else {
                self.retag(e, reg, &mut undo);
            }
        }
        undo
    }

    /// The destination register of `node` was renamed to one not used in this graph.
    ///
    /// All register RAW successors of `node` must already read the new register.
    pub fn dest_renamed(&mut self, node: NodeId) -> ScheduleResult<UndoData> {
        let reg = self.node(node).mv.destination.register().ok_or_else(|| {
            SchedulerError::precondition(format!("destination of {} is not a register", node))
        })?;
        let mut undo = UndoData::default();
        self.copy_anti_deps_over(node, &mut undo);

        for e in self.in_edges_raw(node) {
            let Some(entry) = self.edge(e).copied() else { continue };
            let edge = entry.edge;
            if edge.head_pseudo || edge.reason != super::EdgeReason::Register {
                continue;
            }
            let tail = self.node(entry.tail);
            let still_applies = match edge.kind {
                super::DependenceType::Waw => {
                    !edge.tail_pseudo && tail.mv.destination.register().map_or(true, |w| w == reg)
                }
                super::DependenceType::War => {
                    if edge.tail_pseudo {
                        false
                    } else if edge.guard_use {
                        tail.mv.guard.register() == Some(reg)
                    } else {
                        tail.mv.source.register().map_or(true, |r| r == reg)
                    }
                }
                _ => continue,
            };
            if still_applies {
                self.retag(e, reg, &mut undo);
            } else if let Some(removed) = self.remove_edge(e) {
                undo.removed.push((e, removed));
            }
        }

        for e in self.out_edges_raw(node) {
            let Some(entry) = self.edge(e).copied() else { continue };
            let edge = entry.edge;
            if edge.reason != super::EdgeReason::Register || edge.tail_pseudo {
                continue;
            }
            match edge.kind {
                super::DependenceType::Raw => self.retag(e, reg, &mut undo),
                super::DependenceType::Waw => {
                    let written = self.node(entry.head).mv.destination.register();
                    if edge.head_pseudo || written.is_some_and(|w| w != reg) {
                        if let Some(removed) = self.remove_edge(e) {
                            undo.removed.push((e, removed));
                        }
                    } else {
                        self.retag(e, reg, &mut undo);
                    }
                }
                _ => {}
            }
        }
        log::trace!(
            "Renamed destination of {}: -{} ~{} +{} edges",
            node,
            undo.removed.len(),
            undo.changed.len(),
            undo.added.len()
        );
        Ok(undo)
    }

    /// Reverse a renaming.
    pub fn undo(&mut self, undo: UndoData) {
        for (e, data) in undo.changed.into_iter().rev() {
            if let Some(entry) = self.edge_mut(e) {
                entry.edge.data = data;
            }
        }
        for (e, entry) in undo.removed.into_iter().rev() {
            self.restore_edge(e, entry);
        }
        for e in undo.added.into_iter().rev() {
            self.remove_edge(e);
        }
    }

    fn retag(&mut self, e: EdgeId, reg: RegisterRef, undo: &mut UndoData) {
        if let Some(entry) = self.edge_mut(e) {
            let old = entry.edge.data;
            if old != DataTag::Register(reg) {
                entry.edge.data = DataTag::Register(reg);
                undo.changed.push((e, old));
            }
        }
    }

    /// Order the old register's earlier accesses before its later writers directly,
    /// since `node` no longer sits between them.
    fn copy_anti_deps_over(&mut self, node: NodeId, undo: &mut UndoData) {
        let incoming: Vec<EdgeEntry> = self
            .in_edges_raw(node)
            .into_iter()
            .filter_map(|e| self.edge(e).copied())
            .filter(|entry| entry.edge.is_register_anti() && !entry.edge.head_pseudo && !entry.edge.tail_pseudo)
            .collect();
        let later_writers: Vec<EdgeEntry> = self
            .out_edges_raw(node)
            .into_iter()
            .filter_map(|e| self.edge(e).copied())
            .filter(|entry| entry.edge.is_register_waw() && !entry.edge.head_pseudo && !entry.edge.tail_pseudo)
            .collect();
        for before in &incoming {
            for after in &later_writers {
                if before.tail == after.head {
                    continue;
                }
                let mut edge: DataDependenceEdge = before.edge;
                edge.loop_depth = before.edge.loop_depth + after.edge.loop_depth;
                edge.back_edge = edge.loop_depth > 0;
                if let Some(added) = self.connect_or_merge(before.tail, after.head, edge) {
                    undo.added.push(added);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ddg::DdgBuilder;
    use crate::machine::{presets, RegisterRef, RfId};
    use crate::program::{BasicBlock, Move, NodeId, Terminal};

    fn reg(i: u16) -> Terminal {
        Terminal::Register(RegisterRef::new(RfId(0), i))
    }

    fn block() -> BasicBlock {
        let mut block = BasicBlock::new("entry");
        block.instructions = vec![
            vec![Move::new(reg(1), reg(9))],
            vec![Move::new(Terminal::Immediate(3), reg(1))],
            vec![Move::new(reg(1), reg(2))],
            vec![Move::new(Terminal::Immediate(4), reg(1))],
        ];
        block
    }

    #[test]
    fn test_dest_renamed_and_undo() {
        let m = presets::minimal().unwrap();
        let mut ddg = DdgBuilder::new(&m).build_block(&block()).unwrap();
        let before = ddg.edge_set();
        assert!(ddg.root().has_edge(NodeId(0), NodeId(1)));

        ddg.node_mut(NodeId(1)).mv.destination = reg(5);
        ddg.node_mut(NodeId(2)).mv.source = reg(5);
        let undo = ddg.dest_renamed(NodeId(1)).unwrap();
        // n0 read r1 and n1 no longer writes it; n3 must still follow n0.
        assert!(!ddg.root().has_edge(NodeId(0), NodeId(1)));
        assert!(ddg.root().has_edge(NodeId(0), NodeId(3)));
        assert!(!ddg.root().has_edge(NodeId(1), NodeId(3)));

        ddg.node_mut(NodeId(1)).mv.destination = reg(1);
        ddg.node_mut(NodeId(2)).mv.source = reg(1);
        ddg.undo(undo);
        assert_eq!(ddg.edge_set(), before);
    }

    #[test]
    fn test_source_renamed_drops_war() {
        let m = presets::minimal().unwrap();
        let mut ddg = DdgBuilder::new(&m).build_block(&block()).unwrap();
        let before = ddg.edge_set();
        ddg.node_mut(NodeId(2)).mv.source = reg(6);
        let undo = ddg.source_renamed(NodeId(2)).unwrap();
        assert!(!ddg.root().has_edge(NodeId(2), NodeId(3)));
        assert!(!undo.is_empty());
        ddg.node_mut(NodeId(2)).mv.source = reg(1);
        ddg.undo(undo);
        assert_eq!(ddg.edge_set(), before);
    }

    #[test]
    fn test_guard_renamed_requires_guard() {
        let m = presets::minimal().unwrap();
        let mut ddg = DdgBuilder::new(&m).build_block(&block()).unwrap();
        assert!(ddg.guard_renamed(NodeId(0)).is_err());
    }
}
