//! Graphviz output for debugging.

use super::{DataDependenceGraph, GraphId};
use crate::machine::Machine;
use std::fmt::Write;

impl DataDependenceGraph {
    /// Render `graph` in dot format. Move labels need the machine.
    pub fn dot_string(&self, graph: GraphId, machine: Option<&Machine>) -> String {
        let view = self.view(graph);
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", view.name());
        for n in view.nodes() {
            let node = self.node(n);
            let label = match machine {
                Some(m) => node.mv.display(m).to_string(),
                None => format!("{:?} -> {:?}", node.mv.source, node.mv.destination),
            };
            let cycle = node.cycle().map(|c| format!(" @{}", c)).unwrap_or_default();
            let _ = writeln!(
                out,
                "  {} [label=\"{}: {}{}\"];",
                n,
                n,
                label.replace('"', "\\\""),
                cycle
            );
        }
        for (id, entry) in self.edge_entries() {
            if !view.edge_visible(id) {
                continue;
            }
            let style = if entry.edge.back_edge {
                ", style=dashed"
            } else if entry.edge.head_pseudo {
                ", style=dotted"
            } else {
                ""
            };
            let _ = writeln!(
                out,
                "  {} -> {} [label=\"{}\"{}];",
                entry.tail,
                entry.head,
                entry.edge.display(machine),
                style
            );
        }
        out.push_str("}\n");
        out
    }
}
