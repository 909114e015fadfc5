//! Dependence edges.

use crate::machine::{Machine, OpId, RegisterRef};
use crate::program::NodeId;
use std::fmt;

/// Index of an edge in the dependence graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependenceType {
    Raw,
    War,
    Waw,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeReason {
    Register,
    Memory,
    Operation,
    Ra,
    FuState,
}

/// What the dependence is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataTag {
    None,
    Register(RegisterRef),
    Operation(OpId),
    Memory,
    ReturnAddress,
}

impl DataTag {
    pub fn register(&self) -> Option<RegisterRef> {
        match self {
            DataTag::Register(r) => Some(*r),
            _ => None,
        }
    }
}

/// A dependence between two moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataDependenceEdge {
    pub kind: DependenceType,
    pub reason: EdgeReason,
    pub data: DataTag,
    /// The dependence is on the guard the head (RAW) or tail (WAR) evaluates.
    pub guard_use: bool,
    /// Head is a control flow move; tail must fit before the end of its delay slots.
    pub head_pseudo: bool,
    pub tail_pseudo: bool,
    /// Loop-carried edge broken for acyclic scheduling.
    pub back_edge: bool,
    /// Iterations crossed by the edge.
    pub loop_depth: u8,
}

impl DataDependenceEdge {
    pub fn new(reason: EdgeReason, kind: DependenceType, data: DataTag) -> Self {
        Self {
            kind,
            reason,
            data,
            guard_use: false,
            head_pseudo: false,
            tail_pseudo: false,
            back_edge: false,
            loop_depth: 0,
        }
    }

    pub fn register(kind: DependenceType, reg: RegisterRef) -> Self {
        Self::new(EdgeReason::Register, kind, DataTag::Register(reg))
    }

    pub fn operation(op: OpId) -> Self {
        Self::new(EdgeReason::Operation, DependenceType::Raw, DataTag::Operation(op))
    }

    pub fn with_guard_use(mut self) -> Self {
        self.guard_use = true;
        self
    }

    pub fn with_head_pseudo(mut self) -> Self {
        self.head_pseudo = true;
        self
    }

    /// Mark as loop-carried over `depth` iterations.
    pub fn loop_carried(mut self, depth: u8) -> Self {
        self.loop_depth = depth;
        self.back_edge = depth > 0;
        self
    }

    pub fn is_register_war(&self) -> bool {
        self.reason == EdgeReason::Register && self.kind == DependenceType::War
    }

    pub fn is_register_waw(&self) -> bool {
        self.reason == EdgeReason::Register && self.kind == DependenceType::Waw
    }

    pub fn is_register_raw(&self) -> bool {
        self.reason == EdgeReason::Register && self.kind == DependenceType::Raw
    }

    pub fn is_register_anti(&self) -> bool {
        self.is_register_war() || self.is_register_waw()
    }

    pub fn display<'a>(&'a self, machine: Option<&'a Machine>) -> EdgeDisplay<'a> {
        EdgeDisplay { edge: self, machine }
    }
}

/// An edge with its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEntry {
    pub tail: NodeId,
    pub head: NodeId,
    pub edge: DataDependenceEdge,
}

pub struct EdgeDisplay<'a> {
    edge: &'a DataDependenceEdge,
    machine: Option<&'a Machine>,
}

impl fmt::Display for EdgeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.edge;
        let reason = match e.reason {
            EdgeReason::Register => "R",
            EdgeReason::Memory => "M",
            EdgeReason::Operation => "O",
            EdgeReason::Ra => "RA",
            EdgeReason::FuState => "F",
        };
        let kind = match e.kind {
            DependenceType::Raw => "_raw",
            DependenceType::War => "_war",
            DependenceType::Waw => "_waw",
            DependenceType::Unknown => "",
        };
        write!(f, "{}{}", reason, kind)?;
        if e.guard_use {
            write!(f, "G")?;
        }
        match (e.data, self.machine) {
            (DataTag::Register(r), Some(m)) => write!(f, ":{}", m.register_name(r))?,
            (DataTag::Register(r), None) => write!(f, ":{}.{}", r.rf.0, r.index)?,
            (DataTag::Operation(op), Some(m)) => write!(f, ":{}", m.operation(op).name)?,
            (DataTag::Operation(op), None) => write!(f, ":op{}", op.0)?,
            _ => {}
        }
        if e.head_pseudo {
            write!(f, "_hp")?;
        }
        if e.loop_depth > 0 {
            write!(f, "_L{}", e.loop_depth)?;
        }
        Ok(())
    }
}
