// This module holds the program representation the scheduler consumes and produces.
// Terminal is the sum type of move endpoints (function unit operand ports, registers,
// inline immediates, immediate unit registers, instruction and data addresses, and the
// return address port). A Move transports one terminal to another under an optional
// guard and records the bus it was assigned. Unscheduled input is a Procedure made of
// BasicBlocks, each a sequence of instructions holding moves in program order; the
// scheduled output of a block is a list of ScheduledInstructions (bus-assigned moves
// plus long immediates written that cycle). MoveNode and ProgramOperation (in their own
// files) wrap moves for the dependence graph.

//! Program representation: terminals, moves, instructions, blocks.

pub mod move_node;
pub mod operation;

pub use move_node::{MoveNode, NodeId};
pub use operation::{PoId, ProgramOperation};

use crate::machine::{BusId, FuId, Guard, IuId, Machine, OpId, RegisterRef};
use std::fmt;

/// An operand or result port of an operation.
///
/// `unit` is empty until the resource manager binds the operation to a function unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuTerminal {
    pub operation: OpId,
    /// 1-based operand index; inputs first, then outputs.
    pub operand: u8,
    pub unit: Option<FuId>,
}

/// Move endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminal {
    FuPort(FuTerminal),
    Register(RegisterRef),
    Immediate(i64),
    /// Register of an immediate unit holding a long immediate.
    ImmediateRegister { iu: IuId, index: u16 },
    /// Start of a basic block, by block index.
    InstructionAddress(u32),
    /// Data address.
    Address(i64),
    ReturnAddress,
}

impl Terminal {
    pub fn fu_port(operation: OpId, operand: u8) -> Self {
        Terminal::FuPort(FuTerminal {
            operation,
            operand,
            unit: None,
        })
    }

    pub fn register(&self) -> Option<RegisterRef> {
        match self {
            Terminal::Register(r) => Some(*r),
            _ => None,
        }
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Terminal::Register(_))
    }

    pub fn fu_terminal(&self) -> Option<&FuTerminal> {
        match self {
            Terminal::FuPort(t) => Some(t),
            _ => None,
        }
    }

    pub fn fu_terminal_mut(&mut self) -> Option<&mut FuTerminal> {
        match self {
            Terminal::FuPort(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_fu_port(&self) -> bool {
        matches!(self, Terminal::FuPort(_))
    }

    /// Inline constant value, for immediates and addresses.
    pub fn immediate_value(&self) -> Option<i64> {
        match self {
            Terminal::Immediate(v) | Terminal::Address(v) => Some(*v),
            Terminal::InstructionAddress(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate_value().is_some()
    }

    pub fn is_return_address(&self) -> bool {
        matches!(self, Terminal::ReturnAddress)
    }
}

/// A single transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Move {
    pub source: Terminal,
    pub destination: Terminal,
    pub guard: Guard,
    pub bus: Option<BusId>,
}

impl Move {
    pub fn new(source: Terminal, destination: Terminal) -> Self {
        Self {
            source,
            destination,
            guard: Guard::Unconditional,
            bus: None,
        }
    }

    pub fn guarded(source: Terminal, destination: Terminal, guard: Guard) -> Self {
        Self {
            source,
            destination,
            guard,
            bus: None,
        }
    }

    pub fn is_unconditional(&self) -> bool {
        self.guard.is_unconditional()
    }

    /// Render the move the way the listing parser reads it.
    pub fn display<'a>(&'a self, machine: &'a Machine) -> MoveDisplay<'a> {
        MoveDisplay { mv: self, machine }
    }
}

pub struct MoveDisplay<'a> {
    mv: &'a Move,
    machine: &'a Machine,
}

pub(crate) fn terminal_name(machine: &Machine, t: &Terminal) -> String {
    match t {
        Terminal::FuPort(ft) => {
            let op = &machine.operation(ft.operation).name;
            match ft.unit {
                Some(fu) => format!("{}.{}.{}", machine.function_unit(fu).name, op, ft.operand),
                None => format!("{}.{}", op, ft.operand),
            }
        }
        Terminal::Register(r) => machine.register_name(*r),
        Terminal::Immediate(v) => format!("#{}", v),
        Terminal::ImmediateRegister { iu, index } => {
            format!("{}.{}", machine.immediate_unit(*iu).name, index)
        }
        Terminal::InstructionAddress(b) => format!("@{}", b),
        Terminal::Address(a) => format!("&{}", a),
        Terminal::ReturnAddress => "ra".to_string(),
    }
}

impl fmt::Display for MoveDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.mv.guard.is_unconditional() {
            write!(f, "{} ", self.machine.guard_name(&self.mv.guard))?;
        }
        write!(
            f,
            "{} -> {}",
            terminal_name(self.machine, &self.mv.source),
            terminal_name(self.machine, &self.mv.destination)
        )
    }
}

/// A basic block of unscheduled code, moves in program order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicBlock {
    pub label: String,
    /// Each inner vector is one instruction.
    pub instructions: Vec<Vec<Move>>,
    /// Single-block loop whose last operation jumps back to its start.
    pub is_loop: bool,
}

impl BasicBlock {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }

    pub fn moves(&self) -> impl Iterator<Item = &Move> {
        self.instructions.iter().flatten()
    }

    pub fn move_count(&self) -> usize {
        self.instructions.iter().map(Vec::len).sum()
    }
}

/// A procedure: basic blocks in layout order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Procedure {
    pub name: String,
    pub blocks: Vec<BasicBlock>,
}

/// Long immediate encoded in an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LongImmediate {
    pub iu: IuId,
    pub index: u16,
    pub value: i64,
}

/// One cycle of a finished schedule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduledInstruction {
    pub cycle: i32,
    pub moves: Vec<Move>,
    pub immediates: Vec<LongImmediate>,
}

impl ScheduledInstruction {
    pub fn is_nop(&self) -> bool {
        self.moves.is_empty() && self.immediates.is_empty()
    }

    pub fn display<'a>(&'a self, machine: &'a Machine) -> InstructionDisplay<'a> {
        InstructionDisplay { ins: self, machine }
    }
}

pub struct InstructionDisplay<'a> {
    ins: &'a ScheduledInstruction,
    machine: &'a Machine,
}

impl fmt::Display for InstructionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:4}:", self.ins.cycle)?;
        if self.ins.is_nop() {
            return write!(f, " nop");
        }
        let mut first = true;
        for mv in &self.ins.moves {
            let bus = mv
                .bus
                .map(|b| self.machine.bus(b).name.clone())
                .unwrap_or_else(|| "?".to_string());
            write!(f, "{} [{}] {}", if first { "" } else { "," }, bus, mv.display(self.machine))?;
            first = false;
        }
        for imm in &self.ins.immediates {
            write!(
                f,
                "{} [{}.{} = #{}]",
                if first { "" } else { "," },
                self.machine.immediate_unit(imm.iu).name,
                imm.index,
                imm.value
            )?;
            first = false;
        }
        Ok(())
    }
}
