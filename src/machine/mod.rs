// This module models the target TTA processor as seen by the scheduler. A Machine is a
// set of buses (transport width, short immediate field, supported guards and the
// source/destination endpoints their sockets connect), function units (ports, one of
// them triggering, and the hardware operations they implement with per-operand port
// bindings and latencies), register files (size, read/write port counts, guard latency),
// immediate units for long immediates, and the control unit (delay slots, global guard
// latency, return-address port). Operation semantics needed for dependence analysis and
// speculation (memory access, side effects, control flow) are kept in OperationInfo.
// All parts are addressed by small typed ids. Machines are built with MachineBuilder
// (builder.rs) and queried for connectivity in connectivity.rs; presets.rs provides the
// small machines used by tests and the driver.

//! Target machine model.

pub mod builder;
pub mod connectivity;
pub mod presets;

pub use builder::MachineBuilder;

use hashbrown::HashSet;
use std::fmt;

macro_rules! machine_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }
    };
}

machine_id!(
    /// Index of a bus in [`Machine::buses`].
    BusId
);
machine_id!(
    /// Index of a function unit in [`Machine::function_units`].
    FuId
);
machine_id!(
    /// Index of a register file in [`Machine::register_files`].
    RfId
);
machine_id!(
    /// Index of an immediate unit in [`Machine::immediate_units`].
    IuId
);
machine_id!(
    /// Index of an operation in [`Machine::operations`].
    OpId
);

/// A single physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterRef {
    pub rf: RfId,
    pub index: u16,
}

impl RegisterRef {
    pub const fn new(rf: RfId, index: u16) -> Self {
        Self { rf, index }
    }
}

/// Predicate conditioning a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Guard {
    Unconditional,
    Register { reg: RegisterRef, inverted: bool },
    Port { fu: FuId, port: u8, inverted: bool },
}

impl Guard {
    pub fn is_unconditional(&self) -> bool {
        matches!(self, Guard::Unconditional)
    }

    pub fn is_inverted(&self) -> bool {
        match self {
            Guard::Unconditional => false,
            Guard::Register { inverted, .. } | Guard::Port { inverted, .. } => *inverted,
        }
    }

    /// Guard register read by this guard, if any.
    pub fn register(&self) -> Option<RegisterRef> {
        match self {
            Guard::Register { reg, .. } => Some(*reg),
            _ => None,
        }
    }

    /// True if both guards test the same value, regardless of polarity.
    pub fn same_condition(&self, other: &Guard) -> bool {
        match (self, other) {
            (Guard::Register { reg: a, .. }, Guard::Register { reg: b, .. }) => a == b,
            (
                Guard::Port { fu: fa, port: pa, .. },
                Guard::Port { fu: fb, port: pb, .. },
            ) => fa == fb && pa == pb,
            _ => false,
        }
    }

    /// True if at most one of the two guards can be true in any execution.
    pub fn excludes(&self, other: &Guard) -> bool {
        self.same_condition(other) && self.is_inverted() != other.is_inverted()
    }

    /// Same guard with flipped polarity.
    pub fn inverse(&self) -> Guard {
        match *self {
            Guard::Unconditional => Guard::Unconditional,
            Guard::Register { reg, inverted } => Guard::Register { reg, inverted: !inverted },
            Guard::Port { fu, port, inverted } => Guard::Port { fu, port, inverted: !inverted },
        }
    }
}

/// Something a bus socket can read from or write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    FuPort { fu: FuId, port: u8 },
    RegisterFile(RfId),
    ImmediateUnit(IuId),
}

/// A transport bus.
#[derive(Debug, Clone)]
pub struct Bus {
    pub name: String,
    pub width: u8,
    /// Width of the short immediate field; 0 if the bus carries none.
    pub short_imm_width: u8,
    pub sign_extends: bool,
    /// Conditional guards the bus can evaluate. Unconditional is always supported.
    pub guards: Vec<Guard>,
    pub sources: HashSet<Endpoint>,
    pub destinations: HashSet<Endpoint>,
}

impl Bus {
    pub fn supports_guard(&self, guard: &Guard) -> bool {
        guard.is_unconditional() || self.guards.contains(guard)
    }

    pub fn reads(&self, endpoint: Endpoint) -> bool {
        self.sources.contains(&endpoint)
    }

    pub fn writes(&self, endpoint: Endpoint) -> bool {
        self.destinations.contains(&endpoint)
    }

    /// True if `value` fits the short immediate field.
    pub fn can_carry_immediate(&self, value: i64) -> bool {
        fits_width(value, self.short_imm_width, self.sign_extends)
    }
}

/// True if `value` can be encoded in `width` bits.
pub fn fits_width(value: i64, width: u8, sign_extends: bool) -> bool {
    if width == 0 {
        return false;
    }
    if width >= 64 {
        return true;
    }
    if sign_extends {
        let min = -(1i64 << (width - 1));
        let max = (1i64 << (width - 1)) - 1;
        (min..=max).contains(&value)
    } else {
        value >= 0 && value < (1i64 << width)
    }
}

#[derive(Debug, Clone)]
pub struct FuPort {
    pub name: String,
    pub triggering: bool,
}

/// An operation as implemented by one function unit.
#[derive(Debug, Clone)]
pub struct HwOperation {
    pub operation: OpId,
    pub latency: u8,
    /// Port index for each operand, indexed by `operand - 1`.
    pub bindings: Vec<u8>,
}

impl HwOperation {
    /// Port bound to the 1-based `operand`.
    pub fn port(&self, operand: u8) -> Option<u8> {
        if operand == 0 {
            return None;
        }
        self.bindings.get(operand as usize - 1).copied()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionUnit {
    pub name: String,
    pub ports: Vec<FuPort>,
    pub operations: Vec<HwOperation>,
}

impl FunctionUnit {
    pub fn hw_operation(&self, op: OpId) -> Option<&HwOperation> {
        self.operations.iter().find(|h| h.operation == op)
    }

    pub fn supports(&self, op: OpId) -> bool {
        self.hw_operation(op).is_some()
    }

    pub fn trigger_port(&self) -> Option<u8> {
        self.ports.iter().position(|p| p.triggering).map(|p| p as u8)
    }
}

#[derive(Debug, Clone)]
pub struct RegisterFile {
    pub name: String,
    pub size: u16,
    pub width: u8,
    pub read_ports: u8,
    pub write_ports: u8,
    /// Cycles between writing a register and its use as a guard.
    pub guard_latency: u8,
}

#[derive(Debug, Clone)]
pub struct ImmediateUnit {
    pub name: String,
    pub registers: u16,
    pub width: u8,
    pub sign_extends: bool,
    /// Cycles between the instruction encoding the immediate and its first read.
    pub latency: u8,
}

impl ImmediateUnit {
    pub fn can_hold(&self, value: i64) -> bool {
        fits_width(value, self.width, self.sign_extends)
    }
}

/// Global control unit parameters.
#[derive(Debug, Clone)]
pub struct ControlUnit {
    /// Function unit implementing the control flow operations.
    pub fu: FuId,
    pub delay_slots: u8,
    pub global_guard_latency: u8,
    /// Port holding the return address.
    pub ra_port: u8,
}

/// Semantic properties of an operation.
#[derive(Debug, Clone, Default)]
pub struct OperationInfo {
    pub name: String,
    pub inputs: u8,
    pub outputs: u8,
    pub reads_memory: bool,
    pub writes_memory: bool,
    pub has_side_effects: bool,
    pub control_flow: bool,
    pub is_call: bool,
    /// Number of other operations whose state this operation affects.
    pub affects_count: u8,
}

impl OperationInfo {
    pub fn uses_memory(&self) -> bool {
        self.reads_memory || self.writes_memory
    }

    /// Operands counted from 1: inputs first, then outputs.
    pub fn is_input(&self, operand: u8) -> bool {
        operand >= 1 && operand <= self.inputs
    }

    pub fn is_output(&self, operand: u8) -> bool {
        operand > self.inputs && operand <= self.inputs + self.outputs
    }
}

/// A complete target machine.
#[derive(Debug, Clone)]
pub struct Machine {
    pub name: String,
    pub buses: Vec<Bus>,
    pub function_units: Vec<FunctionUnit>,
    pub register_files: Vec<RegisterFile>,
    pub immediate_units: Vec<ImmediateUnit>,
    pub operations: Vec<OperationInfo>,
    pub control_unit: ControlUnit,
    /// Registers set aside for connectivity copies.
    pub scratch_registers: Vec<RegisterRef>,
}

impl Machine {
    pub fn bus(&self, id: BusId) -> &Bus {
        &self.buses[id.0]
    }

    pub fn function_unit(&self, id: FuId) -> &FunctionUnit {
        &self.function_units[id.0]
    }

    pub fn register_file(&self, id: RfId) -> &RegisterFile {
        &self.register_files[id.0]
    }

    pub fn immediate_unit(&self, id: IuId) -> &ImmediateUnit {
        &self.immediate_units[id.0]
    }

    pub fn operation(&self, id: OpId) -> &OperationInfo {
        &self.operations[id.0]
    }

    pub fn bus_ids(&self) -> impl Iterator<Item = BusId> {
        (0..self.buses.len()).map(BusId)
    }

    pub fn fu_ids(&self) -> impl Iterator<Item = FuId> {
        (0..self.function_units.len()).map(FuId)
    }

    pub fn rf_ids(&self) -> impl Iterator<Item = RfId> {
        (0..self.register_files.len()).map(RfId)
    }

    pub fn iu_ids(&self) -> impl Iterator<Item = IuId> {
        (0..self.immediate_units.len()).map(IuId)
    }

    pub fn operation_by_name(&self, name: &str) -> Option<OpId> {
        self.operations
            .iter()
            .position(|o| o.name.eq_ignore_ascii_case(name))
            .map(OpId)
    }

    pub fn fu_by_name(&self, name: &str) -> Option<FuId> {
        self.function_units
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
            .map(FuId)
    }

    pub fn rf_by_name(&self, name: &str) -> Option<RfId> {
        self.register_files
            .iter()
            .position(|r| r.name.eq_ignore_ascii_case(name))
            .map(RfId)
    }

    pub fn iu_by_name(&self, name: &str) -> Option<IuId> {
        self.immediate_units
            .iter()
            .position(|i| i.name.eq_ignore_ascii_case(name))
            .map(IuId)
    }

    /// Function units implementing `op`, in machine order.
    pub fn units_supporting(&self, op: OpId) -> impl Iterator<Item = FuId> + '_ {
        self.fu_ids().filter(move |fu| self.function_unit(*fu).supports(op))
    }

    /// Smallest latency of `op` over all units implementing it.
    pub fn operation_latency(&self, op: OpId) -> Option<u8> {
        self.function_units
            .iter()
            .filter_map(|fu| fu.hw_operation(op))
            .map(|h| h.latency)
            .min()
    }

    /// Latency of `op` on a specific unit.
    pub fn latency_on(&self, fu: FuId, op: OpId) -> Option<u8> {
        self.function_unit(fu).hw_operation(op).map(|h| h.latency)
    }

    /// Operand of `op` bound to the triggering port of `fu`.
    pub fn trigger_operand_on(&self, fu: FuId, op: OpId) -> Option<u8> {
        let unit = self.function_unit(fu);
        let trigger = unit.trigger_port()?;
        let hw = unit.hw_operation(op)?;
        hw.bindings
            .iter()
            .position(|p| *p == trigger)
            .map(|i| (i + 1) as u8)
    }

    /// Triggering operand of `op` on the first unit implementing it.
    pub fn trigger_operand(&self, op: OpId) -> Option<u8> {
        let fu = self.units_supporting(op).next()?;
        self.trigger_operand_on(fu, op)
    }

    /// Latency between writing a guard value and using it.
    pub fn guard_latency(&self, guard: &Guard) -> u8 {
        match guard {
            Guard::Unconditional => 0,
            Guard::Register { reg, .. } => {
                self.register_file(reg.rf).guard_latency + self.control_unit.global_guard_latency
            }
            Guard::Port { .. } => self.control_unit.global_guard_latency.max(1),
        }
    }

    pub fn is_scratch_register(&self, reg: RegisterRef) -> bool {
        self.scratch_registers.contains(&reg)
    }

    pub fn register_name(&self, reg: RegisterRef) -> String {
        format!("{}.{}", self.register_file(reg.rf).name, reg.index)
    }

    pub fn guard_name(&self, guard: &Guard) -> String {
        let sign = if guard.is_inverted() { "!" } else { "?" };
        match guard {
            Guard::Unconditional => String::new(),
            Guard::Register { reg, .. } => format!("{}{}", sign, self.register_name(*reg)),
            Guard::Port { fu, port, .. } => {
                let unit = self.function_unit(*fu);
                format!("{}{}.{}", sign, unit.name, unit.ports[*port as usize].name)
            }
        }
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Machine {}", self.name)?;
        for bus in &self.buses {
            writeln!(
                f,
                "  bus {} width {} simm {}{}",
                bus.name,
                bus.width,
                bus.short_imm_width,
                if bus.sign_extends { " signed" } else { "" }
            )?;
        }
        for fu in &self.function_units {
            let ops: Vec<_> = fu
                .operations
                .iter()
                .map(|h| format!("{}/{}", self.operation(h.operation).name, h.latency))
                .collect();
            writeln!(f, "  fu {} [{}]", fu.name, ops.join(", "))?;
        }
        for rf in &self.register_files {
            writeln!(
                f,
                "  rf {} size {} r{} w{}",
                rf.name, rf.size, rf.read_ports, rf.write_ports
            )?;
        }
        for iu in &self.immediate_units {
            writeln!(f, "  iu {} registers {} width {}", iu.name, iu.registers, iu.width)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_width() {
        assert!(fits_width(7, 4, true));
        assert!(!fits_width(8, 4, true));
        assert!(fits_width(-8, 4, true));
        assert!(!fits_width(-1, 4, false));
        assert!(fits_width(15, 4, false));
        assert!(!fits_width(0, 0, true));
    }

    #[test]
    fn test_guard_exclusion() {
        let reg = RegisterRef::new(RfId(1), 0);
        let g = Guard::Register { reg, inverted: false };
        assert!(g.excludes(&g.inverse()));
        assert!(!g.excludes(&g));
        assert!(g.same_condition(&g.inverse()));
        assert!(!Guard::Unconditional.excludes(&Guard::Unconditional));
        assert_eq!(g.register(), Some(reg));
    }

    #[test]
    fn test_scratch_registers() {
        let m = presets::clustered().unwrap();
        let rfb = m.rf_by_name("RFB").unwrap();
        assert!(m.is_scratch_register(RegisterRef::new(rfb, 7)));
        assert!(!m.is_scratch_register(RegisterRef::new(rfb, 6)));
        let rf = presets::minimal().unwrap().rf_by_name("RF").unwrap();
        assert!(presets::minimal().unwrap().is_scratch_register(RegisterRef::new(rf, 15)));
    }
}
