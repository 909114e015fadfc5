//! Incremental machine construction.
//!
//! ```
//! use ttasched::machine::{Endpoint, MachineBuilder, OperationInfo};
//!
//! let mut b = MachineBuilder::new("tiny");
//! let add = b.operation(OperationInfo { name: "add".into(), inputs: 2, outputs: 1, ..Default::default() });
//! let jump = b.operation(OperationInfo { name: "jump".into(), inputs: 1, control_flow: true, ..Default::default() });
//! let rf = b.register_file("RF", 8, 32, 1, 1);
//! let alu = b.function_unit("ALU", &[("in1t", true), ("in2", false), ("out1", false)]);
//! b.hw_operation(alu, add, 1, &[0, 1, 2]);
//! let gcu = b.function_unit("GCU", &[("pc", true), ("ra", false)]);
//! b.hw_operation(gcu, jump, 1, &[0]);
//! b.control_unit(gcu, 1, 0, 1);
//! let bus = b.bus("B0", 32, 8, true);
//! b.connect_all(bus);
//! let machine = b.build().unwrap();
//! assert!(machine.is_connected(Endpoint::RegisterFile(rf), Endpoint::FuPort { fu: alu, port: 0 }));
//! ```

use super::*;
use crate::core::{ScheduleResult, SchedulerError};

/// Builder for [`Machine`].
#[derive(Debug, Default)]
pub struct MachineBuilder {
    name: String,
    buses: Vec<Bus>,
    function_units: Vec<FunctionUnit>,
    register_files: Vec<RegisterFile>,
    immediate_units: Vec<ImmediateUnit>,
    operations: Vec<OperationInfo>,
    control_unit: Option<ControlUnit>,
    scratch_registers: Vec<RegisterRef>,
}

impl MachineBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Declare an operation. Names are matched case-insensitively.
    pub fn operation(&mut self, info: OperationInfo) -> OpId {
        self.operations.push(info);
        OpId(self.operations.len() - 1)
    }

    /// Add a register file with guard latency 1.
    pub fn register_file(
        &mut self,
        name: &str,
        size: u16,
        width: u8,
        read_ports: u8,
        write_ports: u8,
    ) -> RfId {
        self.register_files.push(RegisterFile {
            name: name.to_string(),
            size,
            width,
            read_ports,
            write_ports,
            guard_latency: 1,
        });
        RfId(self.register_files.len() - 1)
    }

    /// Add a function unit with the given `(port name, triggering)` ports.
    pub fn function_unit(&mut self, name: &str, ports: &[(&str, bool)]) -> FuId {
        self.function_units.push(FunctionUnit {
            name: name.to_string(),
            ports: ports
                .iter()
                .map(|(n, t)| FuPort {
                    name: n.to_string(),
                    triggering: *t,
                })
                .collect(),
            operations: Vec::new(),
        });
        FuId(self.function_units.len() - 1)
    }

    /// Implement `op` on `fu`; `bindings[i]` is the port of operand `i + 1`.
    pub fn hw_operation(&mut self, fu: FuId, op: OpId, latency: u8, bindings: &[u8]) {
        self.function_units[fu.0].operations.push(HwOperation {
            operation: op,
            latency,
            bindings: bindings.to_vec(),
        });
    }

    pub fn immediate_unit(
        &mut self,
        name: &str,
        registers: u16,
        width: u8,
        sign_extends: bool,
        latency: u8,
    ) -> IuId {
        self.immediate_units.push(ImmediateUnit {
            name: name.to_string(),
            registers,
            width,
            sign_extends,
            latency,
        });
        IuId(self.immediate_units.len() - 1)
    }

    pub fn bus(&mut self, name: &str, width: u8, short_imm_width: u8, sign_extends: bool) -> BusId {
        self.buses.push(Bus {
            name: name.to_string(),
            width,
            short_imm_width,
            sign_extends,
            guards: Vec::new(),
            sources: HashSet::new(),
            destinations: HashSet::new(),
        });
        BusId(self.buses.len() - 1)
    }

    pub fn bus_reads(&mut self, bus: BusId, endpoint: Endpoint) {
        self.buses[bus.0].sources.insert(endpoint);
    }

    pub fn bus_writes(&mut self, bus: BusId, endpoint: Endpoint) {
        self.buses[bus.0].destinations.insert(endpoint);
    }

    /// Let `bus` evaluate `guard` in both polarities.
    pub fn bus_guard(&mut self, bus: BusId, guard: Guard) {
        let guards = &mut self.buses[bus.0].guards;
        for g in [guard, guard.inverse()] {
            if !g.is_unconditional() && !guards.contains(&g) {
                guards.push(g);
            }
        }
    }

    /// Connect `bus` to every register file, unit port and immediate unit declared so far.
    pub fn connect_all(&mut self, bus: BusId) {
        for rf in 0..self.register_files.len() {
            self.bus_reads(bus, Endpoint::RegisterFile(RfId(rf)));
            self.bus_writes(bus, Endpoint::RegisterFile(RfId(rf)));
        }
        for fu in 0..self.function_units.len() {
            for port in 0..self.function_units[fu].ports.len() {
                let ep = Endpoint::FuPort {
                    fu: FuId(fu),
                    port: port as u8,
                };
                self.bus_reads(bus, ep);
                self.bus_writes(bus, ep);
            }
        }
        for iu in 0..self.immediate_units.len() {
            self.bus_reads(bus, Endpoint::ImmediateUnit(IuId(iu)));
        }
    }

    pub fn control_unit(&mut self, fu: FuId, delay_slots: u8, global_guard_latency: u8, ra_port: u8) {
        self.control_unit = Some(ControlUnit {
            fu,
            delay_slots,
            global_guard_latency,
            ra_port,
        });
    }

    /// Reserve the last `count` registers of `rf` for connectivity copies.
    pub fn scratch_registers(&mut self, rf: RfId, count: u16) {
        let size = self.register_files[rf.0].size;
        for index in size.saturating_sub(count)..size {
            self.scratch_registers.push(RegisterRef::new(rf, index));
        }
    }

    pub fn build(self) -> ScheduleResult<Machine> {
        let control_unit = self.control_unit.clone().ok_or_else(|| SchedulerError::InvalidMachine {
            reason: format!("machine {} has no control unit", self.name),
        })?;
        self.validate(&control_unit)?;
        log::debug!(
            "Built machine {}: {} buses, {} units, {} register files",
            self.name,
            self.buses.len(),
            self.function_units.len(),
            self.register_files.len()
        );
        Ok(Machine {
            name: self.name,
            buses: self.buses,
            function_units: self.function_units,
            register_files: self.register_files,
            immediate_units: self.immediate_units,
            operations: self.operations,
            control_unit,
            scratch_registers: self.scratch_registers,
        })
    }

    fn validate(&self, cu: &ControlUnit) -> ScheduleResult<()> {
        let invalid = |reason: String| Err(SchedulerError::InvalidMachine { reason });

        let Some(gcu) = self.function_units.get(cu.fu.0) else {
            return invalid(format!("control unit {:?} does not exist", cu.fu));
        };
        if cu.ra_port as usize >= gcu.ports.len() {
            return invalid(format!("{} has no return address port {}", gcu.name, cu.ra_port));
        }

        for fu in &self.function_units {
            if fu.operations.is_empty() {
                continue;
            }
            let triggers = fu.ports.iter().filter(|p| p.triggering).count();
            if triggers != 1 {
                return invalid(format!("{} must have exactly one triggering port", fu.name));
            }
            for hw in &fu.operations {
                let Some(info) = self.operations.get(hw.operation.0) else {
                    return invalid(format!("{} implements unknown operation", fu.name));
                };
                if hw.bindings.len() != (info.inputs + info.outputs) as usize {
                    return invalid(format!(
                        "{}.{} binds {} operands, expected {}",
                        fu.name,
                        info.name,
                        hw.bindings.len(),
                        info.inputs + info.outputs
                    ));
                }
                if hw.bindings.iter().any(|p| *p as usize >= fu.ports.len()) {
                    return invalid(format!("{}.{} binds a missing port", fu.name, info.name));
                }
                let trigger_bound = hw.bindings[..info.inputs as usize]
                    .iter()
                    .any(|p| fu.ports[*p as usize].triggering);
                if info.inputs > 0 && !trigger_bound {
                    return invalid(format!("{}.{} has no triggering operand", fu.name, info.name));
                }
            }
        }

        for reg in &self.scratch_registers {
            if reg.index >= self.register_files[reg.rf.0].size {
                return invalid(format!("scratch register {:?} out of range", reg));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_control_unit() {
        let b = MachineBuilder::new("broken");
        let err = b.build().unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidMachine { .. }));
    }

    #[test]
    fn test_binding_count_checked() {
        let mut b = MachineBuilder::new("broken");
        let add = b.operation(OperationInfo {
            name: "add".into(),
            inputs: 2,
            outputs: 1,
            ..Default::default()
        });
        let alu = b.function_unit("ALU", &[("in1t", true), ("in2", false), ("out1", false)]);
        b.hw_operation(alu, add, 1, &[0, 1]);
        b.control_unit(alu, 0, 0, 2);
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("binds 2 operands"));
    }

    #[test]
    fn test_scratch_registers_are_last() {
        let mut b = MachineBuilder::new("m");
        let rf = b.register_file("RF", 8, 32, 1, 1);
        b.scratch_registers(rf, 2);
        let gcu = b.function_unit("GCU", &[("pc", true), ("ra", false)]);
        b.control_unit(gcu, 0, 0, 1);
        let m = b.build().unwrap();
        assert_eq!(
            m.scratch_registers,
            vec![RegisterRef::new(rf, 6), RegisterRef::new(rf, 7)]
        );
    }
}
