//! Built-in machines.
//!
//! `minimal` is a small fully connected machine. `clustered` splits the
//! datapath into three register-file clusters joined by copy buses, so that
//! some transports need one or two intermediate register copies.

use super::*;
use crate::core::{ScheduleResult, SchedulerError};

/// Operation set shared by the presets.
struct Operations {
    add: OpId,
    sub: OpId,
    mul: OpId,
    and: OpId,
    shl: OpId,
    eq: OpId,
    gt: OpId,
    ldw: OpId,
    stw: OpId,
    jump: OpId,
    call: OpId,
}

fn declare_operations(b: &mut MachineBuilder) -> Operations {
    let alu = |name: &str| OperationInfo {
        name: name.to_string(),
        inputs: 2,
        outputs: 1,
        ..Default::default()
    };
    Operations {
        add: b.operation(alu("add")),
        sub: b.operation(alu("sub")),
        mul: b.operation(alu("mul")),
        and: b.operation(alu("and")),
        shl: b.operation(alu("shl")),
        eq: b.operation(alu("eq")),
        gt: b.operation(alu("gt")),
        ldw: b.operation(OperationInfo {
            name: "ldw".into(),
            inputs: 1,
            outputs: 1,
            reads_memory: true,
            ..Default::default()
        }),
        stw: b.operation(OperationInfo {
            name: "stw".into(),
            inputs: 2,
            outputs: 0,
            writes_memory: true,
            ..Default::default()
        }),
        jump: b.operation(OperationInfo {
            name: "jump".into(),
            inputs: 1,
            outputs: 0,
            control_flow: true,
            ..Default::default()
        }),
        call: b.operation(OperationInfo {
            name: "call".into(),
            inputs: 1,
            outputs: 0,
            control_flow: true,
            is_call: true,
            has_side_effects: true,
            ..Default::default()
        }),
    }
}

/// ALU ports: `in1`, `in2t` (triggering), `out1`.
fn alu_unit(b: &mut MachineBuilder, name: &str, ops: &[OpId]) -> FuId {
    let fu = b.function_unit(name, &[("in1", false), ("in2t", true), ("out1", false)]);
    for op in ops {
        b.hw_operation(fu, *op, 1, &[0, 1, 2]);
    }
    fu
}

fn lsu_unit(b: &mut MachineBuilder, ops: &Operations) -> FuId {
    let lsu = b.function_unit("LSU", &[("in1", false), ("in2t", true), ("out1", false)]);
    b.hw_operation(lsu, ops.ldw, 3, &[1, 2]);
    b.hw_operation(lsu, ops.stw, 1, &[0, 1]);
    lsu
}

fn gcu_unit(b: &mut MachineBuilder, ops: &Operations, delay_slots: u8) -> FuId {
    let gcu = b.function_unit("GCU", &[("pc", true), ("ra", false)]);
    b.hw_operation(gcu, ops.jump, 1, &[0]);
    b.hw_operation(gcu, ops.call, 1, &[0]);
    b.control_unit(gcu, delay_slots, 0, 1);
    gcu
}

fn connect_unit(b: &mut MachineBuilder, bus: BusId, fu: FuId, ports: u8) {
    for port in 0..ports {
        b.bus_reads(bus, Endpoint::FuPort { fu, port });
        b.bus_writes(bus, Endpoint::FuPort { fu, port });
    }
}

fn connect_rf(b: &mut MachineBuilder, bus: BusId, rf: RfId) {
    b.bus_reads(bus, Endpoint::RegisterFile(rf));
    b.bus_writes(bus, Endpoint::RegisterFile(rf));
}

/// Three fully connected buses, one general register file, one guard file.
///
/// Short immediates are 8 bits signed; wider constants go through the
/// `IMM` long immediate unit.
pub fn minimal() -> ScheduleResult<Machine> {
    let mut b = MachineBuilder::new("minimal");
    let ops = declare_operations(&mut b);

    let rf = b.register_file("RF", 16, 32, 2, 1);
    let bool_rf = b.register_file("BOOL", 2, 1, 1, 1);
    b.immediate_unit("IMM", 1, 32, true, 1);

    alu_unit(
        &mut b,
        "ALU",
        &[ops.add, ops.sub, ops.and, ops.shl, ops.eq, ops.gt],
    );
    let mul = b.function_unit("MUL", &[("in1", false), ("in2t", true), ("out1", false)]);
    b.hw_operation(mul, ops.mul, 3, &[0, 1, 2]);
    lsu_unit(&mut b, &ops);
    gcu_unit(&mut b, &ops, 1);

    for (name, guarded) in [("B0", true), ("B1", true), ("B2", false)] {
        let bus = b.bus(name, 32, 8, true);
        b.connect_all(bus);
        if guarded {
            for index in 0..2 {
                b.bus_guard(
                    bus,
                    Guard::Register {
                        reg: RegisterRef::new(bool_rf, index),
                        inverted: false,
                    },
                );
            }
        }
    }
    b.scratch_registers(rf, 1);
    b.build()
}

/// Three clusters (`RFA`, `RFB`, `RFC`) joined by copy buses.
///
/// - `BA` connects `RFA`, `ALUA`, `GCU`, `BOOL` and the `IMM` unit and carries
///   8 bit short immediates.
/// - `BB` connects `RFB`, `ALUB` and `LSU`; it has no immediate field.
/// - `BC` connects `RFC` and `MULC`.
/// - `XAB` copies `RFA` to `RFB` and back, `XBC` copies `RFB` to `RFC` and back.
///
/// `RFA -> ALUB` thus needs one copy through `RFB` and `RFA -> MULC` two.
pub fn clustered() -> ScheduleResult<Machine> {
    let mut b = MachineBuilder::new("clustered");
    let ops = declare_operations(&mut b);

    let rfa = b.register_file("RFA", 8, 32, 1, 1);
    let rfb = b.register_file("RFB", 8, 32, 1, 1);
    let rfc = b.register_file("RFC", 8, 32, 1, 1);
    let bool_rf = b.register_file("BOOL", 2, 1, 1, 1);
    let imm = b.immediate_unit("IMM", 1, 32, true, 1);

    let alua = alu_unit(&mut b, "ALUA", &[ops.add, ops.sub, ops.eq, ops.gt]);
    let alub = alu_unit(&mut b, "ALUB", &[ops.add, ops.sub, ops.and, ops.shl]);
    let mulc = b.function_unit("MULC", &[("in1", false), ("in2t", true), ("out1", false)]);
    b.hw_operation(mulc, ops.mul, 3, &[0, 1, 2]);
    let lsu = lsu_unit(&mut b, &ops);
    let gcu = gcu_unit(&mut b, &ops, 1);

    let guards = [0u16, 1].map(|index| Guard::Register {
        reg: RegisterRef::new(bool_rf, index),
        inverted: false,
    });

    let ba = b.bus("BA", 32, 8, true);
    connect_rf(&mut b, ba, rfa);
    connect_rf(&mut b, ba, bool_rf);
    connect_unit(&mut b, ba, alua, 3);
    connect_unit(&mut b, ba, gcu, 2);
    b.bus_reads(ba, Endpoint::ImmediateUnit(imm));

    let bb = b.bus("BB", 32, 0, false);
    connect_rf(&mut b, bb, rfb);
    connect_unit(&mut b, bb, alub, 3);
    connect_unit(&mut b, bb, lsu, 3);

    let bc = b.bus("BC", 32, 0, false);
    connect_rf(&mut b, bc, rfc);
    connect_unit(&mut b, bc, mulc, 3);

    for bus in [ba, bb] {
        for guard in guards {
            b.bus_guard(bus, guard);
        }
    }

    let xab = b.bus("XAB", 32, 0, false);
    b.bus_reads(xab, Endpoint::RegisterFile(rfa));
    b.bus_writes(xab, Endpoint::RegisterFile(rfb));
    b.bus_reads(xab, Endpoint::RegisterFile(rfb));
    b.bus_writes(xab, Endpoint::RegisterFile(rfa));

    let xbc = b.bus("XBC", 32, 0, false);
    b.bus_reads(xbc, Endpoint::RegisterFile(rfb));
    b.bus_writes(xbc, Endpoint::RegisterFile(rfc));
    b.bus_reads(xbc, Endpoint::RegisterFile(rfc));
    b.bus_writes(xbc, Endpoint::RegisterFile(rfb));

    for rf in [rfa, rfb, rfc] {
        b.scratch_registers(rf, 1);
    }

    b.build()
}

/// Preset by name, as accepted by the driver.
pub fn by_name(name: &str) -> ScheduleResult<Machine> {
    match name {
        "minimal" => minimal(),
        "clustered" => clustered(),
        _ => Err(SchedulerError::precondition(format!("unknown machine preset {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_build() {
        let m = minimal().unwrap();
        assert_eq!(m.buses.len(), 3);
        assert_eq!(m.control_unit.delay_slots, 1);
        let c = clustered().unwrap();
        assert_eq!(c.scratch_registers.len(), 3);
        assert!(by_name("nonexistent").is_err());
    }

    #[test]
    fn test_trigger_is_last_input() {
        let m = minimal().unwrap();
        let add = m.operation_by_name("add").unwrap();
        let ldw = m.operation_by_name("ldw").unwrap();
        let stw = m.operation_by_name("stw").unwrap();
        let jump = m.operation_by_name("jump").unwrap();
        assert_eq!(m.trigger_operand(add), Some(2));
        assert_eq!(m.trigger_operand(ldw), Some(1));
        assert_eq!(m.trigger_operand(stw), Some(2));
        assert_eq!(m.trigger_operand(jump), Some(1));
        assert_eq!(m.operation_latency(ldw), Some(3));
    }
}
