//! Property tests over randomly generated blocks and loops.

use hashbrown::{HashMap, HashSet};
use proptest::prelude::*;
use ttasched::core::{SchedulerError, SchedulingSession};
use ttasched::ddg::{DependenceType, EdgeReason};
use ttasched::listing::parse_listing;
use ttasched::machine::{presets, Endpoint, FuId, IuId, Machine, OpId, RegisterRef};
use ttasched::program::{NodeId, Procedure, ScheduledInstruction, Terminal};
use ttasched::resource::AssignOptions;
use ttasched::scheduler::{
    can_be_speculated, schedule_procedure, BlockScheduler, ListScheduler, LoopScheduler, SchedulerKind,
    SchedulerOptions,
};
use ttasched::{DataDependenceGraph, DdgBuilder, SimpleResourceManager};

// One source-level statement of a generated block, as listing lines.
fn statement() -> impl Strategy<Value = String> {
    let reg = || 1u16..=8;
    prop_oneof![
        (
            prop::sample::select(vec!["add", "sub", "and", "shl", "eq", "gt", "mul"]),
            reg(),
            reg(),
            reg()
        )
            .prop_map(|(op, a, b, d)| format!("    RF.{a} -> {op}.1\n    RF.{b} -> {op}.2\n    {op}.3 -> RF.{d}")),
        (reg(), reg()).prop_map(|(s, d)| format!("    RF.{s} -> RF.{d}")),
        (-100i64..100, reg()).prop_map(|(v, d)| format!("    #{v} -> RF.{d}")),
        (reg(), reg()).prop_map(|(a, d)| format!("    RF.{a} -> ldw.1\n    ldw.2 -> RF.{d}")),
        (reg(), reg()).prop_map(|(a, v)| format!("    RF.{a} -> stw.1\n    RF.{v} -> stw.2")),
    ]
}

fn block_listing() -> impl Strategy<Value = String> {
    prop::collection::vec(statement(), 1..6)
        .prop_map(|statements| format!("proc random {{\nentry:\n{}\n}}\n", statements.join("\n")))
}

// Clustered statements; register 7 of each file is the copy scratch register.
fn clustered_statement() -> impl Strategy<Value = String> {
    let files = || prop::sample::select(vec!["RFA", "RFB", "RFC"]);
    let reg = move || (files(), 0u16..=6).prop_map(|(rf, i)| format!("{rf}.{i}"));
    prop_oneof![
        (
            prop::sample::select(vec!["add", "sub", "mul"]),
            files(),
            0u16..=6,
            0u16..=6,
            reg()
        )
            .prop_map(|(op, rf, a, b, d)| format!("    {rf}.{a} -> {op}.1\n    {rf}.{b} -> {op}.2\n    {op}.3 -> {d}")),
        (reg(), reg()).prop_map(|(s, d)| format!("    {s} -> {d}")),
        (-100i64..100, reg()).prop_map(|(v, d)| format!("    #{v} -> {d}")),
    ]
}

fn clustered_listing() -> impl Strategy<Value = String> {
    prop::collection::vec(clustered_statement(), 1..6)
        .prop_map(|statements| format!("proc random {{\nentry:\n{}\n}}\n", statements.join("\n")))
}

// A single-block loop closed by a jump, guarded from outside the loop or not at all.
fn loop_listing() -> impl Strategy<Value = String> {
    (prop::collection::vec(statement(), 1..4), any::<bool>()).prop_map(|(statements, guarded)| {
        let guard = if guarded { "?BOOL.0 " } else { "" };
        format!(
            "proc random {{\nbody: loop\n{}\n    {guard}@body -> jump.1\n}}\n",
            statements.join("\n")
        )
    })
}

fn initial_value(reg: RegisterRef) -> i64 {
    (reg.rf.0 as i64 + 1) * 1000 + reg.index as i64
}

fn evaluate(machine: &Machine, op: OpId, a: i64, b: i64) -> i64 {
    match machine.operation(op).name.as_str() {
        "add" => a.wrapping_add(b),
        "sub" => a.wrapping_sub(b),
        "mul" => a.wrapping_mul(b),
        other => panic!("no evaluation for {other}"),
    }
}

/// Register values after running the listing one move at a time.
fn run_listing(machine: &Machine, procedure: &Procedure) -> HashMap<RegisterRef, i64> {
    let mut regs = HashMap::new();
    let mut operands: HashMap<(OpId, u8), i64> = HashMap::new();
    let mut results: HashMap<OpId, i64> = HashMap::new();
    for mv in procedure.blocks[0].instructions.iter().flatten() {
        let value = match mv.source {
            Terminal::Register(r) => *regs.get(&r).unwrap_or(&initial_value(r)),
            Terminal::Immediate(v) => v,
            Terminal::FuPort(ft) => results[&ft.operation],
            other => panic!("unexpected source {other:?}"),
        };
        match mv.destination {
            Terminal::Register(r) => {
                regs.insert(r, value);
            }
            Terminal::FuPort(ft) => {
                operands.insert((ft.operation, ft.operand), value);
                if machine.trigger_operand(ft.operation) == Some(ft.operand) {
                    let result = evaluate(machine, ft.operation, operands[&(ft.operation, 1)], operands[&(ft.operation, 2)]);
                    results.insert(ft.operation, result);
                }
            }
            other => panic!("unexpected destination {other:?}"),
        }
    }
    regs
}

fn port(machine: &Machine, fu: FuId, op: OpId, operand: u8) -> u8 {
    match machine.operand_endpoint(fu, op, operand) {
        Some(Endpoint::FuPort { port, .. }) => port,
        other => panic!("no port for operand {operand}: {other:?}"),
    }
}

/// Register values after running the scheduled instructions cycle by cycle.
///
/// All moves of a cycle read before any of them writes; results appear in
/// their port `latency` cycles after the trigger.
fn run_schedule(machine: &Machine, instructions: &[ScheduledInstruction]) -> HashMap<RegisterRef, i64> {
    let mut regs = HashMap::new();
    let mut ports: HashMap<(FuId, u8), i64> = HashMap::new();
    let mut immediates: HashMap<(IuId, u16), i64> = HashMap::new();
    let mut pending: Vec<(i32, (FuId, u8), i64)> = Vec::new();
    let mut ordered: Vec<&ScheduledInstruction> = instructions.iter().collect();
    ordered.sort_by_key(|ins| ins.cycle);

    for ins in ordered {
        let cycle = ins.cycle;
        pending.retain(|(arrival, key, value)| {
            if *arrival <= cycle {
                ports.insert(*key, *value);
                false
            } else {
                true
            }
        });
        let reads: Vec<_> = ins
            .moves
            .iter()
            .map(|mv| {
                let value = match mv.source {
                    Terminal::Register(r) => *regs.get(&r).unwrap_or(&initial_value(r)),
                    Terminal::Immediate(v) => v,
                    Terminal::ImmediateRegister { iu, index } => immediates[&(iu, index)],
                    Terminal::FuPort(ft) => {
                        let fu = ft.unit.expect("placed moves name their unit");
                        ports[&(fu, port(machine, fu, ft.operation, ft.operand))]
                    }
                    other => panic!("unexpected source {other:?}"),
                };
                (mv, value)
            })
            .collect();
        for imm in &ins.immediates {
            immediates.insert((imm.iu, imm.index), imm.value);
        }
        let mut triggered = Vec::new();
        for (mv, value) in reads {
            match mv.destination {
                Terminal::Register(r) => {
                    regs.insert(r, value);
                }
                Terminal::FuPort(ft) => {
                    let fu = ft.unit.expect("placed moves name their unit");
                    ports.insert((fu, port(machine, fu, ft.operation, ft.operand)), value);
                    if machine.trigger_operand_on(fu, ft.operation) == Some(ft.operand) {
                        triggered.push((fu, ft.operation));
                    }
                }
                other => panic!("unexpected destination {other:?}"),
            }
        }
        for (fu, op) in triggered {
            let a = ports[&(fu, port(machine, fu, op, 1))];
            let b = ports[&(fu, port(machine, fu, op, 2))];
            let latency = machine.latency_on(fu, op).expect("unit implements the operation") as i32;
            pending.push((cycle + latency, (fu, port(machine, fu, op, 3)), evaluate(machine, op, a, b)));
        }
    }
    regs
}

fn parse_one(text: &str, machine: &Machine) -> Procedure {
    parse_listing(text, machine).unwrap().remove(0)
}

fn build(machine: &Machine, procedure: &Procedure) -> DataDependenceGraph {
    DdgBuilder::new(machine).build_block(&procedure.blocks[0]).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_unassign_restores_resources(text in block_listing()) {
        let machine = presets::minimal().unwrap();
        let procedure = parse_one(&text, &machine);
        let mut ddg = build(&machine, &procedure);
        let mut rm = SimpleResourceManager::new(&machine, 0);
        let nodes = ddg.view(ddg.block(0).graph).nodes();

        for node in nodes {
            let opts = AssignOptions::default();
            let Some(cycle) = rm.earliest_cycle(&ddg, 0, node, opts) else {
                continue;
            };
            let before = rm.resource_snapshot();
            let original = ddg.node(node).mv;

            rm.assign(&mut ddg, cycle, node, opts).unwrap();
            prop_assert_eq!(ddg.node(node).cycle(), Some(cycle));
            rm.unassign(&mut ddg, node).unwrap();

            prop_assert_eq!(rm.resource_snapshot(), before);
            prop_assert_eq!(ddg.node(node).mv, original);
            prop_assert!(!ddg.node(node).is_scheduled());

            rm.assign(&mut ddg, cycle, node, opts).unwrap();
        }
    }

    #[test]
    fn prop_unmerge_restores_edges(
        from_operation in any::<bool>(),
        bypassed in 1u16..=8,
        copies in prop::collection::vec((1u16..=8, 1u16..=8), 0..4),
        target in 1u16..=8,
    ) {
        let machine = presets::minimal().unwrap();
        let mut text = String::from("proc merge {\nentry:\n");
        if from_operation {
            text.push_str(&format!("    RF.1 -> add.1\n    RF.2 -> add.2\n    add.3 -> RF.{bypassed}\n"));
        } else {
            text.push_str(&format!("    RF.1 -> RF.{bypassed}\n"));
        }
        let def = NodeId(if from_operation { 2 } else { 0 });
        let mut count = def.0 + 1;
        for (s, d) in &copies {
            // Another write of the bypassed register would end the RAW edge.
            let d = if *d == bypassed { bypassed % 8 + 1 } else { *d };
            text.push_str(&format!("    RF.{s} -> RF.{d}\n"));
            count += 1;
        }
        text.push_str(&format!("    RF.{bypassed} -> RF.{target}\n}}\n"));
        let use_node = NodeId(count);

        let procedure = parse_one(&text, &machine);
        let mut ddg = build(&machine, &procedure);
        let edges = ddg.edge_set();
        let mv = ddg.node(use_node).mv;

        ddg.merge_and_keep(def, use_node).unwrap();
        prop_assert!(ddg.is_merged(def, use_node));
        prop_assert_eq!(ddg.node(use_node).mv.source, ddg.node(def).mv.source);
        ddg.un_merge(def, use_node).unwrap();

        prop_assert!(!ddg.is_merged(def, use_node));
        prop_assert_eq!(ddg.edge_set(), edges);
        prop_assert_eq!(ddg.node(use_node).mv, mv);
    }

    #[test]
    fn prop_list_schedule_respects_dependences(text in block_listing()) {
        let machine = presets::minimal().unwrap();
        let procedure = parse_one(&text, &machine);
        let mut ddg = build(&machine, &procedure);
        let graph = ddg.block(0).graph;
        let mut session = SchedulingSession::new();
        ListScheduler::new(&machine, SchedulerOptions::default())
            .schedule_block(&mut ddg, 0, &mut session)
            .unwrap();

        prop_assert!(ddg.view(graph).unscheduled_nodes().is_empty());
        let violations = ddg.schedule_violations(graph, 0).unwrap();
        prop_assert!(violations.is_empty(), "{:?}", violations);

        for (tail, head, edge) in ddg.edge_set() {
            if edge.reason != EdgeReason::Register || edge.back_edge {
                continue;
            }
            let (Some(t), Some(h)) = (ddg.node(tail).cycle(), ddg.node(head).cycle()) else {
                continue;
            };
            match edge.kind {
                DependenceType::Raw | DependenceType::Waw => prop_assert!(h > t, "{} -> {} {:?}", tail, head, edge),
                DependenceType::War => prop_assert!(h >= t, "{} -> {} {:?}", tail, head, edge),
                DependenceType::Unknown => {}
            }
        }
        prop_assert_eq!(session.stats().moves_scheduled, ddg.view(graph).node_count());
    }

    #[test]
    fn prop_clustered_schedule_keeps_register_values(text in clustered_listing()) {
        let machine = presets::clustered().unwrap();
        let procedure = parse_one(&text, &machine);
        let mut session = SchedulingSession::new();
        let scheduled = schedule_procedure(
            &machine,
            &procedure,
            SchedulerKind::List,
            &SchedulerOptions::default(),
            &mut session,
        )
        .unwrap();

        let expected = run_listing(&machine, &procedure);
        let actual = run_schedule(&machine, &scheduled.blocks[0].instructions);
        for (reg, value) in &expected {
            prop_assert_eq!(
                actual.get(reg).copied().unwrap_or(initial_value(*reg)),
                *value,
                "{} in\n{}",
                machine.register_name(*reg),
                text
            );
        }
        // Copies only ever touch scratch registers.
        for reg in actual.keys().filter(|r| !expected.contains_key(*r)) {
            prop_assert!(machine.is_scratch_register(*reg), "{} clobbered", machine.register_name(*reg));
        }
    }

    #[test]
    fn prop_loop_schedule_fits_modulo_resources(text in loop_listing()) {
        let machine = presets::minimal().unwrap();
        let procedure = parse_one(&text, &machine);
        let mut ddg = build(&machine, &procedure);
        let graph = ddg.block(0).graph;
        let original: HashMap<NodeId, _> = ddg.view(graph).nodes().into_iter().map(|n| (n, ddg.node(n).mv.guard)).collect();
        let mut session = SchedulingSession::new();
        let scheduled = match LoopScheduler::new(&machine, SchedulerOptions::default()).schedule_block(&mut ddg, 0, &mut session) {
            Ok(scheduled) => scheduled,
            Err(SchedulerError::SchedulingFailed { .. }) => return Err(TestCaseError::reject("no initiation interval fits")),
            Err(e) => return Err(TestCaseError::fail(e.to_string())),
        };
        let schedule = scheduled.loop_schedule.unwrap();
        let ii = schedule.ii as i32;
        prop_assert_eq!(schedule.kernel.len(), schedule.ii as usize);
        prop_assert!(ddg.view(graph).unscheduled_nodes().is_empty());
        prop_assert!(ddg.verify_schedule(graph, ii).is_ok());

        for ins in &schedule.kernel {
            let mut buses = HashSet::new();
            let mut triggers = HashSet::new();
            let mut reads: HashMap<_, usize> = HashMap::new();
            let mut writes: HashMap<_, usize> = HashMap::new();
            for mv in &ins.moves {
                prop_assert!(buses.insert(mv.bus.unwrap()), "bus used twice in kernel slot {}", ins.cycle);
                if let Terminal::Register(r) = mv.source {
                    *reads.entry(r.rf).or_default() += 1;
                }
                match mv.destination {
                    Terminal::Register(r) => *writes.entry(r.rf).or_default() += 1,
                    Terminal::FuPort(ft) => {
                        let fu = ft.unit.unwrap();
                        if machine.trigger_operand_on(fu, ft.operation) == Some(ft.operand) {
                            prop_assert!(triggers.insert(fu), "two triggers in kernel slot {}", ins.cycle);
                        }
                    }
                    _ => {}
                }
            }
            for (rf, count) in reads {
                prop_assert!(count <= machine.register_file(rf).read_ports as usize);
            }
            for (rf, count) in writes {
                prop_assert!(count <= machine.register_file(rf).write_ports as usize);
            }
        }

        let nodes = ddg.view(graph).nodes();
        let jump = *nodes.iter().max_by_key(|n| ddg.node(**n).order).unwrap();
        let jump_guard = ddg.node(jump).mv.guard;
        for node in nodes {
            let mn = ddg.node(node);
            let cycle = mn.cycle().unwrap();
            let first_stage = cycle < ii
                && node != jump
                && !jump_guard.is_unconditional()
                && !can_be_speculated(&ddg, node, &machine);
            if first_stage {
                prop_assert_eq!(mn.mv.guard, jump_guard, "{} at {} runs unguarded", node, cycle);
            } else {
                prop_assert_eq!(mn.mv.guard, original[&node]);
            }
        }
        for ins in &schedule.prolog {
            prop_assert!(ins.moves.iter().all(|mv| mv.guard.is_unconditional()));
        }
    }
}
