//! Runs every listing under tests/fixtures.
//!
//! A fixture names its options on a `; RUN:` line and the text its output
//! must contain on `; CHECK:` lines. `; RUN: not ...` expects the run to fail
//! and checks the error message instead.

use std::fs;
use std::path::{Path, PathBuf};
use ttasched::core::SchedulingSession;
use ttasched::listing::{parse_listing, print_schedule};
use ttasched::machine::presets;
use ttasched::scheduler::{schedule_procedure, SchedulerKind, SchedulerOptions};
use ttasched::ScheduleResult;

struct RunLine {
    machine: String,
    kind: SchedulerKind,
    options: SchedulerOptions,
    expect_failure: bool,
}

fn discover_fixtures(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("tta") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn parse_run_line(content: &str) -> RunLine {
    let mut run = RunLine {
        machine: "minimal".to_string(),
        kind: SchedulerKind::List,
        options: SchedulerOptions::default(),
        expect_failure: false,
    };
    for line in content.lines() {
        let Some(run_line) = line.strip_prefix("; RUN:") else {
            continue;
        };
        let mut words = run_line.split_whitespace().peekable();
        if words.peek() == Some(&"not") {
            run.expect_failure = true;
            words.next();
        }
        for word in words {
            if let Some(name) = word.strip_prefix("--machine=") {
                run.machine = name.to_string();
            } else if let Some(kind) = word.strip_prefix("--scheduler=") {
                run.kind = match kind {
                    "sequential" => SchedulerKind::Sequential,
                    "loop" => SchedulerKind::Loop,
                    _ => SchedulerKind::List,
                };
            } else if word == "--bypass" {
                run.options.bypass = true;
            } else if word == "--no-prolog" {
                run.options.loop_prolog = false;
            } else if word == "--no-copies" {
                run.options.copy_adder = false;
            }
        }
    }
    run
}

fn run_listing(text: &str, run: &RunLine) -> ScheduleResult<String> {
    let machine = presets::by_name(&run.machine)?;
    let procedures = parse_listing(text, &machine)?;
    let mut session = SchedulingSession::new();
    let mut output = String::new();
    for procedure in &procedures {
        let scheduled = schedule_procedure(&machine, procedure, run.kind, &run.options, &mut session)?;
        output.push_str(&print_schedule(&machine, &scheduled));
    }
    Ok(output)
}

fn check_output_contains(path: &Path, output: &str, patterns: &[&str]) {
    for pattern in patterns {
        assert!(
            output.contains(pattern),
            "{}: expected output to contain '{}', got:\n{}",
            path.display(),
            pattern,
            output
        );
    }
}

fn run_fixture(path: &Path) {
    let content = fs::read_to_string(path).unwrap();
    let run = parse_run_line(&content);
    let patterns: Vec<&str> = content
        .lines()
        .filter_map(|line| line.strip_prefix("; CHECK:"))
        .map(str::trim)
        .collect();

    let output = match (run_listing(&content, &run), run.expect_failure) {
        (Ok(output), false) => output,
        (Err(e), true) => e.to_string(),
        (Ok(output), true) => panic!("{}: expected failure, got:\n{}", path.display(), output),
        (Err(e), false) => panic!("{}: {}", path.display(), e),
    };
    check_output_contains(path, &output, &patterns);
}

#[test]
fn test_all_fixtures() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    let fixtures = discover_fixtures(&dir);
    assert!(!fixtures.is_empty(), "no fixtures under {}", dir.display());
    for path in &fixtures {
        log::info!("Running {}", path.display());
        run_fixture(path);
    }
}

#[test]
fn test_clustered_copies_counted() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/clustered_copies.tta");
    let content = fs::read_to_string(&path).unwrap();
    let machine = presets::clustered().unwrap();
    let procedures = parse_listing(&content, &machine).unwrap();
    let mut session = SchedulingSession::new();
    schedule_procedure(
        &machine,
        &procedures[0],
        SchedulerKind::List,
        &SchedulerOptions::default(),
        &mut session,
    )
    .unwrap();
    // One hop for the register copy, two for the result.
    assert_eq!(session.stats().copies_added, 3);
    assert_eq!(session.stats().regions_scheduled, 1);
}

#[test]
fn test_every_kind_schedules_straight_line_code() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/straight_line.tta");
    let content = fs::read_to_string(&path).unwrap();
    for kind in [SchedulerKind::Sequential, SchedulerKind::List, SchedulerKind::Loop] {
        let run = RunLine {
            machine: "minimal".to_string(),
            kind,
            options: SchedulerOptions::default(),
            expect_failure: false,
        };
        let output = run_listing(&content, &run).unwrap();
        check_output_contains(&path, &output, &["entry: ;", "exit: ; 1 instructions"]);
    }
}
