//! Schedule a textual move listing on one of the built-in machines.

use clap::{ArgAction, Parser, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use ttasched::core::SchedulingSession;
use ttasched::listing::{parse_listing, print_schedule};
use ttasched::machine::presets;
use ttasched::scheduler::{schedule_procedure, SchedulerKind, SchedulerOptions};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scheduler {
    Sequential,
    List,
    Loop,
}

impl From<Scheduler> for SchedulerKind {
    fn from(s: Scheduler) -> Self {
        match s {
            Scheduler::Sequential => SchedulerKind::Sequential,
            Scheduler::List => SchedulerKind::List,
            Scheduler::Loop => SchedulerKind::Loop,
        }
    }
}

/// Schedule a TTA move listing.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Arguments {
    /// Listing to schedule; standard input when omitted.
    listing: Option<PathBuf>,

    /// Target machine preset (minimal or clustered).
    #[arg(long, short, default_value = "minimal")]
    machine: String,

    #[arg(long, short, value_enum, default_value = "list")]
    scheduler: Scheduler,

    /// First initiation interval tried for loops.
    #[arg(long)]
    ii: Option<u32>,

    /// Largest initiation interval tried for loops.
    #[arg(long, default_value_t = 16)]
    max_ii: u32,

    /// Let operands read results directly from function units.
    #[arg(long, action = ArgAction::SetTrue)]
    bypass: bool,

    /// Do not mirror the first loop stage into a prolog.
    #[arg(long, action = ArgAction::SetTrue)]
    no_prolog: bool,

    /// Do not insert connectivity copies before scheduling.
    #[arg(long, action = ArgAction::SetTrue)]
    no_copies: bool,

    /// Log the dependence graph of every block at debug level.
    #[arg(long, action = ArgAction::SetTrue)]
    dot: bool,

    /// Print session statistics to standard error.
    #[arg(long, action = ArgAction::SetTrue)]
    stats: bool,
}

impl Arguments {
    fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            bypass: self.bypass,
            initiation_interval: self.ii,
            max_ii: self.max_ii,
            copy_adder: !self.no_copies,
            loop_prolog: !self.no_prolog,
            dot_dumps: self.dot,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Arguments::parse();

    let text = match &args.listing {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let machine = presets::by_name(&args.machine)?;
    let procedures = parse_listing(&text, &machine)?;
    let options = args.options();
    let mut session = SchedulingSession::new();

    for procedure in &procedures {
        match schedule_procedure(&machine, procedure, args.scheduler.into(), &options, &mut session) {
            Ok(scheduled) => print!("{}", print_schedule(&machine, &scheduled)),
            Err(e) => {
                eprintln!("Error: {}: {}", procedure.name, e);
                std::process::exit(1);
            }
        }
    }
    if args.stats {
        eprint!("{}", session.stats());
    }
    Ok(())
}
