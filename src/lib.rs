//! ttasched - instruction scheduling for Transport-Triggered Architectures.
//!
//! A TTA program is a sequence of moves between function unit ports,
//! register files and immediates; an operation runs when its trigger operand
//! is written. This crate places every move of a procedure in a cycle and on a
//! bus of a target machine, respecting data dependences, operation latencies,
//! port and bus occupancy and the interconnect.
//!
//! # Primary Usage
//!
//! ```ignore
//! use ttasched::core::SchedulingSession;
//! use ttasched::listing::{parse_listing, print_schedule};
//! use ttasched::machine::presets;
//! use ttasched::scheduler::{schedule_procedure, SchedulerKind, SchedulerOptions};
//!
//! let machine = presets::minimal()?;
//! let procedures = parse_listing(&text, &machine)?;
//! let mut session = SchedulingSession::new();
//! for procedure in &procedures {
//!     let scheduled = schedule_procedure(
//!         &machine,
//!         procedure,
//!         SchedulerKind::List,
//!         &SchedulerOptions::default(),
//!         &mut session,
//!     )?;
//!     println!("{}", print_schedule(&machine, &scheduled));
//! }
//! ```
//!
//! # Architecture
//!
//! - [`machine`] - Target processor model and connectivity queries
//! - [`program`] - Terminals, moves, blocks, scheduled instructions
//! - [`ddg`] - Data dependence graph, bypassing, renaming, verification
//! - [`resource`] - Per-cycle occupancy and placement
//! - [`scheduler`] - Copy insertion and the block schedulers
//! - [`listing`] - Textual move listings
//! - [`core`] - Errors, session state, register sets

pub mod core;
pub mod ddg;
pub mod listing;
pub mod machine;
pub mod program;
pub mod resource;
pub mod scheduler;

pub use core::{ScheduleResult, SchedulerError, SchedulingSession, SessionStats};
pub use ddg::{DataDependenceGraph, DdgBuilder};
pub use machine::{Machine, MachineBuilder};
pub use resource::SimpleResourceManager;
pub use scheduler::{schedule_procedure, SchedulerKind, SchedulerOptions};
