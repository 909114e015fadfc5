// This module serves as the hub for the scheduler's shared infrastructure: the error
// taxonomy used by every subsystem, the per-pass scheduling session that carries the
// original-to-prolog move map and statistics, and the register bit set used for
// reserved registers and scratch pools.

//! Core scheduler infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - `SchedulerError` with precondition, machine insufficiency, scheduling
//!   failure and internal invariant classes
//!
//! ## Session (`session`)
//! - Per-pass state replacing process-wide maps
//! - Scheduling statistics
//!
//! ## Register sets (`register_set`)
//! - Bitset tracking of physical registers across register files

pub mod error;
pub mod register_set;
pub mod session;

pub use error::{ScheduleResult, SchedulerError};
pub use register_set::RegisterSet;
pub use session::{SchedulingSession, SessionStats};
