// This module provides per-procedure scheduling session state. SchedulingSession is the
// explicit context object the schedulers thread through a run: it owns the bookkeeping
// map from loop-body move nodes to their prolog copies (which must not be global so that
// several procedures can be scheduled independently or re-entrantly) and collects
// scheduling statistics. SessionStats tracks the number of procedures and moves
// scheduled, the inserted connectivity copies, accepted bypasses, the initiation
// intervals tried and found, jump guards added, and the length of the longest schedule.
// Statistics live in a RefCell so that read-only passes can record events.

//! Scheduling session management.
//!
//! One session per scheduling pass. State that used to be process-wide (the
//! original to prolog move map) lives here instead.

use crate::program::NodeId;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Per-pass scheduling session.
#[derive(Debug, Default)]
pub struct SchedulingSession {
    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,

    /// Loop-body node to its prolog copy.
    prolog_moves: HashMap<NodeId, NodeId>,

    /// Procedure currently being scheduled.
    current_procedure: Option<String>,
}

impl SchedulingSession {
    /// Create a new, empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the procedure being scheduled.
    pub fn set_current_procedure(&mut self, name: &str) {
        self.current_procedure = Some(name.to_string());
    }

    pub fn current_procedure(&self) -> Option<&str> {
        self.current_procedure.as_deref()
    }

    /// Register the prolog copy of a loop-body node.
    pub fn set_prolog_move(&mut self, original: NodeId, prolog: NodeId) {
        self.prolog_moves.insert(original, prolog);
    }

    /// Prolog copy of a loop-body node, if one was created.
    pub fn prolog_move(&self, original: NodeId) -> Option<NodeId> {
        self.prolog_moves.get(&original).copied()
    }

    /// Forget the prolog copy of a node. Returns the copy that was registered.
    pub fn remove_prolog_move(&mut self, original: NodeId) -> Option<NodeId> {
        self.prolog_moves.remove(&original)
    }

    pub fn prolog_move_count(&self) -> usize {
        self.prolog_moves.len()
    }

    /// Clear per-procedure state before scheduling the next procedure.
    pub fn clear_procedure_state(&mut self) {
        self.prolog_moves.clear();
        self.current_procedure = None;
    }

    /// Record that a procedure or loop body was scheduled.
    pub fn record_region_scheduled(&self, name: &str, moves: usize, cycles: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.regions_scheduled += 1;
        stats.moves_scheduled += moves;
        if stats.longest_schedule < cycles {
            stats.longest_schedule = cycles;
            stats.longest_region_name = name.to_string();
        }
    }

    /// Record inserted connectivity copies.
    pub fn record_copies_added(&self, count: usize) {
        self.stats.borrow_mut().copies_added += count;
    }

    /// Record a software bypass that survived scheduling.
    pub fn record_bypass(&self) {
        self.stats.borrow_mut().bypasses += 1;
    }

    /// Record an initiation interval attempt and whether it succeeded.
    pub fn record_ii_attempt(&self, ii: u32, success: bool) {
        let mut stats = self.stats.borrow_mut();
        stats.ii_attempts += 1;
        if success {
            stats.found_ii = Some(ii);
        }
    }

    /// Record a jump guard added to a speculated loop move.
    pub fn record_jump_guard(&self) {
        self.stats.borrow_mut().jump_guards += 1;
    }

    /// Get scheduling statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Scheduling session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of procedures or loop bodies scheduled.
    pub regions_scheduled: usize,

    /// Number of moves placed.
    pub moves_scheduled: usize,

    /// Connectivity register copies inserted.
    pub copies_added: usize,

    /// Software bypasses kept.
    pub bypasses: usize,

    /// Initiation intervals tried.
    pub ii_attempts: usize,

    /// Last initiation interval that scheduled successfully.
    pub found_ii: Option<u32>,

    /// Jump guards added.
    pub jump_guards: usize,

    /// Length of the longest schedule (cycles).
    pub longest_schedule: usize,

    /// Name of the region with the longest schedule.
    pub longest_region_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scheduling Session Statistics:")?;
        writeln!(f, "  Regions scheduled: {}", self.regions_scheduled)?;
        writeln!(f, "  Moves scheduled: {}", self.moves_scheduled)?;
        writeln!(f, "  Copies added: {}", self.copies_added)?;
        writeln!(f, "  Bypasses: {}", self.bypasses)?;
        writeln!(f, "  Jump guards: {}", self.jump_guards)?;
        if self.ii_attempts > 0 {
            writeln!(f, "  II attempts: {}", self.ii_attempts)?;
        }
        if let Some(ii) = self.found_ii {
            writeln!(f, "  Initiation interval: {}", ii)?;
        }
        if !self.longest_region_name.is_empty() {
            writeln!(
                f,
                "  Longest schedule: {} ({} cycles)",
                self.longest_region_name, self.longest_schedule
            )?;
        }
        Ok(())
    }
}
