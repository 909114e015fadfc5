// This module reads and writes the textual move listing used by the driver and the
// integration tests. A listing holds one or more procedures; each procedure is a list of
// labelled basic blocks and every line of a block is one instruction made of comma
// separated moves. Terminals name registers (RF.3), inline immediates (#5), operation
// operands with or without a bound unit (add.1, ALU.add.1), the return address (ra),
// block addresses (@loop) and data addresses (&64). Blocks marked `loop` are single
// block loops and go to the modulo scheduler. The printer writes the unscheduled form
// back and renders scheduled procedures with their kernels and prologs.

//! Textual move listings.
//!
//! ```text
//! ; comment
//! proc main {
//! entry:
//!     #5 -> RF.1
//!     RF.1 -> add.1, RF.2 -> add.2
//!     ?BOOL.0 add.3 -> RF.3
//! body: loop
//!     @body -> jump.1
//! }
//! ```
//!
//! Moves sharing a line keep their left to right order: a move sees every
//! register written by the moves before it, on its line or above.

pub mod parser;
pub mod printer;

pub use parser::parse_listing;
pub use printer::{print_procedure, print_schedule};
