//! # sluice-validation
//!
//! Resolution of file arguments before a tool runs.
//!
//! Callers routinely omit file arguments, pass placeholders, or name a file
//! that was moved. [`InputResolver`] works through the caller's value, the
//! session's last dataset and a bounded fuzzy search, then checks the file
//! can be read and has the expected shape. Every rejection carries a
//! concrete next step for the end user.

mod outcome;
mod resolver;
pub mod tabular;

pub use outcome::{InputKind, ValidationOutcome, ValidationStage};
pub use resolver::{is_plausible_value, InputResolver};
pub use tabular::{inspect_tabular, TabularSummary};
