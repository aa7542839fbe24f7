//! Subprocess supervision (spec.md §4.B).

/// Pipe construction and child-exit reporting.
pub mod supervisor;

pub use supervisor::{pipe, run_and_report, run_and_report_duplex, run_and_report_piped, CmdExit, Supervised};
