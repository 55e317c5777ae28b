//! Core library of the WDL runner conformance harness: the typed output
//! comparator, runner command adapters, process execution, suite
//! configuration, and the single-test state machine. The `wdlconf` binary
//! layers scheduling and reporting on top.

pub mod compare;
pub mod config;
pub mod deps;
pub mod exec;
pub mod fixtures;
pub mod result;
pub mod runner;
pub mod types;
pub mod unit;
pub mod util;
