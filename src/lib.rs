//! stratforge: turns a trading strategy written in prose or in a foreign
//! scripting dialect into a validated, compiled and sandboxed backtest.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`]. The [`worker`] module is the
//! child-process side of the sandbox.

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
pub mod worker;
