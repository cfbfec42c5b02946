//! Root of the `shipsec-core` library: the component execution runtime.
//!
//! Given a scheduled node activity, this crate resolves the component from
//! the process-wide registry, dispatches its runner (inline, container or
//! remote), isolates container inputs behind per-run volumes, relays
//! stdout/stderr/PTY output as ordered terminal chunks, ingests the
//! structured result and applies the retry/timeout taxonomy.

// Prevent accidental direct writes to stdout/stderr in library code. All
// operator-visible output must go through the tracing stack or the
// telemetry collectors.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod activity;
pub mod builtins;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
mod flags;
pub mod registry;
pub mod runner;
pub mod secrets;
pub mod terminal;
pub mod util;
pub mod volume;

pub use error::Result;
pub use error::ShipsecErr;
