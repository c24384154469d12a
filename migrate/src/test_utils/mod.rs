//! In-process fakes of the systems a migration talks to, and helpers to drive runs in tests.
//!
//! [`run::TestRun`] wires every fake into a [`crate::orchestrator::RunContext`] and keeps a
//! handle on each of them, so tests can script replies before a stage runs and inspect the calls
//! it made afterwards.

pub mod cloud;
pub mod failpoints;
pub mod frontend;
pub mod helper;
pub mod notify;
pub mod run;
pub mod source;
pub mod tool;
