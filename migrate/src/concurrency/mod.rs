//! Cancellation and signalling primitives shared by the scheduler and stage workers.
//!
//! Cancellation is cooperative: a single [`shutdown::ShutdownTx`] is owned by the
//! orchestrator and every worker holds a [`shutdown::ShutdownRx`] that it checks at its own
//! suspension points.

pub mod shutdown;
pub mod signal;
