//! Execution control
//!
//! Turns a staged workspace into supervised sandbox processes: the pre-exec
//! isolation plan, the resource limiter, and the executor that sequences the
//! build and run steps.

pub mod executor;
pub mod limiter;
pub mod preexec;
