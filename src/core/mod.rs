//! Submission dispatch
//!
//! The bounded slot pool, the per-submission lifecycle, and the dispatcher
//! that ties them to the workspace manager, executor and collector.

pub mod dispatcher;
pub mod lifecycle;
pub mod pool;
