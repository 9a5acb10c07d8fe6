//! Result normalization
//!
//! Derives the caller-facing result as a pure function of what the executor
//! observed.

pub mod collector;
