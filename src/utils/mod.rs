//! Utilities
//!
//! Bounded capture of sandbox output streams.

pub mod output;
