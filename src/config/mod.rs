//! Configuration and shared types
//!
//! Harness settings, resource profiles, and the submission/result contract.

pub mod harness;
pub mod limits;
pub mod types;
