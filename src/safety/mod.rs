//! Safety and cleanup
//!
//! Workspace lifecycle, symlink-safe tree removal, and deferred cleanup retries.

pub mod janitor;
pub mod purge;
pub mod workspace;
