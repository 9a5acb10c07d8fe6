//! Thin wrappers around Linux kernel primitives.
//!
//! Outside this module, raw syscalls are limited to the pre-exec hook
//! (`exec::preexec`, installed by the executor), fd-relative removal in
//! `safety::purge`, and the binary's signal handlers.
//! Dependency direction: identity, signal -> accounting -> procfs, cgroup

pub mod accounting;
pub mod cgroup;
pub mod identity;
pub mod procfs;
pub mod signal;
