//! runbox: a sandboxed code-execution harness
//!
//! Accepts source code in one of several registered languages, builds and runs
//! it in a disposable workspace under kernel-enforced isolation and resource
//! limits, and returns a normalized result.
//!
//! # Architecture
//!
//! ## Configuration ([`config`])
//! - [`config::harness`]: process-wide settings loaded from JSON
//! - [`config::limits`]: resource profiles and caller overrides
//! - [`config::types`]: the submission/result contract and error types
//!
//! ## Runtime Registry ([`runtime`])
//! - [`runtime::environment`]: per-language build/run recipes and entry point rules
//! - [`runtime::registry`]: read-only lookup by language identifier or alias
//!
//! ## Workspaces ([`safety`])
//! - [`safety::workspace`]: per-submission directories, staging and teardown
//! - [`safety::purge`]: symlink-safe recursive removal
//! - [`safety::janitor`]: background retries for removals that failed
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: cgroup v2 scopes (limits, accounting, group kill)
//! - [`kernel::procfs`]: session accounting when cgroups are unavailable
//! - [`kernel::signal`]: process-group signalling and reaping
//! - [`kernel::identity`]: per-slot sandbox uid/gid
//!
//! ## Execution Control ([`exec`])
//! - [`exec::preexec`]: type-state ordered isolation applied between fork and exec
//! - [`exec::limiter`]: external supervision of wall, CPU, memory and process limits
//! - [`exec::executor`]: build/run sequencing inside the sandbox
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::collector`]: pure normalization into an [`ExecutionResult`]
//!
//! ## Dispatch ([`core`])
//! - [`core::pool`]: bounded FIFO slot pool
//! - [`core::lifecycle`]: per-submission state machine
//! - [`core::dispatcher`]: the `submit` entry point
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured audit events
//! - [`observability::metrics`]: counters and Prometheus export

// Configuration & Contract
pub mod config;

// Runtime Registry
pub mod runtime;

// Workspaces & Cleanup
pub mod safety;

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Verdict
pub mod verdict;

// Dispatch
pub mod core;

// Observability
pub mod observability;

// Utilities
pub mod utils;

// Operator CLI wiring for the runbox binary
pub mod cli;

pub use crate::config::harness::HarnessConfig;
pub use crate::config::limits::{LimitOverride, ResourceLimits, ResourceOverride, ResourceProfile};
pub use crate::config::types::*;
pub use crate::core::dispatcher::{Dispatcher, JobHandle};
pub use crate::runtime::registry::RuntimeRegistry;
