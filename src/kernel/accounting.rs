/// Host-side resource accounting for one sandbox step
///
/// The limiter only trusts what the kernel reports about a sandbox. Two backends
/// implement this trait: a per-step cgroup v2 scope, and procfs polling of the
/// sandbox session when no delegated cgroup is available.
use std::time::Duration;

/// One observation of a sandbox's resource usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSample {
    /// Memory charged right now
    pub memory_bytes: u64,
    /// Highest charge observed by the backend so far
    pub peak_memory_bytes: u64,
    /// Live tasks in the sandbox
    pub processes: u32,
    /// User plus system time consumed by every member, including reaped ones
    pub cpu_time: Duration,
    /// The kernel OOM killer fired inside the sandbox
    pub oom_killed: bool,
    /// A fork was refused by the process-count ceiling
    pub fork_refused: bool,
}

pub trait Accounting: Send {
    fn backend_name(&self) -> &'static str;

    fn sample(&mut self) -> UsageSample;

    /// SIGKILL every remaining member.
    fn kill_all(&mut self);

    /// No live member remains.
    fn is_empty(&mut self) -> bool;

    /// The memory ceiling is enforced by the kernel rather than by polling.
    fn enforces_memory(&self) -> bool;
}
