/// Resource limiter
///
/// Supervises one running sandbox step from the host side. Limits are enforced
/// from what the accounting backend and `wait4` report, never from anything the
/// workload says about itself.
///
/// Escalation:
/// - wall clock or submission deadline: SIGTERM to the group, SIGKILL after the
///   grace period, so a step never outlives `limit + grace`
/// - memory, process count or CPU time: immediate SIGKILL
/// - after the leader exits, every straggler is killed before returning
use crate::kernel::accounting::{Accounting, UsageSample};
use crate::kernel::signal::{self, KillReport, Reaped};
use nix::unistd::Pid;
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};

/// Which limit ended a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitBreach {
    WallClock,
    /// The submission's absolute deadline, shorter than the step's wall limit
    Deadline,
    CpuTime,
    Memory,
    ProcessCount,
}

impl LimitBreach {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitBreach::WallClock => "wall_clock",
            LimitBreach::Deadline => "deadline",
            LimitBreach::CpuTime => "cpu_time",
            LimitBreach::Memory => "memory",
            LimitBreach::ProcessCount => "process_count",
        }
    }

    /// Breaches reported as `ResourceExceeded` rather than `TimedOut`
    pub fn is_resource(self) -> bool {
        matches!(self, LimitBreach::Memory | LimitBreach::ProcessCount)
    }

    fn graceful(self) -> bool {
        matches!(self, LimitBreach::WallClock | LimitBreach::Deadline)
    }
}

impl std::fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits for one supervised step
#[derive(Debug, Clone, Copy)]
pub struct StepLimits {
    pub wall_time: Duration,
    /// `wall_time` was shortened to the submission deadline
    pub deadline_bound: bool,
    pub cpu_time: Duration,
    pub memory_bytes: u64,
    pub max_processes: u32,
}

/// What the limiter observed
#[derive(Debug, Clone)]
pub struct Supervision {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub breach: Option<LimitBreach>,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub peak_memory: Option<u64>,
    /// Most live sandbox processes seen in one sample
    pub peak_processes: u32,
    pub kill: Option<KillReport>,
}

impl Supervision {
    fn failed(&self) -> bool {
        self.signal.is_some() || self.exit_code != Some(0)
    }
}

/// What shells and libc print when `fork` fails with EAGAIN
const FORK_REFUSED_MARKERS: [&str; 3] = ["Resource temporarily unavailable", "Cannot fork", "fork: retry"];

/// `RLIMIT_NPROC` refuses forks without leaving a kernel-side record. A failed
/// step that filled the process ceiling, or whose stderr reports a refused
/// fork, hit that limit.
pub fn nproc_refused(supervision: &Supervision, limits: &StepLimits, stderr: &str) -> bool {
    supervision.breach.is_none()
        && supervision.failed()
        && (supervision.peak_processes >= limits.max_processes
            || FORK_REFUSED_MARKERS.iter().any(|marker| stderr.contains(marker)))
}

pub struct ResourceLimiter {
    grace: Duration,
    poll_interval: Duration,
}

impl ResourceLimiter {
    pub fn new(grace: Duration, poll_interval: Duration) -> Self {
        ResourceLimiter {
            grace,
            poll_interval,
        }
    }

    fn check(&self, limits: &StepLimits, sample: &UsageSample, elapsed: Duration, polices_memory: bool) -> Option<LimitBreach> {
        if sample.oom_killed || (polices_memory && sample.memory_bytes > limits.memory_bytes) {
            return Some(LimitBreach::Memory);
        }
        if sample.fork_refused || sample.processes > limits.max_processes {
            return Some(LimitBreach::ProcessCount);
        }
        if sample.cpu_time >= limits.cpu_time {
            return Some(LimitBreach::CpuTime);
        }
        if elapsed >= limits.wall_time {
            return Some(if limits.deadline_bound {
                LimitBreach::Deadline
            } else {
                LimitBreach::WallClock
            });
        }
        None
    }

    /// Supervise `leader` until it exits or is killed, then clear the sandbox.
    ///
    /// `started` is taken right after spawn. On return the leader is reaped and
    /// the accounting group is empty (or the straggler wait timed out, which is
    /// logged).
    pub fn supervise(
        &self,
        leader: Pid,
        started: Instant,
        limits: &StepLimits,
        accounting: &mut dyn Accounting,
    ) -> std::result::Result<Supervision, String> {
        let polices_memory = !accounting.enforces_memory();
        let mut peak = 0u64;
        let mut processes = 0u32;
        let mut cpu = Duration::ZERO;
        let mut breach = None;
        let mut kill = None;

        let reaped = loop {
            if let Some(reaped) = signal::try_reap(leader).map_err(|e| format!("wait4({leader}) failed: {e}"))? {
                break reaped;
            }

            let sample = accounting.sample();
            peak = peak.max(sample.peak_memory_bytes);
            processes = processes.max(sample.processes);
            cpu = cpu.max(sample.cpu_time);

            if let Some(found) = self.check(limits, &sample, started.elapsed(), polices_memory) {
                breach = Some(found);
                let (report, reaped) = self.terminate(leader, found, accounting)?;
                kill = Some(report);
                break reaped;
            }

            let remaining = limits.wall_time.saturating_sub(started.elapsed());
            thread::sleep(self.poll_interval.min(remaining).max(Duration::from_millis(1)));
        };
        let wall_time = started.elapsed();

        // Final look: the kernel may have acted between the last poll and exit.
        let sample = accounting.sample();
        peak = peak.max(sample.peak_memory_bytes).max(reaped.max_rss_bytes);
        processes = processes.max(sample.processes);
        cpu = cpu.max(sample.cpu_time).max(reaped.cpu_time);
        if breach.is_none() {
            breach = if sample.oom_killed {
                Some(LimitBreach::Memory)
            } else if sample.fork_refused {
                Some(LimitBreach::ProcessCount)
            } else if reaped.state.signal == Some(libc::SIGXCPU) {
                Some(LimitBreach::CpuTime)
            } else {
                None
            };
        }

        self.clear_stragglers(leader, accounting);

        Ok(Supervision {
            exit_code: reaped.state.exit_code,
            signal: reaped.state.signal,
            breach,
            wall_time,
            cpu_time: cpu,
            peak_memory: (peak > 0).then_some(peak),
            peak_processes: processes,
            kill,
        })
    }

    fn terminate(
        &self,
        leader: Pid,
        breach: LimitBreach,
        accounting: &mut dyn Accounting,
    ) -> std::result::Result<(KillReport, Reaped), String> {
        log::info!("Terminating sandbox {} on {} limit", leader, breach);
        let mut reaped = None;
        let mut wait_error = None;

        let report = if breach.graceful() {
            signal::terminate_group(leader, self.grace, || {
                if reaped.is_none() && wait_error.is_none() {
                    match signal::try_reap(leader) {
                        Ok(found) => reaped = found,
                        Err(e) => wait_error = Some(e),
                    }
                }
                reaped.is_some() || wait_error.is_some()
            })
        } else {
            let started = Instant::now();
            let kill_sent = signal::kill_group(leader);
            KillReport {
                pid: leader.as_raw(),
                term_sent: false,
                kill_sent,
                waited_ms: started.elapsed().as_millis() as u64,
                notes: Vec::new(),
            }
        };
        accounting.kill_all();

        if let Some(e) = wait_error {
            return Err(format!("wait4({leader}) failed: {e}"));
        }
        let reaped = match reaped {
            Some(reaped) => reaped,
            None => signal::reap_blocking(leader).map_err(|e| format!("wait4({leader}) failed: {e}"))?,
        };
        Ok((report, reaped))
    }

    fn clear_stragglers(&self, leader: Pid, accounting: &mut dyn Accounting) {
        if accounting.is_empty() {
            return;
        }
        log::debug!("Killing processes left behind by {}", leader);
        let deadline = Instant::now() + self.grace;
        loop {
            accounting.kill_all();
            if accounting.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "Processes of sandbox {} still present after {:?} ({} accounting)",
                    leader,
                    self.grace,
                    accounting.backend_name()
                );
                return;
            }
            thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> StepLimits {
        StepLimits {
            wall_time: Duration::from_secs(2),
            deadline_bound: false,
            cpu_time: Duration::from_secs(1),
            memory_bytes: 64 * 1024 * 1024,
            max_processes: 4,
        }
    }

    fn limiter() -> ResourceLimiter {
        ResourceLimiter::new(Duration::from_millis(100), Duration::from_millis(10))
    }

    #[test]
    fn test_quiet_sample_has_no_breach() {
        let sample = UsageSample {
            memory_bytes: 1024,
            processes: 1,
            ..UsageSample::default()
        };
        assert_eq!(limiter().check(&limits(), &sample, Duration::from_millis(5), true), None);
    }

    #[test]
    fn test_memory_is_polled_only_without_kernel_enforcement() {
        let sample = UsageSample {
            memory_bytes: 128 * 1024 * 1024,
            ..UsageSample::default()
        };
        assert_eq!(
            limiter().check(&limits(), &sample, Duration::ZERO, true),
            Some(LimitBreach::Memory)
        );
        assert_eq!(limiter().check(&limits(), &sample, Duration::ZERO, false), None);

        let oom = UsageSample {
            oom_killed: true,
            ..UsageSample::default()
        };
        assert_eq!(
            limiter().check(&limits(), &oom, Duration::ZERO, false),
            Some(LimitBreach::Memory)
        );
    }

    #[test]
    fn test_process_and_cpu_breaches() {
        let crowded = UsageSample {
            processes: 5,
            ..UsageSample::default()
        };
        assert_eq!(
            limiter().check(&limits(), &crowded, Duration::ZERO, true),
            Some(LimitBreach::ProcessCount)
        );
        let busy = UsageSample {
            cpu_time: Duration::from_secs(1),
            ..UsageSample::default()
        };
        assert_eq!(
            limiter().check(&limits(), &busy, Duration::ZERO, true),
            Some(LimitBreach::CpuTime)
        );
    }

    #[test]
    fn test_wall_breach_names_the_deadline_when_bound_by_it() {
        let mut bounded = limits();
        bounded.deadline_bound = true;
        let sample = UsageSample::default();
        assert_eq!(
            limiter().check(&limits(), &sample, Duration::from_secs(2), true),
            Some(LimitBreach::WallClock)
        );
        assert_eq!(
            limiter().check(&bounded, &sample, Duration::from_secs(2), true),
            Some(LimitBreach::Deadline)
        );
    }

    #[test]
    fn test_resource_breaches_are_not_timeouts() {
        assert!(LimitBreach::Memory.is_resource());
        assert!(LimitBreach::ProcessCount.is_resource());
        assert!(!LimitBreach::CpuTime.is_resource());
        assert!(!LimitBreach::Deadline.is_resource());
        assert_eq!(LimitBreach::WallClock.to_string(), "wall_clock");
    }

    fn supervision(exit_code: Option<i32>, peak_processes: u32) -> Supervision {
        Supervision {
            exit_code,
            signal: None,
            breach: None,
            wall_time: Duration::from_millis(20),
            cpu_time: Duration::ZERO,
            peak_memory: None,
            peak_processes,
            kill: None,
        }
    }

    #[test]
    fn test_refused_fork_under_nproc_is_a_process_breach() {
        // Full ceiling and a failure: the fork limit was hit.
        assert!(nproc_refused(&supervision(Some(2), 4), &limits(), ""));
        // A shell reporting the refused fork, even if polling missed the peak.
        assert!(nproc_refused(&supervision(Some(2), 2), &limits(), "sh: 1: Cannot fork\n"));
        assert!(nproc_refused(
            &supervision(Some(1), 1),
            &limits(),
            "bash: fork: retry: Resource temporarily unavailable"
        ));
    }

    #[test]
    fn test_ordinary_failures_are_not_fork_refusals() {
        assert!(!nproc_refused(&supervision(Some(1), 2), &limits(), "segfault"));
        assert!(!nproc_refused(&supervision(Some(0), 4), &limits(), "Cannot fork"));
        let mut timed_out = supervision(None, 4);
        timed_out.signal = Some(libc::SIGKILL);
        timed_out.breach = Some(LimitBreach::WallClock);
        assert!(!nproc_refused(&timed_out, &limits(), ""));
    }
}
