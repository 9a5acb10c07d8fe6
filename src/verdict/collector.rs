/// Result collection
///
/// Pure normalization of a raw executor outcome into the immutable
/// `ExecutionResult`. No side effects and no failure modes: anything the
/// classifier cannot make sense of becomes `InternalError`.
use crate::config::limits::ResourceProfile;
use crate::config::types::{ExecutionResult, ExecutionStatus};
use crate::exec::executor::{RawExecutionOutcome, StepOutcome};
use crate::exec::limiter::LimitBreach;
use crate::runtime::environment::EnvironmentDefinition;
use nix::sys::signal::Signal;

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signal}"))
}

fn millis(step: &StepOutcome) -> u64 {
    step.wall_time.as_millis() as u64
}

/// Stateless classifier
pub struct ResultCollector;

impl ResultCollector {
    pub fn collect(
        outcome: &RawExecutionOutcome,
        profile: &ResourceProfile,
        environment: &EnvironmentDefinition,
    ) -> ExecutionResult {
        match outcome {
            RawExecutionOutcome::StartupFailed { stage, reason } => ExecutionResult::without_output(
                ExecutionStatus::SandboxStartupFailed,
                0,
                format!("{stage} sandbox failed to start: {reason}"),
            ),
            RawExecutionOutcome::BuildFailed { build } => Self::classify_build(build),
            RawExecutionOutcome::Ran { build, run } => {
                let build_millis = build.as_ref().map(millis).unwrap_or(0);
                let mut result = Self::classify_run(run, profile, environment);
                result.elapsed_millis += build_millis;
                result
            }
        }
    }

    fn from_step(step: &StepOutcome, status: ExecutionStatus, detail: Option<String>) -> ExecutionResult {
        ExecutionResult {
            status,
            exit_code: step.exit_code,
            stdout: step.stdout.clone(),
            stderr: step.stderr.clone(),
            elapsed_millis: millis(step),
            peak_memory_bytes: step.peak_memory,
            detail,
        }
    }

    fn classify_build(build: &StepOutcome) -> ExecutionResult {
        let (status, detail) = match (build.breach, build.exit_code, build.signal) {
            (Some(LimitBreach::Deadline), _, _) => (
                ExecutionStatus::TimedOut,
                "submission deadline reached during build".to_string(),
            ),
            (Some(breach), _, _) => (
                ExecutionStatus::BuildFailed,
                format!("build exceeded its {breach} limit"),
            ),
            (None, _, Some(signal)) => (
                ExecutionStatus::BuildFailed,
                format!("build killed by {}", signal_name(signal)),
            ),
            (None, Some(code), None) if code != 0 => (
                ExecutionStatus::BuildFailed,
                format!("build exited with status {code}"),
            ),
            _ => (
                ExecutionStatus::InternalError,
                "build reported as failed without a failure".to_string(),
            ),
        };
        Self::from_step(build, status, Some(detail))
    }

    fn classify_run(
        run: &StepOutcome,
        profile: &ResourceProfile,
        environment: &EnvironmentDefinition,
    ) -> ExecutionResult {
        if let Some(breach) = run.breach {
            let status = if breach.is_resource() {
                ExecutionStatus::ResourceExceeded
            } else {
                ExecutionStatus::TimedOut
            };
            let detail = match breach {
                LimitBreach::Deadline => "submission deadline reached".to_string(),
                other => format!("{other} limit exceeded"),
            };
            return Self::from_step(run, status, Some(detail));
        }

        match (run.exit_code, run.signal) {
            (Some(0), None) => Self::from_step(run, ExecutionStatus::Success, None),
            (code, signal) if code.is_some() || signal.is_some() => {
                let failure = match signal {
                    Some(signal) => format!("killed by {}", signal_name(signal)),
                    None => format!("exited with status {}", code.unwrap_or_default()),
                };

                let ceiling = profile.run.memory_bytes;
                let at_ceiling = run.peak_memory.is_some_and(|peak| peak >= ceiling);
                // A refused allocation under RLIMIT_AS leaves RSS far below the
                // ceiling; the program typically crashes on the null pointer or aborts.
                let address_space_exhausted = run.address_space_limit.is_some()
                    && (matches!(signal, Some(libc::SIGSEGV) | Some(libc::SIGABRT))
                        || run.peak_memory.is_some_and(|peak| peak >= ceiling - ceiling / 4));
                let stderr = run.stderr.text();
                let marker = environment
                    .oom_markers
                    .iter()
                    .find(|marker| stderr.contains(marker.as_str()));

                if signal == Some(libc::SIGXFSZ) {
                    Self::from_step(
                        run,
                        ExecutionStatus::ResourceExceeded,
                        Some(format!("file size limit exceeded ({failure})")),
                    )
                } else if let Some(marker) = marker {
                    Self::from_step(
                        run,
                        ExecutionStatus::ResourceExceeded,
                        Some(format!("out of memory: {marker}")),
                    )
                } else if at_ceiling {
                    Self::from_step(
                        run,
                        ExecutionStatus::ResourceExceeded,
                        Some(format!("memory ceiling reached ({failure})")),
                    )
                } else if address_space_exhausted {
                    Self::from_step(
                        run,
                        ExecutionStatus::ResourceExceeded,
                        Some(format!("address space limit reached ({failure})")),
                    )
                } else {
                    Self::from_step(run, ExecutionStatus::RuntimeError, Some(failure))
                }
            }
            _ => Self::from_step(
                run,
                ExecutionStatus::InternalError,
                Some("run step ended without an exit status".to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::CapturedStream;
    use crate::exec::executor::Stage;
    use crate::runtime::languages;
    use std::time::Duration;

    fn step(stage: Stage, exit_code: Option<i32>, signal: Option<i32>) -> StepOutcome {
        StepOutcome {
            stage,
            exit_code,
            signal,
            breach: None,
            stdout: CapturedStream {
                bytes: b"out".to_vec(),
                truncated: false,
            },
            stderr: CapturedStream::default(),
            wall_time: Duration::from_millis(40),
            cpu_time: Duration::from_millis(10),
            peak_memory: Some(1024 * 1024),
            address_space_limit: None,
            kill: None,
        }
    }

    fn collect(outcome: RawExecutionOutcome) -> ExecutionResult {
        let env = languages::java::definition();
        ResultCollector::collect(&outcome, &env.defaults, &env)
    }

    #[test]
    fn test_clean_run_is_success() {
        let result = collect(RawExecutionOutcome::Ran {
            build: Some(step(Stage::Build, Some(0), None)),
            run: step(Stage::Run, Some(0), None),
        });
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.bytes, b"out");
        assert_eq!(result.elapsed_millis, 80);
        assert_eq!(result.detail, None);
    }

    #[test]
    fn test_build_failure_keeps_diagnostics() {
        let mut build = step(Stage::Build, Some(1), None);
        build.stderr.bytes = b"Main.java:3: error: ';' expected".to_vec();
        let result = collect(RawExecutionOutcome::BuildFailed { build });
        assert_eq!(result.status, ExecutionStatus::BuildFailed);
        assert!(result.stderr.text().contains("';' expected"));
        assert_eq!(result.exit_code, Some(1));
    }

    #[test]
    fn test_build_timeout_is_a_build_failure_but_deadline_is_not() {
        let mut build = step(Stage::Build, None, Some(libc::SIGKILL));
        build.breach = Some(LimitBreach::WallClock);
        let result = collect(RawExecutionOutcome::BuildFailed { build: build.clone() });
        assert_eq!(result.status, ExecutionStatus::BuildFailed);

        build.breach = Some(LimitBreach::Deadline);
        let result = collect(RawExecutionOutcome::BuildFailed { build });
        assert_eq!(result.status, ExecutionStatus::TimedOut);
    }

    #[test]
    fn test_breaches_map_to_statuses() {
        let cases = [
            (LimitBreach::WallClock, ExecutionStatus::TimedOut),
            (LimitBreach::CpuTime, ExecutionStatus::TimedOut),
            (LimitBreach::Deadline, ExecutionStatus::TimedOut),
            (LimitBreach::Memory, ExecutionStatus::ResourceExceeded),
            (LimitBreach::ProcessCount, ExecutionStatus::ResourceExceeded),
        ];
        for (breach, expected) in cases {
            let mut run = step(Stage::Run, None, Some(libc::SIGKILL));
            run.breach = Some(breach);
            let result = collect(RawExecutionOutcome::Ran { build: None, run });
            assert_eq!(result.status, expected, "{breach}");
        }
    }

    #[test]
    fn test_nonzero_exit_is_runtime_error() {
        let result = collect(RawExecutionOutcome::Ran {
            build: None,
            run: step(Stage::Run, Some(1), None),
        });
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert_eq!(result.detail.as_deref(), Some("exited with status 1"));

        let result = collect(RawExecutionOutcome::Ran {
            build: None,
            run: step(Stage::Run, None, Some(libc::SIGSEGV)),
        });
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert_eq!(result.detail.as_deref(), Some("killed by SIGSEGV"));
    }

    #[test]
    fn test_oom_marker_and_ceiling_mean_resource_exceeded() {
        let mut run = step(Stage::Run, Some(1), None);
        run.stderr.bytes = b"Exception in thread \"main\" java.lang.OutOfMemoryError: Java heap space".to_vec();
        let result = collect(RawExecutionOutcome::Ran { build: None, run });
        assert_eq!(result.status, ExecutionStatus::ResourceExceeded);

        let env = languages::java::definition();
        let mut run = step(Stage::Run, None, Some(libc::SIGKILL));
        run.peak_memory = Some(env.defaults.run.memory_bytes);
        let result = collect(RawExecutionOutcome::Ran { build: None, run });
        assert_eq!(result.status, ExecutionStatus::ResourceExceeded);
    }

    #[test]
    fn test_startup_failure_is_a_host_fault() {
        let result = collect(RawExecutionOutcome::StartupFailed {
            stage: Stage::Build,
            reason: "cgroup isolation unavailable".to_string(),
        });
        assert_eq!(result.status, ExecutionStatus::SandboxStartupFailed);
        assert!(result.status.is_host_fault());
        assert!(result.stdout.is_empty());
    }

    #[test]
    fn test_malformed_outcomes_are_internal_errors() {
        let result = collect(RawExecutionOutcome::Ran {
            build: None,
            run: step(Stage::Run, None, None),
        });
        assert_eq!(result.status, ExecutionStatus::InternalError);

        let result = collect(RawExecutionOutcome::BuildFailed {
            build: step(Stage::Build, Some(0), None),
        });
        assert_eq!(result.status, ExecutionStatus::InternalError);
    }

    #[test]
    fn test_address_space_backstop_failures_are_resource_exceeded() {
        let env = languages::c::definition();
        let ceiling = env.defaults.run.memory_bytes;
        let classify = |run: StepOutcome| {
            ResultCollector::collect(&RawExecutionOutcome::Ran { build: None, run }, &env.defaults, &env)
        };

        // malloc returned NULL far below the RSS ceiling and the program crashed on it
        let mut run = step(Stage::Run, None, Some(libc::SIGSEGV));
        run.address_space_limit = Some(ceiling * 4);
        let result = classify(run.clone());
        assert_eq!(result.status, ExecutionStatus::ResourceExceeded);
        assert_eq!(
            result.detail.as_deref(),
            Some("address space limit reached (killed by SIGSEGV)")
        );

        // close to the ceiling when it gave up
        let mut near = step(Stage::Run, Some(1), None);
        near.address_space_limit = Some(ceiling * 4);
        near.peak_memory = Some(ceiling - ceiling / 8);
        assert_eq!(classify(near).status, ExecutionStatus::ResourceExceeded);

        // without the backstop a segfault is the program's own fault
        run.address_space_limit = None;
        assert_eq!(classify(run).status, ExecutionStatus::RuntimeError);
    }
}
