/// Job dispatcher
///
/// Accepts submissions, validates them synchronously, and runs each accepted
/// submission on its own worker thread once it holds a pool slot. A worker owns
/// its submission end to end: workspace creation, staging, the sandbox run,
/// collection and workspace destruction. Destruction happens on every path that
/// created a workspace.
use crate::config::harness::HarnessConfig;
use crate::config::limits::ResourceProfile;
use crate::config::types::{
    ExecutionResult, ExecutionStatus, HarnessError, Result, Submission, SubmissionId, SubmitError,
};
use crate::core::lifecycle::{Lifecycle, LifecycleState};
use crate::core::pool::{SlotPool, Ticket};
use crate::exec::executor::{ProcessSandbox, RawExecutionOutcome, SandboxExecutor, SandboxRequest};
use crate::observability::audit;
use crate::observability::metrics::HarnessMetrics;
use crate::runtime::environment::{EnvironmentDefinition, ResolvedEntry};
use crate::runtime::registry::RuntimeRegistry;
use crate::safety::janitor::Janitor;
use crate::safety::workspace::{check_sources, WorkspaceManager};
use crate::verdict::collector::ResultCollector;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type JobResult = std::result::Result<ExecutionResult, SubmitError>;

struct Inner {
    config: HarnessConfig,
    registry: Arc<RuntimeRegistry>,
    executor: Arc<dyn SandboxExecutor>,
    workspaces: WorkspaceManager,
    janitor: Janitor,
    pool: Arc<SlotPool>,
    metrics: Arc<HarnessMetrics>,
    next_id: AtomicU64,
}

/// Everything a worker needs, fixed at acceptance
struct Job {
    id: SubmissionId,
    environment: Arc<EnvironmentDefinition>,
    entry: ResolvedEntry,
    profile: ResourceProfile,
    stdin: Option<Vec<u8>>,
    accepted_at: Instant,
    deadline: Instant,
    ticket: Ticket,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Pending result of an accepted submission
pub struct JobHandle {
    id: SubmissionId,
    rx: Receiver<JobResult>,
}

impl JobHandle {
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Block until the submission finishes.
    pub fn wait(self) -> JobResult {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Ok(lost_worker(self.id)),
        }
    }

    /// `None` if the submission is still queued or running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Ok(lost_worker(self.id))),
        }
    }
}

fn lost_worker(id: SubmissionId) -> ExecutionResult {
    log::error!("{}: worker exited without delivering a result", id);
    ExecutionResult::without_output(
        ExecutionStatus::InternalError,
        0,
        "worker exited without delivering a result".to_string(),
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Dispatcher {
    /// Dispatcher backed by the process sandbox.
    pub fn new(config: HarnessConfig, registry: Arc<RuntimeRegistry>) -> Result<Self> {
        let executor = Arc::new(ProcessSandbox::new(&config));
        Self::with_executor(config, registry, executor)
    }

    pub fn with_executor(
        config: HarnessConfig,
        registry: Arc<RuntimeRegistry>,
        executor: Arc<dyn SandboxExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(HarnessError::Registry("no environments registered".to_string()));
        }

        let metrics = Arc::new(HarnessMetrics::new());
        let janitor = Janitor::spawn(Arc::clone(&metrics))?;
        let workspaces = WorkspaceManager::new(&config, janitor.clone(), Arc::clone(&metrics))?;
        match workspaces.sweep_stale(config.stale_workspace_age()) {
            Ok(0) => {}
            Ok(swept) => log::info!("Removed {} stale workspaces", swept),
            Err(e) => log::warn!("Stale workspace sweep failed: {}", e),
        }

        let pool = SlotPool::new(config.pool_size());
        log::info!(
            "Dispatcher ready: {} slots, backend {}, {} environments",
            pool.size(),
            executor.backend_name(),
            registry.len()
        );

        Ok(Dispatcher {
            inner: Arc::new(Inner {
                config,
                registry,
                executor,
                workspaces,
                janitor,
                pool,
                metrics,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Validate and accept a submission without waiting for it to run.
    pub fn enqueue(&self, submission: Submission) -> std::result::Result<JobHandle, SubmitError> {
        let inner = &self.inner;
        let (environment, entry, profile) = match self.admit(&submission) {
            Ok(admitted) => admitted,
            Err(err) => {
                inner.metrics.submissions_rejected.inc();
                audit::submission_rejected(&submission.language, &err.to_string());
                return Err(err);
            }
        };

        let accepted_at = Instant::now();
        let deadline = accepted_at + profile.total_budget(environment.has_build());
        let id = SubmissionId(inner.next_id.fetch_add(1, Ordering::SeqCst));
        let ticket = inner.pool.register();

        inner.metrics.submissions_accepted.inc();
        inner.metrics.queued.inc();
        audit::submission_accepted(id, &environment.language);
        log::debug!(
            "{}: accepted {} submission, deadline in {:?}",
            id,
            environment.language,
            deadline - accepted_at
        );

        let job = Job {
            id,
            environment,
            entry,
            profile,
            stdin: submission.stdin,
            accepted_at,
            deadline,
            ticket,
        };

        let (tx, rx) = bounded(1);
        let worker = Arc::clone(inner);
        let spawned = std::thread::Builder::new()
            .name(format!("runbox-{}", id.0))
            .spawn(move || {
                let result = worker.process(job);
                let _ = tx.send(result);
            });

        if let Err(e) = spawned {
            // The job, its ticket and the sender were dropped with the closure.
            log::error!("{}: failed to spawn worker: {}", id, e);
            inner.metrics.queued.dec();
            inner.metrics.record_status(ExecutionStatus::InternalError);
            audit::internal_error(id, &format!("worker spawn failed: {e}"));
        }

        Ok(JobHandle { id, rx })
    }

    /// Run a submission to completion.
    pub fn submit(&self, submission: Submission) -> JobResult {
        self.enqueue(submission)?.wait()
    }

    fn admit(
        &self,
        submission: &Submission,
    ) -> std::result::Result<(Arc<EnvironmentDefinition>, ResolvedEntry, ResourceProfile), SubmitError> {
        let inner = &self.inner;
        let environment = inner.registry.lookup(&submission.language)?;
        check_sources(
            &submission.sources,
            inner.config.max_source_bytes,
            inner.config.max_source_files,
        )
        .map_err(SubmitError::InvalidSubmission)?;

        let stdin_len = submission.stdin.as_ref().map_or(0, |s| s.len() as u64);
        if stdin_len > inner.config.max_stdin_bytes {
            return Err(SubmitError::InvalidSubmission(format!(
                "stdin is {} bytes, limit is {}",
                stdin_len, inner.config.max_stdin_bytes
            )));
        }

        let entry = environment
            .resolve_entry(&submission.sources)
            .map_err(SubmitError::InvalidSubmission)?;

        let profile = match &submission.resource_override {
            Some(over) => {
                let profile = environment.defaults.narrowed(over);
                profile
                    .validate(&environment.language)
                    .map_err(|e| SubmitError::InvalidSubmission(format!("resource override: {e}")))?;
                profile
            }
            None => environment.defaults,
        };
        Ok((environment, entry, profile))
    }

    pub fn metrics(&self) -> &HarnessMetrics {
        &self.inner.metrics
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.inner.registry
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool.size()
    }

    pub fn backend_name(&self) -> &str {
        self.inner.executor.backend_name()
    }

    /// Wait until deferred workspace removals have drained.
    pub fn wait_for_cleanup(&self, timeout: Duration) -> bool {
        self.inner.janitor.wait_idle(timeout)
    }

    /// Workspace directories currently on disk
    pub fn live_workspaces(&self) -> usize {
        self.inner.workspaces.live_count()
    }
}

impl Inner {
    fn process(&self, job: Job) -> JobResult {
        let Job {
            id,
            environment,
            entry,
            profile,
            stdin,
            accepted_at,
            deadline,
            ticket,
        } = job;

        let slot = ticket.acquire(deadline);
        self.metrics.queued.dec();
        let slot = match slot {
            Ok(slot) => slot,
            Err(expired) => {
                let waited_ms = expired.waited.as_millis() as u64;
                log::info!("{}: deadline expired after {}ms in the queue", id, waited_ms);
                self.metrics.queue_timeouts.inc();
                audit::queue_timeout(id, waited_ms);
                return Err(SubmitError::QueueTimedOut { id, waited_ms });
            }
        };
        self.metrics.queue_wait.observe(accepted_at.elapsed());
        self.metrics.running.inc();

        let mut lifecycle = Lifecycle::new(id);
        let result = self.execute(
            id,
            &mut lifecycle,
            &environment,
            &entry,
            &profile,
            stdin.as_deref(),
            deadline,
            slot.slot(),
        );

        if let Err(e) = lifecycle.advance(LifecycleState::Cleaned) {
            log::error!("{}", e);
        }
        drop(slot);
        self.metrics.running.dec();

        self.metrics.record_status(result.status);
        self.metrics.execution_latency.observe(accepted_at.elapsed());
        if result.status.is_host_fault() {
            let reason = result.detail.as_deref().unwrap_or("unknown");
            match result.status {
                ExecutionStatus::SandboxStartupFailed => audit::startup_failure(id, reason),
                _ => audit::internal_error(id, reason),
            }
        }
        audit::submission_completed(id, result.status, result.elapsed_millis);
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        id: SubmissionId,
        lifecycle: &mut Lifecycle,
        environment: &EnvironmentDefinition,
        entry: &ResolvedEntry,
        profile: &ResourceProfile,
        stdin: Option<&[u8]>,
        deadline: Instant,
        slot: usize,
    ) -> ExecutionResult {
        let owner = self.executor.sandbox_identity(slot);
        let workspace = match self.workspaces.create(id, owner) {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("{}: workspace creation failed: {}", id, e);
                return ExecutionResult::without_output(
                    ExecutionStatus::SandboxStartupFailed,
                    0,
                    format!("workspace creation failed: {e}"),
                );
            }
        };

        let result = match self.workspaces.stage(&workspace, &entry.units) {
            Err(e) => {
                log::error!("{}: staging failed: {}", id, e);
                ExecutionResult::without_output(
                    ExecutionStatus::SandboxStartupFailed,
                    0,
                    format!("staging failed: {e}"),
                )
            }
            Ok(_) => {
                let ready = lifecycle
                    .advance(LifecycleState::Staged)
                    .and_then(|()| lifecycle.advance(LifecycleState::Running));
                match ready {
                    Err(e) => ExecutionResult::without_output(ExecutionStatus::InternalError, 0, e.to_string()),
                    Ok(()) => {
                        let request = SandboxRequest {
                            submission: id,
                            workspace: &workspace,
                            environment,
                            entry,
                            profile,
                            stdin,
                            deadline,
                            slot,
                        };
                        let result = self.run_sandbox(&request);
                        if let Err(e) = lifecycle.advance(LifecycleState::Completed) {
                            log::error!("{}", e);
                        }
                        result
                    }
                }
            }
        };

        self.workspaces.destroy(workspace);
        result
    }

    fn run_sandbox(&self, request: &SandboxRequest<'_>) -> ExecutionResult {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.executor.run(request)));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("{}: executor panicked: {}", request.submission, message);
                return ExecutionResult::without_output(
                    ExecutionStatus::InternalError,
                    started.elapsed().as_millis() as u64,
                    format!("executor panicked: {message}"),
                );
            }
        };

        let kills = match &outcome {
            RawExecutionOutcome::BuildFailed { build } => build.kill.iter().count(),
            RawExecutionOutcome::Ran { build, run } => {
                build.iter().filter(|step| step.kill.is_some()).count() + run.kill.iter().count()
            }
            RawExecutionOutcome::StartupFailed { .. } => 0,
        };
        for _ in 0..kills {
            self.metrics.forced_kills.inc();
        }

        ResultCollector::collect(&outcome, request.profile, request.environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_lost_worker_is_internal_error() {
        let result = lost_worker(SubmissionId(9));
        assert_eq!(result.status, ExecutionStatus::InternalError);
        assert!(result.status.is_host_fault());
    }
}
