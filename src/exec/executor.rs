/// Sandbox executor
///
/// Runs a staged workspace's build step (when the environment has one) and
/// then its run step, each as a fresh process session under its own resource
/// segment. A failed build short-circuits; the run step is never attempted.
use crate::config::harness::HarnessConfig;
use crate::config::limits::{ResourceLimits, ResourceProfile};
use crate::config::types::{CapturedStream, SubmissionId};
use crate::exec::limiter::{nproc_refused, LimitBreach, ResourceLimiter, StepLimits};
use crate::exec::preexec::{rlimits_for, IsolationPlan, MountPlan};
use crate::kernel::accounting::Accounting;
use crate::kernel::cgroup::{CgroupRoot, CgroupScope};
use crate::kernel::identity::{running_as_root, SandboxIdentity};
use crate::kernel::procfs::SessionAccounting;
use crate::kernel::signal::{self, KillReport};
use crate::observability::audit;
use crate::runtime::environment::{
    expand_template, EnvironmentDefinition, IsolationImage, ResolvedEntry, TemplateContext,
};
use crate::safety::workspace::Workspace;
use crate::utils::output::{feed_stdin, StreamCapture};
use nix::unistd::Pid;
use serde::Serialize;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// PATH inside every sandbox
pub const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const IMAGE_DEVICES: [&str; 4] = ["null", "zero", "random", "urandom"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Build,
    Run,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Run => "run",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-side observations of one step
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub stage: Stage,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub breach: Option<LimitBreach>,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub peak_memory: Option<u64>,
    /// `RLIMIT_AS` applied to the step, when it was the memory backstop
    pub address_space_limit: Option<u64>,
    pub kill: Option<KillReport>,
}

impl StepOutcome {
    /// The submission deadline passed before the step could start.
    pub fn expired(stage: Stage) -> Self {
        StepOutcome {
            stage,
            exit_code: None,
            signal: None,
            breach: Some(LimitBreach::Deadline),
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            wall_time: Duration::ZERO,
            cpu_time: Duration::ZERO,
            peak_memory: None,
            address_space_limit: None,
            kill: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.breach.is_none() && self.signal.is_none() && self.exit_code == Some(0)
    }
}

/// Everything the executor observed, before normalization
#[derive(Debug, Clone)]
pub enum RawExecutionOutcome {
    /// The build step did not succeed; the run step was never attempted
    BuildFailed { build: StepOutcome },
    /// The run step happened (after a successful build, if any)
    Ran {
        build: Option<StepOutcome>,
        run: StepOutcome,
    },
    /// The sandbox could not be set up; nothing of the submission ran
    StartupFailed { stage: Stage, reason: String },
}

/// One submission's view of the executor
pub struct SandboxRequest<'a> {
    pub submission: SubmissionId,
    pub workspace: &'a Workspace,
    pub environment: &'a EnvironmentDefinition,
    pub entry: &'a ResolvedEntry,
    pub profile: &'a ResourceProfile,
    pub stdin: Option<&'a [u8]>,
    /// Absolute submission deadline
    pub deadline: Instant,
    /// Pool slot held by the submission
    pub slot: usize,
}

/// Seam between the dispatcher and process isolation
pub trait SandboxExecutor: Send + Sync {
    fn backend_name(&self) -> &str;

    /// Identity the workspace must belong to for `slot`, if sandboxes switch identity
    fn sandbox_identity(&self, _slot: usize) -> Option<SandboxIdentity> {
        None
    }

    fn run(&self, request: &SandboxRequest<'_>) -> RawExecutionOutcome;
}

/// Kills and reaps the leader if supervision did not get that far.
struct SandboxHandle {
    pid: Pid,
    reaped: bool,
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if !self.reaped {
            log::warn!("Sandbox {} abandoned before it was reaped, killing it", self.pid);
            signal::kill_group(self.pid);
            if let Err(e) = signal::reap_blocking(self.pid) {
                log::error!("Failed to reap sandbox {}: {}", self.pid, e);
            }
        }
    }
}

fn cstring(path: &Path) -> std::result::Result<CString, String> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| format!("path {} contains a NUL byte", path.display()))
}

/// Environment variables visible inside the sandbox; nothing is inherited.
pub fn sandbox_environment(env: &EnvironmentDefinition, workspace: &Path) -> Vec<(String, String)> {
    let workspace = workspace.to_string_lossy().into_owned();
    let mut vars = vec![
        ("PATH".to_string(), SANDBOX_PATH.to_string()),
        ("HOME".to_string(), workspace.clone()),
        ("TMPDIR".to_string(), workspace),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ];
    for (key, value) in &env.environment {
        vars.retain(|(existing, _)| existing != key);
        vars.push((key.clone(), value.clone()));
    }
    vars
}

fn open_workspace(root: &Path) -> std::result::Result<(std::fs::File, CString, CString), String> {
    let workspace = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_DIRECTORY | libc::O_NOFOLLOW)
        .open(root)
        .map_err(|e| format!("failed to open workspace {}: {}", root.display(), e))?;
    let fd_path = cstring(Path::new(&format!("/proc/self/fd/{}", workspace.as_raw_fd())))?;
    Ok((workspace, cstring(root)?, fd_path))
}

/// Host-image mount plan for the workspace at `root`
fn hide_siblings(root: &Path) -> std::result::Result<MountPlan, String> {
    let workspace_root = root
        .parent()
        .ok_or_else(|| format!("workspace {} has no parent", root.display()))?;
    let (workspace, workspace_path, fd_path) = open_workspace(root)?;
    Ok(MountPlan::HideSiblings {
        workspace,
        workspace_path,
        fd_path,
        workspace_root: cstring(workspace_root)?,
        target: cstring(root)?,
    })
}

/// Run a throwaway child through the same isolation plan a sandbox gets, on a
/// scratch directory under the workspace root. LSM policies may allow unshare
/// but deny some of the mounts, and only the full sequence shows that.
fn probe_namespaces(workspace_root: &Path, network: bool) -> std::result::Result<(), String> {
    std::fs::create_dir_all(workspace_root)
        .map_err(|e| format!("failed to create {}: {}", workspace_root.display(), e))?;
    let scratch = workspace_root.join(format!(".isolation-check-{}", std::process::id()));
    std::fs::create_dir(&scratch)
        .map_err(|e| format!("failed to create {}: {}", scratch.display(), e))?;

    let result = (|| -> std::result::Result<(), String> {
        let plan = IsolationPlan {
            cgroup_procs: None,
            new_network: network,
            mounts: Some(hide_siblings(&scratch)?),
            rlimits: Vec::new(),
            identity: None,
            workdir: cstring(&scratch)?,
        };
        let mut command = Command::new("/bin/sh");
        command
            .args(["-c", "exit 0"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: IsolationPlan::apply only issues async-signal-safe syscalls.
        unsafe {
            command.pre_exec(move || plan.apply());
        }
        match command.status() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(format!("isolation check exited with {status}")),
            Err(e) => Err(format!("isolation setup failed: {e}")),
        }
    })();

    if let Err(e) = std::fs::remove_dir(&scratch) {
        log::warn!("Failed to remove isolation check directory {}: {}", scratch.display(), e);
    }
    result
}

/// Every existing ancestor of `path` must be searchable by other users, or a
/// dedicated sandbox identity could never reach its workspace.
fn reachable_by_others(path: &Path) -> std::result::Result<(), String> {
    for ancestor in path.ancestors().skip(1) {
        let Ok(meta) = std::fs::metadata(ancestor) else {
            continue;
        };
        if meta.permissions().mode() & 0o001 == 0 {
            return Err(format!("{} is not searchable by other users", ancestor.display()));
        }
    }
    Ok(())
}

/// The real executor: one process session per step
pub struct ProcessSandbox {
    config: HarnessConfig,
    cgroup: Option<CgroupRoot>,
    switch_identity: bool,
    namespaces: bool,
    degraded: Vec<(&'static str, String)>,
    limiter: ResourceLimiter,
}

impl ProcessSandbox {
    /// Detect which isolation controls this host provides. Missing controls are
    /// recorded; strict mode turns them into `SandboxStartupFailed` per run.
    pub fn new(config: &HarnessConfig) -> Self {
        let mut degraded = Vec::new();

        let cgroup = match &config.cgroup_root {
            Some(path) => match CgroupRoot::open(path) {
                Ok(root) => Some(root),
                Err(e) => {
                    degraded.push(("cgroup", e.to_string()));
                    None
                }
            },
            None => {
                degraded.push(("cgroup", "no cgroup root configured".to_string()));
                None
            }
        };

        let (switch_identity, namespaces) = if running_as_root() {
            let namespaces = match probe_namespaces(&config.workspace_root, config.network_isolation) {
                Ok(()) => true,
                Err(reason) => {
                    degraded.push(("namespaces", reason));
                    false
                }
            };
            let switch_identity = match reachable_by_others(&config.workspace_root) {
                Ok(()) => true,
                Err(reason) => {
                    degraded.push(("identity", reason));
                    false
                }
            };
            (switch_identity, namespaces)
        } else {
            let reason = "harness is not running as root".to_string();
            degraded.push(("identity", reason.clone()));
            degraded.push(("namespaces", reason));
            (false, false)
        };

        for (control, reason) in &degraded {
            if config.strict_mode {
                log::error!("Isolation control '{}' unavailable: {}", control, reason);
            } else {
                audit::degraded_isolation(control, reason);
            }
        }
        log::info!(
            "Process sandbox: accounting={}, identities={}, namespaces={}, strict={}",
            if cgroup.is_some() { "cgroup_v2" } else { "procfs" },
            switch_identity,
            namespaces,
            config.strict_mode
        );

        ProcessSandbox {
            config: config.clone(),
            cgroup,
            switch_identity,
            namespaces,
            degraded,
            limiter: ResourceLimiter::new(config.kill_grace(), config.poll_interval()),
        }
    }

    /// Isolation controls this host could not provide, with the reason
    pub fn degraded_controls(&self) -> &[(&'static str, String)] {
        &self.degraded
    }

    fn mount_plan(&self, request: &SandboxRequest<'_>) -> std::result::Result<MountPlan, String> {
        let root = request.workspace.root();
        match &request.environment.image {
            IsolationImage::Host => hide_siblings(root),
            IsolationImage::Rootfs { path } => {
                let (workspace, workspace_path, fd_path) = open_workspace(root)?;
                let proc_dir = path.join("proc");
                let mut devices = Vec::new();
                for device in IMAGE_DEVICES {
                    let dest = path.join("dev").join(device);
                    if dest.exists() {
                        devices.push((cstring(&Path::new("/dev").join(device))?, cstring(&dest)?));
                    }
                }
                Ok(MountPlan::Image {
                    workspace,
                    workspace_path,
                    fd_path,
                    image: cstring(path)?,
                    target: cstring(&path.join("workspace"))?,
                    proc_dir: if proc_dir.is_dir() { Some(cstring(&proc_dir)?) } else { None },
                    devices,
                })
            }
        }
    }

    fn plan(
        &self,
        request: &SandboxRequest<'_>,
        limits: &ResourceLimits,
        scope: Option<&CgroupScope>,
        identity: Option<SandboxIdentity>,
    ) -> std::result::Result<IsolationPlan, String> {
        let env = request.environment;
        if matches!(env.image, IsolationImage::Rootfs { .. }) && !self.namespaces {
            return Err(format!(
                "environment '{}' needs a root filesystem image, which requires mount namespaces",
                env.language
            ));
        }
        let mounts = if self.namespaces {
            Some(self.mount_plan(request)?)
        } else {
            None
        };

        Ok(IsolationPlan {
            cgroup_procs: scope.and_then(CgroupScope::procs_fd),
            new_network: self.namespaces && self.config.network_isolation,
            mounts,
            rlimits: rlimits_for(&self.config, env, limits, scope.is_some(), identity.is_some()),
            identity,
            workdir: cstring(&env.sandbox_workspace(request.workspace.root()))?,
        })
    }

    fn step(
        &self,
        request: &SandboxRequest<'_>,
        stage: Stage,
        template: &[String],
        limits: &ResourceLimits,
        stdin: Option<&[u8]>,
    ) -> std::result::Result<StepOutcome, String> {
        let remaining = request.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            audit::limit_breach(request.submission, stage.as_str(), LimitBreach::Deadline.as_str());
            return Ok(StepOutcome::expired(stage));
        }
        let step_limits = StepLimits {
            wall_time: limits.wall_time().min(remaining),
            deadline_bound: remaining < limits.wall_time(),
            cpu_time: limits.cpu_time(),
            memory_bytes: limits.memory_bytes,
            max_processes: limits.max_processes,
        };

        let env = request.environment;
        let sandbox_workspace = env.sandbox_workspace(request.workspace.root());
        let ctx = TemplateContext::new(env, &sandbox_workspace, request.entry, limits);
        let argv = expand_template(template, &ctx).map_err(|e| e.to_string())?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| format!("empty {stage} command"))?;

        let mut scope = match &self.cgroup {
            Some(root) => {
                let name = format!("{}-{}", request.workspace.name(), stage);
                match root.create_scope(&name, limits, self.config.strict_mode) {
                    Ok(scope) => Some(scope),
                    Err(e) if self.config.strict_mode => return Err(e.to_string()),
                    Err(e) => {
                        log::warn!("Falling back to procfs accounting for {}: {}", name, e);
                        None
                    }
                }
            }
            None => None,
        };
        let identity = self.sandbox_identity(request.slot);
        let plan = self.plan(request, limits, scope.as_ref(), identity)?;
        let address_space_limit = plan
            .rlimits
            .iter()
            .find(|spec| spec.resource == libc::RLIMIT_AS)
            .map(|spec| spec.soft);

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(sandbox_environment(env, &sandbox_workspace))
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // SAFETY: IsolationPlan::apply only issues async-signal-safe syscalls
        // on data prepared before the fork.
        unsafe {
            command.pre_exec(move || plan.apply());
        }

        log::debug!("{} {}: spawning {:?}", request.submission, stage, argv);
        let mut child = command
            .spawn()
            .map_err(|e| format!("failed to start {stage} command '{program}': {e}"))?;
        let started = Instant::now();
        let mut handle = SandboxHandle {
            pid: Pid::from_raw(child.id() as i32),
            reaped: false,
        };
        if let Some(scope) = scope.as_mut() {
            scope.release_procs_fd();
        }

        let output_limit = usize::try_from(limits.max_output_bytes).unwrap_or(usize::MAX);
        let stdout_pipe = child.stdout.take().ok_or("stdout pipe missing")?;
        let stderr_pipe = child.stderr.take().ok_or("stderr pipe missing")?;
        let stdout = StreamCapture::spawn("stdout", stdout_pipe, output_limit)
            .map_err(|e| format!("failed to capture stdout: {e}"))?;
        let stderr = StreamCapture::spawn("stderr", stderr_pipe, output_limit)
            .map_err(|e| format!("failed to capture stderr: {e}"))?;
        if let (Some(data), Some(pipe)) = (stdin, child.stdin.take()) {
            feed_stdin(pipe, data.to_vec()).map_err(|e| format!("failed to feed stdin: {e}"))?;
        }

        let mut accounting: Box<dyn Accounting> = match scope {
            Some(scope) => Box::new(scope),
            None => Box::new(SessionAccounting::new(handle.pid)),
        };
        let supervision = self
            .limiter
            .supervise(handle.pid, started, &step_limits, accounting.as_mut())?;
        handle.reaped = true;
        drop(accounting);

        let drain = self.config.output_drain_timeout();
        let stdout = stdout.finish(drain);
        let stderr = stderr.finish(drain);

        let mut breach = supervision.breach;
        if identity.is_some() && nproc_refused(&supervision, &step_limits, &stderr.text()) {
            breach = Some(LimitBreach::ProcessCount);
        }
        if let Some(breach) = breach {
            audit::limit_breach(request.submission, stage.as_str(), breach.as_str());
        }
        if let Some(kill) = &supervision.kill {
            audit::forced_kill(request.submission, kill.pid, kill.term_sent, kill.waited_ms);
        }
        log::debug!(
            "{} {}: exit={:?} signal={:?} breach={:?} wall={:?}",
            request.submission,
            stage,
            supervision.exit_code,
            supervision.signal,
            breach,
            supervision.wall_time
        );

        Ok(StepOutcome {
            stage,
            exit_code: supervision.exit_code,
            signal: supervision.signal,
            breach,
            stdout,
            stderr,
            wall_time: supervision.wall_time,
            cpu_time: supervision.cpu_time,
            peak_memory: supervision.peak_memory,
            address_space_limit,
            kill: supervision.kill,
        })
    }
}

impl SandboxExecutor for ProcessSandbox {
    fn backend_name(&self) -> &str {
        if self.cgroup.is_some() {
            "process+cgroup_v2"
        } else {
            "process+procfs"
        }
    }

    fn sandbox_identity(&self, slot: usize) -> Option<SandboxIdentity> {
        self.switch_identity
            .then(|| SandboxIdentity::for_slot(&self.config, slot))
    }

    fn run(&self, request: &SandboxRequest<'_>) -> RawExecutionOutcome {
        let env = request.environment;
        let first_stage = if env.has_build() { Stage::Build } else { Stage::Run };

        if self.config.strict_mode {
            if let Some((control, reason)) = self.degraded.first() {
                return RawExecutionOutcome::StartupFailed {
                    stage: first_stage,
                    reason: format!("{control} isolation unavailable in strict mode: {reason}"),
                };
            }
        }
        if let Some(identity) = self.sandbox_identity(request.slot) {
            if let Err(e) = identity.validate() {
                return RawExecutionOutcome::StartupFailed {
                    stage: first_stage,
                    reason: e.to_string(),
                };
            }
        }

        let build = match &env.build {
            Some(template) => {
                match self.step(request, Stage::Build, template, &request.profile.build, None) {
                    Ok(build) if build.succeeded() => Some(build),
                    Ok(build) => return RawExecutionOutcome::BuildFailed { build },
                    Err(reason) => {
                        return RawExecutionOutcome::StartupFailed {
                            stage: Stage::Build,
                            reason,
                        }
                    }
                }
            }
            None => None,
        };

        match self.step(request, Stage::Run, &env.run, &request.profile.run, request.stdin) {
            Ok(run) => RawExecutionOutcome::Ran { build, run },
            Err(reason) => RawExecutionOutcome::StartupFailed {
                stage: Stage::Run,
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::languages;

    #[test]
    fn test_sandbox_environment_is_minimal() {
        let env = languages::python::definition();
        let vars = sandbox_environment(&env, Path::new("/ws/sub-000001-abc"));
        let get = |key: &str| vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("HOME"), Some("/ws/sub-000001-abc"));
        assert_eq!(get("TMPDIR"), Some("/ws/sub-000001-abc"));
        assert_eq!(get("PATH"), Some(SANDBOX_PATH));
        assert_eq!(get("PYTHONUNBUFFERED"), Some("1"));
        assert!(get("USER").is_none());
    }

    #[test]
    fn test_environment_overrides_replace_defaults() {
        let mut env = languages::python::definition();
        env.environment.insert("LANG".to_string(), "en_US.UTF-8".to_string());
        let vars = sandbox_environment(&env, Path::new("/ws"));
        let langs: Vec<_> = vars.iter().filter(|(k, _)| k == "LANG").collect();
        assert_eq!(langs.len(), 1);
        assert_eq!(langs[0].1, "en_US.UTF-8");
    }

    #[test]
    fn test_expired_step_reports_deadline() {
        let outcome = StepOutcome::expired(Stage::Run);
        assert_eq!(outcome.breach, Some(LimitBreach::Deadline));
        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code, None);
    }

    #[test]
    fn test_missing_cgroup_root_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::permissive(dir.path().join("ws"));
        config.strict_mode = true;
        config.cgroup_root = None;
        let sandbox = ProcessSandbox::new(&config);
        // A missing cgroup root is always a degraded control.
        assert!(sandbox
            .degraded_controls()
            .iter()
            .any(|(control, _)| *control == "cgroup"));
    }

    #[test]
    fn test_namespace_check_leaves_workspace_root_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        // Succeeds or not depending on privilege; the scratch directory goes either way.
        let _ = probe_namespaces(&root, true);
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_root_namespace_check_matches_sandbox() {
        if !running_as_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        let checked = probe_namespaces(&root, true);
        let sandbox = ProcessSandbox::new(&HarnessConfig::permissive(root));
        // The check and the sandbox agree on whether namespaces work.
        assert_eq!(
            checked.is_ok(),
            !sandbox
                .degraded_controls()
                .iter()
                .any(|(control, _)| *control == "namespaces")
        );
    }
}
