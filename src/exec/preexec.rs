/// Pre-exec isolation plan
///
/// Everything the forked child does before `execve` is decided in the parent
/// and stored in an `IsolationPlan`: paths are already `CString`s, fds already
/// open, limits already computed. The child only issues syscalls, so the hook
/// stays async-signal-safe (no allocation, no locks, no logging).
///
/// The sequence is fixed and encoded as a type-state chain so steps cannot be
/// reordered:
/// 1. `setsid()` so the sandbox owns a fresh process group and session
/// 2. join the step's cgroup through the pre-opened `cgroup.procs` fd
/// 3. `unshare` network and mount namespaces, make `/` private, mount
/// 4. rlimits and umask
/// 5. setgroups, setresgid, then setresuid
/// 6. `PR_SET_NO_NEW_PRIVS`, `PR_SET_PDEATHSIG` (cleared by the uid change, so last)
/// 7. chdir into the workspace (std runs its own chdir before this hook)
use crate::config::harness::HarnessConfig;
use crate::config::limits::ResourceLimits;
use crate::kernel::identity::SandboxIdentity;
use crate::runtime::environment::EnvironmentDefinition;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

const SANDBOX_UMASK: libc::mode_t = 0o077;
const HIDE_TMPFS_OPTIONS: &CStr = c"mode=0711,size=64k";
const PROC_FS: &CStr = c"proc";
const TMPFS: &CStr = c"tmpfs";
const ROOT: &CStr = c"/";

/// One `setrlimit` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitSpec {
    pub resource: libc::__rlimit_resource_t,
    pub soft: u64,
    pub hard: u64,
}

impl RlimitSpec {
    fn fixed(resource: libc::__rlimit_resource_t, value: u64) -> Self {
        RlimitSpec {
            resource,
            soft: value,
            hard: value,
        }
    }
}

/// Kernel backstops for one step.
///
/// `RLIMIT_AS` is only a backstop when no cgroup enforces the memory ceiling,
/// and only for environments that tolerate it (a JVM reserves far more address
/// space than it touches). `RLIMIT_NPROC` counts per real uid, so it is only
/// meaningful under a dedicated sandbox identity.
pub fn rlimits_for(
    config: &HarnessConfig,
    environment: &EnvironmentDefinition,
    limits: &ResourceLimits,
    memory_enforced_by_cgroup: bool,
    dedicated_identity: bool,
) -> Vec<RlimitSpec> {
    let cpu_secs = limits.cpu_time_ms.div_ceil(1000).max(1);
    let mut specs = vec![
        RlimitSpec {
            resource: libc::RLIMIT_CPU,
            soft: cpu_secs,
            hard: cpu_secs + 1,
        },
        RlimitSpec::fixed(libc::RLIMIT_FSIZE, config.max_file_bytes),
        RlimitSpec::fixed(libc::RLIMIT_CORE, 0),
        RlimitSpec::fixed(libc::RLIMIT_NOFILE, config.max_open_files),
    ];

    if !memory_enforced_by_cgroup {
        if let Some(factor) = environment.address_space_factor {
            specs.push(RlimitSpec::fixed(
                libc::RLIMIT_AS,
                limits.memory_bytes.saturating_mul(factor),
            ));
        }
    }
    if dedicated_identity {
        specs.push(RlimitSpec::fixed(
            libc::RLIMIT_NPROC,
            u64::from(limits.max_processes),
        ));
    }
    specs
}

/// Mount-namespace layout for one step (root only)
#[derive(Debug)]
pub enum MountPlan {
    /// Cover the workspace root with an empty tmpfs and re-expose only this
    /// workspace, so sibling workspace paths do not exist inside the sandbox.
    HideSiblings {
        /// Reserves the fd number `fd_path` names until the child has mounted it
        workspace: File,
        workspace_path: CString,
        fd_path: CString,
        workspace_root: CString,
        target: CString,
    },
    /// Bind the workspace into a root filesystem image and chroot into it.
    Image {
        workspace: File,
        workspace_path: CString,
        fd_path: CString,
        image: CString,
        target: CString,
        proc_dir: Option<CString>,
        devices: Vec<(CString, CString)>,
    },
}

impl MountPlan {
    fn workspace_source(&self) -> &CStr {
        match self {
            MountPlan::HideSiblings { fd_path, .. } | MountPlan::Image { fd_path, .. } => fd_path,
        }
    }

    /// Re-open the workspace from inside the new mount namespace onto the fd
    /// number reserved by the parent. A bind source must belong to the
    /// caller's own mount namespace; the inherited fd still points into the
    /// host's. Must run before anything is mounted over the workspace path.
    fn reopen_workspace(&self) -> io::Result<()> {
        let (slot, path) = match self {
            MountPlan::HideSiblings {
                workspace,
                workspace_path,
                ..
            }
            | MountPlan::Image {
                workspace,
                workspace_path,
                ..
            } => (workspace.as_raw_fd(), workspace_path),
        };
        // SAFETY: path is NUL-terminated.
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_PATH | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both fds are open in this process; dup3 replaces slot atomically.
        let rc = unsafe { libc::dup3(fd, slot, libc::O_CLOEXEC) };
        let result = check(rc);
        // SAFETY: fd was opened above and is not used again.
        unsafe { libc::close(fd) };
        result
    }
}

/// Everything the child applies between fork and exec
#[derive(Debug)]
pub struct IsolationPlan {
    pub cgroup_procs: Option<RawFd>,
    pub new_network: bool,
    pub mounts: Option<MountPlan>,
    pub rlimits: Vec<RlimitSpec>,
    pub identity: Option<SandboxIdentity>,
    pub workdir: CString,
}

impl IsolationPlan {
    /// Run the full pre-exec sequence. Called in the forked child only.
    pub fn apply(&self) -> io::Result<()> {
        Child::<Fresh>::new(self)
            .enter_session()?
            .join_cgroup()?
            .isolate()?
            .limit()?
            .drop_identity()?
            .lock()?
            .enter_workdir()
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn mount(
    source: Option<&CStr>,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
    data: Option<&CStr>,
) -> io::Result<()> {
    let ptr_of = |value: Option<&CStr>| value.map_or(ptr::null(), CStr::as_ptr);
    // SAFETY: every pointer is either null or a NUL-terminated string owned by the plan.
    check(unsafe {
        libc::mount(
            ptr_of(source),
            target.as_ptr(),
            ptr_of(fstype),
            flags,
            ptr_of(data) as *const libc::c_void,
        )
    })
}

fn mkdir_existing_ok(path: &CStr, mode: libc::mode_t) -> io::Result<()> {
    // SAFETY: path is NUL-terminated.
    if unsafe { libc::mkdir(path.as_ptr(), mode) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EEXIST) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Type-state marker: freshly forked, nothing applied
pub struct Fresh;
/// Type-state marker: session and process group created
pub struct InSession;
/// Type-state marker: accounted by the step's cgroup
pub struct Accounted;
/// Type-state marker: namespaces and mounts in place
pub struct Isolated;
/// Type-state marker: rlimits applied
pub struct Limited;
/// Type-state marker: running as the sandbox identity
pub struct Unprivileged;
/// Type-state marker: no_new_privs and death signal set
pub struct Locked;

struct Child<'a, S> {
    plan: &'a IsolationPlan,
    _state: PhantomData<S>,
}

impl<'a, S> Child<'a, S> {
    fn next<T>(self) -> Child<'a, T> {
        Child {
            plan: self.plan,
            _state: PhantomData,
        }
    }
}

impl<'a> Child<'a, Fresh> {
    fn new(plan: &'a IsolationPlan) -> Self {
        Child {
            plan,
            _state: PhantomData,
        }
    }

    fn enter_session(self) -> io::Result<Child<'a, InSession>> {
        // SAFETY: setsid has no memory-safety preconditions.
        check(unsafe { libc::setsid() })?;
        Ok(self.next())
    }
}

impl<'a> Child<'a, InSession> {
    fn join_cgroup(self) -> io::Result<Child<'a, Accounted>> {
        if let Some(fd) = self.plan.cgroup_procs {
            // "0" names the writing process
            let pid = b"0";
            // SAFETY: fd is open for writing (owned by the parent's scope) and pid is a valid buffer.
            let written = unsafe { libc::write(fd, pid.as_ptr() as *const libc::c_void, pid.len()) };
            if written < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(self.next())
    }
}

impl<'a> Child<'a, Accounted> {
    fn isolate(self) -> io::Result<Child<'a, Isolated>> {
        let mut flags = 0;
        if self.plan.new_network {
            flags |= libc::CLONE_NEWNET;
        }
        if self.plan.mounts.is_some() {
            flags |= libc::CLONE_NEWNS;
        }
        if flags != 0 {
            // SAFETY: unshare only affects this (single-threaded) child.
            check(unsafe { libc::unshare(flags) })?;
        }

        let Some(mounts) = &self.plan.mounts else {
            return Ok(self.next());
        };
        mount(None, ROOT, None, libc::MS_REC | libc::MS_PRIVATE, None)?;
        mounts.reopen_workspace()?;

        match mounts {
            MountPlan::HideSiblings {
                workspace_root,
                target,
                ..
            } => {
                mount(
                    Some(TMPFS),
                    workspace_root,
                    Some(TMPFS),
                    libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                    Some(HIDE_TMPFS_OPTIONS),
                )?;
                mkdir_existing_ok(target, 0o700)?;
                mount(Some(mounts.workspace_source()), target, None, libc::MS_BIND, None)?;
            }
            MountPlan::Image {
                image,
                target,
                proc_dir,
                devices,
                ..
            } => {
                mkdir_existing_ok(target, 0o755)?;
                mount(Some(mounts.workspace_source()), target, None, libc::MS_BIND, None)?;
                if let Some(proc_dir) = proc_dir {
                    mount(
                        Some(PROC_FS),
                        proc_dir,
                        Some(PROC_FS),
                        libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
                        None,
                    )?;
                }
                for (source, dest) in devices {
                    mount(Some(source), dest, None, libc::MS_BIND, None)?;
                }
                // SAFETY: image is NUL-terminated.
                check(unsafe { libc::chroot(image.as_ptr()) })?;
                // SAFETY: ROOT is NUL-terminated.
                check(unsafe { libc::chdir(ROOT.as_ptr()) })?;
            }
        }
        Ok(self.next())
    }
}

impl<'a> Child<'a, Isolated> {
    fn limit(self) -> io::Result<Child<'a, Limited>> {
        for spec in &self.plan.rlimits {
            let limit = libc::rlimit {
                rlim_cur: spec.soft as libc::rlim_t,
                rlim_max: spec.hard as libc::rlim_t,
            };
            // SAFETY: limit is a valid rlimit value on the stack.
            check(unsafe { libc::setrlimit(spec.resource, &limit) })?;
        }
        // SAFETY: umask cannot fail.
        unsafe { libc::umask(SANDBOX_UMASK) };
        Ok(self.next())
    }
}

impl<'a> Child<'a, Limited> {
    /// setresgid MUST precede setresuid: once the uid is dropped the gid can no
    /// longer be changed.
    fn drop_identity(self) -> io::Result<Child<'a, Unprivileged>> {
        if let Some(identity) = self.plan.identity {
            // SAFETY: an empty group list with a null pointer is valid for setgroups.
            check(unsafe { libc::setgroups(0, ptr::null()) })?;
            // SAFETY: plain id arguments.
            check(unsafe { libc::setresgid(identity.gid, identity.gid, identity.gid) })?;
            // SAFETY: plain id arguments.
            check(unsafe { libc::setresuid(identity.uid, identity.uid, identity.uid) })?;
            // SAFETY: getuid/getgid cannot fail.
            if unsafe { libc::getuid() } != identity.uid || unsafe { libc::getgid() } != identity.gid {
                return Err(io::Error::from_raw_os_error(libc::EPERM));
            }
        }
        Ok(self.next())
    }
}

impl<'a> Child<'a, Unprivileged> {
    fn lock(self) -> io::Result<Child<'a, Locked>> {
        // SAFETY: prctl with integer arguments only.
        check(unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) })?;
        // SAFETY: prctl with integer arguments only.
        check(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) })?;
        Ok(self.next())
    }
}

impl<'a> Child<'a, Locked> {
    fn enter_workdir(self) -> io::Result<()> {
        // SAFETY: workdir is NUL-terminated.
        check(unsafe { libc::chdir(self.plan.workdir.as_ptr()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::languages;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    fn find(specs: &[RlimitSpec], resource: libc::__rlimit_resource_t) -> Option<RlimitSpec> {
        specs.iter().copied().find(|spec| spec.resource == resource)
    }

    #[test]
    fn test_cpu_limit_rounds_up_with_hard_margin() {
        let config = HarnessConfig::default();
        let env = languages::python::definition();
        let mut limits = env.defaults.run.clone();
        limits.cpu_time_ms = 1500;
        let specs = rlimits_for(&config, &env, &limits, false, false);
        let cpu = find(&specs, libc::RLIMIT_CPU).unwrap();
        assert_eq!((cpu.soft, cpu.hard), (2, 3));
        assert_eq!(find(&specs, libc::RLIMIT_CORE).unwrap().hard, 0);
        assert_eq!(
            find(&specs, libc::RLIMIT_FSIZE).unwrap().soft,
            config.max_file_bytes
        );
    }

    #[test]
    fn test_address_space_backstop_only_without_cgroup() {
        let config = HarnessConfig::default();
        let python = languages::python::definition();
        let limits = python.defaults.run.clone();

        let specs = rlimits_for(&config, &python, &limits, false, false);
        assert_eq!(
            find(&specs, libc::RLIMIT_AS).unwrap().soft,
            limits.memory_bytes * 4
        );
        let specs = rlimits_for(&config, &python, &limits, true, false);
        assert!(find(&specs, libc::RLIMIT_AS).is_none());

        let java = languages::java::definition();
        let specs = rlimits_for(&config, &java, &java.defaults.run, false, false);
        assert!(find(&specs, libc::RLIMIT_AS).is_none());
    }

    #[test]
    fn test_nproc_requires_dedicated_identity() {
        let config = HarnessConfig::default();
        let env = languages::c::definition();
        let limits = env.defaults.run.clone();
        assert!(find(&rlimits_for(&config, &env, &limits, true, false), libc::RLIMIT_NPROC).is_none());
        let nproc = find(&rlimits_for(&config, &env, &limits, true, true), libc::RLIMIT_NPROC).unwrap();
        assert_eq!(nproc.soft, u64::from(limits.max_processes));
    }

    #[test]
    fn test_unprivileged_plan_runs_in_child() {
        let dir = tempfile::tempdir().unwrap();
        let plan = IsolationPlan {
            cgroup_procs: None,
            new_network: false,
            mounts: None,
            rlimits: vec![RlimitSpec::fixed(libc::RLIMIT_CORE, 0)],
            identity: None,
            workdir: CString::new(dir.path().to_str().unwrap()).unwrap(),
        };
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("pwd; ulimit -c");
        // SAFETY: the plan only issues async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || plan.apply());
        }
        let output = cmd.output().unwrap();
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let pwd = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(lines.next().map(std::path::PathBuf::from), Some(pwd));
        assert_eq!(lines.next(), Some("0"));
    }

    /// Root with CAP_SYS_ADMIN: a bare mount-namespace unshare succeeds.
    fn mount_namespaces_permitted() -> bool {
        if !nix::unistd::geteuid().is_root() {
            return false;
        }
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "exit 0"]);
        // SAFETY: unshare is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| check(libc::unshare(libc::CLONE_NEWNS)));
        }
        cmd.status().map(|status| status.success()).unwrap_or(false)
    }

    #[test]
    fn test_hide_siblings_exposes_only_own_workspace() {
        if !mount_namespaces_permitted() {
            eprintln!("mount namespaces unavailable, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let own = dir.path().join("sub-000001-own");
        let sibling = dir.path().join("sub-000002-other");
        std::fs::create_dir(&own).unwrap();
        std::fs::create_dir(&sibling).unwrap();
        std::fs::write(own.join("main.txt"), "mine").unwrap();
        std::fs::write(sibling.join("secret.txt"), "theirs").unwrap();

        let workspace = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
            .open(&own)
            .unwrap();
        let fd_path = CString::new(format!("/proc/self/fd/{}", workspace.as_raw_fd())).unwrap();
        let plan = IsolationPlan {
            cgroup_procs: None,
            new_network: true,
            mounts: Some(MountPlan::HideSiblings {
                workspace,
                workspace_path: CString::new(own.to_str().unwrap()).unwrap(),
                fd_path,
                workspace_root: CString::new(dir.path().to_str().unwrap()).unwrap(),
                target: CString::new(own.to_str().unwrap()).unwrap(),
            }),
            rlimits: Vec::new(),
            identity: None,
            workdir: CString::new(own.to_str().unwrap()).unwrap(),
        };
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("cat main.txt; echo; ls -A ..; test -e ../sub-000002-other || echo gone");
        // SAFETY: the plan only issues async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || plan.apply());
        }
        let output = cmd.output().unwrap();
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        let stdout = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = stdout.lines().collect();
        assert_eq!(lines, ["mine", "sub-000001-own", "gone"]);
        // The host view is untouched.
        assert!(sibling.join("secret.txt").exists());
    }
}
