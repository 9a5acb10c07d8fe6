/// Cgroup v2 accounting
///
/// The harness owns a delegated subtree (default `/sys/fs/cgroup/runbox`) and
/// creates one child scope per sandbox step. The child attaches itself from its
/// pre-exec hook by writing to a `cgroup.procs` fd the parent opened, so every
/// process the step forks is charged to the scope from its first instruction.
///
/// Kernel-enforced controls: `memory.max` with swap disabled and
/// `memory.oom.group`, `pids.max`. The limiter polls `memory.events`,
/// `pids.events` and `cpu.stat` to classify breaches, and kills stragglers
/// through `cgroup.kill`.
use crate::config::limits::ResourceLimits;
use crate::config::types::{HarnessError, Result};
use crate::kernel::accounting::{Accounting, UsageSample};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const REQUIRED_CONTROLLERS: [&str; 2] = ["memory", "pids"];
const REMOVE_ATTEMPTS: u32 = 20;
const REMOVE_BACKOFF: Duration = Duration::from_millis(5);

fn cgroup_error(action: &str, path: &Path, err: impl std::fmt::Display) -> HarnessError {
    HarnessError::Cgroup(format!("{} {}: {}", action, path.display(), err))
}

/// Value of `key` in a flat-keyed file such as `memory.events` or `cpu.stat`
pub fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == key {
            parts.next()?.parse().ok()
        } else {
            None
        }
    })
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_keyed(path: &Path, key: &str) -> Option<u64> {
    parse_keyed(&fs::read_to_string(path).ok()?, key)
}

fn write_control(dir: &Path, file: &str, value: &str) -> std::io::Result<()> {
    fs::write(dir.join(file), value)
}

/// The delegated subtree every scope is created under
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    path: PathBuf,
}

impl CgroupRoot {
    /// Create (if needed) the subtree and enable the controllers scopes use.
    pub fn open(path: &Path) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| cgroup_error("invalid cgroup root", path, "no parent"))?;
        if !parent.join("cgroup.controllers").exists() {
            return Err(cgroup_error(
                "not a cgroup v2 hierarchy",
                parent,
                "cgroup.controllers missing",
            ));
        }

        match fs::create_dir(path) {
            Ok(()) => log::info!("Created cgroup root {}", path.display()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(cgroup_error("failed to create", path, e)),
        }

        let available = fs::read_to_string(path.join("cgroup.controllers"))
            .map_err(|e| cgroup_error("failed to read controllers of", path, e))?;
        let available: Vec<&str> = available.split_whitespace().collect();
        for controller in REQUIRED_CONTROLLERS {
            if !available.contains(&controller) {
                return Err(cgroup_error(
                    "controller not delegated to",
                    path,
                    format!("'{controller}' missing"),
                ));
            }
        }
        let cpu = available.contains(&"cpu");

        let enable = if cpu { "+memory +pids +cpu" } else { "+memory +pids" };
        write_control(path, "cgroup.subtree_control", enable)
            .map_err(|e| cgroup_error("failed to enable controllers on", path, e))?;

        log::info!(
            "cgroup v2 accounting at {} (cpu controller: {})",
            path.display(),
            cpu
        );
        Ok(CgroupRoot {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a scope named `name` with the kernel-enforced parts of `limits`.
    pub fn create_scope(&self, name: &str, limits: &ResourceLimits, strict: bool) -> Result<CgroupScope> {
        let path = self.path.join(name);
        fs::create_dir(&path).map_err(|e| cgroup_error("failed to create scope", &path, e))?;

        // From here on the scope removes itself if configuration fails.
        let mut scope = CgroupScope::attach(path)?;
        scope.configure(limits, strict)?;
        Ok(scope)
    }
}

/// One sandbox step's cgroup
#[derive(Debug)]
pub struct CgroupScope {
    path: PathBuf,
    procs: Option<File>,
    peak_memory: u64,
}

impl CgroupScope {
    fn attach(path: PathBuf) -> Result<Self> {
        let procs = OpenOptions::new()
            .write(true)
            .open(path.join("cgroup.procs"))
            .map_err(|e| cgroup_error("failed to open cgroup.procs of", &path, e));
        let mut scope = CgroupScope {
            path,
            procs: None,
            peak_memory: 0,
        };
        scope.procs = Some(procs?);
        Ok(scope)
    }

    fn configure(&mut self, limits: &ResourceLimits, strict: bool) -> Result<()> {
        write_control(&self.path, "memory.max", &limits.memory_bytes.to_string())
            .map_err(|e| cgroup_error("failed to set memory.max on", &self.path, e))?;
        write_control(&self.path, "pids.max", &limits.max_processes.to_string())
            .map_err(|e| cgroup_error("failed to set pids.max on", &self.path, e))?;

        if let Err(e) = write_control(&self.path, "memory.swap.max", "0") {
            if e.kind() != ErrorKind::NotFound {
                log::warn!("Failed to disable swap for {}: {}", self.path.display(), e);
            }
        }
        if let Err(e) = write_control(&self.path, "memory.oom.group", "1") {
            if strict {
                return Err(cgroup_error("failed to set memory.oom.group on", &self.path, e));
            }
            log::warn!(
                "Failed to set memory.oom.group on {} (permissive mode): {}",
                self.path.display(),
                e
            );
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fd the child writes "0" to in order to join the scope
    pub fn procs_fd(&self) -> Option<RawFd> {
        self.procs.as_ref().map(|file| file.as_raw_fd())
    }

    /// Close the parent's copy of the attach fd once the child is running.
    pub fn release_procs_fd(&mut self) {
        self.procs = None;
    }

    fn members(&self) -> Vec<i32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|content| content.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    fn remove(&mut self) {
        for attempt in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == ErrorKind::NotFound => return,
                Err(e) if attempt + 1 == REMOVE_ATTEMPTS => {
                    log::warn!("Failed to remove cgroup {}: {}", self.path.display(), e);
                }
                Err(_) => {
                    self.kill_all();
                    thread::sleep(REMOVE_BACKOFF);
                }
            }
        }
    }
}

impl Accounting for CgroupScope {
    fn backend_name(&self) -> &'static str {
        "cgroup_v2"
    }

    fn sample(&mut self) -> UsageSample {
        let current = read_u64(&self.path.join("memory.current")).unwrap_or(0);
        // memory.peak needs 5.19+; otherwise track the highest sample
        let peak = read_u64(&self.path.join("memory.peak")).unwrap_or(0);
        self.peak_memory = self.peak_memory.max(current).max(peak);

        // cpu.stat carries usage_usec even without the cpu controller
        let cpu_usec = read_keyed(&self.path.join("cpu.stat"), "usage_usec").unwrap_or(0);

        UsageSample {
            memory_bytes: current,
            peak_memory_bytes: self.peak_memory,
            processes: read_u64(&self.path.join("pids.current")).unwrap_or(0) as u32,
            cpu_time: Duration::from_micros(cpu_usec),
            oom_killed: read_keyed(&self.path.join("memory.events"), "oom_kill").unwrap_or(0) > 0,
            fork_refused: read_keyed(&self.path.join("pids.events"), "max").unwrap_or(0) > 0,
        }
    }

    fn kill_all(&mut self) {
        if write_control(&self.path, "cgroup.kill", "1").is_ok() {
            return;
        }
        // cgroup.kill needs 5.14+
        for pid in self.members() {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    fn is_empty(&mut self) -> bool {
        self.members().is_empty()
    }

    fn enforces_memory(&self) -> bool {
        true
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        self.procs = None;
        if !self.is_empty() {
            self.kill_all();
        }
        self.remove();
    }
}
