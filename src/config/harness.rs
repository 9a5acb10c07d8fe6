/// Harness configuration loaded from a JSON file
use crate::config::types::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide settings for the dispatcher, workspaces and sandboxes.
///
/// Every field has a default, so a config file only needs to name what it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory holding one workspace per running submission
    pub workspace_root: PathBuf,
    /// Concurrent sandbox slots; `None` sizes the pool from the host
    pub pool_size: Option<usize>,
    /// Fraction of available cores used when `pool_size` is unset
    pub pool_safety_factor: f64,
    /// Largest accepted source unit
    pub max_source_bytes: u64,
    /// Largest accepted number of source units
    pub max_source_files: usize,
    /// Largest accepted stdin payload
    pub max_stdin_bytes: u64,
    /// RLIMIT_FSIZE applied to every sandbox
    pub max_file_bytes: u64,
    /// RLIMIT_NOFILE applied to every sandbox
    pub max_open_files: u64,
    /// Time between the graceful and the forced termination signal
    pub kill_grace_ms: u64,
    /// Resource accounting poll period
    pub poll_interval_ms: u64,
    /// Bound on how long `destroy` may block its caller
    pub cleanup_timeout_ms: u64,
    /// Bound on waiting for output pipes to close after the sandbox exits
    pub output_drain_timeout_ms: u64,
    /// Workspaces older than this are swept at startup
    pub stale_workspace_age_secs: u64,
    /// Fail with SandboxStartupFailed when an isolation control is unavailable
    pub strict_mode: bool,
    /// Run every sandbox in a fresh network namespace
    pub network_isolation: bool,
    /// Sandbox uid for slot N is `sandbox_uid_base + N`
    pub sandbox_uid_base: u32,
    /// Sandbox gid for slot N is `sandbox_gid_base + N`
    pub sandbox_gid_base: u32,
    /// Delegated cgroup v2 subtree; `None` disables cgroup accounting
    pub cgroup_root: Option<PathBuf>,
    /// JSON file of environment definitions; `None` uses the built-in presets
    pub registry_path: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let euid = nix::unistd::geteuid().as_raw();
        HarnessConfig {
            workspace_root: std::env::temp_dir()
                .join(format!("runbox-uid-{}", euid))
                .join("workspaces"),
            pool_size: None,
            pool_safety_factor: 0.75,
            max_source_bytes: 256 * 1024,
            max_source_files: 64,
            max_stdin_bytes: 1024 * 1024,
            max_file_bytes: 64 * 1024 * 1024,
            max_open_files: 256,
            kill_grace_ms: 500,
            poll_interval_ms: 10,
            cleanup_timeout_ms: 2_000,
            output_drain_timeout_ms: 2_000,
            stale_workspace_age_secs: 3_600,
            strict_mode: true,
            network_isolation: true,
            sandbox_uid_base: 60_000,
            sandbox_gid_base: 60_000,
            cgroup_root: Some(PathBuf::from("/sys/fs/cgroup/runbox")),
            registry_path: None,
        }
    }
}

impl HarnessConfig {
    /// Load and validate a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: HarnessConfig = serde_json::from_str(&content).map_err(|e| {
            HarnessError::Config(format!("Failed to parse config JSON {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Permissive settings for unprivileged hosts and tests
    pub fn permissive(workspace_root: PathBuf) -> Self {
        HarnessConfig {
            workspace_root,
            strict_mode: false,
            ..HarnessConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.pool_size {
            return Err(HarnessError::Config("pool_size must be at least 1".to_string()));
        }
        if !(self.pool_safety_factor > 0.0 && self.pool_safety_factor.is_finite()) {
            return Err(HarnessError::Config(format!(
                "pool_safety_factor must be a positive number, got {}",
                self.pool_safety_factor
            )));
        }
        if self.max_source_bytes == 0 || self.max_source_files == 0 {
            return Err(HarnessError::Config(
                "source size and file count limits must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(HarnessError::Config("poll_interval_ms must be greater than zero".to_string()));
        }
        if self.sandbox_uid_base == 0 || self.sandbox_gid_base == 0 {
            return Err(HarnessError::Config(
                "sandbox identity base must not be root (0)".to_string(),
            ));
        }
        let highest_slot = self.pool_size() as u64;
        if u64::from(self.sandbox_uid_base) + highest_slot > u64::from(u32::MAX - 1)
            || u64::from(self.sandbox_gid_base) + highest_slot > u64::from(u32::MAX - 1)
        {
            return Err(HarnessError::Config(
                "sandbox identity range overflows the uid/gid space".to_string(),
            ));
        }
        if self.workspace_root.as_os_str().is_empty() || !self.workspace_root.is_absolute() {
            return Err(HarnessError::Config(format!(
                "workspace_root must be an absolute path, got '{}'",
                self.workspace_root.display()
            )));
        }
        Ok(())
    }

    /// Effective pool size: configured, or available cores scaled by the safety factor.
    pub fn pool_size(&self) -> usize {
        if let Some(size) = self.pool_size {
            return size.max(1);
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ((cores as f64 * self.pool_safety_factor).floor() as usize).max(1)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_ms)
    }

    pub fn stale_workspace_age(&self) -> Duration {
        Duration::from_secs(self.stale_workspace_age_secs)
    }
}
