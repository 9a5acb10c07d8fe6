/// Resource profiles: the enforced limits for the build and run segments of a submission.
///
/// Defaults come from the environment definition. A caller override may only
/// narrow a limit; any field that would widen it is clamped back to the default.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits for a single segment (build or run)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU time limit in milliseconds
    pub cpu_time_ms: u64,
    /// Wall-clock timeout in milliseconds
    pub wall_time_ms: u64,
    /// Memory ceiling in bytes
    pub memory_bytes: u64,
    /// Maximum number of live processes (threads count under cgroup accounting)
    pub max_processes: u32,
    /// Maximum captured bytes per output stream
    pub max_output_bytes: u64,
}

impl ResourceLimits {
    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    pub fn memory_mb(&self) -> u64 {
        (self.memory_bytes / (1024 * 1024)).max(1)
    }

    /// Apply an override, keeping the smaller of each pair of values.
    pub fn narrowed(&self, over: &LimitOverride) -> ResourceLimits {
        fn clamp<T: Ord + Copy>(default: T, requested: Option<T>) -> T {
            requested.map_or(default, |value| value.min(default))
        }

        ResourceLimits {
            cpu_time_ms: clamp(self.cpu_time_ms, over.cpu_time_ms),
            wall_time_ms: clamp(self.wall_time_ms, over.wall_time_ms),
            memory_bytes: clamp(self.memory_bytes, over.memory_bytes),
            max_processes: clamp(self.max_processes, over.max_processes),
            max_output_bytes: clamp(self.max_output_bytes, over.max_output_bytes),
        }
    }

    /// Zero limits can never admit a workload.
    pub fn validate(&self, context: &str) -> std::result::Result<(), String> {
        let zero = [
            ("cpu_time_ms", self.cpu_time_ms == 0),
            ("wall_time_ms", self.wall_time_ms == 0),
            ("memory_bytes", self.memory_bytes == 0),
            ("max_processes", self.max_processes == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(format!("{context}: {field} must be greater than zero")),
            None => Ok(()),
        }
    }
}

/// Caller-requested limits for one segment. Unset fields keep the default.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitOverride {
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_processes: Option<u32>,
    pub max_output_bytes: Option<u64>,
}

impl LimitOverride {
    pub fn is_empty(&self) -> bool {
        *self == LimitOverride::default()
    }
}

/// Caller override for a whole submission
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceOverride {
    pub build: LimitOverride,
    pub run: LimitOverride,
}

/// Limits for both segments of a submission
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceProfile {
    pub build: ResourceLimits,
    pub run: ResourceLimits,
}

impl ResourceProfile {
    pub fn narrowed(&self, over: &ResourceOverride) -> ResourceProfile {
        ResourceProfile {
            build: self.build.narrowed(&over.build),
            run: self.run.narrowed(&over.run),
        }
    }

    pub fn validate(&self, context: &str) -> std::result::Result<(), String> {
        self.build.validate(&format!("{context}.build"))?;
        self.run.validate(&format!("{context}.run"))
    }

    /// Total wall-clock budget measured from acceptance.
    pub fn total_budget(&self, has_build: bool) -> Duration {
        if has_build {
            self.build.wall_time() + self.run.wall_time()
        } else {
            self.run.wall_time()
        }
    }
}
