pub mod c;
pub mod cpp;
pub mod java;
pub mod python;

use crate::config::limits::ResourceLimits;
use crate::runtime::environment::EnvironmentDefinition;

const MB: u64 = 1024 * 1024;

fn limits(memory_mb: u64, max_processes: u32, cpu_ms: u64, wall_ms: u64) -> ResourceLimits {
    ResourceLimits {
        cpu_time_ms: cpu_ms,
        wall_time_ms: wall_ms,
        memory_bytes: memory_mb * MB,
        max_processes,
        max_output_bytes: 64 * 1024,
    }
}

/// Built-in environments, in registry order
pub fn builtin() -> Vec<EnvironmentDefinition> {
    vec![
        python::definition(),
        c::definition(),
        cpp::definition(),
        java::definition(),
    ]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
