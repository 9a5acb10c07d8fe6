//! Isolation checks that need root: identity switching, mount and network
//! namespaces. They are skipped off root and on hosts that refuse a bare
//! mount-namespace unshare; anywhere else identity and namespaces must be in force.

use runbox::config::limits::ResourceLimits;
use runbox::exec::executor::ProcessSandbox;
use runbox::runtime::environment::{EntryPointRule, EnvironmentDefinition, IsolationImage};
use runbox::{Dispatcher, ExecutionStatus, HarnessConfig, ResourceProfile, RuntimeRegistry, Submission};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

fn shell() -> EnvironmentDefinition {
    let limits = ResourceLimits {
        cpu_time_ms: 2_000,
        wall_time_ms: 5_000,
        memory_bytes: 64 * 1024 * 1024,
        max_processes: 8,
        max_output_bytes: 4096,
    };
    EnvironmentDefinition {
        language: "sh".to_string(),
        aliases: Vec::new(),
        display_name: "POSIX shell".to_string(),
        source_extension: "sh".to_string(),
        entry_point: EntryPointRule::MainUnit,
        build: None,
        run: vec!["/bin/sh".to_string(), "{main}".to_string()],
        image: IsolationImage::Host,
        environment: BTreeMap::new(),
        defaults: ResourceProfile { build: limits, run: limits },
        address_space_factor: None,
        oom_markers: Vec::new(),
        probes: Vec::new(),
        enabled: true,
    }
}

/// Root with CAP_SYS_ADMIN, independent of anything the harness does
fn host_allows_namespaces() -> bool {
    let mut cmd = Command::new("/bin/sh");
    cmd.args(["-c", "exit 0"]);
    // SAFETY: unshare is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            if libc::unshare(libc::CLONE_NEWNS | libc::CLONE_NEWNET) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.status().map(|status| status.success()).unwrap_or(false)
}

fn harness() -> Option<(Dispatcher, TempDir)> {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("not running as root, skipping");
        return None;
    }
    if !host_allows_namespaces() {
        eprintln!("host refuses namespaces, skipping");
        return None;
    }
    let dir = TempDir::new().unwrap();
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o711)).unwrap();

    let mut config = HarnessConfig::permissive(dir.path().join("workspaces"));
    config.cgroup_root = None;
    config.pool_size = Some(1);

    let sandbox = ProcessSandbox::new(&config);
    for (control, reason) in sandbox.degraded_controls() {
        assert_eq!(*control, "cgroup", "{control} isolation degraded: {reason}");
    }
    let registry = Arc::new(RuntimeRegistry::from_definitions(vec![shell()]).unwrap());
    let dispatcher = Dispatcher::with_executor(config, registry, Arc::new(sandbox)).unwrap();
    Some((dispatcher, dir))
}

fn run(dispatcher: &Dispatcher, script: &str) -> String {
    let result = dispatcher
        .submit(Submission::single("sh", "main.sh", script))
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Success, "{}", result.stderr.text());
    result.stdout.text()
}

#[test]
fn test_sandbox_runs_as_slot_identity() {
    let Some((dispatcher, _dir)) = harness() else { return };
    let out = run(&dispatcher, "id -u; id -g; touch owned && stat -c %u owned");
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines, ["60000", "60000", "60000"]);
}

#[test]
fn test_sandbox_has_no_network() {
    let Some((dispatcher, _dir)) = harness() else { return };
    // Only the loopback device exists in a fresh network namespace.
    let out = run(&dispatcher, "grep -c ':' /proc/net/dev");
    assert_eq!(out.trim(), "1");
}

#[test]
fn test_sibling_workspaces_are_hidden() {
    let Some((dispatcher, dir)) = harness() else { return };
    let sibling = dir.path().join("workspaces").join("sub-000999-sibling");
    std::fs::create_dir(&sibling).unwrap();
    std::fs::write(sibling.join("secret.txt"), "hidden").unwrap();

    let out = run(
        &dispatcher,
        "ls -A .. | wc -l; cat ../sub-000999-sibling/secret.txt 2>/dev/null || echo unreadable",
    );
    let lines: Vec<&str> = out.lines().map(str::trim).collect();
    assert_eq!(lines, ["1", "unreadable"]);
    std::fs::remove_dir_all(sibling).unwrap();
}

#[test]
fn test_host_mounts_are_untouched() {
    let Some((dispatcher, dir)) = harness() else { return };
    run(&dispatcher, "echo ok");
    // The tmpfs over the workspace root lives only in the sandbox's namespace.
    let mounts = std::fs::read_to_string("/proc/self/mountinfo").unwrap();
    let root = dir.path().join("workspaces");
    assert!(!mounts.contains(root.to_str().unwrap()));
}

#[test]
fn test_fork_refused_by_identity_limit_is_resource_exceeded() {
    let Some((dispatcher, _dir)) = harness() else { return };
    // RLIMIT_NPROC under the slot identity refuses the ninth process.
    let result = dispatcher
        .submit(Submission::single(
            "sh",
            "main.sh",
            "i=0; while [ $i -lt 20 ]; do sleep 5 & i=$((i + 1)); done; wait",
        ))
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::ResourceExceeded, "{:?}", result.detail);
}
