//! Build-then-run scenarios with the built-in Java environment.
//!
//! Skipped when no JDK is installed on the host.

use runbox::{Dispatcher, ExecutionStatus, HarnessConfig, RuntimeRegistry, SourceUnit, Submission};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tempfile::TempDir;

fn jdk_available() -> bool {
    ["javac", "java"].iter().all(|tool| {
        Command::new(tool)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    })
}

fn harness() -> Option<(Dispatcher, TempDir)> {
    if !jdk_available() {
        eprintln!("javac/java not found, skipping");
        return None;
    }
    let dir = TempDir::new().unwrap();
    let mut config = HarnessConfig::permissive(dir.path().join("workspaces"));
    config.cgroup_root = None;
    config.pool_size = Some(1);
    let registry = Arc::new(RuntimeRegistry::builtin().unwrap());
    Some((Dispatcher::new(config, registry).unwrap(), dir))
}

fn fixture(name: &str) -> String {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read_to_string(path).unwrap()
}

#[test]
fn test_calculator_under_a_generic_name() {
    let Some((dispatcher, _dir)) = harness() else { return };

    let result = dispatcher
        .submit(Submission::single("java", "Main.java", &fixture("Calculator.java")))
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Success, "{}", result.stderr.text());

    let stdout = result.stdout.text();
    assert!(stdout.contains("Addition: 15.50 + 4.20 = 19.70"));
    assert!(stdout.contains("Division: 15.50 / 4.20 = 3.69"));
    assert!(stdout.contains("Error: Division by zero!"));
    assert_eq!(stdout.lines().last(), Some("Result: 0.00"));
}

#[test]
fn test_packaged_multi_unit_program_reads_stdin() {
    let Some((dispatcher, _dir)) = harness() else { return };

    let submission = Submission::new(
        "java",
        vec![
            SourceUnit::new("demo/SafeDivide.java", fixture("SafeDivide.java")),
            SourceUnit::new("demo/Util.java", fixture("Util.java")),
        ],
    )
    .with_stdin("84 2\n");
    let result = dispatcher.submit(submission).unwrap();
    assert_eq!(result.status, ExecutionStatus::Success, "{}", result.stderr.text());
    assert_eq!(result.stdout.text(), "84 / 2 = 42\n");
}

#[test]
fn test_compile_error_is_a_build_failure() {
    let Some((dispatcher, _dir)) = harness() else { return };

    let source = "public class Broken {\n    public static void main(String[] a) {\n        int x = \n    }\n}\n";
    let result = dispatcher
        .submit(Submission::single("java", "Broken.java", source))
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::BuildFailed);
    assert!(result.stderr.text().contains("Broken.java"));
}

#[test]
fn test_uncaught_exception_is_a_runtime_error() {
    let Some((dispatcher, _dir)) = harness() else { return };

    let source = "public class Boom {\n    public static void main(String[] a) {\n        throw new IllegalStateException(\"nope\");\n    }\n}\n";
    let result = dispatcher
        .submit(Submission::single("java", "Boom.java", source))
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::RuntimeError);
    assert!(result.stderr.text().contains("IllegalStateException"));
}

#[test]
fn test_heap_exhaustion_is_resource_exceeded() {
    let Some((dispatcher, _dir)) = harness() else { return };

    let source = r#"import java.util.ArrayList;
public class Hog {
    public static void main(String[] a) {
        ArrayList<long[]> keep = new ArrayList<>();
        while (true) {
            keep.add(new long[1 << 20]);
        }
    }
}
"#;
    let result = dispatcher
        .submit(Submission::single("java", "Hog.java", source))
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::ResourceExceeded, "{:?}", result.detail);
}
