/// Core types shared by every stage of the harness: submissions, results and errors
use crate::config::limits::ResourceOverride;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Monotonically unique identifier assigned to a submission at acceptance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubmissionId(pub u64);

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{:06}", self.0)
    }
}

/// One named source file of a submission
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceUnit {
    /// Relative path inside the workspace
    pub name: String,
    /// File content, written verbatim
    pub content: String,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// A request to build and run source code in one language
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    /// Language identifier or alias, resolved through the runtime registry
    pub language: String,
    /// Source units; the first unit with the environment's extension is the main unit
    pub sources: Vec<SourceUnit>,
    /// Data written to the run step's stdin
    #[serde(default)]
    pub stdin: Option<Vec<u8>>,
    /// Caller limits, applied by narrowing the environment defaults
    #[serde(default)]
    pub resource_override: Option<ResourceOverride>,
}

impl Submission {
    pub fn new(language: impl Into<String>, sources: Vec<SourceUnit>) -> Self {
        Self {
            language: language.into(),
            sources,
            stdin: None,
            resource_override: None,
        }
    }

    /// Single-file submission
    pub fn single(language: impl Into<String>, name: &str, content: &str) -> Self {
        Self::new(language, vec![SourceUnit::new(name, content)])
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_override(mut self, resource_override: ResourceOverride) -> Self {
        self.resource_override = Some(resource_override);
        self
    }
}

/// Final status of an accepted submission
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    /// Run step exited with status 0
    Success,
    /// Build step failed or exceeded its own limits; run never attempted
    BuildFailed,
    /// Run step exited non-zero or died from a signal
    RuntimeError,
    /// Wall-clock, CPU time or the absolute deadline was exceeded
    TimedOut,
    /// Memory or process-count ceiling was breached
    ResourceExceeded,
    /// The isolated environment could not be created
    SandboxStartupFailed,
    /// Fault inside the harness itself
    InternalError,
}

impl ExecutionStatus {
    /// Host or harness faults, the only statuses eligible for operator alerting
    pub fn is_host_fault(self) -> bool {
        matches!(
            self,
            ExecutionStatus::SandboxStartupFailed | ExecutionStatus::InternalError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::BuildFailed => "build_failed",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::ResourceExceeded => "resource_exceeded",
            ExecutionStatus::SandboxStartupFailed => "sandbox_startup_failed",
            ExecutionStatus::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured output of one stream
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    /// Set when the program wrote more than the output limit
    pub truncated: bool,
}

impl CapturedStream {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The external result contract, produced exactly once per accepted submission
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub elapsed_millis: u64,
    pub peak_memory_bytes: Option<u64>,
    /// Human-readable reason for a non-success status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExecutionResult {
    /// Result for a fault that produced no process output
    pub fn without_output(status: ExecutionStatus, elapsed_millis: u64, detail: String) -> Self {
        Self {
            status,
            exit_code: None,
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            elapsed_millis,
            peak_memory_bytes: None,
            detail: Some(detail),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Caller errors: the submission never enters the pipeline, or expired before a slot was free
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("{id} deadline expired after {waited_ms}ms in the queue")]
    QueueTimedOut { id: SubmissionId, waited_ms: u64 },
}

/// Internal errors raised by the harness stages
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Host resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

impl From<nix::errno::Errno> for HarnessError {
    fn from(err: nix::errno::Errno) -> Self {
        HarnessError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_id_display_is_stable() {
        assert_eq!(SubmissionId(42).to_string(), "sub-000042");
        assert_eq!(SubmissionId(1_234_567).to_string(), "sub-1234567");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ExecutionStatus::ResourceExceeded).unwrap();
        assert_eq!(json, "\"ResourceExceeded\"");
        assert_eq!(ExecutionStatus::TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_host_fault_classification() {
        assert!(ExecutionStatus::SandboxStartupFailed.is_host_fault());
        assert!(ExecutionStatus::InternalError.is_host_fault());
        assert!(!ExecutionStatus::RuntimeError.is_host_fault());
        assert!(!ExecutionStatus::TimedOut.is_host_fault());
    }

    #[test]
    fn test_result_contract_shape() {
        let result = ExecutionResult {
            status: ExecutionStatus::Success,
            exit_code: Some(0),
            stdout: CapturedStream {
                bytes: b"hi\n".to_vec(),
                truncated: false,
            },
            stderr: CapturedStream::default(),
            elapsed_millis: 12,
            peak_memory_bytes: Some(4096),
            detail: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "Success");
        assert_eq!(value["stdout"]["truncated"], false);
        assert!(value.get("detail").is_none());
        assert_eq!(result.stdout.text(), "hi\n");
    }

    #[test]
    fn test_submission_deserializes_without_optional_fields() {
        let submission: Submission = serde_json::from_str(
            r#"{"language":"python","sources":[{"name":"main.py","content":"print(1)"}]}"#,
        )
        .unwrap();
        assert!(submission.stdin.is_none());
        assert!(submission.resource_override.is_none());
        assert_eq!(submission.sources[0].name, "main.py");
    }
}
