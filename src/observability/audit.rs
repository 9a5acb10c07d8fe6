/// Structured audit events
///
/// Every event is one JSON object on the `runbox::audit` log target, so it can be
/// routed separately from diagnostic logging. Host faults are logged at error
/// level; they are the only events meant for operator alerting.
use crate::config::types::{ExecutionStatus, SubmissionId};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "runbox::audit";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    SubmissionAccepted,
    SubmissionRejected,
    QueueTimeout,
    LimitBreach,
    ForcedKill,
    DegradedIsolation,
    SandboxStartupFailure,
    InternalError,
    CleanupAbandoned,
    SubmissionCompleted,
}

impl AuditEventKind {
    pub fn default_severity(self) -> Severity {
        match self {
            AuditEventKind::SandboxStartupFailure
            | AuditEventKind::InternalError
            | AuditEventKind::CleanupAbandoned => Severity::Critical,
            AuditEventKind::SubmissionRejected
            | AuditEventKind::QueueTimeout
            | AuditEventKind::LimitBreach
            | AuditEventKind::ForcedKill
            | AuditEventKind::DegradedIsolation => Severity::Warning,
            AuditEventKind::SubmissionAccepted | AuditEventKind::SubmissionCompleted => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: String,
    pub kind: AuditEventKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission: Option<String>,
    pub details: String,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, details: impl Into<String>) -> Self {
        AuditEvent {
            event_id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
            severity: kind.default_severity(),
            submission: None,
            details: details.into(),
        }
    }

    pub fn for_submission(mut self, id: SubmissionId) -> Self {
        self.submission = Some(id.to_string());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"details\":{:?}}}", self.details))
    }
}

pub fn emit(event: AuditEvent) {
    let line = event.to_json();
    match event.severity {
        Severity::Critical => log::error!(target: AUDIT_TARGET, "{}", line),
        Severity::Warning => log::warn!(target: AUDIT_TARGET, "{}", line),
        Severity::Info => log::info!(target: AUDIT_TARGET, "{}", line),
    }
}

pub fn submission_accepted(id: SubmissionId, language: &str) {
    emit(AuditEvent::new(AuditEventKind::SubmissionAccepted, format!("language={language}")).for_submission(id));
}

pub fn submission_rejected(language: &str, reason: &str) {
    emit(AuditEvent::new(
        AuditEventKind::SubmissionRejected,
        format!("language={language} reason={reason}"),
    ));
}

pub fn queue_timeout(id: SubmissionId, waited_ms: u64) {
    emit(AuditEvent::new(AuditEventKind::QueueTimeout, format!("waited_ms={waited_ms}")).for_submission(id));
}

pub fn limit_breach(id: SubmissionId, stage: &str, breach: &str) {
    emit(AuditEvent::new(AuditEventKind::LimitBreach, format!("stage={stage} breach={breach}")).for_submission(id));
}

pub fn forced_kill(id: SubmissionId, pid: i32, term_sent: bool, waited_ms: u64) {
    emit(
        AuditEvent::new(
            AuditEventKind::ForcedKill,
            format!("pid={pid} term_sent={term_sent} waited_ms={waited_ms}"),
        )
        .for_submission(id),
    );
}

pub fn degraded_isolation(control: &str, reason: &str) {
    emit(AuditEvent::new(
        AuditEventKind::DegradedIsolation,
        format!("control={control} reason={reason}"),
    ));
}

pub fn startup_failure(id: SubmissionId, reason: &str) {
    emit(AuditEvent::new(AuditEventKind::SandboxStartupFailure, reason).for_submission(id));
}

pub fn internal_error(id: SubmissionId, reason: &str) {
    emit(AuditEvent::new(AuditEventKind::InternalError, reason).for_submission(id));
}

pub fn cleanup_abandoned(path: &Path, reason: &str) {
    emit(AuditEvent::new(
        AuditEventKind::CleanupAbandoned,
        format!("path={} reason={reason}", path.display()),
    ));
}

pub fn submission_completed(id: SubmissionId, status: ExecutionStatus, elapsed_ms: u64) {
    emit(
        AuditEvent::new(
            AuditEventKind::SubmissionCompleted,
            format!("status={status} elapsed_ms={elapsed_ms}"),
        )
        .for_submission(id),
    );
}
