/// Per-submission lifecycle
///
/// Accepted -> Staged -> Running -> Completed -> Cleaned. Any state short of
/// Cleaned may jump straight to Cleaned when a stage fails; nothing leaves
/// Cleaned and no state is revisited.
use crate::config::types::{HarnessError, Result, SubmissionId};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Accepted,
    Staged,
    Running,
    Completed,
    Cleaned,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Accepted => "accepted",
            LifecycleState::Staged => "staged",
            LifecycleState::Running => "running",
            LifecycleState::Completed => "completed",
            LifecycleState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    submission: SubmissionId,
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new(submission: SubmissionId) -> Self {
        Lifecycle {
            submission,
            state: LifecycleState::Accepted,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn advance(&mut self, to: LifecycleState) -> Result<()> {
        use LifecycleState::*;
        let allowed = matches!(
            (self.state, to),
            (Accepted, Staged) | (Staged, Running) | (Running, Completed)
        ) || (to == Cleaned && self.state != Cleaned);

        if !allowed {
            return Err(HarnessError::Lifecycle(format!(
                "{}: illegal transition {} -> {}",
                self.submission, self.state, to
            )));
        }
        log::trace!("{}: {} -> {}", self.submission, self.state, to);
        self.state = to;
        Ok(())
    }
}
