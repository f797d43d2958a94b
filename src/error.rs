use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// How an external stage ended when it did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum StageStatus {
    /// Process exited with a non-zero code.
    Exit(i32),
    /// Process was killed by a signal (unix only).
    Signal(i32),
    /// Process could not be started at all.
    SpawnFailed(String),
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Exit(code) => write!(f, "exit code {code}"),
            StageStatus::Signal(sig) => write!(f, "killed by signal {sig}"),
            StageStatus::SpawnFailed(reason) => write!(f, "spawn failed: {reason}"),
        }
    }
}

/// Failure of a single job. Contained to that job; collected by the queue.
#[derive(Clone, Debug, PartialEq, Serialize, thiserror::Error)]
pub enum JobError {
    #[error("input unavailable {path}: {reason}")]
    ResourceUnavailable { path: PathBuf, reason: String },

    #[error("malformed input {path}: {reason}")]
    MalformedInput { path: PathBuf, reason: String },

    #[error("stage `{stage}` failed ({status}){}", stderr_suffix(.stderr_tail))]
    StageExecutionFailed {
        stage: String,
        status: StageStatus,
        stderr_tail: String,
    },

    #[error("scheduler fault: {0}")]
    SchedulerExhausted(String),
}

fn stderr_suffix(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {tail}")
    }
}

impl JobError {
    pub fn unavailable(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        JobError::ResourceUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        JobError::MalformedInput {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn internal(reason: impl fmt::Display) -> Self {
        JobError::SchedulerExhausted(reason.to_string())
    }

    /// Short stage tag for reports ("mask", "load", ...), if the error has one.
    pub fn stage(&self) -> Option<&str> {
        match self {
            JobError::StageExecutionFailed { stage, .. } => Some(stage),
            JobError::MalformedInput { .. } => Some("load"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failure_message_names_stage_and_code() {
        let err = JobError::StageExecutionFailed {
            stage: "mask".into(),
            status: StageStatus::Exit(1),
            stderr_tail: String::new(),
        };
        assert_eq!(err.to_string(), "stage `mask` failed (exit code 1)");
        assert_eq!(err.stage(), Some("mask"));
    }

    #[test]
    fn stderr_tail_is_appended() {
        let err = JobError::StageExecutionFailed {
            stage: "sort".into(),
            status: StageStatus::Signal(9),
            stderr_tail: "out of memory".into(),
        };
        assert_eq!(
            err.to_string(),
            "stage `sort` failed (killed by signal 9): out of memory"
        );
    }
}
