//! Out-of-process stage invocation.
//!
//! Commands are launched from an argument vector, never through a shell, so
//! paths with spaces or metacharacters reach the program untouched.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{JobError, StageStatus};

/// Names accepted inside `{...}` in external argument templates.
pub const PLACEHOLDERS: &[&str] = &[
    "input",
    "output",
    "sample_rate",
    "detect_sign",
    "adjacency_radius",
    "clip_size",
    "detect_threshold",
    "detect_interval",
    "num_workers",
];

const STDERR_TAIL_LINES: usize = 5;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("placeholder pattern"));

pub fn placeholders_in(arg: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(arg)
        .map(|c| c[1].to_string())
        .collect()
}

/// Expand `{name}` in every argument. Unknown names are left as written;
/// config validation rejects them before a job is ever built.
pub fn substitute(args: &[String], values: &BTreeMap<&str, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            PLACEHOLDER_RE
                .replace_all(arg, |c: &Captures| match values.get(&c[1]) {
                    Some(v) => v.clone(),
                    None => c[0].to_string(),
                })
                .into_owned()
        })
        .collect()
}

/// Run `program args...`, block until it exits, map failure to
/// `StageExecutionFailed`. No retries.
pub fn run(stage: &str, program: &str, args: &[String]) -> Result<(), JobError> {
    info!(stage, program, ?args, "starting external stage");
    let started = Instant::now();

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| JobError::StageExecutionFailed {
            stage: stage.to_string(),
            status: StageStatus::SpawnFailed(format!("{program}: {e}")),
            stderr_tail: String::new(),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stdout.lines() {
        debug!(stage, "stdout: {line}");
    }
    for line in stderr.lines() {
        debug!(stage, "stderr: {line}");
    }

    debug!(stage, elapsed_ms = started.elapsed().as_millis() as u64, status = %output.status);

    match failure_status(output.status) {
        None => Ok(()),
        Some(status) => Err(JobError::StageExecutionFailed {
            stage: stage.to_string(),
            status,
            stderr_tail: tail(&stderr, STDERR_TAIL_LINES),
        }),
    }
}

fn failure_status(status: ExitStatus) -> Option<StageStatus> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(StageStatus::Exit(code));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return Some(StageStatus::Signal(sig));
        }
    }
    Some(StageStatus::Exit(-1))
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}
