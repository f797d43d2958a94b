use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::JobError;
use crate::snapshot::SnapshotRef;

/// Leaf recording, discovered once per run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Unit {
    pub name: String,
    pub path: PathBuf,
}

/// Units sharing one output directory, ascending by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Group {
    pub name: String,
    pub units: Vec<Unit>,
}

/// One scheduled execution. Owned by the queue until it reaches a result.
#[derive(Clone, Debug)]
pub struct Job {
    /// `<group>/<unit>`, used in logs and reports.
    pub label: String,
    pub config: Arc<PipelineConfig>,
    pub input: SnapshotRef,
    pub output: PathBuf,
    pub force_run: bool,
}

/// Terminal state of a job.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    Succeeded { output: PathBuf },
    CacheHit { output: PathBuf },
    Failed { error: JobError },
}

impl JobResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, JobResult::Failed { .. })
    }

    pub fn output(&self) -> Option<&PathBuf> {
        match self {
            JobResult::Succeeded { output } | JobResult::CacheHit { output } => Some(output),
            JobResult::Failed { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct JobReport {
    pub label: String,
    /// Content digest of the input; empty when the input could not be read.
    pub input_digest: String,
    pub result: JobResult,
    pub elapsed_ms: u64,
}

/// Outcome of a whole batch, in submission order.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    pub fn from_jobs(jobs: Vec<JobReport>) -> Self {
        let mut report = BatchReport::default();
        for j in &jobs {
            match j.result {
                JobResult::Succeeded { .. } => report.succeeded += 1,
                JobResult::CacheHit { .. } => report.cache_hits += 1,
                JobResult::Failed { .. } => report.failed += 1,
            }
        }
        report.jobs = jobs;
        report
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.result.is_failure())
    }

    pub fn get(&self, label: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.label == label).map(|j| &j.result)
    }
}
