//! Job queue: a fixed-size worker pool in front of the cache.
//!
//! Jobs start in submission order on a rayon pool of exactly `num_jobs`
//! threads. Executions of the same cache key are serialised by a per-key
//! lock; whoever comes second re-checks the cache and reports a hit.
//! A job's failure (or panic) is confined to its own result.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::error::JobError;
use crate::types::{BatchReport, Job, JobReport, JobResult};
use crate::workspace::with_workspace;

/// Whatever turns one job into its output file. The scheduler owns caching,
/// workspaces and concurrency; a runner only has to write `job.output`.
pub trait UnitRunner: Send + Sync + 'static {
    fn run(&self, job: &Job, workspace: &Path) -> Result<(), JobError>;
}

struct Shared {
    runner: Arc<dyn UnitRunner>,
    cache: Arc<CacheStore>,
    workspace_root: PathBuf,
    key_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    // keys committed by this batch; force_run does not bypass these
    fresh: Mutex<HashSet<CacheKey>>,
}

impl Shared {
    fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    fn is_fresh(&self, key: &CacheKey) -> bool {
        self.fresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    fn mark_fresh(&self, key: CacheKey) {
        self.fresh
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
    }

    fn execute(&self, job: &Job) -> Result<JobResult, JobError> {
        let key = CacheKey::compute(&job.config, &job.input).map_err(JobError::internal)?;

        let lock = self.key_lock(&key);
        let _held = lock.lock().unwrap_or_else(|e| e.into_inner());

        let bypass = job.force_run && !self.is_fresh(&key);
        if !bypass {
            if let Some(entry) = self.cache.lookup(&key).map_err(JobError::internal)? {
                self.cache
                    .materialize(&entry, &job.output)
                    .map_err(JobError::internal)?;
                debug!(key = %key, seq = entry.seq, "cache hit");
                return Ok(JobResult::CacheHit {
                    output: job.output.clone(),
                });
            }
        }

        debug!(key = %key, force_run = job.force_run, "running pipeline");
        with_workspace(&self.workspace_root, |ws| self.runner.run(job, ws))?;

        // the result is only reported once the entry is durable
        self.cache
            .commit(&key, &job.config, &job.input, &job.output)
            .map_err(JobError::internal)?;
        self.mark_fresh(key);
        Ok(JobResult::Succeeded {
            output: job.output.clone(),
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Lives for one batch. `wait_all` consumes it and joins every job.
pub struct JobQueue {
    pool: rayon::ThreadPool,
    shared: Arc<Shared>,
    tx: mpsc::Sender<(usize, JobReport)>,
    rx: mpsc::Receiver<(usize, JobReport)>,
    slots: Vec<Option<JobReport>>,
    num_jobs: usize,
}

impl JobQueue {
    pub fn new(
        num_jobs: usize,
        runner: Arc<dyn UnitRunner>,
        cache: Arc<CacheStore>,
        workspace_root: impl Into<PathBuf>,
    ) -> Result<Self, JobError> {
        if num_jobs == 0 {
            return Err(JobError::internal("num_jobs must be at least 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_jobs)
            .thread_name(|i| format!("sort-worker-{i}"))
            .build()
            .map_err(|e| JobError::internal(format!("build worker pool: {e}")))?;
        let (tx, rx) = mpsc::channel();

        Ok(Self {
            pool,
            shared: Arc::new(Shared {
                runner,
                cache,
                workspace_root: workspace_root.into(),
                key_locks: Mutex::new(HashMap::new()),
                fresh: Mutex::new(HashSet::new()),
            }),
            tx,
            rx,
            slots: Vec::new(),
            num_jobs,
        })
    }

    pub fn num_jobs(&self) -> usize {
        self.num_jobs
    }

    /// Enqueue `job`; returns its slot in the final report.
    pub fn submit(&mut self, job: Job) -> usize {
        let slot = self.slots.len();
        self.slots.push(None);

        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        debug!(slot, label = %job.label, "job queued");

        self.pool.spawn_fifo(move || {
            let span = info_span!("job", label = %job.label);
            let _enter = span.enter();
            let started = Instant::now();

            let result = match catch_unwind(AssertUnwindSafe(|| shared.execute(&job))) {
                Ok(Ok(result)) => result,
                Ok(Err(error)) => JobResult::Failed { error },
                Err(payload) => JobResult::Failed {
                    error: JobError::internal(format!("job panicked: {}", panic_message(&*payload))),
                },
            };
            match &result {
                JobResult::Failed { error } => warn!("job failed: {error}"),
                JobResult::CacheHit { .. } => info!("cache hit"),
                JobResult::Succeeded { .. } => info!(elapsed_ms = started.elapsed().as_millis() as u64, "job done"),
            }

            let report = JobReport {
                label: job.label.clone(),
                input_digest: job.input.digest.clone(),
                result,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            // receiver only goes away if wait_all was never called
            let _ = tx.send((slot, report));
        });
        slot
    }

    /// Record a unit that never became a job (e.g. its input could not be
    /// snapshotted). Takes a slot without using a worker.
    pub fn record_failure(&mut self, label: impl Into<String>, error: JobError) -> usize {
        let label = label.into();
        warn!(%label, "job failed before scheduling: {error}");
        let slot = self.slots.len();
        self.slots.push(Some(JobReport {
            label,
            input_digest: String::new(),
            result: JobResult::Failed { error },
            elapsed_ms: 0,
        }));
        slot
    }

    /// Block until every submitted job has a terminal result.
    pub fn wait_all(self) -> BatchReport {
        let JobQueue {
            pool,
            tx,
            rx,
            mut slots,
            ..
        } = self;
        drop(tx);

        // ends once every job has sent and dropped its sender
        for (slot, report) in rx {
            slots[slot] = Some(report);
        }
        drop(pool);

        let jobs = slots
            .into_iter()
            .enumerate()
            .map(|(slot, r)| {
                r.unwrap_or_else(|| JobReport {
                    label: format!("#{slot}"),
                    input_digest: String::new(),
                    result: JobResult::Failed {
                        error: JobError::internal("job ended without a result"),
                    },
                    elapsed_ms: 0,
                })
            })
            .collect();
        BatchReport::from_jobs(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::StageStatus;
    use crate::snapshot::SnapshotRef;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct Probe {
        active: AtomicUsize,
        peak: AtomicUsize,
        runs: AtomicUsize,
        delay_ms: u64,
        fail_label: Option<String>,
        panic_label: Option<String>,
        workspaces: Mutex<Vec<PathBuf>>,
    }

    impl UnitRunner for Probe {
        fn run(&self, job: &Job, workspace: &Path) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.workspaces.lock().unwrap().push(workspace.to_path_buf());
            fs::write(workspace.join("scratch"), b"x").unwrap();
            thread::sleep(Duration::from_millis(self.delay_ms));
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.panic_label.as_deref() == Some(job.label.as_str()) {
                panic!("boom");
            }
            if self.fail_label.as_deref() == Some(job.label.as_str()) {
                return Err(JobError::StageExecutionFailed {
                    stage: "mask".into(),
                    status: StageStatus::Exit(1),
                    stderr_tail: String::new(),
                });
            }
            fs::create_dir_all(job.output.parent().unwrap()).unwrap();
            fs::write(&job.output, format!("{}:{}", job.input.digest, job.config.detect_threshold)).unwrap();
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        cache: Arc<CacheStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let cache = Arc::new(CacheStore::open(&dir.path().join("cache")).unwrap());
            Self { dir, cache }
        }

        fn ws_root(&self) -> PathBuf {
            self.dir.path().join("tmp")
        }

        fn queue(&self, n: usize, probe: &Arc<Probe>) -> JobQueue {
            JobQueue::new(n, probe.clone(), self.cache.clone(), self.ws_root()).unwrap()
        }

        fn job(&self, label: &str, digest: &str, force_run: bool) -> Job {
            Job {
                label: label.to_string(),
                config: Arc::new(PipelineConfig::default()),
                input: SnapshotRef {
                    digest: digest.repeat(64 / digest.len()),
                    size: 1,
                    location: PathBuf::from(digest),
                },
                output: self.dir.path().join("out").join(label).join("firings.mda"),
                force_run,
            }
        }
    }

    fn probe(delay_ms: u64) -> Arc<Probe> {
        Arc::new(Probe {
            delay_ms,
            ..Probe::default()
        })
    }

    #[test]
    fn concurrency_never_exceeds_num_jobs() {
        for n in [1, 3] {
            let fx = Fixture::new();
            let p = probe(25);
            let mut q = fx.queue(n, &p);
            for i in 0..8 {
                q.submit(fx.job(&format!("u{i}"), &format!("{i:02}"), false));
            }
            let report = q.wait_all();
            assert_eq!(report.succeeded, 8);
            assert_eq!(p.runs.load(Ordering::SeqCst), 8);
            let peak = p.peak.load(Ordering::SeqCst);
            assert!(peak <= n, "peak {peak} > {n}");
        }
    }

    #[test]
    fn identical_keys_execute_once() {
        let fx = Fixture::new();
        let p = probe(30);
        let mut q = fx.queue(4, &p);
        for i in 0..4 {
            q.submit(fx.job(&format!("copy{i}"), "ab", true));
        }
        let report = q.wait_all();

        assert_eq!(p.runs.load(Ordering::SeqCst), 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.cache_hits, 3);
        let first = fs::read(report.jobs[0].result.output().unwrap()).unwrap();
        for j in &report.jobs {
            assert_eq!(fs::read(j.result.output().unwrap()).unwrap(), first);
        }
    }

    #[test]
    fn second_batch_hits_cache_unless_forced() {
        let fx = Fixture::new();
        let p = probe(0);

        let mut q = fx.queue(1, &p);
        q.submit(fx.job("a", "ab", false));
        assert_eq!(q.wait_all().succeeded, 1);

        let mut q = fx.queue(1, &p);
        q.submit(fx.job("a", "ab", false));
        let report = q.wait_all();
        assert_eq!(report.cache_hits, 1);
        assert_eq!(p.runs.load(Ordering::SeqCst), 1);

        let mut q = fx.queue(1, &p);
        q.submit(fx.job("a", "ab", true));
        assert_eq!(q.wait_all().succeeded, 1);
        assert_eq!(p.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_does_not_cancel_siblings() {
        let fx = Fixture::new();
        let p = Arc::new(Probe {
            delay_ms: 10,
            fail_label: Some("bad".into()),
            ..Probe::default()
        });
        let mut q = fx.queue(2, &p);
        q.submit(fx.job("good1", "01", false));
        q.submit(fx.job("bad", "02", false));
        q.submit(fx.job("good2", "03", false));
        let report = q.wait_all();

        assert_eq!((report.succeeded, report.failed), (2, 1));
        match &report.jobs[1].result {
            JobResult::Failed {
                error: JobError::StageExecutionFailed { stage, status, .. },
            } => {
                assert_eq!(stage, "mask");
                assert_eq!(*status, StageStatus::Exit(1));
            }
            other => panic!("unexpected {other:?}"),
        }
        // nothing was cached for the failed key
        let key = CacheKey::compute(&PipelineConfig::default(), &fx.job("bad", "02", false).input).unwrap();
        assert_eq!(fx.cache.entry_count(&key).unwrap(), 0);
    }

    #[test]
    fn panic_becomes_scheduler_fault() {
        let fx = Fixture::new();
        let p = Arc::new(Probe {
            panic_label: Some("explodes".into()),
            ..Probe::default()
        });
        let mut q = fx.queue(1, &p);
        q.submit(fx.job("explodes", "01", false));
        q.submit(fx.job("fine", "02", false));
        let report = q.wait_all();

        assert!(matches!(
            report.get("explodes"),
            Some(JobResult::Failed { error: JobError::SchedulerExhausted(_) })
        ));
        assert!(matches!(report.get("fine"), Some(JobResult::Succeeded { .. })));
    }

    #[test]
    fn workspaces_are_gone_after_every_outcome() {
        let fx = Fixture::new();
        let p = Arc::new(Probe {
            fail_label: Some("bad".into()),
            panic_label: Some("explodes".into()),
            ..Probe::default()
        });
        let mut q = fx.queue(2, &p);
        q.submit(fx.job("ok", "01", false));
        q.submit(fx.job("bad", "02", false));
        q.submit(fx.job("explodes", "03", false));
        q.wait_all();

        let seen = p.workspaces.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|ws| !ws.exists()));
        assert_eq!(fs::read_dir(fx.ws_root()).unwrap().count(), 0);
    }

    #[test]
    fn recorded_failures_keep_their_slot() {
        let fx = Fixture::new();
        let p = probe(0);
        let mut q = fx.queue(1, &p);
        q.submit(fx.job("first", "01", false));
        q.record_failure("missing", JobError::unavailable("/nope", "not found"));
        q.submit(fx.job("third", "03", false));
        let report = q.wait_all();

        let labels: Vec<&str> = report.jobs.iter().map(|j| j.label.as_str()).collect();
        assert_eq!(labels, ["first", "missing", "third"]);
        assert_eq!(report.failed, 1);
        assert_eq!(p.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_workers_rejected() {
        let fx = Fixture::new();
        assert!(JobQueue::new(0, probe(0), fx.cache.clone(), fx.ws_root()).is_err());
    }
}
