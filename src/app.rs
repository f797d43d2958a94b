use crate::autotune;
use crate::cache::{CacheKey, CacheStore};
use crate::config::PipelineConfig;
use crate::fs_scan::{self, ScanOptions};
use crate::hw::HwInfo;
use crate::pipeline::UnitPipeline;
use crate::scheduler::{JobQueue, UnitRunner};
use crate::snapshot::{self, SnapshotStore};
use crate::types::{BatchReport, Group, Job, JobResult};
use crate::workspace;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

/// Workspaces older than this were left behind by a killed run.
const STALE_WORKSPACE_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const REPORT_FILE: &str = "sort_report.json";

pub struct AppConfig {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub cache_root: PathBuf,

    pub num_jobs: usize,
    pub force_run: bool,
    /// Overrides the auto-tuned value.
    pub detect_threads: Option<usize>,
    pub artifact_name: String,
    /// Store private copies of inputs under the cache root.
    pub keep_snapshots: bool,

    pub scan: ScanOptions,
    pub pipeline: PipelineConfig,
    pub hw: HwInfo,
}

impl AppConfig {
    pub fn snapshot_root(&self) -> PathBuf {
        self.cache_root.join("snapshots")
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.cache_root.join("tmp")
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_root.join(REPORT_FILE)
    }
}

/* =========================
   Helpers
   ========================= */

fn label(group: &Group, unit: &crate::types::Unit) -> String {
    format!("{}/{}", group.name, unit.name)
}

fn discover(cfg: &AppConfig) -> Result<Vec<Group>> {
    let groups = fs_scan::discover(&cfg.input_root, &cfg.scan)?;
    if groups.is_empty() {
        warn!("No units found under {}", cfg.input_root.display());
    }
    Ok(groups)
}

pub fn detect_threads(cfg: &AppConfig) -> usize {
    let tuned = autotune::auto_tune(&cfg.hw, cfg.num_jobs);
    if tuned.oversubscribed {
        warn!(
            "num_jobs={} exceeds logical cores={}; pipelines will compete for CPU",
            cfg.num_jobs, cfg.hw.logical_cpus
        );
    }
    let threads = cfg.detect_threads.unwrap_or(tuned.detect_threads_per_job).max(1);
    info!(
        "AUTO-TUNE: disk={:?}, cores={}, ram={}MB, num_jobs={}, detect_threads/job={} (override={:?})",
        cfg.hw.disk_kind,
        cfg.hw.logical_cpus,
        cfg.hw.total_ram_mb,
        cfg.num_jobs,
        threads,
        cfg.detect_threads
    );
    threads
}

/* =========================
   list / plan
   ========================= */

pub fn list_units(cfg: &AppConfig) -> Result<()> {
    let groups = discover(cfg)?;
    println!("Groups discovered:");
    for g in &groups {
        println!("  - {} ({} units)", g.name, g.units.len());
        for u in &g.units {
            println!("      {} <- {}", u.name, u.path.display());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Hit,
    Pending,
    Unreadable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanItem {
    pub label: String,
    pub output: PathBuf,
    pub status: PlanStatus,
}

/// Cache status of every unit. Reads only: nothing is snapshotted, run
/// or written.
pub fn plan(cfg: &AppConfig) -> Result<Vec<PlanItem>> {
    let groups = discover(cfg)?;
    let cache = CacheStore::open_read_only(&cfg.cache_root)
        .with_context(|| format!("open cache {}", cfg.cache_root.display()))?;

    let mut items = Vec::new();
    for g in &groups {
        for u in &g.units {
            let status = match snapshot::identify(&u.path) {
                Err(e) => PlanStatus::Unreadable(e.to_string()),
                Ok(_) if cfg.force_run => PlanStatus::Pending,
                Ok(snap) => {
                    let key = CacheKey::compute(&cfg.pipeline, &snap)?;
                    let hit = match &cache {
                        Some(c) => c.lookup(&key)?.is_some(),
                        None => false,
                    };
                    if hit { PlanStatus::Hit } else { PlanStatus::Pending }
                }
            };
            items.push(PlanItem {
                label: label(g, u),
                output: fs_scan::output_path(&cfg.output_root, g, u, &cfg.artifact_name),
                status,
            });
        }
    }

    println!("=== SORT PLAN ===");
    println!("Operation : {}@{}", cfg.pipeline.operation.name, cfg.pipeline.operation.version);
    println!("Force run : {}", cfg.force_run);
    for it in &items {
        match &it.status {
            PlanStatus::Hit => println!("  [hit]     {}", it.label),
            PlanStatus::Pending => println!("  [pending] {}", it.label),
            PlanStatus::Unreadable(e) => println!("  [error]   {} ({e})", it.label),
        }
    }
    Ok(items)
}

/* =========================
   sort
   ========================= */

/// Sweep leftovers from interrupted runs.
pub fn auto_cleanup(cfg: &AppConfig) {
    let removed = workspace::sweep_stale(&cfg.workspace_root(), STALE_WORKSPACE_AGE);
    if removed > 0 {
        info!("[AUTO-CLEAN] Removed {} stale workspace(s)", removed);
    }
}

/// Snapshot every unit, push one job per unit through a fresh queue and
/// wait for all of them.
pub fn run_batch(cfg: &AppConfig, runner: Arc<dyn UnitRunner>) -> Result<BatchReport> {
    cfg.pipeline
        .validate()
        .context("invalid pipeline parameters")?;
    let groups = discover(cfg)?;

    let snapshots = SnapshotStore::open(cfg.snapshot_root(), cfg.keep_snapshots)
        .with_context(|| format!("open snapshot store {}", cfg.snapshot_root().display()))?;
    let cache = Arc::new(
        CacheStore::open(&cfg.cache_root)
            .with_context(|| format!("open cache {}", cfg.cache_root.display()))?,
    );
    let mut queue = JobQueue::new(cfg.num_jobs, runner, cache, cfg.workspace_root())
        .map_err(|e| anyhow!("job queue: {e}"))?;

    let config = Arc::new(cfg.pipeline.clone());
    let total: usize = groups.iter().map(|g| g.units.len()).sum();
    info!("Submitting {} unit(s) with num_jobs={}", total, cfg.num_jobs);

    for g in &groups {
        for u in &g.units {
            let label = label(g, u);
            match snapshots.snapshot(&u.path) {
                Ok(input) => {
                    queue.submit(Job {
                        label,
                        config: Arc::clone(&config),
                        input,
                        output: fs_scan::output_path(&cfg.output_root, g, u, &cfg.artifact_name),
                        force_run: cfg.force_run,
                    });
                }
                Err(e) => {
                    queue.record_failure(label, e);
                }
            }
        }
    }

    Ok(queue.wait_all())
}

#[derive(Serialize)]
struct ReportFile<'a> {
    generated_at: String,
    num_jobs: usize,
    force_run: bool,
    config: &'a PipelineConfig,
    #[serde(flatten)]
    report: &'a BatchReport,
}

pub fn write_report(cfg: &AppConfig, report: &BatchReport) -> Result<PathBuf> {
    let path = cfg.report_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = ReportFile {
        generated_at: OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default(),
        num_jobs: cfg.num_jobs,
        force_run: cfg.force_run,
        config: &cfg.pipeline,
        report,
    };
    let s = serde_json::to_string_pretty(&body)?;
    std::fs::write(&path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Run the full batch, write the report, fail if any unit failed.
pub fn sort(cfg: &AppConfig) -> Result<BatchReport> {
    auto_cleanup(cfg);
    let runner = Arc::new(UnitPipeline::new(detect_threads(cfg)));
    let report = run_batch(cfg, runner)?;
    let path = write_report(cfg, &report)?;
    info!("Report written to {}", path.display());

    for j in &report.jobs {
        match &j.result {
            JobResult::Succeeded { output } => info!("  [ok]    {} -> {}", j.label, output.display()),
            JobResult::CacheHit { output } => info!("  [cache] {} -> {}", j.label, output.display()),
            JobResult::Failed { .. } => {}
        }
    }

    if report.failed == 0 {
        info!(
            "DONE: succeeded={}, cache_hits={}",
            report.succeeded, report.cache_hits
        );
        return Ok(report);
    }

    warn!(
        "DONE WITH ERRORS: succeeded={}, cache_hits={}, failed={}",
        report.succeeded, report.cache_hits, report.failed
    );
    for j in report.failures() {
        if let JobResult::Failed { error } = &j.result {
            warn!("  - {}\n    {}", j.label, error);
        }
    }
    Err(anyhow!("Sort finished with {} failed unit(s).", report.failed))
}

/// Default cache location when none is given.
pub fn default_cache_root(output_root: &Path) -> PathBuf {
    output_root.join(".sort_cache")
}
