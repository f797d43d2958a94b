#![allow(dead_code)]

use spikesort_batch::app::AppConfig;
use spikesort_batch::config::{PipelineConfig, StageBackend};
use spikesort_batch::fs_scan::ScanOptions;
use spikesort_batch::hw::{DiskKind, HwInfo};
use spikesort_batch::pipeline::{Recording, UnitPipeline, mda};
use spikesort_batch::scheduler::UnitRunner;
use spikesort_batch::types::Job;
use spikesort_batch::JobError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Noise plus periodic negative spikes; `seed` changes the content.
pub fn synthetic_recording(channels: usize, n: usize, seed: u64) -> Recording {
    let mut state = seed.wrapping_add(1);
    let data = (0..channels)
        .map(|c| {
            (0..n)
                .map(|i| {
                    state = state
                        .wrapping_mul(6364136223846793005)
                        .wrapping_add(1442695040888963407);
                    let noise = ((state >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0;
                    let spike = if i % 997 == 300 + 5 * c { -30.0 } else { 0.0 };
                    (noise + spike) as f32
                })
                .collect()
        })
        .collect();
    Recording::new(30000.0, data)
}

/// Temp tree with `input/<group>.mda/<unit>.mda`, `output/` and a cache.
pub struct Dataset {
    pub temp: TempDir,
}

impl Dataset {
    pub fn new(groups: &[(&str, &[&str])]) -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        let ds = Self { temp };
        for (gi, (group, units)) in groups.iter().enumerate() {
            for (ui, unit) in units.iter().enumerate() {
                let rec = synthetic_recording(4, 12_000, (gi * 100 + ui) as u64);
                ds.write_unit(group, unit, &rec);
            }
        }
        ds
    }

    pub fn input(&self) -> PathBuf {
        self.temp.path().join("input")
    }

    pub fn output(&self) -> PathBuf {
        self.temp.path().join("output")
    }

    pub fn cache(&self) -> PathBuf {
        self.temp.path().join("cache")
    }

    pub fn unit_path(&self, group: &str, unit: &str) -> PathBuf {
        self.input().join(format!("{group}.mda")).join(format!("{unit}.mda"))
    }

    pub fn write_unit(&self, group: &str, unit: &str, rec: &Recording) {
        let path = self.unit_path(group, unit);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        mda::write_timeseries(&path, rec).expect("write unit");
    }

    pub fn config(&self, pipeline: PipelineConfig, num_jobs: usize, force_run: bool) -> AppConfig {
        AppConfig {
            input_root: self.input(),
            output_root: self.output(),
            cache_root: self.cache(),
            num_jobs,
            force_run,
            detect_threads: Some(2),
            artifact_name: "firings.mda".to_string(),
            keep_snapshots: true,
            scan: ScanOptions::default(),
            pipeline,
            hw: HwInfo {
                logical_cpus: 4,
                total_ram_mb: 8192,
                disk_kind: DiskKind::Unknown,
            },
        }
    }
}

/// Default parameters with every stage in-process.
pub fn builtin_pipeline() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.stages.mask = StageBackend::Builtin;
    cfg
}

/// Real pipeline that counts how often it actually ran.
pub struct CountingPipeline {
    inner: UnitPipeline,
    runs: AtomicUsize,
}

impl CountingPipeline {
    pub fn new() -> Self {
        Self {
            inner: UnitPipeline::new(2),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl UnitRunner for CountingPipeline {
    fn run(&self, job: &Job, workspace: &Path) -> Result<(), JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.run(job, workspace)
    }
}
