use crate::hw::{DiskKind, HwInfo};

/// Upper bound on detection threads for a single unit.
pub const MAX_DETECT_THREADS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortTune {
    pub detect_threads_per_job: usize,
    /// More workers than logical cores were requested.
    pub oversubscribed: bool,
}

/// Thread cap by RAM class; each detection thread holds its own
/// normalised copy of a channel block.
fn ram_cap(ram_mb: u64) -> usize {
    if ram_mb < 4096 {
        1
    } else if ram_mb < 8192 {
        2
    } else if ram_mb < 16384 {
        4
    } else {
        MAX_DETECT_THREADS
    }
}

pub fn auto_tune(hw: &HwInfo, num_jobs: usize) -> SortTune {
    let cores = hw.logical_cpus.max(1);
    let num_jobs = num_jobs.max(1);

    let mut per_job = (cores / num_jobs).max(1).min(ram_cap(hw.total_ram_mb));
    // on spinning disks the workers are mostly waiting on reads anyway
    if hw.disk_kind == DiskKind::Hdd {
        per_job = per_job.min(2);
    }

    SortTune {
        detect_threads_per_job: per_job.clamp(1, MAX_DETECT_THREADS),
        oversubscribed: num_jobs > cores,
    }
}
