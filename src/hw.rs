use serde::Serialize;
use std::path::Path;
use sysinfo::{Disks, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiskKind {
    Hdd,
    Ssd,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct HwInfo {
    pub logical_cpus: usize,
    pub total_ram_mb: u64,
    /// Disk holding the cache root (snapshots, artifacts, workspaces).
    pub disk_kind: DiskKind,
}

fn total_ram_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / (1024 * 1024) // bytes -> MB
}

/// Kind of the disk whose mount point is the longest prefix of `p`.
pub fn disk_kind_for_path(p: &Path) -> DiskKind {
    let p = p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|d| p.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| match d.kind() {
            sysinfo::DiskKind::HDD => DiskKind::Hdd,
            sysinfo::DiskKind::SSD => DiskKind::Ssd,
            _ => DiskKind::Unknown,
        })
        .unwrap_or(DiskKind::Unknown)
}

pub fn detect_hw(cache_root: &Path) -> HwInfo {
    HwInfo {
        logical_cpus: num_cpus::get().max(1),
        total_ram_mb: total_ram_mb(),
        disk_kind: disk_kind_for_path(cache_root),
    }
}
