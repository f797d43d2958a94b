//! Dataset traversal: `<input>/<group>.mda/<unit>.mda`.

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::types::{Group, Unit};

const MDA_EXT: &str = "mda";

/// Test mode keeps this many groups and units per group.
pub const TEST_LIMIT: usize = 2;

/// Name without the `.mda` suffix, if the entry has one.
fn mda_stem(p: &Path) -> Option<String> {
    let ext = p.extension()?.to_str()?;
    if !ext.eq_ignore_ascii_case(MDA_EXT) {
        return None;
    }
    let stem = p.file_stem()?.to_string_lossy().trim().to_string();
    if stem.is_empty() { None } else { Some(stem) }
}

/// Immediate children of `dir` named `*.mda`, sorted by name.
fn list_mda(dir: &Path, want_dir: bool) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("read_dir {}", dir.display()))?;
        // group dirs may be symlinks into another volume
        let is_dir = entry.path().is_dir();
        if is_dir != want_dir {
            continue;
        }
        if let Some(name) = mda_stem(entry.path()) {
            out.push((name, entry.into_path()));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Only units whose name matches.
    pub include: Option<Regex>,
    /// Keep only the first `TEST_LIMIT` groups and units.
    pub test: bool,
}

/// Groups under `input_root`, each with its units, deterministic order.
/// Groups left without units (after filtering) are dropped.
pub fn discover(input_root: &Path, opts: &ScanOptions) -> Result<Vec<Group>> {
    if !input_root.is_dir() {
        return Err(anyhow!("Input folder not found: {}", input_root.display()));
    }

    let mut groups = Vec::new();
    for (name, dir) in list_mda(input_root, true)? {
        let mut units: Vec<Unit> = list_mda(&dir, false)?
            .into_iter()
            .filter(|(unit, _)| opts.include.as_ref().is_none_or(|re| re.is_match(unit)))
            .map(|(name, path)| Unit { name, path })
            .collect();
        if opts.test {
            units.truncate(TEST_LIMIT);
        }
        if units.is_empty() {
            continue;
        }
        groups.push(Group { name, units });
        if opts.test && groups.len() == TEST_LIMIT {
            break;
        }
    }
    Ok(groups)
}

/// `<output>/<group>/<unit>/<artifact>`
pub fn output_path(output_root: &Path, group: &Group, unit: &Unit, artifact: &str) -> PathBuf {
    output_root.join(&group.name).join(&unit.name).join(artifact)
}
