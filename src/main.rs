use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use regex::Regex;
use std::path::PathBuf;

use spikesort_batch::app::{self, AppConfig};
use spikesort_batch::config::{self, PipelineConfig};
use spikesort_batch::fs_scan::ScanOptions;
use spikesort_batch::{hw, logging};

#[derive(Parser, Debug)]
#[command(author, version, about = "Batch spike sorting with a persistent result cache")]
struct Cli {
    /// Dataset root: <input>/<group>.mda/<unit>.mda
    #[arg(long, global = true, default_value = "input")]
    input: PathBuf,

    #[arg(long, global = true, default_value = "output")]
    output: PathBuf,

    /// Defaults to <output>/.sort_cache
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,

    /// Units processed concurrently.
    #[arg(long, global = true, default_value_t = 1)]
    num_jobs: usize,

    /// Ignore cache entries from earlier runs.
    #[arg(long, global = true)]
    force_run: bool,

    /// Only the first 2 groups and 2 units per group.
    #[arg(long, global = true)]
    test: bool,

    /// YAML file with pipeline parameters.
    #[arg(long, global = true)]
    params: Option<PathBuf>,

    /// Regex on unit names.
    #[arg(long, global = true)]
    include: Option<String>,

    #[arg(long, global = true)]
    detect_threads: Option<usize>,

    #[arg(long, global = true, default_value = "firings.mda")]
    artifact_name: String,

    /// Reference inputs in place instead of copying them into the cache.
    #[arg(long, global = true)]
    no_snapshot_copies: bool,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print discovered groups and units.
    List,
    /// Show which units would hit the cache; runs nothing.
    Plan,
    /// Sort every unit (default).
    Sort,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.verbose, cli.log_dir.as_deref()) {
        eprintln!("logging disabled: {e}");
    }

    if cli.num_jobs == 0 {
        return Err(anyhow!("--num-jobs must be at least 1"));
    }
    if cli.artifact_name.trim().is_empty() || cli.artifact_name.contains(['/', '\\']) {
        return Err(anyhow!("--artifact-name must be a plain file name"));
    }

    let pipeline = match &cli.params {
        Some(p) => config::load_yaml(p).with_context(|| format!("load params {}", p.display()))?,
        None => PipelineConfig::default(),
    };
    pipeline.validate().context("invalid pipeline parameters")?;

    let include = cli
        .include
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --include pattern")?;

    let cache_root = cli
        .cache_root
        .clone()
        .unwrap_or_else(|| app::default_cache_root(&cli.output));

    tracing::info!("INPUT ROOT = {}", cli.input.display());
    tracing::info!("OUTPUT ROOT = {}", cli.output.display());
    tracing::info!("CACHE ROOT = {}", cache_root.display());

    let hwinfo = hw::detect_hw(&cache_root);
    tracing::info!(
        "HW DETECTED: cores(logical)={}, ram={}MB, disk={:?}",
        hwinfo.logical_cpus,
        hwinfo.total_ram_mb,
        hwinfo.disk_kind
    );

    let cfg = AppConfig {
        input_root: cli.input,
        output_root: cli.output,
        cache_root,
        num_jobs: cli.num_jobs,
        force_run: cli.force_run,
        detect_threads: cli.detect_threads,
        artifact_name: cli.artifact_name,
        keep_snapshots: !cli.no_snapshot_copies,
        scan: ScanOptions {
            include,
            test: cli.test,
        },
        pipeline,
        hw: hwinfo,
    };

    match cli.cmd.unwrap_or(Commands::Sort) {
        Commands::List => app::list_units(&cfg)?,
        Commands::Plan => {
            app::plan(&cfg)?;
        }
        Commands::Sort => {
            app::sort(&cfg)?;
        }
    }

    Ok(())
}
