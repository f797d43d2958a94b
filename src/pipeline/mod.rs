//! Unit pipeline: mask -> load -> band-pass -> whiten -> detect/sort -> write.
//!
//! Each stage fails fast; the first error aborts the unit and is returned to
//! the scheduler unchanged.

pub mod detect;
pub mod filter;
pub mod mask;
pub mod mda;
pub mod whiten;

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

use crate::config::{PipelineConfig, StageBackend};
use crate::error::JobError;
use crate::scheduler::UnitRunner;
use crate::stage_runner;
use crate::types::Job;
use detect::DetectParams;
use mda::MdaError;

/// Multi-channel recording, one `Vec` per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct Recording {
    pub sample_rate: f64,
    pub channels: Vec<Vec<f32>>,
    /// Electrode positions; all zero when the input carries none.
    pub geometry: Vec<[f64; 2]>,
}

impl Recording {
    pub fn new(sample_rate: f64, channels: Vec<Vec<f32>>) -> Self {
        let geometry = vec![[0.0, 0.0]; channels.len()];
        Self {
            sample_rate,
            channels,
            geometry,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_timepoints(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }
}

/// One detected spike, 0-based channel and time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub channel: usize,
    pub time: usize,
    pub label: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Firings {
    pub events: Vec<Event>,
}

// workspace-local file names
const MASKED_FILE: &str = "raw.mda";
const PREPROCESSED_FILE: &str = "pre.mda";
const SORTED_FILE: &str = "firings.mda";

fn load_error(path: &Path, err: MdaError) -> JobError {
    match err {
        MdaError::Io(e) => JobError::unavailable(path, e),
        other => JobError::malformed(path, other),
    }
}

/// Runs the stage sequence for one unit. `detect_threads` is the fan-out
/// of the builtin detector and the `{num_workers}` of an external sorter;
/// it never changes the output.
#[derive(Clone, Debug)]
pub struct UnitPipeline {
    detect_threads: usize,
}

impl UnitPipeline {
    pub fn new(detect_threads: usize) -> Self {
        Self {
            detect_threads: detect_threads.max(1),
        }
    }

    pub fn detect_threads(&self) -> usize {
        self.detect_threads
    }

    fn placeholders(&self, cfg: &PipelineConfig, input: &Path, output: &Path) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("input", input.display().to_string()),
            ("output", output.display().to_string()),
            ("sample_rate", cfg.sample_rate.to_string()),
            ("detect_sign", cfg.detect_sign.to_string()),
            ("adjacency_radius", cfg.adjacency_radius.to_string()),
            ("clip_size", cfg.clip_size.to_string()),
            ("detect_threshold", cfg.detect_threshold.to_string()),
            ("detect_interval", cfg.detect_interval.to_string()),
            ("num_workers", self.detect_threads.to_string()),
        ])
    }

    fn run_external(
        &self,
        stage: &str,
        program: &str,
        args: &[String],
        cfg: &PipelineConfig,
        input: &Path,
        output: &Path,
    ) -> Result<(), JobError> {
        let argv = stage_runner::substitute(args, &self.placeholders(cfg, input, output));
        stage_runner::run(stage, program, &argv)?;
        if !output.is_file() {
            return Err(JobError::malformed(
                output,
                format!("stage `{stage}` exited cleanly but wrote no output"),
            ));
        }
        Ok(())
    }

    /// Stages 3 and 4 plus the in-process mask. Exposed so the
    /// pass-through behaviour can be checked on its own.
    pub fn preprocess(&self, cfg: &PipelineConfig, rec: &mut Recording) {
        if cfg.mask_out_artifacts && cfg.stages.mask == StageBackend::Builtin {
            mask::mask_out_artifacts(rec);
        }
        if cfg.filter_enabled() {
            debug!(freq_min = cfg.freq_min, freq_max = cfg.freq_max, "band-pass");
            filter::bandpass(rec, cfg.freq_min, cfg.freq_max);
        } else {
            debug!("band-pass skipped");
        }
        if cfg.whiten {
            debug!("whiten");
            whiten::whiten(rec);
        }
    }

    fn detect(
        &self,
        cfg: &PipelineConfig,
        rec: &Recording,
        workspace: &Path,
    ) -> Result<Firings, JobError> {
        match &cfg.stages.sort {
            StageBackend::Builtin => Ok(detect::sort(rec, &DetectParams::from(cfg), self.detect_threads)),
            StageBackend::External { program, args } => {
                let pre = workspace.join(PREPROCESSED_FILE);
                let out = workspace.join(SORTED_FILE);
                mda::write_timeseries(&pre, rec).map_err(|e| {
                    JobError::internal(format!("write {}: {e}", pre.display()))
                })?;
                self.run_external("sort", program, args, cfg, &pre, &out)?;
                mda::read_firings(&out).map_err(|e| JobError::malformed(&out, e))
            }
        }
    }

    /// Full stage sequence for one input. `output` is written atomically:
    /// it either keeps its previous state or holds the complete new result.
    pub fn process(
        &self,
        cfg: &PipelineConfig,
        input: &Path,
        output: &Path,
        workspace: &Path,
    ) -> Result<(), JobError> {
        let started = Instant::now();

        // 1. mask (external backend runs before load)
        let source: PathBuf = match (&cfg.stages.mask, cfg.mask_out_artifacts) {
            (StageBackend::External { program, args }, true) => {
                let masked = workspace.join(MASKED_FILE);
                self.run_external("mask", program, args, cfg, input, &masked)?;
                masked
            }
            _ => input.to_path_buf(),
        };

        // 2. load
        let mut rec = mda::read_timeseries(&source, cfg.sample_rate).map_err(|e| load_error(&source, e))?;
        debug!(
            channels = rec.num_channels(),
            timepoints = rec.num_timepoints(),
            "recording loaded"
        );

        // 3-4. builtin mask, band-pass, whiten
        self.preprocess(cfg, &mut rec);

        // 5. detect/sort
        let firings = self.detect(cfg, &rec, workspace)?;
        debug!(events = firings.events.len(), "sorting done");

        // 6. write
        write_output(output, &firings)?;
        debug!(output = %output.display(), elapsed_ms = started.elapsed().as_millis() as u64, "unit done");
        Ok(())
    }
}

fn write_output(output: &Path, firings: &Firings) -> Result<(), JobError> {
    let io_err = |e: std::io::Error| JobError::internal(format!("write {}: {e}", output.display()));
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err)?;

    let tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
    let mut w = BufWriter::new(tmp);
    mda::write_firings(&mut w, firings).map_err(io_err)?;
    w.flush().map_err(io_err)?;
    let tmp = w.into_inner().map_err(|e| io_err(e.into_error()))?;
    tmp.persist(output).map_err(|e| io_err(e.error))?;
    Ok(())
}

impl UnitRunner for UnitPipeline {
    fn run(&self, job: &Job, workspace: &Path) -> Result<(), JobError> {
        self.process(&job.config, &job.input.location, &job.output, workspace)
    }
}
