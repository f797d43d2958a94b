use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::stage_runner::PLACEHOLDERS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read params file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse params file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid parameter `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Identity of the sorting operation; bumping the version invalidates every
/// cache entry produced by older versions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationId {
    pub name: String,
    pub version: String,
}

impl Default for OperationId {
    fn default() -> Self {
        Self {
            name: "custom_sorting".to_string(),
            version: "0.1.4".to_string(),
        }
    }
}

/// How a selectable stage is carried out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageBackend {
    Builtin,
    External {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl StageBackend {
    pub fn default_mask() -> Self {
        StageBackend::External {
            program: "mp-run-process".to_string(),
            args: [
                "ms3.mask_out_artifacts",
                "--timeseries",
                "{input}",
                "--timeseries_out",
                "{output}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageBackends {
    pub mask: StageBackend,
    pub sort: StageBackend,
}

impl Default for StageBackends {
    fn default() -> Self {
        Self {
            mask: StageBackend::default_mask(),
            sort: StageBackend::Builtin,
        }
    }
}

/// Full parameter record for one pipeline run. Equality is exact, field by
/// field; together with the input snapshot it forms the cache key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub operation: OperationId,
    pub sample_rate: f64,
    pub mask_out_artifacts: bool,
    /// 0 for either bound disables band-pass filtering.
    pub freq_min: f64,
    pub freq_max: f64,
    pub whiten: bool,
    /// -1, 0 or 1: negative, either or positive polarity spikes.
    pub detect_sign: i8,
    /// -1 includes all channels in every neighbourhood.
    pub adjacency_radius: f64,
    pub clip_size: u32,
    pub detect_threshold: f64,
    /// Minimum number of timepoints between events on the same channel.
    pub detect_interval: u32,
    /// None disables automated curation.
    pub noise_overlap_threshold: Option<f64>,
    pub stages: StageBackends,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            operation: OperationId::default(),
            sample_rate: 30000.0,
            mask_out_artifacts: true,
            freq_min: 300.0,
            freq_max: 6000.0,
            whiten: true,
            detect_sign: -1,
            adjacency_radius: 50.0,
            clip_size: 50,
            detect_threshold: 3.0,
            detect_interval: 10,
            noise_overlap_threshold: Some(0.15),
            stages: StageBackends::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn finite(field: &'static str, v: f64) -> Result<(), ConfigError> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(invalid(field, format!("{v} is not a finite number")))
    }
}

impl PipelineConfig {
    /// Band-pass is skipped entirely when either bound is 0.
    pub fn filter_enabled(&self) -> bool {
        self.freq_min != 0.0 && self.freq_max != 0.0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation.name.trim().is_empty() {
            return Err(invalid("operation.name", "must not be empty"));
        }
        if self.operation.version.trim().is_empty() {
            return Err(invalid("operation.version", "must not be empty"));
        }

        finite("sample_rate", self.sample_rate)?;
        finite("freq_min", self.freq_min)?;
        finite("freq_max", self.freq_max)?;
        finite("adjacency_radius", self.adjacency_radius)?;
        finite("detect_threshold", self.detect_threshold)?;

        if self.sample_rate <= 0.0 {
            return Err(invalid("sample_rate", "must be positive"));
        }
        if self.freq_min < 0.0 || self.freq_max < 0.0 {
            return Err(invalid("freq_min/freq_max", "must not be negative"));
        }
        if self.filter_enabled() {
            if self.freq_min >= self.freq_max {
                return Err(invalid(
                    "freq_min/freq_max",
                    format!("band [{}, {}] is empty", self.freq_min, self.freq_max),
                ));
            }
            let nyquist = self.sample_rate / 2.0;
            if self.freq_max >= nyquist {
                return Err(invalid(
                    "freq_max",
                    format!("{} must be below nyquist {}", self.freq_max, nyquist),
                ));
            }
        }
        if !matches!(self.detect_sign, -1..=1) {
            return Err(invalid("detect_sign", "use -1, 0 or 1"));
        }
        if self.adjacency_radius < 0.0 && self.adjacency_radius != -1.0 {
            return Err(invalid(
                "adjacency_radius",
                "must be non-negative, or -1 for all channels",
            ));
        }
        if self.clip_size == 0 {
            return Err(invalid("clip_size", "must be at least 1"));
        }
        if self.detect_threshold <= 0.0 {
            return Err(invalid("detect_threshold", "must be positive"));
        }
        if self.detect_interval == 0 {
            return Err(invalid("detect_interval", "must be at least 1"));
        }
        if let Some(t) = self.noise_overlap_threshold {
            finite("noise_overlap_threshold", t)?;
            if t < 0.0 {
                return Err(invalid("noise_overlap_threshold", "must not be negative"));
            }
        }

        validate_backend("stages.mask", &self.stages.mask)?;
        validate_backend("stages.sort", &self.stages.sort)?;
        Ok(())
    }
}

fn validate_backend(field: &'static str, backend: &StageBackend) -> Result<(), ConfigError> {
    let StageBackend::External { program, args } = backend else {
        return Ok(());
    };
    if program.trim().is_empty() {
        return Err(invalid(field, "external program must not be empty"));
    }
    for arg in args {
        for name in crate::stage_runner::placeholders_in(arg) {
            if !PLACEHOLDERS.contains(&name.as_str()) {
                return Err(invalid(field, format!("unknown placeholder {{{name}}}")));
            }
        }
    }
    Ok(())
}

/// Load a YAML parameter file. Missing fields keep their defaults.
pub fn load_yaml(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg: PipelineConfig =
        serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_bound_disables_filter() {
        let cfg = PipelineConfig {
            freq_min: 0.0,
            freq_max: 6000.0,
            ..PipelineConfig::default()
        };
        assert!(!cfg.filter_enabled());
        cfg.validate().unwrap();

        let cfg = PipelineConfig {
            freq_min: 0.0,
            freq_max: 0.0,
            ..PipelineConfig::default()
        };
        assert!(!cfg.filter_enabled());
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_band_and_bad_sign() {
        let cfg = PipelineConfig {
            freq_min: 6000.0,
            freq_max: 300.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "freq_min/freq_max", .. })
        ));

        let cfg = PipelineConfig {
            detect_sign: 2,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "detect_sign", .. })
        ));
    }

    #[test]
    fn adjacency_radius_minus_one_only() {
        let ok = PipelineConfig {
            adjacency_radius: -1.0,
            ..PipelineConfig::default()
        };
        ok.validate().unwrap();
        let bad = PipelineConfig {
            adjacency_radius: -2.0,
            ..PipelineConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let cfg = PipelineConfig {
            stages: StageBackends {
                mask: StageBackend::External {
                    program: "mask".into(),
                    args: vec!["{inptu}".into()],
                },
                sort: StageBackend::Builtin,
            },
            ..PipelineConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "stages.mask", .. })
        ));
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        let mut f = File::create(&path).unwrap();
        writeln!(
            f,
            "detect_sign: 1\nfreq_min: 0\nnoise_overlap_threshold: null\nstages:\n  mask:\n    kind: builtin\n  sort:\n    kind: external\n    program: ms4\n    args: ['{{input}}', '{{output}}']"
        )
        .unwrap();

        let cfg = load_yaml(&path).unwrap();
        assert_eq!(cfg.detect_sign, 1);
        assert_eq!(cfg.freq_min, 0.0);
        assert_eq!(cfg.freq_max, 6000.0);
        assert_eq!(cfg.noise_overlap_threshold, None);
        assert_eq!(cfg.stages.mask, StageBackend::Builtin);
        assert_eq!(
            cfg.stages.sort,
            StageBackend::External {
                program: "ms4".into(),
                args: vec!["{input}".into(), "{output}".into()],
            }
        );
    }

    #[test]
    fn yaml_rejects_unknown_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        std::fs::write(&path, "detect_treshold: 4\n").unwrap();
        assert!(matches!(load_yaml(&path), Err(ConfigError::Parse { .. })));
    }
}
