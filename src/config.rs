use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How far each execution context is isolated from the host.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Own process group, CPU affinity and supplementary groups.
    #[default]
    Process,
    /// Container per context with device nodes passed through.
    Container { image: String },
}

/// How the stream count is divided between the two halves of a concurrent split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Detection context gets the odd stream.
    #[default]
    CeilToDetect,
    FloorToDetect,
}

impl SplitPolicy {
    /// Returns `(detect_streams, classify_streams)`.
    pub fn split(self, total: u32) -> (u32, u32) {
        let detect = match self {
            Self::CeilToDetect => total.div_ceil(2),
            Self::FloorToDetect => total / 2,
        };
        (detect, total - detect)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub pipelines_root: PathBuf,
    pub results_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub target_fps: f64,
    /// Fraction of `target_fps` a stream must sustain to count toward density.
    pub error_margin: f64,
    pub launcher: String,
    /// Arguments placed before the pipeline tokens.
    pub launcher_args: Vec<String>,
    pub isolation: Isolation,
    pub sample_interval_secs: u64,
    pub terminate_grace_secs: u64,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub system_label: Option<String>,
    pub split_policy: SplitPolicy,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            pipelines_root: PathBuf::from("pipelines"),
            results_dir: PathBuf::from("results"),
            logs_dir: PathBuf::from("logs"),
            target_fps: 30.0,
            error_margin: 0.95,
            launcher: "gst-launch-1.0".to_string(),
            launcher_args: vec!["-e".to_string()],
            isolation: Isolation::Process,
            sample_interval_secs: 1,
            terminate_grace_secs: 5,
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            system_label: None,
            split_policy: SplitPolicy::CeilToDetect,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid config at {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

impl BenchConfig {
    /// Loads TOML from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        })?;
        config.check().map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    fn check(&self) -> Result<(), String> {
        if self.target_fps.is_nan() || self.target_fps <= 0.0 {
            return Err(format!("target_fps must be positive, got {}", self.target_fps));
        }
        if self.error_margin.is_nan() || self.error_margin <= 0.0 || self.error_margin > 1.0 {
            return Err(format!(
                "error_margin must be in (0, 1], got {}",
                self.error_margin
            ));
        }
        if self.sample_interval_secs == 0 {
            return Err("sample_interval_secs must be at least 1".to_string());
        }
        if self.launcher.trim().is_empty() {
            return Err("launcher must not be empty".to_string());
        }
        Ok(())
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}
