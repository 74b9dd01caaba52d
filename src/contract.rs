use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{fmt, fmt::Display};

use crate::config::ConfigError;
use crate::description::PipelineDescription;
use crate::pinning::CorePinning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Light,
    Medium,
    Heavy,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Light, Tier::Medium, Tier::Heavy];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = BenchError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "medium" => Ok(Self::Medium),
            "heavy" => Ok(Self::Heavy),
            _ => Err(BenchError::UnknownTier(raw.to_string())),
        }
    }
}

/// Pre-processing backend used by the inference elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreProcessBackend {
    OpenCv,
    VaSurfaceSharing,
}

impl Display for PreProcessBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenCv => f.write_str("opencv"),
            Self::VaSurfaceSharing => f.write_str("va-surface-sharing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTarget {
    Cpu,
    /// `GPU` or `GPU.<index>` on multi-GPU hosts.
    Gpu(Option<u32>),
    Npu,
}

impl DeviceTarget {
    pub fn pre_process_backend(self) -> PreProcessBackend {
        match self {
            Self::Cpu | Self::Npu => PreProcessBackend::OpenCv,
            Self::Gpu(_) => PreProcessBackend::VaSurfaceSharing,
        }
    }

    /// Inference request queue depth (`nireq`).
    pub fn queue_depth(self) -> u32 {
        match self {
            Self::Cpu | Self::Npu => 4,
            Self::Gpu(_) => 2,
        }
    }

    pub fn clamps_batch(self) -> bool {
        matches!(self, Self::Npu)
    }

    pub fn effective_batch(self, requested: u32) -> u32 {
        if self.clamps_batch() { 1 } else { requested }
    }

    /// Device family without the GPU index, used for result labels.
    pub fn family(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu(_) => "GPU",
            Self::Npu => "NPU",
        }
    }
}

impl Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("CPU"),
            Self::Gpu(None) => f.write_str("GPU"),
            Self::Gpu(Some(index)) => write!(f, "GPU.{index}"),
            Self::Npu => f.write_str("NPU"),
        }
    }
}

impl FromStr for DeviceTarget {
    type Err = BenchError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.as_str() {
            "CPU" => Ok(Self::Cpu),
            "GPU" => Ok(Self::Gpu(None)),
            "NPU" => Ok(Self::Npu),
            other => other
                .strip_prefix("GPU.")
                .and_then(|index| index.parse::<u32>().ok())
                .map(|index| Self::Gpu(Some(index)))
                .ok_or_else(|| BenchError::UnknownDevice(raw.to_string())),
        }
    }
}

/// Everything one benchmark invocation needs, threaded explicitly through the run.
#[derive(Debug, Clone)]
pub struct BenchmarkRequest {
    pub tier: Tier,
    pub detect: DeviceTarget,
    pub classify: DeviceTarget,
    pub batch: u32,
    pub streams: u32,
    pub duration: Duration,
    pub concurrent: bool,
    pub pinning: String,
}

impl BenchmarkRequest {
    /// Parses CLI-level values, rejecting anything invalid before resources are touched.
    #[allow(clippy::too_many_arguments)]
    pub fn parse(
        tier: &str,
        detect: &str,
        classify: &str,
        batch: i64,
        streams: i64,
        duration_secs: i64,
        concurrent: bool,
        pinning: &str,
    ) -> Result<Self, BenchError> {
        let batch = positive("batch", batch)?;
        let streams = positive("stream count", streams)?;
        let duration_secs = positive("duration", duration_secs)?;
        Ok(Self {
            tier: tier.parse()?,
            detect: detect.parse()?,
            classify: classify.parse()?,
            batch,
            streams,
            duration: Duration::from_secs(u64::from(duration_secs)),
            concurrent,
            pinning: pinning.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), BenchError> {
        if self.batch == 0 {
            return Err(BenchError::InvalidParameter(
                "batch must be a positive integer".to_string(),
            ));
        }
        if self.streams == 0 {
            return Err(BenchError::InvalidParameter(
                "stream count must be a positive integer".to_string(),
            ));
        }
        if self.duration.as_secs() == 0 {
            return Err(BenchError::InvalidParameter(
                "duration must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_split(&self) -> bool {
        self.concurrent && self.detect != self.classify
    }

    /// Label written to the `Device Configuration` column.
    pub fn device_config_label(&self) -> String {
        let (detect, classify) = (self.detect.family(), self.classify.family());
        let devices = if self.detect == self.classify {
            detect.to_string()
        } else if detect != classify {
            format!("{detect}-{classify}")
        } else {
            format!("{}-{}", self.detect, self.classify)
        };
        if self.is_split() {
            format!("{devices}-Concurrent")
        } else {
            devices
        }
    }
}

fn positive(name: &str, value: i64) -> Result<u32, BenchError> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            BenchError::InvalidParameter(format!("{name} must be a positive integer, got {value}"))
        })
}

/// Resource constraints applied to one execution context at launch.
#[derive(Debug, Clone, Default)]
pub struct ResourceConstraints {
    pub pinning: CorePinning,
    pub device_nodes: Vec<PathBuf>,
    pub group_ids: Vec<u32>,
    pub read_only_root: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ContextSpec {
    pub name: String,
    pub streams: u32,
    pub description: PipelineDescription,
    pub constraints: ResourceConstraints,
    pub duration: Duration,
    pub log_path: PathBuf,
}

impl Display for ContextSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ContextSpec(name={}, streams={}, pinning={}, duration={}s, log={})",
            self.name,
            self.streams,
            self.constraints.pinning,
            self.duration.as_secs(),
            self.log_path.display()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Completed,
    /// Stopped by the orchestrator after the configured duration.
    TimedOut,
    Interrupted,
    Failed(Option<i32>),
}

impl ExitOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }
}

impl Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::TimedOut => f.write_str("timed_out"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Failed(Some(code)) => write!(f, "failed(code={code})"),
            Self::Failed(None) => f.write_str("failed(signal)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("missing assets: {}", join_paths(.0))]
    MissingAsset(Vec<PathBuf>),
    #[error("unknown tier: {0}")]
    UnknownTier(String),
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("permission denied reading {0}")]
    PermissionDenied(PathBuf),
    #[error("parse failure: {0}")]
    Parse(String),
    #[error("resource acquisition failed for {context}: {reason}")]
    ResourceAcquisition { context: String, reason: String },
    #[error("execution context {context} ended with {outcome}")]
    ContextFailed {
        context: String,
        outcome: ExitOutcome,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl BenchError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Validation failures that should halt a caller immediately.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameter(_)
                | Self::MissingAsset(_)
                | Self::UnknownTier(_)
                | Self::UnknownDevice(_)
        )
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Isolated runner for one pipeline instantiation.
pub trait ExecutionContext {
    type Handle;

    fn launch(&mut self, spec: &ContextSpec) -> Result<Self::Handle, BenchError>;

    fn wait(&mut self, handle: &mut Self::Handle, timeout: Duration)
    -> Result<ExitOutcome, BenchError>;

    /// Stops the context. Must be safe to call on an already exited context.
    fn terminate(&mut self, handle: &mut Self::Handle) -> Result<(), BenchError>;
}
