pub mod assets;
pub mod config;
pub mod context;
mod contract;
pub mod description;
pub mod host;
pub mod logging;
pub mod matrix;
pub mod metrics;
pub mod orchestrator;
pub mod pinning;
pub mod power;
pub mod results;

pub use assets::{TierAssets, TierProfile};
pub use config::{BenchConfig, ConfigError, Isolation, SplitPolicy};
pub use context::{ProcessContext, ProcessHandle, install_interrupt_handler, interrupted};
pub use contract::{
    BenchError, BenchmarkRequest, ContextSpec, DeviceTarget, ExecutionContext, ExitOutcome,
    PreProcessBackend, ResourceConstraints, Tier,
};
pub use description::{PipelineDescription, PipelineDescriptionBuilder, Stage, StageKind};
pub use host::{DeviceAccess, HostAccelerators};
pub use matrix::MatrixEntry;
pub use metrics::Metrics;
pub use orchestrator::{BenchmarkOrchestrator, ContextPlan, RunState};
pub use pinning::{CoreClass, CorePinning, CoreTopology, SysfsTopology};
pub use power::{PowerSample, PowerSampler, PowerSource, SampleWindow, SamplerHandle};
pub use results::BenchmarkResult;
