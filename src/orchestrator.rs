//! Runs one benchmark end to end.
//!
//! Validation and asset checks happen before anything is launched. Contexts and
//! the power sampler run in parallel; a teardown guard stops all of them on every
//! exit path, after which logs are aggregated into a single result row.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use std::{fmt, fmt::Display};

use time::OffsetDateTime;

use crate::assets;
use crate::config::{BenchConfig, SplitPolicy};
use crate::contract::{
    BenchError, BenchmarkRequest, ContextSpec, DeviceTarget, ExecutionContext, ResourceConstraints,
};
use crate::description::PipelineDescriptionBuilder;
use crate::host;
use crate::metrics;
use crate::pinning::{self, CoreTopology, SysfsTopology};
use crate::power::{PowerSample, PowerSampler, SampleWindow, SamplerHandle};
use crate::results::{self, BenchmarkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Validating,
    Launching,
    Running,
    Aggregating,
    Done,
    Failed,
}

impl Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn advance(state: &mut RunState, next: RunState) {
    tracing::info!(from = %state, to = %next, "benchmark state");
    *state = next;
}

/// One execution context the request expands into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextPlan {
    pub role: &'static str,
    pub detect: DeviceTarget,
    pub classify: DeviceTarget,
    pub streams: u32,
}

/// Splits a concurrent request across its two devices; otherwise one context runs everything.
pub fn plan_contexts(request: &BenchmarkRequest, policy: SplitPolicy) -> Vec<ContextPlan> {
    if !request.is_split() {
        return vec![ContextPlan {
            role: "pipeline",
            detect: request.detect,
            classify: request.classify,
            streams: request.streams,
        }];
    }
    let (detect_streams, classify_streams) = policy.split(request.streams);
    [
        ContextPlan {
            role: "detect",
            detect: request.detect,
            classify: request.detect,
            streams: detect_streams,
        },
        ContextPlan {
            role: "classify",
            detect: request.classify,
            classify: request.classify,
            streams: classify_streams,
        },
    ]
    .into_iter()
    .filter(|plan| {
        if plan.streams == 0 {
            tracing::debug!(role = plan.role, "no streams assigned; context skipped");
        }
        plan.streams > 0
    })
    .collect()
}

struct Prepared {
    run_id: String,
    started_at: OffsetDateTime,
    pinned_cores: String,
    specs: Vec<ContextSpec>,
}

/// Stops every launched context and the sampler exactly once, including on unwind.
struct Teardown<'a, E: ExecutionContext> {
    executor: &'a mut E,
    handles: Vec<E::Handle>,
    sampler: Option<SamplerHandle>,
    done: bool,
}

impl<'a, E: ExecutionContext> Teardown<'a, E> {
    fn new(executor: &'a mut E) -> Self {
        Self {
            executor,
            handles: Vec::new(),
            sampler: None,
            done: false,
        }
    }

    fn finish(&mut self) -> Vec<PowerSample> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        for handle in &mut self.handles {
            if let Err(err) = self.executor.terminate(handle) {
                tracing::warn!(error = %err, "context teardown failed");
            }
        }
        self.sampler
            .take()
            .map(|mut sampler| sampler.stop().to_vec())
            .unwrap_or_default()
    }
}

impl<E: ExecutionContext> Drop for Teardown<'_, E> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

pub struct BenchmarkOrchestrator<E: ExecutionContext> {
    config: BenchConfig,
    executor: E,
    topology: Box<dyn CoreTopology>,
    builder: PipelineDescriptionBuilder,
    power: Option<PowerSampler>,
    system: String,
    state: RunState,
}

impl<E: ExecutionContext> BenchmarkOrchestrator<E> {
    pub fn new(config: BenchConfig, executor: E) -> Self {
        let system = config
            .system_label
            .clone()
            .unwrap_or_else(host::system_label);
        Self {
            topology: Box::new(SysfsTopology::new(&config.sysfs_root)),
            builder: PipelineDescriptionBuilder::new(&config.pipelines_root),
            power: Some(PowerSampler::new(&config.sysfs_root)),
            config,
            executor,
            system,
            state: RunState::Idle,
        }
    }

    pub fn with_topology(mut self, topology: Box<dyn CoreTopology>) -> Self {
        self.topology = topology;
        self
    }

    /// Skips power sampling; results report `NA` for power and efficiency.
    pub fn without_power(mut self) -> Self {
        self.power = None;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Validates, launches, measures and records one benchmark.
    pub fn run(&mut self, request: &BenchmarkRequest) -> Result<BenchmarkResult, BenchError> {
        let _span = tracing::info_span!(
            "benchmark",
            tier = %request.tier,
            detect = %request.detect,
            classify = %request.classify,
            batch = request.batch,
            streams = request.streams,
        )
        .entered();

        self.state = RunState::Idle;
        advance(&mut self.state, RunState::Validating);
        let prepared = match self.prepare(request) {
            Ok(prepared) => prepared,
            Err(err) => return Err(self.fail(err)),
        };

        advance(&mut self.state, RunState::Launching);
        match self.execute(request, prepared) {
            Ok(result) => {
                advance(&mut self.state, RunState::Done);
                Ok(result)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: BenchError) -> BenchError {
        tracing::error!(error = %err, state = %self.state, "benchmark failed");
        advance(&mut self.state, RunState::Failed);
        err
    }

    fn prepare(&self, request: &BenchmarkRequest) -> Result<Prepared, BenchError> {
        request.validate()?;
        assets::validate(request.tier, &self.config.pipelines_root)?;
        let pinning = pinning::resolve(&request.pinning, self.topology.as_ref())?;
        let access = host::discover_device_access(&self.config.dev_root);
        let constraints = ResourceConstraints {
            pinning: pinning.clone(),
            device_nodes: access.nodes,
            group_ids: access.group_ids,
            read_only_root: Some(self.config.pipelines_root.clone()),
        };

        let started_at = results::now_utc();
        let run_id = run_id(request, started_at);
        let specs = plan_contexts(request, self.config.split_policy)
            .into_iter()
            .map(|plan| ContextSpec {
                name: format!("{run_id}-{}", plan.role),
                streams: plan.streams,
                description: self.builder.build(
                    request.tier,
                    plan.detect,
                    plan.classify,
                    request.batch,
                ),
                constraints: constraints.clone(),
                duration: request.duration,
                log_path: self.config.logs_dir.join(format!("{run_id}-{}.log", plan.role)),
            })
            .collect();
        Ok(Prepared {
            run_id,
            started_at,
            pinned_cores: pinning.to_string(),
            specs,
        })
    }

    fn execute(
        &mut self,
        request: &BenchmarkRequest,
        prepared: Prepared,
    ) -> Result<BenchmarkResult, BenchError> {
        let Prepared {
            run_id,
            started_at,
            pinned_cores,
            specs,
        } = prepared;

        let mut teardown = Teardown::new(&mut self.executor);
        for spec in &specs {
            tracing::debug!(%spec, "launching context");
            let handle = teardown.executor.launch(spec)?;
            teardown.handles.push(handle);
        }
        let started = Instant::now();

        let mut power_log = None;
        if let Some(sampler) = &self.power {
            let window = SampleWindow::for_benchmark(request.duration, self.config.sample_interval());
            let path = self.config.logs_dir.join(format!("{run_id}-power.log"));
            match sampler.clone().spawn(window, &path) {
                Ok(handle) => {
                    teardown.sampler = Some(handle);
                    power_log = Some(path);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "power sampling unavailable; continuing without power")
                }
            }
        }

        advance(&mut self.state, RunState::Running);
        let mut failure = None;
        for (spec, handle) in specs.iter().zip(teardown.handles.iter_mut()) {
            let remaining = request.duration.saturating_sub(started.elapsed());
            let outcome = teardown.executor.wait(handle, remaining)?;
            if !outcome.is_success() {
                failure = Some(BenchError::ContextFailed {
                    context: spec.name.clone(),
                    outcome,
                });
                break;
            }
        }
        let samples = teardown.finish();
        drop(teardown);
        if let Some(err) = failure {
            return Err(err);
        }

        advance(&mut self.state, RunState::Aggregating);
        let context_logs: Vec<PathBuf> = specs.iter().map(|spec| spec.log_path.clone()).collect();
        let logs: Vec<String> = context_logs.iter().map(|path| read_log(path)).collect();
        let combined_log = if logs.len() > 1 {
            let path = self.config.logs_dir.join(format!("{run_id}-combined.log"));
            fs::write(&path, logs.concat()).map_err(|err| BenchError::io(&path, err))?;
            Some(path)
        } else {
            None
        };

        let metrics = metrics::aggregate(
            &logs,
            &samples,
            request.streams,
            self.config.target_fps,
            self.config.error_margin,
        );
        let result = BenchmarkResult {
            timestamp: started_at,
            system: self.system.clone(),
            tier: request.tier,
            detect: request.detect,
            classify: request.classify,
            batch: request.batch,
            effective_batch: (
                request.detect.effective_batch(request.batch),
                request.classify.effective_batch(request.batch),
            ),
            streams: request.streams,
            duration: request.duration,
            concurrent: request.is_split(),
            pinned_cores,
            device_config: request.device_config_label(),
            metrics,
            pipelines: specs.iter().map(|spec| spec.description.template()).collect(),
            context_logs,
            combined_log,
            power_log,
        };
        result.record_in(&self.config.results_dir)?;
        Ok(result)
    }
}

fn run_id(request: &BenchmarkRequest, at: OffsetDateTime) -> String {
    format!(
        "{}_{}_b{}_s{}_{}",
        request.tier,
        request.device_config_label(),
        request.batch,
        request.streams,
        at.unix_timestamp_nanos() / 1_000_000
    )
}

fn read_log(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), error = %err, "context log unreadable");
        String::new()
    })
}
