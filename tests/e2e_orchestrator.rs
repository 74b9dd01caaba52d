use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use edge_bench::{
    BenchConfig, BenchError, BenchmarkOrchestrator, BenchmarkRequest, ContextSpec, CoreClass,
    CoreTopology, ExecutionContext, ExitOutcome, RunState, Tier, assets,
};
use rstest::rstest;
use tempfile::TempDir;

struct NoTopology;

impl CoreTopology for NoTopology {
    fn cores(&self, _class: CoreClass) -> Option<Vec<u32>> {
        None
    }
}

/// Writes a canned fps log per context and records every call.
#[derive(Default)]
struct RecordingContext {
    fps: Vec<Option<f64>>,
    outcomes: Vec<ExitOutcome>,
    refuse_launch_at: Option<usize>,
    /// Block in `wait` for the whole timeout, like a live pipeline.
    hold: bool,
    launched: Vec<ContextSpec>,
    terminated: Vec<usize>,
}

impl RecordingContext {
    fn reporting(fps: &[f64]) -> Self {
        Self {
            fps: fps.iter().copied().map(Some).collect(),
            ..Self::default()
        }
    }
}

impl ExecutionContext for RecordingContext {
    type Handle = usize;

    fn launch(&mut self, spec: &ContextSpec) -> Result<usize, BenchError> {
        let index = self.launched.len();
        if self.refuse_launch_at == Some(index) {
            return Err(BenchError::ResourceAcquisition {
                context: spec.name.clone(),
                reason: "device busy".to_string(),
            });
        }
        let logs = spec.log_path.parent().expect("context log should have a directory");
        fs::create_dir_all(logs).expect("logs directory should be creatable");
        let body = match self.fps.get(index).copied().flatten() {
            Some(fps) => format!(
                "Setting pipeline to PLAYING ...\nFpsCounter(average 10.00sec): total={fps:.2} fps, number-streams={}, per-stream={:.2} fps\n",
                spec.streams,
                fps / f64::from(spec.streams)
            ),
            None => "ERROR: from element /GstPipeline:pipeline0\n".to_string(),
        };
        fs::write(&spec.log_path, body).expect("context log should be writable");
        self.launched.push(spec.clone());
        Ok(index)
    }

    fn wait(&mut self, handle: &mut usize, timeout: Duration) -> Result<ExitOutcome, BenchError> {
        if self.hold {
            thread::sleep(timeout);
        }
        Ok(self
            .outcomes
            .get(*handle)
            .copied()
            .unwrap_or(ExitOutcome::TimedOut))
    }

    fn terminate(&mut self, handle: &mut usize) -> Result<(), BenchError> {
        self.terminated.push(*handle);
        Ok(())
    }
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn with_assets(tiers: &[Tier]) -> Self {
        let dir = tempfile::tempdir().expect("temp workspace should be created");
        for tier in tiers {
            for path in assets::required_assets(*tier, &dir.path().join("pipelines")) {
                let parent = path.parent().expect("asset should have a directory");
                fs::create_dir_all(parent).expect("asset directory should be creatable");
                fs::write(path, b"stub").expect("asset stub should be writable");
            }
        }
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self) -> BenchConfig {
        let root = self.root();
        BenchConfig {
            pipelines_root: root.join("pipelines"),
            results_dir: root.join("results"),
            logs_dir: root.join("logs"),
            sysfs_root: root.join("sys"),
            dev_root: root.join("dev"),
            system_label: Some("test-host".to_string()),
            ..BenchConfig::default()
        }
    }

    fn orchestrator(&self, context: RecordingContext) -> BenchmarkOrchestrator<RecordingContext> {
        self.sampling_orchestrator(context).without_power()
    }

    /// Samples power from `<root>/sys` alongside the contexts.
    fn sampling_orchestrator(
        &self,
        context: RecordingContext,
    ) -> BenchmarkOrchestrator<RecordingContext> {
        BenchmarkOrchestrator::new(self.config(), context).with_topology(Box::new(NoTopology))
    }

    fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.root().join(relative))
            .unwrap_or_else(|err| panic!("{relative} should be readable: {err}"))
    }
}

/// Lays out `class/drm/card0` bound to `xe` with a hwmon directory, returning it.
#[cfg(unix)]
fn fake_gpu_hwmon(sysfs: &Path) -> PathBuf {
    use std::os::unix::fs::symlink;

    let pci = sysfs.join("devices/pci0000:00/0000:03:00.0");
    let driver = sysfs.join("bus/pci/drivers/xe");
    let card = sysfs.join("class/drm/card0");
    for dir in [&pci, &driver, &card] {
        fs::create_dir_all(dir).expect("sysfs directory should be creatable");
    }
    symlink(&driver, pci.join("driver")).expect("driver link should be creatable");
    symlink(&pci, card.join("device")).expect("device link should be creatable");
    let hwmon = pci.join("hwmon/hwmon3");
    fs::create_dir_all(&hwmon).expect("hwmon directory should be creatable");
    hwmon
}

fn request(
    tier: &str,
    detect: &str,
    classify: &str,
    batch: i64,
    streams: i64,
    concurrent: bool,
) -> BenchmarkRequest {
    BenchmarkRequest::parse(tier, detect, classify, batch, streams, 60, concurrent, "0-3")
        .expect("benchmark request should be valid")
}

#[test]
fn gpu_npu_concurrent_run_splits_streams_and_sums_throughput() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let mut orchestrator = ws.orchestrator(RecordingContext::reporting(&[200.0, 85.0]));

    let result = orchestrator
        .run(&request("light", "GPU", "NPU", 8, 8, true))
        .expect("concurrent run should succeed");
    assert_eq!(orchestrator.state(), RunState::Done);

    let launched = &orchestrator.executor().launched;
    assert_eq!(launched.len(), 2);
    let (gpu, npu) = (&launched[0], &launched[1]);
    assert_eq!((gpu.streams, npu.streams), (4, 4));
    assert_eq!(gpu.description.detect.param("device"), Some("GPU"));
    assert_eq!(gpu.description.classify[0].param("device"), Some("GPU"));
    assert_eq!(gpu.description.detect.param("batch-size"), Some("8"));
    assert_eq!(npu.description.detect.param("device"), Some("NPU"));
    assert_eq!(npu.description.detect.param("batch-size"), Some("1"));
    assert_eq!(npu.description.classify[0].param("batch-size"), Some("1"));
    assert_eq!(gpu.constraints.pinning.to_string(), "0-3");
    assert_eq!(
        gpu.constraints.read_only_root.as_deref(),
        Some(ws.root().join("pipelines").as_path())
    );

    assert_eq!(result.metrics.throughput, Some(285.0));
    assert_eq!(result.metrics.per_stream, Some(285.0 / 8.0));
    assert_eq!(result.metrics.theoretical_streams, Some(10));
    assert_eq!(result.metrics.avg_power, None);
    assert_eq!(result.effective_batch, (8, 1));
    assert_eq!(result.device_config, "GPU-NPU-Concurrent");
    assert_eq!(result.pinned_cores, "0-3");
    assert_eq!(result.pipelines.len(), 2);

    let combined_log = result
        .combined_log
        .as_ref()
        .expect("split run should write a combined log");
    let combined = fs::read_to_string(combined_log).expect("combined log should be readable");
    assert!(combined.contains("total=200.00"));
    assert!(combined.find("total=200.00") < combined.find("total=85.00"));

    let csv = ws.read("results/GPU-NPU-Concurrent/e2e-edge-pipeline_light_b8_s8.csv");
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("Pipeline1,Pipeline2"));
    assert!(lines[1].contains(",285.00,"));
    assert!(lines[1].contains(",GPU-NPU-Concurrent,NA,NA,"));

    let mut terminated = orchestrator.executor().terminated.clone();
    terminated.sort_unstable();
    assert_eq!(terminated, vec![0, 1]);
}

#[test]
fn mixed_devices_without_concurrency_use_one_context() {
    let ws = Workspace::with_assets(&[Tier::Medium]);
    let mut orchestrator = ws.orchestrator(RecordingContext::reporting(&[240.0]));

    let result = orchestrator
        .run(&request("medium", "GPU", "NPU", 4, 6, false))
        .expect("mixed-device run should succeed");

    let launched = &orchestrator.executor().launched;
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].streams, 6);
    assert_eq!(launched[0].description.detect.param("device"), Some("GPU"));
    assert_eq!(launched[0].description.classify.len(), 2);
    assert!(
        launched[0]
            .description
            .classify
            .iter()
            .all(|stage| stage.param("device") == Some("NPU"))
    );
    assert_eq!(result.device_config, "GPU-NPU");
    assert!(result.combined_log.is_none());
    assert!(!result.concurrent);
    assert_eq!(result.metrics.theoretical_streams, Some(8));
}

#[test]
fn missing_assets_stop_before_any_launch() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let mut orchestrator = ws.orchestrator(RecordingContext::reporting(&[100.0]));

    let err = orchestrator
        .run(&request("heavy", "CPU", "CPU", 1, 2, false))
        .expect_err("heavy tier assets are absent");
    let BenchError::MissingAsset(missing) = err else {
        panic!("expected MissingAsset, got {err}");
    };
    assert!(!missing.is_empty());
    assert!(orchestrator.executor().launched.is_empty());
    assert_eq!(orchestrator.state(), RunState::Failed);
    assert!(!ws.root().join("results").exists());
}

#[test]
fn invalid_request_is_rejected_before_assets() {
    let ws = Workspace::with_assets(&[]);
    let mut orchestrator = ws.orchestrator(RecordingContext::default());
    let mut req = request("light", "CPU", "CPU", 1, 2, false);
    req.streams = 0;

    assert!(matches!(
        orchestrator.run(&req),
        Err(BenchError::InvalidParameter(_))
    ));
    assert!(orchestrator.executor().launched.is_empty());
}

#[test]
fn failed_context_tears_down_the_run_without_a_result_row() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let context = RecordingContext {
        outcomes: vec![ExitOutcome::TimedOut, ExitOutcome::Failed(Some(1))],
        ..RecordingContext::reporting(&[200.0, 85.0])
    };
    let mut orchestrator = ws.orchestrator(context);

    let err = orchestrator
        .run(&request("light", "GPU", "NPU", 8, 8, true))
        .expect_err("failed classify context should fail the run");
    assert!(matches!(
        err,
        BenchError::ContextFailed { ref context, outcome: ExitOutcome::Failed(Some(1)) }
            if context.ends_with("-classify")
    ));
    assert_eq!(orchestrator.state(), RunState::Failed);
    assert_eq!(orchestrator.executor().terminated.len(), 2);
    assert!(!ws.root().join("results").exists());
}

#[test]
fn launch_failure_terminates_already_running_contexts() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let context = RecordingContext {
        refuse_launch_at: Some(1),
        ..RecordingContext::reporting(&[200.0, 85.0])
    };
    let mut orchestrator = ws.orchestrator(context);

    let err = orchestrator
        .run(&request("light", "GPU", "NPU", 8, 8, true))
        .expect_err("refused launch should fail the run");
    assert!(matches!(err, BenchError::ResourceAcquisition { .. }));
    assert_eq!(orchestrator.executor().launched.len(), 1);
    assert_eq!(orchestrator.executor().terminated, vec![0]);
}

#[test]
fn unparsable_log_records_na_throughput() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let context = RecordingContext {
        fps: vec![Some(200.0), None],
        ..RecordingContext::default()
    };
    let mut orchestrator = ws.orchestrator(context);

    let result = orchestrator
        .run(&request("light", "GPU", "NPU", 8, 8, true))
        .expect("run without a throughput marker should still succeed");
    assert_eq!(result.metrics.throughput, None);
    assert_eq!(result.metrics.per_stream, None);
    assert_eq!(result.metrics.theoretical_streams, None);
    let row = result.row();
    assert_eq!(row[9], "NA");
    assert_eq!(row[11], "NA");
}

#[test]
fn single_stream_split_launches_only_the_detect_context() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let mut orchestrator = ws.orchestrator(RecordingContext::reporting(&[31.0]));

    let result = orchestrator
        .run(&request("light", "GPU", "NPU", 2, 1, true))
        .expect("single-stream split should succeed");
    assert_eq!(orchestrator.executor().launched.len(), 1);
    assert_eq!(orchestrator.executor().launched[0].streams, 1);
    assert_eq!(result.metrics.throughput, Some(31.0));
    assert!(result.combined_log.is_none());
}

#[rstest]
#[case(8, 4, 4)]
#[case(5, 3, 2)]
#[case(2, 1, 1)]
fn concurrent_split_gives_the_extra_stream_to_detect(
    #[case] streams: i64,
    #[case] detect_streams: u32,
    #[case] classify_streams: u32,
) {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let mut orchestrator = ws.orchestrator(RecordingContext::reporting(&[60.0, 30.0]));

    let result = orchestrator
        .run(&request("light", "GPU", "NPU", 1, streams, true))
        .expect("split run should succeed");
    let launched = &orchestrator.executor().launched;
    assert_eq!(launched.len(), 2);
    assert_eq!(launched[0].streams, detect_streams);
    assert_eq!(launched[1].streams, classify_streams);
    assert_eq!(result.metrics.throughput, Some(90.0));
    assert_eq!(result.streams, streams as u32);
}

#[cfg(unix)]
#[test]
fn power_is_sampled_alongside_the_contexts() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let hwmon = fake_gpu_hwmon(&ws.root().join("sys"));
    fs::write(hwmon.join("power1_label"), "card\n").expect("label should be writable");
    fs::write(hwmon.join("power1_input"), "12500000\n").expect("input should be writable");
    let context = RecordingContext {
        hold: true,
        ..RecordingContext::reporting(&[250.0])
    };
    let mut orchestrator = ws.sampling_orchestrator(context);
    let mut req = request("light", "CPU", "CPU", 1, 4, false);
    req.duration = Duration::from_secs(4);

    let result = orchestrator.run(&req).expect("sampled run should succeed");
    assert_eq!(orchestrator.state(), RunState::Done);
    assert_eq!(result.metrics.avg_power, Some(12.5));
    assert_eq!(result.metrics.efficiency, Some(20.0));

    let power_log = result.power_log.as_ref().expect("power log should be recorded");
    let power = fs::read_to_string(power_log).expect("power log should be readable");
    assert!(power.contains("[power] card0 (xe@0000:03:00.0): 12.50 W"));

    let csv = ws.read("results/CPU/e2e-edge-pipeline_light_b1_s4.csv");
    let row = csv.lines().nth(1).expect("result row should follow the header");
    assert!(row.contains(",CPU,12.50,20.00,"));
}

#[cfg(unix)]
#[test]
fn broken_power_sensor_degrades_to_na() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let hwmon = fake_gpu_hwmon(&ws.root().join("sys"));
    fs::create_dir_all(hwmon.join("power1_label")).expect("label directory should be creatable");
    let mut orchestrator = ws.sampling_orchestrator(RecordingContext::reporting(&[250.0]));

    let result = orchestrator
        .run(&request("light", "CPU", "CPU", 1, 4, false))
        .expect("sampler failure should not fail the run");
    assert_eq!(orchestrator.state(), RunState::Done);
    assert_eq!(result.metrics.throughput, Some(250.0));
    assert_eq!(result.metrics.avg_power, None);
    assert_eq!(result.metrics.efficiency, None);
    assert!(result.power_log.is_none());

    let csv = ws.read("results/CPU/e2e-edge-pipeline_light_b1_s4.csv");
    let row = csv.lines().nth(1).expect("result row should follow the header");
    assert!(row.contains(",CPU,NA,NA,"));
}

#[test]
fn operator_interrupt_tears_down_every_context() {
    let ws = Workspace::with_assets(&[Tier::Light]);
    let context = RecordingContext {
        outcomes: vec![ExitOutcome::Interrupted],
        ..RecordingContext::reporting(&[200.0, 85.0])
    };
    let mut orchestrator = ws.orchestrator(context);

    let err = orchestrator
        .run(&request("light", "GPU", "NPU", 8, 8, true))
        .expect_err("interrupted run should not produce a result");
    assert!(matches!(
        err,
        BenchError::ContextFailed { outcome: ExitOutcome::Interrupted, .. }
    ));
    assert_eq!(orchestrator.state(), RunState::Failed);
    let mut terminated = orchestrator.executor().terminated.clone();
    terminated.sort_unstable();
    assert_eq!(terminated, vec![0, 1]);
    assert!(!ws.root().join("results").exists());
}
