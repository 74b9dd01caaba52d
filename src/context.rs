//! Launches pipeline replicas as isolated OS processes.
//!
//! Each context runs in its own process group so the whole launcher tree can be
//! signalled at once. Affinity and supplementary groups are applied between
//! fork and exec; container isolation hands the same constraints to the
//! container runtime instead.

use std::fs::{self, File};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{BenchConfig, Isolation};
use crate::contract::{BenchError, ContextSpec, ExecutionContext, ExitOutcome};

const POLL: Duration = Duration::from_millis(50);
const CONTAINER_RUNTIME: &str = "docker";

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Routes SIGINT/SIGTERM into a flag polled by every wait loop.
#[cfg(unix)]
pub fn install_interrupt_handler() {
    extern "C" fn on_signal(_signal: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only touches an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
pub fn install_interrupt_handler() {}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Runs each context through the configured launcher program.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    program: String,
    leading_args: Vec<String>,
    isolation: Isolation,
    grace: Duration,
    interrupt: &'static AtomicBool,
}

#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    child: Child,
    container: Option<String>,
    outcome: Option<ExitOutcome>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl ProcessContext {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            isolation: Isolation::Process,
            grace: Duration::from_secs(5),
            interrupt: &INTERRUPTED,
        }
    }

    pub fn from_config(config: &BenchConfig) -> Self {
        Self::new(config.launcher.clone())
            .with_leading_args(config.launcher_args.clone())
            .with_isolation(config.isolation.clone())
            .with_grace(config.terminate_grace())
    }

    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Polls `flag` instead of the process-wide signal flag.
    pub fn with_interrupt_flag(mut self, flag: &'static AtomicBool) -> Self {
        self.interrupt = flag;
        self
    }

    fn command(&self, spec: &ContextSpec, container: Option<&str>) -> Command {
        let pipeline = spec.description.replicate(spec.streams);
        match (&self.isolation, container) {
            (Isolation::Container { image }, Some(name)) => {
                let mut cmd = Command::new(CONTAINER_RUNTIME);
                cmd.args(container_args(spec, name, image));
                cmd.arg(&self.program).args(&self.leading_args).args(pipeline);
                own_process_group(&mut cmd);
                cmd
            }
            _ => {
                let mut cmd = Command::new(&self.program);
                cmd.args(&self.leading_args).args(pipeline);
                own_process_group(&mut cmd);
                apply_constraints(&mut cmd, spec);
                cmd
            }
        }
    }

    fn reap(&self, handle: &mut ProcessHandle) -> Result<Option<ExitStatus>, BenchError> {
        handle
            .child
            .try_wait()
            .map_err(|err| BenchError::ResourceAcquisition {
                context: handle.name.clone(),
                reason: format!("wait failed: {err}"),
            })
    }
}

impl ExecutionContext for ProcessContext {
    type Handle = ProcessHandle;

    fn launch(&mut self, spec: &ContextSpec) -> Result<ProcessHandle, BenchError> {
        if let Some(parent) = spec.log_path.parent() {
            fs::create_dir_all(parent).map_err(|err| BenchError::io(parent, err))?;
        }
        let stdout = File::create(&spec.log_path).map_err(|err| BenchError::io(&spec.log_path, err))?;
        let stderr = stdout
            .try_clone()
            .map_err(|err| BenchError::io(&spec.log_path, err))?;

        let container = matches!(self.isolation, Isolation::Container { .. })
            .then(|| format!("edge-bench-{}-{}", std::process::id(), spec.name));
        let mut cmd = self.command(spec, container.as_deref());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = cmd.spawn().map_err(|err| BenchError::ResourceAcquisition {
            context: spec.name.clone(),
            reason: format!("failed to start {}: {err}", self.program),
        })?;
        tracing::info!(context = %spec.name, pid = child.id(), streams = spec.streams, "context launched");
        Ok(ProcessHandle {
            name: spec.name.clone(),
            child,
            container,
            outcome: None,
        })
    }

    fn wait(
        &mut self,
        handle: &mut ProcessHandle,
        timeout: Duration,
    ) -> Result<ExitOutcome, BenchError> {
        if let Some(outcome) = handle.outcome {
            return Ok(outcome);
        }
        let deadline = Instant::now() + timeout;
        let outcome = loop {
            if let Some(status) = self.reap(handle)? {
                break outcome_of(status);
            }
            if self.interrupt.load(Ordering::SeqCst) {
                tracing::warn!(context = %handle.name, "operator interrupt; stopping context");
                self.terminate(handle)?;
                break ExitOutcome::Interrupted;
            }
            if Instant::now() >= deadline {
                tracing::debug!(context = %handle.name, "duration elapsed; stopping context");
                self.terminate(handle)?;
                break ExitOutcome::TimedOut;
            }
            thread::sleep(POLL);
        };
        handle.outcome = Some(outcome);
        tracing::info!(context = %handle.name, %outcome, "context finished");
        Ok(outcome)
    }

    fn terminate(&mut self, handle: &mut ProcessHandle) -> Result<(), BenchError> {
        if handle.outcome.is_some() || self.reap(handle)?.is_some() {
            return Ok(());
        }
        if let Some(name) = handle.container.take() {
            stop_container(&name, self.grace);
        }
        signal_group(handle.child.id(), Signal::Interrupt);
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if self.reap(handle)?.is_some() {
                return Ok(());
            }
            thread::sleep(POLL);
        }
        tracing::warn!(context = %handle.name, "context ignored interrupt; killing process group");
        signal_group(handle.child.id(), Signal::Kill);
        let _ = handle.child.kill();
        handle
            .child
            .wait()
            .map_err(|err| BenchError::ResourceAcquisition {
                context: handle.name.clone(),
                reason: format!("wait after kill failed: {err}"),
            })?;
        Ok(())
    }
}

fn outcome_of(status: ExitStatus) -> ExitOutcome {
    if status.success() {
        ExitOutcome::Completed
    } else {
        ExitOutcome::Failed(status.code())
    }
}

/// `docker run` arguments up to and including the image.
fn container_args(spec: &ContextSpec, name: &str, image: &str) -> Vec<String> {
    let constraints = &spec.constraints;
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--init".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--network".to_string(),
        "none".to_string(),
    ];
    if constraints.pinning.is_pinned() {
        args.push(format!("--cpuset-cpus={}", constraints.pinning));
    }
    for node in &constraints.device_nodes {
        args.push(format!("--device={}", node.display()));
    }
    for gid in &constraints.group_ids {
        args.push(format!("--group-add={gid}"));
    }
    if let Some(root) = &constraints.read_only_root {
        args.push("-v".to_string());
        args.push(format!("{0}:{0}:ro", root.display()));
    }
    args.push(image.to_string());
    args
}

fn stop_container(name: &str, grace: Duration) {
    let status = Command::new(CONTAINER_RUNTIME)
        .args(["stop", "-t", &grace.as_secs().to_string(), name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = status {
        tracing::warn!(container = name, error = %err, "failed to stop container");
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let signal = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: the child leads its own group, so this never reaches our process.
    unsafe {
        libc::killpg(pgid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(target_os = "linux")]
fn apply_constraints(cmd: &mut Command, spec: &ContextSpec) {
    use std::os::unix::process::CommandExt;

    let mask = affinity_mask(spec.constraints.pinning.core_ids());
    let groups: Vec<libc::gid_t> = spec.constraints.group_ids.clone();
    // SAFETY: the hook only issues raw syscalls on data prepared before fork.
    unsafe {
        cmd.pre_exec(move || enter_constraints(mask.as_ref(), &groups));
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_constraints(_cmd: &mut Command, spec: &ContextSpec) {
    if spec.constraints.pinning.is_pinned() {
        tracing::warn!(context = %spec.name, "core affinity is only applied on Linux");
    }
}

#[cfg(target_os = "linux")]
fn affinity_mask(cores: &[u32]) -> Option<libc::cpu_set_t> {
    let limit = libc::CPU_SETSIZE as usize;
    let cores: Vec<usize> = cores
        .iter()
        .map(|core| *core as usize)
        .filter(|core| *core < limit)
        .collect();
    if cores.is_empty() {
        return None;
    }
    // SAFETY: cpu_set_t is plain data; zeroed is its empty state.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for core in cores {
            libc::CPU_SET(core, &mut set);
        }
        Some(set)
    }
}

#[cfg(target_os = "linux")]
fn enter_constraints(mask: Option<&libc::cpu_set_t>, groups: &[libc::gid_t]) -> std::io::Result<()> {
    if let Some(set) = mask {
        // SAFETY: `set` outlives the call and the size matches its type.
        let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    // Supplementary groups can only be changed with privilege; otherwise the
    // invoking user's groups already decide device access.
    // SAFETY: geteuid has no preconditions; setgroups reads `groups` in bounds.
    if !groups.is_empty() && unsafe { libc::geteuid() } == 0 {
        let rc = unsafe { libc::setgroups(groups.len() as _, groups.as_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
