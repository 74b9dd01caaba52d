//! Package power telemetry from hwmon and RAPL counters.
//!
//! Readings are written as one line per sample to a side artifact
//! (`[energy] card0 (xe@0000:03:00.0): 14.20 W`) and parsed back by the
//! metrics aggregation step.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::{fmt, fmt::Display};

use regex::Regex;

use crate::contract::BenchError;

pub(crate) const KNOWN_GPU_DRIVERS: &[&str] = &["i915", "xe"];
const SENSOR_LABELS: &[&str] = &["card", "package", "pkg"];
const RAPL_ENERGY: &str = "class/powercap/intel-rapl:0/energy_uj";
const COUNTER_WRAP: i64 = 1 << 32;
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSource {
    /// Instantaneous power register (`power*_input`, microwatts).
    PowerRegister,
    /// Rate derived from an energy accumulator (microjoules).
    EnergyCounter,
}

impl Display for PowerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerRegister => f.write_str("power"),
            Self::EnergyCounter => f.write_str("energy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerSample {
    pub source: Option<PowerSource>,
    pub device: String,
    pub driver: String,
    pub slot: String,
    pub watts: Option<f64>,
}

impl PowerSample {
    pub fn log_line(&self) -> String {
        let source = self
            .source
            .map_or_else(|| "none".to_string(), |s| s.to_string());
        let value = self
            .watts
            .map_or_else(|| "NA".to_string(), |w| format!("{w:.2} W"));
        format!(
            "[{source}] {} ({}@{}): {value}",
            self.device, self.driver, self.slot
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sensor {
    Power(PathBuf),
    Energy(PathBuf),
    Unavailable,
}

impl Sensor {
    fn path(&self) -> Option<&Path> {
        match self {
            Self::Power(path) | Self::Energy(path) => Some(path),
            Self::Unavailable => None,
        }
    }
}

/// A DRM card bound to a known GPU driver, or the system package as fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerDevice {
    pub label: String,
    pub driver: String,
    pub slot: String,
    sensor: Sensor,
}

impl PowerDevice {
    pub fn has_sensor(&self) -> bool {
        self.sensor != Sensor::Unavailable
    }

    fn sample(&self, source: Option<PowerSource>, watts: Option<f64>) -> PowerSample {
        PowerSample {
            source,
            device: self.label.clone(),
            driver: self.driver.clone(),
            slot: self.slot.clone(),
            watts,
        }
    }
}

/// Delay, length and cadence of one sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleWindow {
    pub interval: Duration,
    pub duration: Duration,
    pub delay: Duration,
}

impl SampleWindow {
    /// Steady-state slice of a benchmark: starts a quarter in, lasts half the run.
    pub fn for_benchmark(benchmark: Duration, interval: Duration) -> Self {
        Self {
            interval,
            duration: benchmark / 2,
            delay: benchmark / 4,
        }
    }
}

/// Watts from two energy readings, correcting for 32-bit counter wraparound.
pub fn energy_rate_watts(previous_uj: u64, current_uj: u64, elapsed: Duration) -> Option<f64> {
    let seconds = elapsed.as_secs_f64();
    if seconds <= 0.0 {
        return None;
    }
    let mut delta = current_uj as i64 - previous_uj as i64;
    if delta < 0 {
        delta += COUNTER_WRAP;
    }
    Some(delta as f64 / 1_000_000.0 / seconds)
}

#[derive(Debug, Clone)]
pub struct PowerSampler {
    sysfs_root: PathBuf,
}

impl PowerSampler {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    /// Enumerates DRM cards bound to a known GPU driver.
    ///
    /// Without any such card the system-wide RAPL package counter stands in as a
    /// single device so CPU-only hosts still report power.
    pub fn discover(&self) -> Result<Vec<PowerDevice>, BenchError> {
        let drm = self.sysfs_root.join("class/drm");
        let mut devices = Vec::new();
        let entries = match fs::read_dir(&drm) {
            Ok(entries) => entries.filter_map(Result::ok).collect::<Vec<_>>(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(read_error(&drm, err)),
        };
        let mut cards = entries
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| is_card_node(path))
            .collect::<Vec<_>>();
        cards.sort();

        for card in cards {
            let Some(driver) = link_name(&card.join("device/driver")) else {
                continue;
            };
            if !KNOWN_GPU_DRIVERS.contains(&driver.as_str()) {
                tracing::debug!(card = %card.display(), driver = %driver, "skipping non-GPU DRM card");
                continue;
            }
            let slot = link_name(&card.join("device")).unwrap_or_else(|| "unknown".to_string());
            let sensor = self.hwmon_sensor(&card.join("device/hwmon"))?;
            let sensor = match sensor {
                Sensor::Unavailable => self.rapl_sensor(),
                found => found,
            };
            devices.push(PowerDevice {
                label: file_name(&card),
                driver,
                slot,
                sensor,
            });
        }

        if devices.is_empty() {
            let sensor = self.rapl_sensor();
            if sensor != Sensor::Unavailable {
                devices.push(PowerDevice {
                    label: "package".to_string(),
                    driver: "intel-rapl".to_string(),
                    slot: "0".to_string(),
                    sensor,
                });
            }
        }
        tracing::debug!(count = devices.len(), "discovered power devices");
        Ok(devices)
    }

    fn rapl_sensor(&self) -> Sensor {
        let path = self.sysfs_root.join(RAPL_ENERGY);
        if path.exists() {
            Sensor::Energy(path)
        } else {
            Sensor::Unavailable
        }
    }

    fn hwmon_sensor(&self, hwmon_root: &Path) -> Result<Sensor, BenchError> {
        let mut hwmons = match fs::read_dir(hwmon_root) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect::<Vec<_>>(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Sensor::Unavailable),
            Err(err) => return Err(read_error(hwmon_root, err)),
        };
        hwmons.sort();

        let mut energy = None;
        for hwmon in hwmons {
            let mut labels = fs::read_dir(&hwmon)
                .map_err(|err| read_error(&hwmon, err))?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| file_name(path).ends_with("_label"))
                .collect::<Vec<_>>();
            labels.sort();
            for label_path in labels {
                let label = fs::read_to_string(&label_path)
                    .map_err(|err| read_error(&label_path, err))?
                    .trim()
                    .to_ascii_lowercase();
                if !SENSOR_LABELS.iter().any(|wanted| label.contains(wanted)) {
                    continue;
                }
                let name = file_name(&label_path);
                let input = hwmon.join(name.replace("_label", "_input"));
                if !input.exists() {
                    continue;
                }
                if name.starts_with("power") {
                    return Ok(Sensor::Power(input));
                }
                if name.starts_with("energy") && energy.is_none() {
                    energy = Some(input);
                }
            }
        }
        Ok(energy.map_or(Sensor::Unavailable, Sensor::Energy))
    }

    /// Fails with `PermissionDenied` when any discovered sensor is unreadable.
    pub fn check_access(&self, devices: &[PowerDevice]) -> Result<(), BenchError> {
        for path in devices.iter().filter_map(|d| d.sensor.path()) {
            if let Err(err) = fs::read_to_string(path) {
                return Err(read_error(path, err));
            }
        }
        Ok(())
    }

    /// Samples every device each `interval` for `duration` after `delay`.
    ///
    /// Returns early without error once `stop` is raised.
    pub fn sample(
        &self,
        devices: &[PowerDevice],
        window: SampleWindow,
        stop: &AtomicBool,
        sink: &mut dyn FnMut(&PowerSample),
    ) -> Vec<PowerSample> {
        let mut collected = Vec::new();
        if window.interval.is_zero() || !sleep_unless_stopped(Instant::now() + window.delay, stop) {
            return collected;
        }

        let mut energy_state: HashMap<usize, (u64, Instant)> = HashMap::new();
        for (index, device) in devices.iter().enumerate() {
            if let Sensor::Energy(path) = &device.sensor
                && let Some(value) = read_counter(path)
            {
                energy_state.insert(index, (value, Instant::now()));
            }
        }

        let start = Instant::now();
        let end = start + window.duration;
        let mut next_tick = start + window.interval;
        while next_tick <= end {
            if !sleep_unless_stopped(next_tick, stop) {
                break;
            }
            for (index, device) in devices.iter().enumerate() {
                let sample = match &device.sensor {
                    Sensor::Power(path) => device.sample(
                        Some(PowerSource::PowerRegister),
                        read_counter(path).map(|uw| uw as f64 / 1_000_000.0),
                    ),
                    Sensor::Energy(path) => {
                        let now = Instant::now();
                        let previous = energy_state.get(&index).copied();
                        let watts = match (read_counter(path), previous) {
                            (Some(current), Some((previous, at))) => {
                                energy_state.insert(index, (current, now));
                                energy_rate_watts(previous, current, now.duration_since(at))
                            }
                            (Some(current), None) => {
                                energy_state.insert(index, (current, now));
                                None
                            }
                            (None, _) => None,
                        };
                        device.sample(Some(PowerSource::EnergyCounter), watts)
                    }
                    Sensor::Unavailable => device.sample(None, None),
                };
                sink(&sample);
                collected.push(sample);
            }
            next_tick += window.interval;
        }
        collected
    }

    /// Discovers devices, checks permissions up front, then samples on a worker thread.
    pub fn spawn(self, window: SampleWindow, log_path: &Path) -> Result<SamplerHandle, BenchError> {
        let devices = self.discover()?;
        self.check_access(&devices)?;
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).map_err(|err| BenchError::io(parent, err))?;
        }
        let file = File::create(log_path).map_err(|err| BenchError::io(log_path, err))?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("power-sampler".to_string())
            .spawn(move || {
                let mut writer = BufWriter::new(file);
                self.sample(&devices, window, &worker_stop, &mut |sample| {
                    let _ = writeln!(writer, "{}", sample.log_line());
                    let _ = writer.flush();
                })
            })
            .map_err(|err| BenchError::ResourceAcquisition {
                context: "power-sampler".to_string(),
                reason: err.to_string(),
            })?;

        tracing::info!(
            delay_s = window.delay.as_secs_f64(),
            duration_s = window.duration.as_secs_f64(),
            log = %log_path.display(),
            "power sampler started"
        );
        Ok(SamplerHandle {
            stop,
            worker: Some(worker),
            log_path: log_path.to_path_buf(),
            samples: Vec::new(),
        })
    }
}

/// Running sampler; stopping is idempotent and also happens on drop.
#[derive(Debug)]
pub struct SamplerHandle {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Vec<PowerSample>>>,
    log_path: PathBuf,
    samples: Vec<PowerSample>,
}

impl SamplerHandle {
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Blocks until the window completes on its own.
    pub fn join(&mut self) -> &[PowerSample] {
        if let Some(worker) = self.worker.take() {
            self.samples = worker.join().unwrap_or_default();
        }
        &self.samples
    }

    pub fn stop(&mut self) -> &[PowerSample] {
        self.stop.store(true, Ordering::Relaxed);
        self.join()
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Reads a power side artifact back into samples, skipping foreign lines.
pub fn parse_power_log(text: &str) -> Vec<PowerSample> {
    let Ok(pattern) = Regex::new(
        r"^\[(\w+)\]\s+(\S+)\s+\(([^@)]+)@([^)]+)\):\s+(NA|[0-9]+(?:\.[0-9]+)?)(?:\s*W)?\s*$",
    ) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let caps = pattern.captures(line.trim())?;
            let source = match &caps[1] {
                "power" => Some(PowerSource::PowerRegister),
                "energy" => Some(PowerSource::EnergyCounter),
                _ => None,
            };
            Some(PowerSample {
                source,
                device: caps[2].to_string(),
                driver: caps[3].to_string(),
                slot: caps[4].to_string(),
                watts: caps[5].parse::<f64>().ok(),
            })
        })
        .collect()
}

pub fn read_power_log(path: &Path) -> Result<Vec<PowerSample>, BenchError> {
    let text = fs::read_to_string(path).map_err(|err| read_error(path, err))?;
    Ok(parse_power_log(&text))
}

fn sleep_unless_stopped(deadline: Instant, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

fn read_counter(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_error(path: &Path, err: io::Error) -> BenchError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        BenchError::PermissionDenied(path.to_path_buf())
    } else {
        BenchError::io(path, err)
    }
}

pub(crate) fn is_card_node(path: &Path) -> bool {
    let name = file_name(path);
    name.strip_prefix("card")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

pub(crate) fn link_name(path: &Path) -> Option<String> {
    let resolved = fs::canonicalize(path).ok()?;
    Some(file_name(&resolved))
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
