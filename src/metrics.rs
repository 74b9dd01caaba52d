use std::sync::OnceLock;

use regex::Regex;

use crate::power::PowerSample;

/// Quotients this close to an integer are division noise, not a shortfall.
const SNAP_TOLERANCE: f64 = 1e-12;

/// Derived figures for one benchmark; `None` renders as `NA`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Metrics {
    pub throughput: Option<f64>,
    pub per_stream: Option<f64>,
    pub theoretical_streams: Option<u32>,
    pub avg_power: Option<f64>,
    pub efficiency: Option<f64>,
}

fn throughput_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"average[^\n]*?total=([0-9]+(?:\.[0-9]+)?)").ok())
        .as_ref()
}

/// Last running-average total fps reported in a log.
pub fn parse_throughput(log: &str) -> Option<f64> {
    throughput_pattern()?
        .captures_iter(log)
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .last()
}

/// Sums independently measured contexts; any context without a marker makes the total unknown.
pub fn combined_throughput<S: AsRef<str>>(logs: &[S]) -> Option<f64> {
    if logs.is_empty() {
        return None;
    }
    logs.iter().try_fold(0.0, |total, log| {
        let value = parse_throughput(log.as_ref());
        if value.is_none() {
            tracing::warn!("no throughput marker found in context log");
        }
        value.map(|fps| total + fps)
    })
}

pub fn per_stream(throughput: Option<f64>, streams: u32) -> Option<f64> {
    if streams == 0 {
        return None;
    }
    throughput.map(|fps| fps / f64::from(streams))
}

/// Streams sustainable at `target_fps`, floored as a conservative capacity estimate.
pub fn theoretical_streams(throughput: Option<f64>, target_fps: f64, margin: f64) -> Option<u32> {
    let per_stream_budget = target_fps * margin;
    if per_stream_budget <= 0.0 {
        return None;
    }
    let fps = throughput?;
    let streams = fps / per_stream_budget;
    let nearest = streams.round();
    let floored = if nearest > streams && nearest - streams < SNAP_TOLERANCE {
        nearest
    } else {
        streams.floor()
    };
    Some(floored.max(0.0) as u32)
}

pub fn average_power(samples: &[PowerSample]) -> Option<f64> {
    let watts = samples.iter().filter_map(|s| s.watts).collect::<Vec<_>>();
    if watts.is_empty() {
        return None;
    }
    Some(watts.iter().sum::<f64>() / watts.len() as f64)
}

pub fn efficiency(throughput: Option<f64>, avg_power: Option<f64>) -> Option<f64> {
    match (throughput, avg_power) {
        (Some(fps), Some(watts)) if watts > 0.0 => Some(fps / watts),
        _ => None,
    }
}

pub fn aggregate<S: AsRef<str>>(
    logs: &[S],
    samples: &[PowerSample],
    streams: u32,
    target_fps: f64,
    margin: f64,
) -> Metrics {
    let throughput = combined_throughput(logs);
    let avg_power = average_power(samples);
    Metrics {
        throughput,
        per_stream: per_stream(throughput, streams),
        theoretical_streams: theoretical_streams(throughput, target_fps, margin),
        avg_power,
        efficiency: efficiency(throughput, avg_power),
    }
}

pub fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{v:.2}"))
}

pub fn format_count(value: Option<u32>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}
