use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fmt::Display};

use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::contract::{BenchError, DeviceTarget, Tier};
use crate::metrics::{Metrics, format_count, format_metric};

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub const RESULT_FILE_PREFIX: &str = "e2e-edge-pipeline";

const BASE_COLUMNS: &[&str] = &[
    "Timestamp",
    "System",
    "Duration (s)",
    "Cores Pinned",
    "Pipeline Config",
    "Detect Device",
    "Classify Device",
    "Batch",
    "Effective Batch",
    "Throughput (fps)",
    "Throughput per Stream (fps/#)",
    "Theoretical Stream Density (@30fps±5%)",
    "Measured Stream Density (#)",
    "Concurrent",
    "Device Configuration",
    "Avg Power (W)",
    "Efficiency (FPS/W)",
];

/// Immutable record of one benchmark invocation.
#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    pub timestamp: OffsetDateTime,
    pub system: String,
    pub tier: Tier,
    pub detect: DeviceTarget,
    pub classify: DeviceTarget,
    pub batch: u32,
    /// Batch actually configured on the detect and classify elements.
    pub effective_batch: (u32, u32),
    pub streams: u32,
    pub duration: Duration,
    pub concurrent: bool,
    pub pinned_cores: String,
    pub device_config: String,
    pub metrics: Metrics,
    /// One template per launched context, in launch order.
    pub pipelines: Vec<String>,
    pub context_logs: Vec<PathBuf>,
    pub combined_log: Option<PathBuf>,
    pub power_log: Option<PathBuf>,
}

impl BenchmarkResult {
    pub fn file_name(&self) -> String {
        format!(
            "{RESULT_FILE_PREFIX}_{}_b{}_s{}.csv",
            self.tier, self.batch, self.streams
        )
    }

    /// `<results_dir>/<device-config>/<file_name>`
    pub fn result_path(&self, results_dir: &Path) -> PathBuf {
        results_dir.join(&self.device_config).join(self.file_name())
    }

    pub fn header(&self) -> Vec<String> {
        let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
        for index in 1..=self.pipelines.len().max(1) {
            columns.push(format!("Pipeline{index}"));
        }
        columns
    }

    pub fn row(&self) -> Vec<String> {
        let timestamp = self
            .timestamp
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        let effective = match self.effective_batch {
            (detect, classify) if detect == classify => detect.to_string(),
            (detect, classify) => format!("{detect}/{classify}"),
        };
        let mut row = vec![
            timestamp,
            self.system.clone(),
            self.duration.as_secs().to_string(),
            self.pinned_cores.clone(),
            self.tier.to_string(),
            self.detect.to_string(),
            self.classify.to_string(),
            self.batch.to_string(),
            effective,
            format_metric(self.metrics.throughput),
            format_metric(self.metrics.per_stream),
            format_count(self.metrics.theoretical_streams),
            self.streams.to_string(),
            self.concurrent.to_string(),
            self.device_config.clone(),
            format_metric(self.metrics.avg_power),
            format_metric(self.metrics.efficiency),
        ];
        if self.pipelines.is_empty() {
            row.push(String::new());
        }
        row.extend(self.pipelines.iter().cloned());
        row
    }

    /// Records this result in its per-configuration CSV, newest row first.
    ///
    /// The HTML reporter reads only the first data row, so earlier runs stay
    /// below it as history rather than hiding the latest one.
    pub fn record_in(&self, results_dir: &Path) -> Result<PathBuf, BenchError> {
        let path = self.result_path(results_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| BenchError::io(parent, err))?;
        }
        let previous = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(BenchError::io(&path, err)),
        };
        let older_rows = previous.split_once('\n').map_or("", |(_, rows)| rows);

        let mut out = csv_line(&self.header());
        out.push_str(&csv_line(&self.row()));
        out.push_str(older_rows);
        let staging = path.with_extension("csv.tmp");
        fs::write(&staging, out).map_err(|err| BenchError::io(&staging, err))?;
        fs::rename(&staging, &path).map_err(|err| BenchError::io(&path, err))?;
        tracing::info!(path = %path.display(), "result row written");
        Ok(path)
    }
}

impl Display for BenchmarkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tier            : {}", self.tier)?;
        writeln!(f, "devices         : {}", self.device_config)?;
        writeln!(
            f,
            "batch/streams   : {} (effective {}/{}) x {}",
            self.batch, self.effective_batch.0, self.effective_batch.1, self.streams
        )?;
        writeln!(f, "cores pinned    : {}", self.pinned_cores)?;
        writeln!(f, "throughput      : {} fps", format_metric(self.metrics.throughput))?;
        writeln!(
            f,
            "per stream      : {} fps",
            format_metric(self.metrics.per_stream)
        )?;
        writeln!(
            f,
            "stream density  : {}",
            format_count(self.metrics.theoretical_streams)
        )?;
        writeln!(f, "avg power       : {} W", format_metric(self.metrics.avg_power))?;
        write!(
            f,
            "efficiency      : {} fps/W",
            format_metric(self.metrics.efficiency)
        )
    }
}

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn csv_line(fields: &[String]) -> String {
    let mut line = fields
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(pipelines: usize) -> BenchmarkResult {
        BenchmarkResult {
            timestamp: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            system: "Intel(R) Core(TM) Ultra 7 155H".to_string(),
            tier: Tier::Light,
            detect: DeviceTarget::Gpu(None),
            classify: DeviceTarget::Npu,
            batch: 8,
            effective_batch: (8, 1),
            streams: 8,
            duration: Duration::from_secs(120),
            concurrent: true,
            pinned_cores: "none".to_string(),
            device_config: "GPU-NPU-Concurrent".to_string(),
            metrics: Metrics {
                throughput: Some(285.0),
                per_stream: Some(35.625),
                theoretical_streams: Some(9),
                avg_power: None,
                efficiency: None,
            },
            pipelines: (0..pipelines)
                .map(|i| format!("filesrc location=v{i}.h265 ! fakesink sync=false"))
                .collect(),
            context_logs: Vec::new(),
            combined_log: None,
            power_log: None,
        }
    }

    #[test]
    fn row_matches_header_and_renders_na() {
        let result = result(2);
        let header = result.header();
        let row = result.row();
        assert_eq!(header.len(), row.len());
        assert_eq!(header.last().map(String::as_str), Some("Pipeline2"));
        assert_eq!(row[0], "2023-11-14 22:13:20");
        assert_eq!(row[8], "8/1");
        assert_eq!(row[9], "285.00");
        assert_eq!(row[11], "9");
        assert_eq!(row[15], "NA");
        assert_eq!(row[16], "NA");
    }

    #[test]
    fn path_is_grouped_by_device_configuration() {
        let path = result(1).result_path(Path::new("results"));
        assert_eq!(
            path,
            Path::new("results/GPU-NPU-Concurrent/e2e-edge-pipeline_light_b8_s8.csv")
        );
    }

    #[test]
    fn fields_with_commas_are_quoted() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("plain"), "plain");
    }

    #[test]
    fn latest_row_comes_first_under_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let first = result(1);
        let path = first.record_in(dir.path()).unwrap();
        let mut second = result(1);
        second.metrics.throughput = Some(300.0);
        second.record_in(dir.path()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Timestamp,System,Duration (s)"));
        assert!(lines[0].ends_with("Pipeline1"));
        assert!(lines[1].contains(",300.00,"));
        assert_eq!(lines[2], csv_line(&first.row()).trim_end());
        assert!(!path.with_extension("csv.tmp").exists());
    }
}
