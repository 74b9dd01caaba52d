//! Device-gated coverage matrix for sweeps.
//!
//! One line per entry, `<tier> <detect> <classify> <batch> <concurrent>`,
//! followed by a `# total_tests=<N>` trailer.

use std::{fmt, fmt::Display};

use crate::contract::{BenchError, DeviceTarget, Tier};
use crate::host::HostAccelerators;

pub const DEFAULT_BATCHES: &[u32] = &[1, 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixEntry {
    pub tier: Tier,
    pub detect: DeviceTarget,
    pub classify: DeviceTarget,
    pub batch: u32,
    pub concurrent: bool,
}

impl Display for MatrixEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.tier, self.detect, self.classify, self.batch, self.concurrent
        )
    }
}

pub fn generate(host: &HostAccelerators, batches: &[u32]) -> Vec<MatrixEntry> {
    let devices = host.devices();
    let mut entries = Vec::new();
    for tier in Tier::ALL {
        for &detect in &devices {
            for &classify in &devices {
                for &batch in batches {
                    entries.push(MatrixEntry {
                        tier,
                        detect,
                        classify,
                        batch,
                        concurrent: false,
                    });
                    if detect != classify {
                        entries.push(MatrixEntry {
                            tier,
                            detect,
                            classify,
                            batch,
                            concurrent: true,
                        });
                    }
                }
            }
        }
    }
    entries
}

pub fn render(entries: &[MatrixEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_string());
        out.push('\n');
    }
    out.push_str(&format!("# total_tests={}\n", entries.len()));
    out
}

/// Reads rendered entries back; blank lines and `#` comments are skipped.
pub fn parse_matrix(text: &str) -> Result<Vec<MatrixEntry>, BenchError> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| parse_line(number, line))
        .collect()
}

fn parse_line(number: usize, line: &str) -> Result<MatrixEntry, BenchError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [tier, detect, classify, batch, concurrent] = fields.as_slice() else {
        return Err(BenchError::Parse(format!(
            "matrix line {number}: expected 5 fields, got {}",
            fields.len()
        )));
    };
    let batch = batch
        .parse::<u32>()
        .ok()
        .filter(|b| *b > 0)
        .ok_or_else(|| BenchError::Parse(format!("matrix line {number}: bad batch {batch}")))?;
    let concurrent = concurrent.parse::<bool>().map_err(|_| {
        BenchError::Parse(format!("matrix line {number}: bad concurrent flag {concurrent}"))
    })?;
    Ok(MatrixEntry {
        tier: tier.parse()?,
        detect: detect.parse()?,
        classify: classify.parse()?,
        batch,
        concurrent,
    })
}
