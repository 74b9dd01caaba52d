use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use edge_bench::{
    BenchConfig, BenchError, BenchmarkOrchestrator, BenchmarkRequest, HostAccelerators,
    PowerSampler, ProcessContext, SampleWindow, Tier, assets, install_interrupt_handler,
    interrupted, logging, matrix,
};

#[derive(Debug, Parser)]
#[command(name = "edge-bench", about = "Benchmark edge video-analytics pipelines")]
struct Cli {
    /// TOML configuration; defaults apply when the file does not exist.
    #[arg(long, global = true, default_value = "edge-bench.toml")]
    config: PathBuf,

    #[arg(long, global = true)]
    pipelines_root: Option<PathBuf>,

    #[arg(long, global = true)]
    results_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one benchmark and append its result row.
    Run(RunArgs),
    /// Run every entry of a coverage matrix, continuing past failures.
    Sweep {
        #[arg(long)]
        matrix: PathBuf,
        #[command(flatten)]
        shape: ShapeArgs,
    },
    /// Print the coverage matrix for this host.
    Matrix {
        #[arg(long, value_delimiter = ',', default_values_t = matrix::DEFAULT_BATCHES.to_vec())]
        batches: Vec<u32>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check that model and video assets are present.
    Validate {
        #[arg(long)]
        tier: Option<String>,
    },
    /// Sample accelerator power into a side artifact.
    SamplePower {
        #[arg(long, default_value_t = 1)]
        interval: u64,
        #[arg(long, default_value_t = 60)]
        duration: u64,
        #[arg(long, default_value_t = 0)]
        delay: u64,
        #[arg(long, default_value = "power.log")]
        output: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    tier: String,
    #[arg(long, default_value = "CPU")]
    detect: String,
    #[arg(long, default_value = "CPU")]
    classify: String,
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    batch: i64,
    #[arg(long)]
    concurrent: bool,
    #[command(flatten)]
    shape: ShapeArgs,
}

#[derive(Debug, Args)]
struct ShapeArgs {
    #[arg(long, default_value_t = 8, allow_negative_numbers = true)]
    streams: i64,
    /// Seconds each benchmark runs.
    #[arg(long, default_value_t = 120, allow_negative_numbers = true)]
    duration: i64,
    /// `none`, an explicit core list like `0-3`, or `pcore`/`ecore`/`lpecore`.
    #[arg(long, default_value = "none")]
    pinning: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init(cli.verbose) {
        eprintln!("[ Warn ] {err}");
    }
    match run_cli(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[ FAIL ] {err:#}");
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<BenchError>() {
        Some(BenchError::PermissionDenied(_)) => ExitCode::from(3),
        Some(bench) if bench.is_validation() => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn load_config(cli: &Cli) -> Result<BenchConfig> {
    let mut config = BenchConfig::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    if let Some(root) = &cli.pipelines_root {
        config.pipelines_root = root.clone();
    }
    if let Some(dir) = &cli.results_dir {
        config.results_dir = dir.clone();
    }
    if let Some(dir) = &cli.logs_dir {
        config.logs_dir = dir.clone();
    }
    Ok(config)
}

fn run_cli(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    match cli.command {
        Command::Run(args) => {
            let request = BenchmarkRequest::parse(
                &args.tier,
                &args.detect,
                &args.classify,
                args.batch,
                args.shape.streams,
                args.shape.duration,
                args.concurrent,
                &args.shape.pinning,
            )?;
            install_interrupt_handler();
            let mut orchestrator =
                BenchmarkOrchestrator::new(config.clone(), ProcessContext::from_config(&config));
            let result = orchestrator.run(&request)?;
            println!("{result}");
            println!(
                "[ Info ] result appended to {}",
                result.result_path(&config.results_dir).display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Sweep { matrix: path, shape } => sweep(config, &path, &shape),
        Command::Matrix { batches, output } => {
            if batches.is_empty() || batches.contains(&0) {
                bail!(BenchError::InvalidParameter(
                    "batches must be positive integers".to_string()
                ));
            }
            let host = HostAccelerators::probe(&config.sysfs_root, &config.dev_root);
            let text = matrix::render(&matrix::generate(&host, &batches));
            match output {
                Some(path) => {
                    fs::write(&path, &text)
                        .with_context(|| format!("write matrix {}", path.display()))?;
                    println!("[ Info ] matrix written to {}", path.display());
                }
                None => print!("{text}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { tier } => {
            let tiers = match tier {
                Some(raw) => vec![raw.parse::<Tier>()?],
                None => Tier::ALL.to_vec(),
            };
            let mut missing = Vec::new();
            for tier in tiers {
                match assets::validate(tier, &config.pipelines_root) {
                    Ok(_) => println!("[ OK ] {tier}"),
                    Err(BenchError::MissingAsset(paths)) => {
                        println!("[ FAIL ] {tier}");
                        for path in &paths {
                            println!("         missing {}", path.display());
                        }
                        missing.extend(paths);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            if !missing.is_empty() {
                return Err(BenchError::MissingAsset(missing).into());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::SamplePower {
            interval,
            duration,
            delay,
            output,
        } => {
            if interval == 0 || duration == 0 {
                bail!(BenchError::InvalidParameter(
                    "interval and duration must be positive".to_string()
                ));
            }
            let window = SampleWindow {
                interval: Duration::from_secs(interval),
                duration: Duration::from_secs(duration),
                delay: Duration::from_secs(delay),
            };
            let mut handle = PowerSampler::new(&config.sysfs_root).spawn(window, &output)?;
            let count = handle.join().len();
            println!(
                "[ Info ] {count} samples written to {}",
                handle.log_path().display()
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn sweep(config: BenchConfig, path: &Path, shape: &ShapeArgs) -> Result<ExitCode> {
    let text =
        fs::read_to_string(path).with_context(|| format!("read matrix {}", path.display()))?;
    let entries = matrix::parse_matrix(&text)?;
    install_interrupt_handler();
    let mut orchestrator =
        BenchmarkOrchestrator::new(config.clone(), ProcessContext::from_config(&config));

    let total = entries.len();
    let mut tally = SweepTally {
        total,
        ..SweepTally::default()
    };
    for (index, entry) in entries.iter().enumerate() {
        if interrupted() {
            println!("[ Info ] interrupted; stopping sweep");
            break;
        }
        println!("[ Info ] ({}/{total}) {entry}", index + 1);
        let outcome = BenchmarkRequest::parse(
            entry.tier.as_str(),
            &entry.detect.to_string(),
            &entry.classify.to_string(),
            i64::from(entry.batch),
            shape.streams,
            shape.duration,
            entry.concurrent,
            &shape.pinning,
        )
        .and_then(|request| orchestrator.run(&request));
        match outcome {
            Ok(result) => {
                tally.passed += 1;
                println!(
                    "[  OK  ] {entry}: {} fps",
                    edge_bench::metrics::format_metric(result.metrics.throughput)
                );
            }
            Err(err) => {
                tally.failed += 1;
                println!("[ FAIL ] {entry}: {err}");
            }
        }
    }
    println!("[ Info ] sweep finished: {tally}");
    Ok(if tally.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Outcome counts for a sweep; entries skipped after an interrupt are neither.
#[derive(Debug, Default)]
struct SweepTally {
    total: usize,
    passed: usize,
    failed: usize,
}

impl SweepTally {
    fn not_run(&self) -> usize {
        self.total - self.passed - self.failed
    }

    fn is_clean(&self) -> bool {
        self.failed == 0 && self.not_run() == 0
    }
}

impl fmt::Display for SweepTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} not run",
            self.passed,
            self.failed,
            self.not_run()
        )
    }
}
