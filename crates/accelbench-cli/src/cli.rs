use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use accelbench_core::{BenchmarkResult, DoubleBufferedResult};
use accelbench_kernels::TaskKind;
use accelbench_pipeline::{BenchConfig, PipelineReport};

#[derive(Parser)]
#[command(
    name = "accelbench",
    about = "Accelerator offload benchmarks: simple, double-buffered and streaming"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Device ordinal (overrides the config file).
    #[arg(long, global = true)]
    pub device: Option<usize>,

    /// Path to a JSON benchmark config.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Built-in config to start from when no --config is given.
    #[arg(long, global = true, value_enum)]
    pub preset: Option<Preset>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Output format.
    #[arg(long, default_value = "text", global = true, value_enum)]
    pub format: OutputFormat,

    /// Log every progress event.
    #[arg(long, global = true)]
    pub progress: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Warmup plus timed synchronous iterations.
    Run(RunArgs),
    /// Serial baseline versus two-slot, two-stream overlap.
    DoubleBuffer(RunArgs),
    /// Producer -> compute -> consumer streaming pipeline.
    Stream(StreamArgs),
    /// List the built-in workloads.
    Tasks,
}

/// Overrides applied on top of the loaded config.
#[derive(Args, Clone, Debug, Default)]
pub struct RunArgs {
    /// Workload.
    #[arg(long, value_parser = parse_task)]
    pub task: Option<TaskKind>,
    /// Elements per batch.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Timed iterations.
    #[arg(long)]
    pub iterations: Option<usize>,
    /// Untimed warmup iterations.
    #[arg(long)]
    pub warmup: Option<usize>,
    /// Modelled host<->device bandwidth in GB/s; 0 makes copies free.
    #[arg(long)]
    pub bandwidth_gbps: Option<f64>,
    /// Kernel parameters as a JSON object.
    #[arg(long)]
    pub params: Option<String>,
}

impl RunArgs {
    pub fn apply(&self, config: &mut BenchConfig) -> anyhow::Result<()> {
        if let Some(task) = self.task {
            config.task = task;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = Some(batch_size);
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(warmup) = self.warmup {
            config.warmup_iterations = warmup;
        }
        if let Some(bw) = self.bandwidth_gbps {
            config.transfer.bandwidth_gbps = (bw > 0.0).then_some(bw);
        }
        if let Some(params) = &self.params {
            config.kernel_params = serde_json::from_str(params)?;
        }
        Ok(())
    }
}

#[derive(Args, Clone, Debug)]
pub struct StreamArgs {
    #[command(flatten)]
    pub run: RunArgs,
    /// Stream for this long, then stop and drain.
    #[arg(long, conflicts_with = "batches")]
    pub duration_ms: Option<u64>,
    /// Stream exactly this many batches.
    #[arg(long)]
    pub batches: Option<u64>,
    /// Capacity of each pipeline queue.
    #[arg(long)]
    pub channel_capacity: Option<usize>,
}

fn parse_task(s: &str) -> Result<TaskKind, String> {
    s.parse::<TaskKind>().map_err(|e| e.to_string())
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum Preset {
    Quick,
    TransferBound,
    ComputeBound,
}

impl Preset {
    pub fn config(self) -> BenchConfig {
        match self {
            Preset::Quick => BenchConfig::quick(),
            Preset::TransferBound => BenchConfig::transfer_bound(),
            Preset::ComputeBound => BenchConfig::compute_bound(),
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_benchmark(result: &BenchmarkResult, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(result)?,
        OutputFormat::Text => {
            println!(
                "{} on {} [{}]",
                result.task_name, result.device_label, result.backend_label
            );
            println!(
                "  batch {} x {} iterations",
                result.batch_size, result.iterations
            );
            println!(
                "  avg {:.3} ms | p95 {:.3} ms | {:.0} elements/s",
                result.avg_latency_ms, result.p95_latency_ms, result.throughput_elements_per_sec
            );
        }
    }
    Ok(())
}

pub fn print_double_buffered(
    result: &DoubleBufferedResult,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(result)?,
        OutputFormat::Text => {
            print_benchmark(&result.result, format)?;
            println!(
                "  single-buffer avg {:.3} ms | p95 {:.3} ms",
                result.single_buffer_avg_ms, result.single_buffer_p95_ms
            );
            println!(
                "  speedup {:.2}x | overlap {:.1}%",
                result.speedup_factor, result.overlap_percentage
            );
        }
    }
    Ok(())
}

pub fn print_stream(report: &PipelineReport, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Text => {
            println!(
                "streamed {} batches ({} elements) in {:.1} ms",
                report.batches, report.elements, report.elapsed_ms
            );
            if let (Some(first), Some(last)) = (report.first_sequence, report.last_sequence) {
                println!("  sequences {first}..={last}");
            }
            println!(
                "  latency avg {:.3} ms | p95 {:.3} ms | {:.0} elements/s",
                report.avg_latency_ms, report.p95_latency_ms, report.throughput_elements_per_sec
            );
            println!("  checksum {:.6e}", report.checksum);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct TaskInfo {
    name: TaskKind,
    description: &'static str,
    double_buffered: bool,
    streaming: bool,
}

pub fn print_tasks(format: OutputFormat) -> anyhow::Result<()> {
    let tasks: Vec<TaskInfo> = TaskKind::ALL
        .iter()
        .map(|&kind| TaskInfo {
            name: kind,
            description: kind.description(),
            double_buffered: kind.supports_double_buffering(),
            streaming: kind.supports_streaming(),
        })
        .collect();

    match format {
        OutputFormat::Json => print_json(&tasks)?,
        OutputFormat::Text => {
            for task in &tasks {
                println!("{:<12} {}", task.name.as_str(), task.description);
            }
        }
    }
    Ok(())
}
