//! CLI entrypoint for the spanheap harness.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use spanheap_core::{Heap, HeapConfig, RetainAll, SizeClassTable};
use spanheap_harness::{
    HarnessError, LayoutReport, OsKind, ScenarioReport, StressConfig, StressRunner, run_all,
};

/// Stress and scenario tooling for spanheap.
#[derive(Debug, Parser)]
#[command(name = "spanheap-harness")]
#[command(about = "Stress and scenario harness for the spanheap allocator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Markdown,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run deterministic multi-threaded allocation rounds.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 8)]
        rounds: usize,
        /// Allocations per thread per round.
        #[arg(long, default_value_t = 2_000)]
        ops: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Percent of live objects kept into the next round.
        #[arg(long, default_value_t = 30)]
        retain: u8,
        #[arg(long, default_value_t = 10)]
        tiny: u8,
        #[arg(long, default_value_t = 1)]
        large: u8,
        /// Disable the out-of-band sweeper thread.
        #[arg(long)]
        no_background_sweep: bool,
        /// Arena size in MiB.
        #[arg(long, default_value_t = 256)]
        arena_mib: usize,
        #[arg(long, value_enum, default_value = "sim")]
        os: OsKind,
        #[arg(long, value_enum, default_value = "json")]
        format: Format,
        /// Output path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the built-in end-to-end scenarios.
    Scenarios {
        #[arg(long, value_enum, default_value = "markdown")]
        format: Format,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Optional fixed timestamp string for deterministic report generation.
        #[arg(long)]
        timestamp: Option<String>,
    },
    /// Print the size-class table and reservation layout.
    Layout {
        /// Arena size in MiB (defaults to `SPANHEAP_ARENA_BYTES` or 64 GiB).
        #[arg(long)]
        arena_mib: Option<usize>,
        #[arg(long, value_enum, default_value = "sim")]
        os: OsKind,
        #[arg(long, value_enum, default_value = "json")]
        format: Format,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let cleaned = raw.replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|e| HarnessError::InvalidArgument(format!("seed {raw:?}: {e}")))
}

fn emit(output: Option<PathBuf>, body: &str) -> Result<(), HarnessError> {
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, body)?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{body}"),
    }
    Ok(())
}

fn main() -> Result<(), HarnessError> {
    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            threads,
            rounds,
            ops,
            seed,
            retain,
            tiny,
            large,
            no_background_sweep,
            arena_mib,
            os,
            format,
            output,
        } => {
            let config = StressConfig {
                threads,
                rounds,
                ops_per_round: ops,
                seed: parse_seed(&seed)?,
                retain_percent: retain,
                tiny_percent: tiny,
                large_percent: large,
                background_sweep: !no_background_sweep,
                arena_bytes: arena_mib << 20,
                os,
                ..StressConfig::default()
            };
            let runner = StressRunner::new(config)?;
            eprintln!(
                "Stress: {threads} threads x {rounds} rounds x {ops} ops, seed {seed}"
            );
            let report = runner.run()?;
            eprintln!(
                "Stress complete: freed={}, spans_returned={}, live={}",
                report.metrics.objects_freed, report.metrics.spans_released, report.census.live_objects
            );
            let body = match format {
                Format::Json => report.to_json(),
                Format::Markdown => report.to_markdown(),
            };
            emit(output, &body)?;
        }
        Command::Scenarios {
            format,
            output,
            timestamp,
        } => {
            let results = run_all();
            let report = ScenarioReport::new(
                "spanheap scenario report",
                timestamp.unwrap_or_else(|| format!("{:?}", std::time::SystemTime::now())),
                results,
            );
            eprintln!(
                "Scenarios complete: passed={}, failed={}",
                report.passed, report.failed
            );
            let body = match format {
                Format::Json => report.to_json(),
                Format::Markdown => report.to_markdown(),
            };
            emit(output, &body)?;
            if report.failed > 0 {
                return Err(HarnessError::ScenariosFailed {
                    failed: report.failed,
                    total: report.results.len(),
                });
            }
        }
        Command::Layout {
            arena_mib,
            os,
            format,
            output,
        } => {
            let mut config = HeapConfig::from_env();
            if let Some(mib) = arena_mib {
                config = config.with_arena_bytes(mib << 20);
            }
            let heap = match os {
                OsKind::Sim => Heap::new(
                    config,
                    Arc::new(spanheap_core::SimulatedOs::new()),
                    Arc::new(RetainAll),
                )?,
                OsKind::Mmap => Heap::new(
                    config,
                    Arc::new(spanheap_core::MmapPageSource::new()),
                    Arc::new(RetainAll),
                )?,
            };
            let report = LayoutReport::new(
                heap.config(),
                heap.physical_page_size(),
                &heap.layout(),
                SizeClassTable::standard(),
            );
            let body = match format {
                Format::Json => report.to_json(),
                Format::Markdown => report.to_markdown(),
            };
            emit(output, &body)?;
        }
    }

    Ok(())
}
