//! CLI entrypoint for the tagheap harness.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tagheap_core::malloc::AllocatorLogLevel;
use tagheap_core::{AllocatorConfig, MallocState, SimulatedMemory};
use tagheap_harness::structured_log::write_jsonl;
use tagheap_harness::workload::{WorkloadSpec, generate};
use tagheap_harness::{ReplayOptions, Trace, replay};

/// Trace tooling for the tagheap allocator.
#[derive(Debug, Parser)]
#[command(name = "tagheap-harness")]
#[command(about = "Replay and stress harness for tagheap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct HeapArgs {
    /// Mapping threshold in bytes (accepts k/m suffixes).
    #[arg(long)]
    mmap_threshold: Option<String>,
    /// Simulated heap limit in bytes (accepts k/m/g suffixes).
    #[arg(long, default_value = "256m")]
    heap_limit: String,
    /// Disable simulated mremap.
    #[arg(long)]
    no_remap: bool,
    /// Minimum lifecycle level kept (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Write lifecycle records as JSONL to this path.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Full heap check interval in ops; 0 checks only at the end.
    #[arg(long, default_value_t = 256)]
    check_every: usize,
    /// Write the JSON report here instead of stdout.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a seeded trace file.
    Generate {
        #[arg(long)]
        output: PathBuf,
        /// Seed (decimal or 0x...).
        #[arg(long, default_value = "0x7A6EA11C")]
        seed: String,
        #[arg(long, default_value_t = 10_000)]
        steps: usize,
        #[arg(long, default_value_t = 256)]
        slots: usize,
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
    },
    /// Replay a trace file against a simulated heap.
    Replay {
        #[arg(long)]
        trace: PathBuf,
        #[command(flatten)]
        heap: HeapArgs,
    },
    /// Generate and replay a seeded workload in one go.
    Stress {
        #[arg(long, default_value = "0x7A6EA11C")]
        seed: String,
        #[arg(long, default_value_t = 100_000)]
        steps: usize,
        #[arg(long, default_value_t = 512)]
        slots: usize,
        #[arg(long, default_value_t = 300_000)]
        max_size: usize,
        #[command(flatten)]
        heap: HeapArgs,
    },
}

fn parse_seed(raw: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let cleaned = raw.replace('_', "");
    let value = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => cleaned.parse()?,
    };
    Ok(value)
}

fn parse_bytes(raw: &str, what: &str) -> Result<usize, Box<dyn std::error::Error>> {
    tagheap_core::config::parse_byte_size(raw)
        .ok_or_else(|| format!("invalid {what} '{raw}'").into())
}

fn run(trace: &Trace, args: &HeapArgs) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = AllocatorLogLevel::from_str_loose(&args.log_level)
        .ok_or_else(|| format!("unknown log level '{}'", args.log_level))?;
    let mut config = AllocatorConfig::default()
        .with_log_level(log_level)
        .with_log_capacity(if args.log.is_some() { usize::MAX } else { 0 });
    if let Some(raw) = &args.mmap_threshold {
        config = config.with_mmap_threshold(parse_bytes(raw, "mmap threshold")?);
    }
    let mut memory =
        SimulatedMemory::new().with_heap_limit(parse_bytes(&args.heap_limit, "heap limit")?);
    if args.no_remap {
        memory = memory.without_remap();
    }
    let mut heap = MallocState::with_config(memory, config);

    let options = ReplayOptions {
        check_every: args.check_every,
        ..ReplayOptions::default()
    };
    let outcome = replay(&mut heap, trace, options);

    if let Some(path) = &args.log {
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        let written = write_jsonl(&mut out, heap.lifecycle_logs())?;
        out.flush()?;
        eprintln!("Wrote {written} lifecycle records to {}", path.display());
    }

    let report = outcome?;
    eprintln!(
        "Replay complete: ops={}, heap_checks={}, peak_live_bytes={}",
        report.ops, report.heap_checks, report.peak_live_bytes
    );
    match &args.report {
        Some(path) => std::fs::write(path, report.to_json())?,
        None => println!("{}", report.to_json()),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Generate {
            output,
            seed,
            steps,
            slots,
            max_size,
        } => {
            let trace = generate(WorkloadSpec {
                seed: parse_seed(&seed)?,
                steps,
                slots,
                max_size,
            });
            trace.write_file(&output)?;
            eprintln!("Wrote {} ops to {}", trace.ops.len(), output.display());
        }
        Command::Replay { trace, heap } => {
            eprintln!("Replaying {}", trace.display());
            let trace = Trace::from_file(&trace)?;
            run(&trace, &heap)?;
        }
        Command::Stress {
            seed,
            steps,
            slots,
            max_size,
            heap,
        } => {
            let trace = generate(WorkloadSpec {
                seed: parse_seed(&seed)?,
                steps,
                slots,
                max_size,
            });
            run(&trace, &heap)?;
        }
    }
    Ok(())
}
