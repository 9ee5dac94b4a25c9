//! Off-heap allocator workbench
//!
//! Drives the allocator outside of a cache process:
//! - Concurrent allocate/write/release stress runs with fill validation
//! - The compaction scenario (three chunks fill a slab, two are freed,
//!   one double-size chunk must fit)
//! - Statistics as JSON or Prometheus text
//!
//! # Examples
//!
//! ```bash
//! # Stress two 64 MB slabs from 8 threads with fill validation
//! offheap --validate-fill stress --slab-size 67108864 --slabs 2 --threads 8
//!
//! # Run the compaction scenario
//! offheap scenario
//!
//! # Print statistics after a short workload
//! offheap stats --format prometheus
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use offheap::settings::DEFAULT_SLAB_SIZE;
use offheap::{AllocatorConfig, LoggingOutOfOffHeapMemoryListener, MemoryAllocator};
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Off-heap slab allocator workbench
#[derive(Parser, Debug)]
#[command(name = "offheap")]
#[command(version = offheap::VERSION)]
#[command(about = "Off-heap slab allocator workbench", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Allocator configuration file (TOML)
    #[arg(long, global = true, env = "OFFHEAP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable fill pattern validation
    #[arg(long, global = true)]
    validate_fill: bool,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "OFFHEAP_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Concurrent allocate/write/release workload
    Stress(StressArgs),

    /// Fill a slab with three chunks, free two, allocate one twice as big
    Scenario {
        /// Slab size in bytes
        #[arg(long, default_value_t = DEFAULT_SLAB_SIZE)]
        slab_size: usize,
    },

    /// Run a short workload and print statistics
    Stats {
        /// Output format
        #[arg(short, long, value_enum, default_value = "json")]
        format: StatsFormat,
    },

    /// Show version
    Version,
}

/// Stress workload arguments
#[derive(Args, Debug)]
struct StressArgs {
    /// Slab size in bytes (overrides the configuration)
    #[arg(long)]
    slab_size: Option<usize>,

    /// Number of slabs (with --slab-size)
    #[arg(long, default_value = "1")]
    slabs: usize,

    /// Worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Allocations per thread
    #[arg(short, long, default_value = "10000")]
    iterations: usize,

    /// Largest allocation in bytes
    #[arg(long, default_value = "65536")]
    max_size: usize,

    /// Chunks each thread keeps alive at once
    #[arg(long, default_value = "32")]
    live: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatsFormat {
    Json,
    Prometheus,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli) {
        eprintln!("Failed to setup logging: {}", e);
    }

    let result = match cli.command {
        Commands::Stress(ref args) => stress_command(&cli, args),
        Commands::Scenario { slab_size } => scenario_command(&cli, slab_size),
        Commands::Stats { format } => stats_command(&cli, format),
        Commands::Version => {
            println!("offheap {}", offheap::VERSION);
            Ok(())
        }
    };

    if let Err(ref e) = result {
        error!("Command failed: {:#}", e);
    }
    result
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "offheap.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .try_init()?;

    Ok(())
}

/// Configuration file and environment, then command-line overrides
fn load_config(cli: &Cli) -> anyhow::Result<AllocatorConfig> {
    let mut config = AllocatorConfig::load(cli.config.as_deref())
        .context("Failed to load allocator configuration")?;
    if cli.validate_fill {
        config.validate_fill_pattern = true;
    }
    Ok(config)
}

fn build_allocator(config: AllocatorConfig) -> anyhow::Result<MemoryAllocator> {
    let allocator = MemoryAllocator::new(config, Box::new(LoggingOutOfOffHeapMemoryListener))
        .context("Failed to reserve off-heap memory")?;
    info!(
        slabs = allocator.slab_count(),
        total = allocator.total_memory(),
        validate_fill = allocator.validate_fill_pattern(),
        "Allocator ready"
    );
    Ok(allocator)
}

/// Per-thread loop: keep a window of live chunks, write into every chunk
/// and free the oldest once the window is full
fn run_workload(
    allocator: &MemoryAllocator,
    threads: usize,
    iterations: usize,
    max_size: usize,
    live: usize,
) -> anyhow::Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .context("Failed to build worker pool")?;

    pool.install(|| {
        (0..threads.max(1))
            .into_par_iter()
            .try_for_each(|worker| -> anyhow::Result<()> {
                let mut window = std::collections::VecDeque::with_capacity(live + 1);
                let mut seed = (worker as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                for _ in 0..iterations {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    let size = 1 + (seed as usize) % max_size.max(1);

                    let chunk = allocator.allocate(size)?;
                    chunk.validate_fill()?;
                    let stamp = [worker as u8; 16];
                    chunk.write_data_bytes(0, &stamp[..size.min(stamp.len())])?;
                    window.push_back(chunk);

                    if window.len() > live {
                        if let Some(oldest) = window.pop_front() {
                            oldest.release()?;
                        }
                    }
                }
                for chunk in window {
                    chunk.release()?;
                }
                Ok(())
            })
    })
}

fn stress_command(cli: &Cli, args: &StressArgs) -> anyhow::Result<()> {
    let mut config = load_config(cli)?;
    if let Some(size) = args.slab_size {
        config.slab_sizes = vec![size; args.slabs.max(1)];
    }
    let allocator = build_allocator(config)?;

    info!(
        threads = args.threads,
        iterations = args.iterations,
        max_size = args.max_size,
        "Starting stress run"
    );
    let start = Instant::now();
    run_workload(
        &allocator,
        args.threads,
        args.iterations,
        args.max_size,
        args.live,
    )?;
    let elapsed = start.elapsed();

    allocator
        .check_partition()
        .context("Slab partition check failed after stress run")?;

    let stats = allocator.stats();
    let operations = stats.allocations + stats.releases;
    info!(
        elapsed = ?elapsed,
        allocations = stats.allocations,
        compactions = stats.compactions,
        out_of_memory = stats.out_of_memory,
        "Stress run finished"
    );
    println!(
        "{} operations in {:?} ({:.0} ops/s), {} compactions",
        operations,
        elapsed,
        operations as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        stats.compactions
    );

    allocator.free_all_off_heap_memory();
    Ok(())
}

fn scenario_command(cli: &Cli, slab_size: usize) -> anyhow::Result<()> {
    let mut config = load_config(cli)?;
    config.slab_sizes = vec![slab_size];
    config.validate_fill_pattern = true;
    let allocator = build_allocator(config)?;

    let chunk_size = slab_size / 3 - 1024;
    let chunks = (0..3)
        .map(|_| allocator.allocate(chunk_size))
        .collect::<Result<Vec<_>, _>>()?;
    for chunk in &chunks {
        chunk.validate_fill()?;
    }
    println!("Allocated 3 chunks of {} bytes", chunk_size);

    for chunk in &chunks[..2] {
        chunk.release()?;
        chunk.validate_fill()?;
    }
    println!("Released the first two chunks");

    let larger = allocator.allocate(chunk_size * 2)?;
    larger.validate_fill()?;
    allocator.check_partition()?;

    let stats = allocator.stats();
    println!(
        "Allocated {} bytes at {:#x} after {} compaction(s); used {} / free {} / total {}",
        larger.size(),
        larger.address(),
        stats.compactions,
        stats.used_memory,
        stats.free_memory,
        stats.total_memory
    );

    allocator.free_all_off_heap_memory();
    Ok(())
}

fn stats_command(cli: &Cli, format: StatsFormat) -> anyhow::Result<()> {
    let allocator = build_allocator(load_config(cli)?)?;
    run_workload(&allocator, 2, 1000, 4096, 64)?;

    match format {
        StatsFormat::Json => {
            let stats = allocator.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        StatsFormat::Prometheus => {
            print!("{}", allocator.export_metrics());
        }
    }

    allocator.free_all_off_heap_memory();
    Ok(())
}
