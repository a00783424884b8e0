//! `backup` - take a full, incremental, differential or copy backup of a
//! virtual machine's disks over NBD.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use sparsebak_core::backup::{run_backup, BackupConfig, DiskBackupJob};
use sparsebak_core::checkpoint::CheckpointChain;
use sparsebak_core::config::Config;
use sparsebak_core::device::{FileBlockDevice, HostControl, StubHostControl};
use sparsebak_core::stream::BackupLevel;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Level {
    Full,
    Inc,
    Diff,
    Copy,
}

impl From<Level> for BackupLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Full => BackupLevel::Full,
            Level::Inc => BackupLevel::Incremental,
            Level::Diff => BackupLevel::Differential,
            Level::Copy => BackupLevel::Copy,
        }
    }
}

/// Back up a virtual machine's disks.
#[derive(Parser)]
#[command(name = "backup", version, about)]
struct Cli {
    /// Domain (VM) name.
    domain: String,

    /// Directory to write backup output into, or `-` to stream a zip to stdout.
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Backup level.
    #[arg(short, long, value_enum, default_value = "full")]
    level: Level,

    /// Number of concurrent per-disk workers.
    #[arg(short, long)]
    worker: Option<usize>,

    /// Enable LZ4 compression of data blocks.
    #[arg(long)]
    compress: bool,

    /// Optional config file overriding built-in defaults.
    #[arg(long, default_value = "sparsebak.toml")]
    config: PathBuf,

    /// Fail the run (exit code 2) on any recoverable warning.
    #[arg(long)]
    strict: bool,

    /// Write a raw disk image instead of a sparse stream. Only valid for
    /// `full` and `copy` levels.
    #[arg(long)]
    raw: bool,

    /// Increase log verbosity. May be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.output == PathBuf::from("-") {
        bail!("zip-to-stdout output is not yet wired to a real NBD source in this build");
    }

    let config = Config::load(&cli.config)?;
    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("creating output dir '{}'", cli.output.display()))?;

    let cpt_path = cli.output.join(format!("{}.cpt", cli.domain));
    let mut chain = CheckpointChain::load(&cpt_path)?;

    let level: BackupLevel = cli.level.into();
    chain.validate_transition(level)?;

    if cli.raw && !matches!(level, BackupLevel::Full | BackupLevel::Copy) {
        bail!("--raw is only valid for full and copy backups");
    }

    // Placeholder host-control wiring: a real build lists checkpoints the
    // virtualization host actually holds for this domain and rejects any
    // this tool didn't create. The stub never reports checkpoints, so this
    // always passes until a real `HostControl` is plugged in, but it keeps
    // the rejection path exercised end-to-end.
    let host_control = StubHostControl::new();
    let host_checkpoints = host_control.list_checkpoints(&cli.domain)?;
    chain.validate_foreign(&host_checkpoints)?;

    if level == BackupLevel::Full {
        chain.remove_all();
    }
    let parent_checkpoint = chain.parent_for(level)?;

    // The checkpoint name recorded in the chain (full/incremental only);
    // differential reuses the parent's name instead of minting one, and
    // copy has no checkpoint semantics, so neither extends the chain.
    let checkpoint_name = match level {
        BackupLevel::Full | BackupLevel::Incremental => {
            format!("sparsebak.{}", chain.records().len())
        }
        BackupLevel::Differential => parent_checkpoint
            .clone()
            .expect("validate_transition guarantees a non-empty chain for differential"),
        BackupLevel::Copy => unix_timestamp().to_string(),
    };

    // Differential and copy backups aren't part of the replayable chain,
    // so their output file is disambiguated by a timestamp rather than by
    // chain position — multiple diffs can share the same parent name.
    let file_tag = match level {
        BackupLevel::Full | BackupLevel::Incremental => checkpoint_name.clone(),
        BackupLevel::Differential | BackupLevel::Copy => unix_timestamp().to_string(),
    };

    // Placeholder disk discovery: a real build enumerates the domain's
    // disks via `HostControl` and opens each through an NBD `BlockDevice`.
    // Until that transport is wired in, a single disk is read from a
    // local file path matching the domain name, which keeps the pipeline
    // itself (worker pool, framing, checkpoint bookkeeping) fully exercised.
    let disk_path = cli.output.join(format!("{}.img", cli.domain));
    if !disk_path.exists() {
        bail!(
            "no source disk found at '{}'; point a real NBD BlockDevice at this pipeline to back up a live VM",
            disk_path.display()
        );
    }
    let device = Arc::new(FileBlockDevice::open(&disk_path)?);

    let jobs = vec![DiskBackupJob {
        disk_name: cli.domain.clone(),
        device,
        dirty_bitmap: parent_checkpoint.clone(),
    }];
    let jobs_len = jobs.len();

    let backup_config = BackupConfig {
        output_dir: cli.output.clone(),
        level,
        checkpoint_name: checkpoint_name.clone(),
        file_tag,
        parent_checkpoint,
        compress: config.compress_or(cli.compress),
        chunk_size: config.chunk_size.unwrap_or(4 * 1024 * 1024) as usize,
        workers: config.worker_or(cli.worker.unwrap_or(num_cpus_fallback())),
        raw: cli.raw,
    };

    let progress = indicatif::ProgressBar::new(jobs_len as u64);
    progress.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos}/{len} disks")
            .expect("static template is valid"),
    );
    let results = run_backup(jobs, &backup_config)?;
    progress.finish_and_clear();

    // Differential and copy backups don't transition the chain: a
    // differential reuses its parent's checkpoint rather than minting a
    // new one, and a copy has no checkpoint semantics at all.
    if matches!(level, BackupLevel::Full | BackupLevel::Incremental) {
        chain.append(&checkpoint_name, level)?;
        chain.save(&cpt_path)?;
    }

    for result in &results {
        println!(
            "{}: {} bytes -> {}",
            result.disk_name,
            result.bytes_written,
            result.output_path.display()
        );
    }

    Ok(())
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs()
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
