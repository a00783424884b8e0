//! `restore` - replay a checkpoint chain onto a new disk image.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sparsebak_core::checkpoint::CheckpointChain;
use sparsebak_core::device::FileBlockDevice;
use sparsebak_core::restore::{run_restore, RestoreConfig};
use std::path::PathBuf;

/// Restore a virtual machine's disk from a backup directory.
#[derive(Parser)]
#[command(name = "restore", version, about)]
struct Cli {
    /// Domain (VM) name whose backup chain should be replayed.
    domain: String,

    /// Directory containing the backup chain.
    #[arg(short = 'i', long)]
    input: PathBuf,

    /// Disk to restore.
    #[arg(long)]
    disk: String,

    /// Path of the disk image to create and restore into.
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Stop replay after this checkpoint, inclusive.
    #[arg(long)]
    until: Option<String>,

    /// Increase log verbosity. May be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cpt_path = cli.input.join(format!("{}.cpt", cli.domain));
    let chain = CheckpointChain::load(&cpt_path)?;
    if chain.records().is_empty() {
        bail!("no checkpoints found for domain '{}'", cli.domain);
    }

    let size = virtual_size_of_first_checkpoint(&cli.input, &cli.disk, &chain)
        .with_context(|| "could not determine virtual disk size to restore into")?;
    let device = FileBlockDevice::create(&cli.output, size)?;

    let config = RestoreConfig {
        backup_dir: cli.input.clone(),
        disk_name: cli.disk.clone(),
        until: cli.until,
    };

    let outcome = run_restore(&chain, &device, &config)?;
    println!(
        "restored {} checkpoint(s), {} bytes written{}",
        outcome.checkpoints_applied.len(),
        outcome.bytes_written,
        if outcome.stopped_at_until {
            " (stopped at --until)"
        } else {
            ""
        }
    );
    Ok(())
}

fn virtual_size_of_first_checkpoint(
    input: &std::path::Path,
    disk: &str,
    chain: &CheckpointChain,
) -> Result<u64> {
    use sparsebak_core::stream::SparseStreamReader;
    use std::fs::File;

    let first = chain
        .records()
        .first()
        .ok_or_else(|| anyhow::anyhow!("checkpoint chain is empty"))?;
    let level_tag = match first.level {
        sparsebak_core::stream::BackupLevel::Full => "full",
        sparsebak_core::stream::BackupLevel::Incremental => "inc",
        sparsebak_core::stream::BackupLevel::Differential => "diff",
        sparsebak_core::stream::BackupLevel::Copy => "copy",
    };
    let path = input.join(format!("{disk}.{level_tag}.{}.data", first.name));
    let file = File::open(&path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = SparseStreamReader::new(file);
    Ok(reader.read_metadata()?.virtual_size)
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
