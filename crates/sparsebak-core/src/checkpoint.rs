//! Checkpoint chain: the append-only record of a domain's backup history.
//!
//! Persisted as a JSON array of checkpoint names in `${domain}.cpt`,
//! written with the temp-file-then-rename pattern (grounded on
//! `groblegark-oddjobs`'s `Checkpointer`: write to a sibling temp path,
//! then atomically rename over the target) so a crash mid-write never
//! corrupts the previous chain.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The empty-vs-nonempty state spec.md calls out explicitly, since the
/// transitions allowed from each differ (only `full` may start a chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Empty,
    ExtendedTo(usize),
}

/// One link in the chain: a checkpoint name and the backup level that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub name: String,
    pub level: crate::stream::BackupLevel,
}

/// The ordered list of checkpoints for one domain, backed by a `.cpt` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointChain {
    records: Vec<CheckpointRecord>,
}

impl CheckpointChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a chain from `path`, or an empty chain if the file doesn't
    /// exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = fs::read(path).map_err(|e| Error::io(e, path))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::checkpoint(format!("failed to parse '{}': {e}", path.display())))
    }

    /// Atomically persists the chain to `path` via a sibling temp file and
    /// a rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(&self.records)
            .map_err(|e| Error::checkpoint(format!("failed to encode chain: {e}")))?;
        let tmp_path = tmp_path_for(path);
        fs::write(&tmp_path, &encoded).map_err(|e| Error::io(e, &tmp_path))?;
        fs::rename(&tmp_path, path).map_err(|e| Error::io(e, path))?;
        Ok(())
    }

    pub fn state(&self) -> ChainState {
        if self.records.is_empty() {
            ChainState::Empty
        } else {
            ChainState::ExtendedTo(self.records.len())
        }
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    pub fn latest(&self) -> Option<&CheckpointRecord> {
        self.records.last()
    }

    /// Validates that a level transition is legal for the chain's current
    /// state. `full` always succeeds — it empties the chain before becoming
    /// its sole starting point, rather than being refused on a non-empty
    /// chain. `copy` never touches the chain at all, so it too always
    /// succeeds. `incremental` and `differential` require an existing
    /// parent, since both extend the chain's current tip.
    pub fn validate_transition(&self, level: crate::stream::BackupLevel) -> Result<()> {
        use crate::stream::BackupLevel::*;
        match level {
            Full | Copy => Ok(()),
            Incremental | Differential => match self.state() {
                ChainState::Empty => Err(Error::NoCheckpoints(
                    "cannot start a chain with anything but a full backup".to_string(),
                )),
                ChainState::ExtendedTo(_) => Ok(()),
            },
        }
    }

    /// Empties the chain. A full backup calls this before starting, since
    /// it replaces whatever chain already existed rather than extending it.
    pub fn remove_all(&mut self) {
        self.records.clear();
    }

    /// Appends a new checkpoint after validating the transition. Only
    /// `full` and `incremental` backups call this: `differential` reuses
    /// the chain's existing tip without minting a new checkpoint, and
    /// `copy` has no checkpoint semantics at all.
    pub fn append(&mut self, name: impl Into<String>, level: crate::stream::BackupLevel) -> Result<()> {
        self.validate_transition(level)?;
        self.records.push(CheckpointRecord {
            name: name.into(),
            level,
        });
        Ok(())
    }

    /// The checkpoint this chain considers the parent for a backup of
    /// `level`: `None` for `full` and `copy` (neither is defined relative
    /// to an existing checkpoint), and the chain's current tip for
    /// `incremental`/`differential`, which both require one to exist.
    pub fn parent_for(&self, level: crate::stream::BackupLevel) -> Result<Option<String>> {
        use crate::stream::BackupLevel::*;
        match level {
            Full | Copy => Ok(None),
            Incremental | Differential => self
                .latest()
                .map(|r| Some(r.name.clone()))
                .ok_or_else(|| {
                    Error::NoCheckpoints(
                        "incremental/differential backups require an existing chain".to_string(),
                    )
                }),
        }
    }

    /// Rejects any host-reported checkpoint that doesn't carry one of this
    /// ecosystem's known name prefixes — i.e. one some other tool created.
    pub fn validate_foreign(&self, host_checkpoints: &[String]) -> Result<()> {
        const KNOWN_PREFIXES: &[&str] = &["sparsebak.", "virtnbdbackup."];
        for name in host_checkpoints {
            if !KNOWN_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
                return Err(Error::ForeignCheckpoint(name.clone()));
            }
        }
        Ok(())
    }

    /// Truncates the chain so its last record is `until`, used by restore
    /// when replaying only part of the chain.
    pub fn up_to(&self, until: &str) -> Result<Vec<CheckpointRecord>> {
        let idx = self
            .records
            .iter()
            .position(|r| r.name == until)
            .ok_or_else(|| Error::ForeignCheckpoint(until.to_string()))?;
        Ok(self.records[..=idx].to_vec())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
