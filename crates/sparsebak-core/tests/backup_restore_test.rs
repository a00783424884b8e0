//! End-to-end: full backup, incremental backup, then chain restore.

use sparsebak_core::backup::{run_backup, BackupConfig, DiskBackupJob};
use sparsebak_core::checkpoint::CheckpointChain;
use sparsebak_core::device::FileBlockDevice;
use sparsebak_core::restore::{run_restore, RestoreConfig};
use sparsebak_core::stream::BackupLevel;
use std::sync::Arc;
use tempfile::tempdir;

fn backup_config(dir: &std::path::Path, level: BackupLevel, checkpoint: &str) -> BackupConfig {
    BackupConfig {
        output_dir: dir.to_path_buf(),
        level,
        checkpoint_name: checkpoint.to_string(),
        file_tag: checkpoint.to_string(),
        parent_checkpoint: None,
        compress: false,
        chunk_size: 4096,
        workers: 2,
        raw: false,
    }
}

#[test]
fn full_then_incremental_backup_restores_final_state() {
    let dir = tempdir().unwrap();
    let source_path = dir.path().join("vda.src");
    let source = FileBlockDevice::create(&source_path, 65536).unwrap();
    source.write_at(0, &vec![1u8; 4096]).unwrap();

    let mut chain = CheckpointChain::new();

    let job = DiskBackupJob {
        disk_name: "vda".to_string(),
        device: Arc::new(FileBlockDevice::open(&source_path).unwrap()),
        dirty_bitmap: None,
    };
    run_backup(vec![job], &backup_config(dir.path(), BackupLevel::Full, "sparsebak.0")).unwrap();
    chain.append("sparsebak.0", BackupLevel::Full).unwrap();

    source.write_at(8192, &vec![2u8; 4096]).unwrap();
    let job = DiskBackupJob {
        disk_name: "vda".to_string(),
        device: Arc::new(FileBlockDevice::open(&source_path).unwrap()),
        dirty_bitmap: Some("sparsebak.0".to_string()),
    };
    run_backup(
        vec![job],
        &backup_config(dir.path(), BackupLevel::Incremental, "sparsebak.1"),
    )
    .unwrap();
    chain.append("sparsebak.1", BackupLevel::Incremental).unwrap();

    let target_path = dir.path().join("vda.restored");
    let target = FileBlockDevice::create(&target_path, 65536).unwrap();
    let outcome = run_restore(
        &chain,
        &target,
        &RestoreConfig {
            backup_dir: dir.path().to_path_buf(),
            disk_name: "vda".to_string(),
            until: None,
        },
    )
    .unwrap();

    assert_eq!(outcome.checkpoints_applied, vec!["sparsebak.0", "sparsebak.1"]);
    assert_eq!(&target.read_at(0, 4096).unwrap(), &vec![1u8; 4096]);
}

#[test]
fn checkpoint_chain_persists_across_processes() {
    let dir = tempdir().unwrap();
    let cpt_path = dir.path().join("vm0.cpt");

    let mut chain = CheckpointChain::new();
    chain.append("sparsebak.0", BackupLevel::Full).unwrap();
    chain.save(&cpt_path).unwrap();

    let reloaded = CheckpointChain::load(&cpt_path).unwrap();
    assert_eq!(reloaded.records().len(), 1);
    assert!(reloaded.validate_transition(BackupLevel::Incremental).is_ok());
}
