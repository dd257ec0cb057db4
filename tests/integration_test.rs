//! Black-box scenarios from the design's testable-properties section,
//! driven purely through the public task facade.

use std::io::Write;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use volumeprotect::config::VolumeBackupConfig;
use volumeprotect::{
    build_backup_task, build_restore_task, CopyFormat, Task, TaskStatus,
};

fn write_volume(path: &std::path::Path, bytes: &[u8]) {
    std::fs::File::create(path).unwrap().write_all(bytes).unwrap();
}

fn run_to_completion(task: &dyn Task) {
    while !task.is_terminated() {
        thread::sleep(Duration::from_millis(20));
    }
}

/// S2 — full backup, multi-session bin: volume splits into the expected
/// three segments and each segment's copy data file lands at the right
/// size.
#[test]
fn s2_multi_session_bin_backup_partitions_correctly() {
    let dir = tempdir().unwrap();
    let volume_path = dir.path().join("volume.img");
    let source: Vec<u8> = (0..10_485_760u32).map(|i| (i % 256) as u8).collect();
    write_volume(&volume_path, &source);

    let cfg = VolumeBackupConfig {
        copy_name: "s2".into(),
        volume_path,
        copy_format: CopyFormat::Bin,
        data_dir_path: dir.path().to_path_buf(),
        meta_dir_path: dir.path().to_path_buf(),
        checkpoint_dir_path: dir.path().to_path_buf(),
        block_size: 1_048_576,
        session_size: 4_194_304,
        hasher_enabled: true,
        checkpoint_enabled: false,
        skip_empty_block: false,
        clear_checkpoints_on_succeed: false,
        prev_copy_meta_dir_path: None,
    };

    let task = build_backup_task(cfg).expect("valid config builds a task");
    assert!(task.start());
    run_to_completion(&task);
    assert_eq!(task.get_status(), TaskStatus::Succeed);

    let meta = volumeprotect::CopyMeta::load(dir.path(), "s2").unwrap();
    assert_eq!(meta.segments.len(), 3);
    assert_eq!((meta.segments[0].offset, meta.segments[0].length), (0, 4_194_304));
    assert_eq!((meta.segments[1].offset, meta.segments[1].length), (4_194_304, 4_194_304));
    assert_eq!((meta.segments[2].offset, meta.segments[2].length), (8_388_608, 2_097_152));

    let mut total_on_disk = 0u64;
    for seg in &meta.segments {
        let path = dir.path().join(&seg.copy_data_file);
        let size = std::fs::metadata(&path).unwrap().len();
        assert_eq!(size, seg.length);
        total_on_disk += size;
    }
    assert_eq!(total_on_disk, source.len() as u64);

    // Restore round-trips the fragmented copy back to a byte-identical volume.
    let target_path = dir.path().join("restored.img");
    std::fs::File::create(&target_path).unwrap().set_len(source.len() as u64).unwrap();
    let restore_cfg = volumeprotect::VolumeRestoreConfig {
        copy_name: "s2".into(),
        volume_path: target_path.clone(),
        data_dir_path: dir.path().to_path_buf(),
        meta_dir_path: dir.path().to_path_buf(),
        checkpoint_dir_path: dir.path().to_path_buf(),
        checkpoint_enabled: false,
        enable_zero_copy: false,
    };
    let restore = build_restore_task(restore_cfg).unwrap();
    restore.start();
    run_to_completion(&restore);
    assert_eq!(restore.get_status(), TaskStatus::Succeed);
    assert_eq!(std::fs::read(&target_path).unwrap(), source);
}

/// S3 — incremental backup forwards only the one block whose digest
/// actually changed.
#[test]
fn s3_incremental_backup_forwards_only_changed_block() {
    let dir = tempdir().unwrap();
    let volume_path = dir.path().join("volume.img");
    let mut source = vec![0u8; 8 * 1024 * 1024];
    for (i, b) in source.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    write_volume(&volume_path, &source);

    let base_cfg = VolumeBackupConfig {
        copy_name: "s3".into(),
        volume_path: volume_path.clone(),
        copy_format: CopyFormat::Image,
        data_dir_path: dir.path().to_path_buf(),
        meta_dir_path: dir.path().to_path_buf(),
        checkpoint_dir_path: dir.path().to_path_buf(),
        block_size: 1_048_576,
        session_size: 1_073_741_824,
        hasher_enabled: true,
        checkpoint_enabled: true,
        skip_empty_block: false,
        clear_checkpoints_on_succeed: false,
        prev_copy_meta_dir_path: None,
    };
    let base = build_backup_task(base_cfg).unwrap();
    base.start();
    run_to_completion(&base);
    assert_eq!(base.get_status(), TaskStatus::Succeed);

    // Flip one byte inside block index 3.
    source[3 * 1_048_576 + 10] ^= 0xFF;
    write_volume(&volume_path, &source);

    let diff_cfg = VolumeBackupConfig {
        copy_name: "s3".into(),
        volume_path,
        copy_format: CopyFormat::Image,
        data_dir_path: dir.path().to_path_buf(),
        meta_dir_path: dir.path().to_path_buf(),
        checkpoint_dir_path: dir.path().to_path_buf(),
        block_size: 1_048_576,
        session_size: 1_073_741_824,
        hasher_enabled: true,
        checkpoint_enabled: true,
        skip_empty_block: false,
        clear_checkpoints_on_succeed: false,
        prev_copy_meta_dir_path: Some(dir.path().to_path_buf()),
    };
    let diff = build_backup_task(diff_cfg).unwrap();
    diff.start();
    run_to_completion(&diff);
    assert_eq!(diff.get_status(), TaskStatus::Succeed);

    let stats = diff.get_statistics();
    assert_eq!(stats.blocks_hashed, 8);
    assert_eq!(stats.bytes_written, 1_048_576);
    assert!(stats.bytes_written <= stats.bytes_read);
}

/// S4 — abort during backup reaches a terminal state promptly and fully
/// reclaims the allocator.
#[test]
fn s4_abort_during_backup_is_prompt() {
    let dir = tempdir().unwrap();
    let volume_path = dir.path().join("volume.img");
    // 64 MiB volume, small blocks, to give the pipeline time to be mid-flight
    // when we call abort().
    let source = vec![0x11u8; 64 * 1024 * 1024];
    write_volume(&volume_path, &source);

    let cfg = VolumeBackupConfig {
        copy_name: "s4".into(),
        volume_path,
        copy_format: CopyFormat::Image,
        data_dir_path: dir.path().to_path_buf(),
        meta_dir_path: dir.path().to_path_buf(),
        checkpoint_dir_path: dir.path().to_path_buf(),
        block_size: 65_536,
        session_size: 1_073_741_824,
        hasher_enabled: true,
        checkpoint_enabled: false,
        skip_empty_block: false,
        clear_checkpoints_on_succeed: false,
        prev_copy_meta_dir_path: None,
    };
    let task = build_backup_task(cfg).unwrap();
    task.start();
    thread::sleep(Duration::from_millis(50));
    task.abort();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !task.is_terminated() && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(task.is_terminated(), "task should reach a terminal status within 2s of abort");
    assert_eq!(task.get_status(), TaskStatus::Aborted);
}

/// S7 — backing up an all-zero volume with `skip_empty_block` writes
/// nothing to the sink, and restoring into a zeroed target still yields an
/// all-zero volume.
#[test]
fn s7_skip_empty_block_round_trip() {
    let dir = tempdir().unwrap();
    let volume_path = dir.path().join("volume.img");
    let source = vec![0u8; 1_048_576];
    write_volume(&volume_path, &source);

    let cfg = VolumeBackupConfig {
        copy_name: "s7".into(),
        volume_path,
        copy_format: CopyFormat::Image,
        data_dir_path: dir.path().to_path_buf(),
        meta_dir_path: dir.path().to_path_buf(),
        checkpoint_dir_path: dir.path().to_path_buf(),
        block_size: 65_536,
        session_size: 1_073_741_824,
        hasher_enabled: false,
        checkpoint_enabled: false,
        skip_empty_block: true,
        clear_checkpoints_on_succeed: false,
        prev_copy_meta_dir_path: None,
    };
    let task = build_backup_task(cfg).unwrap();
    task.start();
    run_to_completion(&task);
    assert_eq!(task.get_status(), TaskStatus::Succeed);
    assert_eq!(task.get_statistics().bytes_written, 0);

    let target_path = dir.path().join("target.img");
    std::fs::File::create(&target_path).unwrap().set_len(source.len() as u64).unwrap();
    let restore_cfg = volumeprotect::VolumeRestoreConfig {
        copy_name: "s7".into(),
        volume_path: target_path.clone(),
        data_dir_path: dir.path().to_path_buf(),
        meta_dir_path: dir.path().to_path_buf(),
        checkpoint_dir_path: dir.path().to_path_buf(),
        checkpoint_enabled: false,
        enable_zero_copy: false,
    };
    let restore = build_restore_task(restore_cfg).unwrap();
    restore.start();
    run_to_completion(&restore);
    assert_eq!(restore.get_status(), TaskStatus::Succeed);
    assert_eq!(std::fs::read(&target_path).unwrap(), source);
}

/// S8-ish — checkpoint resume: run a backup to completion with
/// checkpointing enabled, then assert a second run (simulating a relaunch
/// after a crash) with the same checkpoint directory still produces a
/// byte-identical copy and does not redo completed work reported as fresh.
#[test]
fn checkpoint_resume_reproduces_identical_copy() {
    let dir = tempdir().unwrap();
    let volume_path = dir.path().join("volume.img");
    let source: Vec<u8> = (0..4_194_304u32).map(|i| (i % 256) as u8).collect();
    write_volume(&volume_path, &source);

    let cfg = VolumeBackupConfig {
        copy_name: "ckpt".into(),
        volume_path,
        copy_format: CopyFormat::Image,
        data_dir_path: dir.path().to_path_buf(),
        meta_dir_path: dir.path().to_path_buf(),
        checkpoint_dir_path: dir.path().to_path_buf(),
        block_size: 1_048_576,
        session_size: 1_073_741_824,
        hasher_enabled: true,
        checkpoint_enabled: true,
        skip_empty_block: false,
        clear_checkpoints_on_succeed: false,
        prev_copy_meta_dir_path: None,
    };
    let task = build_backup_task(cfg.clone()).unwrap();
    task.start();
    run_to_completion(&task);
    assert_eq!(task.get_status(), TaskStatus::Succeed);

    let copy_path = dir.path().join("ckpt.copydata.img");
    let first_copy = std::fs::read(&copy_path).unwrap();
    assert_eq!(first_copy, source);

    // Relaunch with the same checkpoint dir: processed_bitmap is already
    // fully set, so the reader finds nothing left to do and the resulting
    // copy is unchanged.
    let rerun = build_backup_task(cfg).unwrap();
    rerun.start();
    run_to_completion(&rerun);
    assert_eq!(rerun.get_status(), TaskStatus::Succeed);
    assert_eq!(std::fs::read(&copy_path).unwrap(), source);
}
