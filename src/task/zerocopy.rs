//! Zero-Copy Restore Task — §4.10.3.
//!
//! Valid only for a single-segment `Image`-format copy with
//! `enable_zero_copy` set. Bypasses the allocator, queues, and bitmap
//! entirely: for each `block_size` slice it issues one kernel-assisted
//! file-to-file range copy between the copy file and the volume, grounded
//! on `original_source/include/task/VolumeZeroCopyRestoreTask.h`. Not
//! checkpointed — a zero-copy restore that fails must simply be re-run
//! from the start (§4.10.3 "no bitmap needed; not checkpointed").
//!
//! Each iteration computes its own `(offset, len)` slice explicitly rather
//! than mutating a shared running offset across iterations with carry
//! semantics — resolving §9's "zero-copy restore's per-iteration offset
//! update contract" ambiguity (decided in DESIGN.md).

use std::fs::File;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::VolumeRestoreConfig;
use crate::meta::{CopyFormat, CopyMeta};
use crate::session::SessionStatistics;

use super::{ErrorCode, Task, TaskState, TaskStatus};

pub struct ZeroCopyRestoreTask {
    config: VolumeRestoreConfig,
    copy_meta: CopyMeta,
    state: Arc<TaskState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Only single-segment `Image` copies with zero-copy explicitly requested
/// are eligible (§4.10.3); anything else is fatal to construction.
pub fn build_zerocopy_restore_task(config: VolumeRestoreConfig) -> Option<ZeroCopyRestoreTask> {
    if !config.enable_zero_copy {
        return None;
    }
    if let Err(e) = config.validate() {
        log::warn!("build_zerocopy_restore_task: invalid config: {e}");
        return None;
    }

    let copy_meta = CopyMeta::load(&config.meta_dir_path, &config.copy_name).ok()?;
    if copy_meta.copy_format != CopyFormat::Image || copy_meta.segments.len() != 1 {
        log::warn!("build_zerocopy_restore_task: zero-copy restore requires a single-segment Image copy");
        return None;
    }

    let target_size = std::fs::metadata(&config.volume_path).ok()?.len();
    if target_size != copy_meta.volume_size {
        log::warn!("build_zerocopy_restore_task: target volume size does not match copy's volume_size");
        return None;
    }

    Some(ZeroCopyRestoreTask {
        config,
        copy_meta,
        state: Arc::new(TaskState::new()),
        worker: Mutex::new(None),
    })
}

#[cfg(target_os = "linux")]
fn copy_range(src: &File, dst: &File, offset: u64, len: usize) -> std::io::Result<usize> {
    let mut src_off = offset as i64;
    let mut dst_off = offset as i64;
    let n = unsafe {
        libc::copy_file_range(
            src.as_raw_fd(),
            &mut src_off,
            dst.as_raw_fd(),
            &mut dst_off,
            len,
            0,
        )
    };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Portable fallback for platforms without `copy_file_range`: one
/// synchronous read-then-write of the same slice, still a single syscall
/// pair per slice rather than the full concurrent pipeline (§9 "elsewhere
/// the optimization reduces to the normal pipeline" — resolved here as a
/// direct slice copy, not a reader/hasher/writer session, to preserve the
/// zero-copy contract's cheap synchronous-per-session nature).
#[cfg(not(target_os = "linux"))]
fn copy_range(src: &File, dst: &File, offset: u64, len: usize) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; len];
    let n = src.read_at(&mut buf, offset)?;
    dst.write_at(&buf[..n], offset)?;
    Ok(n)
}

fn run(state: Arc<TaskState>, config: VolumeRestoreConfig, copy_meta: CopyMeta) {
    state.set_status(TaskStatus::Running);

    let seg = &copy_meta.segments[0];
    let copy_path = config.data_dir_path.join(&seg.copy_data_file);

    let src = match File::open(&copy_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("zero-copy restore: failed to open copy data file: {e}");
            state.fail(ErrorCode::CopyAccessDenied);
            return;
        }
    };
    let dst = match File::options().write(true).open(&config.volume_path) {
        Ok(f) => f,
        Err(e) => {
            log::error!("zero-copy restore: failed to open volume for writing: {e}");
            state.fail(ErrorCode::VolumeAccessDenied);
            return;
        }
    };

    let block_size = copy_meta.block_size as u64;
    let mut offset = seg.offset;
    let end = seg.offset + seg.length;
    let mut bytes_written = 0u64;

    while offset < end {
        if state.abort_requested.load(Ordering::Relaxed) {
            state.set_status(TaskStatus::Aborted);
            return;
        }
        let len = (end - offset).min(block_size) as usize;
        match copy_range(&src, &dst, offset, len) {
            Ok(n) => {
                bytes_written += n as u64;
                offset += len as u64;
                *state.live_statistics.lock().unwrap() = SessionStatistics {
                    bytes_to_read: seg.length,
                    bytes_read: bytes_written,
                    bytes_to_write: seg.length,
                    bytes_written,
                    ..Default::default()
                };
            }
            Err(e) => {
                log::error!("zero-copy restore: copy failed at offset {offset}: {e}");
                state.fail(ErrorCode::InvalidVolume);
                return;
            }
        }
    }

    state.fold_completed(SessionStatistics {
        bytes_to_read: seg.length,
        bytes_read: bytes_written,
        bytes_to_write: seg.length,
        bytes_written,
        ..Default::default()
    });
    state.set_status(TaskStatus::Succeed);
}

impl Task for ZeroCopyRestoreTask {
    fn start(&self) -> bool {
        let state = self.state.clone();
        let config = self.config.clone();
        let copy_meta = self.copy_meta.clone();
        let handle = thread::spawn(move || run(state, config, copy_meta));
        *self.worker.lock().unwrap() = Some(handle);
        true
    }

    fn is_terminated(&self) -> bool {
        self.state.status().is_terminal()
    }

    fn get_status(&self) -> TaskStatus {
        self.state.status()
    }

    fn get_statistics(&self) -> super::TaskStatistics {
        self.state.statistics()
    }

    fn get_error_code(&self) -> ErrorCode {
        *self.state.error_code.lock().unwrap()
    }

    fn abort(&self) {
        self.state.abort_requested.store(true, Ordering::Relaxed);
        let mut status = self.state.status.lock().unwrap();
        match *status {
            TaskStatus::Init => *status = TaskStatus::Aborted,
            TaskStatus::Running => *status = TaskStatus::Aborting,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::backup::build_backup_task;
    use crate::config::VolumeBackupConfig;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn zerocopy_restore_round_trip_matches_source() {
        let dir = tempdir().unwrap();
        let volume_path = dir.path().join("volume.img");
        let source: Vec<u8> = (0..65536u32).map(|i| ((i * 3) % 256) as u8).collect();
        std::fs::File::create(&volume_path).unwrap().write_all(&source).unwrap();

        let backup_cfg = VolumeBackupConfig {
            copy_name: "zc".into(),
            volume_path: volume_path.clone(),
            copy_format: CopyFormat::Image,
            data_dir_path: dir.path().to_path_buf(),
            meta_dir_path: dir.path().to_path_buf(),
            checkpoint_dir_path: dir.path().to_path_buf(),
            block_size: 4096,
            session_size: 1_073_741_824,
            hasher_enabled: false,
            checkpoint_enabled: false,
            skip_empty_block: false,
            clear_checkpoints_on_succeed: false,
            prev_copy_meta_dir_path: None,
        };
        let backup = build_backup_task(backup_cfg).unwrap();
        backup.start();
        while !backup.is_terminated() {
            thread::sleep(std::time::Duration::from_millis(20));
        }

        let target_path = dir.path().join("target.img");
        std::fs::File::create(&target_path)
            .unwrap()
            .set_len(source.len() as u64)
            .unwrap();

        let restore_cfg = VolumeRestoreConfig {
            copy_name: "zc".into(),
            volume_path: target_path.clone(),
            data_dir_path: dir.path().to_path_buf(),
            meta_dir_path: dir.path().to_path_buf(),
            checkpoint_dir_path: dir.path().to_path_buf(),
            checkpoint_enabled: false,
            enable_zero_copy: true,
        };
        let restore = build_zerocopy_restore_task(restore_cfg).unwrap();
        restore.start();
        while !restore.is_terminated() {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(restore.get_status(), TaskStatus::Succeed);

        let restored = std::fs::read(&target_path).unwrap();
        assert_eq!(restored, source);
    }

    #[test]
    fn rejects_non_image_format() {
        let dir = tempdir().unwrap();
        let meta = CopyMeta {
            copy_name: "frag".into(),
            backup_type: crate::meta::BackupType::Full,
            copy_format: CopyFormat::Bin,
            volume_size: 4096,
            block_size: 4096,
            volume_path: "/dev/fake".into(),
            label: String::new(),
            uuid: String::new(),
            segments: crate::meta::build_segments("frag", 4096, 4096, CopyFormat::Bin),
        };
        meta.save(dir.path()).unwrap();

        let target_path = dir.path().join("target.img");
        std::fs::File::create(&target_path).unwrap().set_len(4096).unwrap();

        let cfg = VolumeRestoreConfig {
            copy_name: "frag".into(),
            volume_path: target_path,
            data_dir_path: dir.path().to_path_buf(),
            meta_dir_path: dir.path().to_path_buf(),
            checkpoint_dir_path: dir.path().to_path_buf(),
            checkpoint_enabled: false,
            enable_zero_copy: true,
        };
        assert!(build_zerocopy_restore_task(cfg).is_none());
    }
}
