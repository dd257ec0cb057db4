//! Restore Task — §4.10.2.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::checkpoint::CheckpointStore;
use crate::config::VolumeRestoreConfig;
use crate::hasher::HashMode;
use crate::meta::{CopyMeta, CopySegment};
use crate::rawio::{FileRawIo, FragmentRawIo, RawDataReader, RawDataWriter};
use crate::resource::ResourceManager;
use crate::session::{Session, SharedConfig};

use super::{ErrorCode, Task, TaskState, TaskStatus, TASK_POLL_INTERVAL};

pub struct RestoreTask {
    config: VolumeRestoreConfig,
    copy_meta: CopyMeta,
    state: Arc<TaskState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Loads the existing `CopyMeta` and validates that the restore target's
/// size matches it; mismatch is fatal to construction (§4.10.2).
pub fn build_restore_task(config: VolumeRestoreConfig) -> Option<RestoreTask> {
    if let Err(e) = config.validate() {
        log::warn!("build_restore_task: invalid config: {e}");
        return None;
    }

    let copy_meta = CopyMeta::load(&config.meta_dir_path, &config.copy_name).ok()?;

    let target_size = std::fs::metadata(&config.volume_path).ok()?.len();
    if target_size != copy_meta.volume_size {
        log::warn!(
            "build_restore_task: target volume size {target_size} does not match copy's {}",
            copy_meta.volume_size
        );
        return None;
    }

    Some(RestoreTask {
        config,
        copy_meta,
        state: Arc::new(TaskState::new()),
        worker: Mutex::new(None),
    })
}

fn open_segment_reader(
    data_dir: &std::path::Path,
    seg: &CopySegment,
    fragmented: bool,
) -> std::io::Result<Arc<dyn RawDataReader>> {
    let path = data_dir.join(&seg.copy_data_file);
    let io = FileRawIo::open_read(&path).map_err(std::io::Error::other)?;
    if fragmented {
        Ok(Arc::new(FragmentRawIo::new(io, -(seg.offset as i64))))
    } else {
        Ok(Arc::new(io))
    }
}

fn open_volume_writer(volume_path: &std::path::Path) -> std::io::Result<Arc<dyn RawDataWriter>> {
    let io = FileRawIo::open_write(volume_path).map_err(std::io::Error::other)?;
    Ok(Arc::new(io))
}

fn run(state: Arc<TaskState>, config: VolumeRestoreConfig, copy_meta: CopyMeta) {
    state.set_status(TaskStatus::Running);

    let resource = ResourceManager::new(&config.data_dir_path);
    if let Err(e) = resource.prepare_restore(&copy_meta) {
        log::error!("restore task: resource preparation failed: {e}");
        state.fail(ErrorCode::CopyAccessDenied);
        return;
    }

    let checkpoint = if config.checkpoint_enabled {
        Some(Arc::new(CheckpointStore::new(
            config.checkpoint_dir_path.clone(),
            config.copy_name.clone(),
        )))
    } else {
        None
    };

    for (i, seg) in copy_meta.segments.iter().enumerate() {
        if state.abort_requested.load(Ordering::Relaxed) {
            state.set_status(TaskStatus::Aborted);
            return;
        }

        let source = match open_segment_reader(&config.data_dir_path, seg, copy_meta.copy_format.is_fragmented()) {
            Ok(r) => r,
            Err(e) => {
                log::error!("restore task: failed to open copy data for reading: {e}");
                state.fail(ErrorCode::CopyAccessDenied);
                return;
            }
        };
        let sink = match open_volume_writer(&config.volume_path) {
            Ok(w) => w,
            Err(e) => {
                log::error!("restore task: failed to open volume for writing: {e}");
                state.fail(ErrorCode::VolumeAccessDenied);
                return;
            }
        };

        let shared_config = SharedConfig {
            block_size: copy_meta.block_size,
            source_offset: seg.offset,
            source_length: seg.length,
            hasher_enabled: false,
            checkpoint_enabled: config.checkpoint_enabled,
            skip_empty_block: false,
            mode: HashMode::Direct,
        };

        let mut session = Session::new(
            shared_config,
            crate::allocator::DEFAULT_ALLOCATOR_BLOCK_NUM,
            None,
            checkpoint.clone(),
            i,
        );
        session.start(source, sink, 1);

        loop {
            if state.abort_requested.load(Ordering::Relaxed) {
                session.abort();
            }
            if session.is_terminated() {
                break;
            }
            *state.live_statistics.lock().unwrap() = session.statistics();
            session.flush_checkpoint();
            thread::sleep(TASK_POLL_INTERVAL);
        }

        session.flush_checkpoint();
        if session.is_failed() {
            state.fold_completed(session.statistics());
            state.fail(ErrorCode::InvalidVolume);
            return;
        }
        if state.abort_requested.load(Ordering::Relaxed) {
            state.fold_completed(session.statistics());
            state.set_status(TaskStatus::Aborted);
            return;
        }
        state.fold_completed(session.statistics());
    }

    state.set_status(TaskStatus::Succeed);
}

impl Task for RestoreTask {
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
