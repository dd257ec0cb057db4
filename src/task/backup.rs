//! Backup Task — §4.10.1.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::checkpoint::CheckpointStore;
use crate::config::VolumeBackupConfig;
use crate::hasher::{DigestTable, HashMode};
use crate::meta::{build_segments, CopyMeta, CopySegment};
use crate::rawio::{FileRawIo, FragmentRawIo, RawDataReader, RawDataWriter};
use crate::resource::ResourceManager;
use crate::session::{Session, SharedConfig};

use super::{ErrorCode, Task, TaskState, TaskStatus, TASK_POLL_INTERVAL};

fn discover_volume_size(path: &std::path::Path) -> Option<u64> {
    // Regular-file/image volumes only; real block-device size discovery is
    // a native primitive out of scope here (§1).
    std::fs::metadata(path).ok().map(|m| m.len())
}

pub struct BackupTask {
    config: VolumeBackupConfig,
    copy_meta: CopyMeta,
    previous_digest_tables: Vec<Option<DigestTable>>,
    state: Arc<TaskState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Validates `config` and splits the volume into sessions. Returns `None`
/// on any validation failure (§9 "replace exception-based control flow
/// with fallible constructors") — incremental mode additionally requires
/// every segment's prior digest table to load with a matching shape; a
/// missing or incompatible prior table is fatal to construction, not just
/// to the hasher (§9 Open Question, resolved in DESIGN.md).
pub fn build_backup_task(config: VolumeBackupConfig) -> Option<BackupTask> {
    if let Err(e) = config.validate() {
        log::warn!("build_backup_task: invalid config: {e}");
        return None;
    }

    let volume_size = discover_volume_size(&config.volume_path)?;
    let segments = build_segments(
        &config.copy_name,
        volume_size,
        config.session_size,
        config.copy_format,
    );

    let previous_digest_tables = if let Some(prev_dir) = &config.prev_copy_meta_dir_path {
        let prev_meta = CopyMeta::load(prev_dir, &config.copy_name).ok()?;
        if prev_meta.volume_size != volume_size || prev_meta.segments.len() != segments.len() {
            log::warn!("build_backup_task: previous copy meta shape does not match current volume");
            return None;
        }
        let store = CheckpointStore::new(prev_dir.clone(), config.copy_name.clone());
        let mut tables = Vec::with_capacity(segments.len());
        for (i, seg) in segments.iter().enumerate() {
            let expected_blocks = ((seg.length + config.block_size as u64 - 1) / config.block_size as u64) as usize;
            let table = store.load_digest_table(i).ok()?;
            if table.block_count() != expected_blocks {
                log::warn!("build_backup_task: digest table shape mismatch at segment {i}");
                return None;
            }
            tables.push(Some(table));
        }
        tables
    } else {
        segments.iter().map(|_| None).collect()
    };

    let copy_meta = CopyMeta {
        copy_name: config.copy_name.clone(),
        backup_type: config.backup_type(),
        copy_format: config.copy_format,
        volume_size,
        block_size: config.block_size,
        volume_path: config.volume_path.display().to_string(),
        label: String::new(),
        uuid: uuid::Uuid::new_v4().to_string(),
        segments,
    };

    Some(BackupTask {
        config,
        copy_meta,
        previous_digest_tables,
        state: Arc::new(TaskState::new()),
        worker: Mutex::new(None),
    })
}

fn open_segment_reader(
    volume_path: &std::path::Path,
    seg: &CopySegment,
) -> std::io::Result<Arc<dyn RawDataReader>> {
    let io = FileRawIo::open_read(volume_path).map_err(std::io::Error::other)?;
    let _ = seg;
    Ok(Arc::new(io))
}

fn open_segment_writer(
    data_dir: &std::path::Path,
    seg: &CopySegment,
    fragmented: bool,
) -> std::io::Result<Arc<dyn RawDataWriter>> {
    let path = data_dir.join(&seg.copy_data_file);
    let io = FileRawIo::open_write(&path).map_err(std::io::Error::other)?;
    if fragmented {
        Ok(Arc::new(FragmentRawIo::new(io, -(seg.offset as i64))))
    } else {
        Ok(Arc::new(io))
    }
}

fn run(
    state: Arc<TaskState>,
    config: VolumeBackupConfig,
    copy_meta: CopyMeta,
    previous_digest_tables: Vec<Option<DigestTable>>,
) {
    state.set_status(TaskStatus::Running);

    let resource = ResourceManager::new(&config.data_dir_path);
    if let Err(e) = resource.prepare_backup(config.copy_format, copy_meta.volume_size, &copy_meta.segments) {
        log::error!("backup task: resource preparation failed: {e}");
        state.fail(ErrorCode::CopyAccessDenied);
        return;
    }

    if let Err(e) = copy_meta.save(&config.meta_dir_path) {
        log::error!("backup task: failed to persist copy meta: {e}");
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

    let mode = if config.prev_copy_meta_dir_path.is_some() {
        HashMode::Diff
    } else {
        HashMode::Direct
    };

    for (i, seg) in copy_meta.segments.iter().enumerate() {
        if state.abort_requested.load(Ordering::Relaxed) {
            state.set_status(TaskStatus::Aborted);
            return;
        }

        let source = match open_segment_reader(&config.volume_path, seg) {
            Ok(r) => r,
            Err(e) => {
                log::error!("backup task: failed to open volume for reading: {e}");
                state.fail(ErrorCode::VolumeAccessDenied);
                return;
            }
        };
        let sink = match open_segment_writer(&config.data_dir_path, seg, copy_meta.copy_format.is_fragmented()) {
            Ok(w) => w,
            Err(e) => {
                log::error!("backup task: failed to open copy data file: {e}");
                state.fail(ErrorCode::CopyAccessDenied);
                return;
            }
        };

        let shared_config = SharedConfig {
            block_size: config.block_size,
            source_offset: seg.offset,
            source_length: seg.length,
            hasher_enabled: config.hasher_enabled,
            checkpoint_enabled: config.checkpoint_enabled,
            skip_empty_block: config.skip_empty_block,
            mode,
        };

        let mut session = Session::new(
            shared_config,
            crate::allocator::DEFAULT_ALLOCATOR_BLOCK_NUM,
            previous_digest_tables[i]
                .as_ref()
                .map(|t| DigestTable::from_bytes(t.as_bytes().to_vec())),
            checkpoint.clone(),
            i,
        );
        session.start(source, sink, num_cpus_capped());

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

    if config.clear_checkpoints_on_succeed {
        if let Some(store) = &checkpoint {
            store.clear_all();
        }
    }
    state.set_status(TaskStatus::Succeed);
}

fn num_cpus_capped() -> usize {
    num_cpus::get().clamp(1, crate::hasher::MAX_HASHER_NUM)
}

impl Task for BackupTask {
    fn start(&self) -> bool {
        let state = self.state.clone();
        let config = self.config.clone();
        let copy_meta = self.copy_meta.clone();
        let previous = self
            .previous_digest_tables
            .iter()
            .map(|t| t.as_ref().map(|t| DigestTable::from_bytes(t.as_bytes().to_vec())))
            .collect();

        let handle = thread::spawn(move || run(state, config, copy_meta, previous));
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
