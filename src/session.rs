//! Session — C10.
//!
//! One reader/hasher/writer pipeline run bounded to a single segment. The
//! immutable [`SharedConfig`] and mutable [`SharedContext`] are composed,
//! not referenced cyclically (§9 "Cyclic references ... model as
//! composition, not back-pointers"): stages hold an `Arc<SharedContext>`
//! and never a reference back to the owning `Session` or `Task`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::allocator::{BlockAllocator, BlockHandle};
use crate::bitmap::Bitmap;
use crate::checkpoint::CheckpointStore;
use crate::hasher::{self, DigestTable, HashMode};
use crate::queue::{BlockQueue, DEFAULT_QUEUE_SIZE};
use crate::rawio::{RawDataReader, RawDataWriter};
use crate::reader;
use crate::task::ErrorCode;
use crate::writer;

/// A transient in-flight unit of work. `handle` is allocator-owned;
/// ownership moves reader -> (hasher) -> writer, and the writer is
/// responsible for calling `free` on it (§3 Block invariant).
pub struct Block {
    pub handle: BlockHandle,
    pub index: u64,
    pub volume_offset: u64,
    pub length: u32,
}

// Safety: see `BlockHandle`'s own `Send` impl — the same ownership-handoff
// invariant applies transitively to `Block`.
unsafe impl Send for Block {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Init,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

/// Immutable per-session configuration, shared by value (cheap to clone,
/// never mutated once a session starts).
#[derive(Clone)]
pub struct SharedConfig {
    pub block_size: u32,
    /// Offset of this session's segment within the volume's address space.
    pub source_offset: u64,
    pub source_length: u64,
    pub hasher_enabled: bool,
    pub checkpoint_enabled: bool,
    pub skip_empty_block: bool,
    pub mode: HashMode,
}

impl SharedConfig {
    pub fn block_count(&self) -> u64 {
        (self.source_length + self.block_size as u64 - 1) / self.block_size as u64
    }
}

/// Mutable state shared by the three stage threads of one session: the
/// block allocator, the two bounded queues, the three bitmaps, and the
/// counters (§3 Session/Counters).
pub struct SharedContext {
    pub allocator: BlockAllocator,
    pub hashing_queue: BlockQueue<Block>,
    pub write_queue: BlockQueue<Block>,
    /// Set once a block at that index has been durably written.
    pub written_bitmap: Bitmap,
    /// Set once a block at that index has reached any terminal state
    /// (written, or dropped unchanged in DIFF mode) — this is the bitmap
    /// the reader consults on restart via `first_unset()`.
    pub processed_bitmap: Bitmap,
    pub latest_digest_table: DigestTable,
    pub previous_digest_table: Option<DigestTable>,
    pub abort: AtomicBool,
    pub status: Mutex<SessionStatus>,
    pub error_code: Mutex<Option<ErrorCode>>,

    pub bytes_to_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub blocks_to_hash: AtomicU64,
    pub blocks_hashed: AtomicU64,
    pub bytes_to_write: AtomicU64,
    pub bytes_written: AtomicU64,
    pub blocks_write_failed: AtomicU64,
}

impl SharedContext {
    pub fn new(
        config: &SharedConfig,
        allocator_block_count: u32,
        previous_digest_table: Option<DigestTable>,
    ) -> Self {
        let block_count = config.block_count() as usize;
        Self {
            allocator: BlockAllocator::new(config.block_size, allocator_block_count),
            hashing_queue: BlockQueue::new(DEFAULT_QUEUE_SIZE),
            write_queue: BlockQueue::new(DEFAULT_QUEUE_SIZE),
            written_bitmap: Bitmap::new(block_count as u64),
            processed_bitmap: Bitmap::new(block_count as u64),
            latest_digest_table: DigestTable::new(block_count),
            previous_digest_table,
            abort: AtomicBool::new(false),
            status: Mutex::new(SessionStatus::Init),
            error_code: Mutex::new(None),
            bytes_to_read: AtomicU64::new(config.source_length),
            bytes_read: AtomicU64::new(0),
            blocks_to_hash: AtomicU64::new(block_count as u64),
            blocks_hashed: AtomicU64::new(0),
            bytes_to_write: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            blocks_write_failed: AtomicU64::new(0),
        }
    }

    pub fn fail(&self, code: ErrorCode) {
        *self.status.lock().unwrap() = SessionStatus::Failed;
        let mut slot = self.error_code.lock().unwrap();
        if slot.is_none() {
            *slot = Some(code);
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }
}

/// Snapshot of one session's progress; summed by the task into
/// `completed_session_statistics` (§3 Counters, §4.10 step 2).
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStatistics {
    pub bytes_to_read: u64,
    pub bytes_read: u64,
    pub blocks_to_hash: u64,
    pub blocks_hashed: u64,
    pub bytes_to_write: u64,
    pub bytes_written: u64,
    pub blocks_write_failed: u64,
}

impl std::ops::Add for SessionStatistics {
    type Output = SessionStatistics;

    fn add(self, rhs: SessionStatistics) -> SessionStatistics {
        SessionStatistics {
            bytes_to_read: self.bytes_to_read + rhs.bytes_to_read,
            bytes_read: self.bytes_read + rhs.bytes_read,
            blocks_to_hash: self.blocks_to_hash + rhs.blocks_to_hash,
            blocks_hashed: self.blocks_hashed + rhs.blocks_hashed,
            bytes_to_write: self.bytes_to_write + rhs.bytes_to_write,
            bytes_written: self.bytes_written + rhs.bytes_written,
            blocks_write_failed: self.blocks_write_failed + rhs.blocks_write_failed,
        }
    }
}

/// Owns one reader/hasher/writer triple plus their shared context.
/// Joins every stage thread on drop (§9 "a clean implementation joins in
/// the session's scoped-drop").
pub struct Session {
    pub config: SharedConfig,
    pub ctx: Arc<SharedContext>,
    reader_handle: Option<JoinHandle<()>>,
    hasher_handles: Vec<JoinHandle<()>>,
    writer_handle: Option<JoinHandle<()>>,
    checkpoint: Option<Arc<CheckpointStore>>,
    segment_index: usize,
}

impl Session {
    /// Builds a session context, optionally restoring a checkpoint, but
    /// does not start any threads yet. `checkpoint` is shared (not
    /// per-session) so that every sidecar this run writes is recorded
    /// against the one store the task later sweeps via `clear_all` on
    /// success (§4.10 step 3).
    pub fn new(
        config: SharedConfig,
        allocator_block_count: u32,
        previous_digest_table: Option<DigestTable>,
        checkpoint: Option<Arc<CheckpointStore>>,
        segment_index: usize,
    ) -> Self {
        let mut ctx = SharedContext::new(&config, allocator_block_count, previous_digest_table);
        if config.checkpoint_enabled {
            if let Some(store) = &checkpoint {
                if let Ok(bitmap) = store.load_bitmap(segment_index, ctx.processed_bitmap.bit_count()) {
                    ctx.processed_bitmap = bitmap;
                }
            }
        }
        Self {
            config,
            ctx: Arc::new(ctx),
            reader_handle: None,
            hasher_handles: Vec::new(),
            writer_handle: None,
            checkpoint,
            segment_index,
        }
    }

    /// Starts the reader, hasher pool (if enabled), and writer threads.
    pub fn start(
        &mut self,
        source: Arc<dyn RawDataReader>,
        sink: Arc<dyn RawDataWriter>,
        hasher_worker_count: usize,
    ) {
        *self.ctx.status.lock().unwrap() = SessionStatus::Running;

        if self.config.hasher_enabled {
            self.hasher_handles = hasher::spawn(self.ctx.clone(), self.config.mode, hasher_worker_count);
        }

        self.writer_handle = Some(writer::spawn(self.ctx.clone(), self.config.clone(), sink));
        self.reader_handle = Some(reader::spawn(self.ctx.clone(), self.config.clone(), source));
    }

    pub fn is_terminated(&self) -> bool {
        matches!(
            self.ctx.status(),
            SessionStatus::Succeeded | SessionStatus::Failed | SessionStatus::Aborted
        )
    }

    pub fn is_failed(&self) -> bool {
        self.ctx.status() == SessionStatus::Failed
    }

    pub fn abort(&self) {
        self.ctx.abort.store(true, Ordering::Relaxed);
        // Wake any stage already parked in a queue wait — setting the flag
        // alone doesn't reach a thread blocked inside `Condvar::wait` (§4.9:
        // stages sample `abort` at every iteration, including while parked).
        self.ctx.hashing_queue.signal_abort();
        self.ctx.write_queue.signal_abort();
    }

    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            bytes_to_read: self.ctx.bytes_to_read.load(Ordering::Relaxed),
            bytes_read: self.ctx.bytes_read.load(Ordering::Relaxed),
            blocks_to_hash: self.ctx.blocks_to_hash.load(Ordering::Relaxed),
            blocks_hashed: self.ctx.blocks_hashed.load(Ordering::Relaxed),
            bytes_to_write: self.ctx.bytes_to_write.load(Ordering::Relaxed),
            bytes_written: self.ctx.bytes_written.load(Ordering::Relaxed),
            blocks_write_failed: self.ctx.blocks_write_failed.load(Ordering::Relaxed),
        }
    }

    /// Persists the processed bitmap and the latest digest table to the
    /// checkpoint directory. Called on every terminal state and at
    /// periodic intervals while running (§5).
    pub fn flush_checkpoint(&self) {
        if !self.config.checkpoint_enabled {
            return;
        }
        if let Some(store) = &self.checkpoint {
            let _ = store.save_bitmap(self.segment_index, &self.ctx.processed_bitmap);
            let _ = store.save_digest_table(self.segment_index, &self.ctx.latest_digest_table);
        }
    }

    fn join_all(&mut self) {
        if let Some(h) = self.reader_handle.take() {
            let _ = h.join();
        }
        for h in self.hasher_handles.drain(..) {
            let _ = h.join();
        }
        if let Some(h) = self.writer_handle.take() {
            let _ = h.join();
        }
        if self.ctx.status() == SessionStatus::Running {
            *self.ctx.status.lock().unwrap() = SessionStatus::Succeeded;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.join_all();
    }
}
