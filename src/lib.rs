//! # volumeprotect — block-level volume backup/restore engine
//!
//! Guarantees:
//! - Backups are block-level copies of a volume (or another block device /
//!   image file), split into fixed-size *sessions* so memory stays bounded
//!   regardless of volume size.
//! - Forever-incremental backups detect changed blocks by comparing
//!   per-block SHA-256 digests against the previous copy's digest table —
//!   unchanged blocks are never re-written.
//! - Every session is restartable from a checkpoint bitmap; a crash mid-copy
//!   loses at most the in-flight session's un-flushed progress.
//! - The session pipeline (reader -> hasher -> writer) runs under bounded
//!   memory: a fixed-size block allocator and bounded queues are shared by
//!   the three stages.

pub mod allocator;
pub mod bitmap;
pub mod checkpoint;
pub mod config;
pub mod hasher;
pub mod meta;
pub mod queue;
pub mod rawio;
pub mod reader;
pub mod resource;
pub mod session;
pub mod task;
pub mod writer;

pub use allocator::{BlockAllocator, BlockHandle};
pub use bitmap::Bitmap;
pub use config::{VolumeBackupConfig, VolumeRestoreConfig};
pub use hasher::{DigestTable, HashMode, HasherError};
pub use meta::{BackupType, CopyFormat, CopyMeta, CopySegment};
pub use queue::BlockQueue;
pub use session::{Session, SessionStatistics, SharedConfig, SharedContext};
pub use task::backup::build_backup_task;
pub use task::restore::build_restore_task;
pub use task::zerocopy::build_zerocopy_restore_task;
pub use task::{
    BackupTask, ErrorCode, RestoreTask, Task, TaskStatistics, TaskStatus, VolumeProtectError,
    ZeroCopyRestoreTask,
};
