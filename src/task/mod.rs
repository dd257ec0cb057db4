//! Task — C11.
//!
//! The task facade: splits a volume into sessions, runs them sequentially,
//! aggregates statistics, enforces abort, manages checkpoints (§4.10).
//! Three concrete task types share the state machine and polling algorithm
//! defined here: [`backup::BackupTask`], [`restore::RestoreTask`], and
//! [`zerocopy::ZeroCopyRestoreTask`].

pub mod backup;
pub mod restore;
pub mod zerocopy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionStatistics;

pub use backup::BackupTask;
pub use restore::RestoreTask;
pub use zerocopy::ZeroCopyRestoreTask;

/// Interval between main-thread polls of a running session (§4.10 step 2).
pub const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// §6 `TaskStatus` encoding: 0=init, 1=running, 2=succeed, 3=aborting,
/// 4=aborted, 5=failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Init = 0,
    Running = 1,
    Succeed = 2,
    Aborting = 3,
    Aborted = 4,
    Failed = 5,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeed | TaskStatus::Aborted | TaskStatus::Failed)
    }
}

/// §6 stable integer error codes surfaced to task clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0x0,
    VolumeAccessDenied = 0x00114514,
    CopyAccessDenied = 0x00114515,
    NoSpace = 0x00114516,
    InvalidVolume = 0x00114517,
}

#[derive(Debug, Error)]
pub enum VolumeProtectError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Meta(#[from] crate::meta::MetaError),
    #[error(transparent)]
    Resource(#[from] crate::resource::ResourceError),
    #[error(transparent)]
    RawIo(#[from] crate::rawio::RawIoError),
    #[error(transparent)]
    Hasher(#[from] crate::hasher::HasherError),
    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),
}

/// Aggregate statistics exposed to clients: the sum of every completed
/// session plus whatever the in-flight session has reported so far (§3
/// Counters, §4.10 step 2 "update live statistics").
pub type TaskStatistics = SessionStatistics;

/// Shared mutable state read/written by a task's control thread and
/// observed by the client-facing `Task` trait methods.
pub struct TaskState {
    pub status: Mutex<TaskStatus>,
    pub abort_requested: AtomicBool,
    pub error_code: Mutex<ErrorCode>,
    pub completed_statistics: Mutex<TaskStatistics>,
    pub live_statistics: Mutex<TaskStatistics>,
}

impl TaskState {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::Init),
            abort_requested: AtomicBool::new(false),
            error_code: Mutex::new(ErrorCode::Success),
            completed_statistics: Mutex::new(TaskStatistics::default()),
            live_statistics: Mutex::new(TaskStatistics::default()),
        }
    }

    pub fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    pub fn fail(&self, code: ErrorCode) {
        *self.status.lock().unwrap() = TaskStatus::Failed;
        *self.error_code.lock().unwrap() = code;
    }

    pub fn statistics(&self) -> TaskStatistics {
        *self.completed_statistics.lock().unwrap() + *self.live_statistics.lock().unwrap()
    }

    pub fn fold_completed(&self, session_stats: TaskStatistics) {
        let mut completed = self.completed_statistics.lock().unwrap();
        *completed = *completed + session_stats;
        *self.live_statistics.lock().unwrap() = TaskStatistics::default();
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Common client-facing surface implemented by every task type (§6 "Task
/// facade operations").
pub trait Task: Send + Sync {
    /// Launches the task's control thread. Returns `true` on successful
    /// launch (mirrors the original's async `start()` contract).
    fn start(&self) -> bool;
    fn is_terminated(&self) -> bool;
    fn get_status(&self) -> TaskStatus;
    fn get_statistics(&self) -> TaskStatistics;
    fn get_error_code(&self) -> ErrorCode;
    /// Idempotent: `init -> aborted` directly, `running -> aborting`.
    fn abort(&self);
}
