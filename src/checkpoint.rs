//! Checkpoint Store — C13.
//!
//! Persists and restores the per-session processed bitmap and digest table
//! so a task can resume a crashed or aborted run from wherever it left off
//! (§6 checkpoint/digest sidecar formats, §4.10 step 3 cleanup).

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::bitmap::Bitmap;
use crate::hasher::DigestTable;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io { path: String, source: io::Error },
}

fn io_err(path: &Path, source: io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Wraps a checkpoint directory + copy name; knows the sidecar naming
/// convention from §6.
pub struct CheckpointStore {
    dir: PathBuf,
    copy_name: String,
    /// Every sidecar path ever written, for `clear_all` on task success.
    written_paths: std::sync::Mutex<Vec<PathBuf>>,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf, copy_name: String) -> Self {
        Self {
            dir,
            copy_name,
            written_paths: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn checkpoint_path(&self, segment_index: usize) -> PathBuf {
        self.dir
            .join(format!("{}.{}.checkpoint.bin", self.copy_name, segment_index))
    }

    fn digest_path(&self, segment_index: usize) -> PathBuf {
        self.dir
            .join(format!("{}.{}.sha256.meta.bin", self.copy_name, segment_index))
    }

    pub fn save_bitmap(&self, segment_index: usize, bitmap: &Bitmap) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(segment_index);
        let file = File::create(&path).map_err(|e| io_err(&path, e))?;
        bitmap.write_to(file).map_err(|e| io_err(&path, e))?;
        self.written_paths.lock().unwrap().push(path);
        Ok(())
    }

    pub fn load_bitmap(&self, segment_index: usize, bit_count: u64) -> Result<Bitmap, CheckpointError> {
        let path = self.checkpoint_path(segment_index);
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        Bitmap::read_from(file, bit_count).map_err(|e| io_err(&path, e))
    }

    pub fn save_digest_table(
        &self,
        segment_index: usize,
        table: &DigestTable,
    ) -> Result<(), CheckpointError> {
        let path = self.digest_path(segment_index);
        fs::write(&path, table.as_bytes()).map_err(|e| io_err(&path, e))?;
        self.written_paths.lock().unwrap().push(path);
        Ok(())
    }

    pub fn load_digest_table(&self, segment_index: usize) -> Result<DigestTable, CheckpointError> {
        let path = self.digest_path(segment_index);
        let bytes = fs::read(&path).map_err(|e| io_err(&path, e))?;
        Ok(DigestTable::from_bytes(bytes))
    }

    /// Removes every checkpoint/digest sidecar this store has written.
    /// Invoked by the task when `clear_checkpoints_on_succeed` is set.
    pub fn clear_all(&self) {
        let mut paths = self.written_paths.lock().unwrap();
        for path in paths.drain(..) {
            let _ = fs::remove_file(&path);
        }
    }
}
