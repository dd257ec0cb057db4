//! Resource Manager — C6.
//!
//! Scoped acquisition of copy resources with guaranteed release on every
//! exit path, grounded on `original_source/include/native/TaskResourceManager.h`.
//! GPT initialization and vhd/vhdx container writers remain external
//! collaborators (§1); `CopyFormat`'s virtual-disk variants are modeled as
//! data so `CopyMeta`/the CLI round-trip them, but their actual preparation
//! degenerates to the `Image` path with a logged warning — the one place
//! this crate narrows rather than supplements the distilled spec (see
//! DESIGN.md).

use std::fs::OpenOptions;
use std::path::Path;

use thiserror::Error;

use crate::meta::{CopyFormat, CopyMeta, CopySegment};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to create copy data file {path}: {source}")]
    Create { path: String, source: std::io::Error },
    #[error("failed to size copy data file {path} to {size} bytes: {source}")]
    Truncate {
        path: String,
        size: u64,
        source: std::io::Error,
    },
    #[error("expected copy data file {path} to exist for restore")]
    Missing { path: String },
}

/// Scoped resource handle for one task's lifetime. Currently holds no
/// attach state since virtual-disk attach is out of scope, but the `Drop`
/// impl is the seam where detach would happen once that primitive exists
/// (§4.5 "destroyed when the task finishes: always detach").
pub struct ResourceManager {
    data_dir: std::path::PathBuf,
}

impl ResourceManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Creates the on-disk container(s) a backup will write into.
    pub fn prepare_backup(
        &self,
        copy_format: CopyFormat,
        volume_size: u64,
        segments: &[CopySegment],
    ) -> Result<(), ResourceError> {
        if copy_format.is_virtual_disk() {
            log::warn!(
                "copy format {copy_format:?} requested but virtual-disk container \
                 initialization is an external collaborator in this build; \
                 falling back to a flat image file"
            );
        }

        if copy_format.is_fragmented() {
            for seg in segments {
                self.create_sized_file(&seg.copy_data_file, seg.length)?;
            }
        } else {
            // Image and virtual-disk formats (narrowed to Image, see above)
            // both get a single sparse file sized to the whole volume.
            let filename = &segments[0].copy_data_file;
            self.create_sized_file(filename, volume_size)?;
        }
        Ok(())
    }

    /// Asserts every segment's copy data file exists ahead of a restore.
    pub fn prepare_restore(&self, copy_meta: &CopyMeta) -> Result<(), ResourceError> {
        for seg in &copy_meta.segments {
            let path = self.data_dir.join(&seg.copy_data_file);
            if !path.exists() {
                return Err(ResourceError::Missing {
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Ensures `filename` exists and is sized to exactly `size` bytes.
    ///
    /// Deliberately does *not* open with `O_TRUNC`: a task relaunched after
    /// a crash (§8 property 8, "checkpoint resume") calls this again on the
    /// same copy data file, and truncating it to zero first would erase
    /// every block already written before the session even starts.
    /// `set_len` alone extends (sparsely) or shrinks without touching bytes
    /// that remain within the new length.
    fn create_sized_file(&self, filename: &str, size: u64) -> Result<(), ResourceError> {
        let path = self.data_dir.join(filename);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|source| ResourceError::Create {
                path: path.display().to_string(),
                source,
            })?;
        file.set_len(size).map_err(|source| ResourceError::Truncate {
            path: path.display().to_string(),
            size,
            source,
        })
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        // No attach state held today (§1 Non-goal); this is the seam a
        // future virtual-disk attach implementation would detach from.
    }
}
