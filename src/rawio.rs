//! Raw byte-addressable I/O — C5.
//!
//! Generalizes the `DataReader`/`DataWriter` capability set
//! {Read, Write, Ok, Error, Handle} into Rust traits at the I/O seam. All
//! implementations are safe for concurrent reads at disjoint offsets;
//! concurrent overlapping writes are not guaranteed safe — the pipeline's
//! own invariant (no two blocks share an index) is what makes that sound
//! in practice (§5).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use thiserror::Error;

use crate::task::ErrorCode;

#[derive(Debug, Error)]
pub enum RawIoError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("read at offset {offset} failed: {source}")]
    Read { offset: u64, source: io::Error },
    #[error("write at offset {offset} failed: {source}")]
    Write { offset: u64, source: io::Error },
    #[error("flush failed: {source}")]
    Flush { source: io::Error },
}

impl RawIoError {
    /// Stable integer error code surfaced to task clients (§6).
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RawIoError::Open { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ErrorCode::VolumeAccessDenied
            }
            RawIoError::Write { source, .. } if source.raw_os_error() == Some(libc::ENOSPC) => {
                ErrorCode::NoSpace
            }
            _ => ErrorCode::CopyAccessDenied,
        }
    }
}

pub trait RawDataReader: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, RawIoError>;
    fn ok(&self) -> bool;
}

pub trait RawDataWriter: Send + Sync {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, RawIoError>;
    fn flush(&self) -> Result<(), RawIoError>;
    fn ok(&self) -> bool;
}

/// Positional I/O directly against a volume device or monolithic image file.
pub struct FileRawIo {
    file: File,
    healthy: bool,
}

impl FileRawIo {
    pub fn open_read(path: &Path) -> Result<Self, RawIoError> {
        let file = File::open(path).map_err(|source| RawIoError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { file, healthy: true })
    }

    pub fn open_write(path: &Path) -> Result<Self, RawIoError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| RawIoError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self { file, healthy: true })
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl RawDataReader for FileRawIo {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, RawIoError> {
        self.file
            .read_at(buf, offset)
            .map_err(|source| RawIoError::Read { offset, source })
    }

    fn ok(&self) -> bool {
        self.healthy
    }
}

impl RawDataWriter for FileRawIo {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, RawIoError> {
        self.file
            .write_at(buf, offset)
            .map_err(|source| RawIoError::Write { offset, source })
    }

    fn flush(&self) -> Result<(), RawIoError> {
        self.file
            .sync_data()
            .map_err(|source| RawIoError::Flush { source })
    }

    fn ok(&self) -> bool {
        self.healthy
    }
}

/// Presents a file as if it started at some caller-visible offset: a
/// `shift` translates the caller's absolute coordinate system into the
/// file's local `0..segment_length` range (§4.4). Used for per-segment
/// `bin`/`bin_fragmented` copy files.
pub struct FragmentRawIo {
    inner: FileRawIo,
    shift: i64,
}

impl FragmentRawIo {
    pub fn new(inner: FileRawIo, shift: i64) -> Self {
        Self { inner, shift }
    }

    fn translate(&self, offset: u64) -> u64 {
        (offset as i64 + self.shift) as u64
    }
}

impl RawDataReader for FragmentRawIo {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, RawIoError> {
        self.inner.read_at(self.translate(offset), buf)
    }

    fn ok(&self) -> bool {
        self.inner.ok()
    }
}

impl RawDataWriter for FragmentRawIo {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, RawIoError> {
        self.inner.write_at(self.translate(offset), buf)
    }

    fn flush(&self) -> Result<(), RawIoError> {
        self.inner.flush()
    }

    fn ok(&self) -> bool {
        self.inner.ok()
    }
}

/// Wraps a [`FileRawIo`] over the volume path the Resource Manager exposes
/// after a virtual disk attach. vhd/vhdx attach/detach machinery itself is
/// out of scope (§1); this struct only documents the seam `CopyFormat`'s
/// vhd/vhdx variants would reach once a real attach primitive exists, and
/// defers to `FileRawIo` over whatever path the resource manager already
/// resolved (currently always the `Image` fallback path — see `resource`).
pub struct VirtualDiskRawIo {
    inner: FileRawIo,
}

impl VirtualDiskRawIo {
    pub fn new(inner: FileRawIo) -> Self {
        Self { inner }
    }
}

impl RawDataReader for VirtualDiskRawIo {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, RawIoError> {
        self.inner.read_at(offset, buf)
    }

    fn ok(&self) -> bool {
        self.inner.ok()
    }
}

impl RawDataWriter for VirtualDiskRawIo {
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, RawIoError> {
        self.inner.write_at(offset, buf)
    }

    fn flush(&self) -> Result<(), RawIoError> {
        self.inner.flush()
    }

    fn ok(&self) -> bool {
        self.inner.ok()
    }
}
