//! Copy Meta Store — C12.
//!
//! `CopyMeta`/`CopySegment` (de)serialize to the exact JSON sidecar shape in
//! §6 (`{copy_name}.volumecopy.meta.json`). Field names are camelCase on
//! the wire, via plain derives plus targeted renames where the wire format
//! demands it.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("failed to read copy meta at {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to write copy meta at {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("failed to parse copy meta JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("copy meta segments do not partition volume_size: expected {expected}, got {actual}")]
    ShapeMismatch { expected: u64, actual: u64 },
}

/// §6: wire-encoded as the plain integer `0` or `1`, not a string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackupType {
    Full = 0,
    ForeverIncremental = 1,
}

impl Serialize for BackupType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for BackupType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match u8::deserialize(d)? {
            0 => Ok(BackupType::Full),
            1 => Ok(BackupType::ForeverIncremental),
            other => Err(serde::de::Error::custom(format!("invalid backupType {other}"))),
        }
    }
}

/// §6: wire-encoded as the plain integer `0..6`, not a string tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyFormat {
    Bin = 0,
    BinFragmented = 1,
    Image = 2,
    VhdFixed = 3,
    VhdDynamic = 4,
    VhdxFixed = 5,
    VhdxDynamic = 6,
}

impl Serialize for CopyFormat {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for CopyFormat {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        match u8::deserialize(d)? {
            0 => Ok(CopyFormat::Bin),
            1 => Ok(CopyFormat::BinFragmented),
            2 => Ok(CopyFormat::Image),
            3 => Ok(CopyFormat::VhdFixed),
            4 => Ok(CopyFormat::VhdDynamic),
            5 => Ok(CopyFormat::VhdxFixed),
            6 => Ok(CopyFormat::VhdxDynamic),
            other => Err(serde::de::Error::custom(format!("invalid copyFormat {other}"))),
        }
    }
}

impl CopyFormat {
    pub fn is_fragmented(self) -> bool {
        matches!(self, CopyFormat::Bin | CopyFormat::BinFragmented)
    }

    pub fn is_virtual_disk(self) -> bool {
        matches!(
            self,
            CopyFormat::VhdFixed
                | CopyFormat::VhdDynamic
                | CopyFormat::VhdxFixed
                | CopyFormat::VhdxDynamic
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopySegment {
    #[serde(rename = "copyDataFile")]
    pub copy_data_file: String,
    #[serde(rename = "checksumBinFile")]
    pub checksum_bin_file: String,
    pub index: u32,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyMeta {
    #[serde(rename = "copyName")]
    pub copy_name: String,
    #[serde(rename = "backupType")]
    pub backup_type: BackupType,
    #[serde(rename = "copyFormat")]
    pub copy_format: CopyFormat,
    #[serde(rename = "volumeSize")]
    pub volume_size: u64,
    #[serde(rename = "blockSize")]
    pub block_size: u32,
    #[serde(rename = "volumePath")]
    pub volume_path: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub uuid: String,
    pub segments: Vec<CopySegment>,
}

impl CopyMeta {
    /// Invariant (§3): segments are contiguous, non-overlapping, start at
    /// zero, and sum to `volume_size`.
    pub fn validate(&self) -> Result<(), MetaError> {
        let mut expected_offset = 0u64;
        let mut total = 0u64;
        for seg in &self.segments {
            if seg.offset != expected_offset {
                return Err(MetaError::ShapeMismatch {
                    expected: expected_offset,
                    actual: seg.offset,
                });
            }
            expected_offset += seg.length;
            total += seg.length;
        }
        if total != self.volume_size {
            return Err(MetaError::ShapeMismatch {
                expected: self.volume_size,
                actual: total,
            });
        }
        Ok(())
    }

    pub fn sidecar_filename(copy_name: &str) -> String {
        format!("{copy_name}.volumecopy.meta.json")
    }

    pub fn save(&self, meta_dir: &Path) -> Result<(), MetaError> {
        let path = meta_dir.join(Self::sidecar_filename(&self.copy_name));
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|source| MetaError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load(meta_dir: &Path, copy_name: &str) -> Result<CopyMeta, MetaError> {
        let path = meta_dir.join(Self::sidecar_filename(copy_name));
        let data = fs::read_to_string(&path).map_err(|source| MetaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let meta: CopyMeta = serde_json::from_str(&data)?;
        meta.validate()?;
        Ok(meta)
    }
}

/// Splits a volume into segments of at most `session_size` bytes, naming
/// files per §6's copy-data-file convention.
pub fn build_segments(
    copy_name: &str,
    volume_size: u64,
    session_size: u64,
    format: CopyFormat,
) -> Vec<CopySegment> {
    let mut segments = Vec::new();
    let mut offset = 0u64;
    let mut index = 0u32;
    let single_segment = !format.is_fragmented();

    while offset < volume_size {
        let length = if single_segment {
            volume_size
        } else {
            (volume_size - offset).min(session_size)
        };
        segments.push(CopySegment {
            copy_data_file: copy_data_filename(copy_name, format, index),
            checksum_bin_file: format!("{copy_name}.{index}.sha256.meta.bin"),
            index,
            offset,
            length,
        });
        offset += length;
        index += 1;
    }
    segments
}

fn copy_data_filename(copy_name: &str, format: CopyFormat, index: u32) -> String {
    match format {
        CopyFormat::Bin | CopyFormat::BinFragmented => {
            if index == 0 {
                format!("{copy_name}.copydata.bin")
            } else {
                format!("{copy_name}.copydata.bin.part{index}")
            }
        }
        CopyFormat::Image => format!("{copy_name}.copydata.img"),
        CopyFormat::VhdFixed | CopyFormat::VhdDynamic => format!("{copy_name}.copydata.vhd"),
        CopyFormat::VhdxFixed | CopyFormat::VhdxDynamic => format!("{copy_name}.copydata.vhdx"),
    }
}
