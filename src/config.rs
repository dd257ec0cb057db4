//! Configuration — **[ADDED]**.
//!
//! Plain in-process structs mirroring
//! `original_source/include/VolumeProtector.h`'s default constants. No
//! external config-file format is in scope (§1 lists "configuration file
//! handling" as an external collaborator); these structs are populated
//! directly by the CLI or by an embedding caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::meta::CopyFormat;

pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;
pub const DEFAULT_SESSION_SIZE: u64 = 1024 * 1024 * 1024 * 1024;
pub const DEFAULT_VOLUME_COPY_NAME: &str = "volumeprotect";
pub const MAX_COPY_NAME_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("copy_name '{0}' exceeds the {MAX_COPY_NAME_LEN}-character limit")]
    CopyNameTooLong(String),
    #[error("session_size must be greater than zero")]
    ZeroSessionSize,
    #[error("block_size must be greater than zero")]
    ZeroBlockSize,
    #[error("volume_path does not exist or is not readable: {0}")]
    VolumeUnreadable(String),
    #[error("data_dir_path does not exist: {0}")]
    DataDirMissing(String),
    #[error("meta_dir_path does not exist: {0}")]
    MetaDirMissing(String),
    #[error("incremental backup requires a readable prev_copy_meta_dir_path")]
    MissingPrevMeta,
    #[error("enable_zero_copy requires a single-segment Image-format copy")]
    ZeroCopyRequiresSingleImageSegment,
}

/// Generates a copy name from a microsecond timestamp, matching §4.10.1
/// "computes copy_name from microsecond timestamp if missing or too long".
/// `micros_since_epoch` is supplied by the caller (CLI/task construction)
/// since this module must not read the system clock itself.
pub fn generate_copy_name(micros_since_epoch: u128) -> String {
    format!("{DEFAULT_VOLUME_COPY_NAME}-{micros_since_epoch}")
}

pub fn validate_copy_name(copy_name: &str) -> Result<(), ConfigError> {
    if copy_name.len() > MAX_COPY_NAME_LEN {
        return Err(ConfigError::CopyNameTooLong(copy_name.to_string()));
    }
    Ok(())
}

fn validate_dir(path: &PathBuf, err: impl Fn(String) -> ConfigError) -> Result<(), ConfigError> {
    if !path.is_dir() {
        return Err(err(path.display().to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct VolumeBackupConfig {
    pub copy_name: String,
    pub volume_path: PathBuf,
    pub copy_format: CopyFormat,
    pub data_dir_path: PathBuf,
    pub meta_dir_path: PathBuf,
    pub checkpoint_dir_path: PathBuf,
    pub block_size: u32,
    pub session_size: u64,
    pub hasher_enabled: bool,
    pub checkpoint_enabled: bool,
    pub skip_empty_block: bool,
    pub clear_checkpoints_on_succeed: bool,
    /// `None` for a full backup; `Some(dir)` selects forever-incremental
    /// mode, reading the prior copy's digest tables from `dir`.
    pub prev_copy_meta_dir_path: Option<PathBuf>,
}

impl VolumeBackupConfig {
    pub fn backup_type(&self) -> crate::meta::BackupType {
        if self.prev_copy_meta_dir_path.is_some() {
            crate::meta::BackupType::ForeverIncremental
        } else {
            crate::meta::BackupType::Full
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_copy_name(&self.copy_name)?;
        if self.session_size == 0 {
            return Err(ConfigError::ZeroSessionSize);
        }
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if !self.volume_path.exists() {
            return Err(ConfigError::VolumeUnreadable(
                self.volume_path.display().to_string(),
            ));
        }
        validate_dir(&self.data_dir_path, ConfigError::DataDirMissing)?;
        validate_dir(&self.meta_dir_path, ConfigError::MetaDirMissing)?;
        if let Some(prev) = &self.prev_copy_meta_dir_path {
            if !prev.is_dir() {
                return Err(ConfigError::MissingPrevMeta);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct VolumeRestoreConfig {
    pub copy_name: String,
    pub volume_path: PathBuf,
    pub data_dir_path: PathBuf,
    pub meta_dir_path: PathBuf,
    pub checkpoint_dir_path: PathBuf,
    pub checkpoint_enabled: bool,
    pub enable_zero_copy: bool,
}

impl VolumeRestoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_copy_name(&self.copy_name)?;
        validate_dir(&self.data_dir_path, ConfigError::DataDirMissing)?;
        validate_dir(&self.meta_dir_path, ConfigError::MetaDirMissing)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_copy_name_embeds_timestamp() {
        assert_eq!(generate_copy_name(12345), "volumeprotect-12345");
    }

    #[test]
    fn validate_copy_name_rejects_long_names() {
        let long = "x".repeat(33);
        assert!(validate_copy_name(&long).is_err());
        assert!(validate_copy_name("short").is_ok());
    }

    #[test]
    fn backup_config_rejects_missing_volume() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = VolumeBackupConfig {
            copy_name: "copy".into(),
            volume_path: dir.path().join("does-not-exist"),
            copy_format: CopyFormat::Image,
            data_dir_path: dir.path().to_path_buf(),
            meta_dir_path: dir.path().to_path_buf(),
            checkpoint_dir_path: dir.path().to_path_buf(),
            block_size: DEFAULT_BLOCK_SIZE,
            session_size: DEFAULT_SESSION_SIZE,
            hasher_enabled: true,
            checkpoint_enabled: true,
            skip_empty_block: false,
            clear_checkpoints_on_succeed: true,
            prev_copy_meta_dir_path: None,
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::VolumeUnreadable(_))));
    }
}
