//! CLI front end for `volumeprotect`.
//!
//! Wires `--loglevel` into `env_logger` (the library itself never touches
//! the logger — §9 "Global state") and translates flags into a
//! [`VolumeBackupConfig`] / [`VolumeRestoreConfig`], then polls the
//! resulting [`Task`] to completion, printing progress as it runs.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, ValueEnum};

use volumeprotect::{
    build_backup_task, build_restore_task, build_zerocopy_restore_task, config, CopyFormat, Task,
    TaskStatus, VolumeBackupConfig, VolumeRestoreConfig,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliCopyFormat {
    Bin,
    BinFragmented,
    Image,
    VhdFixed,
    VhdDynamic,
    VhdxFixed,
    VhdxDynamic,
}

impl From<CliCopyFormat> for CopyFormat {
    fn from(f: CliCopyFormat) -> CopyFormat {
        match f {
            CliCopyFormat::Bin => CopyFormat::Bin,
            CliCopyFormat::BinFragmented => CopyFormat::BinFragmented,
            CliCopyFormat::Image => CopyFormat::Image,
            CliCopyFormat::VhdFixed => CopyFormat::VhdFixed,
            CliCopyFormat::VhdDynamic => CopyFormat::VhdDynamic,
            CliCopyFormat::VhdxFixed => CopyFormat::VhdxFixed,
            CliCopyFormat::VhdxDynamic => CopyFormat::VhdxDynamic,
        }
    }
}

/// Block-level volume backup/restore engine (§6 CLI surface).
#[derive(Parser)]
#[command(name = "volumeprotect", version = "1.0.0", about = "Block-level volume backup/restore engine")]
struct Cli {
    /// Path to the volume (or image file) to back up / restore into.
    #[arg(short = 'v', long = "volume")]
    volume: PathBuf,

    /// Copy name. For backup, a timestamp-derived name is generated if
    /// omitted or too long (§4.10.1).
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Copy format (backup only; restore reads the format from copy meta).
    #[arg(short = 'f', long = "format", value_enum, default_value_t = CliCopyFormat::Image)]
    format: CliCopyFormat,

    /// Directory holding (or to hold) copy data files.
    #[arg(short = 'd', long = "data")]
    data: PathBuf,

    /// Directory holding (or to hold) the copy meta JSON sidecar.
    #[arg(short = 'm', long = "meta")]
    meta: PathBuf,

    /// Directory holding checkpoint bitmaps / digest sidecars. Disables
    /// checkpointing if omitted.
    #[arg(short = 'k', long = "checkpoint")]
    checkpoint: Option<PathBuf>,

    /// Previous copy's meta directory — selects forever-incremental backup.
    #[arg(short = 'p', long = "prevmeta")]
    prevmeta: Option<PathBuf>,

    /// Restore instead of backing up.
    #[arg(short = 'r', long = "restore", default_value_t = false)]
    restore: bool,

    /// Use the zero-copy restore path (single-segment Image copies only).
    #[arg(short = 'z', long = "zerocopy", default_value_t = false)]
    zerocopy: bool,

    /// Skip writing blocks that are entirely zero (backup only).
    #[arg(long = "skip-empty-block", default_value_t = false)]
    skip_empty_block: bool,

    /// Remove checkpoint sidecars once the task succeeds.
    #[arg(long = "clear-checkpoints-on-succeed", default_value_t = false)]
    clear_checkpoints_on_succeed: bool,

    /// Block size in bytes.
    #[arg(long = "block-size", default_value_t = config::DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// Session size in bytes (volume is split into segments of at most this
    /// size).
    #[arg(long = "session-size", default_value_t = config::DEFAULT_SESSION_SIZE)]
    session_size: u64,

    #[arg(short = 'l', long = "loglevel", default_value = "info")]
    loglevel: String,
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .parse_filters(&cli.loglevel)
        .init();

    let code = if cli.restore {
        run_restore(&cli)
    } else {
        run_backup(&cli)
    };
    std::process::exit(code);
}

fn micros_since_epoch() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
}

fn resolve_copy_name(name: Option<String>) -> String {
    match name {
        Some(n) if n.len() <= config::MAX_COPY_NAME_LEN => n,
        Some(n) => {
            log::warn!("copy name '{n}' exceeds {} chars, generating one", config::MAX_COPY_NAME_LEN);
            config::generate_copy_name(micros_since_epoch())
        }
        None => config::generate_copy_name(micros_since_epoch()),
    }
}

fn run_backup(cli: &Cli) -> i32 {
    let copy_name = resolve_copy_name(cli.name.clone());
    let checkpoint_dir_path = cli.checkpoint.clone().unwrap_or_else(|| cli.data.clone());

    let config = VolumeBackupConfig {
        copy_name,
        volume_path: cli.volume.clone(),
        copy_format: cli.format.into(),
        data_dir_path: cli.data.clone(),
        meta_dir_path: cli.meta.clone(),
        checkpoint_dir_path,
        block_size: cli.block_size,
        session_size: cli.session_size,
        hasher_enabled: true,
        checkpoint_enabled: cli.checkpoint.is_some(),
        skip_empty_block: cli.skip_empty_block,
        clear_checkpoints_on_succeed: cli.clear_checkpoints_on_succeed,
        prev_copy_meta_dir_path: cli.prevmeta.clone(),
    };

    let Some(task) = build_backup_task(config) else {
        eprintln!("failed to build backup task: invalid arguments");
        return -1;
    };

    run_and_report(&task)
}

fn run_restore(cli: &Cli) -> i32 {
    let Some(copy_name) = cli.name.clone() else {
        eprintln!("--name is required for restore");
        return -1;
    };
    let checkpoint_dir_path = cli.checkpoint.clone().unwrap_or_else(|| cli.data.clone());

    let config = VolumeRestoreConfig {
        copy_name,
        volume_path: cli.volume.clone(),
        data_dir_path: cli.data.clone(),
        meta_dir_path: cli.meta.clone(),
        checkpoint_dir_path,
        checkpoint_enabled: cli.checkpoint.is_some(),
        enable_zero_copy: cli.zerocopy,
    };

    if cli.zerocopy {
        let Some(task) = build_zerocopy_restore_task(config) else {
            eprintln!("failed to build zero-copy restore task: invalid arguments or ineligible copy");
            return -1;
        };
        return run_and_report(&task);
    }

    let Some(task) = build_restore_task(config) else {
        eprintln!("failed to build restore task: invalid arguments or size mismatch");
        return -1;
    };

    run_and_report(&task)
}

fn run_and_report(task: &dyn Task) -> i32 {
    if !task.start() {
        eprintln!("failed to start task");
        return -1;
    }

    while !task.is_terminated() {
        let stats = task.get_statistics();
        println!(
            "read {} / write {} bytes, {} blocks hashed, {} write failures",
            stats.bytes_read, stats.bytes_written, stats.blocks_hashed, stats.blocks_write_failed
        );
        std::thread::sleep(Duration::from_secs(1));
    }

    match task.get_status() {
        TaskStatus::Succeed => {
            println!("task succeeded");
            0
        }
        TaskStatus::Aborted => {
            eprintln!("task aborted");
            -1
        }
        other => {
            eprintln!("task failed: status={other:?} error_code={:?}", task.get_error_code());
            -1
        }
    }
}
