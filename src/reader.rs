//! Reader — C7, stage 1 of the session pipeline.
//!
//! Single worker thread. Reads the source in block-sized chunks starting
//! from `processed_bitmap.first_unset()` — this is how restart-from-
//! checkpoint is realized (§4.6) — and pushes each block to the hashing
//! queue if hashing is enabled, else straight to the write queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::rawio::RawDataReader;
use crate::session::{Block, SharedConfig, SharedContext};

/// Backoff between allocator-exhaustion retries (§4.6 step 2a).
const ALLOCATOR_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub fn spawn(
    ctx: Arc<SharedContext>,
    config: SharedConfig,
    source: Arc<dyn RawDataReader>,
) -> JoinHandle<()> {
    thread::spawn(move || run(&ctx, &config, source.as_ref()))
}

fn run(ctx: &SharedContext, config: &SharedConfig, source: &dyn RawDataReader) {
    let mut current_index = ctx.processed_bitmap.first_unset();
    let mut current_offset = config.source_offset + current_index * config.block_size as u64;
    let source_end = config.source_offset + config.source_length;

    while current_offset < source_end {
        if ctx.abort.load(Ordering::Relaxed) {
            finish_downstream(ctx, config);
            *ctx.status.lock().unwrap() = crate::session::SessionStatus::Aborted;
            return;
        }

        let mut handle = loop {
            if ctx.abort.load(Ordering::Relaxed) {
                finish_downstream(ctx, config);
                *ctx.status.lock().unwrap() = crate::session::SessionStatus::Aborted;
                return;
            }
            match ctx.allocator.allocate() {
                Some(h) => break h,
                None => thread::sleep(ALLOCATOR_RETRY_INTERVAL),
            }
        };

        let remaining = source_end - current_offset;
        let n = remaining.min(config.block_size as u64) as u32;
        handle.set_len(n);

        if let Err(err) = source.read_at(current_offset, &mut handle.as_mut_slice()[..n as usize]) {
            log::error!("reader: read at offset {current_offset} failed: {err}");
            ctx.allocator.free(handle);
            ctx.fail(err.error_code());
            finish_downstream(ctx, config);
            return;
        }

        let block = Block {
            handle,
            index: current_index,
            // `session_offset == source_offset` in this design (both name
            // "where this segment sits in the volume's address space"), so
            // §4.6's `session_offset + (current_offset - source_offset)`
            // collapses to `current_offset` itself. Sinks that are
            // segment-local files (`FragmentRawIo`) translate this absolute
            // coordinate back down; sinks addressed absolutely (a whole
            // volume or single-segment image file) use it directly.
            volume_offset: current_offset,
            length: n,
        };

        let pushed = if config.hasher_enabled {
            ctx.hashing_queue.blocking_push(block)
        } else {
            ctx.write_queue.blocking_push(block)
        };
        if let Err(rejected) = pushed {
            // Downstream already finished or aborted. Free the block we
            // just allocated and read into rather than leak it, then stop —
            // the next loop iteration's abort check (or the loop condition
            // itself) will decide how we exit.
            ctx.allocator.free(rejected.handle);
            if ctx.abort.load(Ordering::Relaxed) {
                *ctx.status.lock().unwrap() = crate::session::SessionStatus::Aborted;
                return;
            }
        }

        current_index += 1;
        current_offset += n as u64;
        ctx.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    finish_downstream(ctx, config);
    if ctx.status() != crate::session::SessionStatus::Failed {
        *ctx.status.lock().unwrap() = crate::session::SessionStatus::Succeeded;
    }
}

fn finish_downstream(ctx: &SharedContext, config: &SharedConfig) {
    if config.hasher_enabled {
        ctx.hashing_queue.finish();
    } else {
        ctx.write_queue.finish();
    }
}
