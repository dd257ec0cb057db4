//! Writer — C9, stage 3 of the session pipeline.
//!
//! Single worker thread. Pops blocks from the write queue, optionally skips
//! all-zero blocks without issuing I/O, and accumulates per-block write
//! failures rather than aborting the stream (§4.8) — a design choice
//! SPEC_FULL.md keeps deliberately unlike the original C++'s early return on
//! a short write (see DESIGN.md).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::rawio::RawDataWriter;
use crate::session::{SessionStatus, SharedConfig, SharedContext};

pub fn spawn(
    ctx: Arc<SharedContext>,
    config: SharedConfig,
    sink: Arc<dyn RawDataWriter>,
) -> JoinHandle<()> {
    thread::spawn(move || run(&ctx, &config, sink.as_ref()))
}

fn run(ctx: &SharedContext, config: &SharedConfig, sink: &dyn RawDataWriter) {
    loop {
        if ctx.abort.load(Ordering::Relaxed) {
            break;
        }
        let Some(mut block) = ctx.write_queue.blocking_pop() else {
            break;
        };

        let skip = config.skip_empty_block && block.handle.is_all_zero();
        if skip {
            ctx.written_bitmap.set(block.index);
            ctx.processed_bitmap.set(block.index);
            ctx.allocator.free(block.handle);
            continue;
        }

        let len = block.handle.len();
        match sink.write_at(block.volume_offset, &block.handle.as_slice()[..len as usize]) {
            Ok(n) if n as u32 == len => {
                ctx.written_bitmap.set(block.index);
                ctx.processed_bitmap.set(block.index);
                ctx.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
            }
            Ok(n) => {
                // Short write: fatal to this block, not the stream (§9
                // resolved choice — diverges from the original C++'s
                // early-return-on-short-write).
                log::error!(
                    "writer: short write at offset {} (wrote {n} of {len} bytes)",
                    block.volume_offset
                );
                ctx.blocks_write_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                log::error!(
                    "writer: write at offset {} failed: {err}",
                    block.volume_offset
                );
                ctx.blocks_write_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        ctx.allocator.free(block.handle);
    }

    // Whatever is still queued — whether we stopped on abort or the queue
    // simply hasn't been finished yet from our side — must be reclaimed so
    // the allocator pool doesn't stay starved (§8 Testable Property 9).
    while let Some(block) = ctx.write_queue.try_pop() {
        ctx.allocator.free(block.handle);
    }

    let _ = sink.flush();

    if ctx.blocks_write_failed.load(Ordering::Relaxed) > 0 {
        *ctx.status.lock().unwrap() = SessionStatus::Failed;
    } else if ctx.abort.load(Ordering::Relaxed) {
        *ctx.status.lock().unwrap() = SessionStatus::Aborted;
    }
}
