//! SHA-256 block hasher — C8.
//!
//! A pool of worker threads drains the hashing queue, computes SHA-256 per
//! block into the latest digest table, and in [`HashMode::Diff`] mode drops
//! blocks whose digest is unchanged from the previous copy's table instead
//! of forwarding them to the writer. The last worker to exit finishes the
//! write queue — mirrors the original's `m_workersRunning` countdown in
//! `VolumeBlockHasher.cpp`, where `HandleWorkerTerminate` lets the final
//! thread out the door close the write side behind it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::session::SharedContext;

/// Default hasher worker count (`original_source/include/VolumeProtector.h`'s
/// `DEFAULT_HASHER_NUM`).
pub const DEFAULT_HASHER_NUM: usize = 8;
/// Hard cap on hasher worker count regardless of processor count.
pub const MAX_HASHER_NUM: usize = 32;

const DIGEST_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum HasherError {
    #[error("digest table shape mismatch: previous has {previous} slots, latest has {latest}")]
    ShapeMismatch { previous: usize, latest: usize },
}

/// Change-detection mode. `Direct` forwards every block; `Diff` compares
/// against the previous copy's digest table and drops unchanged blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    Direct,
    Diff,
}

/// A flat table of `block_count * 32` bytes, one SHA-256 digest per block
/// index. Workers write disjoint `[index*32..index*32+32)` ranges
/// concurrently; this is safe by construction since no two blocks in a
/// session share an index (§5).
pub struct DigestTable {
    bytes: Vec<u8>,
    block_count: usize,
}

impl DigestTable {
    pub fn new(block_count: usize) -> Self {
        Self {
            bytes: vec![0u8; block_count * DIGEST_LEN],
            block_count,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let block_count = bytes.len() / DIGEST_LEN;
        Self { bytes, block_count }
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn digest_at(&self, index: usize) -> &[u8] {
        &self.bytes[index * DIGEST_LEN..(index + 1) * DIGEST_LEN]
    }

    /// Writes a digest into `index`'s slot.
    ///
    /// # Safety
    /// Caller must guarantee no other thread writes the same `index`
    /// concurrently; readers of a different index are unaffected since the
    /// ranges are disjoint.
    fn set_digest(&self, index: usize, digest: &[u8; DIGEST_LEN]) {
        let base = index * DIGEST_LEN;
        // Safety: disjoint `index` ranges never alias across concurrent
        // hasher workers (§5 "digest tables: hasher writes disjoint index
        // ranges ... safe by construction").
        let ptr = self.bytes.as_ptr() as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(digest.as_ptr(), ptr.add(base), DIGEST_LEN);
        }
    }

    /// Shape must match to compare tables in `Diff` mode.
    pub fn same_shape(&self, other: &DigestTable) -> bool {
        self.block_count == other.block_count
    }
}

// Safety: all mutation goes through `set_digest`, whose caller contract
// guarantees disjoint index ranges across threads.
unsafe impl Sync for DigestTable {}

/// Spawns `worker_count` hasher threads draining `ctx`'s hashing queue.
/// Returns their join handles; the caller (the session) joins them on
/// teardown.
pub fn spawn(
    ctx: Arc<SharedContext>,
    mode: HashMode,
    worker_count: usize,
) -> Vec<JoinHandle<()>> {
    let worker_count = worker_count.clamp(1, MAX_HASHER_NUM);
    let workers_running = Arc::new(AtomicUsize::new(worker_count));
    let mut handles = Vec::with_capacity(worker_count);

    for _ in 0..worker_count {
        let ctx = ctx.clone();
        let workers_running = workers_running.clone();
        handles.push(thread::spawn(move || {
            worker_loop(&ctx, mode);
            if workers_running.fetch_sub(1, Ordering::AcqRel) == 1 {
                ctx.write_queue.finish();
            }
        }));
    }
    handles
}

fn worker_loop(ctx: &SharedContext, mode: HashMode) {
    loop {
        if ctx.abort.load(Ordering::Relaxed) {
            break;
        }
        let Some(mut block) = ctx.hashing_queue.blocking_pop() else {
            break;
        };

        let mut hasher = Sha256::new();
        hasher.update(block.handle.as_slice());
        let digest: [u8; DIGEST_LEN] = hasher.finalize().into();
        ctx.latest_digest_table.set_digest(block.index as usize, &digest);
        ctx.blocks_hashed.fetch_add(1, Ordering::Relaxed);

        if mode == HashMode::Diff {
            if let Some(prev) = ctx.previous_digest_table.as_ref() {
                if prev.digest_at(block.index as usize) == &digest[..] {
                    ctx.processed_bitmap.set(block.index);
                    ctx.allocator.free(block.handle);
                    continue;
                }
            }
        }

        ctx.bytes_to_write.fetch_add(block.length as u64, Ordering::Relaxed);
        if let Err(rejected) = ctx.write_queue.blocking_push(block) {
            // Write queue finished or aborted out from under us — reclaim
            // the buffer instead of leaking it.
            ctx.allocator.free(rejected.handle);
        }
    }

    // Drain and free whatever is still sitting in the hashing queue so an
    // abort can't starve the allocator pool (§8 Testable Property 9).
    while let Some(block) = ctx.hashing_queue.try_pop() {
        ctx.allocator.free(block.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_table_round_trips_bytes() {
        let table = DigestTable::new(4);
        let digest = [7u8; DIGEST_LEN];
        table.set_digest(2, &digest);
        assert_eq!(table.digest_at(2), &digest[..]);
        assert_eq!(table.digest_at(0), &[0u8; DIGEST_LEN][..]);
    }

    #[test]
    fn same_shape_compares_block_counts() {
        let a = DigestTable::new(4);
        let b = DigestTable::new(4);
        let c = DigestTable::new(5);
        assert!(a.same_shape(&b));
        assert!(!a.same_shape(&c));
    }

    #[test]
    fn sha256_matches_known_vector() {
        let mut hasher = Sha256::new();
        hasher.update(b"abc");
        let digest = hasher.finalize();
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
