//! Latest-wins block cell shared between callbacks and the mix worker
//!
//! A cell holds one pre-allocated block and a sequence counter. The writer
//! copies a whole block in and bumps the sequence; readers copy a snapshot
//! out. Nothing is queued: a block that is overwritten before anyone reads it
//! is simply gone.
//!
//! Audio callbacks only ever use the `try_*` methods, which never block. The
//! mix worker may use the blocking variants since contention only ever lasts
//! for one block copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::types::{StereoBuffer, StereoSample};

/// Sequence number of a cell that has never been written (or was cleared)
pub const EMPTY_SEQUENCE: u64 = 0;

pub struct BlockCell {
    block: Mutex<StereoBuffer>,
    sequence: AtomicU64,
}

impl BlockCell {
    pub fn new(block_size: usize) -> Self {
        Self {
            block: Mutex::new(StereoBuffer::silence(block_size)),
            sequence: AtomicU64::new(EMPTY_SEQUENCE),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StereoBuffer> {
        self.block.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sequence of the latest block; [`EMPTY_SEQUENCE`] if none
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.sequence() == EMPTY_SEQUENCE
    }

    /// Publish a block from a callback; returns false (block dropped) if the
    /// cell is being read right now
    pub fn try_publish(&self, samples: &[StereoSample]) -> bool {
        match self.block.try_lock() {
            Ok(mut block) => {
                block.copy_from_slice(samples);
                self.sequence.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Store a block from the mix worker
    pub fn store(&self, samples: &StereoBuffer) {
        let mut block = self.lock();
        block.copy_from(samples);
        self.sequence.fetch_add(1, Ordering::AcqRel);
    }

    /// Copy the latest block into `out`, returning its sequence
    pub fn snapshot_into(&self, out: &mut StereoBuffer) -> u64 {
        let block = self.lock();
        out.copy_from(&block);
        self.sequence()
    }

    /// Non-blocking [`snapshot_into`](Self::snapshot_into) for callbacks
    ///
    /// Returns `None` if the cell is contended; `out` is then untouched.
    pub fn try_snapshot_into(&self, out: &mut [StereoSample]) -> Option<u64> {
        let block = self.block.try_lock().ok()?;
        out.copy_from_slice(block.as_slice());
        Some(self.sequence())
    }

    /// Copy of the latest block, or `None` if the cell is empty
    pub fn snapshot(&self) -> Option<StereoBuffer> {
        let block = self.lock();
        if self.is_empty() {
            None
        } else {
            Some(block.clone())
        }
    }

    /// Silence the block and mark the cell empty
    pub fn clear(&self) {
        let mut block = self.lock();
        block.fill_silence();
        self.sequence.store(EMPTY_SEQUENCE, Ordering::Release);
    }
}
