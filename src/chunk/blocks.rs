//! Off-heap block accounting for sealed chunks
//!
//! Sealed chunk columns are copied out of write buffers into one contiguous
//! allocation per chunk set. The shard's `BlockMemoryManager` enforces the
//! block budget; a `BlockGuard` travels with the chunk set and returns the
//! bytes to the budget when the last reader drops it.

use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bounded accounting for a shard's chunk block memory
#[derive(Debug)]
pub struct BlockMemoryManager {
    budget: usize,
    used: Arc<AtomicUsize>,
}

impl BlockMemoryManager {
    /// Create a manager with the given byte budget.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bytes currently held by live blocks
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Bytes still available under the budget
    pub fn available(&self) -> usize {
        self.budget.saturating_sub(self.used())
    }

    /// Copy encoded columns into one block, returning per-column slices that
    /// share the block's allocation plus the guard that owns its accounting.
    pub fn seal(&self, columns: &[&[u8]]) -> Result<(Vec<Bytes>, BlockGuard)> {
        let total: usize = columns.iter().map(|c| c.len()).sum();
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if used + total > self.budget {
                return Err(Error::BlockMemoryExhausted {
                    requested: total,
                    available: self.budget.saturating_sub(used),
                });
            }
            match self.used.compare_exchange_weak(
                used,
                used + total,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => used = actual,
            }
        }

        let mut block = BytesMut::with_capacity(total);
        for col in columns {
            block.extend_from_slice(col);
        }
        let block = block.freeze();

        let mut slices = Vec::with_capacity(columns.len());
        let mut offset = 0;
        for col in columns {
            slices.push(block.slice(offset..offset + col.len()));
            offset += col.len();
        }
        Ok((
            slices,
            BlockGuard {
                used: self.used.clone(),
                len: total,
            },
        ))
    }
}

/// Owns one block's share of the budget; dropping releases it
#[derive(Debug)]
pub struct BlockGuard {
    used: Arc<AtomicUsize>,
    len: usize,
}

impl BlockGuard {
    /// Size of the guarded block
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        self.used.fetch_sub(self.len, Ordering::AcqRel);
    }
}
