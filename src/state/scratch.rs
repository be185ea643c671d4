//! Fixed pool of pre-allocated staging buffers for register-file saves.

use std::sync::{Mutex, MutexGuard};

use crate::error::{VectorError, VectorResult};

struct PoolInner {
    buffers: Vec<Vec<u8>>,
    in_use: Vec<bool>,
}

/// Scratch buffers shared by every context of one manager.
pub struct ScratchPool {
    inner: Mutex<PoolInner>,
    slot_bytes: usize,
}

impl ScratchPool {
    /// Allocate `slots` buffers of `slot_bytes` each.
    ///
    /// Either every slot is allocated or none is.
    pub fn new(slots: usize, slot_bytes: usize) -> VectorResult<Self> {
        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(slots)
            .map_err(|_| VectorError::oom(slots.saturating_mul(std::mem::size_of::<Vec<u8>>())))?;

        for _ in 0..slots {
            let mut buf = Vec::new();
            // Slots already pushed are dropped with `buffers` on failure
            buf.try_reserve_exact(slot_bytes).map_err(|_| VectorError::oom(slot_bytes))?;
            buffers.push(buf);
        }

        log::debug!("Scratch pool: {} slots x {} bytes", slots, slot_bytes);
        Ok(Self {
            inner: Mutex::new(PoolInner { in_use: vec![false; slots], buffers }),
            slot_bytes,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub fn capacity(&self) -> usize {
        self.lock().in_use.len()
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use.iter().filter(|&&b| b).count()
    }

    /// Borrow a free slot, or `None` when all are taken.
    pub fn acquire(&self) -> Option<ScratchSlot<'_>> {
        let mut inner = self.lock();
        let index = inner.in_use.iter().position(|&b| !b)?;
        inner.in_use[index] = true;
        let buffer = std::mem::take(&mut inner.buffers[index]);
        Some(ScratchSlot { pool: self, index, buffer })
    }

    /// Free every slot.
    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        let busy = inner.in_use.iter().filter(|&&b| b).count();
        if busy > 0 {
            log::warn!("Scratch pool cleared with {} slots still in use", busy);
        }
        inner.buffers.clear();
        inner.in_use.clear();
    }

    fn give_back(&self, index: usize, buffer: Vec<u8>) {
        let mut inner = self.lock();
        // The pool may have been cleared while the slot was out
        if index < inner.buffers.len() {
            inner.buffers[index] = buffer;
            inner.in_use[index] = false;
        }
    }
}

/// A borrowed scratch buffer; returned to its pool on drop.
pub struct ScratchSlot<'a> {
    pool: &'a ScratchPool,
    index: usize,
    buffer: Vec<u8>,
}

impl ScratchSlot<'_> {
    pub fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Drop for ScratchSlot<'_> {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.give_back(self.index, buffer);
    }
}
