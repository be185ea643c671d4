//! Programming a memory-op block and waiting for it to finish.
//!
//! # Sequence
//!
//! ```text
//! validate ──► alloc staging ──► (store) fill staging
//!                 │
//!                 ├─► (indexed) alloc + fill index buffer
//!                 ▼
//!           program block ──► START ──► (indexed) free index buffer
//!                                  │
//!                                  ▼
//!                       poll STATUS until DONE / ERROR / deadline / cancel
//!                                  │
//!                                  ▼
//!                        (load) copy staging into payload
//! ```
//!
//! The staging buffer is owned by a [`DmaGuard`], so it is returned to the
//! allocator on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use super::op::{Direction, Layout, VectorMemoryOp};
use crate::config::DEFAULT_MEMOP_TIMEOUT_MS;
use crate::device::capability::VectorCapability;
use crate::device::io::{DmaAllocator, DmaGuard, RegisterIo};
use crate::device::registers::{memop, VPU_BASE};
use crate::error::{VectorError, VectorResult};

/// Completion-polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Deadline measured from kick-off.
    pub timeout: Duration,
    /// Sleep between polls; zero only yields.
    pub poll_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_MEMOP_TIMEOUT_MS),
            poll_interval: Duration::ZERO,
        }
    }
}

/// Shared flag that aborts an in-progress wait.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// Staging-buffer bytes.
    pub bytes: usize,
    /// Status reads until completion.
    pub polls: u32,
    pub elapsed: Duration,
}

/// Device accessors a memory operation runs against.
#[derive(Clone, Copy)]
pub struct MemoryPort<'a> {
    pub io: &'a dyn RegisterIo,
    pub dma: &'a dyn DmaAllocator,
    /// `None` when the device has no vector unit.
    pub capability: Option<&'a VectorCapability>,
    pub poll: PollConfig,
    pub cancel: Option<&'a CancelToken>,
}

impl<'a> MemoryPort<'a> {
    pub fn new(io: &'a dyn RegisterIo, dma: &'a dyn DmaAllocator, capability: Option<&'a VectorCapability>) -> Self {
        Self { io, dma, capability, poll: PollConfig::default(), cancel: None }
    }

    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl VectorMemoryOp {
    /// Run the transfer and block until the device reports completion.
    pub fn execute(&mut self, port: &MemoryPort<'_>) -> VectorResult<TransferReport> {
        if port.capability.is_none() {
            return Err(VectorError::DeviceUnavailable("no vector unit for memory operation".into()));
        }
        self.validate()?;

        let bytes = self.transfer_size()?;
        let staging = DmaGuard::alloc(port.dma, bytes)?;

        if self.direction == Direction::Store && !self.payload().is_empty() {
            staging.write(0, self.payload())?;
        }

        let index_buffer = match &self.layout {
            Layout::Indexed { indices } => Some(stage_indices(port.dma, indices)?),
            _ => None,
        };

        let aux = match (&self.layout, &index_buffer) {
            (Layout::Strided { stride }, _) => *stride,
            (Layout::Indexed { .. }, Some(guard)) => guard.device_addr(),
            (Layout::Segment { fields }, _) => *fields as u64,
            _ => 0,
        };

        let block = VPU_BASE + memop::block(self.mode().code());
        let mut ctrl = self.mode().code() << memop::CTRL_MODE_SHIFT;
        if self.direction == Direction::Load {
            ctrl |= memop::CTRL_LOAD;
        }

        log::debug!(
            "Memory op {} via block 0x{:X}, staging 0x{:X} ({} bytes)",
            self,
            block,
            staging.device_addr(),
            bytes
        );

        port.io.write64(block + memop::BASE, self.base)?;
        port.io.write64(block + memop::AUX, aux)?;
        port.io.write32(block + memop::COUNT, self.elements)?;
        port.io.write32(block + memop::SIZE, self.element_size)?;
        port.io.write64(block + memop::DMA, staging.device_addr())?;
        port.io.write32(block + memop::CTRL, ctrl)?;

        let start = Instant::now();
        port.io.write32(block + memop::START, memop::START_BIT)?;

        // The device has consumed the index list once started
        if let Some(guard) = index_buffer {
            guard.release();
        }

        let polls = wait_for_completion(port, start)?;

        if self.direction == Direction::Load {
            let payload = self.payload_mut();
            payload.clear();
            payload.try_reserve_exact(bytes).map_err(|_| VectorError::oom(bytes))?;
            payload.resize(bytes, 0);
            staging.read(0, payload)?;
        }

        let report = TransferReport { bytes, polls, elapsed: start.elapsed() };
        log::debug!("Memory op completed after {} polls in {:?}", polls, report.elapsed);
        Ok(report)
    }
}

/// Copy the index list into its own DMA buffer as little-endian u64s.
fn stage_indices<'a>(dma: &'a dyn DmaAllocator, indices: &[u64]) -> VectorResult<DmaGuard<'a>> {
    let bytes = indices.len() * 8;
    let mut raw = Vec::new();
    raw.try_reserve_exact(bytes).map_err(|_| VectorError::oom(bytes))?;
    raw.resize(bytes, 0);
    LittleEndian::write_u64_into(indices, &mut raw);

    let guard = DmaGuard::alloc(dma, bytes)?;
    guard.write(0, &raw)?;
    Ok(guard)
}

/// Poll STATUS until DONE or ERROR, the deadline, or cancellation.
fn wait_for_completion(port: &MemoryPort<'_>, start: Instant) -> VectorResult<u32> {
    let status_reg = VPU_BASE + memop::STATUS;
    let mut polls = 0u32;

    loop {
        let status = port.io.read32(status_reg)?;
        polls = polls.saturating_add(1);
        log::trace!("Memory op status 0x{:X} (poll {})", status, polls);

        if status & memop::STATUS_ERROR != 0 {
            log::error!("Memory op failed with status 0x{:X}", status);
            return Err(VectorError::Hardware { status });
        }
        if status & memop::STATUS_DONE != 0 {
            return Ok(polls);
        }

        let waited = start.elapsed();
        let waited_ms = waited.as_millis() as u64;
        if port.cancel.map_or(false, CancelToken::is_cancelled) {
            log::warn!("Memory op wait cancelled after {} ms", waited_ms);
            return Err(VectorError::Timeout { waited_ms, cancelled: true });
        }
        if waited >= port.poll.timeout {
            log::error!("Memory op timed out after {} ms ({} polls)", waited_ms, polls);
            return Err(VectorError::Timeout { waited_ms, cancelled: false });
        }

        std::hint::spin_loop();
        if port.poll.poll_interval.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(port.poll.poll_interval);
        }
    }
}
