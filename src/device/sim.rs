//! Simulated vector unit for tests, demos and bring-up without hardware.
//!
//! [`SimulatedDevice`] implements both collaborator traits:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ SimulatedDevice                              │
//! │  ┌───────────────┐   ┌────────────────────┐  │
//! │  │ register space│   │ device memory      │  │
//! │  │ (PageStore)   │   │ (PageStore)        │  │
//! │  │  memop blocks │   │  vector data       │  │
//! │  │  VRF bind     │◄──┤  DMA arena         │  │
//! │  ├───────────────┤   │  (0x8000_0000..)   │  │
//! │  │ window banks  │   └────────────────────┘  │
//! │  │  CSR window   │                           │
//! │  │  lane windows │                           │
//! │  └───────────────┘                           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The CSR window and the lane windows are banked: every value written to
//! the VRF bind register selects its own bank, created at reset values the
//! first time it is bound. Bank 0 is live out of reset.
//!
//! Writing the start bit of a memory-operation block performs the whole
//! transfer synchronously between device memory and the staging buffer,
//! then latches the status register. Faults can be injected to exercise the
//! error paths (failing register I/O, failing DMA allocation, a latched
//! hardware error, or an operation that never completes).
//!
//! # Usage
//!
//! ```
//! use rvv_runtime::device::{SimulatedDevice, VectorCapability};
//!
//! let cap = VectorCapability::new(1024, 64, 4).unwrap();
//! let sim = SimulatedDevice::new(cap);
//!
//! sim.write_memory(0x1000, &[1, 2, 3, 4]);
//! let mut out = [0u8; 4];
//! sim.read_memory(0x1000, &mut out);
//! assert_eq!(out, [1, 2, 3, 4]);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};

use super::capability::VectorCapability;
use super::io::{DmaAllocator, DmaBuffer, RegisterIo};
use super::registers::{self, csr, memop, RegisterRegion};
use crate::error::{VectorError, VectorResult};

/// Sparse byte-addressed storage in 4 KiB pages.
///
/// Unwritten bytes read as zero.
#[derive(Default)]
pub struct PageStore {
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,
    total_bytes_written: u64,
    total_bytes_read: u64,
}

impl PageStore {
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    pub fn new() -> Self {
        Self::default()
    }

    fn page_mut(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        self.pages
            .entry(addr & Self::PAGE_MASK)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    fn page(&self, addr: u64) -> Option<&[u8; Self::PAGE_SIZE]> {
        self.pages.get(&(addr & Self::PAGE_MASK)).map(|b| b.as_ref())
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        let mut current = addr;
        let mut remaining = data;

        while !remaining.is_empty() {
            let offset = (current & !Self::PAGE_MASK) as usize;
            let chunk = remaining.len().min(Self::PAGE_SIZE - offset);

            self.page_mut(current)[offset..offset + chunk].copy_from_slice(&remaining[..chunk]);

            current += chunk as u64;
            remaining = &remaining[chunk..];
        }

        self.total_bytes_written += data.len() as u64;
    }

    pub fn read_bytes(&mut self, addr: u64, buf: &mut [u8]) {
        self.peek_bytes(addr, buf);
        self.total_bytes_read += buf.len() as u64;
    }

    /// Read without touching the statistics.
    pub fn peek_bytes(&self, addr: u64, buf: &mut [u8]) {
        let mut current = addr;
        let mut filled = 0;

        while filled < buf.len() {
            let offset = (current & !Self::PAGE_MASK) as usize;
            let chunk = (buf.len() - filled).min(Self::PAGE_SIZE - offset);
            let dst = &mut buf[filled..filled + chunk];

            match self.page(current) {
                Some(page) => dst.copy_from_slice(&page[offset..offset + chunk]),
                None => dst.fill(0),
            }

            current += chunk as u64;
            filled += chunk;
        }
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_bytes(addr, &buf);
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        LittleEndian::read_u32(&buf)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write_bytes(addr, &buf);
    }

    pub fn read_u64(&mut self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf);
        LittleEndian::read_u64(&buf)
    }

    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }

    /// Hexdump a range for debugging.
    pub fn hexdump(&self, addr: u64, len: usize) -> String {
        let mut buf = vec![0u8; len];
        self.peek_bytes(addr, &mut buf);

        let mut result = String::new();
        for (i, chunk) in buf.chunks(16).enumerate() {
            let line_addr = addr + (i * 16) as u64;
            result.push_str(&format!("{:016x}: ", line_addr));

            for (j, byte) in chunk.iter().enumerate() {
                result.push_str(&format!("{:02x} ", byte));
                if j == 7 {
                    result.push(' ');
                }
            }
            for j in chunk.len()..16 {
                result.push_str("   ");
                if j == 7 {
                    result.push(' ');
                }
            }

            result.push_str(" |");
            for byte in chunk {
                let c = if byte.is_ascii_graphic() || *byte == b' ' { *byte as char } else { '.' };
                result.push(c);
            }
            result.push_str("|\n");
        }
        result
    }
}

/// Faults the simulated device will inject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimFaults {
    /// Register accesses within this 8-byte slot fail with `Io`.
    pub failing_offset: Option<u64>,
    /// Every DMA allocation fails with `OutOfMemory`.
    pub fail_dma_alloc: bool,
    /// Memory operations latch the error bit instead of completing.
    pub memop_error: bool,
    /// Memory operations never complete.
    pub memop_hang: bool,
}

/// Counters kept by the simulated device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub dma_allocs: u64,
    pub dma_frees: u64,
    pub memops_started: u64,
    pub register_reads: u64,
    pub register_writes: u64,
}

impl SimStats {
    /// Staging buffers allocated and not yet freed.
    pub fn live_dma_buffers(&self) -> u64 {
        self.dma_allocs - self.dma_frees
    }
}

/// Base of the coherent DMA arena in device memory.
pub const DMA_ARENA_BASE: u64 = 0x8000_0000;

/// Reset value of VTYPE: `vill` set.
const VTYPE_RESET: u64 = 1 << 63;

struct SimState {
    regs: PageStore,
    /// CSR and lane storage per VRF bind value.
    banks: BTreeMap<u64, PageStore>,
    memory: PageStore,
    /// Live DMA buffers: device address -> length.
    dma_buffers: BTreeMap<u64, usize>,
    next_dma: u64,
    faults: SimFaults,
}

/// In-memory model of a vector unit.
pub struct SimulatedDevice {
    capability: Option<VectorCapability>,
    state: Mutex<SimState>,
    dma_allocs: AtomicU64,
    dma_frees: AtomicU64,
    memops_started: AtomicU64,
    register_reads: AtomicU64,
    register_writes: AtomicU64,
}

impl SimulatedDevice {
    /// A device with a vector unit described by `capability`.
    pub fn new(capability: VectorCapability) -> Self {
        Self::build(Some(capability))
    }

    /// A device whose feature register does not advertise a vector unit.
    pub fn without_vector_unit() -> Self {
        Self::build(None)
    }

    fn build(capability: Option<VectorCapability>) -> Self {
        Self {
            capability,
            state: Mutex::new(SimState {
                regs: PageStore::new(),
                banks: BTreeMap::new(),
                memory: PageStore::new(),
                dma_buffers: BTreeMap::new(),
                next_dma: DMA_ARENA_BASE,
                faults: SimFaults::default(),
            }),
            dma_allocs: AtomicU64::new(0),
            dma_frees: AtomicU64::new(0),
            memops_started: AtomicU64::new(0),
            register_reads: AtomicU64::new(0),
            register_writes: AtomicU64::new(0),
        }
    }

    pub fn capability(&self) -> Option<&VectorCapability> {
        self.capability.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge every other accessor.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.lock().faults = faults;
    }

    pub fn clear_faults(&self) {
        self.lock().faults = SimFaults::default();
    }

    pub fn faults(&self) -> SimFaults {
        self.lock().faults.clone()
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            dma_allocs: self.dma_allocs.load(Ordering::Relaxed),
            dma_frees: self.dma_frees.load(Ordering::Relaxed),
            memops_started: self.memops_started.load(Ordering::Relaxed),
            register_reads: self.register_reads.load(Ordering::Relaxed),
            register_writes: self.register_writes.load(Ordering::Relaxed),
        }
    }

    /// Write device memory directly (test setup).
    pub fn write_memory(&self, addr: u64, data: &[u8]) {
        self.lock().memory.write_bytes(addr, data);
    }

    /// Read device memory directly (test inspection).
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) {
        self.lock().memory.peek_bytes(addr, buf);
    }

    pub fn memory_hexdump(&self, addr: u64, len: usize) -> String {
        self.lock().memory.hexdump(addr, len)
    }

    /// Hexdump register space; CSR and lane offsets show the bound bank.
    pub fn register_hexdump(&self, offset: u64, len: usize) -> String {
        let mut state = self.lock();
        match RegisterRegion::from_offset(offset) {
            RegisterRegion::Csr(_) | RegisterRegion::Lane(_) => state.bank().hexdump(offset, len),
            _ => state.regs.hexdump(offset, len),
        }
    }

    /// Number of register banks touched so far.
    pub fn bank_count(&self) -> usize {
        self.lock().banks.len()
    }

    fn check_fault(state: &SimState, offset: u64) -> VectorResult<()> {
        match state.faults.failing_offset {
            Some(bad) if offset & !7 == bad & !7 => Err(VectorError::Io {
                offset,
                reason: "injected fault".into(),
            }),
            _ => Ok(()),
        }
    }

    fn read_global(&self, offset: u64) -> u32 {
        match (offset, &self.capability) {
            (registers::FEATURES, Some(_)) => registers::FEATURE_RVV,
            (registers::RVV_CONFIG, Some(cap)) => cap.config_register().unwrap_or(0),
            _ => 0,
        }
    }

    /// Run the transfer programmed in a memory-op block.
    fn run_memop(state: &mut SimState, block: u64) -> u32 {
        if state.faults.memop_hang {
            log::trace!("sim: memop at block 0x{:X} hangs", block);
            return 0;
        }
        if state.faults.memop_error {
            return memop::STATUS_ERROR;
        }

        let reg = |off: u64| registers::VPU_BASE + block + off;
        let base = state.regs.read_u64(reg(memop::BASE));
        let aux = state.regs.read_u64(reg(memop::AUX));
        let count = state.regs.read_u32(reg(memop::COUNT)) as u64;
        let size = state.regs.read_u32(reg(memop::SIZE)) as u64;
        let dma = state.regs.read_u64(reg(memop::DMA));
        let ctrl = state.regs.read_u32(reg(memop::CTRL));

        let load = ctrl & memop::CTRL_LOAD != 0;
        let mode = (ctrl & memop::CTRL_MODE_MASK) >> memop::CTRL_MODE_SHIFT;

        // (memory address, staging offset, length) for every piece
        let mut pieces: Vec<(u64, u64, u64)> = Vec::new();
        match mode {
            0 => pieces.push((base, 0, count * size)),
            1 => {
                for i in 0..count {
                    pieces.push((base + i * aux, i * aux, size));
                }
            }
            2 => {
                for i in 0..count {
                    let index = state.memory.read_u64(aux + i * 8);
                    pieces.push((base.wrapping_add(index), i * size, size));
                }
            }
            _ => {
                let fields = aux.max(1);
                if size % fields != 0 {
                    return memop::STATUS_ERROR;
                }
                let field_bytes = size / fields;
                for i in 0..count {
                    for f in 0..fields {
                        pieces.push((
                            base + i * size + f * field_bytes,
                            f * count * field_bytes + i * field_bytes,
                            field_bytes,
                        ));
                    }
                }
            }
        }

        let staging_len = state.dma_buffers.get(&dma).copied();
        let Some(staging_len) = staging_len else {
            log::trace!("sim: memop DMA address 0x{:X} is not a live buffer", dma);
            return memop::STATUS_ERROR;
        };

        let mut scratch = Vec::new();
        for (mem_addr, stage_off, len) in pieces {
            if stage_off + len > staging_len as u64 {
                return memop::STATUS_ERROR;
            }
            scratch.resize(len as usize, 0);
            if load {
                state.memory.read_bytes(mem_addr, &mut scratch);
                state.memory.write_bytes(dma + stage_off, &scratch);
            } else {
                state.memory.read_bytes(dma + stage_off, &mut scratch);
                state.memory.write_bytes(mem_addr, &scratch);
            }
        }

        memop::STATUS_DONE
    }
}

impl SimState {
    fn bound_bank(&self) -> u64 {
        let mut raw = [0u8; 8];
        self.regs.peek_bytes(registers::VRF_BIND, &mut raw);
        LittleEndian::read_u64(&raw)
    }

    /// Storage behind the CSR and lane windows for the current binding.
    fn bank(&mut self) -> &mut PageStore {
        let bound = self.bound_bank();
        self.banks.entry(bound).or_insert_with(|| {
            let mut bank = PageStore::new();
            bank.write_u64(registers::csr_offset(csr::VTYPE), VTYPE_RESET);
            bank
        })
    }
}

impl RegisterIo for SimulatedDevice {
    fn read32(&self, offset: u64) -> VectorResult<u32> {
        let mut state = self.lock();
        Self::check_fault(&state, offset)?;
        self.register_reads.fetch_add(1, Ordering::Relaxed);

        match RegisterRegion::from_offset(offset) {
            RegisterRegion::Global => Ok(self.read_global(offset)),
            RegisterRegion::Csr(csr::VLENB) => {
                let vlenb = self.capability.as_ref().map_or(0, |c| c.vlenb);
                // Upper half of the 64-bit slot is zero
                Ok(if offset & 4 == 0 { vlenb } else { 0 })
            }
            RegisterRegion::Unknown => Err(VectorError::Io {
                offset,
                reason: "unmapped register".into(),
            }),
            RegisterRegion::Csr(_) | RegisterRegion::Lane(_) => Ok(state.bank().read_u32(offset)),
            _ => Ok(state.regs.read_u32(offset)),
        }
    }

    fn write32(&self, offset: u64, value: u32) -> VectorResult<()> {
        let mut state = self.lock();
        Self::check_fault(&state, offset)?;
        self.register_writes.fetch_add(1, Ordering::Relaxed);

        match RegisterRegion::from_offset(offset) {
            // Read-only
            RegisterRegion::Global | RegisterRegion::Csr(csr::VLENB) => Ok(()),
            RegisterRegion::Unknown => Err(VectorError::Io {
                offset,
                reason: "unmapped register".into(),
            }),
            RegisterRegion::MemOp(rel)
                if rel >= memop::UNIT_BLOCK
                    && rel < memop::STATUS
                    && (rel - memop::UNIT_BLOCK) % memop::BLOCK_SIZE == memop::START =>
            {
                if value & memop::START_BIT != 0 {
                    let block = rel - memop::START;
                    self.memops_started.fetch_add(1, Ordering::Relaxed);
                    let status_reg = registers::VPU_BASE + memop::STATUS;
                    state.regs.write_u32(status_reg, 0);
                    let status = Self::run_memop(&mut state, block);
                    log::trace!("sim: memop block 0x{:X} -> status 0x{:X}", block, status);
                    state.regs.write_u32(status_reg, status);
                }
                Ok(())
            }
            RegisterRegion::Csr(_) | RegisterRegion::Lane(_) => {
                state.bank().write_u32(offset, value);
                Ok(())
            }
            _ => {
                state.regs.write_u32(offset, value);
                Ok(())
            }
        }
    }
}

impl DmaAllocator for SimulatedDevice {
    fn alloc_coherent(&self, size: usize) -> VectorResult<DmaBuffer> {
        let mut state = self.lock();
        if state.faults.fail_dma_alloc {
            return Err(VectorError::oom(size));
        }

        let addr = state.next_dma;
        // Keep buffers page aligned and never reuse an address
        let span = (size.max(1) as u64 + 0xFFF) & !0xFFF;
        state.next_dma += span;
        state.dma_buffers.insert(addr, size);
        self.dma_allocs.fetch_add(1, Ordering::Relaxed);

        log::trace!("sim: DMA alloc {} bytes @ 0x{:X}", size, addr);
        Ok(DmaBuffer::new(addr, addr, size))
    }

    fn free_coherent(&self, buffer: DmaBuffer) {
        let mut state = self.lock();
        if state.dma_buffers.remove(&buffer.device_addr()).is_some() {
            self.dma_frees.fetch_add(1, Ordering::Relaxed);
        } else {
            log::warn!("sim: free of unknown DMA buffer @ 0x{:X}", buffer.device_addr());
        }
    }

    fn write_coherent(&self, buffer: &DmaBuffer, offset: usize, data: &[u8]) -> VectorResult<()> {
        let mut state = self.lock();
        Self::check_dma_range(&state, buffer, offset, data.len())?;
        state.memory.write_bytes(buffer.device_addr() + offset as u64, data);
        Ok(())
    }

    fn read_coherent(&self, buffer: &DmaBuffer, offset: usize, out: &mut [u8]) -> VectorResult<()> {
        let mut state = self.lock();
        Self::check_dma_range(&state, buffer, offset, out.len())?;
        state.memory.read_bytes(buffer.device_addr() + offset as u64, out);
        Ok(())
    }
}

impl SimulatedDevice {
    fn check_dma_range(state: &SimState, buffer: &DmaBuffer, offset: usize, len: usize) -> VectorResult<()> {
        let Some(&live_len) = state.dma_buffers.get(&buffer.device_addr()) else {
            return Err(VectorError::InvalidState(format!(
                "DMA buffer @ 0x{:X} is not live",
                buffer.device_addr()
            )));
        };
        if offset.checked_add(len).map_or(true, |end| end > live_len) {
            return Err(VectorError::OutOfRange(format!(
                "DMA access {}+{} beyond {} byte buffer",
                offset, len, live_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SimulatedDevice {
        SimulatedDevice::new(VectorCapability::new(1024, 64, 4).unwrap())
    }

    #[test]
    fn test_page_store_cross_page() {
        let mut store = PageStore::new();
        let data: Vec<u8> = (0..32).collect();

        // Straddle a page boundary
        store.write_bytes(0x0FF0, &data);
        assert_eq!(store.allocated_pages(), 2);

        let mut out = vec![0u8; 32];
        store.read_bytes(0x0FF0, &mut out);
        assert_eq!(out, data);

        // Unwritten memory reads as zero
        assert_eq!(store.read_u32(0x10_0000), 0);
        assert_eq!(store.total_bytes_written(), 32);
    }

    #[test]
    fn test_page_store_words() {
        let mut store = PageStore::new();
        store.write_u64(0x100, 0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(store.read_u32(0x100), 0xCAFE_BABE);
        assert_eq!(store.read_u32(0x104), 0xDEAD_BEEF);
        assert_eq!(store.read_u64(0x100), 0xDEAD_BEEF_CAFE_BABE);
    }

    #[test]
    fn test_hexdump() {
        let mut store = PageStore::new();
        store.write_bytes(0x1000, b"Hello, World!");

        let dump = store.hexdump(0x1000, 16);
        assert!(dump.contains("48 65 6c 6c"));
        assert!(dump.contains("|Hello, World!"));
    }

    #[test]
    fn test_identification_registers() {
        let sim = sim();
        assert_eq!(sim.read32(registers::FEATURES).unwrap(), registers::FEATURE_RVV);

        let reg = sim.read32(registers::RVV_CONFIG).unwrap();
        let cap = VectorCapability::from_config_register(reg).unwrap();
        assert_eq!(cap.vlen_bits, 1024);
        assert_eq!(cap.num_lanes, 4);

        let bare = SimulatedDevice::without_vector_unit();
        assert_eq!(bare.read32(registers::FEATURES).unwrap(), 0);
    }

    #[test]
    fn test_csr_window_reset_and_read_only_vlenb() {
        let sim = sim();
        assert_eq!(sim.read64(registers::csr_offset(csr::VTYPE)).unwrap(), 1 << 63);
        assert_eq!(sim.read64(registers::csr_offset(csr::VLENB)).unwrap(), 128);

        sim.write64(registers::csr_offset(csr::VLENB), 7).unwrap();
        assert_eq!(sim.read64(registers::csr_offset(csr::VLENB)).unwrap(), 128);

        sim.write64(registers::csr_offset(csr::VL), 42).unwrap();
        assert_eq!(sim.read64(registers::csr_offset(csr::VL)).unwrap(), 42);
    }

    #[test]
    fn test_unmapped_and_injected_faults() {
        let sim = sim();
        assert!(matches!(sim.read32(0x4000), Err(VectorError::Io { .. })));

        let vl = registers::csr_offset(csr::VL);
        sim.set_faults(SimFaults { failing_offset: Some(vl), ..Default::default() });
        assert!(matches!(sim.read64(vl), Err(VectorError::Io { .. })));
        assert!(sim.read64(registers::csr_offset(csr::VSTART)).is_ok());

        sim.clear_faults();
        assert!(sim.read64(vl).is_ok());
    }

    #[test]
    fn test_register_windows_are_banked_by_binding() {
        let sim = sim();
        let vl = registers::csr_offset(csr::VL);
        let lane = registers::lane_window_base(1, 32);

        sim.write64(vl, 9).unwrap();
        sim.write32(lane, 0xAAAA_AAAA).unwrap();

        // A fresh bank comes up at reset values
        sim.write64(registers::VRF_BIND, 3).unwrap();
        assert_eq!(sim.read64(vl).unwrap(), 0);
        assert_eq!(sim.read64(registers::csr_offset(csr::VTYPE)).unwrap(), 1 << 63);
        assert_eq!(sim.read64(registers::csr_offset(csr::VLENB)).unwrap(), 128);
        assert_eq!(sim.read32(lane).unwrap(), 0);
        sim.write64(vl, 77).unwrap();

        sim.write64(registers::VRF_BIND, 0).unwrap();
        assert_eq!(sim.read64(vl).unwrap(), 9);
        assert_eq!(sim.read32(lane).unwrap(), 0xAAAA_AAAA);

        sim.write64(registers::VRF_BIND, 3).unwrap();
        assert_eq!(sim.read64(vl).unwrap(), 77);
        assert_eq!(sim.bank_count(), 2);
    }

    #[test]
    fn test_dma_accounting() {
        let sim = sim();
        let a = sim.alloc_coherent(100).unwrap();
        let b = sim.alloc_coherent(5000).unwrap();
        assert_ne!(a.device_addr(), b.device_addr());
        assert_eq!(sim.stats().live_dma_buffers(), 2);

        sim.write_coherent(&a, 0, &[9; 100]).unwrap();
        assert!(matches!(sim.write_coherent(&a, 90, &[0; 20]), Err(VectorError::OutOfRange(_))));

        sim.free_coherent(a);
        sim.free_coherent(b);
        assert_eq!(sim.stats().live_dma_buffers(), 0);

        sim.set_faults(SimFaults { fail_dma_alloc: true, ..Default::default() });
        assert_eq!(sim.alloc_coherent(8), Err(VectorError::OutOfMemory { bytes: 8 }));
    }

    #[test]
    fn test_unit_stride_load() {
        let sim = sim();
        sim.write_memory(0x4000, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let staging = sim.alloc_coherent(8).unwrap();

        let block = registers::VPU_BASE + memop::UNIT_BLOCK;
        sim.write64(block + memop::BASE, 0x4000).unwrap();
        sim.write32(block + memop::COUNT, 2).unwrap();
        sim.write32(block + memop::SIZE, 4).unwrap();
        sim.write64(block + memop::DMA, staging.device_addr()).unwrap();
        sim.write32(block + memop::CTRL, memop::CTRL_LOAD).unwrap();
        sim.write32(block + memop::START, memop::START_BIT).unwrap();

        let status = sim.read32(registers::VPU_BASE + memop::STATUS).unwrap();
        assert_eq!(status, memop::STATUS_DONE);

        let mut out = [0u8; 8];
        sim.read_coherent(&staging, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(sim.stats().memops_started, 1);
    }

    #[test]
    fn test_memop_error_and_hang() {
        let sim = sim();
        let start = registers::VPU_BASE + memop::UNIT_BLOCK + memop::START;
        let status = registers::VPU_BASE + memop::STATUS;

        sim.set_faults(SimFaults { memop_error: true, ..Default::default() });
        sim.write32(start, memop::START_BIT).unwrap();
        assert_eq!(sim.read32(status).unwrap(), memop::STATUS_ERROR);

        sim.set_faults(SimFaults { memop_hang: true, ..Default::default() });
        sim.write32(start, memop::START_BIT).unwrap();
        assert_eq!(sim.read32(status).unwrap(), 0);
    }
}
