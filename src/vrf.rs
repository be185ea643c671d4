//! Lane-distributed vector register file access.
//!
//! Each of the `num_lanes` lanes stores a `lane_bytes` slice of every vector
//! register. The slices live in the lane's register window:
//!
//! ```text
//! lane window n
//! ┌────────┬────────┬─────┬─────────┬─────────────┐
//! │ v0[n]  │ v1[n]  │ ... │ v31[n]  │ mask shadow │
//! └────────┴────────┴─────┴─────────┴─────────────┘
//!  offset = reg * lane_width_bits / 8
//! ```
//!
//! Register indices are handed out by a 32-bit allocation bitmap guarded by
//! a spinlock; the critical section is a single test-and-set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::device::capability::{VectorCapability, NUM_VREGS};
use crate::device::io::RegisterIo;
use crate::device::registers::{self, MASK_SLOT};
use crate::error::{VectorError, VectorResult};

/// Counters kept by the VRF manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VrfStats {
    pub allocations: u64,
    pub frees: u64,
    pub lane_accesses: u64,
    pub allocated: u32,
}

/// Register allocator and lane window accessor.
pub struct VrfManager {
    capability: Arc<VectorCapability>,
    lane_bytes: usize,
    /// Window base per lane; `None` when the window is not mapped.
    lane_bases: Vec<Option<u64>>,
    bitmap: spin::Mutex<u32>,
    allocations: AtomicU64,
    frees: AtomicU64,
    lane_accesses: AtomicU64,
}

impl VrfManager {
    /// Map one window per lane.
    ///
    /// Fails with `InvalidConfig` when a register cannot be split evenly
    /// into whole bytes per lane.
    pub fn new(capability: Arc<VectorCapability>) -> VectorResult<Self> {
        capability.validate()?;
        if capability.vlen_bits % (capability.num_lanes * 8) != 0 {
            return Err(VectorError::InvalidConfig(format!(
                "VLEN {} does not split into {} whole-byte lanes",
                capability.vlen_bits, capability.num_lanes
            )));
        }

        let lane_bytes = capability.lane_bytes();
        let lane_bases = (0..capability.num_lanes as usize)
            .map(|lane| Some(registers::lane_window_base(lane, lane_bytes)))
            .collect();

        log::info!(
            "VRF manager: {} lanes x {} bytes, {} registers",
            capability.num_lanes,
            lane_bytes,
            NUM_VREGS
        );

        Ok(Self {
            capability,
            lane_bytes,
            lane_bases,
            bitmap: spin::Mutex::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            lane_accesses: AtomicU64::new(0),
        })
    }

    pub fn capability(&self) -> &VectorCapability {
        &self.capability
    }

    pub fn num_lanes(&self) -> usize {
        self.lane_bases.len()
    }

    /// Bytes of one register held by each lane.
    pub fn lane_bytes(&self) -> usize {
        self.lane_bytes
    }

    /// Claim the lowest free register index.
    pub fn alloc_register(&self) -> VectorResult<u8> {
        let reg = {
            let mut bitmap = self.bitmap.lock();
            let free = (!*bitmap).trailing_zeros();
            if free as usize >= NUM_VREGS {
                return Err(VectorError::NoCapacity("vector register file"));
            }
            *bitmap |= 1 << free;
            free as u8
        };

        self.allocations.fetch_add(1, Ordering::Relaxed);
        log::debug!("VRF: allocated v{}", reg);
        Ok(reg)
    }

    /// Return a register index to the pool.
    pub fn free_register(&self, reg: u8) -> VectorResult<()> {
        Self::check_reg(reg as usize)?;

        let was_set = {
            let mut bitmap = self.bitmap.lock();
            let bit = 1u32 << reg;
            let was_set = *bitmap & bit != 0;
            *bitmap &= !bit;
            was_set
        };

        if !was_set {
            return Err(VectorError::InvalidState(format!("v{} is not allocated", reg)));
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
        log::debug!("VRF: freed v{}", reg);
        Ok(())
    }

    pub fn is_allocated(&self, reg: u8) -> bool {
        (reg as usize) < NUM_VREGS && *self.bitmap.lock() & (1 << reg) != 0
    }

    /// Read one lane's slice of register `reg` into `buffer`.
    pub fn read_lane(&self, io: &dyn RegisterIo, reg: usize, lane: usize, buffer: &mut [u8]) -> VectorResult<()> {
        Self::check_reg(reg)?;
        let offset = self.slot_offset(reg, lane, buffer.len())?;
        io.copy_from_io(offset, buffer)?;
        self.lane_accesses.fetch_add(1, Ordering::Relaxed);
        log::trace!("VRF: read v{} lane {} ({} bytes)", reg, lane, buffer.len());
        Ok(())
    }

    /// Write one lane's slice of register `reg` from `data`.
    pub fn write_lane(&self, io: &dyn RegisterIo, reg: usize, lane: usize, data: &[u8]) -> VectorResult<()> {
        Self::check_reg(reg)?;
        let offset = self.slot_offset(reg, lane, data.len())?;
        io.copy_to_io(offset, data)?;
        self.lane_accesses.fetch_add(1, Ordering::Relaxed);
        log::trace!("VRF: wrote v{} lane {} ({} bytes)", reg, lane, data.len());
        Ok(())
    }

    /// Read one lane's slice of the mask shadow.
    pub(crate) fn read_mask_lane(&self, io: &dyn RegisterIo, lane: usize, buffer: &mut [u8]) -> VectorResult<()> {
        let offset = self.slot_offset(MASK_SLOT, lane, buffer.len())?;
        io.copy_from_io(offset, buffer)?;
        self.lane_accesses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write one lane's slice of the mask shadow.
    pub(crate) fn write_mask_lane(&self, io: &dyn RegisterIo, lane: usize, data: &[u8]) -> VectorResult<()> {
        let offset = self.slot_offset(MASK_SLOT, lane, data.len())?;
        io.copy_to_io(offset, data)?;
        self.lane_accesses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Point the live register window at another context.
    pub fn bind_context(&self, io: &dyn RegisterIo, context_id: u64) -> VectorResult<()> {
        log::debug!("VRF: binding register window to context {}", context_id);
        io.write64(registers::VRF_BIND, context_id)
    }

    /// Context id the live register window is bound to.
    pub fn bound_context(&self, io: &dyn RegisterIo) -> VectorResult<u64> {
        io.read64(registers::VRF_BIND)
    }

    /// Forget a lane's window mapping.
    pub fn unmap_lane(&mut self, lane: usize) {
        if let Some(base) = self.lane_bases.get_mut(lane) {
            *base = None;
        }
    }

    pub fn stats(&self) -> VrfStats {
        VrfStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            lane_accesses: self.lane_accesses.load(Ordering::Relaxed),
            allocated: self.bitmap.lock().count_ones(),
        }
    }

    fn check_reg(reg: usize) -> VectorResult<()> {
        if reg >= NUM_VREGS {
            return Err(VectorError::OutOfRange(format!("register v{} >= {}", reg, NUM_VREGS)));
        }
        Ok(())
    }

    fn slot_offset(&self, slot: usize, lane: usize, len: usize) -> VectorResult<u64> {
        if lane >= self.lane_bases.len() {
            return Err(VectorError::OutOfRange(format!(
                "lane {} >= {}",
                lane,
                self.lane_bases.len()
            )));
        }
        if len > self.lane_bytes {
            return Err(VectorError::OutOfRange(format!(
                "{} byte transfer exceeds {} byte lane slice",
                len, self.lane_bytes
            )));
        }
        let base = self.lane_bases[lane]
            .ok_or_else(|| VectorError::DeviceUnavailable(format!("lane {} window not mapped", lane)))?;

        let lane_width_bytes = (self.capability.lane_width_bits() / 8) as u64;
        Ok(base + slot as u64 * lane_width_bytes)
    }
}

impl std::fmt::Debug for VrfManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrfManager")
            .field("lanes", &self.lane_bases.len())
            .field("lane_bytes", &self.lane_bytes)
            .field("bitmap", &format_args!("{:#010x}", *self.bitmap.lock()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimulatedDevice;

    fn setup() -> (SimulatedDevice, VrfManager) {
        let cap = VectorCapability::new(1024, 64, 4).unwrap();
        let sim = SimulatedDevice::new(cap.clone());
        let vrf = VrfManager::new(Arc::new(cap)).unwrap();
        (sim, vrf)
    }

    #[test]
    fn test_exhaust_then_free() {
        let (_sim, vrf) = setup();

        for expected in 0..32u8 {
            assert_eq!(vrf.alloc_register().unwrap(), expected);
        }
        assert_eq!(vrf.alloc_register(), Err(VectorError::NoCapacity("vector register file")));

        vrf.free_register(17).unwrap();
        assert!(!vrf.is_allocated(17));
        assert_eq!(vrf.alloc_register().unwrap(), 17);

        let stats = vrf.stats();
        assert_eq!(stats.allocations, 33);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.allocated, 32);
    }

    #[test]
    fn test_free_errors() {
        let (_sim, vrf) = setup();
        assert!(matches!(vrf.free_register(32), Err(VectorError::OutOfRange(_))));
        assert!(matches!(vrf.free_register(3), Err(VectorError::InvalidState(_))));
    }

    #[test]
    fn test_lane_round_trip() {
        let (sim, vrf) = setup();
        assert_eq!(vrf.lane_bytes(), 32);

        let data: Vec<u8> = (0..32).collect();
        vrf.write_lane(&sim, 5, 2, &data).unwrap();

        let mut out = vec![0u8; 32];
        vrf.read_lane(&sim, 5, 2, &mut out).unwrap();
        assert_eq!(out, data);

        // Neighbouring register and lane are untouched
        vrf.read_lane(&sim, 6, 2, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        vrf.read_lane(&sim, 5, 1, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));

        // One write and three reads
        assert_eq!(vrf.stats().lane_accesses, 4);
    }

    #[test]
    fn test_lane_offsets() {
        let (sim, vrf) = setup();
        vrf.write_lane(&sim, 3, 0, &[0xAB]).unwrap();

        // reg * lane_width_bits / 8 from the lane base
        let offset = registers::lane_window_base(0, 32) + 3 * 32;
        assert_eq!(sim.read32(offset).unwrap() & 0xFF, 0xAB);
    }

    #[test]
    fn test_lane_errors() {
        let (sim, mut vrf) = setup();
        let mut buf = [0u8; 4];

        assert!(matches!(vrf.read_lane(&sim, 32, 0, &mut buf), Err(VectorError::OutOfRange(_))));
        assert!(matches!(vrf.read_lane(&sim, 0, 4, &mut buf), Err(VectorError::OutOfRange(_))));
        assert!(matches!(vrf.read_lane(&sim, 0, 0, &mut [0u8; 33]), Err(VectorError::OutOfRange(_))));

        vrf.unmap_lane(1);
        assert!(matches!(vrf.write_lane(&sim, 0, 1, &buf), Err(VectorError::DeviceUnavailable(_))));
        assert!(vrf.write_lane(&sim, 0, 0, &buf).is_ok());
    }

    #[test]
    fn test_uneven_lanes_rejected() {
        let cap = VectorCapability::new(1024, 64, 3).unwrap();
        assert!(matches!(VrfManager::new(Arc::new(cap)), Err(VectorError::InvalidConfig(_))));
    }

    #[test]
    fn test_bind_context() {
        let (sim, vrf) = setup();
        vrf.bind_context(&sim, 7).unwrap();
        assert_eq!(vrf.bound_context(&sim).unwrap(), 7);

        vrf.bind_context(&sim, 0x1_0000_0002).unwrap();
        assert_eq!(vrf.bound_context(&sim).unwrap(), 0x1_0000_0002);
    }

    #[test]
    fn test_concurrent_allocation() {
        let (_sim, vrf) = setup();
        let vrf = Arc::new(vrf);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let vrf = Arc::clone(&vrf);
                std::thread::spawn(move || (0..8).map(|_| vrf.alloc_register().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u8> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..32).collect::<Vec<u8>>());
    }
}
