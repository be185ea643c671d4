//! Saved vector register file contents.
//!
//! Holds a byte image of v0..v31 (`vlenb * 32` bytes) and of the mask
//! register (`vlenb` bytes). The image moves through three states:
//!
//! ```text
//! unallocated --allocate()--> allocated --save()--> saved
//!      ^                                              |
//!      +--------------- release() to zero ------------+
//! ```
//!
//! The buffers are plain `Vec`s, so dropping the owner frees them even if
//! `release` is never called.

use std::fmt;
use std::time::Instant;

use crate::device::capability::{VectorCapability, NUM_VREGS};
use crate::device::io::RegisterIo;
use crate::error::{VectorError, VectorResult};
use crate::vrf::VrfManager;

/// Register file image of one context.
#[derive(Default)]
pub struct RegisterFileState {
    vregs: Vec<u8>,
    vmask: Vec<u8>,
    allocated: bool,
    saved: bool,
    ref_count: u32,
    last_save: Option<Instant>,
}

impl RegisterFileState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size and zero both buffers for `cap`.
    pub fn allocate(&mut self, cap: &VectorCapability) -> VectorResult<()> {
        if self.allocated {
            return Err(VectorError::InvalidState("register file already allocated".into()));
        }

        let vregs = zeroed(cap.vregs_bytes())?;
        let vmask = zeroed(cap.vmask_bytes())?;

        log::debug!(
            "Register file allocated: {} bytes vregs, {} bytes mask",
            vregs.len(),
            vmask.len()
        );

        self.vregs = vregs;
        self.vmask = vmask;
        self.allocated = true;
        self.saved = false;
        self.ref_count = 1;
        Ok(())
    }

    /// Take another reference.
    pub fn retain(&mut self) -> VectorResult<u32> {
        if !self.allocated {
            return Err(VectorError::InvalidState("retain of unallocated register file".into()));
        }
        self.ref_count += 1;
        Ok(self.ref_count)
    }

    /// Drop a reference; the buffers go away with the last one.
    ///
    /// Returns the remaining count.
    pub fn release(&mut self) -> u32 {
        if !self.allocated {
            return 0;
        }
        self.ref_count = self.ref_count.saturating_sub(1);
        if self.ref_count == 0 {
            log::debug!("Register file released ({} bytes)", self.total_bytes());
            *self = Self::default();
        }
        self.ref_count
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn last_save(&self) -> Option<Instant> {
        self.last_save
    }

    pub fn total_bytes(&self) -> usize {
        self.vregs.len() + self.vmask.len()
    }

    pub fn vregs(&self) -> &[u8] {
        &self.vregs
    }

    pub fn vmask(&self) -> &[u8] {
        &self.vmask
    }

    /// Bytes of one register in the saved image.
    pub fn register(&self, reg: usize) -> Option<&[u8]> {
        let vlenb = self.vmask.len();
        self.vregs.get(reg * vlenb..(reg + 1) * vlenb)
    }

    /// Pull every lane slice from hardware.
    ///
    /// Lanes are read into `staging` first and the image is only replaced
    /// once all reads have succeeded.
    pub fn save(
        &mut self,
        io: &dyn RegisterIo,
        vrf: &VrfManager,
        staging: &mut Vec<u8>,
    ) -> VectorResult<()> {
        if !self.allocated {
            return Err(VectorError::InvalidState("save of unallocated register file".into()));
        }

        let started = Instant::now();
        let vregs_len = self.vregs.len();
        let total = self.total_bytes();

        staging.clear();
        staging.try_reserve_exact(total).map_err(|_| VectorError::oom(total))?;
        staging.resize(total, 0);

        let (vregs, vmask) = staging.split_at_mut(vregs_len);
        for_each_slice(vrf, vregs, |reg, lane, slice| vrf.read_lane(io, reg, lane, slice))?;
        for_each_mask_slice(vrf, vmask, |lane, slice| vrf.read_mask_lane(io, lane, slice))?;

        self.vregs.copy_from_slice(&staging[..vregs_len]);
        self.vmask.copy_from_slice(&staging[vregs_len..]);
        self.saved = true;
        self.last_save = Some(Instant::now());

        log::debug!("Register file save done in {} ns", started.elapsed().as_nanos());
        Ok(())
    }

    /// Push the saved image back into the lanes.
    pub fn restore(&mut self, io: &dyn RegisterIo, vrf: &VrfManager) -> VectorResult<()> {
        if !self.allocated {
            return Err(VectorError::InvalidState("restore of unallocated register file".into()));
        }
        if !self.saved {
            return Err(VectorError::InvalidState("restore of never-saved register file".into()));
        }

        let started = Instant::now();
        for_each_slice(vrf, &mut self.vregs, |reg, lane, slice| vrf.write_lane(io, reg, lane, slice))?;
        for_each_mask_slice(vrf, &mut self.vmask, |lane, slice| vrf.write_mask_lane(io, lane, slice))?;

        log::debug!("Register file restore done in {} ns", started.elapsed().as_nanos());
        Ok(())
    }
}

fn zeroed(len: usize) -> VectorResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| VectorError::oom(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Visit the `lane_bytes` slice of every (register, lane) pair.
fn for_each_slice<F>(vrf: &VrfManager, image: &mut [u8], mut f: F) -> VectorResult<()>
where
    F: FnMut(usize, usize, &mut [u8]) -> VectorResult<()>,
{
    let lane_bytes = vrf.lane_bytes();
    let vlenb = lane_bytes * vrf.num_lanes();

    for (reg, register) in image.chunks_mut(vlenb).take(NUM_VREGS).enumerate() {
        for (lane, slice) in register.chunks_mut(lane_bytes).enumerate() {
            f(reg, lane, slice)?;
        }
    }
    Ok(())
}

fn for_each_mask_slice<F>(vrf: &VrfManager, mask: &mut [u8], mut f: F) -> VectorResult<()>
where
    F: FnMut(usize, &mut [u8]) -> VectorResult<()>,
{
    for (lane, slice) in mask.chunks_mut(vrf.lane_bytes()).enumerate() {
        f(lane, slice)?;
    }
    Ok(())
}

impl fmt::Debug for RegisterFileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nonzero: Vec<usize> = (0..NUM_VREGS)
            .filter(|&r| self.register(r).is_some_and(|b| b.iter().any(|&x| x != 0)))
            .collect();

        f.debug_struct("RegisterFileState")
            .field("allocated", &self.allocated)
            .field("saved", &self.saved)
            .field("ref_count", &self.ref_count)
            .field("bytes", &self.total_bytes())
            .field("nonzero_regs", &nonzero)
            .finish()
    }
}
