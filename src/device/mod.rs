//! Device layer: register map, collaborator contracts, capability discovery
//! and the [`VectorDevice`] facade that owns every per-device manager.
//!
//! # Layout
//!
//! ```text
//!  VectorDevice
//!  ├── io: Arc<dyn RegisterIo>        register reads/writes
//!  ├── dma: Arc<dyn DmaAllocator>     coherent staging buffers
//!  ├── decoder                        instruction decode/validate
//!  └── unit (None without RVV)
//!      ├── capability                 discovered VLEN/ELEN/lanes
//!      ├── contexts: ContextManager   save/restore/switch
//!      └── vrf: VrfManager            register allocation, lane windows
//! ```
//!
//! There is no process-wide state: two devices never share a manager.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rvv_runtime::config::Config;
//! use rvv_runtime::device::{SimulatedDevice, VectorCapability, VectorDevice};
//! use rvv_runtime::state::ContextOwner;
//!
//! let sim = Arc::new(SimulatedDevice::new(VectorCapability::new(1024, 64, 4).unwrap()));
//! let device = VectorDevice::open(sim.clone(), sim, &Config::default()).unwrap();
//! assert!(device.has_vector_unit());
//!
//! let ctx = device.create_context(ContextOwner::new(1, "demo")).unwrap();
//! device.save_context(&ctx).unwrap();
//! device.switch_to(&ctx).unwrap();
//! device.destroy_context(&ctx).unwrap();
//! device.fini().unwrap();
//! ```

pub mod capability;
pub mod io;
pub mod registers;
pub mod sim;

pub use capability::{VectorCapability, VectorFeatures};
pub use io::{DmaAllocator, DmaBuffer, DmaGuard, RegisterIo};
pub use registers::RegisterRegion;
pub use sim::{SimFaults, SimStats, SimulatedDevice};

use std::sync::Arc;

use crate::config::Config;
use crate::decode::{hazards, InstructionDecoder, InstructionDescriptor};
use crate::error::{VectorError, VectorResult};
use crate::state::{ContextManager, ContextOwner, Hardware, ManagerStats, VectorContext};
use crate::vmem::{CancelToken, MemoryPort, PollConfig, TransferReport, VectorMemoryOp};
use crate::vrf::{VrfManager, VrfStats};

/// Per-unit managers; present only when the device has a vector unit.
struct VectorUnit {
    capability: Arc<VectorCapability>,
    contexts: ContextManager,
    vrf: VrfManager,
}

/// Snapshot of every device counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub contexts: Option<ManagerStats>,
    pub vrf: Option<VrfStats>,
}

/// One vector-capable device and the managers that drive it.
pub struct VectorDevice {
    io: Arc<dyn RegisterIo>,
    dma: Arc<dyn DmaAllocator>,
    decoder: InstructionDecoder,
    poll: PollConfig,
    unit: Option<VectorUnit>,
}

impl VectorDevice {
    /// Probe the feature registers and bring up the vector unit if present.
    pub fn open(io: Arc<dyn RegisterIo>, dma: Arc<dyn DmaAllocator>, config: &Config) -> VectorResult<Self> {
        let capability = VectorCapability::discover(io.as_ref())?;
        Self::with_capability(io, dma, capability, config)
    }

    /// Bring up the device with an already known capability.
    pub fn with_capability(
        io: Arc<dyn RegisterIo>,
        dma: Arc<dyn DmaAllocator>,
        capability: Option<VectorCapability>,
        config: &Config,
    ) -> VectorResult<Self> {
        let unit = match capability {
            Some(cap) => {
                cap.validate()?;
                log::debug!("Bringing up vector unit: {}", cap);
                let capability = Arc::new(cap);
                let vrf = VrfManager::new(Arc::clone(&capability))?;
                let contexts = ContextManager::init(Arc::clone(&capability), config.policy())?;
                Some(VectorUnit { capability, contexts, vrf })
            }
            None => {
                log::info!("Device has no vector unit");
                None
            }
        };

        let decoder = unit
            .as_ref()
            .map_or_else(InstructionDecoder::new, |u| InstructionDecoder::for_capability(&u.capability));

        Ok(Self { io, dma, decoder, poll: config.poll_config(), unit })
    }

    fn unit(&self) -> VectorResult<&VectorUnit> {
        self.unit
            .as_ref()
            .ok_or_else(|| VectorError::DeviceUnavailable("device has no vector unit".into()))
    }

    fn hardware<'a>(&'a self, unit: &'a VectorUnit) -> Hardware<'a> {
        Hardware::new(self.io.as_ref(), &unit.vrf).with_scratch(unit.contexts.scratch_pool())
    }

    pub fn has_vector_unit(&self) -> bool {
        self.unit.is_some()
    }

    pub fn capability(&self) -> Option<&VectorCapability> {
        self.unit.as_ref().map(|u| u.capability.as_ref())
    }

    pub fn io(&self) -> &dyn RegisterIo {
        self.io.as_ref()
    }

    pub fn contexts(&self) -> VectorResult<&ContextManager> {
        Ok(&self.unit()?.contexts)
    }

    pub fn vrf(&self) -> VectorResult<&VrfManager> {
        Ok(&self.unit()?.vrf)
    }

    pub fn poll_config(&self) -> PollConfig {
        self.poll
    }

    // --- Context lifecycle ---

    pub fn create_context(&self, owner: ContextOwner) -> VectorResult<Arc<VectorContext>> {
        self.unit()?.contexts.create_context(owner)
    }

    pub fn destroy_context(&self, ctx: &Arc<VectorContext>) -> VectorResult<()> {
        self.unit()?.contexts.destroy_context(ctx)
    }

    /// Capture the live vector state into `ctx`.
    pub fn save_context(&self, ctx: &VectorContext) -> VectorResult<()> {
        let unit = self.unit()?;
        unit.contexts.save_context(&self.hardware(unit), ctx)
    }

    /// Load `ctx` onto the vector unit without touching the current pointer.
    pub fn restore_context(&self, ctx: &VectorContext) -> VectorResult<()> {
        let unit = self.unit()?;
        ctx.restore(&self.hardware(unit)).map_err(|e| {
            unit.contexts.record_restore_error(&e);
            e
        })
    }

    pub fn switch_to(&self, ctx: &Arc<VectorContext>) -> VectorResult<()> {
        let unit = self.unit()?;
        unit.contexts.switch_to(&self.hardware(unit), ctx)
    }

    pub fn preempt_current(&self) -> VectorResult<Option<Arc<VectorContext>>> {
        let unit = self.unit()?;
        unit.contexts.preempt_current(&self.hardware(unit))
    }

    pub fn resume(&self, ctx: &Arc<VectorContext>) -> VectorResult<()> {
        let unit = self.unit()?;
        unit.contexts.resume(&self.hardware(unit), ctx)
    }

    // --- Instructions ---

    pub fn decoder(&self) -> &InstructionDecoder {
        &self.decoder
    }

    /// Decode and validate an instruction word.
    pub fn decode(&self, word: u32) -> VectorResult<InstructionDescriptor> {
        self.decoder.decode_validated(word)
    }

    pub fn validate(&self, desc: &InstructionDescriptor) -> VectorResult<()> {
        self.decoder.validate(desc)
    }

    pub fn conflicts(&self, a: &InstructionDescriptor, b: &InstructionDescriptor) -> bool {
        hazards::conflicts(a, b)
    }

    // --- Memory operations ---

    /// Run a memory operation with the configured poll settings.
    ///
    /// Device faults are also counted by the context manager.
    pub fn execute_memop(
        &self,
        op: &mut VectorMemoryOp,
        cancel: Option<&CancelToken>,
    ) -> VectorResult<TransferReport> {
        let mut port = MemoryPort::new(self.io.as_ref(), self.dma.as_ref(), self.capability()).with_poll(self.poll);
        if let Some(token) = cancel {
            port = port.with_cancel(token);
        }

        op.execute(&port).map_err(|e| {
            if let Some(unit) = &self.unit {
                unit.contexts.record_hardware_fault(&e);
            }
            e
        })
    }

    // --- Teardown ---

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            contexts: self.unit.as_ref().map(|u| u.contexts.stats()),
            vrf: self.unit.as_ref().map(|u| u.vrf.stats()),
        }
    }

    /// Release the scratch pool. Fails if contexts are still live.
    pub fn fini(&self) -> VectorResult<()> {
        match &self.unit {
            Some(unit) => unit.contexts.fini(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for VectorDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorDevice")
            .field("capability", &self.capability())
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmem::Direction;

    fn device() -> (Arc<SimulatedDevice>, VectorDevice) {
        let sim = Arc::new(SimulatedDevice::new(VectorCapability::new(1024, 64, 4).unwrap()));
        let device = VectorDevice::open(sim.clone(), sim.clone(), &Config::default()).unwrap();
        (sim, device)
    }

    #[test]
    fn test_open_discovers_capability() {
        let (_sim, device) = device();
        let cap = device.capability().unwrap();
        assert_eq!(cap.vlen_bits, 1024);
        assert_eq!(cap.num_lanes, 4);
        assert_eq!(device.decoder().max_vl(), 1024);
    }

    #[test]
    fn test_device_without_vector_unit() {
        let sim = Arc::new(SimulatedDevice::without_vector_unit());
        let device = VectorDevice::open(sim.clone(), sim, &Config::default()).unwrap();

        assert!(!device.has_vector_unit());
        assert!(matches!(
            device.create_context(ContextOwner::new(1, "t")),
            Err(VectorError::DeviceUnavailable(_))
        ));
        let mut op = VectorMemoryOp::unit_stride(Direction::Load, 0, 4, 4);
        assert!(matches!(device.execute_memop(&mut op, None), Err(VectorError::DeviceUnavailable(_))));
        // Decoding needs no vector unit
        assert!(device.decode(0x0000_7057).is_ok());
        assert!(device.fini().is_ok());
        assert_eq!(device.stats(), DeviceStats::default());
    }

    #[test]
    fn test_memop_fault_is_counted() {
        let (sim, device) = device();
        sim.set_faults(SimFaults { memop_error: true, ..Default::default() });

        let mut op = VectorMemoryOp::unit_stride(Direction::Load, 0, 4, 4);
        assert!(matches!(device.execute_memop(&mut op, None), Err(VectorError::Hardware { .. })));

        let stats = device.stats().contexts.unwrap();
        assert_eq!(stats.hardware_faults, 1);
        assert_eq!(sim.stats().live_dma_buffers(), 0);
    }

    #[test]
    fn test_validation_errors_are_not_faults() {
        let (_sim, device) = device();
        let mut op = VectorMemoryOp::unit_stride(Direction::Load, 0, 0, 4);
        assert!(device.execute_memop(&mut op, None).is_err());
        assert_eq!(device.stats().contexts.unwrap().hardware_faults, 0);
    }

    #[test]
    fn test_fini_reports_leaks() {
        let (_sim, device) = device();
        let ctx = device.create_context(ContextOwner::new(7, "leak")).unwrap();
        assert!(matches!(device.fini(), Err(VectorError::InvalidState(_))));
        drop(ctx);
    }
}
