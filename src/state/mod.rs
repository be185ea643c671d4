//! Vector execution state: CSR images, register files, contexts and the
//! context manager.
//!
//! # Module Organization
//!
//! | Module | Contents |
//! |--------|----------|
//! | `csr` | `CsrContext`, VTYPE decoding and validation |
//! | `regfile` | `RegisterFileState` byte image of v0..v31 and the mask |
//! | `context` | `VectorContext` per-owner state machine |
//! | `manager` | `ContextManager` registry and switch protocol |
//! | `scratch` | `ScratchPool` staging buffers for saves |
//!
//! # Example
//!
//! ```ignore
//! let mgr = ContextManager::init(cap, SwitchPolicy::default())?;
//! let ctx = mgr.create_context(ContextOwner::current())?;
//!
//! let hw = Hardware::new(io, &vrf);
//! ctx.save(&hw)?;            // capture initial state
//! mgr.switch_to(&hw, &ctx)?; // make it run
//! ```

pub mod context;
pub mod csr;
pub mod manager;
pub mod regfile;
pub mod scratch;

pub use context::{ContextId, ContextOwner, ContextState, ContextStats, VectorContext};
pub use csr::{CsrContext, VtypeFields};
pub use manager::{ContextManager, ManagerStats, SwitchPolicy};
pub use regfile::RegisterFileState;
pub use scratch::{ScratchPool, ScratchSlot};

use crate::device::io::RegisterIo;
use crate::vrf::VrfManager;

/// Hardware accessors a save or restore runs against.
#[derive(Clone, Copy)]
pub struct Hardware<'a> {
    pub io: &'a dyn RegisterIo,
    pub vrf: &'a VrfManager,
    /// Staging buffers for register-file saves; a temporary is used without.
    pub scratch: Option<&'a ScratchPool>,
}

impl<'a> Hardware<'a> {
    pub fn new(io: &'a dyn RegisterIo, vrf: &'a VrfManager) -> Self {
        Self { io, vrf, scratch: None }
    }

    /// Same accessors, saving through `pool`.
    pub fn with_scratch<'b>(&self, pool: &'b ScratchPool) -> Hardware<'b>
    where
        'a: 'b,
    {
        Hardware { io: self.io, vrf: self.vrf, scratch: Some(pool) }
    }
}
