//! Per-owner vector execution context.
//!
//! A context pairs a [`CsrContext`] with a [`RegisterFileState`] and tracks
//! who owns it and how it has been used.
//!
//! # Lifecycle
//!
//! ```text
//!            save()            restore()
//! Created ──────────► Saved ─────────────► Active
//!                       ▲                   │  │
//!                       │ save()   preempt()│  │
//!                       └───────────────────┘  ▼
//!                                 restore() Preempted
//!
//! any state ── destroy() ──► Destroyed (terminal)
//! ```
//!
//! Every operation takes the context's lock for its whole duration, so save,
//! restore and destroy on one context never overlap.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::csr::CsrContext;
use super::regfile::RegisterFileState;
use super::Hardware;
use crate::device::capability::VectorCapability;
use crate::error::{VectorError, VectorResult};

/// Identifier assigned by the context manager.
pub type ContextId = u64;

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// Register file allocated, CSR image not yet captured.
    #[default]
    Created,
    /// Image captured; not running.
    Saved,
    /// Running on the vector unit.
    Active,
    /// Switched out.
    Preempted,
    /// Resources released (terminal).
    Destroyed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextState::Created => "created",
            ContextState::Saved => "saved",
            ContextState::Active => "active",
            ContextState::Preempted => "preempted",
            ContextState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Process that owns a context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextOwner {
    pub pid: u32,
    pub name: String,
}

impl ContextOwner {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self { pid, name: name.into() }
    }

    /// The calling process.
    pub fn current() -> Self {
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(std::process::id(), name)
    }
}

impl fmt::Display for ContextOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.pid)
    }
}

/// Usage statistics snapshot of a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub state: ContextState,
    pub save_count: u64,
    pub restore_count: u64,
    pub total_save_ns: u64,
    pub total_restore_ns: u64,
    /// Lazily preempted and still resident in its register window.
    pub resident: bool,
    pub age: Duration,
    pub idle: Duration,
}

impl ContextStats {
    pub fn avg_save_ns(&self) -> u64 {
        self.total_save_ns.checked_div(self.save_count).unwrap_or(0)
    }

    pub fn avg_restore_ns(&self) -> u64 {
        self.total_restore_ns.checked_div(self.restore_count).unwrap_or(0)
    }
}

impl fmt::Display for ContextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} saves (avg {} ns), {} restores (avg {} ns), idle {:?}",
            self.state,
            self.save_count,
            self.avg_save_ns(),
            self.restore_count,
            self.avg_restore_ns(),
            self.idle
        )
    }
}

struct ContextInner {
    csr: CsrContext,
    regs: RegisterFileState,
    state: ContextState,
    resident: bool,
    save_count: u64,
    restore_count: u64,
    total_save_ns: u64,
    total_restore_ns: u64,
    last_use: Instant,
}

/// Vector state of one owning process.
pub struct VectorContext {
    id: ContextId,
    owner: ContextOwner,
    capability: Arc<VectorCapability>,
    created: Instant,
    inner: Mutex<ContextInner>,
}

impl VectorContext {
    /// Create a context with a freshly allocated register file.
    ///
    /// `capability` is `None` when no vector unit is fitted.
    pub fn create(
        id: ContextId,
        capability: Option<&Arc<VectorCapability>>,
        owner: ContextOwner,
    ) -> VectorResult<Self> {
        let capability = capability
            .ok_or_else(|| VectorError::DeviceUnavailable("no vector extension".into()))?;

        let mut regs = RegisterFileState::new();
        regs.allocate(capability)?;

        let now = Instant::now();
        log::debug!("Context {} created for {}", id, owner);

        Ok(Self {
            id,
            owner,
            capability: Arc::clone(capability),
            created: now,
            inner: Mutex::new(ContextInner {
                csr: CsrContext::new(),
                regs,
                state: ContextState::Created,
                resident: false,
                save_count: 0,
                restore_count: 0,
                total_save_ns: 0,
                total_restore_ns: 0,
                last_use: now,
            }),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn owner(&self) -> &ContextOwner {
        &self.owner
    }

    pub fn capability(&self) -> &VectorCapability {
        &self.capability
    }

    fn lock(&self) -> VectorResult<MutexGuard<'_, ContextInner>> {
        self.inner
            .lock()
            .map_err(|_| VectorError::InvalidState(format!("context {} lock poisoned", self.id)))
    }

    fn lock_live(&self) -> VectorResult<MutexGuard<'_, ContextInner>> {
        let inner = self.lock()?;
        if inner.state == ContextState::Destroyed {
            return Err(VectorError::InvalidState(format!("context {} is destroyed", self.id)));
        }
        Ok(inner)
    }

    /// Capture CSRs then the register file from hardware.
    pub fn save(&self, hw: &Hardware<'_>) -> VectorResult<()> {
        let mut inner = self.lock_live()?;
        let started = Instant::now();

        // Commit the CSR image only once the register file is captured too
        let mut csr = inner.csr.clone();
        csr.save(hw.io)?;

        let mut slot = hw.scratch.and_then(|pool| pool.acquire());
        let mut fallback = Vec::new();
        if slot.is_none() && hw.scratch.is_some() {
            log::warn!("Scratch pool exhausted; context {} saves through a temporary buffer", self.id);
        }
        let staging = match slot.as_mut() {
            Some(slot) => slot.buffer(),
            None => &mut fallback,
        };
        inner.regs.save(hw.io, hw.vrf, staging)?;
        inner.csr = csr;

        let elapsed = started.elapsed().as_nanos() as u64;
        inner.save_count += 1;
        inner.total_save_ns += elapsed;
        inner.last_use = Instant::now();
        inner.state = ContextState::Saved;
        inner.resident = false;

        log::debug!("Context {} saved in {} ns", self.id, elapsed);
        Ok(())
    }

    /// Write CSRs then the register file back to hardware.
    pub fn restore(&self, hw: &Hardware<'_>) -> VectorResult<()> {
        let mut inner = self.lock_live()?;
        let started = Instant::now();

        inner.csr.restore(hw.io)?;
        inner.regs.restore(hw.io, hw.vrf)?;

        let elapsed = started.elapsed().as_nanos() as u64;
        inner.restore_count += 1;
        inner.total_restore_ns += elapsed;
        inner.last_use = Instant::now();
        inner.state = ContextState::Active;
        inner.resident = false;

        log::debug!("Context {} restored in {} ns", self.id, elapsed);
        Ok(())
    }

    /// Switch out without saving; live state stays in the register window.
    pub fn preempt(&self) -> VectorResult<()> {
        let mut inner = self.lock_live()?;
        match inner.state {
            ContextState::Active => {
                inner.state = ContextState::Preempted;
                inner.resident = true;
                inner.csr.dirty = true;
                Ok(())
            }
            ContextState::Saved => {
                inner.state = ContextState::Preempted;
                Ok(())
            }
            other => Err(VectorError::InvalidState(format!(
                "cannot preempt context {} in state {}",
                self.id, other
            ))),
        }
    }

    /// Mark a resident context running again after its window was rebound.
    pub(crate) fn reactivate_resident(&self) -> VectorResult<()> {
        let mut inner = self.lock_live()?;
        if !inner.resident {
            return Err(VectorError::InvalidState(format!("context {} is not resident", self.id)));
        }
        inner.state = ContextState::Active;
        inner.resident = false;
        inner.last_use = Instant::now();
        Ok(())
    }

    /// Release the register file and enter the terminal state.
    ///
    /// Destroying twice is an error.
    pub fn destroy(&self) -> VectorResult<()> {
        let mut inner = self.lock_live()?;
        inner.regs.release();
        inner.csr = CsrContext::new();
        inner.state = ContextState::Destroyed;
        inner.resident = false;
        log::debug!(
            "Context {} destroyed after {} saves / {} restores",
            self.id,
            inner.save_count,
            inner.restore_count
        );
        Ok(())
    }

    /// Record use by the owner (resets the idle clock).
    pub fn touch(&self) -> VectorResult<()> {
        self.lock_live()?.last_use = Instant::now();
        Ok(())
    }

    pub fn state(&self) -> ContextState {
        self.lock().map_or(ContextState::Destroyed, |inner| inner.state)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ContextState::Active
    }

    pub fn is_resident(&self) -> bool {
        self.lock().map_or(false, |inner| inner.resident)
    }

    /// Time since the last save, restore or touch.
    pub fn idle_time(&self) -> Duration {
        self.lock().map_or(Duration::ZERO, |inner| inner.last_use.elapsed())
    }

    /// Copy of the current CSR image.
    pub fn csr(&self) -> VectorResult<CsrContext> {
        Ok(self.lock()?.csr.clone())
    }

    /// Copy of one saved register.
    pub fn saved_register(&self, reg: usize) -> VectorResult<Vec<u8>> {
        let inner = self.lock()?;
        inner
            .regs
            .register(reg)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| VectorError::OutOfRange(format!("register v{} not in saved image", reg)))
    }

    /// Check internal consistency.
    pub fn verify_integrity(&self) -> VectorResult<()> {
        let inner = self.lock_live()?;
        if !inner.regs.is_allocated() {
            return Err(VectorError::InvalidState(format!(
                "context {} has no register file",
                self.id
            )));
        }
        if inner.csr.valid {
            inner.csr.validate(&self.capability).map_err(|e| {
                VectorError::InvalidState(format!("context {} CSR image invalid: {}", self.id, e))
            })?;
        }
        Ok(())
    }

    pub fn stats(&self) -> ContextStats {
        let Ok(inner) = self.lock() else {
            return ContextStats { state: ContextState::Destroyed, ..Default::default() };
        };
        ContextStats {
            state: inner.state,
            save_count: inner.save_count,
            restore_count: inner.restore_count,
            total_save_ns: inner.total_save_ns,
            total_restore_ns: inner.total_restore_ns,
            resident: inner.resident,
            age: self.created.elapsed(),
            idle: inner.last_use.elapsed(),
        }
    }
}

impl fmt::Debug for VectorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorContext")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}
