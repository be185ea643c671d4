//! Registry of live contexts and the context-switch protocol.
//!
//! # Switching
//!
//! `switch_to` picks one of two paths for the outgoing context:
//!
//! - **Lazy**: the outgoing context was used less than `save_threshold` ago.
//!   It is left resident in its register window (Preempted, CSR image
//!   dirty) and nothing is read back from hardware.
//! - **Full**: the outgoing context is saved.
//!
//! The incoming context is then either rebound (it is still resident from
//! an earlier lazy switch, a *fast switch*) or restored from its saved image.
//! With `fast_switch` each context owns a register window selected through
//! the VRF bind register, and the window is bound before a restore so a
//! resident context's live state is never overwritten.
//!
//! If the incoming side fails, the outgoing context stays switched out and
//! no context is current; it can be brought back with `resume`.
//!
//! Hardware I/O runs outside the registry lock. A separate switch lock keeps
//! two switches from interleaving, so at most one context is Active.
//!
//! # Error Bookkeeping
//!
//! Failed saves and restores are counted. Restoring a context that has no
//! saved image counts as a corruption; once `corruption_threshold`
//! corruptions accumulate, error recovery activates and every switch is
//! refused until [`ContextManager::reset_error_state`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use super::context::{ContextId, ContextOwner, ContextState, VectorContext};
use super::scratch::ScratchPool;
use super::Hardware;
use crate::config::{DEFAULT_CORRUPTION_THRESHOLD, DEFAULT_SAVE_THRESHOLD_MS, DEFAULT_SCRATCH_POOL_SIZE};
use crate::device::capability::VectorCapability;
use crate::error::{VectorError, VectorResult};

/// Context-switch policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchPolicy {
    /// Skip saving a recently used outgoing context.
    pub lazy_save: bool,
    /// Rebind the register window instead of restoring a resident context.
    pub fast_switch: bool,
    pub save_threshold: Duration,
    pub scratch_pool_size: usize,
    pub corruption_threshold: u32,
}

impl Default for SwitchPolicy {
    fn default() -> Self {
        Self {
            lazy_save: true,
            fast_switch: true,
            save_threshold: Duration::from_millis(DEFAULT_SAVE_THRESHOLD_MS),
            scratch_pool_size: DEFAULT_SCRATCH_POOL_SIZE,
            corruption_threshold: DEFAULT_CORRUPTION_THRESHOLD,
        }
    }
}

/// Snapshot of the manager counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub live_contexts: usize,
    pub total_switches: u64,
    pub lazy_saves: u64,
    pub fast_switches: u64,
    pub avg_switch_ns: u64,
    pub save_errors: u64,
    pub restore_errors: u64,
    pub hardware_faults: u64,
    pub corruption_detected: u64,
    pub error_recovery_active: bool,
}

impl fmt::Display for ManagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Context manager:")?;
        writeln!(f, "  live contexts:   {}", self.live_contexts)?;
        writeln!(
            f,
            "  switches:        {} ({} lazy, {} fast, avg {} ns)",
            self.total_switches, self.lazy_saves, self.fast_switches, self.avg_switch_ns
        )?;
        writeln!(
            f,
            "  errors:          {} save, {} restore, {} hardware",
            self.save_errors, self.restore_errors, self.hardware_faults
        )?;
        write!(
            f,
            "  corruption:      {}{}",
            self.corruption_detected,
            if self.error_recovery_active { " (recovery active)" } else { "" }
        )
    }
}

#[derive(Default)]
struct Registry {
    contexts: Vec<(ContextId, Weak<VectorContext>)>,
    current: Option<Weak<VectorContext>>,
    next_id: ContextId,
}

impl Registry {
    fn current(&self) -> Option<Arc<VectorContext>> {
        self.current.as_ref().and_then(Weak::upgrade)
    }

    fn prune(&mut self) {
        self.contexts.retain(|(_, weak)| {
            weak.upgrade().is_some_and(|ctx| ctx.state() != ContextState::Destroyed)
        });
    }
}

/// Owner of every context on one vector unit.
pub struct ContextManager {
    capability: Arc<VectorCapability>,
    policy: SwitchPolicy,
    registry: Mutex<Registry>,
    switch_lock: Mutex<()>,
    scratch: ScratchPool,

    total_switches: AtomicU64,
    lazy_saves: AtomicU64,
    fast_switches: AtomicU64,
    total_switch_ns: AtomicU64,
    save_errors: AtomicU64,
    restore_errors: AtomicU64,
    hardware_faults: AtomicU64,
    corruption_detected: AtomicU64,
    error_recovery_active: AtomicBool,
}

impl ContextManager {
    /// Set up the manager and its scratch pool.
    pub fn init(capability: Arc<VectorCapability>, policy: SwitchPolicy) -> VectorResult<Self> {
        capability.validate()?;
        let slot_bytes = capability.vregs_bytes() + capability.vmask_bytes();
        let scratch = ScratchPool::new(policy.scratch_pool_size, slot_bytes)?;

        log::info!(
            "Context manager up: lazy_save={} fast_switch={} threshold={:?} pool={}",
            policy.lazy_save,
            policy.fast_switch,
            policy.save_threshold,
            policy.scratch_pool_size
        );

        Ok(Self {
            capability,
            policy,
            registry: Mutex::new(Registry { next_id: 1, ..Default::default() }),
            switch_lock: Mutex::new(()),
            scratch,
            total_switches: AtomicU64::new(0),
            lazy_saves: AtomicU64::new(0),
            fast_switches: AtomicU64::new(0),
            total_switch_ns: AtomicU64::new(0),
            save_errors: AtomicU64::new(0),
            restore_errors: AtomicU64::new(0),
            hardware_faults: AtomicU64::new(0),
            corruption_detected: AtomicU64::new(0),
            error_recovery_active: AtomicBool::new(false),
        })
    }

    pub fn policy(&self) -> &SwitchPolicy {
        &self.policy
    }

    pub fn capability(&self) -> &Arc<VectorCapability> {
        &self.capability
    }

    pub fn scratch_pool(&self) -> &ScratchPool {
        &self.scratch
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create and register a context for `owner`.
    ///
    /// The returned handle is the only owning reference.
    pub fn create_context(&self, owner: ContextOwner) -> VectorResult<Arc<VectorContext>> {
        let id = {
            let mut registry = self.registry();
            let id = registry.next_id;
            registry.next_id += 1;
            id
        };

        let ctx = Arc::new(VectorContext::create(id, Some(&self.capability), owner)?);

        let mut registry = self.registry();
        registry.prune();
        registry.contexts.push((id, Arc::downgrade(&ctx)));
        Ok(ctx)
    }

    /// Destroy a context and drop it from the registry.
    pub fn destroy_context(&self, ctx: &Arc<VectorContext>) -> VectorResult<()> {
        ctx.destroy()?;

        let mut registry = self.registry();
        registry.contexts.retain(|(id, _)| *id != ctx.id());
        if registry.current().is_some_and(|cur| Arc::ptr_eq(&cur, ctx)) {
            registry.current = None;
        }
        Ok(())
    }

    /// Look up a live context by id.
    pub fn find(&self, id: ContextId) -> Option<Arc<VectorContext>> {
        self.registry()
            .contexts
            .iter()
            .find(|(cid, _)| *cid == id)
            .and_then(|(_, weak)| weak.upgrade())
            .filter(|ctx| ctx.state() != ContextState::Destroyed)
    }

    pub fn current(&self) -> Option<Arc<VectorContext>> {
        self.registry().current()
    }

    pub fn live_contexts(&self) -> usize {
        let mut registry = self.registry();
        registry.prune();
        registry.contexts.len()
    }

    /// Make `next` the running context.
    pub fn switch_to(&self, hw: &Hardware<'_>, next: &Arc<VectorContext>) -> VectorResult<()> {
        if self.error_recovery_active() {
            return Err(VectorError::InvalidState("context switching suspended by error recovery".into()));
        }
        if next.state() == ContextState::Destroyed {
            return Err(VectorError::InvalidState(format!("context {} is destroyed", next.id())));
        }

        let _switching = self.switch_lock.lock().unwrap_or_else(|e| e.into_inner());
        let started = Instant::now();
        let hw = hw.with_scratch(&self.scratch);
        let current = self.current();

        if current.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, next)) && next.is_active() {
            return Ok(());
        }

        let outgoing = current.filter(|cur| !Arc::ptr_eq(cur, next));
        if let Some(cur) = outgoing.as_ref() {
            self.switch_out(&hw, cur)?;
        }

        if let Err(e) = self.switch_in(&hw, next) {
            if let Some(cur) = outgoing {
                log::warn!("Switch to context {} failed; context {} left preempted", next.id(), cur.id());
                self.registry().current = None;
            }
            return Err(e);
        }

        self.registry().current = Some(Arc::downgrade(next));
        self.total_switches.fetch_add(1, Ordering::Relaxed);
        self.total_switch_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn switch_out(&self, hw: &Hardware<'_>, cur: &Arc<VectorContext>) -> VectorResult<()> {
        let lazy = self.policy.lazy_save
            && self.policy.fast_switch
            && cur.is_active()
            && cur.idle_time() < self.policy.save_threshold;

        if lazy {
            cur.preempt()?;
            self.lazy_saves.fetch_add(1, Ordering::Relaxed);
            log::debug!("Context {} left resident (lazy save)", cur.id());
            return Ok(());
        }

        if self.policy.lazy_save {
            log::debug!("Context {} idle {:?}; falling back to full save", cur.id(), cur.idle_time());
        }

        if let Err(e) = cur.save(hw) {
            self.record_save_error(&e);
            return Err(e);
        }
        cur.preempt()
    }

    fn switch_in(&self, hw: &Hardware<'_>, next: &Arc<VectorContext>) -> VectorResult<()> {
        if next.is_resident() {
            hw.vrf.bind_context(hw.io, next.id()).map_err(|e| {
                self.record_restore_error(&e);
                e
            })?;
            next.reactivate_resident()?;
            self.fast_switches.fetch_add(1, Ordering::Relaxed);
            log::debug!("Context {} fast-switched in", next.id());
            return Ok(());
        }

        let has_image = next.csr().map(|csr| csr.valid).unwrap_or(false);
        if !has_image {
            self.record_corruption(next.id());
        }

        // Restore into next's own window, not the one just vacated
        if self.policy.fast_switch {
            hw.vrf.bind_context(hw.io, next.id()).map_err(|e| {
                self.record_restore_error(&e);
                e
            })?;
        }
        if let Err(e) = next.restore(hw) {
            self.record_restore_error(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Capture `ctx` from hardware.
    ///
    /// A resident context is read from its own register window, after which
    /// the running context's window is bound again.
    pub fn save_context(&self, hw: &Hardware<'_>, ctx: &VectorContext) -> VectorResult<()> {
        let _switching = self.switch_lock.lock().unwrap_or_else(|e| e.into_inner());
        let hw = hw.with_scratch(&self.scratch);
        let parked = self.policy.fast_switch && ctx.is_resident();

        let result = if parked {
            hw.vrf.bind_context(hw.io, ctx.id()).and_then(|()| ctx.save(&hw))
        } else {
            ctx.save(&hw)
        };
        let rebound = match (parked, self.current()) {
            (true, Some(cur)) => hw.vrf.bind_context(hw.io, cur.id()),
            _ => Ok(()),
        };

        result.and(rebound).map_err(|e| {
            self.record_save_error(&e);
            e
        })
    }

    /// Save and switch out the running context.
    ///
    /// Returns the preempted context, if any was running.
    pub fn preempt_current(&self, hw: &Hardware<'_>) -> VectorResult<Option<Arc<VectorContext>>> {
        let _switching = self.switch_lock.lock().unwrap_or_else(|e| e.into_inner());
        let hw = hw.with_scratch(&self.scratch);

        let Some(cur) = self.current() else {
            return Ok(None);
        };

        if let Err(e) = cur.save(&hw) {
            self.record_save_error(&e);
            return Err(e);
        }
        cur.preempt()?;

        self.registry().current = None;
        log::debug!("Context {} preempted", cur.id());
        Ok(Some(cur))
    }

    /// Bring a preempted context back onto the vector unit.
    pub fn resume(&self, hw: &Hardware<'_>, ctx: &Arc<VectorContext>) -> VectorResult<()> {
        let state = ctx.state();
        if state != ContextState::Preempted {
            return Err(VectorError::InvalidState(format!(
                "context {} is {}, not preempted",
                ctx.id(),
                state
            )));
        }
        self.switch_to(hw, ctx)
    }

    pub fn record_save_error(&self, error: &VectorError) {
        self.save_errors.fetch_add(1, Ordering::Relaxed);
        self.record_hardware_fault(error);
        log::error!("Context save failed: {}", error);
    }

    pub fn record_restore_error(&self, error: &VectorError) {
        self.restore_errors.fetch_add(1, Ordering::Relaxed);
        self.record_hardware_fault(error);
        log::error!("Context restore failed: {}", error);
    }

    /// Count a device-originated failure (I/O, hardware error bit, timeout).
    pub fn record_hardware_fault(&self, error: &VectorError) {
        if error.is_hardware_fault() {
            self.hardware_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_corruption(&self, id: ContextId) {
        let count = self.corruption_detected.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("Context {} has no saved image (corruption #{})", id, count);

        if count >= self.policy.corruption_threshold as u64
            && !self.error_recovery_active.swap(true, Ordering::SeqCst)
        {
            log::error!("Corruption threshold reached; context switching suspended");
        }
    }

    pub fn error_recovery_active(&self) -> bool {
        self.error_recovery_active.load(Ordering::SeqCst)
    }

    /// Clear the corruption counter and resume switching.
    pub fn reset_error_state(&self) {
        self.corruption_detected.store(0, Ordering::Relaxed);
        self.error_recovery_active.store(false, Ordering::SeqCst);
        log::info!("Context manager error state reset");
    }

    pub fn stats(&self) -> ManagerStats {
        let total_switches = self.total_switches.load(Ordering::Relaxed);
        ManagerStats {
            live_contexts: self.live_contexts(),
            total_switches,
            lazy_saves: self.lazy_saves.load(Ordering::Relaxed),
            fast_switches: self.fast_switches.load(Ordering::Relaxed),
            avg_switch_ns: self
                .total_switch_ns
                .load(Ordering::Relaxed)
                .checked_div(total_switches)
                .unwrap_or(0),
            save_errors: self.save_errors.load(Ordering::Relaxed),
            restore_errors: self.restore_errors.load(Ordering::Relaxed),
            hardware_faults: self.hardware_faults.load(Ordering::Relaxed),
            corruption_detected: self.corruption_detected.load(Ordering::Relaxed),
            error_recovery_active: self.error_recovery_active(),
        }
    }

    /// Tear down. Every context must already be destroyed.
    ///
    /// The scratch pool is freed either way; leaked contexts are reported
    /// as `InvalidState`.
    pub fn fini(&self) -> VectorResult<()> {
        let stats = self.stats();
        self.scratch.clear();
        self.registry().current = None;

        log::info!(
            "Context manager down: {} switches, {} save errors, {} restore errors",
            stats.total_switches,
            stats.save_errors,
            stats.restore_errors
        );

        if stats.live_contexts > 0 {
            log::warn!("{} vector contexts still live at teardown", stats.live_contexts);
            return Err(VectorError::InvalidState(format!(
                "{} contexts leaked",
                stats.live_contexts
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}
