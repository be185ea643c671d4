//! End-to-end context save/restore/switch against the simulated device.

use std::sync::Arc;
use std::thread;

use rvv_runtime::config::Config;
use rvv_runtime::device::registers::{csr, csr_offset};
use rvv_runtime::device::{RegisterIo, SimFaults, SimulatedDevice, VectorCapability, VectorDevice};
use rvv_runtime::state::{ContextOwner, ContextState};
use rvv_runtime::VectorError;

fn rig(config: Config) -> (Arc<SimulatedDevice>, VectorDevice) {
    let sim = Arc::new(SimulatedDevice::new(VectorCapability::new(1024, 64, 4).unwrap()));
    let device = VectorDevice::open(sim.clone(), sim.clone(), &config).unwrap();
    (sim, device)
}

fn owner(pid: u32) -> ContextOwner {
    ContextOwner::new(pid, format!("task-{}", pid))
}

/// Put a recognisable CSR and register pattern on the hardware.
fn load_pattern(sim: &SimulatedDevice, device: &VectorDevice, vl: u64, vtype: u64, fill: u8) {
    sim.write64(csr_offset(csr::VL), vl).unwrap();
    sim.write64(csr_offset(csr::VTYPE), vtype).unwrap();
    let vrf = device.vrf().unwrap();
    let lane = vec![fill; vrf.lane_bytes()];
    for l in 0..vrf.num_lanes() {
        vrf.write_lane(sim, 3, l, &lane).unwrap();
    }
}

fn lane_of_v3(sim: &SimulatedDevice, device: &VectorDevice, lane: usize) -> Vec<u8> {
    let vrf = device.vrf().unwrap();
    let mut buf = vec![0u8; vrf.lane_bytes()];
    vrf.read_lane(sim, 3, lane, &mut buf).unwrap();
    buf
}

#[test]
fn save_then_switch_restores_state() {
    let (sim, device) = rig(Config::default());
    let a = device.create_context(owner(1)).unwrap();
    let b = device.create_context(owner(2)).unwrap();

    load_pattern(&sim, &device, 16, 0x10, 0xAA);
    device.save_context(&a).unwrap();
    load_pattern(&sim, &device, 64, 0x00, 0x55);
    device.save_context(&b).unwrap();

    device.switch_to(&a).unwrap();
    assert_eq!(a.state(), ContextState::Active);
    assert_eq!(sim.read64(csr_offset(csr::VL)).unwrap(), 16);
    assert_eq!(sim.read64(csr_offset(csr::VTYPE)).unwrap(), 0x10);
    assert_eq!(lane_of_v3(&sim, &device, 2), vec![0xAA; 32]);

    let image = a.saved_register(3).unwrap();
    assert_eq!(image, vec![0xAA; 128]);
    assert_eq!(a.csr().unwrap().fields.sew_bits, 32);
    assert!(a.verify_integrity().is_ok());

    device.destroy_context(&a).unwrap();
    device.destroy_context(&b).unwrap();
    device.fini().unwrap();
}

#[test]
fn recent_context_switches_lazily_and_comes_back_fast() {
    let config = Config { save_threshold_ms: Some(60_000), ..Default::default() };
    let (sim, device) = rig(config);
    let a = device.create_context(owner(1)).unwrap();
    let b = device.create_context(owner(2)).unwrap();
    device.save_context(&a).unwrap();
    device.save_context(&b).unwrap();

    device.switch_to(&a).unwrap();
    device.switch_to(&b).unwrap();
    assert_eq!(a.state(), ContextState::Preempted);
    assert!(a.is_resident());

    device.switch_to(&a).unwrap();
    assert!(a.is_active());
    assert_eq!(device.vrf().unwrap().bound_context(&*sim).unwrap(), a.id());

    let stats = device.stats().contexts.unwrap();
    assert_eq!(stats.total_switches, 3);
    assert_eq!(stats.lazy_saves, 2);
    assert_eq!(stats.fast_switches, 1);
    // Only the two explicit saves ran
    assert_eq!(a.stats().save_count, 1);
}

#[test]
fn lazily_switched_context_keeps_its_registers() {
    let config = Config { save_threshold_ms: Some(60_000), ..Default::default() };
    let (sim, device) = rig(config);
    let a = device.create_context(owner(1)).unwrap();
    let b = device.create_context(owner(2)).unwrap();
    device.save_context(&a).unwrap();
    device.save_context(&b).unwrap();

    device.switch_to(&a).unwrap();
    load_pattern(&sim, &device, 9, 0x08, 0x3C);

    // b is restored into its own window; a's live state is not touched
    device.switch_to(&b).unwrap();
    assert!(a.is_resident());
    assert_eq!(sim.read64(csr_offset(csr::VL)).unwrap(), 0);
    assert_eq!(lane_of_v3(&sim, &device, 0), vec![0; 32]);

    device.switch_to(&a).unwrap();
    assert_eq!(sim.read64(csr_offset(csr::VL)).unwrap(), 9);
    assert_eq!(sim.read64(csr_offset(csr::VTYPE)).unwrap(), 0x08);
    assert_eq!(lane_of_v3(&sim, &device, 0), vec![0x3C; 32]);
    assert_eq!(lane_of_v3(&sim, &device, 3), vec![0x3C; 32]);

    // Saving the parked context captures its own window
    device.save_context(&b).unwrap();
    assert_eq!(b.csr().unwrap().vl, 0);
    assert_eq!(sim.read64(csr_offset(csr::VL)).unwrap(), 9);
}

#[test]
fn disabled_lazy_save_always_saves() {
    let config = Config { lazy_save: Some(false), ..Default::default() };
    let (_sim, device) = rig(config);
    let a = device.create_context(owner(1)).unwrap();
    let b = device.create_context(owner(2)).unwrap();
    device.save_context(&a).unwrap();
    device.save_context(&b).unwrap();

    device.switch_to(&a).unwrap();
    device.switch_to(&b).unwrap();

    assert_eq!(a.stats().save_count, 2);
    assert!(!a.is_resident());
    assert_eq!(device.stats().contexts.unwrap().lazy_saves, 0);
}

#[test]
fn preempt_and_resume() {
    let (sim, device) = rig(Config::default());
    let a = device.create_context(owner(1)).unwrap();

    load_pattern(&sim, &device, 8, 0x08, 0x11);
    device.save_context(&a).unwrap();
    device.switch_to(&a).unwrap();

    let preempted = device.preempt_current().unwrap().unwrap();
    assert!(Arc::ptr_eq(&preempted, &a));
    assert_eq!(a.state(), ContextState::Preempted);
    assert!(device.contexts().unwrap().current().is_none());
    assert!(device.preempt_current().unwrap().is_none());

    load_pattern(&sim, &device, 99, 0x00, 0x00);
    device.resume(&a).unwrap();
    assert!(a.is_active());
    assert_eq!(sim.read64(csr_offset(csr::VL)).unwrap(), 8);
    assert_eq!(lane_of_v3(&sim, &device, 0), vec![0x11; 32]);

    // Only preempted contexts resume
    assert!(matches!(device.resume(&a), Err(VectorError::InvalidState(_))));
}

#[test]
fn unsaved_contexts_trip_error_recovery() {
    let config = Config { corruption_threshold: Some(2), ..Default::default() };
    let (_sim, device) = rig(config);
    let first = device.create_context(owner(1)).unwrap();
    let second = device.create_context(owner(2)).unwrap();

    assert!(device.switch_to(&first).is_err());
    assert!(!device.contexts().unwrap().error_recovery_active());
    assert!(device.switch_to(&second).is_err());

    let manager = device.contexts().unwrap();
    assert!(manager.error_recovery_active());
    assert_eq!(manager.stats().corruption_detected, 2);

    // Even a healthy context is refused while recovery is active
    device.save_context(&first).unwrap();
    assert!(matches!(device.switch_to(&first), Err(VectorError::InvalidState(_))));

    manager.reset_error_state();
    device.switch_to(&first).unwrap();
    assert!(first.is_active());
}

#[test]
fn save_failure_is_counted_and_leaves_image_untouched() {
    let (sim, device) = rig(Config::default());
    let a = device.create_context(owner(1)).unwrap();
    device.save_context(&a).unwrap();
    let before = a.csr().unwrap();

    sim.set_faults(SimFaults { failing_offset: Some(csr_offset(csr::VL)), ..Default::default() });
    let err = device.save_context(&a).unwrap_err();
    assert!(err.is_hardware_fault());

    let after = a.csr().unwrap();
    assert_eq!(after.save_count, before.save_count);
    let stats = device.stats().contexts.unwrap();
    assert_eq!(stats.save_errors, 1);
    assert_eq!(stats.hardware_faults, 1);
}

#[test]
fn destroyed_context_cannot_switch() {
    let (_sim, device) = rig(Config::default());
    let a = device.create_context(owner(1)).unwrap();
    device.save_context(&a).unwrap();
    device.destroy_context(&a).unwrap();

    assert!(matches!(device.switch_to(&a), Err(VectorError::InvalidState(_))));
    assert!(matches!(device.destroy_context(&a), Err(VectorError::InvalidState(_))));
    assert_eq!(device.contexts().unwrap().live_contexts(), 0);
}

#[test]
fn contexts_created_from_many_threads() {
    let (_sim, device) = rig(Config::default());
    let device = Arc::new(device);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                for i in 0..4 {
                    let ctx = device.create_context(owner(t * 100 + i)).unwrap();
                    device.save_context(&ctx).unwrap();
                    device.destroy_context(&ctx).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = device.stats().contexts.unwrap();
    assert_eq!(stats.live_contexts, 0);
    assert_eq!(stats.save_errors, 0);
    device.fini().unwrap();
}
