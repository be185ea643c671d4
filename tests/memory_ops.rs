//! Vector memory operations through `VectorDevice` and the simulator.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rvv_runtime::config::Config;
use rvv_runtime::device::{SimFaults, SimulatedDevice, VectorCapability, VectorDevice};
use rvv_runtime::vmem::{CancelToken, Direction, VectorMemoryOp};
use rvv_runtime::VectorError;

fn rig(config: Config) -> (Arc<SimulatedDevice>, VectorDevice) {
    let sim = Arc::new(SimulatedDevice::new(VectorCapability::new(1024, 32, 2).unwrap()));
    let device = VectorDevice::open(sim.clone(), sim.clone(), &config).unwrap();
    (sim, device)
}

#[test]
fn strided_store_then_load() {
    let (sim, device) = rig(Config::default());

    // Staging layout for a strided store: element i at i * stride
    let mut staged = vec![0u8; 4 * 8];
    for i in 0..4 {
        staged[i * 8..i * 8 + 4].copy_from_slice(&[i as u8 + 1; 4]);
    }
    let mut store = VectorMemoryOp::strided(Direction::Store, 0x2_0000, 4, 4, 8).with_payload(staged);
    device.execute_memop(&mut store, None).unwrap();

    let mut third = [0u8; 4];
    sim.read_memory(0x2_0000 + 2 * 8, &mut third);
    assert_eq!(third, [3; 4]);

    let mut load = VectorMemoryOp::unit_stride(Direction::Load, 0x2_0000, 8, 4);
    device.execute_memop(&mut load, None).unwrap();
    let words: Vec<u8> = load.payload().chunks(4).map(|w| w[0]).collect();
    assert_eq!(words, vec![1, 0, 2, 0, 3, 0, 4, 0]);

    assert_eq!(sim.stats().memops_started, 2);
    assert_eq!(sim.stats().live_dma_buffers(), 0);
}

#[test]
fn indexed_scatter() {
    let (sim, device) = rig(Config::default());
    let mut scatter = VectorMemoryOp::indexed(Direction::Store, 0x3_0000, 2, vec![0x20, 0x0, 0x10])
        .with_payload(vec![0xA, 0xA, 0xB, 0xB, 0xC, 0xC]);
    device.execute_memop(&mut scatter, None).unwrap();

    let mut out = [0u8; 2];
    sim.read_memory(0x3_0020, &mut out);
    assert_eq!(out, [0xA, 0xA]);
    sim.read_memory(0x3_0000, &mut out);
    assert_eq!(out, [0xB, 0xB]);
    sim.read_memory(0x3_0010, &mut out);
    assert_eq!(out, [0xC, 0xC]);
    assert_eq!(sim.stats().live_dma_buffers(), 0);
}

#[test]
fn segment_store_interleaves() {
    let (sim, device) = rig(Config::default());
    // Field-major staging: all x then all y
    let mut op = VectorMemoryOp::segment(Direction::Store, 0x4_0000, 3, 2, 2).with_payload(vec![1, 2, 3, 10, 20, 30]);
    device.execute_memop(&mut op, None).unwrap();

    let mut out = [0u8; 6];
    sim.read_memory(0x4_0000, &mut out);
    assert_eq!(out, [1, 10, 2, 20, 3, 30]);
}

#[test]
fn configured_timeout_applies() {
    let config = Config { memop_timeout_ms: Some(15), memop_poll_interval_us: Some(500), ..Default::default() };
    let (sim, device) = rig(config);
    sim.set_faults(SimFaults { memop_hang: true, ..Default::default() });

    let mut op = VectorMemoryOp::unit_stride(Direction::Load, 0, 16, 4);
    match device.execute_memop(&mut op, None) {
        Err(VectorError::Timeout { waited_ms, cancelled }) => {
            assert!(!cancelled);
            assert!(waited_ms >= 15);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    assert_eq!(device.stats().contexts.unwrap().hardware_faults, 1);
    assert_eq!(sim.stats().live_dma_buffers(), 0);
}

#[test]
fn cancellation_from_another_thread() {
    let config = Config { memop_timeout_ms: Some(60_000), memop_poll_interval_us: Some(200), ..Default::default() };
    let (sim, device) = rig(config);
    sim.set_faults(SimFaults { memop_hang: true, ..Default::default() });

    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            token.cancel();
        })
    };

    let mut op = VectorMemoryOp::unit_stride(Direction::Load, 0, 4, 4);
    let err = device.execute_memop(&mut op, Some(&token)).unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, VectorError::Timeout { cancelled: true, .. }));
    assert_eq!(sim.stats().live_dma_buffers(), 0);
}

#[test]
fn invalid_ops_never_touch_dma() {
    let (sim, device) = rig(Config::default());
    let bad = [
        VectorMemoryOp::unit_stride(Direction::Load, 0, 0, 4),
        VectorMemoryOp::unit_stride(Direction::Load, 0, 4, 0),
        VectorMemoryOp::strided(Direction::Load, 0, 4, 4, 0),
        VectorMemoryOp::segment(Direction::Load, 0, 4, 6, 4),
        VectorMemoryOp::unit_stride(Direction::Store, 0, 4, 4).with_payload(vec![1; 3]),
    ];

    for mut op in bad {
        let err = device.execute_memop(&mut op, None).unwrap_err();
        assert!(err.is_validation(), "{} gave {:?}", op, err);
    }
    assert_eq!(sim.stats().dma_allocs, 0);
    assert_eq!(device.stats().contexts.unwrap().hardware_faults, 0);
}
