//! rvv-runtime: inspect vector instructions and exercise the context runtime

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use env_logger::Env;

use rvv_runtime::config::Config;
use rvv_runtime::decode::{conflict_pairs, hazards, InstructionDecoder, InstructionDescriptor};
use rvv_runtime::device::registers::{csr, csr_offset};
use rvv_runtime::device::{RegisterIo, SimulatedDevice, VectorCapability, VectorDevice};
use rvv_runtime::state::ContextOwner;
use rvv_runtime::vmem::{Direction, VectorMemoryOp};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--sample-config") {
        print!("{}", Config::sample_config());
        return Ok(());
    }

    match args.get(1).map(String::as_str) {
        Some("decode") => run_decode(&args[2..]),
        Some("caps") => match args.get(2) {
            Some(hex) => run_caps(hex),
            None => bail!("caps needs a configuration register value"),
        },
        Some("demo") => run_demo(),
        Some("-h") | Some("--help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command '{}'", other)
        }
    }
}

fn print_usage() {
    println!("Usage: rvv-runtime <command> [args]");
    println!();
    println!("Commands:");
    println!("  decode <hex>...   Decode instruction words and show their conflicts");
    println!("  caps <hex>        Decode an RVV configuration register");
    println!("  demo              Run a context switch and a load on the simulator");
    println!();
    println!("Options:");
    println!("  --sample-config   Print a sample configuration file");
}

fn parse_hex(text: &str) -> anyhow::Result<u32> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("'{}' is not a hex word", text))
}

fn run_decode(words: &[String]) -> anyhow::Result<()> {
    if words.is_empty() {
        bail!("decode needs at least one instruction word");
    }

    let decoder = InstructionDecoder::new();
    let mut decoded: Vec<InstructionDescriptor> = Vec::new();

    println!("Instructions");
    println!("============");
    for text in words {
        let word = parse_hex(text)?;
        match decoder.decode(word) {
            Ok(desc) => {
                let verdict = match decoder.validate(&desc) {
                    Ok(()) => String::new(),
                    Err(e) => format!("  [invalid: {}]", e),
                };
                println!(
                    "  [{:2}] 0x{:08X}  {:32} {:?}, latency {}{}",
                    decoded.len(),
                    word,
                    desc.to_string(),
                    desc.instruction_type(),
                    desc.latency,
                    verdict
                );
                decoded.push(desc);
            }
            Err(e) => println!("       0x{:08X}  {}", word, e),
        }
    }

    if decoded.len() < 2 {
        return Ok(());
    }

    println!();
    println!("Conflicts");
    println!("=========");
    let pairs = conflict_pairs(&decoded);
    if pairs.is_empty() {
        println!("  none");
    }
    for (i, j) in pairs {
        let kinds: Vec<String> = hazards(&decoded[i], &decoded[j])
            .iter()
            .map(|h| match h.register {
                Some(reg) => format!("{:?}(v{})", h.hazard_type, reg),
                None => format!("{:?}", h.hazard_type),
            })
            .collect();
        println!("  [{:2}] -> [{:2}]  {}", i, j, kinds.join(", "));
    }
    Ok(())
}

fn run_caps(hex: &str) -> anyhow::Result<()> {
    let reg = parse_hex(hex)?;
    let cap = VectorCapability::from_config_register(reg)
        .with_context(|| format!("configuration register 0x{:08X}", reg))?;

    println!("{}", cap);
    println!("  VLENB:             {} bytes", cap.vlenb);
    println!("  lane width:        {} bits", cap.lane_width_bits());
    println!("  register file:     {} bytes (+{} mask)", cap.vregs_bytes(), cap.vmask_bytes());
    println!("  VRF per lane:      {} bytes in {} banks", cap.vrf_bytes_per_lane, cap.vrf_banks_per_lane);
    println!("  multiplier lat.:   {:?}", cap.multiplier_latency);
    println!("  FPU latency:       {:?}", cap.fpu_latency);
    println!();
    println!("  VLMAX    SEW=8  SEW=16  SEW=32  SEW=64");
    for (label, mul, div) in [("mf2", 1, 2), ("m1", 1, 1), ("m2", 2, 1), ("m4", 4, 1), ("m8", 8, 1)] {
        println!(
            "  {:5} {:8} {:7} {:7} {:7}",
            label,
            cap.vlmax(8, mul, div),
            cap.vlmax(16, mul, div),
            cap.vlmax(32, mul, div),
            cap.vlmax(64, mul, div)
        );
    }
    Ok(())
}

fn run_demo() -> anyhow::Result<()> {
    let sim = Arc::new(SimulatedDevice::new(VectorCapability::new(1024, 64, 4)?));
    let device = VectorDevice::open(sim.clone(), sim.clone(), Config::get())?;
    println!("Device: {}", device.capability().context("simulator has no vector unit")?);

    let first = device.create_context(ContextOwner::new(100, "first"))?;
    let second = device.create_context(ContextOwner::new(200, "second"))?;

    // Give each context a distinct configuration before capturing it
    sim.write64(csr_offset(csr::VL), 16)?;
    sim.write64(csr_offset(csr::VTYPE), 0x10)?;
    device.save_context(&first)?;
    sim.write64(csr_offset(csr::VL), 64)?;
    sim.write64(csr_offset(csr::VTYPE), 0x00)?;
    device.save_context(&second)?;

    device.switch_to(&first)?;
    device.switch_to(&second)?;
    device.switch_to(&first)?;
    let bound = device.vrf()?.bound_context(device.io())?;
    println!(
        "Running context {} ({}), register window bound to {}, vl = {}",
        first.id(),
        first.state(),
        bound,
        sim.read64(csr_offset(csr::VL))?
    );

    let preempted = device.preempt_current()?;
    if let Some(ctx) = preempted {
        println!("Preempted context {} ({})", ctx.id(), ctx.state());
        device.resume(&ctx)?;
    }

    let data: Vec<u8> = (0..64).collect();
    sim.write_memory(0x1_0000, &data);
    let mut load = VectorMemoryOp::unit_stride(Direction::Load, 0x1_0000, 16, 4);
    let report = device.execute_memop(&mut load, None)?;
    println!(
        "Loaded {} bytes in {} polls ({:?}); first word {:02X?}",
        report.bytes,
        report.polls,
        report.elapsed,
        &load.payload()[..4]
    );

    println!();
    println!("{}", first.stats());
    println!("{}", second.stats());
    if let Some(stats) = device.stats().contexts {
        println!("{}", stats);
    }

    device.destroy_context(&first)?;
    device.destroy_context(&second)?;
    device.fini()?;

    let sim_stats = sim.stats();
    println!();
    println!(
        "Simulator: {} memops, {} DMA buffers allocated, {} live",
        sim_stats.memops_started,
        sim_stats.dma_allocs,
        sim_stats.live_dma_buffers()
    );
    Ok(())
}
