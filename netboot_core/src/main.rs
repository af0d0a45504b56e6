mod arch;
mod config;
mod diag;
mod error;
mod gdt;
mod handoff;
mod hw;
mod linux;
mod loader;
mod memory;
mod pci;
mod pirq;
mod platform;
mod sim;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::HandoffConfig;
use crate::error::HandoffResult;
use crate::handoff::HandoffOptions;
use crate::linux::MemoryMap;
use crate::loader::{BootPayload, Ramdisk};
use crate::memory::PhysMemory;
use crate::platform::PlatformConfig;
use crate::sim::SimulatedBoard;

const PAGE_SIZE: u32 = 4096;

fn align_up(addr: u32) -> u32 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Puts the files where the resident loader would have left them.
fn place_payload(
    mem: &mut PhysMemory,
    platform: &PlatformConfig,
    config: &HandoffConfig,
) -> HandoffResult<BootPayload> {
    let kernel = std::fs::read(&config.kernel)?;
    mem.write_slice(platform.payload_base as usize, &kernel)?;
    tracing::info!(
        path = %config.kernel.display(),
        size = kernel.len(),
        "bzImage placed at {:#010x}",
        platform.payload_base
    );

    let ramdisk = match &config.initrd {
        Some(path) => {
            let data = std::fs::read(path)?;
            let addr = align_up(platform.payload_base + kernel.len() as u32);
            mem.write_slice(addr as usize, &data)?;
            tracing::info!(path = %path.display(), size = data.len(), "initrd placed at {:#010x}", addr);
            Some(Ramdisk { addr, size: data.len() as u32 })
        }
        None => None,
    };

    let cmdline = config.cmdline.as_bytes();
    mem.write_slice(platform.cmdline_addr as usize, cmdline)?;
    mem.write_u8(platform.cmdline_addr as usize + cmdline.len(), 0)?;

    Ok(BootPayload {
        image_addr: platform.payload_base,
        image_size: kernel.len() as u32,
        cmdline_addr: platform.cmdline_addr,
        cmdline_len: cmdline.len() as u32,
        ramdisk,
    })
}

fn run(config: &HandoffConfig) -> HandoffResult<()> {
    config.validate()?;

    let platform = PlatformConfig {
        ram_size: config.memory_bytes(),
        ..PlatformConfig::evo_t30()
    };
    let mut mem = PhysMemory::new(platform.ram_size as usize)?;
    let payload = place_payload(&mut mem, &platform, config)?;

    let memory_map = match &config.e820 {
        Some(path) => Some(MemoryMap::parse(&std::fs::read(path)?)?),
        None => None,
    };
    let options = HandoffOptions { debug: config.debug, memory_map };

    let mut board = SimulatedBoard::evo_t30();
    let handoff = handoff::run_handoff(&mut mem, &mut board, &platform, &payload, &options)?;

    println!(">>> [Handoff] Platform: {}", platform.name);
    println!(">>> [Handoff] Kernel entry: {:#010x}", handoff.entry_point);
    println!(">>> [Handoff] Zero page:    {:#010x}", handoff.boot_params_addr);
    println!(">>> [Handoff] GDT:          {:#010x}", platform.gdt_addr);
    println!(">>> [Handoff] $PIR table:   {:#010x}", platform.pirq_table_addr);

    handoff::enter_kernel(&mut board, &handoff)
}

fn main() {
    let config = HandoffConfig::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if let Err(e) = run(&config) {
        tracing::error!(error = %e, severity = ?e.severity(), "Handoff failed");
        eprintln!(">>> [CRITICAL] {}", e);
        std::process::exit(if e.requires_halt() { 2 } else { 1 });
    }
}
