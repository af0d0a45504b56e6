// handoff.rs
//!
//! Sequencing of the whole stage: descriptor table, interrupt routing,
//! kernel relocation, then the jump.

use crate::diag;
use crate::error::HandoffResult;
use crate::gdt::{LinuxGdt, BOOT_CS, BOOT_DS};
use crate::hw::{CpuRegisters, PortIo};
use crate::linux::MemoryMap;
use crate::loader::{self, BootPayload, KernelHandoff};
use crate::memory::PhysMemory;
use crate::pirq;
use crate::platform::PlatformConfig;

#[derive(Debug, Clone, Default)]
pub struct HandoffOptions {
    /// Dump registers, CPUID and the loader's GDT before touching anything.
    pub debug: bool,
    /// Map supplied by the resident loader; the platform's reference map
    /// is used when absent.
    pub memory_map: Option<MemoryMap>,
}

/// Prepares everything the kernel needs and returns where to jump.
///
/// On error the machine is in an unknown half-built state; the caller halts.
pub fn run_handoff<B: PortIo + CpuRegisters>(
    mem: &mut PhysMemory,
    board: &mut B,
    platform: &PlatformConfig,
    payload: &BootPayload,
    options: &HandoffOptions,
) -> HandoffResult<KernelHandoff> {
    platform.validate()?;
    tracing::info!(platform = platform.name, "Starting Linux handoff");

    if options.debug {
        diag::dump_machine_state(mem, board);
    }

    let gdtr = LinuxGdt::flat().install(mem, board, platform.gdt_addr)?;
    if options.debug {
        if let Ok(lines) = diag::gdt_lines(mem, &gdtr) {
            for line in lines {
                tracing::debug!("{}", line);
            }
        }
    }

    match pirq::synthesize_pirq_table(mem, board, platform) {
        Ok(report) => tracing::debug!(?report, "PCI interrupt routing prepared"),
        Err(e) if e.can_proceed() => {
            tracing::warn!(error = %e, "PCI interrupt routing incomplete; continuing")
        }
        Err(e) => return Err(e),
    }

    let map = match &options.memory_map {
        Some(map) => *map,
        None => MemoryMap::reference(platform.ram_size as u64)?,
    };
    let handoff = loader::load_linux(mem, platform, payload, &map)?;
    if options.debug {
        diag::dump_zero_page(mem, handoff.boot_params_addr);
    }

    tracing::info!(
        entry = handoff.entry_point,
        boot_params = handoff.boot_params_addr,
        "Kernel ready at {:#010x}, zero page at {:#010x}",
        handoff.entry_point,
        handoff.boot_params_addr
    );
    Ok(handoff)
}

/// Jumps into the kernel with the boot selectors loaded. Does not return.
pub fn enter_kernel<C: CpuRegisters>(cpu: &mut C, handoff: &KernelHandoff) -> ! {
    tracing::info!("Booting Linux");
    cpu.enter_kernel(handoff.entry_point, handoff.boot_params_addr, BOOT_CS, BOOT_DS)
}
