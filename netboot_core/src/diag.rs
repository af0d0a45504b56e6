// diag.rs
//!
//! Debug-mode dumps of the machine state the resident loader hands us.
//! Each dump is built as text lines first so it can be checked without a
//! subscriber, then emitted through `tracing`.

use crate::error::HandoffResult;
use crate::gdt;
use crate::hw::{CpuRegisters, DescriptorTablePointer};
use crate::linux::{ZeroPage, ZERO_PAGE_SIZE};
use crate::memory::PhysMemory;

const GATE_SIZE: usize = 8;

/// Segment, flag and control registers.
pub fn register_lines<C: CpuRegisters>(cpu: &mut C) -> Vec<String> {
    let seg = cpu.segment_registers();
    vec![
        format!("CS: {:#06x}  DS: {:#06x}  SS: {:#06x}", seg.cs, seg.ds, seg.ss),
        format!("ES: {:#06x}  FS: {:#06x}  GS: {:#06x}", seg.es, seg.fs, seg.gs),
        format!("EFLAGS: {:#010x}", cpu.eflags()),
        format!("CR0: {:#010x}  CR2: {:#010x}", cpu.cr0(), cpu.cr2()),
        format!("CR3: {:#010x}  CR4: {:#010x}", cpu.cr3(), cpu.cr4()),
    ]
}

/// CPUID leaves 0 to 2; the GX1 knows nothing higher.
pub fn cpuid_lines<C: CpuRegisters>(cpu: &mut C) -> Vec<String> {
    let leaf0 = cpu.cpuid(0);
    let mut lines = vec![format!(
        "CPUID0: EAX={:#010x} \"{}\"",
        leaf0.eax,
        String::from_utf8_lossy(&leaf0.vendor())
    )];
    for leaf in 1..=leaf0.eax.min(2) {
        let r = cpu.cpuid(leaf);
        lines.push(format!(
            "CPUID{}: EAX={:#010x} EBX={:#010x} ECX={:#010x} EDX={:#010x}",
            leaf, r.eax, r.ebx, r.ecx, r.edx
        ));
    }
    lines
}

/// Header plus one line per descriptor of the table `gdtr` points at.
pub fn gdt_lines(mem: &PhysMemory, gdtr: &DescriptorTablePointer) -> HandoffResult<Vec<String>> {
    let mut lines = vec![format!("GDT at {:#010x} limit {:#06x}", gdtr.base, gdtr.limit)];
    for (i, desc) in gdt::read_table(mem, gdtr)?.iter().enumerate() {
        let addr = gdtr.base as usize + i * gdt::DESCRIPTOR_SIZE;
        lines.push(format!("[{:#010x}] {}", addr, desc));
    }
    Ok(lines)
}

/// Header plus one line per gate of the table `idtr` points at.
pub fn idt_lines(mem: &PhysMemory, idtr: &DescriptorTablePointer) -> HandoffResult<Vec<String>> {
    let mut lines = vec![format!("IDT at {:#010x} limit {:#06x}", idtr.base, idtr.limit)];
    let raw = mem.read_slice(idtr.base as usize, idtr.entries() * GATE_SIZE)?;
    for (i, gate) in raw.chunks_exact(GATE_SIZE).enumerate() {
        let offset = u16::from_le_bytes([gate[0], gate[1]]) as u32
            | (u16::from_le_bytes([gate[6], gate[7]]) as u32) << 16;
        let segment = u16::from_le_bytes([gate[2], gate[3]]);
        let flags = u16::from_le_bytes([gate[4], gate[5]]);
        lines.push(format!(
            "[{:#010x}] segment={:#06x} offset={:#010x} flags={:#06x} DPL={} P={}",
            idtr.base as usize + i * GATE_SIZE,
            segment,
            offset,
            flags,
            (flags >> 13) & 3,
            flags >> 15
        ));
    }
    Ok(lines)
}

pub fn zero_page_lines(zero_page: &ZeroPage) -> Vec<String> {
    let mut lines = vec![format!("{:?}", zero_page)];
    if let Ok(map) = zero_page.memory_map() {
        lines.extend(map.entries().iter().map(|e| format!("e820: {}", e)));
    }
    lines
}

fn emit(section: &str, lines: &[String]) {
    for line in lines {
        tracing::info!(section, "{}", line);
    }
}

/// Dumps registers, CPUID and the loader's active GDT and IDT. Failures to
/// read either table are logged and otherwise ignored.
pub fn dump_machine_state<C: CpuRegisters>(mem: &PhysMemory, cpu: &mut C) {
    emit("regs", &register_lines(cpu));
    emit("cpuid", &cpuid_lines(cpu));

    let gdtr = cpu.store_gdt();
    match gdt_lines(mem, &gdtr) {
        Ok(lines) => emit("gdt", &lines),
        Err(e) => tracing::warn!(error = %e, base = gdtr.base, "Cannot read active GDT"),
    }

    let idtr = cpu.store_idt();
    match idt_lines(mem, &idtr) {
        Ok(lines) => emit("idt", &lines),
        Err(e) => tracing::warn!(error = %e, base = idtr.base, "Cannot read active IDT"),
    }
}

/// Dumps the zero page as the kernel will find it.
pub fn dump_zero_page(mem: &PhysMemory, addr: u32) {
    match mem.read_slice(addr as usize, ZERO_PAGE_SIZE) {
        Ok(raw) => {
            let mut bytes = [0u8; ZERO_PAGE_SIZE];
            bytes.copy_from_slice(raw);
            emit("zero page", &zero_page_lines(&ZeroPage::from_bytes(bytes)));
        }
        Err(e) => tracing::warn!(error = %e, addr, "Cannot read zero page"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gdt::LinuxGdt;
    use crate::hw::CpuidResult;
    use crate::sim::SimulatedBoard;

    #[test]
    fn test_register_lines() {
        let mut board = SimulatedBoard::evo_t30();
        let lines = register_lines(&mut board);
        assert_eq!(lines[0], "CS: 0x0008  DS: 0x0010  SS: 0x0010");
        assert_eq!(lines[3], "CR0: 0x00000011  CR2: 0x00000000");
    }

    #[test]
    fn test_cpuid_lines() {
        let mut board = SimulatedBoard::evo_t30();
        let lines = cpuid_lines(&mut board);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "CPUID0: EAX=0x00000002 \"CyrixInstead\"");
        assert!(lines[1].starts_with("CPUID1: EAX=0x00000540"));
    }

    #[test]
    fn test_cpuid_stops_at_leaf_two() {
        let mut board = SimulatedBoard::evo_t30();
        let leaf0 = board.cpuid(0);
        board.set_cpuid(0, CpuidResult { eax: 5, ..leaf0 });
        board.set_cpuid(3, CpuidResult { eax: 0xDEAD, ..CpuidResult::default() });
        assert_eq!(cpuid_lines(&mut board).len(), 3);

        board.set_cpuid(0, CpuidResult { eax: 0, ..leaf0 });
        assert_eq!(cpuid_lines(&mut board).len(), 1);
    }

    #[test]
    fn test_idt_lines() {
        let mut mem = PhysMemory::new(0x1000).unwrap();
        let mut board = SimulatedBoard::evo_t30();
        // interrupt gate 0x0008:0x00123456, present, DPL 0
        mem.write_slice(0x608, &[0x56, 0x34, 0x08, 0x00, 0x00, 0x8E, 0x12, 0x00]).unwrap();

        let idtr = board.store_idt();
        let lines = idt_lines(&mem, &idtr).unwrap();
        assert_eq!(lines.len(), 17);
        assert_eq!(lines[0], "IDT at 0x00000600 limit 0x007f");
        assert_eq!(
            lines[2],
            "[0x00000608] segment=0x0008 offset=0x00123456 flags=0x8e00 DPL=0 P=1"
        );
        assert_eq!(
            lines[1],
            "[0x00000600] segment=0x0000 offset=0x00000000 flags=0x0000 DPL=0 P=0"
        );
    }

    #[test]
    fn test_gdt_lines() {
        let mut mem = PhysMemory::new(0x10000).unwrap();
        let table = LinuxGdt::flat();
        table.write_to(&mut mem, 0x8000).unwrap();

        let lines = gdt_lines(&mem, &table.pointer(0x8000)).unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "GDT at 0x00008000 limit 0x001f");
        assert_eq!(
            lines[3],
            "[0x00008010] base=0x00000000 limit=0xfffff AVL=0 D/B=1 DPL=0 G=1 P=1 S=1 TYPE=0xb"
        );
    }

    #[test]
    fn test_gdt_outside_memory() {
        let mem = PhysMemory::new(0x1000).unwrap();
        let gdtr = DescriptorTablePointer { limit: 0x17, base: 0x8000 };
        assert!(gdt_lines(&mem, &gdtr).is_err());

        let mut board = SimulatedBoard::evo_t30();
        dump_machine_state(&mem, &mut board);
    }

    #[test]
    fn test_zero_page_lines() {
        let mut zp = ZeroPage::new();
        zp.set_memory_map(&crate::linux::MemoryMap::reference(0x01D8_0000).unwrap());
        let lines = zero_page_lines(&zp);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "e820: [mem 0x000000000009f000-0x000000000009ffff] reserved");
    }
}
