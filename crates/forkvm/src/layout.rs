//! Guest-physical layout of the in-guest kernel area.
//!
//! Every machine reserves the first 1 MiB of its main memory region for a
//! tiny resident kernel: descriptor tables, the interrupt stack, a page of
//! hand-assembled stubs, and the initial page tables.  Everything in this
//! module is position-independent relative to `physbase` (the guest-physical
//! base of main memory), so prepared masters and their forks share the same
//! kernel image byte-for-byte.
//!
//! # Kernel Area Layout (offsets from `physbase`)
//!
//! ```text
//! 0x0000  ┌──────────────────────────────┐
//!         │  reserved (never mapped)     │
//! 0x1000  ├──────────────────────────────┤
//!         │  GDT (8 slots, 16-byte TSS)  │
//! 0x1100  │  TSS image (104 bytes)       │
//! 0x1800  │  IDT (32 × 16-byte gates)    │
//! 0x2000  ├──────────────────────────────┤
//!         │  kernel stub page (RX, CPL0) │  syscall entry + vector stubs
//! 0x3000  ├──────────────────────────────┤
//!         │  user stub page (RX, CPL3)   │  vmcall exit trampoline
//! 0x4000  ├──────────────────────────────┤
//!         │  interrupt stack (IST1)      │
//! 0x6000  ├──────────────────────────────┤
//!         │  page-table pages (bump)     │
//! 0x100000├──────────────────────────────┤  ← kernel area end
//!         │  user address space          │
//!         └──────────────────────────────┘
//! ```

use kvm_bindings::{kvm_dtable, kvm_segment, kvm_sregs};

// ═══════════════════════════════════════════════════════════════════════
//  Kernel area offsets
// ═══════════════════════════════════════════════════════════════════════

/// Offset of the GDT in the kernel area.
pub const GDT_OFFSET: u64 = 0x1000;

/// Offset of the 104-byte TSS image.  Shares a page with the GDT and IDT.
pub const TSS_OFFSET: u64 = 0x1100;

/// Offset of the IDT (32 × 16-byte gate descriptors).
pub const IDT_OFFSET: u64 = 0x1800;

/// Offset of the kernel stub page: the `syscall` entry trampoline plus one
/// stub per CPU exception vector.  Mapped execute-only for ring 0.
pub const KERNEL_STUB_OFFSET: u64 = 0x2000;

/// Offset of the user stub page.  Holds the vmcall exit trampoline that a
/// guest function returns into; mapped executable for ring 3.
pub const USER_STUB_OFFSET: u64 = 0x3000;

/// Bottom of the interrupt (IST1) stack.
pub const IST_STACK_OFFSET: u64 = 0x4000;

/// Top of the interrupt stack (exclusive).  Exception frames grow down
/// from here.
pub const IST_STACK_TOP_OFFSET: u64 = 0x6000;

/// First page available to the page-table bump allocator.
pub const PAGE_TABLE_OFFSET: u64 = 0x6000;

/// Total size of the kernel area.  User mappings begin at
/// `physbase + KERNEL_AREA_SIZE`; the page-table allocator may not grow
/// past it.
pub const KERNEL_AREA_SIZE: u64 = 0x10_0000;

// ═══════════════════════════════════════════════════════════════════════
//  Segment selectors
// ═══════════════════════════════════════════════════════════════════════
//
// The GDT order is dictated by the SYSCALL/SYSRET selector arithmetic:
// `syscall` loads CS from STAR[47:32] and SS from STAR[47:32]+8, while
// `sysretq` loads CS from STAR[63:48]+16 and SS from STAR[63:48]+8.

/// Kernel 64-bit code segment.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data segment.
pub const KERNEL_DS: u16 = 0x10;
/// Placeholder 32-bit user code slot (SYSRET base selector).
pub const USER_CS32: u16 = 0x18;
/// User data segment.
pub const USER_DS: u16 = 0x20;
/// User 64-bit code segment.
pub const USER_CS: u16 = 0x28;
/// TSS selector (16-byte descriptor occupying slots 6 and 7).
pub const TSS_SEL: u16 = 0x30;

/// Number of 8-byte GDT slots (six descriptors plus the 16-byte TSS).
pub const GDT_SLOTS: usize = 8;

/// Number of IDT gates written (CPU exception vectors only).
pub const IDT_VECTORS: usize = 32;

// Packed access/flags words: low byte is the descriptor access byte, the
// high nibble is the flags nibble (G/DB/L/AVL).
const GDT_FLAGS_KERNEL_CODE64: u16 = 0xa09b;
const GDT_FLAGS_KERNEL_DATA: u16 = 0xc093;
const GDT_FLAGS_USER_CODE32: u16 = 0xc0fb;
const GDT_FLAGS_USER_DATA: u16 = 0xc0f3;
const GDT_FLAGS_USER_CODE64: u16 = 0xa0fb;
// 64-bit available TSS: present, DPL 0, system, type 0x9, byte granular.
const GDT_FLAGS_TSS: u16 = 0x0089;

// ═══════════════════════════════════════════════════════════════════════
//  Control register and MSR bits
// ═══════════════════════════════════════════════════════════════════════

const CR0_PE: u64 = 1 << 0;
const CR0_MP: u64 = 1 << 1;
const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const CR0_WP: u64 = 1 << 16;
const CR0_AM: u64 = 1 << 18;
const CR0_PG: u64 = 1 << 31;

const CR4_PAE: u64 = 1 << 5;
const CR4_OSFXSR: u64 = 1 << 9;
const CR4_OSXMMEXCPT: u64 = 1 << 10;

const EFER_SCE: u64 = 1 << 0;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const EFER_NXE: u64 = 1 << 11;

/// SYSCALL target CS/SS selectors.
pub const MSR_STAR: u32 = 0xC000_0081;
/// SYSCALL 64-bit entry point.
pub const MSR_LSTAR: u32 = 0xC000_0082;
/// SYSCALL RFLAGS clear mask.
pub const MSR_SFMASK: u32 = 0xC000_0084;

/// Initial RFLAGS for guest user code: reserved bit 1 plus IOPL=3, so the
/// exit trampoline (and guests that want the fast path) may use `out`
/// directly from ring 3.
pub const GUEST_RFLAGS: u64 = 0x3002;

// ═══════════════════════════════════════════════════════════════════════
//  I/O port protocol
// ═══════════════════════════════════════════════════════════════════════

/// The supervisor-call channel: a 32-bit `out` to this port carries the
/// syscall number, or [`EXIT_SIGNAL`] for a clean stop.
pub const SYSCALL_PORT: u16 = 0;

/// Port-0 payload that stops the vCPU cleanly.
pub const EXIT_SIGNAL: u32 = 0xFFFF;

/// Base port of the kernel interrupt surface; vector `v` reports on
/// `INTERRUPT_PORT_BASE + v`.
pub const INTERRUPT_PORT_BASE: u16 = 0x80;

/// One past the last interrupt-surface port.
pub const INTERRUPT_PORT_END: u16 = 0x100;

// ═══════════════════════════════════════════════════════════════════════
//  GDT construction
// ═══════════════════════════════════════════════════════════════════════

/// Construct a raw 8-byte GDT descriptor from packed flags, base, and limit.
///
/// `flags[7:0]` is the access byte (descriptor byte 5) and `flags[15:12]`
/// is the flags nibble (G, D/B, L, AVL in descriptor byte 6).
pub fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xffff)
        | ((base & 0xff_ffff) << 16)
        | (((flags as u64) & 0xff) << 40)
        | (((limit >> 16) & 0xf) << 48)
        | ((((flags as u64) >> 12) & 0xf) << 52)
        | (((base >> 24) & 0xff) << 56)
}

fn get_base(entry: u64) -> u64 {
    ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24)
}

fn get_limit(entry: u64) -> u32 {
    let limit = ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32;
    if get_g(entry) == 1 {
        (limit << 12) | 0xfff
    } else {
        limit
    }
}

fn get_g(entry: u64) -> u8 {
    ((entry >> 55) & 1) as u8
}

fn get_db(entry: u64) -> u8 {
    ((entry >> 54) & 1) as u8
}

fn get_l(entry: u64) -> u8 {
    ((entry >> 53) & 1) as u8
}

fn get_avl(entry: u64) -> u8 {
    ((entry >> 52) & 1) as u8
}

fn get_p(entry: u64) -> u8 {
    ((entry >> 47) & 1) as u8
}

fn get_dpl(entry: u64) -> u8 {
    ((entry >> 45) & 0x3) as u8
}

fn get_s(entry: u64) -> u8 {
    ((entry >> 44) & 1) as u8
}

fn get_type(entry: u64) -> u8 {
    ((entry >> 40) & 0xf) as u8
}

/// Convert a raw GDT descriptor into a KVM segment register.
///
/// `selector` carries the requested privilege level in its low two bits.
pub fn kvm_segment_from_gdt(entry: u64, selector: u16) -> kvm_segment {
    kvm_segment {
        base: get_base(entry),
        limit: get_limit(entry),
        selector,
        type_: get_type(entry),
        present: get_p(entry),
        dpl: get_dpl(entry),
        db: get_db(entry),
        s: get_s(entry),
        l: get_l(entry),
        g: get_g(entry),
        avl: get_avl(entry),
        padding: 0,
        unusable: if get_p(entry) == 0 { 1 } else { 0 },
    }
}

/// The GDT slot contents for a machine whose TSS image lives at
/// `physbase + TSS_OFFSET`.  Slots 6 and 7 form the 16-byte TSS descriptor.
pub fn gdt_table(physbase: u64) -> [u64; GDT_SLOTS] {
    let tss_base = physbase + TSS_OFFSET;
    [
        0,
        gdt_entry(GDT_FLAGS_KERNEL_CODE64, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_KERNEL_DATA, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_USER_CODE32, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_USER_DATA, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_USER_CODE64, 0, 0xfffff),
        gdt_entry(GDT_FLAGS_TSS, (tss_base & 0xffff_ffff) as u32, TSS_SIZE as u32 - 1),
        tss_base >> 32,
    ]
}

/// Ring-3 code segment register (selector carries RPL 3).
pub fn user_code_segment() -> kvm_segment {
    kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_USER_CODE64, 0, 0xfffff), USER_CS | 3)
}

/// Ring-3 data segment register.
pub fn user_data_segment() -> kvm_segment {
    kvm_segment_from_gdt(gdt_entry(GDT_FLAGS_USER_DATA, 0, 0xfffff), USER_DS | 3)
}

/// Task register pointing at the resident TSS.  The in-CPU type is "busy"
/// (11) even though the descriptor in memory says "available".
pub fn tss_segment(physbase: u64) -> kvm_segment {
    kvm_segment {
        base: physbase + TSS_OFFSET,
        limit: TSS_SIZE as u32 - 1,
        selector: TSS_SEL,
        type_: 11,
        present: 1,
        dpl: 0,
        db: 0,
        s: 0,
        l: 0,
        g: 0,
        avl: 0,
        padding: 0,
        unusable: 0,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  TSS and IDT images
// ═══════════════════════════════════════════════════════════════════════

/// Size of the 64-bit TSS image.
pub const TSS_SIZE: usize = 104;

/// Byte offset of IST1 inside the TSS.
const TSS_IST1_OFFSET: usize = 36;

/// Byte offset of the I/O map base field inside the TSS.
const TSS_IOMAP_OFFSET: usize = 102;

/// Build the TSS image: IST1 points at the interrupt stack top, the I/O
/// map base points past the limit (no I/O bitmap; IOPL gates port access).
pub fn tss_image(physbase: u64) -> [u8; TSS_SIZE] {
    let mut tss = [0u8; TSS_SIZE];
    let ist1 = physbase + IST_STACK_TOP_OFFSET;
    tss[TSS_IST1_OFFSET..TSS_IST1_OFFSET + 8].copy_from_slice(&ist1.to_le_bytes());
    tss[TSS_IOMAP_OFFSET..TSS_IOMAP_OFFSET + 2].copy_from_slice(&(TSS_SIZE as u16).to_le_bytes());
    tss
}

/// Encode one 16-byte 64-bit IDT gate as two little-endian words.
pub fn idt_gate(offset: u64, selector: u16, ist: u8, dpl: u8) -> [u64; 2] {
    let low = (offset & 0xffff)
        | ((selector as u64) << 16)
        | ((ist as u64 & 0x7) << 32)
        | (0xE << 40)
        | ((dpl as u64 & 0x3) << 45)
        | (1 << 47)
        | (((offset >> 16) & 0xffff) << 48);
    [low, offset >> 32]
}

/// Build the 32-entry IDT.  Every gate targets the per-vector stub in the
/// kernel stub page through IST1.  Debug (#DB) and breakpoint (#BP) gates
/// are DPL 3 so ring-3 `int1`/`int3` can reach them.
pub fn idt_table(physbase: u64) -> [u64; IDT_VECTORS * 2] {
    let mut table = [0u64; IDT_VECTORS * 2];
    for vector in 0..IDT_VECTORS as u8 {
        let stub = physbase + KERNEL_STUB_OFFSET + vector_stub_offset(vector);
        let dpl = if vector == 1 || vector == 3 { 3 } else { 0 };
        let gate = idt_gate(stub, KERNEL_CS, 1, dpl);
        table[vector as usize * 2] = gate[0];
        table[vector as usize * 2 + 1] = gate[1];
    }
    table
}

// ═══════════════════════════════════════════════════════════════════════
//  Stub pages
// ═══════════════════════════════════════════════════════════════════════

/// Offset of the `syscall` entry trampoline inside the kernel stub page.
pub const SYSCALL_ENTRY_OFFSET: u64 = 0;

/// Byte offset of vector `v`'s stub inside the kernel stub page.
pub fn vector_stub_offset(vector: u8) -> u64 {
    0x100 + vector as u64 * VECTOR_STUB_SIZE
}

/// Space reserved per vector stub.
pub const VECTOR_STUB_SIZE: u64 = 0x20;

/// CPU exception vectors that push an error code.
pub fn exception_has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21 | 29 | 30)
}

/// Assemble the kernel stub page.
///
/// The `syscall` trampoline forwards EAX (the syscall number) to port 0 and
/// `sysretq`s straight back; the host sets return registers while the vCPU
/// is stopped.  Each exception stub reports its vector on port
/// `0x80 + vector`.  The page-fault stub additionally delivers CR2 in RDI
/// and reloads CR3 before returning, which is the TLB invalidation point
/// for pages the host just redirected.
pub fn kernel_stub_page() -> [u8; 4096] {
    let mut page = [0u8; 4096];

    // syscall entry: out %eax, $0 ; sysretq
    page[..5].copy_from_slice(&[0xE7, 0x00, 0x48, 0x0F, 0x07]);

    for vector in 0..IDT_VECTORS as u8 {
        let port = (INTERRUPT_PORT_BASE as u8).wrapping_add(vector);
        let off = vector_stub_offset(vector) as usize;
        let stub: &[u8] = match vector {
            // #PF: save RAX/RDI, RDI = CR2, report, reload CR3, resume.
            14 => &[
                0x50, // push %rax
                0x57, // push %rdi
                0x0F, 0x20, 0xD7, // mov %cr2, %rdi
                0xE7, port, // out %eax, $0x8e
                0x0F, 0x20, 0xD8, // mov %cr3, %rax
                0x0F, 0x22, 0xD8, // mov %rax, %cr3
                0x5F, // pop %rdi
                0x58, // pop %rax
                0x48, 0x83, 0xC4, 0x08, // add $8, %rsp (error code)
                0x48, 0xCF, // iretq
            ],
            // #DB / #BP: report and resume.
            1 | 3 => &[0xE7, port, 0x48, 0xCF],
            v if exception_has_error_code(v) => &[
                0xE7, port, // out %eax, $port
                0x48, 0x83, 0xC4, 0x08, // add $8, %rsp
                0x48, 0xCF, // iretq
            ],
            _ => &[0xE7, port, 0x48, 0xCF],
        };
        page[off..off + stub.len()].copy_from_slice(stub);
    }
    page
}

/// Assemble the user stub page.
///
/// The exit trampoline is the return address every vmcall pushes: it moves
/// the function's RAX return value into RDI (where `return_value()` reads
/// it, matching the register an `exit(status)`-style guest already uses)
/// and writes the exit signal to port 0.
pub fn user_stub_page() -> [u8; 4096] {
    let mut page = [0u8; 4096];
    page[..12].copy_from_slice(&[
        0x48, 0x89, 0xC7, // mov %rax, %rdi
        0xB8, 0xFF, 0xFF, 0x00, 0x00, // mov $0xffff, %eax
        0xE7, 0x00, // out %eax, $0
        0xEB, 0xFE, // jmp .
    ]);
    page
}

// ═══════════════════════════════════════════════════════════════════════
//  Special registers
// ═══════════════════════════════════════════════════════════════════════

/// Assemble the long-mode special registers for user-mode execution:
/// paging enabled, NX enabled, SYSCALL enabled, ring-3 segments, and the
/// descriptor tables at their kernel-area homes.
pub fn long_mode_sregs(physbase: u64, page_table_root: u64) -> kvm_sregs {
    let data = user_data_segment();
    kvm_sregs {
        cr0: CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG,
        cr3: page_table_root,
        cr4: CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT,
        efer: EFER_SCE | EFER_LME | EFER_LMA | EFER_NXE,
        cs: user_code_segment(),
        ds: data,
        es: data,
        fs: data,
        gs: data,
        ss: data,
        tr: tss_segment(physbase),
        gdt: kvm_dtable {
            base: physbase + GDT_OFFSET,
            limit: (GDT_SLOTS * 8 - 1) as u16,
            padding: [0; 3],
        },
        idt: kvm_dtable {
            base: physbase + IDT_OFFSET,
            limit: (IDT_VECTORS * 16 - 1) as u16,
            padding: [0; 3],
        },
        ..Default::default()
    }
}

/// The STAR value matching the GDT order: `syscall` enters with
/// CS=[`KERNEL_CS`], `sysretq` leaves with CS=[`USER_CS`]|3 / SS=[`USER_DS`]|3.
pub fn star_value() -> u64 {
    ((KERNEL_CS as u64) << 32) | (((USER_CS32 | 3) as u64) << 48)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    // -- kernel area --

    #[test]
    fn kernel_area_offsets_are_ordered() {
        const {
            assert!(GDT_OFFSET < TSS_OFFSET);
            assert!(TSS_OFFSET + TSS_SIZE as u64 <= IDT_OFFSET);
            assert!(IDT_OFFSET + (IDT_VECTORS as u64 * 16) <= KERNEL_STUB_OFFSET);
            assert!(KERNEL_STUB_OFFSET < USER_STUB_OFFSET);
            assert!(USER_STUB_OFFSET < IST_STACK_OFFSET);
            assert!(IST_STACK_OFFSET < IST_STACK_TOP_OFFSET);
            assert!(IST_STACK_TOP_OFFSET <= PAGE_TABLE_OFFSET);
            assert!(PAGE_TABLE_OFFSET < KERNEL_AREA_SIZE);
        }
    }

    #[test]
    fn descriptor_tables_share_one_page() {
        const {
            assert!(GDT_OFFSET >> 12 == TSS_OFFSET >> 12);
            assert!(GDT_OFFSET >> 12 == IDT_OFFSET >> 12);
            assert!(IDT_OFFSET + (IDT_VECTORS as u64 * 16) <= GDT_OFFSET + 0x1000);
        }
    }

    // -- GDT encoding --

    #[test]
    fn gdt_null_entry_is_zero() {
        assert_eq!(gdt_entry(0, 0, 0), 0);
    }

    #[test]
    fn gdt_kernel_code_is_long_mode_ring0() {
        let entry = gdt_entry(GDT_FLAGS_KERNEL_CODE64, 0, 0xfffff);
        assert_eq!(get_l(entry), 1);
        assert_eq!(get_db(entry), 0, "D/B must be 0 when L=1");
        assert_eq!(get_dpl(entry), 0);
        assert_eq!(get_p(entry), 1);
    }

    #[test]
    fn gdt_user_code_is_long_mode_ring3() {
        let entry = gdt_entry(GDT_FLAGS_USER_CODE64, 0, 0xfffff);
        assert_eq!(get_l(entry), 1);
        assert_eq!(get_dpl(entry), 3);
        assert_eq!(get_s(entry), 1, "code segment is non-system");
    }

    #[test]
    fn gdt_user_data_is_ring3_writable() {
        let entry = gdt_entry(GDT_FLAGS_USER_DATA, 0, 0xfffff);
        assert_eq!(get_dpl(entry), 3);
        assert_eq!(get_type(entry) & 0x2, 0x2, "data segment must be writable");
    }

    #[test]
    fn gdt_base_roundtrip() {
        let entry = gdt_entry(GDT_FLAGS_USER_DATA, 0x1234_5678, 0xfffff);
        assert_eq!(get_base(entry), 0x1234_5678);
    }

    #[test]
    fn gdt_granular_limit_expands() {
        let entry = gdt_entry(GDT_FLAGS_KERNEL_CODE64, 0, 0xfffff);
        assert_eq!(get_limit(entry), 0xffff_ffff);
    }

    #[test]
    fn tss_descriptor_is_byte_granular_system() {
        let table = gdt_table(0x10_0000);
        let tss_low = table[(TSS_SEL / 8) as usize];
        assert_eq!(get_s(tss_low), 0, "TSS is a system descriptor");
        assert_eq!(get_type(tss_low), 0x9, "available 64-bit TSS");
        assert_eq!(get_g(tss_low), 0);
        assert_eq!(get_limit(tss_low), TSS_SIZE as u32 - 1);
        assert_eq!(get_base(tss_low), 0x10_0000 + TSS_OFFSET);
    }

    #[test]
    fn sysret_selector_arithmetic() {
        // sysretq: CS = STAR[63:48] + 16, SS = STAR[63:48] + 8.
        let base = (star_value() >> 48) as u16;
        assert_eq!((base & !3) + 16, USER_CS);
        assert_eq!((base & !3) + 8, USER_DS);
        // syscall: CS = STAR[47:32], SS = STAR[47:32] + 8.
        let kbase = ((star_value() >> 32) & 0xffff) as u16;
        assert_eq!(kbase, KERNEL_CS);
        assert_eq!(kbase + 8, KERNEL_DS);
    }

    // -- kvm_segment conversion --

    #[test]
    fn user_segments_carry_rpl3() {
        assert_eq!(user_code_segment().selector, USER_CS | 3);
        assert_eq!(user_data_segment().selector, USER_DS | 3);
    }

    #[test]
    fn null_descriptor_is_unusable() {
        let seg = kvm_segment_from_gdt(0, 0);
        assert_eq!(seg.present, 0);
        assert_eq!(seg.unusable, 1);
    }

    // -- IDT --

    #[test]
    fn idt_gate_encodes_offset_and_ist() {
        let gate = idt_gate(0xdead_beef_cafe, KERNEL_CS, 1, 0);
        assert_eq!(gate[0] & 0xffff, 0xcafe);
        assert_eq!((gate[0] >> 48) & 0xffff, 0xbeef);
        assert_eq!(gate[1], 0xdead);
        assert_eq!((gate[0] >> 32) & 0x7, 1, "IST index");
        assert_eq!((gate[0] >> 40) & 0xf, 0xE, "interrupt gate type");
        assert_eq!((gate[0] >> 47) & 1, 1, "present");
    }

    #[test]
    fn idt_debug_gates_are_user_reachable() {
        let physbase = 0x10_0000;
        let table = idt_table(physbase);
        for vector in [1u8, 3] {
            let dpl = (table[vector as usize * 2] >> 45) & 0x3;
            assert_eq!(dpl, 3, "vector {vector} must be DPL 3");
        }
        let pf_dpl = (table[14 * 2] >> 45) & 0x3;
        assert_eq!(pf_dpl, 0, "page fault gate stays DPL 0");
    }

    #[test]
    fn idt_gates_point_into_stub_page() {
        let physbase = 0x10_0000;
        let table = idt_table(physbase);
        for vector in 0..IDT_VECTORS {
            let low = table[vector * 2];
            let offset =
                (low & 0xffff) | (((low >> 48) & 0xffff) << 16) | (table[vector * 2 + 1] << 32);
            assert!(offset >= physbase + KERNEL_STUB_OFFSET);
            assert!(offset < physbase + KERNEL_STUB_OFFSET + 0x1000);
        }
    }

    // -- TSS image --

    #[test]
    fn tss_ist1_points_at_interrupt_stack_top() {
        let physbase = 0x10_0000;
        let tss = tss_image(physbase);
        let ist1 = u64::from_le_bytes(tss[36..44].try_into().unwrap());
        assert_eq!(ist1, physbase + IST_STACK_TOP_OFFSET);
    }

    #[test]
    fn tss_iomap_base_disables_bitmap() {
        let tss = tss_image(0x10_0000);
        let iomap = u16::from_le_bytes(tss[102..104].try_into().unwrap());
        assert_eq!(iomap as usize, TSS_SIZE);
    }

    // -- stubs --

    #[test]
    fn syscall_stub_forwards_eax_to_port_zero() {
        let page = kernel_stub_page();
        assert_eq!(&page[..2], &[0xE7, 0x00], "out %eax, $0");
        assert_eq!(&page[2..5], &[0x48, 0x0F, 0x07], "sysretq");
    }

    #[test]
    fn vector_stubs_report_on_their_port() {
        let page = kernel_stub_page();
        for vector in 0..IDT_VECTORS as u8 {
            let off = vector_stub_offset(vector) as usize;
            let out_at = if vector == 14 { off + 5 } else { off };
            assert_eq!(page[out_at], 0xE7, "vector {vector} must start with out");
            assert_eq!(page[out_at + 1], 0x80 + vector);
        }
    }

    #[test]
    fn page_fault_stub_preserves_clobbered_registers() {
        let page = kernel_stub_page();
        let off = vector_stub_offset(14) as usize;
        assert_eq!(page[off], 0x50, "push %rax");
        assert_eq!(page[off + 1], 0x57, "push %rdi");
        assert_eq!(&page[off + 2..off + 5], &[0x0F, 0x20, 0xD7], "mov %cr2, %rdi");
        // CR3 reload after the report.
        assert_eq!(&page[off + 7..off + 13], &[0x0F, 0x20, 0xD8, 0x0F, 0x22, 0xD8]);
        assert_eq!(&page[off + 19..off + 21], &[0x48, 0xCF], "iretq");
    }

    #[test]
    fn error_code_stubs_discard_the_code() {
        let page = kernel_stub_page();
        let off = vector_stub_offset(13) as usize; // #GP
        assert_eq!(&page[off + 2..off + 6], &[0x48, 0x83, 0xC4, 0x08], "add $8, %rsp");
    }

    #[test]
    fn stubs_fit_their_slots() {
        // The largest stub (page fault) must fit in VECTOR_STUB_SIZE.
        let page = kernel_stub_page();
        let off = vector_stub_offset(14) as usize;
        assert!(page[off + VECTOR_STUB_SIZE as usize - 11..off + VECTOR_STUB_SIZE as usize]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn exit_trampoline_preserves_return_value_in_rdi() {
        let page = user_stub_page();
        assert_eq!(&page[..3], &[0x48, 0x89, 0xC7], "mov %rax, %rdi");
        assert_eq!(&page[3..8], &[0xB8, 0xFF, 0xFF, 0x00, 0x00]);
        assert_eq!(&page[8..10], &[0xE7, 0x00]);
    }

    // -- sregs --

    #[test]
    fn long_mode_sregs_enable_paging_and_syscall() {
        let sregs = long_mode_sregs(0x10_0000, 0x10_6000);
        assert_ne!(sregs.cr0 & CR0_PG, 0);
        assert_ne!(sregs.cr0 & CR0_WP, 0);
        assert_ne!(sregs.cr4 & CR4_PAE, 0);
        assert_ne!(sregs.efer & EFER_LMA, 0);
        assert_ne!(sregs.efer & EFER_SCE, 0);
        assert_ne!(sregs.efer & EFER_NXE, 0);
        assert_eq!(sregs.cr3, 0x10_6000);
        assert_eq!(sregs.gdt.base, 0x10_0000 + GDT_OFFSET);
        assert_eq!(sregs.idt.base, 0x10_0000 + IDT_OFFSET);
        assert_eq!(sregs.cs.dpl, 3, "guest code runs in ring 3");
    }
}
