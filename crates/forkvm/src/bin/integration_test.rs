//! End-to-end tests against real KVM.
//!
//! Covers the whole engine surface: host calls into guest functions,
//! clean exits, execution timeouts, copy-on-write forking and reset,
//! bank-page accounting, and the port-0 syscall channel.
//!
//! Needs `/dev/kvm`; prints a notice and exits successfully without it.
//!
//! Usage:
//!   cargo run --release --bin integration_test

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use forkvm::{Machine, MachineError, MachineOptions, VmArg};

// ═══════════════════════════════════════════════════════════════════════
//  Guest image
// ═══════════════════════════════════════════════════════════════════════
//
// A minimal static ELF64 assembled by hand.  The whole file is mapped
// R+X at 0x400000; the functions live in a text blob at file offset
// 0x80 and are exported through a real symbol table so vmcall-by-name
// works.

const FILE_VADDR: u64 = 0x40_0000;
const TEXT_OFF: usize = 0x80;
const TEXT_SIZE: usize = 0x100;

/// `(name, offset, code)` of every guest function.
const GUEST_FUNCS: &[(&str, usize, &[u8])] = &[
    // _start: exit(0) through the port-0 protocol.
    (
        "_start",
        0x00,
        &[
            0x31, 0xFF, // xor %edi, %edi
            0xB8, 0xFF, 0xFF, 0x00, 0x00, // mov $0xffff, %eax
            0xE7, 0x00, // out %eax, $0
            0xEB, 0xFE, // jmp .
        ],
    ),
    // compute(a, b) = a * b + 1
    (
        "compute",
        0x20,
        &[
            0x48, 0x89, 0xF8, // mov %rdi, %rax
            0x48, 0x0F, 0xAF, 0xC6, // imul %rsi, %rax
            0x48, 0xFF, 0xC0, // inc %rax
            0xC3, // ret
        ],
    ),
    // spin: for (;;);
    ("spin", 0x40, &[0xEB, 0xFE]),
    // write_pages(base): dirty four consecutive pages.
    (
        "write_pages",
        0x60,
        &[
            0xC6, 0x07, 0x01, // movb $1, (%rdi)
            0xC6, 0x87, 0x00, 0x10, 0x00, 0x00, 0x01, // movb $1, 0x1000(%rdi)
            0xC6, 0x87, 0x00, 0x20, 0x00, 0x00, 0x01, // movb $1, 0x2000(%rdi)
            0xC6, 0x87, 0x00, 0x30, 0x00, 0x00, 0x01, // movb $1, 0x3000(%rdi)
            0xC3, // ret
        ],
    ),
    // do_syscalls(n): issue syscall 42, n times.
    (
        "do_syscalls",
        0x80,
        &[
            0x48, 0x85, 0xFF, // test %rdi, %rdi
            0x74, 0x0C, // jz done
            0xB8, 0x2A, 0x00, 0x00, 0x00, // loop: mov $42, %eax
            0x0F, 0x05, // syscall
            0x48, 0xFF, 0xCF, // dec %rdi
            0x75, 0xF4, // jnz loop
            0xC3, // done: ret
        ],
    ),
];

fn put(image: &mut [u8], off: usize, bytes: &[u8]) {
    image[off..off + bytes.len()].copy_from_slice(bytes);
}

fn build_guest_elf() -> Vec<u8> {
    const EHSIZE: usize = 64;
    const PHSIZE: usize = 56;
    const SHSIZE: usize = 64;
    const SYMSIZE: usize = 24;

    let mut text = vec![0u8; TEXT_SIZE];
    for (_, off, code) in GUEST_FUNCS {
        put(&mut text, *off, code);
    }

    // String tables.
    let mut strtab = vec![0u8];
    let mut name_offsets = Vec::new();
    for (name, _, _) in GUEST_FUNCS {
        name_offsets.push(strtab.len() as u32);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }
    let shstrtab = b"\0.text\0.symtab\0.strtab\0.shstrtab\0".to_vec();

    // Symbols: a null entry, then one global FUNC per guest function.
    let mut symtab = vec![0u8; SYMSIZE];
    for ((_, off, code), name_off) in GUEST_FUNCS.iter().zip(&name_offsets) {
        let mut sym = [0u8; SYMSIZE];
        put(&mut sym, 0, &name_off.to_le_bytes());
        sym[4] = 0x12; // STB_GLOBAL | STT_FUNC
        put(&mut sym, 6, &1u16.to_le_bytes()); // .text
        put(&mut sym, 8, &(FILE_VADDR + (TEXT_OFF + off) as u64).to_le_bytes());
        put(&mut sym, 16, &(code.len() as u64).to_le_bytes());
        symtab.extend_from_slice(&sym);
    }

    let mut image = vec![0u8; TEXT_OFF];
    // ELF header.
    put(&mut image, 0, b"\x7fELF");
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little endian
    image[6] = 1; // EV_CURRENT
    put(&mut image, 16, &2u16.to_le_bytes()); // ET_EXEC
    put(&mut image, 18, &62u16.to_le_bytes()); // EM_X86_64
    put(&mut image, 20, &1u32.to_le_bytes());
    let entry = FILE_VADDR + TEXT_OFF as u64; // _start
    put(&mut image, 24, &entry.to_le_bytes());
    put(&mut image, 32, &(EHSIZE as u64).to_le_bytes()); // e_phoff
    put(&mut image, 52, &(EHSIZE as u16).to_le_bytes()); // e_ehsize
    put(&mut image, 54, &(PHSIZE as u16).to_le_bytes());
    put(&mut image, 56, &1u16.to_le_bytes()); // e_phnum
    put(&mut image, 58, &(SHSIZE as u16).to_le_bytes());
    put(&mut image, 60, &5u16.to_le_bytes()); // e_shnum
    put(&mut image, 62, &4u16.to_le_bytes()); // e_shstrndx

    // Program header: map the file R+X.
    let load_size = (TEXT_OFF + TEXT_SIZE) as u64;
    let ph = EHSIZE;
    put(&mut image, ph, &1u32.to_le_bytes()); // PT_LOAD
    put(&mut image, ph + 4, &5u32.to_le_bytes()); // PF_R | PF_X
    put(&mut image, ph + 8, &0u64.to_le_bytes()); // p_offset
    put(&mut image, ph + 16, &FILE_VADDR.to_le_bytes());
    put(&mut image, ph + 24, &FILE_VADDR.to_le_bytes());
    put(&mut image, ph + 32, &load_size.to_le_bytes()); // p_filesz
    put(&mut image, ph + 40, &load_size.to_le_bytes()); // p_memsz
    put(&mut image, ph + 48, &0x1000u64.to_le_bytes());

    image.extend_from_slice(&text);

    let symtab_off = image.len();
    image.extend_from_slice(&symtab);
    let strtab_off = image.len();
    image.extend_from_slice(&strtab);
    let shstrtab_off = image.len();
    image.extend_from_slice(&shstrtab);
    while image.len() % 8 != 0 {
        image.push(0);
    }
    let shoff = image.len() as u64;
    put(&mut image, 40, &shoff.to_le_bytes()); // e_shoff

    let mut shdr = |name: u32,
                    kind: u32,
                    flags: u64,
                    addr: u64,
                    offset: u64,
                    size: u64,
                    link: u32,
                    info: u32,
                    entsize: u64| {
        let mut sh = [0u8; SHSIZE];
        put(&mut sh, 0, &name.to_le_bytes());
        put(&mut sh, 4, &kind.to_le_bytes());
        put(&mut sh, 8, &flags.to_le_bytes());
        put(&mut sh, 16, &addr.to_le_bytes());
        put(&mut sh, 24, &offset.to_le_bytes());
        put(&mut sh, 32, &size.to_le_bytes());
        put(&mut sh, 40, &link.to_le_bytes());
        put(&mut sh, 44, &info.to_le_bytes());
        put(&mut sh, 48, &8u64.to_le_bytes()); // sh_addralign
        put(&mut sh, 56, &entsize.to_le_bytes());
        sh
    };

    let sections = [
        shdr(0, 0, 0, 0, 0, 0, 0, 0, 0),
        shdr(
            1, // .text
            1, // SHT_PROGBITS
            0x6, // ALLOC | EXECINSTR
            FILE_VADDR + TEXT_OFF as u64,
            TEXT_OFF as u64,
            TEXT_SIZE as u64,
            0,
            0,
            0,
        ),
        shdr(
            7, // .symtab
            2, // SHT_SYMTAB
            0,
            0,
            symtab_off as u64,
            ((GUEST_FUNCS.len() + 1) * SYMSIZE) as u64,
            3, // strings in .strtab
            1, // first global symbol
            SYMSIZE as u64,
        ),
        shdr(15, 3, 0, 0, strtab_off as u64, strtab.len() as u64, 0, 0, 0),
        shdr(23, 3, 0, 0, shstrtab_off as u64, shstrtab.len() as u64, 0, 0, 0),
    ];
    for sh in sections {
        image.extend_from_slice(&sh);
    }
    image
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenarios
// ═══════════════════════════════════════════════════════════════════════

static SYSCALL_42_COUNT: AtomicU32 = AtomicU32::new(0);

fn count_syscall_42(machine: &mut Machine) {
    SYSCALL_42_COUNT.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut regs) = machine.registers() {
        regs.rax = 0;
        let _ = machine.set_registers(&regs);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if !Path::new("/dev/kvm").exists() {
        println!("skipping: /dev/kvm is not available");
        return;
    }

    let binary = build_guest_elf();
    let options = MachineOptions::default();
    Machine::install_syscall_handler(42, count_syscall_42);

    let mut passed = 0;
    let mut failed = 0;

    macro_rules! run_test {
        ($name:expr, $func:expr) => {{
            print!("  [{:>2}] {} ... ", passed + failed + 1, $name);
            let start = Instant::now();
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| $func)) {
                Ok(true) => {
                    println!("✅ PASS ({:.2}s)", start.elapsed().as_secs_f64());
                    passed += 1;
                }
                Ok(false) => {
                    println!("❌ FAIL ({:.2}s)", start.elapsed().as_secs_f64());
                    failed += 1;
                }
                Err(e) => {
                    let msg = e
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| e.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    println!("💥 PANIC ({:.2}s): {}", start.elapsed().as_secs_f64(), msg);
                    failed += 1;
                }
            }
        }};
    }

    println!("forkvm integration tests");
    println!();

    // ═══ Test 1: host call into a guest function ═══
    run_test!("vmcall compute(6, 7) returns 43", {
        let mut machine = Machine::new(&binary, &options).expect("create machine");
        machine
            .vmcall("compute", &[VmArg::U64(6), VmArg::U64(7)])
            .expect("vmcall");
        machine.stopped() && machine.return_value().unwrap() == 43
    });

    // ═══ Test 2: clean exit through the port protocol ═══
    run_test!("run() until exit(0)", {
        let mut machine = Machine::new(&binary, &options).expect("create machine");
        machine.run(1_000).expect("run");
        machine.stopped() && machine.return_value().unwrap() == 0
    });

    // ═══ Test 3: wall-clock timeout ═══
    run_test!("timed_vmcall(spin) raises a 50 ms timeout", {
        let mut machine = Machine::new(&binary, &options).expect("create machine");
        let spin = machine.address_of("spin").expect("spin symbol");
        let started = Instant::now();
        let result = machine.timed_vmcall(spin, 50, &[]);
        let elapsed = started.elapsed().as_millis();
        matches!(result, Err(MachineError::Timeout { ticks: 50 }))
            && machine.is_poisoned()
            && elapsed >= 50
            && elapsed < 5_000
    });

    // ═══ Test 4: copy-on-write fork isolation ═══
    run_test!("fork isolation: master 0xAA, child 0xBB, fresh child 0xAA", {
        let mut master = Machine::new(&binary, &options).expect("create master");
        master
            .prepare_copy_on_write(4 * 1024 * 1024, 0)
            .expect("prepare");
        let x = master.stack_address() - 0x1000;
        master.copy_to_guest(x, &[0xAA], false).expect("master write");

        let mut child = master.fork(&options).expect("fork");
        child.copy_to_guest(x, &[0xBB], false).expect("child write");

        let mut master_byte = [0u8; 1];
        let mut child_byte = [0u8; 1];
        master.copy_from_guest(&mut master_byte, x).unwrap();
        child.copy_from_guest(&mut child_byte, x).unwrap();

        let second = master.fork(&options).expect("second fork");
        let mut second_byte = [0u8; 1];
        second.copy_from_guest(&mut second_byte, x).unwrap();

        master_byte[0] == 0xAA && child_byte[0] == 0xBB && second_byte[0] == 0xAA
    });

    // ═══ Test 5: page-fault CoW accounting ═══
    run_test!("guest dirtying 4 unmapped pages banks exactly 4 pages", {
        let mut master = Machine::new(&binary, &options).expect("create master");
        master.prepare_copy_on_write(0, 0).expect("prepare");
        let mut child = master.fork(&options).expect("fork");
        let write_pages = child.address_of("write_pages").expect("symbol");

        // First call warms the call path (stack page, table copies).
        let warm = child.mmap_allocate(4 * 0x1000);
        child
            .timed_vmcall(write_pages, 1_000, &[VmArg::U64(warm)])
            .expect("warm call");
        let before = child.banked_memory_pages();

        let target = child.mmap_allocate(4 * 0x1000);
        child
            .timed_vmcall(write_pages, 1_000, &[VmArg::U64(target)])
            .expect("write call");

        child.banked_memory_pages() - before == 4
    });

    // ═══ Test 6: syscall channel ═══
    run_test!("syscall 42 reaches its handler N times, then exits cleanly", {
        let mut machine = Machine::new(&binary, &options).expect("create machine");
        let do_syscalls = machine.address_of("do_syscalls").expect("symbol");
        SYSCALL_42_COUNT.store(0, Ordering::Relaxed);
        machine
            .timed_vmcall(do_syscalls, 1_000, &[VmArg::U64(5)])
            .expect("call");
        machine.stopped() && SYSCALL_42_COUNT.load(Ordering::Relaxed) == 5
    });

    // ═══ Test 7: reset rewinds a fork ═══
    run_test!("reset_to() restores master state and stays idempotent", {
        let mut master = Machine::new(&binary, &options).expect("create master");
        master
            .prepare_copy_on_write(4 * 1024 * 1024, 0)
            .expect("prepare");
        let x = master.stack_address() - 0x1000;
        master.copy_to_guest(x, &[0xAA], false).expect("master write");

        let mut child = master.fork(&options).expect("fork");
        child.copy_to_guest(x, &[0xBB], false).expect("child write");

        child.reset_to(&master, &options).expect("reset");
        child.reset_to(&master, &options).expect("second reset");

        let mut byte = [0u8; 1];
        child.copy_from_guest(&mut byte, x).unwrap();

        child
            .vmcall("compute", &[VmArg::U64(6), VmArg::U64(7)])
            .expect("vmcall after reset");
        byte[0] == 0xAA && child.return_value().unwrap() == 43
    });

    // ═══ Test 8: fork determinism ═══
    run_test!("two forks produce identical results", {
        let mut master = Machine::new(&binary, &options).expect("create master");
        master.prepare_copy_on_write(0, 0).expect("prepare");
        let mut a = master.fork(&options).expect("fork a");
        let mut b = master.fork(&options).expect("fork b");
        a.vmcall("compute", &[VmArg::U64(11), VmArg::U64(13)]).unwrap();
        b.vmcall("compute", &[VmArg::U64(11), VmArg::U64(13)]).unwrap();
        let ra = a.registers().unwrap();
        let rb = b.registers().unwrap();
        ra.rdi == rb.rdi && ra.rsp == rb.rsp && a.return_value().unwrap() == 11 * 13 + 1
    });

    println!();
    println!("{passed} passed, {failed} failed");
    if failed > 0 {
        std::process::exit(1);
    }
}
