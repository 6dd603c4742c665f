//! The top-level guest object.
//!
//! A [`Machine`] composes a KVM virtual machine, one [`Vcpu`], a
//! [`GuestMemory`], and a loaded ELF image, and drives the whole
//! lifecycle: setup, the run loop with its exit dispatcher, host calls
//! into guest functions, copy-on-write forking, and cheap resets back to
//! a master's state.
//!
//! Guest code executes in ring 3 under a resident micro-kernel the
//! machine writes into the low megabyte of guest memory (see
//! [`crate::layout`]).  The only wire between guest and host is the I/O
//! port protocol: port 0 carries system calls and the clean-exit signal,
//! ports `0x80..0x100` carry CPU exception reports from the in-guest
//! stubs, and every other port is forwarded to host-installed callbacks.
//!
//! Dropping a machine releases its KVM handles, its execution timer, and
//! its bank pages; nothing outlives the value.

use std::any::Any;
use std::sync::{Arc, Mutex, RwLock};

use kvm_bindings::{
    kvm_fpu, kvm_msr_entry, kvm_regs, kvm_sregs, kvm_userspace_memory_region, Msrs,
    KVM_MAX_CPUID_ENTRIES, KVM_MEM_READONLY,
};
use kvm_ioctls::{Kvm, VcpuExit, VmFd};
use log::{debug, info, warn};
use thiserror::Error;

use crate::bank::ARENA_SIZE;
use crate::cpu::{self, exception_name, TimerGuard, Vcpu, VcpuError};
use crate::layout::{
    self, EXIT_SIGNAL, GUEST_RFLAGS, INTERRUPT_PORT_BASE, INTERRUPT_PORT_END, KERNEL_AREA_SIZE,
    SYSCALL_PORT,
};
use crate::loader::{self, LoadedImage, LoaderError};
use crate::memory::{GuestMemory, MemoryError, SlotUpdate};
use crate::paging::{
    page_align, page_align_up, PageTableBuilder, PagingError, PDE64_NX, PDE64_RW, PDE64_USER,
};

/// Highest guest-virtual growth of the program break above the heap base.
pub const BRK_MAX: u64 = 0x10_0000;

/// Number of syscall-handler slots.
pub const MAX_SYSCALLS: usize = 512;

/// Mask applied to the fault address reported in RDI: bit 63 marks a
/// remote access and the low 12 bits are page offset, neither of which
/// identifies the page.
const REMOTE_MARKER_MASK: u64 = 0x8000_0000_0000_0FFF;

/// Remote-access marker bit.
const REMOTE_MARKER: u64 = 1 << 63;

/// KVM slot index a connected peer's main region is mirrored under.
const REMOTE_MAIN_SLOT: u32 = 64;

/// First KVM slot index for mirrored peer bank arenas.
const REMOTE_ARENA_SLOT: u32 = 65;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum MachineError {
    /// The guest exceeded its wall-clock budget (milliseconds).
    #[error("execution timed out after {ticks} ms")]
    Timeout { ticks: u32 },

    #[error("halt from kernel space")]
    KernelHalt,

    #[error("shutdown: triple fault")]
    TripleFault,

    #[error("failed to enter guest (reason {0:#x})")]
    FailEntry(u64),

    /// The guest touched guest-physical space no slot covers, or wrote a
    /// read-only slot through a writable mapping.
    #[error("memory access outside physical memory at {0:#x}")]
    Mmio(u64),

    /// CR3, GDT, or IDT no longer match their configured values.
    #[error("kernel integrity loss detected")]
    KernelIntegrity,

    #[error("{name} (vector {vector})")]
    CpuException { name: &'static str, vector: u8 },

    /// An interrupt report arrived from outside the kernel stubs.
    #[error("security violation in interrupt handling (vector {0})")]
    SecurityViolation(u8),

    #[error("unexpected exit: {0}")]
    UnexpectedExit(String),

    #[error("hypervisor internal error")]
    InternalError,

    #[error("running the vCPU failed: {0}")]
    RunFailed(#[source] kvm_ioctls::Error),

    #[error("hypervisor call failed: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Paging(#[from] PagingError),

    #[error("failed to arm the execution timer: {0}")]
    Timer(#[source] std::io::Error),

    #[error("failed to assemble the MSR load table")]
    MsrSetup,

    /// A previous run raised a guest-execution error; only `reset_to`
    /// or destruction are valid now.
    #[error("machine is poisoned; reset it or drop it")]
    Poisoned,

    #[error("no such guest symbol: {0}")]
    UnknownSymbol(String),

    #[error("{0} integer arguments exceed the six-register convention")]
    TooManyArguments(usize),

    #[error("machine layout error: {0}")]
    Layout(&'static str),

    #[error("machine is not a prepared master")]
    NotPrepared,

    #[error("forked machines cannot be forked or prepared")]
    ForkedMachine,

    #[error("short-lived machines cannot be prepared")]
    ShortLived,

    #[error("reset target is not a forked machine")]
    NotForked,

    #[error("operation requires a stopped vCPU")]
    NotStopped,

    #[error("remote peer is not connected with memory mapping")]
    RemoteUnavailable,
}

impl MachineError {
    /// Guest-execution errors leave the machine in an undefined state and
    /// poison it.
    pub fn poisons(&self) -> bool {
        matches!(
            self,
            MachineError::Timeout { .. }
                | MachineError::KernelHalt
                | MachineError::TripleFault
                | MachineError::FailEntry(_)
                | MachineError::Mmio(_)
                | MachineError::KernelIntegrity
                | MachineError::CpuException { .. }
                | MachineError::SecurityViolation(_)
                | MachineError::UnexpectedExit(_)
                | MachineError::InternalError
                | MachineError::RunFailed(_)
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Options
// ═══════════════════════════════════════════════════════════════════════

/// Construction-time configuration.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Bytes of guest main memory.
    pub max_mem: u64,
    /// Bytes of guest stack, placed directly below the loaded image.
    pub stack_size: u64,
    /// Override for the heap base; defaults to the page-aligned end of
    /// the loaded image.
    pub heap_base: Option<u64>,
    /// Guest-physical (and lowest guest-virtual) base of main memory.
    pub vmem_base: u64,
    /// Map executable segments writable so the text can be patched.
    pub remappable_text: bool,
    /// Log every loaded segment.
    pub verbose_loader: bool,
    /// After `prepare_copy_on_write`, let the master keep writing its
    /// main memory in place.  Writes become visible to every fork; only
    /// meaningful while no fork is running.
    pub master_direct_memory_writes: bool,
    /// The machine will never become a CoW master; `prepare_copy_on_write`
    /// is rejected and no master register state is retained.
    pub short_lived: bool,
    /// On `reset_to`, keep the bank arenas (and their slots) registered
    /// instead of releasing them, trading memory for reset speed.
    pub reset_keep_all_work_memory: bool,
    /// Symbol resolved at load time as the lightweight reentry point.
    pub reentry_symbol: Option<String>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            max_mem: 32 * 1024 * 1024,
            stack_size: 1024 * 1024,
            heap_base: None,
            vmem_base: 0x10_0000,
            remappable_text: false,
            verbose_loader: false,
            master_direct_memory_writes: false,
            short_lived: false,
            reset_keep_all_work_memory: false,
            reentry_symbol: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Handler registries
// ═══════════════════════════════════════════════════════════════════════

/// Handler for one installed system call.
pub type SyscallHandler = for<'a, 'm> fn(&'a mut Machine<'m>);
/// Fallback handler receiving the uninstalled syscall number.
pub type NumberedSyscallHandler = for<'a, 'm> fn(&'a mut Machine<'m>, u32);
/// Callback for guest `out` on ports outside the engine protocol.
pub type OutputHandler = for<'a, 'm> fn(&'a mut Machine<'m>, u16, u32);
/// Callback for guest `in`; the returned value is delivered to the guest.
pub type InputHandler = for<'a, 'm> fn(&'a mut Machine<'m>, u16) -> u32;

struct HandlerTable {
    syscalls: [Option<SyscallHandler>; MAX_SYSCALLS],
    unhandled: NumberedSyscallHandler,
    on_input: InputHandler,
    on_output: OutputHandler,
    on_breakpoint: SyscallHandler,
}

static HANDLERS: RwLock<HandlerTable> = RwLock::new(HandlerTable {
    syscalls: [None; MAX_SYSCALLS],
    unhandled: default_unhandled_syscall,
    on_input: default_input,
    on_output: default_output,
    on_breakpoint: default_breakpoint,
});

fn default_unhandled_syscall(machine: &mut Machine, nr: u32) {
    warn!("unhandled system call {nr}");
    if let Ok(mut regs) = machine.registers() {
        regs.rax = (-(libc::ENOSYS as i64)) as u64;
        let _ = machine.set_registers(&regs);
    }
}

fn default_input(_machine: &mut Machine, _port: u16) -> u32 {
    0
}

fn default_output(_machine: &mut Machine, port: u16, value: u32) {
    debug!("guest output: port {port:#x} value {value:#x}");
}

fn default_breakpoint(machine: &mut Machine) {
    if let Ok(regs) = machine.registers() {
        debug!("guest breakpoint at {:#x}", regs.rip);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Supporting types
// ═══════════════════════════════════════════════════════════════════════

/// Diagnostics sink; defaults to the `log` facade.
pub type Printer = Arc<dyn Fn(&str) + Send + Sync>;

fn default_printer() -> Printer {
    Arc::new(|line: &str| log::error!("{line}"))
}

/// One argument of a host call, placed per the System V AMD64 convention.
/// Strings and byte buffers are pushed on the guest stack and passed by
/// address.
pub enum VmArg<'a> {
    U64(u64),
    I64(i64),
    Str(&'a str),
    Bytes(&'a [u8]),
}

/// Register state captured when a master is prepared, cloned into every
/// fork and reapplied on reset.
struct MasterState {
    regs: kvm_regs,
    sregs: kvm_sregs,
    fpu: kvm_fpu,
}

struct RemotePeer<'m> {
    machine: Arc<Mutex<Machine<'m>>>,
    /// Guest-virtual addresses at or above this belong to the peer.
    base: u64,
    /// Whether the peer's memory slots are mirrored into this machine.
    mapped: bool,
    /// Peer bank arenas mirrored so far.
    mirrored_arenas: usize,
}

enum Step {
    Continue,
    Stopped,
    Debug,
}

fn io_value(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let n = data.len().min(4);
    bytes[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(bytes)
}

// ═══════════════════════════════════════════════════════════════════════
//  Machine
// ═══════════════════════════════════════════════════════════════════════

/// One guest: a KVM VM, a vCPU, guest memory, and a loaded program.
///
/// The machine borrows the guest binary for its whole lifetime.  It is
/// thread-affine: run it on the thread that created it, or call
/// [`migrate_to_this_thread`](Self::migrate_to_this_thread) first.
pub struct Machine<'m> {
    binary: &'m [u8],
    #[allow(dead_code)]
    kvm: Kvm,
    vm: Arc<VmFd>,
    vcpu: Vcpu,
    memory: GuestMemory,
    image: LoadedImage,
    options: MachineOptions,

    start_address: u64,
    stack_address: u64,
    heap_address: u64,
    kernel_end: u64,
    reentry_address: Option<u64>,

    cached_sregs: kvm_sregs,
    master_state: Option<Box<MasterState>>,
    prepped: bool,
    forked: bool,
    poisoned: bool,
    mmap_cursor: u64,

    remote: Option<RemotePeer<'m>>,
    printer: Printer,
    userdata: Option<Box<dyn Any + Send>>,
}

impl<'m> Machine<'m> {
    // ─── Construction ────────────────────────────────────────────────

    /// Load `binary` into a fresh guest.
    pub fn new(binary: &'m [u8], options: &MachineOptions) -> Result<Self, MachineError> {
        cpu::install_timeout_handler().map_err(MachineError::Timer)?;

        let kvm = Kvm::new()?;
        let vm = Arc::new(kvm.create_vm()?);
        let physbase = options.vmem_base;
        let mut memory = GuestMemory::new(physbase, options.max_mem)?;
        let kernel_end = physbase + KERNEL_AREA_SIZE;

        let (image, segments) = loader::load(
            &memory,
            binary,
            kernel_end,
            physbase + options.max_mem,
            options.verbose_loader,
        )?;

        write_kernel_area(&memory, physbase)?;

        let stack_address = page_align(image.lowest_address());
        if stack_address < kernel_end + options.stack_size {
            return Err(MachineError::Layout("stack would overlap the kernel area"));
        }
        let heap_address = options
            .heap_base
            .unwrap_or_else(|| page_align_up(image.end()));

        let mut builder = PageTableBuilder::new(memory.raw(), physbase)?;
        // Descriptor tables: kernel, no-execute.
        builder.map_identity(
            physbase + layout::GDT_OFFSET,
            0x1000,
            PDE64_RW | PDE64_NX,
        )?;
        // Kernel stubs: execute-only for ring 0.
        builder.map_identity(physbase + layout::KERNEL_STUB_OFFSET, 0x1000, 0)?;
        // Exit trampoline: executable from ring 3.
        builder.map_identity(physbase + layout::USER_STUB_OFFSET, 0x1000, PDE64_USER)?;
        // Interrupt stack.
        builder.map_identity(
            physbase + layout::IST_STACK_OFFSET,
            layout::IST_STACK_TOP_OFFSET - layout::IST_STACK_OFFSET,
            PDE64_RW | PDE64_NX,
        )?;
        for seg in &segments {
            let mut flags = PDE64_USER;
            if seg.writable || (seg.executable && options.remappable_text) {
                flags |= PDE64_RW;
            }
            if !seg.executable {
                flags |= PDE64_NX;
            }
            builder.map_identity(seg.vaddr, seg.len, flags)?;
        }
        builder.map_identity(
            stack_address - options.stack_size,
            options.stack_size,
            PDE64_USER | PDE64_RW | PDE64_NX,
        )?;
        let root = builder.root();
        let table_pages = builder.table_pages();
        memory.set_page_tables(root);

        let vcpu = Vcpu::new(&vm)?;
        let cached_sregs = layout::long_mode_sregs(physbase, root);
        setup_vcpu(&kvm, &vcpu, &cached_sregs, physbase)?;

        let reentry_address = options
            .reentry_symbol
            .as_deref()
            .and_then(|name| image.address_of(name));

        let mut machine = Self {
            binary,
            kvm,
            vm,
            vcpu,
            memory,
            start_address: image.entry(),
            stack_address,
            heap_address,
            kernel_end,
            reentry_address,
            image,
            options: options.clone(),
            cached_sregs,
            master_state: None,
            prepped: false,
            forked: false,
            poisoned: false,
            mmap_cursor: heap_address + BRK_MAX,
            remote: None,
            printer: default_printer(),
            userdata: None,
        };
        machine.apply_slot_updates()?;

        info!(
            "machine created: {} MB main memory at {:#x}, entry {:#x}, stack {:#x}, \
             heap {:#x}, {} initial table pages",
            options.max_mem / (1024 * 1024),
            physbase,
            machine.start_address,
            machine.stack_address,
            machine.heap_address,
            table_pages,
        );
        Ok(machine)
    }

    /// Construct a copy-on-write fork of a prepared master.
    ///
    /// The fork shares the master's memory read-only and costs a few page
    /// allocations, not a guest-memory copy.
    pub fn fork(&self, options: &MachineOptions) -> Result<Machine<'m>, MachineError> {
        if self.forked {
            return Err(MachineError::ForkedMachine);
        }
        let master_state = self.master_state.as_ref().ok_or(MachineError::NotPrepared)?;

        let kvm = Kvm::new()?;
        let vm = Arc::new(kvm.create_vm()?);
        let memory = GuestMemory::fork_from(&self.memory)?;

        let vcpu = Vcpu::new(&vm)?;
        let mut sregs = master_state.sregs;
        sregs.cr3 = memory.page_tables();
        setup_vcpu(&kvm, &vcpu, &sregs, self.memory.physbase())?;
        vcpu.fd.set_regs(&master_state.regs)?;
        vcpu.fd.set_fpu(&master_state.fpu)?;

        let mut machine = Machine {
            binary: self.binary,
            kvm,
            vm,
            vcpu,
            memory,
            image: self.image.clone(),
            options: options.clone(),
            start_address: self.start_address,
            stack_address: self.stack_address,
            heap_address: self.heap_address,
            kernel_end: self.kernel_end,
            reentry_address: self.reentry_address,
            cached_sregs: sregs,
            master_state: None,
            prepped: false,
            forked: true,
            poisoned: false,
            mmap_cursor: self.mmap_cursor,
            remote: None,
            printer: self.printer.clone(),
            userdata: None,
        };
        machine.apply_slot_updates()?;
        debug!("forked machine: cr3 {:#x}", machine.memory.page_tables());
        Ok(machine)
    }

    /// Turn this machine into a CoW master: every user page at or above
    /// `shared_boundary` becomes read-only, so later writes (the
    /// master's own or any fork's) fault into per-machine bank pages.
    /// `max_work_mem` caps the master's own bank; with 0 the master is
    /// no longer runnable and only serves as a fork source.
    pub fn prepare_copy_on_write(
        &mut self,
        max_work_mem: u64,
        shared_boundary: u64,
    ) -> Result<(), MachineError> {
        if self.forked {
            return Err(MachineError::ForkedMachine);
        }
        if self.options.short_lived {
            return Err(MachineError::ShortLived);
        }
        let masked = self.memory.mask_writable_pages(shared_boundary)?;
        self.memory.set_bank_limit(max_work_mem);
        self.memory
            .set_main_memory_writes(self.options.master_direct_memory_writes);
        self.master_state = Some(Box::new(MasterState {
            regs: self.vcpu.fd.get_regs()?,
            sregs: self.cached_sregs,
            fpu: self.vcpu.fd.get_fpu()?,
        }));
        self.prepped = true;
        // Flush stale writable translations before the next entry.
        self.vcpu.fd.set_sregs(&self.cached_sregs)?;
        info!(
            "prepared copy-on-write master: {masked} pages masked above {shared_boundary:#x}, \
             work-memory ceiling {max_work_mem} bytes",
        );
        Ok(())
    }

    /// Rewind this fork to `master`'s prepared state.  Afterwards the
    /// machine is indistinguishable from a fresh fork of the same master
    /// with the same options.
    pub fn reset_to(
        &mut self,
        master: &Machine<'m>,
        options: &MachineOptions,
    ) -> Result<(), MachineError> {
        if !self.forked {
            return Err(MachineError::NotForked);
        }
        let master_state = master
            .master_state
            .as_ref()
            .ok_or(MachineError::NotPrepared)?;

        self.memory
            .reset_from(&master.memory, options.reset_keep_all_work_memory)?;

        let mut sregs = master_state.sregs;
        sregs.cr3 = self.memory.page_tables();
        self.vcpu.fd.set_sregs(&sregs)?;
        self.vcpu.fd.set_regs(&master_state.regs)?;
        self.vcpu.fd.set_fpu(&master_state.fpu)?;
        self.cached_sregs = sregs;
        self.vcpu.stopped = true;
        self.vcpu.timer_ticks = 0;
        self.poisoned = false;
        self.mmap_cursor = master.mmap_cursor;
        self.apply_slot_updates()?;
        debug!("machine reset to master state");
        Ok(())
    }

    // ─── Registries ──────────────────────────────────────────────────

    /// Install the handler for one syscall number.  Registries are
    /// process-wide; install everything before the first machine runs.
    ///
    /// # Panics
    ///
    /// Panics when `nr` is not below [`MAX_SYSCALLS`].
    pub fn install_syscall_handler(nr: u32, handler: SyscallHandler) {
        assert!((nr as usize) < MAX_SYSCALLS, "syscall number {nr} out of range");
        HANDLERS.write().unwrap().syscalls[nr as usize] = Some(handler);
    }

    /// The handler installed for `nr`, if any.
    pub fn get_syscall_handler(nr: u32) -> Option<SyscallHandler> {
        HANDLERS
            .read()
            .unwrap()
            .syscalls
            .get(nr as usize)
            .copied()
            .flatten()
    }

    /// Install the fallback for syscall numbers without a handler.
    pub fn install_unhandled_syscall_handler(handler: NumberedSyscallHandler) {
        HANDLERS.write().unwrap().unhandled = handler;
    }

    /// Install the callback for guest `in` instructions.
    pub fn install_input_handler(handler: InputHandler) {
        HANDLERS.write().unwrap().on_input = handler;
    }

    /// Install the callback for guest `out` on non-protocol ports.
    pub fn install_output_handler(handler: OutputHandler) {
        HANDLERS.write().unwrap().on_output = handler;
    }

    /// Install the debug-trap (vector 1) hook.
    pub fn install_breakpoint_handler(handler: SyscallHandler) {
        HANDLERS.write().unwrap().on_breakpoint = handler;
    }

    /// Dispatch a system call exactly as the exit handler would.
    pub fn system_call(&mut self, nr: u32) {
        let handler = {
            let table = HANDLERS.read().unwrap();
            table
                .syscalls
                .get(nr as usize)
                .copied()
                .flatten()
                .ok_or(table.unhandled)
        };
        match handler {
            Ok(handler) => handler(self),
            Err(unhandled) => unhandled(self, nr),
        }
    }

    // ─── Running ─────────────────────────────────────────────────────

    /// Run from the binary's entry point until the guest stops or the
    /// timeout (milliseconds, 0 = none) fires.
    pub fn run(&mut self, timeout_ms: u32) -> Result<(), MachineError> {
        if self.poisoned {
            return Err(MachineError::Poisoned);
        }
        let mut sp = self.stack_address & !0xF;
        sp -= 8;
        self.memory
            .copy_to_guest(sp, &self.exit_address().to_le_bytes(), false)?;
        let regs = kvm_regs {
            rip: self.start_address,
            rsp: sp,
            rflags: GUEST_RFLAGS,
            ..Default::default()
        };
        self.vcpu.fd.set_regs(&regs)?;
        self.vcpu.fd.set_sregs(&self.cached_sregs)?;
        self.run_loop(timeout_ms)
    }

    /// Call the named guest function with the given arguments, without a
    /// timeout.
    pub fn vmcall(&mut self, name: &str, args: &[VmArg]) -> Result<(), MachineError> {
        let addr = self.address_of(name).ok_or_else(|| {
            MachineError::UnknownSymbol(name.to_string())
        })?;
        self.timed_vmcall(addr, 0, args)
    }

    /// Call guest code at `addr` with `args`, bounded by `timeout_ms`
    /// (0 = no timeout).
    pub fn timed_vmcall(
        &mut self,
        addr: u64,
        timeout_ms: u32,
        args: &[VmArg],
    ) -> Result<(), MachineError> {
        if self.poisoned {
            return Err(MachineError::Poisoned);
        }
        let regs = self.setup_call(addr, args)?;
        self.vcpu.fd.set_regs(&regs)?;
        // Re-applying the special registers is also the host-side TLB
        // flush for any page-table edits since the last entry.
        self.vcpu.fd.set_sregs(&self.cached_sregs)?;
        self.run_loop(timeout_ms)
    }

    /// Call through the lightweight reentry point, skipping one-time
    /// guest setup.
    pub fn timed_reentry(&mut self, timeout_ms: u32, args: &[VmArg]) -> Result<(), MachineError> {
        self.timed_vmcall(self.reentry_address(), timeout_ms, args)
    }

    /// Single-step one instruction.
    pub fn step_one(&mut self) -> Result<(), MachineError> {
        self.vcpu.set_single_step(true)?;
        let result = self.run_once();
        self.vcpu.set_single_step(false)?;
        result.map(|_| ())
    }

    /// Run until the next exit with up to four hardware breakpoints
    /// armed (zero entries unused).
    pub fn run_with_breakpoints(&mut self, addrs: [u64; 4]) -> Result<(), MachineError> {
        self.vcpu.set_hw_breakpoints(addrs)?;
        self.run_once().map(|_| ())
    }

    /// Request the run loop to stop after the current exit is handled.
    pub fn stop(&mut self, stop: bool) {
        self.vcpu.stopped = stop;
    }

    /// Whether the vCPU is stopped.
    pub fn stopped(&self) -> bool {
        self.vcpu.stopped
    }

    /// The call result register: RDI, where the exit trampoline parks a
    /// function's RAX return value and where an exit status already
    /// lives.
    pub fn return_value(&self) -> Result<i64, MachineError> {
        Ok(self.registers()?.rdi as i64)
    }

    fn run_loop(&mut self, ticks: u32) -> Result<(), MachineError> {
        if self.poisoned {
            return Err(MachineError::Poisoned);
        }
        self.vcpu.timer_ticks = ticks;
        // The guard disarms on every exit path, including unwinding
        // errors, and clears the missed-signal flag.
        let guard = TimerGuard::arm(&self.vcpu.timer, ticks).map_err(MachineError::Timer)?;
        self.vcpu.stopped = false;
        let result = loop {
            match self.run_once() {
                Ok(Step::Continue) => continue,
                Ok(Step::Stopped) | Ok(Step::Debug) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        drop(guard);
        self.vcpu.timer_ticks = 0;
        if let Err(e) = &result {
            if e.poisons() {
                self.poisoned = true;
            }
        }
        result
    }

    fn run_once(&mut self) -> Result<Step, MachineError> {
        self.apply_slot_updates()?;

        enum Pending {
            Stop,
            Syscall(u32),
            Interrupt(u8),
            Output { port: u16, value: u32 },
            Input { port: u16, ptr: *mut u8, len: usize },
            Mmio(u64),
            Debug,
        }

        let pending = match self.vcpu.fd.run() {
            Err(e) => {
                if self.vcpu.timer_ticks != 0 && (e.errno() == libc::EINTR || cpu::timer_fired())
                {
                    return Err(MachineError::Timeout {
                        ticks: self.vcpu.timer_ticks,
                    });
                }
                if e.errno() == libc::EINTR {
                    // Interrupted without a deadline; resume.
                    return Ok(Step::Continue);
                }
                return Err(MachineError::RunFailed(e));
            }
            Ok(exit) => match exit {
                VcpuExit::Hlt => return Err(MachineError::KernelHalt),
                VcpuExit::Debug(_) => Pending::Debug,
                VcpuExit::FailEntry(reason, _) => return Err(MachineError::FailEntry(reason)),
                VcpuExit::Shutdown => return Err(MachineError::TripleFault),
                VcpuExit::IoOut(port, data) => {
                    let value = io_value(data);
                    if port == SYSCALL_PORT {
                        if value == EXIT_SIGNAL {
                            Pending::Stop
                        } else {
                            Pending::Syscall(value)
                        }
                    } else if (INTERRUPT_PORT_BASE..INTERRUPT_PORT_END).contains(&port) {
                        Pending::Interrupt((port - INTERRUPT_PORT_BASE) as u8)
                    } else {
                        Pending::Output { port, value }
                    }
                }
                VcpuExit::IoIn(port, data) => Pending::Input {
                    port,
                    ptr: data.as_mut_ptr(),
                    len: data.len(),
                },
                VcpuExit::MmioRead(addr, _) | VcpuExit::MmioWrite(addr, _) => Pending::Mmio(addr),
                VcpuExit::InternalError => return Err(MachineError::InternalError),
                other => return Err(MachineError::UnexpectedExit(format!("{other:?}"))),
            },
        };

        // A timer signal that raced the exit still counts.
        if self.vcpu.timer_ticks != 0 && cpu::timer_fired() {
            return Err(MachineError::Timeout {
                ticks: self.vcpu.timer_ticks,
            });
        }

        // The privileged state must be exactly as configured on every
        // exit; anything else means the guest subverted its kernel.
        let sregs = self.vcpu.fd.get_sregs()?;
        let physbase = self.memory.physbase();
        if sregs.cr3 != self.memory.page_tables()
            || sregs.gdt.base != physbase + layout::GDT_OFFSET
            || sregs.idt.base != physbase + layout::IDT_OFFSET
        {
            self.print_registers();
            return Err(MachineError::KernelIntegrity);
        }

        match pending {
            Pending::Stop => {
                self.vcpu.stopped = true;
                Ok(Step::Stopped)
            }
            Pending::Debug => Ok(Step::Debug),
            Pending::Mmio(addr) => {
                self.print(&format!("memory access outside physical memory at {addr:#x}"));
                Err(MachineError::Mmio(addr))
            }
            Pending::Syscall(nr) => {
                self.system_call(nr);
                if self.vcpu.stopped {
                    Ok(Step::Stopped)
                } else {
                    Ok(Step::Continue)
                }
            }
            Pending::Interrupt(vector) => {
                self.handle_guest_interrupt(vector, &sregs)?;
                Ok(Step::Continue)
            }
            Pending::Output { port, value } => {
                let handler = HANDLERS.read().unwrap().on_output;
                handler(self, port, value);
                if self.vcpu.stopped {
                    Ok(Step::Stopped)
                } else {
                    Ok(Step::Continue)
                }
            }
            Pending::Input { port, ptr, len } => {
                let handler = HANDLERS.read().unwrap().on_input;
                let value = handler(self, port);
                let bytes = value.to_le_bytes();
                // Safety: the pointer targets the vCPU's shared run page,
                // which stays mapped for the lifetime of the fd and is not
                // referenced anywhere else on this path.
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, len.min(4));
                }
                if self.vcpu.stopped {
                    Ok(Step::Stopped)
                } else {
                    Ok(Step::Continue)
                }
            }
        }
    }

    fn handle_guest_interrupt(
        &mut self,
        vector: u8,
        sregs: &kvm_sregs,
    ) -> Result<(), MachineError> {
        match vector {
            // Page fault: the stub delivers CR2 in RDI.
            14 => {
                let regs = self.vcpu.fd.get_regs()?;
                let addr = regs.rdi & !REMOTE_MARKER_MASK;
                let stub_base = self.memory.physbase() + layout::KERNEL_STUB_OFFSET;
                let from_stub = (stub_base..stub_base + 0x1000).contains(&regs.rip);
                if !from_stub || sregs.cs.dpl != 0 || sregs.ss.dpl != 0 {
                    return Err(MachineError::SecurityViolation(vector));
                }
                if self.is_remote_access(regs.rdi) {
                    return self.handle_remote_fault(addr);
                }
                self.memory
                    .get_writable_page(addr, PDE64_USER | PDE64_RW, false)?;
                Ok(())
            }
            // Debug trap.
            1 => {
                let handler = HANDLERS.read().unwrap().on_breakpoint;
                handler(self);
                Ok(())
            }
            vector => {
                self.dump_exception(vector);
                Err(MachineError::CpuException {
                    name: exception_name(vector),
                    vector,
                })
            }
        }
    }

    fn apply_slot_updates(&mut self) -> Result<(), MachineError> {
        for update in self.memory.take_slot_updates() {
            match update {
                SlotUpdate::Install { idx, gpa, size, ro } => {
                    let host = self.memory.host_address(gpa)? as u64;
                    let region = kvm_userspace_memory_region {
                        slot: idx,
                        guest_phys_addr: gpa,
                        memory_size: size,
                        userspace_addr: host,
                        flags: if ro { KVM_MEM_READONLY } else { 0 },
                    };
                    // Safety: the host range is a live mapping owned (or
                    // shared) by this machine's guest memory, and slot
                    // bookkeeping guarantees non-overlap.
                    unsafe { self.vm.set_user_memory_region(region) }?;
                }
                SlotUpdate::Delete { idx } => {
                    let region = kvm_userspace_memory_region {
                        slot: idx,
                        memory_size: 0,
                        ..Default::default()
                    };
                    // Safety: a zero-sized region detaches the slot.
                    unsafe { self.vm.set_user_memory_region(region) }?;
                }
            }
        }
        Ok(())
    }

    // ─── Host-call ABI ───────────────────────────────────────────────

    /// Push `data` onto the guest stack, keeping 16-byte alignment, and
    /// return its guest address.
    pub fn stack_push(&mut self, sp: &mut u64, data: &[u8]) -> Result<u64, MachineError> {
        *sp = (*sp - data.len() as u64) & !0xF;
        self.memory.copy_to_guest(*sp, data, false)?;
        Ok(*sp)
    }

    /// Push a NUL-terminated copy of `s` and return its guest address.
    pub fn stack_push_cstr(&mut self, sp: &mut u64, s: &str) -> Result<u64, MachineError> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.stack_push(sp, &bytes)
    }

    fn setup_call(&mut self, addr: u64, args: &[VmArg]) -> Result<kvm_regs, MachineError> {
        let mut sp = self.stack_address & !0xF;
        let mut ints: Vec<u64> = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                VmArg::U64(v) => ints.push(*v),
                VmArg::I64(v) => ints.push(*v as u64),
                VmArg::Str(s) => {
                    let gva = self.stack_push_cstr(&mut sp, s)?;
                    ints.push(gva);
                }
                VmArg::Bytes(b) => {
                    let gva = self.stack_push(&mut sp, b)?;
                    ints.push(gva);
                }
            }
        }
        if ints.len() > 6 {
            return Err(MachineError::TooManyArguments(ints.len()));
        }
        // Return into the exit trampoline.  The extra slot leaves RSP at
        // entry congruent to 8 (mod 16), as the convention requires.
        sp &= !0xF;
        sp -= 8;
        self.memory
            .copy_to_guest(sp, &self.exit_address().to_le_bytes(), false)?;

        let mut regs = kvm_regs {
            rip: addr,
            rsp: sp,
            rflags: GUEST_RFLAGS,
            ..Default::default()
        };
        for (slot, value) in [
            &mut regs.rdi,
            &mut regs.rsi,
            &mut regs.rdx,
            &mut regs.rcx,
            &mut regs.r8,
            &mut regs.r9,
        ]
        .into_iter()
        .zip(ints)
        {
            *slot = value;
        }
        Ok(regs)
    }

    /// The binary's full-initialisation entry point.
    pub fn entry_address(&self) -> u64 {
        self.start_address
    }

    /// The lightweight reentry point, falling back to the entry point if
    /// the binary does not export one.
    pub fn reentry_address(&self) -> u64 {
        self.reentry_address.unwrap_or(self.start_address)
    }

    /// The address that cleanly stops the vCPU when returned into.
    pub fn exit_address(&self) -> u64 {
        self.memory.physbase() + layout::USER_STUB_OFFSET
    }

    /// Reentry when the guest already runs in user mode, entry otherwise.
    pub fn entry_address_if_usermode(&self) -> Result<u64, MachineError> {
        let sregs = self.vcpu.fd.get_sregs()?;
        Ok(if sregs.cs.dpl == 3 {
            self.reentry_address()
        } else {
            self.entry_address()
        })
    }

    // ─── Registers ───────────────────────────────────────────────────

    pub fn registers(&self) -> Result<kvm_regs, MachineError> {
        Ok(self.vcpu.fd.get_regs()?)
    }

    pub fn set_registers(&mut self, regs: &kvm_regs) -> Result<(), MachineError> {
        Ok(self.vcpu.fd.set_regs(regs)?)
    }

    pub fn get_special_registers(&self) -> Result<kvm_sregs, MachineError> {
        Ok(self.vcpu.fd.get_sregs()?)
    }

    pub fn set_special_registers(&mut self, sregs: &kvm_sregs) -> Result<(), MachineError> {
        Ok(self.vcpu.fd.set_sregs(sregs)?)
    }

    /// The FS and GS segment bases.
    pub fn get_fsgs(&self) -> Result<(u64, u64), MachineError> {
        let sregs = self.vcpu.fd.get_sregs()?;
        Ok((sregs.fs.base, sregs.gs.base))
    }

    /// Point FS at a guest thread-local block.
    pub fn set_tls_base(&mut self, base: u64) -> Result<(), MachineError> {
        let mut sregs = self.vcpu.fd.get_sregs()?;
        sregs.fs.base = base;
        self.vcpu.fd.set_sregs(&sregs)?;
        self.cached_sregs.fs.base = base;
        Ok(())
    }

    // ─── Memory facade ───────────────────────────────────────────────

    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }

    pub fn copy_to_guest(&mut self, va: u64, data: &[u8], zeroes: bool) -> Result<(), MachineError> {
        Ok(self.memory.copy_to_guest(va, data, zeroes)?)
    }

    pub fn copy_from_guest(&self, dst: &mut [u8], va: u64) -> Result<(), MachineError> {
        Ok(self.memory.copy_from_guest(dst, va)?)
    }

    pub fn unsafe_copy_from_guest(&self, dst: &mut [u8], va: u64) -> Result<(), MachineError> {
        Ok(self.memory.unsafe_copy_from_guest(dst, va)?)
    }

    pub fn translate(&self, va: u64) -> Result<u64, MachineError> {
        Ok(self.memory.translate(va)?)
    }

    /// Copy guest-to-guest across machines, gathering on the source side.
    pub fn copy_from_machine(
        &mut self,
        dst: u64,
        src: &Machine<'m>,
        src_addr: u64,
        len: u64,
    ) -> Result<(), MachineError> {
        let buffers = src
            .memory
            .gather_buffers_from_range(usize::MAX, src_addr, len)?;
        let mut at = dst;
        for buf in buffers {
            self.memory.copy_to_guest(at, buf, false)?;
            at += buf.len() as u64;
        }
        Ok(())
    }

    /// Pages of bank memory currently backing guest data.
    pub fn banked_memory_pages(&self) -> u64 {
        self.memory.banked_memory_pages()
    }

    /// Toggle direct main-memory writes.  Only legal between runs; mid-run
    /// the CoW invariant would break.
    pub fn set_main_memory_writable(&mut self, writable: bool) -> Result<(), MachineError> {
        if !self.vcpu.stopped {
            return Err(MachineError::NotStopped);
        }
        self.memory.set_main_memory_writes(writable);
        Ok(())
    }

    /// Bump-allocate guest-virtual space above the mmap floor.  Pages are
    /// materialised by demand faulting.
    pub fn mmap_allocate(&mut self, size: u64) -> u64 {
        let addr = page_align_up(self.mmap_cursor);
        self.mmap_cursor = addr + page_align_up(size);
        addr
    }

    // ─── Addresses and image ─────────────────────────────────────────

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    pub fn stack_address(&self) -> u64 {
        self.stack_address
    }

    pub fn set_stack_address(&mut self, addr: u64) {
        self.stack_address = addr;
    }

    pub fn heap_address(&self) -> u64 {
        self.heap_address
    }

    pub fn kernel_end_address(&self) -> u64 {
        self.kernel_end
    }

    pub fn mmap_start(&self) -> u64 {
        self.heap_address + BRK_MAX
    }

    pub fn max_address(&self) -> u64 {
        self.memory.physbase() + self.memory.size()
    }

    pub fn binary(&self) -> &'m [u8] {
        self.binary
    }

    /// Address of a symbol in the loaded image.
    pub fn address_of(&self, name: &str) -> Option<u64> {
        self.image.address_of(name)
    }

    /// Symbol and offset covering `addr`, for diagnostics.
    pub fn resolve(&self, addr: u64) -> Option<(&str, u64)> {
        self.image.resolve(addr)
    }

    // ─── State queries ───────────────────────────────────────────────

    /// Whether this machine is a prepared CoW master.
    pub fn is_forkable(&self) -> bool {
        self.prepped
    }

    pub fn is_forked(&self) -> bool {
        self.forked
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    // ─── Thread affinity ─────────────────────────────────────────────

    /// Rebind the machine's execution timer to the calling thread.  Must
    /// be called before running a machine that was created on another
    /// thread.
    pub fn migrate_to_this_thread(&mut self) -> Result<(), MachineError> {
        Ok(self.vcpu.migrate_to_this_thread()?)
    }

    // ─── Remote peer ─────────────────────────────────────────────────

    /// Wire `peer` as this machine's remote: guest-virtual addresses at
    /// or above the peer's memory base are treated as the peer's.  With
    /// `map_memory`, the peer's memory slots are mirrored into this
    /// machine so redirected pages resolve without copying.
    pub fn remote_connect(
        &mut self,
        peer: &Arc<Mutex<Machine<'m>>>,
        map_memory: bool,
    ) -> Result<(), MachineError> {
        let (base, mirrored) = {
            let peer_machine = peer.lock().map_err(|_| MachineError::RemoteUnavailable)?;
            let base = peer_machine.memory.physbase();
            if base < self.max_address() {
                return Err(MachineError::Layout(
                    "remote peer memory must live above this machine's",
                ));
            }
            let mut mirrored = 0;
            if map_memory {
                self.memory.share_region(
                    peer_machine.memory.main_region(),
                    REMOTE_MAIN_SLOT,
                    base,
                    peer_machine.memory.size(),
                    false,
                )?;
                for (i, arena) in peer_machine.memory.bank().arenas().iter().enumerate() {
                    self.memory.share_region(
                        arena.region().clone(),
                        REMOTE_ARENA_SLOT + i as u32,
                        arena.gpa(),
                        ARENA_SIZE,
                        false,
                    )?;
                    mirrored += 1;
                }
            }
            (base, mirrored)
        };
        self.remote = Some(RemotePeer {
            machine: peer.clone(),
            base,
            mapped: map_memory,
            mirrored_arenas: mirrored,
        });
        self.apply_slot_updates()?;
        info!("remote peer connected at {base:#x} (mapped: {map_memory})");
        Ok(())
    }

    /// The address above which accesses belong to the peer.
    pub fn remote_base_address(&self) -> Option<u64> {
        self.remote.as_ref().map(|r| r.base)
    }

    fn is_remote_access(&self, reported: u64) -> bool {
        match &self.remote {
            Some(remote) => {
                reported & REMOTE_MARKER != 0 || (reported & !REMOTE_MARKER_MASK) >= remote.base
            }
            None => false,
        }
    }

    fn handle_remote_fault(&mut self, addr: u64) -> Result<(), MachineError> {
        let (peer, mapped) = match &self.remote {
            Some(remote) => (remote.machine.clone(), remote.mapped),
            None => return Err(MachineError::RemoteUnavailable),
        };
        if !mapped {
            return Err(MachineError::RemoteUnavailable);
        }
        let pa = {
            let mut peer_machine = peer.lock().map_err(|_| MachineError::RemoteUnavailable)?;
            let pa = peer_machine
                .memory
                .get_writable_page(addr, PDE64_USER | PDE64_RW, false)?;
            // Mirror any arena the peer just created.
            let remote = self.remote.as_mut().ok_or(MachineError::RemoteUnavailable)?;
            let arenas = peer_machine.memory.bank().arenas();
            for (i, arena) in arenas.iter().enumerate().skip(remote.mirrored_arenas) {
                self.memory.share_region(
                    arena.region().clone(),
                    REMOTE_ARENA_SLOT + i as u32,
                    arena.gpa(),
                    ARENA_SIZE,
                    false,
                )?;
                remote.mirrored_arenas = i + 1;
            }
            pa
        };
        self.memory
            .map_page_to(addr, pa, PDE64_USER | PDE64_RW)?;
        Ok(())
    }

    // ─── Userdata and diagnostics ────────────────────────────────────

    /// Attach arbitrary host context to this machine.
    pub fn set_userdata<T: Any + Send>(&mut self, data: T) {
        self.userdata = Some(Box::new(data));
    }

    pub fn userdata<T: Any>(&self) -> Option<&T> {
        self.userdata.as_ref()?.downcast_ref()
    }

    pub fn userdata_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.userdata.as_mut()?.downcast_mut()
    }

    /// Replace the diagnostics sink.
    pub fn set_printer(&mut self, printer: Printer) {
        self.printer = printer;
    }

    /// Emit one diagnostics line through the machine's printer.
    pub fn print(&self, line: &str) {
        (self.printer)(line);
    }

    /// Dump the general and special registers through the printer.
    pub fn print_registers(&self) {
        let Ok(regs) = self.vcpu.fd.get_regs() else {
            return;
        };
        let Ok(sregs) = self.vcpu.fd.get_sregs() else {
            return;
        };
        self.print(&format!("CR0: {:#x}  CR3: {:#x}", sregs.cr0, sregs.cr3));
        self.print(&format!("CR2: {:#x}  CR4: {:#x}", sregs.cr2, sregs.cr4));
        self.print(&format!(
            "RAX: {:#x}  RBX: {:#x}  RCX: {:#x}",
            regs.rax, regs.rbx, regs.rcx
        ));
        self.print(&format!(
            "RDX: {:#x}  RSI: {:#x}  RDI: {:#x}",
            regs.rdx, regs.rsi, regs.rdi
        ));
        self.print(&format!(
            "RIP: {:#x}  RBP: {:#x}  RSP: {:#x}",
            regs.rip, regs.rbp, regs.rsp
        ));
        self.print(&format!(
            "SS: {:#x}  CS: {:#x}  DS: {:#x}  FS: {:#x}  GS: {:#x}",
            sregs.ss.selector, sregs.cs.selector, sregs.ds.selector, sregs.fs.selector,
            sregs.gs.selector
        ));
    }

    /// Verbose dump for a fatal CPU exception.  All guest-memory reads in
    /// here swallow their own errors so the primary exception survives.
    fn dump_exception(&self, vector: u8) {
        let Ok(regs) = self.vcpu.fd.get_regs() else {
            return;
        };
        let has_code = layout::exception_has_error_code(vector);
        self.print(&format!(
            "*** CPU exception: {} (vector {vector})",
            exception_name(vector)
        ));

        let read_u64 = |va: u64| -> Option<u64> {
            let mut buf = [0u8; 8];
            self.memory.unsafe_copy_from_guest(&mut buf, va).ok()?;
            Some(u64::from_le_bytes(buf))
        };

        let mut code = None;
        if has_code {
            code = read_u64(regs.rsp);
            if let Some(code) = code {
                self.print(&format!("error code: {code:#x}"));
            }
        }

        // Interrupt frame as the stub saw it: RIP, CS, RFLAGS, RSP, SS.
        let frame = regs.rsp + if has_code { 8 } else { 0 };
        if let Some(rip) = read_u64(frame) {
            match self.resolve(rip) {
                Some((symbol, offset)) => {
                    self.print(&format!("failing RIP: {rip:#x} <{symbol}+{offset:#x}>"))
                }
                None => self.print(&format!("failing RIP: {rip:#x}")),
            }
        }
        if let Some(cs) = read_u64(frame + 8) {
            self.print(&format!("failing CS:  {cs:#x}"));
            // Best guess for a #GP without a failing selector.
            if vector == 13 {
                match code {
                    Some(0) | None if cs & 0x3 != 0 => {
                        self.print("reason: executing a privileged instruction")
                    }
                    Some(0) | None => self.print("reason: protection fault in kernel mode"),
                    Some(selector) => {
                        self.print(&format!("reason: failing segment {selector:#x}"))
                    }
                }
            }
        }
        if let Some(rflags) = read_u64(frame + 16) {
            self.print(&format!("failing RFLAGS: {rflags:#x}"));
        }
        if let Some(rsp) = read_u64(frame + 24) {
            self.print(&format!("failing RSP: {rsp:#x}"));
        }
        if let Some(ss) = read_u64(frame + 32) {
            self.print(&format!("failing SS:  {ss:#x}"));
        }
        self.print_registers();
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Setup helpers
// ═══════════════════════════════════════════════════════════════════════

fn write_kernel_area(memory: &GuestMemory, physbase: u64) -> Result<(), MemoryError> {
    let mut gdt = Vec::with_capacity(layout::GDT_SLOTS * 8);
    for entry in layout::gdt_table(physbase) {
        gdt.extend_from_slice(&entry.to_le_bytes());
    }
    memory.write_phys(physbase + layout::GDT_OFFSET, &gdt)?;
    memory.write_phys(physbase + layout::TSS_OFFSET, &layout::tss_image(physbase))?;

    let mut idt = Vec::with_capacity(layout::IDT_VECTORS * 16);
    for word in layout::idt_table(physbase) {
        idt.extend_from_slice(&word.to_le_bytes());
    }
    memory.write_phys(physbase + layout::IDT_OFFSET, &idt)?;

    memory.write_phys(physbase + layout::KERNEL_STUB_OFFSET, &layout::kernel_stub_page())?;
    memory.write_phys(physbase + layout::USER_STUB_OFFSET, &layout::user_stub_page())?;
    Ok(())
}

fn setup_vcpu(
    kvm: &Kvm,
    vcpu: &Vcpu,
    sregs: &kvm_sregs,
    physbase: u64,
) -> Result<(), MachineError> {
    let cpuid = kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)?;
    vcpu.fd.set_cpuid2(&cpuid)?;

    let fpu = kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    };
    vcpu.fd.set_fpu(&fpu)?;

    let entries = [
        kvm_msr_entry {
            index: layout::MSR_LSTAR,
            data: physbase + layout::KERNEL_STUB_OFFSET + layout::SYSCALL_ENTRY_OFFSET,
            ..Default::default()
        },
        kvm_msr_entry {
            index: layout::MSR_STAR,
            data: layout::star_value(),
            ..Default::default()
        },
        kvm_msr_entry {
            index: layout::MSR_SFMASK,
            data: 0,
            ..Default::default()
        },
    ];
    let msrs = Msrs::from_entries(&entries).map_err(|_| MachineError::MsrSetup)?;
    if vcpu.fd.set_msrs(&msrs)? != entries.len() {
        return Err(MachineError::MsrSetup);
    }

    vcpu.fd.set_sregs(sregs)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_value_decodes_little_endian() {
        assert_eq!(io_value(&[0x2A, 0, 0, 0]), 42);
        assert_eq!(io_value(&[0xFF, 0xFF, 0, 0]), 0xFFFF);
        assert_eq!(io_value(&[0x78, 0x56]), 0x5678);
        assert_eq!(io_value(&[]), 0);
    }

    #[test]
    fn poisoning_covers_guest_execution_errors_only() {
        assert!(MachineError::Timeout { ticks: 50 }.poisons());
        assert!(MachineError::TripleFault.poisons());
        assert!(MachineError::KernelIntegrity.poisons());
        assert!(MachineError::SecurityViolation(14).poisons());
        assert!(!MachineError::UnknownSymbol("f".into()).poisons());
        assert!(!MachineError::Poisoned.poisons());
        assert!(!MachineError::TooManyArguments(7).poisons());
    }

    #[test]
    fn default_options() {
        let options = MachineOptions::default();
        assert_eq!(options.vmem_base, 0x10_0000);
        assert_eq!(options.max_mem, 32 * 1024 * 1024);
        assert_eq!(options.stack_size, 1024 * 1024);
        assert!(options.heap_base.is_none());
        assert!(!options.master_direct_memory_writes);
        assert!(!options.reset_keep_all_work_memory);
    }

    #[test]
    fn syscall_registry_installs_and_returns_handlers() {
        fn nop(_machine: &mut Machine) {}
        assert!(Machine::get_syscall_handler(500).is_none());
        Machine::install_syscall_handler(500, nop);
        assert!(Machine::get_syscall_handler(500).is_some());
    }

    #[test]
    fn remote_marker_mask_strips_marker_and_offset() {
        let reported: u64 = REMOTE_MARKER | 0x4000_0000_1234;
        assert_eq!(reported & !REMOTE_MARKER_MASK, 0x4000_0000_1000);
    }
}
