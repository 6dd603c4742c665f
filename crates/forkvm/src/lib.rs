//! forkvm — an embeddable KVM engine for running untrusted 64-bit
//! programs as sandboxed guests.
//!
//! A [`Machine`] loads a statically linked x86_64 ELF into a fresh guest
//! address space, runs it in ring 3 under a tiny resident kernel, and
//! traps every supervisor interaction (system calls, faults, I/O) back to
//! the host.  Prepared machines fork in microseconds via copy-on-write
//! memory banks, every run can carry a wall-clock deadline, and the host
//! can call exported guest functions with arguments placed per the
//! System V AMD64 convention.
//!
//! # Architecture
//!
//! - [`vm`] — the machine: setup, run loop and exit dispatch, host calls,
//!   fork/reset, remote peers
//! - [`memory`] — guest memory, translation, host↔guest copies, the
//!   copy-on-write core
//! - [`bank`] — pools of host pages backing CoW faults
//! - [`paging`] — four-level page tables and the initial-table builder
//! - [`layout`] — the resident kernel area: descriptor tables and stubs
//! - [`loader`] — static ELF64 loading and symbol lookup
//! - [`cpu`] — the vCPU wrapper and execution-timeout machinery
//!
//! # Example
//!
//! ```no_run
//! use forkvm::{Machine, MachineOptions, VmArg};
//!
//! let binary = std::fs::read("guest.elf").unwrap();
//! let mut machine = Machine::new(&binary, &MachineOptions::default()).unwrap();
//! machine.run(1_000).unwrap();
//!
//! machine.prepare_copy_on_write(0, 0).unwrap();
//! let mut fork = machine.fork(&MachineOptions::default()).unwrap();
//! fork.timed_vmcall(fork.address_of("compute").unwrap(), 50,
//!     &[VmArg::U64(6), VmArg::U64(7)]).unwrap();
//! assert_eq!(fork.return_value().unwrap(), 43);
//! ```

pub mod bank;
pub mod cpu;
pub mod layout;
pub mod loader;
pub mod memory;
pub mod paging;
pub mod vm;

pub use memory::{GuestMemory, MemoryError};
pub use vm::{Machine, MachineError, MachineOptions, Printer, VmArg};
