//! vCPU wrapper and the execution-timeout machinery.
//!
//! Timeouts are enforced with a per-thread POSIX interval timer that
//! delivers SIGUSR2 to the thread driving `KVM_RUN`.  The signal makes the
//! ioctl return `EINTR`; a recurring 20 ms interval after the initial
//! deadline guarantees that even a guest blocked inside the hypervisor is
//! interrupted repeatedly until the run loop observes the expiry.  Signals
//! that land between `KVM_RUN` returning and the next check are not lost:
//! the handler records them in a thread-local flag the loop consults after
//! every exit.
//!
//! Machines are thread-affine.  The timer is bound to the thread that
//! created it; call `Machine::migrate_to_this_thread` before running a
//! machine on a different thread.

use std::cell::Cell;
use std::io;
use std::sync::OnceLock;

use kvm_bindings::{
    kvm_guest_debug, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_GUESTDBG_USE_HW_BP,
};
use kvm_ioctls::{VcpuFd, VmFd};
use thiserror::Error;

/// Signal used by the execution timer.
pub(crate) const TIMER_SIGNAL: libc::c_int = libc::SIGUSR2;

/// Recurring interval after the initial deadline, so a guest blocking
/// inside the hypervisor keeps getting interrupted until the loop notices.
const TIMER_RECURRENCE_NS: i64 = 20_000_000;

thread_local! {
    static TIMER_FIRED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the timer fired on this thread since the last clear.
pub(crate) fn timer_fired() -> bool {
    TIMER_FIRED.with(|f| f.get())
}

pub(crate) fn clear_timer_fired() {
    TIMER_FIRED.with(|f| f.set(false));
}

extern "C" fn timeout_signal_handler(
    signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // A machine never migrates threads while it is running, so the
    // thread-local is an exact record of "my timer expired".
    if signum == TIMER_SIGNAL {
        TIMER_FIRED.with(|f| f.set(true));
    }
}

/// Install the process-wide SIGUSR2 handler once.  Registered without
/// `SA_RESTART` so an armed timer forces `KVM_RUN` to return `EINTR`.
pub(crate) fn install_timeout_handler() -> io::Result<()> {
    static INSTALLED: OnceLock<Result<(), i32>> = OnceLock::new();
    match INSTALLED.get_or_init(|| {
        vmm_sys_util::signal::register_signal_handler(TIMER_SIGNAL, timeout_signal_handler)
            .map_err(|e| e.errno())
    }) {
        Ok(()) => Ok(()),
        Err(errno) => Err(io::Error::from_raw_os_error(*errno)),
    }
}

#[derive(Error, Debug)]
pub enum VcpuError {
    #[error("failed to create vCPU: {0}")]
    Create(#[source] kvm_ioctls::Error),

    #[error("failed to create the execution timer: {0}")]
    Timer(#[source] io::Error),

    #[error("failed to configure guest debugging: {0}")]
    Debug(#[source] kvm_ioctls::Error),
}

// ─── Interval timer ──────────────────────────────────────────────────

/// A POSIX interval timer delivering [`TIMER_SIGNAL`] to the thread that
/// created it.
pub(crate) struct ExecTimer {
    id: libc::timer_t,
}

impl ExecTimer {
    pub(crate) fn new() -> io::Result<Self> {
        install_timeout_handler()?;
        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = TIMER_SIGNAL;
        sev.sigev_notify_thread_id = unsafe { libc::gettid() };
        let mut id: libc::timer_t = std::ptr::null_mut();
        // Safety: both pointers are valid for the duration of the call.
        if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut id) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id })
    }
}

impl Drop for ExecTimer {
    fn drop(&mut self) {
        // Safety: the id came from timer_create and is deleted once.
        unsafe {
            libc::timer_delete(self.id);
        }
    }
}

// Safety: timer_t is only meaningful on the creating thread's signal path.
// Machines are moved between threads only while stopped, and the contract
// is that `migrate_to_this_thread` replaces the timer before the next run.
unsafe impl Send for ExecTimer {}

/// Arms the timer for the lifetime of one run loop and guarantees the
/// disarm on every exit path, including unwinding errors.
pub(crate) struct TimerGuard {
    id: libc::timer_t,
    armed: bool,
}

impl TimerGuard {
    pub(crate) fn arm(timer: &ExecTimer, ticks_ms: u32) -> io::Result<Self> {
        clear_timer_fired();
        if ticks_ms == 0 {
            return Ok(Self {
                id: timer.id,
                armed: false,
            });
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: TIMER_RECURRENCE_NS,
            },
            it_value: libc::timespec {
                tv_sec: (ticks_ms / 1000) as libc::time_t,
                tv_nsec: ((ticks_ms % 1000) as i64) * 1_000_000,
            },
        };
        // Safety: the timer id is live for as long as the guard.
        if unsafe { libc::timer_settime(timer.id, 0, &spec, std::ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            id: timer.id,
            armed: true,
        })
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if self.armed {
            let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
            // Safety: disarming with a zeroed spec cannot fail for a live
            // timer; the id outlives the guard.
            unsafe {
                libc::timer_settime(self.id, 0, &spec, std::ptr::null_mut());
            }
        }
        clear_timer_fired();
    }
}

// ─── vCPU ────────────────────────────────────────────────────────────

/// One KVM vCPU plus the machinery that bounds its execution time.
pub struct Vcpu {
    pub(crate) fd: VcpuFd,
    pub(crate) stopped: bool,
    pub(crate) timer: ExecTimer,
    /// Current deadline in milliseconds; 0 while no timer is armed.
    pub(crate) timer_ticks: u32,
}

impl Vcpu {
    pub(crate) fn new(vm: &VmFd) -> Result<Self, VcpuError> {
        let fd = vm.create_vcpu(0).map_err(VcpuError::Create)?;
        let timer = ExecTimer::new().map_err(VcpuError::Timer)?;
        Ok(Self {
            fd,
            stopped: true,
            timer,
            timer_ticks: 0,
        })
    }

    /// Rebind the execution timer to the calling thread.
    pub(crate) fn migrate_to_this_thread(&mut self) -> Result<(), VcpuError> {
        self.timer = ExecTimer::new().map_err(VcpuError::Timer)?;
        Ok(())
    }

    /// Toggle single-step execution.
    pub(crate) fn set_single_step(&self, enable: bool) -> Result<(), VcpuError> {
        let control = if enable {
            KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP
        } else {
            0
        };
        let dbg = kvm_guest_debug {
            control,
            ..Default::default()
        };
        self.fd.set_guest_debug(&dbg).map_err(VcpuError::Debug)
    }

    /// Install up to four hardware breakpoints (zero entries are unused).
    pub(crate) fn set_hw_breakpoints(&self, addrs: [u64; 4]) -> Result<(), VcpuError> {
        let mut dbg = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_HW_BP,
            ..Default::default()
        };
        for (i, addr) in addrs.iter().enumerate() {
            dbg.arch.debugreg[i] = *addr;
            if *addr != 0 {
                dbg.arch.debugreg[7] |= 0x3 << (2 * i);
            }
        }
        self.fd.set_guest_debug(&dbg).map_err(VcpuError::Debug)
    }
}

// ─── Exception naming ────────────────────────────────────────────────

const EXCEPTION_NAMES: [&str; 32] = [
    "Divide-by-zero error",
    "Debug",
    "Non-maskable interrupt",
    "Breakpoint",
    "Overflow",
    "Bound range exceeded",
    "Invalid opcode",
    "Device not available",
    "Double fault",
    "Coprocessor segment overrun",
    "Invalid TSS",
    "Segment not present",
    "Stack-segment fault",
    "General protection fault",
    "Page fault",
    "Reserved",
    "x87 floating-point exception",
    "Alignment check",
    "Machine check",
    "SIMD floating-point exception",
    "Virtualization exception",
    "Control protection exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor injection exception",
    "VMM communication exception",
    "Security exception",
    "Reserved",
];

/// Human name of a CPU exception vector.
pub fn exception_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("Unknown exception")
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn exception_names_cover_the_table() {
        assert_eq!(exception_name(0), "Divide-by-zero error");
        assert_eq!(exception_name(13), "General protection fault");
        assert_eq!(exception_name(14), "Page fault");
        assert_eq!(exception_name(200), "Unknown exception");
    }

    #[test]
    fn signal_handler_sets_the_thread_local() {
        install_timeout_handler().unwrap();
        clear_timer_fired();
        assert!(!timer_fired());
        // Safety: raising our own handled signal on this thread.
        unsafe {
            libc::raise(TIMER_SIGNAL);
        }
        assert!(timer_fired());
        clear_timer_fired();
        assert!(!timer_fired());
    }

    #[test]
    fn armed_timer_fires_and_guard_disarms() {
        let timer = ExecTimer::new().unwrap();
        {
            let _guard = TimerGuard::arm(&timer, 5).unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            while !timer_fired() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            assert!(timer_fired(), "5 ms deadline never fired");
        }
        // Guard dropped: the interval is disarmed.  Absorb any signal that
        // was already in flight, then verify nothing keeps firing.
        std::thread::sleep(Duration::from_millis(5));
        clear_timer_fired();
        std::thread::sleep(Duration::from_millis(60));
        assert!(!timer_fired(), "timer kept firing after disarm");
    }

    #[test]
    fn zero_ticks_means_no_timer() {
        let timer = ExecTimer::new().unwrap();
        let guard = TimerGuard::arm(&timer, 0).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!timer_fired());
        drop(guard);
    }
}
