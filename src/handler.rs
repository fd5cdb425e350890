//! The mutator side of the rendezvous: the signal handler that runs,
//! asynchronously, on whichever thread the controller targeted.
//!
//! This module's dependencies are deliberately auditable: atomics (via
//! `rendezvous`), a raw `write(2)`/`abort(2)` fatal path, register
//! extraction from the kernel-supplied `ucontext`, and the two semaphores.
//! Nothing here allocates, locks a non-signal-safe primitive, or calls into
//! code that might panic and unwind.

use std::cell::Cell;
use std::sync::OnceLock;

use crate::os::{self, Os};
use crate::rendezvous::{self, RendezvousState};
use crate::unwind::CapturedContext;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs the rendezvous signal's disposition. Idempotent: subsequent
/// calls are no-ops. Must be called from a thread that will not itself
/// become a mutator target, before the first `request_sample`.
pub fn install() {
    INSTALLED.get_or_init(|| {
        // Touch the table now so its `OnceLock` initialization never has to
        // race with a signal delivery.
        rendezvous::table();
        unsafe { install_sigaction() };
    });
}

/// Writes `msg` to stderr and aborts the process immediately, using only
/// raw, async-signal-safe primitives. Used for every precondition
/// violation detected at runtime — these represent design bugs, not
/// recoverable failures, and must never be silently swallowed or turned
/// into a panic that unwinding could intercept.
pub fn fatal_precondition_violation(msg: &str) -> ! {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        libc::abort();
    }
}

thread_local! {
    /// Guards against a *same-thread* reentrant handler invocation — e.g. a
    /// second rendezvous signal arriving while this thread is still inside
    /// its first invocation, which `SA_NODEFER` permits. This is per-thread
    /// by design: many mutator threads legitimately run this handler
    /// concurrently within one round, since the controller sends every
    /// thread's signal before waiting on any of them.
    /// `const` initialisation keeps the first access on any thread a plain
    /// TLS load, with no lazy-init branch inside the handler.
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// The actual rendezvous-signal handler. Called by the platform trampoline
/// installed in `install_sigaction`.
///
/// # Safety
/// Must only ever be invoked by the kernel as a signal handler for the
/// rendezvous signal, with a valid `ucontext_t` pointer.
pub(crate) unsafe fn on_rendezvous_signal(ucontext: *const libc::c_void) {
    if IN_HANDLER.with(|flag| flag.replace(true)) {
        // A second rendezvous signal arrived on this same thread while it
        // was still inside a previous invocation. That cannot happen in a
        // correct round (each thread is signalled at most once per round
        // and the handler runs to completion before the next one could be
        // sent), so treat it the same as any other precondition violation.
        fatal_precondition_violation("reentrant rendezvous signal handler invocation");
    }

    // Step 1: acquire-load the state; require `sampling`.
    let table = rendezvous::table();
    if table.load_for_handler() != RendezvousState::Sampling {
        fatal_precondition_violation(
            "rendezvous signal delivered outside the sampling state",
        );
    }

    // Step 2: find the slot claimed for this thread.
    let this_thread = os::current().current_thread_id();
    let mut found = None;
    for slot in table.slots() {
        if slot.thread_id() == this_thread {
            found = Some(slot);
            break;
        }
    }
    let Some(slot) = found else {
        fatal_precondition_violation("no rendezvous slot claimed for the signalled thread");
    };

    // Step 3: extract IP/FP/SP from the kernel-supplied ucontext.
    let ctx = capture_context_from_ucontext(ucontext);
    // Safety: state is `Sampling` and this slot is ours, per the
    // precondition documented on `RendezvousSlot::write_context`.
    unsafe { slot.write_context(ctx) };

    // Step 4: tell the controller the context is captured.
    slot.mut_to_ctl().signal();

    // Step 5: block until the controller has finished unwinding. This pins
    // the thread so the stack memory under the captured FP chain stays
    // valid for the whole unwind.
    slot.ctl_to_mut().wait();

    // Step 6: tell the controller we are about to leave the handler, so it
    // can safely free the slot's semaphores without racing this read.
    slot.mut_to_ctl().signal();

    IN_HANDLER.with(|flag| flag.set(false));

    // Step 7: return to normal execution.
}

/// Extracts `(ip, fp, sp)` from the kernel-supplied `ucontext_t`: RIP/RBP/
/// RSP on x86-64, PC/X29/SP on AArch64.
unsafe fn capture_context_from_ucontext(ucontext: *const libc::c_void) -> CapturedContext {
    unsafe { arch::capture_context_from_ucontext(ucontext) }
}

#[cfg(target_os = "linux")]
mod arch {
    use super::CapturedContext;

    #[cfg(target_arch = "x86_64")]
    pub unsafe fn capture_context_from_ucontext(ucontext: *const libc::c_void) -> CapturedContext {
        let ucontext = ucontext as *const libc::ucontext_t;
        let mcontext = unsafe { &(*ucontext).uc_mcontext };
        CapturedContext {
            ip: mcontext.gregs[libc::REG_RIP as usize] as u64,
            fp: mcontext.gregs[libc::REG_RBP as usize] as u64,
            sp: mcontext.gregs[libc::REG_RSP as usize] as u64,
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub unsafe fn capture_context_from_ucontext(ucontext: *const libc::c_void) -> CapturedContext {
        let ucontext = ucontext as *const libc::ucontext_t;
        let mcontext = unsafe { &(*ucontext).uc_mcontext };
        CapturedContext {
            ip: mcontext.pc as u64,
            fp: mcontext.regs[29] as u64,
            sp: mcontext.sp as u64,
        }
    }
}

#[cfg(target_os = "macos")]
mod arch {
    use super::CapturedContext;

    #[cfg(target_arch = "x86_64")]
    pub unsafe fn capture_context_from_ucontext(ucontext: *const libc::c_void) -> CapturedContext {
        let ucontext = ucontext as *const libc::ucontext_t;
        let mcontext = unsafe { (*ucontext).uc_mcontext };
        let ss = unsafe { &(*mcontext).__ss };
        CapturedContext {
            ip: ss.__rip,
            fp: ss.__rbp,
            sp: ss.__rsp,
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub unsafe fn capture_context_from_ucontext(ucontext: *const libc::c_void) -> CapturedContext {
        let ucontext = ucontext as *const libc::ucontext_t;
        let mcontext = unsafe { (*ucontext).uc_mcontext };
        let ss = unsafe { &(*mcontext).__ss };
        CapturedContext {
            ip: ss.__pc,
            fp: ss.__fp,
            sp: ss.__sp,
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod arch {
    use super::CapturedContext;

    pub unsafe fn capture_context_from_ucontext(_ucontext: *const libc::c_void) -> CapturedContext {
        unreachable!("unsupported platform never installs the rendezvous signal")
    }
}

extern "C" fn trampoline(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    // Safety: the kernel guarantees `ucontext` is valid for the duration of
    // this call.
    unsafe { on_rendezvous_signal(ucontext) };
}

/// The rendezvous signal. `SIGPROF` is the conventional choice for a
/// sampling profiler (it is never used by the libc timer facilities this
/// crate itself relies on, since rounds are paced from userspace sleeps,
/// not `setitimer`).
pub(crate) const RENDEZVOUS_SIGNAL: libc::c_int = libc::SIGPROF;

unsafe fn install_sigaction() {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = trampoline as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(RENDEZVOUS_SIGNAL, &action, std::ptr::null_mut());
    }
}
