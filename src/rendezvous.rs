//! The rendezvous table and state machine: the only shared mutable state
//! the controller and the signal handler both touch.
//!
//! The table is a single, fixed-capacity, process-wide structure behind a
//! [`std::sync::OnceLock`], centralising initialisation behind one guard.
//! Only the controller mutates slots; the owning mutator writes its own
//! captured context during its one handler invocation per round.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::config::MAX_THREADS;
use crate::semaphore::Semaphore;
use crate::unwind::CapturedContext;

/// The rendezvous state machine. Represented as a totally ordered `u8` so
/// it can live in a single `AtomicU8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RendezvousState {
    Idle = 0,
    Preparing = 1,
    Sampling = 2,
    Processing = 3,
}

impl RendezvousState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RendezvousState::Idle,
            1 => RendezvousState::Preparing,
            2 => RendezvousState::Sampling,
            3 => RendezvousState::Processing,
            _ => unreachable!("rendezvous state is only ever written by this module"),
        }
    }
}

/// One row of the rendezvous table. `thread_id == 0` means the slot is
/// retired / unused.
///
/// The two semaphores are represented as raw pointers rather than an
/// `Option<Semaphore>` so that the signal handler's read of them is a bare
/// atomic load plus a pointer dereference — no `Option` matching, no
/// allocation, nothing that could panic.
pub struct RendezvousSlot {
    thread_id: AtomicU64,
    ctl_to_mut: AtomicUsize,
    mut_to_ctl: AtomicUsize,
    context: UnsafeCell<CapturedContext>,
}

// Safety: all mutation of `context` is externally synchronised by the
// controller/mutator handshake documented on `RendezvousTable`; the
// semaphore pointers are only ever written by the controller before the
// slot is published (state transitions to `Sampling`) and only read
// thereafter until the slot is retired.
unsafe impl Sync for RendezvousSlot {}

impl RendezvousSlot {
    const fn empty() -> Self {
        RendezvousSlot {
            thread_id: AtomicU64::new(0),
            ctl_to_mut: AtomicUsize::new(0),
            mut_to_ctl: AtomicUsize::new(0),
            context: UnsafeCell::new(CapturedContext { ip: 0, fp: 0, sp: 0 }),
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id.load(Ordering::Acquire)
    }

    pub fn is_in_use(&self) -> bool {
        self.thread_id() != 0
    }

    /// Called only by the controller, before the slot is published.
    pub(crate) fn claim(&self, thread_id: u64, ctl_to_mut: *const Semaphore, mut_to_ctl: *const Semaphore) {
        self.ctl_to_mut.store(ctl_to_mut as usize, Ordering::Relaxed);
        self.mut_to_ctl.store(mut_to_ctl as usize, Ordering::Relaxed);
        self.thread_id.store(thread_id, Ordering::Release);
    }

    /// Called only by the controller, once both acknowledgements are in and
    /// the slot's resources are freed.
    pub(crate) fn retire(&self) {
        self.thread_id.store(0, Ordering::Release);
        self.ctl_to_mut.store(0, Ordering::Relaxed);
        self.mut_to_ctl.store(0, Ordering::Relaxed);
    }

    /// Marks a slot's thread as gone without touching its semaphores. Used
    /// when a thread dies or a signal send fails before any semaphore was
    /// ever waited on by the controller; the controller is still
    /// responsible for the eventual `retire()`.
    pub(crate) fn mark_thread_gone(&self) {
        self.thread_id.store(0, Ordering::Release);
    }

    pub(crate) fn ctl_to_mut(&self) -> &Semaphore {
        let ptr = self.ctl_to_mut.load(Ordering::Relaxed) as *const Semaphore;
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr }
    }

    pub(crate) fn mut_to_ctl(&self) -> &Semaphore {
        let ptr = self.mut_to_ctl.load(Ordering::Relaxed) as *const Semaphore;
        debug_assert!(!ptr.is_null());
        unsafe { &*ptr }
    }

    /// Called only by the owning mutator, from inside the signal handler.
    ///
    /// # Safety
    /// Must only be called while `state() == Sampling` and this slot's
    /// `thread_id` is the caller's own thread id.
    pub(crate) unsafe fn write_context(&self, ctx: CapturedContext) {
        unsafe {
            *self.context.get() = ctx;
        }
    }

    /// Called only by the controller, after the mutator's first
    /// acknowledgement, i.e. once happens-before is established through
    /// `mut_to_ctl`.
    pub(crate) fn read_context(&self) -> CapturedContext {
        unsafe { *self.context.get() }
    }
}

/// Fixed-capacity, process-wide table of rendezvous slots plus the state
/// variable that sequences controller/mutator access to them.
pub struct RendezvousTable {
    state: AtomicU8,
    slots: Box<[RendezvousSlot]>,
}

impl RendezvousTable {
    fn new() -> Self {
        let slots = (0..MAX_THREADS).map(|_| RendezvousSlot::empty()).collect();
        RendezvousTable {
            state: AtomicU8::new(RendezvousState::Idle as u8),
            slots,
        }
    }

    pub fn slots(&self) -> &[RendezvousSlot] {
        &self.slots
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Acquire-load of the state, used by the signal handler at entry. The
    /// only load the mutator ever performs.
    pub fn load_for_handler(&self) -> RendezvousState {
        RendezvousState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `idle -> preparing`, relaxed. Only the controller calls this, and
    /// only one round may be in flight at a time: if the state is already
    /// non-idle, this is a precondition violation (concurrent round
    /// attempts are not supported).
    pub fn begin_preparing(&self) {
        let prev = self.state.swap(RendezvousState::Preparing as u8, Ordering::Relaxed);
        if prev != RendezvousState::Idle as u8 {
            crate::handler::fatal_precondition_violation(
                "begin_preparing observed a non-idle state: request_sample is not re-entrant",
            );
        }
    }

    /// `preparing -> sampling`, release. Pairs with the handler's acquire
    /// load.
    pub fn publish_sampling(&self) {
        self.state.store(RendezvousState::Sampling as u8, Ordering::Release);
    }

    /// `preparing -> idle`, seq-cst abort path.
    pub fn abort_to_idle(&self) {
        self.state.store(RendezvousState::Idle as u8, Ordering::SeqCst);
    }

    /// `sampling -> processing`. A relaxed store is sufficient here: the
    /// happens-before edge the controller needs (seeing every mutator's
    /// captured context before it unwinds) is already established by the
    /// `mut_to_ctl` semaphore wait each claimed slot completed in the
    /// previous step, not by this state transition itself.
    pub fn begin_processing(&self) {
        self.state.store(RendezvousState::Processing as u8, Ordering::Relaxed);
    }

    /// `processing -> idle`, relaxed.
    pub fn finish_round(&self) {
        self.state.store(RendezvousState::Idle as u8, Ordering::Relaxed);
    }
}

static TABLE: OnceLock<RendezvousTable> = OnceLock::new();

/// Returns the single process-wide rendezvous table, creating it on first
/// use. Safe to call from either the controller or, indirectly via the
/// `OnceLock`'s fast path, the signal handler (the slow initializing path
/// never runs inside the handler in practice, because `initialize()` always
/// touches the table first).
pub fn table() -> &'static RendezvousTable {
    TABLE.get_or_init(RendezvousTable::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_starts_empty_and_round_trips_claim_and_retire() {
        let slot = RendezvousSlot::empty();
        assert!(!slot.is_in_use());

        let a = Semaphore::new(0);
        let b = Semaphore::new(0);
        slot.claim(42, &a as *const _, &b as *const _);
        assert!(slot.is_in_use());
        assert_eq!(slot.thread_id(), 42);

        slot.retire();
        assert!(!slot.is_in_use());
        assert_eq!(slot.thread_id(), 0);
    }

    #[test]
    fn context_round_trips_through_the_slot() {
        let slot = RendezvousSlot::empty();
        let ctx = CapturedContext {
            ip: 1,
            fp: 2,
            sp: 3,
        };
        unsafe { slot.write_context(ctx) };
        assert_eq!(slot.read_context(), ctx);
    }

    #[test]
    fn table_has_the_configured_capacity() {
        let t = RendezvousTable::new();
        assert_eq!(t.capacity(), MAX_THREADS);
        assert_eq!(t.load_for_handler(), RendezvousState::Idle);
    }
}
