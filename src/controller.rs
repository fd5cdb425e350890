//! The sampling controller: the orchestrator for one round.
//!
//! This is the part of the system with no cooperation from the threads it
//! samples. Everything downstream of `enumerate_threads` has to account for
//! a thread dying, refusing to respond, or never existing in the first
//! place, without ever blocking the round indefinitely or corrupting the
//! rendezvous table.

use crate::clock::{self, Timestamp};
use crate::config::{self, MAX_STACK_DEPTH};
use crate::os::{Liveness, Os};
use crate::rendezvous::{self, RendezvousSlot};
use crate::semaphore::{Semaphore, WaitResult};
use crate::unwind::{self, CapturedContext, Frame};

/// One thread's sample: identity, capture time, and the frames the unwinder
/// produced.
#[derive(Debug, Clone)]
pub struct Minidump {
    pub pid: u32,
    pub thread_id: u64,
    pub thread_name: String,
    pub captured_at: Timestamp,
    pub frames: Vec<Frame>,
}

/// Everything one round produced, for the public surface to emit and to
/// decide whether a round-level diagnostic is warranted. Carries no
/// information the wire format doesn't already expose.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    pub minidumps: Vec<Minidump>,
    pub messages: Vec<String>,
}

struct ClaimedSlot<'a> {
    slot: &'a RendezvousSlot,
    thread_id: u64,
    name: String,
    ctl_to_mut: *mut Semaphore,
    mut_to_ctl: *mut Semaphore,
}

/// Runs one sampling round against the process-wide rendezvous table.
/// Every failure mode below degrades at round or thread granularity; this
/// function never blocks longer than `ROUND_TIMEOUT + POST_RELEASE_TIMEOUT`
/// in total and never panics on account of mutator behaviour.
pub fn run_round(os: &impl Os) -> RoundOutcome {
    let table = rendezvous::table();

    // Step 1: idle -> preparing. Aborts the process if a round is already
    // in flight; not recoverable here by design.
    table.begin_preparing();

    // Step 2: enumerate threads, excluding the controller itself. Threads
    // masking the rendezvous signal are already excluded by the OS layer.
    let self_id = os.current_thread_id();
    let threads: Vec<_> = match os.enumerate_threads() {
        Ok(threads) => threads.into_iter().filter(|t| t.id != self_id).collect(),
        Err(err) => {
            table.abort_to_idle();
            return RoundOutcome {
                minidumps: Vec::new(),
                messages: vec![format!("thread enumeration failed: {err}")],
            };
        }
    };

    if threads.len() > table.capacity() {
        table.abort_to_idle();
        return RoundOutcome {
            minidumps: Vec::new(),
            messages: vec![format!(
                "thread population ({}) exceeds capacity ({}); round skipped",
                threads.len(),
                table.capacity()
            )],
        };
    }

    // Step 3: claim one slot per thread, with fresh zero-count semaphores.
    let pid = std::process::id();
    let mut claimed = Vec::with_capacity(threads.len());
    for (slot, thread) in table.slots().iter().zip(threads.iter()) {
        let ctl_to_mut = Box::into_raw(Box::new(Semaphore::new(0)));
        let mut_to_ctl = Box::into_raw(Box::new(Semaphore::new(0)));
        slot.claim(
            thread.id,
            ctl_to_mut as *const Semaphore,
            mut_to_ctl as *const Semaphore,
        );
        claimed.push(ClaimedSlot {
            slot,
            thread_id: thread.id,
            name: thread.truncated_name(),
            ctl_to_mut,
            mut_to_ctl,
        });
    }
    // Step 4 (zeroing minidumps) is implicit: `minidumps` below starts empty
    // and is only ever appended to for slots that are still in use.

    // Step 5: preparing -> sampling.
    table.publish_sampling();

    // Step 6.
    let start = clock::monotonic_now();
    let capture_wall_clock = Timestamp::now_wall_clock();

    // Step 7: signal every claimed thread.
    let trace_api = config::verbosity().trace_api_calls;
    for claim in &claimed {
        if trace_api {
            log::trace!("send_rendezvous_signal(thread_id={})", claim.thread_id);
        }
        if os.send_rendezvous_signal(claim.thread_id).is_err() {
            if trace_api {
                log::trace!("thread {} gone before signal delivery", claim.thread_id);
            }
            claim.slot.mark_thread_gone();
        }
    }

    // Step 8: wait for the first acknowledgement, round-wide deadline.
    let round_deadline = start + config::ROUND_TIMEOUT;
    let mut messages = Vec::new();
    for claim in &claimed {
        if !claim.slot.is_in_use() {
            continue;
        }
        if claim.slot.mut_to_ctl().wait_until(round_deadline) == WaitResult::TimedOut {
            match os.probe_alive(claim.thread_id) {
                Liveness::Gone => claim.slot.mark_thread_gone(),
                Liveness::Alive => {
                    claim.slot.mark_thread_gone();
                    messages.push(format!(
                        "thread {} did not acknowledge within the round deadline; dropped",
                        claim.thread_id
                    ));
                }
            }
        }
    }

    // Step 9: sampling -> processing.
    table.begin_processing();

    // Step 10: unwind every thread that is still in the round.
    let trace_unwind = config::verbosity().trace_unwinding;
    let mut minidumps = Vec::new();
    for claim in &claimed {
        if !claim.slot.is_in_use() {
            continue;
        }
        let ctx: CapturedContext = claim.slot.read_context();
        let mut frames = [Frame {
            instruction_pointer: 0,
            frame_pointer_at_capture: 0,
        }; MAX_STACK_DEPTH];
        let written = unsafe { unwind::walk(ctx, &mut frames) };
        if trace_unwind {
            log::trace!(
                "unwound thread {}: {written} frame(s), ip={:#x} fp={:#x}",
                claim.thread_id,
                ctx.ip,
                ctx.fp
            );
        }
        minidumps.push(Minidump {
            pid,
            thread_id: claim.thread_id,
            thread_name: claim.name.clone(),
            captured_at: capture_wall_clock,
            frames: frames[..written].to_vec(),
        });
    }

    // Step 11: processing -> idle.
    table.finish_round();

    // Step 12: release every mutator still in the round.
    for claim in &claimed {
        if claim.slot.is_in_use() {
            claim.slot.ctl_to_mut().signal();
        }
    }

    // Step 13: await the second acknowledgement; on timeout, leak the
    // slot's semaphores rather than risk a use-after-free by a stuck
    // mutator that eventually resumes.
    let release_deadline = clock::monotonic_now() + config::POST_RELEASE_TIMEOUT;
    for claim in claimed {
        if !claim.slot.is_in_use() {
            // The thread was dropped before step 12; nothing borrowed
            // these semaphores, so they can be freed immediately.
            unsafe {
                drop(Box::from_raw(claim.ctl_to_mut));
                drop(Box::from_raw(claim.mut_to_ctl));
            }
            continue;
        }
        match claim.slot.mut_to_ctl().wait_until(release_deadline) {
            WaitResult::Acquired => {
                claim.slot.retire();
                unsafe {
                    drop(Box::from_raw(claim.ctl_to_mut));
                    drop(Box::from_raw(claim.mut_to_ctl));
                }
            }
            WaitResult::TimedOut => {
                messages.push(format!(
                    "thread {} did not release within the post-release deadline; \
                     its rendezvous semaphores are being leaked",
                    claim.thread_id
                ));
                // Deliberately not retiring the slot or freeing the boxes:
                // the mutator may still be inside the handler, reading
                // `ctl_to_mut` or about to write `mut_to_ctl`. The next
                // round's `claim()` overwrites this slot's fields anyway.
            }
        }
    }

    RoundOutcome {
        minidumps,
        messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OsError;
    use crate::os::{ImageSegment, ThreadDescriptor};
    use std::sync::Mutex;

    /// A fake `Os` backend that reports a fixed set of threads and records
    /// every signal send, so round logic can be exercised without a real
    /// kernel rendezvous.
    struct FakeOs {
        threads: Vec<u64>,
        self_id: u64,
        signalled: Mutex<Vec<u64>>,
    }

    impl FakeOs {
        fn new(threads: Vec<u64>) -> Self {
            FakeOs {
                threads,
                self_id: 0,
                signalled: Mutex::new(Vec::new()),
            }
        }
    }

    impl Os for FakeOs {
        fn enumerate_threads(&self) -> Result<Vec<ThreadDescriptor>, OsError> {
            Ok(self
                .threads
                .iter()
                .map(|&id| ThreadDescriptor {
                    id,
                    name: format!("t{id}"),
                    platform_handle: None,
                })
                .collect())
        }

        fn enumerate_segments(&self) -> Result<Vec<ImageSegment>, OsError> {
            Ok(Vec::new())
        }

        fn set_thread_name(&self, _name: &str) {}

        fn send_rendezvous_signal(&self, thread_id: u64) -> Result<(), OsError> {
            self.signalled.lock().unwrap().push(thread_id);
            // Nobody is listening in this fake, so every "signal" is
            // immediately treated as if the thread had vanished, which
            // exercises the degrade-and-continue path deterministically.
            Err(OsError::ThreadGone(thread_id))
        }

        fn probe_alive(&self, _thread_id: u64) -> Liveness {
            Liveness::Gone
        }

        fn current_thread_id(&self) -> u64 {
            self.self_id
        }
    }

    #[test]
    fn empty_thread_population_yields_no_minidumps() {
        let os = FakeOs::new(Vec::new());
        let outcome = run_round(&os);
        assert!(outcome.minidumps.is_empty());
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn threads_that_never_acknowledge_a_dead_signal_are_dropped_without_hanging() {
        let os = FakeOs::new(vec![11, 12, 13]);
        let outcome = run_round(&os);
        assert!(outcome.minidumps.is_empty());
        assert!(outcome.messages.is_empty());
        assert_eq!(*os.signalled.lock().unwrap(), vec![11, 12, 13]);
    }

    #[test]
    fn controller_thread_is_excluded_from_its_own_round() {
        struct SelfOs {
            inner: FakeOs,
        }
        impl Os for SelfOs {
            fn enumerate_threads(&self) -> Result<Vec<ThreadDescriptor>, OsError> {
                self.inner.enumerate_threads()
            }
            fn enumerate_segments(&self) -> Result<Vec<ImageSegment>, OsError> {
                self.inner.enumerate_segments()
            }
            fn set_thread_name(&self, name: &str) {
                self.inner.set_thread_name(name)
            }
            fn send_rendezvous_signal(&self, thread_id: u64) -> Result<(), OsError> {
                self.inner.send_rendezvous_signal(thread_id)
            }
            fn probe_alive(&self, thread_id: u64) -> Liveness {
                self.inner.probe_alive(thread_id)
            }
            fn current_thread_id(&self) -> u64 {
                self.inner.self_id
            }
        }
        let mut inner = FakeOs::new(vec![1]);
        inner.self_id = 1;
        let os = SelfOs { inner };
        let outcome = run_round(&os);
        assert!(outcome.minidumps.is_empty());
        assert!(os.inner.signalled.lock().unwrap().is_empty());
    }
}
