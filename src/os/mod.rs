//! OS adaptation layer: the capability interface (thread enumeration and
//! naming, segment enumeration, rendezvous signalling, liveness probing)
//! that the controller is written generically against. `linux` and `macos`
//! each provide one implementation, selected at compile time via `cfg`.

use crate::config::{NAME_LEN, PATH_LEN};
use crate::error::OsError;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::LinuxOs as CurrentOs;
    } else if #[cfg(target_os = "macos")] {
        mod macos;
        pub use macos::MacOs as CurrentOs;
    } else {
        mod unsupported;
        pub use unsupported::UnsupportedOs as CurrentOs;
    }
}

/// One live, kernel-scheduled thread visible to the process.
///
/// Deliberately not `Clone`: `platform_handle`, where present, is a port
/// right this descriptor uniquely owns and releases on drop.
#[derive(Debug, PartialEq, Eq)]
pub struct ThreadDescriptor {
    pub id: u64,
    pub name: String,
    /// An opaque platform handle that must be released when the descriptor
    /// is dropped (e.g. a Mach port right). `None` where the platform has
    /// no such handle (Linux: thread ids are plain integers).
    pub platform_handle: Option<PlatformThreadHandle>,
}

impl ThreadDescriptor {
    /// Truncates/pads `name` to the wire format's fixed field width, the
    /// way it will ultimately be serialized; used by tests and by the
    /// emitter to keep the two in agreement.
    pub fn truncated_name(&self) -> String {
        self.name.chars().take(NAME_LEN - 1).collect()
    }
}

impl Drop for ThreadDescriptor {
    fn drop(&mut self) {
        #[cfg(target_os = "macos")]
        if let Some(handle) = self.platform_handle {
            unsafe {
                mach2::mach_port::mach_port_deallocate(mach2::traps::mach_task_self(), handle.0);
            }
        }
        #[cfg(not(target_os = "macos"))]
        let _ = &self.platform_handle;
    }
}

/// Opaque per-platform thread handle. On macOS this wraps a Mach thread
/// port that must be deallocated; on Linux it carries no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformThreadHandle(pub u32);

/// One loaded executable image segment. The first entry returned by
/// `enumerate_segments` is always the running executable itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSegment {
    pub path: String,
    pub slide: i64,
    pub segment_start: u64,
    pub segment_end: u64,
}

impl ImageSegment {
    pub fn truncated_path(&self) -> String {
        let mut path = self.path.clone();
        if path.len() > PATH_LEN - 1 {
            path.truncate(PATH_LEN - 1);
        }
        path
    }
}

/// Whether the most recent liveness probe found the target thread alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Gone,
}

/// The capability interface every platform backend implements.
/// `Os::current()` returns a zero-sized handle; all state this layer needs
/// is either kernel state (re-read every call) or held inside the
/// rendezvous table, which is platform-independent.
pub trait Os {
    /// One entry per kernel-scheduled thread visible to the process,
    /// excluding the calling (controller) thread and any thread that has
    /// the rendezvous signal masked.
    fn enumerate_threads(&self) -> Result<Vec<ThreadDescriptor>, OsError>;

    /// One entry per loaded executable image segment, initial executable
    /// first.
    fn enumerate_segments(&self) -> Result<Vec<ImageSegment>, OsError>;

    /// Best-effort; failures are non-fatal and simply leave the name
    /// unchanged.
    fn set_thread_name(&self, name: &str);

    /// Best-effort read-back of the calling thread's own name. Returns
    /// `None` where the platform doesn't support it or the call fails;
    /// callers must not treat that as an error.
    fn get_thread_name(&self) -> Option<String> {
        None
    }

    /// Delivers the rendezvous signal to exactly one thread in this
    /// process. Returns `Err(OsError::ThreadGone(..))` if the target no
    /// longer exists.
    fn send_rendezvous_signal(&self, thread_id: u64) -> Result<(), OsError>;

    /// Checks whether `thread_id` is still alive, for use after a missed
    /// acknowledgement to distinguish a thread death from a hang.
    fn probe_alive(&self, thread_id: u64) -> Liveness;

    /// The calling thread's own id, as used in `ThreadDescriptor::id` and
    /// in rendezvous slot matching.
    fn current_thread_id(&self) -> u64;

    /// Whether this backend can actually enumerate and signal threads.
    /// `false` only for [`unsupported::UnsupportedOs`]; the public surface
    /// uses this to report `SamplingError::UnsupportedPlatform` at setup
    /// time rather than failing every round individually.
    fn platform_supported(&self) -> bool {
        true
    }
}

/// Returns the platform's `Os` implementation.
pub fn current() -> CurrentOs {
    CurrentOs::new()
}
