//! Constructor-time tunables and the diagnostic-only verbosity toggles.
//! None of this is runtime-reconfigurable and none of it is ever consulted
//! from the signal handler.

use std::sync::OnceLock;

/// Maximum number of live mutator threads trackable in one round.
pub const MAX_THREADS: usize = 1024;
/// Maximum number of frames recorded per minidump.
pub const MAX_STACK_DEPTH: usize = 128;
/// Maximum number of loaded image segments recorded per invocation.
pub const MAX_LIBS: usize = 1024;
/// Maximum thread-name length, NUL-padded.
pub const NAME_LEN: usize = 32;
/// Maximum image path length, NUL-truncated.
pub const PATH_LEN: usize = 1024;
/// Hard bound on `frame_pointer - sp_at_capture`, in bytes.
pub const STACK_BOUND: usize = 128 * 1024;
/// Whole-round deadline for the first (capture) acknowledgement.
pub const ROUND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);
/// Deadline for the second (release) acknowledgement.
pub const POST_RELEASE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

/// The three independent diagnostic toggles, each gating a distinct trace
/// category (`log::trace!` output, never anything load-bearing). Each is
/// read at most once, the first time any of them is consulted, and cached
/// for the remainder of the process's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbosity {
    pub trace_api_calls: bool,
    pub trace_unwinding: bool,
    pub trace_unwind_info: bool,
}

static VERBOSITY: OnceLock<Verbosity> = OnceLock::new();

fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| !v.is_empty())
}

/// Returns the cached verbosity configuration, reading the environment on
/// first call only.
pub fn verbosity() -> Verbosity {
    *VERBOSITY.get_or_init(|| Verbosity {
        trace_api_calls: env_flag("WALLSAMPLER_TRACE_API"),
        trace_unwinding: env_flag("WALLSAMPLER_TRACE_UNWIND"),
        trace_unwind_info: env_flag("WALLSAMPLER_TRACE_UNWIND_INFO"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_verbosity_is_all_off() {
        let v = Verbosity::default();
        assert!(!v.trace_api_calls);
        assert!(!v.trace_unwinding);
        assert!(!v.trace_unwind_info);
    }
}
