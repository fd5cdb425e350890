//! Fallback adaptation layer for platforms with neither a procfs nor a
//! Mach-style thread enumeration API. Every operation reports
//! [`OsError`]; the public surface turns this into
//! `SamplingError::UnsupportedPlatform` at `initialize()`/`request_sample()`
//! time.

use super::{ImageSegment, Liveness, Os, ThreadDescriptor};
use crate::error::OsError;

pub struct UnsupportedOs;

impl UnsupportedOs {
    pub fn new() -> Self {
        UnsupportedOs
    }
}

impl Default for UnsupportedOs {
    fn default() -> Self {
        Self::new()
    }
}

fn unsupported() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Unsupported, "platform not supported")
}

impl Os for UnsupportedOs {
    fn enumerate_threads(&self) -> Result<Vec<ThreadDescriptor>, OsError> {
        Err(OsError::Enumeration("enumerate_threads", unsupported()))
    }

    fn enumerate_segments(&self) -> Result<Vec<ImageSegment>, OsError> {
        Err(OsError::Enumeration("enumerate_segments", unsupported()))
    }

    fn set_thread_name(&self, _name: &str) {}

    fn get_thread_name(&self) -> Option<String> {
        None
    }

    fn send_rendezvous_signal(&self, thread_id: u64) -> Result<(), OsError> {
        Err(OsError::ThreadGone(thread_id))
    }

    fn probe_alive(&self, _thread_id: u64) -> Liveness {
        Liveness::Gone
    }

    fn current_thread_id(&self) -> u64 {
        0
    }

    fn platform_supported(&self) -> bool {
        false
    }
}
