//! wallsampler: an in-process, signal-based, wall-clock stack sampling
//! profiler. At caller-driven intervals it freezes every other thread in
//! the process via a rendezvous signal, captures a frame-pointer stack walk
//! from each, and writes a line-oriented `[SWIPR]` text stream describing
//! the samples and the process's loaded image segments.
//!
//! Symbolication, aggregation, and everything downstream of the raw sample
//! stream are out of scope; a separate offline tool consumes this crate's
//! output.

pub mod clock;
pub mod config;
pub mod controller;
pub mod emitter;
pub mod error;
mod handler;
pub mod os;
pub mod rendezvous;
pub mod semaphore;
pub mod unwind;

use std::io::Write;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::clock::Timestamp;
use crate::emitter::Emitter;
use crate::error::SamplingError;
use crate::os::Os;

/// Renames the calling thread and installs the rendezvous signal's
/// disposition. Idempotent: subsequent calls re-apply the rename but only
/// install the signal handler once. Must be called once, from the thread
/// that will go on to drive [`request_sample`] — that thread must not
/// itself become a mutator target.
pub fn initialize() {
    os::current().set_thread_name("wallsampler-ctl");
    handler::install();
}

/// Runs `sample_count` sampling rounds, writing the `[SWIPR]` line format
/// to `output_sink`, sleeping `microseconds_between_samples` after each
/// round. Returns `0` on success and non-zero only on a fatal setup
/// failure (unsupported platform); per-round degraded outcomes are
/// reported as `MESG` lines, never as the return value.
pub fn request_sample<W: Write>(
    output_sink: W,
    sample_count: u32,
    microseconds_between_samples: u64,
) -> i32 {
    let os = os::current();
    let mut emitter = Emitter::new(output_sink);

    if !os.platform_supported() {
        let err = SamplingError::UnsupportedPlatform;
        warn!("{err}");
        let _ = emitter.mesg(&err.to_string(), Some(1));
        let _ = emitter.flush();
        return 1;
    }

    let _ = emitter.vers();
    let _ = emitter.conf(
        sample_count,
        microseconds_between_samples,
        Timestamp::now_wall_clock(),
    );

    match os.enumerate_segments() {
        Ok(segments) => {
            for segment in &segments {
                let _ = emitter.vmap(segment);
            }
        }
        Err(err) => {
            let err = SamplingError::EnumerationFailed(err);
            warn!("{err}");
            let _ = emitter.mesg(&err.to_string(), None);
        }
    }

    for round in 0..sample_count {
        let outcome = controller::run_round(&os);

        for minidump in &outcome.minidumps {
            let _ = emitter.smpl(
                minidump.pid,
                minidump.thread_id,
                &minidump.thread_name,
                minidump.captured_at,
            );
            for frame in &minidump.frames {
                let _ = emitter.stck(frame.instruction_pointer, frame.frame_pointer_at_capture);
            }
            let _ = emitter.done();
        }

        for message in &outcome.messages {
            warn!("{message}");
            let _ = emitter.mesg(message, None);
        }

        info!(
            "round {round} complete: {} sample(s), {} diagnostic(s)",
            outcome.minidumps.len(),
            outcome.messages.len()
        );

        let is_last_round = round + 1 == sample_count;
        if !is_last_round && microseconds_between_samples > 0 {
            thread::sleep(Duration::from_micros(microseconds_between_samples));
        }
    }

    let _ = emitter.flush();
    0
}
