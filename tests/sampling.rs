//! Integration tests exercising the public surface end to end, against real
//! spawned threads and the real OS rendezvous signal. These are black-box:
//! they never reach into `wallsampler`'s internals, only parse the
//! `[SWIPR]` text stream it writes.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn lines_with_tag<'a>(output: &'a str, tag: &str) -> Vec<&'a str> {
    let prefix = format!("[SWIPR] {tag}");
    output
        .lines()
        .filter(|line| line.starts_with(&prefix))
        .collect()
}

fn run_sample(sample_count: u32, micros_between_samples: u64) -> String {
    wallsampler::initialize();
    let mut buf = Vec::new();
    let exit = wallsampler::request_sample(&mut buf, sample_count, micros_between_samples);
    assert_eq!(exit, 0, "request_sample must report success");
    String::from_utf8(buf).expect("output must be valid utf-8")
}

#[test]
fn emits_version_and_configuration_header() {
    let output = run_sample(1, 0);
    assert_eq!(lines_with_tag(&output, "VERS").len(), 1);
    assert_eq!(lines_with_tag(&output, "CONF").len(), 1);
}

#[test]
fn stream_ends_in_a_well_formed_grammar() {
    let output = run_sample(1, 0);
    // Between every SMPL and its DONE there must be only STCK lines.
    let mut in_sample = false;
    for line in output.lines() {
        assert!(!line.is_empty());
        if line.starts_with("[SWIPR] SMPL") {
            assert!(!in_sample, "nested SMPL without a DONE");
            in_sample = true;
        } else if line.starts_with("[SWIPR] DONE") {
            assert!(in_sample, "DONE without a preceding SMPL");
            in_sample = false;
        } else if in_sample {
            assert!(
                line.starts_with("[SWIPR] STCK"),
                "unexpected line inside a sample: {line}"
            );
        }
    }
    assert!(!in_sample, "stream ended mid-sample");
}

#[test]
fn single_busy_thread_is_captured_with_a_bounded_stack() {
    #[inline(never)]
    fn c(barrier: &Barrier, stop: &std::sync::atomic::AtomicBool) {
        barrier.wait();
        while !stop.load(std::sync::atomic::Ordering::Relaxed) {
            std::hint::black_box(0);
        }
    }
    #[inline(never)]
    fn b(barrier: &Barrier, stop: &std::sync::atomic::AtomicBool) {
        c(barrier, stop)
    }
    #[inline(never)]
    fn a(barrier: &Barrier, stop: &std::sync::atomic::AtomicBool) {
        b(barrier, stop)
    }

    let barrier = Arc::new(Barrier::new(2));
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let worker_barrier = Arc::clone(&barrier);
    let worker_stop = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name("busy-a-b-c".to_string())
        .spawn(move || a(&worker_barrier, &worker_stop))
        .expect("spawn worker thread");

    barrier.wait();

    let output = run_sample(3, 5_000);

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    handle.join().expect("worker thread panicked");

    let samples = lines_with_tag(&output, "SMPL");
    assert!(
        samples.iter().any(|line| line.contains("busy-a-b-c")),
        "expected at least one sample naming the busy worker thread, got: {output}"
    );
}

#[test]
fn thread_death_mid_round_never_hangs() {
    let handle = thread::Builder::new()
        .name("short-lived".to_string())
        .spawn(|| thread::sleep(Duration::from_millis(50)))
        .expect("spawn short-lived thread");

    let started = Instant::now();
    let _output = run_sample(1, 0);
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "a dying thread must never stall the round past its timeout"
    );

    handle.join().expect("short-lived thread panicked");
}

#[cfg(target_os = "linux")]
#[test]
fn thread_masking_the_rendezvous_signal_is_excluded_without_timing_out() {
    let barrier = Arc::new(Barrier::new(2));
    let worker_barrier = Arc::clone(&barrier);
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);

    let handle = thread::Builder::new()
        .name("signal-masked".to_string())
        .spawn(move || unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGPROF);
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            worker_barrier.wait();
            while !worker_stop.load(std::sync::atomic::Ordering::Relaxed) {
                std::hint::black_box(0);
            }
        })
        .expect("spawn signal-masked thread");

    barrier.wait();

    let started = Instant::now();
    let output = run_sample(1, 0);
    assert!(started.elapsed() < Duration::from_secs(2));

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    handle.join().expect("signal-masked thread panicked");

    let samples = lines_with_tag(&output, "SMPL");
    assert!(
        !samples.iter().any(|line| line.contains("signal-masked")),
        "a thread masking the rendezvous signal must not appear in the output"
    );
}
