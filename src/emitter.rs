//! The line-oriented text emitter. Each line is one JSON object prefixed by
//! a 4-character tag; byte-exact stability of the tags and field names is
//! required since a separate offline tool consumes this stream.
//! Serialization goes through `serde_json` rather than hand-built strings.

use std::io::{self, BufWriter, Write};

use serde_derive::Serialize;

use crate::clock::Timestamp;
use crate::os::ImageSegment;

fn hex(value: u64) -> String {
    format!("0x{value:x}")
}

#[derive(Serialize)]
struct VersPayload {
    version: u32,
}

#[derive(Serialize)]
struct ConfPayload {
    #[serde(rename = "sampleCount")]
    sample_count: u32,
    #[serde(rename = "microSecondsBetweenSamples")]
    micro_seconds_between_samples: u64,
    #[serde(rename = "currentTimeSeconds")]
    current_time_seconds: u64,
    #[serde(rename = "currentTimeNanoseconds")]
    current_time_nanoseconds: u32,
}

#[derive(Serialize)]
struct VmapPayload {
    path: String,
    #[serde(rename = "fileMappedAddress")]
    file_mapped_address: String,
    #[serde(rename = "segmentStartAddress")]
    segment_start_address: String,
    #[serde(rename = "segmentEndAddress")]
    segment_end_address: String,
}

#[derive(Serialize)]
struct SmplPayload {
    pid: u32,
    tid: u64,
    name: String,
    #[serde(rename = "timeSec")]
    time_sec: u64,
    #[serde(rename = "timeNSec")]
    time_nsec: u32,
}

#[derive(Serialize)]
struct StckPayload {
    ip: String,
    sp: String,
}

#[derive(Serialize)]
struct MesgPayload {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit: Option<i32>,
}

/// Writes the `[SWIPR] ...` line format to any `impl Write` sink.
pub struct Emitter<W: Write> {
    out: BufWriter<W>,
}

impl<W: Write> Emitter<W> {
    pub fn new(sink: W) -> Self {
        Emitter {
            out: BufWriter::new(sink),
        }
    }

    fn line(&mut self, tag: &str, payload: &impl serde::Serialize) -> io::Result<()> {
        write!(self.out, "[SWIPR] {tag} ")?;
        serde_json::to_writer(&mut self.out, payload)?;
        writeln!(self.out)
    }

    pub fn vers(&mut self) -> io::Result<()> {
        self.line("VERS", &VersPayload { version: 1 })
    }

    pub fn conf(
        &mut self,
        sample_count: u32,
        micro_seconds_between_samples: u64,
        now: Timestamp,
    ) -> io::Result<()> {
        self.line(
            "CONF",
            &ConfPayload {
                sample_count,
                micro_seconds_between_samples,
                current_time_seconds: now.seconds,
                current_time_nanoseconds: now.nanoseconds,
            },
        )
    }

    pub fn vmap(&mut self, segment: &ImageSegment) -> io::Result<()> {
        self.line(
            "VMAP",
            &VmapPayload {
                path: segment.truncated_path(),
                file_mapped_address: hex(segment.slide as u64),
                segment_start_address: hex(segment.segment_start),
                segment_end_address: hex(segment.segment_end),
            },
        )
    }

    pub fn smpl(&mut self, pid: u32, tid: u64, name: &str, time: Timestamp) -> io::Result<()> {
        self.line(
            "SMPL",
            &SmplPayload {
                pid,
                tid,
                name: name.to_string(),
                time_sec: time.seconds,
                time_nsec: time.nanoseconds,
            },
        )
    }

    pub fn stck(&mut self, ip: u64, sp: u64) -> io::Result<()> {
        self.line(
            "STCK",
            &StckPayload {
                ip: hex(ip),
                sp: hex(sp),
            },
        )
    }

    pub fn done(&mut self) -> io::Result<()> {
        writeln!(self.out, "[SWIPR] DONE")
    }

    pub fn mesg(&mut self, message: &str, exit: Option<i32>) -> io::Result<()> {
        self.line(
            "MESG",
            &MesgPayload {
                message: message.to_string(),
                exit,
            },
        )
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_well_formed_grammar_for_a_round() {
        let mut buf = Vec::new();
        {
            let mut emitter = Emitter::new(&mut buf);
            emitter.vers().unwrap();
            emitter
                .conf(1, 10_000, Timestamp { seconds: 5, nanoseconds: 0 })
                .unwrap();
            emitter
                .vmap(&ImageSegment {
                    path: "/bin/cat".to_string(),
                    slide: 0,
                    segment_start: 0x1000,
                    segment_end: 0x2000,
                })
                .unwrap();
            emitter
                .smpl(42, 7, "worker", Timestamp { seconds: 5, nanoseconds: 1 })
                .unwrap();
            emitter.stck(0xdead, 0xbeef).unwrap();
            emitter.stck(0xface, 0xb00c).unwrap();
            emitter.done().unwrap();
            emitter.flush().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("[SWIPR] VERS "));
        assert!(lines[1].starts_with("[SWIPR] CONF "));
        assert!(lines[2].starts_with("[SWIPR] VMAP "));
        assert!(lines[3].starts_with("[SWIPR] SMPL "));
        assert!(lines[4].starts_with("[SWIPR] STCK "));
        assert!(lines[5] == "[SWIPR] DONE");
        assert!(lines[2].contains("\"segmentStartAddress\":\"0x1000\""));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn mesg_omits_exit_when_absent() {
        let mut buf = Vec::new();
        {
            let mut emitter = Emitter::new(&mut buf);
            emitter.mesg("thread stuck", None).unwrap();
            emitter.flush().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("\"exit\""));
    }

    #[test]
    fn mesg_includes_exit_when_present() {
        let mut buf = Vec::new();
        {
            let mut emitter = Emitter::new(&mut buf);
            emitter.mesg("fatal", Some(1)).unwrap();
            emitter.flush().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\"exit\":1"));
    }
}
