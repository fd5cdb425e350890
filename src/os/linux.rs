//! procfs-based OS adaptation layer: thread enumeration and naming via
//! `/proc/self/task`, segment enumeration via `/proc/self/maps` cross-
//! referenced against `dl_iterate_phdr` for each object's load bias, and
//! the rendezvous signal delivered with `tgkill` so it targets exactly one
//! thread, never the whole thread group.

use std::ffi::CStr;
use std::fs;
use std::io::Read;
use std::os::raw::c_void;

use super::{ImageSegment, Liveness, Os, ThreadDescriptor};
use crate::error::OsError;
use crate::handler::RENDEZVOUS_SIGNAL;

pub struct LinuxOs;

impl LinuxOs {
    pub fn new() -> Self {
        LinuxOs
    }
}

impl Default for LinuxOs {
    fn default() -> Self {
        Self::new()
    }
}

impl Os for LinuxOs {
    fn enumerate_threads(&self) -> Result<Vec<ThreadDescriptor>, OsError> {
        let self_tid = self.current_thread_id();
        let entries = fs::read_dir("/proc/self/task")
            .map_err(|e| OsError::Enumeration("/proc/self/task", e))?;

        let mut threads = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if tid == self_tid {
                continue;
            }
            if thread_masks_rendezvous_signal(tid) {
                continue;
            }
            let name = read_thread_name(tid).unwrap_or_else(|| "<n/a>".to_string());
            threads.push(ThreadDescriptor {
                id: tid,
                name,
                platform_handle: None,
            });
        }
        Ok(threads)
    }

    fn enumerate_segments(&self) -> Result<Vec<ImageSegment>, OsError> {
        let maps = fs::read_to_string("/proc/self/maps")
            .map_err(|e| OsError::Enumeration("/proc/self/maps", e))?;
        let biases = collect_load_biases();
        let segments = parse_executable_segments(&maps, &biases);
        if crate::config::verbosity().trace_unwind_info {
            for segment in &segments {
                log::trace!(
                    "segment {} [{:#x}, {:#x}) slide={:#x}",
                    segment.path,
                    segment.segment_start,
                    segment.segment_end,
                    segment.slide
                );
            }
        }
        Ok(segments)
    }

    fn set_thread_name(&self, name: &str) {
        let mut bytes = name.as_bytes();
        if bytes.len() > 15 {
            bytes = &bytes[..15];
        }
        if let Ok(cname) = std::ffi::CString::new(bytes) {
            unsafe {
                libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
            }
        }
    }

    fn get_thread_name(&self) -> Option<String> {
        let mut buf = [0u8; 16];
        let rc = unsafe {
            libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr().cast(), buf.len())
        };
        if rc != 0 {
            return None;
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let name = String::from_utf8_lossy(&buf[..end]).into_owned();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    fn send_rendezvous_signal(&self, thread_id: u64) -> Result<(), OsError> {
        let pid = std::process::id() as libc::pid_t;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                pid,
                thread_id as libc::pid_t,
                RENDEZVOUS_SIGNAL,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                Err(OsError::ThreadGone(thread_id))
            } else {
                Err(OsError::Os("tgkill", err))
            }
        }
    }

    fn probe_alive(&self, thread_id: u64) -> Liveness {
        if std::path::Path::new(&format!("/proc/self/task/{thread_id}")).exists() {
            Liveness::Alive
        } else {
            Liveness::Gone
        }
    }

    fn current_thread_id(&self) -> u64 {
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }
}

fn read_thread_name(tid: u64) -> Option<String> {
    let mut contents = String::new();
    fs::File::open(format!("/proc/self/task/{tid}/comm"))
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Checks `/proc/self/task/<tid>/status`'s `SigBlk:` mask for the
/// rendezvous signal's bit. Threads that have masked the signal are
/// excluded from rounds: the controller must neither wait on nor time out
/// on a thread that will never respond.
fn thread_masks_rendezvous_signal(tid: u64) -> bool {
    let Ok(status) = fs::read_to_string(format!("/proc/self/task/{tid}/status")) else {
        return false;
    };
    for line in status.lines() {
        if let Some(hex) = line.strip_prefix("SigBlk:") {
            let hex = hex.trim();
            if let Ok(mask) = u64::from_str_radix(hex, 16) {
                let bit = 1u64 << (RENDEZVOUS_SIGNAL as u64 - 1);
                return mask & bit != 0;
            }
        }
    }
    false
}

/// Walks the dynamic linker's own list of loaded objects via
/// `dl_iterate_phdr`, returning each object's path and its `dlpi_addr` load
/// bias — the value the loader actually added to every address in the
/// object's program headers, as opposed to anything `/proc/self/maps`'
/// mapped ranges can tell us on their own. The main executable reports an
/// empty `dlpi_name`, which we resolve through `/proc/self/exe` so it can
/// still be matched against the maps path below.
fn collect_load_biases() -> Vec<(String, u64)> {
    let mut out: Vec<(String, u64)> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(phdr_callback), &mut out as *mut _ as *mut c_void);
    }
    out
}

unsafe extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> libc::c_int {
    let out = unsafe { &mut *(data as *mut Vec<(String, u64)>) };
    let info = unsafe { &*info };
    let mut name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name) }
            .to_string_lossy()
            .into_owned()
    };
    if name.is_empty() {
        name = fs::read_link("/proc/self/exe")
            .ok()
            .and_then(|p| p.to_str().map(String::from))
            .unwrap_or_default();
    }
    if !name.is_empty() {
        out.push((name, info.dlpi_addr as u64));
    }
    0
}

/// Parses `/proc/self/maps` into one [`ImageSegment`] per contiguous run of
/// executable mappings that share a backing file, collapsing adjacent
/// mappings of the same shared object the way a loader's segments usually
/// appear consecutively in the map. Each segment's `slide` is looked up by
/// path in `biases`, falling back to zero for mappings `dl_iterate_phdr`
/// didn't report (e.g. the vDSO or anything not linked through the dynamic
/// linker).
fn parse_executable_segments(maps: &str, biases: &[(String, u64)]) -> Vec<ImageSegment> {
    let mut segments: Vec<ImageSegment> = Vec::new();
    for line in maps.lines() {
        let Some(parsed) = parse_maps_line(line) else {
            continue;
        };
        if !parsed.is_executable || parsed.path.is_empty() || parsed.path.starts_with('[') {
            continue;
        }
        if let Some(last) = segments.last_mut() {
            if last.path == parsed.path && parsed.start <= last.segment_end {
                last.segment_end = last.segment_end.max(parsed.end);
                continue;
            }
        }
        let slide = biases
            .iter()
            .find(|(path, _)| *path == parsed.path)
            .map_or(0, |(_, addr)| *addr as i64);
        segments.push(ImageSegment {
            path: parsed.path,
            slide,
            segment_start: parsed.start,
            segment_end: parsed.end,
        });
    }
    segments
}

struct MapsLine {
    start: u64,
    end: u64,
    is_executable: bool,
    path: String,
}

fn parse_maps_line(line: &str) -> Option<MapsLine> {
    let mut parts = line.splitn(6, ' ');
    let range = parts.next()?;
    let perms = parts.next()?;
    let _offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next().unwrap_or("").trim_start().to_string();

    let (start_str, end_str) = range.split_once('-')?;
    let start = u64::from_str_radix(start_str, 16).ok()?;
    let end = u64::from_str_radix(end_str, 16).ok()?;
    let is_executable = perms.as_bytes().get(2) == Some(&b'x');

    Some(MapsLine {
        start,
        end,
        is_executable,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_collapses_consecutive_executable_mappings() {
        let maps = "\
00400000-0040c000 r-xp 00000000 08:02 1321238                            /usr/bin/cat
0040c000-0040e000 r-xp 0000c000 08:02 1321238                            /usr/bin/cat
0060d000-0062e000 rw-p 00000000 00:00 0                                  [heap]
7f0000000000-7f0000010000 r-xp 00000000 08:02 999                        /lib/libc.so.6
";
        let segments = parse_executable_segments(maps, &[]);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].path, "/usr/bin/cat");
        assert_eq!(segments[0].segment_start, 0x00400000);
        assert_eq!(segments[0].segment_end, 0x0040e000);
        assert_eq!(segments[1].path, "/lib/libc.so.6");
    }

    #[test]
    fn looks_up_slide_by_path_from_the_phdr_bias_table() {
        let maps = "\
7f0000000000-7f0000010000 r-xp 00000000 08:02 999                        /lib/libc.so.6
";
        let biases = [("/lib/libc.so.6".to_string(), 0x7f0000000000u64)];
        let segments = parse_executable_segments(maps, &biases);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].slide, 0x7f0000000000);
    }

    #[test]
    fn skips_anonymous_and_non_executable_mappings() {
        let maps = "\
0060d000-0062e000 rw-p 00000000 00:00 0                                  [heap]
7f0000000000-7f0000001000 r--p 00000000 08:02 1                          /lib/data.bin
";
        assert!(parse_executable_segments(maps, &[]).is_empty());
    }
}
