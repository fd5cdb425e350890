//! Mach-based OS adaptation layer: thread enumeration via `task_threads`,
//! names and stable ids via `thread_info`, segments via `dyld` image
//! iteration, and the rendezvous signal delivered with `pthread_kill` so it
//! targets exactly one thread.

use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_types::thread_act_t;
use mach2::message::mach_msg_type_number_t;
use mach2::port::mach_port_t;
use mach2::traps::mach_task_self;

use super::{ImageSegment, Liveness, Os, PlatformThreadHandle, ThreadDescriptor};
use crate::error::OsError;
use crate::handler::RENDEZVOUS_SIGNAL;

pub struct MacOs;

impl MacOs {
    pub fn new() -> Self {
        MacOs
    }
}

impl Default for MacOs {
    fn default() -> Self {
        Self::new()
    }
}

impl Os for MacOs {
    fn enumerate_threads(&self) -> Result<Vec<ThreadDescriptor>, OsError> {
        let self_id = self.current_thread_id();
        let task = unsafe { mach_task_self() };
        let mut thread_list: *mut thread_act_t = std::ptr::null_mut();
        let mut thread_count: mach_msg_type_number_t = 0;

        let kr = unsafe { mach_sys::task_threads(task, &mut thread_list, &mut thread_count) };
        if kr != KERN_SUCCESS {
            return Err(OsError::Enumeration(
                "task_threads",
                std::io::Error::from_raw_os_error(kr),
            ));
        }

        let mut threads = Vec::with_capacity(thread_count as usize);
        for i in 0..thread_count as isize {
            let thread_act = unsafe { *thread_list.offset(i) };
            let (id, name) = match identify_thread(thread_act) {
                Some(v) => v,
                None => {
                    // Thread died between task_threads and thread_info, or
                    // refused to identify itself; drop it from the round.
                    unsafe { mach_port_deallocate(task, thread_act) };
                    continue;
                }
            };
            if id == self_id {
                unsafe { mach_port_deallocate(task, thread_act) };
                continue;
            }
            threads.push(ThreadDescriptor {
                id,
                name: name.unwrap_or_else(|| "<n/a>".to_string()),
                platform_handle: Some(PlatformThreadHandle(thread_act)),
            });
        }

        unsafe {
            mach2::vm::mach_vm_deallocate(
                task,
                thread_list as u64,
                (thread_count as usize * std::mem::size_of::<thread_act_t>()) as u64,
            );
        }

        Ok(threads)
    }

    fn enumerate_segments(&self) -> Result<Vec<ImageSegment>, OsError> {
        let count = unsafe { dyld_sys::_dyld_image_count() };
        let mut segments = Vec::with_capacity(count as usize);
        for i in 0..count {
            let header = unsafe { dyld_sys::_dyld_get_image_header(i) };
            if header.is_null() {
                continue;
            }
            let slide = unsafe { dyld_sys::_dyld_get_image_vmaddr_slide(i) };
            let name_ptr = unsafe { dyld_sys::_dyld_get_image_name(i) };
            let path = if name_ptr.is_null() {
                String::new()
            } else {
                unsafe { std::ffi::CStr::from_ptr(name_ptr) }
                    .to_string_lossy()
                    .to_string()
            };
            let Some((start, end)) = macho::executable_segment_range(header) else {
                continue;
            };
            let segment = ImageSegment {
                path,
                slide,
                segment_start: start.wrapping_add(slide as u64),
                segment_end: end.wrapping_add(slide as u64),
            };
            if crate::config::verbosity().trace_unwind_info {
                log::trace!(
                    "segment {} [{:#x}, {:#x}) slide={:#x}",
                    segment.path,
                    segment.segment_start,
                    segment.segment_end,
                    segment.slide
                );
            }
            segments.push(segment);
        }
        Ok(segments)
    }

    fn set_thread_name(&self, name: &str) {
        if let Ok(cname) = std::ffi::CString::new(name) {
            unsafe {
                libc::pthread_setname_np(cname.as_ptr());
            }
        }
    }

    fn get_thread_name(&self) -> Option<String> {
        let mut buf = [0u8; 64];
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
        let task = unsafe { mach_task_self() };
        let Some(thread_act) = find_thread_act_by_id(task, thread_id) else {
            return Err(OsError::ThreadGone(thread_id));
        };
        let pthread = unsafe { libc::pthread_from_mach_thread_np(thread_act) };
        unsafe { mach_port_deallocate(task, thread_act) };
        if pthread.is_null() {
            return Err(OsError::ThreadGone(thread_id));
        }
        let rc = unsafe { libc::pthread_kill(pthread, RENDEZVOUS_SIGNAL) };
        if rc == 0 {
            Ok(())
        } else {
            Err(OsError::ThreadGone(thread_id))
        }
    }

    fn probe_alive(&self, thread_id: u64) -> Liveness {
        let task = unsafe { mach_task_self() };
        match find_thread_act_by_id(task, thread_id) {
            Some(thread_act) => {
                unsafe { mach_port_deallocate(task, thread_act) };
                Liveness::Alive
            }
            None => Liveness::Gone,
        }
    }

    fn current_thread_id(&self) -> u64 {
        let mut tid: u64 = 0;
        unsafe {
            libc::pthread_threadid_np(std::ptr::null_mut(), &mut tid);
        }
        tid
    }
}

fn find_thread_act_by_id(task: mach_port_t, thread_id: u64) -> Option<thread_act_t> {
    let mut thread_list: *mut thread_act_t = std::ptr::null_mut();
    let mut thread_count: mach_msg_type_number_t = 0;
    let kr = unsafe { mach_sys::task_threads(task, &mut thread_list, &mut thread_count) };
    if kr != KERN_SUCCESS {
        return None;
    }
    let mut found = None;
    for i in 0..thread_count as isize {
        let thread_act = unsafe { *thread_list.offset(i) };
        let is_match = identify_thread(thread_act).is_some_and(|(id, _)| id == thread_id);
        if is_match && found.is_none() {
            found = Some(thread_act);
        } else {
            unsafe { mach_port_deallocate(task, thread_act) };
        }
    }
    unsafe {
        mach2::vm::mach_vm_deallocate(
            task,
            thread_list as u64,
            (thread_count as usize * std::mem::size_of::<thread_act_t>()) as u64,
        );
    }
    found
}

unsafe fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) {
    unsafe {
        mach2::mach_port::mach_port_deallocate(task, name);
    }
}

/// A stable per-thread id plus its name, via `THREAD_IDENTIFIER_INFO` and
/// `THREAD_EXTENDED_INFO`, merged into one lookup since the rendezvous
/// table only ever needs the pair together.
fn identify_thread(thread_act: thread_act_t) -> Option<(u64, Option<String>)> {
    let id = thread_identifier_info::thread_id(thread_act)?;
    let name = thread_extended_info::thread_name(thread_act);
    Some((id, name))
}

/// Hand-rolled Mach `thread_info` flavor bindings that are not part of the
/// `mach2` crate's scope (they live in Darwin's BSD-layer `thread_info.h`,
/// not the portable Mach headers `mach2` wraps).
mod mach_sys {
    use mach2::kern_return::kern_return_t;
    use mach2::mach_types::{task_t, thread_act_array_t, thread_act_t};
    use mach2::message::mach_msg_type_number_t;

    extern "C" {
        pub fn task_threads(
            target_task: task_t,
            act_list: *mut thread_act_array_t,
            act_list_count: *mut mach_msg_type_number_t,
        ) -> kern_return_t;

        pub fn thread_info(
            target_act: thread_act_t,
            flavor: u32,
            thread_info_out: *mut u32,
            thread_info_out_count: *mut mach_msg_type_number_t,
        ) -> kern_return_t;
    }
}

mod thread_identifier_info {
    use super::mach_sys;
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::mach_types::thread_act_t;

    const THREAD_IDENTIFIER_INFO: u32 = 4;

    #[repr(C)]
    #[derive(Default)]
    struct ThreadIdentifierInfo {
        thread_id: u64,
        thread_handle: u64,
        dispatch_qaddr: u64,
    }

    pub fn thread_id(thread_act: thread_act_t) -> Option<u64> {
        let mut info = ThreadIdentifierInfo::default();
        let mut count = (std::mem::size_of::<ThreadIdentifierInfo>() / std::mem::size_of::<u32>())
            as mach2::message::mach_msg_type_number_t;
        let kr = unsafe {
            mach_sys::thread_info(
                thread_act,
                THREAD_IDENTIFIER_INFO,
                &mut info as *mut _ as *mut u32,
                &mut count,
            )
        };
        if kr == KERN_SUCCESS {
            Some(info.thread_id)
        } else {
            None
        }
    }
}

mod thread_extended_info {
    use super::mach_sys;
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::mach_types::thread_act_t;

    const THREAD_EXTENDED_INFO: u32 = 5;
    const MAXTHREADNAMESIZE: usize = 64;

    #[repr(C)]
    struct ThreadExtendedInfo {
        user_time: u64,
        system_time: u64,
        cpu_usage: i32,
        policy: i32,
        run_state: i32,
        flags: i32,
        sleep_time: i32,
        curpri: i32,
        priority: i32,
        max_priority: i32,
        name: [libc::c_char; MAXTHREADNAMESIZE],
    }

    pub fn thread_name(thread_act: thread_act_t) -> Option<String> {
        let mut info: ThreadExtendedInfo = unsafe { std::mem::zeroed() };
        let mut count = (std::mem::size_of::<ThreadExtendedInfo>() / std::mem::size_of::<u32>())
            as mach2::message::mach_msg_type_number_t;
        let kr = unsafe {
            mach_sys::thread_info(
                thread_act,
                THREAD_EXTENDED_INFO,
                &mut info as *mut _ as *mut u32,
                &mut count,
            )
        };
        if kr != KERN_SUCCESS {
            return None;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(info.name.as_ptr()) }
            .to_string_lossy()
            .to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

/// Minimal Mach-O segment-range reader, enough to find the bounds of the
/// `__TEXT` segment for `enumerate_segments`. Full Mach-O/DWARF parsing is
/// out of scope; this only reads load-command headers.
mod macho {
    #[repr(C)]
    struct MachHeader64 {
        magic: u32,
        cputype: i32,
        cpusubtype: i32,
        filetype: u32,
        ncmds: u32,
        sizeofcmds: u32,
        flags: u32,
        reserved: u32,
    }

    #[repr(C)]
    struct LoadCommand {
        cmd: u32,
        cmdsize: u32,
    }

    #[repr(C)]
    struct SegmentCommand64 {
        cmd: u32,
        cmdsize: u32,
        segname: [libc::c_char; 16],
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        maxprot: i32,
        initprot: i32,
        nsects: u32,
        flags: u32,
    }

    const MH_MAGIC_64: u32 = 0xfeedfacf;
    const LC_SEGMENT_64: u32 = 0x19;

    /// Returns `(lowest vmaddr, highest vmaddr+vmsize)` across all `__TEXT`
    /// / `__DATA`-class segments, i.e. the full mapped extent of the image.
    pub fn executable_segment_range(header: *const libc::c_void) -> Option<(u64, u64)> {
        let header = header as *const MachHeader64;
        if unsafe { (*header).magic } != MH_MAGIC_64 {
            return None;
        }
        let ncmds = unsafe { (*header).ncmds };
        let mut cursor = unsafe { (header as *const u8).add(std::mem::size_of::<MachHeader64>()) };
        let mut lowest = u64::MAX;
        let mut highest = 0u64;
        for _ in 0..ncmds {
            let cmd = unsafe { &*(cursor as *const LoadCommand) };
            if cmd.cmd == LC_SEGMENT_64 {
                let seg = unsafe { &*(cursor as *const SegmentCommand64) };
                lowest = lowest.min(seg.vmaddr);
                highest = highest.max(seg.vmaddr + seg.vmsize);
            }
            cursor = unsafe { cursor.add(cmd.cmdsize as usize) };
        }
        if highest > lowest {
            Some((lowest, highest))
        } else {
            None
        }
    }
}

mod dyld_sys {
    extern "C" {
        pub fn _dyld_image_count() -> u32;
        pub fn _dyld_get_image_header(image_index: u32) -> *const libc::c_void;
        pub fn _dyld_get_image_vmaddr_slide(image_index: u32) -> isize;
        pub fn _dyld_get_image_name(image_index: u32) -> *const libc::c_char;
    }
}
