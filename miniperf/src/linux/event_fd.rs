use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use libc::{self, c_void, pid_t};
use log::debug;

use miniperf_record::EventAttr;

use super::io_loop::IOEventRef;
use super::sys::*;
use crate::error::{Error, Result};

const PAGE_SIZE: usize = 4096;

/// A counter value snapshot, in the layout selected by our read_format
/// (value, time_enabled, time_running, id).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCounter {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub id: u64,
}

/// A counter captured from an event file, with the binding it had.
#[derive(Debug, Clone, Copy)]
pub struct CounterInfo {
    pub tid: pid_t,
    pub cpu: i32,
    pub counter: PerfCounter,
}

struct MappedBuffer {
    ptr: *mut u8,
    mmap_len: usize,
    data_size: u64,
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut c_void, self.mmap_len);
        }
    }
}

unsafe fn read_head(pointer: *const u8) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    let head = ptr::read_volatile(&page.data_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn read_tail(pointer: *const u8) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    // No fence required; we are the only writer of the tail.
    ptr::read_volatile(&page.data_tail)
}

unsafe fn write_tail(pointer: *mut u8, value: u64) {
    let page = &mut *(pointer as *mut PerfEventMmapPage);
    fence(Ordering::AcqRel);
    ptr::write_volatile(&mut page.data_tail, value);
}

/// Owns one kernel sampling file: its id, the (tid, cpu) it is bound to, an
/// optional mapped ring buffer, and its registration in the reactor.
///
/// A sibling file on the same cpu can route its output into this file's
/// buffer via [`EventFd::share_mapped_buffer`]; only the owner drains and
/// destroys the mapping.
pub struct EventFd {
    fd: RawFd,
    id: u64,
    event_name: String,
    tid: pid_t,
    cpu: i32,
    mmap: Option<MappedBuffer>,
    poll_event: Option<IOEventRef>,
}

impl EventFd {
    /// `tid` / `cpu` may each be -1, meaning all threads / all cpus. The
    /// group leader must be passed for every group member after the first.
    pub fn open(
        attr: &EventAttr,
        event_name: &str,
        tid: pid_t,
        cpu: i32,
        group: Option<&EventFd>,
    ) -> Result<EventFd> {
        let sys_attr = PerfEventAttr::from_attr(attr);
        let group_fd = group.map_or(-1, |g| g.fd);
        let fd = sys_perf_event_open(&sys_attr, tid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC);
        if fd < 0 {
            return Err(Error::KernelOpen {
                name: event_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        let mut event_fd = EventFd {
            fd,
            id: 0,
            event_name: event_name.to_string(),
            tid,
            cpu,
            mmap: None,
            poll_event: None,
        };
        let mut id = 0u64;
        let result = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ID as _, &mut id) };
        if result == 0 {
            event_fd.id = id;
        } else {
            // Old kernels lack the ID ioctl; the read format carries it too.
            event_fd.id = event_fd.read_counter()?.id;
        }
        debug!(
            "opened perf event file for {event_name} on tid {tid} cpu {cpu}, id {}",
            event_fd.id
        );
        Ok(event_fd)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread_id(&self) -> pid_t {
        self.tid
    }

    pub fn cpu(&self) -> i32 {
        self.cpu
    }

    pub fn enable(&self) -> Result<()> {
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_ENABLE as _, 0) };
        if result < 0 {
            return Err(Error::KernelRead(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_DISABLE as _, 0) };
        if result < 0 {
            return Err(Error::KernelRead(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn read_counter(&self) -> Result<PerfCounter> {
        let mut values = [0u64; 4];
        let size = std::mem::size_of_val(&values);
        let n = unsafe { libc::read(self.fd, values.as_mut_ptr() as *mut c_void, size) };
        if n != size as isize {
            return Err(Error::KernelRead(io::Error::last_os_error()));
        }
        Ok(PerfCounter {
            value: values[0],
            time_enabled: values[1],
            time_running: values[2],
            id: values[3],
        })
    }

    /// Map a ring buffer of `pages` data pages (a power of two) plus the
    /// header page.
    pub fn create_mapped_buffer(&mut self, pages: usize, report_error: bool) -> Result<()> {
        debug_assert!(pages.is_power_of_two());
        let mmap_len = PAGE_SIZE * (pages + 1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            if report_error {
                log::error!(
                    "failed to mmap {pages} pages for {}: {err}",
                    self.event_name
                );
            }
            return Err(Error::BufferMap(err));
        }
        self.mmap = Some(MappedBuffer {
            ptr: ptr as *mut u8,
            mmap_len,
            data_size: (PAGE_SIZE * pages) as u64,
        });
        Ok(())
    }

    /// Route this file's output into `other`'s ring buffer. Only `other`
    /// keeps a mapping; this file stays buffer-less.
    pub fn share_mapped_buffer(&self, other: &EventFd, report_error: bool) -> Result<()> {
        let result =
            unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_SET_OUTPUT as _, other.fd) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if report_error {
                log::error!(
                    "failed to share mapped buffer of {} with {}: {err}",
                    other.event_name,
                    self.event_name
                );
            }
            return Err(Error::BufferMap(err));
        }
        Ok(())
    }

    pub fn has_mapped_buffer(&self) -> bool {
        self.mmap.is_some()
    }

    pub fn destroy_mapped_buffer(&mut self) {
        self.mmap = None;
    }

    /// Copy all currently readable bytes out of the ring buffer into `buf`
    /// (replacing its contents) and advance the consumer cursor. Returns the
    /// number of bytes read; 0 when the buffer is empty or unmapped.
    ///
    /// One pass per call: the buffer caches roughly half its size before
    /// raising a read event, and spinning on one buffer could make others
    /// overflow.
    pub fn read_mmap_data(&mut self, buf: &mut Vec<u8>) -> usize {
        buf.clear();
        let mmap = match &self.mmap {
            Some(mmap) => mmap,
            None => return 0,
        };
        let head = unsafe { read_head(mmap.ptr) };
        let tail = unsafe { read_tail(mmap.ptr) };
        if head == tail {
            return 0;
        }
        let size = mmap.data_size;
        let data = unsafe {
            std::slice::from_raw_parts(mmap.ptr.add(PAGE_SIZE), size as usize)
        };
        let read_len = (head - tail).min(size) as usize;
        let start = (tail % size) as usize;
        if start + read_len <= size as usize {
            buf.extend_from_slice(&data[start..start + read_len]);
        } else {
            // The readable region wraps; two slices.
            buf.extend_from_slice(&data[start..]);
            buf.extend_from_slice(&data[..read_len - (size as usize - start)]);
        }
        unsafe { write_tail(mmap.ptr, head) };
        read_len
    }

    pub fn set_poll_event(&mut self, event: IOEventRef) {
        self.poll_event = Some(event);
    }

    pub fn stop_polling(&mut self) {
        if let Some(event) = self.poll_event.take() {
            event.cancel();
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        self.stop_polling();
        self.mmap = None;
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl std::fmt::Debug for EventFd {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EventFd")
            .field("name", &self.event_name)
            .field("fd", &self.fd)
            .field("id", &self.id)
            .field("tid", &self.tid)
            .field("cpu", &self.cpu)
            .field("mapped", &self.mmap.is_some())
            .finish()
    }
}
