//! The counter primitive: a thin, scope-owned wrapper around
//! `perf_event_open`.
//!
//! Counter handles close themselves on drop, so every probe releases its
//! counter on every exit path. Failure to open a counter is deliberately
//! not fatal here; callers treat it as "feature not exercised".

use log::warn;
use perf_event_open_sys as sys;
use perf_event_open_sys::bindings as perf;
use std::fs::File;
use std::io;
use std::io::Read;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Counter config bit: count events inside hardware transactions, even
/// aborted ones.
pub(crate) const IN_TX: u64 = 1 << 32;
/// Counter config bit: don't count events inside aborted transactions
/// ("checkpointed" counting).
pub(crate) const IN_TXCP: u64 = 1 << 33;

/// An open performance counter, closed when dropped.
pub struct PerfCounter {
    file: File,
}

impl PerfCounter {
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn enable(&self) {
        self.control("enable", unsafe { sys::ioctls::ENABLE(self.fd(), 0) });
    }

    pub fn disable(&self) {
        self.control("disable", unsafe { sys::ioctls::DISABLE(self.fd(), 0) });
    }

    pub fn reset(&self) {
        self.control("reset", unsafe { sys::ioctls::RESET(self.fd(), 0) });
    }

    fn control(&self, what: &str, ret: libc::c_int) {
        if ret < 0 {
            warn!(
                "can't {} counter: {}",
                what,
                io::Error::last_os_error()
            );
        }
    }

    /// Read the current signed 64-bit count.
    pub fn read(&self) -> io::Result<i64> {
        let mut buf = [0u8; 8];
        (&self.file).read_exact(&mut buf)?;
        Ok(i64::from_ne_bytes(buf))
    }
}

/// Fill in a `perf_event_attr` for a counting event. Only userspace,
/// non-guest execution is counted.
pub(crate) fn init_perf_event_attr(perf_type: u32, config: u64) -> perf::perf_event_attr {
    let mut attr = perf::perf_event_attr::default();
    attr.size = mem::size_of::<perf::perf_event_attr>() as u32;
    attr.type_ = perf_type;
    attr.config = config;
    attr.__bindgen_anon_1.sample_period = 0;
    attr.set_exclude_kernel(1);
    attr.set_exclude_guest(1);
    attr
}

/// Open a counter on the calling thread (`tid` 0) or the given thread, on
/// whatever CPU it runs on. Returns `None` if the counter can't be opened;
/// the event is then simply not exercised.
pub(crate) fn start_counter(
    tid: libc::pid_t,
    group_fd: RawFd,
    attr: &mut perf::perf_event_attr,
) -> Option<PerfCounter> {
    start_counter_txcp(tid, group_fd, attr).map(|(counter, _)| counter)
}

/// Like [`start_counter`], additionally reporting whether the IN_TXCP
/// config bit had to be stripped because the kernel rejected it.
pub(crate) fn start_counter_txcp(
    tid: libc::pid_t,
    group_fd: RawFd,
    attr: &mut perf::perf_event_attr,
) -> Option<(PerfCounter, bool)> {
    attr.set_pinned((group_fd == -1) as u64);

    let fd = unsafe {
        sys::perf_event_open(
            attr,
            tid,
            -1,
            group_fd,
            perf::PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
        )
    };
    if fd >= 0 {
        let file = unsafe { File::from_raw_fd(fd) };
        return Some((PerfCounter { file }, false));
    }
    let err = io::Error::last_os_error();

    if err.raw_os_error() == Some(libc::EINVAL) && attr.config & IN_TXCP != 0 {
        // The kernel might not support IN_TXCP, so try again without it.
        let mut fallback = *attr;
        fallback.config &= !IN_TXCP;
        let fd = unsafe {
            sys::perf_event_open(
                &mut fallback,
                tid,
                -1,
                group_fd,
                perf::PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
            )
        };
        if fd >= 0 {
            warn!("kernel does not support IN_TXCP");
            let file = unsafe { File::from_raw_fd(fd) };
            return Some((PerfCounter { file }, true));
        }
    }

    warn!("couldn't open performance counter: {}", err);
    None
}
