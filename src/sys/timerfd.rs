use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;

/// A monotonic `timerfd_create(2)` descriptor. Readable whenever the timer
/// has expired since the last settime or read.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

#[derive(Debug, Clone)]
pub struct TimerSpec {
    pub interval: Duration,
    pub value: Duration,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK
        ))?;

        Ok(TimerFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    pub fn settime(&self, value: TimerSpec) -> io::Result<()> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(value.interval),
            it_value: duration_to_timespec(value.value),
        };

        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            &mut old_value
        ))?;

        Ok(())
    }

    /// Arms a single expiration after `timeout`.
    pub fn arm_oneshot(&self, timeout: Duration) -> io::Result<()> {
        self.settime(TimerSpec {
            interval: Duration::new(0, 0),
            value: non_zero(timeout),
        })
    }

    /// Arms a repeating expiration every `period`.
    pub fn arm_interval(&self, period: Duration) -> io::Result<()> {
        let period = non_zero(period);
        self.settime(TimerSpec {
            interval: period,
            value: period,
        })
    }

    /// Clears pending expirations, returning how many had accumulated.
    pub fn drain(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let ret = syscall!(read(
            self.inner.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ));

        match ret {
            Ok(_) => Ok(u64::from_ne_bytes(buf)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

// it_value of zero disarms the timer, which is never what the callers mean.
fn non_zero(d: Duration) -> Duration {
    if d.is_zero() {
        Duration::from_nanos(1)
    } else {
        d
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
