use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process;
use std::time::Duration;

use log::error;

use crate::event::{Event, Events, MIN_EVENTS_CAPACITY};
use crate::sys::timerfd::TimerFd;
use crate::sys::{self, Epoll};
use crate::{Ready, Token};

// Registration tags carry the token shifted left by one; the low bit
// distinguishes timer descriptors from sockets, the way a kqueue filter
// would.
const TIMER_TAG: u64 = 1;

fn socket_tag(token: Token) -> u64 {
    (token.0 as u64) << 1
}

fn timer_tag(token: Token) -> u64 {
    ((token.0 as u64) << 1) | TIMER_TAG
}

struct Registration {
    token: Token,
    interest: Ready,
}

struct Timer {
    fd: TimerFd,
    periodic: bool,
}

/// The event source: registers read/write/timer interest keyed by raw
/// descriptor and blocks until something is ready.
///
/// Registration failures are programming errors and abort the process; the
/// reactor has no way to continue with a selector it cannot trust. `wait`
/// restarts transparently when a signal interrupts the underlying call.
pub struct Poll {
    epoll: Epoll,
    raw: Vec<libc::epoll_event>,
    sockets: HashMap<RawFd, Registration>,
    timers: HashMap<usize, Timer>,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        Ok(Poll {
            epoll: Epoll::new()?,
            raw: Vec::with_capacity(MIN_EVENTS_CAPACITY),
            sockets: HashMap::new(),
            timers: HashMap::new(),
        })
    }

    /// Expresses read interest on `fd`. Idempotent for an already
    /// read-registered descriptor.
    pub fn arm_read(&mut self, fd: RawFd, token: Token) {
        self.add_interest(fd, token, Ready::readable());
    }

    pub fn disarm_read(&mut self, fd: RawFd) {
        self.remove_interest(fd, Ready::readable());
    }

    /// Expresses write interest on `fd` without a paired timer. Used by the
    /// relay pump while flushing.
    pub fn arm_write(&mut self, fd: RawFd, token: Token) {
        self.add_interest(fd, token, Ready::writable());
    }

    pub fn disarm_write(&mut self, fd: RawFd) {
        self.remove_interest(fd, Ready::writable());
    }

    /// Expresses write interest on `fd` and arms a one-shot timer firing
    /// after `timeout`. Both events carry `token`.
    pub fn arm_write_with_timeout(&mut self, fd: RawFd, token: Token, timeout: Duration) {
        self.add_interest(fd, token, Ready::writable());

        let timer = match TimerFd::new().and_then(|t| {
            t.arm_oneshot(timeout)?;
            Ok(t)
        }) {
            Ok(timer) => timer,
            Err(e) => {
                error!("timerfd create error fd {}: {}", fd, e);
                process::abort();
            }
        };

        if let Err(e) = self
            .epoll
            .add(timer.as_raw_fd(), Ready::readable(), timer_tag(token))
        {
            error!("epoll add timer error fd {}: {}", fd, e);
            process::abort();
        }

        let prev = self.timers.insert(
            token.0,
            Timer {
                fd: timer,
                periodic: false,
            },
        );
        debug_assert!(prev.is_none());
    }

    pub fn disarm_write_with_timeout(&mut self, fd: RawFd, token: Token) {
        self.remove_interest(fd, Ready::writable());
        self.remove_timer(token);
    }

    /// Arms a repeating timer carrying `token`. The timer has no socket;
    /// `token` must not collide with any socket registration's token.
    pub fn arm_periodic_timer(&mut self, token: Token, period: Duration) {
        let timer = match TimerFd::new().and_then(|t| {
            t.arm_interval(period)?;
            Ok(t)
        }) {
            Ok(timer) => timer,
            Err(e) => {
                error!("periodic timerfd create error: {}", e);
                process::abort();
            }
        };

        if let Err(e) = self
            .epoll
            .add(timer.as_raw_fd(), Ready::readable(), timer_tag(token))
        {
            error!("epoll add periodic timer error: {}", e);
            process::abort();
        }

        let prev = self.timers.insert(
            token.0,
            Timer {
                fd: timer,
                periodic: true,
            },
        );
        debug_assert!(prev.is_none());
    }

    /// Blocks until at least one registered event is ready and fills
    /// `events` with the translated ready set, in kernel order. The set is
    /// valid until the next call.
    pub fn wait(&mut self, events: &mut Events) -> usize {
        let needed = self.sockets.len() + self.timers.len();
        if needed == 0 {
            error!("wait called with no events registered");
            process::abort();
        }
        self.reserve_raw(needed);

        loop {
            match self.epoll.wait(&mut self.raw) {
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => {
                    error!("epoll wait error: {}", e);
                    process::abort();
                }
            }
        }

        events.clear();

        for ev in &self.raw {
            let token = Token((ev.u64 >> 1) as usize);

            if ev.u64 & TIMER_TAG != 0 {
                // Repeating timers must be drained or they stay readable
                // forever under level triggering.
                if let Some(timer) = self.timers.get(&token.0) {
                    if timer.periodic {
                        let _ = timer.fd.drain();
                    }
                }
                events.push(Event::new(Ready::timer(), token));
            } else {
                events.push(Event::new(sys::epoll_to_ready(ev.events), token));
            }
        }

        events.len()
    }

    fn add_interest(&mut self, fd: RawFd, token: Token, what: Ready) {
        let res = match self.sockets.get_mut(&fd) {
            Some(reg) => {
                debug_assert_eq!(reg.token, token);
                if reg.interest.contains(what) {
                    return;
                }
                reg.interest.insert(what);
                self.epoll.modify(fd, reg.interest, socket_tag(token))
            }
            None => {
                self.sockets.insert(
                    fd,
                    Registration {
                        token,
                        interest: what,
                    },
                );
                self.epoll.add(fd, what, socket_tag(token))
            }
        };

        if let Err(e) = res {
            error!("epoll register error fd {}: {}", fd, e);
            process::abort();
        }
    }

    fn remove_interest(&mut self, fd: RawFd, what: Ready) {
        let res = match self.sockets.get_mut(&fd) {
            Some(reg) => {
                reg.interest.remove(what);
                if reg.interest.is_empty() {
                    let _ = self.sockets.remove(&fd);
                    self.epoll.delete(fd)
                } else {
                    let token = reg.token;
                    let interest = reg.interest;
                    self.epoll.modify(fd, interest, socket_tag(token))
                }
            }
            None => return,
        };

        if let Err(e) = res {
            error!("epoll unregister error fd {}: {}", fd, e);
            process::abort();
        }
    }

    fn remove_timer(&mut self, token: Token) {
        if let Some(timer) = self.timers.remove(&token.0) {
            if let Err(e) = self.epoll.delete(timer.fd.as_raw_fd()) {
                error!("epoll remove timer error: {}", e);
                process::abort();
            }
        }
    }

    // Doubling growth from a small floor, never shrunk.
    fn reserve_raw(&mut self, needed: usize) {
        if self.raw.capacity() >= needed {
            return;
        }

        let mut cap = self.raw.capacity().max(MIN_EVENTS_CAPACITY);
        while cap < needed {
            cap *= 2;
        }

        self.raw.clear();
        self.raw.reserve_exact(cap);
    }
}
