//! An event-driven layer-4 TCP reverse proxy.
//!
//! `rproxy` accepts connections on one or more listen endpoints, picks an
//! upstream from a configured pool at random for each one, and relays bytes
//! both ways until either side closes, errors, or the outbound connect
//! times out. Everything runs on a single-threaded epoll loop; per-fd
//! connect timeouts and the periodic diagnostic reporter are timerfd
//! registrations on the same loop.
//!
//! ```text
//! rproxy -l 127.0.0.1:8080 -r 10.0.0.1:80 -r 10.0.0.2:80 -c 5000 -p 60000
//! ```
//!
//! The crate is organised the way the loop is layered:
//!
//! * [`poll`] — the event source: read/write/timer interest keyed by raw
//!   descriptor, one blocking `wait` per iteration.
//! * [`conn`] — the connection pair: two sibling halves, their state flags,
//!   and the bounded relay buffers.
//! * [`reactor`] — dispatch, accept bursts, the connect state machine, the
//!   relay pump, deferred destruction, and the periodic reporter.
//! * [`config`] and [`logger`] — the immutable settings object and the
//!   line-oriented stdout sink.

pub mod sys;

pub mod config;
pub mod conn;
mod event;
pub mod logger;
pub mod poll;
pub mod reactor;
mod ready;
mod token;

pub use event::{Event, Events};
pub use ready::Ready;
pub use token::Token;
