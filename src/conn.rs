use std::fmt;
use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::sys::socket::{self, Socket};
use crate::Token;

/// Per-direction relay buffer size. Backpressure disarms read interest when
/// a buffer fills, so this bounds memory per connection pair.
pub const RELAY_BUF_SIZE: usize = 64 * 1024;

/// Which side of the relay a half is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToProxy,
    ProxyToRemote,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::ClientToProxy => write!(f, "client to proxy"),
            Direction::ProxyToRemote => write!(f, "proxy to remote"),
        }
    }
}

/// Outcome of one read into a relay buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Bytes moved into the buffer.
    Read(usize),
    WouldBlock,
    /// The peer closed its end.
    Eof,
}

/// Bounded buffer for one relay direction: bytes read from one half,
/// pending write to its sibling.
pub struct RelayBuf {
    data: Box<[u8]>,
    start: usize,
    end: usize,
}

impl RelayBuf {
    pub fn new() -> RelayBuf {
        RelayBuf {
            data: vec![0u8; RELAY_BUF_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn is_full(&self) -> bool {
        self.end - self.start == self.data.len()
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Reads once from `fd` into the free tail of the buffer, restarting on
    /// signal interruption. The caller must not call this on a full buffer.
    pub fn fill_from(&mut self, fd: RawFd) -> io::Result<FillOutcome> {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.end == self.data.len() && self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        loop {
            return match socket::read(fd, &mut self.data[self.end..]) {
                Ok(0) => Ok(FillOutcome::Eof),
                Ok(n) => {
                    self.end += n;
                    Ok(FillOutcome::Read(n))
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(FillOutcome::WouldBlock),
                Err(e) => Err(e),
            };
        }
    }

    /// Writes buffered bytes to `fd` until drained or the socket stops
    /// accepting. Returns whether the buffer was emptied.
    pub fn flush_to(&mut self, fd: RawFd) -> io::Result<bool> {
        while self.start < self.end {
            match socket::write(fd, &self.data[self.start..self.end]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => self.start += n,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        self.start = 0;
        self.end = 0;
        Ok(true)
    }
}

impl Default for RelayBuf {
    fn default() -> RelayBuf {
        RelayBuf::new()
    }
}

/// One of the two sockets of a relayed connection.
///
/// The sibling field holds the registry key of the paired half and is
/// cleared when the sibling is freed first. Exactly one of the connect and
/// relay flag sets is live at a time; `marked_for_destruction` parks the
/// half on the destroy list until the end of the loop iteration.
pub struct ConnHalf {
    socket: Socket,
    direction: Direction,
    from: String,
    to: String,
    pub waiting_for_connect: bool,
    pub waiting_for_read: bool,
    pub waiting_for_write: bool,
    pub marked_for_destruction: bool,
    pub sibling: Option<Token>,
    pub buf: RelayBuf,
    /// Bytes read from this socket since the pair was created.
    pub bytes_in: u64,
}

impl ConnHalf {
    pub fn new(socket: Socket, direction: Direction, from: String, to: String) -> ConnHalf {
        ConnHalf {
            socket,
            direction,
            from,
            to,
            waiting_for_connect: false,
            waiting_for_read: false,
            waiting_for_write: false,
            marked_for_destruction: false,
            sibling: None,
            buf: RelayBuf::new(),
            bytes_in: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn from_name(&self) -> &str {
        &self.from
    }

    pub fn to_name(&self) -> &str {
        &self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn nonblocking_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let a = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (b, _) = listener.accept().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn fill_and_flush_round_trip() {
        let (mut a, b) = nonblocking_pair();
        let mut buf = RelayBuf::new();

        assert_eq!(buf.fill_from(b.as_raw_fd()).unwrap(), FillOutcome::WouldBlock);

        a.write_all(b"ping\n").unwrap();
        // Give loopback a moment to deliver.
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert_eq!(buf.fill_from(b.as_raw_fd()).unwrap(), FillOutcome::Read(5));
        assert_eq!(buf.len(), 5);

        let (c, d) = nonblocking_pair();
        assert!(buf.flush_to(c.as_raw_fd()).unwrap());
        assert!(buf.is_empty());

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut out = [0u8; 8];
        let mut d = &d;
        let n = d.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"ping\n");
    }

    #[test]
    fn fill_reports_eof() {
        let (a, b) = nonblocking_pair();
        drop(a);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut buf = RelayBuf::new();
        assert_eq!(buf.fill_from(b.as_raw_fd()).unwrap(), FillOutcome::Eof);
    }

    #[test]
    fn direction_names() {
        assert_eq!(Direction::ClientToProxy.to_string(), "client to proxy");
        assert_eq!(Direction::ProxyToRemote.to_string(), "proxy to remote");
    }
}
