use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use indexmap::IndexSet;
use log::{debug, error, info, warn};
use slab::Slab;

use crate::config::{endpoint_string, ProxyConfig};
use crate::conn::{ConnHalf, Direction, FillOutcome};
use crate::event::Events;
use crate::logger;
use crate::poll::Poll;
use crate::sys::socket::{self, ConnectStatus, Socket};
use crate::{Ready, Token};

/// Accept fairness cap: one readiness notification on a listener yields at
/// most this many accepts before other tags get a turn.
const MAX_ACCEPTS_PER_EVENT: usize = 100;

enum Entry {
    Listener(Socket),
    Conn(ConnHalf),
    Reporter,
}

#[derive(Clone, Copy)]
enum EntryKind {
    Listener,
    Conn,
    Reporter,
}

/// The event loop and connection lifecycle manager.
///
/// Owns the event source, the socket registry, and the two sibling lists
/// (active and destroy). Everything runs on the calling thread; the only
/// suspension point is the `wait` call at the top of each iteration.
pub struct Reactor {
    config: ProxyConfig,
    poll: Poll,
    events: Events,
    entries: Slab<Entry>,
    active: IndexSet<usize>,
    destroy: Vec<usize>,
    rng: fastrand::Rng,
}

impl Reactor {
    /// Binds and arms every configured listener and the periodic reporter.
    /// Any bootstrap failure is returned for the caller to exit on.
    pub fn new(config: ProxyConfig) -> io::Result<Reactor> {
        let mut poll = Poll::new()?;
        let mut entries = Slab::new();

        for addr in &config.listen_addrs {
            let (socket, name) = bind_listener(addr)?;
            let fd = socket.as_raw_fd();

            info!("listening on {} (fd={})", name, fd);

            let key = entries.insert(Entry::Listener(socket));
            poll.arm_read(fd, Token(key));
        }

        if !config.periodic_log.is_zero() {
            let key = entries.insert(Entry::Reporter);
            poll.arm_periodic_timer(Token(key), config.periodic_log);
        }

        Ok(Reactor {
            config,
            poll,
            events: Events::new(),
            entries,
            active: IndexSet::new(),
            destroy: Vec::new(),
            rng: fastrand::Rng::new(),
        })
    }

    /// Runs the loop forever: wait, dispatch the batch in order, drain the
    /// destroy list.
    pub fn run(&mut self) -> ! {
        loop {
            let n = self.poll.wait(&mut self.events);

            for i in 0..n {
                let event = match self.events.get(i) {
                    Some(event) => event,
                    None => break,
                };
                self.dispatch(event.token().0, event.readiness());
            }

            self.drain_destroy_list();
        }
    }

    fn dispatch(&mut self, key: usize, ready: Ready) {
        let kind = match self.entries.get(key) {
            Some(Entry::Listener(_)) => EntryKind::Listener,
            Some(Entry::Conn(_)) => EntryKind::Conn,
            Some(Entry::Reporter) => EntryKind::Reporter,
            None => {
                debug!("event for retired token {}", key);
                return;
            }
        };

        match kind {
            EntryKind::Listener => self.accept_burst(key),
            EntryKind::Conn => self.on_conn_ready(key, ready),
            EntryKind::Reporter => self.report_active(),
        }
    }

    fn accept_burst(&mut self, listener_key: usize) {
        let listen_fd = match self.entries.get(listener_key) {
            Some(Entry::Listener(socket)) => socket.as_raw_fd(),
            _ => return,
        };

        for _ in 0..MAX_ACCEPTS_PER_EVENT {
            match socket::accept(listen_fd) {
                Ok(Some((client, peer))) => {
                    info!("accept fd={}", client.as_raw_fd());
                    self.handle_new_client(client, peer);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Builds a connection pair for an accepted client. Failures before the
    /// halves enter the registry close the sockets and touch nothing else.
    fn handle_new_client(&mut self, client: Socket, client_peer: SocketAddr) {
        let client_fd = client.as_raw_fd();

        let client_local = match client.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("getsockname error fd={}: {}", client_fd, e);
                return;
            }
        };

        info!(
            "connect client to proxy {} -> {} (fd={})",
            endpoint_string(&client_peer),
            endpoint_string(&client_local),
            client_fd
        );

        let idx = self.rng.usize(0..self.config.remote_addrs.len());
        let remote_addr = self.config.remote_addrs[idx];
        info!("using remote index {}", idx);

        let remote = match Socket::stream(&remote_addr) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("error creating remote socket: {}", e);
                return;
            }
        };
        let remote_fd = remote.as_raw_fd();

        let status = match remote.connect(&remote_addr) {
            Ok(status) => status,
            Err(e) => {
                warn!("remote socket connect error fd={}: {}", remote_fd, e);
                return;
            }
        };

        let remote_local = match remote.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("getsockname error fd={}: {}", remote_fd, e);
                return;
            }
        };

        info!(
            "connect {} proxy to remote {} -> {} (fd={})",
            match status {
                ConnectStatus::Connected => "complete",
                ConnectStatus::InProgress => "starting",
            },
            endpoint_string(&remote_local),
            endpoint_string(&remote_addr),
            remote_fd
        );

        // The client side relays from birth; bytes that arrive while the
        // upstream connect is pending wait in its buffer.
        let mut client_half = ConnHalf::new(
            client,
            Direction::ClientToProxy,
            endpoint_string(&client_peer),
            endpoint_string(&client_local),
        );
        client_half.waiting_for_read = true;

        let mut remote_half = ConnHalf::new(
            remote,
            Direction::ProxyToRemote,
            endpoint_string(&remote_local),
            endpoint_string(&remote_addr),
        );
        match status {
            ConnectStatus::Connected => remote_half.waiting_for_read = true,
            ConnectStatus::InProgress => remote_half.waiting_for_connect = true,
        }

        let client_key = self.entries.insert(Entry::Conn(client_half));
        let remote_key = self.entries.insert(Entry::Conn(remote_half));

        if let Some(Entry::Conn(half)) = self.entries.get_mut(client_key) {
            half.sibling = Some(Token(remote_key));
        }
        if let Some(Entry::Conn(half)) = self.entries.get_mut(remote_key) {
            half.sibling = Some(Token(client_key));
        }

        self.active.insert(client_key);
        self.active.insert(remote_key);

        self.register_half(client_key);
        self.register_half(remote_key);
    }

    fn register_half(&mut self, key: usize) {
        let (fd, connect, read, write) = match self.entries.get(key) {
            Some(Entry::Conn(half)) => (
                half.fd(),
                half.waiting_for_connect,
                half.waiting_for_read,
                half.waiting_for_write,
            ),
            _ => return,
        };
        let token = Token(key);

        if connect {
            debug_assert!(!read && !write);
            self.poll
                .arm_write_with_timeout(fd, token, self.config.connect_timeout);
        }
        if read {
            self.poll.arm_read(fd, token);
        }
        if write {
            self.poll.arm_write(fd, token);
        }
    }

    fn on_conn_ready(&mut self, key: usize, ready: Ready) {
        // An earlier event in this batch may have marked the pair through
        // the sibling; the tag is still valid, the work is not.
        let (fd, marked, connecting) = match self.entries.get(key) {
            Some(Entry::Conn(half)) => (
                half.fd(),
                half.marked_for_destruction,
                half.waiting_for_connect,
            ),
            _ => return,
        };
        if marked {
            return;
        }

        if ready.is_timer() {
            if connecting {
                info!("connect timeout fd={}", fd);
                self.mark_for_destruction(key);
            }
            return;
        }

        if connecting {
            if ready.is_writable() || ready.is_error() || ready.is_hup() {
                self.finish_connect(key, fd);
            }
            return;
        }

        if ready.is_error() {
            match socket::take_error(fd) {
                Ok(err) if err != 0 => warn!(
                    "socket error fd={}: {}",
                    fd,
                    io::Error::from_raw_os_error(err)
                ),
                _ => warn!("socket error fd={}", fd),
            }
            self.mark_for_destruction(key);
            return;
        }

        if ready.is_readable() || ready.is_hup() {
            if !self.pump_read(key) {
                self.mark_for_destruction(key);
                return;
            }
        }

        if ready.is_writable() {
            if !self.pump_write(key) {
                self.mark_for_destruction(key);
            }
        }
    }

    /// Resolves a pending asynchronous connect on the upstream half.
    fn finish_connect(&mut self, key: usize, fd: RawFd) {
        let err = match socket::take_error(fd) {
            Ok(err) => err,
            Err(e) => {
                warn!("getsockopt error fd={}: {}", fd, e);
                self.mark_for_destruction(key);
                return;
            }
        };

        if err == libc::EINPROGRESS {
            // still in progress
            return;
        }

        if err != 0 {
            warn!(
                "async remote connect error fd={}: {}",
                fd,
                io::Error::from_raw_os_error(err)
            );
            self.mark_for_destruction(key);
            return;
        }

        let sibling = match self.entries.get(key) {
            Some(Entry::Conn(half)) => half.sibling,
            _ => return,
        };
        let sib_key = match sibling {
            Some(token) => token.0,
            None => {
                self.mark_for_destruction(key);
                return;
            }
        };

        let (half, sib) = match self.entries.get2_mut(key, sib_key) {
            Some((Entry::Conn(half), Entry::Conn(sib))) => (half, sib),
            _ => return,
        };

        info!(
            "connect complete proxy to remote {} -> {} (fd={})",
            half.from_name(),
            half.to_name(),
            fd
        );

        self.poll.disarm_write_with_timeout(fd, Token(key));
        half.waiting_for_connect = false;
        half.waiting_for_read = true;
        self.poll.arm_read(fd, Token(key));

        // Bytes the client sent during the connect window are waiting in
        // its buffer; flush them to the upstream now.
        if !sib.buf.is_empty() {
            half.waiting_for_write = true;
            self.poll.arm_write(fd, Token(key));
        }
    }

    /// Drains the socket into this half's buffer. Returns false when the
    /// pair must come down (EOF or read error).
    fn pump_read(&mut self, key: usize) -> bool {
        let sibling = match self.entries.get(key) {
            Some(Entry::Conn(half)) => half.sibling,
            _ => return true,
        };
        let sib_key = match sibling {
            Some(token) => token.0,
            None => return false,
        };

        let (half, sib) = match self.entries.get2_mut(key, sib_key) {
            Some((Entry::Conn(half), Entry::Conn(sib))) => (half, sib),
            _ => return true,
        };
        let fd = half.fd();

        loop {
            if half.buf.is_full() {
                if half.waiting_for_read {
                    half.waiting_for_read = false;
                    self.poll.disarm_read(fd);
                }
                break;
            }

            match half.buf.fill_from(fd) {
                Ok(FillOutcome::Read(n)) => half.bytes_in += n as u64,
                Ok(FillOutcome::WouldBlock) => break,
                Ok(FillOutcome::Eof) => {
                    debug!("eof fd={}", fd);
                    return false;
                }
                Err(e) => {
                    warn!("read error fd={}: {}", fd, e);
                    return false;
                }
            }
        }

        if !half.buf.is_empty()
            && !sib.waiting_for_connect
            && !sib.waiting_for_write
            && !sib.marked_for_destruction
        {
            sib.waiting_for_write = true;
            self.poll.arm_write(sib.fd(), Token(sib_key));
        }

        true
    }

    /// Flushes the sibling's buffer into this writable socket. Returns
    /// false when the pair must come down (write error).
    fn pump_write(&mut self, key: usize) -> bool {
        let sibling = match self.entries.get(key) {
            Some(Entry::Conn(half)) => half.sibling,
            _ => return true,
        };
        let sib_key = match sibling {
            Some(token) => token.0,
            None => return false,
        };

        let (half, sib) = match self.entries.get2_mut(key, sib_key) {
            Some((Entry::Conn(half), Entry::Conn(sib))) => (half, sib),
            _ => return true,
        };
        let fd = half.fd();

        if !half.waiting_for_write {
            return true;
        }

        match sib.buf.flush_to(fd) {
            Ok(emptied) => {
                if emptied {
                    half.waiting_for_write = false;
                    self.poll.disarm_write(fd);
                }
            }
            Err(e) => {
                warn!("write error fd={}: {}", fd, e);
                return false;
            }
        }

        // The flush made room; resume reading the sibling if backpressure
        // had stopped it.
        if !sib.buf.is_full()
            && !sib.waiting_for_read
            && !sib.waiting_for_connect
            && !sib.marked_for_destruction
        {
            sib.waiting_for_read = true;
            self.poll.arm_read(sib.fd(), Token(sib_key));
        }

        true
    }

    /// Moves a half and its sibling from the active list to the destroy
    /// list. Registrations stay in place so tags from the current batch
    /// remain valid; the drain at the end of the iteration disarms them.
    fn mark_for_destruction(&mut self, key: usize) {
        let sibling = match self.entries.get_mut(key) {
            Some(Entry::Conn(half)) if !half.marked_for_destruction => {
                half.marked_for_destruction = true;
                half.sibling
            }
            _ => return,
        };

        self.active.swap_remove(&key);
        self.destroy.push(key);

        if let Some(sibling) = sibling {
            self.mark_for_destruction(sibling.0);
        }
    }

    fn drain_destroy_list(&mut self) {
        for key in mem::take(&mut self.destroy) {
            self.destroy_half(key);
        }
        debug_assert!(self.destroy.is_empty());
    }

    fn destroy_half(&mut self, key: usize) {
        let half = match self.entries.try_remove(key) {
            Some(Entry::Conn(half)) => half,
            Some(other) => {
                error!("destroy list held a non-connection token {}", key);
                self.entries.insert(other);
                return;
            }
            None => return,
        };
        let fd = half.fd();

        info!(
            "disconnect {} {} -> {} (fd={},bytes={})",
            half.direction(),
            half.from_name(),
            half.to_name(),
            fd,
            half.bytes_in
        );

        if half.waiting_for_connect {
            self.poll.disarm_write_with_timeout(fd, Token(key));
        }
        if half.waiting_for_read {
            self.poll.disarm_read(fd);
        }
        if half.waiting_for_write {
            self.poll.disarm_write(fd);
        }

        if let Some(sibling) = half.sibling {
            if let Some(Entry::Conn(sib)) = self.entries.get_mut(sibling.0) {
                sib.sibling = None;
            }
        }

        // Dropping the half closes its socket, which also tears down the
        // kernel side of anything still in flight.
        drop(half);
    }

    /// Periodic reporter: one line per active half between framing markers,
    /// emitted only when at least one half exists.
    fn report_active(&mut self) {
        if self.active.is_empty() {
            return;
        }

        info!("Active connections: [");

        for &key in &self.active {
            let half = match self.entries.get(key) {
                Some(Entry::Conn(half)) => half,
                _ => continue,
            };

            let sibling_fd = half
                .sibling
                .and_then(|token| match self.entries.get(token.0) {
                    Some(Entry::Conn(sib)) => Some(sib.fd()),
                    _ => None,
                });

            logger::plain(&format!(
                "  fd={} sibling_fd={} connect={} read={} write={} {} {} -> {} bytes={}",
                half.fd(),
                sibling_fd.map_or_else(|| "-".to_string(), |fd| fd.to_string()),
                half.waiting_for_connect,
                half.waiting_for_read,
                half.waiting_for_write,
                half.direction(),
                half.from_name(),
                half.to_name(),
                half.bytes_in
            ));
        }

        logger::plain("]");
    }
}

fn bind_listener(addr: &SocketAddr) -> io::Result<(Socket, String)> {
    let name = endpoint_string(addr);

    let socket = Socket::stream(addr).map_err(|e| {
        error!("error creating server socket {}: {}", name, e);
        e
    })?;

    socket.set_reuse_addr().map_err(|e| {
        error!("setsockopt error on server socket {}: {}", name, e);
        e
    })?;

    socket.bind(addr).map_err(|e| {
        error!("bind error on server socket {}: {}", name, e);
        e
    })?;

    socket.listen().map_err(|e| {
        error!("listen error on server socket {}: {}", name, e);
        e
    })?;

    // Rebind the name so a port-zero bind reports the real port.
    let name = endpoint_string(&socket.local_addr()?);

    Ok((socket, name))
}
