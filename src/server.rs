//! The event loop: one listener socket plus a map of in-progress
//! [`Session`]s, all driven by a single [`Reactor`] on one thread.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, info_span, warn};

use crate::audit::AuditLogger;
use crate::codec::{self, ErrorCode, Packet};
use crate::config::SocketConfig;
use crate::error::{Result, TftpError};
use crate::handler::{ReadHandlerFactory, WriteHandlerFactory};
use crate::reactor::Reactor;
use crate::session::{negotiate, Interest, Outcome, Session};

/// Bind the listener socket with the buffer-size and reuse options
/// [`SocketConfig`] asks for. A failure to set an optional tuning (buffer
/// size, `SO_REUSEPORT`) only logs a warning; only bind itself is fatal.
fn bind_listener(bind_addr: SocketAddr, config: &SocketConfig) -> Result<UdpSocket> {
    let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TftpError::Tftp(format!("failed to create listener socket: {e}")))?;

    if config.reuse_address {
        if let Err(e) = socket.set_reuse_address(true) {
            warn!(error = %e, "failed to set SO_REUSEADDR");
        }
    }
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    if config.reuse_port {
        if let Err(e) = socket.set_reuse_port(true) {
            warn!(error = %e, "failed to set SO_REUSEPORT (may not be supported)");
        }
    }
    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_kb * 1024) {
        warn!(error = %e, requested_kb = config.recv_buffer_kb, "failed to set SO_RCVBUF");
    }
    if let Err(e) = socket.set_send_buffer_size(config.send_buffer_kb * 1024) {
        warn!(error = %e, requested_kb = config.send_buffer_kb, "failed to set SO_SNDBUF");
    }

    socket
        .bind(&bind_addr.into())
        .map_err(|e| TftpError::Tftp(format!("failed to bind to {bind_addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TftpError::Tftp(format!("failed to set non-blocking: {e}")))?;
    Ok(socket.into())
}

/// Negotiation failed on a request that never gets a [`Session`]: reject it
/// straight from the fresh session socket and stop.
macro_rules! try_negotiate {
    ($expr:expr, $socket:expr, $remote:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => {
                send_reject(&$socket, $remote, ErrorCode::IllegalOperation, &e.0);
                return Ok(());
            }
        }
    };
}

/// Everything the event loop needs to turn an RRQ/WRQ into a [`Session`].
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub read_factory: Arc<ReadHandlerFactory>,
    pub write_factory: Arc<WriteHandlerFactory>,
    /// Upper bound the server will ever agree to for `windowsize`,
    /// regardless of what the peer asks for.
    pub window_size_ceiling: usize,
    /// Session timeout used when the peer does not request the `timeout`
    /// option, in seconds (RFC 2349 range 1..=255).
    pub default_timeout_secs: u64,
    /// Block size used when the peer does not request `blksize`.
    pub default_block_size: usize,
    /// Upper bound on how long a single `poll()` call blocks when no
    /// session has a nearer deadline; also how promptly `shut_down()` is
    /// observed while idle.
    pub poll_interval: Duration,
    /// Buffer-size and address-reuse tuning applied to the listener socket.
    pub socket: SocketConfig,
}

pub struct TftpServer {
    listener: UdpSocket,
    reactor: Reactor,
    sessions: HashMap<RawFd, Session>,
    config: ServerConfig,
    shutdown: bool,
}

impl TftpServer {
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let listener = bind_listener(config.bind_addr, &config.socket)?;
        let mut reactor = Reactor::new()?;
        reactor.register(&listener)?;
        info!(addr = %config.bind_addr, "tftp server listening");
        Ok(Self {
            listener,
            reactor,
            sessions: HashMap::new(),
            config,
            shutdown: false,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shut_down(&mut self) {
        self.shutdown = true;
    }

    /// Close every in-progress session (handler + socket) and deregister
    /// the listener. Called once after `run()` returns so a shutdown
    /// never leaves a handler (and, for writes, a staged temp file)
    /// dangling.
    pub fn close(&mut self) {
        let fds: Vec<RawFd> = self.sessions.keys().copied().collect();
        for fd in fds {
            if let Some(mut session) = self.sessions.remove(&fd) {
                session.close();
                let _ = self.reactor.unregister(session.socket());
                audit_outcome(&session);
            }
        }
        let _ = self.reactor.unregister(&self.listener);
        self.reactor.close();
    }

    /// Drive the reactor until `shut_down()` is called. Each iteration
    /// waits for the nearest event: either a readable socket or the
    /// soonest session timeout.
    pub fn run(&mut self) -> Result<()> {
        while !self.shutdown {
            self.run_once()?;
        }
        self.close();
        Ok(())
    }

    /// One iteration of the loop; exposed separately so tests and embedders
    /// can pump the server without an unconditional `loop {}`.
    pub fn run_once(&mut self) -> Result<()> {
        let timeout = self.next_deadline_timeout();
        let ready = self.reactor.poll(Some(timeout))?;

        for fd in ready {
            if fd == self.listener.as_raw_fd() {
                self.accept_requests()?;
            } else if let Some(session) = self.sessions.get_mut(&fd) {
                let span = info_span!("session", remote = %session.remote());
                let _enter = span.enter();
                match session.step() {
                    Ok(Interest::Readable) => {}
                    Ok(Interest::Done) => self.retire(fd),
                    Err(e) => {
                        warn!(error = %e, "session errored, retiring");
                        self.retire(fd);
                    }
                }
            }
        }

        self.sweep_timeouts()?;
        Ok(())
    }

    /// Bounded by `poll_interval` even when idle, so the loop periodically
    /// wakes up to notice a shutdown request with no sessions in flight.
    fn next_deadline_timeout(&self) -> Duration {
        let now = Instant::now();
        self.sessions
            .values()
            .map(|s| s.deadline().saturating_duration_since(now))
            .min()
            .map(|d| d.min(self.config.poll_interval))
            .unwrap_or(self.config.poll_interval)
    }

    fn sweep_timeouts(&mut self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<RawFd> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.deadline() <= now)
            .map(|(fd, _)| *fd)
            .collect();

        for fd in expired {
            if let Some(session) = self.sessions.get_mut(&fd) {
                match session.on_timeout() {
                    Ok(Interest::Done) => self.retire(fd),
                    Ok(Interest::Readable) => {}
                    Err(e) => {
                        warn!(error = %e, "error handling session timeout");
                        self.retire(fd);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove a finished or errored session from the map, closing its
    /// handler/socket and emitting the matching audit event. Safe to call
    /// whether the session reached `done` on its own (the common case) or
    /// is being retired after `step`/`on_timeout` returned an I/O error (in
    /// which case `close()` still runs `fail()` so the handler is closed
    /// and no partial write is committed).
    fn retire(&mut self, fd: RawFd) {
        if let Some(mut session) = self.sessions.remove(&fd) {
            session.close();
            let _ = self.reactor.unregister(session.socket());
            audit_outcome(&session);
            debug!(remote = %session.remote(), "session retired");
        }
    }

    /// Accept every pending datagram on the listener socket. Only RRQ/WRQ
    /// are legal here; anything else gets an ERROR back on the listener's
    /// own port (there is no session to own a reply from any other TID).
    fn accept_requests(&mut self) -> Result<()> {
        let mut buf = [0u8; codec::MAX_PACKET_SIZE];
        loop {
            let (n, remote) = match self.listener.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let packet = match codec::decode(&buf[..n]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, %remote, "dropping malformed initial packet");
                    continue;
                }
            };

            if let Err(e) = self.start_session(packet, remote) {
                warn!(error = %e, %remote, "failed to start session");
            }
        }
    }

    fn start_session(&mut self, packet: Packet, remote: SocketAddr) -> Result<()> {
        let session_socket = UdpSocket::bind(SocketAddr::new(self.listener.local_addr()?.ip(), 0))?;
        session_socket.set_nonblocking(true)?;

        match packet {
            Packet::Rrq { filename, mode, options } => {
                let transfer_mode = match codec::TransferMode::parse(&mode) {
                    Ok(m) => m,
                    Err(_) => {
                        send_reject(&session_socket, remote, ErrorCode::IllegalOperation, "bad mode");
                        return Ok(());
                    }
                };
                let mut handler = match (self.config.read_factory)(&filename, transfer_mode, remote) {
                    Ok(h) => h,
                    Err(e) => {
                        AuditLogger::read_denied(remote, &filename, &e.message);
                        send_reject(&session_socket, remote, e.code, &e.message);
                        return Ok(());
                    }
                };
                // Opened here, ahead of option negotiation, so `tsize` can
                // answer with the handler's actual length; Session::setup
                // does not re-open it.
                if let Err(e) = handler.open() {
                    AuditLogger::read_denied(remote, &filename, &e.message);
                    send_reject(&session_socket, remote, e.code, &e.message);
                    return Ok(());
                }
                let file_size = handler.length();
                let negotiated = try_negotiate!(
                    negotiate(
                        &options,
                        file_size,
                        self.config.window_size_ceiling,
                        self.config.default_timeout_secs,
                        self.config.default_block_size,
                    ),
                    session_socket,
                    remote
                );
                let oack = if options.is_empty() { None } else { Some(negotiated.accepted) };
                let mut session = Session::new_read(
                    session_socket,
                    remote,
                    filename.clone(),
                    handler,
                    negotiated.block_size,
                    negotiated.window_size,
                    negotiated.timeout,
                    oack,
                );
                self.register_session(&mut session)?;
                AuditLogger::transfer_started(
                    remote,
                    &filename,
                    file_size.unwrap_or(0),
                    transfer_mode.as_str(),
                    negotiated.block_size,
                );
                self.sessions.insert(session.socket().as_raw_fd(), session);
            }
            Packet::Wrq { filename, mode, options } => {
                let transfer_mode = match codec::TransferMode::parse(&mode) {
                    Ok(m) => m,
                    Err(_) => {
                        send_reject(&session_socket, remote, ErrorCode::IllegalOperation, "bad mode");
                        return Ok(());
                    }
                };
                let mut handler = match (self.config.write_factory)(&filename, transfer_mode, remote) {
                    Ok(h) => h,
                    Err(e) => {
                        AuditLogger::write_request_denied(remote, &filename, &e.message);
                        send_reject(&session_socket, remote, e.code, &e.message);
                        return Ok(());
                    }
                };
                if let Err(e) = handler.open() {
                    AuditLogger::write_request_denied(remote, &filename, &e.message);
                    send_reject(&session_socket, remote, e.code, &e.message);
                    return Ok(());
                }
                let negotiated = try_negotiate!(
                    negotiate(
                        &options,
                        None,
                        self.config.window_size_ceiling,
                        self.config.default_timeout_secs,
                        self.config.default_block_size,
                    ),
                    session_socket,
                    remote
                );
                let oack = if options.is_empty() { None } else { Some(negotiated.accepted) };
                let mut session = Session::new_write(
                    session_socket,
                    remote,
                    filename.clone(),
                    handler,
                    negotiated.block_size,
                    negotiated.window_size,
                    negotiated.timeout,
                    oack,
                );
                self.register_session(&mut session)?;
                AuditLogger::write_started(remote, &filename, transfer_mode.as_str(), negotiated.block_size);
                self.sessions.insert(session.socket().as_raw_fd(), session);
            }
            other => {
                debug!(?other, %remote, "rejecting non-request packet on listener");
                send_reject(
                    &session_socket,
                    remote,
                    ErrorCode::IllegalOperation,
                    "Session not started with RRQ or WRQ!",
                );
            }
        }
        Ok(())
    }

    fn register_session(&mut self, session: &mut Session) -> Result<()> {
        self.reactor.register(session.socket())?;
        session.setup()?;
        Ok(())
    }
}

fn send_reject(socket: &UdpSocket, remote: SocketAddr, code: ErrorCode, message: &str) {
    let packet = Packet::Error { code: code as u16, message: message.to_string() };
    let _ = socket.send_to(&codec::encode(&packet), remote);
}

/// Log the read/write completion or failure audit event matching how a
/// retired session's transfer actually went. A session closed without ever
/// reaching `setup`'s wire side (e.g. negotiation rejected before a
/// `Session` was even built) never reaches here; those rejections are
/// audited at the point of refusal instead (`read_denied`/
/// `write_request_denied`).
fn audit_outcome(session: &Session) {
    let remote = session.remote();
    let filename = session.filename();
    match (session.is_write(), session.outcome()) {
        (false, Some(Outcome::Success)) => AuditLogger::transfer_completed(
            remote,
            filename,
            session.bytes_transferred(),
            session.blocks_transferred(),
            session.duration_ms(),
        ),
        (false, Some(Outcome::Failure(reason))) => {
            AuditLogger::transfer_failed(remote, filename, reason, session.blocks_transferred())
        }
        (true, Some(Outcome::Success)) => AuditLogger::write_completed(
            remote,
            filename,
            session.bytes_transferred(),
            session.blocks_transferred(),
            session.duration_ms(),
            true,
        ),
        (true, Some(Outcome::Failure(reason))) => {
            AuditLogger::write_failed(remote, filename, reason, session.blocks_transferred())
        }
        (_, None) => {}
    }
}
