//! Single-threaded readiness-event multiplexer fronting [`crate::server`].
//!
//! This mirrors a classic reactor: one `poll()` call blocks until any
//! registered socket is readable or a deadline elapses, and the caller
//! drives each ready source itself. There is no worker pool and no async
//! runtime behind it; everything here runs on the thread that calls
//! `poll`.

use std::io;
use std::net::UdpSocket;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

/// A readiness multiplexer over a dynamic set of UDP sockets, identified
/// by the raw file descriptor the caller registered.
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
        })
    }

    /// Register `socket` for readability, keyed by its own fd so the caller
    /// can look the session back up from a returned [`RawFd`].
    pub fn register(&mut self, socket: &UdpSocket) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    pub fn unregister(&mut self, socket: &UdpSocket) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Reassert interest for an already-registered socket. The server only
    /// ever runs sessions in READ mode, so this always reregisters for
    /// readability; it exists so a caller that only knows it wants "the
    /// modes this fd cares about" has an operation to call instead of an
    /// unregister/register pair.
    pub fn modify(&mut self, socket: &UdpSocket) -> io::Result<()> {
        let fd = socket.as_raw_fd();
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    /// Release the reactor's resources. `Poll` already does this on drop;
    /// this gives callers an explicit teardown step to call at shutdown
    /// rather than relying on drop order.
    pub fn close(&mut self) {}

    /// Block until at least one registered socket is readable or `timeout`
    /// elapses, then return the fds that are ready. An empty result with
    /// no error means the timeout fired.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<RawFd>> {
        let started = Instant::now();
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if let Some(t) = timeout {
                        let elapsed = started.elapsed();
                        if elapsed >= t {
                            return Ok(Vec::new());
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self
            .events
            .iter()
            .map(|event| event.token().0 as RawFd)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_observe_readable_socket() {
        let mut reactor = Reactor::new().unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_nonblocking(true).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        reactor.register(&receiver).unwrap();

        sender.send_to(b"hi", receiver.local_addr().unwrap()).unwrap();

        let ready = reactor.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready, vec![receiver.as_raw_fd() as RawFd]);
    }

    #[test]
    fn poll_times_out_with_nothing_ready() {
        let mut reactor = Reactor::new().unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_nonblocking(true).unwrap();
        reactor.register(&receiver).unwrap();

        let ready = reactor.poll(Some(Duration::from_millis(50))).unwrap();
        assert!(ready.is_empty());
    }
}
