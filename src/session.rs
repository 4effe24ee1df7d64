//! Per-transfer state machine. One [`Session`] owns one UDP socket bound to
//! an ephemeral port (its TID) and drives exactly one RRQ or WRQ to
//! completion or failure; [`crate::server`] owns the map of sessions keyed
//! by that socket's file descriptor.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec::{self, ErrorCode, Options, Packet};
use crate::error::Result;
use crate::handler::{ReadHandler, WriteHandler};

/// What a [`Session`] expects the reactor to report next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    /// The session is finished; the reactor should unregister and drop it.
    Done,
}

enum Direction {
    Read(Box<dyn ReadHandler>),
    Write(Box<dyn WriteHandler>),
}

/// How a finished session's transfer went, for the audit trail.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Failure(String),
}

/// One RRQ or WRQ transfer in progress.
pub struct Session {
    socket: UdpSocket,
    remote: SocketAddr,
    direction: Direction,
    filename: String,
    block_size: usize,
    window_size: usize,
    timeout: Duration,
    oack: Option<Options>,

    /// Read side: next block number to place at the front of the window.
    next_block: u16,
    /// Read side: DATA packets sent but not yet ACKed, oldest first.
    in_flight: VecDeque<(u16, bytes::Bytes)>,
    /// Read side: true once a short (final) DATA block has been sent.
    final_block_sent: bool,

    /// Write side: next block number we expect to receive.
    expected_block: u16,
    /// Write side: true once the final short DATA block has been written.
    write_completed: bool,

    started_at: Instant,
    bytes_transferred: u64,
    blocks_transferred: u16,
    outcome: Option<Outcome>,

    last_activity: Instant,
    retries: u32,
    max_retries: u32,
    done: bool,
}

const MAX_RETRIES: u32 = 3;

impl Session {
    /// Build a session for an RRQ, after option negotiation has already
    /// picked `block_size`/`window_size`/`timeout` and resolved `oack`
    /// (`None` means no options were requested, so no OACK is sent and the
    /// transfer starts directly with DATA block 1).
    pub fn new_read(
        socket: UdpSocket,
        remote: SocketAddr,
        filename: String,
        handler: Box<dyn ReadHandler>,
        block_size: usize,
        window_size: usize,
        timeout: Duration,
        oack: Option<Options>,
    ) -> Self {
        Self {
            socket,
            remote,
            direction: Direction::Read(handler),
            filename,
            block_size,
            window_size,
            timeout,
            oack,
            next_block: 1,
            in_flight: VecDeque::new(),
            final_block_sent: false,
            expected_block: 1,
            write_completed: false,
            started_at: Instant::now(),
            bytes_transferred: 0,
            blocks_transferred: 0,
            outcome: None,
            last_activity: Instant::now(),
            retries: 0,
            max_retries: MAX_RETRIES,
            done: false,
        }
    }

    /// Build a session for a WRQ.
    pub fn new_write(
        socket: UdpSocket,
        remote: SocketAddr,
        filename: String,
        handler: Box<dyn WriteHandler>,
        block_size: usize,
        window_size: usize,
        timeout: Duration,
        oack: Option<Options>,
    ) -> Self {
        Self {
            socket,
            remote,
            direction: Direction::Write(handler),
            filename,
            block_size,
            window_size,
            timeout,
            oack,
            next_block: 1,
            in_flight: VecDeque::new(),
            final_block_sent: false,
            expected_block: 1,
            write_completed: false,
            started_at: Instant::now(),
            bytes_transferred: 0,
            blocks_transferred: 0,
            outcome: None,
            last_activity: Instant::now(),
            retries: 0,
            max_retries: MAX_RETRIES,
            done: false,
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn is_write(&self) -> bool {
        matches!(self.direction, Direction::Write(_))
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn blocks_transferred(&self) -> u16 {
        self.blocks_transferred
    }

    pub fn duration_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// `None` while still in progress; `Some` once `done` is set, describing
    /// whether the transfer finished cleanly or was aborted.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn deadline(&self) -> Instant {
        self.last_activity + self.timeout
    }

    /// First thing the session does once created: send the OACK (if any
    /// options were negotiated) or, for a read with no options, the first
    /// window of DATA; for a write with no options, nothing (we wait for
    /// the first DATA block). The handler is already open by this point
    /// (the server opens it ahead of option negotiation so `tsize` can see
    /// the handler's length); this only drives the wire side of startup.
    pub fn setup(&mut self) -> Result<()> {
        if let Some(options) = self.oack.clone() {
            if !options.is_empty() {
                self.send(&Packet::Oack { options })?;
                self.last_activity = Instant::now();
                return Ok(());
            }
        }

        match &self.direction {
            Direction::Read(_) => self.send_read_window()?,
            Direction::Write(_) => self.send(&Packet::Ack { block: 0 })?,
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    fn send(&self, packet: &Packet) -> Result<()> {
        let bytes = codec::encode(packet);
        self.socket.send_to(&bytes, self.remote)?;
        Ok(())
    }

    fn send_error(&self, code: ErrorCode, message: &str) {
        let _ = self.send(&Packet::Error {
            code: code as u16,
            message: message.to_string(),
        });
    }

    /// Fill the read-side window up to `window_size` outstanding DATA
    /// blocks, reading fresh blocks from the handler as needed. A
    /// `HandlerError` here is a terminal, handled outcome (wire ERROR sent,
    /// session finished) rather than something the caller needs to convert;
    /// only a socket-send failure propagates further.
    fn send_read_window(&mut self) -> Result<()> {
        let Direction::Read(handler) = &mut self.direction else {
            return Ok(());
        };
        if self.final_block_sent {
            return Ok(());
        }
        while self.in_flight.len() < self.window_size && !self.final_block_sent {
            let block = self.next_block;
            let start = (block.wrapping_sub(1) as u64) * self.block_size as u64;
            let end = start + self.block_size as u64;
            let payload = match handler.read(start, end) {
                Ok(p) => p,
                Err(e) => {
                    let message = e.message.clone();
                    self.send_error(e.code, &e.message);
                    self.fail(message);
                    return Ok(());
                }
            };
            let is_final = payload.len() < self.block_size;
            let bytes = bytes::Bytes::from(payload);
            self.send(&Packet::Data {
                block,
                payload: bytes.clone(),
            })?;
            self.bytes_transferred += bytes.len() as u64;
            self.blocks_transferred += 1;
            self.in_flight.push_back((block, bytes));
            self.next_block = block.wrapping_add(1);
            if is_final {
                self.final_block_sent = true;
            }
        }
        Ok(())
    }

    /// Called by the reactor when `self.socket` is readable.
    pub fn step(&mut self) -> Result<Interest> {
        let mut buf = [0u8; codec::MAX_PACKET_SIZE];
        let (n, from) = match self.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Interest::Readable),
            Err(e) => return Err(e.into()),
        };

        // RFC 1350: datagrams from an address other than the negotiated
        // peer are not this transfer's traffic and are silently ignored.
        if from != self.remote {
            debug!(%from, expected = %self.remote, "ignoring datagram from unexpected TID");
            return Ok(Interest::Readable);
        }

        self.last_activity = Instant::now();
        self.retries = 0;

        let packet = match codec::decode(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed packet, aborting transfer");
                self.send_error(ErrorCode::IllegalOperation, "malformed packet");
                self.fail(format!("malformed packet: {e}"));
                return Ok(Interest::Done);
            }
        };

        match packet {
            Packet::Ack { block } => self.on_ack(block)?,
            Packet::Data { block, payload } => self.on_data(block, payload)?,
            Packet::Error { code, message } => {
                warn!(code, %message, "peer aborted transfer");
                self.fail(format!("peer aborted: {message}"));
            }
            other => {
                warn!(?other, "unexpected packet for session direction");
                self.send_error(ErrorCode::IllegalOperation, "unexpected packet");
                self.fail("unexpected packet for session direction");
            }
        }

        if self.done {
            Ok(Interest::Done)
        } else {
            Ok(Interest::Readable)
        }
    }

    /// An explicit window check replaces a bare "does the ack number equal
    /// what I last sent" comparison: that comparison is tautologically true
    /// the instant a single in-flight block exists, so it can't detect a
    /// stale or duplicate ACK inside a window larger than one block.
    fn on_ack(&mut self, block: u16) -> Result<()> {
        if !matches!(self.direction, Direction::Read(_)) {
            self.send_error(ErrorCode::IllegalOperation, "unexpected ACK during write");
            self.fail("unexpected ACK during write");
            return Ok(());
        }

        // Nothing sent yet means this is the ACK(0) that answers our OACK
        // (or a no-options transfer's initial kick, though the server
        // starts those windows from `setup` instead); either way it opens
        // the first window rather than acknowledging an in-flight block.
        if block == 0 && self.in_flight.is_empty() && self.next_block == 1 && !self.final_block_sent {
            return self.send_read_window();
        }

        let in_window = self.in_flight.iter().any(|(b, _)| *b == block);
        if !in_window {
            // A block number ahead of everything outstanding is a genuine
            // protocol violation (the peer is ACKing data we never sent);
            // a block number behind the window is a stale duplicate of an
            // already-acked block and is ignored, relying on timeout to
            // drive any further retransmission.
            if let Some(&(front, _)) = self.in_flight.front() {
                let pos = block.wrapping_sub(front);
                let window_len = self.in_flight.len() as u16;
                if pos >= window_len && pos < 0x8000 {
                    self.send_error(ErrorCode::IllegalOperation, "ACK beyond outstanding window");
                    self.fail("ACK beyond outstanding window");
                    return Ok(());
                }
            }
            debug!(block, "stale or duplicate ACK, ignoring");
            return Ok(());
        }

        // Drop every in-flight block up to and including the ACKed one.
        while let Some((b, _)) = self.in_flight.front() {
            let b = *b;
            self.in_flight.pop_front();
            if b == block {
                break;
            }
        }

        if self.in_flight.is_empty() && self.final_block_sent {
            self.succeed();
            return Ok(());
        }

        self.send_read_window()
    }

    fn on_data(&mut self, block: u16, payload: bytes::Bytes) -> Result<()> {
        let Direction::Write(handler) = &mut self.direction else {
            self.send_error(ErrorCode::IllegalOperation, "unexpected DATA during read");
            self.fail("unexpected DATA during read");
            return Ok(());
        };

        if block != self.expected_block {
            // Duplicate retransmission of an already-written block: ACK it
            // again without re-writing so the peer can make progress.
            let _ = self.socket.send_to(
                &codec::encode(&Packet::Ack {
                    block: self.expected_block.wrapping_sub(1),
                }),
                self.remote,
            );
            return Ok(());
        }

        let is_final = payload.len() < self.block_size;
        if let Err(e) = handler.write(&payload) {
            let message = e.message.clone();
            self.send_error(e.code, &e.message);
            self.fail(message);
            return Ok(());
        }
        self.bytes_transferred += payload.len() as u64;
        self.blocks_transferred += 1;
        self.send(&Packet::Ack { block })?;
        self.expected_block = block.wrapping_add(1);

        if is_final {
            self.write_completed = true;
            self.succeed();
        }
        Ok(())
    }

    /// Called by the reactor when `deadline()` has passed with no
    /// response. Retransmits the last unacknowledged send, or aborts the
    /// transfer once `max_retries` is exceeded.
    pub fn on_timeout(&mut self) -> Result<Interest> {
        if self.done {
            return Ok(Interest::Done);
        }
        self.retries += 1;
        if self.retries > self.max_retries {
            warn!(retries = self.retries, "giving up after too many retransmits");
            self.send_error(ErrorCode::NotDefined, "timed out waiting for peer");
            self.fail("Session timed out.");
            return Ok(Interest::Done);
        }

        match &self.direction {
            Direction::Read(_) => {
                for (block, payload) in self.in_flight.clone() {
                    self.send(&Packet::Data { block, payload })?;
                }
                if self.in_flight.is_empty() {
                    if let Some(options) = self.oack.clone() {
                        self.send(&Packet::Oack { options })?;
                    }
                }
            }
            Direction::Write(_) => {
                let ack_block = self.expected_block.wrapping_sub(1);
                self.send(&Packet::Ack { block: ack_block })?;
            }
        }
        self.last_activity = Instant::now();
        Ok(Interest::Readable)
    }

    /// Record a successful completion and close out the session.
    fn succeed(&mut self) {
        self.outcome.get_or_insert(Outcome::Success);
        self.finish();
    }

    /// Record a failure reason and close out the session. A no-op on the
    /// outcome if one was already recorded (the first failure wins).
    fn fail(&mut self, message: impl Into<String>) {
        if self.outcome.is_none() {
            self.outcome = Some(Outcome::Failure(message.into()));
        }
        self.finish();
    }

    fn finish(&mut self) {
        match &mut self.direction {
            Direction::Read(h) => h.close(),
            Direction::Write(h) => {
                // Only commit a staged write to its final path when we saw
                // the short terminating block; an aborted transfer leaves
                // no partial file behind.
                if self.write_completed {
                    h.mark_completed();
                }
                h.close();
            }
        }
        self.done = true;
    }

    /// Force-close a session that has not already reached `done` on its
    /// own: either the whole server is shutting down, or the caller is
    /// retiring a session after an I/O error it can't otherwise recover
    /// from. A no-op once `done` is already set.
    pub fn close(&mut self) {
        if !self.done {
            self.fail("server shutting down");
        }
    }
}

/// Build the RRQ/WRQ-mode-independent per-transfer timeout/window/block
/// size from the options the peer requested, clamping to server-configured
/// ceilings. Returns the accepted subset in encounter order, suitable for
/// an OACK, along with the effective values to actually use.
pub struct Negotiated {
    pub block_size: usize,
    pub window_size: usize,
    pub timeout: Duration,
    pub accepted: Options,
}

/// A requested option's value was outside its protocol-defined range.
/// Carries the wire error message the peer should see.
pub struct NegotiationError(pub String);

pub fn negotiate(
    requested: &Options,
    file_size: Option<u64>,
    server_window_ceiling: usize,
    default_timeout_secs: u64,
    default_block_size: usize,
) -> std::result::Result<Negotiated, NegotiationError> {
    let mut block_size = default_block_size;
    let mut window_size = 1usize;
    let mut timeout_secs = default_timeout_secs;
    let mut accepted = Options::new();

    for (name, value) in requested {
        match name.to_ascii_lowercase().as_str() {
            "blksize" => {
                let v = value.parse::<usize>().ok().filter(|v| {
                    (codec::MIN_BLOCK_SIZE..=codec::MAX_BLOCK_SIZE).contains(v)
                });
                match v {
                    Some(v) => {
                        block_size = v;
                        accepted.push((name.clone(), v.to_string()));
                    }
                    None => {
                        return Err(NegotiationError(format!(
                            "Invalid requested block size: {value}"
                        )))
                    }
                }
            }
            "timeout" => {
                let v = value
                    .parse::<u64>()
                    .ok()
                    .filter(|v| (codec::MIN_TIMEOUT_SECS..=codec::MAX_TIMEOUT_SECS).contains(v));
                match v {
                    Some(v) => {
                        timeout_secs = v;
                        accepted.push((name.clone(), v.to_string()));
                    }
                    None => {
                        return Err(NegotiationError(format!(
                            "Invalid requested timeout: {value}"
                        )))
                    }
                }
            }
            "tsize" => {
                if let Some(size) = file_size {
                    accepted.push((name.clone(), size.to_string()));
                }
            }
            "windowsize" => {
                let v = value.parse::<usize>().ok().filter(|v| {
                    (codec::MIN_WINDOW_SIZE..=codec::MAX_WINDOW_SIZE).contains(v)
                });
                match v {
                    Some(v) => {
                        // The server's own ceiling clamps the accepted value
                        // rather than rejecting the request outright.
                        window_size = v.min(server_window_ceiling).max(1);
                        accepted.push((name.clone(), window_size.to_string()));
                    }
                    None => {
                        return Err(NegotiationError(format!(
                            "Invalid requested window size: {value}"
                        )))
                    }
                }
            }
            _ => {
                // Unknown options are silently ignored per RFC 2347.
            }
        }
    }

    Ok(Negotiated {
        block_size,
        window_size,
        timeout: Duration::from_secs(timeout_secs),
        accepted,
    })
}
