//! `tftp-client`: a minimal synchronous TFTP client exercising the same
//! wire codec as the server (`tftpd_rs::codec`), for manual interop testing
//! against `tftpd` or any other RFC 1350/2347/2348/2349/7440 server.

use std::fs;
use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, info, warn};

use tftpd_rs::codec::{self, ErrorCode, Options, Packet, TransferMode};
use tftpd_rs::error::{Result, TftpError};

#[derive(Parser, Debug)]
#[command(name = "tftp-client", about = "A minimal TFTP (RFC 1350) client")]
struct Cli {
    /// TFTP server address, e.g. 127.0.0.1:69
    #[arg(short, long)]
    server: SocketAddr,

    /// Download this remote filename
    #[arg(short, long, conflicts_with = "put")]
    get: Option<String>,

    /// Upload to this remote filename
    #[arg(short, long, conflicts_with = "get")]
    put: Option<String>,

    /// Local file path (destination for --get, source for --put)
    #[arg(short, long)]
    file: PathBuf,

    /// Transfer mode
    #[arg(short, long, default_value = "octet")]
    mode: String,

    /// Requested blksize (RFC 2348)
    #[arg(short, long, default_value_t = codec::DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Requested timeout in seconds (RFC 2349)
    #[arg(short, long, default_value_t = codec::DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Requested windowsize (RFC 7440)
    #[arg(short, long, default_value_t = 1)]
    windowsize: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

const MAX_RETRIES: u32 = 5;

struct Negotiated {
    block_size: usize,
    window_size: usize,
    timeout: Duration,
}

fn default_negotiated(cli: &Cli) -> Negotiated {
    Negotiated {
        block_size: cli.block_size,
        window_size: cli.windowsize,
        timeout: Duration::from_secs(cli.timeout),
    }
}

/// Apply an OACK response to our requested defaults; any option the server
/// didn't echo keeps its pre-negotiation default (RFC 2347 semantics).
fn apply_oack(base: &Negotiated, options: &Options) -> Negotiated {
    let mut n = Negotiated {
        block_size: base.block_size,
        window_size: base.window_size,
        timeout: base.timeout,
    };
    for (key, value) in options {
        match key.as_str() {
            "blksize" => {
                if let Ok(v) = value.parse::<usize>() {
                    n.block_size = v;
                }
            }
            "timeout" => {
                if let Ok(v) = value.parse::<u64>() {
                    n.timeout = Duration::from_secs(v);
                }
            }
            "windowsize" => {
                if let Ok(v) = value.parse::<usize>() {
                    n.window_size = v;
                }
            }
            _ => {}
        }
    }
    n
}

fn recv_with_timeout(socket: &UdpSocket, buf: &mut [u8], deadline: Instant) -> Result<Option<(usize, SocketAddr)>> {
    let now = Instant::now();
    if deadline <= now {
        return Ok(None);
    }
    socket.set_read_timeout(Some(deadline - now))?;
    match socket.recv_from(buf) {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn request_options(n: &Negotiated, want_tsize: Option<u64>) -> Options {
    let mut options = Vec::new();
    if n.block_size != codec::DEFAULT_BLOCK_SIZE {
        options.push(("blksize".to_string(), n.block_size.to_string()));
    }
    if n.timeout.as_secs() != codec::DEFAULT_TIMEOUT_SECS {
        options.push(("timeout".to_string(), n.timeout.as_secs().to_string()));
    }
    if n.window_size != 1 {
        options.push(("windowsize".to_string(), n.window_size.to_string()));
    }
    if let Some(size) = want_tsize {
        options.push(("tsize".to_string(), size.to_string()));
    }
    options
}

fn get(server: SocketAddr, remote_file: &str, local_file: &PathBuf, mode: TransferMode, cli: &Cli) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let requested = default_negotiated(cli);
    let options = request_options(&requested, None);

    let rrq = Packet::Rrq {
        filename: remote_file.to_string(),
        mode: mode.as_str().to_string(),
        options: options.clone(),
    };
    socket.send_to(&codec::encode(&rrq), server)?;

    let mut negotiated = requested;
    let mut peer: Option<SocketAddr> = None;
    let mut out = Vec::new();
    let mut expected_block: u16 = 1;
    let mut retries = 0u32;
    let mut last_send_deadline = Instant::now() + negotiated.timeout;

    let mut buf = vec![0u8; codec::MAX_PACKET_SIZE];
    loop {
        let received = recv_with_timeout(&socket, &mut buf, last_send_deadline)?;
        let Some((n, from)) = received else {
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(TftpError::Tftp("timed out waiting for server".into()));
            }
            warn!(retries, "no response, retransmitting request");
            socket.send_to(&codec::encode(&rrq), server)?;
            last_send_deadline = Instant::now() + negotiated.timeout;
            continue;
        };
        retries = 0;

        if let Some(p) = peer {
            if p != from {
                debug!(%from, expected = %p, "ignoring datagram from unexpected peer");
                continue;
            }
        }

        match codec::decode(&buf[..n]) {
            Ok(Packet::Oack { options: acked }) => {
                peer = Some(from);
                negotiated = apply_oack(&negotiated, &acked);
                let ack = Packet::Ack { block: 0 };
                socket.send_to(&codec::encode(&ack), from)?;
                last_send_deadline = Instant::now() + negotiated.timeout;
            }
            Ok(Packet::Data { block, payload }) if block == expected_block => {
                peer = Some(from);
                out.extend_from_slice(&payload);
                let is_final = payload.len() < negotiated.block_size;
                let ack = Packet::Ack { block };
                socket.send_to(&codec::encode(&ack), from)?;
                if is_final {
                    break;
                }
                expected_block = expected_block.wrapping_add(1);
                last_send_deadline = Instant::now() + negotiated.timeout;
            }
            Ok(Packet::Data { block, .. }) => {
                debug!(block, expected_block, "duplicate or out-of-order block, re-acking last");
                let ack = Packet::Ack { block: expected_block.wrapping_sub(1) };
                socket.send_to(&codec::encode(&ack), from)?;
            }
            Ok(Packet::Error { code, message }) => {
                return Err(TftpError::Tftp(format!("server error {code}: {message}")));
            }
            Ok(other) => {
                debug!(?other, "ignoring unexpected packet");
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed datagram");
            }
        }
    }

    let final_bytes = match mode {
        TransferMode::Netascii => codec::from_netascii(&out),
        _ => out,
    };
    fs::write(local_file, &final_bytes)?;
    info!(bytes = final_bytes.len(), "download complete");
    Ok(())
}

fn put(server: SocketAddr, remote_file: &str, local_file: &PathBuf, mode: TransferMode, cli: &Cli) -> Result<()> {
    let raw = fs::read(local_file)?;
    let data = match mode {
        TransferMode::Netascii => codec::to_netascii(&raw),
        _ => raw,
    };

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let requested = default_negotiated(cli);
    let options = request_options(&requested, Some(data.len() as u64));

    let wrq = Packet::Wrq {
        filename: remote_file.to_string(),
        mode: mode.as_str().to_string(),
        options: options.clone(),
    };
    socket.send_to(&codec::encode(&wrq), server)?;

    let mut negotiated = requested;
    let mut peer: Option<SocketAddr> = None;
    let mut retries = 0u32;
    let mut deadline = Instant::now() + negotiated.timeout;
    let have_options = !options.is_empty();

    // Wait for the go-ahead: an ACK(0), or an OACK if we sent options.
    let mut buf = vec![0u8; codec::MAX_PACKET_SIZE];
    loop {
        let received = recv_with_timeout(&socket, &mut buf, deadline)?;
        let Some((n, from)) = received else {
            retries += 1;
            if retries > MAX_RETRIES {
                return Err(TftpError::Tftp("timed out waiting for server".into()));
            }
            socket.send_to(&codec::encode(&wrq), server)?;
            deadline = Instant::now() + negotiated.timeout;
            continue;
        };
        match codec::decode(&buf[..n]) {
            Ok(Packet::Oack { options: acked }) if have_options => {
                peer = Some(from);
                negotiated = apply_oack(&negotiated, &acked);
                break;
            }
            Ok(Packet::Ack { block: 0 }) => {
                peer = Some(from);
                break;
            }
            Ok(Packet::Error { code, message }) => {
                return Err(TftpError::Tftp(format!("server error {code}: {message}")));
            }
            _ => continue,
        }
    }
    let peer = peer.expect("loop only exits after setting peer");

    let mut block: u16 = 1;
    for chunk in data.chunks(negotiated.block_size).collect::<Vec<_>>().into_iter() {
        send_data_block(&socket, peer, block, chunk, negotiated.timeout)?;
        block = block.wrapping_add(1);
    }
    if data.len() % negotiated.block_size == 0 {
        // Exact multiple of blksize still needs a short final block.
        send_data_block(&socket, peer, block, &[], negotiated.timeout)?;
    }

    info!(bytes = data.len(), "upload complete");
    Ok(())
}

fn send_data_block(socket: &UdpSocket, peer: SocketAddr, block: u16, payload: &[u8], timeout: Duration) -> Result<()> {
    let packet = Packet::Data { block, payload: payload.to_vec().into() };
    let mut buf = vec![0u8; codec::MAX_PACKET_SIZE];
    let mut retries = 0u32;
    loop {
        socket.send_to(&codec::encode(&packet), peer)?;
        let deadline = Instant::now() + timeout;
        match recv_with_timeout(socket, &mut buf, deadline)? {
            Some((n, from)) if from == peer => match codec::decode(&buf[..n]) {
                Ok(Packet::Ack { block: acked }) if acked == block => return Ok(()),
                Ok(Packet::Error { code, message }) => {
                    return Err(TftpError::Tftp(format!("server error {code}: {message}")));
                }
                _ => continue,
            },
            Some(_) => continue,
            None => {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(TftpError::Tftp("timed out waiting for ACK".into()));
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    let mode = TransferMode::parse(&cli.mode)
        .map_err(|_| TftpError::Tftp(format!("unknown transfer mode: {}", cli.mode)))?;

    match (&cli.get, &cli.put) {
        (Some(remote), None) => get(cli.server, remote, &cli.file, mode, &cli),
        (None, Some(remote)) => put(cli.server, remote, &cli.file, mode, &cli),
        _ => Err(TftpError::Handler(tftpd_rs::error::HandlerError::new(
            ErrorCode::IllegalOperation,
            "specify exactly one of --get or --put",
        ))),
    }
}
