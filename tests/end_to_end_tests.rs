//! End-to-end transfer scenarios driven over real UDP sockets.
//!
//! NIST 800-53: SI-11 (Error Handling), AC-3 (Access Enforcement)
//! Implementation: exercises the full decode -> negotiate -> Session ->
//! encode path the way an actual TFTP client would, rather than calling
//! internal APIs directly.

use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use tftpd_rs::codec::{self, Options, Packet};
use tftpd_rs::handler::{disable_write_factory, BasicReadHandler, BasicWriteHandler, ReadHandler, WriteHandler};
use tftpd_rs::server::{ServerConfig, TftpServer};

fn read_only_server(base_dir: PathBuf, window_ceiling: usize) -> TftpServer {
    let read_factory: Arc<tftpd_rs::handler::ReadHandlerFactory> = Arc::new(move |name, mode, _remote| {
        Ok(Box::new(BasicReadHandler::new(base_dir.clone(), name.to_string(), mode, 0)) as Box<dyn ReadHandler>)
    });
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        read_factory,
        write_factory: Arc::new(disable_write_factory),
        window_size_ceiling: window_ceiling,
        default_timeout_secs: 2,
        default_block_size: codec::DEFAULT_BLOCK_SIZE,
        poll_interval: Duration::from_millis(200),
        socket: tftpd_rs::config::SocketConfig::default(),
    };
    TftpServer::bind(config).unwrap()
}

fn read_write_server(base_dir: PathBuf, patterns: Vec<String>) -> TftpServer {
    let read_base = base_dir.clone();
    let read_factory: Arc<tftpd_rs::handler::ReadHandlerFactory> = Arc::new(move |name, mode, _remote| {
        Ok(Box::new(BasicReadHandler::new(read_base.clone(), name.to_string(), mode, 0)) as Box<dyn ReadHandler>)
    });
    let write_base = base_dir.clone();
    let write_factory: Arc<tftpd_rs::handler::WriteHandlerFactory> = Arc::new(move |name, mode, _remote| {
        Ok(Box::new(BasicWriteHandler::new(
            write_base.clone(),
            name.to_string(),
            mode,
            false,
            patterns.clone(),
        )) as Box<dyn WriteHandler>)
    });
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        read_factory,
        write_factory,
        window_size_ceiling: 4,
        default_timeout_secs: 2,
        default_block_size: codec::DEFAULT_BLOCK_SIZE,
        poll_interval: Duration::from_millis(200),
        socket: tftpd_rs::config::SocketConfig::default(),
    };
    TftpServer::bind(config).unwrap()
}

fn client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    socket
}

fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; codec::MAX_PACKET_SIZE];
    let (n, from) = socket.recv_from(&mut buf).expect("expected a reply datagram");
    (codec::decode(&buf[..n]).expect("reply should decode"), from)
}

/// Scenario 1: small file RRQ with no options.
#[test]
fn small_file_round_trip() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("foobar"), b"foobarbaz").unwrap();
    let mut server = read_only_server(dir.path().to_path_buf(), 1);
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client
        .send_to(
            &codec::encode(&Packet::Rrq {
                filename: "foobar".into(),
                mode: "octet".into(),
                options: Options::new(),
            }),
            server_addr,
        )
        .unwrap();

    server.run_once().unwrap();
    let (packet, session_addr) = recv_packet(&client);
    assert_eq!(
        packet,
        Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"foobarbaz"),
        }
    );

    client
        .send_to(&codec::encode(&Packet::Ack { block: 1 }), session_addr)
        .unwrap();
    server.run_once().unwrap();

    server.close();
}

/// Scenario 2: a file spanning several blocks at a small `blksize`, driven
/// to completion one ACK at a time.
#[test]
fn multi_block_transfer_with_small_blksize() {
    let dir = TempDir::new().unwrap();
    let contents: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("blob"), &contents).unwrap();
    let mut server = read_only_server(dir.path().to_path_buf(), 1);
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client
        .send_to(
            &codec::encode(&Packet::Rrq {
                filename: "blob".into(),
                mode: "octet".into(),
                options: vec![("blksize".to_string(), "64".to_string())],
            }),
            server_addr,
        )
        .unwrap();

    // Option negotiation: OACK first, ACK(0) opens the window.
    server.run_once().unwrap();
    let (packet, session_addr) = recv_packet(&client);
    assert_eq!(packet, Packet::Oack { options: vec![("blksize".to_string(), "64".to_string())] });
    client.send_to(&codec::encode(&Packet::Ack { block: 0 }), session_addr).unwrap();

    let mut reassembled = Vec::new();
    let mut expected_block: u16 = 1;
    loop {
        server.run_once().unwrap();
        let (packet, _) = recv_packet(&client);
        match packet {
            Packet::Data { block, payload } => {
                assert_eq!(block, expected_block);
                let done = payload.len() < 64;
                reassembled.extend_from_slice(&payload);
                client
                    .send_to(&codec::encode(&Packet::Ack { block }), session_addr)
                    .unwrap();
                expected_block = expected_block.wrapping_add(1);
                if done {
                    break;
                }
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }
    server.run_once().unwrap();

    assert_eq!(reassembled, contents);
    assert_eq!(expected_block, 1 + (200u16.div_ceil(64)));
    server.close();
}

/// Scenario 3: option negotiation with `blksize` and `tsize`.
#[test]
fn option_negotiation_reports_tsize_and_respects_blksize() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("foobar"), b"foobarbaz").unwrap();
    let mut server = read_only_server(dir.path().to_path_buf(), 1);
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client
        .send_to(
            &codec::encode(&Packet::Rrq {
                filename: "foobar".into(),
                mode: "octet".into(),
                options: vec![
                    ("blksize".to_string(), "1024".to_string()),
                    ("tsize".to_string(), "0".to_string()),
                ],
            }),
            server_addr,
        )
        .unwrap();

    server.run_once().unwrap();
    let (packet, session_addr) = recv_packet(&client);
    assert_eq!(
        packet,
        Packet::Oack {
            options: vec![
                ("blksize".to_string(), "1024".to_string()),
                ("tsize".to_string(), "9".to_string()),
            ]
        }
    );

    client.send_to(&codec::encode(&Packet::Ack { block: 0 }), session_addr).unwrap();
    server.run_once().unwrap();
    let (packet, _) = recv_packet(&client);
    assert_eq!(
        packet,
        Packet::Data {
            block: 1,
            payload: Bytes::from_static(b"foobarbaz"),
        }
    );

    client.send_to(&codec::encode(&Packet::Ack { block: 1 }), session_addr).unwrap();
    server.run_once().unwrap();
    server.close();
}

/// Scenario 4: WRQ against a server with writes disabled.
#[test]
fn disallowed_wrq_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut server = read_only_server(dir.path().to_path_buf(), 1);
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client
        .send_to(
            &codec::encode(&Packet::Wrq {
                filename: "upload.bin".into(),
                mode: "octet".into(),
                options: Options::new(),
            }),
            server_addr,
        )
        .unwrap();

    server.run_once().unwrap();
    let (packet, _) = recv_packet(&client);
    match packet {
        Packet::Error { code, message } => {
            assert_eq!(code, 4);
            assert!(message.contains("not allowed"));
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert!(!dir.path().join("upload.bin").exists());
    server.close();
}

/// Scenario 5: a requested `blksize` outside the RFC 2348 range.
#[test]
fn invalid_blksize_is_rejected() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("foobar"), b"foobarbaz").unwrap();
    let mut server = read_only_server(dir.path().to_path_buf(), 1);
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client
        .send_to(
            &codec::encode(&Packet::Rrq {
                filename: "foobar".into(),
                mode: "octet".into(),
                options: vec![("blksize".to_string(), "4".to_string())],
            }),
            server_addr,
        )
        .unwrap();

    server.run_once().unwrap();
    let (packet, _) = recv_packet(&client);
    match packet {
        Packet::Error { code, message } => {
            assert_eq!(code, 4);
            assert!(message.contains("Invalid requested block size"));
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
    server.close();
}

/// Scenario 6: no ACK ever arrives; the server retransmits and eventually
/// gives up with a NOT_DEFINED error.
#[test]
fn unacknowledged_transfer_retransmits_then_times_out() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("foobar"), b"foobarbaz").unwrap();
    let read_factory: Arc<tftpd_rs::handler::ReadHandlerFactory> = {
        let base = dir.path().to_path_buf();
        Arc::new(move |name, mode, _remote| {
            Ok(Box::new(BasicReadHandler::new(base.clone(), name.to_string(), mode, 0)) as Box<dyn ReadHandler>)
        })
    };
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        read_factory,
        write_factory: Arc::new(disable_write_factory),
        window_size_ceiling: 1,
        default_timeout_secs: 1,
        default_block_size: codec::DEFAULT_BLOCK_SIZE,
        poll_interval: Duration::from_millis(100),
        socket: tftpd_rs::config::SocketConfig::default(),
    };
    let mut server = TftpServer::bind(config).unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    client
        .send_to(
            &codec::encode(&Packet::Rrq {
                filename: "foobar".into(),
                mode: "octet".into(),
                options: Options::new(),
            }),
            server_addr,
        )
        .unwrap();

    server.run_once().unwrap();
    let (first, _) = recv_packet(&client);
    assert_eq!(first, Packet::Data { block: 1, payload: Bytes::from_static(b"foobarbaz") });

    // Never ACK. Pump the loop past several 1-second timeouts without
    // sending anything; the server must retransmit DATA(1) exactly
    // `max_retries` (3) times, then give up with a NOT_DEFINED error.
    client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let mut retransmits = 0u32;
    let mut saw_final_error = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while std::time::Instant::now() < deadline && !saw_final_error {
        server.run_once().unwrap();
        let mut buf = [0u8; codec::MAX_PACKET_SIZE];
        match client.recv(&mut buf) {
            Ok(n) => match codec::decode(&buf[..n]).unwrap() {
                Packet::Data { block: 1, .. } => retransmits += 1,
                Packet::Error { code, message } => {
                    assert_eq!(code, 0);
                    assert!(message.contains("timed out") || message.contains("Session timed out"));
                    saw_final_error = true;
                }
                other => panic!("unexpected packet: {other:?}"),
            },
            Err(_) => {}
        }
    }

    assert_eq!(retransmits, 3, "expected exactly three DATA retransmissions before giving up");
    assert!(saw_final_error, "expected a final NOT_DEFINED timeout error");
    server.close();
}

/// A WRQ accepted end to end: the uploaded bytes land at the final path
/// only after the short terminating block is acknowledged.
#[test]
fn wrq_happy_path_commits_file_on_completion() {
    let dir = TempDir::new().unwrap();
    let mut server = read_write_server(dir.path().to_path_buf(), vec!["*.bin".to_string()]);
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client
        .send_to(
            &codec::encode(&Packet::Wrq {
                filename: "upload.bin".into(),
                mode: "octet".into(),
                options: Options::new(),
            }),
            server_addr,
        )
        .unwrap();

    server.run_once().unwrap();
    let (packet, session_addr) = recv_packet(&client);
    assert_eq!(packet, Packet::Ack { block: 0 });

    client
        .send_to(
            &codec::encode(&Packet::Data {
                block: 1,
                payload: Bytes::from_static(b"uploaded content"),
            }),
            session_addr,
        )
        .unwrap();
    server.run_once().unwrap();
    let (packet, _) = recv_packet(&client);
    assert_eq!(packet, Packet::Ack { block: 1 });
    server.run_once().unwrap();

    assert_eq!(
        std::fs::read(dir.path().join("upload.bin")).unwrap(),
        b"uploaded content"
    );
    server.close();
}

/// An ACK for a block number the server never sent is a protocol violation,
/// not a duplicate to be silently absorbed.
#[test]
fn ack_ahead_of_outstanding_window_aborts_session() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("foobar"), b"foobarbaz").unwrap();
    let mut server = read_only_server(dir.path().to_path_buf(), 1);
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client
        .send_to(
            &codec::encode(&Packet::Rrq {
                filename: "foobar".into(),
                mode: "octet".into(),
                options: Options::new(),
            }),
            server_addr,
        )
        .unwrap();

    server.run_once().unwrap();
    let (packet, session_addr) = recv_packet(&client);
    assert_eq!(
        packet,
        Packet::Data { block: 1, payload: Bytes::from_static(b"foobarbaz") }
    );

    // Block 5 was never sent; the single-block window only ever has block 1
    // outstanding.
    client.send_to(&codec::encode(&Packet::Ack { block: 5 }), session_addr).unwrap();
    server.run_once().unwrap();
    let (packet, _) = recv_packet(&client);
    match packet {
        Packet::Error { code, .. } => assert_eq!(code, 4),
        other => panic!("expected ERROR(ILLEGAL_OP), got {other:?}"),
    }
    server.close();
}

/// Scenario 10: a file long enough at the minimum blksize that the block
/// counter runs past 65535 and wraps to 0; the server must keep treating
/// the wrapped numbering as in-order rather than aborting the transfer.
#[test]
fn block_number_wraps_without_error() {
    let dir = TempDir::new().unwrap();
    // 65536 full 8-byte blocks plus a final short block pushes the block
    // counter past 65535 (block 65536 wraps to 0, block 65537 lands on 1).
    let contents: Vec<u8> = (0..(65536 * 8 + 3)).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("wrap.bin"), &contents).unwrap();
    let mut server = read_only_server(dir.path().to_path_buf(), 1);
    let server_addr = server.local_addr().unwrap();

    let client = client();
    client
        .send_to(
            &codec::encode(&Packet::Rrq {
                filename: "wrap.bin".into(),
                mode: "octet".into(),
                options: vec![("blksize".to_string(), "8".to_string())],
            }),
            server_addr,
        )
        .unwrap();

    // Option negotiation: OACK first, ACK(0) opens the window.
    server.run_once().unwrap();
    let (packet, session_addr) = recv_packet(&client);
    assert_eq!(packet, Packet::Oack { options: vec![("blksize".to_string(), "8".to_string())] });
    client.send_to(&codec::encode(&Packet::Ack { block: 0 }), session_addr).unwrap();

    let mut reassembled = Vec::new();
    let mut expected_block: u16 = 1;
    let mut saw_wrap = false;
    loop {
        server.run_once().unwrap();
        let (packet, _) = recv_packet(&client);
        match packet {
            Packet::Data { block, payload } => {
                assert_eq!(block, expected_block);
                if block == 0 {
                    saw_wrap = true;
                }
                let done = payload.len() < 8;
                reassembled.extend_from_slice(&payload);
                client
                    .send_to(&codec::encode(&Packet::Ack { block }), session_addr)
                    .unwrap();
                expected_block = expected_block.wrapping_add(1);
                if done {
                    break;
                }
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }
    server.run_once().unwrap();

    assert!(saw_wrap, "expected the block counter to wrap through 0");
    assert_eq!(reassembled, contents);
    server.close();
}
