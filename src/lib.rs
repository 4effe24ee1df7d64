//! A TFTP (RFC 1350) server core: wire codec, per-transfer session state
//! machine (option negotiation, windowing, retransmission, netascii mode
//! conversion), and a single-threaded reactor-driven event loop. Filesystem
//! handlers, configuration, audit logging, and the `tftpd`/`tftp` binaries
//! built on top of the core live alongside it in this crate.

pub mod audit;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod reactor;
pub mod server;
pub mod session;

pub use codec::{ErrorCode, Opcode, Packet, TransferMode};
pub use config::TftpConfig;
pub use error::{Result, TftpError};
pub use server::{ServerConfig, TftpServer};
