//! Driftnet turns a stream of UDP datagrams into authenticated, encrypted
//! connection sessions between a client and a server.
//!
//! The protocol layer owns the token handshake, the per-peer replay window,
//! the AEAD envelope around every packet, the timeout/retry emitters and the
//! peer lifecycle on both ends. Datagram delivery is pluggable through
//! [`transport::Transport`], and everything above raw payload bytes
//! (reliability, ordering, channels) belongs to the layer on top.
//!
//! Sockets are poll-driven: the application calls `update(now)` from its I/O
//! loop and drains connectivity and payload events afterwards. CPU-heavy
//! token crypto runs on a bounded worker pool; completions are folded back
//! into `update` on the calling thread.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod crypto;
pub mod emitter;
pub mod error;
pub mod job;
pub mod packet;
pub mod peer;
pub mod receiver;
pub mod replay;
pub mod sender;
pub mod server;
pub mod socket;
pub mod token;
pub mod transport;

pub use crate::client::{Client, ClientEvent};
pub use crate::context::Context;
pub use crate::error::{ProtocolError, ProtocolResult};
pub use crate::server::{Server, ServerEvent};
pub use crate::socket::ConnectResult;

/// Wire version tag. Bound into every AEAD operation, so peers speaking a
/// different revision fail authentication instead of misparsing.
pub const VERSION_INFO: [u8; 12] = *b"POMELO 1.03\0";
pub const VERSION_INFO_BYTES: usize = 12;

pub const KEY_BYTES: usize = brine::crypto::KEY_SIZE;
pub const MAC_BYTES: usize = brine::crypto::MAC_SIZE;

pub const CONNECT_TOKEN_BYTES: usize = 2048;
pub const CONNECT_TOKEN_PRIVATE_BYTES: usize = 1024;
pub const CONNECT_TOKEN_NONCE_BYTES: usize = brine::crypto::XNONCE_SIZE;
pub const CHALLENGE_TOKEN_BYTES: usize = 300;
pub const USER_DATA_BYTES: usize = 256;
pub const MAX_SERVER_ADDRESSES: usize = 16;

/// The maximum plaintext size of one payload packet body.
pub const PAYLOAD_BODY_CAPACITY: usize = 1200;

/// Prefix byte plus up to eight sequence bytes.
pub const PACKET_HEADER_CAPACITY: usize = 9;

/// Server keep-alive broadcast and client handshake retry rate.
pub const KEEP_ALIVE_FREQUENCY_HZ: u64 = 10;
pub const HANDSHAKE_FREQUENCY_HZ: u64 = 10;
pub const DISCONNECT_FREQUENCY_HZ: u64 = 10;

/// How many redundant DISCONNECT packets are emitted before a peer is
/// released.
pub const DISCONNECT_REDUNDANT_LIMIT: u32 = 10;

/// Anonymous peers older than this are reclaimable; bounds memory under
/// handshake flooding.
pub const ANONYMOUS_PEER_EXPIRY_SECS: u64 = 30;
pub const ANONYMOUS_EXPIRY_SCAN_FREQUENCY_HZ: u64 = 1;

pub type ClientId = i64;
