use std::io;
use std::net;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Everything that can go wrong below the socket API. Wire-level failures
/// (`Malformed`, `AuthFailed`, `Replay`, `WrongState`) cause the offending
/// packet to be dropped and counted; the rest surface through `Result`
/// returns at the API boundary. Nothing here panics or aborts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolError {
    /// The destination buffer cannot hold the encoding.
    BufferTooSmall,
    /// A size, prefix, version or length invariant was violated.
    Malformed,
    /// AEAD tag verification failed.
    AuthFailed,
    /// Sequence rejected by the replay window.
    Replay,
    /// Packet kind not accepted in the peer's current state.
    WrongState,
    /// The connect token does not parse or carries no usable address.
    TokenInvalid,
    /// The connect token's expiry lies in the past.
    TokenExpired,
    /// A pool acquisition failed; the in-progress operation is dropped.
    OutOfMemory,
    /// The operation's sender/receiver was canceled (socket stopping).
    Canceled,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for ProtocolError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        ProtocolError::Io(io_error.kind())
    }
}

impl From<net::AddrParseError> for ProtocolError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        ProtocolError::AddrParse
    }
}
