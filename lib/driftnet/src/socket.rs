use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::{self, Header};

/// Lifecycle of a socket. `Stopping` defers the actual teardown to the
/// sequencer so it never happens in the middle of packet handling.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SocketState {
    Stopped,
    Running,
    Stopping,
}

/// Terminal outcome of a client connection attempt.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectResult {
    Success,
    Denied,
    TimedOut,
}

/// Byte counters kept per socket for observability.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    pub valid_recv_bytes: u64,
    pub invalid_recv_bytes: u64,
}

/// First-stage validation of an incoming datagram, shared by both socket
/// modes: minimum size, header decode, and the kind-specific body-length
/// check, all before any crypto work. Returns the header and the body
/// offset.
pub fn decode_incoming(frame: &[u8], encrypted: bool) -> ProtocolResult<(Header, usize)> {
    let min_bytes = if encrypted {
        packet::ENCRYPTED_MIN_BYTES
    } else {
        packet::UNENCRYPTED_MIN_BYTES
    };

    if frame.len() < min_bytes {
        return Err(ProtocolError::Malformed);
    }

    let (header, header_len) = Header::decode(frame)?;

    if !packet::validate_body_length(header.kind, frame.len() - header_len, encrypted) {
        return Err(ProtocolError::Malformed);
    }

    Ok((header, header_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{encode_prefix, PacketKind};

    #[test]
    fn test_rejects_undersized_datagrams() {
        assert_eq!(
            decode_incoming(&[0u8; 17], true).unwrap_err(),
            ProtocolError::Malformed
        );
        assert_eq!(
            decode_incoming(&[0u8; 1], false).unwrap_err(),
            ProtocolError::Malformed
        );
    }

    #[test]
    fn test_rejects_bad_kind_nibble() {
        let mut frame = [0u8; 32];
        frame[0] = 0x71; // kind 7 does not exist
        assert_eq!(
            decode_incoming(&frame, true).unwrap_err(),
            ProtocolError::Malformed
        );
    }

    #[test]
    fn test_rejects_wrong_body_length() {
        let mut frame = [0u8; 64];
        frame[0] = encode_prefix(PacketKind::KeepAlive, 1);
        // 62 bytes of body for an 8 + 16 byte keep-alive
        assert_eq!(
            decode_incoming(&frame, true).unwrap_err(),
            ProtocolError::Malformed
        );
    }

    #[test]
    fn test_accepts_valid_keep_alive_shape() {
        let mut frame = [0u8; 2 + 8 + 16];
        frame[0] = encode_prefix(PacketKind::KeepAlive, 1);
        frame[1] = 42;

        let (header, header_len) = decode_incoming(&frame, true).unwrap();
        assert_eq!(header.kind, PacketKind::KeepAlive);
        assert_eq!(header.sequence, 42);
        assert_eq!(header_len, 2);
    }
}
