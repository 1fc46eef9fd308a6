use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::Header;
use crate::{MAC_BYTES, VERSION_INFO, VERSION_INFO_BYTES};
use brine::crypto::{self, Key};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Cursor, Write};

/// Associated data covers the version tag, the protocol id and the prefix
/// byte, so tampering with the packet kind or sequence length fails
/// authentication.
pub const ASSOCIATED_DATA_BYTES: usize = VERSION_INFO_BYTES + 8 + 1;

/// Per-peer key material, shared between the peer and every in-flight
/// sender/receiver that references it. Immutable once installed; installing
/// fresh keys replaces the whole context.
#[derive(Clone)]
pub struct CryptoContext {
    pub protocol_id: u64,
    pub encrypt_key: Key,
    pub decrypt_key: Key,
    /// Shared token key, present on the server's listen context only.
    pub private_key: Key,
    /// Per-run challenge key, server only.
    pub challenge_key: Key,
}

impl CryptoContext {
    /// A context with no usable keys. Peers hold this until the handshake
    /// installs real material.
    pub fn empty() -> CryptoContext {
        CryptoContext {
            protocol_id: 0,
            encrypt_key: [0u8; crypto::KEY_SIZE],
            decrypt_key: [0u8; crypto::KEY_SIZE],
            private_key: [0u8; crypto::KEY_SIZE],
            challenge_key: [0u8; crypto::KEY_SIZE],
        }
    }

    pub fn associated_data(&self, prefix: u8) -> [u8; ASSOCIATED_DATA_BYTES] {
        let mut ad = [0u8; ASSOCIATED_DATA_BYTES];
        let mut stream = Cursor::new(&mut ad[..]);
        stream.write_all(&VERSION_INFO).expect("Associated data write");
        stream
            .write_u64::<LittleEndian>(self.protocol_id)
            .expect("Associated data write");
        stream.write_u8(prefix).expect("Associated data write");
        ad
    }

    /// Seals a packet body in place with the encrypt key, the header-derived
    /// nonce and associated data. `body[..plain_len]` holds the plaintext;
    /// the buffer must have room for the tag. Returns the sealed length.
    /// REQUEST bodies pass through untouched.
    pub fn seal_body(&self, body: &mut [u8], plain_len: usize, header: &Header) -> ProtocolResult<usize> {
        if header.kind == crate::packet::PacketKind::Request {
            return Ok(plain_len);
        }

        if body.len() < plain_len + MAC_BYTES {
            return Err(ProtocolError::BufferTooSmall);
        }

        let nonce = crypto::sequence_nonce(header.sequence);
        let ad = self.associated_data(header.prefix());
        if !crypto::seal(body, plain_len, &ad, &nonce, &self.encrypt_key) {
            return Err(ProtocolError::AuthFailed);
        }
        Ok(plain_len + MAC_BYTES)
    }

    /// Opens a packet body in place with the decrypt key. Returns the
    /// plaintext length. REQUEST bodies pass through untouched.
    pub fn open_body(&self, body: &mut [u8], cipher_len: usize, header: &Header) -> ProtocolResult<usize> {
        if header.kind == crate::packet::PacketKind::Request {
            return Ok(cipher_len);
        }

        if cipher_len < MAC_BYTES {
            return Err(ProtocolError::Malformed);
        }

        let nonce = crypto::sequence_nonce(header.sequence);
        let ad = self.associated_data(header.prefix());
        if !crypto::open(body, cipher_len, &ad, &nonce, &self.decrypt_key) {
            return Err(ProtocolError::AuthFailed);
        }
        Ok(cipher_len - MAC_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKind;

    fn paired_contexts() -> (CryptoContext, CryptoContext) {
        let key_a = crypto::random_key();
        let key_b = crypto::random_key();

        let mut sender = CryptoContext::empty();
        sender.protocol_id = 9;
        sender.encrypt_key = key_a;
        sender.decrypt_key = key_b;

        let mut receiver = CryptoContext::empty();
        receiver.protocol_id = 9;
        receiver.encrypt_key = key_b;
        receiver.decrypt_key = key_a;

        (sender, receiver)
    }

    #[test]
    fn test_body_roundtrip() {
        let (sender, receiver) = paired_contexts();
        let header = Header::new(PacketKind::Payload, 1234);

        let mut body = [0u8; 64];
        body[..5].copy_from_slice(b"stuff");

        let sealed = sender.seal_body(&mut body, 5, &header).unwrap();
        assert_eq!(sealed, 5 + MAC_BYTES);

        let plain = receiver.open_body(&mut body, sealed, &header).unwrap();
        assert_eq!(plain, 5);
        assert_eq!(&body[..5], b"stuff");
    }

    #[test]
    fn test_open_rejects_prefix_tamper() {
        let (sender, receiver) = paired_contexts();
        let header = Header::new(PacketKind::Payload, 7);

        let mut body = [0u8; 64];
        body[..3].copy_from_slice(b"abc");
        let sealed = sender.seal_body(&mut body, 3, &header).unwrap();

        // Same sequence, different kind: the prefix byte is bound into the
        // associated data, so this must fail.
        let forged = Header::new(PacketKind::KeepAlive, 7);
        assert_eq!(
            receiver.open_body(&mut body, sealed, &forged).unwrap_err(),
            ProtocolError::AuthFailed
        );
    }

    #[test]
    fn test_open_rejects_sequence_tamper() {
        let (sender, receiver) = paired_contexts();
        let header = Header::new(PacketKind::Payload, 7);

        let mut body = [0u8; 64];
        body[..3].copy_from_slice(b"abc");
        let sealed = sender.seal_body(&mut body, 3, &header).unwrap();

        let forged = Header::new(PacketKind::Payload, 8);
        assert_eq!(
            receiver.open_body(&mut body, sealed, &forged).unwrap_err(),
            ProtocolError::AuthFailed
        );
    }

    #[test]
    fn test_open_rejects_protocol_id_mismatch() {
        let (sender, mut receiver) = paired_contexts();
        let header = Header::new(PacketKind::Payload, 7);

        let mut body = [0u8; 64];
        body[..3].copy_from_slice(b"abc");
        let sealed = sender.seal_body(&mut body, 3, &header).unwrap();

        receiver.protocol_id = 10;
        assert_eq!(
            receiver.open_body(&mut body, sealed, &header).unwrap_err(),
            ProtocolError::AuthFailed
        );
    }

    #[test]
    fn test_request_passes_through() {
        let (sender, _) = paired_contexts();
        let header = Header::new(PacketKind::Request, 0);

        let mut body = [0u8; 16];
        body[..4].copy_from_slice(b"open");
        let len = sender.seal_body(&mut body, 4, &header).unwrap();
        assert_eq!(len, 4);
        assert_eq!(&body[..4], b"open");
    }
}
