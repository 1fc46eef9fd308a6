use crate::crypto::CryptoContext;
use crate::error::{ProtocolError, ProtocolResult};
use crate::token::{ChallengeToken, ConnectTokenPrivate};
use crate::{
    ClientId, CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_NONCE_BYTES, CONNECT_TOKEN_PRIVATE_BYTES,
    MAC_BYTES, PAYLOAD_BODY_CAPACITY, VERSION_INFO, VERSION_INFO_BYTES,
};
use brine::crypto::XNonce;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryInto;
use std::io::{Cursor, Read, Write};

pub const SEQUENCE_BYTES_MIN: usize = 1;
pub const SEQUENCE_BYTES_MAX: usize = 8;

pub const REQUEST_BODY_BYTES: usize =
    VERSION_INFO_BYTES + 8 + 8 + CONNECT_TOKEN_NONCE_BYTES + CONNECT_TOKEN_PRIVATE_BYTES;
pub const CHALLENGE_BODY_BYTES: usize = 8 + CHALLENGE_TOKEN_BYTES;
pub const RESPONSE_BODY_BYTES: usize = CHALLENGE_BODY_BYTES;
pub const KEEP_ALIVE_BODY_BYTES: usize = 8;
pub const DENIED_BODY_BYTES: usize = 0;
pub const DISCONNECT_BODY_BYTES: usize = 0;

/// The smallest datagram that can carry an encrypted packet: prefix, one
/// sequence byte and the authentication tag.
pub const ENCRYPTED_MIN_BYTES: usize = 2 + MAC_BYTES;
pub const UNENCRYPTED_MIN_BYTES: usize = 2;

/// Offset of the protocol id inside a REQUEST body, used for the cheap
/// pre-crypto comparison on the server.
pub const REQUEST_PROTOCOL_ID_OFFSET: usize = VERSION_INFO_BYTES;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketKind {
    Request = 0,
    Denied = 1,
    Challenge = 2,
    Response = 3,
    KeepAlive = 4,
    Payload = 5,
    Disconnect = 6,
}

impl PacketKind {
    #[inline]
    pub fn from_u8(value: u8) -> Option<PacketKind> {
        match value {
            0 => Some(PacketKind::Request),
            1 => Some(PacketKind::Denied),
            2 => Some(PacketKind::Challenge),
            3 => Some(PacketKind::Response),
            4 => Some(PacketKind::KeepAlive),
            5 => Some(PacketKind::Payload),
            6 => Some(PacketKind::Disconnect),
            _ => None,
        }
    }

    /// Every kind except REQUEST travels inside the AEAD envelope.
    #[inline]
    pub fn encrypted(self) -> bool {
        self != PacketKind::Request
    }
}

/// The minimum number of little-endian bytes needed to represent `value`.
/// Zero still takes one byte.
#[inline]
pub fn packed_uint64_bytes(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    ((bits + 7) / 8).max(1)
}

pub fn write_packed_uint64<W: Write>(stream: &mut W, bytes: usize, value: u64) -> ProtocolResult<()> {
    debug_assert!((SEQUENCE_BYTES_MIN..=SEQUENCE_BYTES_MAX).contains(&bytes));
    for shift in 0..bytes {
        stream
            .write_u8((value >> (shift * 8)) as u8)
            .map_err(|_| ProtocolError::BufferTooSmall)?;
    }
    Ok(())
}

pub fn read_packed_uint64<R: Read>(stream: &mut R, bytes: usize) -> ProtocolResult<u64> {
    debug_assert!((SEQUENCE_BYTES_MIN..=SEQUENCE_BYTES_MAX).contains(&bytes));
    let mut value = 0u64;
    for shift in 0..bytes {
        let byte = stream.read_u8().map_err(|_| ProtocolError::Malformed)?;
        value |= (byte as u64) << (shift * 8);
    }
    Ok(value)
}

/// Builds a prefix byte: packet kind in the high nibble, sequence byte count
/// in the low nibble. REQUEST packets use the literal prefix zero instead.
#[inline]
pub fn encode_prefix(kind: PacketKind, sequence_bytes: usize) -> u8 {
    (((kind as u8) & 0x0F) << 4) | ((sequence_bytes as u8) & 0x0F)
}

/// The decoded packet header: kind plus sequence. REQUEST carries neither a
/// sequence nor sequence bytes on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub kind: PacketKind,
    pub sequence: u64,
}

impl Header {
    #[inline]
    pub fn new(kind: PacketKind, sequence: u64) -> Header {
        Header { kind, sequence }
    }

    #[inline]
    pub fn sequence_bytes(&self) -> usize {
        match self.kind {
            PacketKind::Request => 0,
            _ => packed_uint64_bytes(self.sequence),
        }
    }

    #[inline]
    pub fn prefix(&self) -> u8 {
        match self.kind {
            PacketKind::Request => 0,
            kind => encode_prefix(kind, self.sequence_bytes()),
        }
    }

    /// Encoded size: the prefix byte plus the sequence bytes.
    #[inline]
    pub fn len(&self) -> usize {
        1 + self.sequence_bytes()
    }

    /// Writes the header into the front of `buffer`, returning the number of
    /// bytes written.
    pub fn encode(&self, buffer: &mut [u8]) -> ProtocolResult<usize> {
        if buffer.len() < self.len() {
            return Err(ProtocolError::BufferTooSmall);
        }

        let mut stream = Cursor::new(buffer);
        if self.kind == PacketKind::Request {
            stream.write_u8(0).map_err(|_| ProtocolError::BufferTooSmall)?;
            return Ok(1);
        }

        let sequence_bytes = self.sequence_bytes();
        stream
            .write_u8(encode_prefix(self.kind, sequence_bytes))
            .map_err(|_| ProtocolError::BufferTooSmall)?;
        write_packed_uint64(&mut stream, sequence_bytes, self.sequence)?;
        Ok(stream.position() as usize)
    }

    /// Reads a header off the front of `buffer`, returning it along with the
    /// number of bytes consumed.
    pub fn decode(buffer: &[u8]) -> ProtocolResult<(Header, usize)> {
        let mut stream = Cursor::new(buffer);
        let prefix = stream.read_u8().map_err(|_| ProtocolError::Malformed)?;

        if prefix == 0 {
            return Ok((Header::new(PacketKind::Request, 0), 1));
        }

        let kind = PacketKind::from_u8(prefix >> 4).ok_or(ProtocolError::Malformed)?;
        if kind == PacketKind::Request {
            // A request prefix must be exactly zero
            return Err(ProtocolError::Malformed);
        }

        let sequence_bytes = (prefix & 0x0F) as usize;
        if !(SEQUENCE_BYTES_MIN..=SEQUENCE_BYTES_MAX).contains(&sequence_bytes) {
            return Err(ProtocolError::Malformed);
        }

        let sequence = read_packed_uint64(&mut stream, sequence_bytes)?;
        Ok((Header::new(kind, sequence), stream.position() as usize))
    }
}

/// Validates a body length (as seen on the wire) against the kind-specific
/// bounds, before any crypto work happens.
pub fn validate_body_length(kind: PacketKind, body_length: usize, encrypted: bool) -> bool {
    let length = if encrypted && kind != PacketKind::Request {
        match body_length.checked_sub(MAC_BYTES) {
            Some(length) => length,
            None => return false,
        }
    } else {
        body_length
    };

    match kind {
        PacketKind::Request => length == REQUEST_BODY_BYTES,
        PacketKind::Denied => length == DENIED_BODY_BYTES,
        PacketKind::Challenge => length == CHALLENGE_BODY_BYTES,
        PacketKind::Response => length == RESPONSE_BODY_BYTES,
        PacketKind::KeepAlive => length == KEEP_ALIVE_BODY_BYTES,
        PacketKind::Payload => length > 0 && length <= PAYLOAD_BODY_CAPACITY,
        PacketKind::Disconnect => length == DISCONNECT_BODY_BYTES,
    }
}

/// The private section of a connect token as a request packet carries it:
/// still sealed on the client, opened on the server after decode.
#[derive(Debug, Clone)]
pub enum RequestToken {
    Sealed(Box<[u8; CONNECT_TOKEN_PRIVATE_BYTES]>),
    Open(Box<ConnectTokenPrivate>),
}

/// A challenge token in transit: sealed when relayed by the client, open on
/// the server after decryption.
#[derive(Debug, Clone)]
pub enum ChallengeData {
    Sealed(Box<[u8; CHALLENGE_TOKEN_BYTES]>),
    Open(ChallengeToken),
}

#[derive(Debug, Clone)]
pub struct RequestPacket {
    pub protocol_id: u64,
    pub expire_timestamp: u64,
    pub nonce: XNonce,
    pub token: RequestToken,
}

#[derive(Debug, Clone)]
pub struct ChallengePacket {
    pub sequence: u64,
    pub token_sequence: u64,
    pub data: ChallengeData,
}

/// One packet of any of the seven kinds. Encrypted kinds carry their
/// sequence; REQUEST does not.
#[derive(Debug, Clone)]
pub enum Packet {
    Request(RequestPacket),
    Denied { sequence: u64 },
    Challenge(ChallengePacket),
    Response(ChallengePacket),
    KeepAlive { sequence: u64, client_id: ClientId },
    Payload { sequence: u64, data: Vec<u8> },
    Disconnect { sequence: u64 },
}

impl Packet {
    #[inline]
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Request(_) => PacketKind::Request,
            Packet::Denied { .. } => PacketKind::Denied,
            Packet::Challenge(_) => PacketKind::Challenge,
            Packet::Response(_) => PacketKind::Response,
            Packet::KeepAlive { .. } => PacketKind::KeepAlive,
            Packet::Payload { .. } => PacketKind::Payload,
            Packet::Disconnect { .. } => PacketKind::Disconnect,
        }
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        match self {
            Packet::Request(_) => 0,
            Packet::Denied { sequence } => *sequence,
            Packet::Challenge(packet) | Packet::Response(packet) => packet.sequence,
            Packet::KeepAlive { sequence, .. } => *sequence,
            Packet::Payload { sequence, .. } => *sequence,
            Packet::Disconnect { sequence } => *sequence,
        }
    }

    #[inline]
    pub fn header(&self) -> Header {
        Header::new(self.kind(), self.sequence())
    }

    /// Encodes the plaintext body into `buffer` and returns its length.
    /// Sealing the body (for encrypted kinds) happens separately in the
    /// crypto context; the challenge token inside a CHALLENGE is the one
    /// exception and is sealed here, because it uses the challenge key
    /// rather than the packet key.
    pub fn encode_body(&self, crypto: &CryptoContext, buffer: &mut [u8]) -> ProtocolResult<usize> {
        match self {
            Packet::Request(packet) => {
                if buffer.len() < REQUEST_BODY_BYTES {
                    return Err(ProtocolError::BufferTooSmall);
                }

                let sealed = match &packet.token {
                    RequestToken::Sealed(sealed) => sealed,
                    // Only clients emit requests, and they never hold an
                    // opened token.
                    RequestToken::Open(_) => return Err(ProtocolError::Malformed),
                };

                let mut stream = Cursor::new(&mut buffer[..]);
                stream.write_all(&VERSION_INFO).expect("Request body write");
                stream
                    .write_u64::<LittleEndian>(packet.protocol_id)
                    .expect("Request body write");
                stream
                    .write_u64::<LittleEndian>(packet.expire_timestamp)
                    .expect("Request body write");
                stream.write_all(&packet.nonce).expect("Request body write");
                stream.write_all(&sealed[..]).expect("Body write");
                Ok(stream.position() as usize)
            }

            Packet::Denied { .. } | Packet::Disconnect { .. } => Ok(0),

            Packet::Challenge(packet) => {
                if buffer.len() < CHALLENGE_BODY_BYTES {
                    return Err(ProtocolError::BufferTooSmall);
                }

                let token = match &packet.data {
                    ChallengeData::Open(token) => token,
                    ChallengeData::Sealed(_) => return Err(ProtocolError::Malformed),
                };

                let mut stream = Cursor::new(&mut buffer[..]);
                stream
                    .write_u64::<LittleEndian>(packet.token_sequence)
                    .expect("Token sequence write");
                let at = stream.position() as usize;
                token.seal(
                    (&mut buffer[at..at + CHALLENGE_TOKEN_BYTES])
                        .try_into()
                        .expect("Challenge slice size"),
                    &crypto.challenge_key,
                    packet.token_sequence,
                )?;
                Ok(CHALLENGE_BODY_BYTES)
            }

            Packet::Response(packet) => {
                if buffer.len() < RESPONSE_BODY_BYTES {
                    return Err(ProtocolError::BufferTooSmall);
                }

                let sealed = match &packet.data {
                    ChallengeData::Sealed(sealed) => sealed,
                    ChallengeData::Open(_) => return Err(ProtocolError::Malformed),
                };

                let mut stream = Cursor::new(&mut buffer[..]);
                stream
                    .write_u64::<LittleEndian>(packet.token_sequence)
                    .expect("Token sequence write");
                stream.write_all(&sealed[..]).expect("Body write");
                Ok(stream.position() as usize)
            }

            Packet::KeepAlive { client_id, .. } => {
                let mut stream = Cursor::new(buffer);
                stream
                    .write_i64::<LittleEndian>(*client_id)
                    .map_err(|_| ProtocolError::BufferTooSmall)?;
                Ok(KEEP_ALIVE_BODY_BYTES)
            }

            Packet::Payload { data, .. } => {
                if data.is_empty() || data.len() > PAYLOAD_BODY_CAPACITY {
                    return Err(ProtocolError::Malformed);
                }
                if buffer.len() < data.len() {
                    return Err(ProtocolError::BufferTooSmall);
                }
                buffer[..data.len()].copy_from_slice(data);
                Ok(data.len())
            }
        }
    }

    /// Decodes a plaintext body (already opened for encrypted kinds) into a
    /// packet. REQUEST and RESPONSE perform their token decryption here,
    /// which is why those decodes run on the worker pool.
    pub fn decode_body(header: &Header, crypto: &CryptoContext, body: &[u8]) -> ProtocolResult<Packet> {
        match header.kind {
            PacketKind::Request => {
                if body.len() != REQUEST_BODY_BYTES {
                    return Err(ProtocolError::Malformed);
                }

                if body[..VERSION_INFO_BYTES] != VERSION_INFO {
                    return Err(ProtocolError::Malformed);
                }

                let mut stream = Cursor::new(&body[VERSION_INFO_BYTES..]);
                let protocol_id = stream.read_u64::<LittleEndian>().expect("Sized request read");
                let expire_timestamp = stream.read_u64::<LittleEndian>().expect("Sized request read");

                let mut nonce = [0u8; CONNECT_TOKEN_NONCE_BYTES];
                stream.read_exact(&mut nonce).expect("Sized request read");

                let sealed_at = VERSION_INFO_BYTES + 8 + 8 + CONNECT_TOKEN_NONCE_BYTES;
                let token = ConnectTokenPrivate::open(
                    &body[sealed_at..sealed_at + CONNECT_TOKEN_PRIVATE_BYTES],
                    protocol_id,
                    expire_timestamp,
                    &nonce,
                    &crypto.private_key,
                )?;

                Ok(Packet::Request(RequestPacket {
                    protocol_id,
                    expire_timestamp,
                    nonce,
                    token: RequestToken::Open(Box::new(token)),
                }))
            }

            PacketKind::Denied => Ok(Packet::Denied {
                sequence: header.sequence,
            }),

            PacketKind::Challenge => {
                // Clients keep the challenge token sealed and echo it back
                if body.len() != CHALLENGE_BODY_BYTES {
                    return Err(ProtocolError::Malformed);
                }

                let mut stream = Cursor::new(body);
                let token_sequence = stream.read_u64::<LittleEndian>().expect("Sized body read");

                let mut sealed = Box::new([0u8; CHALLENGE_TOKEN_BYTES]);
                sealed.copy_from_slice(&body[8..]);

                Ok(Packet::Challenge(ChallengePacket {
                    sequence: header.sequence,
                    token_sequence,
                    data: ChallengeData::Sealed(sealed),
                }))
            }

            PacketKind::Response => {
                if body.len() != RESPONSE_BODY_BYTES {
                    return Err(ProtocolError::Malformed);
                }

                let mut stream = Cursor::new(body);
                let token_sequence = stream.read_u64::<LittleEndian>().expect("Sized body read");

                let token = ChallengeToken::open(&body[8..], &crypto.challenge_key, token_sequence)?;

                Ok(Packet::Response(ChallengePacket {
                    sequence: header.sequence,
                    token_sequence,
                    data: ChallengeData::Open(token),
                }))
            }

            PacketKind::KeepAlive => {
                if body.len() != KEEP_ALIVE_BODY_BYTES {
                    return Err(ProtocolError::Malformed);
                }

                let mut stream = Cursor::new(body);
                Ok(Packet::KeepAlive {
                    sequence: header.sequence,
                    client_id: stream.read_i64::<LittleEndian>().expect("Sized body read"),
                })
            }

            PacketKind::Payload => {
                if body.is_empty() || body.len() > PAYLOAD_BODY_CAPACITY {
                    return Err(ProtocolError::Malformed);
                }
                Ok(Packet::Payload {
                    sequence: header.sequence,
                    data: body.to_vec(),
                })
            }

            PacketKind::Disconnect => {
                if !body.is_empty() {
                    return Err(ProtocolError::Malformed);
                }
                Ok(Packet::Disconnect {
                    sequence: header.sequence,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::USER_DATA_BYTES;
    use brine::crypto;

    const ALL_KINDS: [PacketKind; 7] = [
        PacketKind::Request,
        PacketKind::Denied,
        PacketKind::Challenge,
        PacketKind::Response,
        PacketKind::KeepAlive,
        PacketKind::Payload,
        PacketKind::Disconnect,
    ];

    #[test]
    fn test_packed_uint64_bytes() {
        assert_eq!(packed_uint64_bytes(0), 1);
        assert_eq!(packed_uint64_bytes(0xFF), 1);
        assert_eq!(packed_uint64_bytes(0x100), 2);
        assert_eq!(packed_uint64_bytes(0xFFFF), 2);
        assert_eq!(packed_uint64_bytes(0x10000), 3);
        assert_eq!(packed_uint64_bytes(u64::max_value()), 8);
    }

    #[test]
    fn test_packed_uint64_roundtrip() {
        for bytes in 1..=8usize {
            let max = if bytes == 8 {
                u64::max_value()
            } else {
                (1u64 << (bytes * 8)) - 1
            };

            for &value in &[0u64, 1, max / 2, max] {
                let mut buffer = [0u8; 8];
                write_packed_uint64(&mut Cursor::new(&mut buffer[..]), bytes, value).unwrap();
                let back = read_packed_uint64(&mut Cursor::new(&buffer[..]), bytes).unwrap();
                assert_eq!(back, value, "bytes={} value={}", bytes, value);
            }
        }
    }

    #[test]
    fn test_header_roundtrip_every_kind_and_length() {
        for &kind in &ALL_KINDS {
            for length in 1..=8usize {
                let sequence = if kind == PacketKind::Request {
                    0
                } else if length == 1 {
                    7
                } else {
                    1u64 << ((length - 1) * 8)
                };

                let header = Header::new(kind, sequence);
                let mut buffer = [0u8; 16];
                let written = header.encode(&mut buffer).unwrap();

                let (decoded, consumed) = Header::decode(&buffer[..written]).unwrap();
                assert_eq!(consumed, written);
                assert_eq!(decoded, header);

                if kind == PacketKind::Request {
                    assert_eq!(written, 1);
                    assert_eq!(buffer[0], 0);
                    break;
                } else {
                    assert_eq!(written, 1 + length);
                    assert_eq!(buffer[0] >> 4, kind as u8);
                    assert_eq!((buffer[0] & 0x0F) as usize, length);
                }
            }
        }
    }

    #[test]
    fn test_header_decode_rejects_bad_kind() {
        // Kind nibble 7 is undefined
        let buffer = [0x71u8, 0x01];
        assert_eq!(Header::decode(&buffer), Err(ProtocolError::Malformed));
    }

    #[test]
    fn test_header_decode_rejects_zero_sequence_bytes() {
        let buffer = [0x40u8];
        assert_eq!(Header::decode(&buffer), Err(ProtocolError::Malformed));
    }

    #[test]
    fn test_header_decode_rejects_oversized_sequence_bytes() {
        let buffer = [0x4Fu8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(Header::decode(&buffer), Err(ProtocolError::Malformed));
    }

    #[test]
    fn test_header_decode_rejects_truncated_sequence() {
        let buffer = [encode_prefix(PacketKind::Payload, 4), 1, 2];
        assert_eq!(Header::decode(&buffer), Err(ProtocolError::Malformed));
    }

    #[test]
    fn test_validate_body_length() {
        assert!(validate_body_length(PacketKind::Request, REQUEST_BODY_BYTES, false));
        assert!(validate_body_length(PacketKind::Request, REQUEST_BODY_BYTES, true));
        assert!(!validate_body_length(PacketKind::Request, REQUEST_BODY_BYTES - 1, false));

        assert!(validate_body_length(PacketKind::Denied, MAC_BYTES, true));
        assert!(!validate_body_length(PacketKind::Denied, MAC_BYTES - 1, true));

        assert!(validate_body_length(PacketKind::KeepAlive, 8 + MAC_BYTES, true));
        assert!(validate_body_length(PacketKind::KeepAlive, 8, false));
        assert!(!validate_body_length(PacketKind::KeepAlive, 9, false));

        // Empty payloads are rejected
        assert!(!validate_body_length(PacketKind::Payload, MAC_BYTES, true));
        assert!(validate_body_length(PacketKind::Payload, 1 + MAC_BYTES, true));
        assert!(validate_body_length(
            PacketKind::Payload,
            PAYLOAD_BODY_CAPACITY + MAC_BYTES,
            true
        ));
        assert!(!validate_body_length(
            PacketKind::Payload,
            PAYLOAD_BODY_CAPACITY + MAC_BYTES + 1,
            true
        ));
    }

    fn test_context() -> CryptoContext {
        CryptoContext {
            protocol_id: 0x11223344,
            encrypt_key: crypto::random_key(),
            decrypt_key: crypto::random_key(),
            private_key: crypto::random_key(),
            challenge_key: crypto::random_key(),
        }
    }

    #[test]
    fn test_keep_alive_body_roundtrip() {
        let crypto_ctx = test_context();
        let packet = Packet::KeepAlive {
            sequence: 900,
            client_id: -42,
        };

        let mut buffer = [0u8; 64];
        let written = packet.encode_body(&crypto_ctx, &mut buffer).unwrap();
        assert_eq!(written, KEEP_ALIVE_BODY_BYTES);

        let decoded =
            Packet::decode_body(&packet.header(), &crypto_ctx, &buffer[..written]).unwrap();
        match decoded {
            Packet::KeepAlive {
                sequence,
                client_id,
            } => {
                assert_eq!(sequence, 900);
                assert_eq!(client_id, -42);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_challenge_response_token_travels_sealed() {
        let crypto_ctx = test_context();
        let mut user_data = [0u8; USER_DATA_BYTES];
        user_data[0] = 0xAB;

        let challenge = Packet::Challenge(ChallengePacket {
            sequence: 1,
            token_sequence: 77,
            data: ChallengeData::Open(ChallengeToken {
                client_id: 42,
                user_data,
            }),
        });

        // Server encodes: the embedded token gets sealed with the challenge key
        let mut buffer = [0u8; CHALLENGE_BODY_BYTES];
        let written = challenge.encode_body(&crypto_ctx, &mut buffer).unwrap();
        assert_eq!(written, CHALLENGE_BODY_BYTES);

        // Client decodes without the challenge key: token stays sealed
        let decoded =
            Packet::decode_body(&challenge.header(), &crypto_ctx, &buffer[..written]).unwrap();
        let sealed = match decoded {
            Packet::Challenge(ChallengePacket {
                token_sequence,
                data: ChallengeData::Sealed(sealed),
                ..
            }) => {
                assert_eq!(token_sequence, 77);
                sealed
            }
            other => panic!("Unexpected packet {:?}", other),
        };

        // Client echoes the sealed token in a response; the server opens it
        let response = Packet::Response(ChallengePacket {
            sequence: 2,
            token_sequence: 77,
            data: ChallengeData::Sealed(sealed),
        });

        let mut buffer = [0u8; RESPONSE_BODY_BYTES];
        let written = response.encode_body(&crypto_ctx, &mut buffer).unwrap();

        let decoded =
            Packet::decode_body(&response.header(), &crypto_ctx, &buffer[..written]).unwrap();
        match decoded {
            Packet::Response(ChallengePacket {
                data: ChallengeData::Open(token),
                ..
            }) => {
                assert_eq!(token.client_id, 42);
                assert_eq!(token.user_data[0], 0xAB);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_response_decode_rejects_wrong_challenge_key() {
        let crypto_ctx = test_context();
        let challenge = Packet::Challenge(ChallengePacket {
            sequence: 1,
            token_sequence: 5,
            data: ChallengeData::Open(ChallengeToken {
                client_id: 7,
                user_data: [0u8; USER_DATA_BYTES],
            }),
        });

        let mut buffer = [0u8; CHALLENGE_BODY_BYTES];
        challenge.encode_body(&crypto_ctx, &mut buffer).unwrap();

        let mut other_ctx = test_context();
        other_ctx.challenge_key = crypto::random_key();

        let header = Header::new(PacketKind::Response, 2);
        assert_eq!(
            Packet::decode_body(&header, &other_ctx, &buffer).unwrap_err(),
            ProtocolError::AuthFailed
        );
    }

    #[test]
    fn test_payload_body_bounds() {
        let crypto_ctx = test_context();
        let mut buffer = [0u8; 2048];

        let empty = Packet::Payload {
            sequence: 1,
            data: Vec::new(),
        };
        assert_eq!(
            empty.encode_body(&crypto_ctx, &mut buffer).unwrap_err(),
            ProtocolError::Malformed
        );

        let oversized = Packet::Payload {
            sequence: 1,
            data: vec![0u8; PAYLOAD_BODY_CAPACITY + 1],
        };
        assert_eq!(
            oversized.encode_body(&crypto_ctx, &mut buffer).unwrap_err(),
            ProtocolError::Malformed
        );

        let fits = Packet::Payload {
            sequence: 1,
            data: vec![7u8; PAYLOAD_BODY_CAPACITY],
        };
        assert_eq!(
            fits.encode_body(&crypto_ctx, &mut buffer).unwrap(),
            PAYLOAD_BODY_CAPACITY
        );
    }
}
