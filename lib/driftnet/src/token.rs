use crate::error::{ProtocolError, ProtocolResult};
use crate::{
    ClientId, CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, CONNECT_TOKEN_NONCE_BYTES,
    CONNECT_TOKEN_PRIVATE_BYTES, MAC_BYTES, MAX_SERVER_ADDRESSES, USER_DATA_BYTES, VERSION_INFO,
    VERSION_INFO_BYTES,
};
use brine::crypto::{self, Key, XNonce};
use brine::time::timestamp_secs;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryInto;
use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Offset of the encrypted private section inside the 2048-byte token.
pub const CONNECT_TOKEN_PRIVATE_OFFSET: usize =
    VERSION_INFO_BYTES + 8 + 8 + 8 + CONNECT_TOKEN_NONCE_BYTES;

const PRIVATE_PLAIN_BYTES: usize = CONNECT_TOKEN_PRIVATE_BYTES - MAC_BYTES;
const PRIVATE_ASSOCIATED_DATA_BYTES: usize = VERSION_INFO_BYTES + 8 + 8;
const CHALLENGE_PLAIN_BYTES: usize = CHALLENGE_TOKEN_BYTES - MAC_BYTES;

const ADDRESS_IPV4: u8 = 1;
const ADDRESS_IPV6: u8 = 2;

/// The server-only section of a connect token: who the client is, how to
/// talk to it, and the keys for both directions.
#[derive(Debug, Clone)]
pub struct ConnectTokenPrivate {
    pub client_id: ClientId,
    pub timeout: i32,
    pub addresses: Vec<SocketAddr>,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
    pub user_data: [u8; USER_DATA_BYTES],
}

/// The public portion of a connect token, which is all a client ever reads.
#[derive(Debug, Clone)]
pub struct ConnectToken {
    pub protocol_id: u64,
    pub create_timestamp: u64,
    pub expire_timestamp: u64,
    pub nonce: XNonce,
    pub timeout: i32,
    pub addresses: Vec<SocketAddr>,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
}

/// Everything that goes into minting a token. The issuing side (the
/// application's authenticator) fills this in and seals it with the key it
/// shares with the servers.
#[derive(Debug, Clone)]
pub struct ConnectTokenInfo {
    pub protocol_id: u64,
    pub create_timestamp: u64,
    pub expire_timestamp: u64,
    pub nonce: XNonce,
    pub client_id: ClientId,
    pub timeout: i32,
    pub addresses: Vec<SocketAddr>,
    pub client_to_server_key: Key,
    pub server_to_client_key: Key,
    pub user_data: [u8; USER_DATA_BYTES],
}

fn write_addresses<W: Write>(stream: &mut W, addresses: &[SocketAddr]) -> ProtocolResult<()> {
    if addresses.is_empty() || addresses.len() > MAX_SERVER_ADDRESSES {
        return Err(ProtocolError::TokenInvalid);
    }

    stream
        .write_u32::<LittleEndian>(addresses.len() as u32)
        .map_err(|_| ProtocolError::BufferTooSmall)?;

    for address in addresses {
        match address {
            SocketAddr::V4(v4) => {
                stream.write_u8(ADDRESS_IPV4).map_err(|_| ProtocolError::BufferTooSmall)?;
                stream
                    .write_all(&v4.ip().octets())
                    .map_err(|_| ProtocolError::BufferTooSmall)?;
            }
            SocketAddr::V6(v6) => {
                stream.write_u8(ADDRESS_IPV6).map_err(|_| ProtocolError::BufferTooSmall)?;
                for group in &v6.ip().segments() {
                    stream
                        .write_u16::<LittleEndian>(*group)
                        .map_err(|_| ProtocolError::BufferTooSmall)?;
                }
            }
        }
        stream
            .write_u16::<LittleEndian>(address.port())
            .map_err(|_| ProtocolError::BufferTooSmall)?;
    }

    Ok(())
}

fn read_addresses<R: Read>(stream: &mut R) -> ProtocolResult<Vec<SocketAddr>> {
    let count = stream
        .read_u32::<LittleEndian>()
        .map_err(|_| ProtocolError::TokenInvalid)? as usize;

    if count == 0 || count > MAX_SERVER_ADDRESSES {
        return Err(ProtocolError::TokenInvalid);
    }

    let mut addresses = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = stream.read_u8().map_err(|_| ProtocolError::TokenInvalid)?;
        let ip = match kind {
            ADDRESS_IPV4 => {
                let mut octets = [0u8; 4];
                stream
                    .read_exact(&mut octets)
                    .map_err(|_| ProtocolError::TokenInvalid)?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            ADDRESS_IPV6 => {
                let mut groups = [0u16; 8];
                for group in groups.iter_mut() {
                    *group = stream
                        .read_u16::<LittleEndian>()
                        .map_err(|_| ProtocolError::TokenInvalid)?;
                }
                IpAddr::V6(Ipv6Addr::new(
                    groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6],
                    groups[7],
                ))
            }
            _ => return Err(ProtocolError::TokenInvalid),
        };

        let port = stream
            .read_u16::<LittleEndian>()
            .map_err(|_| ProtocolError::TokenInvalid)?;
        addresses.push(SocketAddr::new(ip, port));
    }

    Ok(addresses)
}

fn private_associated_data(protocol_id: u64, expire_timestamp: u64) -> [u8; PRIVATE_ASSOCIATED_DATA_BYTES] {
    let mut ad = [0u8; PRIVATE_ASSOCIATED_DATA_BYTES];
    let mut stream = Cursor::new(&mut ad[..]);
    stream.write_all(&VERSION_INFO).expect("Associated data write");
    stream
        .write_u64::<LittleEndian>(protocol_id)
        .expect("Associated data write");
    stream
        .write_u64::<LittleEndian>(expire_timestamp)
        .expect("Associated data write");
    ad
}

impl ConnectTokenPrivate {
    /// Serializes and seals the private section into its 1024-byte wire
    /// form, bound to the token's public protocol id and expiry through the
    /// associated data.
    pub fn seal(
        &self,
        out: &mut [u8; CONNECT_TOKEN_PRIVATE_BYTES],
        protocol_id: u64,
        expire_timestamp: u64,
        nonce: &XNonce,
        key: &Key,
    ) -> ProtocolResult<()> {
        {
            let mut stream = Cursor::new(&mut out[..]);
            stream
                .write_i64::<LittleEndian>(self.client_id)
                .expect("Private section write");
            stream
                .write_i32::<LittleEndian>(self.timeout)
                .expect("Private section write");
            write_addresses(&mut stream, &self.addresses)?;
            stream
                .write_all(&self.client_to_server_key)
                .expect("Private section write");
            stream
                .write_all(&self.server_to_client_key)
                .expect("Private section write");
            stream
                .write_all(&self.user_data)
                .expect("Private section write");
            // The remainder is already zero padding
        }

        let ad = private_associated_data(protocol_id, expire_timestamp);
        if !crypto::seal_x(&mut out[..], PRIVATE_PLAIN_BYTES, &ad, nonce, key) {
            return Err(ProtocolError::AuthFailed);
        }
        Ok(())
    }

    /// Opens and parses a sealed private section. Fails with `AuthFailed`
    /// under a wrong key, nonce or associated data.
    pub fn open(
        sealed: &[u8],
        protocol_id: u64,
        expire_timestamp: u64,
        nonce: &XNonce,
        key: &Key,
    ) -> ProtocolResult<ConnectTokenPrivate> {
        if sealed.len() != CONNECT_TOKEN_PRIVATE_BYTES {
            return Err(ProtocolError::Malformed);
        }

        let mut plain = [0u8; CONNECT_TOKEN_PRIVATE_BYTES];
        plain.copy_from_slice(sealed);

        let ad = private_associated_data(protocol_id, expire_timestamp);
        if !crypto::open_x(&mut plain, CONNECT_TOKEN_PRIVATE_BYTES, &ad, nonce, key) {
            return Err(ProtocolError::AuthFailed);
        }

        let mut stream = Cursor::new(&plain[..PRIVATE_PLAIN_BYTES]);
        let client_id = stream
            .read_i64::<LittleEndian>()
            .map_err(|_| ProtocolError::Malformed)?;
        let timeout = stream
            .read_i32::<LittleEndian>()
            .map_err(|_| ProtocolError::Malformed)?;
        let addresses = read_addresses(&mut stream)?;

        let mut client_to_server_key = [0u8; crypto::KEY_SIZE];
        stream
            .read_exact(&mut client_to_server_key)
            .map_err(|_| ProtocolError::Malformed)?;
        let mut server_to_client_key = [0u8; crypto::KEY_SIZE];
        stream
            .read_exact(&mut server_to_client_key)
            .map_err(|_| ProtocolError::Malformed)?;

        let mut user_data = [0u8; USER_DATA_BYTES];
        stream
            .read_exact(&mut user_data)
            .map_err(|_| ProtocolError::Malformed)?;

        Ok(ConnectTokenPrivate {
            client_id,
            timeout,
            addresses,
            client_to_server_key,
            server_to_client_key,
            user_data,
        })
    }
}

/// Writes the full 2048-byte connect token: public envelope, sealed private
/// section, and the public appendix the client reads.
pub fn encode_connect_token(
    info: &ConnectTokenInfo,
    key: &Key,
) -> ProtocolResult<Box<[u8; CONNECT_TOKEN_BYTES]>> {
    let mut buffer = Box::new([0u8; CONNECT_TOKEN_BYTES]);

    {
        let mut stream = Cursor::new(&mut buffer[..]);
        stream.write_all(&VERSION_INFO).expect("Token write");
        stream
            .write_u64::<LittleEndian>(info.protocol_id)
            .expect("Token write");
        stream
            .write_u64::<LittleEndian>(info.create_timestamp)
            .expect("Token write");
        stream
            .write_u64::<LittleEndian>(info.expire_timestamp)
            .expect("Token write");
        stream.write_all(&info.nonce).expect("Token write");
    }

    let private = ConnectTokenPrivate {
        client_id: info.client_id,
        timeout: info.timeout,
        addresses: info.addresses.clone(),
        client_to_server_key: info.client_to_server_key,
        server_to_client_key: info.server_to_client_key,
        user_data: info.user_data,
    };

    {
        let sealed: &mut [u8; CONNECT_TOKEN_PRIVATE_BYTES] = (&mut buffer
            [CONNECT_TOKEN_PRIVATE_OFFSET..CONNECT_TOKEN_PRIVATE_OFFSET + CONNECT_TOKEN_PRIVATE_BYTES])
            .try_into()
            .expect("Private section slice size");
        private.seal(sealed, info.protocol_id, info.expire_timestamp, &info.nonce, key)?;
    }

    {
        let mut stream = Cursor::new(
            &mut buffer[CONNECT_TOKEN_PRIVATE_OFFSET + CONNECT_TOKEN_PRIVATE_BYTES..],
        );
        stream
            .write_i32::<LittleEndian>(info.timeout)
            .expect("Token write");
        write_addresses(&mut stream, &info.addresses)?;
        stream
            .write_all(&info.client_to_server_key)
            .expect("Token write");
        stream
            .write_all(&info.server_to_client_key)
            .expect("Token write");
        // Zero padding to 2048 is already in place
    }

    Ok(buffer)
}

/// Reads the public portion of a 2048-byte connect token. The private
/// section is skipped, not decrypted; only a server holding the token key
/// can open it.
pub fn decode_connect_token_public(buffer: &[u8]) -> ProtocolResult<ConnectToken> {
    if buffer.len() != CONNECT_TOKEN_BYTES {
        return Err(ProtocolError::TokenInvalid);
    }

    if buffer[..VERSION_INFO_BYTES] != VERSION_INFO {
        return Err(ProtocolError::TokenInvalid);
    }

    let mut stream = Cursor::new(&buffer[VERSION_INFO_BYTES..]);
    let protocol_id = stream
        .read_u64::<LittleEndian>()
        .map_err(|_| ProtocolError::TokenInvalid)?;
    let create_timestamp = stream
        .read_u64::<LittleEndian>()
        .map_err(|_| ProtocolError::TokenInvalid)?;
    let expire_timestamp = stream
        .read_u64::<LittleEndian>()
        .map_err(|_| ProtocolError::TokenInvalid)?;

    let mut nonce = [0u8; CONNECT_TOKEN_NONCE_BYTES];
    stream
        .read_exact(&mut nonce)
        .map_err(|_| ProtocolError::TokenInvalid)?;

    let mut stream = Cursor::new(&buffer[CONNECT_TOKEN_PRIVATE_OFFSET + CONNECT_TOKEN_PRIVATE_BYTES..]);
    let timeout = stream
        .read_i32::<LittleEndian>()
        .map_err(|_| ProtocolError::TokenInvalid)?;
    let addresses = read_addresses(&mut stream)?;

    let mut client_to_server_key = [0u8; crypto::KEY_SIZE];
    stream
        .read_exact(&mut client_to_server_key)
        .map_err(|_| ProtocolError::TokenInvalid)?;
    let mut server_to_client_key = [0u8; crypto::KEY_SIZE];
    stream
        .read_exact(&mut server_to_client_key)
        .map_err(|_| ProtocolError::TokenInvalid)?;

    Ok(ConnectToken {
        protocol_id,
        create_timestamp,
        expire_timestamp,
        nonce,
        timeout,
        addresses,
        client_to_server_key,
        server_to_client_key,
    })
}

/// Mints a token with fresh random keys and nonce, valid from now for
/// `lifetime_secs`. This is the out-of-band authenticator role; the result
/// is handed to the client over whatever secure channel the application
/// uses.
pub fn generate_connect_token(
    protocol_id: u64,
    private_key: &Key,
    client_id: ClientId,
    timeout: i32,
    lifetime_secs: u64,
    addresses: Vec<SocketAddr>,
    user_data: [u8; USER_DATA_BYTES],
) -> ProtocolResult<(Box<[u8; CONNECT_TOKEN_BYTES]>, ConnectTokenInfo)> {
    let now = timestamp_secs();
    let mut nonce = [0u8; CONNECT_TOKEN_NONCE_BYTES];
    crypto::random_bytes(&mut nonce);

    let info = ConnectTokenInfo {
        protocol_id,
        create_timestamp: now,
        expire_timestamp: now + lifetime_secs,
        nonce,
        client_id,
        timeout,
        addresses,
        client_to_server_key: crypto::random_key(),
        server_to_client_key: crypto::random_key(),
        user_data,
    };

    let buffer = encode_connect_token(&info, private_key)?;
    Ok((buffer, info))
}

/// The opaque liveness proof a server hands out in a CHALLENGE and expects
/// back, unchanged, in a RESPONSE. Sealed under the server's per-run
/// challenge key with the token sequence as nonce.
#[derive(Debug, Clone)]
pub struct ChallengeToken {
    pub client_id: ClientId,
    pub user_data: [u8; USER_DATA_BYTES],
}

impl ChallengeToken {
    /// Serializes and seals the token into its 300-byte wire form.
    pub fn seal(
        &self,
        out: &mut [u8; CHALLENGE_TOKEN_BYTES],
        key: &Key,
        sequence: u64,
    ) -> ProtocolResult<()> {
        {
            let mut stream = Cursor::new(&mut out[..]);
            stream
                .write_i64::<LittleEndian>(self.client_id)
                .expect("Challenge token write");
            stream
                .write_all(&self.user_data)
                .expect("Challenge token write");
            // Zero padded to the plaintext size
        }

        let nonce = crypto::sequence_nonce(sequence);
        if !crypto::seal(&mut out[..], CHALLENGE_PLAIN_BYTES, &[], &nonce, key) {
            return Err(ProtocolError::AuthFailed);
        }
        Ok(())
    }

    /// Opens a sealed challenge token.
    pub fn open(sealed: &[u8], key: &Key, sequence: u64) -> ProtocolResult<ChallengeToken> {
        if sealed.len() != CHALLENGE_TOKEN_BYTES {
            return Err(ProtocolError::Malformed);
        }

        let mut plain = [0u8; CHALLENGE_TOKEN_BYTES];
        plain.copy_from_slice(sealed);

        let nonce = crypto::sequence_nonce(sequence);
        if !crypto::open(&mut plain, CHALLENGE_TOKEN_BYTES, &[], &nonce, key) {
            return Err(ProtocolError::AuthFailed);
        }

        let mut stream = Cursor::new(&plain[..]);
        let client_id = stream
            .read_i64::<LittleEndian>()
            .map_err(|_| ProtocolError::Malformed)?;
        let mut user_data = [0u8; USER_DATA_BYTES];
        stream
            .read_exact(&mut user_data)
            .map_err(|_| ProtocolError::Malformed)?;

        Ok(ChallengeToken {
            client_id,
            user_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ConnectTokenInfo {
        let mut user_data = [0u8; USER_DATA_BYTES];
        user_data[0] = 0xDE;
        user_data[USER_DATA_BYTES - 1] = 0xAD;

        let mut nonce = [0u8; CONNECT_TOKEN_NONCE_BYTES];
        crypto::random_bytes(&mut nonce);

        ConnectTokenInfo {
            protocol_id: 0x1122334455667788,
            create_timestamp: 1000,
            expire_timestamp: 2000,
            nonce,
            client_id: 4242,
            timeout: 15,
            addresses: vec![
                "127.0.0.1:40000".parse().unwrap(),
                "[2001:db8::1]:40001".parse().unwrap(),
            ],
            client_to_server_key: crypto::random_key(),
            server_to_client_key: crypto::random_key(),
            user_data,
        }
    }

    #[test]
    fn test_public_roundtrip() {
        let info = sample_info();
        let key = crypto::random_key();

        let buffer = encode_connect_token(&info, &key).unwrap();
        let token = decode_connect_token_public(&buffer[..]).unwrap();

        assert_eq!(token.protocol_id, info.protocol_id);
        assert_eq!(token.create_timestamp, info.create_timestamp);
        assert_eq!(token.expire_timestamp, info.expire_timestamp);
        assert_eq!(token.nonce, info.nonce);
        assert_eq!(token.timeout, info.timeout);
        assert_eq!(token.addresses, info.addresses);
        assert_eq!(token.client_to_server_key, info.client_to_server_key);
        assert_eq!(token.server_to_client_key, info.server_to_client_key);
    }

    #[test]
    fn test_private_roundtrip() {
        let info = sample_info();
        let key = crypto::random_key();

        let buffer = encode_connect_token(&info, &key).unwrap();
        let sealed = &buffer
            [CONNECT_TOKEN_PRIVATE_OFFSET..CONNECT_TOKEN_PRIVATE_OFFSET + CONNECT_TOKEN_PRIVATE_BYTES];

        let private = ConnectTokenPrivate::open(
            sealed,
            info.protocol_id,
            info.expire_timestamp,
            &info.nonce,
            &key,
        )
        .unwrap();

        assert_eq!(private.client_id, info.client_id);
        assert_eq!(private.timeout, info.timeout);
        assert_eq!(private.addresses, info.addresses);
        assert_eq!(private.client_to_server_key, info.client_to_server_key);
        assert_eq!(private.server_to_client_key, info.server_to_client_key);
        assert_eq!(private.user_data[..], info.user_data[..]);
    }

    #[test]
    fn test_private_rejects_wrong_key() {
        let info = sample_info();
        let key = crypto::random_key();

        let buffer = encode_connect_token(&info, &key).unwrap();
        let sealed = &buffer
            [CONNECT_TOKEN_PRIVATE_OFFSET..CONNECT_TOKEN_PRIVATE_OFFSET + CONNECT_TOKEN_PRIVATE_BYTES];

        let result = ConnectTokenPrivate::open(
            sealed,
            info.protocol_id,
            info.expire_timestamp,
            &info.nonce,
            &crypto::random_key(),
        );
        assert_eq!(result.unwrap_err(), ProtocolError::AuthFailed);
    }

    #[test]
    fn test_private_binds_expiry_in_associated_data() {
        let info = sample_info();
        let key = crypto::random_key();

        let buffer = encode_connect_token(&info, &key).unwrap();
        let sealed = &buffer
            [CONNECT_TOKEN_PRIVATE_OFFSET..CONNECT_TOKEN_PRIVATE_OFFSET + CONNECT_TOKEN_PRIVATE_BYTES];

        // An attacker rewriting the public expiry invalidates the seal
        let result = ConnectTokenPrivate::open(
            sealed,
            info.protocol_id,
            info.expire_timestamp + 3600,
            &info.nonce,
            &key,
        );
        assert_eq!(result.unwrap_err(), ProtocolError::AuthFailed);
    }

    #[test]
    fn test_decode_public_rejects_bad_version() {
        let info = sample_info();
        let key = crypto::random_key();

        let mut buffer = encode_connect_token(&info, &key).unwrap();
        buffer[0] ^= 0xFF;

        assert_eq!(
            decode_connect_token_public(&buffer[..]).unwrap_err(),
            ProtocolError::TokenInvalid
        );
    }

    #[test]
    fn test_decode_public_rejects_wrong_size() {
        assert_eq!(
            decode_connect_token_public(&[0u8; 100]).unwrap_err(),
            ProtocolError::TokenInvalid
        );
    }

    #[test]
    fn test_encode_rejects_empty_addresses() {
        let mut info = sample_info();
        info.addresses.clear();

        assert_eq!(
            encode_connect_token(&info, &crypto::random_key()).unwrap_err(),
            ProtocolError::TokenInvalid
        );
    }

    #[test]
    fn test_generate_produces_decodable_token() {
        let private_key = crypto::random_key();
        let (buffer, info) = generate_connect_token(
            77,
            &private_key,
            9,
            10,
            60,
            vec!["10.0.0.1:9000".parse().unwrap()],
            [0u8; USER_DATA_BYTES],
        )
        .unwrap();

        let token = decode_connect_token_public(&buffer[..]).unwrap();
        assert_eq!(token.protocol_id, 77);
        assert_eq!(token.expire_timestamp, info.create_timestamp + 60);
        assert_eq!(token.addresses, info.addresses);
    }

    #[test]
    fn test_challenge_token_roundtrip() {
        let key = crypto::random_key();
        let mut user_data = [0u8; USER_DATA_BYTES];
        user_data[7] = 7;

        let token = ChallengeToken {
            client_id: -5,
            user_data,
        };

        let mut sealed = [0u8; CHALLENGE_TOKEN_BYTES];
        token.seal(&mut sealed, &key, 99).unwrap();

        let opened = ChallengeToken::open(&sealed, &key, 99).unwrap();
        assert_eq!(opened.client_id, -5);
        assert_eq!(opened.user_data[..], user_data[..]);
    }

    #[test]
    fn test_challenge_token_rejects_wrong_sequence() {
        let key = crypto::random_key();
        let token = ChallengeToken {
            client_id: 1,
            user_data: [0u8; USER_DATA_BYTES],
        };

        let mut sealed = [0u8; CHALLENGE_TOKEN_BYTES];
        token.seal(&mut sealed, &key, 5).unwrap();

        assert_eq!(
            ChallengeToken::open(&sealed, &key, 6).unwrap_err(),
            ProtocolError::AuthFailed
        );
    }
}
