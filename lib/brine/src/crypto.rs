use byteorder::{ByteOrder, LittleEndian};
use ctor::ctor;
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;
pub const XNONCE_SIZE: usize = libsodium_sys::crypto_aead_xchacha20poly1305_IETF_NPUBBYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

pub type Key = [u8; KEY_SIZE];
pub type Nonce = [u8; NONCE_SIZE];
pub type XNonce = [u8; XNONCE_SIZE];

/// Initialize the sodium infrastructure
#[ctor(unsafe)]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Expands a packet sequence number into an AEAD nonce. The high bytes are
/// zero, the sequence occupies the trailing eight bytes in little endian.
#[inline]
pub fn sequence_nonce(sequence: u64) -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    LittleEndian::write_u64(&mut nonce[NONCE_OFFSET..], sequence);
    nonce
}

/// Encrypts `data[..plain_len]` in place and appends the authentication tag,
/// so that `data[..plain_len + MAC_SIZE]` holds the sealed message afterwards.
/// The buffer must have room for the tag.
///
/// The additional data, nonce and key must match those used during opening,
/// the decryption will fail otherwise.
#[inline]
pub fn seal(data: &mut [u8], plain_len: usize, additional_data: &[u8], nonce: &Nonce, key: &Key) -> bool {
    if data.len() < plain_len + MAC_SIZE {
        panic!(
            "Sealing: buffer length ({}) must be at least plain length ({}) + MAC size ({})",
            data.len(),
            plain_len,
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            data.as_mut_ptr(),
            ::std::ptr::null_mut(),
            data.as_ptr(),
            plain_len as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Verifies and decrypts `data[..cipher_len]` in place. On success the
/// plaintext occupies `data[..cipher_len - MAC_SIZE]`. Returns false if the
/// tag does not verify.
#[inline]
pub fn open(data: &mut [u8], cipher_len: usize, additional_data: &[u8], nonce: &Nonce, key: &Key) -> bool {
    if cipher_len < MAC_SIZE || data.len() < cipher_len {
        return false;
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            data.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            data.as_ptr(),
            cipher_len as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Seals with the extended-nonce construction. Used where the nonce is a
/// caller-supplied 24-byte value rather than a sequence number.
#[inline]
pub fn seal_x(data: &mut [u8], plain_len: usize, additional_data: &[u8], nonce: &XNonce, key: &Key) -> bool {
    if data.len() < plain_len + MAC_SIZE {
        panic!(
            "Sealing: buffer length ({}) must be at least plain length ({}) + MAC size ({})",
            data.len(),
            plain_len,
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_xchacha20poly1305_ietf_encrypt(
            data.as_mut_ptr(),
            ::std::ptr::null_mut(),
            data.as_ptr(),
            plain_len as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Opens a message sealed with [`seal_x`].
#[inline]
pub fn open_x(data: &mut [u8], cipher_len: usize, additional_data: &[u8], nonce: &XNonce, key: &Key) -> bool {
    if cipher_len < MAC_SIZE || data.len() < cipher_len {
        return false;
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_xchacha20poly1305_ietf_decrypt(
            data.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            data.as_ptr(),
            cipher_len as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Generates a random key.
#[inline]
pub fn random_key() -> Key {
    let mut key = [0u8; KEY_SIZE];
    random_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = random_key();
        let nonce = sequence_nonce(77);
        let ad = b"header";

        let mut data = [0u8; 64];
        data[..5].copy_from_slice(b"hello");

        assert!(seal(&mut data, 5, ad, &nonce, &key));
        assert_ne!(&data[..5], b"hello");

        assert!(open(&mut data, 5 + MAC_SIZE, ad, &nonce, &key));
        assert_eq!(&data[..5], b"hello");
    }

    #[test]
    fn test_open_rejects_tamper() {
        let key = random_key();
        let nonce = sequence_nonce(1);

        let mut data = [0u8; 64];
        data[..4].copy_from_slice(b"data");
        assert!(seal(&mut data, 4, b"ad", &nonce, &key));

        data[0] ^= 0x01;
        assert!(!open(&mut data, 4 + MAC_SIZE, b"ad", &nonce, &key));
    }

    #[test]
    fn test_open_rejects_wrong_nonce() {
        let key = random_key();

        let mut data = [0u8; 64];
        data[..4].copy_from_slice(b"data");
        assert!(seal(&mut data, 4, b"ad", &sequence_nonce(1), &key));
        assert!(!open(&mut data, 4 + MAC_SIZE, b"ad", &sequence_nonce(2), &key));
    }

    #[test]
    fn test_open_rejects_wrong_additional_data() {
        let key = random_key();
        let nonce = sequence_nonce(9);

        let mut data = [0u8; 64];
        data[..4].copy_from_slice(b"data");
        assert!(seal(&mut data, 4, b"ad", &nonce, &key));
        assert!(!open(&mut data, 4 + MAC_SIZE, b"da", &nonce, &key));
    }

    #[test]
    fn test_seal_x_roundtrip() {
        let key = random_key();
        let mut nonce = [0u8; XNONCE_SIZE];
        random_bytes(&mut nonce);

        let mut data = [0u8; 64];
        data[..6].copy_from_slice(b"secret");

        assert!(seal_x(&mut data, 6, b"ad", &nonce, &key));
        assert!(open_x(&mut data, 6 + MAC_SIZE, b"ad", &nonce, &key));
        assert_eq!(&data[..6], b"secret");

        assert!(seal_x(&mut data, 6, b"ad", &nonce, &key));
        assert!(!open_x(&mut data, 6 + MAC_SIZE, b"ad", &nonce, &random_key()));
    }

    #[test]
    fn test_sequence_nonce_layout() {
        let nonce = sequence_nonce(0x0102030405060708);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }
}
