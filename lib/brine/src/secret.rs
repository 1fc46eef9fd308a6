use crate::crypto;
use crate::encoding::base64;
use serde::{de, Deserialize, Deserializer};
use serde_derive::{Deserialize as DeriveDeserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// A 32-byte secret key that serializes as base64. Shared out of band with
/// whatever issues connect tokens, so it has to survive config files intact.
#[derive(Serialize, DeriveDeserialize, Clone)]
pub struct SecretKey(
    #[serde(
        serialize_with = "base64::serialize",
        deserialize_with = "deserialize_b64_key"
    )]
    crypto::Key,
);

#[inline]
fn deserialize_b64_key<'de, D>(deserializer: D) -> Result<crypto::Key, D::Error>
where
    D: Deserializer<'de>,
{
    let s = <&str>::deserialize(deserializer)?;
    let decoded_raw = base64::decode(s).map_err(de::Error::custom)?;

    if decoded_raw.len() != crypto::KEY_SIZE {
        return Err(de::Error::custom(format!(
            "key must decode to {} bytes, got {}",
            crypto::KEY_SIZE,
            decoded_raw.len()
        )));
    }

    let mut decoded = [0u8; crypto::KEY_SIZE];
    decoded.copy_from_slice(&decoded_raw);
    Ok(decoded)
}

impl SecretKey {
    pub const SIZE: usize = crypto::KEY_SIZE;

    #[inline]
    pub fn new(key: crypto::Key) -> SecretKey {
        SecretKey(key)
    }

    /// A fresh random key from the CSPRNG.
    #[inline]
    pub fn generate() -> SecretKey {
        SecretKey(crypto::random_key())
    }
}

impl Deref for SecretKey {
    type Target = crypto::Key;

    #[inline]
    fn deref(&self) -> &crypto::Key {
        &self.0
    }
}

impl DerefMut for SecretKey {
    #[inline]
    fn deref_mut(&mut self) -> &mut crypto::Key {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_roundtrip() {
        let key = SecretKey::new([7u8; SecretKey::SIZE]);
        let json = serdeconv::to_json_string(&key).unwrap();
        let back: SecretKey = serdeconv::from_json_str(&json).unwrap();
        assert_eq!(&*back, &[7u8; SecretKey::SIZE]);
    }

    #[test]
    fn test_deserialize_rejects_short_key() {
        let result: Result<SecretKey, _> = serdeconv::from_json_str("\"AAEC\"");
        assert!(result.is_err());
    }
}
