use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

pub const KEY_LEN: usize = 32;

/// A Curve25519 key as used by WireGuard, base64 encoded in text form.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LEN]);

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: Key,
    pub public_key: Key,
}

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::config("invalid key: not base64"))?;
        if bytes.len() != KEY_LEN {
            return Err(Error::config(format!(
                "invalid key: expected {} bytes, got {} bytes",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Key(key))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    pub fn generate_private() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Key(secret.to_bytes())
    }

    /// Treats `self` as a private key and derives its public half.
    pub fn public_key(&self) -> Key {
        let secret = StaticSecret::from(self.0);
        Key(PublicKey::from(&secret).to_bytes())
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(Key::generate_private())
    }

    pub fn from_private(private_key: Key) -> Self {
        KeyPair {
            public_key: private_key.public_key(),
            private_key,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

// Never print key material from debug output; a private key may end up in logs otherwise.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Key::from_base64(s)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Key::from_base64(&raw).map_err(serde::de::Error::custom)
    }
}
