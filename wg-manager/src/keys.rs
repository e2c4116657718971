// Curve25519 keys as used by WireGuard

//! WireGuard key handling
//!
//! A [`Key`] is 32 bytes of Curve25519 material that can be read from and
//! written to the base64, hex and raw binary forms that WireGuard tools use.
//! [`KeyPair`] derives the public half from a private key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Encoding a key was being read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// 44 characters, standard alphabet with one padding byte
    Base64,
    /// 32 raw bytes
    Binary,
    /// 64 hexadecimal characters
    Hex,
}

impl KeyFormat {
    /// Length of a key in this format
    pub const fn length(self) -> usize {
        match self {
            KeyFormat::Base64 => 44,
            KeyFormat::Binary => 32,
            KeyFormat::Hex => 64,
        }
    }
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyFormat::Base64 => "base64",
            KeyFormat::Binary => "binary",
            KeyFormat::Hex => "hex",
        };
        f.write_str(name)
    }
}

/// What was wrong with the encoded key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormatErrorKind {
    /// Right length, but characters outside the encoding alphabet
    Contents,
    /// Wrong number of characters or bytes
    Length,
}

impl fmt::Display for KeyFormatErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFormatErrorKind::Contents => f.write_str("bad characters"),
            KeyFormatErrorKind::Length => f.write_str("wrong length"),
        }
    }
}

/// A key could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid {format} key: {kind}")]
pub struct KeyFormatError {
    /// Encoding that was being decoded
    pub format: KeyFormat,
    /// Failure category
    pub kind: KeyFormatErrorKind,
}

impl KeyFormatError {
    fn new(format: KeyFormat, kind: KeyFormatErrorKind) -> Self {
        Self { format, kind }
    }
}

/// A 256-bit Curve25519 key (private, public or pre-shared)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; 32]);

impl Key {
    /// Wrap raw key bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode from the 44-character base64 form
    pub fn from_base64(encoded: &str) -> Result<Self, KeyFormatError> {
        let encoded = encoded.as_bytes();
        if encoded.len() != KeyFormat::Base64.length() || encoded[43] != b'=' {
            return Err(KeyFormatError::new(
                KeyFormat::Base64,
                KeyFormatErrorKind::Length,
            ));
        }

        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| KeyFormatError::new(KeyFormat::Base64, KeyFormatErrorKind::Contents))?;
        Self::from_slice(&decoded)
            .map_err(|_| KeyFormatError::new(KeyFormat::Base64, KeyFormatErrorKind::Contents))
    }

    /// Take a key from a byte slice that must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyFormatError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyFormatError::new(KeyFormat::Binary, KeyFormatErrorKind::Length))?;
        Ok(Self(bytes))
    }

    /// Decode from the 64-character hex form (either case)
    pub fn from_hex(encoded: &str) -> Result<Self, KeyFormatError> {
        if encoded.len() != KeyFormat::Hex.length() {
            return Err(KeyFormatError::new(
                KeyFormat::Hex,
                KeyFormatErrorKind::Length,
            ));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(encoded, &mut bytes)
            .map_err(|_| KeyFormatError::new(KeyFormat::Hex, KeyFormatErrorKind::Contents))?;
        Ok(Self(bytes))
    }

    /// Generate a new random private key, clamped for Curve25519
    pub fn generate_private_key() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    /// Derive the public key belonging to `private_key`
    pub fn generate_public_key(private_key: &Key) -> Self {
        let secret = StaticSecret::from(private_key.0);
        Self(X25519Public::from(&secret).to_bytes())
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as base64 (44 characters)
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Encode as lowercase hex (64 characters), the form the userspace API expects
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Key {
    type Err = KeyFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({}...)", &self.to_base64()[..8])
    }
}

/// A private key together with the public key derived from it
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    private_key: Key,
    public_key: Key,
}

impl KeyPair {
    /// Build a key pair around an existing private key
    pub fn new(private_key: Key) -> Self {
        let public_key = Key::generate_public_key(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// Build a key pair around a freshly generated private key
    pub fn generate() -> Self {
        Self::new(Key::generate_private_key())
    }

    /// The private half
    pub fn private_key(&self) -> &Key {
        &self.private_key
    }

    /// The public half
    pub fn public_key(&self) -> &Key {
        &self.public_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "Lr6H7NLgVC44JOe0t8P1X5dPm0QbF8JnBQjLdbWUiNk=";

    // RFC 7748 section 6.1, Alice's key pair
    const RFC_PRIVATE_HEX: &str =
        "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a";
    const RFC_PUBLIC_HEX: &str =
        "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a";

    #[test]
    fn test_base64_round_trip() {
        let key = Key::from_base64(TEST_KEY).unwrap();
        assert_eq!(key.to_base64(), TEST_KEY);
        assert_eq!(key.to_base64().len(), KeyFormat::Base64.length());
    }

    #[test]
    fn test_hex_matches_base64() {
        let key = Key::from_base64(TEST_KEY).unwrap();
        let hex = key.to_hex();
        assert_eq!(hex.len(), KeyFormat::Hex.length());
        assert_eq!(Key::from_hex(&hex).unwrap(), key);
        assert_eq!(Key::from_hex(&hex.to_uppercase()).unwrap(), key);
    }

    #[test]
    fn test_base64_wrong_length() {
        let err = Key::from_base64("AAAA").unwrap_err();
        assert_eq!(err.format, KeyFormat::Base64);
        assert_eq!(err.kind, KeyFormatErrorKind::Length);

        // 44 characters but no padding byte at the end
        let err = Key::from_base64("Lr6H7NLgVC44JOe0t8P1X5dPm0QbF8JnBQjLdbWUiNkA").unwrap_err();
        assert_eq!(err.kind, KeyFormatErrorKind::Length);
    }

    #[test]
    fn test_base64_bad_characters() {
        let err = Key::from_base64("Lr6H7NLgVC44JOe0t8P1X5dPm0QbF8JnBQjLdbWU*Nk=").unwrap_err();
        assert_eq!(err.format, KeyFormat::Base64);
        assert_eq!(err.kind, KeyFormatErrorKind::Contents);
    }

    #[test]
    fn test_hex_errors() {
        assert_eq!(
            Key::from_hex("abcd").unwrap_err().kind,
            KeyFormatErrorKind::Length
        );
        let bad = "zz".repeat(32);
        assert_eq!(
            Key::from_hex(&bad).unwrap_err().kind,
            KeyFormatErrorKind::Contents
        );
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Key::from_slice(&[0u8; 32]).is_ok());
        let err = Key::from_slice(&[0u8; 31]).unwrap_err();
        assert_eq!(err.format, KeyFormat::Binary);
        assert_eq!(err.kind, KeyFormatErrorKind::Length);
    }

    #[test]
    fn test_public_key_derivation_rfc7748() {
        let private = Key::from_hex(RFC_PRIVATE_HEX).unwrap();
        let pair = KeyPair::new(private);
        assert_eq!(pair.public_key().to_hex(), RFC_PUBLIC_HEX);
        assert_eq!(pair.private_key(), &private);
    }

    #[test]
    fn test_generated_private_key_is_clamped() {
        let key = Key::generate_private_key();
        let bytes = key.as_bytes();
        assert_eq!(bytes[0] & 7, 0);
        assert_eq!(bytes[31] & 128, 0);
        assert_eq!(bytes[31] & 64, 64);
    }

    #[test]
    fn test_generated_pairs_differ() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.private_key(), b.private_key());
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = Key::from_base64(TEST_KEY).unwrap();
        let debug = format!("{:?}", key);
        assert!(!debug.contains(TEST_KEY));

        let pair = KeyPair::new(key);
        let debug = format!("{:?}", pair);
        assert!(!debug.contains(TEST_KEY));
    }
}
