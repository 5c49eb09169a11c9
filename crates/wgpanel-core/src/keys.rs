// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key provider failed: {0}")]
    Provider(String),

    #[error("failed to decode base64 key: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("public key does not match private key")]
    Mismatch,
}

type Result<T> = std::result::Result<T, KeyError>;

/// A WireGuard key pair, both halves base64 encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl KeyPair {
    /// Derive the public half from a base64 private key.
    pub fn from_private_key(private_key: &str) -> Result<Self> {
        let secret = StaticSecret::from(decode_key(private_key)?);
        let public = PublicKey::from(&secret);
        Ok(Self {
            private_key: private_key.to_string(),
            public_key: BASE64.encode(public.as_bytes()),
        })
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }

    /// Check that the public key is the one derived from the private key.
    pub fn verify(&self) -> Result<()> {
        let derived = Self::from_private_key(&self.private_key)?;
        if derived.public_key != self.public_key {
            return Err(KeyError::Mismatch);
        }
        Ok(())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

pub trait KeyPairProvider {
    fn generate(&self) -> Result<KeyPair>;
}

/// Curve25519 keys, equivalent to `wg genkey | wg pubkey`.
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519Provider;

impl KeyPairProvider for X25519Provider {
    fn generate(&self) -> Result<KeyPair> {
        let secret = StaticSecret::random_from_rng(&mut OsRng);
        Ok(KeyPair::from_secret_bytes(secret.to_bytes()))
    }
}

/// Generate a pair and make sure the provider handed back a matching one.
pub fn generate_verified<P: KeyPairProvider + ?Sized>(provider: &P) -> Result<KeyPair> {
    let pair = provider.generate()?;
    pair.verify().map_err(|e| KeyError::Provider(e.to_string()))?;
    Ok(pair)
}

pub fn decode_key(b64: &str) -> Result<[u8; 32]> {
    let bytes = BASE64.decode(b64.trim())?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| KeyError::InvalidLength(len))
}
