//! Session key derivation and the AES-256-CFB stream transform

use aes::cipher::KeyIvInit;
use aes::Aes256;
use cfb_mode::{BufDecryptor, BufEncryptor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// AES block size; also the handshake IV length
pub const BLOCK_SIZE: usize = 16;

pub type Iv = [u8; BLOCK_SIZE];

/// Seed used by deployments that predate secret-keyed derivation.
const LEGACY_KEY_SEED: &[u8] = b"password";

/// How the symmetric key is derived from the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDerivation {
    /// SHA-256(decimal timestamp ‖ shared secret)
    #[default]
    Secret,
    /// SHA-256(decimal timestamp ‖ "password"), ignoring the shared secret.
    /// Only for talking to peers that still use the fixed seed.
    Legacy,
}

/// Key and IV for one upgraded channel
#[derive(Clone)]
pub struct SessionKey {
    pub key: [u8; 32],
    pub iv: Iv,
}

impl SessionKey {
    pub fn derive(timestamp: i64, iv: Iv, secret: &[u8], derivation: KeyDerivation) -> Self {
        let material = match derivation {
            KeyDerivation::Secret => secret,
            KeyDerivation::Legacy => LEGACY_KEY_SEED,
        };
        let mut hasher = Sha256::new();
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update(material);
        Self {
            key: hasher.finalize().into(),
            iv,
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("key", &"<redacted>")
            .field("iv", &self.iv)
            .finish()
    }
}

/// Encrypting half of a CFB keystream
pub struct StreamEncryptor(BufEncryptor<Aes256>);

impl StreamEncryptor {
    pub fn new(session: &SessionKey) -> Self {
        Self(BufEncryptor::new(&session.key.into(), &session.iv.into()))
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        self.0.encrypt(data);
    }
}

/// Decrypting half of a CFB keystream
pub struct StreamDecryptor(BufDecryptor<Aes256>);

impl StreamDecryptor {
    pub fn new(session: &SessionKey) -> Self {
        Self(BufDecryptor::new(&session.key.into(), &session.iv.into()))
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        self.0.decrypt(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn session() -> SessionKey {
        SessionKey::derive(1_700_000_000, [7u8; BLOCK_SIZE], b"hunter2", KeyDerivation::Secret)
    }

    #[test]
    fn test_roundtrip_various_lengths() {
        for len in [0usize, 1, 15, 16, 17, 1000, 70_000] {
            let mut payload = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut payload);

            let mut data = payload.clone();
            StreamEncryptor::new(&session()).apply(&mut data);
            if len > 0 {
                assert_ne!(data, payload);
            }
            StreamDecryptor::new(&session()).apply(&mut data);
            assert_eq!(data, payload, "length {}", len);
        }
    }

    #[test]
    fn test_stream_state_carries_across_chunks() {
        let payload: Vec<u8> = (0..100u8).collect();

        let mut whole = payload.clone();
        StreamEncryptor::new(&session()).apply(&mut whole);

        let mut enc = StreamEncryptor::new(&session());
        let mut chunked = payload.clone();
        let (a, b) = chunked.split_at_mut(37);
        enc.apply(a);
        enc.apply(b);
        assert_eq!(chunked, whole);

        let mut dec = StreamDecryptor::new(&session());
        let (a, b) = chunked.split_at_mut(5);
        dec.apply(a);
        dec.apply(b);
        assert_eq!(chunked, payload);
    }

    #[test]
    fn test_secret_derivation_depends_on_secret() {
        let iv = [0u8; BLOCK_SIZE];
        let a = SessionKey::derive(100, iv, b"alpha", KeyDerivation::Secret);
        let b = SessionKey::derive(100, iv, b"beta", KeyDerivation::Secret);
        assert_ne!(a.key, b.key);

        let c = SessionKey::derive(101, iv, b"alpha", KeyDerivation::Secret);
        assert_ne!(a.key, c.key);
    }

    #[test]
    fn test_legacy_derivation_ignores_secret() {
        let iv = [0u8; BLOCK_SIZE];
        let a = SessionKey::derive(100, iv, b"alpha", KeyDerivation::Legacy);
        let b = SessionKey::derive(100, iv, b"beta", KeyDerivation::Legacy);
        assert_eq!(a.key, b.key);

        let expected: [u8; 32] = Sha256::digest(b"100password").into();
        assert_eq!(a.key, expected);
    }
}
