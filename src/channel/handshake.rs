//! Timestamp + IV handshake
//!
//! Wire layout, written once by the initiator of a leg:
//!
//! ```text
//! +----------------+------------------+----------------------------------+
//! | timestamp (8)  | IV (16)          | SHA-256(timestamp ‖ IV ‖ secret) |
//! | big-endian s   | random           | 32 bytes                         |
//! +----------------+------------------+----------------------------------+
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::cipher::{Iv, KeyDerivation, SessionKey, BLOCK_SIZE};
use super::error::HandshakeError;

pub const DIGEST_LEN: usize = 32;

/// Total size of a handshake record on the wire
pub const RECORD_LEN: usize = 8 + BLOCK_SIZE + DIGEST_LEN;

/// Largest accepted distance between the peer's clock and ours
pub const MAX_CLOCK_SKEW_SECS: i64 = 30;

/// Timestamp and IV both sides agreed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub timestamp: i64,
    pub iv: Iv,
}

impl Negotiated {
    pub fn session_key(&self, secret: &[u8], derivation: KeyDerivation) -> SessionKey {
        SessionKey::derive(self.timestamp, self.iv, secret, derivation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    pub timestamp: i64,
    pub iv: Iv,
    pub digest: [u8; DIGEST_LEN],
}

impl HandshakeRecord {
    pub fn new(timestamp: i64, iv: Iv, secret: &[u8]) -> Self {
        Self {
            timestamp,
            iv,
            digest: record_digest(timestamp, &iv, secret),
        }
    }

    /// Fresh record with the current time and a random IV
    pub fn generate(secret: &[u8]) -> Self {
        let mut iv = [0u8; BLOCK_SIZE];
        OsRng.fill_bytes(&mut iv);
        Self::new(unix_now(), iv, secret)
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0u8; RECORD_LEN];
        buf[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..8 + BLOCK_SIZE].copy_from_slice(&self.iv);
        buf[8 + BLOCK_SIZE..].copy_from_slice(&self.digest);
        buf
    }

    pub fn decode(buf: &[u8; RECORD_LEN]) -> Self {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[..8]);
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&buf[8..8 + BLOCK_SIZE]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&buf[8 + BLOCK_SIZE..]);
        Self {
            timestamp: i64::from_be_bytes(ts),
            iv,
            digest,
        }
    }

    /// Check freshness against `now`, then the digest against `secret`.
    pub fn verify(&self, secret: &[u8], now: i64) -> Result<Negotiated, HandshakeError> {
        let skew_secs = now.saturating_sub(self.timestamp);
        if skew_secs.saturating_abs() > MAX_CLOCK_SKEW_SECS {
            return Err(HandshakeError::ReplayOrClockSkew { skew_secs });
        }

        let expected = record_digest(self.timestamp, &self.iv, secret);
        if !bool::from(expected[..].ct_eq(&self.digest[..])) {
            return Err(HandshakeError::AuthFailure);
        }

        Ok(Negotiated {
            timestamp: self.timestamp,
            iv: self.iv,
        })
    }

    pub fn negotiated(&self) -> Negotiated {
        Negotiated {
            timestamp: self.timestamp,
            iv: self.iv,
        }
    }
}

fn record_digest(timestamp: i64, iv: &Iv, secret: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_be_bytes());
    hasher.update(iv);
    hasher.update(secret);
    hasher.finalize().into()
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Send a handshake record for the outbound leg.
pub async fn authenticate_as_initiator<S>(
    stream: &mut S,
    secret: &[u8],
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let record = HandshakeRecord::generate(secret);
    stream.write_all(&record.encode()).await?;
    stream.flush().await?;
    Ok(record.negotiated())
}

/// Read and verify a handshake record on the inbound leg.
pub async fn authenticate_as_responder<S>(
    stream: &mut S,
    secret: &[u8],
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; RECORD_LEN];
    stream.read_exact(&mut buf).await?;
    HandshakeRecord::decode(&buf).verify(secret, unix_now())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"correct horse";

    #[tokio::test]
    async fn test_responder_accepts_initiator() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let sent = authenticate_as_initiator(&mut client, SECRET).await.unwrap();
        let received = authenticate_as_responder(&mut server, SECRET).await.unwrap();

        assert_eq!(sent, received);
    }

    #[test]
    fn test_fresh_records_within_window_verify() {
        let now = 1_700_000_000;
        for offset in [-30i64, -29, -1, 0, 1, 29, 30] {
            let record = HandshakeRecord::new(now + offset, [3u8; BLOCK_SIZE], SECRET);
            let negotiated = record.verify(SECRET, now).unwrap();
            assert_eq!(negotiated.timestamp, now + offset);
            assert_eq!(negotiated.iv, [3u8; BLOCK_SIZE]);
        }
    }

    #[test]
    fn test_stale_or_future_records_rejected() {
        let now = 1_700_000_000;
        for offset in [-31i64, -3600, 31, 3600] {
            let record = HandshakeRecord::new(now + offset, [0u8; BLOCK_SIZE], SECRET);
            match record.verify(SECRET, now) {
                Err(HandshakeError::ReplayOrClockSkew { skew_secs }) => {
                    assert_eq!(skew_secs, -offset);
                }
                other => panic!("expected clock skew error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_skew_checked_before_digest() {
        let now = 1_700_000_000;
        let record = HandshakeRecord::new(now - 120, [0u8; BLOCK_SIZE], b"other secret");
        assert!(matches!(
            record.verify(SECRET, now),
            Err(HandshakeError::ReplayOrClockSkew { .. })
        ));
    }

    #[test]
    fn test_tampered_digest_rejected() {
        let now = unix_now();
        let mut record = HandshakeRecord::new(now, [9u8; BLOCK_SIZE], SECRET);
        record.digest[0] ^= 0x01;
        assert!(matches!(
            record.verify(SECRET, now),
            Err(HandshakeError::AuthFailure)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = unix_now();
        let record = HandshakeRecord::new(now, [9u8; BLOCK_SIZE], b"guess");
        assert!(matches!(
            record.verify(SECRET, now),
            Err(HandshakeError::AuthFailure)
        ));
    }

    #[test]
    fn test_record_layout() {
        let record = HandshakeRecord::new(0x0102030405060708, [0xAA; BLOCK_SIZE], SECRET);
        let wire = record.encode();
        assert_eq!(wire.len(), 56);
        assert_eq!(&wire[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[8..24], &[0xAA; 16]);
        assert_eq!(HandshakeRecord::decode(&wire), record);
    }

    #[tokio::test]
    async fn test_short_record_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0u8; 10]).await.unwrap();
        drop(client);

        let err = authenticate_as_responder(&mut server, SECRET).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Io(_)));
    }
}
