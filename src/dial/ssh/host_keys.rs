//! Host key allow-list
//!
//! Entries are authorized_keys-style lines (`ssh-ed25519 AAAA... comment`).
//! The presented key must match the key data of one entry. An empty list
//! accepts any host key.

use russh::keys::{parse_public_key_base64, PublicKey, PublicKeyBase64};
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::dial::DialError;

#[derive(Debug, Clone, Default)]
pub struct HostKeyPolicy {
    allowed: Vec<PublicKey>,
}

impl HostKeyPolicy {
    /// Accept whatever key the server presents
    pub fn accept_any() -> Self {
        Self::default()
    }

    pub fn from_authorized_keys<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed = entries
            .into_iter()
            .map(|entry| parse_entry(entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { allowed })
    }

    pub fn is_permissive(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn verify(&self, presented: &PublicKey) -> Result<(), DialError> {
        let key_type = presented.algorithm();
        if self.allowed.is_empty() {
            debug!("No host key allow-list configured, accepting {} key", key_type.as_str());
            return Ok(());
        }
        // Comments are not part of the identity
        if self
            .allowed
            .iter()
            .any(|entry| entry.key_data() == presented.key_data())
        {
            debug!("Host key verified ({})", key_type.as_str());
            return Ok(());
        }

        let key_base64 = presented.public_key_base64();
        warn!("Host key mismatch, server sent {} {}", key_type.as_str(), key_base64);
        Err(DialError::HostKeyMismatch {
            key_type: key_type.as_str().to_string(),
            key_base64,
        })
    }
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-") || token.starts_with("sk-")
}

fn parse_entry(entry: &str) -> Result<PublicKey, ConfigError> {
    let invalid = |reason: String| ConfigError::HostKey {
        entry: entry.to_string(),
        reason,
    };

    // Options and comments around the key are skipped
    let tokens: Vec<&str> = entry.split_whitespace().collect();
    let (declared_type, encoded) = match tokens.iter().position(|t| is_key_type(t)) {
        Some(idx) => (
            Some(tokens[idx]),
            *tokens
                .get(idx + 1)
                .ok_or_else(|| invalid("missing key data".into()))?,
        ),
        None => (
            None,
            *tokens.first().ok_or_else(|| invalid("empty entry".into()))?,
        ),
    };

    let key = parse_public_key_base64(encoded).map_err(|e| invalid(e.to_string()))?;

    if let Some(declared) = declared_type {
        let actual = key.algorithm();
        if declared != actual.as_str() {
            return Err(invalid(format!(
                "declared type {} does not match key type {}",
                declared,
                actual.as_str()
            )));
        }
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    const JUMP_HOST_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    fn ssh_string(out: &mut Vec<u8>, data: &[u8]) {
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(data);
    }

    fn ed25519_key(fill: u8) -> String {
        let mut blob = Vec::new();
        ssh_string(&mut blob, b"ssh-ed25519");
        ssh_string(&mut blob, &[fill; 32]);
        BASE64.encode(blob)
    }

    fn presented(encoded: &str) -> PublicKey {
        parse_public_key_base64(encoded).unwrap()
    }

    #[test]
    fn test_empty_allow_list_accepts_anything() {
        let policy = HostKeyPolicy::accept_any();
        assert!(policy.is_permissive());
        assert!(policy.verify(&presented(&ed25519_key(1))).is_ok());
    }

    #[test]
    fn test_listed_key_accepted() {
        let line = format!("ssh-ed25519 {} admin@jump", JUMP_HOST_KEY);
        let policy = HostKeyPolicy::from_authorized_keys([line]).unwrap();
        assert!(policy.verify(&presented(JUMP_HOST_KEY)).is_ok());
    }

    #[test]
    fn test_unlisted_key_rejected_with_details() {
        let policy = HostKeyPolicy::from_authorized_keys([
            format!("ssh-ed25519 {}", ed25519_key(1)),
            format!("ssh-ed25519 {} second", ed25519_key(2)),
        ])
        .unwrap();

        let other = ed25519_key(3);
        match policy.verify(&presented(&other)) {
            Err(DialError::HostKeyMismatch { key_type, key_base64 }) => {
                assert_eq!(key_type, "ssh-ed25519");
                assert_eq!(key_base64, other);
            }
            other => panic!("expected host key mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_base64_entry() {
        let policy = HostKeyPolicy::from_authorized_keys([JUMP_HOST_KEY]).unwrap();
        assert!(policy.verify(&presented(JUMP_HOST_KEY)).is_ok());
    }

    #[test]
    fn test_malformed_entries_rejected() {
        assert!(HostKeyPolicy::from_authorized_keys(["ssh-ed25519"]).is_err());
        assert!(HostKeyPolicy::from_authorized_keys(["ssh-ed25519 !!!notbase64"]).is_err());
        assert!(HostKeyPolicy::from_authorized_keys([""]).is_err());

        let mislabeled = format!("ssh-rsa {}", JUMP_HOST_KEY);
        assert!(HostKeyPolicy::from_authorized_keys([mislabeled]).is_err());
    }

    #[test]
    fn test_structurally_invalid_key_rejected() {
        // Well-formed base64, but the ed25519 key is one byte short
        let mut blob = Vec::new();
        ssh_string(&mut blob, b"ssh-ed25519");
        ssh_string(&mut blob, &[7u8; 31]);
        let line = format!("ssh-ed25519 {}", BASE64.encode(blob));
        assert!(matches!(
            HostKeyPolicy::from_authorized_keys([line]),
            Err(ConfigError::HostKey { .. })
        ));
    }
}
