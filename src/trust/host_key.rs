//! The public key a remote endpoint presents to prove its identity.

use data_encoding::{BASE64, BASE64_NOPAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TrustError;

/// An SSH host key: algorithm name plus the raw key blob.
///
/// Immutable once constructed. Equality is structural over both fields and
/// compares the full key bytes; the fingerprint exists for display and
/// logging only and is never consulted for trust decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostKey {
    algorithm: String,
    #[serde(with = "base64_bytes")]
    key: Vec<u8>,
}

impl HostKey {
    /// Build a key from an algorithm name (e.g. `ssh-ed25519`) and the raw
    /// key blob. The algorithm must be non-empty.
    pub fn new(algorithm: impl Into<String>, key: impl Into<Vec<u8>>) -> Result<Self, TrustError> {
        let algorithm = algorithm.into();
        if algorithm.trim().is_empty() {
            return Err(TrustError::InvalidKey(
                "host key algorithm must not be empty".to_string(),
            ));
        }
        Ok(Self {
            algorithm,
            key: key.into(),
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Raw key blob, without any algorithm prefix.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// OpenSSH-style SHA-256 fingerprint, for display and logging only.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.key);
        format!("SHA256:{}", BASE64_NOPAD.encode(&digest))
    }

    /// Render the key as an OpenSSH `known_hosts` line for the given host,
    /// so the pinned key can be handed to external tooling.
    pub fn known_hosts_entry(&self, host: &str) -> String {
        format!("{} {} {}", host, self.algorithm, BASE64.encode(&self.key))
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.algorithm, self.fingerprint())
    }
}

mod base64_bytes {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| D::Error::custom(format!("invalid base64 key: {e}")))
    }
}
