//! Operator-supplied static host keys.

use data_encoding::BASE64;

use super::host_key::HostKey;

/// A fixed set of host keys configured by an operator, parsed from a
/// newline-delimited text blob of `algorithm base64key [comment]` lines.
#[derive(Debug, Clone, Default)]
pub struct StaticKeySet {
    keys: Vec<HostKey>,
}

impl StaticKeySet {
    /// Parse the configuration blob. Malformed lines are logged and
    /// skipped; parsing never fails.
    pub fn parse(text: &str) -> Self {
        let mut keys = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 || parts.len() > 3 {
                tracing::warn!(line, "invalid static host key line, skipping");
                continue;
            }

            match BASE64.decode(parts[1].as_bytes()) {
                Ok(bytes) => match HostKey::new(parts[0], bytes) {
                    Ok(key) => keys.push(key),
                    Err(e) => tracing::warn!(line, "invalid static host key line: {e}"),
                },
                Err(e) => tracing::warn!(line, "static host key is not valid base64: {e}"),
            }
        }

        Self { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, key: &HostKey) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    pub fn keys(&self) -> &[HostKey] {
        &self.keys
    }
}
