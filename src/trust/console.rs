//! Extracting a host key from instance console output.
//!
//! Cloud providers echo the instance boot log out of band; images commonly
//! print their SSH host keys there, which gives us a second channel to check
//! a presented key against that does not ride the network path being
//! verified.

use data_encoding::BASE64;

use super::host_key::HostKey;

/// Result of scanning console text for a host key.
///
/// `Blank` and `NotFound` are deliberately distinct: a blank console means
/// the instance has not produced output yet and the caller should retry
/// later, while `NotFound` means the console is populated but never printed
/// a key for the requested algorithm. The verification strategies attach
/// materially different policies to the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleScan {
    /// No console output available yet.
    Blank,
    /// Console has output but no key line for the requested algorithm.
    NotFound,
    /// A key line for the requested algorithm was parsed.
    Found(HostKey),
}

/// Scan console text for the first line whose first token equals
/// `algorithm` and decode the second token as a standard-base64 key blob.
///
/// Malformed matches (missing key token, undecodable base64) are logged and
/// reported as [`ConsoleScan::NotFound`]; a scan never fails.
pub fn scan_console(console: Option<&str>, algorithm: &str) -> ConsoleScan {
    let Some(console) = console else {
        return ConsoleScan::Blank;
    };

    for line in console.lines() {
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            continue;
        };
        if first != algorithm {
            continue;
        }

        let Some(encoded) = tokens.next() else {
            tracing::warn!(
                algorithm,
                line,
                "console key line is missing the key itself; expected \"ALGORITHM BASE64KEY\""
            );
            return ConsoleScan::NotFound;
        };

        return match BASE64.decode(encoded.as_bytes()) {
            Ok(bytes) => match HostKey::new(algorithm, bytes) {
                Ok(key) => ConsoleScan::Found(key),
                Err(e) => {
                    tracing::warn!(algorithm, "unusable console key line: {e}");
                    ConsoleScan::NotFound
                }
            },
            Err(e) => {
                tracing::warn!(
                    algorithm,
                    line,
                    "console key line is not valid base64: {e}"
                );
                ConsoleScan::NotFound
            }
        };
    }

    ConsoleScan::NotFound
}
