//! Abstract connection transports.
//!
//! The bootstrap sequence is transport-agnostic: anything that can open a
//! connection, present the server's host key *before* the handshake is
//! committed, authenticate and run commands can carry an agent. The SSH
//! implementation lives in [`ssh`]; a WinRM implementation plugs in at the
//! same seam.
//!
//! Connecting yields a [`PendingSession`] rather than a finished session:
//! the caller inspects the presented server key, runs verification, and
//! only then calls `proceed()` (or `abort()`). This keeps the verification
//! contract synchronous and explicit instead of burying it in a callback.

pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::TransportError;
use crate::trust::HostKey;

/// Private key material used for public-key authentication.
///
/// Password authentication is deliberately absent: bootstrap never falls
/// back to passwords.
pub struct Credential {
    private_key_pem: SecretString,
    passphrase: Option<SecretString>,
}

impl Credential {
    pub fn from_pem(private_key_pem: SecretString) -> Self {
        Self {
            private_key_pem,
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: SecretString) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    pub(crate) fn private_key_pem(&self) -> &SecretString {
        &self.private_key_pem
    }

    pub(crate) fn passphrase(&self) -> Option<&SecretString> {
        self.passphrase.as_ref()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("private_key_pem", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Output of a remote command.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub exit_status: Option<u32>,
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Opens connections to a host and port.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a transport-level connection. Network failures (refused,
    /// unreachable, reset) and the connect timeout surface as errors; a
    /// successful return means the server presented its host key and the
    /// handshake is paused awaiting a verdict.
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn PendingSession>, TransportError>;
}

/// A connection whose handshake is paused on host key acceptance.
#[async_trait]
pub trait PendingSession: Send {
    /// The host key the server presented for this connection.
    fn server_key(&self) -> &HostKey;

    /// Accept the server key and finish the handshake.
    async fn proceed(self: Box<Self>) -> Result<Box<dyn Session>, TransportError>;

    /// Reject the server key and tear the connection down.
    async fn abort(self: Box<Self>);
}

/// An established (but not necessarily authenticated) session.
#[async_trait]
pub trait Session: Send {
    /// Attempt public-key authentication. `Ok(false)` means the server
    /// rejected the credential; errors are transport failures.
    async fn authenticate(
        &mut self,
        user: &str,
        credential: &Credential,
    ) -> Result<bool, TransportError>;

    /// Run a command on the remote host and collect its output. This is the
    /// primitive the agent launch sequence builds on.
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError>;

    async fn close(self: Box<Self>);
}
