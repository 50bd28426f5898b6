//! SSH transport built on russh.
//!
//! russh surfaces the server key through a handler callback in the middle of
//! the handshake. The adapter bridges that inversion of control to the
//! [`PendingSession`] model: the handler parks the handshake on a oneshot
//! verdict channel and hands the presented key back to `connect`, which
//! returns a pending session. `proceed()`/`abort()` deliver the verdict and
//! resolve the parked handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::trust::HostKey;

use super::{Credential, ExecOutput, PendingSession, Session, Transport};

/// SSH [`Transport`] implementation.
pub struct SshTransport {
    config: Arc<client::Config>,
}

impl SshTransport {
    pub fn new(keepalive_interval: Option<Duration>) -> Self {
        let config = client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            keepalive_interval,
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(60)))
    }
}

/// The server key captured mid-handshake, plus the channel that resumes the
/// handshake once a verdict is delivered.
struct PresentedKey {
    key: HostKey,
    verdict: oneshot::Sender<bool>,
}

struct HandshakeHandler {
    key_tx: Option<oneshot::Sender<PresentedKey>>,
}

impl client::Handler for HandshakeHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let raw = server_public_key
            .to_bytes()
            .map_err(|e| TransportError::Ssh(format!("unencodable server key: {e}")))?;
        let key = HostKey::new(server_public_key.algorithm().as_str(), raw)
            .map_err(|e| TransportError::Ssh(format!("unusable server key: {e}")))?;

        let Some(key_tx) = self.key_tx.take() else {
            // A second key presentation on one connection is unexpected.
            return Ok(false);
        };

        let (verdict_tx, verdict_rx) = oneshot::channel();
        if key_tx
            .send(PresentedKey {
                key,
                verdict: verdict_tx,
            })
            .is_err()
        {
            // The pending session was dropped before deciding.
            return Ok(false);
        }

        // Park the handshake until proceed()/abort() answers.
        Ok(verdict_rx.await.unwrap_or(false))
    }
}

type HandshakeTask = JoinHandle<Result<client::Handle<HandshakeHandler>, TransportError>>;

struct SshPendingSession {
    server_key: HostKey,
    verdict: oneshot::Sender<bool>,
    handshake: HandshakeTask,
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn PendingSession>, TransportError> {
        let addr = format!("{host}:{port}");
        let started = tokio::time::Instant::now();

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout(addr.clone()))?
            .map_err(|e| TransportError::ConnectionFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        let (key_tx, key_rx) = oneshot::channel();
        let handler = HandshakeHandler {
            key_tx: Some(key_tx),
        };
        let config = self.config.clone();
        let handshake: HandshakeTask =
            tokio::spawn(async move { client::connect_stream(config, stream, handler).await });

        // The connect timeout covers TCP establishment and the handshake up
        // to key presentation.
        let remaining = timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, key_rx).await {
            Ok(Ok(presented)) => Ok(Box::new(SshPendingSession {
                server_key: presented.key,
                verdict: presented.verdict,
                handshake,
            })),
            Ok(Err(_)) => {
                // Handler dropped without presenting a key: the handshake
                // failed early. Surface its real error.
                match handshake.await {
                    Ok(Ok(_)) => Err(TransportError::Ssh(
                        "handshake completed without presenting a server key".to_string(),
                    )),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(TransportError::Ssh(format!("handshake task failed: {e}"))),
                }
            }
            Err(_) => {
                handshake.abort();
                Err(TransportError::ConnectTimeout(addr))
            }
        }
    }
}

#[async_trait]
impl PendingSession for SshPendingSession {
    fn server_key(&self) -> &HostKey {
        &self.server_key
    }

    async fn proceed(self: Box<Self>) -> Result<Box<dyn Session>, TransportError> {
        self.verdict
            .send(true)
            .map_err(|_| TransportError::Ssh("handshake went away before the verdict".to_string()))?;
        let handle = self
            .handshake
            .await
            .map_err(|e| TransportError::Ssh(format!("handshake task failed: {e}")))??;
        Ok(Box::new(SshSession { handle }))
    }

    async fn abort(self: Box<Self>) {
        let _ = self.verdict.send(false);
        // The handshake resolves with a rejection error; nothing to keep.
        let _ = self.handshake.await;
    }
}

struct SshSession {
    handle: client::Handle<HandshakeHandler>,
}

#[async_trait]
impl Session for SshSession {
    async fn authenticate(
        &mut self,
        user: &str,
        credential: &Credential,
    ) -> Result<bool, TransportError> {
        let key = resolve_credential(credential)?;
        let result = self
            .handle
            .authenticate_publickey(user, key)
            .await
            .map_err(|e| TransportError::AuthenticationFailed(e.to_string()))?;
        Ok(result.success())
    }

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Channel(format!("failed to open channel: {e}")))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Channel(format!("failed to exec '{command}': {e}")))?;

        let mut out = ExecOutput::default();
        loop {
            match channel.wait().await {
                Some(russh::ChannelMsg::Data { data }) => out.output.extend_from_slice(&data),
                Some(russh::ChannelMsg::ExtendedData { data, .. }) => {
                    out.output.extend_from_slice(&data)
                }
                Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                    out.exit_status = Some(exit_status)
                }
                Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        Ok(out)
    }

    async fn close(self: Box<Self>) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}

fn resolve_credential(credential: &Credential) -> Result<PrivateKeyWithHashAlg, TransportError> {
    let passphrase = credential.passphrase().map(|p| p.expose_secret());
    let key = russh::keys::decode_secret_key(credential.private_key_pem().expose_secret(), passphrase)
        .map_err(|e| TransportError::Credential(format!("failed to load private key: {e}")))?;

    // Only RSA keys need an explicit hash; others sign with their native
    // algorithms.
    let hash_alg = if key.algorithm().is_rsa() {
        Some(HashAlg::Sha512)
    } else {
        None
    };
    Ok(PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
}
