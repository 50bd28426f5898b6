//! Bootstrap connection sequence for a newly launched node.
//!
//! One [`NodeBootstrap`] drives one node from "just launched" to an
//! authenticated session: poll for a routable address, connect, verify the
//! presented host key, authenticate. Transient trouble (no address yet,
//! connection refused, blank console) is retried on a configurable cadence;
//! trust violations quarantine the node and stop the sequence immediately.
//!
//! Sequences for different nodes run as independent tasks; the only state
//! they share is the [`HostKeyStore`] and the [`OfflineMarker`].

mod auth;
mod retry;

pub use auth::{BootstrapAuthenticator, ReopenFuture};
pub use retry::BackoffPolicy;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cloud::{CloudInstance, InstanceState, UNROUTABLE_ADDR};
use crate::error::{BootstrapError, CloudError, TransportError};
use crate::quarantine::OfflineMarker;
use crate::store::HostKeyStore;
use crate::transport::{Credential, PendingSession, Session, Transport};
use crate::trust::{HostKey, KEY_CHECK_FAILED, VerificationAction, VerificationStrategy};

/// Tuning for one bootstrap sequence. Defaults are embedded; override per
/// call with [`NodeBootstrap::with_config`].
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Overall deadline for reaching a trusted, connected session. `None`
    /// retries indefinitely — used during early boot when the real timeout
    /// is not yet known.
    pub launch_timeout: Option<Duration>,
    /// Timeout for a single transport-level connect attempt.
    pub connect_timeout: Duration,
    /// Pause between transient connection attempts.
    pub retry: BackoffPolicy,
    /// Maximum public-key authentication attempts.
    pub auth_tries: u32,
    /// Pause between authentication attempts.
    pub auth_retry_interval: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            launch_timeout: None,
            connect_timeout: Duration::from_secs(10),
            retry: BackoffPolicy::default(),
            auth_tries: 30,
            auth_retry_interval: Duration::from_secs(30),
        }
    }
}

/// Where a bootstrap sequence currently is. Verification always
/// happens-before authentication, which happens-before hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapPhase {
    Connecting,
    Verifying,
    Authenticating,
    Established,
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BootstrapPhase::Connecting => "connecting",
            BootstrapPhase::Verifying => "verifying",
            BootstrapPhase::Authenticating => "authenticating",
            BootstrapPhase::Established => "established",
        };
        f.write_str(name)
    }
}

/// A single node's bootstrap sequence.
pub struct NodeBootstrap {
    node: String,
    port: u16,
    user: String,
    credential: Credential,
    strategy: VerificationStrategy,
    instance: Arc<dyn CloudInstance>,
    transport: Arc<dyn Transport>,
    store: Arc<HostKeyStore>,
    offline: Arc<dyn OfflineMarker>,
    config: BootstrapConfig,
    cancel: CancellationToken,
}

impl NodeBootstrap {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        credential: Credential,
        strategy: VerificationStrategy,
        instance: Arc<dyn CloudInstance>,
        transport: Arc<dyn Transport>,
        store: Arc<HostKeyStore>,
        offline: Arc<dyn OfflineMarker>,
    ) -> Self {
        Self {
            node: node.into(),
            port,
            user: user.into(),
            credential,
            strategy,
            instance,
            transport,
            store,
            offline,
            config: BootstrapConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: BootstrapConfig) -> Self {
        self.config = config;
        self
    }

    /// Token that aborts the sequence promptly from outside, e.g. when the
    /// node is deleted or the controller shuts down. Cancellation wins over
    /// any sleep in progress, and no verification side effects run after it
    /// is observed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the sequence to completion: an authenticated session ready for
    /// the agent launch, or a terminal error.
    pub async fn run(self) -> Result<Box<dyn Session>, BootstrapError> {
        tracing::info!(node = %self.node, instance = self.instance.id(), "bootstrap starting");
        let started = Instant::now();

        let (session, pinned) = self.connect_trusted(started).await?;

        tracing::info!(node = %self.node, phase = %BootstrapPhase::Authenticating, user = %self.user, "host key trusted");
        let authenticator =
            BootstrapAuthenticator::new(self.config.auth_tries, self.config.auth_retry_interval);
        let reopen = reopener(
            self.transport.clone(),
            self.instance.clone(),
            self.port,
            self.config.connect_timeout,
            pinned,
        );
        let authenticated = authenticator
            .authenticate(session, reopen, &self.user, &self.credential, &self.cancel)
            .await?;

        match authenticated {
            Some(session) => {
                tracing::info!(node = %self.node, phase = %BootstrapPhase::Established, "bootstrap complete");
                Ok(session)
            }
            None => Err(BootstrapError::AuthExhausted {
                tries: self.config.auth_tries,
            }),
        }
    }

    /// The connect/verify retry loop. Returns an established session whose
    /// host key was accepted by the strategy, plus the pinned key itself.
    async fn connect_trusted(
        &self,
        started: Instant,
    ) -> Result<(Box<dyn Session>, HostKey), BootstrapError> {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(BootstrapError::Cancelled);
            }

            // A node whose trust already failed is not contacted again.
            if let Some(reason) = self.offline.quarantine_reason(&self.node) {
                if reason.starts_with(KEY_CHECK_FAILED) {
                    tracing::warn!(node = %self.node, %reason, "node is quarantined; giving up");
                    return Err(BootstrapError::Quarantined {
                        node: self.node.clone(),
                        reason,
                    });
                }
            }

            self.check_deadline(started)?;

            if self.instance.state().await? == InstanceState::Terminated {
                return Err(CloudError::Terminated(self.instance.id().to_string()).into());
            }

            let host = self.instance.address().await?;
            if host.is_empty() || host == UNROUTABLE_ADDR {
                tracing::info!(
                    node = %self.node,
                    instance = self.instance.id(),
                    "instance has no routable address yet; waiting"
                );
                self.pause(attempt).await?;
                attempt += 1;
                continue;
            }

            tracing::info!(
                node = %self.node,
                phase = %BootstrapPhase::Connecting,
                %host,
                port = self.port,
                "connecting"
            );
            let pending = match self
                .transport
                .connect(&host, self.port, self.config.connect_timeout)
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::info!(node = %self.node, "failed to connect: {e}; waiting for it to come up");
                    self.pause(attempt).await?;
                    attempt += 1;
                    continue;
                }
            };

            match self.verify_pending(pending).await? {
                VerifiedConnect::Trusted(session, pinned) => return Ok((session, pinned)),
                VerifiedConnect::RetryLater => {
                    self.pause(attempt).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Verify the key a pending connection presented and either finish the
    /// handshake or tear the attempt down.
    async fn verify_pending(
        &self,
        pending: Box<dyn PendingSession>,
    ) -> Result<VerifiedConnect, BootstrapError> {
        // Cancellation observed here must not reach the strategy: no key is
        // persisted and no node quarantined on behalf of a dead sequence.
        if self.cancel.is_cancelled() {
            pending.abort().await;
            return Err(BootstrapError::Cancelled);
        }

        tracing::info!(
            node = %self.node,
            phase = %BootstrapPhase::Verifying,
            key = %pending.server_key(),
            "verifying presented host key"
        );
        let outcome = match self
            .strategy
            .verify(
                &self.node,
                pending.server_key(),
                self.instance.as_ref(),
                &self.store,
                self.offline.as_ref(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(node = %self.node, "unable to check the server key: {e}");
                pending.abort().await;
                return Ok(VerifiedConnect::RetryLater);
            }
        };

        if !outcome.is_trusted() {
            pending.abort().await;
            return match outcome.into_action() {
                VerificationAction::Quarantine(reason) => Err(BootstrapError::Quarantined {
                    node: self.node.clone(),
                    reason,
                }),
                _ => Ok(VerifiedConnect::RetryLater),
            };
        }

        let pinned = pending.server_key().clone();
        match pending.proceed().await {
            Ok(session) => Ok(VerifiedConnect::Trusted(session, pinned)),
            Err(e) => {
                tracing::info!(node = %self.node, "connection lost while completing the handshake: {e}");
                Ok(VerifiedConnect::RetryLater)
            }
        }
    }

    fn check_deadline(&self, started: Instant) -> Result<(), BootstrapError> {
        let Some(limit) = self.config.launch_timeout else {
            return Ok(());
        };
        let elapsed = started.elapsed();
        if elapsed > limit {
            return Err(BootstrapError::TimedOut {
                elapsed_secs: elapsed.as_secs(),
                limit_secs: limit.as_secs(),
            });
        }
        Ok(())
    }

    async fn pause(&self, attempt: u32) -> Result<(), BootstrapError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BootstrapError::Cancelled),
            _ = tokio::time::sleep(self.config.retry.delay(attempt)) => Ok(()),
        }
    }
}

enum VerifiedConnect {
    Trusted(Box<dyn Session>, HostKey),
    RetryLater,
}

/// Session factory for authentication retries. Reconnects and requires the
/// server to present the key pinned earlier in this sequence — a mismatch
/// fails the attempt without re-entering the verification strategy.
fn reopener(
    transport: Arc<dyn Transport>,
    instance: Arc<dyn CloudInstance>,
    port: u16,
    connect_timeout: Duration,
    pinned: HostKey,
) -> impl FnMut() -> ReopenFuture + Send {
    move || {
        let transport = transport.clone();
        let instance = instance.clone();
        let pinned = pinned.clone();
        Box::pin(async move {
            let host = instance
                .address()
                .await
                .map_err(|e| TransportError::AddressUnavailable(e.to_string()))?;
            if host.is_empty() || host == UNROUTABLE_ADDR {
                return Err(TransportError::AddressUnavailable(host));
            }

            let pending = transport.connect(&host, port, connect_timeout).await?;
            if pending.server_key() != &pinned {
                let reason = format!(
                    "server key changed during bootstrap: expected {}, got {}",
                    pinned.fingerprint(),
                    pending.server_key().fingerprint(),
                );
                pending.abort().await;
                return Err(TransportError::HostKeyRejected(reason));
            }
            pending.proceed().await
        })
    }
}
