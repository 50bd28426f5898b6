//! Bounded public-key authentication during bootstrap.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{BootstrapError, TransportError};
use crate::transport::{Credential, Session};

/// Future that opens a fresh, already-verified session for a retry.
pub type ReopenFuture = BoxFuture<'static, Result<Box<dyn Session>, TransportError>>;

/// Attempts public-key authentication with bounded retries.
///
/// A session that failed to authenticate is discarded, never reused; every
/// retry runs on a fresh session from the `reopen` factory. Exhausting the
/// tries is not an error here — the caller decides whether it is fatal.
/// There is no fallback to password authentication.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapAuthenticator {
    max_tries: u32,
    retry_interval: Duration,
}

impl BootstrapAuthenticator {
    pub fn new(max_tries: u32, retry_interval: Duration) -> Self {
        Self {
            max_tries,
            retry_interval,
        }
    }

    /// Authenticate `user` with `credential`, starting on `session`.
    ///
    /// Returns `Ok(None)` when every try was rejected; `Err` only for
    /// cancellation.
    pub async fn authenticate<F>(
        &self,
        session: Box<dyn Session>,
        mut reopen: F,
        user: &str,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<Option<Box<dyn Session>>, BootstrapError>
    where
        F: FnMut() -> ReopenFuture + Send,
    {
        let mut current = Some(session);

        for attempt in 1..=self.max_tries {
            if cancel.is_cancelled() {
                if let Some(stale) = current.take() {
                    stale.close().await;
                }
                return Err(BootstrapError::Cancelled);
            }

            let mut session = match current.take() {
                Some(session) => session,
                None => match reopen().await {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(
                            attempt,
                            "could not open a fresh session for authentication: {e}"
                        );
                        self.pause(cancel).await?;
                        continue;
                    }
                },
            };

            tracing::info!(attempt, user, "authenticating");
            match session.authenticate(user, credential).await {
                Ok(true) => return Ok(Some(session)),
                Ok(false) => {
                    tracing::warn!(attempt, user, "authentication rejected; trying again")
                }
                Err(e) => tracing::warn!(attempt, "exception trying to authenticate: {e}"),
            }
            session.close().await;

            if attempt < self.max_tries {
                self.pause(cancel).await?;
            }
        }

        tracing::warn!(
            tries = self.max_tries,
            user,
            "authentication failed on every attempt"
        );
        Ok(None)
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), BootstrapError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(BootstrapError::Cancelled),
            _ = tokio::time::sleep(self.retry_interval) => Ok(()),
        }
    }
}
