//! Host key verification strategies.
//!
//! Every strategy shares one non-negotiable prefix: if a trusted key is
//! already stored for the node and the presented key differs, the node is
//! quarantined — a changed key is treated as a potential man-in-the-middle
//! attack and is never silently updated. The strategies only diverge on
//! first contact, when no key has been stored yet.

use std::time::Duration;

use crate::cloud::{CloudInstance, InstanceState};
use crate::error::TrustError;
use crate::quarantine::OfflineMarker;
use crate::store::HostKeyStore;

use super::console::{ConsoleScan, scan_console};
use super::host_key::HostKey;
use super::static_keys::StaticKeySet;

/// Stable prefix of every quarantine reason set by a verification strategy.
/// The bootstrap retry loop matches on it to stop reconnecting to a node
/// whose trust has failed.
pub const KEY_CHECK_FAILED: &str = "host key check failed";

/// How long after launch a console-checked instance gets to print its host
/// key before CheckHard stops waiting for it.
pub const CONSOLE_KEY_GRACE: Duration = Duration::from_secs(120);

/// Side effect a verify call performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationAction {
    None,
    /// The presented key was persisted as the node's trusted key.
    Persist(HostKey),
    /// The node was marked offline with this reason.
    Quarantine(String),
}

/// Result of a single verify call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    trusted: bool,
    action: VerificationAction,
}

impl VerificationOutcome {
    fn trusted(action: VerificationAction) -> Self {
        Self {
            trusted: true,
            action,
        }
    }

    fn untrusted(action: VerificationAction) -> Self {
        Self {
            trusted: false,
            action,
        }
    }

    /// Whether the presented key is trusted and the connection may proceed.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn action(&self) -> &VerificationAction {
        &self.action
    }

    pub fn into_action(self) -> VerificationAction {
        self.action
    }

    /// Whether this outcome quarantined the node. Quarantine is terminal for
    /// the bootstrap sequence; retrying is pointless.
    pub fn is_quarantined(&self) -> bool {
        matches!(self.action, VerificationAction::Quarantine(_))
    }
}

/// Policy for deciding whether a presented host key belongs to the instance
/// that was actually launched.
#[derive(Debug, Clone)]
pub enum VerificationStrategy {
    /// Trust every key; keep no state and never quarantine.
    Off,
    /// Trust and pin the first key presented (classic trust-on-first-use).
    AcceptNew,
    /// Check the first key against the instance console; a console that
    /// never prints the key is tolerated and the key accepted anyway.
    CheckSoft,
    /// Check the first key against the instance console; a console that
    /// never prints the key within [`CONSOLE_KEY_GRACE`] of boot is fatal.
    CheckHard,
    /// Trust only keys present in an operator-configured list.
    StaticList(StaticKeySet),
}

impl VerificationStrategy {
    /// Decide whether `presented` is trusted for `node`.
    ///
    /// Consults the stored trusted key first, then (depending on the
    /// variant) the instance console. Persists the key or quarantines the
    /// node as a side effect; the returned outcome records what happened.
    pub async fn verify(
        &self,
        node: &str,
        presented: &HostKey,
        instance: &dyn CloudInstance,
        store: &HostKeyStore,
        offline: &dyn OfflineMarker,
    ) -> Result<VerificationOutcome, TrustError> {
        if let Some(outcome) = check_stored_key(node, presented, store, offline)? {
            return Ok(outcome);
        }

        // First contact: no trusted key stored for this node yet.
        match self {
            VerificationStrategy::Off => {
                tracing::info!(
                    node,
                    key = %presented,
                    "no host key verification configured for this connection"
                );
                Ok(VerificationOutcome::trusted(VerificationAction::None))
            }
            VerificationStrategy::AcceptNew => {
                store.save(node, presented)?;
                tracing::info!(
                    node,
                    key = %presented,
                    "host key automatically trusted for future connections"
                );
                Ok(VerificationOutcome::trusted(VerificationAction::Persist(
                    presented.clone(),
                )))
            }
            VerificationStrategy::CheckSoft => {
                check_against_console(node, presented, instance, store, offline, Leniency::Soft)
                    .await
            }
            VerificationStrategy::CheckHard => {
                check_against_console(node, presented, instance, store, offline, Leniency::Hard)
                    .await
            }
            VerificationStrategy::StaticList(keys) => {
                check_against_static_list(node, presented, keys, store, offline)
            }
        }
    }
}

/// Shared prefix of every strategy: compare against the stored trusted key.
/// Returns `None` when no key is stored and the variant-specific first
/// contact policy must decide.
fn check_stored_key(
    node: &str,
    presented: &HostKey,
    store: &HostKeyStore,
    offline: &dyn OfflineMarker,
) -> Result<Option<VerificationOutcome>, TrustError> {
    let Some(existing) = store.get(node)? else {
        return Ok(None);
    };

    if existing == *presented {
        tracing::info!(node, "connection allowed after the host key has been verified");
        return Ok(Some(VerificationOutcome::trusted(VerificationAction::None)));
    }

    let reason = format!(
        "{KEY_CHECK_FAILED}: the key ({}) presented by the instance has changed since first \
         saved ({}); the connection is closed to prevent a possible man-in-the-middle attack",
        presented.fingerprint(),
        existing.fingerprint(),
    );
    tracing::warn!(node, %reason);
    offline.set_quarantined(node, &reason);
    Ok(Some(VerificationOutcome::untrusted(
        VerificationAction::Quarantine(reason),
    )))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Leniency {
    Soft,
    Hard,
}

async fn check_against_console(
    node: &str,
    presented: &HostKey,
    instance: &dyn CloudInstance,
    store: &HostKeyStore,
    offline: &dyn OfflineMarker,
    leniency: Leniency,
) -> Result<VerificationOutcome, TrustError> {
    match instance.state().await {
        Ok(state) if state != InstanceState::Running => {
            tracing::info!(
                node,
                instance = instance.id(),
                %state,
                "instance is not running; waiting to validate the key against the console"
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(node, "could not determine instance state: {e}");
        }
    }

    let console = instance.console_output().await?;
    match scan_console(console.as_deref(), presented.algorithm()) {
        ConsoleScan::Found(console_key) if console_key == *presented => {
            store.save(node, presented)?;
            tracing::info!(
                node,
                key = %presented,
                "host key successfully checked against the instance console"
            );
            Ok(VerificationOutcome::trusted(VerificationAction::Persist(
                presented.clone(),
            )))
        }
        ConsoleScan::Found(console_key) => {
            let reason = format!(
                "{KEY_CHECK_FAILED}: the key ({}) presented by the instance is different from \
                 the one printed on the instance console ({}); the connection is closed to \
                 prevent a possible man-in-the-middle attack",
                presented.fingerprint(),
                console_key.fingerprint(),
            );
            tracing::warn!(node, %reason);
            offline.set_quarantined(node, &reason);
            Ok(VerificationOutcome::untrusted(
                VerificationAction::Quarantine(reason),
            ))
        }
        ConsoleScan::Blank => {
            tracing::info!(
                node,
                "instance console is blank; cannot check the key yet, connection not allowed"
            );
            Ok(VerificationOutcome::untrusted(VerificationAction::None))
        }
        ConsoleScan::NotFound if leniency == Leniency::Soft => {
            store.save(node, presented)?;
            tracing::warn!(
                node,
                key = %presented,
                "host key not found on the instance console; cannot check the key but the \
                 connection is allowed"
            );
            Ok(VerificationOutcome::trusted(VerificationAction::Persist(
                presented.clone(),
            )))
        }
        ConsoleScan::NotFound => {
            tracing::info!(
                node,
                key = %presented,
                "host key not found on the instance console; connection not allowed"
            );
            let grace_expired = match instance.uptime().await {
                Ok(uptime) => uptime >= CONSOLE_KEY_GRACE,
                Err(e) => {
                    // Unknown uptime counts as "not yet elapsed": keep
                    // retrying rather than condemning the node early.
                    tracing::debug!(node, "could not determine instance uptime: {e}");
                    false
                }
            };
            if grace_expired {
                let reason = format!(
                    "{KEY_CHECK_FAILED}: the instance console did not print the host key within \
                     {} seconds of launch",
                    CONSOLE_KEY_GRACE.as_secs(),
                );
                tracing::warn!(node, %reason);
                offline.set_quarantined(node, &reason);
                Ok(VerificationOutcome::untrusted(
                    VerificationAction::Quarantine(reason),
                ))
            } else {
                Ok(VerificationOutcome::untrusted(VerificationAction::None))
            }
        }
    }
}

fn check_against_static_list(
    node: &str,
    presented: &HostKey,
    keys: &StaticKeySet,
    store: &HostKeyStore,
    offline: &dyn OfflineMarker,
) -> Result<VerificationOutcome, TrustError> {
    if keys.is_empty() {
        let reason = format!("{KEY_CHECK_FAILED}: no valid static host keys configured");
        tracing::warn!(node, %reason);
        offline.set_quarantined(node, &reason);
        return Ok(VerificationOutcome::untrusted(
            VerificationAction::Quarantine(reason),
        ));
    }

    if keys.contains(presented) {
        store.save(node, presented)?;
        tracing::info!(
            node,
            key = %presented,
            "host key matched a configured static host key"
        );
        return Ok(VerificationOutcome::trusted(VerificationAction::Persist(
            presented.clone(),
        )));
    }

    let reason = format!(
        "{KEY_CHECK_FAILED}: the key ({}) presented by the instance does not match any of the \
         {} configured static host keys",
        presented.fingerprint(),
        keys.len(),
    );
    tracing::warn!(node, %reason);
    offline.set_quarantined(node, &reason);
    Ok(VerificationOutcome::untrusted(
        VerificationAction::Quarantine(reason),
    ))
}
