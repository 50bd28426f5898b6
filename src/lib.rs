//! Gatehouse
//!
//! Establishes trust in the host identity of freshly launched cloud
//! instances and bootstraps an authenticated control connection to them.
//! The crate owns the host key trust model (five pluggable verification
//! strategies backed by a persisted per-node key store), the connection
//! retry loop that drives verification against flaky, slowly booting
//! instances, and the bounded public-key authentication that follows.
//!
//! Cloud control-plane access, durable node metadata and the wire protocol
//! are consumed through traits ([`cloud::CloudInstance`],
//! [`store::NodeStore`], [`transport::Transport`]); an SSH transport
//! adapter built on `russh` ships in [`transport::ssh`].

pub mod bootstrap;
pub mod cloud;
pub mod error;
pub mod logging;
pub mod quarantine;
pub mod store;
pub mod transport;
pub mod trust;

pub use bootstrap::{BackoffPolicy, BootstrapConfig, NodeBootstrap};
pub use error::{BootstrapError, CloudError, StoreError, TransportError, TrustError};
pub use store::HostKeyStore;
pub use trust::{HostKey, VerificationOutcome, VerificationStrategy};
