//! Cloud provider collaborators.
//!
//! The crate never talks to a provider control plane directly; everything it
//! needs from the instance lifecycle API comes through [`CloudInstance`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CloudError;

/// Address reported by providers while an instance has no routable IP yet.
pub const UNROUTABLE_ADDR: &str = "0.0.0.0";

/// Provider-side lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A launched compute instance as seen through the provider API.
#[async_trait]
pub trait CloudInstance: Send + Sync {
    /// Provider-assigned identifier, used in logs and error messages.
    fn id(&self) -> &str;

    async fn state(&self) -> Result<InstanceState, CloudError>;

    /// Decoded boot console output, or `None` while the provider has not
    /// produced any yet.
    async fn console_output(&self) -> Result<Option<String>, CloudError>;

    /// Time elapsed since the instance was launched.
    async fn uptime(&self) -> Result<Duration, CloudError>;

    /// Routable address of the instance. May be empty or [`UNROUTABLE_ADDR`]
    /// while the provider is still assigning one.
    async fn address(&self) -> Result<String, CloudError>;
}
