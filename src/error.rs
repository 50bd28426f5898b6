use thiserror::Error;

/// Host key trust errors
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Invalid host key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Trusted-key storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key storage unavailable for node '{node}': {reason}")]
    Unavailable { node: String, reason: String },

    #[error("Failed to read key record for node '{node}': {source}")]
    ReadRecord {
        node: String,
        source: std::io::Error,
    },

    #[error("Failed to write key record for node '{node}': {source}")]
    WriteRecord {
        node: String,
        source: std::io::Error,
    },

    #[error("Malformed key record for node '{node}': {reason}")]
    MalformedRecord { node: String, reason: String },
}

/// Cloud provider lookup errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Instance {0} is already terminated")]
    Terminated(String),

    #[error("Cloud API error: {0}")]
    Api(String),
}

/// Transport-level errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed to {host}:{port}: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Timeout connecting to {0}")]
    ConnectTimeout(String),

    #[error("No routable address for the target: {0}")]
    AddressUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("ssh error: {0}")]
    Ssh(String),
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        TransportError::Ssh(err.to_string())
    }
}

/// Errors terminating a bootstrap sequence
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Node '{node}' is quarantined: {reason}")]
    Quarantined { node: String, reason: String },

    #[error(
        "Timed out after {elapsed_secs} seconds of waiting for the connection to become available \
         (maximum timeout configured is {limit_secs} seconds)"
    )]
    TimedOut { elapsed_secs: u64, limit_secs: u64 },

    #[error("Authentication failed after {tries} attempts")]
    AuthExhausted { tries: u32 },

    #[error("Bootstrap cancelled")]
    Cancelled,

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
