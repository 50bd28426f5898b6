//! Host key trust model.
//!
//! Provides the host key value type, the console scanner that recovers a key
//! from instance boot output, and the verification strategies deciding
//! whether a presented key belongs to the instance we launched.

pub mod console;
pub mod host_key;
pub mod static_keys;
pub mod strategy;

pub use console::{ConsoleScan, scan_console};
pub use host_key::HostKey;
pub use static_keys::StaticKeySet;
pub use strategy::{
    KEY_CHECK_FAILED, VerificationAction, VerificationOutcome, VerificationStrategy,
};
