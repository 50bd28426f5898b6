//! Node quarantine surface.
//!
//! A verification strategy that decides a node can never be trusted marks it
//! offline with a stable reason string. The bootstrap retry loop checks the
//! marker before every attempt so a distrusted node is not hammered with
//! reconnects, and operators can read the reason from the node's offline
//! cause rather than digging through logs.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Where trust decisions record that a node must not be contacted again.
pub trait OfflineMarker: Send + Sync {
    /// Mark a node offline with a stable, greppable reason.
    fn set_quarantined(&self, node: &str, reason: &str);

    /// The reason a node was quarantined, if it was.
    fn quarantine_reason(&self, node: &str) -> Option<String>;

    fn is_quarantined(&self, node: &str) -> bool {
        self.quarantine_reason(node).is_some()
    }

    /// Lift the marker, e.g. after an operator deleted the stored key.
    fn clear(&self, node: &str);
}

/// In-memory [`OfflineMarker`] keyed by node identity.
///
/// Writes for one node never block reads for another; the marker for a
/// single node has one writer at a time.
#[derive(Default)]
pub struct QuarantineList {
    entries: RwLock<HashMap<String, String>>,
}

impl QuarantineList {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OfflineMarker for QuarantineList {
    fn set_quarantined(&self, node: &str, reason: &str) {
        self.entries
            .write()
            .insert(node.to_string(), reason.to_string());
    }

    fn quarantine_reason(&self, node: &str) -> Option<String> {
        self.entries.read().get(node).cloned()
    }

    fn clear(&self, node: &str) {
        self.entries.write().remove(node);
    }
}
