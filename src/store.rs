//! Per-node persistence of trusted host keys.
//!
//! A node's trusted key survives process restarts: the durable record is the
//! source of truth and an in-memory bounded cache fronts it. Writes are
//! atomic (temp file plus rename) so a concurrent reader never observes a
//! partially written record, and writes for the same node are serialized
//! while unrelated nodes proceed unblocked.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::trust::HostKey;

/// Durable per-node small-record storage, external to this crate's policy.
///
/// `write` must replace any prior content atomically.
pub trait NodeStore: Send + Sync {
    fn read(&self, node: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, node: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn remove(&self, node: &str) -> Result<(), StoreError>;
}

/// Filesystem-backed [`NodeStore`]: one directory per node under a common
/// root, with the key record in `host-key.json`.
pub struct FsNodeStore {
    root: PathBuf,
}

const RECORD_FILE: &str = "host-key.json";

impl FsNodeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Platform data directory default, e.g. `~/.local/share/gatehouse/nodes`.
    pub fn default_root() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "gatehouse")
            .map(|dirs| dirs.data_dir().join("nodes"))
    }

    fn node_dir(&self, node: &str) -> Result<PathBuf, StoreError> {
        if node.is_empty() || node.contains(['/', '\\']) || node == "." || node == ".." {
            return Err(StoreError::Unavailable {
                node: node.to_string(),
                reason: "node identity is not a valid storage name".to_string(),
            });
        }
        if !self.root.is_dir() {
            return Err(StoreError::Unavailable {
                node: node.to_string(),
                reason: format!("nodes directory {} does not exist", self.root.display()),
            });
        }
        Ok(self.root.join(node))
    }
}

impl NodeStore for FsNodeStore {
    fn read(&self, node: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.node_dir(node)?.join(RECORD_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::ReadRecord {
                node: node.to_string(),
                source: e,
            }),
        }
    }

    fn write(&self, node: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = self.node_dir(node)?;
        let io_err = |e| StoreError::WriteRecord {
            node: node.to_string(),
            source: e,
        };

        std::fs::create_dir_all(&dir).map_err(io_err)?;

        // Write-then-rename; concurrent writers for one node are already
        // serialized by HostKeyStore, so a fixed temp name is safe.
        let tmp = dir.join(format!(".{RECORD_FILE}.tmp"));
        let path = dir.join(RECORD_FILE);
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(io_err)
    }

    fn remove(&self, node: &str) -> Result<(), StoreError> {
        let path = self.node_dir(node)?.join(RECORD_FILE);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::WriteRecord {
                node: node.to_string(),
                source: e,
            }),
        }
    }
}

/// What actually lands on disk for a trusted key.
#[derive(Serialize, Deserialize)]
struct TrustedKeyRecord {
    #[serde(flatten)]
    host_key: HostKey,
    saved_at: DateTime<Utc>,
}

/// Bounded, insertion-ordered cache. Replaces GC-coupled weak maps with an
/// explicit size cap and explicit invalidation.
struct BoundedCache {
    capacity: usize,
    entries: HashMap<String, HostKey>,
    order: VecDeque<String>,
}

impl BoundedCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, node: &str) -> Option<&HostKey> {
        self.entries.get(node)
    }

    fn insert(&mut self, node: &str, key: HostKey) {
        if self.entries.insert(node.to_string(), key).is_none() {
            self.order.push_back(node.to_string());
        }
        while self.entries.len() > self.capacity {
            // Skip queue entries whose mapping was removed by invalidate().
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, node: &str) {
        self.entries.remove(node);
    }
}

pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// The per-node trusted host key store.
///
/// `get` consults the cache and falls back to durable storage; `save`
/// persists durably (atomic replace) before updating the cache. Safe for
/// concurrent use across node identities and for concurrent get/save on the
/// same identity.
pub struct HostKeyStore {
    backing: Arc<dyn NodeStore>,
    cache: RwLock<BoundedCache>,
    node_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HostKeyStore {
    pub fn new(backing: Arc<dyn NodeStore>) -> Self {
        Self::with_capacity(backing, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(backing: Arc<dyn NodeStore>, capacity: usize) -> Self {
        Self {
            backing,
            cache: RwLock::new(BoundedCache::new(capacity)),
            node_locks: Mutex::new(HashMap::new()),
        }
    }

    fn node_lock(&self, node: &str) -> Arc<Mutex<()>> {
        self.node_locks
            .lock()
            .entry(node.to_string())
            .or_default()
            .clone()
    }

    /// Currently trusted key for the node, or `None` if none was ever saved.
    ///
    /// Storage that cannot be resolved at all (missing nodes root, invalid
    /// identity) surfaces as [`StoreError::Unavailable`] rather than being
    /// silently treated as "no trusted key".
    pub fn get(&self, node: &str) -> Result<Option<HostKey>, StoreError> {
        if let Some(key) = self.cache.read().get(node) {
            return Ok(Some(key.clone()));
        }

        // Serialize against save() for this node so the cache is never
        // populated with a record that a concurrent save just replaced.
        let lock = self.node_lock(node);
        let _guard = lock.lock();

        if let Some(key) = self.cache.read().get(node) {
            return Ok(Some(key.clone()));
        }

        let Some(bytes) = self.backing.read(node)? else {
            return Ok(None);
        };
        let record: TrustedKeyRecord =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::MalformedRecord {
                node: node.to_string(),
                reason: e.to_string(),
            })?;

        self.cache.write().insert(node, record.host_key.clone());
        Ok(Some(record.host_key))
    }

    /// Durably mark `key` as the trusted key for `node`, replacing any
    /// previous record.
    pub fn save(&self, node: &str, key: &HostKey) -> Result<(), StoreError> {
        let lock = self.node_lock(node);
        let _guard = lock.lock();

        let record = TrustedKeyRecord {
            host_key: key.clone(),
            saved_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::MalformedRecord {
            node: node.to_string(),
            reason: e.to_string(),
        })?;

        self.backing.write(node, &bytes)?;
        self.cache.write().insert(node, key.clone());
        Ok(())
    }

    /// Drop the cached entry; the durable record is untouched.
    pub fn invalidate(&self, node: &str) {
        self.cache.write().remove(node);
    }

    /// Remove both the cached entry and the durable record. Called by the
    /// node's owner when the node itself is deleted, never automatically.
    pub fn forget(&self, node: &str) -> Result<(), StoreError> {
        let lock = self.node_lock(node);
        let _guard = lock.lock();

        self.backing.remove(node)?;
        self.cache.write().remove(node);
        self.node_locks.lock().remove(node);
        Ok(())
    }
}
