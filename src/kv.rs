//! The ordered key-value store contract the engine is built on top of, plus
//! a `BTreeMap`-backed reference implementation used by this crate's own
//! tests.
//!
//! `KvStore` is async because the engine's suspension points include
//! whatever I/O the host's store performs — disk, network, or otherwise.
//! The engine only consumes this trait; it never implements a production
//! store itself.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::RwLock;

use crate::error::{Result, SyncError};

/// A half-open `[gte, lt)` byte-key range for [`KvStore::iterate`].
/// `lt = None` means unbounded above.
#[derive(Debug, Clone)]
pub struct KeyRange {
    pub gte: Vec<u8>,
    pub lt: Option<Vec<u8>>,
    pub reverse: bool,
}

impl KeyRange {
    pub fn prefix(prefix: &[u8]) -> Self {
        KeyRange {
            gte: prefix.to_vec(),
            lt: crate::keys::prefix_upper_bound(prefix),
            reverse: false,
        }
    }

    pub fn from(gte: Vec<u8>, lt: Option<Vec<u8>>) -> Self {
        KeyRange {
            gte,
            lt,
            reverse: false,
        }
    }
}

/// A batch of writes applied atomically by [`KvBatch::commit`]: visibility is
/// all-or-nothing.
#[async_trait]
pub trait KvBatch: Send {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>);
    fn delete(&mut self, key: Vec<u8>);
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// The ordered key-value store contract consumed by the sync engine.
///
/// Ordering is lexicographic on raw bytes. A successful `batch.commit()`
/// makes its writes visible to later reads on the same store; the engine
/// requires nothing stronger.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    fn batch(&self) -> Box<dyn KvBatch>;
    async fn iterate(&self, range: KeyRange) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Reference [`KvStore`] over an in-memory `BTreeMap`. Intended for this
/// crate's own tests and as a quick-start fixture for integrators; not a
/// production store (no durability, no concurrency beyond a single
/// `RwLock`).
#[derive(Default, Clone)]
pub struct MemoryKv {
    data: std::sync::Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv {
            data: std::sync::Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

enum MemoryOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

pub struct MemoryBatch {
    data: std::sync::Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    ops: Vec<MemoryOp>,
}

#[async_trait]
impl KvBatch for MemoryBatch {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(MemoryOp::Put(key, value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(MemoryOp::Delete(key));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut guard = self.data.write().await;
        for op in self.ops {
            match op {
                MemoryOp::Put(k, v) => {
                    guard.insert(k, v);
                }
                MemoryOp::Delete(k) => {
                    guard.remove(&k);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    fn batch(&self) -> Box<dyn KvBatch> {
        Box::new(MemoryBatch {
            data: self.data.clone(),
            ops: Vec::new(),
        })
    }

    async fn iterate(&self, range: KeyRange) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let guard = self.data.read().await;
        let lower = Bound::Included(range.gte.clone());
        let upper = match &range.lt {
            Some(lt) => Bound::Excluded(lt.clone()),
            None => Bound::Unbounded,
        };
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = guard
            .range((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if range.reverse {
            items.reverse();
        }
        Ok(items)
    }
}

pub(crate) fn store_error(e: impl Into<anyhow::Error>) -> SyncError {
    SyncError::StoreError(e.into())
}
