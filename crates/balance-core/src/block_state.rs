use std::collections::HashMap;

use common::manifest::SizedDigest;
use parking_lot::Mutex;

use crate::balance::Replica;
use crate::index::IndexEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockState {
    pub replicas: Vec<Replica>,
    pub desired: i64,
    pub ref_count: u32,
}

#[derive(Debug, Default)]
pub struct BlockStateMap {
    entries: Mutex<HashMap<SizedDigest, BlockState>>,
}

impl BlockStateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_replicas(&self, mount: usize, index: &[IndexEntry]) {
        let mut entries = self.entries.lock();
        for entry in index {
            entries
                .entry(entry.digest.clone())
                .or_default()
                .replicas
                .push(Replica {
                    mount,
                    mtime: entry.mtime,
                });
        }
    }

    pub fn increase_desired(&self, n: i64, digests: &[SizedDigest]) {
        let mut entries = self.entries.lock();
        for digest in digests {
            let blk = entries.entry(digest.clone()).or_default();
            blk.desired = blk.desired.max(n);
            blk.ref_count += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn get(&self, digest: &SizedDigest) -> Option<BlockState> {
        self.entries.lock().get(digest).cloned()
    }

    pub fn any_desired(&self) -> bool {
        self.entries.lock().values().any(|blk| blk.desired > 0)
    }

    /// Run `f` with the whole map borrowed; the lock is held throughout.
    pub fn with_blocks<R>(&self, f: impl FnOnce(&HashMap<SizedDigest, BlockState>) -> R) -> R {
        f(&self.entries.lock())
    }
}
