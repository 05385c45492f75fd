use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use data_encoding::HEXLOWER;
use parking_lot::RwLock;
use tracing::instrument;

use super::BlockStore;
use crate::Error;

/// In-process block store. Keeps track of the number of reads served,
/// which is what tests use to observe cache hits.
#[derive(Clone, Default)]
pub struct MemoryBlockStore {
    db: Arc<RwLock<HashMap<Bytes, Bytes>>>,
    reads: Arc<AtomicUsize>,
}

impl MemoryBlockStore {
    pub fn insert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.db.write().insert(key.into(), value.into());
    }

    /// Number of successful and failed `get` calls so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BlockStore for MemoryBlockStore {
    #[instrument(skip_all, fields(block.key = %HEXLOWER.encode(key)))]
    async fn get(&self, key: &[u8]) -> Result<Bytes, Error> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.db
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(HEXLOWER.encode(key)))
    }
}
