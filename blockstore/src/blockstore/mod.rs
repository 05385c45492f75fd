use bytes::Bytes;

use crate::Error;

mod from_addr;
mod http;
mod memory;
mod zdb;

pub use self::from_addr::from_addr;
pub use self::http::HttpBlockStore;
pub use self::memory::MemoryBlockStore;
pub use self::zdb::ZdbBlockStore;

/// The base trait all block store backends must implement.
///
/// A block store only knows how to hand out the raw (encrypted, compressed)
/// bytes stored under an opaque key. It does not cache or retry.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`.
    /// Returns [Error::NotFound] if the store has no such key.
    async fn get(&self, key: &[u8]) -> Result<Bytes, Error>;
}

#[async_trait::async_trait]
impl<A> BlockStore for A
where
    A: AsRef<dyn BlockStore> + Send + Sync,
{
    async fn get(&self, key: &[u8]) -> Result<Bytes, Error> {
        self.as_ref().get(key).await
    }
}
