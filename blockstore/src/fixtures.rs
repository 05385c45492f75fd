use bytes::Bytes;
use lazy_static::lazy_static;

use crate::blockstore::MemoryBlockStore;
use crate::codec::encode_block;
use crate::{BlockHash, BlockInfo};

/// A block as it would be found in the object store.
pub struct TestBlock {
    pub plaintext: Bytes,
    pub raw: Bytes,
    pub info: BlockInfo,
}

impl TestBlock {
    pub fn new(plaintext: impl Into<Bytes>) -> Self {
        let plaintext = plaintext.into();
        let (hash, raw) = encode_block(&plaintext).expect("encoding must succeed");
        let key = Bytes::copy_from_slice(BlockHash::of(&raw).as_slice());

        Self {
            plaintext,
            raw,
            info: BlockInfo { key, hash },
        }
    }

    pub fn insert_into(&self, store: &MemoryBlockStore) {
        store.insert(self.info.key.clone(), self.raw.clone());
    }
}

/// Chunks `data` into blocks of `block_size` bytes, uploads them to `store`
/// and returns the block list describing the file.
pub fn chunk_into(store: &MemoryBlockStore, data: &[u8], block_size: usize) -> Vec<BlockInfo> {
    data.chunks(block_size)
        .map(|chunk| {
            let block = TestBlock::new(Bytes::copy_from_slice(chunk));
            block.insert_into(store);
            block.info
        })
        .collect()
}

lazy_static! {
    pub static ref BLOCK_A: TestBlock = TestBlock::new(Bytes::from_static(b"Hello World!"));
    pub static ref BLOCK_B: TestBlock = TestBlock::new(vec![0x42u8; 2048]);

    /// 10 KiB of non-repeating content, chunks nicely into 1 KiB blocks.
    pub static ref FILE_CONTENTS: Vec<u8> = (0..10 * 1024u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
        .collect();
}
