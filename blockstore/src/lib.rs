mod codec;
mod digests;
mod errors;

pub mod blockstore;
pub mod cache;
pub mod downloader;
pub mod fixtures;

pub use codec::{decode_block, encode_block};
pub use digests::{BlockHash, BlockInfo, Error as DigestError, BLOCK_HASH_LEN};
pub use errors::Error;

pub use cache::BlockCache;
pub use downloader::Downloader;
