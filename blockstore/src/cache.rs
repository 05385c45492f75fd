use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use nix::fcntl::{flock, FlockArg};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

use crate::blockstore::BlockStore;
use crate::codec::decode_block;
use crate::{BlockHash, BlockInfo, Error};

/// On-disk cache of decoded blocks, shared between all downloads (and
/// processes) using the same cache root.
///
/// Blocks live at `<root>/blocks/<hh>/<hh>/<hash>`. Every read-or-populate
/// step holds an exclusive `flock` on `<block>.lock`, so concurrent requests
/// for the same block fetch it only once.
#[derive(Clone)]
pub struct BlockCache {
    root: PathBuf,
    store: Arc<dyn BlockStore>,
}

impl BlockCache {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn BlockStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_path(&self, hash: &BlockHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root
            .join("blocks")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex)
    }

    /// Returns the plaintext of a block, from cache if possible.
    ///
    /// Cached blocks are trusted as-is, they were verified when written.
    #[instrument(skip_all, fields(block.hash = %block.hash), err)]
    pub async fn get_block(&self, block: &BlockInfo, block_size: u64) -> Result<Bytes, Error> {
        let path = self.block_path(&block.hash);
        let _lock = BlockLock::acquire(lock_path(&path)).await?;

        match tokio::fs::metadata(&path).await {
            Ok(m) if m.len() > 0 => {
                debug!("block cache hit");
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| Error::io(&path, e))?;
                let mut buf = Vec::with_capacity(m.len().min(block_size) as usize);
                file.take(block_size)
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| Error::io(&path, e))?;
                return Ok(buf.into());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&path, e)),
        }

        debug!(block.key = %data_encoding::HEXLOWER.encode(&block.key), "block cache miss");
        let raw = self.store.get(&block.key).await?;

        let hash = block.hash;
        let data = tokio::task::spawn_blocking(move || -> Result<Bytes, Error> {
            let data = decode_block(&raw, &hash)?;
            // a hit would only return the first `block_size` bytes of it
            if data.len() as u64 > block_size {
                return Err(Error::Decode(format!(
                    "block is {} bytes, larger than the block size of {}",
                    data.len(),
                    block_size
                )));
            }
            write_atomic(&path, &data)?;
            Ok(data)
        })
        .await??;

        Ok(data)
    }
}

fn lock_path(block: &Path) -> PathBuf {
    let mut p = block.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

/// Writes to a temporary file next to `path` and renames it into place, so
/// a crash never leaves a partial block behind.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), Error> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::InvalidRequest(format!("{} has no parent", path.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(dir, e))?;
    tmp.write_all(data).map_err(|e| Error::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| Error::io(path, e.error))?;

    Ok(())
}

/// Exclusive advisory lock, released on drop.
struct BlockLock {
    path: PathBuf,
    file: std::fs::File,
}

impl BlockLock {
    async fn acquire(path: PathBuf) -> Result<Self, Error> {
        tokio::task::spawn_blocking(move || {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
            }

            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| Error::io(&path, e))?;

            flock(file.as_raw_fd(), FlockArg::LockExclusive)
                .map_err(|e| Error::io(&path, e.into()))?;

            Ok(BlockLock { path, file })
        })
        .await?
    }
}

impl Drop for BlockLock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!(path = %self.path.display(), err = %e, "failed to release block lock");
        }
    }
}
