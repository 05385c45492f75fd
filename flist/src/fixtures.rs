use async_compression::tokio::write::GzipEncoder;
use lazy_static::lazy_static;
use tokio::io::AsyncWriteExt;
use zos_blockstore::blockstore::MemoryBlockStore;
use zos_blockstore::fixtures::chunk_into;

use crate::manifest::{Entry, ManifestWriter, MANIFEST_DB};

/// Block size used by fixture files.
pub const FIXTURE_BLOCK_SIZE: u64 = 1024;

/// A regular file entry for `data`, whose blocks are uploaded to `store`.
pub fn regular_in(store: &MemoryBlockStore, data: &[u8], mode: u32) -> Entry {
    let blocks = if data.is_empty() {
        vec![]
    } else {
        chunk_into(store, data, FIXTURE_BLOCK_SIZE as usize)
    };
    Entry::Regular {
        mode,
        size: data.len() as u64,
        block_size: FIXTURE_BLOCK_SIZE,
        blocks,
    }
}

/// A regular file entry for `data`. Its blocks are not stored anywhere.
pub fn regular(data: &[u8]) -> Entry {
    regular_in(&MemoryBlockStore::default(), data, 0o644)
}

pub fn dir() -> Entry {
    Entry::Directory { mode: 0o755 }
}

pub fn symlink(target: &str) -> Entry {
    Entry::Symlink {
        target: target.to_string(),
    }
}

/// Produces a package archive (gzipped tarball with a manifest database)
/// describing `entries`.
pub async fn package_archive(entries: &[(&str, Entry)]) -> Vec<u8> {
    let dir = tempfile::tempdir().expect("tempdir");
    let writer = ManifestWriter::create(dir.path()).expect("create manifest");
    for (path, entry) in entries {
        writer.insert(path, entry).expect("insert entry");
    }
    writer.finish().expect("valid manifest");

    let mut builder = tokio_tar::Builder::new(GzipEncoder::new(Vec::new()));
    builder
        .append_path_with_name(dir.path().join(MANIFEST_DB), MANIFEST_DB)
        .await
        .expect("append manifest");

    let mut encoder = builder.into_inner().await.expect("finish tarball");
    encoder.shutdown().await.expect("finish gzip stream");
    encoder.into_inner()
}

lazy_static! {
    pub static ref SAMPLE_TREE: Vec<(&'static str, Entry)> = vec![
        ("bin", dir()),
        ("bin/identityd", regular(b"identityd v1")),
        ("bin/upgraded", regular(b"upgraded v1")),
        ("bin/zinit-ls", symlink("/bin/identityd")),
        ("etc", dir()),
        ("etc/zinit", dir()),
        ("etc/zinit/flistd.yaml", regular(b"exec: flistd")),
        ("etc/zinit/redis.yaml", regular(b"exec: redis-server")),
    ];
}
