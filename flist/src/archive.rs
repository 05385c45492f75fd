//! Unpacking of package archives: a (usually gzipped) tarball containing
//! the manifest database.

use std::path::Path;

use async_compression::tokio::bufread::GzipDecoder;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_tar::Archive;
use tracing::{debug, instrument};

use crate::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unpacks the archive read from `reader` into `dest`, which must exist.
#[instrument(skip_all, fields(dest = %dest.display()), err)]
pub async fn unpack<R>(reader: R, dest: &Path) -> Result<(), Error>
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::new(reader);
    let gzipped = reader
        .fill_buf()
        .await
        .map_err(|e| Error::io(dest, e))?
        .starts_with(&GZIP_MAGIC);

    if gzipped {
        debug!("unpacking gzip compressed archive");
        Archive::new(GzipDecoder::new(reader))
            .unpack(dest)
            .await
            .map_err(|e| Error::io(dest, e))
    } else {
        debug!("unpacking plain archive");
        Archive::new(reader)
            .unpack(dest)
            .await
            .map_err(|e| Error::io(dest, e))
    }
}
