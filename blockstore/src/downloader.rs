use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::BlockCache;
use crate::{BlockInfo, Error};

/// Number of parallel block fetches if nothing else is configured.
pub const DEFAULT_WORKERS: usize = 4;

/// Assembles files out of their blocks, using a pool of workers fetching
/// through a shared [BlockCache].
#[derive(Clone)]
pub struct Downloader {
    cache: BlockCache,
    workers: usize,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(cache: BlockCache) -> Self {
        Self {
            cache,
            workers: DEFAULT_WORKERS,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the number of workers. 0 picks [DEFAULT_WORKERS].
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 {
            DEFAULT_WORKERS
        } else {
            workers
        };
        self
    }

    /// Ties all downloads to the given token. Cancelling it aborts
    /// in-flight downloads with [Error::Cancelled].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Writes the plaintext of `blocks` into `output`, block `i` at offset
    /// `i * block_size`.
    ///
    /// The first failing block cancels all other workers and is returned.
    /// Whatever was written to `output` up to that point stays there.
    #[instrument(skip_all, fields(blocks = blocks.len(), indicatif.pb_show = 1), err)]
    pub async fn download<W>(
        &self,
        blocks: &[BlockInfo],
        block_size: u64,
        output: &mut W,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + AsyncSeek + Unpin + Send,
    {
        if blocks.is_empty() {
            return Err(Error::InvalidRequest("no blocks provided".into()));
        }
        if block_size == 0 {
            return Err(Error::InvalidRequest("block size is not set".into()));
        }

        let span = Span::current();
        span.pb_set_style(&zos_tracing::BLOCKS_PROGRESS_STYLE);
        span.pb_set_message("Downloading blocks");
        span.pb_set_length(blocks.len() as u64);
        span.pb_start();

        let workers = self.workers.min(blocks.len());
        let token = self.cancel.child_token();
        let blocks: Arc<[BlockInfo]> = blocks.into();

        let (feed_tx, feed_rx) = mpsc::channel::<usize>(workers);
        let feed_rx = Arc::new(Mutex::new(feed_rx));
        let (out_tx, mut out_rx) = mpsc::channel::<(usize, Bytes)>(workers);

        let mut tasks = JoinSet::new();

        tasks.spawn({
            let token = token.clone();
            let len = blocks.len();
            async move {
                for index in 0..len {
                    tokio::select! {
                        _ = token.cancelled() => return Err(Error::Cancelled),
                        res = feed_tx.send(index) => if res.is_err() {
                            // all workers are gone already
                            return Ok(());
                        },
                    }
                }
                Ok(())
            }
        });

        for _ in 0..workers {
            tasks.spawn(worker(
                self.cache.clone(),
                blocks.clone(),
                block_size,
                feed_rx.clone(),
                out_tx.clone(),
                token.clone(),
            ));
        }
        drop(feed_rx);
        drop(out_tx);

        debug!(workers, "downloading blocks");

        let mut first_err = None;
        while let Some((index, data)) = out_rx.recv().await {
            let offset = index as u64 * block_size;
            if let Err(e) = write_at(output, offset, &data).await {
                token.cancel();
                first_err = Some(e);
                break;
            }
            span.pb_inc(1);
        }
        // unblocks workers waiting to hand in results
        drop(out_rx);

        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(Ok(())) | Ok(Err(Error::Cancelled)) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    first_err.get_or_insert(e.into());
                }
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        output
            .flush()
            .await
            .map_err(|e| Error::io("download output", e))
    }
}

async fn worker(
    cache: BlockCache,
    blocks: Arc<[BlockInfo]>,
    block_size: u64,
    feed: Arc<Mutex<mpsc::Receiver<usize>>>,
    out: mpsc::Sender<(usize, Bytes)>,
    token: CancellationToken,
) -> Result<(), Error> {
    loop {
        let next = {
            let mut feed = feed.lock().await;
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                next = feed.recv() => next,
            }
        };
        let Some(index) = next else {
            return Ok(());
        };

        let res = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            res = cache.get_block(&blocks[index], block_size) => res,
        };

        let data = match res {
            Ok(data) => data,
            Err(e) => {
                warn!(block = index + 1, err = %e, "error downloading block");
                token.cancel();
                return Err(e);
            }
        };

        if out.send((index, data)).await.is_err() {
            return Err(Error::Cancelled);
        }
    }
}

async fn write_at<W>(output: &mut W, offset: u64, data: &[u8]) -> Result<(), Error>
where
    W: AsyncWrite + AsyncSeek + Unpin,
{
    output
        .seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| Error::io("download output", e))?;
    output
        .write_all(data)
        .await
        .map_err(|e| Error::io("download output", e))
}
