use bytes::Bytes;
use data_encoding::HEXLOWER;
use reqwest::StatusCode;
use tracing::{instrument, warn};
use url::Url;

use super::BlockStore;
use crate::Error;

/// Block store reachable over plain HTTP(S).
/// Blocks are fetched from `<base_url>/<hex(key)>`.
pub struct HttpBlockStore {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpBlockStore {
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl BlockStore for HttpBlockStore {
    #[instrument(skip_all, fields(block.key = %HEXLOWER.encode(key)), err)]
    async fn get(&self, key: &[u8]) -> Result<Bytes, Error> {
        let key = HEXLOWER.encode(key);
        let url = self
            .base_url
            .join(&key)
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let resp = self.client.get(url).send().await.map_err(|e| {
            warn!(err=%e, "unable to GET block");
            Error::Connection(e.to_string())
        })?;

        match resp.status() {
            StatusCode::OK => Ok(resp.bytes().await?),
            StatusCode::NOT_FOUND => Err(Error::NotFound(key)),
            status => Err(Error::Connection(format!(
                "unexpected status {} for block {}",
                status, key
            ))),
        }
    }
}
