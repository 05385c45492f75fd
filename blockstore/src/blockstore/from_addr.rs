use url::Url;

use super::{BlockStore, HttpBlockStore, MemoryBlockStore, ZdbBlockStore};
use crate::Error;

/// Constructs a new instance of a [BlockStore] from an URI.
///
/// The following schemes are supported by the following services:
/// - `memory://` ([MemoryBlockStore])
/// - `zdb://` ([ZdbBlockStore])
/// - `http://`, `https://` ([HttpBlockStore])
pub fn from_addr(uri: &str) -> Result<Box<dyn BlockStore>, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

    let store: Box<dyn BlockStore> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidRequest("invalid url".to_string()));
            }
            Box::<MemoryBlockStore>::default()
        }
        "zdb" => Box::new(ZdbBlockStore::from_url(&url)?),
        "http" | "https" => Box::new(HttpBlockStore::new(url)),
        _ => {
            return Err(Error::InvalidRequest(format!(
                "unknown scheme: {}",
                url.scheme()
            )))
        }
    };

    Ok(store)
}
