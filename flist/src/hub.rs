use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::manifest::MANIFEST_DB;
use crate::{archive, Error, FList, Kind, Package, Regular, Symlink};

pub const DEFAULT_HUB_URL: &str = "https://hub.grid.tf/";
pub const DEFAULT_HUB_TIMEOUT: Duration = Duration::from_secs(20);

/// How many symlinks [HubClient::resolve] follows before giving up.
pub const MAX_RESOLVE_HOPS: usize = 8;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub base_url: Url,
    pub timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_HUB_URL).expect("valid default hub url"),
            timeout: DEFAULT_HUB_TIMEOUT,
        }
    }
}

/// Client side filters for [HubClient::find].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    Name(String),
    Kind(Kind),
}

impl Filter {
    fn matches(&self, f: &FList) -> bool {
        match self {
            Filter::Name(name) => &f.name == name,
            Filter::Kind(kind) => &f.kind == kind,
        }
    }
}

/// Client for the package catalog.
#[derive(Clone)]
pub struct HubClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HubClient {
    pub fn new(config: HubConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            base_url: config.base_url,
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Http(format!("invalid hub url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url, what: &str) -> Result<reqwest::Response, Error> {
        debug!(%url, "hub request");
        let resp = self.client.get(url.clone()).send().await.map_err(|e| {
            warn!(err=%e, %url, "hub request failed");
            Error::Http(e.to_string())
        })?;

        match resp.status() {
            StatusCode::OK => Ok(resp),
            StatusCode::NOT_FOUND => Err(Error::NotFound(what.to_string())),
            status => Err(Error::Http(format!("{}: {}", url, status))),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T, Error> {
        let body = self.get(url, what).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Metadata of a single package.
    #[instrument(skip(self), err)]
    pub async fn info(&self, repo: &str, name: &str) -> Result<FList, Error> {
        let url = self.url(&["api", "flist", repo, name, "light"])?;
        let mut info: FList = self.get_json(url, &format!("{}/{}", repo, name)).await?;
        info.repository = repo.to_string();
        Ok(info)
    }

    /// All packages of a repository.
    #[instrument(skip(self), err)]
    pub async fn list(&self, repo: &str) -> Result<Vec<FList>, Error> {
        let url = self.url(&["api", "flist", repo])?;
        let mut list: Vec<FList> = self.get_json(url, repo).await?;
        for f in list.iter_mut() {
            f.repository = repo.to_string();
        }
        Ok(list)
    }

    /// Packages of a repository matching all `filters`.
    pub async fn find(&self, repo: &str, filters: &[Filter]) -> Result<Vec<FList>, Error> {
        Ok(self
            .list(repo)
            .await?
            .into_iter()
            .filter(|f| filters.iter().all(|m| m.matches(f)))
            .collect())
    }

    /// The symlinks making up a tag.
    #[instrument(skip(self), err)]
    pub async fn list_tag(&self, repo: &str, tag: &str) -> Result<Vec<Symlink>, Error> {
        let url = self.url(&["api", "flist", repo, "tags", tag])?;
        let list: Vec<FList> = self
            .get_json(url, &format!("{}/tags/{}", repo, tag))
            .await?;

        list.into_iter()
            .filter(|f| f.kind == Kind::Symlink)
            .map(|mut f| {
                f.repository = repo.to_string();
                Symlink::try_from(f)
            })
            .collect()
    }

    /// Follows symlinks starting at `repo/name` until a regular package is
    /// found.
    #[instrument(skip(self), err)]
    pub async fn resolve(&self, repo: &str, name: &str) -> Result<Regular, Error> {
        let (mut repo, mut name) = (repo.to_string(), name.to_string());

        for _ in 0..MAX_RESOLVE_HOPS {
            match Package::try_from(self.info(&repo, &name).await?)? {
                Package::Regular(r) => return Ok(r),
                Package::Symlink(link) => {
                    (repo, name) = link.destination(&repo)?;
                    debug!(%repo, %name, "following symlink");
                }
                other => {
                    return Err(Error::InvalidPackage(format!(
                        "{}/{} is a {}, not a package with content",
                        repo,
                        name,
                        other.kind()
                    )))
                }
            }
        }

        Err(Error::InvalidPackage(format!(
            "too many symlinks resolving {}/{}",
            repo, name
        )))
    }

    /// Downloads and extracts the package `repo/name` into `cache`, returning
    /// the extracted directory `<cache>/<hash>.d`.
    ///
    /// Packages already extracted are not downloaded again.
    #[instrument(skip(self, cache), fields(cache = %cache.display()), err)]
    pub async fn download(&self, cache: &Path, repo: &str, name: &str) -> Result<PathBuf, Error> {
        info!("attempt downloading flist");
        let info = self.info(repo, name).await?;

        if info.hash.is_empty() || !info.hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidPackage(format!(
                "invalid hash '{}' for {}/{}",
                info.hash, repo, name
            )));
        }

        let extracted = cache.join(format!("{}.d", info.hash));
        if let Ok(m) = tokio::fs::metadata(extracted.join(MANIFEST_DB)).await {
            if m.len() > 0 {
                info!("already cached");
                return Ok(extracted);
            }
        }

        tokio::fs::create_dir_all(cache)
            .await
            .map_err(|e| Error::io(cache, e))?;

        let resp = self
            .get(self.url(&[repo, name])?, &format!("{}/{}", repo, name))
            .await?;
        let reader = tokio_util::io::StreamReader::new(
            resp.bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{}", info.hash))
            .tempdir_in(cache)
            .map_err(|e| Error::io(cache, e))?;

        archive::unpack(reader, tmp.path()).await?;

        match tokio::fs::metadata(tmp.path().join(MANIFEST_DB)).await {
            Ok(m) if m.len() > 0 => {}
            _ => {
                return Err(Error::Manifest(format!(
                    "package {}/{} has no {}",
                    repo, name, MANIFEST_DB
                )))
            }
        }

        // a previous extraction without database is stale
        if tokio::fs::try_exists(&extracted).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&extracted)
                .await
                .map_err(|e| Error::io(&extracted, e))?;
        }
        tokio::fs::rename(tmp.path(), &extracted)
            .await
            .map_err(|e| Error::io(&extracted, e))?;

        Ok(extracted)
    }
}
