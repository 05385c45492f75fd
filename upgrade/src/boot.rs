//! What is installed on this node, as recorded across restarts.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use zos_flist::{FList, Kind, TagLink};

use crate::config::ZOS_REPO;

/// Holds `repo/name` of the package the node booted from. Written by the
/// bootstrap process.
pub const FLIST_NAME_FILE: &str = "/tmp/flist.name";

/// The installed-version marker.
pub const FLIST_INFO_FILE: &str = "/tmp/flist.info";

/// Snapshot of the installed binaries packages.
pub const BINARIES_FILE: &str = "/tmp/bins.info";

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid boot state {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Package(#[from] zos_flist::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

fn io(path: &Path, source: std::io::Error) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootMethod {
    /// Booted from a package, live upgrades are possible.
    FList,
    /// Anything else. The node cannot upgrade itself.
    Other,
}

/// On-disk form of the installed-version marker.
#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    name: String,
    #[serde(default)]
    target: String,
    #[serde(rename = "type")]
    kind: Kind,
    #[serde(default)]
    updated: u64,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    size: u64,
}

#[derive(Clone, Debug)]
pub struct BootStore {
    name_file: PathBuf,
    marker: PathBuf,
    bins: PathBuf,
}

impl Default for BootStore {
    fn default() -> Self {
        Self {
            name_file: FLIST_NAME_FILE.into(),
            marker: FLIST_INFO_FILE.into(),
            bins: BINARIES_FILE.into(),
        }
    }
}

impl BootStore {
    /// Keeps all boot state files in `dir`, using the default file names.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let name = |p: &str| dir.join(Path::new(p).file_name().unwrap_or_default());
        Self {
            name_file: name(FLIST_NAME_FILE),
            marker: name(FLIST_INFO_FILE),
            bins: name(BINARIES_FILE),
        }
    }

    pub fn detect_boot_method(&self) -> BootMethod {
        info!("detecting boot method");
        match std::fs::metadata(&self.name_file) {
            Ok(_) => BootMethod::FList,
            Err(e) => {
                warn!(err = %e, "no flist name file found");
                BootMethod::Other
            }
        }
    }

    /// `repo/name` of the boot package, if known.
    pub async fn name(&self) -> Option<String> {
        let data = tokio::fs::read_to_string(&self.name_file).await.ok()?;
        let name = data.trim();
        (!name.is_empty()).then(|| name.to_string())
    }

    /// The tag link last installed, `None` if the node was never
    /// bootstrapped.
    #[instrument(skip_all, err)]
    pub async fn current(&self) -> Result<Option<TagLink>, Error> {
        let Some(marker) = read_json::<Marker>(&self.marker).await? else {
            return Ok(None);
        };

        let repository = self
            .name()
            .await
            .and_then(|n| n.rsplit_once('/').map(|(repo, _)| repo.to_string()))
            .unwrap_or_else(|| ZOS_REPO.to_string());

        let flist = FList {
            name: marker.name,
            target: marker.target,
            kind: marker.kind,
            updated: marker.updated,
            hash: marker.hash,
            repository,
        };

        Ok(Some(TagLink::try_from(flist)?))
    }

    /// Records `installed` as the current version.
    #[instrument(skip_all, fields(name = %installed.name, target = %installed.target), err)]
    pub async fn set(&self, installed: &FList) -> Result<(), Error> {
        let marker = Marker {
            name: installed.name.clone(),
            target: installed.target.clone(),
            kind: installed.kind,
            updated: installed.updated,
            hash: installed.hash.clone(),
            size: 0,
        };
        write_json(&self.marker, &marker, 0o400).await
    }

    /// Binaries packages installed by the previous run, by name.
    pub async fn current_bins(&self) -> Result<HashMap<String, FList>, Error> {
        Ok(read_json(&self.bins).await?.unwrap_or_default())
    }

    pub async fn set_bins(&self, current: &HashMap<String, FList>) -> Result<(), Error> {
        write_json(&self.bins, current, 0o644).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io(path, e)),
    };

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| Error::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Replaces `path` with the JSON encoding of `value`, through a temporary
/// file in the same directory.
async fn write_json<T: Serialize>(path: &Path, value: &T, mode: u32) -> Result<(), Error> {
    let data = serde_json::to_vec(value).map_err(|source| Error::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io(dir, e))?;
        tmp.write_all(&data).map_err(|e| io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| io(tmp.path(), e))?;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
            .map_err(|e| io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| io(&path, e.error))?;
        Ok(())
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn taglink() -> FList {
        FList {
            name: "development".into(),
            target: "tf-zos/tags/v0.2.0".into(),
            kind: Kind::TagLink,
            updated: 1569924782,
            hash: String::new(),
            repository: "tf-zos".into(),
        }
    }

    #[tokio::test]
    async fn marker_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BootStore::in_dir(dir.path());
        assert_eq!(None, store.current().await.unwrap());
        assert_eq!(BootMethod::Other, store.detect_boot_method());
        assert!(store.current_bins().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn marker_set_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = BootStore::in_dir(dir.path());
        std::fs::write(dir.path().join("flist.name"), "tf-zos/development\n").unwrap();

        store.set(&taglink()).await.unwrap();
        // the marker is read-only but can still be replaced
        store.set(&taglink()).await.unwrap();

        let current = store.current().await.unwrap().unwrap();
        assert_eq!(TagLink::try_from(taglink()).unwrap(), current);
        assert_eq!(BootMethod::FList, store.detect_boot_method());

        let mode = std::fs::metadata(dir.path().join("flist.info"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(0o400, mode & 0o777);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("flist.info")).unwrap())
                .unwrap();
        assert_eq!("taglink", raw["type"]);
        assert_eq!(0, raw["size"]);
    }

    #[tokio::test]
    async fn marker_wrong_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = BootStore::in_dir(dir.path());
        store
            .set(&FList {
                kind: Kind::Regular,
                hash: "aa".into(),
                ..taglink()
            })
            .await
            .unwrap();

        assert!(matches!(store.current().await, Err(Error::Package(_))));
    }

    #[tokio::test]
    async fn bins_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = BootStore::in_dir(dir.path());

        let bins = HashMap::from([(
            "zinit.flist".to_string(),
            FList {
                name: "zinit.flist".into(),
                target: "zinit:0.2.10.flist".into(),
                kind: Kind::Symlink,
                updated: 12,
                hash: String::new(),
                repository: "tf-zos-bins".into(),
            },
        )]);
        store.set_bins(&bins).await.unwrap();
        assert_eq!(bins, store.current_bins().await.unwrap());
    }
}
