//! The metadata database shipped inside a package.
//!
//! Every file system entry of the package is stored under its path relative
//! to the package root (the root itself is `""`), as JSON-encoded [Entry].

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use zos_blockstore::BlockInfo;

use crate::Error;

/// File name of the database inside an extracted package.
pub const MANIFEST_DB: &str = "flistdb.redb";

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Entry {
    Directory {
        mode: u32,
    },
    Regular {
        mode: u32,
        size: u64,
        block_size: u64,
        blocks: Vec<BlockInfo>,
    },
    Symlink {
        target: String,
    },
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        matches!(self, Entry::Directory { .. })
    }

    fn decode(path: &str, data: &[u8]) -> Result<Self, Error> {
        let entry: Entry = serde_json::from_slice(data)
            .map_err(|e| Error::Manifest(format!("invalid entry {}: {}", path, e)))?;

        if let Entry::Regular { size, blocks, .. } = &entry {
            if *size > 0 && blocks.is_empty() {
                return Err(Error::Manifest(format!(
                    "regular file {} of size {} has no blocks",
                    path, size
                )));
            }
        }

        Ok(entry)
    }
}

/// Normalizes a path into the key it is stored under.
fn key(path: &str) -> &str {
    path.trim_matches('/')
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

/// Read-only handle to an extracted package's metadata.
#[derive(Clone)]
pub struct Manifest {
    db: Arc<Database>,
}

impl Manifest {
    /// Opens the manifest database in an extracted package directory.
    #[instrument(skip_all, fields(path = %dir.as_ref().display()), err)]
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let path = dir.as_ref().join(MANIFEST_DB);
        let db = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            if !path.is_file() {
                return Err(Error::NotFound(path.display().to_string()));
            }
            Ok(Database::open(&path)?)
        })
        .await??;

        Ok(Self { db: Arc::new(db) })
    }

    /// Looks up a single entry.
    pub async fn get(&self, path: &str) -> Result<Option<Entry>, Error> {
        let db = self.db.clone();
        let path = key(path).to_string();

        tokio::task::spawn_blocking(move || get(&db, &path)).await?
    }

    /// Walks the tree depth-first starting at `root`, yielding `root` first
    /// and every directory before its children.
    pub fn walk(&self, root: &str) -> Walk {
        Walk {
            db: self.db.clone(),
            root: key(root).to_string(),
            started: false,
            stack: Vec::new(),
            expand: None,
        }
    }
}

fn get(db: &Database, path: &str) -> Result<Option<Entry>, Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(ENTRIES)?;
    let value = table.get(path)?;
    value.map(|v| Entry::decode(path, v.value())).transpose()
}

/// Direct children of `dir`, in lexical order.
fn children(db: &Database, dir: &str) -> Result<Vec<(String, Entry)>, Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(ENTRIES)?;

    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{}/", dir)
    };

    let mut out = Vec::new();
    for item in table.range(prefix.as_str()..)? {
        let (k, v) = item?;
        let path = k.value();
        if !path.starts_with(&prefix) {
            break;
        }
        if path.is_empty() || parent(path) != dir {
            continue;
        }
        out.push((path.to_string(), Entry::decode(path, v.value())?));
    }

    Ok(out)
}

/// Lazy depth-first walk over a [Manifest].
///
/// Children of a directory are only loaded once the walk moves past it,
/// which gives the caller the chance to [Walk::skip_current_dir].
pub struct Walk {
    db: Arc<Database>,
    root: String,
    started: bool,
    stack: Vec<(String, Entry)>,
    expand: Option<String>,
}

impl Walk {
    /// Do not descend into the directory that was returned last.
    pub fn skip_current_dir(&mut self) {
        self.expand = None;
    }

    /// Returns the next entry, or `None` when the walk is done.
    ///
    /// A missing root is reported as [Error::NotFound].
    pub async fn next(&mut self) -> Option<Result<(String, Entry), Error>> {
        match self.advance().await {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                // a broken walk does not continue
                self.stack.clear();
                self.expand = None;
                self.started = true;
                Some(Err(e))
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<(String, Entry)>, Error> {
        if !self.started {
            self.started = true;
            let db = self.db.clone();
            let root = self.root.clone();
            let entry = tokio::task::spawn_blocking(move || get(&db, &root))
                .await??
                .ok_or_else(|| Error::NotFound(format!("/{}", self.root)))?;
            if entry.is_dir() {
                self.expand = Some(self.root.clone());
            }
            return Ok(Some((self.root.clone(), entry)));
        }

        if let Some(dir) = self.expand.take() {
            let db = self.db.clone();
            let mut kids = tokio::task::spawn_blocking(move || children(&db, &dir)).await??;
            kids.reverse();
            self.stack.extend(kids);
        }

        let Some((path, entry)) = self.stack.pop() else {
            return Ok(None);
        };
        if entry.is_dir() {
            self.expand = Some(path.clone());
        }

        Ok(Some((path, entry)))
    }
}

/// Builds a manifest database. Used to produce packages.
pub struct ManifestWriter {
    db: Database,
}

impl ManifestWriter {
    /// Creates the database file inside `dir`, with an empty root
    /// directory.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let db = Database::create(dir.as_ref().join(MANIFEST_DB))?;
        let writer = Self { db };
        writer.insert("", &Entry::Directory { mode: 0o755 })?;
        Ok(writer)
    }

    /// Adds or replaces the entry at `path`. Parents must be added
    /// separately.
    pub fn insert(&self, path: &str, entry: &Entry) -> Result<(), Error> {
        let path = key(path);
        let data = serde_json::to_vec(entry)?;

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTRIES)?;
            table.insert(path, data.as_slice())?;
        }
        txn.commit()?;

        Ok(())
    }

    /// Checks that every entry's parent is a directory.
    pub fn finish(self) -> Result<(), Error> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        for item in table.iter()? {
            let (k, _) = item?;
            let path = k.value();
            if path.is_empty() {
                continue;
            }
            let parent = parent(path);
            match table.get(parent)? {
                Some(v) if Entry::decode(parent, v.value())?.is_dir() => {}
                _ => {
                    warn!(path, "entry without parent directory");
                    return Err(Error::Manifest(format!(
                        "{} has no parent directory",
                        path
                    )));
                }
            }
        }
        Ok(())
    }
}
