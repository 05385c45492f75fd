//! Noticing new packages on the hub.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zos_flist::{FList, HubClient, Kind};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Hub(#[from] zos_flist::Error),

    #[error("rollout: {0}")]
    Rollout(String),
}

/// Changes of a repository since the last [RepoWatcher::commit].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diff {
    /// Everything the repository holds now.
    pub all: HashMap<String, FList>,
    /// New packages, or packages that were updated.
    pub to_add: Vec<FList>,
    /// Packages that are gone.
    pub to_del: Vec<FList>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_del.is_empty()
    }
}

/// Watches the installable packages of a repository.
pub struct RepoWatcher {
    hub: HubClient,
    repo: String,
    current: HashMap<String, FList>,
}

impl RepoWatcher {
    pub fn new(hub: HubClient, repo: impl Into<String>, current: HashMap<String, FList>) -> Self {
        Self {
            hub,
            repo: repo.into(),
            current,
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn current(&self) -> &HashMap<String, FList> {
        &self.current
    }

    /// Compares the repository against the last committed state. Does not
    /// change the watcher.
    pub async fn diff(&self) -> Result<Diff, Error> {
        let all: HashMap<String, FList> = self
            .hub
            .list(&self.repo)
            .await?
            .into_iter()
            .filter(|f| matches!(f.kind, Kind::Regular | Kind::Symlink))
            .map(|f| (f.name.clone(), f))
            .collect();

        let mut to_add: Vec<FList> = all
            .values()
            .filter(|f| {
                self.current
                    .get(&f.name)
                    .map_or(true, |known| known.updated != f.updated)
            })
            .cloned()
            .collect();
        let mut to_del: Vec<FList> = self
            .current
            .values()
            .filter(|f| !all.contains_key(&f.name))
            .cloned()
            .collect();

        to_add.sort_by(|a, b| a.name.cmp(&b.name));
        to_del.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Diff {
            all,
            to_add,
            to_del,
        })
    }

    pub fn commit(&mut self, all: HashMap<String, FList>) {
        self.current = all;
    }

    /// Polls the repository every `interval`, sending every non-empty diff.
    /// A diff is committed once it was received.
    pub fn watch(mut self, interval: Duration, cancel: CancellationToken) -> mpsc::Receiver<Diff> {
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let diff = match self.diff().await {
                    Ok(diff) => diff,
                    Err(e) => {
                        warn!(err = %e, repo = %self.repo, "failed to list repository");
                        continue;
                    }
                };
                if diff.is_empty() {
                    continue;
                }

                debug!(repo = %self.repo, add = diff.to_add.len(), del = diff.to_del.len(), "repository changed");
                let all = diff.all.clone();
                if tx.send(diff).await.is_err() {
                    return;
                }
                self.commit(all);
            }
        });

        rx
    }
}
