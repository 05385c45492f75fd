//! The long running upgrade loop.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_retry::{strategy::ExponentialBackoff, Retry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use zos_flist::{Filter, Kind, TagLink};

use crate::boot::{self, BootMethod, BootStore};
use crate::config::{BINS_REPO, ZOS_REPO};
use crate::errors::UpgradeError;
use crate::rollout::{read_rollout_config, Network};
use crate::watcher::{self, RepoWatcher};
use crate::zinit;
use crate::Upgrader;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CHECK_JITTER: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error(transparent)]
    Boot(#[from] boot::Error),

    #[error(transparent)]
    Watch(#[from] watcher::Error),

    #[error("required service: {0}")]
    Service(#[from] zinit::Error),

    #[error("can't find taglink that matches '{0}'")]
    NoRemote(String),
}

impl Error {
    pub fn is_restart_needed(&self) -> bool {
        matches!(self, Error::Upgrade(UpgradeError::RestartNeeded))
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub network: Network,
    pub farm_id: u32,
    pub rollout_url: Url,
    pub interval: Duration,
    /// Upper bound of the random delay added to `interval`.
    pub jitter: Duration,
    /// Pause after a failed check.
    pub retry_after: Duration,
    /// Repository of extra binaries to keep installed. `None` disables it.
    pub bins_repo: Option<String>,
    /// Services started before anything else.
    pub required_services: Vec<String>,
    pub setup_timeout: Duration,
}

impl DaemonConfig {
    pub fn new(network: Network, farm_id: u32, rollout_url: Url) -> Self {
        Self {
            network,
            farm_id,
            rollout_url,
            interval: DEFAULT_CHECK_INTERVAL,
            jitter: DEFAULT_CHECK_JITTER,
            retry_after: DEFAULT_RETRY_AFTER,
            bins_repo: Some(BINS_REPO.to_string()),
            required_services: vec!["redis".to_string()],
            setup_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Daemon {
    upgrader: Upgrader,
    boot: BootStore,
    http: reqwest::Client,
    config: DaemonConfig,
}

impl Daemon {
    pub fn new(upgrader: Upgrader, boot: BootStore, config: DaemonConfig) -> Self {
        Self {
            upgrader,
            boot,
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Runs until `cancel` fires, or until the process has to be restarted
    /// to run a new binary, see [Error::is_restart_needed].
    pub async fn run(&self, method: BootMethod, cancel: CancellationToken) -> Result<(), Error> {
        if method == BootMethod::Other {
            return self.run_unmanaged(cancel).await;
        }

        info!("start upgrade daemon");
        self.setup().await?;

        let mut bins = match &self.config.bins_repo {
            Some(repo) => {
                let current = self.boot.current_bins().await.unwrap_or_else(|e| {
                    warn!(err = %e, "could not load current binaries list");
                    Default::default()
                });
                Some(RepoWatcher::new(self.upgrader.hub().clone(), repo, current))
            }
            None => None,
        };

        loop {
            let pause = match self.update().await {
                Ok(_) => self.next_update(),
                Err(e) if e.is_restart_needed() => return Err(e),
                Err(e) => {
                    error!(err = %e, "failed while checking for updates");
                    self.config.retry_after
                }
            };

            if let Some(watcher) = bins.as_mut() {
                if let Err(e) = self.sync_bins(watcher).await {
                    if e.is_restart_needed() {
                        return Err(e);
                    }
                    error!(err = %e, "failed to update binaries");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Not booted from a package: the binaries are installed once on the
    /// first boot, then nothing happens anymore.
    async fn run_unmanaged(&self, cancel: CancellationToken) -> Result<(), Error> {
        info!("system is not booted from the hub");

        if self.boot.current().await?.is_none() {
            let remote = self.remote().await?;
            self.upgrader.update_to(None, &remote).await?;
            self.boot.set(&remote.into()).await?;
        }

        info!("update is disabled");
        cancel.cancelled().await;
        Ok(())
    }

    /// Makes sure the services the daemon relies on run, in case a previous
    /// upgrade stopped them and crashed.
    async fn setup(&self) -> Result<(), Error> {
        for name in &self.config.required_services {
            self.upgrader
                .manager()
                .start_wait(self.config.setup_timeout, name)
                .await?;
        }
        Ok(())
    }

    fn next_update(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=self.config.jitter.as_secs());
        let next = self.config.interval + Duration::from_secs(jitter);
        info!(after = ?next, "checking for update after");
        next
    }

    /// The tag link of this node's network.
    #[instrument(skip(self), fields(network = %self.config.network), err)]
    pub async fn remote(&self) -> Result<TagLink, Error> {
        let name = self.config.network.to_string();
        let filters = [Filter::Name(name.clone()), Filter::Kind(Kind::TagLink)];

        let matches = Retry::spawn(
            ExponentialBackoff::from_millis(200)
                .max_delay(Duration::from_secs(5))
                .take(3),
            || self.upgrader.hub().find(ZOS_REPO, &filters),
        )
        .await
        .map_err(watcher::Error::from)?;

        match <[_; 1]>::try_from(matches) {
            Ok([link]) => Ok(TagLink::try_from(link).map_err(watcher::Error::from)?),
            Err(_) => Err(Error::NoRemote(name)),
        }
    }

    /// A single update check. Returns whether anything was installed.
    ///
    /// After a successful update [UpgradeError::RestartNeeded] is returned
    /// as well, so the new daemon takes over.
    #[instrument(skip(self), err)]
    pub async fn update(&self) -> Result<bool, Error> {
        let current = self.boot.current().await.unwrap_or_else(|e| {
            error!(err = %e, "failed to get info about current version, update anyway");
            None
        });

        let remote = self.remote().await?;
        if current.as_ref().map(|c| &c.target) == Some(&remote.target) {
            debug!(target = %remote.target, "up to date");
            return Ok(false);
        }

        if current.is_some() {
            let policy = read_rollout_config(
                &self.http,
                &self.config.rollout_url,
                self.config.network,
            )
            .await?;
            if !policy.allows(self.config.farm_id) {
                info!(target = %remote.target, "new version is not rolled out to this farm yet");
                return Ok(false);
            }
        }

        info!(version = remote.target.rsplit('/').next().unwrap_or_default(), "updating system...");
        self.upgrader.update_to(current.as_ref(), &remote).await?;
        self.boot.set(&remote.into()).await?;

        Err(UpgradeError::RestartNeeded.into())
    }

    /// Applies the changes of the binaries repository.
    async fn sync_bins(&self, watcher: &mut RepoWatcher) -> Result<(), Error> {
        let diff = watcher.diff().await?;
        if diff.is_empty() {
            return Ok(());
        }

        for pkg in &diff.to_del {
            if let Err(e) = self.upgrader.uninstall(pkg).await {
                error!(err = %e, package = %pkg.name, "failed to uninstall package");
            }
        }
        for pkg in &diff.to_add {
            match self.upgrader.install(pkg).await {
                Err(UpgradeError::RestartNeeded) => return Err(UpgradeError::RestartNeeded.into()),
                Err(e) => error!(err = %e, package = %pkg.name, "failed to install package"),
                Ok(_) => {}
            }
        }

        watcher.commit(diff.all);
        self.boot.set_bins(watcher.current()).await?;
        Ok(())
    }
}
