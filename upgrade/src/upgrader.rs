//! Replacing the installed software with the content of a package.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::OpenOptions;
use tracing::{debug, error, info, instrument, warn};
use zos_blockstore::{BlockInfo, Downloader};
use zos_flist::{Entry, FList, HubClient, Manifest, TagLink};

use crate::config::{UpgraderConfig, ZOS_PACKAGE};
use crate::errors::{StepOutcome, UpgradeError, UpgradeReport};
use crate::zinit::{self, ServiceManager};

const ZINIT_DIR: &str = "etc/zinit";

/// A package on the hub, as `repository/name`. Symlinks are resolved when
/// the package is fetched.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PackageRef {
    pub repository: String,
    pub name: String,
}

impl PackageRef {
    pub fn new(repository: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
        }
    }
}

impl From<&FList> for PackageRef {
    fn from(f: &FList) -> Self {
        PackageRef::new(&f.repository, &f.name)
    }
}

impl std::fmt::Display for PackageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.repository, self.name)
    }
}

/// Service declared by a manifest path, if it is `etc/zinit/<name>.yaml`.
pub(crate) fn service_name(path: &str) -> Option<&str> {
    let file = path.strip_prefix(ZINIT_DIR)?.strip_prefix('/')?;
    if file.contains('/') {
        return None;
    }
    file.strip_suffix(".yaml").filter(|name| !name.is_empty())
}

/// Names of the services a package declares.
pub async fn services_from_manifest(manifest: &Manifest) -> Result<Vec<String>, zos_flist::Error> {
    let mut services = Vec::new();
    let mut walk = manifest.walk(ZINIT_DIR);

    while let Some(item) = walk.next().await {
        let (path, entry) = match item {
            Ok(item) => item,
            Err(zos_flist::Error::NotFound(_)) => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        if entry.is_dir() {
            if path != ZINIT_DIR {
                walk.skip_current_dir();
            }
            continue;
        }
        if let Some(name) = service_name(&path) {
            services.push(name.to_string());
        }
    }

    Ok(services)
}

fn rel(path: &Path) -> String {
    path.to_string_lossy().trim_matches('/').to_string()
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(suffix);
    PathBuf::from(p)
}

pub struct Upgrader {
    hub: HubClient,
    downloader: Downloader,
    manager: Arc<dyn ServiceManager>,
    config: UpgraderConfig,
}

impl Upgrader {
    pub fn new(
        hub: HubClient,
        downloader: Downloader,
        manager: Arc<dyn ServiceManager>,
        config: UpgraderConfig,
    ) -> Self {
        Self {
            hub,
            downloader: downloader.with_workers(config.workers),
            manager,
            config,
        }
    }

    pub fn hub(&self) -> &HubClient {
        &self.hub
    }

    pub fn config(&self) -> &UpgraderConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<dyn ServiceManager> {
        &self.manager
    }

    /// Replaces the installation of `from` with `to`.
    ///
    /// Returns [UpgradeError::RestartNeeded] as soon as the running binary
    /// was replaced; nothing else is done in that case.
    #[instrument(skip_all, fields(to = %to, from = ?from.map(|f| f.to_string())), err)]
    pub async fn upgrade(
        &self,
        from: Option<&PackageRef>,
        to: &PackageRef,
    ) -> Result<UpgradeReport, UpgradeError> {
        let manifest = self.fetch(to).await?;

        let mut report = UpgradeReport {
            self_upgrade: self.self_upgrade(&manifest).await?,
            ..Default::default()
        };

        report.uninstall = match from {
            None => StepOutcome::Skipped,
            Some(from) => match self.fetch(from).await {
                Ok(old) => self.remove(&old, Some(&manifest)).await,
                Err(e) => {
                    warn!(err = %e, %from, "cannot uninstall previous package");
                    StepOutcome::Degraded(vec![e.to_string()])
                }
            },
        };

        report.install = self.copy_tree(&manifest).await?;
        report.restart = self.restart_services(&manifest).await;

        if report.is_degraded() {
            warn!(?report, "upgrade finished degraded");
        } else {
            info!("upgrade finished");
        }
        Ok(report)
    }

    /// Installs a single package, without removing anything.
    #[instrument(skip_all, fields(package = %package.name), err)]
    pub async fn install(&self, package: &FList) -> Result<UpgradeReport, UpgradeError> {
        let manifest = self.fetch(&PackageRef::from(package)).await?;

        Ok(UpgradeReport {
            self_upgrade: StepOutcome::Skipped,
            uninstall: StepOutcome::Skipped,
            install: self.copy_tree(&manifest).await?,
            restart: self.restart_services(&manifest).await,
        })
    }

    /// Stops the services of a package and deletes its files.
    #[instrument(skip_all, fields(package = %package.name), err)]
    pub async fn uninstall(&self, package: &FList) -> Result<StepOutcome, UpgradeError> {
        let manifest = self.fetch(&PackageRef::from(package)).await?;
        Ok(self.remove(&manifest, None).await)
    }

    /// Installs every package of the release tag `to`. The OS package is
    /// installed last. Packages the tag `from` had and `to` has not are
    /// uninstalled; packages that did not change are left alone.
    #[instrument(skip_all, fields(to = %to.target), err)]
    pub async fn update_to(&self, from: Option<&TagLink>, to: &TagLink) -> Result<(), UpgradeError> {
        let new = self.tag_packages(to).await?;
        let old = match from {
            Some(from) => self.tag_packages(from).await.unwrap_or_else(|e| {
                warn!(err = %e, from = %from.target, "cannot list previous release");
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        let mut names: Vec<&str> = new
            .keys()
            .map(String::as_str)
            .filter(|n| *n != ZOS_PACKAGE)
            .collect();
        names.sort_unstable();
        if !self.config.no_zos_upgrade && new.contains_key(ZOS_PACKAGE) {
            names.push(ZOS_PACKAGE);
        }

        for name in names {
            let pkg = &new[name];
            let previous = old.get(name);
            if previous == Some(pkg) {
                debug!(%pkg, "package did not change");
                continue;
            }
            let report = self.upgrade(previous, pkg).await?;
            debug!(%pkg, ?report, "package upgraded");
        }

        for (name, pkg) in old.iter().filter(|(name, _)| !new.contains_key(*name)) {
            info!(%name, "package was removed from the release");
            match self.fetch(pkg).await {
                Ok(manifest) => {
                    self.remove(&manifest, None).await;
                }
                Err(e) => warn!(err = %e, %pkg, "cannot uninstall removed package"),
            }
        }

        Ok(())
    }

    /// The packages of a release tag, by name.
    async fn tag_packages(&self, link: &TagLink) -> Result<HashMap<String, PackageRef>, UpgradeError> {
        let resolve_err = |source| UpgradeError::Resolve {
            package: link.target.clone(),
            source,
        };

        let (repo, tag) = link.destination().map_err(resolve_err)?;
        let links = self.hub.list_tag(&repo, &tag).await.map_err(resolve_err)?;

        links
            .into_iter()
            .map(|l| -> Result<_, UpgradeError> {
                let (repository, name) = l.destination(&repo).map_err(resolve_err)?;
                Ok((l.name, PackageRef::new(repository, name)))
            })
            .collect()
    }

    /// Downloads and opens the manifest of `package`.
    async fn fetch(&self, package: &PackageRef) -> Result<Manifest, UpgradeError> {
        let regular = self
            .hub
            .resolve(&package.repository, &package.name)
            .await
            .map_err(|source| UpgradeError::Resolve {
                package: package.to_string(),
                source,
            })?;

        let fetch_err = |source| UpgradeError::Fetch {
            package: package.to_string(),
            source,
        };
        let dir = self
            .hub
            .download(&self.config.cache, &regular.repository, &regular.name)
            .await
            .map_err(fetch_err)?;

        Manifest::open(dir).await.map_err(fetch_err)
    }

    /// Replaces the running binary if the package ships a different
    /// revision of it.
    async fn self_upgrade(&self, manifest: &Manifest) -> Result<StepOutcome, UpgradeError> {
        if self.config.no_self_upgrade {
            return Ok(StepOutcome::Skipped);
        }

        let entry = manifest
            .get(&rel(&self.config.self_path))
            .await
            .map_err(|source| UpgradeError::Fetch {
                package: rel(&self.config.self_path),
                source,
            })?;
        let Some(Entry::Regular {
            mode,
            size,
            block_size,
            blocks,
        }) = entry
        else {
            return Ok(StepOutcome::Skipped);
        };

        let current = self.config.root.join(&self.config.self_path);
        let candidate = with_suffix(&current, ".new");

        self.write_file(&candidate, mode, size, block_size, &blocks)
            .await
            .map_err(|e| UpgradeError::copy(&candidate, e))?;

        let new_rev = match self.revision(&candidate).await {
            Ok(rev) => rev,
            Err(e) => {
                error!(err = %e, "new binary is not usable, keeping the current one");
                if let Err(e) = tokio::fs::remove_file(&candidate).await {
                    warn!(err = %e, file = %candidate.display(), "failed to remove unusable binary");
                }
                return Ok(StepOutcome::Degraded(vec![format!(
                    "probing {}: {}",
                    candidate.display(),
                    e
                )]));
            }
        };

        match self.revision(&current).await {
            Ok(rev) if rev == new_rev => {
                debug!(revision = %rev, "running binary is up to date");
                tokio::fs::remove_file(&candidate)
                    .await
                    .map_err(|e| UpgradeError::copy(&candidate, e))?;
                Ok(StepOutcome::Ok)
            }
            current_rev => {
                info!(from = ?current_rev.ok(), to = %new_rev, "replacing running binary");
                tokio::fs::rename(&candidate, &current)
                    .await
                    .map_err(|e| UpgradeError::copy(&current, e))?;
                Err(UpgradeError::RestartNeeded)
            }
        }
    }

    /// Runs `<binary> -v`.
    async fn revision(&self, binary: &Path) -> Result<String, String> {
        let output = tokio::time::timeout(
            self.config.probe_timeout,
            tokio::process::Command::new(binary)
                .arg("-v")
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| "timed out".to_string())?
        .map_err(|e| e.to_string())?;

        if !output.status.success() {
            return Err(format!("exited with {}", output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stops the services of `manifest` and deletes its files, except the
    /// ones `keep` ships as well.
    async fn remove(&self, manifest: &Manifest, keep: Option<&Manifest>) -> StepOutcome {
        let mut failures = Vec::new();

        match services_from_manifest(manifest).await {
            Ok(services) => {
                let services: Vec<String> = services
                    .into_iter()
                    .filter(|s| !self.config.is_protected_service(s))
                    .collect();
                info!(?services, "stopping services");

                if let Err(e) = self
                    .manager
                    .stop_multiple(self.config.stop_timeout, &services)
                    .await
                {
                    failures.push(format!("stopping services: {}", e));
                }
                for name in &services {
                    match self.manager.forget(name).await {
                        Ok(()) | Err(zinit::Error::UnknownService(_)) => {}
                        Err(e) => failures.push(format!("forgetting {}: {}", name, e)),
                    }
                }
            }
            Err(e) => failures.push(format!("listing services: {}", e)),
        }

        let mut walk = manifest.walk("");
        while let Some(item) = walk.next().await {
            let (path, entry) = match item {
                Ok(item) => item,
                Err(e) => {
                    failures.push(e.to_string());
                    break;
                }
            };

            if self.config.is_excluded(&path) {
                if entry.is_dir() {
                    walk.skip_current_dir();
                }
                continue;
            }
            if entry.is_dir() || self.config.is_protected_path(&path) {
                continue;
            }
            if let Some(keep) = keep {
                if matches!(keep.get(&path).await, Ok(Some(_))) {
                    continue;
                }
            }

            let dest = self.config.root.join(&path);
            debug!(path = %dest.display(), "deleting file");
            match tokio::fs::remove_file(&dest).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("deleting {}: {}", dest.display(), e)),
            }
        }

        StepOutcome::from_failures(failures)
    }

    /// Copies the whole package into the install root.
    async fn copy_tree(&self, manifest: &Manifest) -> Result<StepOutcome, UpgradeError> {
        let root = &self.config.root;
        let self_path = rel(&self.config.self_path);
        let mut walk = manifest.walk("");

        while let Some(item) = walk.next().await {
            let (path, entry) = item.map_err(|e| UpgradeError::copy(root, e))?;
            let dest = root.join(&path);

            if self.config.is_excluded(&path) || (!path.is_empty() && path == self_path) {
                if entry.is_dir() {
                    walk.skip_current_dir();
                }
                debug!(path = %dest.display(), "skipping");
                continue;
            }

            match entry {
                Entry::Directory { mode } => {
                    tokio::fs::DirBuilder::new()
                        .recursive(true)
                        .mode(mode)
                        .create(&dest)
                        .await
                        .map_err(|e| UpgradeError::copy(&dest, e))?;
                }
                Entry::Regular {
                    mode,
                    size,
                    block_size,
                    blocks,
                } => self.copy_file(&dest, mode, size, block_size, &blocks).await?,
                Entry::Symlink { target } => {
                    let target = match target.strip_prefix('/') {
                        Some(absolute) => root.join(absolute),
                        None => PathBuf::from(target),
                    };
                    match tokio::fs::remove_file(&dest).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(UpgradeError::copy(&dest, e)),
                    }
                    tokio::fs::symlink(&target, &dest)
                        .await
                        .map_err(|e| UpgradeError::copy(&dest, e))?;
                }
            }
        }

        Ok(StepOutcome::Ok)
    }

    /// Replaces a single file. The previous version is kept as `<dest>.old`
    /// until the new one is complete, and put back if writing fails.
    async fn copy_file(
        &self,
        dest: &Path,
        mode: u32,
        size: u64,
        block_size: u64,
        blocks: &[BlockInfo],
    ) -> Result<(), UpgradeError> {
        info!(destination = %dest.display(), "copy file");

        let backup = match tokio::fs::symlink_metadata(dest).await {
            Ok(_) => {
                let old = with_suffix(dest, ".old");
                tokio::fs::rename(dest, &old)
                    .await
                    .map_err(|e| UpgradeError::copy(dest, e))?;
                Some(old)
            }
            Err(_) => None,
        };

        let result = self.write_file(dest, mode, size, block_size, blocks).await;

        match (&result, backup) {
            (Ok(()), Some(old)) => {
                if let Err(e) = tokio::fs::remove_file(&old).await {
                    error!(err = %e, file = %old.display(), "failed to clean up backup file");
                }
            }
            (Err(_), Some(old)) => {
                if let Err(e) = tokio::fs::rename(&old, dest).await {
                    error!(err = %e, file = %dest.display(), "failed to restore file after a failed download");
                }
            }
            (_, None) => {}
        }

        result.map_err(|e| UpgradeError::copy(dest, e))
    }

    async fn write_file(
        &self,
        dest: &Path,
        mode: u32,
        size: u64,
        block_size: u64,
        blocks: &[BlockInfo],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .custom_flags(libc::O_SYNC)
            .open(dest)
            .await?;

        if !blocks.is_empty() {
            self.downloader
                .download(blocks, block_size, &mut file)
                .await?;
        }
        file.set_len(size).await?;
        file.sync_all().await?;

        // the creation mode is subject to the umask
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    /// Forgets, monitors and starts every service of `manifest` again.
    async fn restart_services(&self, manifest: &Manifest) -> StepOutcome {
        let services = match services_from_manifest(manifest).await {
            Ok(services) => services,
            Err(e) => return StepOutcome::Degraded(vec![format!("listing services: {}", e)]),
        };
        let services: Vec<String> = services
            .into_iter()
            .filter(|s| !self.config.is_protected_service(s))
            .collect();
        if services.is_empty() {
            return StepOutcome::Skipped;
        }

        debug!(?services, "restarting services");
        let mut failures = Vec::new();

        if let Err(e) = self
            .manager
            .stop_multiple(self.config.stop_timeout, &services)
            .await
        {
            // keep going, as many services as possible have to come back
            error!(err = %e, "failed to stop all services");
            failures.push(format!("stopping services: {}", e));
        }

        for name in &services {
            info!(service = %name, "starting service");
            match self.manager.forget(name).await {
                Ok(()) | Err(zinit::Error::UnknownService(_)) => {}
                Err(e) => warn!(err = %e, service = %name, "could not forget service"),
            }

            match self.manager.monitor(name).await {
                Ok(()) | Err(zinit::Error::AlreadyMonitored(_)) => {}
                Err(e) => {
                    error!(err = %e, service = %name, "could not monitor service");
                    failures.push(format!("monitoring {}: {}", name, e));
                }
            }

            if let Err(e) = self.manager.start(name).await {
                error!(err = %e, service = %name, "could not start service");
                failures.push(format!("starting {}: {}", name, e));
            }
        }

        StepOutcome::from_failures(failures)
    }
}
