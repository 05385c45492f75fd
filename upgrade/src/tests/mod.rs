use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use zos_blockstore::blockstore::MemoryBlockStore;
use zos_blockstore::{BlockCache, Downloader};
use zos_flist::fixtures::{dir, package_archive, regular_in};
use zos_flist::{Entry, HubClient, HubConfig};

use crate::zinit::{self, ServiceManager, ServiceState, ServiceStatus, Signal, State, Target};
use crate::{Upgrader, UpgraderConfig};

mod daemon;
mod services;

/// Service manager keeping its state in memory and recording every call.
#[derive(Default)]
pub(crate) struct MockManager {
    calls: Mutex<Vec<String>>,
    monitored: Mutex<HashSet<String>>,
    running: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    stubborn: Mutex<HashSet<String>>,
    no_status: Mutex<HashSet<String>>,
    /// Services asked to stop and not started since.
    down: Mutex<HashSet<String>>,
}

impl MockManager {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls for `service` only, without the service name.
    pub fn calls_for(&self, service: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| {
                let (cmd, name) = c.split_once(' ')?;
                (name == service).then(|| cmd.to_string())
            })
            .collect()
    }

    pub fn run(&self, service: &str) {
        self.monitored.lock().insert(service.to_string());
        self.running.lock().insert(service.to_string());
    }

    /// `start` fails for `service` from now on.
    pub fn break_service(&self, service: &str) {
        self.broken.lock().insert(service.to_string());
    }

    /// `stop` has no effect on `service`, only a kill ends it.
    pub fn ignore_stop(&self, service: &str) {
        self.stubborn.lock().insert(service.to_string());
    }

    /// `status` fails for `service` from now on.
    pub fn break_status(&self, service: &str) {
        self.no_status.lock().insert(service.to_string());
    }

    fn record(&self, cmd: &str, name: &str) {
        self.calls.lock().push(format!("{} {}", cmd, name));
    }

    fn known(&self, name: &str) -> Result<(), zinit::Error> {
        if self.monitored.lock().contains(name) {
            Ok(())
        } else {
            Err(zinit::Error::UnknownService(name.to_string()))
        }
    }
}

#[async_trait::async_trait]
impl ServiceManager for MockManager {
    async fn list(&self) -> Result<HashMap<String, ServiceState>, zinit::Error> {
        Ok(self
            .running
            .lock()
            .iter()
            .map(|n| {
                (
                    n.clone(),
                    ServiceState {
                        state: State::Running,
                        reason: None,
                    },
                )
            })
            .collect())
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus, zinit::Error> {
        self.known(name)?;
        if self.no_status.lock().contains(name) {
            return Err(zinit::Error::Zinit("status unavailable".into()));
        }
        let running = self.running.lock().contains(name);
        Ok(ServiceStatus {
            name: name.to_string(),
            pid: 0,
            state: ServiceState {
                state: if running { State::Running } else { State::Success },
                reason: None,
            },
            target: if running && !self.down.lock().contains(name) {
                Target::Up
            } else {
                Target::Down
            },
            after: HashMap::new(),
        })
    }

    async fn start(&self, name: &str) -> Result<(), zinit::Error> {
        self.record("start", name);
        if self.broken.lock().contains(name) {
            return Err(zinit::Error::Zinit("exec format error".into()));
        }
        self.known(name)?;
        self.down.lock().remove(name);
        self.running.lock().insert(name.to_string());
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), zinit::Error> {
        self.record("stop", name);
        self.known(name)?;
        self.down.lock().insert(name.to_string());
        if !self.stubborn.lock().contains(name) {
            self.running.lock().remove(name);
        }
        Ok(())
    }

    async fn monitor(&self, name: &str) -> Result<(), zinit::Error> {
        self.record("monitor", name);
        if !self.monitored.lock().insert(name.to_string()) {
            return Err(zinit::Error::AlreadyMonitored(name.to_string()));
        }
        self.down.lock().remove(name);
        self.running.lock().insert(name.to_string());
        Ok(())
    }

    async fn forget(&self, name: &str) -> Result<(), zinit::Error> {
        self.record("forget", name);
        if self.running.lock().contains(name) {
            return Err(zinit::Error::Zinit(format!("service {} is up", name)));
        }
        if !self.monitored.lock().remove(name) {
            return Err(zinit::Error::UnknownService(name.to_string()));
        }
        Ok(())
    }

    async fn kill(&self, name: &str, signal: Signal) -> Result<(), zinit::Error> {
        self.record(&format!("kill[{}]", signal), name);
        self.running.lock().remove(name);
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }
}

/// A node with an empty install root, talking to a fake hub.
pub(crate) struct Node {
    pub root: tempfile::TempDir,
    pub cache: tempfile::TempDir,
    pub state: tempfile::TempDir,
    pub store: MemoryBlockStore,
    pub server: mockito::ServerGuard,
    pub manager: Arc<MockManager>,
    mocks: Vec<mockito::Mock>,
}

impl Node {
    pub async fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            cache: tempfile::tempdir().unwrap(),
            state: tempfile::tempdir().unwrap(),
            store: MemoryBlockStore::default(),
            server: mockito::Server::new_async().await,
            manager: Arc::new(MockManager::default()),
            mocks: Vec::new(),
        }
    }

    /// Self upgrades are disabled unless asked for.
    pub fn config(&self) -> UpgraderConfig {
        UpgraderConfig {
            root: self.root.path().to_path_buf(),
            cache: self.cache.path().join("flist"),
            stop_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            no_self_upgrade: true,
            ..Default::default()
        }
    }

    pub fn hub(&self) -> HubClient {
        HubClient::new(HubConfig {
            base_url: url::Url::parse(&self.server.url()).unwrap(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    pub fn upgrader(&self, config: UpgraderConfig) -> Upgrader {
        let store = Arc::new(self.store.clone());
        Upgrader::new(
            self.hub(),
            Downloader::new(BlockCache::new(self.cache.path(), store)),
            self.manager.clone(),
            config,
        )
    }

    /// A regular file whose blocks are available in the node's store.
    pub fn file(&self, data: &[u8], mode: u32) -> Entry {
        regular_in(&self.store, data, mode)
    }

    pub fn path(&self, p: &str) -> PathBuf {
        self.root.path().join(p)
    }

    pub fn read(&self, p: &str) -> String {
        std::fs::read_to_string(self.path(p)).unwrap()
    }

    /// Publishes a regular package and returns the mock serving its
    /// archive.
    pub async fn publish(
        &mut self,
        repo: &str,
        name: &str,
        hash: &str,
        entries: &[(&str, Entry)],
    ) -> mockito::Mock {
        let info = self
            .server
            .mock("GET", format!("/api/flist/{}/{}/light", repo, name).as_str())
            .with_body(
                serde_json::json!({"name": name, "type": "regular", "updated": 1, "md5": hash})
                    .to_string(),
            )
            .create_async()
            .await;
        self.mocks.push(info);

        self.server
            .mock("GET", format!("/{}/{}", repo, name).as_str())
            .with_body(package_archive(entries).await)
            .create_async()
            .await
    }

    /// Serves `body` for `path` until the node is dropped.
    pub async fn serve(&mut self, path: &str, body: String) {
        let mock = self
            .server
            .mock("GET", path)
            .with_body(body)
            .create_async()
            .await;
        self.mocks.push(mock);
    }

    /// Publishes a release tag made of symlinks to `packages`.
    pub async fn publish_tag(&mut self, repo: &str, tag: &str, packages: &[(&str, &str)]) {
        let links: Vec<_> = packages
            .iter()
            .map(|(name, target)| {
                serde_json::json!({"name": name, "target": target, "type": "symlink", "updated": 1})
            })
            .collect();

        self.serve(
            &format!("/api/flist/{}/tags/{}", repo, tag),
            serde_json::Value::from(links).to_string(),
        )
        .await;
    }

    /// A small package declaring `service`, which is run from
    /// `bin/<service>`.
    pub fn service_tree(&self, service: &str, version: &str) -> Vec<(String, Entry)> {
        vec![
            ("bin".into(), dir()),
            (
                format!("bin/{}", service),
                self.file(format!("{} {}", service, version).as_bytes(), 0o755),
            ),
            ("etc".into(), dir()),
            ("etc/zinit".into(), dir()),
            (
                format!("etc/zinit/{}.yaml", service),
                self.file(format!("exec: /bin/{}", service).as_bytes(), 0o644),
            ),
        ]
    }
}

/// Borrows an owned tree as package entries.
pub(crate) fn entries(tree: &[(String, Entry)]) -> Vec<(&str, Entry)> {
    tree.iter().map(|(p, e)| (p.as_str(), e.clone())).collect()
}
