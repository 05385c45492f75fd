use std::path::PathBuf;
use std::time::Duration;

/// Repository holding the OS packages and the per-network tag links.
pub const ZOS_REPO: &str = "tf-zos";

/// Name of the OS package inside a release tag. Installed last.
pub const ZOS_PACKAGE: &str = "zos.flist";

/// Repository holding the extra binaries installed on a node.
pub const BINS_REPO: &str = "tf-zos-bins";

/// Services that keep running across upgrades.
pub const PROTECTED_SERVICES: &[&str] = &["identityd", "redis"];

/// Where and how the [crate::Upgrader] installs packages.
#[derive(Clone, Debug)]
pub struct UpgraderConfig {
    /// Install root, `/` on a node.
    pub root: PathBuf,

    /// Directory packages are downloaded and extracted into.
    pub cache: PathBuf,

    /// The running binary, relative to `root`.
    pub self_path: PathBuf,

    /// Service name of the running daemon. Never stopped by an upgrade.
    pub self_service: String,

    /// Node identity binary, relative to `root`. Never deleted.
    pub identity_path: PathBuf,

    pub protected_services: Vec<String>,

    /// Manifest paths not installed, subtrees included.
    pub exclusions: Vec<String>,

    /// How long a service gets to stop before it is killed.
    pub stop_timeout: Duration,

    /// How long `<binary> -v` may take.
    pub probe_timeout: Duration,

    /// Parallel block downloads per file.
    pub workers: usize,

    /// Skip replacing the running binary.
    pub no_self_upgrade: bool,

    /// Skip the OS package when updating to a tag.
    pub no_zos_upgrade: bool,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            cache: PathBuf::from("/var/cache/modules/flistd"),
            self_path: PathBuf::from("bin/upgraded"),
            self_service: "upgraded".into(),
            identity_path: PathBuf::from("bin/identityd"),
            protected_services: PROTECTED_SERVICES.iter().map(|s| s.to_string()).collect(),
            exclusions: vec!["bin/identityd".into()],
            stop_timeout: Duration::from_secs(20),
            probe_timeout: Duration::from_secs(10),
            workers: zos_blockstore::downloader::DEFAULT_WORKERS,
            no_self_upgrade: false,
            no_zos_upgrade: false,
        }
    }
}

impl UpgraderConfig {
    /// Services an upgrade may stop and restart.
    pub(crate) fn is_protected_service(&self, name: &str) -> bool {
        name == self.self_service || self.protected_services.iter().any(|s| s == name)
    }

    /// Manifest paths an uninstall must never delete.
    pub(crate) fn is_protected_path(&self, path: &str) -> bool {
        if std::path::Path::new(path) == self.identity_path
            || std::path::Path::new(path) == self.self_path
        {
            return true;
        }

        crate::upgrader::service_name(path)
            .map(|name| self.is_protected_service(name))
            .unwrap_or(false)
    }

    pub(crate) fn is_excluded(&self, path: &str) -> bool {
        self.exclusions.iter().any(|e| e.trim_matches('/') == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::identity("bin/identityd", true)]
    #[case::self_binary("bin/upgraded", true)]
    #[case::redis("etc/zinit/redis.yaml", true)]
    #[case::daemon_service("etc/zinit/upgraded.yaml", true)]
    #[case::other_service("etc/zinit/flistd.yaml", false)]
    #[case::nested_yaml("etc/zinit/sub/redis.yaml", false)]
    #[case::plain("bin/flistd", false)]
    fn protected_paths(#[case] path: &str, #[case] protected: bool) {
        assert_eq!(protected, UpgraderConfig::default().is_protected_path(path));
    }

    #[test]
    fn exclusions_ignore_slashes() {
        let config = UpgraderConfig {
            exclusions: vec!["/usr/lib/".into()],
            ..Default::default()
        };
        assert!(config.is_excluded("usr/lib"));
        assert!(!config.is_excluded("usr"));
    }
}
