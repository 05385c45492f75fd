use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use url::Url;
use zos_blockstore::{blockstore, BlockCache, Downloader};
use zos_flist::hub::{DEFAULT_HUB_URL, DEFAULT_HUB_TIMEOUT};
use zos_flist::{HubClient, HubConfig};
use zos_upgrade::boot::{BootMethod, BootStore};
use zos_upgrade::daemon::{Daemon, DaemonConfig, DEFAULT_CHECK_INTERVAL};
use zos_upgrade::rollout::Network;
use zos_upgrade::zinit::{ZinitClient, DEFAULT_ZINIT_SOCKET};
use zos_upgrade::{Upgrader, UpgraderConfig};

/// Keeps the node's software at the version published for its network.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print the revision and exit.
    #[arg(short = 'v')]
    revision: bool,

    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    log_level: Option<Level>,

    #[arg(long, env, default_value = DEFAULT_HUB_URL)]
    hub_url: Url,

    /// Where package data blocks are fetched from.
    #[arg(long, env, default_value = "zdb://hub.grid.tf:9900")]
    storage_addr: String,

    #[arg(long, env, default_value = DEFAULT_ZINIT_SOCKET)]
    zinit_socket: PathBuf,

    /// Directory holding downloaded packages and blocks.
    #[arg(long, env, default_value = "/var/cache/modules/upgraded")]
    cache: PathBuf,

    /// Install root.
    #[arg(long, env, default_value = "/")]
    root: PathBuf,

    #[arg(long, env, default_value = "production")]
    network: Network,

    #[arg(long, env, default_value_t = 0)]
    farm_id: u32,

    /// Location of the per network rollout policy.
    #[arg(long, env, required_unless_present = "revision")]
    rollout_url: Option<Url>,

    /// Seconds between update checks.
    #[arg(long, env, default_value_t = DEFAULT_CHECK_INTERVAL.as_secs())]
    interval: u64,

    #[arg(long, env, default_value_t = zos_blockstore::downloader::DEFAULT_WORKERS)]
    workers: usize,

    /// Do not replace the running binary.
    #[arg(long, env)]
    no_self_upgrade: bool,

    /// Do not install the OS package.
    #[arg(long, env)]
    no_zos_upgrade: bool,
}

fn revision() -> String {
    match option_env!("ZOS_REVISION") {
        Some(rev) => format!("{} ({})", env!("CARGO_PKG_VERSION"), rev),
        None => env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    // answered before anything else, the self upgrade probes new binaries
    // with nothing but `-v`
    if cli.revision {
        println!("{}", revision());
        return Ok(());
    }
    let rollout_url = cli.rollout_url.ok_or("--rollout-url is required")?;

    zos_tracing::TracingBuilder::default()
        .level(cli.log_level.unwrap_or(Level::INFO))
        .json(cli.json)
        .enable_progressbar()
        .build()?;

    info!(revision = %revision(), "starting");

    let boot = BootStore::default();
    let method = boot.detect_boot_method();

    let store: Arc<dyn blockstore::BlockStore> = blockstore::from_addr(&cli.storage_addr)?.into();
    let downloader = Downloader::new(BlockCache::new(cli.cache.clone(), store));

    let hub = HubClient::new(HubConfig {
        base_url: cli.hub_url,
        timeout: DEFAULT_HUB_TIMEOUT,
    })?;

    let config = UpgraderConfig {
        root: cli.root,
        cache: cli.cache.join("flist"),
        workers: cli.workers,
        no_self_upgrade: cli.no_self_upgrade,
        // the OS package only makes sense on nodes booted from it
        no_zos_upgrade: cli.no_zos_upgrade || method == BootMethod::Other,
        ..Default::default()
    };
    let upgrader = Upgrader::new(
        hub,
        downloader,
        Arc::new(ZinitClient::new(cli.zinit_socket)),
        config,
    );

    let mut daemon_config = DaemonConfig::new(cli.network, cli.farm_id, rollout_url);
    daemon_config.interval = Duration::from_secs(cli.interval);
    let daemon = Daemon::new(upgrader, boot, daemon_config);

    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            info!("shutting down");
            cancel.cancel();
        }
    });

    match daemon.run(method, cancel).await {
        Err(e) if e.is_restart_needed() => {
            info!("restarting to run the new version");
            Ok(())
        }
        res => Ok(res?),
    }
}
