use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::upgrade::{publish_release, release};
use super::Node;
use crate::boot::{BootMethod, BootStore};
use crate::daemon::{Daemon, DaemonConfig, Error};
use crate::rollout::Network;

/// Points the network's tag link of the OS repository at `tag`.
async fn point_network(node: &mut Node, tag: &str) {
    node.serve(
        "/api/flist/tf-zos",
        serde_json::json!([
            {"name": "development", "target": format!("tf-zos/tags/{}", tag), "type": "taglink", "updated": 1},
            {"name": "production", "target": "tf-zos/tags/v0", "type": "taglink", "updated": 1},
            {"name": "zos.flist", "type": "regular", "updated": 1, "md5": "ff00"}
        ])
        .to_string(),
    )
    .await;
}

fn daemon(node: &Node, farm_id: u32) -> Daemon {
    let rollout = Url::parse(&format!("{}/rollout.json", node.server.url())).unwrap();
    let mut config = DaemonConfig::new(Network::Development, farm_id, rollout);
    config.bins_repo = None;

    Daemon::new(
        node.upgrader(node.config()),
        BootStore::in_dir(node.state.path()),
        config,
    )
}

#[tokio::test]
async fn first_update_installs_and_restarts() {
    let mut node = Node::new().await;
    let _archives = publish_release(&mut node, "v1", &[("zos.flist", "zos", "abcd01")]).await;
    point_network(&mut node, "v1").await;

    let daemon = daemon(&node, 1);
    let err = daemon.update().await.unwrap_err();

    assert!(err.is_restart_needed(), "unexpected error {:?}", err);
    assert_eq!("zos v1", node.read("bin/zos"));
    assert_eq!(
        Some("tf-zos/tags/v1".to_string()),
        BootStore::in_dir(node.state.path())
            .current()
            .await
            .unwrap()
            .map(|l| l.target)
    );
}

#[tokio::test]
async fn up_to_date_does_nothing() {
    let mut node = Node::new().await;
    point_network(&mut node, "v1").await;
    BootStore::in_dir(node.state.path())
        .set(&release("v1").into())
        .await
        .unwrap();

    assert!(!daemon(&node, 1).update().await.unwrap());
    assert!(node.manager.calls().is_empty());
}

#[tokio::test]
async fn rollout_gates_bootstrapped_nodes() {
    let mut node = Node::new().await;
    let _v1 = publish_release(&mut node, "v1", &[("zos.flist", "zos", "abcd11")]).await;
    let _v2 = publish_release(&mut node, "v2", &[("zos.flist", "zos", "abcd12")]).await;
    point_network(&mut node, "v2").await;
    node.serve(
        "/rollout.json",
        r#"{"development": {"test_farms": [7], "safe_to_upgrade": false}}"#.to_string(),
    )
    .await;
    BootStore::in_dir(node.state.path())
        .set(&release("v1").into())
        .await
        .unwrap();

    // not a test farm, the release is not safe yet
    assert!(!daemon(&node, 1).update().await.unwrap());
    assert!(!node.path("bin/zos").exists());

    let err = daemon(&node, 7).update().await.unwrap_err();
    assert!(err.is_restart_needed(), "unexpected error {:?}", err);
    assert_eq!("zos v2", node.read("bin/zos"));
}

#[tokio::test]
async fn ambiguous_remote() {
    let mut node = Node::new().await;
    node.serve(
        "/api/flist/tf-zos",
        serde_json::json!([
            {"name": "development", "target": "tf-zos/tags/v1", "type": "taglink", "updated": 1},
            {"name": "development", "target": "tf-zos/tags/v2", "type": "taglink", "updated": 2}
        ])
        .to_string(),
    )
    .await;

    assert!(matches!(
        daemon(&node, 1).remote().await,
        Err(Error::NoRemote(name)) if name == "development"
    ));
}

#[tokio::test]
async fn unmanaged_node_installs_once() {
    let mut node = Node::new().await;
    let _archives = publish_release(&mut node, "v1", &[("zos.flist", "zos", "abcd21")]).await;
    point_network(&mut node, "v1").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    daemon(&node, 1)
        .run(BootMethod::Other, cancel.clone())
        .await
        .unwrap();

    assert_eq!("zos v1", node.read("bin/zos"));
    assert!(BootStore::in_dir(node.state.path())
        .current()
        .await
        .unwrap()
        .is_some());

    // the marker is there now, nothing is fetched again
    let reads = node.store.reads();
    daemon(&node, 1).run(BootMethod::Other, cancel).await.unwrap();
    assert_eq!(reads, node.store.reads());
}
