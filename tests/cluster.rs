//! Cluster behavior: election, replication, resync.

mod common;

use common::{free_port, TestClient, PASSWORD};
use std::time::Duration;
use strata::core::config::Config;
use strata::core::runtime::Runtime;

/// Build a clustered node config. `peers` lists (id, cluster_port).
fn cluster_config(
    id: u32,
    cluster_port: u16,
    peers: &[(u32, u16)],
    replication: &str,
) -> Config {
    let nodes = peers
        .iter()
        .map(|(peer_id, port)| {
            format!("{{ id = {peer_id}, host = \"127.0.0.1\", port = {port} }}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    Config::from_toml(&format!(
        r#"
ip = "127.0.0.1"
port = 0
password = "{PASSWORD}"
expire_check_interval = 0

[cluster]
id = {id}
ip = "127.0.0.1"
port = {cluster_port}
password = "cluster-{PASSWORD}"
nodes = [{nodes}]

[cluster.election]
leader_heartbeat_interval_ms = 100
leader_missing_timeout_ms = 600
election_timeout_ms = 300

[cluster.replication]
{replication}
"#
    ))
    .expect("valid cluster config")
}

async fn start_pair(replication: &str) -> (Runtime, Runtime) {
    let port1 = free_port();
    let port2 = free_port();

    let mut node1 = Runtime::new(cluster_config(1, port1, &[(2, port2)], replication)).unwrap();
    let mut node2 = Runtime::new(cluster_config(2, port2, &[(1, port1)], replication)).unwrap();

    let (first, second) = tokio::join!(node1.start(), node2.start());
    first.expect("node 1 start");
    second.expect("node 2 start");
    (node1, node2)
}

#[tokio::test]
async fn test_highest_id_wins_election() {
    let (mut node1, mut node2) = start_pair("type = \"sync\"").await;

    assert!(node2.is_leader());
    assert!(!node1.is_leader());

    node1.stop().await.unwrap();
    node2.stop().await.unwrap();
}

#[tokio::test]
async fn test_sync_replication_reaches_follower() {
    let (mut node1, mut node2) = start_pair("type = \"sync\"").await;

    // Node 2 is the leader; write through its client port.
    let leader_addr = node2.client_addr().unwrap();
    let mut client = TestClient::connect_and_login(leader_addr).await;
    client.set_string("replicated", "value", 0).await;

    // Sync replication acknowledged before the response, so the follower
    // has the key now.
    assert_eq!(
        node1
            .cache()
            .get_string("replicated", true)
            .await
            .unwrap(),
        Some("value".to_string())
    );

    node1.stop().await.unwrap();
    node2.stop().await.unwrap();
}

#[tokio::test]
async fn test_async_replication_ships_batches() {
    let (mut node1, mut node2) = start_pair(
        "type = \"async\"\ninterval_milliseconds = 100",
    )
    .await;

    let leader_addr = node2.client_addr().unwrap();
    let mut client = TestClient::connect_and_login(leader_addr).await;
    for i in 0..5 {
        client.set_string(&format!("key-{i}"), &format!("v-{i}"), 0).await;
    }

    // Wait for at least one drain cycle.
    tokio::time::sleep(Duration::from_millis(500)).await;
    for i in 0..5 {
        assert_eq!(
            node1
                .cache()
                .get_string(&format!("key-{i}"), true)
                .await
                .unwrap(),
            Some(format!("v-{i}"))
        );
    }

    node1.stop().await.unwrap();
    node2.stop().await.unwrap();
}

#[tokio::test]
async fn test_follower_resyncs_leader_state_on_join() {
    let port1 = free_port();
    let port2 = free_port();

    let mut node1 = Runtime::new(cluster_config(1, port1, &[(2, port2)], "type = \"sync\"")).unwrap();
    let mut node2 = Runtime::new(cluster_config(2, port2, &[(1, port1)], "type = \"sync\"")).unwrap();

    // State the leader already holds from a previous epoch.
    node2
        .cache()
        .set_string("carried", Some("over".into()), 0, true)
        .await
        .unwrap();
    node2.cache().set_counter("count", 42, true).await.unwrap();
    // The follower holds stale state that must be dropped by the resync.
    node1
        .cache()
        .set_string("stale", Some("gone".into()), 0, true)
        .await
        .unwrap();

    let (first, second) = tokio::join!(node1.start(), node2.start());
    first.unwrap();
    second.unwrap();

    assert!(node2.is_leader());
    assert_eq!(
        node1.cache().get_string("carried", true).await.unwrap(),
        Some("over".to_string())
    );
    assert_eq!(
        node1.cache().increment_counter("count", 0, true).await.unwrap(),
        42
    );
    assert!(!node1.cache().exists("stale", true).await.unwrap());

    node1.stop().await.unwrap();
    node2.stop().await.unwrap();
}

#[tokio::test]
async fn test_replication_preserves_per_key_order() {
    let (mut node1, mut node2) = start_pair("type = \"sync\"").await;

    let leader_addr = node2.client_addr().unwrap();
    let mut client = TestClient::connect_and_login(leader_addr).await;
    for i in 0..20 {
        client.set_string("key", &format!("v-{i}"), 0).await;
    }

    // The follower's final state matches the leader's last write.
    assert_eq!(
        node1.cache().get_string("key", true).await.unwrap(),
        Some("v-19".to_string())
    );
    assert_eq!(
        node2.cache().get_string("key", true).await.unwrap(),
        Some("v-19".to_string())
    );

    node1.stop().await.unwrap();
    node2.stop().await.unwrap();
}

#[tokio::test]
async fn test_follower_takes_over_when_leader_dies() {
    let (mut node1, mut node2) = start_pair("type = \"sync\"").await;
    assert!(node2.is_leader());

    node2.stop().await.unwrap();
    drop(node2);

    // Wait past the missing-leader timeout plus an election round.
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(node1.is_leader());

    node1.stop().await.unwrap();
}

#[tokio::test]
async fn test_login_reports_cluster_id_and_role() {
    let (mut node1, mut node2) = start_pair("type = \"sync\"").await;

    use strata::protocol::{Operation, PROTOCOL_VERSION};

    let mut leader_client = TestClient::connect(node2.client_addr().unwrap()).await;
    let mut response = leader_client
        .request_ok(Operation::Login, |frame| {
            frame.write_u8(PROTOCOL_VERSION);
            frame.write_string(PASSWORD);
        })
        .await;
    assert!(response.read_bool().unwrap());
    assert_eq!(response.read_i32().unwrap(), 2);
    assert!(response.read_bool().unwrap());

    let mut follower_client = TestClient::connect(node1.client_addr().unwrap()).await;
    let mut response = follower_client
        .request_ok(Operation::Login, |frame| {
            frame.write_u8(PROTOCOL_VERSION);
            frame.write_string(PASSWORD);
        })
        .await;
    assert!(response.read_bool().unwrap());
    assert_eq!(response.read_i32().unwrap(), 1);
    assert!(!response.read_bool().unwrap());

    node1.stop().await.unwrap();
    node2.stop().await.unwrap();
}
