use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cluster::{
    Command, CommandResult, Configuration, ConsensusServer, Error, KvStateMachine, Role,
    NetworkListener, ServerPhase, StartupMode, TcpNetworkListener,
};

const WAIT: Duration = Duration::from_secs(10);

async fn listener(addr: &str) -> Arc<TcpNetworkListener> {
    Arc::new(TcpNetworkListener::bind(addr, None).await.unwrap())
}

fn durable(dir: &Path) -> Configuration {
    let config = Configuration {
        data_path: dir.join("data"),
        logs_path: dir.join("logs"),
        ..Default::default()
    };
    config.init().unwrap();
    config
}

fn set(key: &str, value: &str) -> Command {
    Command::Set {
        key: key.into(),
        value: value.into(),
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn test_dev_mode_single_node() {
    let dir = TempDir::new().unwrap();
    let config = Configuration {
        data_path: dir.path().join("missing/data"),
        logs_path: dir.path().join("missing/logs"),
        dev_mode: true,
        ..Default::default()
    };
    let kv = KvStateMachine::new();
    let server = ConsensusServer::setup(&config, listener("127.0.0.1:0").await, kv.clone())
        .await
        .unwrap();

    let leader = server.wait_for_leader(WAIT).await.unwrap();
    assert_eq!(leader, server.address());
    assert!(eventually(|| server.is_leader()).await);

    let result = server.apply(set("a", "1")).await.unwrap();
    assert_eq!(result, CommandResult::Previous(None));
    let result = server.apply(set("a", "2")).await.unwrap();
    assert_eq!(result, CommandResult::Previous(Some("1".into())));
    assert_eq!(kv.get("a"), Some("2".into()));

    let status = server.cluster_status();
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.startup, StartupMode::Bootstrapped);
    assert_eq!(status.members.len(), 1);
    assert_eq!(status.members[0].address, server.address());
    assert!(status.applied_index >= 3);

    server.shutdown().await.unwrap();
    assert_eq!(server.cluster_status().phase, ServerPhase::Stopped);
    assert!(matches!(server.shutdown().await, Err(Error::Stopped)));
    assert!(!dir.path().join("missing").exists());
}

#[tokio::test]
async fn test_resume_durable_state() {
    let dir = TempDir::new().unwrap();
    let config = Configuration {
        bootstrap: true,
        ..durable(dir.path())
    };

    let first = listener("127.0.0.1:0").await;
    let address = first.local_address();
    let server = ConsensusServer::setup(&config, first, KvStateMachine::new())
        .await
        .unwrap();
    assert_eq!(server.cluster_status().startup, StartupMode::Bootstrapped);
    server.wait_for_leader(WAIT).await.unwrap();
    server.apply(set("k", "v")).await.unwrap();
    server.shutdown().await.unwrap();
    drop(server);

    // Same address, so the same raft id; bootstrap is still requested.
    let kv = KvStateMachine::new();
    let server = ConsensusServer::setup(&config, listener(&address).await, kv.clone())
        .await
        .unwrap();
    assert_eq!(server.cluster_status().startup, StartupMode::Resumed);
    server.wait_for_applied(WAIT).await.unwrap();
    assert_eq!(kv.get("k"), Some("v".into()));

    server.wait_for_leader(WAIT).await.unwrap();
    let status = server.cluster_status();
    assert_eq!(status.members.len(), 1);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_waits_to_be_joined_without_bootstrap() {
    let dir = TempDir::new().unwrap();
    let config = durable(dir.path());
    let server = ConsensusServer::setup(&config, listener("127.0.0.1:0").await, KvStateMachine::new())
        .await
        .unwrap();

    let status = server.cluster_status();
    assert_eq!(status.startup, StartupMode::Joined);
    assert!(status.members.is_empty());
    assert!(matches!(
        server.wait_for_leader(Duration::from_millis(500)).await,
        Err(Error::Timeout)
    ));
    assert!(matches!(
        server.apply(set("a", "1")).await,
        Err(Error::NotLeader { leader: None })
    ));
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_second_node() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader_config = Configuration {
        bootstrap: true,
        ..durable(leader_dir.path())
    };
    let leader = ConsensusServer::setup(&leader_config, listener("127.0.0.1:0").await, KvStateMachine::new())
        .await
        .unwrap();
    leader.wait_for_leader(WAIT).await.unwrap();

    let follower_kv = KvStateMachine::new();
    let follower = ConsensusServer::setup(
        &durable(follower_dir.path()),
        listener("127.0.0.1:0").await,
        follower_kv.clone(),
    )
    .await
    .unwrap();

    leader
        .add_voter(follower.id(), follower.address())
        .await
        .unwrap();
    // Adding it again changes nothing.
    leader
        .add_voter(follower.id(), follower.address())
        .await
        .unwrap();

    leader.apply(set("x", "1")).await.unwrap();
    assert!(eventually(|| follower_kv.get("x").as_deref() == Some("1")).await);

    assert!(
        eventually(|| {
            let status = follower.cluster_status();
            status.leader.as_deref() == Some(leader.address()) && status.members.len() == 2
        })
        .await
    );
    assert_eq!(follower.cluster_status().role, Role::Follower);
    assert!(!follower.is_leader());
    assert!(matches!(
        follower.apply(set("x", "2")).await,
        Err(Error::NotLeader { leader: Some(_) })
    ));

    follower.shutdown().await.unwrap();
    leader.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_setup_retry_after_failure() {
    let dir = TempDir::new().unwrap();
    let blocked = Configuration {
        bootstrap: true,
        ..durable(dir.path())
    };
    std::fs::remove_dir(&blocked.logs_path).unwrap();
    std::fs::write(&blocked.logs_path, b"").unwrap();

    let first = listener("127.0.0.1:0").await;
    let address = first.local_address();
    let result = ConsensusServer::setup(&blocked, first, KvStateMachine::new()).await;
    assert!(matches!(result, Err(Error::Path { .. })));

    let config = Configuration {
        logs_path: dir.path().join("logs-ok"),
        ..blocked
    };
    config.init().unwrap();
    let server = ConsensusServer::setup(&config, listener(&address).await, KvStateMachine::new())
        .await
        .unwrap();
    assert_eq!(server.cluster_status().startup, StartupMode::Bootstrapped);
    server.wait_for_leader(WAIT).await.unwrap();
    assert!(config.logs_path.join("transport.log").exists());
    assert!(config.logs_path.join("snapshots.log").exists());
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_and_restore() {
    let dir = TempDir::new().unwrap();
    let config = Configuration {
        bootstrap: true,
        snapshot_threshold: 4,
        ..durable(dir.path())
    };

    let first = listener("127.0.0.1:0").await;
    let address = first.local_address();
    let server = ConsensusServer::setup(&config, first, KvStateMachine::new())
        .await
        .unwrap();
    server.wait_for_leader(WAIT).await.unwrap();
    for i in 0..12 {
        server.apply(set(&format!("k{}", i), &i.to_string())).await.unwrap();
    }
    server.shutdown().await.unwrap();
    drop(server);

    let snapshots = std::fs::read_dir(config.data_path.join("snapshots"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .count();
    assert!((1..=2).contains(&snapshots));

    let kv = KvStateMachine::new();
    let server = ConsensusServer::setup(&config, listener(&address).await, kv.clone())
        .await
        .unwrap();
    server.wait_for_applied(WAIT).await.unwrap();
    for i in 0..12 {
        assert_eq!(kv.get(&format!("k{}", i)), Some(i.to_string()));
    }
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_after_compaction_installs_snapshot() {
    let leader_config = Configuration {
        dev_mode: true,
        snapshot_threshold: 64,
        ..Default::default()
    };
    let leader = ConsensusServer::setup(&leader_config, listener("127.0.0.1:0").await, KvStateMachine::new())
        .await
        .unwrap();
    leader.wait_for_leader(WAIT).await.unwrap();
    // Enough entries that the start of the log is compacted away.
    for i in 0..1200 {
        leader.apply(set(&format!("k{}", i), &i.to_string())).await.unwrap();
    }

    let follower_dir = TempDir::new().unwrap();
    let follower_config = durable(follower_dir.path());
    let follower_kv = KvStateMachine::new();
    let follower = ConsensusServer::setup(&follower_config, listener("127.0.0.1:0").await, follower_kv.clone())
        .await
        .unwrap();
    leader
        .add_voter(follower.id(), follower.address())
        .await
        .unwrap();

    // Needs the new member's acknowledgement to commit.
    leader.apply(set("after", "join")).await.unwrap();
    assert!(eventually(|| follower_kv.get("after").as_deref() == Some("join")).await);
    assert_eq!(follower_kv.get("k0"), Some("0".into()));
    assert_eq!(follower_kv.get("k1199"), Some("1199".into()));

    let installed = std::fs::read_dir(follower_config.data_path.join("snapshots"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .count();
    assert!(installed >= 1);
    assert!(eventually(|| follower.cluster_status().members.len() == 2).await);

    follower.shutdown().await.unwrap();
    leader.shutdown().await.unwrap();
}
