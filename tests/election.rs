use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use multiraft::testing::{InMemoryNetwork, InMemoryStorage, InMemoryTransport};
use multiraft::{new_engine, Config, Event, GroupMembers};

fn node(n: u32) -> multiraft::NodeId {
    NonZeroU32::new(n).unwrap()
}

fn fast_config() -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config {
        election_timeout_min: Duration::from_millis(10),
        election_timeout_max: Duration::from_millis(20),
        ..Config::default()
    }
}

#[tokio::test(start_paused = true)]
async fn single_node_cluster_elects_itself_leader() {
    let network = InMemoryNetwork::new();
    let transport = Arc::new(InMemoryTransport::new(network));
    let storage = InMemoryStorage::new();

    let (engine, mut events) = new_engine(node(1), fast_config(), transport, storage).unwrap();
    engine.start().await.unwrap();
    engine.create_group(1, GroupMembers::new([node(1)])).await.unwrap();

    tokio::time::advance(Duration::from_millis(50)).await;

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap();
    match event {
        Event::LeaderElection { group, leader } => {
            assert_eq!(group, 1);
            assert_eq!(leader, node(1));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn three_node_cluster_elects_a_single_leader() {
    let network = InMemoryNetwork::new();

    let members = GroupMembers::new([node(1), node(2), node(3)]);
    let mut engines = Vec::new();
    let mut receivers = Vec::new();
    for n in [1u32, 2, 3] {
        let transport = Arc::new(InMemoryTransport::new(network.clone()));
        let storage = InMemoryStorage::new();
        let (engine, events) = new_engine(node(n), fast_config(), transport, storage).unwrap();
        engine.start().await.unwrap();
        engines.push(engine);
        receivers.push(events);
    }
    for engine in &engines {
        engine.create_group(1, members.clone()).await.unwrap();
    }

    tokio::time::advance(Duration::from_millis(100)).await;

    let mut leaders = std::collections::HashSet::new();
    for events in receivers.iter_mut() {
        if let Ok(Some(Event::LeaderElection { leader, .. })) =
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await
        {
            leaders.insert(leader);
        }
    }
    assert_eq!(leaders.len(), 1, "exactly one node should report itself elected, got {leaders:?}");
}

#[tokio::test(start_paused = true)]
async fn partitioned_minority_cannot_elect_a_leader() {
    let network = InMemoryNetwork::new();
    network.partition(node(1), node(2));
    network.partition(node(1), node(3));

    let members = GroupMembers::new([node(1), node(2), node(3)]);
    let transport1 = Arc::new(InMemoryTransport::new(network.clone()));
    let (engine1, mut events1) = new_engine(node(1), fast_config(), transport1, InMemoryStorage::new()).unwrap();
    engine1.start().await.unwrap();
    engine1.create_group(1, members).await.unwrap();

    tokio::time::advance(Duration::from_millis(200)).await;

    let result = tokio::time::timeout(Duration::from_millis(300), events1.recv()).await;
    assert!(result.is_err(), "an isolated node must never elect itself leader");
}
