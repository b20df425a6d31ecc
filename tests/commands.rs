use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use multiraft::testing::{InMemoryNetwork, InMemoryStorage, InMemoryTransport};
use multiraft::{new_engine, Config, Event, GroupMembers, MembershipOp};

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

async fn wait_for_leader(events: &mut tokio::sync::mpsc::Receiver<Event>) {
    loop {
        tokio::time::advance(Duration::from_millis(25)).await;
        if let Ok(Some(Event::LeaderElection { .. })) =
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await
        {
            return;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn submitted_command_is_committed_and_emitted_in_order() {
    let network = InMemoryNetwork::new();
    let transport = Arc::new(InMemoryTransport::new(network));
    let storage = InMemoryStorage::new();
    let (engine, mut events) = new_engine(node(1), fast_config(), transport, storage).unwrap();
    engine.start().await.unwrap();
    engine.create_group(1, GroupMembers::new([node(1)])).await.unwrap();
    wait_for_leader(&mut events).await;

    engine.submit_command(1, Bytes::from_static(b"one")).await.unwrap();
    engine.submit_command(1, Bytes::from_static(b"two")).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
            Event::CommandCommitted { payload, .. } => seen.push(payload),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(seen, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
}

#[tokio::test(start_paused = true)]
async fn submit_command_on_non_leader_is_rejected() {
    let network = InMemoryNetwork::new();
    let transport = Arc::new(InMemoryTransport::new(network));
    let storage = InMemoryStorage::new();
    let (engine1, _events1) = new_engine(node(1), fast_config(), transport, storage).unwrap();
    engine1.start().await.unwrap();
    engine1.create_group(1, GroupMembers::new([node(1), node(2)])).await.unwrap();

    // node 1 never gets a quorum by itself with node 2 absent, so it stays
    // a candidate/follower and must reject local submissions.
    tokio::time::advance(Duration::from_millis(50)).await;
    let result = engine1.submit_command(1, Bytes::from_static(b"nope")).await;
    assert!(result.is_err());
}

#[tokio::test(start_paused = true)]
async fn three_node_cluster_commits_a_command_on_every_engine() {
    let network = InMemoryNetwork::new();
    let members = GroupMembers::new([node(1), node(2), node(3)]);

    let mut engines = Vec::new();
    let mut receivers = Vec::new();
    for n in [1u32, 2, 3] {
        let transport = Arc::new(InMemoryTransport::new(network.clone()));
        let storage = InMemoryStorage::new();
        let (engine, events) = new_engine(node(n), fast_config(), transport, storage).unwrap();
        engine.start().await.unwrap();
        engines.push((node(n), engine));
        receivers.push(events);
    }
    for (_, engine) in &engines {
        engine.create_group(1, members.clone()).await.unwrap();
    }

    tokio::time::advance(Duration::from_millis(100)).await;
    let mut leader = None;
    for events in receivers.iter_mut() {
        if let Ok(Some(Event::LeaderElection { leader: l, .. })) =
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await
        {
            leader = Some(l);
        }
    }
    let leader = leader.expect("exactly one node should report itself elected within the timeout");

    let (_, leader_engine) = engines.iter().find(|(id, _)| *id == leader).expect("elected leader is one of ours");
    leader_engine.submit_command(1, Bytes::from_static(b"quorum")).await.unwrap();

    // Every engine in the group — leader and followers alike — must see the
    // command committed once it replicates to a quorum, exercising
    // broadcast_append_entries/outstanding_append correlation end to end.
    for events in receivers.iter_mut() {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
            Event::CommandCommitted { group, payload } => {
                assert_eq!(group, 1);
                assert_eq!(payload, Bytes::from_static(b"quorum"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn membership_change_is_reflected_after_commit() {
    let network = InMemoryNetwork::new();
    let transport = Arc::new(InMemoryTransport::new(network));
    let storage = InMemoryStorage::new();
    let (engine, mut events) = new_engine(node(1), fast_config(), transport, storage).unwrap();
    engine.start().await.unwrap();
    engine.create_group(1, GroupMembers::new([node(1)])).await.unwrap();
    wait_for_leader(&mut events).await;

    let index = engine.change_group_membership(1, MembershipOp::AddObserver, node(2)).await.unwrap();
    assert!(index > 0);
}
