//! Multi-node replication scenarios: conflict determinism, convergence over
//! live channels, and bootstrap resync after a node was away.

use std::sync::Arc;

use crate::clock::MockClock;
use crate::net::{ClientConfig, EngineClient, EngineServer, ServerConfig};
use crate::replication::ReplicationHub;
use crate::tests::{eventually, trace_init};
use crate::AssetTree;

struct Node {
    server: Arc<EngineServer>,
    addr: std::net::SocketAddr,
    clock: Arc<MockClock>,
}

async fn node(identifier: u8, now: u64) -> Node {
    let clock = Arc::new(MockClock::new(now));
    let tree = AssetTree::new(identifier, clock.clone());
    let server = EngineServer::new(tree, ServerConfig::default());
    let addr = server.bind("127.0.0.1:0").await.unwrap();
    Node {
        server,
        addr,
        clock,
    }
}

async fn session(from: &Node, to: &Node, path: &str) -> (EngineClient, ReplicationHub) {
    let client = EngineClient::connect(
        to.addr,
        ClientConfig {
            call_timeout_ms: 2_000,
            ..ClientConfig::default()
        },
        from.clock.clone(),
    )
    .await
    .unwrap();
    let hub = ReplicationHub::new(client.clone(), path);
    let replication = from.server.tree().acquire(path).unwrap().replication().clone();
    hub.bootstrap(&replication, from.server.tree().identifier())
        .await
        .unwrap();
    (client, hub)
}

fn value_of(node: &Node, path: &str, key: &[u8]) -> Option<Vec<u8>> {
    node.server
        .tree()
        .acquire(path)
        .unwrap()
        .map()
        .get(key)
        .unwrap()
}

#[tokio::test]
async fn timestamp_tie_converges_to_the_smaller_identifier() {
    trace_init();
    // Both nodes write the same key at the same wall-clock instant.
    let n1 = node(1, 100).await;
    let n2 = node(2, 100).await;
    n1.server.tree().acquire("/m").unwrap().map().put(b"k", b"A").unwrap();
    n2.server.tree().acquire("/m").unwrap().map().put(b"k", b"B").unwrap();

    // One session replicates both directions over the one channel.
    let (_client, _hub) = session(&n1, &n2, "/m").await;

    eventually("both nodes agree on node 1's value", 5_000, || async {
        value_of(&n1, "/m", b"k") == Some(b"A".to_vec())
            && value_of(&n2, "/m", b"k") == Some(b"A".to_vec())
    })
    .await;
}

#[tokio::test]
async fn disjoint_writes_merge_in_both_directions() {
    trace_init();
    let n1 = node(1, 1_000).await;
    let n2 = node(2, 2_000).await;
    let a1 = n1.server.tree().acquire("/merge").unwrap();
    let a2 = n2.server.tree().acquire("/merge").unwrap();
    a1.map().put(b"only-on-1", b"x").unwrap();
    a2.map().put(b"only-on-2", b"y").unwrap();

    let (_client, _hub) = session(&n1, &n2, "/merge").await;

    eventually("both hold both keys", 5_000, || async {
        value_of(&n1, "/merge", b"only-on-2") == Some(b"y".to_vec())
            && value_of(&n2, "/merge", b"only-on-1") == Some(b"x".to_vec())
    })
    .await;
}

#[tokio::test]
async fn later_timestamp_wins_regardless_of_identifier() {
    trace_init();
    let n1 = node(1, 100).await;
    let n2 = node(2, 900).await; // node 2's clock is ahead
    n1.server.tree().acquire("/lww").unwrap().map().put(b"k", b"older").unwrap();
    n2.server.tree().acquire("/lww").unwrap().map().put(b"k", b"newer").unwrap();

    let (_client, _hub) = session(&n1, &n2, "/lww").await;

    eventually("newer write wins everywhere", 5_000, || async {
        value_of(&n1, "/lww", b"k") == Some(b"newer".to_vec())
            && value_of(&n2, "/lww", b"k") == Some(b"newer".to_vec())
    })
    .await;
}

#[tokio::test]
async fn deletes_replicate_as_tombstones() {
    trace_init();
    let n1 = node(1, 100).await;
    let n2 = node(2, 100).await;
    let a1 = n1.server.tree().acquire("/del").unwrap();
    a1.map().put(b"k", b"v").unwrap();

    let (_client, _hub) = session(&n1, &n2, "/del").await;
    eventually("value replicated", 5_000, || async {
        value_of(&n2, "/del", b"k") == Some(b"v".to_vec())
    })
    .await;

    n1.clock.advance(10);
    a1.map().remove(b"k").unwrap();
    eventually("tombstone replicated", 5_000, || async {
        value_of(&n2, "/del", b"k").is_none()
    })
    .await;
}

#[tokio::test]
async fn changes_made_while_subscribed_keep_flowing() {
    trace_init();
    let n1 = node(1, 100).await;
    let n2 = node(2, 100).await;
    let (_client, _hub) = session(&n1, &n2, "/live").await;

    let a1 = n1.server.tree().acquire("/live").unwrap();
    for i in 0..20u8 {
        n1.clock.advance(1);
        a1.map().put(&[i], &[i, i]).unwrap();
    }
    eventually("all live changes arrive", 5_000, || async {
        value_of(&n2, "/live", &[19]) == Some(vec![19, 19])
            && n2
                .server
                .tree()
                .acquire("/live")
                .unwrap()
                .map()
                .len()
                .unwrap()
                == 20
    })
    .await;
}

#[tokio::test]
async fn bootstrap_resync_brings_a_late_node_to_parity() {
    trace_init();
    // Node 1 accumulates state while node 2 is away entirely.
    let n1 = node(1, 10_000).await;
    let a1 = n1.server.tree().acquire("/resync").unwrap();
    for i in 0..200u32 {
        n1.clock.advance(5);
        a1.map().put(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
    }

    let n2 = node(2, 20_000).await;
    let (_client, _hub) = session(&n2, &n1, "/resync").await;

    eventually("late node catches up", 10_000, || async {
        n2.server
            .tree()
            .acquire("/resync")
            .unwrap()
            .map()
            .len()
            .unwrap()
            == 200
    })
    .await;
    assert_eq!(
        value_of(&n2, "/resync", &7u32.to_be_bytes()),
        Some(7u32.to_le_bytes().to_vec())
    );
    assert_eq!(
        value_of(&n1, "/resync", &199u32.to_be_bytes()),
        Some(199u32.to_le_bytes().to_vec())
    );
}

/// Lock-free CAS loop under contention: many threads recording changes to
/// one key never lose an update and keep timestamps strictly increasing.
#[test]
fn concurrent_on_change_never_loses_updates() {
    use crate::replication::state::ReplicationRecord;
    use crate::replication::{ReplicationEntry, ReplicationState, StoreAccess};
    use crate::store::{KvBackend, MemBackend};
    use crate::EngineError;

    struct Nop;
    impl StoreAccess for Nop {
        fn apply_change(&self, _: &ReplicationEntry) -> Result<(), EngineError> {
            Ok(())
        }
        fn current_value(&self, _: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
            Ok(None)
        }
    }

    let records: Arc<dyn KvBackend> = MemBackend::new();
    let state = ReplicationState::new(1, records.clone(), Arc::new(Nop));

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let state = state.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    state.on_put(b"hot", 0).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let rec = ReplicationRecord::decode(&records.get(b"hot").unwrap().unwrap()).unwrap();
    // 400 recorded changes, each strictly after the one before.
    assert_eq!(rec.timestamp, 400);
}
