//! End-to-end wire protocol scenarios over loopback TCP.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::asset::MapEvent;
use crate::clock::SystemClock;
use crate::csp::Csp;
use crate::net::{ClientConfig, EngineClient, EngineServer, ServerConfig};
use crate::tests::{eventually, trace_init};
use crate::wire::{Document, WireValue};
use crate::AssetTree;

async fn start_server() -> (Arc<EngineServer>, std::net::SocketAddr) {
    let tree = AssetTree::new(1, Arc::new(SystemClock));
    let server = EngineServer::new(tree, ServerConfig::default());
    let addr = server.bind("127.0.0.1:0").await.unwrap();
    (server, addr)
}

fn client_config() -> ClientConfig {
    ClientConfig {
        call_timeout_ms: 2_000,
        ..ClientConfig::default()
    }
}

async fn connect(addr: std::net::SocketAddr) -> EngineClient {
    EngineClient::connect(addr, client_config(), Arc::new(SystemClock))
        .await
        .unwrap()
}

#[tokio::test]
async fn sync_put_then_get_round_trips() {
    trace_init();
    let (_server, addr) = start_server().await;
    let client = connect(addr).await;
    let map = client.remote_map("/m");

    assert_eq!(map.put(b"a", &[0x01, 0x02]).await.unwrap(), None);
    assert_eq!(map.get(b"a").await.unwrap(), Some(vec![0x01, 0x02]));
    assert_eq!(map.get(b"missing").await.unwrap(), None);
    // Second put returns the replaced value.
    assert_eq!(map.put(b"a", &[0x03]).await.unwrap(), Some(vec![0x01, 0x02]));
    client.close();
}

#[tokio::test]
async fn map_operations_cover_the_catalogue() {
    trace_init();
    let (_server, addr) = start_server().await;
    let client = connect(addr).await;
    let map = client.remote_map("/ops");

    assert_eq!(map.put_if_absent(b"k", b"1").await.unwrap(), None);
    assert_eq!(
        map.put_if_absent(b"k", b"2").await.unwrap(),
        Some(b"1".to_vec())
    );
    assert!(map.contains_key(b"k").await.unwrap());
    assert!(map.contains_value(b"1").await.unwrap());
    assert!(!map.contains_key(b"nope").await.unwrap());

    assert_eq!(map.replace(b"k", b"3").await.unwrap(), Some(b"1".to_vec()));
    assert_eq!(map.replace(b"nope", b"x").await.unwrap(), None);
    assert!(map.replace_for_old(b"k", b"3", b"4").await.unwrap());
    assert!(!map.replace_for_old(b"k", b"3", b"5").await.unwrap());
    assert!(!map.remove_with_value(b"k", b"3").await.unwrap());
    assert!(map.remove_with_value(b"k", b"4").await.unwrap());

    map.put_all(&[
        (b"x".to_vec(), b"1".to_vec()),
        (b"y".to_vec(), b"2".to_vec()),
    ])
    .await
    .unwrap();
    eventually("putAll lands", 2_000, || async {
        map.size().await.unwrap() == 2
    })
    .await;

    map.clear().await.unwrap();
    assert_eq!(map.size().await.unwrap(), 0);
    client.close();
}

#[tokio::test]
async fn streaming_subscription_sees_insert_then_update() {
    trace_init();
    let (server, addr) = start_server().await;
    let client = connect(addr).await;
    let map = client.remote_map("/sub");

    let events: Arc<Mutex<Vec<MapEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let tid = map
        .subscribe(move |e| sink.lock().unwrap().push(e))
        .unwrap();
    assert!(tid > 0);

    // Give the registration time to land, then mutate server-side.
    let asset = server.tree().acquire("/sub").unwrap();
    eventually("subscriber registered", 2_000, || async {
        asset.subscriptions().count() == 1
    })
    .await;
    asset.map().put(b"x", b"1").unwrap();
    asset.map().put(b"x", b"2").unwrap();

    eventually("two documents on one tid", 2_000, || async {
        events.lock().unwrap().len() == 2
    })
    .await;
    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            MapEvent::Insert {
                key: b"x".to_vec(),
                value: b"1".to_vec()
            },
            MapEvent::Update {
                key: b"x".to_vec(),
                old_value: b"1".to_vec(),
                value: b"2".to_vec()
            },
        ]
    );
    client.close();
}

#[tokio::test]
async fn unsubscribe_is_acknowledged_and_idempotent() {
    trace_init();
    let (server, addr) = start_server().await;
    let client = connect(addr).await;
    let map = client.remote_map("/unsub");

    let events: Arc<Mutex<Vec<MapEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let tid = map
        .subscribe(move |e| sink.lock().unwrap().push(e))
        .unwrap();

    let asset = server.tree().acquire("/unsub").unwrap();
    eventually("subscriber registered", 2_000, || async {
        asset.subscriptions().count() == 1
    })
    .await;

    map.unsubscribe(tid).unwrap();
    eventually("server listener removed", 2_000, || async {
        asset.subscriptions().count() == 0
    })
    .await;

    // The terminal document also removed the client-side registration.
    eventually("client registration removed", 2_000, || async {
        !client.unsubscribe(tid)
    })
    .await;

    // Events after the unsubscribe never arrive.
    asset.map().put(b"late", b"1").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.lock().unwrap().is_empty());

    // A second unsubscribe on the same tid only logs a warning server-side.
    map.unsubscribe(tid).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(map.size().await.unwrap(), 1, "connection survived");
    client.close();
}

#[tokio::test]
async fn subscriber_counts_track_registrations() {
    trace_init();
    let (server, addr) = start_server().await;
    let client = connect(addr).await;
    let map = client.remote_map("/counts");

    assert_eq!(map.key_subscriber_count().await.unwrap(), 0);
    assert_eq!(map.entry_subscriber_count().await.unwrap(), 0);
    assert_eq!(map.topic_subscriber_count().await.unwrap(), 0);

    let tid = map.subscribe(|_| {}).unwrap();
    let asset = server.tree().acquire("/counts").unwrap();
    eventually("map subscriber registered", 2_000, || async {
        asset.subscriptions().count() == 1
    })
    .await;
    assert_eq!(map.key_subscriber_count().await.unwrap(), 1);
    assert_eq!(map.entry_subscriber_count().await.unwrap(), 1);

    let topic = client.remote_topic("/counts");
    topic.subscribe(|_, _| {}).unwrap();
    eventually("topic subscriber registered", 2_000, || async {
        map.topic_subscriber_count().await.unwrap() == 1
    })
    .await;

    map.unsubscribe(tid).unwrap();
    eventually("counts drop after unsubscribe", 2_000, || async {
        map.key_subscriber_count().await.unwrap() == 0
            && map.entry_subscriber_count().await.unwrap() == 0
    })
    .await;
    // The topic subscription is untouched by the map unsubscribe.
    assert_eq!(map.topic_subscriber_count().await.unwrap(), 1);
    client.close();
}

#[tokio::test]
async fn key_set_returns_a_proxy_not_a_collection() {
    trace_init();
    let (_server, addr) = start_server().await;
    let client = connect(addr).await;
    let map = client.remote_map("/proxy");

    let keys = map.key_set().await.unwrap();
    assert!(keys.csp().contains("view=keySet"), "{}", keys.csp());
    assert!(keys.cid() > 0);
    assert_eq!(keys.size().await.unwrap(), 0);
    assert!(keys.is_empty().await.unwrap());

    map.put(b"a", b"1").await.unwrap();
    map.put(b"b", b"2").await.unwrap();

    // csp and cid address the same view interchangeably.
    assert_eq!(keys.size().await.unwrap(), 2);
    assert_eq!(keys.size_via_csp().await.unwrap(), 2);
    assert!(keys.contains(b"a").await.unwrap());
    assert!(!keys.contains(b"z").await.unwrap());

    let values = map.values().await.unwrap();
    assert!(values.contains(b"2").await.unwrap());
    let entries = map.entry_set().await.unwrap();
    assert_eq!(entries.size().await.unwrap(), 2);
    client.close();
}

#[tokio::test]
async fn put_returns_null_suppresses_old_values() {
    trace_init();
    let (_server, addr) = start_server().await;
    let client = connect(addr).await;
    let csp = Csp::parse("/flags?view=map&putReturnsNull=true&removeReturnsNull=true").unwrap();
    let map = client.remote_map_with(csp);

    assert_eq!(map.put(b"k", b"1").await.unwrap(), None);
    eventually("fire-and-forget put lands", 2_000, || async {
        map.get(b"k").await.unwrap() == Some(b"1".to_vec())
    })
    .await;
    // Even the explicit getAndPut omits the old value on a flagged map.
    assert_eq!(map.get_and_put(b"k", b"2").await.unwrap(), None);
    assert_eq!(map.remove(b"k").await.unwrap(), None);
    eventually("fire-and-forget remove lands", 2_000, || async {
        map.get(b"k").await.unwrap().is_none()
    })
    .await;
    client.close();
}

#[tokio::test]
async fn topic_publish_reaches_subscribers() {
    trace_init();
    let (_server, addr) = start_server().await;
    let publisher = connect(addr).await;
    let subscriber = connect(addr).await;

    let got: Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = got.clone();
    let topic = subscriber.remote_topic("/news");
    topic
        .subscribe(move |t, m| sink.lock().unwrap().push((t, m)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    publisher
        .remote_topic("/news")
        .publish(b"eu", b"rates up")
        .unwrap();

    eventually("message delivered", 2_000, || async {
        !got.lock().unwrap().is_empty()
    })
    .await;
    assert_eq!(
        got.lock().unwrap()[0],
        (b"eu".to_vec(), b"rates up".to_vec())
    );
    publisher.close();
    subscriber.close();
}

#[tokio::test]
async fn unknown_events_do_not_kill_the_connection() {
    trace_init();
    let (_server, addr) = start_server().await;
    let mut cfg = client_config();
    cfg.call_timeout_ms = 300;
    let client = EngineClient::connect(addr, cfg, Arc::new(SystemClock))
        .await
        .unwrap();
    let map = client.remote_map("/robust");
    map.put(b"k", b"v").await.unwrap();

    // Unknown event: the server logs the violation and omits the reply, so
    // the caller times out.
    let err = client
        .request(
            crate::net::Target::Csp(map.uri()),
            Document::new().with("definitelyNotAnEvent", WireValue::Null),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, crate::EngineError::Timeout));

    // Null argument: same treatment.
    let err = client
        .request(
            crate::net::Target::Csp(map.uri()),
            Document::new().with("get", WireValue::Null),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, crate::EngineError::Timeout));

    // The channel is still perfectly usable.
    assert_eq!(map.get(b"k").await.unwrap(), Some(b"v".to_vec()));
    client.close();
}

#[tokio::test]
async fn concurrent_tids_are_unique_and_increasing() {
    trace_init();
    let (_server, addr) = start_server().await;
    let client = connect(addr).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let mut tids = Vec::with_capacity(100);
            for _ in 0..100 {
                tids.push(client.next_tid());
            }
            tids
        }));
    }
    let mut all = Vec::new();
    for h in handles {
        let tids = h.await.unwrap();
        // Increasing within each allocating task.
        assert!(tids.windows(2).all(|w| w[0] < w[1]));
        all.extend(tids);
    }
    let before = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), before, "no two requests may share a tid");
    client.close();
}

#[tokio::test]
async fn text_format_channel_interoperates() {
    trace_init();
    let tree = AssetTree::new(1, Arc::new(SystemClock));
    let server = EngineServer::new(
        tree,
        ServerConfig {
            format: crate::WireFormat::Text,
            ..ServerConfig::default()
        },
    );
    let addr = server.bind("127.0.0.1:0").await.unwrap();
    let client = EngineClient::connect(
        addr,
        ClientConfig {
            format: crate::WireFormat::Text,
            call_timeout_ms: 2_000,
            ..ClientConfig::default()
        },
        Arc::new(SystemClock),
    )
    .await
    .unwrap();

    let map = client.remote_map("/text");
    map.put(b"a", &[1, 2]).await.unwrap();
    assert_eq!(map.get(b"a").await.unwrap(), Some(vec![1, 2]));
    assert_eq!(map.size().await.unwrap(), 1);
    client.close();
}
