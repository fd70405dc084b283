use super::hash::{TopicHash, TopicHasher};
use super::request::Request;
use super::shard::Shard;
use super::{Router, Stats};
use crate::config::BrokerSettings;
use crate::connection::recording::{FakePeer, RecordingHandler};
use crate::connection::{CompactKey, Connection, ConnectionHandler, ConnectionRegistry};
use crate::utils::error::{BrokerError, TransportError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::mpsc;

fn settings(shard_bits: u32, queue_capacity: usize, enqueue_timeout_ms: u64) -> BrokerSettings {
    BrokerSettings {
        shard_bits,
        queue_capacity,
        enqueue_timeout_ms,
        ..BrokerSettings::default()
    }
}

fn setup() -> (
    Router<FakePeer>,
    ConnectionRegistry<FakePeer>,
    RecordingHandler,
) {
    let handler = RecordingHandler::default();
    let registry = ConnectionRegistry::new(handler.clone());
    let router = Router::with_hasher(&settings(3, 64, 1000), TopicHasher::with_keys(11, 42))
        .expect("router");
    (router, registry, handler)
}

fn keyset(keys: Vec<CompactKey>) -> HashSet<CompactKey> {
    keys.into_iter().collect()
}

// ---- hashing ----

#[test]
fn test_hash_is_deterministic_per_key() {
    let hasher = TopicHasher::new();
    for name in ["", "a", "kitchen/temp", "\u{1F4A1} lights"] {
        assert_eq!(hasher.hash(name.as_bytes()), hasher.hash(name.as_bytes()));
    }

    let a = TopicHasher::with_keys(1, 2);
    let b = TopicHasher::with_keys(1, 3);
    assert_eq!(a.hash(b"topic"), TopicHasher::with_keys(1, 2).hash(b"topic"));
    assert_ne!(a.hash(b"topic"), b.hash(b"topic"));
    assert_ne!(a.hash(b"topic"), a.hash(b"topic2"));
}

#[test]
fn test_fractional_bits_reads_leading_bits() {
    let hash = TopicHash::from_parts(0xA000_0000_0000_0001, 0xFFFF);
    assert_eq!(hash.fractional_bits(0), 0);
    assert_eq!(hash.fractional_bits(1), 1);
    assert_eq!(hash.fractional_bits(3), 0b101);
    assert_eq!(hash.fractional_bits(4), 0b1010);
    assert_eq!(hash.fractional_bits(64), 0xA000_0000_0000_0001);
    assert_eq!(hash.compact(), hash.high());
    assert_eq!(hash.low(), 0xFFFF);
    assert_eq!(hash.to_string(), "a000000000000001");
}

#[test]
fn test_hash_spreads_names_evenly_across_shards() {
    let hasher = TopicHasher::new();
    let shard_bits = 6;
    let names = 100_000;
    let mut counts = vec![0usize; 1 << shard_bits];
    for i in 0..names {
        let name = format!("topic-{i}");
        counts[hasher.hash(name.as_bytes()).fractional_bits(shard_bits) as usize] += 1;
    }

    let mean = names / counts.len();
    let max = *counts.iter().max().unwrap();
    let min = *counts.iter().min().unwrap();
    assert!(max < 2 * mean, "max shard {max} vs mean {mean}");
    assert!(min > mean / 2, "min shard {min} vs mean {mean}");
}

// ---- router construction ----

#[tokio::test]
async fn test_router_rejects_bad_settings() {
    let err = Router::<FakePeer>::new(&settings(17, 32, 0)).err();
    assert_eq!(err, Some(BrokerError::InvalidShardBits { bits: 17, max: 16 }));

    let err = Router::<FakePeer>::new(&settings(3, 0, 0)).err();
    assert_eq!(err, Some(BrokerError::ZeroQueueCapacity));

    let router = Router::<FakePeer>::new(&settings(0, 1, 0)).unwrap();
    assert_eq!(router.shard_count(), 1);
    assert_eq!(router.shard_for(b"anything"), 0);
}

#[test]
fn test_router_needs_a_runtime() {
    let err = Router::<FakePeer>::new(&BrokerSettings::default()).err();
    assert_eq!(err, Some(BrokerError::NoRuntime));
}

#[tokio::test]
async fn test_shard_for_matches_hash() {
    let (router, _, _) = setup();
    assert_eq!(router.shard_count(), 8);
    let hash = router.hasher().hash(b"garage/door");
    assert_eq!(router.shard_for(b"garage/door"), hash.fractional_bits(3) as usize);
}

// ---- publish / subscribe semantics ----

#[tokio::test]
async fn test_publish_skips_the_sender() {
    let (router, registry, handler) = setup();
    let alice = registry.admit(FakePeer::default());
    let bob = registry.admit(FakePeer::default());

    router.subscribe("lights", &alice).await.unwrap();
    router.subscribe("lights", &bob).await.unwrap();
    router.publish(b"lights", &alice, "on").await.unwrap();
    router.flush().await.unwrap();

    let to_bob = handler.journal.deliveries_to(bob.key());
    assert_eq!(to_bob.len(), 1);
    assert_eq!(to_bob[0].topic, Bytes::from_static(b"lights"));
    assert_eq!(to_bob[0].payload, Bytes::from_static(b"on"));
    assert!(handler.journal.deliveries_to(alice.key()).is_empty());
}

#[tokio::test]
async fn test_watcher_hears_the_name_it_subscribed_with() {
    let (router, registry, handler) = setup();
    let alice = registry.admit(FakePeer::default());
    let bob = registry.admit(FakePeer::default());

    router.subscribe(Bytes::from_static(b"\xffbinary\x00name"), &bob).await.unwrap();
    router.publish(b"\xffbinary\x00name", &alice, Bytes::from_static(b"1")).await.unwrap();
    router.flush().await.unwrap();

    let to_bob = handler.journal.deliveries_to(bob.key());
    assert_eq!(to_bob[0].topic, Bytes::from_static(b"\xffbinary\x00name"));
    assert_eq!(bob.subscribed_topics(), vec![Bytes::from_static(b"\xffbinary\x00name")]);
}

#[tokio::test]
async fn test_payload_is_shared_between_watchers() {
    let (router, registry, handler) = setup();
    let sender = registry.admit(FakePeer::default());
    let watchers: Vec<_> = (0..3).map(|_| registry.admit(FakePeer::default())).collect();
    for watcher in &watchers {
        router.subscribe("fanout", watcher).await.unwrap();
    }

    router.publish(b"fanout", &sender, vec![7u8; 1024]).await.unwrap();
    router.flush().await.unwrap();

    let deliveries = handler.journal.deliveries.lock();
    assert_eq!(deliveries.len(), 3);
    let first = deliveries[0].payload.as_ptr();
    assert!(deliveries.iter().all(|d| d.payload.as_ptr() == first));
}

#[tokio::test]
async fn test_unsubscribe_takes_effect() {
    let (router, registry, handler) = setup();
    let alice = registry.admit(FakePeer::default());
    let bob = registry.admit(FakePeer::default());

    router.subscribe("weather", &alice).await.unwrap();
    router.unsubscribe(b"weather", &alice).await.unwrap();
    router.publish(b"weather", &bob, "rain").await.unwrap();
    router.flush().await.unwrap();

    assert!(handler.journal.deliveries.lock().is_empty());
    assert!(alice.subscribed_topics().is_empty());
}

#[tokio::test]
async fn test_publish_to_nobody_is_silently_dropped() {
    let (router, registry, handler) = setup();
    let alice = registry.admit(FakePeer::default());

    router.publish(b"typo", &alice, "hello").await.unwrap();
    router.flush().await.unwrap();

    assert!(handler.journal.deliveries.lock().is_empty());
    assert_eq!(router.stats().topic_count, 0);
}

#[tokio::test]
async fn test_topic_is_collected_when_last_watcher_leaves() {
    let (router, registry, _) = setup();
    let alice = registry.admit(FakePeer::default());
    let bob = registry.admit(FakePeer::default());

    router.subscribe("a", &alice).await.unwrap();
    router.subscribe("a", &bob).await.unwrap();
    router.subscribe("b", &alice).await.unwrap();
    router.flush().await.unwrap();
    assert_eq!(
        router.stats(),
        Stats {
            topic_count: 2,
            average_queue_depth: 0
        }
    );

    router.unsubscribe(b"a", &alice).await.unwrap();
    router.flush().await.unwrap();
    assert_eq!(router.stats().topic_count, 2);

    router.unsubscribe(b"a", &bob).await.unwrap();
    router.flush().await.unwrap();
    assert_eq!(router.stats().topic_count, 1);
    assert!(router.watchers(b"a").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_subscribe_counts_once() {
    let (router, registry, handler) = setup();
    let alice = registry.admit(FakePeer::default());
    let bob = registry.admit(FakePeer::default());

    router.subscribe("dup", &bob).await.unwrap();
    router.subscribe("dup", &bob).await.unwrap();
    router.publish(b"dup", &alice, "x").await.unwrap();
    router.flush().await.unwrap();

    assert_eq!(handler.journal.deliveries_to(bob.key()).len(), 1);
    assert_eq!(router.watchers(b"dup").await.unwrap(), vec![bob.key()]);
}

// ---- dead peers ----

#[tokio::test]
async fn test_closed_watcher_is_dropped_on_next_publish() {
    let (router, registry, handler) = setup();
    let alice = registry.admit(FakePeer::default());
    let bob = registry.admit(FakePeer::default());
    let carol = registry.admit(FakePeer::default());

    router.subscribe("door", &alice).await.unwrap();
    router.subscribe("door", &carol).await.unwrap();
    router.flush().await.unwrap();
    alice.close(None);

    // still listed: nobody told the shard
    assert!(keyset(router.watchers(b"door").await.unwrap()).contains(&alice.key()));

    router.publish(b"door", &bob, "open").await.unwrap();
    router.flush().await.unwrap();

    assert!(handler.journal.deliveries_to(alice.key()).is_empty());
    assert_eq!(handler.journal.deliveries_to(carol.key()).len(), 1);
    assert_eq!(router.watchers(b"door").await.unwrap(), vec![carol.key()]);
}

#[tokio::test]
async fn test_dead_watcher_is_swept_from_its_other_topics() {
    let (router, registry, _) = setup();
    let alice = registry.admit(FakePeer::default());
    let bob = registry.admit(FakePeer::default());
    let carol = registry.admit(FakePeer::default());

    let names: Vec<String> = (0..32).map(|i| format!("room/{i}")).collect();
    let shards: HashSet<_> = names.iter().map(|n| router.shard_for(n.as_bytes())).collect();
    assert!(shards.len() > 1, "topics should span several shards");

    for name in &names {
        router.subscribe(name.clone(), &alice).await.unwrap();
        router.subscribe(name.clone(), &carol).await.unwrap();
    }
    router.flush().await.unwrap();
    alice.close(None);

    router.publish(names[0].as_bytes(), &bob, "ping").await.unwrap();
    // first flush: the publish and the sweep it triggers; second: forwarded unsubscribes
    router.flush().await.unwrap();
    router.flush().await.unwrap();

    for name in &names {
        assert_eq!(router.watchers(name.as_bytes()).await.unwrap(), vec![carol.key()]);
    }
    assert!(alice.subscribed_topics().is_empty());
    assert_eq!(router.stats().topic_count, names.len());
}

#[tokio::test]
async fn test_failed_write_closes_only_that_connection() {
    let (router, registry, handler) = setup();
    let broken = registry.admit(FakePeer { fail_writes: true });
    let healthy = registry.admit(FakePeer::default());
    let sender = registry.admit(FakePeer::default());

    router.subscribe("alerts", &broken).await.unwrap();
    router.subscribe("alerts", &healthy).await.unwrap();
    router.publish(b"alerts", &sender, "fire").await.unwrap();
    router.flush().await.unwrap();

    assert!(!broken.is_open());
    assert!(healthy.is_open());
    assert_eq!(handler.journal.deliveries_to(healthy.key()).len(), 1);
    assert_eq!(
        *handler.journal.closed.lock(),
        vec![(broken.key(), Some("write failed: peer reset".to_string()))]
    );
    assert_eq!(router.watchers(b"alerts").await.unwrap(), vec![healthy.key()]);
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_subscribe_from_closed_connection_is_ignored() {
    let (router, registry, _) = setup();
    let alice = registry.admit(FakePeer::default());
    alice.close(None);

    router.subscribe("late", &alice).await.unwrap();
    router.flush().await.unwrap();

    assert!(router.watchers(b"late").await.unwrap().is_empty());
    assert_eq!(router.stats().topic_count, 0);
}

// ---- backpressure & shutdown ----

/// Blocks every write until the test lets it through.
struct GateHandler {
    entered: Mutex<std::sync::mpsc::Sender<()>>,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl ConnectionHandler<FakePeer> for GateHandler {
    fn write(
        &self,
        _conn: &Connection<FakePeer>,
        _transport: &FakePeer,
        _topic: &[u8],
        _payload: &Bytes,
    ) -> Result<(), TransportError> {
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_surfaces_backpressure() {
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let registry = ConnectionRegistry::new(GateHandler {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    });
    let router = Router::new(&settings(0, 1, 50)).unwrap();
    let watcher = registry.admit(FakePeer::default());
    let sender = registry.admit(FakePeer::default());

    router.subscribe("slow", &watcher).await.unwrap();
    router.publish(b"slow", &sender, "1").await.unwrap();

    // the worker is now stuck inside the first write
    tokio::task::spawn_blocking(move || entered_rx.recv().unwrap())
        .await
        .unwrap();

    router.publish(b"slow", &sender, "2").await.unwrap();
    assert_eq!(router.stats().average_queue_depth, 1);

    let err = router.publish(b"slow", &sender, "3").await.unwrap_err();
    assert_eq!(
        err,
        BrokerError::Backpressure {
            shard: 0,
            waited: Duration::from_millis(50)
        }
    );

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
    let mut flushed = false;
    for _ in 0..50 {
        if router.flush().await.is_ok() {
            flushed = true;
            break;
        }
    }
    assert!(flushed, "queue never drained");
    assert_eq!(router.stats().average_queue_depth, 0);
}

#[tokio::test]
async fn test_shutdown_stops_accepting_requests() {
    let (router, registry, _) = setup();
    let alice = registry.admit(FakePeer::default());
    router.subscribe("x", &alice).await.unwrap();

    router.shutdown().await;
    router.shutdown().await;

    let err = router.publish(b"x", &alice, "late").await.unwrap_err();
    assert!(matches!(err, BrokerError::ShardStopped { .. }));
    assert!(router.flush().await.is_err());
}

// ---- concurrency ----

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_traffic_matches_serial_outcome() {
    let handler = RecordingHandler::default();
    let registry = ConnectionRegistry::new(handler);
    let router = Arc::new(Router::new(&settings(3, 16, 0)).unwrap());
    let topics: Vec<String> = (0..24).map(|i| format!("t/{i}")).collect();

    let mut tasks = Vec::new();
    for worker in 0..8u64 {
        let router = router.clone();
        let conn = registry.admit(FakePeer::default());
        let topics = topics.clone();
        tasks.push(tokio::spawn(async move {
            // Each task owns its connection, so its last op per topic decides membership.
            let mut member: HashMap<usize, bool> = HashMap::new();
            let mut seed = worker.wrapping_mul(6364136223846793005).wrapping_add(1);
            for _ in 0..300 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let topic = (seed >> 33) as usize % topics.len();
                let name = topics[topic].as_bytes();
                match (seed >> 20) % 3 {
                    0 => {
                        router.subscribe(topics[topic].clone(), &conn).await.unwrap();
                        member.insert(topic, true);
                    }
                    1 => {
                        router.unsubscribe(name, &conn).await.unwrap();
                        member.insert(topic, false);
                    }
                    _ => router.publish(name, &conn, "tick").await.unwrap(),
                }
            }
            (conn.key(), member)
        }));
    }

    let mut expected: HashMap<usize, HashSet<CompactKey>> = HashMap::new();
    for task in tasks {
        let (key, member) = tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("deadlock")
            .unwrap();
        for (topic, subscribed) in member {
            if subscribed {
                expected.entry(topic).or_default().insert(key);
            }
        }
    }
    router.flush().await.unwrap();

    for (index, name) in topics.iter().enumerate() {
        let actual = keyset(router.watchers(name.as_bytes()).await.unwrap());
        let wanted = expected.remove(&index).unwrap_or_default();
        assert_eq!(actual, wanted, "watchers of {name}");
    }
}

// ---- shard actor in isolation ----

#[test]
fn test_shard_creates_and_drops_subscriptions() {
    let (queue, _incoming) = mpsc::channel::<Request<FakePeer>>(4);
    let topic_count = Arc::new(AtomicUsize::new(0));
    let mut shard = Shard::new(0, 0, Arc::from(vec![queue]), topic_count.clone());
    let registry = ConnectionRegistry::new(RecordingHandler::default());
    let conn = registry.admit(FakePeer::default());
    let topic = TopicHasher::with_keys(3, 4).hash(b"solo");

    shard.handle(Request::Subscribe {
        topic,
        name: Bytes::from_static(b"solo"),
        conn: conn.clone(),
    });
    assert_eq!(topic_count.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(conn.topic_name(&topic), Some(Bytes::from_static(b"solo")));

    shard.handle(Request::Unsubscribe {
        topic,
        conn: conn.clone(),
    });
    assert_eq!(topic_count.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(conn.topic_name(&topic), None);
}
