//! Subscription router
//!
//! The router is the broker's public face. It owns a fixed, power-of-two array of
//! shards and turns every call into a request on the queue of the shard that owns the
//! topic's hash:
//!
//! - `subscribe` / `unsubscribe` / `publish` hash the topic name, pick the shard from
//!   the hash's leading bits and enqueue. They return once the request is queued, not
//!   once it has been handled.
//! - A full queue makes the caller wait, up to the configured enqueue timeout, and then
//!   fails with [`BrokerError::Backpressure`]. A slow shard therefore throttles every
//!   producer whose topics hash into it.
//! - Requests for one topic from one caller keep their order. Requests landing in
//!   different shards have no relative order.
//!
//! `stats` reads per-shard counters without talking to the workers and is only good
//! for monitoring.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broker::hash::TopicHasher;
use crate::broker::request::Request;
use crate::broker::shard::Shard;
use crate::config::BrokerSettings;
use crate::connection::{CompactKey, Connection};
use crate::utils::error::BrokerError;

/// Point-in-time broker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Topics with at least one watcher, across all shards.
    pub topic_count: usize,
    /// Mean number of queued requests per shard, rounded down.
    pub average_queue_depth: usize,
}

struct Worker {
    stop: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

pub struct Router<T> {
    hasher: TopicHasher,
    shard_bits: u32,
    senders: Arc<[mpsc::Sender<Request<T>>]>,
    topic_counts: Vec<Arc<AtomicUsize>>,
    workers: Mutex<Vec<Worker>>,
    enqueue_timeout: Option<Duration>,
}

impl<T: Send + Sync + 'static> Router<T> {
    /// Upper bound for `shard_bits`.
    pub const MAX_SHARD_BITS: u32 = 16;

    /// Build the router and spawn one worker per shard.
    ///
    /// Fails with [`BrokerError::NoRuntime`] outside a tokio runtime.
    pub fn new(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        Self::with_hasher(settings, TopicHasher::new())
    }

    pub fn with_hasher(settings: &BrokerSettings, hasher: TopicHasher) -> Result<Self, BrokerError> {
        if settings.shard_bits > Self::MAX_SHARD_BITS {
            return Err(BrokerError::InvalidShardBits {
                bits: settings.shard_bits,
                max: Self::MAX_SHARD_BITS,
            });
        }
        if settings.queue_capacity == 0 {
            return Err(BrokerError::ZeroQueueCapacity);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BrokerError::NoRuntime)?;

        let shard_count = 1usize << settings.shard_bits;
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..shard_count)
            .map(|_| mpsc::channel::<Request<T>>(settings.queue_capacity))
            .unzip();
        let senders: Arc<[mpsc::Sender<Request<T>>]> = senders.into();

        let mut topic_counts = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for (index, incoming) in receivers.into_iter().enumerate() {
            let topic_count = Arc::new(AtomicUsize::new(0));
            let shard = Shard::new(
                index,
                settings.shard_bits,
                senders.clone(),
                topic_count.clone(),
            );
            let (stop, stopped) = oneshot::channel();
            let join = runtime.spawn(shard.run(incoming, stopped));
            topic_counts.push(topic_count);
            workers.push(Worker { stop, join });
        }

        info!(
            shards = shard_count,
            queue_capacity = settings.queue_capacity,
            "router started"
        );

        Ok(Self {
            hasher,
            shard_bits: settings.shard_bits,
            senders,
            topic_counts,
            workers: Mutex::new(workers),
            enqueue_timeout: match settings.enqueue_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        })
    }

    pub fn hasher(&self) -> &TopicHasher {
        &self.hasher
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Index of the shard that owns `name`.
    pub fn shard_for(&self, name: &[u8]) -> usize {
        self.hasher.hash(name).fractional_bits(self.shard_bits) as usize
    }

    pub async fn subscribe(
        &self,
        name: impl Into<Bytes>,
        conn: &Arc<Connection<T>>,
    ) -> Result<(), BrokerError> {
        let name = name.into();
        let topic = self.hasher.hash(&name);
        let shard = topic.fractional_bits(self.shard_bits) as usize;
        self.enqueue(
            shard,
            Request::Subscribe {
                topic,
                name,
                conn: conn.clone(),
            },
        )
        .await
    }

    pub async fn unsubscribe(&self, name: &[u8], conn: &Arc<Connection<T>>) -> Result<(), BrokerError> {
        let topic = self.hasher.hash(name);
        let shard = topic.fractional_bits(self.shard_bits) as usize;
        self.enqueue(
            shard,
            Request::Unsubscribe {
                topic,
                conn: conn.clone(),
            },
        )
        .await
    }

    /// Fan `payload` out to every watcher of `name` except `sender`.
    ///
    /// Publishing to a topic nobody watches is not an error.
    pub async fn publish(
        &self,
        name: &[u8],
        sender: &Arc<Connection<T>>,
        payload: impl Into<Bytes>,
    ) -> Result<(), BrokerError> {
        let topic = self.hasher.hash(name);
        let shard = topic.fractional_bits(self.shard_bits) as usize;
        self.enqueue(
            shard,
            Request::Publish {
                topic,
                sender: sender.clone(),
                payload: payload.into(),
            },
        )
        .await
    }

    /// Wait until every shard has handled everything queued before this call.
    pub async fn flush(&self) -> Result<(), BrokerError> {
        let mut acks = Vec::with_capacity(self.shard_count());
        for shard in 0..self.shard_count() {
            let (ack, acked) = oneshot::channel();
            self.enqueue(shard, Request::Flush { ack }).await?;
            acks.push((shard, acked));
        }
        for (shard, acked) in acks {
            acked.await.map_err(|_| BrokerError::ShardStopped { shard })?;
        }
        Ok(())
    }

    /// Keys of the connections currently watching `name`, as seen by its shard.
    pub async fn watchers(&self, name: &[u8]) -> Result<Vec<CompactKey>, BrokerError> {
        let topic = self.hasher.hash(name);
        let shard = topic.fractional_bits(self.shard_bits) as usize;
        let (reply, replied) = oneshot::channel();
        self.enqueue(shard, Request::Watchers { topic, reply }).await?;
        replied.await.map_err(|_| BrokerError::ShardStopped { shard })
    }

    /// Topic count and average queue depth. Not synchronized with the workers.
    pub fn stats(&self) -> Stats {
        let topic_count = self
            .topic_counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum();
        let queued: usize = self
            .senders
            .iter()
            .map(|sender| sender.max_capacity() - sender.capacity())
            .sum();
        Stats {
            topic_count,
            average_queue_depth: queued / self.shard_count(),
        }
    }

    /// Stop every shard and wait for the workers to exit.
    ///
    /// Requests still queued are dropped; later calls fail with `ShardStopped`.
    pub async fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        let mut joins = Vec::with_capacity(workers.len());
        for worker in workers {
            let _ = worker.stop.send(());
            joins.push(worker.join);
        }
        for join in joins {
            if let Err(err) = join.await {
                debug!(error = %err, "shard worker ended abnormally");
            }
        }
        info!("router stopped");
    }

    /// Periodically log `stats()`. Runs until the task is dropped.
    pub async fn start_stats_loop(router: Arc<Router<T>>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = router.stats();
            info!(
                topics = stats.topic_count,
                queue_depth = stats.average_queue_depth,
                "broker stats"
            );
        }
    }

    async fn enqueue(&self, shard: usize, request: Request<T>) -> Result<(), BrokerError> {
        let queue = &self.senders[shard];
        match self.enqueue_timeout {
            Some(waited) => queue
                .send_timeout(request, waited)
                .await
                .map_err(|err| match err {
                    SendTimeoutError::Timeout(_) => BrokerError::Backpressure { shard, waited },
                    SendTimeoutError::Closed(_) => BrokerError::ShardStopped { shard },
                }),
            None => queue
                .send(request)
                .await
                .map_err(|_| BrokerError::ShardStopped { shard }),
        }
    }
}
