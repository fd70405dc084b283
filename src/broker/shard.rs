//! Shard actor
//!
//! A shard owns one slice of the topic space: a private map from topic hash to watcher
//! set, mutated only by the shard's own worker task. Requests arrive through a bounded
//! queue and are handled one at a time, so the map needs no lock.
//!
//! Dead watchers are never pushed out when they close. A publish that finds one drops
//! it from the topic, then drains the peer's reverse topic map and routes an
//! unsubscribe for each of its other topics to the owning shard.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::broker::hash::TopicHash;
use crate::broker::request::Request;
use crate::broker::topic::Subscription;
use crate::connection::{CompactKey, Connection};

pub(crate) struct Shard<T> {
    index: usize,
    shard_bits: u32,
    subscriptions: HashMap<TopicHash, Subscription<T>>,
    /// Queues of every shard, this one included, for routing sweeps.
    peers: Arc<[mpsc::Sender<Request<T>>]>,
    topic_count: Arc<AtomicUsize>,
}

impl<T: Send + Sync + 'static> Shard<T> {
    pub(crate) fn new(
        index: usize,
        shard_bits: u32,
        peers: Arc<[mpsc::Sender<Request<T>>]>,
        topic_count: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            index,
            shard_bits,
            subscriptions: HashMap::new(),
            peers,
            topic_count,
        }
    }

    /// Worker loop. Returns on the stop signal, or when the stop handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut incoming: mpsc::Receiver<Request<T>>,
        mut stop: oneshot::Receiver<()>,
    ) {
        debug!(shard = self.index, "shard started");
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                request = incoming.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            }
        }
        debug!(
            shard = self.index,
            topics = self.subscriptions.len(),
            "shard stopped"
        );
    }

    pub(crate) fn handle(&mut self, request: Request<T>) {
        trace!(shard = self.index, kind = request.kind(), "handling request");
        match request {
            Request::Subscribe { topic, name, conn } => self.subscribe(topic, name, conn),
            Request::Unsubscribe { topic, conn } => self.unsubscribe(topic, &conn),
            Request::Publish {
                topic,
                sender,
                payload,
            } => self.publish(topic, &sender, &payload),
            Request::Flush { ack } => {
                let _ = ack.send(());
            }
            Request::Watchers { topic, reply } => {
                let keys = self
                    .subscriptions
                    .get(&topic)
                    .map(|sub| sub.watchers.keys().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(keys);
            }
        }
        self.topic_count
            .store(self.subscriptions.len(), Ordering::Relaxed);
    }

    fn subscribe(&mut self, topic: TopicHash, name: Bytes, conn: Arc<Connection<T>>) {
        if !conn.is_open() {
            debug!(shard = self.index, key = %conn.key(), "ignoring subscribe from closed connection");
            return;
        }
        conn.remember_topic(topic, name);
        self.subscriptions
            .entry(topic)
            .or_insert_with(Subscription::new)
            .watch(conn);
    }

    fn unsubscribe(&mut self, topic: TopicHash, conn: &Connection<T>) {
        conn.forget_topic(&topic);
        self.unwatch(topic, conn.key());
    }

    fn unwatch(&mut self, topic: TopicHash, key: CompactKey) {
        if let Some(sub) = self.subscriptions.get_mut(&topic) {
            sub.unwatch(key);
            if sub.is_empty() {
                self.subscriptions.remove(&topic);
                trace!(shard = self.index, %topic, "topic dropped");
            }
        }
    }

    fn publish(&mut self, topic: TopicHash, sender: &Connection<T>, payload: &Bytes) {
        let Some(sub) = self.subscriptions.get_mut(&topic) else {
            trace!(shard = self.index, %topic, "publish to topic without watchers");
            return;
        };

        let sender_key = sender.key();
        let mut dead = Vec::new();
        sub.watchers.retain(|key, watcher| {
            if *key == sender_key {
                return true;
            }
            match watcher.deliver(&topic, payload) {
                Ok(true) => true,
                Ok(false) => {
                    dead.push(watcher.clone());
                    false
                }
                Err(err) => {
                    debug!(key = %key, error = %err, "write failed, closing connection");
                    watcher.close(Some(err));
                    dead.push(watcher.clone());
                    false
                }
            }
        });
        trace!(shard = self.index, %topic, watchers = sub.len(), "published");
        if sub.is_empty() {
            self.subscriptions.remove(&topic);
        }

        for conn in dead {
            self.sweep(&conn);
        }
    }

    /// Route an unsubscribe for every topic a dead connection still watches.
    fn sweep(&mut self, conn: &Arc<Connection<T>>) {
        let topics = conn.take_topics();
        debug!(
            shard = self.index,
            key = %conn.key(),
            topics = topics.len(),
            "sweeping dead connection"
        );
        for topic in topics {
            let owner = topic.fractional_bits(self.shard_bits) as usize;
            if owner == self.index {
                self.unwatch(topic, conn.key());
                continue;
            }
            let request = Request::Unsubscribe {
                topic,
                conn: conn.clone(),
            };
            // Never wait on another shard from inside a worker; a refused sweep is
            // picked up by the next publish on that topic.
            if let Err(err) = self.peers[owner].try_send(request) {
                debug!(shard = self.index, owner, error = %err, "sweep deferred");
            }
        }
    }
}
