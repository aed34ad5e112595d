//! Hub Event Loop
//!
//! Owns clients, topics and per-client outbound queues. Publishes never
//! block: a full client queue counts a drop, and a client whose consecutive
//! drops exceed the threshold is evicted: removed from every topic and cut
//! off by closing its outbound channel.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::models::Trade;
use crate::services::sequence::SequenceOracle;

use super::{TradeFeed, MAX_CONSECUTIVE_DROPS, PUBLISH_BUF};

pub type ClientId = u64;

struct Registration {
    client: ClientId,
    sender: mpsc::Sender<String>,
}

struct Subscription {
    client: ClientId,
    topic: String,
}

struct PublishMsg {
    topic: String,
    data: String,
}

struct ClientState {
    sender: mpsc::Sender<String>,
    subscribed: HashSet<String>,
    drops: u32,
}

pub struct Hub {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ClientId>,
    subscribe_rx: mpsc::Receiver<Subscription>,
    unsubscribe_rx: mpsc::Receiver<Subscription>,
    publish_rx: mpsc::Receiver<PublishMsg>,

    clients: HashMap<ClientId, ClientState>,
    topics: HashMap<String, HashSet<ClientId>>,

    publish_drops: Arc<AtomicU64>,
}

/// Cloneable handle connections and the order service use to reach the loop.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientId>,
    subscribe_tx: mpsc::Sender<Subscription>,
    unsubscribe_tx: mpsc::Sender<Subscription>,
    publish_tx: mpsc::Sender<PublishMsg>,
    sequences: Arc<SequenceOracle>,
    publish_drops: Arc<AtomicU64>,
    next_client: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(sequences: Arc<SequenceOracle>) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(64);
        let (unregister_tx, unregister_rx) = mpsc::channel(64);
        let (subscribe_tx, subscribe_rx) = mpsc::channel(64);
        let (unsubscribe_tx, unsubscribe_rx) = mpsc::channel(64);
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_BUF);

        let publish_drops = Arc::new(AtomicU64::new(0));

        let hub = Self {
            register_rx,
            unregister_rx,
            subscribe_rx,
            unsubscribe_rx,
            publish_rx,
            clients: HashMap::new(),
            topics: HashMap::new(),
            publish_drops: Arc::clone(&publish_drops),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            subscribe_tx,
            unsubscribe_tx,
            publish_tx,
            sequences,
            publish_drops,
            next_client: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle)
    }

    /// The event loop. Runs until every handle is dropped.
    pub async fn run(mut self) {
        info!("trade hub started");
        loop {
            tokio::select! {
                Some(reg) = self.register_rx.recv() => {
                    self.clients.insert(reg.client, ClientState {
                        sender: reg.sender,
                        subscribed: HashSet::new(),
                        drops: 0,
                    });
                }

                Some(id) = self.unregister_rx.recv() => {
                    self.remove_client(id);
                }

                Some(sub) = self.subscribe_rx.recv() => {
                    if let Some(state) = self.clients.get_mut(&sub.client) {
                        state.subscribed.insert(sub.topic.clone());
                        self.topics.entry(sub.topic).or_default().insert(sub.client);
                    }
                }

                Some(sub) = self.unsubscribe_rx.recv() => {
                    if let Some(state) = self.clients.get_mut(&sub.client) {
                        state.subscribed.remove(&sub.topic);
                    }
                    if let Some(subs) = self.topics.get_mut(&sub.topic) {
                        subs.remove(&sub.client);
                        if subs.is_empty() {
                            self.topics.remove(&sub.topic);
                        }
                    }
                }

                Some(msg) = self.publish_rx.recv() => {
                    self.fan_out(msg);
                }

                else => break,
            }
        }
        info!("trade hub stopped");
    }

    fn fan_out(&mut self, msg: PublishMsg) {
        let Some(subscribers) = self.topics.get(&msg.topic) else {
            return;
        };

        let mut evict = Vec::new();
        for &id in subscribers {
            let Some(state) = self.clients.get_mut(&id) else {
                continue;
            };
            match state.sender.try_send(msg.data.clone()) {
                Ok(()) => state.drops = 0,
                Err(TrySendError::Full(_)) => {
                    self.publish_drops.fetch_add(1, Ordering::Relaxed);
                    state.drops += 1;
                    if state.drops > MAX_CONSECUTIVE_DROPS {
                        warn!(client = id, drops = state.drops, "evicting slow client");
                        evict.push(id);
                    }
                }
                Err(TrySendError::Closed(_)) => evict.push(id),
            }
        }

        for id in evict {
            self.remove_client(id);
        }
    }

    /// Drop a client from every topic and close its outbound channel; the
    /// writer pump shuts the connection when the channel ends.
    fn remove_client(&mut self, id: ClientId) {
        if let Some(state) = self.clients.remove(&id) {
            for topic in state.subscribed {
                if let Some(subs) = self.topics.get_mut(&topic) {
                    subs.remove(&id);
                    if subs.is_empty() {
                        self.topics.remove(&topic);
                    }
                }
            }
        }
    }
}

impl HubHandle {
    pub fn next_client_id(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, client: ClientId, sender: mpsc::Sender<String>) {
        let _ = self.register_tx.send(Registration { client, sender }).await;
    }

    pub async fn unregister(&self, client: ClientId) {
        let _ = self.unregister_tx.send(client).await;
    }

    pub async fn subscribe(&self, client: ClientId, topic: impl Into<String>) {
        let _ = self
            .subscribe_tx
            .send(Subscription {
                client,
                topic: topic.into(),
            })
            .await;
    }

    pub async fn unsubscribe(&self, client: ClientId, topic: impl Into<String>) {
        let _ = self
            .unsubscribe_tx
            .send(Subscription {
                client,
                topic: topic.into(),
            })
            .await;
    }

    /// Publish a trade to its symbol's subscribers. Stamps the per-symbol
    /// sequence, then try-sends: a full hub buffer drops the trade rather
    /// than blocking the matching path.
    pub fn publish_trade(&self, trade: &Trade) {
        let feed = TradeFeed {
            symbol: trade.symbol.clone(),
            price: trade.price,
            qty: trade.quantity,
            side: trade.side.to_string(),
            ts: trade.timestamp.timestamp_millis(),
            seq: self.sequences.next(&trade.symbol),
        };
        let frame = serde_json::json!({ "type": "trade", "trade": feed });
        let data = frame.to_string();

        if self
            .publish_tx
            .try_send(PublishMsg {
                topic: trade.symbol.clone(),
                data,
            })
            .is_err()
        {
            self.publish_drops.fetch_add(1, Ordering::Relaxed);
            debug!("publish channel full, dropping trade");
        }
    }

    /// Total messages dropped on backpressure.
    pub fn publish_drops(&self) -> u64 {
        self.publish_drops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::Side;

    fn trade(symbol: &str, price: u64, qty: u64) -> Trade {
        Trade {
            maker_id: 1,
            taker_id: 2,
            price,
            quantity: qty,
            side: Side::Bid,
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn start_hub() -> HubHandle {
        let (hub, handle) = Hub::new(Arc::new(SequenceOracle::new()));
        tokio::spawn(hub.run());
        handle
    }

    #[tokio::test]
    async fn publishes_only_to_subscribers_with_increasing_seq() {
        let handle = start_hub().await;

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let a = handle.next_client_id();
        let b = handle.next_client_id();
        handle.register(a, tx_a).await;
        handle.register(b, tx_b).await;
        handle.subscribe(a, "ACMEUSD").await;
        handle.subscribe(b, "OTHERUSD").await;
        tokio::task::yield_now().await;

        handle.publish_trade(&trade("ACMEUSD", 100, 5));
        handle.publish_trade(&trade("ACMEUSD", 101, 6));

        let first = rx_a.recv().await.unwrap();
        let second = rx_a.recv().await.unwrap();
        let v1: serde_json::Value = serde_json::from_str(&first).unwrap();
        let v2: serde_json::Value = serde_json::from_str(&second).unwrap();
        assert_eq!(v1["type"], "trade");
        assert_eq!(v1["trade"]["symbol"], "ACMEUSD");
        assert_eq!(v1["trade"]["seq"], 1);
        assert_eq!(v2["trade"]["seq"], 2);

        // The other symbol's subscriber saw nothing.
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let handle = start_hub().await;
        let (tx, mut rx) = mpsc::channel(8);
        let id = handle.next_client_id();
        handle.register(id, tx).await;
        handle.subscribe(id, "ACMEUSD").await;
        tokio::task::yield_now().await;

        handle.publish_trade(&trade("ACMEUSD", 100, 1));
        assert!(rx.recv().await.is_some());

        handle.unsubscribe(id, "ACMEUSD").await;
        tokio::task::yield_now().await;
        handle.publish_trade(&trade("ACMEUSD", 100, 1));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_client_is_evicted_after_consecutive_drops() {
        let handle = start_hub().await;

        // Capacity 1 and never drained: the first publish queues, the rest drop.
        let (tx, mut rx) = mpsc::channel(1);
        let id = handle.next_client_id();
        handle.register(id, tx).await;
        handle.subscribe(id, "ACMEUSD").await;
        tokio::task::yield_now().await;

        for _ in 0..(MAX_CONSECUTIVE_DROPS + 2) {
            handle.publish_trade(&trade("ACMEUSD", 100, 1));
            tokio::task::yield_now().await;
        }
        // Give the loop time to process the backlog.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(handle.publish_drops() >= MAX_CONSECUTIVE_DROPS as u64);

        // Eviction closed the outbound channel: one queued frame, then None.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn draining_client_survives_burst() {
        let handle = start_hub().await;
        let (tx, mut rx) = mpsc::channel(2);
        let id = handle.next_client_id();
        handle.register(id, tx).await;
        handle.subscribe(id, "ACMEUSD").await;
        tokio::task::yield_now().await;

        // Interleave publish and drain: drops never become consecutive.
        for _ in 0..(MAX_CONSECUTIVE_DROPS * 2) {
            handle.publish_trade(&trade("ACMEUSD", 100, 1));
            tokio::task::yield_now().await;
            let _ = rx.try_recv();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Still registered: a fresh publish arrives.
        while rx.try_recv().is_ok() {}
        handle.publish_trade(&trade("ACMEUSD", 100, 1));
        assert!(rx.recv().await.is_some());
    }
}
