//! Concrete Router sinks (§4.5 "mandatory sink types"): Publisher, Cache,
//! Broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::{sleep, Duration};

use crate::cache::StreamCache;
use crate::clock::Clock;
use crate::connection::transport::{Connector, InboundFrame, OutboundFrame};
use crate::errors::{EngineError, EngineResult};
use crate::record::CanonicalRecord;
use crate::router::Sink;

/// One persistent, reconnect-safe connection to the publisher backend.
/// Grounded in the teacher's `master_sender.rs::MasterSender`: a queue
/// that's replaced on every reconnect, a background loop that never
/// returns, and a fixed 30s backoff between attempts (publisher egress
/// isn't subject to the CM's exponential-backoff contract, §4.2, so the
/// teacher's constant-delay retry is kept as-is).
struct PublisherConnection {
    queue: Arc<Mutex<mpsc::Sender<Value>>>,
    connected: Arc<Notify>,
    ready: AtomicBool,
}

impl PublisherConnection {
    fn spawn(url: String, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (tx, _rx) = mpsc::channel::<Value>(10_000);
        let queue = Arc::new(Mutex::new(tx));
        let connected = Arc::new(Notify::new());
        let this = Arc::new(Self { queue: Arc::clone(&queue), connected: Arc::clone(&connected), ready: AtomicBool::new(false) });

        let loop_queue = Arc::clone(&queue);
        let loop_connected = Arc::clone(&connected);
        let loop_ready = Arc::clone(&this);
        tokio::spawn(async move {
            loop {
                let (tx, rx) = mpsc::channel::<Value>(10_000);
                *loop_queue.lock().await = tx;

                if let Err(e) = Self::run_once(&url, Arc::clone(&connector), rx, &loop_connected, &loop_ready).await {
                    log::warn!("publisher connection lost: {e}");
                }
                sleep(Duration::from_secs(30)).await;
            }
        });

        this
    }

    async fn run_once(
        url: &str,
        connector: Arc<dyn Connector>,
        mut rx: mpsc::Receiver<Value>,
        connected: &Arc<Notify>,
        ready: &Arc<Self>,
    ) -> EngineResult<()> {
        let (mut writer, mut reader) = connector.connect(url).await?;
        ready.ready.store(true, Ordering::Relaxed);
        connected.notify_waiters();

        let closed = Arc::new(Notify::new());
        let reader_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Some(Ok(InboundFrame::Close)) | None => break,
                    Some(_) => continue,
                }
            }
            reader_closed.notify_waiters();
        });

        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                maybe_msg = rx.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            let text = serde_json::to_string(&msg).map_err(|e| EngineError::Sink { sink: "publisher".into(), message: e.to_string() })?;
                            writer.send(OutboundFrame::Text(text)).await?;
                        }
                        None => return Ok(()),
                    }
                }
                _ = ping_interval.tick() => {
                    writer.send(OutboundFrame::Ping(Vec::new())).await?;
                }
                _ = closed.notified() => {
                    return Err(EngineError::transport("publisher connection closed by remote"));
                }
            }
        }
    }

    /// Never blocks the caller: drops the message if the outbound queue is
    /// full (teacher: `MasterSender::send`'s `try_send`, silently dropping
    /// on `Full`).
    async fn send(&self, msg: Value) -> EngineResult<()> {
        let tx = self.queue.lock().await;
        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(EngineError::Sink { sink: "publisher".into(), message: "connection task stopped".into() })
            }
        }
    }
}

/// Publisher sink (§4.5, §6 egress): forwards canonical records to an
/// abstract pub/sub bus, respecting the global `publication_enabled` toggle.
/// Grounded in the teacher's `MasterPool` (redundant pool, random pick with
/// bounded retry, demo mode that only logs).
pub struct PublisherSink {
    connections: Vec<Arc<PublisherConnection>>,
    topic_prefix: String,
    demo: bool,
    enabled: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl PublisherSink {
    pub fn new(
        url: &str,
        connections: usize,
        demo: bool,
        topic_prefix: impl Into<String>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        publication_enabled: bool,
    ) -> Arc<Self> {
        let connections = if demo {
            Vec::new()
        } else {
            (0..connections.max(1)).map(|_| PublisherConnection::spawn(url.to_string(), Arc::clone(&connector))).collect()
        };

        Arc::new(Self {
            connections,
            topic_prefix: topic_prefix.into(),
            demo,
            enabled: AtomicBool::new(publication_enabled),
            clock,
        })
    }

    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::Relaxed)
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn topic_for(&self, record: &CanonicalRecord) -> String {
        format!("{}-{}-{}", self.topic_prefix, record.data_type, record.exchange)
    }

    /// `publish(topic, record, attrs?) → result` (§6 egress interface).
    async fn publish(&self, topic: &str, record: &CanonicalRecord) -> EngineResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let body = serde_json::json!({ "topic": topic, "record": record });

        if self.demo {
            log::info!("[publisher demo] {}", body);
            return Ok(());
        }

        if self.connections.is_empty() {
            return Err(EngineError::Sink { sink: "publisher".into(), message: "no publisher connections configured".into() });
        }

        for _ in 0..3 {
            let idx = rand::rng().random_range(0..self.connections.len());
            if self.connections[idx].send(body.clone()).await.is_ok() {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        Err(EngineError::Sink { sink: "publisher".into(), message: "all publisher connections busy".into() })
    }
}

#[async_trait]
impl Sink for PublisherSink {
    async fn handle(&self, record: &CanonicalRecord) -> EngineResult<()> {
        let topic = self.topic_for(record);
        let _ = self.clock.now_ms();
        self.publish(&topic, record).await
    }
}

/// Cache sink (§4.5): writes every record into the Stream Cache under its
/// `exchange:symbol:type` key.
pub struct CacheSink {
    cache: Arc<StreamCache>,
}

impl CacheSink {
    pub fn new(cache: Arc<StreamCache>) -> Arc<Self> {
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl Sink for CacheSink {
    async fn handle(&self, record: &CanonicalRecord) -> EngineResult<()> {
        self.cache.put(&record.cache_key(), record.clone()).await;
        Ok(())
    }
}

/// Broadcast sink (§4.5, §6): fan-out to live subscribers (e.g. a UI), each
/// with its own bounded queue; slow subscribers are dropped per
/// `tokio::sync::broadcast`'s own lag semantics.
pub struct BroadcastSink {
    tx: broadcast::Sender<CanonicalRecord>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CanonicalRecord> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Sink for BroadcastSink {
    async fn handle(&self, record: &CanonicalRecord) -> EngineResult<()> {
        // No subscribers is not an error: the UI may simply not be
        // connected yet.
        let _ = self.tx.send(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::CachePolicy;
    use crate::record::{DataType, Payload, Side, Trade};
    use rust_decimal::Decimal;

    fn sample() -> CanonicalRecord {
        CanonicalRecord {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            data_type: DataType::Trade,
            event_timestamp: 1,
            received_timestamp: 1,
            payload: Payload::Trade(Trade {
                id: "1".into(),
                price: Decimal::new(1, 0),
                quantity: Decimal::new(1, 0),
                side: Side::Buy,
                trade_time: 1,
            }),
        }
    }

    #[tokio::test]
    async fn cache_sink_writes_under_cache_key() {
        let clock = TestClock::new(0);
        let cache = StreamCache::new(clock, CachePolicy { max_entries: 10, ttl_ms: 60_000, cleanup_interval_ms: 30_000, memory_cap_bytes: 1_000_000 });
        let sink = CacheSink::new(Arc::clone(&cache));
        sink.handle(&sample()).await.unwrap();
        assert!(cache.has("binance:BTC/USDT:trade").await);
    }

    #[tokio::test]
    async fn broadcast_sink_fans_out_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx1 = sink.subscribe();
        let mut rx2 = sink.subscribe();
        sink.handle(&sample()).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().symbol, "BTC/USDT");
        assert_eq!(rx2.recv().await.unwrap().symbol, "BTC/USDT");
    }

    #[tokio::test]
    async fn demo_publisher_never_errors() {
        let clock = TestClock::new(0);
        let connector = crate::connection::transport::mock::MockConnector::new(0);
        let sink = PublisherSink::new("wss://example", 1, true, "marketfeed", connector, clock, true);
        assert!(sink.handle(&sample()).await.is_ok());
    }
}
