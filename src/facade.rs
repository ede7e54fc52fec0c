//! Adapter Facade (§4.4): binds one Parser, one Subscription Manager, and a
//! pool of Connection Managers for a single exchange, and wires the raw
//! message path CM → Parser → Router → SM counters.
//!
//! Grounded in the teacher's `collector/runner.rs::run_exchange` (the
//! function that owns "one exchange's worth" of connection + subscribe +
//! forward), generalized from one fixed connection into a capacity-aware
//! pool and from an inline forward loop into the typed `CmEvent` listener
//! pattern used throughout this crate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::cache::StreamCache;
use crate::clock::Clock;
use crate::config::ConnectionPolicy;
use crate::connection::{CmEvent, ConnectionManager, Connector, Health};
use crate::errors::EngineResult;
use crate::exchanges;
use crate::metrics::RuntimeMetrics;
use crate::parser::Parser;
use crate::router::Router;
use crate::subscription::{SmStatsSnapshot, Selector, SubscribeOutcome, SubscriptionManager, SubscriptionRequest, UnsubscribeOutcome};

/// Per-connection status row for `status()` (§4.4, §6 `GET adapters`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStatusRow {
    pub id: String,
    pub health: Health,
    pub active_stream_count: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AdapterStatus {
    pub exchange: String,
    pub connections: Vec<ConnectionStatusRow>,
    pub subscriptions: SmStatsSnapshot,
}

/// Binds CM pool + SM + Parser for one exchange and feeds the Router
/// (§4.4: "the operations the Control Surface consumes").
pub struct AdapterFacade {
    exchange: String,
    parser: Arc<Parser>,
    sm: Arc<SubscriptionManager>,
    router: Arc<Router>,
    cache: Arc<StreamCache>,
    connector: Arc<dyn Connector>,
    connection_policy: ConnectionPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<RuntimeMetrics>,
    connections: RwLock<Vec<Arc<ConnectionManager>>>,
    next_conn_seq: AtomicU64,
}

impl AdapterFacade {
    pub fn new(
        exchange: impl Into<String>,
        parser: Arc<Parser>,
        sm: Arc<SubscriptionManager>,
        router: Arc<Router>,
        cache: Arc<StreamCache>,
        connector: Arc<dyn Connector>,
        connection_policy: ConnectionPolicy,
        clock: Arc<dyn Clock>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            exchange: exchange.into(),
            parser,
            sm,
            router,
            cache,
            connector,
            connection_policy,
            clock,
            metrics,
            connections: RwLock::new(Vec::new()),
            next_conn_seq: AtomicU64::new(0),
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Opens `count` Connection Managers and registers each with the SM and
    /// a raw-message listener. Called at startup and, for capacity growth,
    /// from `subscribe` (§4.4 step: "Owns one SM and one pool of CMs").
    pub async fn connect(self: &Arc<Self>, count: usize) -> EngineResult<()> {
        for _ in 0..count.max(1) {
            self.spawn_connection().await?;
        }
        Ok(())
    }

    async fn spawn_connection(self: &Arc<Self>) -> EngineResult<Arc<ConnectionManager>> {
        let base_url = exchanges::ws_base_url(&self.exchange)
            .ok_or_else(|| crate::errors::EngineError::FatalInit {
                message: format!("no ws_base_url registered for exchange '{}'", self.exchange),
            })?;
        let seq = self.next_conn_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{seq}", self.exchange);

        let cm = ConnectionManager::new(id, base_url, Arc::clone(&self.connector), self.connection_policy.clone(), Arc::clone(&self.clock));
        cm.connect(HashSet::new()).await?;
        self.sm.register_connection(Arc::clone(&cm)).await;

        let listener_facade = Arc::clone(self);
        let listener_cm = Arc::clone(&cm);
        tokio::spawn(async move { listener_facade.run_raw_message_listener(listener_cm).await });

        self.connections.write().await.push(Arc::clone(&cm));
        Ok(cm)
    }

    /// `disconnect()`: tears down every CM with the configured grace period.
    pub async fn disconnect(&self) {
        let connections = self.connections.read().await;
        for cm in connections.iter() {
            cm.destroy(Duration::from_secs(5)).await;
        }
    }

    /// The CM → Parser → Router wiring (§4.4 steps 1-4): resolves the
    /// inbound stream name against the SM, decodes it, and on success
    /// publishes the canonical record and updates SM counters; on failure
    /// counts the error and drops the record, never tearing down the CM.
    async fn run_raw_message_listener(self: Arc<Self>, cm: Arc<ConnectionManager>) {
        let mut events = cm.subscribe_events();
        loop {
            match events.recv().await {
                Ok(CmEvent::RawMessage(value)) => self.handle_raw_message(&cm, value).await,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_raw_message(&self, cm: &Arc<ConnectionManager>, value: serde_json::Value) {
        self.metrics.records_received.fetch_add(1, Ordering::Relaxed);

        let stream_name = value.get("stream").and_then(|v| v.as_str());
        let subscription_id = match stream_name {
            Some(name) => self.sm.find_by_stream(&cm.id, name).await,
            None => None,
        };

        match self.parser.parse(&self.exchange, &value) {
            Ok(record) => {
                self.metrics.records_forwarded.fetch_add(1, Ordering::Relaxed);
                self.router.publish(record).await;
                if let Some(id) = &subscription_id {
                    self.sm.handle_stream_data(id).await;
                }
            }
            Err(e) => {
                self.metrics.parse_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(id) = &subscription_id {
                    self.sm.handle_stream_error(id, &e.to_string()).await;
                }
            }
        }
    }

    /// Picks (or grows) a CM with spare capacity before delegating to the
    /// SM, since opening a new socket is inherently async and the SM's
    /// `CmProvisioner` hook is deliberately synchronous (see DESIGN.md).
    async fn ensure_spare_capacity(self: &Arc<Self>) -> EngineResult<()> {
        let connections = self.connections.read().await;
        let mut has_capacity = false;
        for cm in connections.iter() {
            if cm.active_streams().await.len() < self.connection_policy.max_streams_per_connection {
                has_capacity = true;
                break;
            }
        }
        drop(connections);
        if !has_capacity {
            self.spawn_connection().await?;
        }
        Ok(())
    }

    pub async fn subscribe(self: &Arc<Self>, requests: Vec<SubscriptionRequest>) -> EngineResult<SubscribeOutcome> {
        self.ensure_spare_capacity().await?;
        Ok(self.sm.subscribe(requests).await)
    }

    pub async fn unsubscribe(&self, ids: &[String]) -> UnsubscribeOutcome {
        self.sm.unsubscribe(ids).await
    }

    /// `unsubscribeAll()` (§4.4): removes every live subscription for this
    /// exchange.
    pub async fn unsubscribe_all(&self) -> UnsubscribeOutcome {
        let ids: Vec<String> = self.sm.get(Selector::All).await.into_iter().map(|row| row.id).collect();
        self.sm.unsubscribe(&ids).await
    }

    pub async fn status(&self) -> AdapterStatus {
        let connections = self.connections.read().await;
        let mut rows = Vec::with_capacity(connections.len());
        for cm in connections.iter() {
            rows.push(ConnectionStatusRow {
                id: cm.id.clone(),
                health: cm.healthcheck().await,
                active_stream_count: cm.active_streams().await.len(),
            });
        }
        AdapterStatus { exchange: self.exchange.clone(), connections: rows, subscriptions: self.sm.cached_stats().await }
    }

    pub async fn migrate(&self, from_conn_id: &str, to_conn_id: &str) -> EngineResult<Vec<String>> {
        self.sm.migrate(from_conn_id, to_conn_id).await
    }

    pub fn cache(&self) -> &Arc<StreamCache> {
        &self.cache
    }

    pub fn subscription_manager(&self) -> &Arc<SubscriptionManager> {
        &self.sm
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        self.connections.read().await.iter().map(|cm| cm.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::SubscriptionPolicy;
    use crate::connection::transport::mock::MockConnector;
    use crate::record::DataType;

    fn facade(clock: Arc<dyn Clock>, connector: Arc<dyn crate::connection::Connector>) -> Arc<AdapterFacade> {
        let parser = Arc::new(Parser::new(Arc::clone(&clock)));
        let sm = SubscriptionManager::new(
            "binance",
            SubscriptionPolicy { symbol_regex: "^[A-Z0-9]+$".into(), max_subscriptions: 10, stats_interval_ms: 5_000 },
            Arc::clone(&clock),
            None,
        );
        let router = Router::new(16, 5);
        let cache = StreamCache::new(Arc::clone(&clock), crate::config::CachePolicy::default());
        let metrics = Arc::new(RuntimeMetrics::default());
        AdapterFacade::new("binance", parser, sm, router, cache, connector, ConnectionPolicy::default(), clock, metrics)
    }

    #[tokio::test]
    async fn subscribe_routes_raw_message_into_canonical_record_and_cache() {
        let clock = TestClock::new(1_699_123_456_789);
        let connector = MockConnector::new(0);
        let mut incoming = connector.next_connection();
        let facade = facade(clock.clone(), connector);

        facade.connect(1).await.unwrap();
        let mut handle = incoming.recv().await.unwrap();

        let outcome = facade.subscribe(vec![SubscriptionRequest::new("BTC/USDT", DataType::Trade)]).await.unwrap();
        assert_eq!(outcome.succeeded.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let raw = serde_json::json!({
            "stream": "btcusdt@trade",
            "data": {"e": "trade", "E": 1699123456789i64, "s": "BTCUSDT", "t": 1, "p": "50000", "q": "0.1", "T": 1699123456789i64, "m": false}
        });
        handle.to_client.send(crate::connection::InboundFrame::Text(raw.to_string())).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(facade.cache().has("binance:BTC/USDT:trade").await);
        let rows = facade.sm.get(Selector::All).await;
        assert_eq!(rows[0].message_count, 1);
    }
}
