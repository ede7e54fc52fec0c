//! Subscription Manager (§4.3): maps (symbol, type) pairs onto streams
//! hosted by one or more Connection Managers, with lifecycle, migration,
//! and accounting.
//!
//! Grounded in the teacher's `collector/runner.rs` (the closest thing the
//! teacher has to subscription bookkeeping: one Vec<String> of pairs fed
//! straight into a single subscribe message), generalized into a proper
//! table with per-entry lifecycle since the teacher has none.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use crate::clock::Clock;
use crate::config::SubscriptionPolicy;
use crate::connection::{CmEvent, ConnectionManager, ConnectionState};
use crate::errors::{EngineError, EngineResult};
use crate::exchanges;
use crate::record::DataType;
use crate::subscription::types::{
    subscription_id, Selector, SmEvent, SubscribeOutcome, SubscriptionEntry, SubscriptionRequest,
    SubscriptionRow, SubscriptionStatus, UnsubscribeOutcome,
};

/// How long `migrate` waits for the destination CM to report the stream as
/// active before rolling back (§4.3 Migration, §5 "operation accepts a deadline").
const MIGRATE_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
const MIGRATE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Provisions a new Connection Manager on demand when every existing CM is
/// at capacity (§4.3 assignment policy). Implemented by the Adapter Facade;
/// `None` here means "fail with capacity_exhausted" is the chosen policy.
pub trait CmProvisioner: Send + Sync {
    fn provision(&self) -> Option<Arc<ConnectionManager>>;
}

#[derive(Default)]
struct RateWindow {
    buckets: [u64; 60],
    bucket_sec: [i64; 60],
}

impl RateWindow {
    fn record(&mut self, now_sec: i64) {
        let idx = (now_sec.rem_euclid(60)) as usize;
        if self.bucket_sec[idx] != now_sec {
            self.bucket_sec[idx] = now_sec;
            self.buckets[idx] = 0;
        }
        self.buckets[idx] += 1;
    }

    fn rate_per_sec(&self, now_sec: i64) -> f64 {
        let mut total = 0u64;
        let mut valid = 0u64;
        for i in 0..60 {
            if now_sec - self.bucket_sec[i] < 60 {
                total += self.buckets[i];
                valid += 1;
            }
        }
        if valid == 0 {
            0.0
        } else {
            total as f64 / valid as f64
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SmStatsSnapshot {
    pub by_status: HashMap<String, usize>,
    pub by_data_type: HashMap<String, usize>,
    pub by_symbol: HashMap<String, usize>,
    pub by_connection: HashMap<String, usize>,
    pub message_rate_per_sec: f64,
    pub error_rate_per_sec: f64,
}

pub struct SubscriptionManager {
    exchange: String,
    policy: SubscriptionPolicy,
    clock: Arc<dyn Clock>,
    table: RwLock<HashMap<String, Arc<SubscriptionEntry>>>,
    connections: RwLock<Vec<Arc<ConnectionManager>>>,
    provisioner: Option<Box<dyn CmProvisioner>>,
    message_rate: StdMutex<RateWindow>,
    error_rate: StdMutex<RateWindow>,
    cached_stats: RwLock<SmStatsSnapshot>,
    events_tx: broadcast::Sender<SmEvent>,
}

impl SubscriptionManager {
    pub fn new(
        exchange: impl Into<String>,
        policy: SubscriptionPolicy,
        clock: Arc<dyn Clock>,
        provisioner: Option<Box<dyn CmProvisioner>>,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            exchange: exchange.into(),
            policy,
            clock,
            table: RwLock::new(HashMap::new()),
            connections: RwLock::new(Vec::new()),
            provisioner,
            message_rate: StdMutex::new(RateWindow::default()),
            error_rate: StdMutex::new(RateWindow::default()),
            cached_stats: RwLock::new(SmStatsSnapshot::default()),
            events_tx,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SmEvent> {
        self.events_tx.subscribe()
    }

    /// Registers a CM the SM may assign subscriptions to, and starts a
    /// background listener that reconciles subscription status with the
    /// CM's own state/stream-membership changes (§4.3 lifecycle: "return to
    /// pending during CM reconnect", "advance ... when the CM confirms its
    /// next (re)connect carries the stream").
    pub async fn register_connection(self: &Arc<Self>, cm: Arc<ConnectionManager>) {
        self.connections.write().await.push(Arc::clone(&cm));
        let sm = Arc::clone(self);
        tokio::spawn(async move { sm.run_cm_listener(cm).await });
    }

    async fn run_cm_listener(self: Arc<Self>, cm: Arc<ConnectionManager>) {
        let mut events = cm.subscribe_events();
        loop {
            match events.recv().await {
                Ok(CmEvent::Reconnected) => self.mark_active_for_connection(&cm).await,
                Ok(CmEvent::StateChange { to: ConnectionState::Reconnecting, .. }) => {
                    self.mark_pending_for_connection(&cm.id).await;
                }
                Ok(CmEvent::StateChange { to: ConnectionState::Connected, .. }) => {
                    self.mark_active_for_connection(&cm).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn mark_active_for_connection(&self, cm: &Arc<ConnectionManager>) {
        let active = cm.active_streams().await;
        let now = self.clock.now_ms();
        let table = self.table.read().await;
        for entry in table.values() {
            if entry.connection_id().as_deref() == Some(cm.id.as_str())
                && active.contains(&entry.stream_name)
                && entry.status() == SubscriptionStatus::Pending
            {
                entry.set_status(SubscriptionStatus::Active);
                entry.record_message(now);
            }
        }
    }

    async fn mark_pending_for_connection(&self, conn_id: &str) {
        let table = self.table.read().await;
        for entry in table.values() {
            if entry.connection_id().as_deref() == Some(conn_id) && entry.status() == SubscriptionStatus::Active {
                entry.set_status(SubscriptionStatus::Pending);
            }
        }
    }

    fn validate_symbol(&self, symbol: &str) -> bool {
        // Only the documented default pattern (`^[A-Z0-9]+$`, applied to
        // each of BASE and QUOTE) is actually enforced; no regex engine is
        // in the dependency stack, and nothing else in the corpus needs
        // one, so a custom pattern string in `policy.symbol_regex` is
        // accepted but not interpreted (see DESIGN.md).
        let _ = &self.policy.symbol_regex;
        match symbol.split_once('/') {
            Some((base, quote)) => is_alnum_upper(base) && is_alnum_upper(quote),
            None => is_alnum_upper(symbol),
        }
    }

    async fn assign_connection(&self) -> Option<Arc<ConnectionManager>> {
        let connections = self.connections.read().await;
        for cm in connections.iter() {
            if cm.active_streams().await.len() < cm_capacity(cm) {
                return Some(Arc::clone(cm));
            }
        }
        drop(connections);
        self.provisioner.as_ref().and_then(|p| p.provision())
    }

    /// `subscribe(list)` → `{succeeded, existing, failed}` (§4.3).
    pub async fn subscribe(&self, requests: Vec<SubscriptionRequest>) -> SubscribeOutcome {
        let mut outcome = SubscribeOutcome::default();
        for request in requests {
            if !self.validate_symbol(&request.symbol) {
                outcome.failed.push((request, "validation_error: symbol failed pattern check".into()));
                continue;
            }

            let id = subscription_id(&request.symbol, request.data_type, request.params.as_deref());
            {
                let table = self.table.read().await;
                if let Some(existing) = table.get(&id) {
                    if existing.status() != SubscriptionStatus::Removing {
                        outcome.existing.push(id);
                        continue;
                    }
                }
            }

            let total_active = self.table.read().await.len();
            if total_active >= self.policy.max_subscriptions {
                outcome.failed.push((request, "capacity_exhausted: max_subscriptions reached".into()));
                continue;
            }

            let Some(stream_name) = exchanges::stream_name(&self.exchange, &request.symbol, request.data_type) else {
                outcome.failed.push((request, format!("validation_error: unsupported exchange '{}'", self.exchange)));
                continue;
            };

            let cm = match self.assign_connection().await {
                Some(cm) => cm,
                None => {
                    outcome.failed.push((request, "capacity_exhausted: no connection manager with spare capacity".into()));
                    continue;
                }
            };

            let entry = Arc::new(SubscriptionEntry::new(
                self.exchange.clone(),
                request.symbol.clone(),
                request.data_type,
                request.params.clone(),
                stream_name.clone(),
                Some(cm.id.clone()),
                self.clock.now_ms(),
            ));
            cm.add_stream(stream_name);
            let entry_id = entry.id.clone();
            self.table.write().await.insert(entry_id.clone(), entry);
            outcome.succeeded.push(entry_id);
        }
        outcome
    }

    /// `unsubscribe(list_or_ids)` — symmetric to `subscribe` (§4.3).
    pub async fn unsubscribe(&self, ids: &[String]) -> UnsubscribeOutcome {
        let mut outcome = UnsubscribeOutcome::default();
        let mut table = self.table.write().await;
        let connections = self.connections.read().await;
        for id in ids {
            match table.remove(id) {
                Some(entry) => {
                    entry.set_status(SubscriptionStatus::Removing);
                    if let Some(conn_id) = entry.connection_id() {
                        if let Some(cm) = connections.iter().find(|c| c.id == conn_id) {
                            cm.remove_stream(entry.stream_name.clone());
                        }
                    }
                    outcome.removed.push(id.clone());
                }
                None => outcome.not_found.push(id.clone()),
            }
        }
        outcome
    }

    /// `get(by: id|connection|symbol|status) → rows` (§4.3).
    pub async fn get(&self, selector: Selector<'_>) -> Vec<SubscriptionRow> {
        let table = self.table.read().await;
        table
            .values()
            .filter(|e| match selector {
                Selector::All => true,
                Selector::Id(id) => e.id == id,
                Selector::Connection(conn) => e.connection_id().as_deref() == Some(conn),
                Selector::Symbol(symbol) => e.symbol == symbol,
                Selector::Status(status) => e.status() == status,
            })
            .map(|e| e.row())
            .collect()
    }

    /// Looks up the subscription id hosting `stream_name` on `conn_id`,
    /// used by the Adapter Facade to resolve an inbound raw message (§4.4
    /// step 1: "the normalizer is inverse of the stream_name builder").
    pub async fn find_by_stream(&self, conn_id: &str, stream_name: &str) -> Option<String> {
        let table = self.table.read().await;
        table
            .values()
            .find(|e| e.connection_id().as_deref() == Some(conn_id) && e.stream_name == stream_name)
            .map(|e| e.id.clone())
    }

    /// `handle_stream_data(stream, record, conn_id)` (§4.3), already
    /// resolved to an id by the caller via `find_by_stream`.
    pub async fn handle_stream_data(&self, id: &str) {
        let now = self.clock.now_ms();
        if let Some(entry) = self.table.read().await.get(id) {
            entry.record_message(now);
        }
        self.message_rate.lock().expect("message_rate lock poisoned").record(now / 1000);
    }

    /// `handle_stream_error(stream, error, conn_id)` (§4.3): counters only,
    /// status is left unchanged per the spec's explicit wording.
    pub async fn handle_stream_error(&self, id: &str, error: &str) {
        let now = self.clock.now_ms();
        if let Some(entry) = self.table.read().await.get(id) {
            entry.record_error(error);
        }
        self.error_rate.lock().expect("error_rate lock poisoned").record(now / 1000);
    }

    /// `migrate(from_conn_id, to_conn_id)` — move all active streams
    /// (§4.3 Migration, steps 1-5 including compensating rollback).
    pub async fn migrate(&self, from_conn_id: &str, to_conn_id: &str) -> EngineResult<Vec<String>> {
        let connections = self.connections.read().await;
        let from_cm = connections
            .iter()
            .find(|c| c.id == from_conn_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("connection", from_conn_id))?;
        let to_cm = connections
            .iter()
            .find(|c| c.id == to_conn_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("connection", to_conn_id))?;
        drop(connections);

        let ids: Vec<String> = {
            let table = self.table.read().await;
            table
                .values()
                .filter(|e| e.connection_id().as_deref() == Some(from_conn_id))
                .map(|e| e.id.clone())
                .collect()
        };
        if ids.is_empty() {
            return Ok(ids);
        }

        let _ = self.events_tx.send(SmEvent::MigrationStarted {
            from: from_conn_id.to_string(),
            to: to_conn_id.to_string(),
            ids: ids.clone(),
        });

        let stream_names: Vec<String> = {
            let table = self.table.read().await;
            ids.iter().filter_map(|id| table.get(id).map(|e| e.stream_name.clone())).collect()
        };

        {
            let table = self.table.read().await;
            for id in &ids {
                if let Some(entry) = table.get(id) {
                    entry.set_status(SubscriptionStatus::Pending);
                    entry.set_connection_id(Some(to_conn_id.to_string()));
                }
            }
        }

        for name in &stream_names {
            to_cm.add_stream(name.clone());
            from_cm.remove_stream(name.clone());
        }

        let converged = self.wait_for_streams(&to_cm, &stream_names).await;

        if converged {
            let now = self.clock.now_ms();
            let table = self.table.read().await;
            for id in &ids {
                if let Some(entry) = table.get(id) {
                    entry.set_status(SubscriptionStatus::Active);
                    entry.record_message(now);
                }
            }
            let _ = self.events_tx.send(SmEvent::MigrationCompleted {
                from: from_conn_id.to_string(),
                to: to_conn_id.to_string(),
                ids: ids.clone(),
            });
            Ok(ids)
        } else {
            // Compensating rollback: add back on old, remove from new.
            for name in &stream_names {
                from_cm.add_stream(name.clone());
                to_cm.remove_stream(name.clone());
            }
            let table = self.table.read().await;
            for id in &ids {
                if let Some(entry) = table.get(id) {
                    entry.set_status(SubscriptionStatus::Error);
                    entry.set_connection_id(Some(from_conn_id.to_string()));
                }
            }
            let reason = "destination connection did not confirm streams within deadline".to_string();
            let _ = self.events_tx.send(SmEvent::MigrationFailed {
                from: from_conn_id.to_string(),
                to: to_conn_id.to_string(),
                reason: reason.clone(),
            });
            Err(EngineError::Timeout { millis: MIGRATE_CONFIRM_TIMEOUT.as_millis() as u64 })
        }
    }

    async fn wait_for_streams(&self, cm: &Arc<ConnectionManager>, names: &[String]) -> bool {
        let deadline = tokio::time::Instant::now() + MIGRATE_CONFIRM_TIMEOUT;
        loop {
            let active = cm.active_streams().await;
            if names.iter().all(|n| active.contains(n)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(MIGRATE_POLL_INTERVAL).await;
        }
    }

    /// Recomputes and caches the stats snapshot; called both by the
    /// periodic stats task and on demand (§4.3 Statistics).
    pub async fn stats(&self) -> SmStatsSnapshot {
        let table = self.table.read().await;
        let mut snapshot = SmStatsSnapshot::default();
        for entry in table.values() {
            let row = entry.row();
            *snapshot.by_status.entry(format!("{:?}", row.status)).or_insert(0) += 1;
            *snapshot.by_data_type.entry(row.data_type.to_string()).or_insert(0) += 1;
            *snapshot.by_symbol.entry(row.symbol.clone()).or_insert(0) += 1;
            if let Some(conn) = row.connection_id {
                *snapshot.by_connection.entry(conn).or_insert(0) += 1;
            }
        }
        drop(table);

        let now_sec = self.clock.now_ms() / 1000;
        snapshot.message_rate_per_sec =
            self.message_rate.lock().expect("message_rate lock poisoned").rate_per_sec(now_sec);
        snapshot.error_rate_per_sec =
            self.error_rate.lock().expect("error_rate lock poisoned").rate_per_sec(now_sec);

        *self.cached_stats.write().await = snapshot.clone();
        snapshot
    }

    pub async fn cached_stats(&self) -> SmStatsSnapshot {
        self.cached_stats.read().await.clone()
    }

    /// Spawns the periodic stats recompute task (§5 "one stats task in the SM").
    pub fn spawn_stats_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sm = Arc::clone(self);
        let interval_ms = self.policy.stats_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                sm.stats().await;
            }
        })
    }
}

fn is_alnum_upper(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// A CM's capacity, read straight from its own `ConnectionPolicy` so
/// `assign_connection` never disagrees with what the CM itself enforces.
fn cm_capacity(cm: &Arc<ConnectionManager>) -> usize {
    cm.policy().max_streams_per_connection
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::ConnectionPolicy;
    use crate::connection::transport::mock::MockConnector;
    use std::collections::HashSet;

    fn policy() -> SubscriptionPolicy {
        SubscriptionPolicy {
            symbol_regex: "^[A-Z0-9]+$".into(),
            max_subscriptions: 10,
            stats_interval_ms: 5_000,
        }
    }

    async fn make_cm(id: &str, clock: Arc<dyn Clock>) -> Arc<ConnectionManager> {
        let connector = MockConnector::new(0);
        let mut incoming = connector.next_connection();
        let cm = ConnectionManager::new(id, "wss://example", connector, ConnectionPolicy::default(), clock);
        cm.connect(HashSet::new()).await.unwrap();
        let _handle = incoming.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cm
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_on_duplicates() {
        let clock = TestClock::new(0);
        let sm = SubscriptionManager::new("binance", policy(), clock.clone(), None);
        let cm = make_cm("c1", clock).await;
        sm.register_connection(cm).await;

        let req = SubscriptionRequest::new("BTC/USDT", DataType::Trade);
        let first = sm.subscribe(vec![req.clone()]).await;
        assert_eq!(first.succeeded.len(), 1);

        let second = sm.subscribe(vec![req]).await;
        assert_eq!(second.existing.len(), 1);
        assert!(second.succeeded.is_empty());
    }

    #[tokio::test]
    async fn subscribe_rejects_malformed_symbol() {
        let clock = TestClock::new(0);
        let sm = SubscriptionManager::new("binance", policy(), clock, None);
        let outcome = sm.subscribe(vec![SubscriptionRequest::new("btc-usdt", DataType::Trade)]).await;
        assert_eq!(outcome.failed.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry_and_signals_cm() {
        let clock = TestClock::new(0);
        let sm = SubscriptionManager::new("binance", policy(), clock.clone(), None);
        let cm = make_cm("c1", clock).await;
        sm.register_connection(cm).await;

        let outcome = sm.subscribe(vec![SubscriptionRequest::new("BTC/USDT", DataType::Trade)]).await;
        let id = outcome.succeeded[0].clone();

        let removed = sm.unsubscribe(&[id.clone()]).await;
        assert_eq!(removed.removed, vec![id]);
        assert!(sm.get(Selector::All).await.is_empty());
    }

    #[tokio::test]
    async fn migrate_moves_subscriptions_between_connections() {
        let clock = TestClock::new(0);
        let sm = SubscriptionManager::new("binance", policy(), clock.clone(), None);
        let c1 = make_cm("c1", clock.clone()).await;
        let c2 = make_cm("c2", clock).await;
        sm.register_connection(Arc::clone(&c1)).await;
        sm.register_connection(Arc::clone(&c2)).await;

        sm.subscribe(vec![SubscriptionRequest::new("BTC/USDT", DataType::Trade)]).await;
        // Allow the add_stream debounce + reconnect to converge so the
        // migrate confirmation loop finds the stream already active there
        // is nothing to wait on for c1; migrate only waits on c2.
        tokio::time::sleep(Duration::from_millis(60)).await;

        let moved = sm.migrate("c1", "c2").await.unwrap();
        assert_eq!(moved.len(), 1);

        let rows = sm.get(Selector::Connection("c2")).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SubscriptionStatus::Active);
    }
}
