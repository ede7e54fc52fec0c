//! Subscription Manager data model (§3 Subscription, §4.3).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::record::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Paused,
    Error,
    Removing,
}

/// One requested (symbol, data_type[, params]) pair, as submitted to
/// `subscribe`.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub symbol: String,
    pub data_type: DataType,
    pub params: Option<String>,
}

impl SubscriptionRequest {
    pub fn new(symbol: impl Into<String>, data_type: DataType) -> Self {
        Self { symbol: symbol.into(), data_type, params: None }
    }
}

/// Deterministic subscription id from `(symbol, type[, params])` (§3).
pub fn subscription_id(symbol: &str, data_type: DataType, params: Option<&str>) -> String {
    match params {
        Some(p) => format!("{symbol}:{data_type}:{p}"),
        None => format!("{symbol}:{data_type}"),
    }
}

/// A live subscription row. Structural fields (`connection_id`, `status`)
/// and counters use interior mutability so `handle_stream_data` can update
/// them under the table's *read* lock (§5: "stats counters use atomic
/// increments to avoid contention").
pub struct SubscriptionEntry {
    pub id: String,
    pub exchange: String,
    pub symbol: String,
    pub data_type: DataType,
    pub params: Option<String>,
    pub stream_name: String,

    connection_id: Mutex<Option<String>>,
    status: Mutex<SubscriptionStatus>,
    message_count: AtomicU64,
    error_count: AtomicU64,
    last_active_ts: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl SubscriptionEntry {
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        data_type: DataType,
        params: Option<String>,
        stream_name: impl Into<String>,
        connection_id: Option<String>,
        now_ms: i64,
    ) -> Self {
        let symbol = symbol.into();
        let id = subscription_id(&symbol, data_type, params.as_deref());
        Self {
            id,
            exchange: exchange.into(),
            symbol,
            data_type,
            params,
            stream_name: stream_name.into(),
            connection_id: Mutex::new(connection_id),
            status: Mutex::new(SubscriptionStatus::Pending),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_active_ts: AtomicI64::new(now_ms),
            last_error: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    pub fn set_status(&self, status: SubscriptionStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    pub fn connection_id(&self) -> Option<String> {
        self.connection_id.lock().expect("connection_id lock poisoned").clone()
    }

    pub fn set_connection_id(&self, id: Option<String>) {
        *self.connection_id.lock().expect("connection_id lock poisoned") = id;
    }

    pub fn record_message(&self, now_ms: i64) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.last_active_ts.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_error(&self, detail: impl Into<String>) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().expect("last_error lock poisoned") = Some(detail.into());
    }

    pub fn row(&self) -> SubscriptionRow {
        SubscriptionRow {
            id: self.id.clone(),
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            data_type: self.data_type,
            params: self.params.clone(),
            stream_name: self.stream_name.clone(),
            connection_id: self.connection_id(),
            status: self.status(),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_active_ts: self.last_active_ts.load(Ordering::Relaxed),
            last_error: self.last_error.lock().expect("last_error lock poisoned").clone(),
        }
    }
}

/// An immutable snapshot of a `SubscriptionEntry`, safe to hand to Control
/// Surface callers without leaking the interior-mutability machinery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionRow {
    pub id: String,
    pub exchange: String,
    pub symbol: String,
    pub data_type: DataType,
    pub params: Option<String>,
    pub stream_name: String,
    pub connection_id: Option<String>,
    pub status: SubscriptionStatus,
    pub message_count: u64,
    pub error_count: u64,
    pub last_active_ts: i64,
    pub last_error: Option<String>,
}

/// Selector for `SubscriptionManager::get` (§4.3 `get(by: id|connection|symbol|status)`).
pub enum Selector<'a> {
    All,
    Id(&'a str),
    Connection(&'a str),
    Symbol(&'a str),
    Status(SubscriptionStatus),
}

#[derive(Debug, Clone)]
pub enum SmEvent {
    MigrationStarted { from: String, to: String, ids: Vec<String> },
    MigrationCompleted { from: String, to: String, ids: Vec<String> },
    MigrationFailed { from: String, to: String, reason: String },
}

/// Result of `subscribe` (§4.3).
#[derive(Debug, Default)]
pub struct SubscribeOutcome {
    pub succeeded: Vec<String>,
    pub existing: Vec<String>,
    pub failed: Vec<(SubscriptionRequest, String)>,
}

/// Result of `unsubscribe`.
#[derive(Debug, Default)]
pub struct UnsubscribeOutcome {
    pub removed: Vec<String>,
    pub not_found: Vec<String>,
}
