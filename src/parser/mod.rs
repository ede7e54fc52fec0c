//! Parser (§4.1): decode one wire message into a `CanonicalRecord`, track
//! stats, and enforce the timestamp/range invariants. Exchange-specific
//! wire decoding lives in submodules (`binance`); this module owns the
//! envelope detection, timestamp sanity window, and stats bookkeeping that
//! are the same for every exchange.

pub mod binance;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;

use crate::clock::Clock;
use crate::errors::{ParseError, ParseErrorKind};
use crate::record::CanonicalRecord;

/// `event_timestamp` must land in `[now - 24h, now + 2m]` (§4.1).
const MAX_PAST_MS: i64 = 24 * 60 * 60 * 1000;
const MAX_FUTURE_MS: i64 = 2 * 60 * 1000;

/// How many of the most recent parse errors to retain for inspection.
const ERROR_HISTORY_CAP: usize = 64;

#[derive(Debug, Clone)]
pub struct RecentError {
    pub kind: ParseErrorKind,
    pub detail: String,
    pub at_ms: i64,
}

#[derive(Default)]
struct StatsInner {
    total: AtomicUsize,
    success: AtomicUsize,
    error: AtomicUsize,
    validation_failures: AtomicUsize,
    /// Accumulated parse time in nanoseconds and sample count, used to
    /// derive a rolling average without keeping every sample.
    total_nanos: AtomicU64,
    samples: AtomicUsize,
    recent_errors: Mutex<VecDeque<RecentError>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ParserStatsSnapshot {
    pub total: usize,
    pub success: usize,
    pub error: usize,
    pub validation_failures: usize,
    pub avg_parse_nanos: u64,
}

pub struct Parser {
    clock: Arc<dyn Clock>,
    stats: StatsInner,
}

impl Parser {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, stats: StatsInner::default() }
    }

    /// Decodes one already-unwrapped wire message of the given exchange.
    /// Currently only `"binance"` is implemented; other exchange names
    /// return `UnknownEventTag` rather than panicking, keeping the facade
    /// generic over future adapters.
    pub fn parse(&self, exchange: &str, wire_message: &Value) -> Result<CanonicalRecord, ParseError> {
        let started = Instant::now();
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        let result = self.parse_inner(exchange, wire_message);

        let elapsed = started.elapsed().as_nanos() as u64;
        self.stats.total_nanos.fetch_add(elapsed, Ordering::Relaxed);
        self.stats.samples.fetch_add(1, Ordering::Relaxed);

        match &result {
            Ok(_) => {
                self.stats.success.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.error.fetch_add(1, Ordering::Relaxed);
                self.record_error(e);
            }
        }
        result
    }

    fn parse_inner(&self, exchange: &str, wire_message: &Value) -> Result<CanonicalRecord, ParseError> {
        let data = binance::unwrap_envelope(wire_message);
        let decoded = match exchange {
            "binance" => binance::decode(data, self.clock.now_ms())?,
            other => {
                return Err(ParseError::new(
                    ParseErrorKind::UnknownEventTag,
                    format!("no decoder registered for exchange '{other}'"),
                ));
            }
        };
        self.validate_record(&decoded)?;
        Ok(decoded)
    }

    /// Timestamp sanity + range checks shared by every decoded record
    /// (§4.1: "event_timestamp must be within [now-24h, now+2m]").
    fn validate_record(&self, record: &CanonicalRecord) -> Result<(), ParseError> {
        let now = self.clock.now_ms();
        if record.event_timestamp < now - MAX_PAST_MS || record.event_timestamp > now + MAX_FUTURE_MS {
            self.stats.validation_failures.fetch_add(1, Ordering::Relaxed);
            return Err(ParseError::new(
                ParseErrorKind::StaleOrFutureTimestamp,
                format!("event_timestamp {} outside [{}, {}]", record.event_timestamp, now - MAX_PAST_MS, now + MAX_FUTURE_MS),
            ));
        }
        Ok(())
    }

    /// `validate(wire_message, type)` per §4.1: a cheap boolean check used
    /// before committing to a full parse, e.g. by callers that want to
    /// filter malformed frames without paying for error bookkeeping.
    pub fn validate(&self, exchange: &str, wire_message: &Value) -> bool {
        self.parse_inner(exchange, wire_message).is_ok()
    }

    /// Parses a batch; fails fast with `BatchTooLarge` before parsing
    /// anything if the batch exceeds `max_batch` (§4.1).
    pub fn parse_batch(
        &self,
        exchange: &str,
        messages: &[Value],
        max_batch: usize,
    ) -> Result<Vec<Result<CanonicalRecord, ParseError>>, ParseError> {
        if messages.len() > max_batch {
            return Err(ParseError::new(
                ParseErrorKind::BatchTooLarge,
                format!("batch of {} exceeds max {max_batch}", messages.len()),
            ));
        }
        Ok(messages.iter().map(|m| self.parse(exchange, m)).collect())
    }

    fn record_error(&self, error: &ParseError) {
        let mut recent = self.stats.recent_errors.lock().expect("recent_errors lock poisoned");
        if recent.len() == ERROR_HISTORY_CAP {
            recent.pop_front();
        }
        recent.push_back(RecentError {
            kind: error.kind,
            detail: error.detail.clone(),
            at_ms: self.clock.now_ms(),
        });
    }

    pub fn stats(&self) -> ParserStatsSnapshot {
        let samples = self.stats.samples.load(Ordering::Relaxed).max(1) as u64;
        ParserStatsSnapshot {
            total: self.stats.total.load(Ordering::Relaxed),
            success: self.stats.success.load(Ordering::Relaxed),
            error: self.stats.error.load(Ordering::Relaxed),
            validation_failures: self.stats.validation_failures.load(Ordering::Relaxed),
            avg_parse_nanos: self.stats.total_nanos.load(Ordering::Relaxed) / samples,
        }
    }

    pub fn recent_errors(&self) -> Vec<RecentError> {
        self.stats.recent_errors.lock().expect("recent_errors lock poisoned").iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use serde_json::json;

    fn parser_at(now_ms: i64) -> Parser {
        Parser::new(TestClock::new(now_ms))
    }

    #[test]
    fn parse_increments_total_and_success_on_valid_trade() {
        let parser = parser_at(1699123456789);
        let raw = json!({
            "e": "trade", "E": 1699123456789i64, "s": "BTCUSDT", "t": 1,
            "p": "50000", "q": "0.1", "T": 1699123456789i64, "m": false
        });
        parser.parse("binance", &raw).unwrap();
        let stats = parser.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.error, 0);
    }

    #[test]
    fn stale_timestamp_fails_validation_and_is_counted() {
        let now = 1_700_000_000_000i64;
        let parser = parser_at(now);
        let raw = json!({
            "e": "trade", "E": now - MAX_PAST_MS - 1000, "s": "BTCUSDT", "t": 1,
            "p": "1", "q": "1", "T": now, "m": false
        });
        let err = parser.parse("binance", &raw).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::StaleOrFutureTimestamp);
        assert_eq!(parser.stats().validation_failures, 1);
    }

    #[test]
    fn future_timestamp_beyond_two_minutes_fails() {
        let now = 1_700_000_000_000i64;
        let parser = parser_at(now);
        let raw = json!({
            "e": "trade", "E": now + MAX_FUTURE_MS + 1, "s": "BTCUSDT", "t": 1,
            "p": "1", "q": "1", "T": now, "m": false
        });
        assert!(parser.parse("binance", &raw).is_err());
    }

    #[test]
    fn parse_batch_rejects_oversized_batch_before_parsing() {
        let parser = parser_at(1);
        let messages = vec![json!({}); 5];
        let err = parser.parse_batch("binance", &messages, 3).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::BatchTooLarge);
        // Nothing should have been counted since the batch was rejected up front.
        assert_eq!(parser.stats().total, 0);
    }

    #[test]
    fn recent_errors_caps_at_history_size() {
        let now = 1_700_000_000_000i64;
        let parser = parser_at(now);
        for _ in 0..(ERROR_HISTORY_CAP + 10) {
            let raw = json!({"e": "unknown_tag"});
            let _ = parser.parse("binance", &raw);
        }
        assert_eq!(parser.recent_errors().len(), ERROR_HISTORY_CAP);
    }
}
