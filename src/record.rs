//! The canonical, wire-agnostic market-data record (§3).
//!
//! This is the single type every Parser decoder produces and every Router
//! sink consumes. It replaces the teacher's `schema::MarketMessage` enum
//! with the richer tagged sum the spec requires (ticker, per-interval
//! klines, depth vs. orderbook as distinct types sharing a payload shape).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// The data type of a canonical record, also used as the second half of a
/// subscription key `(symbol, type)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Trade,
    Ticker,
    Kline1m,
    Kline5m,
    Kline15m,
    Kline30m,
    Kline1h,
    Kline4h,
    Kline1d,
    Depth,
    Orderbook,
}

impl DataType {
    /// Wire kline interval token, e.g. `"1m"`, `"4h"`. `None` for non-kline types.
    pub fn kline_interval(&self) -> Option<&'static str> {
        match self {
            DataType::Kline1m => Some("1m"),
            DataType::Kline5m => Some("5m"),
            DataType::Kline15m => Some("15m"),
            DataType::Kline30m => Some("30m"),
            DataType::Kline1h => Some("1h"),
            DataType::Kline4h => Some("4h"),
            DataType::Kline1d => Some("1d"),
            _ => None,
        }
    }

    /// Maps a wire kline interval token back to a `DataType`. Intervals the
    /// canonical schema doesn't carry a dedicated variant for (3m, 2h, 6h,
    /// 8h, 12h, 3d, 1w, 1M) are valid stream names per §6 but are out of the
    /// canonical record's scope; callers treat them as unknown event tags.
    pub fn from_kline_interval(interval: &str) -> Option<Self> {
        match interval {
            "1m" => Some(DataType::Kline1m),
            "5m" => Some(DataType::Kline5m),
            "15m" => Some(DataType::Kline15m),
            "30m" => Some(DataType::Kline30m),
            "1h" => Some(DataType::Kline1h),
            "4h" => Some(DataType::Kline4h),
            "1d" => Some(DataType::Kline1d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Trade => "trade",
            DataType::Ticker => "ticker",
            DataType::Kline1m => "kline_1m",
            DataType::Kline5m => "kline_5m",
            DataType::Kline15m => "kline_15m",
            DataType::Kline30m => "kline_30m",
            DataType::Kline1h => "kline_1h",
            DataType::Kline4h => "kline_4h",
            DataType::Kline1d => "kline_1d",
            DataType::Depth => "depth",
            DataType::Orderbook => "orderbook",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub trade_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub change_24h: Decimal,
    pub volume_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub open_time: i64,
    pub close_time: i64,
    pub interval: String,
    pub closed: bool,
}

/// One price level: `(price, quantity)`, exact decimal strings preserved.
pub type Level = (Decimal, Decimal);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookUpdate {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub update_time: i64,
}

/// The tagged payload union (§3). `depth` and `orderbook` share this shape
/// but remain distinct `DataType` values so downstream consumers can filter
/// by which stream produced the update, per the spec's explicit note that
/// the distinction "is not crisp" but must stay queryable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Trade(Trade),
    Ticker(Ticker),
    Kline(Kline),
    Book(BookUpdate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub exchange: String,
    /// Canonical `BASE/QUOTE`, uppercase.
    pub symbol: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub event_timestamp: i64,
    pub received_timestamp: i64,
    pub payload: Payload,
}

impl CanonicalRecord {
    /// The cache/routing key `exchange:symbol:type` (§3, §4.5).
    pub fn cache_key(&self) -> String {
        cache_key(&self.exchange, &self.symbol, self.data_type)
    }
}

pub fn cache_key(exchange: &str, symbol: &str, data_type: DataType) -> String {
    format!("{exchange}:{symbol}:{data_type}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_interval_round_trips_for_supported_intervals() {
        for dt in [
            DataType::Kline1m,
            DataType::Kline5m,
            DataType::Kline15m,
            DataType::Kline30m,
            DataType::Kline1h,
            DataType::Kline4h,
            DataType::Kline1d,
        ] {
            let interval = dt.kline_interval().unwrap();
            assert_eq!(DataType::from_kline_interval(interval), Some(dt));
        }
    }

    #[test]
    fn unsupported_kline_interval_is_unknown() {
        assert_eq!(DataType::from_kline_interval("3m"), None);
        assert_eq!(DataType::from_kline_interval("1w"), None);
    }

    #[test]
    fn cache_key_matches_exchange_symbol_type_template() {
        assert_eq!(cache_key("binance", "BTC/USDT", DataType::Trade), "binance:BTC/USDT:trade");
    }
}
