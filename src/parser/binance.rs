//! Binance Spot wire-format decoders (§4.1, §6, Scenarios A/B in §8).
//!
//! Grounded in the teacher's `exchanges::binance::BinanceAdapter::parse_message`
//! (envelope unwrap, `data["e"]` dispatch, field extraction by short key),
//! rewritten to produce `CanonicalRecord`s instead of the teacher's
//! `MarketMessage` enum, with the numeric-as-`Decimal` and timestamp-sanity
//! rules the spec adds.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

use crate::errors::{ParseError, ParseErrorKind};
use crate::record::{BookUpdate, CanonicalRecord, DataType, Kline, Payload, Side, Ticker, Trade};
use crate::symbol;

const EXCHANGE: &str = "binance";

/// Unwraps a combined-stream envelope `{"stream": ..., "data": {...}}` down
/// to the inner single-stream message; passes bare messages through
/// untouched (§4.1: "Parser unwraps and dispatches by the event tag inside
/// `data`").
pub fn unwrap_envelope(v: &Value) -> &Value {
    v.get("data").unwrap_or(v)
}

fn field<'a>(v: &'a Value, key: &str) -> Result<&'a Value, ParseError> {
    v.get(key).ok_or_else(|| {
        ParseError::new(ParseErrorKind::MissingField, format!("missing field '{key}'"))
    })
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str, ParseError> {
    field(v, key)?.as_str().ok_or_else(|| {
        ParseError::new(ParseErrorKind::MissingField, format!("field '{key}' is not a string"))
    })
}

fn i64_field(v: &Value, key: &str) -> Result<i64, ParseError> {
    field(v, key)?.as_i64().ok_or_else(|| {
        ParseError::new(ParseErrorKind::MissingField, format!("field '{key}' is not an integer"))
    })
}

fn bool_field(v: &Value, key: &str) -> Result<bool, ParseError> {
    field(v, key)?.as_bool().ok_or_else(|| {
        ParseError::new(ParseErrorKind::MissingField, format!("field '{key}' is not a bool"))
    })
}

fn decimal(raw: &str) -> Result<Decimal, ParseError> {
    Decimal::from_str(raw)
        .map_err(|e| ParseError::new(ParseErrorKind::InvalidNumber, format!("'{raw}': {e}")))
}

fn decimal_field(v: &Value, key: &str) -> Result<Decimal, ParseError> {
    decimal(str_field(v, key)?)
}

fn normalize_symbol(raw: &str) -> Result<String, ParseError> {
    symbol::normalize(raw).ok_or_else(|| {
        ParseError::new(ParseErrorKind::UnknownQuoteAsset, format!("unrecognized quote asset in '{raw}'"))
    })
}

/// Returns the inner event tag, or `None` for control/ack frames the spec
/// says the CM forwards verbatim and the Parser treats as non-market
/// (`{"result": null, "id": ...}` subscribe acks, Binance's `ping`/`pong`
/// application-level frames do not carry `"e"`).
pub fn event_tag(data: &Value) -> Option<&str> {
    data.get("e").and_then(|e| e.as_str())
}

/// Decodes one already-unwrapped inner `data` object into a `CanonicalRecord`.
/// `received_at_ms` is the ingress timestamp (§3: assigned on ingress, not
/// parsed from the wire).
pub fn decode(data: &Value, received_at_ms: i64) -> Result<CanonicalRecord, ParseError> {
    let event = event_tag(data).ok_or_else(|| {
        ParseError::new(ParseErrorKind::UnknownEventTag, "message has no 'e' event tag")
    })?;

    match event {
        "trade" => decode_trade(data, received_at_ms),
        "24hrTicker" => decode_ticker(data, received_at_ms),
        "kline" => decode_kline(data, received_at_ms),
        "depthUpdate" => decode_depth(data, received_at_ms),
        other => Err(ParseError::new(
            ParseErrorKind::UnknownEventTag,
            format!("unrecognized event tag '{other}'"),
        )),
    }
}

fn decode_trade(data: &Value, received_at_ms: i64) -> Result<CanonicalRecord, ParseError> {
    let symbol = normalize_symbol(str_field(data, "s")?)?;
    let event_timestamp = i64_field(data, "E")?;
    let trade_time = i64_field(data, "T").unwrap_or(event_timestamp);
    let price = decimal_field(data, "p")?;
    let quantity = decimal_field(data, "q")?;
    let is_buyer_maker = bool_field(data, "m")?;

    if price <= Decimal::ZERO {
        return Err(ParseError::new(ParseErrorKind::NonPositivePrice, "trade price must be > 0"));
    }
    if quantity <= Decimal::ZERO {
        return Err(ParseError::new(ParseErrorKind::NegativeQuantity, "trade quantity must be > 0"));
    }

    Ok(CanonicalRecord {
        exchange: EXCHANGE.to_string(),
        symbol,
        data_type: DataType::Trade,
        event_timestamp,
        received_timestamp: received_at_ms,
        payload: Payload::Trade(Trade {
            id: i64_field(data, "t")?.to_string(),
            price,
            quantity,
            // Binance's `m` is "is the buyer the market maker" — true means
            // the aggressor was a sell order (teacher: `if m { "sell" } else { "buy" }`).
            side: if is_buyer_maker { Side::Sell } else { Side::Buy },
            trade_time,
        }),
    })
}

fn decode_ticker(data: &Value, received_at_ms: i64) -> Result<CanonicalRecord, ParseError> {
    let symbol = normalize_symbol(str_field(data, "s")?)?;
    let event_timestamp = i64_field(data, "E")?;

    let last = decimal_field(data, "c")?;
    if last <= Decimal::ZERO {
        return Err(ParseError::new(ParseErrorKind::NonPositivePrice, "ticker last price must be > 0"));
    }

    Ok(CanonicalRecord {
        exchange: EXCHANGE.to_string(),
        symbol,
        data_type: DataType::Ticker,
        event_timestamp,
        received_timestamp: received_at_ms,
        payload: Payload::Ticker(Ticker {
            last,
            bid: decimal_field(data, "b")?,
            ask: decimal_field(data, "a")?,
            change_24h: decimal_field(data, "P")?,
            volume_24h: decimal_field(data, "v")?,
            high_24h: decimal_field(data, "h")?,
            low_24h: decimal_field(data, "l")?,
        }),
    })
}

fn decode_kline(data: &Value, received_at_ms: i64) -> Result<CanonicalRecord, ParseError> {
    let symbol = normalize_symbol(str_field(data, "s")?)?;
    let event_timestamp = i64_field(data, "E")?;
    let k = field(data, "k")?;

    let interval = str_field(k, "i")?.to_string();
    let data_type = DataType::from_kline_interval(&interval).ok_or_else(|| {
        ParseError::new(
            ParseErrorKind::UnknownEventTag,
            format!("kline interval '{interval}' has no canonical DataType"),
        )
    })?;

    let open = decimal_field(k, "o")?;
    if open <= Decimal::ZERO {
        return Err(ParseError::new(ParseErrorKind::NonPositivePrice, "kline open must be > 0"));
    }

    Ok(CanonicalRecord {
        exchange: EXCHANGE.to_string(),
        symbol,
        data_type,
        event_timestamp,
        received_timestamp: received_at_ms,
        payload: Payload::Kline(Kline {
            open,
            high: decimal_field(k, "h")?,
            low: decimal_field(k, "l")?,
            close: decimal_field(k, "c")?,
            volume: decimal_field(k, "v")?,
            open_time: i64_field(k, "t")?,
            close_time: i64_field(k, "T")?,
            interval,
            closed: bool_field(k, "x")?,
        }),
    })
}

fn decode_levels(arr: Option<&Vec<Value>>) -> Result<Vec<(Decimal, Decimal)>, ParseError> {
    let mut out = Vec::new();
    for level in arr.into_iter().flatten() {
        let price = level
            .get(0)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ParseError::new(ParseErrorKind::MissingField, "depth level missing price"))?;
        let qty = level
            .get(1)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ParseError::new(ParseErrorKind::MissingField, "depth level missing quantity"))?;
        let price = decimal(price)?;
        let qty = decimal(qty)?;
        if qty < Decimal::ZERO {
            return Err(ParseError::new(ParseErrorKind::NegativeQuantity, "depth quantity must be >= 0"));
        }
        out.push((price, qty));
    }
    Ok(out)
}

fn decode_depth(data: &Value, received_at_ms: i64) -> Result<CanonicalRecord, ParseError> {
    let symbol = normalize_symbol(str_field(data, "s")?)?;
    let event_timestamp = i64_field(data, "E")?;

    let bids = decode_levels(data.get("b").and_then(|v| v.as_array()))?;
    let asks = decode_levels(data.get("a").and_then(|v| v.as_array()))?;

    Ok(CanonicalRecord {
        exchange: EXCHANGE.to_string(),
        symbol,
        data_type: DataType::Depth,
        event_timestamp,
        received_timestamp: received_at_ms,
        payload: Payload::Book(BookUpdate { bids, asks, update_time: event_timestamp }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_trade_scenario_a() {
        let raw = json!({
            "e": "trade", "E": 1699123456789i64, "s": "BTCUSDT", "t": 12345,
            "p": "50000.00", "q": "0.1", "T": 1699123456789i64, "m": false
        });
        let record = decode(&raw, 1699123456900).unwrap();
        assert_eq!(record.exchange, "binance");
        assert_eq!(record.symbol, "BTC/USDT");
        assert_eq!(record.data_type, DataType::Trade);
        assert_eq!(record.event_timestamp, 1699123456789);
        match record.payload {
            Payload::Trade(t) => {
                assert_eq!(t.id, "12345");
                assert_eq!(t.price, Decimal::from_str("50000.00").unwrap());
                assert_eq!(t.quantity, Decimal::from_str("0.1").unwrap());
                assert_eq!(t.side, Side::Buy);
                assert_eq!(t.trade_time, 1699123456789);
            }
            _ => panic!("expected trade payload"),
        }
    }

    #[test]
    fn decodes_closed_1m_kline_scenario_b() {
        let raw = json!({
            "e": "kline", "E": 1699123499999i64, "s": "BTCUSDT",
            "k": {
                "t": 1699123440000i64, "T": 1699123499999i64, "s": "BTCUSDT", "i": "1m",
                "o": "49900", "c": "50000", "h": "50100", "l": "49850", "v": "10.5", "x": true
            }
        });
        let record = decode(&raw, 1699123500000).unwrap();
        assert_eq!(record.data_type, DataType::Kline1m);
        match record.payload {
            Payload::Kline(k) => {
                assert!(k.closed);
                assert_eq!(k.open_time, 1699123440000);
                assert_eq!(k.close_time, 1699123499999);
            }
            _ => panic!("expected kline payload"),
        }
    }

    #[test]
    fn rejects_unknown_quote_asset() {
        let raw = json!({
            "e": "trade", "E": 1, "s": "ABCXYZFOO", "t": 1, "p": "1", "q": "1", "T": 1, "m": false
        });
        let err = decode(&raw, 1).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnknownQuoteAsset);
    }

    #[test]
    fn rejects_non_positive_trade_price() {
        let raw = json!({
            "e": "trade", "E": 1, "s": "BTCUSDT", "t": 1, "p": "0", "q": "1", "T": 1, "m": false
        });
        let err = decode(&raw, 1).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::NonPositivePrice);
    }

    #[test]
    fn depth_levels_drop_nothing_and_preserve_exact_decimals() {
        let raw = json!({
            "e": "depthUpdate", "E": 100, "s": "BTCUSDT",
            "b": [["50000.00000001", "0.1"]],
            "a": [["50001.00000001", "0.2"]]
        });
        let record = decode(&raw, 100).unwrap();
        match record.payload {
            Payload::Book(b) => {
                assert_eq!(b.bids[0].0, Decimal::from_str("50000.00000001").unwrap());
                assert_eq!(b.asks[0].1, Decimal::from_str("0.2").unwrap());
            }
            _ => panic!("expected book payload"),
        }
    }

    #[test]
    fn envelope_unwraps_combined_stream() {
        let raw = json!({
            "stream": "btcusdt@trade",
            "data": { "e": "trade", "E": 1, "s": "BTCUSDT", "t": 1, "p": "1", "q": "1", "T": 1, "m": false }
        });
        let inner = unwrap_envelope(&raw);
        assert_eq!(event_tag(inner), Some("trade"));
    }

    #[test]
    fn control_ack_has_no_event_tag() {
        let raw = json!({ "result": null, "id": 1 });
        assert_eq!(event_tag(unwrap_envelope(&raw)), None);
    }
}
