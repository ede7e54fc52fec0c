//! Binance Spot wire-name conventions (§4.3, §4.4): turns a canonical
//! `(symbol, DataType)` subscription request into the stream-name token
//! Binance's combined-stream endpoint expects, and back.
//!
//! Grounded in the teacher's `exchanges/gateio.rs` (the one fully-wired
//! adapter: `ws_url` + a per-channel name builder), generalized from two
//! channel types to the full canonical `DataType` set. Decoding the frames
//! these names select lives in `parser::binance`, not here.

use crate::record::DataType;
use crate::symbol::to_wire;

pub const WS_BASE_URL: &str = "wss://stream.binance.com:9443";

/// Builds the stream-name token for a symbol/type pair, e.g.
/// `("BTC/USDT", Trade) -> "btcusdt@trade"`.
pub fn stream_name(symbol: &str, data_type: DataType) -> String {
    let wire_symbol = to_wire(symbol).to_lowercase();
    match data_type {
        DataType::Trade => format!("{wire_symbol}@trade"),
        DataType::Ticker => format!("{wire_symbol}@ticker"),
        DataType::Depth => format!("{wire_symbol}@depth"),
        DataType::Orderbook => format!("{wire_symbol}@depth20"),
        kline => {
            let interval = kline.kline_interval().expect("non-kline DataType handled above");
            format!("{wire_symbol}@kline_{interval}")
        }
    }
}
