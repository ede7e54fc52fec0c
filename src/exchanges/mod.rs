//! Exchange-specific wire-naming conventions (§4.3/§4.4): stream-name
//! construction and base URLs, kept separate from both decoding
//! (`parser::binance`) and transport (`connection::transport`) so adding a
//! new exchange family means adding one module here, not touching the CM.
//!
//! Only Binance is registered (§ Scope decision in SPEC_FULL.md): the
//! teacher itself only fully wires one adapter (`gateio`) while the others
//! sit commented out in its registry; this follows the same shape.

pub mod binance;

use crate::record::DataType;

/// Returns the WebSocket base URL for a registered exchange name, or `None`
/// if the exchange isn't wired up.
pub fn ws_base_url(exchange: &str) -> Option<&'static str> {
    match exchange {
        "binance" => Some(binance::WS_BASE_URL),
        _ => None,
    }
}

/// Builds the stream-name token for `(exchange, symbol, type)`, or `None`
/// for an unregistered exchange.
pub fn stream_name(exchange: &str, symbol: &str, data_type: DataType) -> Option<String> {
    match exchange {
        "binance" => Some(binance::stream_name(symbol, data_type)),
        _ => None,
    }
}
